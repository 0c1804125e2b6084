use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    Table,
    Index,
    Sequence,
}

impl std::fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogKind::Table => write!(f, "table"),
            CatalogKind::Index => write!(f, "index"),
            CatalogKind::Sequence => write!(f, "sequence"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Parse,
    CatalogNotFound,
    CatalogAlreadyExists,
    TypeMismatch,
    NotNullViolation,
    CheckViolation,
    UniqueViolation,
    KeyNotFound,
    ReadOnly,
    StreamClosed,
    OutOfRange,
    Io,
    Encode,
    Decode,
    Validation,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Parse => "parse_error",
            ErrorCode::CatalogNotFound => "catalog_not_found",
            ErrorCode::CatalogAlreadyExists => "catalog_already_exists",
            ErrorCode::TypeMismatch => "type_mismatch",
            ErrorCode::NotNullViolation => "not_null_violation",
            ErrorCode::CheckViolation => "check_violation",
            ErrorCode::UniqueViolation => "unique_violation",
            ErrorCode::KeyNotFound => "key_not_found",
            ErrorCode::ReadOnly => "read_only",
            ErrorCode::StreamClosed => "stream_closed",
            ErrorCode::OutOfRange => "out_of_range",
            ErrorCode::Io => "io_error",
            ErrorCode::Encode => "encode_error",
            ErrorCode::Decode => "decode_error",
            ErrorCode::Validation => "validation_error",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("parse error at {line}:{column}: {message}")]
    Parse {
        message: String,
        line: u32,
        column: u32,
    },
    #[error("{kind} '{name}' not found")]
    CatalogNotFound { kind: CatalogKind, name: String },
    #[error("{kind} '{name}' already exists")]
    CatalogAlreadyExists { kind: CatalogKind, name: String },
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },
    #[error("NOT NULL violation: column '{column}' in table '{table}'")]
    NotNullViolation { table: String, column: String },
    #[error("check constraint '{constraint}' failed on table '{table}'")]
    CheckViolation { table: String, constraint: String },
    #[error("unique constraint violation on '{constraint}'")]
    UniqueViolation { constraint: String, key: Vec<u8> },
    #[error("key not found")]
    KeyNotFound,
    #[error("session is read-only")]
    ReadOnly,
    /// Internal short-circuit sentinel. Swallowed by the operator that raised
    /// it or at the top of the stream; must never reach the caller.
    #[error("stream closed")]
    StreamClosed,
    #[error("out of range: {0}")]
    OutOfRange(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Parse { .. } => ErrorCode::Parse,
            Error::CatalogNotFound { .. } => ErrorCode::CatalogNotFound,
            Error::CatalogAlreadyExists { .. } => ErrorCode::CatalogAlreadyExists,
            Error::TypeMismatch { .. } => ErrorCode::TypeMismatch,
            Error::NotNullViolation { .. } => ErrorCode::NotNullViolation,
            Error::CheckViolation { .. } => ErrorCode::CheckViolation,
            Error::UniqueViolation { .. } => ErrorCode::UniqueViolation,
            Error::KeyNotFound => ErrorCode::KeyNotFound,
            Error::ReadOnly => ErrorCode::ReadOnly,
            Error::StreamClosed => ErrorCode::StreamClosed,
            Error::OutOfRange(_) => ErrorCode::OutOfRange,
            Error::Io(_) => ErrorCode::Io,
            Error::Encode(_) => ErrorCode::Encode,
            Error::Decode(_) => ErrorCode::Decode,
            Error::Validation(_) => ErrorCode::Validation,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Constraint violations are the only error class `OnConflict` recovers from.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Error::TypeMismatch { .. }
                | Error::NotNullViolation { .. }
                | Error::CheckViolation { .. }
                | Error::UniqueViolation { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
