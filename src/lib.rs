//! Embedded SQL query execution core over a transactional ordered
//! key-value store.
//!
//! The external parser hands this crate statement ASTs and expression trees;
//! the crate compiles them into streaming operator pipelines, rewrites the
//! pipelines with a rule-based planner, and executes them against snapshot or
//! batch sessions of the storage engine. See `statement` for the statement
//! surface and `stream` for the operator catalog.

pub mod catalog;
pub mod config;
pub mod encoding;
pub mod environment;
pub mod error;
pub mod expr;
pub mod kv;
pub mod planner;
pub mod row;
pub mod statement;
pub mod stream;
pub mod transaction;
pub mod types;

pub use config::Config;
pub use environment::Param;
pub use error::{Error, ErrorCode, Result};
pub use types::{FieldBuffer, Value, ValueType};

use crate::catalog::schema::{IndexInfo, SequenceInfo};
use crate::catalog::{Catalog, CatalogEntry};
use crate::environment::Environment;
use crate::kv::{Engine, MemoryEngine, Session};
use crate::statement::Statement;
use crate::stream::{Operator, Stream};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

pub struct Database {
    engine: Arc<dyn Engine>,
    config: Config,
    catalog: Arc<Mutex<Catalog>>,
    /// Explicit transaction opened by BEGIN, if any. One connection's worth
    /// of state: statements run inside it until COMMIT or ROLLBACK.
    explicit: Mutex<Option<Arc<Transaction>>>,
}

impl Database {
    /// Opens an in-memory database.
    pub fn new() -> Result<Self> {
        Self::with_engine(Arc::new(MemoryEngine::new()), Config::default())
    }

    /// Opens a database over an existing storage engine, loading the catalog
    /// namespace.
    pub fn with_engine(engine: Arc<dyn Engine>, config: Config) -> Result<Self> {
        let snapshot = engine.snapshot_session();
        let catalog = Catalog::load(snapshot.as_ref())?;
        snapshot.close()?;
        Ok(Self {
            engine,
            config,
            catalog: Arc::new(Mutex::new(catalog)),
            explicit: Mutex::new(None),
        })
    }

    pub fn tables(&self) -> Vec<String> {
        self.catalog.lock().table_names()
    }

    pub fn indexes(&self) -> Vec<String> {
        self.catalog.lock().index_names()
    }

    /// Companion entries for dumping one table's schema: its indexes plus
    /// ownerless sequences.
    pub fn schema_entries(&self, table: &str) -> Vec<CatalogEntry> {
        self.catalog.lock().schema_entries(table)
    }

    fn begin_tx(&self, writable: bool) -> Arc<Transaction> {
        let session: Arc<dyn Session> = if writable {
            Arc::from(self.engine.batch_session())
        } else {
            Arc::from(self.engine.snapshot_session())
        };
        let catalog = self.catalog.lock().clone();
        Arc::new(Transaction::new(
            session,
            Arc::clone(&self.engine),
            self.config.clone(),
            catalog,
            writable,
        ))
    }

    /// Runs a statement to completion, discarding any rows it yields.
    pub fn execute(&self, stmt: Statement, params: Vec<Param>) -> Result<()> {
        self.query(stmt, params)?.iterate(|_| Ok(()))
    }

    /// Prepares a statement and returns a lazy result. Driving the result
    /// runs the stream; on completion the statement's session commits (batch)
    /// or is released (snapshot). Statements inside an explicit transaction
    /// leave the session open.
    pub fn query(&self, stmt: Statement, params: Vec<Param>) -> Result<QueryResult> {
        match stmt {
            Statement::Begin { writable } => {
                let mut explicit = self.explicit.lock();
                if explicit.is_some() {
                    return Err(Error::Validation("transaction already in progress".into()));
                }
                *explicit = Some(self.begin_tx(writable));
                Ok(QueryResult::empty())
            }
            Statement::Commit => {
                let tx = self
                    .explicit
                    .lock()
                    .take()
                    .ok_or_else(|| Error::Validation("no transaction in progress".into()))?;
                self.commit_tx(&tx)?;
                Ok(QueryResult::empty())
            }
            Statement::Rollback => {
                let tx = self
                    .explicit
                    .lock()
                    .take()
                    .ok_or_else(|| Error::Validation("no transaction in progress".into()))?;
                tx.session().rollback()?;
                Ok(QueryResult::empty())
            }
            Statement::Explain(inner) => self.explain(*inner),
            Statement::CreateTable { .. }
            | Statement::CreateIndex { .. }
            | Statement::CreateSequence { .. }
            | Statement::DropTable { .. }
            | Statement::DropIndex { .. }
            | Statement::DropSequence { .. }
            | Statement::AlterTableRename { .. } => self.run_ddl(stmt),
            Statement::Insert(_) | Statement::Update(_) | Statement::Delete(_) => {
                let (tx, finish) = self.statement_tx(true)?;
                let stream = self.compile(&stmt, &tx.catalog())?;
                Ok(QueryResult::pipeline(
                    tx,
                    stream,
                    params,
                    finish,
                    Some(Arc::clone(&self.catalog)),
                ))
            }
            Statement::Select(_) => {
                let (tx, finish) = self.statement_tx(false)?;
                let stream = self.compile(&stmt, &tx.catalog())?;
                Ok(QueryResult::pipeline(tx, stream, params, finish, None))
            }
        }
    }

    /// The session a statement runs under: the explicit transaction when one
    /// is open, otherwise a fresh autocommit session of the required mode.
    fn statement_tx(&self, needs_write: bool) -> Result<(Arc<Transaction>, Finish)> {
        if let Some(tx) = self.explicit.lock().clone() {
            if needs_write && !tx.is_writable() {
                return Err(Error::ReadOnly);
            }
            return Ok((tx, Finish::Keep));
        }
        let tx = self.begin_tx(needs_write);
        let finish = if needs_write {
            Finish::CommitOnDone
        } else {
            Finish::ReleaseOnDone
        };
        Ok((tx, finish))
    }

    fn compile(&self, stmt: &Statement, catalog: &Catalog) -> Result<Stream> {
        let stream = match stmt {
            Statement::Insert(insert) => statement::compile_insert(insert, catalog)?,
            Statement::Update(update) => statement::compile_update(update, catalog)?,
            Statement::Delete(delete) => statement::compile_delete(delete, catalog)?,
            Statement::Select(select) => statement::compile_select(select, catalog)?,
            other => {
                return Err(Error::Validation(format!(
                    "statement is not stream-compilable: {other:?}"
                )));
            }
        };
        planner::optimize(stream, catalog)
    }

    fn explain(&self, inner: Statement) -> Result<QueryResult> {
        let catalog = match self.explicit.lock().clone() {
            Some(tx) => tx.catalog(),
            None => self.catalog.lock().clone(),
        };
        let stream = self.compile(&inner, &catalog)?;
        let mut fb = FieldBuffer::new();
        fb.add("plan", Value::text(stream.to_string()));
        Ok(QueryResult::rows(vec![ResultRow { fields: fb }]))
    }

    fn run_ddl(&self, stmt: Statement) -> Result<QueryResult> {
        let (tx, finish) = self.statement_tx(true)?;
        let applied = self.apply_ddl(&tx, stmt);
        match (applied, finish) {
            (Ok(()), Finish::CommitOnDone) => {
                self.commit_tx(&tx)?;
                Ok(QueryResult::empty())
            }
            (Ok(()), _) => Ok(QueryResult::empty()),
            (Err(err), Finish::CommitOnDone) => {
                let _ = tx.session().rollback();
                Err(err)
            }
            (Err(err), _) => Err(err),
        }
    }

    fn apply_ddl(&self, tx: &Arc<Transaction>, stmt: Statement) -> Result<()> {
        let writer = tx.catalog_writer()?;
        match stmt {
            Statement::CreateTable {
                mut info,
                if_not_exists,
            } => {
                if tx.catalog().get_table(&info.name).is_ok() {
                    if if_not_exists {
                        return Ok(());
                    }
                    return Err(Error::CatalogAlreadyExists {
                        kind: error::CatalogKind::Table,
                        name: info.name,
                    });
                }
                // Without a declared primary key, rows are keyed by an
                // owner-linked rowid sequence.
                if info.primary_key().is_none() {
                    let sequence = SequenceInfo::rowid_for(&info.name);
                    info.rowid_sequence = Some(sequence.name.clone());
                    writer.create_sequence(sequence, false)?;
                }
                let unique_constraints: Vec<_> = info
                    .table_constraints
                    .iter()
                    .filter_map(|tc| match &tc.kind {
                        catalog::schema::TableConstraintKind::Unique { paths, sort_order } => {
                            Some((tc.name.clone(), paths.clone(), sort_order.clone()))
                        }
                        _ => None,
                    })
                    .collect();
                let table = info.name.clone();
                writer.create_table(info, false)?;
                // Every UNIQUE table constraint is backed by a unique index.
                for (name, paths, sort_order) in unique_constraints {
                    writer.create_index(
                        IndexInfo {
                            name: format!("{table}_{name}_idx"),
                            table: table.clone(),
                            paths,
                            unique: true,
                            sort_order,
                        },
                        false,
                    )?;
                }
                Ok(())
            }
            Statement::CreateIndex {
                info,
                if_not_exists,
            } => {
                let name = info.name.clone();
                let table = info.table.clone();
                if !writer.create_index(info, if_not_exists)? {
                    return Ok(());
                }
                // Backfill from existing rows.
                let backfill = Stream::new(Operator::SeqScan {
                    table,
                    reverse: false,
                })
                .pipe(Operator::IndexInsert { index: name })
                .pipe(Operator::Discard);
                let env = Environment::root(Arc::clone(tx), Vec::new());
                backfill.iterate(&env, &mut |_| Ok(()))
            }
            Statement::CreateSequence {
                info,
                if_not_exists,
            } => writer.create_sequence(info, if_not_exists).map(|_| ()),
            Statement::DropTable { name, if_exists } => {
                writer.drop_table(&name, if_exists).map(|_| ())
            }
            Statement::DropIndex { name, if_exists } => {
                writer.drop_index(&name, if_exists).map(|_| ())
            }
            Statement::DropSequence { name, if_exists } => {
                writer.drop_sequence(&name, if_exists).map(|_| ())
            }
            Statement::AlterTableRename { table, new_name } => {
                writer.rename_table(&table, &new_name)
            }
            other => Err(Error::Validation(format!("not a DDL statement: {other:?}"))),
        }
    }

    fn commit_tx(&self, tx: &Arc<Transaction>) -> Result<()> {
        match tx.session().commit() {
            Ok(()) => {
                *self.catalog.lock() = tx.final_catalog();
                debug!("transaction committed");
                Ok(())
            }
            Err(err) => {
                let _ = tx.session().rollback();
                Err(err)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    /// Explicit transaction: leave the session open.
    Keep,
    /// Autocommit writer: commit on success, roll back on error.
    CommitOnDone,
    /// Autocommit reader: release the snapshot when done.
    ReleaseOnDone,
}

/// One result row, materialized out of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    fields: FieldBuffer,
}

impl ResultRow {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter()
    }

    pub fn fields(&self) -> &FieldBuffer {
        &self.fields
    }

    /// Canonical JSON: sorted field order, canonical number formatting.
    pub fn marshal_json(&self) -> String {
        row::marshal_json(&self.fields)
    }
}

/// Lazy statement result. Rows flow only while `iterate` drives the stream;
/// closing (finishing) releases the statement's session resources.
pub struct QueryResult {
    inner: ResultInner,
}

impl std::fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult").finish_non_exhaustive()
    }
}

enum ResultInner {
    Rows(Vec<ResultRow>),
    Pipeline {
        tx: Arc<Transaction>,
        stream: Stream,
        params: Vec<Param>,
        finish: Finish,
        catalog_sink: Option<Arc<Mutex<Catalog>>>,
    },
}

impl QueryResult {
    fn empty() -> Self {
        Self::rows(Vec::new())
    }

    fn rows(rows: Vec<ResultRow>) -> Self {
        Self {
            inner: ResultInner::Rows(rows),
        }
    }

    fn pipeline(
        tx: Arc<Transaction>,
        stream: Stream,
        params: Vec<Param>,
        finish: Finish,
        catalog_sink: Option<Arc<Mutex<Catalog>>>,
    ) -> Self {
        Self {
            inner: ResultInner::Pipeline {
                tx,
                stream,
                params,
                finish,
                catalog_sink,
            },
        }
    }

    pub fn iterate(self, mut f: impl FnMut(&ResultRow) -> Result<()>) -> Result<()> {
        match self.inner {
            ResultInner::Rows(rows) => {
                for result_row in &rows {
                    f(result_row)?;
                }
                Ok(())
            }
            ResultInner::Pipeline {
                tx,
                stream,
                params,
                finish,
                catalog_sink,
            } => {
                let env = Environment::root(Arc::clone(&tx), params);
                let run = stream.iterate(&env, &mut |out| {
                    // Operators that end in sinks leave no row to report.
                    let Some(current) = out.row() else {
                        return Ok(());
                    };
                    let fields = current.object.materialize()?;
                    f(&ResultRow { fields })
                });
                match (run, finish) {
                    (Ok(()), Finish::CommitOnDone) => {
                        tx.session().commit()?;
                        if let Some(sink) = catalog_sink {
                            *sink.lock() = tx.final_catalog();
                        }
                        Ok(())
                    }
                    (Ok(()), Finish::ReleaseOnDone) => tx.session().close(),
                    (Ok(()), Finish::Keep) => Ok(()),
                    (Err(err), Finish::CommitOnDone) => {
                        let _ = tx.session().rollback();
                        Err(err)
                    }
                    (Err(err), Finish::ReleaseOnDone) => {
                        let _ = tx.session().close();
                        Err(err)
                    }
                    (Err(err), Finish::Keep) => Err(err),
                }
            }
        }
    }

    pub fn collect_rows(self) -> Result<Vec<ResultRow>> {
        let mut rows = Vec::new();
        self.iterate(|result_row| {
            rows.push(result_row.clone());
            Ok(())
        })?;
        Ok(rows)
    }
}
