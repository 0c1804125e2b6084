use chaidb::catalog::schema::{FieldConstraint, TableInfo};
use chaidb::environment::Environment;
use chaidb::error::Error;
use chaidb::expr::Expr;
use chaidb::row::{EncodedObject, RowObject, encode_object};
use chaidb::types::{FieldBuffer, Value, ValueType};
use std::sync::Arc;

fn constraint(position: usize, field: &str, ty: ValueType) -> FieldConstraint {
    FieldConstraint {
        position,
        field: field.into(),
        ty,
        is_primary_key: false,
        is_not_null: false,
        default_value: None,
        anonymous_type: None,
    }
}

fn test_table() -> TableInfo {
    let mut info = TableInfo::new("t");
    info.field_constraints
        .add(constraint(0, "a", ValueType::Integer))
        .unwrap();
    info.field_constraints
        .add(constraint(1, "b", ValueType::Text))
        .unwrap();
    info.field_constraints
        .add(FieldConstraint {
            is_not_null: true,
            ..constraint(2, "c", ValueType::Double)
        })
        .unwrap();
    info.field_constraints
        .add(FieldConstraint {
            default_value: Some(Expr::integer(10)),
            ..constraint(3, "d", ValueType::Double)
        })
        .unwrap();
    info.field_constraints
        .add(constraint(4, "e", ValueType::Double))
        .unwrap();
    info.field_constraints.allow_extra_fields = true;
    info
}

fn source_object() -> FieldBuffer {
    let mut doc = FieldBuffer::new();
    doc.add("a", Value::Integer(10));

    let mut fb = FieldBuffer::new();
    fb.add("a", Value::Integer(1));
    fb.add("b", Value::text("hello"));
    fb.add("c", Value::Double(3.14));
    fb.add("e", Value::Integer(100));
    fb.add("f", Value::Integer(1000));
    fb.add("g", Value::Double(2000.0));
    fb.add(
        "array",
        Value::Array(vec![
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(3),
        ]),
    );
    fb.add("doc", Value::Object(doc));
    fb
}

#[test]
fn decode_of_encode_is_the_normalized_object() {
    let info = test_table();
    let env = Environment::empty();
    let src = RowObject::Buffer(source_object());

    let buf = encode_object(&info, &env, &src).unwrap();
    let view = EncodedObject::new(Arc::new(info.field_constraints.clone()), buf);

    // Declared fields come back in position order with defaults materialized
    // and declared casts applied; extras follow sorted by name, untouched.
    let mut names = Vec::new();
    let mut values = Vec::new();
    view.iterate(&mut |name, value| {
        names.push(name.to_string());
        values.push(value);
        Ok(())
    })
    .unwrap();
    assert_eq!(names, vec!["a", "b", "c", "d", "e", "array", "doc", "f", "g"]);
    assert_eq!(values[0], Value::Integer(1));
    assert_eq!(values[1], Value::text("hello"));
    assert_eq!(values[2], Value::Double(3.14));
    assert_eq!(values[3], Value::Double(10.0));
    assert_eq!(values[4], Value::Double(100.0));
    assert_eq!(values[7], Value::Integer(1000));
    assert_eq!(values[8], Value::Double(2000.0));

    // Lazy point reads agree with iteration.
    assert_eq!(view.get("d").unwrap(), Some(Value::Double(10.0)));
    assert_eq!(view.get("f").unwrap(), Some(Value::Integer(1000)));
    assert_eq!(view.get("nope").unwrap(), None);
}

#[test]
fn missing_not_null_field_is_rejected() {
    let info = test_table();
    let env = Environment::empty();
    let mut fb = FieldBuffer::new();
    fb.add("a", Value::Integer(1));
    // "c" is NOT NULL and has no default.
    let err = encode_object(&info, &env, &RowObject::Buffer(fb)).unwrap_err();
    assert!(matches!(err, Error::NotNullViolation { ref column, .. } if column == "c"));
}

#[test]
fn declared_type_mismatch_is_rejected() {
    let info = test_table();
    let env = Environment::empty();
    let mut fb = FieldBuffer::new();
    fb.add("a", Value::text("not a number"));
    fb.add("c", Value::Double(1.0));
    let err = encode_object(&info, &env, &RowObject::Buffer(fb)).unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { .. }));
}

#[test]
fn extra_fields_are_dropped_when_not_allowed() {
    let mut info = test_table();
    info.field_constraints.allow_extra_fields = false;
    let env = Environment::empty();

    let buf = encode_object(&info, &env, &RowObject::Buffer(source_object())).unwrap();
    let view = EncodedObject::new(Arc::new(info.field_constraints.clone()), buf);
    assert_eq!(view.get("f").unwrap(), None);
    assert_eq!(view.get("a").unwrap(), Some(Value::Integer(1)));
}

#[test]
fn nested_constraints_normalize_object_columns() {
    let mut nested = chaidb::catalog::schema::FieldConstraints::default();
    nested
        .add(constraint(0, "x", ValueType::Double))
        .unwrap();
    let mut info = TableInfo::new("t");
    info.field_constraints
        .add(FieldConstraint {
            anonymous_type: Some(Box::new(nested)),
            ..constraint(0, "o", ValueType::Object)
        })
        .unwrap();

    let mut inner = FieldBuffer::new();
    inner.add("x", Value::Integer(4));
    let mut fb = FieldBuffer::new();
    fb.add("o", Value::Object(inner));

    let env = Environment::empty();
    let buf = encode_object(&info, &env, &RowObject::Buffer(fb)).unwrap();
    let view = EncodedObject::new(Arc::new(info.field_constraints.clone()), buf);
    let Some(Value::Object(normalized)) = view.get("o").unwrap() else {
        panic!("expected object column");
    };
    assert_eq!(normalized.get("x"), Some(&Value::Double(4.0)));
}
