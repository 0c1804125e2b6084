use chaidb::catalog::schema::{FieldConstraint, TableInfo};
use chaidb::encoding::EncodedKey;
use chaidb::expr::Expr;
use chaidb::statement::{InsertSource, InsertStmt, SelectStmt, Statement};
use chaidb::types::ValueType;
use chaidb::{Database, Value};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn bench_key_encoding(c: &mut Criterion) {
    let values = [
        Value::Integer(-123456789),
        Value::text("a moderately sized text value"),
        Value::Double(3.14159),
    ];
    c.bench_function("encode_composite_key", |b| {
        b.iter(|| EncodedKey::from_values(black_box(&values)).unwrap())
    });
}

fn bench_seq_scan(c: &mut Criterion) {
    let db = Database::new().unwrap();
    let mut info = TableInfo::new("bench");
    info.field_constraints
        .add(FieldConstraint {
            position: 0,
            field: "id".into(),
            ty: ValueType::Integer,
            is_primary_key: true,
            is_not_null: false,
            default_value: None,
            anonymous_type: None,
        })
        .unwrap();
    info.field_constraints
        .add(FieldConstraint {
            position: 1,
            field: "payload".into(),
            ty: ValueType::Text,
            is_primary_key: false,
            is_not_null: false,
            default_value: None,
            anonymous_type: None,
        })
        .unwrap();
    db.execute(
        Statement::CreateTable {
            info,
            if_not_exists: false,
        },
        vec![],
    )
    .unwrap();

    let rows: Vec<Vec<Expr>> = (0..1000)
        .map(|i| vec![Expr::integer(i), Expr::text("payload payload payload")])
        .collect();
    db.execute(
        Statement::Insert(InsertStmt {
            table: "bench".into(),
            columns: vec![],
            source: InsertSource::Values(rows),
            on_conflict: None,
        }),
        vec![],
    )
    .unwrap();

    c.bench_function("seq_scan_1000_rows", |b| {
        b.iter(|| {
            let mut count = 0usize;
            db.query(
                Statement::Select(SelectStmt {
                    table: Some("bench".into()),
                    ..Default::default()
                }),
                vec![],
            )
            .unwrap()
            .iterate(|row| {
                black_box(row.get("id"));
                count += 1;
                Ok(())
            })
            .unwrap();
            assert_eq!(count, 1000);
        })
    });
}

criterion_group!(benches, bench_key_encoding, bench_seq_scan);
criterion_main!(benches);
