use chaidb::catalog::schema::{
    FieldConstraint, IndexInfo, TableConstraint, TableConstraintKind, TableInfo,
};
use chaidb::encoding::SortOrder;
use chaidb::error::Error;
use chaidb::expr::{Expr, Path};
use chaidb::statement::{
    DeleteStmt, InsertSource, InsertStmt, OnConflictAction, SelectStmt, Statement, UpdateAction,
    UpdateStmt,
};
use chaidb::stream::ProjectExpr;
use chaidb::types::ValueType;
use chaidb::{Database, Value};

fn column(position: usize, field: &str, ty: ValueType) -> FieldConstraint {
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

fn create_table(db: &Database, info: TableInfo) {
    db.execute(
        Statement::CreateTable {
            info,
            if_not_exists: false,
        },
        vec![],
    )
    .expect("create table");
}

fn insert_values(db: &Database, table: &str, columns: &[&str], rows: Vec<Vec<Expr>>) {
    db.execute(
        Statement::Insert(InsertStmt {
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            source: InsertSource::Values(rows),
            on_conflict: None,
        }),
        vec![],
    )
    .expect("insert");
}

fn select_all(db: &Database, stmt: SelectStmt) -> Vec<chaidb::ResultRow> {
    db.query(Statement::Select(stmt), vec![])
        .expect("prepare select")
        .collect_rows()
        .expect("run select")
}

#[test]
fn count_over_two_rows_returns_two() {
    let db = Database::new().unwrap();
    let mut info = TableInfo::new("t");
    info.field_constraints
        .add(column(0, "a", ValueType::Integer))
        .unwrap();
    info.field_constraints
        .add(column(1, "b", ValueType::Text))
        .unwrap();
    create_table(&db, info);
    insert_values(
        &db,
        "t",
        &[],
        vec![
            vec![Expr::integer(1), Expr::text("x")],
            vec![Expr::integer(2), Expr::text("y")],
        ],
    );

    let rows = select_all(
        &db,
        SelectStmt {
            table: Some("t".into()),
            columns: vec![ProjectExpr::expr(Expr::call("COUNT", vec![Expr::Wildcard]))],
            ..Default::default()
        },
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("COUNT(*)"), Some(&Value::Integer(2)));
}

fn pk_table(db: &Database) {
    let mut info = TableInfo::new("t");
    let mut pk = column(0, "a", ValueType::Integer);
    pk.is_primary_key = true;
    info.field_constraints.add(pk).unwrap();
    info.field_constraints
        .add(column(1, "b", ValueType::Integer))
        .unwrap();
    create_table(db, info);
}

#[test]
fn pk_range_select_reverses_the_scan_instead_of_sorting() {
    let db = Database::new().unwrap();
    pk_table(&db);
    insert_values(
        &db,
        "t",
        &[],
        vec![
            vec![Expr::integer(1), Expr::integer(10)],
            vec![Expr::integer(2), Expr::integer(20)],
            vec![Expr::integer(3), Expr::integer(30)],
        ],
    );

    let select = SelectStmt {
        table: Some("t".into()),
        predicate: Some(Expr::column("a").gt(Expr::integer(1))),
        order_by: Some((Expr::column("a"), SortOrder::Desc)),
        ..Default::default()
    };

    // The plan uses a reversed primary-key scan with no sort operator.
    let plan_rows = db
        .query(
            Statement::Explain(Box::new(Statement::Select(select.clone()))),
            vec![],
        )
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(
        plan_rows[0].get("plan"),
        Some(&Value::text("table.PkScanReverse(\"t\", (1, +inf))"))
    );

    let rows = select_all(&db, select);
    let pairs: Vec<(Value, Value)> = rows
        .iter()
        .map(|r| (r.get("a").unwrap().clone(), r.get("b").unwrap().clone()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            (Value::Integer(3), Value::Integer(30)),
            (Value::Integer(2), Value::Integer(20)),
        ]
    );
}

#[test]
fn order_by_on_indexed_column_scans_the_index() {
    let db = Database::new().unwrap();
    let mut info = TableInfo::new("t");
    info.field_constraints
        .add(column(0, "a", ValueType::Any))
        .unwrap();
    create_table(&db, info);
    db.execute(
        Statement::CreateIndex {
            info: IndexInfo {
                name: "i".into(),
                table: "t".into(),
                paths: vec![Path::field("a")],
                unique: false,
                sort_order: vec![SortOrder::Asc],
            },
            if_not_exists: false,
        },
        vec![],
    )
    .unwrap();
    insert_values(
        &db,
        "t",
        &["a"],
        vec![
            vec![Expr::integer(3)],
            vec![Expr::integer(1)],
            vec![Expr::integer(2)],
        ],
    );

    let select = SelectStmt {
        table: Some("t".into()),
        order_by: Some((Expr::column("a"), SortOrder::Asc)),
        ..Default::default()
    };
    let plan_rows = db
        .query(
            Statement::Explain(Box::new(Statement::Select(select.clone()))),
            vec![],
        )
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(plan_rows[0].get("plan"), Some(&Value::text("index.Scan(\"i\")")));

    let rows = select_all(&db, select);
    let values: Vec<Value> = rows.iter().map(|r| r.get("a").unwrap().clone()).collect();
    assert_eq!(
        values,
        vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]
    );
}

#[test]
fn on_conflict_do_nothing_keeps_the_first_row() {
    let db = Database::new().unwrap();
    let mut info = TableInfo::new("t");
    info.field_constraints
        .add(column(0, "a", ValueType::Integer))
        .unwrap();
    info.table_constraints.push(TableConstraint {
        name: "a_unique".into(),
        kind: TableConstraintKind::Unique {
            paths: vec![Path::field("a")],
            sort_order: vec![SortOrder::Asc],
        },
    });
    create_table(&db, info);

    insert_values(&db, "t", &[], vec![vec![Expr::integer(1)]]);

    // A plain duplicate insert fails with a unique violation...
    let duplicate = Statement::Insert(InsertStmt {
        table: "t".into(),
        columns: vec![],
        source: InsertSource::Values(vec![vec![Expr::integer(1)]]),
        on_conflict: None,
    });
    assert!(matches!(
        db.execute(duplicate, vec![]),
        Err(Error::UniqueViolation { .. })
    ));

    // ...while ON CONFLICT DO NOTHING swallows it.
    db.execute(
        Statement::Insert(InsertStmt {
            table: "t".into(),
            columns: vec![],
            source: InsertSource::Values(vec![vec![Expr::integer(1)]]),
            on_conflict: Some(OnConflictAction::DoNothing),
        }),
        vec![],
    )
    .expect("conflicting insert with DO NOTHING");

    let rows = select_all(
        &db,
        SelectStmt {
            table: Some("t".into()),
            ..Default::default()
        },
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("a"), Some(&Value::Integer(1)));
}

#[test]
fn inserting_null_into_not_null_column_fails() {
    let db = Database::new().unwrap();
    let mut info = TableInfo::new("t");
    let mut not_null = column(0, "a", ValueType::Integer);
    not_null.is_not_null = true;
    info.field_constraints.add(not_null).unwrap();
    create_table(&db, info);

    let err = db
        .execute(
            Statement::Insert(InsertStmt {
                table: "t".into(),
                columns: vec!["a".into()],
                source: InsertSource::Values(vec![vec![Expr::Literal(Value::Null)]]),
                on_conflict: None,
            }),
            vec![],
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotNullViolation { ref column, .. } if column == "a"));
}

#[test]
fn scalar_select_evaluates_floor_and_rejects_acos_domain() {
    let db = Database::new().unwrap();

    let rows = select_all(
        &db,
        SelectStmt {
            columns: vec![ProjectExpr::expr(Expr::call(
                "floor",
                vec![Expr::Literal(Value::Double(2.7))],
            ))],
            ..Default::default()
        },
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("floor(2.7)"), Some(&Value::Double(2.0)));

    let err = db
        .query(
            Statement::Select(SelectStmt {
                columns: vec![
                    ProjectExpr::expr(Expr::call(
                        "floor",
                        vec![Expr::Literal(Value::Double(2.7))],
                    )),
                    ProjectExpr::expr(Expr::call("acos", vec![Expr::integer(2)])),
                ],
                ..Default::default()
            }),
            vec![],
        )
        .unwrap()
        .collect_rows()
        .unwrap_err();
    assert!(matches!(err, Error::OutOfRange(_)));
}

#[test]
fn update_and_delete_maintain_rows_and_indexes() {
    let db = Database::new().unwrap();
    pk_table(&db);
    db.execute(
        Statement::CreateIndex {
            info: IndexInfo {
                name: "t_b".into(),
                table: "t".into(),
                paths: vec![Path::field("b")],
                unique: false,
                sort_order: vec![SortOrder::Asc],
            },
            if_not_exists: false,
        },
        vec![],
    )
    .unwrap();
    insert_values(
        &db,
        "t",
        &[],
        vec![
            vec![Expr::integer(1), Expr::integer(10)],
            vec![Expr::integer(2), Expr::integer(20)],
            vec![Expr::integer(3), Expr::integer(30)],
        ],
    );

    db.execute(
        Statement::Update(UpdateStmt {
            table: "t".into(),
            actions: vec![UpdateAction::Set {
                path: Path::field("b"),
                expr: Expr::integer(5),
            }],
            predicate: Some(Expr::column("a").eq(Expr::integer(2))),
        }),
        vec![],
    )
    .unwrap();

    db.execute(
        Statement::Delete(DeleteStmt {
            table: "t".into(),
            predicate: Some(Expr::column("a").eq(Expr::integer(3))),
        }),
        vec![],
    )
    .unwrap();

    // The index scan over b reflects the update and the delete.
    let rows = select_all(
        &db,
        SelectStmt {
            table: Some("t".into()),
            order_by: Some((Expr::column("b"), SortOrder::Asc)),
            ..Default::default()
        },
    );
    let pairs: Vec<(Value, Value)> = rows
        .iter()
        .map(|r| (r.get("a").unwrap().clone(), r.get("b").unwrap().clone()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            (Value::Integer(2), Value::Integer(5)),
            (Value::Integer(1), Value::Integer(10)),
        ]
    );
}

#[test]
fn group_by_emits_one_row_per_group_in_key_order() {
    let db = Database::new().unwrap();
    let mut info = TableInfo::new("orders");
    info.field_constraints
        .add(column(0, "category", ValueType::Text))
        .unwrap();
    info.field_constraints
        .add(column(1, "amount", ValueType::Integer))
        .unwrap();
    create_table(&db, info);
    insert_values(
        &db,
        "orders",
        &[],
        vec![
            vec![Expr::text("books"), Expr::integer(30)],
            vec![Expr::text("games"), Expr::integer(110)],
            vec![Expr::text("books"), Expr::integer(90)],
        ],
    );

    let rows = select_all(
        &db,
        SelectStmt {
            table: Some("orders".into()),
            columns: vec![
                ProjectExpr::expr(Expr::column("category")),
                ProjectExpr::expr(Expr::call("sum", vec![Expr::column("amount")])),
            ],
            group_by: Some(Expr::column("category")),
            ..Default::default()
        },
    );
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("category"), Some(&Value::text("books")));
    assert_eq!(rows[0].get("sum(amount)"), Some(&Value::Integer(120)));
    assert_eq!(rows[1].get("category"), Some(&Value::text("games")));
    assert_eq!(rows[1].get("sum(amount)"), Some(&Value::Integer(110)));
}

#[test]
fn count_over_an_empty_table_is_zero() {
    let db = Database::new().unwrap();
    let mut info = TableInfo::new("empty");
    info.field_constraints
        .add(column(0, "a", ValueType::Integer))
        .unwrap();
    create_table(&db, info);

    let rows = select_all(
        &db,
        SelectStmt {
            table: Some("empty".into()),
            columns: vec![ProjectExpr::expr(Expr::call("count", vec![Expr::Wildcard]))],
            ..Default::default()
        },
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("count(*)"), Some(&Value::Integer(0)));
}

#[test]
fn explicit_transactions_commit_and_roll_back() {
    let db = Database::new().unwrap();
    pk_table(&db);

    db.execute(Statement::Begin { writable: true }, vec![]).unwrap();
    insert_values(&db, "t", &[], vec![vec![Expr::integer(1), Expr::integer(10)]]);
    // The uncommitted row is visible inside the transaction.
    assert_eq!(
        select_all(
            &db,
            SelectStmt {
                table: Some("t".into()),
                ..Default::default()
            }
        )
        .len(),
        1
    );
    db.execute(Statement::Rollback, vec![]).unwrap();
    assert_eq!(
        select_all(
            &db,
            SelectStmt {
                table: Some("t".into()),
                ..Default::default()
            }
        )
        .len(),
        0
    );

    db.execute(Statement::Begin { writable: true }, vec![]).unwrap();
    insert_values(&db, "t", &[], vec![vec![Expr::integer(2), Expr::integer(20)]]);
    db.execute(Statement::Commit, vec![]).unwrap();
    let rows = select_all(
        &db,
        SelectStmt {
            table: Some("t".into()),
            ..Default::default()
        },
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("a"), Some(&Value::Integer(2)));
}

#[test]
fn read_only_transactions_reject_writes() {
    let db = Database::new().unwrap();
    pk_table(&db);
    db.execute(Statement::Begin { writable: false }, vec![]).unwrap();
    let err = db
        .execute(
            Statement::Insert(InsertStmt {
                table: "t".into(),
                columns: vec![],
                source: InsertSource::Values(vec![vec![Expr::integer(1), Expr::integer(2)]]),
                on_conflict: None,
            }),
            vec![],
        )
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnly));
    db.execute(Statement::Rollback, vec![]).unwrap();
}

#[test]
fn rowid_tables_key_rows_from_the_owner_sequence() {
    let db = Database::new().unwrap();
    let mut info = TableInfo::new("log");
    info.field_constraints
        .add(column(0, "msg", ValueType::Text))
        .unwrap();
    create_table(&db, info);

    // The implicit sequence shows up in the catalog and feeds NEXT VALUE FOR.
    insert_values(
        &db,
        "log",
        &["msg"],
        vec![vec![Expr::text("one")], vec![Expr::text("two")]],
    );
    let rows = select_all(
        &db,
        SelectStmt {
            table: Some("log".into()),
            ..Default::default()
        },
    );
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("msg"), Some(&Value::text("one")));
    assert_eq!(rows[1].get("msg"), Some(&Value::text("two")));
}

#[test]
fn marshal_json_renders_sorted_canonical_fields() {
    let db = Database::new().unwrap();
    let mut info = TableInfo::new("t");
    info.field_constraints
        .add(column(0, "b", ValueType::Double))
        .unwrap();
    info.field_constraints
        .add(column(1, "a", ValueType::Integer))
        .unwrap();
    create_table(&db, info);
    insert_values(
        &db,
        "t",
        &[],
        vec![vec![Expr::integer(2), Expr::integer(7)]],
    );

    let rows = select_all(
        &db,
        SelectStmt {
            table: Some("t".into()),
            ..Default::default()
        },
    );
    assert_eq!(rows[0].marshal_json(), r#"{"a": 7, "b": 2.0}"#);
}

#[test]
fn distinct_take_and_skip_shape_the_result() {
    let db = Database::new().unwrap();
    let mut info = TableInfo::new("t");
    info.field_constraints
        .add(column(0, "a", ValueType::Integer))
        .unwrap();
    create_table(&db, info);
    insert_values(
        &db,
        "t",
        &["a"],
        vec![
            vec![Expr::integer(1)],
            vec![Expr::integer(1)],
            vec![Expr::integer(2)],
            vec![Expr::integer(3)],
        ],
    );

    let rows = select_all(
        &db,
        SelectStmt {
            table: Some("t".into()),
            columns: vec![ProjectExpr::expr(Expr::column("a"))],
            distinct: true,
            offset: Some(1),
            limit: Some(1),
            ..Default::default()
        },
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("a"), Some(&Value::Integer(2)));
}

#[test]
fn drop_table_removes_rows_catalog_and_indexes() {
    let db = Database::new().unwrap();
    pk_table(&db);
    db.execute(
        Statement::CreateIndex {
            info: IndexInfo {
                name: "t_b".into(),
                table: "t".into(),
                paths: vec![Path::field("b")],
                unique: false,
                sort_order: vec![SortOrder::Asc],
            },
            if_not_exists: false,
        },
        vec![],
    )
    .unwrap();
    insert_values(&db, "t", &[], vec![vec![Expr::integer(1), Expr::integer(2)]]);

    db.execute(
        Statement::DropTable {
            name: "t".into(),
            if_exists: false,
        },
        vec![],
    )
    .unwrap();
    assert!(db.tables().is_empty());
    assert!(db.indexes().is_empty());

    let err = db
        .query(
            Statement::Select(SelectStmt {
                table: Some("t".into()),
                ..Default::default()
            }),
            vec![],
        )
        .unwrap_err();
    assert!(matches!(err, Error::CatalogNotFound { .. }));
}

#[test]
fn rename_table_moves_rows_to_the_new_name() {
    let db = Database::new().unwrap();
    pk_table(&db);
    insert_values(&db, "t", &[], vec![vec![Expr::integer(1), Expr::integer(2)]]);
    db.execute(
        Statement::AlterTableRename {
            table: "t".into(),
            new_name: "t2".into(),
        },
        vec![],
    )
    .unwrap();

    assert_eq!(db.tables(), vec!["t2".to_string()]);
    let rows = select_all(
        &db,
        SelectStmt {
            table: Some("t2".into()),
            ..Default::default()
        },
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("a"), Some(&Value::Integer(1)));
}

#[test]
fn positional_params_bind_into_predicates() {
    let db = Database::new().unwrap();
    pk_table(&db);
    insert_values(
        &db,
        "t",
        &[],
        vec![
            vec![Expr::integer(1), Expr::integer(10)],
            vec![Expr::integer(2), Expr::integer(20)],
        ],
    );

    let rows = db
        .query(
            Statement::Select(SelectStmt {
                table: Some("t".into()),
                predicate: Some(Expr::column("b").eq(Expr::PositionalParam(0))),
                ..Default::default()
            }),
            vec![chaidb::Param::positional(Value::Integer(20))],
        )
        .unwrap()
        .collect_rows()
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("a"), Some(&Value::Integer(2)));
}
