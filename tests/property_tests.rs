//! Property-based tests for query rendering
//!
//! These tests check, over generated inputs, that:
//! - bound values land in placeholder order, numbers as string literals
//! - any mismatch between placeholders and bound values is rejected
//! - quoted text survives a trip through a live SQLite connection

use dblayer::core::db::{
    BackendKind, ConnectionContext, ConnectionHandle, DriverRegistry, Query, TableNames, Value,
};
use dblayer::core::{DbError, ErrorCategory};
use proptest::prelude::*;

fn arb_kind() -> impl Strategy<Value = BackendKind> {
    prop_oneof![
        Just(BackendKind::Sqlite),
        Just(BackendKind::Mysql),
        Just(BackendKind::Postgres),
    ]
}

fn template(placeholders: usize) -> String {
    let marks = vec!["?"; placeholders].join(", ");
    format!("SELECT {}", marks)
}

proptest! {
    #[test]
    fn test_values_fill_placeholders_in_order(kind in arb_kind(), numbers in prop::collection::vec(any::<i64>(), 1..10)) {
        let values = numbers.iter().map(|n| Value::Int(*n)).collect();
        let sql = Query::with_params(template(numbers.len()), values)
            .render(kind, &TableNames::default())
            .unwrap();

        let expected: Vec<String> = numbers.iter().map(|n| format!("'{}'", n)).collect();
        prop_assert_eq!(sql, format!("SELECT {}", expected.join(", ")));
    }

    #[test]
    fn test_arity_mismatch_is_rejected(kind in arb_kind(), placeholders in 0usize..8, bound in 0usize..8) {
        prop_assume!(placeholders != bound);
        let values = (0..bound).map(|i| Value::Int(i as i64)).collect();
        let result = Query::with_params(template(placeholders), values).render(kind, &TableNames::default());

        match result {
            Err(err @ DbError::Query { .. }) => prop_assert_eq!(err.category(), ErrorCategory::Query),
            other => prop_assert!(false, "Expected Query error, got {:?}", other),
        }
    }

    #[test]
    fn test_table_tokens_do_not_consume_values(prefix in "[a-z]{0,4}_?", value in any::<i32>()) {
        let tables = TableNames { prefix: prefix.clone(), ..TableNames::default() };
        let sql = Query::new("DELETE FROM {orders} WHERE id = ?")
            .bind(value)
            .render(BackendKind::Postgres, &tables)
            .unwrap();

        prop_assert_eq!(sql, format!("DELETE FROM \"{}orders\" WHERE id = '{}'", prefix, value));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_quoted_text_round_trips_through_sqlite(text in "\\PC{0,40}") {
        let mut handle = ConnectionHandle::open(
            "sqlite:///:memory:",
            ConnectionContext::Request,
            &DriverRegistry::with_defaults(),
        )
        .unwrap();

        let echoed = handle.query_value(Query::new("SELECT ?").bind(text.clone())).unwrap();
        prop_assert_eq!(echoed, Some(Value::Text(text)));
    }
}
