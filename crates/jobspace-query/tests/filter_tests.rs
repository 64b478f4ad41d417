//! Filter evaluation against document collections.
//!
//! The arithmetic/array/logical fixtures mirror the reference behavior of
//! the query grammar over a hundred documents `{"a": 0} .. {"a": 99}`.

use jobspace_query::{Filter, FilterError};
use serde_json::{json, Value};

const N: usize = 100;
const K: i64 = 42;

fn docs() -> Vec<Value> {
    (0..N).map(|i| json!({"a": i})).collect()
}

fn count(filter: &Value, docs: &[Value]) -> usize {
    let parsed = Filter::parse(Some(filter)).unwrap();
    docs.iter().filter(|doc| parsed.matches(doc)).count()
}

// ============================================================================
// Arithmetic operators
// ============================================================================

#[test]
fn test_arithmetic_operators() {
    let docs = docs();
    let n = K as usize;
    let cases = [
        (json!({"$eq": K}), 1),
        (json!({"$ne": K}), N - 1),
        (json!({"$lt": K}), n),
        (json!({"$gt": K}), N - n - 1),
        (json!({"$lte": K}), n + 1),
        (json!({"$gte": K}), N - n),
    ];
    for (expr, expected) in cases {
        assert_eq!(count(&json!({"a": expr}), &docs), expected, "{expr}");
        assert_eq!(count(&json!({"a": expr}), &[]), 0, "{expr} on empty");
    }
}

#[test]
fn test_lt_counts_exactly() {
    let docs = docs();
    for k in 0..=N {
        assert_eq!(count(&json!({"a": {"$lt": k}}), &docs), k);
    }
}

// ============================================================================
// Array operators
// ============================================================================

#[test]
fn test_array_operators() {
    let docs = docs();
    let cases = [
        (json!({"$in": []}), 0),
        (json!({"$in": [0, 1, 2]}), 3),
        (json!({"$in": ["a", "b", "c"]}), 0),
        (json!({"$nin": []}), N),
        (json!({"$nin": [0, 1, 2]}), N - 3),
        (json!({"$nin": ["a", "b", "c"]}), N),
    ];
    for (expr, expected) in cases {
        assert_eq!(count(&json!({"a": expr}), &docs), expected, "{expr}");
    }
}

// ============================================================================
// Logical operators
// ============================================================================

#[test]
fn test_logical_operators() {
    let docs = docs();
    let cases = [
        (json!({"$and": []}), N),
        (json!({"$or": []}), 0),
        (json!({"$and": [{"a": K}]}), 1),
        (json!({"$and": [{"$not": {"a": K}}]}), N - 1),
        (json!({"$and": [{"a": K}, {"a": K + 1}]}), 0),
        (json!({"$and": [{"a": K}, {"$not": {"a": K}}]}), 0),
        (json!({"$or": [{"$not": {"a": K}}]}), N - 1),
        (json!({"$or": [{"a": K}, {"a": K + 1}]}), 2),
        (json!({"$or": [{"a": K}, {"$not": {"a": K}}]}), N),
    ];
    for (expr, expected) in cases {
        assert_eq!(count(&expr, &docs), expected, "{expr}");
        // `$not` complements the match set.
        assert_eq!(count(&json!({"$not": expr}), &docs), N - expected, "$not {expr}");
        assert_eq!(
            count(&json!({"$not": {"$not": expr}}), &docs),
            expected,
            "$not $not {expr}"
        );
    }
}

#[test]
fn test_logical_operator_rejects_mapping_operand() {
    for op in ["$and", "$or"] {
        let mut filter = serde_json::Map::new();
        filter.insert(op.to_owned(), json!({"a": 1}));
        let result = Filter::parse(Some(&Value::Object(filter)));
        assert!(
            matches!(result, Err(FilterError::LogicalOperandNotSequence(ref o)) if o == op),
            "{op}"
        );
    }
}

#[test]
fn test_operator_in_key_position_is_unknown() {
    for expr in [
        json!({"a": {"$and": []}}),
        json!({"a": {"$or": []}}),
        json!({"a": {"$and": [{"b": 0}]}}),
    ] {
        assert!(matches!(
            Filter::parse(Some(&expr)),
            Err(FilterError::UnknownOperator(_))
        ));
    }
}

// ============================================================================
// Nested and dotted keys
// ============================================================================

#[test]
fn test_nested_and_dotted_resolution() {
    let nested: Vec<Value> = (0..10).map(|i| json!({"a": {"b": i}})).collect();
    let dotted: Vec<Value> = (0..10)
        .map(|i| {
            let mut map = serde_json::Map::new();
            map.insert("a.b".to_owned(), json!(i));
            Value::Object(map)
        })
        .collect();
    let all: Vec<Value> = nested.iter().chain(&dotted).cloned().collect();

    assert_eq!(count(&json!({"a.b": 0}), &all), 2);
    assert_eq!(count(&json!({"a.b": -1}), &all), 0);
    assert_eq!(count(&json!({"a": {"b": 0}}), &nested), 1);
}

#[test]
fn test_deeply_nested_list_equality() {
    let docs: Vec<Value> = (0..10).map(|i| json!({"a": [[[i]]]})).collect();
    assert_eq!(count(&json!({"a": [[[0]]]}), &docs), 1);
    assert_eq!(count(&json!({"a": [[[-1]]]}), &docs), 0);
}

#[test]
fn test_multi_key_filter_is_conjunction() {
    let docs: Vec<Value> = (0..12)
        .map(|i| json!({"a": i, "b": i % 2}))
        .collect();
    assert_eq!(count(&json!({"a": {"$lt": 6}, "b": 0}), &docs), 3);
}
