//! Integration coverage for the expression evaluator beyond the inline
//! unit tests: multi-tag references, comparisons, and failure modes that
//! only show up once tags live in a real `TagStore`.

use gateway_server::error::EngineError;
use gateway_server::tags::expression::{analyze, evaluate, tokenize};
use gateway_server::tags::store::TagStore;
use gateway_server::tags::structures::TagValue;

#[test]
fn analyze_rejects_unknown_identifier() {
    let store = TagStore::new();
    let tokens = tokenize("missing + 1");
    store.create_expression("e", "", "missing + 1", tokens, false);

    let err = analyze(&store, "e").unwrap_err();
    assert!(matches!(err, EngineError::BadExpression(_)));
}

#[test]
fn evaluate_is_null_until_every_input_has_a_value() {
    let store = TagStore::new();
    store.create("temp", "", None, None, None, true);
    store.create_expression("over_threshold", "", "temp > 100", tokenize("temp > 100"), false);
    analyze(&store, "over_threshold").unwrap();

    assert_eq!(evaluate(&store, "over_threshold").unwrap(), TagValue::Null);
}

#[test]
fn evaluate_combines_two_referenced_tags() {
    let store = TagStore::new();
    store.create("a", "", None, None, None, true);
    store.create("b", "", None, None, None, true);
    let tokens = tokenize("(a + b) * 2");
    store.create_expression("combined", "", "(a + b) * 2", tokens, false);
    analyze(&store, "combined").unwrap();

    *store.get("a").unwrap().value.write() = TagValue::Int(3);
    *store.get("b").unwrap().value.write() = TagValue::Int(4);

    assert_eq!(evaluate(&store, "combined").unwrap(), TagValue::Int(14));
}

#[test]
fn division_by_zero_is_an_eval_error() {
    let store = TagStore::new();
    store.create_expression("bad", "", "1 / 0", tokenize("1 / 0"), false);
    let err = evaluate(&store, "bad").unwrap_err();
    assert!(matches!(err, EngineError::Eval(_)));
}
