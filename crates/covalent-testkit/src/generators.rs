//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{json, Value};

/// A JSON scalar or a small array or object of scalars.
pub fn change() -> impl Strategy<Value = Value> {
    let scalar = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,24}".prop_map(Value::from),
    ];
    scalar.prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|fields| Value::Object(fields.into_iter().collect())),
        ]
    })
}

/// Between one and `max` changes, as passed to a single transaction.
pub fn changes(max: usize) -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(change(), 1..=max.max(1))
}

/// A map key drawn from a small alphabet, so edits collide.
pub fn map_key() -> impl Strategy<Value = String> {
    prop_oneof![Just("a"), Just("b"), Just("c"), Just("d")].prop_map(String::from)
}

/// One edit to a map.
#[derive(Debug, Clone, PartialEq)]
pub enum MapOp {
    Set(String, Value),
    Delete(String),
}

impl MapOp {
    /// The edit as a map change.
    pub fn to_change(&self) -> Value {
        match self {
            Self::Set(key, value) => json!({"op": "set", "key": key, "value": value}),
            Self::Delete(key) => json!({"op": "del", "key": key}),
        }
    }
}

impl Arbitrary for MapOp {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop_oneof![
            3 => (map_key(), change()).prop_map(|(key, value)| MapOp::Set(key, value)),
            1 => map_key().prop_map(MapOp::Delete),
        ]
        .boxed()
    }
}

/// Up to `max` map edits.
pub fn map_ops(max: usize) -> impl Strategy<Value = Vec<MapOp>> {
    prop::collection::vec(any::<MapOp>(), 0..=max)
}
