//! Content projections: what a value's valid transactions materialize into.

pub mod list;
pub mod map;
pub mod schema;
pub mod stream;

use serde_json::Value;

use covalent_core::{CoValueId, CoValueType};
use covalent_perms::ValidTransactions;

pub use list::{CoList, ListItem, OpId};
pub use map::{CoMap, Field, MapEdit};
pub use schema::{FieldKind, FieldSpec, SchemaDescriptor, SchemaRegistry, TypedMap};
pub use stream::{BinaryInfo, BinaryStream, CoStream, StreamItem};

/// A projected value.
#[derive(Debug, Clone)]
pub enum Content {
    Map(CoMap),
    List(CoList),
    Stream(CoStream),
    Binary(BinaryStream),
    /// Groups and accounts; their fields are read through the permission engine.
    Group(CoMap),
}

impl Content {
    pub fn project(id: CoValueId, kind: CoValueType, txs: &ValidTransactions) -> Self {
        match kind {
            CoValueType::Map => Self::Map(CoMap::from_transactions(id, txs)),
            CoValueType::List => Self::List(CoList::from_transactions(id, txs)),
            CoValueType::Stream => Self::Stream(CoStream::from_transactions(id, txs)),
            CoValueType::BinaryStream => {
                Self::Binary(BinaryStream::from_stream(&CoStream::from_transactions(id, txs)))
            }
            CoValueType::Group | CoValueType::Account => Self::Group(CoMap::from_transactions(id, txs)),
        }
    }

    /// Ids of other values this content refers to.
    pub fn references(&self) -> Vec<CoValueId> {
        let values: Vec<Value> = match self {
            Self::Map(map) => map.keys().filter_map(|key| map.value(key)).collect(),
            Self::List(list) => list.values(),
            Self::Stream(stream) => stream.all_items().into_iter().map(|item| item.value.clone()).collect(),
            Self::Binary(_) | Self::Group(_) => Vec::new(),
        };
        let mut refs: Vec<CoValueId> = values
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|s| s.parse().ok())
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }

    /// A JSON rendering of the readable content.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Map(map) | Self::Group(map) => map.to_json(),
            Self::List(list) => list.to_json(),
            Self::Stream(stream) => Value::Array(
                stream.all_items().into_iter().map(|item| item.value.clone()).collect(),
            ),
            Self::Binary(binary) => serde_json::json!({
                "mimeType": binary.info().map(|i| i.mime_type.clone()),
                "finished": binary.is_finished(),
                "receivedBytes": binary.received_len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_core::{AgentSecret, SessionId, TransactionId};
    use covalent_perms::DecryptedTransaction;
    use serde_json::json;

    #[test]
    fn test_references_are_collected_from_map_values() {
        let session = SessionId::new_random(AgentSecret::generate().id());
        let child = CoValueId([7; 20]);
        let txs = ValidTransactions {
            transactions: vec![DecryptedTransaction {
                tx_id: TransactionId::new(session, 0),
                made_at: 1,
                changes: vec![
                    map::set_op("child", json!(child.to_string())),
                    map::set_op("again", json!(child.to_string())),
                    map::set_op("name", json!("plain text")),
                ],
            }],
            unavailable: vec![],
        };
        let content = Content::project(CoValueId([1; 20]), CoValueType::Map, &txs);
        assert_eq!(content.references(), vec![child]);
    }
}
