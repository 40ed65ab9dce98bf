/// Test utilities and helpers for DQL testing
///
/// Provides the in-memory and scripted stores, an item builder and the
/// table fixtures shared by the integration tests and benches.

pub mod memory;
pub mod scripted;

pub use memory::MemoryStore;
pub use scripted::{ScriptedCall, ScriptedStore};

use bytes::Bytes;
use dql_api::Engine;
use dql_core::config::EngineConfig;
use dql_core::retry::RetryPolicy;
use dql_core::schema::{GlobalIndex, KeyAttribute, KeyType, LocalIndex, TableMeta, Throughput};
use dql_core::{Item, Value};
use std::collections::HashMap;

/// Builder for test items
#[derive(Debug, Clone, Default)]
pub struct ItemBuilder {
    attributes: HashMap<String, Value>,
}

impl ItemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn string(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(name.to_string(), Value::string(value));
        self
    }

    pub fn number(mut self, name: &str, value: impl ToString) -> Self {
        self.attributes.insert(name.to_string(), Value::number(value));
        self
    }

    pub fn bool(mut self, name: &str, value: bool) -> Self {
        self.attributes.insert(name.to_string(), Value::Bool(value));
        self
    }

    pub fn binary(mut self, name: &str, value: impl Into<Bytes>) -> Self {
        self.attributes.insert(name.to_string(), Value::binary(value));
        self
    }

    pub fn null(mut self, name: &str) -> Self {
        self.attributes.insert(name.to_string(), Value::Null);
        self
    }

    pub fn value(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn string_set(mut self, name: &str, values: &[&str]) -> Self {
        self.attributes.insert(
            name.to_string(),
            Value::SS(values.iter().map(|v| v.to_string()).collect()),
        );
        self
    }

    pub fn build(self) -> Item {
        self.attributes
    }
}

/// Table `things`: string hash key `id`, keys-only global index on `bar`
pub fn simple_table() -> TableMeta {
    TableMeta::new("things", KeyAttribute::new("id", KeyType::S)).with_global_index(
        GlobalIndex::new("bar-index", KeyAttribute::new("bar", KeyType::S)).keys_only(),
    )
}

/// Table `forum`
///
/// - primary key `(id S, ts N)`
/// - local index `score-index` on `score`, keys only
/// - global index `author-index` on `(author, ts)` including `title`
pub fn forum_table() -> TableMeta {
    TableMeta::new("forum", KeyAttribute::new("id", KeyType::S))
        .with_range_key(KeyAttribute::new("ts", KeyType::N))
        .with_local_index(LocalIndex::new("score-index", KeyAttribute::new("score", KeyType::N)).keys_only())
        .with_global_index(
            GlobalIndex::new("author-index", KeyAttribute::new("author", KeyType::S))
                .with_range_key(KeyAttribute::new("ts", KeyType::N))
                .include(vec!["title".to_string()])
                .with_throughput(Throughput::new(10, 5)),
        )
        .with_throughput(Throughput::new(10, 5))
}

/// One forum post
pub fn post(id: &str, ts: i64, author: &str, score: i64) -> Item {
    ItemBuilder::new()
        .string("id", id)
        .number("ts", ts)
        .string("author", author)
        .number("score", score)
        .string("title", format!("{} post {}", author, ts))
        .string("body", format!("body of {} {}", id, ts))
        .build()
}

/// Eight posts across threads `a` and `b` by `alice` and `bob`
pub fn forum_posts() -> Vec<Item> {
    vec![
        post("a", 1, "alice", 5),
        post("a", 2, "bob", 3),
        post("a", 3, "alice", 9),
        post("a", 4, "bob", 1),
        post("a", 5, "alice", 7),
        post("b", 1, "bob", 2),
        post("b", 2, "alice", 8),
        post("b", 3, "bob", 4),
    ]
}

/// Configuration with millisecond backoff so retry tests stay fast
pub fn fast_config() -> EngineConfig {
    EngineConfig::default().with_retry(RetryPolicy::new(3, 1, 5, 2.0))
}

/// Memory store holding the forum table and its posts
pub fn forum_store() -> MemoryStore {
    let store = MemoryStore::new().with_table(forum_table()).with_table(simple_table());
    store.seed("forum", forum_posts());
    store
}

/// Engine over `forum_store()` with `fast_config()`
pub fn forum_engine() -> Engine<MemoryStore> {
    engine_with(forum_store(), fast_config())
}

pub fn engine_with(store: MemoryStore, config: EngineConfig) -> Engine<MemoryStore> {
    match Engine::with_config(store, config) {
        Ok(engine) => engine,
        Err(e) => panic!("invalid test configuration: {}", e),
    }
}

/// Values of `attribute` across `items`, in order
pub fn column<'a>(items: &'a [Item], attribute: &str) -> Vec<&'a Value> {
    items.iter().filter_map(|item| item.get(attribute)).collect()
}

/// Assert that a value is a number with expected value
pub fn assert_number_eq(value: &Value, expected: &str) {
    match value {
        Value::N(n) => assert_eq!(n, expected),
        _ => panic!("Expected number, got {:?}", value),
    }
}

/// Assert that a value is a string with expected value
pub fn assert_string_eq(value: &Value, expected: &str) {
    match value {
        Value::S(s) => assert_eq!(s, expected),
        _ => panic!("Expected string, got {:?}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dql_api::store::{BatchGetRequest, QueryRequest, Store, UpdateItemRequest};
    use dql_api::CONDITIONAL_CHECK_FAILED;
    use dql_core::expression::ExpressionContext;
    use dql_core::Error;

    fn forum_query(key_condition: &str, context: ExpressionContext) -> QueryRequest {
        QueryRequest {
            table: "forum".into(),
            key_condition: key_condition.into(),
            context,
            ascending: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_item_builder() {
        let item = ItemBuilder::new()
            .string("id", "a")
            .number("n", 3)
            .bool("flag", true)
            .null("gone")
            .build();
        assert_eq!(item.len(), 4);
        assert_string_eq(&item["id"], "a");
        assert_number_eq(&item["n"], "3");
        assert_eq!(item["flag"], Value::Bool(true));
    }

    #[test]
    fn test_fixture_tables_validate() {
        forum_table().validate().unwrap();
        simple_table().validate().unwrap();
        assert!(fast_config().validate().is_ok());
    }

    #[test]
    fn test_memory_query_orders_by_range_key() {
        let store = forum_store();
        let context = ExpressionContext::new()
            .with_name("#n0", "id")
            .with_value(":v0", Value::string("a"));

        let page = store.query(&forum_query("#n0 = :v0", context.clone())).unwrap();
        assert_eq!(column(&page.items, "ts").len(), 5);
        assert_number_eq(&page.items[0]["ts"], "1");
        assert!(page.last_evaluated_key.is_none());

        let page = store
            .query(&QueryRequest {
                ascending: false,
                limit: Some(2),
                ..forum_query("#n0 = :v0", context)
            })
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_number_eq(&page.items[0]["ts"], "5");
        let key = page.last_evaluated_key.unwrap();
        assert_number_eq(&key["ts"], "4");
    }

    #[test]
    fn test_memory_index_projection() {
        let store = forum_store();
        let context = ExpressionContext::new()
            .with_name("#n0", "author")
            .with_value(":v0", Value::string("bob"));
        let page = store
            .query(&QueryRequest {
                index: Some("author-index".into()),
                ..forum_query("#n0 = :v0", context)
            })
            .unwrap();
        assert_eq!(page.count, 4);
        for item in &page.items {
            assert!(item.contains_key("title"));
            assert!(!item.contains_key("body"));
        }
    }

    #[test]
    fn test_memory_pagination() {
        let store = MemoryStore::new().with_page_size(3).with_table(forum_table());
        store.seed("forum", forum_posts());
        let context = ExpressionContext::new()
            .with_name("#n0", "id")
            .with_value(":v0", Value::string("a"));

        let first = store.query(&forum_query("#n0 = :v0", context.clone())).unwrap();
        assert_eq!(first.items.len(), 3);
        let second = store
            .query(&QueryRequest {
                exclusive_start_key: first.last_evaluated_key.clone(),
                ..forum_query("#n0 = :v0", context)
            })
            .unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(second.last_evaluated_key.is_none());
        assert_eq!(store.call_count("query"), 2);
    }

    #[test]
    fn test_memory_conditional_update() {
        let store = forum_store();
        let context = ExpressionContext::new()
            .with_name("#n0", "score")
            .with_name("#n1", "id")
            .with_value(":v0", Value::number(1));
        let request = UpdateItemRequest {
            table: "forum".into(),
            key: ItemBuilder::new().string("id", "zz").number("ts", 1).build(),
            update_expression: "SET #n0 = :v0".into(),
            condition: Some("attribute_exists(#n1)".into()),
            context,
            ..Default::default()
        };
        match store.update_item(&request) {
            Err(Error::Remote { code, .. }) => assert_eq!(code, CONDITIONAL_CHECK_FAILED),
            other => panic!("expected a failed condition, got {:?}", other),
        }
        assert!(store.get("forum", &request.key).is_none());
    }

    #[test]
    fn test_memory_batch_get_capacity() {
        let store = MemoryStore::new().with_batch_get_capacity(1).with_table(forum_table());
        store.seed("forum", forum_posts());
        let response = store
            .batch_get(&BatchGetRequest {
                table: "forum".into(),
                keys: vec![
                    ItemBuilder::new().string("id", "a").number("ts", 1).build(),
                    ItemBuilder::new().string("id", "b").number("ts", 1).build(),
                ],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(response.items.len(), 1);
        assert_eq!(response.unprocessed_keys.len(), 1);
    }

    #[test]
    fn test_memory_failure_injection() {
        let store = forum_store();
        store.fail_next(Error::Transient("blip".into()));
        assert!(store.describe_table("forum").is_err());
        assert!(store.describe_table("forum").is_ok());
        assert_eq!(store.calls(), vec!["describe_table", "describe_table"]);
    }
}
