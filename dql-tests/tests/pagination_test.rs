/// Pagination tests: exactly which page requests a statement issues
use dql_api::store::{BatchGetResponse, Page};
use dql_api::{Engine, Error, Output};
use dql_core::config::EngineConfig;
use dql_core::throttle::Capacity;
use dql_core::Item;
use dql_test_utils::*;

fn engine(store: ScriptedStore) -> Engine<ScriptedStore> {
    engine_config(store, fast_config())
}

fn engine_config(store: ScriptedStore, config: EngineConfig) -> Engine<ScriptedStore> {
    Engine::with_config(store, config).unwrap()
}

fn key(id: &str, ts: i64) -> Item {
    ItemBuilder::new().string("id", id).number("ts", ts).build()
}

fn page(posts: &[(&str, i64)]) -> Page {
    Page::new(posts.iter().map(|(id, ts)| post(id, *ts, "alice", 1)).collect())
}

fn queries(store: &ScriptedStore) -> Vec<dql_api::QueryRequest> {
    store
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            ScriptedCall::Query(request) => Some(request),
            _ => None,
        })
        .collect()
}

#[test]
fn test_follows_continuation_tokens() {
    let store = ScriptedStore::new(forum_table());
    store
        .push_page(Ok(page(&[("a", 1), ("a", 2)]).with_last_evaluated_key(key("a", 2))))
        .push_page(Ok(page(&[("a", 3)]).with_last_evaluated_key(key("a", 3))))
        .push_page(Ok(page(&[("a", 4), ("a", 5)])));
    let engine = engine(store);

    let response = engine.execute("SELECT * FROM forum WHERE id = 'a'").unwrap();
    assert_eq!(response.items().len(), 5);

    let requests = queries(engine.store());
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].exclusive_start_key, None);
    assert_eq!(requests[1].exclusive_start_key, Some(key("a", 2)));
    assert_eq!(requests[2].exclusive_start_key, Some(key("a", 3)));
    assert!(requests.iter().all(|r| r.limit.is_none()));
}

#[test]
fn test_empty_page_with_token_keeps_reading() {
    let store = ScriptedStore::new(forum_table());
    store
        .push_page(Ok(Page::new(Vec::new())
            .with_scanned_count(4)
            .with_last_evaluated_key(key("a", 4))))
        .push_page(Ok(page(&[("a", 5)])));
    let engine = engine(store);

    let response = engine
        .execute("SELECT * FROM forum WHERE id = 'a' AND author = 'alice'")
        .unwrap();
    assert_eq!(response.items().len(), 1);
    assert_eq!(engine.store().page_requests(), 2);
}

#[test]
fn test_limit_stops_reading() {
    let store = ScriptedStore::new(forum_table());
    store
        .push_page(Ok(page(&[("a", 1), ("a", 2)]).with_last_evaluated_key(key("a", 2))))
        .push_page(Ok(page(&[("a", 3)]).with_last_evaluated_key(key("a", 3))))
        .push_page(Ok(page(&[("a", 4)])));
    let engine = engine(store);

    let response = engine.execute("SELECT * FROM forum WHERE id = 'a' LIMIT 3").unwrap();
    assert_eq!(response.items().len(), 3);

    // The remaining limit caps each page request
    let requests = queries(engine.store());
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].limit, Some(3));
    assert_eq!(requests[1].limit, Some(1));
    assert_eq!(engine.store().remaining_pages(), 1);
}

#[test]
fn test_limit_bounds_reads_for_client_side_sort() {
    let scored = |posts: &[(i64, i64)]| {
        Page::new(posts.iter().map(|(ts, score)| post("a", *ts, "alice", *score)).collect())
    };
    let store = ScriptedStore::new(forum_table());
    store
        .push_page(Ok(scored(&[(1, 5), (2, 3)]).with_last_evaluated_key(key("a", 2))))
        .push_page(Ok(scored(&[(3, 9), (4, 1)]).with_last_evaluated_key(key("a", 4))))
        .push_page(Ok(scored(&[(5, 0)])));
    let engine = engine(store);

    let response = engine
        .execute("SELECT * FROM forum WHERE id = 'a' ORDER BY score LIMIT 3")
        .unwrap();
    let scores: Vec<f64> = column(response.items(), "score")
        .into_iter()
        .filter_map(|v| v.as_number())
        .collect();
    assert_eq!(scores, vec![1.0, 3.0, 5.0]);

    let requests = queries(engine.store());
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].limit, Some(3));
    assert_eq!(requests[1].limit, Some(1));
    assert_eq!(engine.store().remaining_pages(), 1);
}

#[test]
fn test_limit_with_filter_does_not_cap_pages() {
    let store = ScriptedStore::new(forum_table());
    store
        .push_page(Ok(page(&[]).with_scanned_count(3).with_last_evaluated_key(key("a", 3))))
        .push_page(Ok(page(&[("a", 5)]).with_last_evaluated_key(key("a", 5))))
        .push_page(Ok(page(&[("a", 7)])));
    let engine = engine(store);

    let response = engine
        .execute("SELECT * FROM forum WHERE id = 'a' AND author = 'alice' LIMIT 1")
        .unwrap();
    assert_eq!(response.items().len(), 1);
    let requests = queries(engine.store());
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.limit.is_none()));
}

#[test]
fn test_scan_limit_bounds_examined_items() {
    let store = ScriptedStore::new(forum_table());
    store
        .push_page(Ok(page(&[("a", 1), ("a", 2)]).with_last_evaluated_key(key("a", 2))))
        .push_page(Ok(page(&[("a", 3)]).with_last_evaluated_key(key("a", 3))))
        .push_page(Ok(page(&[("a", 4)])));
    let engine = engine(store);

    let response = engine
        .execute("SELECT * FROM forum WHERE id = 'a' SCAN LIMIT 3")
        .unwrap();
    assert_eq!(response.items().len(), 3);
    let requests = queries(engine.store());
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].limit, Some(3));
    assert_eq!(requests[1].limit, Some(1));
}

#[test]
fn test_page_size_is_sent_with_every_request() {
    let store = ScriptedStore::new(forum_table());
    store
        .push_page(Ok(page(&[("a", 1), ("a", 2)]).with_last_evaluated_key(key("a", 2))))
        .push_page(Ok(page(&[("a", 3)])));
    let engine = engine_config(store, fast_config().with_page_size(2));

    engine.execute("SELECT * FROM forum WHERE id = 'a'").unwrap();
    let requests = queries(engine.store());
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.limit == Some(2)));
}

#[test]
fn test_count_sums_pages() {
    let store = ScriptedStore::new(forum_table());
    store
        .push_page(Ok(Page {
            count: 3,
            scanned_count: 3,
            last_evaluated_key: Some(key("a", 3)),
            ..Default::default()
        }))
        .push_page(Ok(Page {
            count: 2,
            scanned_count: 2,
            ..Default::default()
        }));
    let engine = engine(store);

    let response = engine.execute("COUNT forum WHERE id = 'a'").unwrap();
    assert_eq!(
        response.output,
        Output::Count {
            count: 5,
            scanned_count: 5
        }
    );
    let requests = queries(engine.store());
    assert!(requests.iter().all(|r| r.count && r.projection.is_none()));
}

#[test]
fn test_hydration_per_page() {
    let store = ScriptedStore::new(forum_table());
    let index_item = |id: &str, ts: i64| {
        ItemBuilder::new()
            .string("id", id)
            .number("ts", ts)
            .string("author", "bob")
            .build()
    };
    store
        .push_page(Ok(Page::new(vec![index_item("a", 2)]).with_last_evaluated_key(index_item("a", 2))))
        .push_page(Ok(Page::new(vec![index_item("b", 3)])))
        .push_batch_get(Ok(BatchGetResponse {
            items: vec![post("a", 2, "bob", 3)],
            ..Default::default()
        }))
        .push_batch_get(Ok(BatchGetResponse {
            items: vec![post("b", 3, "bob", 4)],
            ..Default::default()
        }));
    let engine = engine(store);

    let response = engine.execute("SELECT * FROM forum WHERE author = 'bob'").unwrap();
    assert_eq!(response.items().len(), 2);
    assert!(response.items().iter().all(|item| item.contains_key("body")));

    let kinds: Vec<&str> = engine
        .store()
        .calls()
        .iter()
        .map(|call| match call {
            ScriptedCall::Describe(_) => "describe",
            ScriptedCall::Query(_) => "query",
            ScriptedCall::BatchGet(_) => "batch_get",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["describe", "query", "batch_get", "query", "batch_get"]);
}

#[test]
fn test_unprocessed_keys_are_resubmitted() {
    let store = ScriptedStore::new(forum_table());
    store
        .push_batch_get(Ok(BatchGetResponse {
            items: vec![post("a", 1, "alice", 1)],
            unprocessed_keys: vec![key("a", 2)],
            consumed: Capacity::read(1.0),
        }))
        .push_batch_get(Ok(BatchGetResponse {
            items: vec![post("a", 2, "bob", 1)],
            ..Default::default()
        }));
    let engine = engine(store);

    let response = engine
        .execute("SELECT * FROM forum KEYS IN ('a', 1), ('a', 2)")
        .unwrap();
    assert_eq!(response.items().len(), 2);

    let retried: Vec<Vec<Item>> = engine
        .store()
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            ScriptedCall::BatchGet(request) => Some(request.keys),
            _ => None,
        })
        .collect();
    assert_eq!(retried, vec![vec![key("a", 1), key("a", 2)], vec![key("a", 2)]]);
}

#[test]
fn test_numeric_keys_match_canonical_results() {
    let store = ScriptedStore::new(forum_table());
    store.push_batch_get(Ok(BatchGetResponse {
        items: vec![post("a", 1, "alice", 1), post("a", 1000, "bob", 2)],
        ..Default::default()
    }));
    let engine = engine(store);

    let response = engine
        .execute("SELECT * FROM forum KEYS IN ('a', 1.0), ('a', 1e3)")
        .unwrap();
    assert_eq!(response.items().len(), 2);
    assert_string_eq(&response.items()[0]["author"], "alice");
    assert_string_eq(&response.items()[1]["author"], "bob");
}

#[test]
fn test_failed_page_discards_partial_results() {
    let store = ScriptedStore::new(forum_table());
    store
        .push_page(Ok(page(&[("a", 1)]).with_last_evaluated_key(key("a", 1))))
        .push_page(Err(Error::remote("ValidationException", "bad page")));
    let engine = engine(store);

    let err = engine.execute("SELECT * FROM forum WHERE id = 'a'").unwrap_err();
    assert!(matches!(err, Error::Remote { ref code, .. } if code == "ValidationException"));
    assert_eq!(engine.store().page_requests(), 2);
}

#[test]
fn test_throughput_errors_are_retried_mid_pagination() {
    let store = ScriptedStore::new(forum_table());
    store
        .push_page(Ok(page(&[("a", 1)]).with_last_evaluated_key(key("a", 1))))
        .push_page(Err(Error::ThroughputExceeded("slow down".into())))
        .push_page(Ok(page(&[("a", 2)])));
    let engine = engine(store);

    let response = engine.execute("SELECT * FROM forum WHERE id = 'a'").unwrap();
    assert_eq!(response.items().len(), 2);

    let requests = queries(engine.store());
    assert_eq!(requests.len(), 3);
    // The retry repeats the same request
    assert_eq!(requests[1], requests[2]);
}
