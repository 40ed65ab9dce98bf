/// End-to-end statement tests against the in-memory store
use dql_api::{Engine, Error, Output, Value};
use dql_core::config::EngineConfig;
use dql_core::schema::{IndexProjection, Throughput};
use dql_test_utils::*;

fn items(engine: &Engine<MemoryStore>, text: &str) -> Vec<dql_core::Item> {
    match engine.execute(text).unwrap().output {
        Output::Items(items) => items,
        other => panic!("expected items from '{}', got {:?}", text, other),
    }
}

fn numbers(items: &[dql_core::Item], attribute: &str) -> Vec<f64> {
    column(items, attribute)
        .into_iter()
        .filter_map(|v| v.as_number())
        .collect()
}

fn written(engine: &Engine<MemoryStore>, text: &str) -> (usize, Vec<dql_core::Item>) {
    match engine.execute(text).unwrap().output {
        Output::Written { count, items } => (count, items),
        other => panic!("expected a write result from '{}', got {:?}", text, other),
    }
}

#[test]
fn test_select_by_hash_key() {
    let engine = forum_engine();
    let result = items(&engine, "SELECT * FROM forum WHERE id = 'a'");
    assert_eq!(numbers(&result, "ts"), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    assert!(result.iter().all(|item| item.contains_key("body")));
    assert_eq!(engine.store().call_count("query"), 1);
}

#[test]
fn test_select_desc_limit() {
    let engine = forum_engine();
    let result = items(&engine, "SELECT ts, title FROM forum WHERE id = 'a' DESC LIMIT 2");
    assert_eq!(numbers(&result, "ts"), vec![5.0, 4.0]);
    for item in &result {
        assert_eq!(item.len(), 2);
    }
}

#[test]
fn test_range_condition_and_filter() {
    let engine = forum_engine();
    let result = items(&engine, "SELECT * FROM forum WHERE id = 'a' AND ts BETWEEN 2 AND 4 AND author = 'bob'");
    assert_eq!(numbers(&result, "ts"), vec![2.0, 4.0]);

    let query = &engine.store().queries()[0];
    assert!(query.key_condition.contains("BETWEEN"));
    assert!(query.filter.is_some());
}

#[test]
fn test_local_index_query_hydrates() {
    let engine = forum_engine();
    let result = items(&engine, "SELECT * FROM forum WHERE id = 'a' AND score > 4");

    // score-index is keys-only, so full items come from batch gets in index order
    assert_eq!(numbers(&result, "score"), vec![5.0, 7.0, 9.0]);
    assert!(result.iter().all(|item| item.contains_key("body")));
    assert_eq!(engine.store().queries()[0].index.as_deref(), Some("score-index"));
    assert!(engine.store().call_count("batch_get") >= 1);
}

#[test]
fn test_global_index_projection_avoids_hydration() {
    let engine = forum_engine();
    let result = items(&engine, "SELECT title FROM forum WHERE author = 'alice'");
    assert_eq!(result.len(), 4);
    assert!(result.iter().all(|item| item.len() == 1 && item.contains_key("title")));
    assert_eq!(engine.store().call_count("batch_get"), 0);

    let result = items(&engine, "SELECT body FROM forum WHERE author = 'bob'");
    let bodies: Vec<&str> = column(&result, "body")
        .into_iter()
        .filter_map(|v| v.as_string())
        .collect();
    assert_eq!(bodies, vec!["body of b 1", "body of a 2", "body of b 3", "body of a 4"]);
    assert!(engine.store().call_count("batch_get") >= 1);
}

#[test]
fn test_count() {
    let engine = forum_engine();
    match engine.execute("COUNT forum WHERE id = 'a'").unwrap().output {
        Output::Count { count, scanned_count } => {
            assert_eq!(count, 5);
            assert_eq!(scanned_count, 5);
        }
        other => panic!("expected a count, got {:?}", other),
    }

    match engine
        .execute("SELECT count(*) FROM forum WHERE id = 'a' AND score >= 5")
        .unwrap()
        .output
    {
        Output::Count { count, .. } => assert_eq!(count, 3),
        other => panic!("expected a count, got {:?}", other),
    }
}

#[test]
fn test_unindexed_query_requires_scan() {
    let engine = forum_engine();
    let err = engine.execute("SELECT * FROM forum WHERE score > 3").unwrap_err();
    assert!(matches!(err, Error::UnindexedQuery(_)));
    assert_eq!(engine.store().call_count("scan"), 0);

    let result = items(&engine, "SCAN forum FILTER score > 3");
    assert_eq!(result.len(), 5);

    let engine = engine_with(forum_store(), fast_config().with_allow_scan(true));
    let result = items(&engine, "SELECT * FROM forum WHERE score > 3");
    assert_eq!(result.len(), 5);
    assert_eq!(engine.store().call_count("scan"), 1);
}

#[test]
fn test_order_by_non_key_attribute() {
    let engine = forum_engine();
    let result = items(&engine, "SELECT * FROM forum WHERE id = 'a' ORDER BY score DESC");
    assert_eq!(numbers(&result, "score"), vec![9.0, 7.0, 5.0, 3.0, 1.0]);

    // LIMIT bounds the rows read; only those are sorted
    let result = items(&engine, "SELECT * FROM forum WHERE id = 'a' ORDER BY score LIMIT 2");
    assert_eq!(numbers(&result, "score"), vec![3.0, 5.0]);
    assert_eq!(engine.store().queries().last().unwrap().limit, Some(2));

    let strict = engine_with(forum_store(), fast_config().with_strict_ordering(true));
    let err = strict
        .execute("SELECT * FROM forum WHERE id = 'a' ORDER BY score LIMIT 2")
        .unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)));
}

#[test]
fn test_keys_in() {
    let engine = forum_engine();
    let result = items(
        &engine,
        "SELECT * FROM forum KEYS IN ('b', 2), ('a', 1), ('zz', 9)",
    );
    assert_eq!(numbers(&result, "ts"), vec![2.0, 1.0]);
    assert_eq!(engine.store().call_count("batch_get"), 1);
    assert_eq!(engine.store().call_count("query"), 0);

    let result = items(&engine, "SELECT * FROM forum KEYS IN ('a', 1), ('a', 3) FILTER score > 6");
    assert_eq!(numbers(&result, "ts"), vec![3.0]);

    let err = engine.execute("SELECT * FROM forum KEYS IN ('a')").unwrap_err();
    assert!(matches!(err, Error::SchemaMismatch(_)));
}

#[test]
fn test_insert_single_and_batch() {
    let engine = forum_engine();
    let (count, _) = written(
        &engine,
        "INSERT INTO forum (id, ts, author, score) VALUES ('c', 1, 'carol', 3)",
    );
    assert_eq!(count, 1);
    assert_eq!(engine.store().call_count("put_item"), 1);

    let (count, _) = written(
        &engine,
        "INSERT INTO forum (id, ts, author) VALUES ('c', 2, 'carol'), ('c', 3, 'dave')",
    );
    assert_eq!(count, 2);
    assert_eq!(engine.store().call_count("batch_write"), 1);
    assert_eq!(items(&engine, "SELECT * FROM forum WHERE id = 'c'").len(), 3);

    let err = engine
        .execute("INSERT INTO forum (id, author) VALUES ('d', 'x')")
        .unwrap_err();
    assert!(matches!(err, Error::SchemaMismatch(_)));
    let err = engine
        .execute("INSERT INTO forum (id, ts) VALUES ('d', 'not a number')")
        .unwrap_err();
    assert!(matches!(err, Error::SchemaMismatch(_)));
}

#[test]
fn test_insert_splits_into_write_batches() {
    let engine = engine_with(forum_store(), fast_config().with_batch_write_size(2));
    let (count, _) = written(
        &engine,
        "INSERT INTO forum ITEMS {id: 'e', ts: 1}, {id: 'e', ts: 2}, {id: 'e', ts: 3}, {id: 'e', ts: 4}, {id: 'e', ts: 5}",
    );
    assert_eq!(count, 5);
    assert_eq!(engine.store().call_count("batch_write"), 3);
}

#[test]
fn test_update_returns() {
    let engine = forum_engine();
    let (count, returned) = written(
        &engine,
        "UPDATE forum SET score = score + 10 WHERE id = 'a' AND ts = 1 RETURNS ALL NEW",
    );
    assert_eq!(count, 1);
    assert_eq!(returned.len(), 1);
    assert_number_eq(&returned[0]["score"], "15");
    assert!(returned[0].contains_key("body"));

    let (_, returned) = written(
        &engine,
        "UPDATE forum SET score = 0 REMOVE body WHERE id = 'a' AND ts = 1 RETURNS UPDATED OLD",
    );
    assert_number_eq(&returned[0]["score"], "15");
    assert!(returned[0].contains_key("body"));
    assert!(!returned[0].contains_key("title"));

    let key = ItemBuilder::new().string("id", "a").number("ts", 1).build();
    let stored = engine.store().get("forum", &key).unwrap();
    assert_number_eq(&stored["score"], "0");
    assert!(!stored.contains_key("body"));
}

#[test]
fn test_update_every_matching_item() {
    let engine = forum_engine();
    let (count, returned) = written(&engine, "UPDATE forum SET flagged = TRUE WHERE id = 'b'");
    assert_eq!(count, 3);
    assert!(returned.is_empty());
    assert_eq!(engine.store().call_count("update_item"), 3);

    let flagged = engine
        .store()
        .items("forum")
        .into_iter()
        .filter(|item| item.get("flagged") == Some(&Value::Bool(true)))
        .count();
    assert_eq!(flagged, 3);

    let (count, _) = written(&engine, "UPDATE forum SET flagged = TRUE WHERE id = 'nobody'");
    assert_eq!(count, 0);
}

#[test]
fn test_update_through_keys_in_never_creates_items() {
    let engine = forum_engine();
    let (count, _) = written(&engine, "UPDATE forum SET n = 1 WHERE KEYS IN ('a', 1), ('zz', 1)");
    assert_eq!(count, 1);
    let key = ItemBuilder::new().string("id", "zz").number("ts", 1).build();
    assert!(engine.store().get("forum", &key).is_none());
}

#[test]
fn test_delete() {
    let engine = forum_engine();
    let (count, _) = written(&engine, "DELETE FROM forum WHERE id = 'b' AND ts > 1");
    assert_eq!(count, 2);
    assert_eq!(engine.store().call_count("batch_write"), 1);
    assert_eq!(engine.store().items("forum").len(), 6);

    let (count, _) = written(&engine, "DELETE FROM forum WHERE id = 'b'");
    assert_eq!(count, 1);
    assert_eq!(engine.store().call_count("delete_item"), 1);

    let (count, _) = written(&engine, "DELETE FROM forum WHERE KEYS IN ('a', 1), ('a', 2)");
    assert_eq!(count, 2);
    assert_eq!(engine.store().items("forum").len(), 3);

    // Numeric keys match however the literal is written
    let (count, _) = written(&engine, "DELETE FROM forum WHERE KEYS IN ('a', 3.0), ('a', 0.4e1)");
    assert_eq!(count, 2);
    assert_eq!(engine.store().items("forum").len(), 1);
}

#[test]
fn test_create_and_drop_table() {
    let engine = engine_with(MemoryStore::new(), fast_config());
    let create = "CREATE TABLE users (email STRING HASH KEY, age NUMBER, THROUGHPUT (5, 5)) \
                  GLOBAL INDEX ('age-index', age)";
    assert!(matches!(engine.execute(create).unwrap().output, Output::Done(_)));

    let meta = engine.describe("users").unwrap();
    assert_eq!(meta.throughput, Throughput::new(5, 5));
    assert_eq!(meta.global_indexes[0].name, "age-index");

    assert!(matches!(engine.execute(create).unwrap_err(), Error::AlreadyExists(_)));
    let again = engine
        .execute("CREATE TABLE IF NOT EXISTS users (email STRING HASH KEY)")
        .unwrap();
    assert!(matches!(again.output, Output::Done(ref msg) if msg.contains("already exists")));

    engine.execute("DROP TABLE users").unwrap();
    assert!(matches!(engine.describe("users").unwrap_err(), Error::NotFound(_)));
    assert!(matches!(engine.execute("DROP TABLE users").unwrap_err(), Error::NotFound(_)));
    engine.execute("DROP TABLE IF EXISTS users").unwrap();
}

#[test]
fn test_create_rejects_invalid_tables() {
    let engine = engine_with(MemoryStore::new(), fast_config());
    let err = engine.execute("CREATE TABLE x (id STRING HASH KEY)").unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(engine.store().call_count("create_table"), 0);
}

#[test]
fn test_alter_throughput() {
    let engine = forum_engine();
    engine.execute("ALTER TABLE forum SET THROUGHPUT (20, *)").unwrap();
    assert_eq!(engine.describe("forum").unwrap().throughput, Throughput::new(20, 5));

    engine
        .execute("ALTER TABLE forum SET INDEX 'author-index' THROUGHPUT (*, 8)")
        .unwrap();
    let meta = engine.describe("forum").unwrap();
    assert_eq!(meta.global_index("author-index").unwrap().throughput, Throughput::new(10, 8));

    let err = engine
        .execute("ALTER TABLE forum SET INDEX 'score-index' THROUGHPUT (1, 1)")
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    let err = engine
        .execute("ALTER TABLE forum SET INDEX 'nope-index' THROUGHPUT (1, 1)")
        .unwrap_err();
    assert!(matches!(err, Error::IndexNotFound { .. }));
}

#[test]
fn test_alter_create_and_drop_index() {
    let engine = forum_engine();
    engine
        .execute("ALTER TABLE forum CREATE GLOBAL KEYS INDEX ('title-index', title STRING)")
        .unwrap();
    let meta = engine.describe("forum").unwrap();
    let index = meta.global_index("title-index").unwrap();
    assert_eq!(index.projection, IndexProjection::KeysOnly);

    let result = items(&engine, "SELECT * FROM forum WHERE title = 'bob post 2'");
    assert_eq!(result.len(), 1);
    assert_string_eq(&result[0]["body"], "body of a 2");

    let err = engine
        .execute("ALTER TABLE forum CREATE GLOBAL INDEX ('title-index', title STRING)")
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));

    engine.execute("ALTER TABLE forum DROP INDEX 'title-index'").unwrap();
    assert!(engine.describe("forum").unwrap().global_index("title-index").is_none());
    assert!(matches!(
        engine.execute("ALTER TABLE forum DROP INDEX 'title-index'").unwrap_err(),
        Error::IndexNotFound { .. }
    ));
    engine
        .execute("ALTER TABLE forum DROP INDEX 'title-index' IF EXISTS")
        .unwrap();
}

#[test]
fn test_dump_schema_round_trip() {
    let engine = forum_engine();
    let lines = match engine.execute("DUMP SCHEMA").unwrap().output {
        Output::Lines(lines) => lines,
        other => panic!("expected lines, got {:?}", other),
    };
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("CREATE TABLE forum"));
    assert!(lines[1].starts_with("CREATE TABLE things"));

    let copy = engine_with(MemoryStore::new(), fast_config());
    copy.execute_all(&lines.join("\n")).unwrap();
    assert_eq!(*copy.describe("forum").unwrap(), forum_table());
    assert_eq!(*copy.describe("things").unwrap(), simple_table());
}

#[test]
fn test_explain_issues_no_reads() {
    let engine = forum_engine();
    let lines = match engine
        .execute("EXPLAIN SELECT * FROM forum WHERE id = 'a' AND score > 4 LIMIT 2")
        .unwrap()
        .output
    {
        Output::Lines(lines) => lines,
        other => panic!("expected lines, got {:?}", other),
    };
    assert!(lines[0].starts_with("Query(table=forum, index=score-index"));
    assert_eq!(lines[1], "BatchGetItem(table=forum, keys=per page)");
    assert_eq!(lines.last().map(String::as_str), Some("Limit(2)"));
    assert_eq!(engine.store().call_count("query"), 0);

    let lines = match engine
        .execute("EXPLAIN DELETE FROM forum WHERE id = 'a'")
        .unwrap()
        .output
    {
        Output::Lines(lines) => lines,
        other => panic!("expected lines, got {:?}", other),
    };
    assert!(lines.last().unwrap().starts_with("BatchWriteItem(table=forum, deletes=per key"));
    assert_eq!(engine.store().items("forum").len(), 8);
}

#[test]
fn test_analyze_reports_capacity() {
    let engine = forum_engine();
    let response = engine
        .execute("ANALYZE SELECT * FROM forum WHERE id = 'a'")
        .unwrap();
    let Output::Capacity(usage) = &response.output else {
        panic!("expected capacity, got {:?}", response.output);
    };
    assert_eq!(usage.get("forum", None).read, 5.0);
    assert_eq!(response.consumed, *usage);

    let response = engine
        .execute("ANALYZE SELECT title FROM forum WHERE author = 'bob'")
        .unwrap();
    assert_eq!(response.consumed.get("forum", Some("author-index")).read, 4.0);
    assert!(response.consumed.get("forum", None).is_zero());
}

#[test]
fn test_load_uses_installed_loader() {
    let engine = forum_engine();
    let err = engine.execute("LOAD 'posts.json' INTO forum").unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));

    let engine = forum_engine().with_loader(|file| {
        assert_eq!(file, "posts.json");
        Ok(vec![post("l", 1, "lee", 1), post("l", 2, "lee", 2)])
    });
    let (count, _) = written(&engine, "LOAD 'posts.json' INTO forum THROTTLE (*, 100)");
    assert_eq!(count, 2);
    assert_eq!(items(&engine, "SELECT * FROM forum WHERE id = 'l'").len(), 2);

    let count = engine
        .load_items("forum", vec![post("m", 1, "mo", 1)], None)
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn test_execute_runs_every_statement() {
    let engine = forum_engine();
    let responses = engine
        .execute_all(
            "INSERT INTO forum (id, ts) VALUES ('z', 1);\n\
             -- read it back\n\
             SELECT * FROM forum WHERE id = 'z';",
        )
        .unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].statement, "INSERT");
    assert_eq!(responses[1].items().len(), 1);

    let last = engine
        .execute("DELETE FROM forum WHERE id = 'z'; COUNT forum WHERE id = 'z'")
        .unwrap();
    assert!(matches!(last.output, Output::Count { count: 0, .. }));
}

#[test]
fn test_consistent_reads() {
    let engine = forum_engine();
    let result = items(&engine, "SELECT CONSISTENT * FROM forum WHERE id = 'a'");
    assert_eq!(result.len(), 5);
    assert!(engine.store().queries()[0].consistent);

    let err = engine
        .execute("SELECT CONSISTENT * FROM forum WHERE author = 'bob' USING 'author-index'")
        .unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)));
}

#[test]
fn test_using_index_that_cannot_serve() {
    let engine = forum_engine();
    let err = engine
        .execute("SELECT * FROM forum WHERE id = 'a' USING 'author-index'")
        .unwrap_err();
    assert!(matches!(err, Error::InvalidIndex(_)));
}

#[test]
fn test_metadata_is_cached() {
    let engine = forum_engine();
    items(&engine, "SELECT * FROM forum WHERE id = 'a'");
    items(&engine, "SELECT * FROM forum WHERE id = 'b'");
    assert_eq!(engine.store().call_count("describe_table"), 1);
    assert_eq!(engine.cache().tables(), vec!["forum".to_string()]);
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = EngineConfig::default().with_batch_write_size(26);
    assert!(matches!(
        Engine::with_config(MemoryStore::new(), config),
        Err(Error::InvalidArgument(_))
    ));
}
