/// Throttling tests: delays between store calls under read/write ceilings
use dql_api::store::Page;
use dql_api::Engine;
use dql_core::schema::TableMeta;
use dql_core::throttle::{Capacity, Ceiling, ThrottleConfig, ThrottleController, ThrottleScope};
use dql_core::Item;
use dql_test_utils::*;
use std::time::{Duration, Instant};

fn key(ts: i64) -> Item {
    ItemBuilder::new().string("id", "a").number("ts", ts).build()
}

/// Pages that each report `units` read units consumed
fn scripted(pages: usize, units: f64) -> ScriptedStore {
    let store = ScriptedStore::new(forum_table());
    for i in 0..pages {
        let mut page = Page::new(vec![post("a", i as i64, "alice", 1)]).with_consumed(Capacity::read(units));
        if i + 1 < pages {
            page = page.with_last_evaluated_key(key(i as i64));
        }
        store.push_page(Ok(page));
    }
    store
}

fn timed(engine: &Engine<ScriptedStore>, text: &str) -> Duration {
    let started = Instant::now();
    engine.execute(text).unwrap();
    started.elapsed()
}

#[test]
fn test_statement_ceiling_delays_next_page() {
    let engine = Engine::with_config(scripted(2, 2.4), fast_config()).unwrap();

    // 2.4 units against 2/s leaves 0.2s to drain before the second page
    let elapsed = timed(&engine, "SELECT * FROM forum WHERE id = 'a' THROTTLE (2, *)");
    assert!(elapsed >= Duration::from_millis(150), "elapsed {:?}", elapsed);
    assert_eq!(engine.store().page_requests(), 2);
}

#[test]
fn test_unlimited_clause_overrides_persistent_ceiling() {
    let engine = Engine::with_config(scripted(3, 50.0), fast_config())
        .unwrap()
        .with_throttle({
            let mut config = ThrottleConfig::new();
            config.set_table("forum", Ceiling::parse("1", "1").unwrap());
            config
        });

    let elapsed = timed(&engine, "SELECT * FROM forum WHERE id = 'a' THROTTLE (*, *)");
    assert!(elapsed < Duration::from_secs(5), "elapsed {:?}", elapsed);
    assert_eq!(engine.store().page_requests(), 3);
}

#[test]
fn test_persistent_ceiling_applies_to_engine_calls() {
    let engine = Engine::with_config(scripted(2, 1.1), fast_config()).unwrap();
    engine
        .throttle()
        .update(|c| c.set_table("forum", Ceiling::parse("1", "*").unwrap()));

    let elapsed = timed(&engine, "SELECT * FROM forum WHERE id = 'a'");
    assert!(elapsed >= Duration::from_millis(70), "elapsed {:?}", elapsed);
}

#[test]
fn test_write_ceiling_ignores_reads() {
    let engine = Engine::with_config(scripted(3, 100.0), fast_config()).unwrap();
    let elapsed = timed(&engine, "SELECT * FROM forum WHERE id = 'a' THROTTLE (*, 1)");
    assert!(elapsed < Duration::from_secs(5), "elapsed {:?}", elapsed);
}

#[test]
fn test_percent_ceiling_follows_index_throughput() {
    let meta: TableMeta = forum_table();
    let controller = ThrottleController::default();
    controller.update(|c| c.set_index("forum", "author-index", Ceiling::parse("50%", "*").unwrap()));

    let index = ThrottleScope::new(&meta, Some("author-index"), None);
    assert_eq!(controller.ceilings(&index).read, Some(5.0));

    // Local index calls count against the table, which has no setting
    let local = ThrottleScope::new(&meta, Some("score-index"), None);
    assert_eq!(controller.ceilings(&local).read, None);

    controller.after(&index, Capacity::read(25.0));
    let delay = controller.before(&index).unwrap();
    assert!(delay >= Duration::from_secs(3), "delay {:?}", delay);
    assert!(controller.before(&local).is_none());
}

#[test]
fn test_usage_is_recorded_per_scope() {
    let engine = Engine::with_config(scripted(2, 1.5), fast_config()).unwrap();
    let response = engine.execute("SELECT * FROM forum WHERE id = 'a'").unwrap();
    assert_eq!(response.consumed.get("forum", None), Capacity::read(3.0));
    assert_eq!(response.consumed.total(), Capacity::read(3.0));
    assert_eq!(response.consumed.to_string(), "forum: read 3, write 0");
}
