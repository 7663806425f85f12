//! End-to-end scenarios through the public API.

use std::collections::HashSet;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use veristore::atomic::AtomicError;
use veristore::block::{Block, list_block_ids};
use veristore::config::Config;
use veristore::engine::Engine;
use veristore::model::{Id, Operator, Text, Value};

fn test_config() -> Config {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Config {
        buffer_page_size: 2048,
        transport_interval: Duration::from_millis(1),
        batch_size: 64,
        hung_detection_frequency: Duration::from_secs(60),
        hung_detection_threshold: Duration::from_secs(600),
        allowable_inactivity_threshold: Duration::from_secs(600),
        ..Config::default()
    }
}

fn text(s: &str) -> Value {
    Value::Text(s.into())
}

fn wait_for_transport(engine: &Engine) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.stats().unwrap().pending_writes > 0 {
        assert!(Instant::now() < deadline, "transport did not drain");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn scenario_add_then_select() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    engine.add("name", text("Jeff"), 1).unwrap();
    assert_eq!(engine.select("name", 1).unwrap(), [text("Jeff")].into());

    engine.stop().unwrap();
}

#[test]
fn scenario_add_then_remove_leaves_nothing() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    engine.add("name", text("Jeff"), 1).unwrap();
    engine.remove("name", text("Jeff"), 1).unwrap();
    assert!(engine.select("name", 1).unwrap().is_empty());

    engine.stop().unwrap();
}

#[test]
fn scenario_find_greater_than_over_hundred_records() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    for record in 1..=100u64 {
        engine
            .add("age", Value::Integer(record as i32), record)
            .unwrap();
    }
    let found = engine
        .find("age", Operator::GreaterThan, &[Value::Integer(50)])
        .unwrap();
    assert_eq!(found, (51..=100).collect());

    engine.stop().unwrap();
}

#[test]
fn scenario_search_matches_substring() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    engine.add("name", text("jeff"), 1).unwrap();
    assert_eq!(
        engine.search("name", "ef").unwrap().into_iter().collect::<Vec<Id>>(),
        vec![1]
    );
    assert!(engine.search("name", "xyz").unwrap().is_empty());

    engine.stop().unwrap();
}

#[test]
fn scenario_conflicting_atomic_operations() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    let mut first = engine.start_atomic_operation();
    let mut second = engine.start_atomic_operation();
    let _ = first.select("name", 1).unwrap();
    let _ = second.select("name", 1).unwrap();
    first.add("name", text("first"), 1).unwrap();
    second.add("name", text("second"), 1).unwrap();

    first.commit().unwrap();
    assert!(matches!(second.commit(), Err(AtomicError::Preempted)));
    assert_eq!(engine.select("name", 1).unwrap(), [text("first")].into());

    engine.stop().unwrap();
}

#[test]
fn scenario_thousand_writes_survive_restart_without_duplicates() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    for i in 0..1000u64 {
        engine
            .add("payload", text(&format!("value_{i:06}")), i)
            .unwrap();
    }
    engine.stop().unwrap();
    drop(engine);

    let engine = Engine::open(tmp.path(), test_config()).unwrap();
    wait_for_transport(&engine);

    for i in 0..1000u64 {
        assert!(
            engine
                .verify("payload", &text(&format!("value_{i:06}")), i)
                .unwrap(),
            "write {i} lost across restart"
        );
    }
    engine.stop().unwrap();
    drop(engine);

    // No version appears twice in the primary blocks on disk.
    let primary_dir = tmp.path().join("db").join("cpb");
    let mut versions = HashSet::new();
    for id in list_block_ids(&primary_dir).unwrap() {
        let block: Block<Id, Text, Value> =
            Block::open(&primary_dir, id, usize::MAX).unwrap();
        for revision in block.revisions().unwrap() {
            assert!(
                versions.insert(revision.version()),
                "version {} duplicated across blocks",
                revision.version()
            );
        }
    }
    assert!(versions.len() >= 1000);
}

#[test]
fn scenario_transaction_commit_is_all_or_nothing() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), test_config()).unwrap();

    let tx = engine.start_transaction();
    tx.add("name", text("jeff"), 1).unwrap();
    tx.add("spouse", Value::Link(2), 1).unwrap();
    tx.add("name", text("ashleah"), 2).unwrap();

    assert!(engine.describe(1).unwrap().is_empty());
    tx.commit().unwrap();

    assert_eq!(
        engine.describe(1).unwrap(),
        ["name".to_string(), "spouse".to_string()].into()
    );
    assert!(engine.verify("name", &text("ashleah"), 2).unwrap());

    engine.stop().unwrap();
}
