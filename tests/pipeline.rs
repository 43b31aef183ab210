//! End-to-end pipeline scenarios: ingest through the buffer, query through
//! the executor, rotation and archival through the manager.

mod common;

use grepwise::core::{now_ms, LogEntry, LogLevel, PartitionGranularity, TimeRange};
use grepwise::index::plan::{PlanNode, SearchPlan};
use grepwise::query::QueryOutput;
use grepwise::redact::SEARCH_MASK;
use pretty_assertions::assert_eq;

fn entry(ts: i64, level: LogLevel, message: &str, source: &str) -> LogEntry {
    LogEntry::new(ts, level, message, source)
}

#[tokio::test]
async fn ingest_then_find_by_id() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    let ts = now_ms();
    let e = entry(ts, LogLevel::Error, "disk failure imminent", "app.log");
    app.buffer.push(e.clone()).await.unwrap();
    app.buffer.flush().await.unwrap();

    let result = app
        .executor
        .execute(&format!("search id={}", e.id), TimeRange::all())
        .await
        .unwrap();
    let QueryOutput::Entries(entries) = result.output else { panic!() };
    assert_eq!(entries, vec![e]);
}

#[tokio::test]
async fn spl_count_by_level() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    let ts = now_ms();
    for (level, n) in [(LogLevel::Error, 3), (LogLevel::Warn, 2), (LogLevel::Info, 5)] {
        for i in 0..n {
            app.buffer
                .push(entry(ts + i, level, &format!("event {}", i), "app.log"))
                .await
                .unwrap();
        }
    }
    app.buffer.flush().await.unwrap();

    let result = app
        .executor
        .execute("search * | stats count by level", TimeRange::all())
        .await
        .unwrap();
    let QueryOutput::Stats(stats) = result.output else { panic!() };
    assert_eq!(stats.get("ERROR"), Some(&3));
    assert_eq!(stats.get("WARN"), Some(&2));
    assert_eq!(stats.get("INFO"), Some(&5));
}

#[tokio::test]
async fn regex_sort_head_returns_latest() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    let base = now_ms() - 60_000;
    let mut last_id = None;
    for i in 0..10 {
        let e = entry(base + i * 1000, LogLevel::Warn, &format!("timeout {}", i), "app.log");
        if i == 9 {
            last_id = Some(e.id.clone());
        }
        app.buffer.push(e).await.unwrap();
    }
    app.buffer.flush().await.unwrap();

    let result = app
        .executor
        .execute("search /timeout/ | sort -timestamp | head 1", TimeRange::all())
        .await
        .unwrap();
    let QueryOutput::Entries(entries) = result.output else { panic!() };
    assert_eq!(entries.len(), 1);
    assert_eq!(Some(entries[0].id.clone()), last_id);
}

#[tokio::test]
async fn per_source_order_by_timestamp() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    let base = now_ms() - 10_000;
    let first = entry(base, LogLevel::Info, "first event", "ordered.log");
    let second = entry(base + 1000, LogLevel::Info, "second event", "ordered.log");
    app.buffer.push(first.clone()).await.unwrap();
    app.buffer.push(second.clone()).await.unwrap();
    app.buffer.flush().await.unwrap();

    let result = app
        .executor
        .execute("search source=ordered.log | sort timestamp", TimeRange::all())
        .await
        .unwrap();
    let QueryOutput::Entries(entries) = result.output else { panic!() };
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, first.id);
    assert_eq!(entries[1].id, second.id);
}

#[tokio::test]
async fn redaction_and_reveal_fidelity() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    let e = entry(
        now_ms(),
        LogLevel::Info,
        "user=admin password=hunter2",
        "auth.log",
    );
    app.buffer.push(e.clone()).await.unwrap();
    app.buffer.flush().await.unwrap();

    // Search output is masked.
    let result = app
        .executor
        .execute("search password", TimeRange::all())
        .await
        .unwrap();
    let QueryOutput::Entries(entries) = result.output else { panic!() };
    let redacted = app.redactor.redact(&entries[0], SEARCH_MASK);
    assert_eq!(redacted.message, "user=admin password=*****");

    // The stored entry is byte-identical to what was ingested.
    let stored = app.executor.get_by_id(&e.id).unwrap();
    assert_eq!(stored, e);
}

#[tokio::test]
async fn rotation_cap_with_monthly_partitions() {
    let app = common::build(PartitionGranularity::Monthly, 2).await;
    // Three distinct months of 2024, ingested in order.
    let m1 = 1_704_103_200_000; // 2024-01-01
    let m2 = 1_706_781_600_000; // 2024-02-01
    let m3 = 1_709_287_200_000; // 2024-03-01
    for (ts, label) in [(m1, "january"), (m2, "february"), (m3, "march")] {
        let outcome = app
            .manager
            .ingest_batch(vec![entry(ts, LogLevel::Info, label, "app.log")])
            .unwrap();
        assert_eq!(outcome.committed.len(), 1, "{} must commit", label);
    }

    // Cap holds.
    assert!(app.manager.active_count() <= 2);

    // A search spanning all months still returns every entry.
    let plan = SearchPlan::new(PlanNode::All, TimeRange::new(m1 - 1, m3 + 1));
    assert_eq!(app.engine.count(&plan).unwrap(), 3);
}

#[tokio::test]
async fn cache_serves_repeat_queries() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    app.buffer
        .push(entry(now_ms(), LogLevel::Info, "cached entry", "app.log"))
        .await
        .unwrap();
    app.buffer.flush().await.unwrap();
    // Let the post-commit invalidation event drain before caching.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    for _ in 0..3 {
        let result = app
            .executor
            .execute("search cached", TimeRange::all())
            .await
            .unwrap();
        assert_eq!(result.total, 1);
    }
    let stats = app.cache.stats();
    assert_eq!(stats.misses, 1);
    assert!(stats.hits >= 2);
}

#[tokio::test]
async fn writes_invalidate_cached_results() {
    let app = common::build(PartitionGranularity::Daily, 3).await;
    let ts = now_ms();
    app.buffer
        .push(entry(ts, LogLevel::Info, "growing set", "app.log"))
        .await
        .unwrap();
    app.buffer.flush().await.unwrap();

    let result = app
        .executor
        .execute("search growing", TimeRange::all())
        .await
        .unwrap();
    assert_eq!(result.total, 1);

    app.buffer
        .push(entry(ts + 1, LogLevel::Info, "growing set again", "app.log"))
        .await
        .unwrap();
    app.buffer.flush().await.unwrap();

    // The write bumped the partition version, so the repeat query sees the
    // new entry rather than the cached snapshot.
    let result = app
        .executor
        .execute("search growing", TimeRange::all())
        .await
        .unwrap();
    assert_eq!(result.total, 2);
}

#[tokio::test]
async fn query_parser_round_trip_property() {
    use grepwise::query::parse_pipeline;
    let queries = [
        "search error AND NOT timeout",
        "search level=ERROR | where source LIKE \"%app%\" | stats count by level",
        "search \"connection lost\" OR /rese+t/ | sort -timestamp, level | head 10",
    ];
    for q in queries {
        let (first, _) = parse_pipeline(q).unwrap();
        let (second, _) = parse_pipeline(&first.to_string()).unwrap();
        assert_eq!(first, second);
    }
}
