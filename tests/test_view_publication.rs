//! Integration tests for view publications over the in-memory store
//!
//! Key behaviors tested:
//! - Incremental added / changed / removed events for a grouped count
//! - Trailing-edge throttling and in-flight coalescing
//! - Trailing-window retraction driven by the expiry timer alone
//! - Rebuild isolation (old identifiers retracted before new ones appear)
//! - Fail-static execution errors and fatal construction errors
//!
//! All timing tests run on a paused tokio clock; the view clock is anchored
//! to it so window bounds and timers advance together.

#[cfg(test)]
mod view_publication_tests {
    use aggview::store::{MemoryStore, PipelineExecutor, StoreError};
    use aggview::view::options::Clock;
    use aggview::view::pipeline::{Accumulator, Filter, GroupKeySpec, GroupStage, Pipeline};
    use aggview::view::{
        ChannelSink, ConstructionError, OutputId, RebuildTrigger, Record, ResultRow, ViewError, ViewEvent,
        ViewOptions, ViewPublication,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::{sleep, timeout, Duration, Instant};

    const EPOCH: i64 = 1_700_000_000_000;

    /// Executor wrapper counting calls, with switchable failure and latency
    struct TestExecutor {
        inner: Arc<MemoryStore>,
        calls: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
    }

    impl TestExecutor {
        fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
            Self::with_delay(inner, Duration::ZERO)
        }

        fn with_delay(inner: Arc<MemoryStore>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                inner,
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PipelineExecutor for TestExecutor {
        async fn execute(&self, pipeline: &Pipeline) -> Result<Vec<ResultRow>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Database("store unavailable".to_string()));
            }
            self.inner.execute(pipeline).await
        }
    }

    fn count_by(field: &str) -> Pipeline {
        Pipeline::new().group(GroupStage::by(GroupKeySpec::Field(field.to_string())).output("count", Accumulator::Count))
    }

    fn record(key: &str, value: Value) -> Record {
        Record::from_json(key, value)
    }

    fn paused_clock() -> Clock {
        let base = Instant::now();
        Arc::new(move || EPOCH + base.elapsed().as_millis() as i64)
    }

    async fn next_event(rx: &mut UnboundedReceiver<ViewEvent>) -> ViewEvent {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for view event")
            .expect("view event channel closed")
    }

    async fn expect_ready(rx: &mut UnboundedReceiver<ViewEvent>) {
        match next_event(rx).await {
            ViewEvent::Ready { .. } => {}
            other => panic!("expected ready, got {:?}", other),
        }
    }

    fn added(event: ViewEvent) -> (OutputId, Value) {
        match event {
            ViewEvent::Added { id, row, .. } => (id, row),
            other => panic!("expected added, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_grouped_count_scenario() {
        // Test: Added for new groups, Changed when the single output value moves
        let store = Arc::new(MemoryStore::new("events"));
        store.insert(record("1", json!({"ts": 0, "cat": "a"}))).unwrap();
        store.insert(record("2", json!({"ts": 0, "cat": "a"}))).unwrap();

        let (sink, mut rx) = ChannelSink::new();
        let handle = ViewPublication::new(store.clone(), || Some(count_by("cat")))
            .start(sink)
            .await
            .unwrap();

        let (x, row) = added(next_event(&mut rx).await);
        assert_eq!(row, json!({"_id": "a", "count": 2}));
        expect_ready(&mut rx).await;

        store.insert(record("3", json!({"ts": 0, "cat": "b"}))).unwrap();
        let (y, row) = added(next_event(&mut rx).await);
        assert_ne!(x, y);
        assert_eq!(row, json!({"_id": "b", "count": 1}));

        store.remove("1").unwrap();
        match next_event(&mut rx).await {
            ViewEvent::Changed { view, id, row } => {
                assert_eq!(view, "events");
                assert_eq!(id, x);
                assert_eq!(row, json!({"_id": "a", "count": 1}));
            }
            other => panic!("expected changed, got {:?}", other),
        }

        // Removing the last record of a group retracts its row
        store.remove("3").unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            ViewEvent::Removed {
                view: "events".to_string(),
                id: y
            }
        );

        handle.stop().await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            ViewEvent::Removed {
                view: "events".to_string(),
                id: x
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_coalesces_burst_into_one_execution() {
        // Test: 10 changes inside one interval -> exactly one recompute
        let store = Arc::new(MemoryStore::new("events"));
        store.insert(record("0", json!({"cat": "a"}))).unwrap();
        let executor = TestExecutor::new(store.clone());

        let (sink, mut rx) = ChannelSink::new();
        let handle = ViewPublication::with_parts(store.clone(), executor.clone(), Arc::new(|| Some(count_by("cat"))))
            .options(ViewOptions::default().min_recompute_interval_millis(100))
            .start(sink)
            .await
            .unwrap();
        let (x, _) = added(next_event(&mut rx).await);
        expect_ready(&mut rx).await;
        assert_eq!(executor.calls(), 1);

        for i in 1..=10 {
            store.insert(record(&i.to_string(), json!({"cat": "a"}))).unwrap();
        }

        match next_event(&mut rx).await {
            ViewEvent::Changed { id, row, .. } => {
                assert_eq!(id, x);
                assert_eq!(row["count"], json!(11));
            }
            other => panic!("expected changed, got {:?}", other),
        }

        sleep(Duration::from_secs(1)).await;
        assert_eq!(executor.calls(), 2);
        assert!(rx.try_recv().is_err());

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_during_inflight_recompute_run_once_more() {
        // Test: Requests during a slow execution are folded into one rerun
        let store = Arc::new(MemoryStore::new("events"));
        store.insert(record("1", json!({"cat": "a"}))).unwrap();
        let executor = TestExecutor::with_delay(store.clone(), Duration::from_millis(1_000));

        let (sink, mut rx) = ChannelSink::new();
        let handle = ViewPublication::with_parts(store.clone(), executor.clone(), Arc::new(|| Some(count_by("cat"))))
            .options(ViewOptions::default().min_recompute_interval_millis(100))
            .start(sink)
            .await
            .unwrap();
        added(next_event(&mut rx).await);
        expect_ready(&mut rx).await;

        // Throttle fires at +100ms and starts a 1s execution
        store.insert(record("2", json!({"cat": "a"}))).unwrap();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(executor.calls(), 2);

        store.insert(record("3", json!({"cat": "a"}))).unwrap();
        sleep(Duration::from_millis(200)).await;
        store.insert(record("4", json!({"cat": "a"}))).unwrap();

        match next_event(&mut rx).await {
            ViewEvent::Changed { row, .. } => assert_eq!(row["count"], json!(4)),
            other => panic!("expected changed, got {:?}", other),
        }

        sleep(Duration::from_secs(5)).await;
        assert_eq!(executor.calls(), 3);
        assert!(rx.try_recv().is_err());

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_retraction_by_timer_alone() {
        // Test: Row 999ms old in a 1000ms window is retracted within 2ms
        let clock = paused_clock();
        let store = Arc::new(MemoryStore::new("events"));
        store.insert(record("r1", json!({"cat": "a", "ts": EPOCH - 999}))).unwrap();

        let (sink, mut rx) = ChannelSink::new();
        let handle = ViewPublication::new(store.clone(), || Some(count_by("cat")))
            .options(ViewOptions::default().window("ts", 1_000).clock(clock))
            .start(sink)
            .await
            .unwrap();
        let (x, _) = added(next_event(&mut rx).await);
        expect_ready(&mut rx).await;

        let event = timeout(Duration::from_millis(2), rx.recv())
            .await
            .expect("row was not retracted by the expiry timer")
            .unwrap();
        assert_eq!(
            event,
            ViewEvent::Removed {
                view: "events".to_string(),
                id: x
            }
        );

        handle.stop().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_tracks_new_oldest_and_ignores_stale_adds() {
        let clock = paused_clock();
        let store = Arc::new(MemoryStore::new("events"));
        let executor = TestExecutor::new(store.clone());

        let (sink, mut rx) = ChannelSink::new();
        let handle = ViewPublication::with_parts(store.clone(), executor.clone(), Arc::new(|| Some(count_by("cat"))))
            .options(
                ViewOptions::default()
                    .window("ts", 10_000)
                    .min_recompute_interval_millis(100)
                    .clock(clock.clone()),
            )
            .start(sink)
            .await
            .unwrap();
        expect_ready(&mut rx).await;
        assert_eq!(executor.calls(), 1);

        // Test: Already-expired and timestamp-less additions are ignored
        store.insert(record("old", json!({"cat": "a", "ts": clock() - 20_000}))).unwrap();
        store.insert(record("nots", json!({"cat": "a"}))).unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(executor.calls(), 1);
        assert!(rx.try_recv().is_err());

        // Test: In-window addition is published, then expires on time
        let inserted_at = clock();
        store.insert(record("new", json!({"cat": "b", "ts": inserted_at}))).unwrap();
        let (y, row) = added(next_event(&mut rx).await);
        assert_eq!(row, json!({"_id": "b", "count": 1}));

        match next_event(&mut rx).await {
            ViewEvent::Removed { id, .. } => assert_eq!(id, y),
            other => panic!("expected removed, got {:?}", other),
        }
        let elapsed = clock() - inserted_at;
        assert!(elapsed >= 10_000 && elapsed < 10_200, "expired after {}ms", elapsed);

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_on_nested_timestamp_field() {
        // Test: A dotted window field still drives expiry
        let clock = paused_clock();
        let store = Arc::new(MemoryStore::new("events"));
        store.insert(record("r1", json!({"cat": "a", "meta": {"ts": EPOCH - 500}}))).unwrap();

        let (sink, mut rx) = ChannelSink::new();
        let handle = ViewPublication::new(store.clone(), || Some(count_by("cat")))
            .options(ViewOptions::default().window("meta.ts", 1_000).clock(clock.clone()))
            .start(sink)
            .await
            .unwrap();
        let (x, row) = added(next_event(&mut rx).await);
        assert_eq!(row, json!({"_id": "a", "count": 1}));
        expect_ready(&mut rx).await;

        match next_event(&mut rx).await {
            ViewEvent::Removed { id, .. } => assert_eq!(id, x),
            other => panic!("expected removed, got {:?}", other),
        }
        let at = clock() - EPOCH;
        assert!((500..502).contains(&at), "retracted at +{}ms", at);

        handle.stop().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removing_oldest_row_rearms_on_next_oldest() {
        // Test: Deleting the tracked oldest row moves expiry to the next one
        let clock = paused_clock();
        let store = Arc::new(MemoryStore::new("events"));
        store.insert(record("old", json!({"cat": "a", "ts": EPOCH - 800}))).unwrap();
        store.insert(record("mid", json!({"cat": "b", "ts": EPOCH - 400}))).unwrap();

        let (sink, mut rx) = ChannelSink::new();
        let handle = ViewPublication::new(store.clone(), || Some(count_by("cat")))
            .options(
                ViewOptions::default()
                    .window("ts", 1_000)
                    .min_recompute_interval_millis(50)
                    .clock(clock.clone()),
            )
            .start(sink)
            .await
            .unwrap();

        let mut ids = std::collections::HashMap::new();
        for _ in 0..2 {
            let (id, row) = added(next_event(&mut rx).await);
            ids.insert(row["_id"].as_str().unwrap().to_string(), id);
        }
        expect_ready(&mut rx).await;

        sleep(Duration::from_millis(50)).await;
        assert!(store.remove("old").unwrap());

        match next_event(&mut rx).await {
            ViewEvent::Removed { id, .. } => assert_eq!(id, ids["a"]),
            other => panic!("expected removed, got {:?}", other),
        }
        assert!(clock() - EPOCH < 200, "deletion applied at +{}ms", clock() - EPOCH);

        // "mid" leaves the window at +600
        match next_event(&mut rx).await {
            ViewEvent::Removed { id, .. } => assert_eq!(id, ids["b"]),
            other => panic!("expected removed, got {:?}", other),
        }
        let at = clock() - EPOCH;
        assert!((600..602).contains(&at), "retracted at +{}ms", at);

        handle.stop().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuild_retracts_everything_before_new_rows() {
        // Test: Rebuild trigger retracts all old ids before any new Added
        let store = Arc::new(MemoryStore::new("events"));
        store.insert(record("1", json!({"cat": "a", "region": "eu"}))).unwrap();
        store.insert(record("2", json!({"cat": "b", "region": "us"}))).unwrap();
        store.insert(record("3", json!({"cat": "a", "region": "us"}))).unwrap();
        let settings = Arc::new(MemoryStore::new("settings"));

        let group_field = Arc::new(Mutex::new("cat".to_string()));
        let builder_field = group_field.clone();
        let builder = move || {
            let field = builder_field.lock().unwrap().clone();
            Some(count_by(&field))
        };

        let (sink, mut rx) = ChannelSink::new();
        let handle = ViewPublication::new(store.clone(), builder)
            .options(ViewOptions::default().rebuild_trigger(RebuildTrigger::new(settings.clone(), Filter::all())))
            .start(sink)
            .await
            .unwrap();

        let mut old_ids = HashSet::new();
        for _ in 0..2 {
            old_ids.insert(added(next_event(&mut rx).await).0);
        }
        expect_ready(&mut rx).await;

        *group_field.lock().unwrap() = "region".to_string();
        settings.insert(record("group", json!({"field": "region"}))).unwrap();
        settings.insert(record("group", json!({"field": "region", "v": 2}))).unwrap();

        let mut removed = HashSet::new();
        for _ in 0..2 {
            match next_event(&mut rx).await {
                ViewEvent::Removed { id, .. } => removed.insert(id),
                other => panic!("expected removed before any added, got {:?}", other),
            };
        }
        assert_eq!(removed, old_ids);

        let mut regions = HashSet::new();
        for _ in 0..2 {
            let (id, row) = added(next_event(&mut rx).await);
            assert!(!old_ids.contains(&id));
            regions.insert(row["_id"].as_str().unwrap().to_string());
        }
        assert_eq!(regions, HashSet::from(["eu".to_string(), "us".to_string()]));

        // Coalesced trigger events cause no second rebuild
        sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_rebuild_to_no_pipeline_empties_view() {
        let store = Arc::new(MemoryStore::new("events"));
        store.insert(record("1", json!({"cat": "a"}))).unwrap();
        let active = Arc::new(AtomicBool::new(true));
        let builder_active = active.clone();

        let (sink, mut rx) = ChannelSink::new();
        let handle = ViewPublication::new(store.clone(), move || {
            builder_active.load(Ordering::SeqCst).then(|| count_by("cat"))
        })
        .start(sink)
        .await
        .unwrap();
        let (x, _) = added(next_event(&mut rx).await);
        expect_ready(&mut rx).await;

        active.store(false, Ordering::SeqCst);
        handle.rebuild().unwrap();
        match next_event(&mut rx).await {
            ViewEvent::Removed { id, .. } => assert_eq!(id, x),
            other => panic!("expected removed, got {:?}", other),
        }

        // Test: Changes are not observed without a pipeline
        store.insert(record("2", json!({"cat": "b"}))).unwrap();
        sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(store.subscriber_count(), 0);

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_failure_keeps_last_view() {
        // Test: Fail-static, then recovery on the next successful recompute
        let store = Arc::new(MemoryStore::new("events"));
        store.insert(record("1", json!({"cat": "a"}))).unwrap();
        let executor = TestExecutor::new(store.clone());

        let (sink, mut rx) = ChannelSink::new();
        let handle = ViewPublication::with_parts(store.clone(), executor.clone(), Arc::new(|| Some(count_by("cat"))))
            .start(sink)
            .await
            .unwrap();
        let (x, _) = added(next_event(&mut rx).await);
        expect_ready(&mut rx).await;

        executor.fail.store(true, Ordering::SeqCst);
        store.insert(record("2", json!({"cat": "a"}))).unwrap();
        match next_event(&mut rx).await {
            ViewEvent::Failed { error, .. } => assert!(error.contains("store unavailable")),
            other => panic!("expected failed, got {:?}", other),
        }

        executor.fail.store(false, Ordering::SeqCst);
        store.insert(record("3", json!({"cat": "a"}))).unwrap();
        match next_event(&mut rx).await {
            ViewEvent::Changed { id, row, .. } => {
                assert_eq!(id, x);
                assert_eq!(row["count"], json!(3));
            }
            other => panic!("expected changed, got {:?}", other),
        }

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_errors_leave_nothing_running() {
        let store = Arc::new(MemoryStore::new("events"));
        store.insert(record("1", json!({"cat": "a"}))).unwrap();

        // Test: Pipeline without a grouping stage
        let (sink, _rx) = ChannelSink::new();
        let result = ViewPublication::new(store.clone(), || Some(Pipeline::new().matching(Filter::all())))
            .start(sink)
            .await;
        assert!(matches!(
            result,
            Err(ViewError::Construction(ConstructionError::MissingGroupStage))
        ));

        // Test: Forced single value field that the grouping does not produce
        let (sink, _rx) = ChannelSink::new();
        let result = ViewPublication::new(store.clone(), || Some(count_by("cat")))
            .options(ViewOptions::default().single_value_field("total"))
            .start(sink)
            .await;
        assert!(matches!(
            result,
            Err(ViewError::Construction(ConstructionError::UnknownSingleValueField(_)))
        ));

        // Test: Non-positive window width
        let (sink, _rx) = ChannelSink::new();
        let result = ViewPublication::new(store.clone(), || Some(count_by("cat")))
            .options(ViewOptions::default().window("ts", 0))
            .start(sink)
            .await;
        assert!(matches!(
            result,
            Err(ViewError::Construction(ConstructionError::InvalidWindow(_)))
        ));

        // Test: Initial execution failure
        let executor = TestExecutor::new(store.clone());
        executor.fail.store(true, Ordering::SeqCst);
        let (sink, mut rx) = ChannelSink::new();
        let result = ViewPublication::with_parts(store.clone(), executor, Arc::new(|| Some(count_by("cat"))))
            .start(sink)
            .await;
        assert!(matches!(result, Err(ViewError::Execution(_))));
        assert!(rx.try_recv().is_err());

        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transform_and_presence_mode() {
        // Test: Transform shapes emitted rows; multi-output rows never emit Changed
        let store = Arc::new(MemoryStore::new("events"));
        store.insert(record("1", json!({"cat": "a", "amount": 5}))).unwrap();

        let builder = || {
            Some(Pipeline::new().group(
                GroupStage::by(GroupKeySpec::Field("cat".to_string()))
                    .output("count", Accumulator::Count)
                    .output("total", Accumulator::Sum("amount".to_string())),
            ))
        };
        let transform = Arc::new(|row: &ResultRow| json!({"label": row.key, "total": row.values["total"]}));

        let (sink, mut rx) = ChannelSink::new();
        let handle = ViewPublication::new(store.clone(), builder)
            .options(ViewOptions::default().view_name("totals").transform(transform))
            .start(sink)
            .await
            .unwrap();
        assert_eq!(handle.view_name(), "totals");

        let (_, row) = added(next_event(&mut rx).await);
        assert_eq!(row, json!({"label": "a", "total": 5}));
        expect_ready(&mut rx).await;

        store.insert(record("2", json!({"cat": "a", "amount": 7}))).unwrap();
        sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());

        handle.stop().await.unwrap();
    }
}
