//! Integration tests for the middleware chain and the bundled middleware.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use storex::middleware::{
    AnalyticsMiddleware, AnalyticsPhase, BatchMiddleware, DebounceMiddleware, DevToolsMiddleware,
    ErrorMiddleware, ErrorReportMiddleware, JsonFilePersister, LoggerMiddleware,
    PerformanceMonitorMiddleware, PersistMiddleware, Persister,
};
use storex::{
    create_reducer, Action, Dispatch, Dispatched, ErrorKind, ErrorReport, Middleware,
    MiddlewareHooks, Reducer, State, StateChange, Store, StoreConfig, StoreError, StoreHandle,
    BATCH_ACTION, GLOBAL_ERROR,
};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Test features
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Counter {
    count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Search {
    query: String,
}

fn counter_reducer() -> Arc<dyn Reducer> {
    create_reducer(Counter::default())
        .on("increment", |s: &Counter, _| Counter { count: s.count + 1 })
        .try_on("explode", |_: &Counter, _| Err(anyhow::anyhow!("boom")))
        .build()
}

fn search_reducer() -> Arc<dyn Reducer> {
    create_reducer(Search::default())
        .try_on("search", |_: &Search, action: &Action| {
            Ok(Search {
                query: action.payload_as()?,
            })
        })
        .build()
}

fn store_with(middleware: Vec<Middleware>) -> Store {
    let store = Store::new(StoreConfig::default()).unwrap();
    store
        .register_root([("counter", counter_reducer()), ("search", search_reducer())])
        .unwrap();
    store.apply_middleware(middleware).unwrap();
    store
}

fn count(state: &State) -> i64 {
    state.get::<Counter>("counter").map_or(0, |c| c.count)
}

fn drain(rx: &mut broadcast::Receiver<StateChange>) -> Vec<StateChange> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn increment() -> Action {
    Action::new("increment", None)
}

fn tracing_middleware(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Middleware {
    Middleware::from_fn(name, move |_store: StoreHandle, next: Dispatch| -> Dispatch {
        let log = log.clone();
        Arc::new(move |action: Action| {
            log.lock().push(format!("{name}:before"));
            let result = next(action);
            log.lock().push(format!("{name}:after"));
            result
        })
    })
}

// ---------------------------------------------------------------------------
// Chain composition
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_listed_middleware_is_outermost() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let store = store_with(vec![
        tracing_middleware("outer", log.clone()),
        tracing_middleware("inner", log.clone()),
    ]);

    store.dispatch(increment()).unwrap();

    assert_eq!(
        *log.lock(),
        vec!["outer:before", "inner:before", "inner:after", "outer:after"]
    );
}

#[tokio::test]
async fn middleware_can_swallow_actions() {
    let gate = Middleware::from_fn("gate", |_store: StoreHandle, next: Dispatch| -> Dispatch {
        Arc::new(move |action: Action| {
            if action.is("increment") {
                return Ok(Dispatched::Held);
            }
            next(action)
        })
    });
    let store = store_with(vec![gate]);

    store.dispatch(increment()).unwrap();
    assert_eq!(count(&store.state()), 0);
}

#[tokio::test]
async fn applied_middleware_appends_to_the_chain() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let store = store_with(vec![tracing_middleware("first", log.clone())]);
    store
        .apply_middleware([tracing_middleware("second", log.clone())])
        .unwrap();

    store.dispatch(increment()).unwrap();
    assert_eq!(log.lock().first().map(String::as_str), Some("first:before"));
    assert_eq!(log.lock().len(), 4);
}

struct FailingHooks;

impl MiddlewareHooks for FailingHooks {
    fn name(&self) -> &str {
        "failing-hooks"
    }

    fn on_next(&self, _action: &Action, _previous: &State) -> anyhow::Result<()> {
        anyhow::bail!("hook exploded")
    }
}

#[tokio::test]
async fn hook_errors_are_reported_without_blocking_dispatch() {
    let store = store_with(vec![Middleware::hooks(FailingHooks)]);
    let mut errors = store.errors();

    store.dispatch(increment()).unwrap();

    assert_eq!(count(&store.state()), 1);
    let report = errors.try_recv().unwrap();
    assert_eq!(report.kind, ErrorKind::Middleware);
    assert!(report.message.contains("hook exploded"));
}

#[derive(Default)]
struct CompletionRecorder {
    counts: Mutex<Vec<i64>>,
}

impl MiddlewareHooks for CompletionRecorder {
    fn name(&self) -> &str {
        "completion-recorder"
    }

    fn on_complete(&self, next: &State, _action: &Action) -> anyhow::Result<()> {
        self.counts.lock().push(count(next));
        Ok(())
    }
}

#[test]
fn on_complete_sees_the_state_its_own_action_committed() {
    let recorder = Arc::new(CompletionRecorder::default());
    let store = store_with(vec![Middleware::Hooks(recorder.clone())]);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..500 {
                    store.dispatch(increment()).unwrap();
                }
            });
        }
    });

    let mut counts = recorder.counts.lock().clone();
    counts.sort_unstable();
    assert_eq!(counts, (1..=4000).collect::<Vec<i64>>());
}

#[tokio::test(start_paused = true)]
async fn on_complete_skips_actions_held_by_inner_middleware() {
    let recorder = Arc::new(CompletionRecorder::default());
    let store = store_with(vec![
        Middleware::Hooks(recorder.clone()),
        Middleware::function(DebounceMiddleware::new(Duration::from_millis(300))),
    ]);

    store.dispatch(increment()).unwrap();
    assert!(recorder.counts.lock().is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(count(&store.state()), 1);
    assert!(recorder.counts.lock().is_empty());
}

#[tokio::test]
async fn logger_observes_without_changing_results() {
    init_tracing();
    let store = store_with(vec![Middleware::hooks(LoggerMiddleware)]);

    store.dispatch(increment()).unwrap();
    store.dispatch(Action::new("unhandled", None)).unwrap();

    assert_eq!(count(&store.state()), 1);
}

// ---------------------------------------------------------------------------
// Error middleware
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reducer_errors_propagate_without_error_middleware() {
    init_tracing();
    let store = store_with(vec![Middleware::hooks(LoggerMiddleware)]);
    let mut errors = store.errors();

    let err = store.dispatch(Action::new("explode", None)).unwrap_err();

    assert!(matches!(err, StoreError::Reducer { .. }));
    assert_eq!(errors.try_recv().unwrap().kind, ErrorKind::Reducer);
}

#[tokio::test]
async fn error_middleware_absorbs_and_dispatches_global_error() {
    let store = store_with(vec![Middleware::function(ErrorMiddleware)]);
    let mut actions = store.actions();

    store.dispatch(Action::new("explode", None)).unwrap();

    let global = actions.try_recv().unwrap();
    assert_eq!(global.action_type(), GLOBAL_ERROR);
    let report = ErrorReport::from_action(&global).unwrap();
    assert_eq!(report.kind, ErrorKind::Reducer);
    assert_eq!(report.action_type.as_deref(), Some("explode"));

    // the store keeps working
    store.dispatch(increment()).unwrap();
    assert_eq!(count(&store.state()), 1);
}

// ---------------------------------------------------------------------------
// Debounce and batch
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn debounce_delivers_only_the_last_action_of_a_burst() {
    let debounce = Arc::new(
        DebounceMiddleware::new(Duration::from_millis(300)).for_types(["search"]),
    );
    let store = store_with(vec![Middleware::Function(debounce.clone())]);
    let mut changes = store.subscribe();

    for query in ["a", "ab", "abc"] {
        store
            .dispatch(Action::new("search", Some(json!(query))))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    assert!(drain(&mut changes).is_empty());
    assert_eq!(debounce.pending(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let changes = drain(&mut changes);
    assert_eq!(changes.len(), 1);
    let search = changes[0].current.get::<Search>("search").unwrap();
    assert_eq!(search.query, "abc");
    assert_eq!(debounce.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn debounce_passes_other_types_through() {
    let store = store_with(vec![Middleware::function(
        DebounceMiddleware::new(Duration::from_millis(300)).for_types(["search"]),
    )]);

    store.dispatch(increment()).unwrap();
    assert_eq!(count(&store.state()), 1);
}

#[tokio::test(start_paused = true)]
async fn batch_window_produces_one_state_change() {
    let batch = Arc::new(BatchMiddleware::new(Duration::from_millis(100)));
    let store = store_with(vec![Middleware::Function(batch.clone())]);
    let mut changes = store.subscribe();

    for _ in 0..3 {
        store.dispatch(increment()).unwrap();
    }
    assert_eq!(batch.buffered(), 3);
    assert_eq!(count(&store.state()), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let changes = drain(&mut changes);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].action.action_type(), BATCH_ACTION);
    assert_eq!(count(&changes[0].current), 3);
    assert_eq!(batch.buffered(), 0);
}

#[tokio::test(start_paused = true)]
async fn full_batch_flushes_immediately() {
    let store = store_with(vec![Middleware::function(BatchMiddleware::with_max_size(
        Duration::from_secs(10),
        Some(2),
    ))]);

    store.dispatch(increment()).unwrap();
    assert_eq!(count(&store.state()), 0);
    store.dispatch(increment()).unwrap();
    assert_eq!(count(&store.state()), 2);
}

#[tokio::test(start_paused = true)]
async fn teardown_drops_pending_debounced_actions() {
    let store = store_with(vec![Middleware::function(DebounceMiddleware::new(
        Duration::from_millis(300),
    ))]);
    store.dispatch(increment()).unwrap();
    store.teardown().unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count(&store.state()), 0);
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryPersister {
    saved: Mutex<Vec<Value>>,
}

#[async_trait]
impl Persister for MemoryPersister {
    async fn persist(&self, snapshot: Value) -> anyhow::Result<()> {
        self.saved.lock().push(snapshot);
        Ok(())
    }
}

#[tokio::test]
async fn persist_writes_selected_features_after_changes() {
    let persister = Arc::new(MemoryPersister::default());
    let store = store_with(vec![Middleware::function(PersistMiddleware::new(
        persister.clone(),
        ["counter"],
    ))]);

    store.dispatch(Action::new("unhandled", None)).unwrap();
    store.dispatch(increment()).unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while persister.saved.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("nothing persisted");

    let saved = persister.saved.lock().clone();
    assert_eq!(saved, vec![json!({"counter": {"count": 1}})]);
}

#[tokio::test(start_paused = true)]
async fn persist_follows_commits_made_by_inner_debounce() {
    let persister = Arc::new(MemoryPersister::default());
    let store = store_with(vec![
        Middleware::function(PersistMiddleware::new(persister.clone(), ["search"])),
        Middleware::function(DebounceMiddleware::new(Duration::from_millis(300))),
    ]);

    store
        .dispatch(Action::new("search", Some(json!("abc"))))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    tokio::time::timeout(Duration::from_secs(1), async {
        while persister.saved.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("debounced commit was not persisted");

    assert_eq!(store.state().get::<Search>("search").unwrap().query, "abc");
    assert_eq!(
        persister.saved.lock().clone(),
        vec![json!({"search": {"query": "abc"}})]
    );
}

#[tokio::test]
async fn devtools_records_transitions() {
    let devtools = Arc::new(DevToolsMiddleware::new(2));
    let store = store_with(vec![Middleware::Function(devtools.clone())]);

    for _ in 0..3 {
        store.dispatch(increment()).unwrap();
    }

    assert_eq!(devtools.len(), 2);
    let history = devtools.history();
    assert_eq!(count(&history[0].previous), 1);
    assert_eq!(count(&history[0].next), 2);
    assert_eq!(devtools.state_at(1).map(|s| count(&s)), Some(3));

    store.teardown().unwrap();
    assert!(devtools.is_empty());
}

#[tokio::test]
async fn performance_monitor_counts_per_type() {
    let perf = Arc::new(PerformanceMonitorMiddleware::new(Duration::from_secs(1)));
    let store = store_with(vec![Middleware::Function(perf.clone())]);

    store.dispatch(increment()).unwrap();
    store.dispatch(increment()).unwrap();
    let _ = store.dispatch(Action::new("explode", None));

    let stats = perf.stats_for("increment").unwrap();
    assert_eq!(stats.count, 2);
    assert!(stats.min <= stats.max);
    assert_eq!(perf.stats_for("explode").map(|s| s.count), Some(1));

    perf.reset();
    assert!(perf.stats().is_empty());
}

#[tokio::test]
async fn analytics_sees_both_phases_of_each_dispatch() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let store = store_with(vec![Middleware::function(AnalyticsMiddleware::new(
        move |event| sink.lock().push(event),
    ))]);

    store.dispatch(increment()).unwrap();
    let _ = store.dispatch(Action::new("explode", None));

    let events = events.lock();
    let phases: Vec<AnalyticsPhase> = events.iter().map(|e| e.phase).collect();
    assert_eq!(
        phases,
        vec![
            AnalyticsPhase::Before,
            AnalyticsPhase::After,
            AnalyticsPhase::Before,
            AnalyticsPhase::Failed,
        ]
    );
    assert_eq!(events[0].session_id, events[1].session_id);
    assert_ne!(events[1].session_id, events[2].session_id);
}

#[test]
fn devtools_entries_match_their_own_transition_under_contention() {
    let devtools = Arc::new(DevToolsMiddleware::new(5000));
    let store = store_with(vec![Middleware::Function(devtools.clone())]);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..500 {
                    store.dispatch(increment()).unwrap();
                }
            });
        }
    });

    assert_eq!(count(&store.state()), 4000);
    let history = devtools.history();
    assert_eq!(history.len(), 4000);
    for entry in &history {
        assert_eq!(entry.action.action_type(), "increment");
        assert_eq!(count(&entry.next), count(&entry.previous) + 1);
    }
}

#[tokio::test]
async fn error_report_keeps_history_and_writes_the_sink() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("errors.json");
    let reports = Arc::new(
        ErrorReportMiddleware::new().with_sink(Arc::new(JsonFilePersister::new(&path))),
    );
    let store = store_with(vec![
        Middleware::Function(reports.clone()),
        Middleware::function(ErrorMiddleware),
    ]);

    store.dispatch(Action::new("explode", None)).unwrap();
    store.dispatch(increment()).unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while !path.exists() || reports.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("error was never recorded");

    let history = reports.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, ErrorKind::Reducer);
    assert_eq!(history[0].action_type.as_deref(), Some("explode"));

    // the file is rewritten after the history is updated
    let written: Vec<ErrorReport> = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(body) = tokio::fs::read(&path).await {
                if let Ok(reports) = serde_json::from_slice(&body) {
                    return reports;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("report file never became readable");
    assert_eq!(written, history);

    store.teardown().unwrap();
    assert_eq!(reports.len(), 1);
}

// ---------------------------------------------------------------------------
// Configured middleware
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn middleware_built_from_config_uses_its_settings() {
    let config = StoreConfig {
        debounce_interval_ms: 50,
        batch_window_ms: 20,
        slow_action_threshold_ms: 0,
        devtools_max_history: 1,
        ..StoreConfig::default()
    };
    let devtools = Arc::new(DevToolsMiddleware::from_config(&config));
    let perf = Arc::new(PerformanceMonitorMiddleware::from_config(&config));
    let store = store_with(vec![
        Middleware::Function(devtools.clone()),
        Middleware::Function(perf.clone()),
        Middleware::function(DebounceMiddleware::from_config(&config).for_types(["search"])),
        Middleware::function(BatchMiddleware::from_config(&config).for_types(["increment"])),
    ]);

    store.dispatch(Action::new("search", Some(json!("q")))).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.state().get::<Search>("search").unwrap().query, "q");

    store.dispatch(increment()).unwrap();
    store.dispatch(increment()).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(count(&store.state()), 2);

    store.dispatch(Action::new("unhandled", None)).unwrap();
    assert_eq!(devtools.len(), 1);
    assert_eq!(devtools.history()[0].action.action_type(), "unhandled");
    assert_eq!(perf.stats_for("unhandled").map(|s| s.count), Some(1));
}
