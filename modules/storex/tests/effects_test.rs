//! Integration tests for effects: dispatch loop, error isolation, cancellation.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use storex::{
    create_effect, create_reducer, Action, ActionStreamExt, EffectErrorPolicy, Effect,
    EffectsModule, ErrorKind, ErrorReport, Reducer, State, StateChange, Store, StoreConfig,
};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Test feature
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Counter {
    count: i64,
    loading: bool,
}

fn counter_reducer() -> Arc<dyn Reducer> {
    create_reducer(Counter::default())
        .on("loadCount", |s: &Counter, _| Counter {
            loading: true,
            ..s.clone()
        })
        .try_on("loadCountSuccess", |_: &Counter, action: &Action| {
            Ok(Counter {
                count: action.payload_as()?,
                loading: false,
            })
        })
        .build()
}

fn store_with_policy(policy: EffectErrorPolicy) -> Store {
    let config = StoreConfig {
        effect_error_policy: policy,
        ..StoreConfig::default()
    };
    let store = Store::new(config).unwrap();
    store.register_root([("counter", counter_reducer())]).unwrap();
    store
}

fn module(effects: impl EffectsModule + 'static) -> Arc<dyn EffectsModule> {
    Arc::new(effects)
}

async fn wait_for_state<F>(rx: &mut broadcast::Receiver<StateChange>, done: F) -> State
where
    F: Fn(&State) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let change = rx.recv().await.expect("state stream closed");
            if done(&change.current) {
                return change.current;
            }
        }
    })
    .await
    .expect("timed out waiting for state")
}

async fn wait_for_action(rx: &mut broadcast::Receiver<Action>, action_type: &str) -> Action {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let action = rx.recv().await.expect("action stream closed");
            if action.is(action_type) {
                return action;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {action_type}"))
}

// ---------------------------------------------------------------------------
// Test modules
// ---------------------------------------------------------------------------

struct CounterEffects;

impl EffectsModule for CounterEffects {
    fn name(&self) -> &str {
        "counter"
    }

    fn effects(&self) -> Vec<Effect> {
        vec![create_effect("load_count", |ctx| {
            ctx.actions.of_type("loadCount").then(|_| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, anyhow::Error>(Action::new("loadCountSuccess", Some(json!(42))))
            })
        })]
    }
}

/// `flaky` fails on "fail" and answers "poke"; `steady` answers "ping".
struct MixedEffects;

impl EffectsModule for MixedEffects {
    fn name(&self) -> &str {
        "mixed"
    }

    fn effects(&self) -> Vec<Effect> {
        vec![
            create_effect("flaky", |ctx| {
                ctx.actions.of_types(&["fail", "poke"]).map(|action| {
                    if action.is("fail") {
                        Err(anyhow::anyhow!("flaky gave up"))
                    } else {
                        Ok(Action::new("poked", None))
                    }
                })
            }),
            create_effect("steady", |ctx| {
                ctx.actions
                    .of_type("ping")
                    .map(|_| Ok::<_, anyhow::Error>(Action::new("pong", None)))
            }),
        ]
    }
}

struct SilentEffects;

impl EffectsModule for SilentEffects {
    fn name(&self) -> &str {
        "silent"
    }

    fn effects(&self) -> Vec<Effect> {
        vec![create_effect("echo", |ctx| {
            ctx.actions
                .of_type("ping")
                .map(|_| Ok::<_, anyhow::Error>(Action::new("echo", None)))
        })
        .no_dispatch()]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn effect_result_is_dispatched() {
    let store = store_with_policy(EffectErrorPolicy::Continue);
    let started = store.register_effects(&[module(CounterEffects)]).unwrap();
    assert_eq!(started, vec!["counter".to_string()]);
    let mut changes = store.subscribe();

    store.dispatch(Action::new("loadCount", None)).unwrap();
    assert!(store.state().get::<Counter>("counter").unwrap().loading);

    let state = wait_for_state(&mut changes, |s| {
        s.get::<Counter>("counter").is_some_and(|c| c.count == 42)
    })
    .await;
    assert!(!state.get::<Counter>("counter").unwrap().loading);
}

#[tokio::test]
async fn duplicate_module_is_skipped() {
    let store = store_with_policy(EffectErrorPolicy::Continue);
    store.register_effects(&[module(CounterEffects)]).unwrap();

    let started = store.register_effects(&[module(CounterEffects)]).unwrap();
    assert!(started.is_empty());
    assert_eq!(store.effects().modules(), vec!["counter".to_string()]);
}

#[tokio::test]
async fn continue_policy_keeps_the_failing_effect_alive() {
    let store = store_with_policy(EffectErrorPolicy::Continue);
    store.register_effects(&[module(MixedEffects)]).unwrap();
    let mut errors = store.errors();
    let mut actions = store.actions();

    store.dispatch(Action::new("fail", None)).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.kind, ErrorKind::Effect);
    assert!(report.message.contains("mixed.flaky"));

    store.dispatch(Action::new("poke", None)).unwrap();
    wait_for_action(&mut actions, "poked").await;
    assert!(store.effects().is_running("mixed", "flaky"));
}

#[tokio::test]
async fn stop_policy_only_stops_the_failing_effect() {
    let store = store_with_policy(EffectErrorPolicy::Stop);
    store.register_effects(&[module(MixedEffects)]).unwrap();
    let mut actions = store.actions();

    store.dispatch(Action::new("fail", None)).unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while store.effects().is_running("mixed", "flaky") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("flaky effect kept running");

    store.dispatch(Action::new("ping", None)).unwrap();
    wait_for_action(&mut actions, "pong").await;
    assert!(store.effects().is_running("mixed", "steady"));
}

#[tokio::test]
async fn effect_errors_can_dispatch_global_error() {
    let config = StoreConfig {
        dispatch_global_error: true,
        ..StoreConfig::default()
    };
    let store = Store::new(config).unwrap();
    store.register_effects(&[module(MixedEffects)]).unwrap();
    let mut actions = store.actions();

    store.dispatch(Action::new("fail", None)).unwrap();
    let global = wait_for_action(&mut actions, storex::GLOBAL_ERROR).await;
    let report = ErrorReport::from_action(&global).unwrap();
    assert_eq!(report.kind, ErrorKind::Effect);
}

#[tokio::test]
async fn cancelled_effect_stops_while_siblings_run() {
    let store = store_with_policy(EffectErrorPolicy::Continue);
    store.register_effects(&[module(MixedEffects)]).unwrap();
    let mut actions = store.actions();

    assert!(store.cancel_effect("mixed", "steady"));
    assert!(!store.cancel_effect("mixed", "steady"));
    assert!(!store.effects().is_running("mixed", "steady"));

    store.dispatch(Action::new("ping", None)).unwrap();
    store.dispatch(Action::new("poke", None)).unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(2), async {
        let mut seen = Vec::new();
        loop {
            let action = actions.recv().await.expect("action stream closed");
            seen.push(action.action_type().to_string());
            if action.is("poked") {
                return seen;
            }
        }
    })
    .await
    .expect("flaky effect never answered");
    assert!(!seen.iter().any(|ty| ty == "pong"));
}

#[tokio::test]
async fn no_dispatch_effect_emits_nothing() {
    let store = store_with_policy(EffectErrorPolicy::Continue);
    store.register_effects(&[module(SilentEffects)]).unwrap();
    let mut actions = store.actions();

    store.dispatch(Action::new("ping", None)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen: Vec<String> = std::iter::from_fn(|| actions.try_recv().ok())
        .map(|a| a.action_type().to_string())
        .collect();
    assert_eq!(seen, vec!["ping".to_string()]);
}

#[tokio::test]
async fn unregistered_module_stops_all_its_effects() {
    let store = store_with_policy(EffectErrorPolicy::Continue);
    store.register_effects(&[module(MixedEffects)]).unwrap();

    assert_eq!(store.unregister_effects(&["mixed", "missing"]), 1);
    assert!(store.effects().modules().is_empty());
    assert!(!store.effects().is_running("mixed", "flaky"));
}

#[tokio::test]
async fn teardown_cancels_effects() {
    let store = store_with_policy(EffectErrorPolicy::Continue);
    store.register_effects(&[module(CounterEffects)]).unwrap();

    store.teardown().unwrap();

    assert!(store.effects().modules().is_empty());
    assert!(store.register_effects(&[module(CounterEffects)]).is_err());
}

#[test]
fn registering_effects_needs_a_runtime() {
    let store = Store::new(StoreConfig::default()).unwrap();
    let err = store.register_effects(&[module(CounterEffects)]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}
