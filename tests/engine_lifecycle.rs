// tests/engine_lifecycle.rs

use std::collections::BTreeMap;
use std::error::Error;
use std::time::Duration;

use depengine::{Context, Engine, EngineError, Manifold, NodeState, Worker};
use depengine_test_utils::builders::{Counter, RecordingManifold, fast_config};
use depengine_test_utils::recording::{Recorder, RecordingWorker};
use depengine_test_utils::{init_tracing, wait_all_started, wait_for_state, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn dependent_sees_new_value_after_input_is_reinstalled() -> TestResult {
    with_timeout(async {
        init_tracing();
        let recorder = Recorder::new();
        let engine = Engine::new(fast_config());

        engine
            .install("a", RecordingManifold::new(&recorder).base(1).build())
            .await?;
        engine
            .install("b", RecordingManifold::new(&recorder).input("a").build())
            .await?;
        wait_all_started(&engine).await;

        assert_eq!(recorder.starts_of("b")[0].inputs["a"], 1);

        engine.uninstall("a").await?;
        wait_for_state(&engine, "a", NodeState::Uninstalled).await;
        wait_for_state(&engine, "b", NodeState::Stopped).await;

        let report = engine.report().await?;
        assert_eq!(report["b"].missing_inputs, ["a"]);
        assert_eq!(recorder.start_count("b"), 1);

        engine
            .install("a", RecordingManifold::new(&recorder).base(2).build())
            .await?;
        wait_all_started(&engine).await;

        let b_starts = recorder.starts_of("b");
        assert_eq!(b_starts.len(), 2);
        assert_eq!(b_starts[1].inputs["a"], 2);

        engine.stop().await?;
        Ok(())
    })
    .await
}

#[tokio::test]
async fn install_checks_names_and_inputs() -> TestResult {
    with_timeout(async {
        init_tracing();
        let recorder = Recorder::new();
        let engine = Engine::new(fast_config());

        engine
            .install("a", RecordingManifold::new(&recorder).build())
            .await?;

        let dup = engine
            .install("a", RecordingManifold::new(&recorder).build())
            .await;
        assert!(matches!(dup, Err(EngineError::AlreadyInstalled(_))));

        let unknown = engine
            .install("b", RecordingManifold::new(&recorder).input("ghost").build())
            .await;
        assert!(matches!(unknown, Err(EngineError::UnknownInput { .. })));

        let own = engine
            .install("c", RecordingManifold::new(&recorder).input("c").build())
            .await;
        assert!(matches!(own, Err(EngineError::SelfDependency(_))));

        assert!(matches!(
            engine.uninstall("nope").await,
            Err(EngineError::NotInstalled(_))
        ));
        assert!(matches!(
            engine.bounce("nope").await,
            Err(EngineError::NotInstalled(_))
        ));

        // Failed installs leave no trace.
        let report = engine.report().await?;
        assert_eq!(report.keys().collect::<Vec<_>>(), ["a"]);

        engine.stop().await?;
        Ok(())
    })
    .await
}

#[tokio::test]
async fn install_all_is_atomic_and_ordered() -> TestResult {
    with_timeout(async {
        init_tracing();
        let recorder = Recorder::new();
        let engine = Engine::new(fast_config());

        let mut cyclic = BTreeMap::new();
        cyclic.insert("x".to_string(), RecordingManifold::new(&recorder).input("y").build());
        cyclic.insert("y".to_string(), RecordingManifold::new(&recorder).input("x").build());
        cyclic.insert("z".to_string(), RecordingManifold::new(&recorder).build());
        let res = engine.install_all(cyclic).await;
        assert!(matches!(res, Err(EngineError::Cycle(_))));
        assert!(engine.report().await?.is_empty());

        let mut batch = BTreeMap::new();
        batch.insert(
            "total".to_string(),
            RecordingManifold::new(&recorder).inputs(&["one", "two"]).build(),
        );
        batch.insert("one".to_string(), RecordingManifold::new(&recorder).base(1).build());
        batch.insert("two".to_string(), RecordingManifold::new(&recorder).base(2).build());
        engine.install_all(batch).await?;
        wait_all_started(&engine).await;

        let total = &recorder.starts_of("total")[0];
        assert_eq!(total.inputs["one"], 1);
        assert_eq!(total.inputs["two"], 2);
        assert_eq!(recorder.missing_observations(), 0);

        engine.stop().await?;
        Ok(())
    })
    .await
}

#[tokio::test]
async fn clean_exit_restarts_without_counting_a_failure() -> TestResult {
    with_timeout(async {
        init_tracing();
        let recorder = Recorder::new();
        let engine = Engine::new(fast_config());

        engine
            .install("a", RecordingManifold::new(&recorder).build())
            .await?;
        wait_all_started(&engine).await;

        recorder.control("a").ok_or("no worker for a")?.exit(Ok(()));

        while recorder.start_count("a") < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        wait_all_started(&engine).await;

        let report = engine.report().await?;
        let status = &report["a"];
        assert_eq!(status.failures, 0);
        assert!(status.last_error.is_none());
        assert_eq!(status.starts, 2);

        engine.stop().await?;
        Ok(())
    })
    .await
}

#[tokio::test]
async fn bounce_restarts_node_and_dependents() -> TestResult {
    with_timeout(async {
        init_tracing();
        let recorder = Recorder::new();
        let engine = Engine::new(fast_config());

        engine
            .install("a", RecordingManifold::new(&recorder).build())
            .await?;
        engine
            .install("b", RecordingManifold::new(&recorder).input("a").build())
            .await?;
        engine
            .install("solo", RecordingManifold::new(&recorder).build())
            .await?;
        wait_all_started(&engine).await;

        engine.bounce("a").await?;
        while recorder.start_count("b") < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        wait_all_started(&engine).await;

        assert_eq!(recorder.start_count("a"), 2);
        assert_eq!(recorder.start_count("solo"), 1);

        engine.stop().await?;
        Ok(())
    })
    .await
}

#[tokio::test]
async fn shutdown_stops_dependents_first_and_closes_the_api() -> TestResult {
    with_timeout(async {
        init_tracing();
        let recorder = Recorder::new();
        let engine = Engine::new(fast_config());

        engine
            .install("a", RecordingManifold::new(&recorder).build())
            .await?;
        engine
            .install("b", RecordingManifold::new(&recorder).input("a").build())
            .await?;
        engine
            .install("c", RecordingManifold::new(&recorder).input("b").build())
            .await?;
        wait_all_started(&engine).await;

        engine.stop().await?;
        assert_eq!(recorder.stops(), ["c", "b", "a"]);
        assert!(engine.is_finished());

        // Killing twice is harmless and every waiter sees the same outcome.
        engine.kill();
        assert!(engine.wait().await.is_ok());

        let late = engine
            .install("d", RecordingManifold::new(&recorder).build())
            .await;
        assert!(matches!(late, Err(EngineError::Stopped)));
        assert!(matches!(engine.report().await, Err(EngineError::Stopped)));
        Ok(())
    })
    .await
}

/// Manifold whose start blocks until cancelled. With `give_up` the start
/// then fails; otherwise it hands back a worker anyway.
fn slow_start(recorder: &Recorder, attempts: &Counter, give_up: bool) -> Manifold {
    let recorder = recorder.clone();
    let attempts = attempts.clone();
    Manifold::builder()
        .start(move |context: Context| {
            let recorder = recorder.clone();
            let attempts = attempts.clone();
            async move {
                attempts.bump();
                context.cancelled().await;
                if give_up {
                    anyhow::bail!("start abandoned");
                }
                Ok(RecordingWorker::start(&context, &recorder, 0, BTreeMap::new()))
            }
        })
        .output_eq(|worker: &RecordingWorker| worker.value())
        .build()
        .expect("slow manifold")
}

async fn uninstall_mid_start(give_up: bool) -> TestResult {
    init_tracing();
    let recorder = Recorder::new();
    let attempts = Counter::new();
    let engine = Engine::new(fast_config());

    engine
        .install("slow", slow_start(&recorder, &attempts, give_up))
        .await?;
    engine
        .install("after", RecordingManifold::new(&recorder).input("slow").build())
        .await?;
    while attempts.get() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    engine.uninstall("slow").await?;
    wait_for_state(&engine, "slow", NodeState::Uninstalled).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = engine.report().await?;
    assert_eq!(report["slow"].state, NodeState::Uninstalled);
    assert_eq!(report["after"].state, NodeState::Stopped);
    assert_eq!(report["after"].missing_inputs, ["slow"]);
    assert_eq!(attempts.get(), 1);
    assert_eq!(recorder.start_count("after"), 0);
    assert!(matches!(
        engine.uninstall("slow").await,
        Err(EngineError::NotInstalled(name)) if name == "slow"
    ));
    if !give_up {
        // The late worker saw its cancellation and was waited for.
        assert_eq!(recorder.stops(), ["slow"]);
    }

    engine.stop().await?;
    Ok(())
}

#[tokio::test]
async fn uninstall_while_start_fails_leaves_node_uninstalled() -> TestResult {
    with_timeout(uninstall_mid_start(true)).await
}

#[tokio::test]
async fn uninstall_while_start_succeeds_kills_the_new_worker() -> TestResult {
    with_timeout(uninstall_mid_start(false)).await
}

#[tokio::test]
async fn dropping_every_handle_shuts_the_engine_down() -> TestResult {
    with_timeout(async {
        init_tracing();
        let recorder = Recorder::new();
        let engine = Engine::new(fast_config());

        engine
            .install("a", RecordingManifold::new(&recorder).build())
            .await?;
        engine
            .install("b", RecordingManifold::new(&recorder).input("a").build())
            .await?;
        wait_all_started(&engine).await;

        let spare = engine.clone();
        drop(engine);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.stops().is_empty());

        drop(spare);
        while recorder.stops().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(recorder.stops(), ["b", "a"]);
        Ok(())
    })
    .await
}
