//! Concurrent load against a small interpreter pool.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use scriptbox_core::{
    EngineConfig, ExecuteRequest, ExecutionFailure, ScriptEngine, SessionId, Stores, TclFactory,
};

fn engine(max_size: usize, acquire_timeout: Duration) -> ScriptEngine {
    let mut config = EngineConfig::ephemeral();
    config.pool = config
        .pool
        .with_max_size(max_size)
        .with_acquire_timeout(acquire_timeout);
    ScriptEngine::new(config, Stores::in_memory(), Arc::new(TclFactory::default())).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_concurrent_executions_share_five_interpreters() {
    let engine = engine(5, Duration::from_secs(30));

    let runs = (0..50).map(|i| {
        let engine = engine.clone();
        async move {
            engine
                .execute(
                    ExecuteRequest::new("after 10; expr {$i * 2}")
                        .with_variable("i", serde_json::json!(i)),
                )
                .await
        }
    });
    let results = join_all(runs).await;

    for (i, result) in results.iter().enumerate() {
        assert!(result.success, "run {i}: {:?}", result.error);
        assert_eq!(result.result.as_deref(), Some((i * 2).to_string().as_str()));
    }

    let stats = engine.pool_stats();
    assert!(stats.peak_in_use <= 5, "peak {}", stats.peak_in_use);
    assert!(stats.created <= 5, "created {}", stats.created);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.waiters, 0);

    // Interpreters are reused, so ids repeat across the 50 runs.
    let mut ids: Vec<u64> = results
        .iter()
        .filter_map(|r| r.metrics.interpreter_id)
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert!(ids.len() <= 5);
}

/// Busy loop, optional delay, one session write, one line of output.
fn wave_script(script_id: usize, delay_ms: usize) -> String {
    format!(
        r#"
# Concurrent test script {script_id}
set scriptId {script_id}
set startTime [clock milliseconds]

set sum 0
for {{set i 1}} {{$i <= 500}} {{incr i}} {{
    set sum [expr {{$sum + $i}}]
}}

if {{{delay_ms} > 0}} {{
    after {delay_ms}
}}

set sessionKey "concurrent_test_$scriptId"
mcp::session set $sessionKey $sum

set endTime [clock milliseconds]
set duration [expr {{$endTime - $startTime}}]

puts "Script $scriptId completed in ${{duration}}ms, sum=$sum"
"#
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_waves_write_one_shared_session() {
    let engine = engine(5, Duration::from_secs(30));

    for wave in 0..3 {
        let runs = (0..10).map(|i| {
            let engine = engine.clone();
            let script_id = wave * 10 + i;
            async move {
                let result = engine
                    .execute(
                        ExecuteRequest::new(wave_script(script_id, (i % 3) * 100))
                            .with_session("pool-waves"),
                    )
                    .await;
                (script_id, result)
            }
        });
        for (script_id, result) in join_all(runs).await {
            assert!(result.success, "script {script_id}: {:?}", result.error);
            assert!(
                result
                    .output
                    .starts_with(&format!("Script {script_id} completed in")),
                "{}",
                result.output
            );
            assert!(result.output.trim_end().ends_with("sum=125250"));
        }
    }

    let session = SessionId::parse("pool-waves").unwrap();
    let keys = engine.sessions().list(&session).await.unwrap();
    assert_eq!(keys.len(), 30);
    let stored = engine
        .sessions()
        .get(&session, "concurrent_test_17")
        .await
        .unwrap();
    assert_eq!(stored, Some(serde_json::json!(125250)));
    assert!(engine.pool_stats().created <= 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exhaustion_is_reported_not_hung() {
    let engine = engine(1, Duration::from_millis(100));

    let slow = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .execute(ExecuteRequest::new("after 1000; return slow"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let starved = engine.execute(ExecuteRequest::new("return fast")).await;
    assert!(!starved.success);
    assert!(
        matches!(
            starved.error,
            Some(ExecutionFailure::PoolExhausted { max_size: 1, .. })
        ),
        "{:?}",
        starved.error
    );
    assert_eq!(starved.exit_code, 4);

    let slow = slow.await.unwrap();
    assert!(slow.success, "{:?}", slow.error);
}

#[tokio::test]
async fn test_interpreter_state_does_not_leak_between_runs() {
    let engine = engine(1, Duration::from_secs(5));

    let first = engine
        .execute(ExecuteRequest::new("set leaked 1; proc helper {} { return 1 }"))
        .await;
    assert!(first.success);

    let second = engine
        .execute(ExecuteRequest::new("list [info exists leaked] [info procs helper]"))
        .await;
    assert!(second.success, "{:?}", second.error);
    assert_eq!(second.result.as_deref(), Some("0 {}"));
    assert_eq!(second.metrics.interpreter_id, first.metrics.interpreter_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_waits_for_in_flight_work() {
    let engine = engine(2, Duration::from_secs(5));

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.execute(ExecuteRequest::new("after 200; return done")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = engine.shutdown(Duration::from_secs(5)).await;
    assert!(report.drained);
    assert_eq!(report.in_flight_remaining, 0);

    let finished = running.await.unwrap();
    assert!(finished.success, "{:?}", finished.error);
    assert!(engine.pool_stats().closed);
}
