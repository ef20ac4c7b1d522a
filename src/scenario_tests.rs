//! End-to-end runs of published flows on in-memory ports.

use crate::context::{Batch, ContextRecord, FaultKind};
use crate::prelude::*;
use crate::repo::{RepoError, RepoResult};
use crate::{FlowContextRepo, LocalMessenger, MemoryContextRepo, MemoryLocks};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn runtime<D: FlowData>() -> FlowRuntime<D> {
    init_tracing();
    RuntimeBuilder::new()
        .with_config(RuntimeConfig::new().with_poll_interval(Duration::from_millis(20)))
        .build()
        .unwrap()
}

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    (Arc::clone(&count), count)
}

fn sorted(mut values: Vec<i64>) -> Vec<i64> {
    values.sort();
    values
}

#[tokio::test]
async fn test_map_chain_transforms_payload() {
    let runtime = runtime::<i64>();
    runtime
        .publish(
            FlowBuilder::<i64>::new("calc")
                .map("inc", |x| Ok(x + 1))
                .map("double", |x| Ok(x * 2))
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer_one("calc", 1).await.unwrap();
    let summary = handle.wait(WAIT).await.unwrap();
    assert_eq!(handle.results().await.unwrap(), vec![4]);
    assert_eq!(summary.count(FlowStatus::Archived), 3);
    assert_eq!(summary.total(), 3);

    for ctx in handle.contexts().await.unwrap() {
        assert_eq!(ctx.trace_id(), handle.trace_id());
        let scheduled = ctx.scheduled_at().unwrap();
        let executed = ctx.executed_at().unwrap();
        let completed = ctx.completed_at().unwrap();
        assert!(scheduled <= executed && executed <= completed);
    }
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_produce_keeps_two_smallest() {
    let runtime = runtime::<i64>();
    runtime.publish(smallest_two()).unwrap();

    let handle = runtime.offer("top", vec![5, 3, 1, 4, 2]).await.unwrap();
    handle.wait(WAIT).await.unwrap();
    assert_eq!(sorted(handle.results().await.unwrap()), vec![1, 2]);
    runtime.shutdown().await.unwrap();
}

fn smallest_two() -> Flow<i64> {
    FlowBuilder::<i64>::new("top")
        .produce("smallest", |mut items| {
            items.sort();
            items.truncate(2);
            Ok(items)
        })
        .close()
        .unwrap()
}

#[tokio::test]
async fn test_produce_sees_whole_offer_across_claims() {
    init_tracing();
    let runtime: FlowRuntime<i64> = RuntimeBuilder::new()
        .with_config(
            RuntimeConfig::new()
                .with_batch_size(2)
                .with_poll_interval(Duration::from_millis(20)),
        )
        .build()
        .unwrap();
    runtime.publish(smallest_two()).unwrap();

    let handle = runtime.offer("top", vec![5, 3, 1, 4, 2]).await.unwrap();
    let summary = handle.wait(WAIT).await.unwrap();
    assert_eq!(sorted(handle.results().await.unwrap()), vec![1, 2]);
    // five inputs plus two outputs at the end node
    assert_eq!(summary.count(FlowStatus::Archived), 7);
    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_produce_fires_once_with_concurrent_workers() {
    init_tracing();
    let runtime: FlowRuntime<i64> = RuntimeBuilder::new()
        .with_config(
            RuntimeConfig::new()
                .with_batch_size(1)
                .with_workers_per_node(4)
                .with_poll_interval(Duration::from_millis(5)),
        )
        .build()
        .unwrap();
    runtime.publish(smallest_two()).unwrap();

    let handle = runtime
        .offer("top", vec![9, 7, 8, 5, 3, 6, 1, 4, 2, 10])
        .await
        .unwrap();
    let summary = handle.wait(Duration::from_secs(20)).await.unwrap();
    assert_eq!(sorted(handle.results().await.unwrap()), vec![1, 2]);
    assert_eq!(summary.count(FlowStatus::Error), 0);
    assert_eq!(summary.superseded, 0);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_produce_empty_output_archives_input() {
    let runtime = runtime::<i64>();
    runtime
        .publish(
            FlowBuilder::<i64>::new("drop")
                .produce("nothing", |_| Ok(Vec::new()))
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer("drop", vec![1, 2]).await.unwrap();
    let summary = handle.wait(WAIT).await.unwrap();
    assert_eq!(summary.count(FlowStatus::Archived), 2);
    assert_eq!(summary.total(), 2);
    assert!(handle.results().await.unwrap().is_empty());
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_join_combines_all_forks_once() {
    let runtime = runtime::<i64>();
    let (successes, seen) = counter();
    runtime
        .publish(
            FlowBuilder::<i64>::new("fan")
                .parallel("split", JoinMode::All)
                .fork(|b| b.map("inc", |x| Ok(x + 1)))
                .fork(|b| b.map("double", |x| Ok(x * 2)))
                .fork(|b| b.map("tenfold", |x| Ok(x * 10)))
                .join_with("sum", |parts| Ok(parts.iter().sum()))
                .close_with(
                    move |_| {
                        successes.fetch_add(1, Ordering::SeqCst);
                    },
                    |_| {},
                )
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer_one("fan", 3).await.unwrap();
    handle.wait(WAIT).await.unwrap();
    assert_eq!(handle.results().await.unwrap(), vec![4 + 6 + 30]);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_join_rejects_batch_of_wrong_width() {
    init_tracing();
    let repo = Arc::new(MemoryContextRepo::new());
    let runtime: FlowRuntime<i64> = RuntimeBuilder::new()
        .with_repo(repo.clone())
        .with_config(RuntimeConfig::new().with_poll_interval(Duration::from_millis(20)))
        .build()
        .unwrap();
    let flow = FlowBuilder::<i64>::new("fan")
        .parallel("split", JoinMode::All)
        .fork(|b| b.map("inc", |x| Ok(x + 1)))
        .fork(|b| b.map("double", |x| Ok(x * 2)))
        .fork(|b| b.map("tenfold", |x| Ok(x * 10)))
        .join_with("sum", |parts| Ok(parts.iter().sum()))
        .close()
        .unwrap();
    let join = flow
        .nodes()
        .iter()
        .find(|n| n.name == "sum")
        .map(|n| n.position.clone())
        .unwrap();

    // two contexts of a two-wide batch arrive at a three-way join
    let batch = Batch::new(2);
    let trace = Uuid::new_v4();
    let mut arrivals = Vec::new();
    for value in [1, 2] {
        let mut ctx = FlowContext::with_trace("fan", join.as_str(), trace, value);
        ctx.to_batch(batch);
        arrivals.push(ctx.to_record().unwrap());
    }
    repo.save(arrivals).await.unwrap();
    runtime.publish(flow).unwrap();

    let summary = runtime.wait_for_trace(trace, WAIT).await.unwrap();
    assert_eq!(summary.count(FlowStatus::Error), 2);
    let faults = runtime.failures(trace).await.unwrap();
    assert_eq!(faults[0].kind, FaultKind::Engine);
    assert_eq!(faults[0].category, "batch");
    assert!(faults[0].message.contains("3 branches"));
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_join_without_combiner_takes_one_payload() {
    let runtime = runtime::<i64>();
    runtime
        .publish(
            FlowBuilder::<i64>::new("pick")
                .parallel("split", JoinMode::All)
                .fork(|b| b.map("a", |x| Ok(x + 1)))
                .fork(|b| b.map("b", |x| Ok(x + 2)))
                .join("first")
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer_one("pick", 10).await.unwrap();
    handle.wait(WAIT).await.unwrap();
    let results = handle.results().await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0] == 11 || results[0] == 12);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_either_join_supersedes_the_loser() {
    let runtime = runtime::<i64>();
    runtime
        .publish(
            FlowBuilder::<i64>::new("race")
                .parallel("split", JoinMode::Either)
                .fork(|b| b.map("fast", |x| Ok(x + 1)))
                .fork(|b| b.map("slow", |x| Ok(x + 2)))
                .join("winner")
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer_one("race", 0).await.unwrap();
    let summary = handle.wait(WAIT).await.unwrap();
    let results = handle.results().await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0] == 1 || results[0] == 2);
    assert_eq!(summary.superseded, 1);
    assert_eq!(summary.count(FlowStatus::Archived), summary.total());
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reduce_folds_whole_batch() {
    let runtime = runtime::<i64>();
    runtime
        .publish(
            FlowBuilder::<i64>::new("total")
                .produce("smallest", |mut items| {
                    items.sort();
                    items.truncate(3);
                    Ok(items)
                })
                .reduce("sum", |items| Ok(items.iter().sum()))
                .map("label", |x| Ok(x * 100))
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer("total", vec![9, 1, 2, 3, 8]).await.unwrap();
    handle.wait(WAIT).await.unwrap();
    assert_eq!(handle.results().await.unwrap(), vec![600]);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_conditions_route_by_predicate() {
    let runtime = runtime::<i64>();
    runtime
        .publish(
            FlowBuilder::<i64>::new("route")
                .conditions("size")
                .when(|x| *x > 100, |b| b.map("huge", |x| Ok(x * 1000)))
                .when(|x| *x > 10, |b| b.map("big", |x| Ok(x * 10)))
                .others(|b| b)
                .done()
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer("route", vec![5, 50, 500]).await.unwrap();
    handle.wait(WAIT).await.unwrap();
    assert_eq!(sorted(handle.results().await.unwrap()), vec![5, 500, 500_000]);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unmatched_condition_is_an_engine_error() {
    let runtime = runtime::<i64>();
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    runtime
        .publish(
            FlowBuilder::<i64>::new("strict")
                .conditions("size")
                .when(|x| *x > 10, |b| b.map("big", |x| Ok(x * 10)))
                .done()
                // never consulted for engine errors
                .with_error_handler_fn(|_, contexts| {
                    ErrorDecision::Retry(RetryDecision::now(contexts))
                })
                .close_with(|_| {}, move |err| sink.lock().unwrap().push(err.clone()))
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer_one("strict", 1).await.unwrap();
    let summary = handle.wait(WAIT).await.unwrap();
    assert_eq!(summary.count(FlowStatus::Error), 1);

    let faults = handle.failures().await.unwrap();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].kind, FaultKind::Engine);
    assert_eq!(faults[0].position, "n0");
    assert_eq!(failures.lock().unwrap().len(), 1);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_block_gate_releases_selected_contexts() {
    let runtime = runtime::<i64>();
    let (processed, seen) = counter();
    runtime
        .publish(
            FlowBuilder::<i64>::new("approval")
                .block("review")
                .map("process", move |x| {
                    processed.fetch_add(1, Ordering::SeqCst);
                    Ok(x)
                })
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer("approval", vec![1, 2, 3, 4, 5]).await.unwrap();
    let summary = handle.wait(WAIT).await.unwrap();
    assert_eq!(summary.count(FlowStatus::Pending), 5);

    let released = runtime
        .process_block("approval", "review", |x| *x > 4)
        .await
        .unwrap();
    assert_eq!(released, 1);
    handle.wait(WAIT).await.unwrap();
    assert_eq!(handle.results().await.unwrap(), vec![5]);
    assert_eq!(
        runtime
            .contexts_at("approval", "review", &[FlowStatus::Pending])
            .await
            .unwrap()
            .len(),
        4
    );

    let released = runtime
        .process_block("approval", "review", |x| *x > 0)
        .await
        .unwrap();
    assert_eq!(released, 4);
    handle.wait(WAIT).await.unwrap();
    assert_eq!(sorted(handle.results().await.unwrap()), vec![1, 2, 3, 4, 5]);
    assert_eq!(seen.load(Ordering::SeqCst), 5);

    // nothing is left to release
    let released = runtime
        .process_block("approval", "review", |_| true)
        .await
        .unwrap();
    assert_eq!(released, 0);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_block_mid_flow_parks_successors() {
    let runtime = runtime::<i64>();
    runtime
        .publish(
            FlowBuilder::<i64>::new("gate")
                .map("inc", |x| Ok(x + 1))
                .block("hold")
                .map("double", |x| Ok(x * 2))
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer_one("gate", 1).await.unwrap();
    let summary = handle.wait(WAIT).await.unwrap();
    assert_eq!(summary.count(FlowStatus::Pending), 1);
    assert!(handle.results().await.unwrap().is_empty());

    assert_eq!(
        runtime.process_block("gate", "hold", |_| true).await.unwrap(),
        1
    );
    handle.wait(WAIT).await.unwrap();
    assert_eq!(handle.results().await.unwrap(), vec![4]);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_node_failure_is_recorded_and_reported() {
    let runtime = runtime::<i64>();
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    runtime
        .publish(
            FlowBuilder::<i64>::new("calc")
                .map("inc", |x| Ok(x + 1))
                .map("explode", |_| Err(FlowError::node_execution("bad input")))
                .close_with(|_| {}, move |err| sink.lock().unwrap().push(err.to_string()))
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer_one("calc", 1).await.unwrap();
    let summary = handle.wait(WAIT).await.unwrap();
    assert_eq!(summary.count(FlowStatus::Error), 1);

    let failed: Vec<_> = handle
        .contexts()
        .await
        .unwrap()
        .into_iter()
        .filter(|ctx| ctx.status() == FlowStatus::Error)
        .collect();
    let fault = failed[0].error().unwrap().to_string();
    for part in ["calc", "n1", "explode", "bad input"] {
        assert!(fault.contains(part), "{fault} lacks {part}");
    }

    let reported = failures.lock().unwrap().clone();
    assert_eq!(reported.len(), 1);
    for part in ["calc", "n1", "explode"] {
        assert!(reported[0].contains(part), "{} lacks {part}", reported[0]);
    }
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_panicking_node_fails_its_context() {
    let runtime = runtime::<i64>();
    runtime
        .publish(
            FlowBuilder::<i64>::new("fragile")
                .map("boom", |x| {
                    if x < 0 {
                        panic!("negative input");
                    }
                    Ok(x)
                })
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer("fragile", vec![-1, 1]).await.unwrap();
    let summary = handle.wait(WAIT).await.unwrap();
    assert_eq!(summary.count(FlowStatus::Error), 1);
    assert_eq!(handle.results().await.unwrap(), vec![1]);

    let faults = handle.failures().await.unwrap();
    assert!(faults[0].to_string().contains("fragile/n0/boom"));
    assert!(faults[0].message.contains("negative input"));
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_error_handler_patches_and_retries() {
    let runtime = runtime::<i64>();
    let (successes, seen) = counter();
    runtime
        .publish(
            FlowBuilder::<i64>::new("fix")
                .map("check", |x| {
                    if x < 0 {
                        Err(FlowError::node_execution("negative"))
                    } else {
                        Ok(x + 1)
                    }
                })
                .on_error_fn(|_, mut contexts| {
                    for ctx in &mut contexts {
                        *ctx.data_mut() = ctx.data().abs();
                    }
                    ErrorDecision::Retry(RetryDecision::now(contexts))
                })
                .close_with(
                    move |_| {
                        successes.fetch_add(1, Ordering::SeqCst);
                    },
                    |_| {},
                )
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer_one("fix", -7).await.unwrap();
    handle.wait(WAIT).await.unwrap();
    assert_eq!(handle.results().await.unwrap(), vec![8]);
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    let retried = runtime
        .contexts_at("fix", "check", &[FlowStatus::Archived])
        .await
        .unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].attempt(), 1);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_handler_gives_up_after_budget() {
    let runtime = runtime::<i64>();
    let (calls, seen) = counter();
    let (failures, reported) = counter();
    runtime
        .publish(
            FlowBuilder::<i64>::new("flaky")
                .map("always", move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(FlowError::node_execution("down"))
                })
                .on_error(RetryHandler::new(RetryMode::fixed(
                    2,
                    Duration::from_millis(20),
                )))
                .close_with(
                    |_| {},
                    move |_| {
                        failures.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer_one("flaky", 1).await.unwrap();
    let summary = handle.wait(WAIT).await.unwrap();
    assert_eq!(summary.count(FlowStatus::Error), 1);
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert_eq!(reported.load(Ordering::SeqCst), 1);

    let failed = handle.contexts().await.unwrap();
    assert_eq!(failed[0].attempt(), 2);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_in_node_retries_absorb_transient_failures() {
    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NodeExecutor<i64> for Flaky {
        fn config(&self) -> NodeConfig {
            NodeConfig::new().with_fixed_retry(2, Duration::from_millis(1))
        }

        async fn execute(
            &self,
            _config: &NodeConfig,
            mut contexts: Vec<FlowContext<i64>>,
        ) -> FlowResult<Vec<FlowContext<i64>>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(FlowError::node_execution("transient"));
            }
            for ctx in &mut contexts {
                *ctx.data_mut() *= 3;
            }
            Ok(contexts)
        }
    }

    let runtime = runtime::<i64>();
    runtime
        .publish(
            FlowBuilder::<i64>::new("remote")
                .execute(
                    "call",
                    Flaky {
                        calls: AtomicUsize::new(0),
                    },
                )
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer("remote", vec![1, 2]).await.unwrap();
    let summary = handle.wait(WAIT).await.unwrap();
    assert_eq!(summary.count(FlowStatus::Error), 0);
    assert_eq!(sorted(handle.results().await.unwrap()), vec![3, 6]);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_is_rejected_once_applied() {
    let runtime = runtime::<i64>();
    runtime
        .publish(
            FlowBuilder::<i64>::new("manual")
                .map("positive", |x| {
                    if x > 0 {
                        Ok(x)
                    } else {
                        Err(FlowError::node_execution("not positive"))
                    }
                })
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer_one("manual", 0).await.unwrap();
    handle.wait(WAIT).await.unwrap();
    let mut failed = runtime
        .contexts_at("manual", "positive", &[FlowStatus::Error])
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    failed[0].set_data(42);

    let decision = RetryDecision::now(failed);
    assert_eq!(runtime.retry(decision.clone()).await.unwrap(), 1);
    handle.wait(WAIT).await.unwrap();
    assert_eq!(handle.results().await.unwrap(), vec![42]);

    let err = runtime.retry(decision).await.unwrap_err();
    assert!(err.is_invariant_violation());
    assert_eq!(handle.results().await.unwrap(), vec![42]);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_scratch_values_follow_the_context() {
    let runtime = runtime::<String>();
    runtime
        .publish(
            FlowBuilder::<String>::new("tagging")
                .just("tag", |ctx| ctx.put_value("source", "api"))
                .just("read", |ctx| {
                    let source: String = ctx.value("source")?.unwrap_or_default();
                    let data = format!("{}@{source}", ctx.data());
                    ctx.set_data(data);
                    Ok(())
                })
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer_one("tagging", "order".to_string()).await.unwrap();
    handle.wait(WAIT).await.unwrap();
    assert_eq!(handle.results().await.unwrap(), vec!["order@api".to_string()]);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_relay_continues_in_another_flow() {
    let runtime = runtime::<i64>();
    runtime
        .publish(
            FlowBuilder::<i64>::new("billing")
                .map("charge", |x| Ok(x * 100))
                .close()
                .unwrap(),
        )
        .unwrap();
    runtime
        .publish(
            FlowBuilder::<i64>::new("intake")
                .map("inc", |x| Ok(x + 1))
                .relay("handoff", "billing")
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer("intake", vec![1, 2]).await.unwrap();
    handle.wait(WAIT).await.unwrap();
    assert_eq!(sorted(handle.results().await.unwrap()), vec![200, 300]);

    let streams: Vec<String> = handle
        .contexts()
        .await
        .unwrap()
        .iter()
        .map(|ctx| ctx.stream_id().to_string())
        .collect();
    assert!(streams.iter().any(|s| s == "billing"));
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_relay_to_unknown_flow_fails() {
    let runtime = runtime::<i64>();
    runtime
        .publish(
            FlowBuilder::<i64>::new("lost")
                .relay("handoff", "nowhere")
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer_one("lost", 1).await.unwrap();
    let summary = handle.wait(WAIT).await.unwrap();
    assert_eq!(summary.count(FlowStatus::Error), 1);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_jump_loops_until_condition_fails() {
    let runtime = runtime::<i64>();
    runtime
        .publish(
            FlowBuilder::<i64>::new("count")
                .map("inc", |x| Ok(x + 1))
                .id("step")
                .conditions("more")
                .when(|x| *x < 5, |b| b.to("step"))
                .others(|b| b)
                .done()
                .close()
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer_one("count", 0).await.unwrap();
    handle.wait(WAIT).await.unwrap();
    assert_eq!(handle.results().await.unwrap(), vec![5]);
    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_advance_each_join_once() {
    init_tracing();
    let runtime: FlowRuntime<i64> = RuntimeBuilder::new()
        .with_config(
            RuntimeConfig::new()
                .with_batch_size(1)
                .with_workers_per_node(4)
                .with_poll_interval(Duration::from_millis(5)),
        )
        .build()
        .unwrap();
    let (successes, seen) = counter();
    runtime
        .publish(
            FlowBuilder::<i64>::new("fan")
                .parallel("split", JoinMode::All)
                .fork(|b| b.map("inc", |x| Ok(x + 1)))
                .fork(|b| b.map("double", |x| Ok(x * 2)))
                .fork(|b| b.map("tenfold", |x| Ok(x * 10)))
                .join_with("sum", |parts| Ok(parts.iter().sum()))
                .close_with(
                    move |_| {
                        successes.fetch_add(1, Ordering::SeqCst);
                    },
                    |_| {},
                )
                .unwrap(),
        )
        .unwrap();

    let items: Vec<i64> = (1..=20).collect();
    let handle = runtime.offer("fan", items.clone()).await.unwrap();
    let summary = handle.wait(Duration::from_secs(20)).await.unwrap();

    let expected: Vec<i64> = items.iter().map(|x| 13 * x + 1).collect();
    assert_eq!(sorted(handle.results().await.unwrap()), expected);
    assert_eq!(seen.load(Ordering::SeqCst), 20);
    assert_eq!(summary.count(FlowStatus::Error), 0);
    assert_eq!(summary.superseded, 0);
    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_runtimes_sharing_ports_cooperate() {
    init_tracing();
    let repo = Arc::new(MemoryContextRepo::new());
    let locks = Arc::new(MemoryLocks::new());
    let messenger = Arc::new(LocalMessenger::new());
    let (successes, seen) = counter();

    let mut runtimes = Vec::new();
    for _ in 0..2 {
        let runtime: FlowRuntime<i64> = RuntimeBuilder::new()
            .with_repo(repo.clone())
            .with_locks(locks.clone())
            .with_messenger(messenger.clone())
            .with_config(
                RuntimeConfig::new()
                    .with_batch_size(2)
                    .with_poll_interval(Duration::from_millis(10)),
            )
            .build()
            .unwrap();
        let successes = Arc::clone(&successes);
        runtime
            .publish(
                FlowBuilder::<i64>::new("shared")
                    .parallel("split", JoinMode::All)
                    .fork(|b| b.map("left", |x| Ok(x + 1)))
                    .fork(|b| b.map("right", |x| Ok(x - 1)))
                    .join_with("sum", |parts| Ok(parts.iter().sum()))
                    .close_with(
                        move |_| {
                            successes.fetch_add(1, Ordering::SeqCst);
                        },
                        |_| {},
                    )
                    .unwrap(),
            )
            .unwrap();
        runtimes.push(runtime);
    }

    let items: Vec<i64> = (1..=10).collect();
    let handle = runtimes[0].offer("shared", items.clone()).await.unwrap();
    handle.wait(Duration::from_secs(20)).await.unwrap();

    // the second runtime sees the same trace
    let results = runtimes[1].results(handle.trace_id()).await.unwrap();
    let expected: Vec<i64> = items.iter().map(|x| 2 * x).collect();
    assert_eq!(sorted(results), expected);
    assert_eq!(seen.load(Ordering::SeqCst), 10);

    for runtime in runtimes {
        runtime.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_offer_of_nothing_settles_immediately() {
    let runtime = runtime::<i64>();
    runtime
        .publish(FlowBuilder::<i64>::new("calc").map("inc", |x| Ok(x + 1)).close().unwrap())
        .unwrap();

    let handle = runtime.offer("calc", Vec::new()).await.unwrap();
    let summary = handle.wait(WAIT).await.unwrap();
    assert_eq!(summary.total(), 0);
    runtime.shutdown().await.unwrap();
}

/// Memory repository whose `fail_on`-th update call fails once.
struct FailingUpdate {
    inner: MemoryContextRepo,
    calls: AtomicUsize,
    fail_on: usize,
}

impl FailingUpdate {
    fn new(fail_on: usize) -> Self {
        Self {
            inner: MemoryContextRepo::new(),
            calls: AtomicUsize::new(0),
            fail_on,
        }
    }
}

#[async_trait]
impl FlowContextRepo for FailingUpdate {
    async fn save(&self, records: Vec<ContextRecord>) -> RepoResult<()> {
        self.inner.save(records).await
    }

    async fn update(&self, records: Vec<ContextRecord>) -> RepoResult<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(RepoError::generic("disk full"));
        }
        self.inner.update(records).await
    }

    async fn update_flow_data(
        &self,
        id: Uuid,
        data_json: String,
        scratch_json: String,
    ) -> RepoResult<()> {
        self.inner.update_flow_data(id, data_json, scratch_json).await
    }

    async fn get(&self, id: Uuid) -> RepoResult<ContextRecord> {
        self.inner.get(id).await
    }

    async fn get_many(&self, ids: &[Uuid]) -> RepoResult<Vec<ContextRecord>> {
        self.inner.get_many(ids).await
    }

    async fn get_by_trace(&self, trace_id: Uuid) -> RepoResult<Vec<ContextRecord>> {
        self.inner.get_by_trace(trace_id).await
    }

    async fn get_by_position(
        &self,
        stream_id: &str,
        position: &str,
        statuses: &[FlowStatus],
        limit: Option<usize>,
    ) -> RepoResult<Vec<ContextRecord>> {
        self.inner
            .get_by_position(stream_id, position, statuses, limit)
            .await
    }

    async fn get_by_batch(
        &self,
        stream_id: &str,
        position: &str,
        batch_id: Uuid,
    ) -> RepoResult<Vec<ContextRecord>> {
        self.inner.get_by_batch(stream_id, position, batch_id).await
    }

    async fn delete(&self, ids: &[Uuid], force: bool) -> RepoResult<usize> {
        self.inner.delete(ids, force).await
    }

    async fn len(&self) -> RepoResult<usize> {
        self.inner.len().await
    }
}

#[tokio::test]
async fn test_failed_write_back_fails_the_claim() {
    init_tracing();
    // update #1 claims the context, update #2 would move it to EXECUTING
    let repo = Arc::new(FailingUpdate::new(2));
    let runtime: FlowRuntime<i64> = RuntimeBuilder::new()
        .with_repo(repo)
        .with_config(RuntimeConfig::new().with_poll_interval(Duration::from_millis(20)))
        .build()
        .unwrap();
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    runtime
        .publish(
            FlowBuilder::<i64>::new("calc")
                .map("inc", |x| Ok(x + 1))
                .close_with(
                    |_| {},
                    move |e| sink.lock().unwrap().push(e.to_string()),
                )
                .unwrap(),
        )
        .unwrap();

    let handle = runtime.offer_one("calc", 1).await.unwrap();
    let summary = handle.wait(WAIT).await.unwrap();
    assert_eq!(summary.count(FlowStatus::Error), 1);
    assert!(handle.results().await.unwrap().is_empty());

    let faults = handle.failures().await.unwrap();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].kind, FaultKind::Engine);
    assert_eq!(faults[0].category, "aborted");
    assert_eq!(faults[0].position, "n0");
    assert!(faults[0].message.contains("disk full"));

    let reported = reported.lock().unwrap().clone();
    assert_eq!(reported.len(), 1);
    assert!(reported[0].starts_with("calc/n0/inc"));
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_claim_expires_after_lease() {
    init_tracing();
    let repo = Arc::new(MemoryContextRepo::new());
    // A worker claimed this context and vanished inside the node.
    let mut orphan = FlowContext::new("calc", "n0", 1_i64);
    let now = chrono::Utc::now();
    orphan.schedule(now).unwrap();
    orphan.execute(now).unwrap();
    repo.save(vec![orphan.to_record().unwrap()]).await.unwrap();

    let (failures, reported) = counter();
    let runtime: FlowRuntime<i64> = RuntimeBuilder::new()
        .with_repo(repo)
        .with_config(
            RuntimeConfig::new()
                .with_poll_interval(Duration::from_millis(20))
                .with_claim_lease(Duration::from_millis(50)),
        )
        .build()
        .unwrap();
    runtime
        .publish(
            FlowBuilder::<i64>::new("calc")
                .map("inc", |x| Ok(x + 1))
                .close_with(
                    |_| {},
                    move |_| {
                        failures.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .unwrap(),
        )
        .unwrap();

    let summary = runtime.wait_for_trace(orphan.trace_id(), WAIT).await.unwrap();
    assert_eq!(summary.count(FlowStatus::Error), 1);
    let faults = runtime.failures(orphan.trace_id()).await.unwrap();
    assert_eq!(faults[0].category, "aborted");
    assert!(faults[0].message.contains("lease"));

    // later drains leave the failed context alone
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(reported.load(Ordering::SeqCst), 1);
    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delayed_retry_is_visible_to_every_runtime() {
    init_tracing();
    let repo = Arc::new(MemoryContextRepo::new());
    let locks = Arc::new(MemoryLocks::new());
    let messenger = Arc::new(LocalMessenger::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut runtimes = Vec::new();
    for _ in 0..2 {
        let runtime: FlowRuntime<i64> = RuntimeBuilder::new()
            .with_repo(repo.clone())
            .with_locks(locks.clone())
            .with_messenger(messenger.clone())
            .with_config(RuntimeConfig::new().with_poll_interval(Duration::from_millis(10)))
            .build()
            .unwrap();
        let calls = Arc::clone(&calls);
        runtime
            .publish(
                FlowBuilder::<i64>::new("shared")
                    .map("first_fails", move |x| {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(FlowError::node_execution("cold start"))
                        } else {
                            Ok(x * 10)
                        }
                    })
                    .on_error(RetryHandler::new(RetryMode::fixed(
                        1,
                        Duration::from_millis(300),
                    )))
                    .close()
                    .unwrap(),
            )
            .unwrap();
        runtimes.push(runtime);
    }

    let handle = runtimes[0].offer_one("shared", 4).await.unwrap();
    // whichever runtime ran the node, the other one still waits out the delay
    for runtime in &runtimes {
        runtime.wait_for_trace(handle.trace_id(), WAIT).await.unwrap();
        assert_eq!(runtime.results(handle.trace_id()).await.unwrap(), vec![40]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    for runtime in runtimes {
        runtime.shutdown().await.unwrap();
    }
}
