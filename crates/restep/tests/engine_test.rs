//! End-to-end engine tests against the in-memory store
//!
//! Timers are injected: NoopDelay makes backoff instant, ManualClock drives
//! circuit-breaker windows without wall-clock waits.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_test::assert_ok;

use restep::{
    CircuitBreakerPolicy, CircuitState, Engine, EngineConfig, ErrorKind, ExecutionStatus,
    ManualClock, MemoryStore, NoopDelay, RetryPolicy, StepPolicy, StepStatus, SystemClock,
    TokioDelay, WorkflowError, WorkflowOptions, WorkflowStore,
};

fn test_engine() -> Engine {
    Engine::with_collaborators(
        Arc::new(MemoryStore::new()),
        Arc::new(SystemClock),
        Arc::new(NoopDelay),
        EngineConfig::default(),
    )
}

fn engine_with_manual_clock() -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let engine = Engine::with_collaborators(
        Arc::new(MemoryStore::with_clock(clock.clone())),
        clock.clone(),
        Arc::new(NoopDelay),
        EngineConfig::default(),
    );
    (engine, clock)
}

fn engine_with_real_timers() -> Engine {
    Engine::with_collaborators(
        Arc::new(MemoryStore::new()),
        Arc::new(SystemClock),
        Arc::new(TokioDelay),
        EngineConfig::default(),
    )
}

// ============================================
// Happy path
// ============================================

#[test_log::test(tokio::test)]
async fn test_two_steps_and_sum() {
    let engine = test_engine();

    engine.define("w1", WorkflowOptions::default(), |ctx| async move {
        let a = ctx.step("a", |_| async { Ok(json!(1)) }).await?;
        let b = ctx.step("b", |_| async { Ok(json!(2)) }).await?;
        Ok(json!(a.as_i64().unwrap_or(0) + b.as_i64().unwrap_or(0)))
    });

    let output = engine.start("w1", "e1", json!({})).await.unwrap();
    assert_eq!(output, json!(3));
    assert!(engine.workflows().contains(&"w1".to_string()));

    let execution = engine.execution("e1").await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output, Some(json!(3)));
    assert!(execution.started_at.is_some());
    assert!(execution.completed_at.is_some());

    let steps = engine.steps("e1").await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].step_name, "a");
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[0].output, Some(json!(1)));
    assert_eq!(steps[1].step_name, "b");
    assert_eq!(steps[1].status, StepStatus::Completed);
    assert_eq!(steps[1].output, Some(json!(2)));

    let completed = engine
        .executions("w1", ExecutionStatus::Completed)
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, "e1");
}

#[tokio::test]
async fn test_definition_row_created_on_start() {
    let engine = test_engine();
    engine.define(
        "versioned",
        WorkflowOptions::default().with_version("1.2.3"),
        |_ctx| async move { Ok(json!(null)) },
    );

    engine.start("versioned", "v1", json!({})).await.unwrap();

    let definition = engine
        .store()
        .definition_by_name("versioned")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(definition.version, "1.2.3");
    assert!(definition.is_active);

    // Re-registration bumps the stored version on the next start
    engine.define(
        "versioned",
        WorkflowOptions::default().with_version("2.0.0"),
        |_ctx| async move { Ok(json!(null)) },
    );
    engine.start("versioned", "v2", json!({})).await.unwrap();

    let definition = engine
        .store()
        .definition_by_name("versioned")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(definition.version, "2.0.0");
}

// ============================================
// Mid-workflow failure and resume
// ============================================

#[test_log::test(tokio::test)]
async fn test_failure_then_resume_skips_completed_steps() {
    let engine = test_engine();

    let healthy = Arc::new(AtomicBool::new(false));
    let a_runs = Arc::new(AtomicU32::new(0));
    let b_runs = Arc::new(AtomicU32::new(0));
    let c_runs = Arc::new(AtomicU32::new(0));

    {
        let healthy = healthy.clone();
        let a_runs = a_runs.clone();
        let b_runs = b_runs.clone();
        let c_runs = c_runs.clone();
        engine.define("w2", WorkflowOptions::default(), move |ctx| {
            let healthy = healthy.clone();
            let a_runs = a_runs.clone();
            let b_runs = b_runs.clone();
            let c_runs = c_runs.clone();
            async move {
                let a = ctx
                    .step("a", move |_| {
                        let a_runs = a_runs.clone();
                        async move {
                            a_runs.fetch_add(1, Ordering::SeqCst);
                            Ok(json!("a"))
                        }
                    })
                    .await?;

                let b = ctx
                    .step("b", move |_| {
                        let b_runs = b_runs.clone();
                        async move {
                            b_runs.fetch_add(1, Ordering::SeqCst);
                            Ok(json!("b"))
                        }
                    })
                    .await?;

                let c = ctx
                    .step_with("c", StepPolicy::default().with_max_attempts(1), move |_| {
                        let c_runs = c_runs.clone();
                        let healthy = healthy.clone();
                        async move {
                            c_runs.fetch_add(1, Ordering::SeqCst);
                            if healthy.load(Ordering::SeqCst) {
                                Ok(json!("c"))
                            } else {
                                Err(WorkflowError::external_service("flaky", "call", "down"))
                            }
                        }
                    })
                    .await?;

                Ok(json!([a, b, c]))
            }
        });
    }

    let err = engine.start("w2", "e2", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalService);

    let execution = engine.execution("e2").await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.is_some());

    let steps = engine.steps("e2").await.unwrap();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[1].status, StepStatus::Completed);
    assert_eq!(steps[2].step_name, "c");
    assert_eq!(steps[2].status, StepStatus::Failed);

    // External dependency recovers; resume re-runs only the failed step
    healthy.store(true, Ordering::SeqCst);
    let output = engine.resume("e2").await.unwrap();
    assert_eq!(output, json!(["a", "b", "c"]));

    assert_eq!(a_runs.load(Ordering::SeqCst), 1);
    assert_eq!(b_runs.load(Ordering::SeqCst), 1);
    assert_eq!(c_runs.load(Ordering::SeqCst), 2);

    let execution = engine.execution("e2").await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_replayed_start_returns_same_output_without_rerunning_bodies() {
    let engine = test_engine();
    let runs = Arc::new(AtomicU32::new(0));

    {
        let runs = runs.clone();
        engine.define("replay", WorkflowOptions::default(), move |ctx| {
            let runs = runs.clone();
            async move {
                ctx.step("only", move |_| {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(42))
                    }
                })
                .await
            }
        });
    }

    let first = engine.start("replay", "r1", json!({})).await.unwrap();
    let second = engine.start("replay", "r1", json!({})).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(engine.steps("r1").await.unwrap().len(), 1);
}

// ============================================
// Retry budget
// ============================================

#[tokio::test]
async fn test_retry_exhaustion() {
    let engine = test_engine();
    let runs = Arc::new(AtomicU32::new(0));

    {
        let runs = runs.clone();
        engine.define("always-fails", WorkflowOptions::default(), move |ctx| {
            let runs = runs.clone();
            async move {
                ctx.step_with(
                    "x",
                    StepPolicy::default()
                        .with_max_attempts(3)
                        .with_backoff(Duration::from_millis(1)),
                    move |_| {
                        let runs = runs.clone();
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            Err(WorkflowError::app("persistent failure"))
                        }
                    },
                )
                .await
            }
        });
    }

    let err = engine.start("always-fails", "e3", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::App);

    // The body ran exactly max_attempts times
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    let steps = engine.steps("e3").await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].attempt, 3);
    assert_eq!(steps[0].max_attempts, 3);
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert!(steps[0].completed_at.is_some());

    let execution = engine.execution("e3").await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_retry_eventually_succeeds() {
    let engine = test_engine();
    let runs = Arc::new(AtomicU32::new(0));

    {
        let runs = runs.clone();
        engine.define("third-time", WorkflowOptions::default(), move |ctx| {
            let runs = runs.clone();
            async move {
                ctx.step_with(
                    "x",
                    StepPolicy::default()
                        .with_max_attempts(5)
                        .with_backoff(Duration::from_millis(1)),
                    move |_| {
                        let runs = runs.clone();
                        async move {
                            let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
                            if n < 3 {
                                Err(WorkflowError::external_service("svc", "op", "blip"))
                            } else {
                                Ok(json!(n))
                            }
                        }
                    },
                )
                .await
            }
        });
    }

    let output = engine.start("third-time", "e4", json!({})).await.unwrap();
    assert_eq!(output, json!(3));

    let steps = engine.steps("e4").await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].attempt, 3);
    assert_eq!(steps[0].status, StepStatus::Completed);
}

// ============================================
// Circuit breaker
// ============================================

#[tokio::test]
async fn test_circuit_opens_then_recovers() {
    let (engine, clock) = engine_with_manual_clock();
    let healthy = Arc::new(AtomicBool::new(false));

    {
        let healthy = healthy.clone();
        engine.define("guarded", WorkflowOptions::default(), move |ctx| {
            let healthy = healthy.clone();
            async move {
                ctx.step_with(
                    "p",
                    StepPolicy::default().with_max_attempts(1).with_circuit_breaker(
                        CircuitBreakerPolicy::named("payments")
                            .with_failure_threshold(3)
                            .with_reset_timeout(Duration::from_millis(1000)),
                    ),
                    move |_| {
                        let healthy = healthy.clone();
                        async move {
                            if healthy.load(Ordering::SeqCst) {
                                Ok(json!("paid"))
                            } else {
                                Err(WorkflowError::external_service("payments", "charge", "503"))
                            }
                        }
                    },
                )
                .await
            }
        });
    }

    // Three consecutive failing executions open the breaker
    for id in ["g1", "g2", "g3"] {
        let err = engine.start("guarded", id, json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalService);
    }

    let breaker = engine
        .store()
        .circuit_get_or_create("payments")
        .await
        .unwrap();
    assert_eq!(breaker.state, CircuitState::Open);

    // Within the reset window the call is rejected without touching the body
    clock.advance(Duration::from_millis(500));
    let err = engine.start("guarded", "g4", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);

    // After the reset timeout the next call is admitted as a probe
    clock.advance(Duration::from_millis(501));
    healthy.store(true, Ordering::SeqCst);

    let output = engine.start("guarded", "g5", json!({})).await.unwrap();
    assert_eq!(output, json!("paid"));

    let breaker = engine
        .store()
        .circuit_get_or_create("payments")
        .await
        .unwrap();
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.failure_count, 0);
}

#[tokio::test]
async fn test_open_circuit_runs_fallback_as_nested_step() {
    let (engine, _clock) = engine_with_manual_clock();

    engine.define("hooked", WorkflowOptions::default(), |ctx| async move {
        ctx.step_with(
            "p",
            StepPolicy::default().with_max_attempts(1).with_circuit_breaker(
                CircuitBreakerPolicy::named("hooked-svc")
                    .with_failure_threshold(1)
                    .with_reset_timeout(Duration::from_secs(60))
                    .on_open(|ctx| async move {
                        ctx.step("queue-for-later", |_| async { Ok(json!("queued")) })
                            .await
                    }),
            ),
            |_| async { Err(WorkflowError::external_service("svc", "op", "503")) },
        )
        .await
    });

    // First execution fails and opens the breaker (threshold 1)
    let err = engine.start("hooked", "h1", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalService);

    // Second execution takes the fallback path
    let output = engine.start("hooked", "h2", json!({})).await.unwrap();
    assert_eq!(output, json!("queued"));

    let steps = engine.steps("h2").await.unwrap();
    let names: Vec<_> = steps.iter().map(|s| s.step_name.as_str()).collect();
    assert!(names.contains(&"p:onOpen"));
    assert!(names.contains(&"queue-for-later"));

    let p = steps.iter().find(|s| s.step_name == "p").unwrap();
    assert_eq!(p.status, StepStatus::Completed);
    assert_eq!(p.output, Some(json!("queued")));
}

// ============================================
// Lock contention
// ============================================

#[tokio::test]
async fn test_concurrent_start_of_same_execution() {
    let engine = test_engine();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    {
        let entered = entered.clone();
        let release = release.clone();
        engine.define("slow", WorkflowOptions::default(), move |ctx| {
            let entered = entered.clone();
            let release = release.clone();
            async move {
                ctx.step("hold", move |_| {
                    let entered = entered.clone();
                    let release = release.clone();
                    async move {
                        entered.notify_one();
                        release.notified().await;
                        Ok(json!("done"))
                    }
                })
                .await
            }
        });
    }

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start("slow", "e5", json!({})).await })
    };

    // Wait until the first run is inside the step body and holds the lock
    entered.notified().await;

    // The in-flight execution shows up in crash-recovery sweeps
    let running = engine.resumable().await.unwrap();
    assert!(running.iter().any(|e| e.id == "e5"));

    let second = engine.start("slow", "e5", json!({})).await;
    match second {
        Err(WorkflowError::AlreadyRunning { execution_id }) => assert_eq!(execution_id, "e5"),
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    release.notify_one();
    let first = first.await.unwrap();
    tokio_test::assert_ok!(first);

    let execution = engine.execution("e5").await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

// ============================================
// Nested fallback
// ============================================

#[test_log::test(tokio::test)]
async fn test_error_handler_runs_nested_compensating_step() {
    let engine = test_engine();

    engine.define("payment", WorkflowOptions::default(), |ctx| async move {
        ctx.step_with(
            "pay",
            StepPolicy::default().with_max_attempts(1).on_error(
                ErrorKind::ExternalService,
                |_err, ctx| async move {
                    ctx.step("pay-fallback", |_| async { Ok(json!("fallback-receipt")) })
                        .await
                },
            ),
            |_| async { Err(WorkflowError::external_service("gateway", "charge", "503")) },
        )
        .await
    });

    let output = engine.start("payment", "e6", json!({})).await.unwrap();
    assert_eq!(output, json!("fallback-receipt"));

    let steps = engine.steps("e6").await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].step_name, "pay");
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[0].output, Some(json!("fallback-receipt")));
    assert_eq!(steps[1].step_name, "pay-fallback");
    assert_eq!(steps[1].status, StepStatus::Completed);
}

#[tokio::test]
async fn test_catch_all_handler_recovers_unmatched_kinds() {
    let engine = test_engine();

    engine.define("caught", WorkflowOptions::default(), |ctx| async move {
        ctx.step_with(
            "risky",
            StepPolicy::default()
                .with_max_attempts(1)
                .on_error(ErrorKind::Timeout, |_err, _ctx| async move {
                    Ok(json!("timeout-path"))
                })
                .catch(|err, _ctx| async move { Ok(json!(format!("caught: {}", err.kind()))) }),
            |_| async { Err(WorkflowError::app("boom")) },
        )
        .await
    });

    let output = engine.start("caught", "e7", json!({})).await.unwrap();
    assert_eq!(output, json!("caught: app"));
}

#[tokio::test]
async fn test_rethrowing_handler_falls_through_to_retry() {
    let engine = test_engine();
    let handler_runs = Arc::new(AtomicU32::new(0));

    {
        let handler_runs = handler_runs.clone();
        engine.define("rethrow", WorkflowOptions::default(), move |ctx| {
            let handler_runs = handler_runs.clone();
            async move {
                ctx.step_with(
                    "x",
                    StepPolicy::default()
                        .with_max_attempts(2)
                        .with_backoff(Duration::from_millis(1))
                        .catch(move |err, _ctx| {
                            let handler_runs = handler_runs.clone();
                            async move {
                                handler_runs.fetch_add(1, Ordering::SeqCst);
                                Err(err)
                            }
                        }),
                    |_| async { Err(WorkflowError::app("boom")) },
                )
                .await
            }
        });
    }

    let err = engine.start("rethrow", "e8", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::App);

    // Handler consulted on both attempts; rethrow kept the failure path
    assert_eq!(handler_runs.load(Ordering::SeqCst), 2);

    let steps = engine.steps("e8").await.unwrap();
    assert_eq!(steps[0].attempt, 2);
    assert_eq!(steps[0].status, StepStatus::Failed);
}

// ============================================
// Cancellation
// ============================================

#[tokio::test]
async fn test_cancel_refuses_subsequent_steps() {
    let engine = test_engine();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let second_ran = Arc::new(AtomicBool::new(false));

    {
        let entered = entered.clone();
        let release = release.clone();
        let second_ran = second_ran.clone();
        engine.define("cancellable", WorkflowOptions::default(), move |ctx| {
            let entered = entered.clone();
            let release = release.clone();
            let second_ran = second_ran.clone();
            async move {
                ctx.step("first", move |_| {
                    let entered = entered.clone();
                    let release = release.clone();
                    async move {
                        entered.notify_one();
                        release.notified().await;
                        Ok(json!(1))
                    }
                })
                .await?;

                ctx.step("second", move |_| {
                    let second_ran = second_ran.clone();
                    async move {
                        second_ran.store(true, Ordering::SeqCst);
                        Ok(json!(2))
                    }
                })
                .await
            }
        });
    }

    let run = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start("cancellable", "c1", json!({})).await })
    };

    entered.notified().await;
    engine.cancel("c1").await.unwrap();
    release.notify_one();

    let err = run.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    // The in-flight step finished; the next step never started
    assert!(!second_ran.load(Ordering::SeqCst));
    let steps = engine.steps("c1").await.unwrap();
    assert!(steps.iter().all(|s| s.step_name != "second"));

    // Cancelled status sticks; failed is not written over it
    let execution = engine.execution("c1").await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
}

// ============================================
// Sleep and timers
// ============================================

#[tokio::test]
async fn test_sleep_is_a_memoized_step() {
    let engine = test_engine();

    engine.define("sleepy", WorkflowOptions::default(), |ctx| async move {
        ctx.sleep("nap", Duration::from_secs(3600)).await?;
        Ok(json!("rested"))
    });

    // NoopDelay: the hour-long nap returns immediately
    let output = engine.start("sleepy", "s1", json!({})).await.unwrap();
    assert_eq!(output, json!("rested"));

    let steps = engine.steps("s1").await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].step_name, "nap");
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[0].input, Some(json!({"sleep_ms": 3_600_000u64})));

    // Replay short-circuits without adding rows
    engine.start("sleepy", "s1", json!({})).await.unwrap();
    assert_eq!(engine.steps("s1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_step_timeout_fails_the_attempt() {
    let engine = engine_with_real_timers();

    engine.define("slow-step", WorkflowOptions::default(), |ctx| async move {
        ctx.step_with(
            "stuck",
            StepPolicy::default()
                .with_max_attempts(1)
                .with_timeout(Duration::from_millis(20)),
            |_| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!("too late"))
            },
        )
        .await
    });

    let err = engine.start("slow-step", "t1", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let steps = engine.steps("t1").await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
}

#[tokio::test]
async fn test_workflow_timeout() {
    let engine = engine_with_real_timers();

    engine.define(
        "slow-workflow",
        WorkflowOptions::default().with_timeout(Duration::from_millis(20)),
        |_ctx| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(json!("too late"))
        },
    );

    let err = engine
        .start("slow-workflow", "t2", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let execution = engine.execution("t2").await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

// ============================================
// Workflow-level retry
// ============================================

#[tokio::test]
async fn test_workflow_retry_reruns_handler_with_memoized_steps() {
    let engine = test_engine();
    let stable_runs = Arc::new(AtomicU32::new(0));
    let flaky_runs = Arc::new(AtomicU32::new(0));

    {
        let stable_runs = stable_runs.clone();
        let flaky_runs = flaky_runs.clone();
        engine.define(
            "retrying-wf",
            WorkflowOptions::default()
                .with_retry(RetryPolicy::fixed(Duration::from_millis(1), 2)),
            move |ctx| {
                let stable_runs = stable_runs.clone();
                let flaky_runs = flaky_runs.clone();
                async move {
                    ctx.step("stable", move |_| {
                        let stable_runs = stable_runs.clone();
                        async move {
                            stable_runs.fetch_add(1, Ordering::SeqCst);
                            Ok(json!("ok"))
                        }
                    })
                    .await?;

                    let attempt = ctx.attempt;
                    ctx.step_with(
                        "flaky",
                        StepPolicy::default().with_max_attempts(1),
                        move |_| {
                            let flaky_runs = flaky_runs.clone();
                            async move {
                                let n = flaky_runs.fetch_add(1, Ordering::SeqCst) + 1;
                                if n == 1 {
                                    Err(WorkflowError::app("first attempt fails"))
                                } else {
                                    Ok(json!(n))
                                }
                            }
                        },
                    )
                    .await?;

                    Ok(json!({ "attempt": attempt }))
                }
            },
        );
    }

    let output = engine.start("retrying-wf", "wr1", json!({})).await.unwrap();
    assert_eq!(output, json!({ "attempt": 2 }));

    // The stable step ran once; its second pass replayed from the store
    assert_eq!(stable_runs.load(Ordering::SeqCst), 1);
    assert_eq!(flaky_runs.load(Ordering::SeqCst), 2);

    let execution = engine.execution("wr1").await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    let attempt = execution
        .metadata
        .as_ref()
        .and_then(|m| m.get("attempt"))
        .and_then(Value::as_u64);
    assert_eq!(attempt, Some(2));
}

// ============================================
// Engine errors and status gates
// ============================================

#[tokio::test]
async fn test_unknown_workflow() {
    let engine = test_engine();
    let err = engine.start("ghost", "e9", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownWorkflow);
}

#[tokio::test]
async fn test_resume_gates() {
    let engine = test_engine();
    engine.define("simple", WorkflowOptions::default(), |_ctx| async move {
        Ok(json!("done"))
    });

    // Missing execution
    let err = engine.resume("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionNotFound);

    // Completed executions are not resumable
    engine.start("simple", "e10", json!({})).await.unwrap();
    let err = engine.resume("e10").await.unwrap_err();
    match err {
        WorkflowError::NotResumable { status, .. } => assert_eq!(status, "completed"),
        other => panic!("expected NotResumable, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pause_then_resume() {
    let engine = test_engine();
    let runs = Arc::new(AtomicU32::new(0));

    {
        let runs = runs.clone();
        engine.define("pausable", WorkflowOptions::default(), move |ctx| {
            let runs = runs.clone();
            async move {
                ctx.step("work", move |_| {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(json!("done"))
                    }
                })
                .await
            }
        });
    }

    engine.start("pausable", "p1", json!({})).await.unwrap();
    engine.pause("p1").await.unwrap();

    let execution = engine.execution("p1").await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Paused);

    // Resume replays the completed step and finishes again
    let output = engine.resume("p1").await.unwrap();
    assert_eq!(output, json!("done"));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

// ============================================
// Ordering and referential integrity
// ============================================

#[tokio::test]
async fn test_step_rows_follow_program_order() {
    let engine = test_engine();

    engine.define("ordered", WorkflowOptions::default(), |ctx| async move {
        for name in ["one", "two", "three", "four", "five"] {
            ctx.step(name, |_| async { Ok(json!(null)) }).await?;
        }
        Ok(json!("done"))
    });

    engine.start("ordered", "ord1", json!({})).await.unwrap();

    let steps = engine.steps("ord1").await.unwrap();
    let names: Vec<_> = steps.iter().map(|s| s.step_name.as_str()).collect();
    assert_eq!(names, vec!["one", "two", "three", "four", "five"]);
}

#[tokio::test]
async fn test_every_step_references_an_existing_execution() {
    let engine = test_engine();

    engine.define("a-wf", WorkflowOptions::default(), |ctx| async move {
        ctx.step("s", |_| async { Ok(json!(1)) }).await
    });
    engine.define("b-wf", WorkflowOptions::default(), |ctx| async move {
        ctx.step("s", |_| async { Ok(json!(2)) }).await
    });

    engine.start("a-wf", "ri1", json!({})).await.unwrap();
    engine.start("b-wf", "ri2", json!({})).await.unwrap();

    for execution_id in ["ri1", "ri2"] {
        for step in engine.steps(execution_id).await.unwrap() {
            let execution = engine.execution(&step.execution_id).await.unwrap();
            assert!(execution.is_some(), "orphaned step {}", step.step_name);
        }
    }
}

// ============================================
// Step input payloads
// ============================================

#[tokio::test]
async fn test_step_input_is_persisted() {
    let engine = test_engine();

    engine.define("with-input", WorkflowOptions::default(), |ctx| async move {
        ctx.step_with(
            "lookup",
            StepPolicy::default().with_input(json!({"customer": "acme"})),
            |_| async { Ok(json!("found")) },
        )
        .await
    });

    engine.start("with-input", "in1", json!({})).await.unwrap();

    let steps = engine.steps("in1").await.unwrap();
    assert_eq!(steps[0].input, Some(json!({"customer": "acme"})));
}

// ============================================
// Failed execution error payloads
// ============================================

#[tokio::test]
async fn test_error_payload_round_trips_through_the_store() {
    let engine = test_engine();

    engine.define("failing", WorkflowOptions::default(), |ctx| async move {
        ctx.step_with("x", StepPolicy::default().with_max_attempts(1), |_| async {
            Err(WorkflowError::external_service("billing", "charge", "503"))
        })
        .await
    });

    engine.start("failing", "f1", json!({})).await.unwrap_err();

    let execution = engine.execution("f1").await.unwrap().unwrap();
    let stored = execution.error.unwrap();
    let parsed: WorkflowError = serde_json::from_value(stored).unwrap();
    assert_eq!(parsed.kind(), ErrorKind::ExternalService);
    match parsed {
        WorkflowError::ExternalService { service, operation, .. } => {
            assert_eq!(service, "billing");
            assert_eq!(operation, "charge");
        }
        other => panic!("unexpected error variant: {other:?}"),
    }
}
