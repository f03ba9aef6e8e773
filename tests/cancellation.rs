//! Cancellation propagation, strict-mode checks, and debug events,
//! exercised through the public surface.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskscope::strict::{disable_strict_mode, StrictPolicy};
use taskscope::test_util::{run_test, serial_guard};
use taskscope::trace::disable_task_debug;
use taskscope::{
    branch, enable_strict_mode, enable_task_debug, run_in_scope, run_task, subscribe_task_debug,
    sync, with_strict_cancellation, CancelReason, Error, StrictCancellationOptions, StrictOptions,
    TaskEvent, TaskOptions, TaskStatus,
};

#[test]
fn user_abort_reason_passes_through_to_task_rejections() {
    let rejection = run_test(|| async {
        let _serial = serial_guard();
        sync(|ctx| async move {
            let task = ctx.task(|signal| async move {
                let reason = signal.cancelled().await;
                Err::<(), _>(Error::canceled(reason))
            });
            ctx.scope()
                .abort_with(CancelReason::user_abort_with("operator stop"));
            Ok(task.await.expect_err("task was canceled"))
        })
        .await
        .expect("sync resolves: cancellations are not failures")
    });
    assert_eq!(
        rejection.cancel_reason(),
        Some(&CancelReason::user_abort_with("operator stop"))
    );
}

#[test]
fn parent_scope_abort_cancels_nested_combinator_tasks() {
    let status = run_test(|| async {
        let _serial = serial_guard();
        let stash = Rc::new(RefCell::new(None));
        let keeper = stash.clone();
        let _ = run_in_scope(
            |scope| {
                let keeper = keeper.clone();
                async move {
                    scope.abort_with(CancelReason::user_abort_with("top level"));
                    // A combinator opened under an already-aborted parent is
                    // born into cancellation.
                    let _ = sync(move |ctx| async move {
                        let task: taskscope::TaskHandle<()> =
                            ctx.task(|_| async { Ok(()) });
                        *keeper.borrow_mut() = Some(task);
                        Ok(())
                    })
                    .await;
                    Ok(())
                }
            },
            None,
        )
        .await;
        let status = stash.borrow().as_ref().map(|task| task.status());
        status
    });
    assert_eq!(status, Some(TaskStatus::Canceled));
}

#[test]
fn debug_events_trace_a_sync_run() {
    let events = run_test(|| async {
        let _serial = serial_guard();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = subscribe_task_debug(move |event: &TaskEvent| {
            sink.lock().expect("sink").push(event.stable_name().to_string());
        });
        enable_task_debug();
        let _ = sync(|ctx| async move {
            let task = ctx.task_named("traced", |_| async { Ok(1) });
            task.await
        })
        .await;
        disable_task_debug();
        sub.unsubscribe();
        let events = seen.lock().expect("sink").clone();
        events
    });
    assert_eq!(
        events,
        vec![
            "scope_opened",
            "task_registered",
            "task_updated",
            "scope_closed"
        ]
    );
}

#[test]
fn strict_mode_reports_orphans_at_scope_exit() {
    let warnings = run_test(|| async {
        let _serial = serial_guard();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        enable_strict_mode(StrictOptions::new().policy(StrictPolicy::Warn).on_warn(
            move |message| {
                sink.lock().expect("sink").push(message.to_string());
            },
        ));
        let _ = run_in_scope(
            |scope| async move {
                let _task = run_task(
                    |signal| async move {
                        let reason = signal.cancelled().await;
                        Err::<(), _>(Error::canceled(reason))
                    },
                    TaskOptions::new().signal(scope.signal()).name("straggler"),
                );
                Ok(())
            },
            None,
        )
        .await;
        disable_strict_mode();
        let warnings = seen.lock().expect("sink").clone();
        warnings
    });
    assert!(
        warnings
            .iter()
            .any(|w| w.contains("straggler") && w.contains("still running")),
        "expected an orphan warning, got {warnings:?}"
    );
}

#[test]
fn strict_mode_flags_unstructured_tasks_and_bare_branches() {
    let warnings = run_test(|| async {
        let _serial = serial_guard();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        enable_strict_mode(StrictOptions::new().on_warn(move |message| {
            sink.lock().expect("sink").push(message.to_string());
        }));

        // No signal, no ambient scope.
        let unstructured = run_task(|_| async { Ok(7) }, TaskOptions::new());
        let _ = unstructured.await;

        // No enclosing scope for the branch.
        branch(|_ctx| async { Ok(()) });
        taskscope::sleep(Duration::from_millis(1)).await;

        disable_strict_mode();
        let warnings = seen.lock().expect("sink").clone();
        warnings
    });
    assert!(
        warnings.iter().any(|w| w.contains("outside any scope")),
        "expected an unstructured-task warning, got {warnings:?}"
    );
    assert!(
        warnings
            .iter()
            .any(|w| w.contains("branch used without a parent scope")),
        "expected a bare-branch warning, got {warnings:?}"
    );
}

#[test]
fn strict_mode_flags_cancellation_nobody_listens_to() {
    let warnings = run_test(|| async {
        let _serial = serial_guard();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        enable_strict_mode(StrictOptions::new().on_warn(move |message| {
            sink.lock().expect("sink").push(message.to_string());
        }));
        let _ = sync(|ctx| async move {
            // Never registers on_cancel, then gets cancelled by the abort.
            ctx.task_named("deaf", |signal| async move {
                let reason = signal.cancelled().await;
                Err::<(), _>(Error::canceled(reason))
            });
            ctx.scope().abort();
            Ok(())
        })
        .await;
        disable_strict_mode();
        let warnings = seen.lock().expect("sink").clone();
        warnings
    });
    assert!(
        warnings
            .iter()
            .any(|w| w.contains("deaf") && w.contains("no on_cancel handler")),
        "expected an ignored-cancellation warning, got {warnings:?}"
    );
}

#[test]
fn cancellation_watchdog_names_tasks_that_ignore_their_signal() {
    let warnings = run_test(|| async {
        let _serial = serial_guard();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        enable_strict_mode(StrictOptions::new().on_warn(move |message| {
            sink.lock().expect("sink").push(message.to_string());
        }));

        let _ = with_strict_cancellation(
            |scope| async move {
                // Plain sleep: deliberately ignores the signal.
                let _task = run_task(
                    |_signal| async {
                        taskscope::sleep(Duration::from_secs(10)).await;
                        Ok(())
                    },
                    TaskOptions::new().signal(scope.signal()).name("stubborn"),
                );
                Ok(())
            },
            StrictCancellationOptions::new().warn_after(Duration::from_millis(50)),
        )
        .await;

        // Let the watchdog timer elapse.
        taskscope::sleep(Duration::from_millis(100)).await;
        disable_strict_mode();
        let warnings = seen.lock().expect("sink").clone();
        warnings
    });
    assert!(
        warnings
            .iter()
            .any(|w| w.contains("stubborn") && w.contains("has not settled")),
        "expected a watchdog warning, got {warnings:?}"
    );
}

#[test]
fn on_cancel_is_exactly_once_even_when_registered_late() {
    let count = run_test(|| async {
        let _serial = serial_guard();
        let count = Rc::new(RefCell::new(0));
        let probe = count.clone();
        let _ = sync(move |ctx| async move {
            let task: taskscope::TaskHandle<()> = ctx.task(|signal| async move {
                let reason = signal.cancelled().await;
                Err(Error::canceled(reason))
            });
            let early = probe.clone();
            task.on_cancel(move |_| *early.borrow_mut() += 1);
            ctx.scope().abort();
            // Already canceled: runs synchronously, exactly once.
            let late = probe.clone();
            task.on_cancel(move |_| *late.borrow_mut() += 1);
            Ok(())
        })
        .await;
        let count = *count.borrow();
        count
    });
    assert_eq!(count, 2);
}
