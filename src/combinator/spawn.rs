//! Leaf and escape-hatch combinators: `spawn`, `spawn_detached`,
//! `spawn_scope`.

use std::future::{poll_fn, Future};
use std::task::Poll;

use crate::combinator::{open_scope, Ctx};
use crate::context::WithStore;
use crate::error::Result;
use crate::runtime::Handle;
use crate::scope::ScopeKind;
use crate::signal::CancelSignal;
use crate::task::{run_task, TaskHandle, TaskOptions};

/// Wraps the whole execution of `cb` as a single task in its own scope.
///
/// The new scope is linked to the ambient parent scope, so closing the
/// parent cancels the spawned work; the returned task is deliberately *not*
/// registered in the parent's entries — it is a leaf the caller owns
/// through the handle. The spawn scope closes when the body settles,
/// cancelling any stragglers it started.
///
/// # Panics
///
/// Panics when called outside a runtime.
pub fn spawn<T, F, Fut>(cb: F) -> TaskHandle<T>
where
    F: FnOnce(Ctx) -> Fut + 'static,
    Fut: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    let (scope, store) = open_scope(ScopeKind::Spawn);
    let ctx = Ctx::new(scope.clone(), store.clone());
    let body = WithStore::new(store, async move { cb(ctx).await });
    let owner = scope.clone();
    run_task(
        move |_signal| async move {
            let result = body.await;
            owner.close();
            result
        },
        TaskOptions::new().signal(scope.signal()),
    )
}

/// Starts a task bound to no parent signal: the intentional escape hatch.
///
/// The task is not cancelled by any ambient scope. Strict mode flags this
/// only when it is also used outside any scope.
///
/// # Panics
///
/// Panics when called outside a runtime.
pub fn spawn_detached<T, W, F>(work: W) -> TaskHandle<T>
where
    W: FnOnce(CancelSignal) -> F,
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    run_task(work, TaskOptions::new())
}

/// Like `sync`, but returns as soon as the callback settles.
///
/// Tasks the callback started keep running; the scope stays open until
/// every one of them is terminal, at which point a background reaper
/// closes it.
///
/// # Panics
///
/// Panics when called outside a runtime.
pub async fn spawn_scope<R, F, Fut>(cb: F) -> Result<R>
where
    F: FnOnce(Ctx) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let (scope, store) = open_scope(ScopeKind::Sync);
    let ctx = Ctx::new(scope.clone(), store.clone());
    match WithStore::new(store, async move { cb(ctx).await }).await {
        Err(error) => {
            scope.close();
            Err(error)
        }
        Ok(value) => {
            if scope.entries_terminal() {
                scope.close();
            } else {
                let reaper = scope.clone();
                Handle::expect_current("spawn_scope").spawn(async move {
                    poll_fn(|cx| {
                        if reaper.entries_terminal() {
                            Poll::Ready(())
                        } else {
                            reaper.add_waiter(cx.waker());
                            Poll::Pending
                        }
                    })
                    .await;
                    reaper.close();
                });
            }
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::runtime::Runtime;
    use crate::scope::run_in_scope;
    use crate::types::TaskStatus;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn spawn_returns_an_awaitable_leaf() {
        let mut rt = Runtime::lab();
        let out = rt.block_on(async {
            run_in_scope(
                |_scope| async move {
                    let task = spawn(|ctx| async move {
                        let sub = ctx.task(|_| async { Ok(21) });
                        Ok(sub.await? * 2)
                    });
                    task.await
                },
                None,
            )
            .await
        });
        assert_eq!(out.expect("spawned body value"), 42);
    }

    #[test]
    fn spawn_is_canceled_with_its_parent_scope() {
        let mut rt = Runtime::lab();
        let stash = Rc::new(RefCell::new(None));
        let stash2 = stash.clone();
        rt.block_on(async move {
            run_in_scope(
                |_scope| {
                    let stash = stash2.clone();
                    async move {
                        let task: TaskHandle<()> = spawn(|ctx| async move {
                            ctx.sleep(Duration::from_secs(60)).await?;
                            Ok(())
                        });
                        *stash.borrow_mut() = Some(task);
                        crate::time::sleep(Duration::from_millis(1)).await;
                        Ok(())
                    }
                },
                None,
            )
            .await
            .expect("scope body succeeds");
        });
        let task = stash.borrow_mut().take().expect("task stashed");
        assert_eq!(task.status(), TaskStatus::Canceled);
    }

    #[test]
    fn spawn_detached_survives_the_ambient_scope() {
        let mut rt = Runtime::lab();
        let status = rt.block_on(async {
            let stash = Rc::new(RefCell::new(None));
            let stash2 = stash.clone();
            run_in_scope(
                |_scope| {
                    let stash = stash2.clone();
                    async move {
                        let task = spawn_detached(|_signal| async {
                            crate::time::sleep(Duration::from_millis(5)).await;
                            Ok(7)
                        });
                        *stash.borrow_mut() = Some(task);
                        Ok(())
                    }
                },
                None,
            )
            .await
            .expect("scope body succeeds");
            // The scope closed, but the detached task was not cancelled.
            let task = stash.borrow_mut().take().expect("task stashed");
            task.await
        });
        assert_eq!(status.expect("detached task completes"), 7);
    }

    #[test]
    fn spawn_scope_returns_before_its_tasks_finish() {
        let mut rt = Runtime::lab();
        let (value, status_at_return, final_status) = rt.block_on(async {
            let stash = Rc::new(RefCell::new(None));
            let stash2 = stash.clone();
            let value = spawn_scope(move |ctx| async move {
                let task = ctx.task(|signal| async move {
                    crate::time::sleep_cancellable(Duration::from_millis(30), &signal).await?;
                    Ok(())
                });
                *stash2.borrow_mut() = Some(task);
                Ok(5)
            })
            .await
            .expect("callback value");
            let status_at_return = stash.borrow().as_ref().expect("stashed").status();
            crate::time::sleep(Duration::from_millis(60)).await;
            let final_status = stash.borrow().as_ref().expect("stashed").status();
            (value, status_at_return, final_status)
        });
        assert_eq!(value, 5);
        assert_eq!(status_at_return, TaskStatus::Running);
        assert_eq!(final_status, TaskStatus::Completed);
    }

    #[test]
    fn spawn_scope_propagates_callback_errors() {
        let mut rt = Runtime::lab();
        let err = rt.block_on(async {
            spawn_scope::<(), _, _>(|_ctx| async { Err(Error::user("nope")) })
                .await
                .expect_err("callback error")
        });
        assert_eq!(err.to_string(), "nope");
    }
}
