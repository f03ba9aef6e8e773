//! The all-must-succeed combinator.

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::task::Poll;

use crate::combinator::{open_scope, Ctx};
use crate::context::WithStore;
use crate::error::Result;
use crate::scope::ScopeKind;

/// Runs `cb` in a fresh scope and waits for every scope-bound task.
///
/// The callback and the tasks it starts run concurrently. The first
/// failure — a task rejecting with a non-cancellation error, or the
/// callback itself rejecting — closes the scope, cancelling every other
/// scope-bound task with a scope-closed reason, and becomes `sync`'s error.
/// On success, `sync` resolves with the callback's value once every
/// scope-bound task has reached a terminal state.
pub async fn sync<R, F, Fut>(cb: F) -> Result<R>
where
    F: FnOnce(Ctx) -> Fut,
    Fut: std::future::Future<Output = Result<R>>,
{
    let (scope, store) = open_scope(ScopeKind::Sync);
    let ctx = Ctx::new(scope.clone(), store.clone());
    // Invoke the callback inside the frame so even its synchronous prefix
    // observes the scope store.
    let mut body = Some(WithStore::new(store, async move { cb(ctx).await }));
    let mut body_value: Option<R> = None;

    let watcher = scope.clone();
    let result = poll_fn(move |cx| {
        if let Some(fut) = body.as_mut() {
            match Pin::new(fut).poll(cx) {
                Poll::Ready(Ok(value)) => {
                    body_value = Some(value);
                    body = None;
                }
                Poll::Ready(Err(error)) => {
                    body = None;
                    return Poll::Ready(Err(error));
                }
                Poll::Pending => {}
            }
        }
        if let Some(error) = watcher.take_first_failure() {
            // Dropping the body is its cancellation.
            body = None;
            return Poll::Ready(Err(error));
        }
        if body.is_none() && watcher.entries_terminal() {
            if let Some(value) = body_value.take() {
                return Poll::Ready(Ok(value));
            }
        }
        watcher.add_waiter(cx.waker());
        Poll::Pending
    })
    .await;

    scope.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::runtime::Runtime;
    use crate::types::{CancelReason, TaskStatus};
    use std::time::Duration;

    #[test]
    fn resolves_with_the_callback_value() {
        let mut rt = Runtime::lab();
        let out = rt.block_on(async {
            sync(|ctx| async move {
                let a = ctx.task(|_| async { Ok(1) });
                let b = ctx.task(|_| async { Ok(2) });
                Ok(a.await? + b.await?)
            })
            .await
        });
        assert_eq!(out.expect("both tasks succeed"), 3);
    }

    #[test]
    fn waits_for_unawaited_tasks_before_resolving() {
        let mut rt = Runtime::lab();
        let mut finished_at = None;
        let out = rt.block_on(async {
            let result = sync(|ctx| async move {
                let _slow = ctx.task(|signal| async move {
                    crate::time::sleep_cancellable(Duration::from_millis(80), &signal).await?;
                    Ok(())
                });
                Ok(9)
            })
            .await;
            finished_at = Some(crate::runtime::Handle::expect_current("test").now());
            result
        });
        assert_eq!(out.expect("callback value"), 9);
        assert!(finished_at.expect("ran") >= crate::types::Time::from_millis(80));
    }

    #[test]
    fn first_failure_cancels_the_siblings() {
        let mut rt = Runtime::lab();
        let (err, sibling_status, sibling_err) = rt.block_on(async {
            let sibling = std::rc::Rc::new(std::cell::RefCell::new(None));
            let stash = sibling.clone();
            let err = sync(move |ctx| async move {
                let pending = ctx.task(|signal| async move {
                    let reason = signal.cancelled().await;
                    Err::<(), _>(Error::canceled(reason))
                });
                *stash.borrow_mut() = Some(pending);
                let failing: crate::task::TaskHandle<()> =
                    ctx.task(|_| async { Err(Error::user("first failure")) });
                failing.await?;
                Ok(())
            })
            .await
            .expect_err("sync rejects with the first failure");

            let handle = sibling.borrow_mut().take().expect("sibling stashed");
            let status = handle.status();
            let sibling_err = handle.await.expect_err("sibling rejects");
            (err, status, sibling_err)
        });
        assert_eq!(err.to_string(), "first failure");
        assert_eq!(sibling_status, TaskStatus::Canceled);
        assert_eq!(
            sibling_err.cancel_reason(),
            Some(&CancelReason::ScopeClosed)
        );
    }

    #[test]
    fn callback_rejection_closes_the_scope() {
        let mut rt = Runtime::lab();
        let (err, status) = rt.block_on(async {
            let stash = std::rc::Rc::new(std::cell::RefCell::new(None));
            let stash2 = stash.clone();
            let err = sync(move |ctx| async move {
                let task = ctx.task(|signal| async move {
                    let reason = signal.cancelled().await;
                    Err::<(), _>(Error::canceled(reason))
                });
                *stash2.borrow_mut() = Some(task);
                Err::<(), _>(Error::user("callback bailed"))
            })
            .await
            .expect_err("callback error propagates");
            let status = stash.borrow().as_ref().expect("task stashed").status();
            (err, status)
        });
        assert_eq!(err.to_string(), "callback bailed");
        assert_eq!(status, TaskStatus::Canceled);
    }

    #[test]
    fn sibling_cancellations_do_not_mask_the_first_failure() {
        let mut rt = Runtime::lab();
        let err = rt.block_on(async {
            sync(|ctx| async move {
                for _ in 0..3 {
                    let _ = ctx.task(|signal| async move {
                        let reason = signal.cancelled().await;
                        Err::<(), _>(Error::canceled(reason))
                    });
                }
                let failing: crate::task::TaskHandle<()> =
                    ctx.task(|_| async { Err(Error::user("root cause")) });
                failing.await?;
                Ok(())
            })
            .await
            .expect_err("fails")
        });
        assert_eq!(err.to_string(), "root cause");
    }
}
