//! First-settle combinators: `race` (cancel the rest) and `rush` (wait for
//! the rest).
//!
//! Both run the callback to completion first, so every entrant exists
//! before the wait begins, and both reject when the callback started no
//! tasks. The first entrant to reach a terminal state — by settle order,
//! not registration order — supplies the outcome.

use std::cell::RefCell;
use std::future::poll_fn;
use std::rc::Rc;
use std::task::Poll;

use crate::combinator::ctx::{RaceCtx, RaceSlot};
use crate::combinator::open_scope;
use crate::context::WithStore;
use crate::error::{Error, ErrorKind, Result};
use crate::scope::{Scope, ScopeKind};
use crate::types::TaskStatus;

/// Builds the outcome of the slot that settled first.
fn take_outcome<T>(slot: &RaceSlot<T>) -> Result<T> {
    match slot.record.status() {
        TaskStatus::Completed => {
            let taken = slot.value.lock().expect("race lock poisoned").take();
            taken.ok_or_else(|| {
                Error::new(ErrorKind::Internal).with_message("task result already consumed")
            })
        }
        TaskStatus::Failed => Err(slot
            .record
            .error()
            .unwrap_or_else(|| Error::new(ErrorKind::Internal))),
        TaskStatus::Canceled => {
            let reason = slot
                .record
                .cancel_reason()
                .unwrap_or(crate::types::CancelReason::ScopeClosed);
            let err = Error::canceled(reason);
            Err(match slot.record.name() {
                Some(name) => err.with_task_name(name),
                None => err,
            })
        }
        TaskStatus::Running => {
            Err(Error::new(ErrorKind::Internal).with_message("winner still running"))
        }
    }
}

/// Waits for the earliest-settling entrant and takes its outcome.
async fn first_settled<T>(scope: &Scope, slots: &Rc<RefCell<Vec<RaceSlot<T>>>>) -> Result<T> {
    let scope = scope.clone();
    let slots = slots.clone();
    poll_fn(move |cx| {
        let slots = slots.borrow();
        let mut winner: Option<(u64, usize)> = None;
        for (index, slot) in slots.iter().enumerate() {
            if let Some(seq) = slot.record.settle_seq() {
                if winner.map_or(true, |(best, _)| seq < best) {
                    winner = Some((seq, index));
                }
            }
        }
        match winner {
            Some((_, index)) => Poll::Ready(take_outcome(&slots[index])),
            None => {
                scope.add_waiter(cx.waker());
                Poll::Pending
            }
        }
    })
    .await
}

/// Waits until every scope-bound task is terminal.
async fn all_entries_terminal(scope: &Scope) {
    let scope = scope.clone();
    poll_fn(move |cx| {
        if scope.entries_terminal() {
            Poll::Ready(())
        } else {
            scope.add_waiter(cx.waker());
            Poll::Pending
        }
    })
    .await;
}

async fn first_settle_combinator<T, F, Fut>(
    name: &'static str,
    kind: ScopeKind,
    cancel_losers: bool,
    cb: F,
) -> Result<T>
where
    F: FnOnce(RaceCtx<T>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
    T: 'static,
{
    let (scope, store) = open_scope(kind);
    let slots: Rc<RefCell<Vec<RaceSlot<T>>>> = Rc::new(RefCell::new(Vec::new()));
    let ctx = RaceCtx::new(scope.clone(), store.clone(), slots.clone());

    if let Err(error) = WithStore::new(store, async move { cb(ctx).await }).await {
        scope.close();
        return Err(error);
    }
    if slots.borrow().is_empty() {
        scope.close();
        return Err(Error::no_tasks(name));
    }

    let outcome = first_settled(&scope, &slots).await;
    if !cancel_losers {
        all_entries_terminal(&scope).await;
    }
    scope.close();
    outcome
}

/// First settle wins; the rest are cancelled.
///
/// Runs `cb` so the entrants are created, then waits for the first of them
/// to settle — resolve or reject — and returns that outcome. Closing the
/// scope before returning cancels the pending losers with a scope-closed
/// reason. A callback that starts no tasks is an error with the stable
/// message `race: callback did not start any tasks`.
pub async fn race<T, F, Fut>(cb: F) -> Result<T>
where
    F: FnOnce(RaceCtx<T>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
    T: 'static,
{
    first_settle_combinator("race", ScopeKind::Race, true, cb).await
}

/// First settle is the result; the rest are awaited, not cancelled.
///
/// Like [`race`], but after capturing the first settle the combinator
/// waits for every other entrant to reach a terminal state before closing
/// the scope and returning.
pub async fn rush<T, F, Fut>(cb: F) -> Result<T>
where
    F: FnOnce(RaceCtx<T>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
    T: 'static,
{
    first_settle_combinator("rush", ScopeKind::Rush, false, cb).await
}
