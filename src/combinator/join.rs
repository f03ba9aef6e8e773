//! Post-hoc combinators over already-started task handles.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::{Error, ErrorKind, Result};
use crate::task::TaskHandle;

/// Awaits every handle, resolving with the values in input order.
///
/// The first rejection becomes the result immediately; the remaining tasks
/// are left running (join does not own them — their scope does).
pub fn join_all<T>(tasks: Vec<TaskHandle<T>>) -> JoinAll<T> {
    let results = tasks.iter().map(|_| None).collect();
    JoinAll {
        tasks: tasks.into_iter().map(Some).collect(),
        results,
    }
}

/// Future returned by [`join_all`].
pub struct JoinAll<T> {
    tasks: Vec<Option<TaskHandle<T>>>,
    results: Vec<Option<T>>,
}

impl<T: Unpin> Future for JoinAll<T> {
    type Output = Result<Vec<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut pending = false;
        for index in 0..this.tasks.len() {
            if let Some(task) = &mut this.tasks[index] {
                match Pin::new(task).poll(cx) {
                    Poll::Ready(Ok(value)) => {
                        this.results[index] = Some(value);
                        this.tasks[index] = None;
                    }
                    Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                    Poll::Pending => pending = true,
                }
            }
        }
        if pending {
            return Poll::Pending;
        }
        let collected: Option<Vec<T>> = this.results.iter_mut().map(Option::take).collect();
        Poll::Ready(collected.ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("join_all polled after completion")
        }))
    }
}

/// Awaits the first handle to settle, resolving or rejecting with its
/// outcome.
pub fn race_settled<T>(tasks: Vec<TaskHandle<T>>) -> RaceSettled<T> {
    RaceSettled { tasks }
}

/// Future returned by [`race_settled`].
pub struct RaceSettled<T> {
    tasks: Vec<TaskHandle<T>>,
}

impl<T> Future for RaceSettled<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.tasks.is_empty() {
            return Poll::Ready(Err(Error::no_tasks("race")));
        }
        for task in &mut this.tasks {
            if let Poll::Ready(outcome) = Pin::new(task).poll(cx) {
                return Poll::Ready(outcome);
            }
        }
        Poll::Pending
    }
}

/// Awaits every handle, collecting every outcome in input order.
pub fn join_all_settled<T>(tasks: Vec<TaskHandle<T>>) -> JoinAllSettled<T> {
    let results = tasks.iter().map(|_| None).collect();
    JoinAllSettled {
        tasks: tasks.into_iter().map(Some).collect(),
        results,
    }
}

/// Future returned by [`join_all_settled`].
pub struct JoinAllSettled<T> {
    tasks: Vec<Option<TaskHandle<T>>>,
    results: Vec<Option<Result<T>>>,
}

impl<T: Unpin> Future for JoinAllSettled<T> {
    type Output = Vec<Result<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut pending = false;
        for index in 0..this.tasks.len() {
            if let Some(task) = &mut this.tasks[index] {
                match Pin::new(task).poll(cx) {
                    Poll::Ready(outcome) => {
                        this.results[index] = Some(outcome);
                        this.tasks[index] = None;
                    }
                    Poll::Pending => pending = true,
                }
            }
        }
        if pending {
            return Poll::Pending;
        }
        Poll::Ready(
            this.results
                .iter_mut()
                .map(|slot| {
                    slot.take().unwrap_or_else(|| {
                        Err(Error::new(ErrorKind::Internal)
                            .with_message("join_all_settled polled after completion"))
                    })
                })
                .collect(),
        )
    }
}
