//! Fire-and-hold: concurrent work held by the enclosing scope.

use std::future::Future;

use crate::combinator::{open_scope, Ctx};
use crate::context::{ScopeStore, WithStore};
use crate::error::Result;
use crate::runtime::Handle;
use crate::scope::ScopeKind;
use crate::strict::{self, Violation};

/// Starts `cb` concurrently, held by the enclosing scope.
///
/// Returns immediately — the callback body is never awaited here; it runs
/// strictly after the caller's current synchronous section. The branch
/// scope is bridged to the enclosing scope, so the branch's tasks are
/// cancelled when the enclosing scope closes or when the branch body
/// settles, whichever comes first.
///
/// Without an enclosing scope the branch still runs, degraded: its scope
/// closes when the body settles, and strict mode flags the call.
///
/// # Panics
///
/// Panics when called outside a runtime.
pub fn branch<F, Fut>(cb: F)
where
    F: FnOnce(Ctx) -> Fut + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    let handle = Handle::expect_current("branch");
    if ScopeStore::current().is_none() {
        strict::check(Violation::BranchWithoutParent);
    }
    let (scope, store) = open_scope(ScopeKind::Branch);
    let ctx = Ctx::new(scope.clone(), store.clone());
    let body = WithStore::new(store, async move { cb(ctx).await });

    let owner = scope;
    handle.spawn(async move {
        if let Err(error) = body.await {
            if !error.is_canceled() {
                tracing::warn!(scope = %owner.id(), error = %error, "branch body failed");
            }
        }
        owner.close();
    });
}
