//! Scope-creating combinators and scope-aware helpers.
//!
//! Each combinator opens a scope of its kind, links it to the ambient
//! parent scope when one exists, installs the scope store, and hands the
//! user callback a context for starting scope-bound tasks. The completion
//! rule is what distinguishes them:
//!
//! - [`sync`]: all-must-succeed; first failure cancels the siblings
//! - [`race`]: first settle wins; losers are cancelled
//! - [`rush`]: first settle is the result; losers are awaited
//! - [`branch`]: fire-and-hold; cancelled when the enclosing scope closes
//! - [`spawn`]: parent-linked leaf task with its own scope
//! - [`spawn_detached`]: the intentional escape hatch — no parent signal
//! - [`spawn_scope`]: like `sync`, but returns at callback settlement

mod branch;
mod ctx;
mod join;
mod limit;
mod race;
mod retry;
mod spawn;
mod sync;

pub use branch::branch;
pub use ctx::{Ctx, RaceCtx};
pub use join::{join_all, join_all_settled, race_settled};
pub use limit::{Limiter, LimitOptions};
pub use race::{race, rush};
pub use retry::{retry, Backoff, RetryPolicy};
pub use spawn::{spawn, spawn_detached, spawn_scope};
pub use sync::sync;

use std::rc::Rc;

use crate::context::ScopeStore;
use crate::scope::{Scope, ScopeKind};
use crate::strict;

/// Opens a scope linked to the ambient parent and builds its store frame,
/// arming the inherited strict-cancellation watch when present.
pub(crate) fn open_scope(kind: ScopeKind) -> (Scope, Rc<ScopeStore>) {
    let parent = ScopeStore::current_scope();
    let scope = Scope::new(kind, parent.as_ref());
    let store = ScopeStore::for_scope(scope.clone());
    if let Some(watch) = store.watch() {
        strict::arm_watch(&scope, &watch);
    }
    (scope, store)
}
