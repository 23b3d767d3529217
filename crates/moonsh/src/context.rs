//! Execution context carrier.
//!
//! The guest runtime has no way to pass a context parameter through a call,
//! so the context of the in-flight invocation lives in one hidden registry
//! slot per session. Every invocation saves the slot, installs its own
//! context and restores the saved value on every exit path through
//! [`ContextGuard`]. Nested invocations therefore unwind in LIFO order.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mlua::{Lua, UserData, Value};
use tracing::{trace, warn};

use crate::cancel::CancelSignal;
use crate::shell::ShellSession;

const CONTEXT_SLOT: &str = "moonsh.context";

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Cancellation and shell identity for one in-flight guest invocation.
///
/// Two contexts are equal when they are the same context (or clones of it).
/// Extending a context with a shell session yields a new one.
#[derive(Clone)]
pub struct ExecutionContext {
    id: u64,
    cancel: CancelSignal,
    shell: Option<Arc<dyn ShellSession>>,
}

impl ExecutionContext {
    /// A context that is never cancelled and has no shell attached.
    pub fn background() -> Self {
        Self::with_cancel(CancelSignal::new())
    }

    /// A context observing `cancel`.
    pub fn with_cancel(cancel: CancelSignal) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            cancel,
            shell: None,
        }
    }

    /// Extend this context with the shell session running the invocation.
    pub fn with_shell(&self, shell: Arc<dyn ShellSession>) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            cancel: self.cancel.clone(),
            shell: Some(shell),
        }
    }

    /// Identifier unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The cancellation signal.
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Returns true if the invocation has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The shell session attached to this context.
    pub fn shell(&self) -> Option<&Arc<dyn ShellSession>> {
        self.shell.as_ref()
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ExecutionContext {}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("has_shell", &self.shell.is_some())
            .finish()
    }
}

struct ContextSlot(ExecutionContext);

impl UserData for ContextSlot {}

fn slot_value(lua: &Lua) -> mlua::Result<Value> {
    lua.named_registry_value::<Value>(CONTEXT_SLOT)
}

fn decode(value: &Value) -> Option<ExecutionContext> {
    match value {
        Value::UserData(ud) => ud.borrow::<ContextSlot>().ok().map(|slot| slot.0.clone()),
        _ => None,
    }
}

/// The context of the invocation currently running on `lua`.
pub fn current(lua: &Lua) -> Option<ExecutionContext> {
    slot_value(lua).ok().as_ref().and_then(decode)
}

/// Install `context` and return the one it replaced.
///
/// This is the flat form; invocations use [`ContextGuard`] so the prior
/// context comes back even when the call fails.
pub fn attach(lua: &Lua, context: ExecutionContext) -> mlua::Result<Option<ExecutionContext>> {
    let prior = decode(&slot_value(lua)?);
    lua.set_named_registry_value(CONTEXT_SLOT, ContextSlot(context))?;
    Ok(prior)
}

/// Scope that holds a context in the slot and restores the prior one on drop.
pub struct ContextGuard<'a> {
    lua: &'a Lua,
    prior: Option<Value>,
}

impl<'a> ContextGuard<'a> {
    /// Snapshot the slot and install `context`.
    pub fn enter(lua: &'a Lua, context: ExecutionContext) -> mlua::Result<Self> {
        let prior = slot_value(lua)?;
        trace!(context = context.id, "attaching execution context");
        lua.set_named_registry_value(CONTEXT_SLOT, ContextSlot(context))?;
        Ok(Self {
            lua,
            prior: Some(prior),
        })
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        let Some(prior) = self.prior.take() else {
            return;
        };
        trace!(
            context = decode(&prior).map(|c| c.id),
            "restoring execution context"
        );
        if let Err(e) = self.lua.set_named_registry_value(CONTEXT_SLOT, prior) {
            warn!(error = %e, "failed to restore execution context");
        }
    }
}

impl fmt::Debug for ContextGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_no_context_by_default() {
        let lua = Lua::new();
        assert!(current(&lua).is_none());
    }

    #[test]
    fn test_attach_returns_prior() {
        let lua = Lua::new();
        let a = ExecutionContext::background();
        let b = ExecutionContext::background();

        assert!(attach(&lua, a.clone()).unwrap().is_none());
        assert_eq!(attach(&lua, b.clone()).unwrap(), Some(a));
        assert_eq!(current(&lua), Some(b));
    }

    #[test]
    fn test_guard_restores_in_lifo_order() {
        let lua = Lua::new();
        let outer = ExecutionContext::background();
        let inner = ExecutionContext::background();

        let g1 = ContextGuard::enter(&lua, outer.clone()).unwrap();
        assert_eq!(current(&lua), Some(outer.clone()));
        {
            let _g2 = ContextGuard::enter(&lua, inner.clone()).unwrap();
            assert_eq!(current(&lua), Some(inner));
        }
        assert_eq!(current(&lua), Some(outer));
        drop(g1);
        assert!(current(&lua).is_none());
    }

    #[test]
    fn test_with_shell_keeps_cancellation() {
        let cancel = CancelSignal::new();
        let ctx = ExecutionContext::with_cancel(cancel.clone());
        let shell: Arc<dyn ShellSession> = Arc::new(crate::shell::BasicShell::new());
        let extended = ctx.with_shell(shell);

        assert_ne!(ctx, extended);
        assert!(extended.shell().is_some());
        cancel.cancel();
        assert!(extended.is_cancelled());
    }
}
