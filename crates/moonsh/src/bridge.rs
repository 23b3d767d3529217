//! Process-wide entry point.
//!
//! A [`Bridge`] creates the script sessions of a process. The first session
//! it creates also wires the shell's event points (argument rewriting and
//! the unresolved-command fallback) to an [`EventDispatcher`]. The wiring
//! happens once per bridge no matter how many sessions follow.

use std::sync::{Arc, Once};

use tracing::debug;

use crate::config::BridgeConfig;
use crate::context::ExecutionContext;
use crate::error::BridgeError;
use crate::session::{Capabilities, Session};
use crate::shell::ShellSession;

/// Shell event points the bridge plugs into.
pub trait ShellEvents: Send + Sync {
    /// Route the shell's argument and unresolved-command events to
    /// `dispatcher` from now on.
    fn install(&self, dispatcher: EventDispatcher);
}

/// Forwards shell events to the hooks of the session bound to the shell.
///
/// Script errors are written to the shell's error stream and the event
/// falls back to its default outcome.
#[derive(Debug, Clone, Default)]
pub struct EventDispatcher {
    _private: (),
}

impl EventDispatcher {
    fn new() -> Self {
        Self::default()
    }

    /// Rewrite a command's arguments. Returns `args` unchanged when no
    /// session or hook applies, or when the hook fails.
    pub fn on_args(&self, shell: &dyn ShellSession, ctx: &ExecutionContext, args: Vec<String>) -> Vec<String> {
        let Ok(session) = Session::from_shell(shell) else {
            return args;
        };
        match session.filter_args(ctx, &args) {
            Ok(Some(filtered)) => filtered,
            Ok(None) => args,
            Err(e) => {
                session.report(&format!("argsfilter: {e}"));
                args
            }
        }
    }

    /// Offer an unresolved command to scripts. Returns true if a hook
    /// handled it; otherwise the shell reports "command not found".
    pub fn on_command_not_found(&self, shell: &dyn ShellSession, ctx: &ExecutionContext, args: &[String]) -> bool {
        let Ok(session) = Session::from_shell(shell) else {
            return false;
        };
        match session.command_not_found(ctx, args) {
            Ok(handled) => handled.unwrap_or(false),
            Err(e) => {
                session.report(&format!("on_command_not_found: {e}"));
                false
            }
        }
    }
}

/// Creates script sessions and owns the one-time event wiring.
pub struct Bridge {
    config: Arc<BridgeConfig>,
    events: Option<Arc<dyn ShellEvents>>,
    wiring: Once,
}

impl Bridge {
    /// Create a bridge. Fails if the configuration is invalid.
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            events: None,
            wiring: Once::new(),
        })
    }

    /// Shell event points to wire when the first session is created.
    pub fn with_events(mut self, events: Arc<dyn ShellEvents>) -> Self {
        self.events = Some(events);
        self
    }

    /// The bridge configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Returns true once the event points have been wired.
    pub fn is_wired(&self) -> bool {
        self.wiring.is_completed()
    }

    /// Create a session for `shell` and bind it as the shell's tag.
    pub fn new_session(
        &self,
        shell: &Arc<dyn ShellSession>,
        capabilities: Capabilities,
    ) -> Result<Session, BridgeError> {
        let session = Session::new(Arc::downgrade(shell), capabilities, self.config.clone())?;
        shell.set_tag(Some(session.clone()));

        self.wiring.call_once(|| {
            if let Some(events) = &self.events {
                events.install(EventDispatcher::new());
                debug!("wired shell events to script hooks");
            }
        });
        Ok(session)
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .field("has_events", &self.events.is_some())
            .field("wired", &self.is_wired())
            .finish()
    }
}
