//! Moonsh: a script bridge between an interactive shell and embedded Lua.
//!
//! The bridge lets shell events be answered by Lua code and lets Lua code
//! call back into the shell:
//!
//! - [`marshal`] converts between [`HostValue`] and guest values.
//! - [`PropertyTable`] exposes host state as guest tables.
//! - [`ExecutionContext`] carries cancellation and shell identity through
//!   each guest invocation.
//! - [`StreamScope`] binds the guest's standard streams to the running
//!   command's pipes.
//! - [`HookRegistry`] holds the guest callables registered for shell events.
//! - [`Session`] ties them together for one shell session, and [`Bridge`]
//!   creates sessions.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use moonsh::{BasicShell, Bridge, BridgeConfig, Capabilities, ExecutionContext, ShellSession};
//!
//! let bridge = Bridge::new(BridgeConfig::default())?;
//! let shell: Arc<dyn ShellSession> = Arc::new(BasicShell::new());
//! let session = bridge.new_session(&shell, Capabilities::new())?;
//!
//! let ctx = ExecutionContext::background();
//! session.run_string(&ctx, r#"moonsh.prompt = function() return "> " end"#)?;
//! assert_eq!(session.render_prompt(&ctx, "$P$G")?, Some("> ".to_string()));
//! ```

mod bridge;
mod cancel;
mod config;
pub mod context;
mod error;
mod hooks;
mod loader;
pub mod marshal;
mod property;
mod session;
mod shell;
mod stream;
mod value;


pub use bridge::{Bridge, EventDispatcher, ShellEvents};
pub use cancel::CancelSignal;
pub use config::{BridgeConfig, DEFAULT_NAMESPACE};
pub use context::{ContextGuard, ExecutionContext};
pub use error::{BridgeError, MarshalError, PropertyError};
pub use hooks::{HookPoint, HookRegistry, normalize_key};
pub use loader::{discover_scripts, elide_marker_lines};
pub use marshal::Declared;
pub use property::{CollectionKind, KeyBindings, PropertyTable, ScalarCell, ScalarProperties, VirtualCollection};
pub use session::{Capabilities, Session, StartupReport};
pub use shell::{BasicShell, ShellSession};
pub use stream::{CommandIo, MemoryPipe, SharedReader, SharedWriter, StreamScope};
pub use value::{CallParam, GuestFunction, Handle, HostFunction, HostMap, HostValue, ToGuest};

/// Re-export of the guest runtime crate.
pub use mlua;
