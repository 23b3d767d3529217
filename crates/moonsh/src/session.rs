//! Script sessions.
//!
//! A [`Session`] is one guest runtime bound to one shell session. Every entry
//! into guest code goes through [`Session::call`], which attaches an
//! [`ExecutionContext`], binds the guest's standard streams to the shell's
//! current pipes, runs the callable and tears both down again in reverse
//! order, whatever the outcome.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Instant;

use mlua::{ChunkMode, Function, Lua, LuaOptions, MultiValue, StdLib, Table, Value};
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::context::{self, ContextGuard, ExecutionContext};
use crate::error::BridgeError;
use crate::hooks::{HookPoint, HookRegistry};
use crate::loader;
use crate::marshal::{
    Declared, HandleData, args_to_host, results_to_guest, to_guest, to_host, to_host_as, wrap_host_function,
};
use crate::property::{
    CollectionKind, KeyBindings, PropertyTable, ScalarProperties, VirtualCollection, bind_key,
};
use crate::shell::ShellSession;
use crate::stream::{self, CommandIo, StreamScope};
use crate::value::{GuestFunction, HostFunction, HostValue};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Namespace fields the bridge itself defines.
const RESERVED_FIELDS: [&str; 9] = [
    "bindkey", "exe", "getalias", "key", "lines", "loadfile", "open", "setalias", "version",
];

/// Everything the shell exposes to scripts through the capability namespace.
#[derive(Clone, Default)]
pub struct Capabilities {
    functions: BTreeMap<String, HostFunction>,
    scalars: ScalarProperties,
    collections: Vec<(CollectionKind, Arc<dyn VirtualCollection>)>,
    keys: Option<Arc<dyn KeyBindings>>,
}

impl Capabilities {
    /// No capabilities.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose a host callable as `namespace.<name>`.
    ///
    /// A callable named `print` also replaces the guest's global `print`.
    pub fn function(mut self, name: impl Into<String>, function: HostFunction) -> Self {
        self.functions.insert(name.into(), function);
        self
    }

    /// Expose scalar properties.
    pub fn scalars(mut self, scalars: ScalarProperties) -> Self {
        self.scalars = scalars;
        self
    }

    /// Expose a shell collection as `namespace.<kind>`.
    pub fn collection(mut self, kind: CollectionKind, collection: Arc<dyn VirtualCollection>) -> Self {
        self.collections.retain(|(k, _)| *k != kind);
        self.collections.push((kind, collection));
        self
    }

    /// Expose the key-binding engine as `namespace.key` and `namespace.bindkey`.
    pub fn keys(mut self, engine: Arc<dyn KeyBindings>) -> Self {
        self.keys = Some(engine);
        self
    }

    /// Check that no two properties share a name.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let mut seen: HashMap<&str, &str> = HashMap::new();
        let names = self
            .functions
            .keys()
            .map(|n| (n.as_str(), "function"))
            .chain(self.scalars.names().map(|n| (n, "property")))
            .chain(
                HookPoint::FIELDS
                    .iter()
                    .filter_map(HookPoint::field)
                    .map(|n| (n, "hook")),
            )
            .chain(self.collections.iter().map(|(k, _)| (k.field(), "collection")))
            .chain(RESERVED_FIELDS.iter().map(|n| (*n, "reserved name")));
        for (name, what) in names {
            if let Some(previous) = seen.insert(name, what) {
                return Err(BridgeError::Config(format!(
                    "{name} is defined both as {previous} and as {what}"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("scalars", &self.scalars)
            .field(
                "collections",
                &self.collections.iter().map(|(k, _)| k).collect::<Vec<_>>(),
            )
            .field("has_keys", &self.keys.is_some())
            .finish()
    }
}

/// Outcome of [`Session::load_startup_scripts`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartupReport {
    /// Scripts that ran to completion
    pub loaded: Vec<PathBuf>,
    /// Scripts that failed, with the error message
    pub failed: Vec<(PathBuf, String)>,
}

struct SessionInner {
    id: u64,
    lua: RwLock<Option<Arc<Lua>>>,
    hooks: Arc<HookRegistry>,
    capabilities: Capabilities,
    shell: Weak<dyn ShellSession>,
    config: Arc<BridgeConfig>,
}

/// A guest runtime bound to one shell session.
///
/// Clones of a `Session` are handles to the same runtime. Use
/// [`clone_session`](Self::clone_session) for an independent copy.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Registry slot holding the `debug` library, which scripts cannot reach.
const DEBUG_SLOT: &str = "moonsh.debug";

fn new_runtime() -> Result<Lua, BridgeError> {
    // SAFETY: only the safe standard libraries are exposed to scripts. The
    // unsafe constructor is needed to load the binary chunks produced when a
    // session is cloned, and those only ever come from this process.
    let lua = unsafe { Lua::unsafe_new_with(StdLib::ALL_SAFE, LuaOptions::default()) };

    // Cloning copies closure upvalues through `debug`; keep it out of sight.
    lua.load_std_libs(StdLib::DEBUG)?;
    let globals = lua.globals();
    let debug: Table = globals.raw_get("debug")?;
    lua.set_named_registry_value(DEBUG_SLOT, debug)?;
    globals.raw_set("debug", Value::Nil)?;
    if let Value::Table(package) = globals.raw_get::<Value>("package")? {
        if let Value::Table(loaded) = package.raw_get::<Value>("loaded")? {
            loaded.raw_set("debug", Value::Nil)?;
        }
    }
    Ok(lua)
}

fn debug_function(lua: &Lua, name: &str) -> mlua::Result<Function> {
    let debug: Table = lua.named_registry_value(DEBUG_SLOT)?;
    debug.raw_get(name)
}

impl Session {
    pub(crate) fn new(
        shell: Weak<dyn ShellSession>,
        capabilities: Capabilities,
        config: Arc<BridgeConfig>,
    ) -> Result<Self, BridgeError> {
        capabilities.validate()?;
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let hooks = Arc::new(HookRegistry::new());
        let lua = new_runtime()?;
        install_namespace(&lua, &config, &capabilities, &hooks)?;
        debug!(session = id, namespace = %config.namespace, "created script session");

        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                lua: RwLock::new(Some(Arc::new(lua))),
                hooks,
                capabilities,
                shell,
                config,
            }),
        })
    }

    /// Find the session bound to `shell`.
    ///
    /// Fails with [`BridgeError::NotSupported`] when scripting is disabled.
    pub fn from_shell(shell: &dyn ShellSession) -> Result<Session, BridgeError> {
        shell
            .tag()
            .ok_or_else(|| BridgeError::NotSupported("no script session is bound to this shell".into()))
    }

    /// Process-unique identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The session's hook registry.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.inner.hooks
    }

    /// Configuration the session was created with.
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// The shell session, while it is alive.
    pub fn shell(&self) -> Option<Arc<dyn ShellSession>> {
        self.inner.shell.upgrade()
    }

    /// Returns true after [`close`](Self::close).
    pub fn is_closed(&self) -> bool {
        self.inner
            .lua
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn lua(&self) -> Result<Arc<Lua>, BridgeError> {
        self.inner
            .lua
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BridgeError::Closed)
    }

    fn pipes(&self) -> CommandIo {
        self.shell()
            .map(|shell| shell.io())
            .unwrap_or_else(CommandIo::process)
    }

    /// Context of the invocation currently running in this session.
    pub fn current_context(&self) -> Option<ExecutionContext> {
        let lua = self.lua().ok()?;
        context::current(&lua)
    }

    /// Write a message to the shell's error stream.
    pub fn report(&self, message: &str) {
        let stderr = self.pipes().stderr;
        let mut stderr = stderr.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(stderr, "{message}") {
            warn!(error = %e, "failed to report script error");
        }
    }

    /// Invoke a guest callable.
    ///
    /// `ctx` is extended with the shell session and attached for the
    /// duration of the call. The guest's standard streams are the shell's
    /// current pipes. A guest error comes back as [`BridgeError::Runtime`],
    /// or as [`BridgeError::Cancelled`] when `ctx` was cancelled meanwhile.
    pub fn call(
        &self,
        ctx: &ExecutionContext,
        function: &GuestFunction,
        args: Vec<HostValue>,
    ) -> Result<Vec<HostValue>, BridgeError> {
        let lua = self.lua()?;
        if ctx.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        let shell = self.shell();
        let ctx = match &shell {
            Some(shell) => ctx.with_shell(shell.clone()),
            None => ctx.clone(),
        };
        let pipes = shell
            .as_ref()
            .map(|s| s.io())
            .unwrap_or_else(CommandIo::process);

        let _context = ContextGuard::enter(&lua, ctx.clone())?;
        let mut scope = StreamScope::open(&lua, &pipes, Some(ctx.cancel_signal().clone()))?;
        let result = results_to_guest(&lua, args)
            .map_err(BridgeError::from)
            .and_then(|args| {
                function
                    .function()
                    .call::<MultiValue>(args)
                    .map_err(|e| {
                        if ctx.is_cancelled() {
                            BridgeError::Cancelled
                        } else {
                            BridgeError::Runtime(e.to_string())
                        }
                    })
            });
        scope.close();

        Ok(args_to_host(result?)?)
    }

    /// Invoke the hook registered for `point`.
    ///
    /// `Ok(None)` means no hook is registered and the caller should use its
    /// default behaviour.
    pub fn invoke_hook(
        &self,
        ctx: &ExecutionContext,
        point: &HookPoint,
        args: Vec<HostValue>,
    ) -> Result<Option<Vec<HostValue>>, BridgeError> {
        let Some(function) = self.inner.hooks.get(point) else {
            return Ok(None);
        };
        debug!(session = self.inner.id, hook = %point, "dispatching hook");
        let started = Instant::now();
        let result = self.call(ctx, &function, args);

        let threshold = self.inner.config.slow_hook_threshold;
        let elapsed = started.elapsed();
        if !threshold.is_zero() && elapsed > threshold {
            warn!(
                hook = %point,
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "slow hook"
            );
        }
        result.map(Some)
    }

    /// Render the prompt through the prompt hook.
    ///
    /// The hook receives the prompt template and returns the text to show.
    pub fn render_prompt(&self, ctx: &ExecutionContext, template: &str) -> Result<Option<String>, BridgeError> {
        let results = self.invoke_hook(ctx, &HookPoint::Prompt, vec![template.into()])?;
        Ok(results.map(|r| first_text(r).unwrap_or_default()))
    }

    /// Rewrite an input line through the line filter hook.
    ///
    /// `None` keeps the line as typed.
    pub fn filter_line(&self, ctx: &ExecutionContext, line: &str) -> Result<Option<String>, BridgeError> {
        let results = self.invoke_hook(ctx, &HookPoint::LineFilter, vec![line.into()])?;
        Ok(results.and_then(first_text))
    }

    /// Rewrite a command's arguments through the argument hook.
    ///
    /// The hook gets the arguments (command name first) as a sequence and
    /// returns the new sequence, or nil to keep them.
    pub fn filter_args(&self, ctx: &ExecutionContext, args: &[String]) -> Result<Option<Vec<String>>, BridgeError> {
        let seq = args.iter().map(|a| HostValue::from(a.as_str())).collect();
        let Some(results) = self.invoke_hook(ctx, &HookPoint::ArgsFilter, vec![seq])? else {
            return Ok(None);
        };
        let Some(first) = results.into_iter().next().filter(|v| !v.is_nil()) else {
            return Ok(None);
        };
        let items = first.into_sequence().ok_or_else(|| {
            BridgeError::Runtime("argsfilter must return a sequence of strings".into())
        })?;
        let args = items
            .into_iter()
            .map(String::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(args))
    }

    /// Offer an unresolved command to the fallback hook.
    ///
    /// `Some(true)` when the hook handled it.
    pub fn command_not_found(&self, ctx: &ExecutionContext, args: &[String]) -> Result<Option<bool>, BridgeError> {
        let seq = args.iter().map(|a| HostValue::from(a.as_str())).collect();
        let results = self.invoke_hook(ctx, &HookPoint::CommandNotFound, vec![seq])?;
        Ok(results.map(|r| r.first().is_some_and(HostValue::truthy)))
    }

    /// Run the callable bound to `key`, passing the current input line.
    pub fn run_key(&self, ctx: &ExecutionContext, key: &str, line: &str) -> Result<Option<HostValue>, BridgeError> {
        let results = self.invoke_hook(ctx, &HookPoint::key(key), vec![line.into()])?;
        Ok(results.map(|r| r.into_iter().next().unwrap_or_default()))
    }

    /// Ask the completion hook for candidates.
    ///
    /// The hook receives `{text=, word=, list=}` and returns a new list, or
    /// nil to keep the shell's own candidates.
    pub fn complete(
        &self,
        ctx: &ExecutionContext,
        text: &str,
        word: &str,
        candidates: Vec<String>,
    ) -> Result<Option<Vec<String>>, BridgeError> {
        let mut request = crate::value::HostMap::new();
        request.insert("text", text);
        request.insert("word", word);
        request.insert(
            "list",
            candidates.iter().map(|c| HostValue::from(c.as_str())).collect::<HostValue>(),
        );
        let Some(results) = self.invoke_hook(ctx, &HookPoint::Completion, vec![request.into()])? else {
            return Ok(None);
        };
        match results.into_iter().next().filter(|v| !v.is_nil()) {
            None => Ok(Some(candidates)),
            Some(list) => {
                let items = list.into_sequence().ok_or_else(|| {
                    BridgeError::Runtime("completion_hook must return a sequence".into())
                })?;
                let list = items
                    .into_iter()
                    .map(String::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(list))
            }
        }
    }

    /// Compile and run a chunk of guest source.
    pub fn run_string(&self, ctx: &ExecutionContext, source: &str) -> Result<Vec<HostValue>, BridgeError> {
        let function = {
            let lua = self.lua()?;
            lua.load(source)
                .set_name("=(command line)")
                .set_mode(ChunkMode::Text)
                .into_function()?
        };
        self.call(ctx, &GuestFunction::new(function), Vec::new())
    }

    /// Run a script file. Lines starting with `@` are blanked first.
    pub fn run_file(&self, ctx: &ExecutionContext, path: &Path) -> Result<Vec<HostValue>, BridgeError> {
        let source = loader::read_script(path)?;
        let function = {
            let lua = self.lua()?;
            lua.load(source)
                .set_name(loader::chunk_name(path))
                .set_mode(ChunkMode::Text)
                .into_function()?
        };
        debug!(session = self.inner.id, path = %path.display(), "running script");
        self.call(ctx, &GuestFunction::new(function), Vec::new())
    }

    /// Run every configured startup script.
    ///
    /// A failing script is reported to the shell's error stream and loading
    /// carries on with the next one. Only cancellation stops the run.
    pub fn load_startup_scripts(&self, ctx: &ExecutionContext) -> Result<StartupReport, BridgeError> {
        let mut report = StartupReport::default();
        let config = &self.inner.config;
        if !config.load_startup {
            return Ok(report);
        }

        let mut scripts = Vec::new();
        for dir in &config.script_dirs {
            scripts.extend(loader::discover_scripts(dir)?);
        }
        for file in &config.startup_files {
            if file.is_file() {
                scripts.push(file.clone());
            } else {
                debug!(path = %file.display(), "startup file not found, skipping");
            }
        }

        for script in scripts {
            match self.run_file(ctx, &script) {
                Ok(_) => report.loaded.push(script),
                Err(BridgeError::Cancelled) => return Err(BridgeError::Cancelled),
                Err(e) => {
                    self.report(&format!("{}: {e}", script.display()));
                    report.failed.push((script, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Expose script arguments as the global `arg` table, indexed from 0.
    pub fn set_args(&self, script: &str, args: &[String]) -> Result<(), BridgeError> {
        let lua = self.lua()?;
        let table = lua.create_table()?;
        table.raw_set(0, script)?;
        for (i, arg) in args.iter().enumerate() {
            table.raw_set(i + 1, arg.as_str())?;
        }
        lua.globals().raw_set("arg", table)?;
        Ok(())
    }

    /// Read a global.
    pub fn global(&self, name: &str) -> Result<HostValue, BridgeError> {
        let lua = self.lua()?;
        let value: Value = lua.globals().get(name)?;
        Ok(to_host(value)?)
    }

    /// Read a global as a declared host type.
    ///
    /// Byte buffers set with [`set_global`](Self::set_global) come back as
    /// [`HostValue::Bytes`] when read as [`Declared::Bytes`], printable or not.
    pub fn global_as(&self, name: &str, declared: Declared) -> Result<HostValue, BridgeError> {
        let lua = self.lua()?;
        let value: Value = lua.globals().get(name)?;
        Ok(to_host_as(value, declared)?)
    }

    /// Set a global.
    pub fn set_global(&self, name: &str, value: HostValue) -> Result<(), BridgeError> {
        let lua = self.lua()?;
        let value = to_guest(&lua, value)?;
        lua.globals().set(name, value)?;
        Ok(())
    }

    /// Create an independent session starting from a copy of this one.
    ///
    /// The copy gets fresh capability tables for the same shell, then every
    /// global the fresh runtime lacks, the contents of `share` and of the
    /// namespace, and the registered hooks. Tables are deep-copied with
    /// sharing and cycles preserved. Guest functions are copied as bytecode
    /// with their upvalues copied alongside; standard library and namespace
    /// functions map to their counterparts in the copy. A function holding
    /// anything else that cannot be copied (a coroutine, a foreign C
    /// function) is left out rather than copied half-bound.
    pub fn clone_session(&self) -> Result<Session, BridgeError> {
        let src = self.lua()?;
        let fresh = Session::new(
            self.inner.shell.clone(),
            self.inner.capabilities.clone(),
            self.inner.config.clone(),
        )?;
        let dst = fresh.lua()?;
        let mut replayer = Replayer::new(&src, &dst)?;

        let src_globals = src.globals();
        let dst_globals = dst.globals();
        for pair in src_globals.clone().pairs::<Value, Value>() {
            let (k, v) = pair?;
            let Some(k) = replayer.copy(k)? else {
                continue;
            };
            if !dst_globals.raw_get::<Value>(k.clone())?.is_nil() {
                continue;
            }
            if let Some(v) = replayer.copy(v)? {
                dst_globals.raw_set(k, v)?;
            }
        }

        for name in ["share", self.inner.config.namespace.as_str()] {
            if let (Value::Table(from), Value::Table(into)) = (
                src_globals.raw_get::<Value>(name)?,
                dst_globals.raw_get::<Value>(name)?,
            ) {
                replayer.merge(&from, &into)?;
            }
        }

        for (point, function) in self.inner.hooks.snapshot() {
            match replayer.copy(Value::Function(function.into_function()))? {
                Some(Value::Function(copy)) => {
                    fresh.inner.hooks.register(point, GuestFunction::new(copy));
                }
                _ => warn!(hook = %point, "hook cannot be copied into the cloned session"),
            }
        }

        debug!(session = self.inner.id, clone = fresh.inner.id, "cloned script session");
        Ok(fresh)
    }

    /// Release the guest runtime. Calling it again does nothing.
    pub fn close(&self) {
        let lua = self
            .inner
            .lua
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if lua.is_some() {
            self.inner.hooks.clear();
            debug!(session = self.inner.id, "closed script session");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .field("hooks", &self.inner.hooks)
            .finish_non_exhaustive()
    }
}

fn first_text(results: Vec<HostValue>) -> Option<String> {
    results
        .into_iter()
        .next()
        .and_then(|v| String::try_from(v).ok())
}

fn install_namespace(
    lua: &Lua,
    config: &BridgeConfig,
    capabilities: &Capabilities,
    hooks: &Arc<HookRegistry>,
) -> Result<(), BridgeError> {
    stream::install_io(lua)?;

    let ns = PropertyTable::Namespace {
        scalars: capabilities.scalars.clone(),
        hooks: hooks.clone(),
    }
    .install(lua)?;

    for (name, function) in &capabilities.functions {
        let function = wrap_host_function(lua, function.clone())?;
        if name == "print" {
            lua.globals().raw_set("print", function.clone())?;
        }
        ns.raw_set(name.as_str(), function)?;
    }

    let globals = lua.globals();
    let io: Table = globals.raw_get("io")?;
    ns.raw_set("lines", io.raw_get::<Value>("lines")?)?;
    ns.raw_set("open", io.raw_get::<Value>("open")?)?;
    ns.raw_set("loadfile", globals.raw_get::<Value>("loadfile")?)?;

    for (kind, collection) in &capabilities.collections {
        let table = PropertyTable::Collection {
            kind: *kind,
            collection: collection.clone(),
        }
        .install(lua)?;
        ns.raw_set(kind.field(), table)?;
        if *kind == CollectionKind::Alias {
            install_alias_functions(lua, &ns, collection)?;
        }
    }

    if let Some(engine) = &capabilities.keys {
        let table = PropertyTable::Keys {
            engine: engine.clone(),
            hooks: hooks.clone(),
        }
        .install(lua)?;
        ns.raw_set("key", table)?;

        let engine = engine.clone();
        let hooks = hooks.clone();
        let bindkey = lua.create_function(move |_, (key, value): (String, Value)| {
            let value = to_host(value).map_err(mlua::Error::external)?;
            Ok(match bind_key(engine.as_ref(), &hooks, &key, value) {
                Ok(()) => (Some(true), None),
                Err(e) => (None, Some(e.to_string())),
            })
        })?;
        ns.raw_set("bindkey", bindkey)?;
    }

    ns.raw_set("version", env!("CARGO_PKG_VERSION"))?;
    let exe = std::env::current_exe()
        .ok()
        .map(|p| p.display().to_string());
    ns.raw_set("exe", exe)?;

    globals.raw_set(config.namespace.as_str(), ns)?;
    globals.raw_set("share", lua.create_table()?)?;
    Ok(())
}

/// `getalias(name)` and `setalias(name, value)`, the call forms of the
/// alias table.
fn install_alias_functions(
    lua: &Lua,
    ns: &Table,
    aliases: &Arc<dyn VirtualCollection>,
) -> Result<(), BridgeError> {
    let reader = aliases.clone();
    let getalias = lua.create_function(move |lua, name: Value| {
        let name = to_host(name).map_err(mlua::Error::external)?;
        match reader.get(&name) {
            Some(body) => to_guest(lua, body).map_err(mlua::Error::external),
            None => Ok(Value::Nil),
        }
    })?;
    ns.raw_set("getalias", getalias)?;

    let writer = aliases.clone();
    let setalias = lua.create_function(move |_, (name, body): (Value, Value)| {
        let name = to_host(name).map_err(mlua::Error::external)?;
        let body = to_host(body).map_err(mlua::Error::external)?;
        Ok(match writer.set(&name, body) {
            Ok(()) => (Some(true), None),
            Err(e) => (None, Some(e.to_string())),
        })
    })?;
    ns.raw_set("setalias", setalias)?;
    Ok(())
}

/// Deep copy of guest values from one runtime into another.
struct Replayer<'a> {
    dst: &'a Lua,
    tables: HashMap<usize, Table>,
    functions: HashMap<usize, Option<Function>>,
    get_upvalue: Function,
    set_upvalue: Function,
}

impl<'a> Replayer<'a> {
    fn new(src: &Lua, dst: &'a Lua) -> mlua::Result<Self> {
        let mut replayer = Self {
            dst,
            tables: HashMap::new(),
            functions: HashMap::new(),
            get_upvalue: debug_function(src, "getupvalue")?,
            set_upvalue: debug_function(dst, "setupvalue")?,
        };
        let (src_globals, dst_globals) = (src.globals(), dst.globals());
        replayer
            .tables
            .insert(src_globals.to_pointer() as usize, dst_globals.clone());
        replayer.map_counterparts(&src_globals, &dst_globals, true)?;
        Ok(replayer)
    }

    /// Pair up functions (and, at the top level, tables) that both runtimes
    /// hold under the same name, so references to them are redirected
    /// instead of copied.
    fn map_counterparts(&mut self, src: &Table, dst: &Table, top: bool) -> mlua::Result<()> {
        for pair in src.clone().pairs::<Value, Value>() {
            let (k, v) = pair?;
            let Value::String(name) = k else {
                continue;
            };
            let name = self.dst.create_string(&*name.as_bytes())?;
            match (v, dst.raw_get::<Value>(name)?) {
                (Value::Function(ours), Value::Function(theirs)) => {
                    let key = Value::Function(ours).to_pointer() as usize;
                    self.functions.insert(key, Some(theirs));
                }
                (Value::Table(ours), Value::Table(theirs)) if top => {
                    let key = ours.to_pointer() as usize;
                    if self.tables.contains_key(&key) {
                        continue;
                    }
                    self.tables.insert(key, theirs.clone());
                    self.map_counterparts(&ours, &theirs, false)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Copy a value, or `None` when it cannot cross runtimes.
    fn copy(&mut self, value: Value) -> mlua::Result<Option<Value>> {
        Ok(match value {
            Value::Nil => Some(Value::Nil),
            Value::Boolean(b) => Some(Value::Boolean(b)),
            Value::Integer(i) => Some(Value::Integer(i)),
            Value::Number(n) => Some(Value::Number(n)),
            Value::String(s) => Some(Value::String(self.dst.create_string(&*s.as_bytes())?)),
            Value::Table(table) => Some(Value::Table(self.copy_table(table)?)),
            Value::Function(f) => self.copy_function(f)?.map(Value::Function),
            Value::UserData(ud) => match ud.borrow::<HandleData>() {
                Ok(handle) => Some(Value::UserData(
                    self.dst.create_userdata(HandleData(handle.0.clone()))?,
                )),
                Err(_) => None,
            },
            _ => None,
        })
    }

    fn copy_table(&mut self, table: Table) -> mlua::Result<Table> {
        let key = table.to_pointer() as usize;
        if let Some(copy) = self.tables.get(&key) {
            return Ok(copy.clone());
        }
        let copy = self.dst.create_table()?;
        self.tables.insert(key, copy.clone());

        self.merge(&table, &copy)?;
        if let Some(meta) = table.metatable() {
            let meta = self.copy_table(meta)?;
            copy.set_metatable(Some(meta));
        }
        Ok(copy)
    }

    /// Load the function's bytecode into the destination and copy each
    /// upvalue across. Loading binds the first upvalue to the destination
    /// globals whatever it was, so every upvalue is set explicitly.
    fn copy_function(&mut self, function: Function) -> mlua::Result<Option<Function>> {
        let key = Value::Function(function.clone()).to_pointer() as usize;
        if let Some(copy) = self.functions.get(&key) {
            return Ok(copy.clone());
        }
        let bytecode = function.dump(false);
        if bytecode.is_empty() {
            self.functions.insert(key, None);
            return Ok(None);
        }
        let copy = self
            .dst
            .load(&bytecode[..])
            .set_name("=clone")
            .set_mode(ChunkMode::Binary)
            .into_function()?;
        self.functions.insert(key, Some(copy.clone()));

        for index in 1.. {
            let (name, value): (Option<String>, Value) =
                self.get_upvalue.call((function.clone(), index))?;
            let Some(name) = name else {
                break;
            };
            match self.copy(value)? {
                Some(value) => self.set_upvalue.call::<()>((copy.clone(), index, value))?,
                None => {
                    debug!(upvalue = %name, "closure holds a value that cannot be copied");
                    self.functions.insert(key, None);
                    return Ok(None);
                }
            }
        }
        Ok(Some(copy))
    }

    /// Copy the raw fields of `from` that `into` does not have yet.
    fn merge(&mut self, from: &Table, into: &Table) -> mlua::Result<()> {
        for pair in from.clone().pairs::<Value, Value>() {
            let (k, v) = pair?;
            let Some(k) = self.copy(k)? else {
                continue;
            };
            if k.is_nil() || !into.raw_get::<Value>(k.clone())?.is_nil() {
                continue;
            }
            if let Some(v) = self.copy(v)? {
                into.raw_set(k, v)?;
            }
        }
        Ok(())
    }
}
