//! Virtual property tables.
//!
//! A property table looks like an ordinary guest table, but reads and writes
//! of reserved names are answered by the host through `__index` and
//! `__newindex`. Which host code answers is decided by the [`PropertyTable`]
//! variant:
//!
//! - [`PropertyTable::Namespace`]: scalar cells and hook fields; any other
//!   name falls through to plain table storage.
//! - [`PropertyTable::Collection`]: every key is delegated to a
//!   [`VirtualCollection`] owned by the shell.
//! - [`PropertyTable::Keys`]: key bindings, split between the shell's
//!   [`KeyBindings`] engine and the hook registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use mlua::{Lua, Table, Value};

use crate::error::PropertyError;
use crate::hooks::{HookPoint, HookRegistry, normalize_key};
use crate::marshal::{to_guest, to_host};
use crate::value::HostValue;

/// A keyed collection owned by the shell and exposed to scripts.
///
/// The collection decides its own "not found" semantics.
pub trait VirtualCollection: Send + Sync {
    /// Read a key.
    fn get(&self, key: &HostValue) -> Option<HostValue>;

    /// Write a key. Writing nil removes it where that makes sense.
    fn set(&self, key: &HostValue, value: HostValue) -> Result<(), PropertyError>;

    /// Answer for the guest length operator.
    fn len(&self) -> Option<usize> {
        None
    }
}

impl<T: VirtualCollection + ?Sized> VirtualCollection for Arc<T> {
    fn get(&self, key: &HostValue) -> Option<HostValue> {
        (**self).get(key)
    }

    fn set(&self, key: &HostValue, value: HostValue) -> Result<(), PropertyError> {
        (**self).set(key, value)
    }

    fn len(&self) -> Option<usize> {
        (**self).len()
    }
}

/// The shell's key-binding engine.
///
/// Key names passed in are already normalized.
pub trait KeyBindings: Send + Sync {
    /// Editing action bound to `key`.
    fn action(&self, key: &str) -> Option<String>;

    /// Bind `key` to a named editing action.
    fn bind_action(&self, key: &str, action: &str) -> Result<(), PropertyError>;

    /// Make presses of `key` run the bridge's key hook.
    fn bind_script(&self, key: &str) -> Result<(), PropertyError>;

    /// Remove any binding of `key`.
    fn unbind(&self, key: &str);
}

impl<T: KeyBindings + ?Sized> KeyBindings for Arc<T> {
    fn action(&self, key: &str) -> Option<String> {
        (**self).action(key)
    }

    fn bind_action(&self, key: &str, action: &str) -> Result<(), PropertyError> {
        (**self).bind_action(key, action)
    }

    fn bind_script(&self, key: &str) -> Result<(), PropertyError> {
        (**self).bind_script(key)
    }

    fn unbind(&self, key: &str) {
        (**self).unbind(key)
    }
}

/// Which shell collection a [`PropertyTable::Collection`] exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// Environment variables
    Env,
    /// Command aliases
    Alias,
    /// Shell options
    Option,
    /// Interactive history, read-only
    History,
}

impl CollectionKind {
    /// Namespace field the collection is installed under.
    pub fn field(self) -> &'static str {
        match self {
            CollectionKind::Env => "env",
            CollectionKind::Alias => "alias",
            CollectionKind::Option => "option",
            CollectionKind::History => "history",
        }
    }
}

/// Host storage behind one scalar property.
#[derive(Debug, Clone)]
pub enum ScalarCell {
    /// String property
    Text(Arc<RwLock<String>>),
    /// Boolean property
    Flag(Arc<AtomicBool>),
}

impl ScalarCell {
    fn get(&self) -> HostValue {
        match self {
            ScalarCell::Text(cell) => {
                HostValue::Text(cell.read().unwrap_or_else(PoisonError::into_inner).clone())
            }
            ScalarCell::Flag(cell) => HostValue::Bool(cell.load(Ordering::Acquire)),
        }
    }

    fn set(&self, name: &str, value: HostValue) -> Result<(), PropertyError> {
        match (self, value) {
            (ScalarCell::Text(cell), HostValue::Text(text)) => {
                *cell.write().unwrap_or_else(PoisonError::into_inner) = text;
                Ok(())
            }
            (ScalarCell::Flag(cell), HostValue::Bool(flag)) => {
                cell.store(flag, Ordering::Release);
                Ok(())
            }
            (ScalarCell::Text(_), other) => Err(PropertyError::new(
                name,
                format!("expected string, got {}", other.kind_name()),
            )),
            (ScalarCell::Flag(_), other) => Err(PropertyError::new(
                name,
                format!("expected boolean, got {}", other.kind_name()),
            )),
        }
    }
}

/// Named scalar cells of the capability namespace.
#[derive(Debug, Clone, Default)]
pub struct ScalarProperties {
    cells: BTreeMap<String, ScalarCell>,
}

impl ScalarProperties {
    /// No properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a string property backed by `cell`.
    pub fn text(mut self, name: impl Into<String>, cell: Arc<RwLock<String>>) -> Self {
        self.cells.insert(name.into(), ScalarCell::Text(cell));
        self
    }

    /// Add a boolean property backed by `cell`.
    pub fn flag(mut self, name: impl Into<String>, cell: Arc<AtomicBool>) -> Self {
        self.cells.insert(name.into(), ScalarCell::Flag(cell));
        self
    }

    /// Returns true if `name` is a scalar property.
    pub fn contains(&self, name: &str) -> bool {
        self.cells.contains_key(name)
    }

    /// Property names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }

    /// Current value of a property.
    pub fn get(&self, name: &str) -> Option<HostValue> {
        self.cells.get(name).map(ScalarCell::get)
    }

    /// Store a value. `None` when `name` is not a scalar property.
    pub fn set(&self, name: &str, value: HostValue) -> Option<Result<(), PropertyError>> {
        self.cells.get(name).map(|cell| cell.set(name, value))
    }
}

/// Host dispatch behind a guest property table.
pub enum PropertyTable {
    /// Capability namespace: scalar cells, then hook fields, then storage
    Namespace {
        /// Scalar cells
        scalars: ScalarProperties,
        /// Registry the hook fields read and write
        hooks: Arc<HookRegistry>,
    },
    /// A collection owned by the shell
    Collection {
        /// Which collection
        kind: CollectionKind,
        /// The collection itself
        collection: Arc<dyn VirtualCollection>,
    },
    /// Key bindings
    Keys {
        /// The shell's key-binding engine
        engine: Arc<dyn KeyBindings>,
        /// Registry holding script-bound keys
        hooks: Arc<HookRegistry>,
    },
}

impl PropertyTable {
    /// Returns true if writes of `key` are handled by the host.
    pub fn claims(&self, key: &HostValue) -> bool {
        match self {
            PropertyTable::Namespace { scalars, .. } => key
                .as_str()
                .is_some_and(|k| scalars.contains(k) || HookPoint::from_field(k).is_some()),
            PropertyTable::Collection { .. } | PropertyTable::Keys { .. } => true,
        }
    }

    /// Read `key`. `None` means "not a host property".
    pub fn get(&self, key: &HostValue) -> Option<HostValue> {
        match self {
            PropertyTable::Namespace { scalars, hooks } => {
                let name = key.as_str()?;
                if let Some(value) = scalars.get(name) {
                    return Some(value);
                }
                let point = HookPoint::from_field(name)?;
                hooks.get(&point).map(HostValue::Callable)
            }
            PropertyTable::Collection { collection, .. } => collection.get(key),
            PropertyTable::Keys { engine, hooks } => {
                let name = normalize_key(key.as_str()?);
                match hooks.get(&HookPoint::Key(name.clone())) {
                    Some(f) => Some(HostValue::Callable(f)),
                    None => engine.action(&name).map(HostValue::Text),
                }
            }
        }
    }

    /// Write `key`. Only called for keys the table [claims](Self::claims).
    pub fn set(&self, key: &HostValue, value: HostValue) -> Result<(), PropertyError> {
        match self {
            PropertyTable::Namespace { scalars, hooks } => {
                let name = key.as_str().unwrap_or_default();
                if let Some(result) = scalars.set(name, value.clone()) {
                    return result;
                }
                let Some(point) = HookPoint::from_field(name) else {
                    return Err(PropertyError::new(name, "not a host property"));
                };
                match value {
                    HostValue::Callable(f) => {
                        hooks.register(point, f);
                        Ok(())
                    }
                    HostValue::Nil => {
                        hooks.unregister(&point);
                        Ok(())
                    }
                    other => Err(PropertyError::new(
                        name,
                        format!("expected function, got {}", other.kind_name()),
                    )),
                }
            }
            PropertyTable::Collection { collection, .. } => collection.set(key, value),
            PropertyTable::Keys { engine, hooks } => {
                let Some(name) = key.as_str() else {
                    return Err(PropertyError::new(
                        format!("{key:?}"),
                        "key names must be strings",
                    ));
                };
                bind_key(engine.as_ref(), hooks, name, value)
            }
        }
    }

    /// The length the guest sees for `#table`, if the host answers it.
    pub fn len(&self) -> Option<usize> {
        match self {
            PropertyTable::Collection { collection, .. } => collection.len(),
            _ => None,
        }
    }

    /// Create a guest table dispatching through this property table.
    pub fn install(self, lua: &Lua) -> mlua::Result<Table> {
        let table = lua.create_table()?;
        self.install_on(lua, &table)?;
        Ok(table)
    }

    /// Attach the dispatch metatable to an existing guest table.
    pub fn install_on(self, lua: &Lua, table: &Table) -> mlua::Result<()> {
        let answers_len = matches!(self, PropertyTable::Collection { .. });
        let this = Arc::new(self);
        let meta = lua.create_table()?;

        let getter = this.clone();
        meta.raw_set(
            "__index",
            lua.create_function(move |lua, (_, k): (Table, Value)| {
                let key = to_host(k).map_err(mlua::Error::external)?;
                match getter.get(&key) {
                    Some(value) => to_guest(lua, value).map_err(mlua::Error::external),
                    None => Ok(Value::Nil),
                }
            })?,
        )?;

        let setter = this.clone();
        meta.raw_set(
            "__newindex",
            lua.create_function(move |_, (t, k, v): (Table, Value, Value)| {
                match to_host(k.clone()) {
                    Ok(key) if setter.claims(&key) => {
                        let value = to_host(v).map_err(mlua::Error::external)?;
                        setter.set(&key, value).map_err(mlua::Error::external)
                    }
                    _ => t.raw_set(k, v),
                }
            })?,
        )?;

        if answers_len {
            let len = this;
            meta.raw_set(
                "__len",
                lua.create_function(move |_, _: Table| Ok(len.len().unwrap_or(0)))?,
            )?;
        }

        table.set_metatable(Some(meta));
        Ok(())
    }
}

impl fmt::Debug for PropertyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyTable::Namespace { scalars, .. } => f
                .debug_struct("Namespace")
                .field("scalars", &scalars.names().collect::<Vec<_>>())
                .finish_non_exhaustive(),
            PropertyTable::Collection { kind, .. } => {
                f.debug_struct("Collection").field("kind", kind).finish_non_exhaustive()
            }
            PropertyTable::Keys { .. } => f.debug_struct("Keys").finish_non_exhaustive(),
        }
    }
}

/// Bind `key` to a guest callable, an editing action, or nothing.
pub(crate) fn bind_key(
    engine: &dyn KeyBindings,
    hooks: &HookRegistry,
    key: &str,
    value: HostValue,
) -> Result<(), PropertyError> {
    let name = normalize_key(key);
    let point = HookPoint::Key(name.clone());
    match value {
        HostValue::Callable(f) => {
            engine.bind_script(&name)?;
            hooks.register(point, f);
        }
        HostValue::Text(action) => {
            engine.bind_action(&name, &action)?;
            hooks.unregister(&point);
        }
        HostValue::Nil => {
            engine.unbind(&name);
            hooks.unregister(&point);
        }
        other => {
            return Err(PropertyError::new(
                name,
                format!("expected function or action name, got {}", other.kind_name()),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MapCollection(Mutex<HashMap<String, String>>);

    impl VirtualCollection for MapCollection {
        fn get(&self, key: &HostValue) -> Option<HostValue> {
            let map = self.0.lock().unwrap();
            map.get(key.as_str()?).cloned().map(HostValue::Text)
        }

        fn set(&self, key: &HostValue, value: HostValue) -> Result<(), PropertyError> {
            let key = key.as_str().unwrap_or_default().to_string();
            let mut map = self.0.lock().unwrap();
            match value {
                HostValue::Nil => {
                    map.remove(&key);
                    Ok(())
                }
                HostValue::Text(v) => {
                    map.insert(key, v);
                    Ok(())
                }
                other => Err(PropertyError::new(key, format!("cannot store {}", other.kind_name()))),
            }
        }

        fn len(&self) -> Option<usize> {
            Some(self.0.lock().unwrap().len())
        }
    }

    #[derive(Default)]
    struct Keymap(Mutex<HashMap<String, String>>);

    impl KeyBindings for Keymap {
        fn action(&self, key: &str) -> Option<String> {
            self.0.lock().unwrap().get(key).cloned()
        }

        fn bind_action(&self, key: &str, action: &str) -> Result<(), PropertyError> {
            if action.is_empty() {
                return Err(PropertyError::new(key, "empty action"));
            }
            self.0.lock().unwrap().insert(key.into(), action.into());
            Ok(())
        }

        fn bind_script(&self, key: &str) -> Result<(), PropertyError> {
            self.0.lock().unwrap().insert(key.into(), "<script>".into());
            Ok(())
        }

        fn unbind(&self, key: &str) {
            self.0.lock().unwrap().remove(key);
        }
    }

    fn namespace(lua: &Lua) -> (Arc<RwLock<String>>, Arc<AtomicBool>, Arc<HookRegistry>) {
        let text = Arc::new(RwLock::new("^".to_string()));
        let flag = Arc::new(AtomicBool::new(false));
        let hooks = Arc::new(HookRegistry::new());
        let table = PropertyTable::Namespace {
            scalars: ScalarProperties::new()
                .text("histchar", text.clone())
                .flag("silentmode", flag.clone()),
            hooks: hooks.clone(),
        }
        .install(lua)
        .unwrap();
        lua.globals().set("ns", table).unwrap();
        (text, flag, hooks)
    }

    #[test]
    fn test_scalar_read_write() {
        let lua = Lua::new();
        let (text, flag, _) = namespace(&lua);

        let ch: String = lua.load("return ns.histchar").eval().unwrap();
        assert_eq!(ch, "^");

        lua.load(r#"ns.histchar = "!" ns.silentmode = true"#).exec().unwrap();
        assert_eq!(*text.read().unwrap(), "!");
        assert!(flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_scalar_wrong_kind_is_error() {
        let lua = Lua::new();
        let (_, flag, _) = namespace(&lua);

        let err = lua.load("ns.silentmode = 1").exec().unwrap_err();
        assert!(err.to_string().contains("expected boolean, got integer"));
        assert!(!flag.load(Ordering::Acquire));

        assert!(lua.load("ns.histchar = false").exec().is_err());
    }

    #[test]
    fn test_unknown_name_falls_through() {
        let lua = Lua::new();
        namespace(&lua);

        let (value, raw): (i64, i64) = lua
            .load("ns.mine = 7 return ns.mine, rawget(ns, 'mine')")
            .eval()
            .unwrap();
        assert_eq!((value, raw), (7, 7));

        let missing: Option<String> = lua.load("return ns.nothing").eval().unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_hook_field_registers() {
        let lua = Lua::new();
        let (_, _, hooks) = namespace(&lua);

        lua.load("ns.prompt = function() return '$ ' end").exec().unwrap();
        assert!(hooks.contains(&HookPoint::Prompt));
        let same: bool = lua.load("return rawget(ns, 'prompt') == nil and ns.prompt ~= nil").eval().unwrap();
        assert!(same);

        lua.load("ns.prompt = nil").exec().unwrap();
        assert!(!hooks.contains(&HookPoint::Prompt));

        let err = lua.load("ns.prompt = 'text'").exec().unwrap_err();
        assert!(err.to_string().contains("expected function"));
    }

    #[test]
    fn test_collection_delegates() {
        let lua = Lua::new();
        let collection = Arc::new(MapCollection::default());
        let table = PropertyTable::Collection {
            kind: CollectionKind::Env,
            collection: collection.clone(),
        }
        .install(&lua)
        .unwrap();
        lua.globals().set("env", table).unwrap();

        lua.load(r#"env.HOME = "/home/me" env.EMPTY = "x" env.EMPTY = nil"#)
            .exec()
            .unwrap();
        let (home, len, raw): (String, i64, Option<String>) = lua
            .load("return env.HOME, #env, rawget(env, 'HOME')")
            .eval()
            .unwrap();
        assert_eq!(home, "/home/me");
        assert_eq!(len, 1);
        assert!(raw.is_none());

        let err = lua.load("env.N = 5").exec().unwrap_err();
        assert!(err.to_string().contains("cannot store integer"));
    }

    #[test]
    fn test_unconvertible_key_read_is_error() {
        let lua = Lua::new();
        let table = PropertyTable::Collection {
            kind: CollectionKind::Env,
            collection: Arc::new(MapCollection::default()),
        }
        .install(&lua)
        .unwrap();
        lua.globals().set("env", table).unwrap();

        let err = lua
            .load("return env[coroutine.create(function() end)]")
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("unsupported guest value of type thread"));
    }

    #[test]
    fn test_keys_table() {
        let lua = Lua::new();
        let engine = Arc::new(Keymap::default());
        let hooks = Arc::new(HookRegistry::new());
        let table = PropertyTable::Keys {
            engine: engine.clone(),
            hooks: hooks.clone(),
        }
        .install(&lua)
        .unwrap();
        lua.globals().set("key", table).unwrap();

        lua.load(r#"key["c-a"] = "beginning-of-line""#).exec().unwrap();
        assert_eq!(engine.action("C_A").as_deref(), Some("beginning-of-line"));
        let action: String = lua.load("return key.C_A").eval().unwrap();
        assert_eq!(action, "beginning-of-line");

        lua.load(r#"key["c-o"] = function() return "x" end"#).exec().unwrap();
        assert!(hooks.contains(&HookPoint::key("c-o")));
        let is_fn: bool = lua.load(r#"return type(key["C_O"]) == "function""#).eval().unwrap();
        assert!(is_fn);

        lua.load(r#"key["c-o"] = nil"#).exec().unwrap();
        assert!(!hooks.contains(&HookPoint::key("c-o")));
        assert!(engine.action("C_O").is_none());
    }
}
