//! Hook registry: host extension points backed by guest callables.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::value::GuestFunction;

/// A host event that guest code can take over.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Rewrites each argument of a command before it runs
    ArgsFilter,
    /// Handles a command that is neither builtin nor on the path
    CommandNotFound,
    /// Renders the prompt
    Prompt,
    /// Runs when a bound key is pressed (normalized key name)
    Key(String),
    /// Supplies completion candidates
    Completion,
    /// Rewrites an input line before it is parsed
    LineFilter,
}

impl HookPoint {
    /// Hook points assignable as fields of the capability namespace.
    pub const FIELDS: [HookPoint; 5] = [
        HookPoint::ArgsFilter,
        HookPoint::CommandNotFound,
        HookPoint::Prompt,
        HookPoint::Completion,
        HookPoint::LineFilter,
    ];

    /// Name of the namespace field that registers this hook.
    ///
    /// Key hooks are registered through `bindkey` instead.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            HookPoint::ArgsFilter => Some("argsfilter"),
            HookPoint::CommandNotFound => Some("on_command_not_found"),
            HookPoint::Prompt => Some("prompt"),
            HookPoint::Completion => Some("completion_hook"),
            HookPoint::LineFilter => Some("filter"),
            HookPoint::Key(_) => None,
        }
    }

    /// The hook a namespace field registers, if it is a hook field.
    pub fn from_field(name: &str) -> Option<HookPoint> {
        Self::FIELDS
            .iter()
            .find(|p| p.field() == Some(name))
            .cloned()
    }

    /// Hook for a key, with the name normalized.
    pub fn key(name: &str) -> HookPoint {
        HookPoint::Key(normalize_key(name))
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPoint::Key(key) => write!(f, "key {key}"),
            other => f.write_str(other.field().unwrap_or("hook")),
        }
    }
}

/// Canonical key name: upper case, `-` replaced by `_`.
pub fn normalize_key(name: &str) -> String {
    name.to_uppercase().replace('-', "_")
}

/// The guest callables registered for each hook point.
///
/// One callable per point; registering again replaces the previous one.
/// Guest code may register hooks while the registry is being read for the
/// next dispatch, so access goes through a lock.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<HookPoint, GuestFunction>>,
}

impl HookRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` for `point`, returning the callable it replaced.
    pub fn register(&self, point: HookPoint, function: GuestFunction) -> Option<GuestFunction> {
        debug!(hook = %point, "registering hook");
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(point, function)
    }

    /// Remove the callable for `point`.
    pub fn unregister(&self, point: &HookPoint) -> Option<GuestFunction> {
        debug!(hook = %point, "unregistering hook");
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(point)
    }

    /// The callable registered for `point`.
    pub fn get(&self, point: &HookPoint) -> Option<GuestFunction> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(point)
            .cloned()
    }

    /// Returns true if `point` has a callable.
    pub fn contains(&self, point: &HookPoint) -> bool {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(point)
    }

    /// Every registered point with its callable.
    pub fn snapshot(&self) -> Vec<(HookPoint, GuestFunction)> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(p, f)| (p.clone(), f.clone()))
            .collect()
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let points: Vec<HookPoint> = self.snapshot().into_iter().map(|(p, _)| p).collect();
        f.debug_struct("HookRegistry")
            .field("points", &points)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mlua::{Function, Lua};

    fn guest_fn(lua: &Lua, body: &str) -> GuestFunction {
        let f: Function = lua.load(body).eval().unwrap();
        GuestFunction::new(f)
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("c-o"), "C_O");
        assert_eq!(normalize_key("M_x"), "M_X");
        assert_eq!(HookPoint::key("escape"), HookPoint::Key("ESCAPE".into()));
    }

    #[test]
    fn test_field_names() {
        assert_eq!(HookPoint::from_field("prompt"), Some(HookPoint::Prompt));
        assert_eq!(HookPoint::from_field("filter"), Some(HookPoint::LineFilter));
        assert_eq!(HookPoint::from_field("prompter"), None);
        for point in HookPoint::FIELDS {
            let field = point.field().unwrap();
            assert_eq!(HookPoint::from_field(field), Some(point));
        }
    }

    #[test]
    fn test_register_replaces() {
        let lua = Lua::new();
        let registry = HookRegistry::new();
        let first = guest_fn(&lua, "return function() return 1 end");
        let second = guest_fn(&lua, "return function() return 2 end");

        assert!(registry.register(HookPoint::Prompt, first.clone()).is_none());
        assert_eq!(registry.register(HookPoint::Prompt, second.clone()), Some(first));
        assert_eq!(registry.get(&HookPoint::Prompt), Some(second));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_unregister_and_clear() {
        let lua = Lua::new();
        let registry = HookRegistry::new();
        registry.register(HookPoint::key("c-o"), guest_fn(&lua, "return print"));
        registry.register(HookPoint::Completion, guest_fn(&lua, "return print"));

        assert!(registry.contains(&HookPoint::Key("C_O".into())));
        assert!(registry.unregister(&HookPoint::key("C-O")).is_some());
        assert!(!registry.contains(&HookPoint::key("c-o")));

        registry.clear();
        assert!(registry.get(&HookPoint::Completion).is_none());
    }
}
