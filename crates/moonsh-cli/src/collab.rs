//! In-memory shell state exposed to scripts.
//!
//! Each type here is the smallest version of a shell facility that the
//! bridge can reach: environment, aliases, options, history and key
//! bindings. None of them persist anything.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use moonsh::{EventDispatcher, HostValue, KeyBindings, PropertyError, ShellEvents, VirtualCollection};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn text_key(key: &HostValue) -> Result<&str, PropertyError> {
    key.as_str()
        .ok_or_else(|| PropertyError::new(format!("{key:?}"), "key must be a string"))
}

fn text_value(name: &str, value: HostValue) -> Result<String, PropertyError> {
    match value {
        HostValue::Int(i) => Ok(i.to_string()),
        other => String::try_from(other).map_err(|e| PropertyError::new(name, e.to_string())),
    }
}

/// Variables passed to spawned commands.
#[derive(Debug, Default)]
pub struct Environment {
    vars: Mutex<BTreeMap<String, String>>,
}

impl Environment {
    /// Start from the process environment.
    pub fn from_process() -> Self {
        Self {
            vars: Mutex::new(std::env::vars().collect()),
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        lock(&self.vars).get(name).cloned()
    }

    /// Snapshot for a child process.
    pub fn vars(&self) -> Vec<(String, String)> {
        lock(&self.vars)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl VirtualCollection for Environment {
    fn get(&self, key: &HostValue) -> Option<HostValue> {
        Environment::get(self, key.as_str()?).map(HostValue::Text)
    }

    fn set(&self, key: &HostValue, value: HostValue) -> Result<(), PropertyError> {
        let name = text_key(key)?;
        if name.is_empty() || name.contains('=') {
            return Err(PropertyError::new(name, "invalid variable name"));
        }
        if value.is_nil() {
            lock(&self.vars).remove(name);
            return Ok(());
        }
        let value = text_value(name, value)?;
        lock(&self.vars).insert(name.to_string(), value);
        Ok(())
    }
}

/// Command aliases.
#[derive(Debug, Default)]
pub struct Aliases {
    table: Mutex<HashMap<String, String>>,
}

impl Aliases {
    /// Replace the command word with its alias, if it has one.
    ///
    /// Expansion happens once; an alias naming another alias is not followed.
    pub fn expand(&self, mut words: Vec<String>) -> Vec<String> {
        let Some(first) = words.first() else {
            return words;
        };
        let Some(body) = lock(&self.table).get(first).cloned() else {
            return words;
        };
        let mut expanded = split_words(&body);
        expanded.extend(words.drain(1..));
        expanded
    }
}

impl VirtualCollection for Aliases {
    fn get(&self, key: &HostValue) -> Option<HostValue> {
        lock(&self.table).get(key.as_str()?).cloned().map(HostValue::Text)
    }

    fn set(&self, key: &HostValue, value: HostValue) -> Result<(), PropertyError> {
        let name = text_key(key)?;
        if value.is_nil() {
            lock(&self.table).remove(name);
        } else {
            let body = text_value(name, value)?;
            lock(&self.table).insert(name.to_string(), body);
        }
        Ok(())
    }
}

/// Named on/off shell options. Only known options can be set.
#[derive(Debug)]
pub struct Options {
    flags: Mutex<BTreeMap<String, bool>>,
}

impl Default for Options {
    fn default() -> Self {
        let flags = [("noclobber", false), ("echo_commands", false)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            flags: Mutex::new(flags),
        }
    }
}

impl Options {
    pub fn is_set(&self, name: &str) -> bool {
        lock(&self.flags).get(name).copied().unwrap_or(false)
    }
}

impl VirtualCollection for Options {
    fn get(&self, key: &HostValue) -> Option<HostValue> {
        lock(&self.flags).get(key.as_str()?).copied().map(HostValue::Bool)
    }

    fn set(&self, key: &HostValue, value: HostValue) -> Result<(), PropertyError> {
        let name = text_key(key)?;
        let mut flags = lock(&self.flags);
        let Some(flag) = flags.get_mut(name) else {
            return Err(PropertyError::new(name, "no such option"));
        };
        *flag = bool::try_from(value).map_err(|e| PropertyError::new(name, e.to_string()))?;
        Ok(())
    }
}

/// Lines entered so far. Scripts can read it by 1-based index.
#[derive(Debug, Default)]
pub struct History {
    lines: Mutex<Vec<String>>,
}

impl History {
    pub fn push(&self, line: &str) {
        lock(&self.lines).push(line.to_string());
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }
}

impl VirtualCollection for History {
    fn get(&self, key: &HostValue) -> Option<HostValue> {
        let index = usize::try_from(key.as_int()?).ok()?.checked_sub(1)?;
        lock(&self.lines).get(index).cloned().map(HostValue::Text)
    }

    fn set(&self, key: &HostValue, _value: HostValue) -> Result<(), PropertyError> {
        Err(PropertyError::new(format!("{key:?}"), "history is read-only"))
    }

    fn len(&self) -> Option<usize> {
        Some(lock(&self.lines).len())
    }
}

/// Marker action for keys handled by a script.
pub const SCRIPT_ACTION: &str = "script";

/// Key bindings. Without a line editor these only matter to the `key`
/// builtin, which looks a key up and runs its script.
#[derive(Debug, Default)]
pub struct Keymap {
    bindings: Mutex<HashMap<String, String>>,
}

impl KeyBindings for Keymap {
    fn action(&self, key: &str) -> Option<String> {
        lock(&self.bindings).get(key).cloned()
    }

    fn bind_action(&self, key: &str, action: &str) -> Result<(), PropertyError> {
        if action.is_empty() {
            return Err(PropertyError::new(key, "empty action name"));
        }
        lock(&self.bindings).insert(key.to_string(), action.to_string());
        Ok(())
    }

    fn bind_script(&self, key: &str) -> Result<(), PropertyError> {
        lock(&self.bindings).insert(key.to_string(), SCRIPT_ACTION.to_string());
        Ok(())
    }

    fn unbind(&self, key: &str) {
        lock(&self.bindings).remove(key);
    }
}

/// The shell's event points, filled in once by the bridge.
#[derive(Debug, Default)]
pub struct Events {
    dispatcher: OnceLock<EventDispatcher>,
}

impl Events {
    pub fn dispatcher(&self) -> Option<&EventDispatcher> {
        self.dispatcher.get()
    }
}

impl ShellEvents for Events {
    fn install(&self, dispatcher: EventDispatcher) {
        if self.dispatcher.set(dispatcher).is_err() {
            tracing::warn!("shell events were already wired");
        }
    }
}

/// Split a command line into words.
///
/// Whitespace separates words; double quotes group them and are removed.
pub fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;

    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_split_words() {
        assert_eq!(split_words("  ls   -la "), vec!["ls", "-la"]);
        assert_eq!(
            split_words(r#"echo "hello world" x"#),
            vec!["echo", "hello world", "x"]
        );
        assert_eq!(split_words(r#"cmd """#), vec!["cmd", ""]);
        assert!(split_words("   ").is_empty());
    }

    #[test]
    fn test_alias_expansion() {
        let aliases = Aliases::default();
        aliases
            .set(&HostValue::from("ll"), HostValue::from("ls -l"))
            .unwrap();
        let words = aliases.expand(vec!["ll".into(), "/tmp".into()]);
        assert_eq!(words, vec!["ls", "-l", "/tmp"]);

        aliases.set(&HostValue::from("ll"), HostValue::Nil).unwrap();
        assert_eq!(aliases.expand(vec!["ll".into()]), vec!["ll"]);
    }

    #[test]
    fn test_environment_values() {
        let env = Environment::default();
        env.set(&HostValue::from("LEVEL"), HostValue::Int(3)).unwrap();
        assert_eq!(env.get("LEVEL").as_deref(), Some("3"));
        assert!(env.set(&HostValue::from("A=B"), HostValue::from("x")).is_err());
        assert!(env.set(&HostValue::from("FLAG"), HostValue::Bool(true)).is_err());
    }

    #[test]
    fn test_unknown_option_rejected() {
        let options = Options::default();
        options
            .set(&HostValue::from("noclobber"), HostValue::Bool(true))
            .unwrap();
        assert!(options.is_set("noclobber"));
        assert!(options.set(&HostValue::from("bogus"), HostValue::Bool(true)).is_err());
    }

    #[test]
    fn test_history_index_from_one() {
        let history = History::default();
        history.push("first");
        history.push("second");
        assert_eq!(history.get(&HostValue::Int(1)), Some(HostValue::from("first")));
        assert_eq!(history.get(&HostValue::Int(0)), None);
        assert_eq!(VirtualCollection::len(&history), Some(2));
    }
}
