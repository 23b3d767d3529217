//! Host-side value model.
//!
//! [`HostValue`] is the tagged envelope every value takes on the host side of
//! the bridge. The set of variants is closed: anything the marshaller can move
//! into or out of the guest runtime has exactly one variant here, and anything
//! else is a [`MarshalError`].
//!
//! Integers are the only numeric kind. Guest floats are truncated toward zero
//! when they reach the host, and host integers wider than the guest's 64-bit
//! signed range saturate. Both are accepted precision losses.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use mlua::{Function, Lua, Value};

use crate::context::ExecutionContext;
use crate::error::MarshalError;
use crate::stream::{SharedReader, SharedWriter};

/// A host value that knows how to build its own guest representation.
pub trait ToGuest: Send + Sync {
    /// Build the guest value.
    fn to_guest(&self, lua: &Lua) -> Result<Value, MarshalError>;
}

/// An opaque host-owned value handed to the guest as userdata.
///
/// Guest code can store and pass a handle around but cannot look inside it.
/// When a handle comes back to the host it unwraps to the same allocation.
#[derive(Clone)]
pub struct Handle(Arc<dyn Any + Send + Sync>);

impl Handle {
    /// Wrap a host value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the wrapped value if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Returns true if both handles wrap the same allocation.
    pub fn ptr_eq(&self, other: &Handle) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").finish_non_exhaustive()
    }
}

/// A guest callable held by the host.
///
/// The host never decomposes it; it can only be stored, compared, handed back
/// to the guest, or invoked through a [`Session`](crate::Session).
#[derive(Clone, Debug, PartialEq)]
pub struct GuestFunction(Function);

impl GuestFunction {
    pub(crate) fn new(function: Function) -> Self {
        Self(function)
    }

    /// The underlying guest function.
    pub fn function(&self) -> &Function {
        &self.0
    }

    pub(crate) fn into_function(self) -> Function {
        self.0
    }
}

/// Arguments and streams handed to a [`HostFunction::WithCall`] callable.
///
/// The streams are the current command's pipes when the call happens inside
/// an invocation bound to a shell session, and the process streams otherwise.
pub struct CallParam {
    /// Positional guest arguments, converted to host values
    pub args: Vec<HostValue>,
    /// Current command's input
    pub stdin: SharedReader,
    /// Current command's output
    pub stdout: SharedWriter,
    /// Current command's error output
    pub stderr: SharedWriter,
    /// The execution context of the invocation, if any
    pub context: Option<ExecutionContext>,
}

impl CallParam {
    /// Argument at `index`, or nil when the guest passed fewer arguments.
    pub fn arg(&self, index: usize) -> &HostValue {
        self.args.get(index).unwrap_or(&HostValue::Nil)
    }

    /// Returns true if the ambient context has been cancelled.
    ///
    /// Callables that block must poll this before doing so.
    pub fn is_cancelled(&self) -> bool {
        self.context
            .as_ref()
            .is_some_and(ExecutionContext::is_cancelled)
    }
}

impl fmt::Debug for CallParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallParam")
            .field("args", &self.args)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

type PlainFn = dyn Fn(Vec<HostValue>) -> Vec<HostValue> + Send + Sync;
type CallFn = dyn Fn(&mut CallParam) -> Vec<HostValue> + Send + Sync;

/// A host callable exposed to the guest.
///
/// Failures are reported the way the shell's builtins always have: by
/// returning `nil` followed by a [`HostValue::Error`] message.
#[derive(Clone)]
pub enum HostFunction {
    /// Takes positional arguments only
    Plain(Arc<PlainFn>),
    /// Also receives the current command's streams and context
    WithCall(Arc<CallFn>),
}

impl HostFunction {
    /// Wrap a callable that only needs its arguments.
    pub fn plain(f: impl Fn(Vec<HostValue>) -> Vec<HostValue> + Send + Sync + 'static) -> Self {
        HostFunction::Plain(Arc::new(f))
    }

    /// Wrap a callable that needs the current command's streams.
    pub fn with_call(f: impl Fn(&mut CallParam) -> Vec<HostValue> + Send + Sync + 'static) -> Self {
        HostFunction::WithCall(Arc::new(f))
    }

    fn ptr_eq(&self, other: &HostFunction) -> bool {
        match (self, other) {
            (HostFunction::Plain(a), HostFunction::Plain(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (HostFunction::WithCall(a), HostFunction::WithCall(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostFunction::Plain(_) => f.write_str("HostFunction::Plain"),
            HostFunction::WithCall(_) => f.write_str("HostFunction::WithCall"),
        }
    }
}

/// A keyed composite. Equality ignores insertion order.
#[derive(Clone, Debug, Default)]
pub struct HostMap {
    entries: Vec<(HostValue, HostValue)>,
}

impl HostMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair, replacing the value of an equal key.
    pub fn insert(&mut self, key: impl Into<HostValue>, value: impl Into<HostValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Look up a key.
    pub fn get(&self, key: &HostValue) -> Option<&HostValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Look up a text key.
    pub fn get_str(&self, key: &str) -> Option<&HostValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the entries.
    pub fn iter(&self) -> impl Iterator<Item = &(HostValue, HostValue)> {
        self.entries.iter()
    }
}

impl PartialEq for HostMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|ov| ov == v))
    }
}

impl IntoIterator for HostMap {
    type Item = (HostValue, HostValue);
    type IntoIter = std::vec::IntoIter<(HostValue, HostValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// The host-side envelope of a marshalled value.
#[derive(Clone, Default)]
pub enum HostValue {
    /// Absent value
    #[default]
    Nil,
    /// Boolean
    Bool(bool),
    /// Integer of any host width
    Int(i64),
    /// Human text
    Text(String),
    /// Raw bytes, passed to the guest unchanged
    Bytes(Vec<u8>),
    /// An error, seen by the guest as its message text
    Error(String),
    /// Opaque host handle
    Handle(Handle),
    /// A guest callable held by the host
    Callable(GuestFunction),
    /// A host callable to expose to the guest
    Function(HostFunction),
    /// Ordered sequence, 1-based in the guest
    Seq(Vec<HostValue>),
    /// Keyed mapping
    Map(HostMap),
    /// A value that converts itself
    Native(Arc<dyn ToGuest>),
}

impl HostValue {
    /// Build an error value from anything displayable.
    pub fn error(err: impl fmt::Display) -> Self {
        HostValue::Error(err.to_string())
    }

    /// Short name of the variant, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            HostValue::Nil => "nil",
            HostValue::Bool(_) => "boolean",
            HostValue::Int(_) => "integer",
            HostValue::Text(_) => "text",
            HostValue::Bytes(_) => "bytes",
            HostValue::Error(_) => "error",
            HostValue::Handle(_) => "handle",
            HostValue::Callable(_) => "guest function",
            HostValue::Function(_) => "host function",
            HostValue::Seq(_) => "sequence",
            HostValue::Map(_) => "map",
            HostValue::Native(_) => "native",
        }
    }

    /// Returns true for [`HostValue::Nil`].
    pub fn is_nil(&self) -> bool {
        matches!(self, HostValue::Nil)
    }

    /// Guest truthiness: everything except nil and false.
    pub fn truthy(&self) -> bool {
        !matches!(self, HostValue::Nil | HostValue::Bool(false))
    }

    /// Borrow as text, accepting byte buffers that are valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Text(s) | HostValue::Error(s) => Some(s),
            HostValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// The integer value, if this is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HostValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Convert a sequence-like value into its ordered elements.
    ///
    /// Accepts [`HostValue::Seq`] and maps whose keys are exactly `1..=n`,
    /// which is what a guest sequence becomes on the host side.
    pub fn into_sequence(self) -> Option<Vec<HostValue>> {
        match self {
            HostValue::Seq(items) => Some(items),
            HostValue::Map(map) => {
                let len = map.len();
                let mut slots: Vec<Option<HostValue>> = vec![None; len];
                for (k, v) in map {
                    let index = usize::try_from(k.as_int()?).ok()?;
                    let slot = slots.get_mut(index.checked_sub(1)?)?;
                    *slot = Some(v);
                }
                slots.into_iter().collect()
            }
            _ => None,
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Nil, HostValue::Nil) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Int(a), HostValue::Int(b)) => a == b,
            (HostValue::Text(a), HostValue::Text(b)) => a == b,
            (HostValue::Bytes(a), HostValue::Bytes(b)) => a == b,
            (HostValue::Error(a), HostValue::Error(b)) => a == b,
            (HostValue::Handle(a), HostValue::Handle(b)) => a.ptr_eq(b),
            (HostValue::Callable(a), HostValue::Callable(b)) => a == b,
            (HostValue::Function(a), HostValue::Function(b)) => a.ptr_eq(b),
            (HostValue::Seq(a), HostValue::Seq(b)) => a == b,
            (HostValue::Map(a), HostValue::Map(b)) => a == b,
            (HostValue::Native(a), HostValue::Native(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Nil => f.write_str("Nil"),
            HostValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            HostValue::Int(i) => f.debug_tuple("Int").field(i).finish(),
            HostValue::Text(s) => f.debug_tuple("Text").field(s).finish(),
            HostValue::Bytes(b) => f.debug_tuple("Bytes").field(b).finish(),
            HostValue::Error(s) => f.debug_tuple("Error").field(s).finish(),
            HostValue::Handle(h) => h.fmt(f),
            HostValue::Callable(c) => f.debug_tuple("Callable").field(c).finish(),
            HostValue::Function(h) => h.fmt(f),
            HostValue::Seq(items) => f.debug_tuple("Seq").field(items).finish(),
            HostValue::Map(map) => f.debug_tuple("Map").field(map).finish(),
            HostValue::Native(_) => f.write_str("Native"),
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

macro_rules! int_into_host {
    ($($t:ty),*) => {
        $(
            impl From<$t> for HostValue {
                fn from(value: $t) -> Self {
                    HostValue::Int(i64::from(value))
                }
            }
        )*
    };
}

int_into_host!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for HostValue {
    fn from(value: u64) -> Self {
        HostValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for HostValue {
    fn from(value: usize) -> Self {
        HostValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<isize> for HostValue {
    fn from(value: isize) -> Self {
        HostValue::Int(i64::try_from(value).unwrap_or(if value < 0 {
            i64::MIN
        } else {
            i64::MAX
        }))
    }
}

impl From<chrono::Month> for HostValue {
    fn from(value: chrono::Month) -> Self {
        HostValue::Int(i64::from(value.number_from_month()))
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::Text(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::Text(value.to_string())
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(value: Vec<u8>) -> Self {
        HostValue::Bytes(value)
    }
}

impl From<Handle> for HostValue {
    fn from(value: Handle) -> Self {
        HostValue::Handle(value)
    }
}

impl From<GuestFunction> for HostValue {
    fn from(value: GuestFunction) -> Self {
        HostValue::Callable(value)
    }
}

impl From<HostFunction> for HostValue {
    fn from(value: HostFunction) -> Self {
        HostValue::Function(value)
    }
}

impl From<HostMap> for HostValue {
    fn from(value: HostMap) -> Self {
        HostValue::Map(value)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(HostValue::Nil, Into::into)
    }
}

impl<K: Into<HostValue>, V: Into<HostValue>> From<HashMap<K, V>> for HostValue {
    fn from(value: HashMap<K, V>) -> Self {
        let mut map = HostMap::new();
        for (k, v) in value {
            map.insert(k, v);
        }
        HostValue::Map(map)
    }
}

impl<K: Into<HostValue>, V: Into<HostValue>> From<BTreeMap<K, V>> for HostValue {
    fn from(value: BTreeMap<K, V>) -> Self {
        let mut map = HostMap::new();
        for (k, v) in value {
            map.insert(k, v);
        }
        HostValue::Map(map)
    }
}

impl FromIterator<HostValue> for HostValue {
    fn from_iter<I: IntoIterator<Item = HostValue>>(iter: I) -> Self {
        HostValue::Seq(iter.into_iter().collect())
    }
}

macro_rules! int_from_host {
    ($($t:ty),*) => {
        $(
            impl TryFrom<HostValue> for $t {
                type Error = MarshalError;

                fn try_from(value: HostValue) -> Result<Self, Self::Error> {
                    match value {
                        HostValue::Int(i) => <$t>::try_from(i).map_err(|_| MarshalError::OutOfRange {
                            value: i,
                            target: stringify!($t),
                        }),
                        other => Err(MarshalError::Kind {
                            expected: "integer",
                            found: other.kind_name(),
                        }),
                    }
                }
            }
        )*
    };
}

int_from_host!(i8, i16, i32, u8, u16, u32, u64, usize, isize);

impl TryFrom<HostValue> for i64 {
    type Error = MarshalError;

    fn try_from(value: HostValue) -> Result<Self, Self::Error> {
        match value {
            HostValue::Int(i) => Ok(i),
            other => Err(MarshalError::Kind {
                expected: "integer",
                found: other.kind_name(),
            }),
        }
    }
}

impl TryFrom<HostValue> for chrono::Month {
    type Error = MarshalError;

    fn try_from(value: HostValue) -> Result<Self, Self::Error> {
        let number = u8::try_from(value)?;
        chrono::Month::try_from(number).map_err(|_| MarshalError::OutOfRange {
            value: i64::from(number),
            target: "Month",
        })
    }
}

impl TryFrom<HostValue> for bool {
    type Error = MarshalError;

    fn try_from(value: HostValue) -> Result<Self, Self::Error> {
        match value {
            HostValue::Bool(b) => Ok(b),
            other => Err(MarshalError::Kind {
                expected: "boolean",
                found: other.kind_name(),
            }),
        }
    }
}

impl TryFrom<HostValue> for String {
    type Error = MarshalError;

    fn try_from(value: HostValue) -> Result<Self, Self::Error> {
        match value {
            HostValue::Text(s) | HostValue::Error(s) => Ok(s),
            HostValue::Bytes(b) => String::from_utf8(b).map_err(|_| MarshalError::Kind {
                expected: "text",
                found: "non-UTF-8 bytes",
            }),
            other => Err(MarshalError::Kind {
                expected: "text",
                found: other.kind_name(),
            }),
        }
    }
}

/// Byte buffers come back from the guest as text when they happen to be
/// valid UTF-8; declaring `Vec<u8>` recovers the raw bytes either way.
impl TryFrom<HostValue> for Vec<u8> {
    type Error = MarshalError;

    fn try_from(value: HostValue) -> Result<Self, Self::Error> {
        match value {
            HostValue::Bytes(b) => Ok(b),
            HostValue::Text(s) => Ok(s.into_bytes()),
            other => Err(MarshalError::Kind {
                expected: "bytes",
                found: other.kind_name(),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widths_into_host() {
        assert_eq!(HostValue::from(-5i8), HostValue::Int(-5));
        assert_eq!(HostValue::from(300u16), HostValue::Int(300));
        assert_eq!(HostValue::from(7usize), HostValue::Int(7));
        assert_eq!(HostValue::from(u64::MAX), HostValue::Int(i64::MAX));
        assert_eq!(HostValue::from(isize::MIN), HostValue::Int(i64::from(i32::MIN) * (1 << 32)));
    }

    #[test]
    fn test_declared_width_out_of_range() {
        let err = u8::try_from(HostValue::Int(256)).unwrap_err();
        assert!(matches!(err, MarshalError::OutOfRange { value: 256, target: "u8" }));

        let err = i32::try_from(HostValue::Text("1".into())).unwrap_err();
        assert!(matches!(err, MarshalError::Kind { expected: "integer", .. }));
    }

    #[test]
    fn test_month_is_numeric() {
        assert_eq!(HostValue::from(chrono::Month::March), HostValue::Int(3));
        let month = chrono::Month::try_from(HostValue::Int(12)).unwrap();
        assert_eq!(month, chrono::Month::December);
        assert!(chrono::Month::try_from(HostValue::Int(13)).is_err());
    }

    #[test]
    fn test_map_equality_ignores_order() {
        let mut a = HostMap::new();
        a.insert("x", 1i64);
        a.insert("y", true);
        let mut b = HostMap::new();
        b.insert("y", true);
        b.insert("x", 1i64);
        assert_eq!(HostValue::Map(a.clone()), HostValue::Map(b));

        let mut c = HostMap::new();
        c.insert("x", 1i64);
        assert_ne!(HostValue::Map(a), HostValue::Map(c));
    }

    #[test]
    fn test_map_insert_replaces() {
        let mut map = HostMap::new();
        map.insert("k", 1i64);
        map.insert("k", 2i64);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get_str("k"), Some(&HostValue::Int(2)));
    }

    #[test]
    fn test_into_sequence_from_map() {
        let mut map = HostMap::new();
        map.insert(2i64, "b");
        map.insert(1i64, "a");
        map.insert(3i64, "c");
        let seq = HostValue::Map(map).into_sequence().unwrap();
        assert_eq!(seq, vec!["a".into(), "b".into(), "c".into()]);

        let mut gap = HostMap::new();
        gap.insert(1i64, "a");
        gap.insert(3i64, "c");
        assert!(HostValue::Map(gap).into_sequence().is_none());
    }

    #[test]
    fn test_handle_identity() {
        let h = Handle::new(41u32);
        let copy = h.clone();
        assert_eq!(HostValue::from(h), HostValue::from(copy.clone()));
        assert_ne!(HostValue::from(copy.clone()), HostValue::from(Handle::new(41u32)));
        assert_eq!(copy.downcast_ref::<u32>(), Some(&41));
        assert!(copy.downcast_ref::<String>().is_none());
    }

    #[test]
    fn test_bytes_declared_type() {
        let bytes: Vec<u8> = HostValue::Text("abc".into()).try_into().unwrap();
        assert_eq!(bytes, b"abc");
        assert!(String::try_from(HostValue::Bytes(vec![0xff])).is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(!HostValue::Nil.truthy());
        assert!(!HostValue::Bool(false).truthy());
        assert!(HostValue::Int(0).truthy());
        assert!(HostValue::Text(String::new()).truthy());
    }
}
