//! Value marshalling between [`HostValue`] and guest values.
//!
//! The rules are a closed match on both sides. Anything without a rule is a
//! [`MarshalError`]; nothing is ever silently turned into nil.

use mlua::{Function, Lua, MultiValue, UserData, Value};

use crate::context;
use crate::error::MarshalError;
use crate::stream::CommandIo;
use crate::value::{CallParam, GuestFunction, Handle, HostFunction, HostMap, HostValue};

/// Guest tables nested deeper than this are rejected. Self-referencing
/// tables hit the limit instead of recursing forever.
pub const MAX_DEPTH: usize = 64;

/// Userdata wrapping a host [`Handle`].
pub(crate) struct HandleData(pub(crate) Handle);

impl UserData for HandleData {}

/// Convert a host value into a guest value.
pub fn to_guest(lua: &Lua, value: HostValue) -> Result<Value, MarshalError> {
    Ok(match value {
        HostValue::Nil => Value::Nil,
        HostValue::Bool(b) => Value::Boolean(b),
        HostValue::Int(i) => Value::Integer(i),
        HostValue::Text(s) | HostValue::Error(s) => Value::String(lua.create_string(&s)?),
        HostValue::Bytes(b) => Value::String(lua.create_string(&b)?),
        HostValue::Handle(h) => Value::UserData(lua.create_userdata(HandleData(h))?),
        HostValue::Callable(f) => Value::Function(f.into_function()),
        HostValue::Function(f) => Value::Function(wrap_host_function(lua, f)?),
        HostValue::Seq(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.into_iter().enumerate() {
                table.raw_set(i + 1, to_guest(lua, item)?)?;
            }
            Value::Table(table)
        }
        HostValue::Map(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                let key = to_guest(lua, k)?;
                if key.is_nil() {
                    return Err(MarshalError::NilKey);
                }
                table.raw_set(key, to_guest(lua, v)?)?;
            }
            Value::Table(table)
        }
        HostValue::Native(native) => native.to_guest(lua)?,
    })
}

/// Convert a guest value into a host value.
///
/// Floats are truncated toward zero (saturating at the integer range), and
/// strings that are not valid UTF-8 come back as [`HostValue::Bytes`].
pub fn to_host(value: Value) -> Result<HostValue, MarshalError> {
    to_host_at(value, 0)
}

fn to_host_at(value: Value, depth: usize) -> Result<HostValue, MarshalError> {
    Ok(match value {
        Value::Nil => HostValue::Nil,
        Value::Boolean(b) => HostValue::Bool(b),
        Value::Integer(i) => HostValue::Int(i),
        Value::Number(n) => HostValue::Int(n as i64),
        Value::String(s) => {
            let bytes = s.as_bytes().to_vec();
            match String::from_utf8(bytes) {
                Ok(text) => HostValue::Text(text),
                Err(e) => HostValue::Bytes(e.into_bytes()),
            }
        }
        Value::Error(e) => HostValue::Text(error_message(&e)),
        Value::Function(f) => HostValue::Callable(GuestFunction::new(f)),
        Value::UserData(ud) => {
            let data = ud
                .borrow::<HandleData>()
                .map_err(|_| MarshalError::ForeignUserData)?;
            HostValue::Handle(data.0.clone())
        }
        Value::Table(table) => {
            if depth >= MAX_DEPTH {
                return Err(MarshalError::TooDeep(MAX_DEPTH));
            }
            let mut map = HostMap::new();
            for pair in table.pairs::<Value, Value>() {
                let (k, v) = pair?;
                map.insert(to_host_at(k, depth + 1)?, to_host_at(v, depth + 1)?);
            }
            HostValue::Map(map)
        }
        other => return Err(MarshalError::UnsupportedGuest(other.type_name())),
    })
}

/// The message of an error value caught by guest `pcall`, without the
/// callback traceback mlua wraps around host-raised errors.
fn error_message(error: &mlua::Error) -> String {
    match error {
        mlua::Error::CallbackError { cause, .. } => error_message(cause),
        mlua::Error::RuntimeError(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Host type a guest value is read as.
///
/// Guest strings carry no marker telling text from raw bytes, so a caller
/// that knows which one it expects says so here instead of relying on the
/// content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declared {
    /// Whatever [`to_host`] makes of it
    Any,
    /// A boolean
    Bool,
    /// An integer (numbers are truncated)
    Int,
    /// UTF-8 text
    Text,
    /// A byte buffer, whatever the bytes are
    Bytes,
}

/// Convert a guest value into the declared host type.
///
/// Nil stays nil for every declared type.
pub fn to_host_as(value: Value, declared: Declared) -> Result<HostValue, MarshalError> {
    let found = value.type_name();
    let mismatch = |expected| MarshalError::Kind { expected, found };
    Ok(match (declared, value) {
        (_, Value::Nil) => HostValue::Nil,
        (Declared::Any, value) => to_host(value)?,
        (Declared::Bool, Value::Boolean(b)) => HostValue::Bool(b),
        (Declared::Int, value @ (Value::Integer(_) | Value::Number(_))) => to_host(value)?,
        (Declared::Text, Value::String(s)) => HostValue::Text(
            s.to_str()
                .map_err(|_| MarshalError::Kind {
                    expected: "text",
                    found: "non-UTF-8 bytes",
                })?
                .to_string(),
        ),
        (Declared::Bytes, Value::String(s)) => HostValue::Bytes(s.as_bytes().to_vec()),
        (Declared::Bool, _) => return Err(mismatch("boolean")),
        (Declared::Int, _) => return Err(mismatch("integer")),
        (Declared::Text, _) => return Err(mismatch("text")),
        (Declared::Bytes, _) => return Err(mismatch("bytes")),
    })
}

/// Convert every positional guest argument, in order.
pub fn args_to_host(args: MultiValue) -> Result<Vec<HostValue>, MarshalError> {
    args.into_iter().map(to_host).collect()
}

/// Convert host results into the guest call's multiple return values.
pub fn results_to_guest(lua: &Lua, values: Vec<HostValue>) -> Result<MultiValue, MarshalError> {
    values.into_iter().map(|v| to_guest(lua, v)).collect()
}

/// Streams and context for a call-carrying host function.
///
/// Inside an invocation these are the attached shell's current pipes;
/// otherwise the process streams.
fn call_param(lua: &Lua, args: Vec<HostValue>) -> CallParam {
    let context = context::current(lua);
    let io = context
        .as_ref()
        .and_then(|c| c.shell())
        .map(|shell| shell.io())
        .unwrap_or_else(CommandIo::process);
    CallParam {
        args,
        stdin: io.stdin,
        stdout: io.stdout,
        stderr: io.stderr,
        context,
    }
}

pub(crate) fn wrap_host_function(lua: &Lua, function: HostFunction) -> Result<Function, MarshalError> {
    let wrapped = lua.create_function(move |lua, args: MultiValue| {
        let args = args_to_host(args).map_err(mlua::Error::external)?;
        let results = match &function {
            HostFunction::Plain(f) => f(args),
            HostFunction::WithCall(f) => {
                let mut param = call_param(lua, args);
                f(&mut param)
            }
        };
        results_to_guest(lua, results).map_err(mlua::Error::external)
    })?;
    Ok(wrapped)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn round_trip(lua: &Lua, value: HostValue) -> HostValue {
        to_host(to_guest(lua, value).unwrap()).unwrap()
    }

    #[test]
    fn test_primitive_round_trip() {
        let lua = Lua::new();
        for value in [
            HostValue::Nil,
            HostValue::Bool(true),
            HostValue::Bool(false),
            HostValue::from(i8::MIN),
            HostValue::from(u32::MAX),
            HostValue::from(i64::MIN),
            HostValue::from("hello"),
        ] {
            assert_eq!(round_trip(&lua, value.clone()), value);
        }
    }

    #[test]
    fn test_integer_is_guest_number() {
        let lua = Lua::new();
        let value = to_guest(&lua, HostValue::from(42i32)).unwrap();
        lua.globals().set("x", value).unwrap();
        let same: bool = lua.load("return x == 42.0").eval().unwrap();
        assert!(same);
    }

    #[test]
    fn test_float_truncates() {
        assert_eq!(to_host(Value::Number(2.9)).unwrap(), HostValue::Int(2));
        assert_eq!(to_host(Value::Number(-2.9)).unwrap(), HostValue::Int(-2));
        assert_eq!(to_host(Value::Number(1e300)).unwrap(), HostValue::Int(i64::MAX));
    }

    #[test]
    fn test_error_becomes_text() {
        let lua = Lua::new();
        let value = to_guest(&lua, HostValue::error("no such file")).unwrap();
        assert_eq!(to_host(value).unwrap(), HostValue::Text("no such file".into()));
    }

    #[test]
    fn test_printable_bytes_stay_raw_in_guest() {
        let lua = Lua::new();
        let value = to_guest(&lua, HostValue::Bytes(b"abc".to_vec())).unwrap();
        let Value::String(s) = &value else {
            panic!("expected a guest string");
        };
        assert_eq!(&*s.as_bytes(), b"abc");
    }

    #[test]
    fn test_bytes_round_trip_by_declared_type() {
        let lua = Lua::new();
        for bytes in [b"abc".to_vec(), vec![0x00, 0x01], vec![0x00, 0x01, 0xFF], Vec::new()] {
            let value = HostValue::Bytes(bytes);
            let guest = to_guest(&lua, value.clone()).unwrap();
            assert_eq!(to_host_as(guest, Declared::Bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_declared_kind_mismatch() {
        let lua = Lua::new();
        let raw = to_guest(&lua, HostValue::Bytes(vec![0xFF])).unwrap();
        assert!(matches!(
            to_host_as(raw, Declared::Text),
            Err(MarshalError::Kind { expected: "text", .. })
        ));
        assert!(matches!(
            to_host_as(Value::Boolean(true), Declared::Int),
            Err(MarshalError::Kind { expected: "integer", found: "boolean" })
        ));
        assert_eq!(to_host_as(Value::Nil, Declared::Bytes).unwrap(), HostValue::Nil);
        assert_eq!(to_host_as(Value::Number(3.7), Declared::Int).unwrap(), HostValue::Int(3));
    }

    #[test]
    fn test_caught_host_error_becomes_message() {
        let lua = Lua::new();
        let fail = lua
            .create_function(|_, ()| -> mlua::Result<()> { Err(mlua::Error::runtime("stream closed")) })
            .unwrap();
        lua.globals().set("fail", fail).unwrap();
        let results: MultiValue = lua.load("return pcall(fail)").eval().unwrap();
        let host = args_to_host(results).unwrap();
        assert_eq!(host, vec![HostValue::Bool(false), HostValue::from("stream closed")]);
    }

    #[test]
    fn test_sequence_is_one_based() {
        let lua = Lua::new();
        let seq: HostValue = ["a", "b", "c"].into_iter().map(HostValue::from).collect();
        lua.globals().set("t", to_guest(&lua, seq).unwrap()).unwrap();
        let (len, first, last): (i64, String, String) =
            lua.load("return #t, t[1], t[3]").eval().unwrap();
        assert_eq!((len, first.as_str(), last.as_str()), (3, "a", "c"));
    }

    #[test]
    fn test_nil_key_rejected() {
        let lua = Lua::new();
        let mut map = HostMap::new();
        map.insert(HostValue::Nil, 1i64);
        let err = to_guest(&lua, HostValue::Map(map)).unwrap_err();
        assert!(matches!(err, MarshalError::NilKey));
    }

    #[test]
    fn test_unsupported_guest_value() {
        let lua = Lua::new();
        let thread: Value = lua
            .load("return coroutine.create(function() end)")
            .eval()
            .unwrap();
        let err = to_host(thread).unwrap_err();
        assert!(matches!(err, MarshalError::UnsupportedGuest("thread")));
    }

    #[test]
    fn test_foreign_userdata_rejected() {
        struct Other;
        impl UserData for Other {}

        let lua = Lua::new();
        let ud = lua.create_userdata(Other).unwrap();
        let err = to_host(Value::UserData(ud)).unwrap_err();
        assert!(matches!(err, MarshalError::ForeignUserData));
    }

    #[test]
    fn test_cyclic_table_fails() {
        let lua = Lua::new();
        let cyclic: Value = lua.load("local t = {} t.self = t return t").eval().unwrap();
        let err = to_host(cyclic).unwrap_err();
        assert!(matches!(err, MarshalError::TooDeep(MAX_DEPTH)));
    }

    #[test]
    fn test_handle_unwraps_to_same_value() {
        let lua = Lua::new();
        let handle = Handle::new(String::from("session"));
        let back = round_trip(&lua, HostValue::Handle(handle.clone()));
        assert_eq!(back, HostValue::Handle(handle));
    }

    #[test]
    fn test_host_function_multiple_returns() {
        let lua = Lua::new();
        let add = HostFunction::plain(|args| {
            let a = args.first().and_then(HostValue::as_int).unwrap_or(0);
            let b = args.get(1).and_then(HostValue::as_int).unwrap_or(0);
            vec![HostValue::Int(a + b), HostValue::from("ok")]
        });
        lua.globals()
            .set("add", to_guest(&lua, add.into()).unwrap())
            .unwrap();
        let (sum, tag): (i64, String) = lua.load("return add(2, 3)").eval().unwrap();
        assert_eq!(sum, 5);
        assert_eq!(tag, "ok");
    }

    #[test]
    fn test_host_function_failure_convention() {
        let lua = Lua::new();
        let failing = HostFunction::plain(|_| vec![HostValue::Nil, HostValue::error("denied")]);
        lua.globals()
            .set("f", to_guest(&lua, failing.into()).unwrap())
            .unwrap();
        let (ok, msg): (Option<bool>, String) = lua.load("return f()").eval().unwrap();
        assert!(ok.is_none());
        assert_eq!(msg, "denied");
    }
}
