//! Per-invocation standard streams.
//!
//! A [`StreamScope`] binds the guest's `io.stdin`, `io.stdout` and
//! `io.stderr` to the pipes of the command that is running right now. The
//! pipes change on every command, so a scope lives for exactly one guest
//! invocation. Closing it disposes each proxy explicitly instead of waiting
//! for the guest collector: a script that kept a reference to `io.stdout`
//! gets "attempt to use a closed file" afterwards, never the next command's
//! pipe.

use std::io::{BufRead, BufReader, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use mlua::{AnyUserData, Function, Lua, MetaMethod, MultiValue, Table, UserData, UserDataMethods, Value};
use tracing::{trace, warn};

use crate::cancel::CancelSignal;

/// Input side of a command, shared with whoever feeds it.
pub type SharedReader = Arc<Mutex<dyn BufRead + Send>>;
/// Output side of a command, shared with whoever drains it.
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

const STREAM_FIELDS: [&str; 3] = ["stdin", "stdout", "stderr"];

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The three pipes of one in-flight command.
#[derive(Clone)]
pub struct CommandIo {
    /// Command input
    pub stdin: SharedReader,
    /// Command output
    pub stdout: SharedWriter,
    /// Command error output
    pub stderr: SharedWriter,
}

impl CommandIo {
    /// Bundle three pipes.
    pub fn new(
        stdin: impl BufRead + Send + 'static,
        stdout: impl Write + Send + 'static,
        stderr: impl Write + Send + 'static,
    ) -> Self {
        Self {
            stdin: Arc::new(Mutex::new(stdin)),
            stdout: Arc::new(Mutex::new(stdout)),
            stderr: Arc::new(Mutex::new(stderr)),
        }
    }

    /// The process's own standard streams.
    ///
    /// Every call returns handles to the same buffered reader, so input read
    /// ahead by one command is still there for the next.
    pub fn process() -> Self {
        static PROCESS: OnceLock<CommandIo> = OnceLock::new();
        PROCESS
            .get_or_init(|| {
                CommandIo::new(
                    BufReader::new(std::io::stdin()),
                    std::io::stdout(),
                    std::io::stderr(),
                )
            })
            .clone()
    }
}

impl std::fmt::Debug for CommandIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandIo").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct PipeBuffer {
    buffer: Vec<u8>,
    limit: Option<usize>,
    truncated: bool,
}

impl PipeBuffer {
    fn write(&mut self, data: &[u8]) -> usize {
        let Some(limit) = self.limit else {
            self.buffer.extend_from_slice(data);
            return data.len();
        };
        let remaining = limit.saturating_sub(self.buffer.len());
        if remaining == 0 {
            self.truncated = true;
            return data.len(); // Pretend we wrote it
        }

        let to_write = data.len().min(remaining);
        self.buffer.extend_from_slice(&data[..to_write]);

        if to_write < data.len() {
            self.truncated = true;
            self.buffer
                .extend_from_slice(b"\n... [output truncated] ...\n");
        }

        data.len()
    }
}

/// An in-memory output pipe, used to capture what a command writes.
///
/// Clones share the same buffer, so one clone can be handed to a
/// [`CommandIo`] while another is kept to read the result.
#[derive(Debug, Clone, Default)]
pub struct MemoryPipe {
    inner: Arc<Mutex<PipeBuffer>>,
}

impl MemoryPipe {
    /// An unbounded pipe.
    pub fn new() -> Self {
        Self::default()
    }

    /// A pipe that keeps at most `limit` bytes and drops the rest.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PipeBuffer {
                limit: Some(limit),
                ..PipeBuffer::default()
            })),
        }
    }

    /// Everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.inner).buffer.clone()
    }

    /// Everything written so far, as lossy UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&lock(&self.inner).buffer).into_owned()
    }

    /// Returns true if output was dropped because of the limit.
    pub fn was_truncated(&self) -> bool {
        lock(&self.inner).truncated
    }
}

impl Write for MemoryPipe {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(lock(&self.inner).write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum Pipe {
    Input(SharedReader),
    Output(SharedWriter),
}

/// Guest-visible file object over one command pipe.
pub(crate) struct StreamProxy {
    name: &'static str,
    pipe: Option<Pipe>,
    cancel: Option<CancelSignal>,
}

impl StreamProxy {
    pub(crate) fn input(name: &'static str, reader: SharedReader, cancel: Option<CancelSignal>) -> Self {
        Self {
            name,
            pipe: Some(Pipe::Input(reader)),
            cancel,
        }
    }

    pub(crate) fn output(name: &'static str, writer: SharedWriter) -> Self {
        Self {
            name,
            pipe: Some(Pipe::Output(writer)),
            cancel: None,
        }
    }

    fn reader(&self) -> mlua::Result<&SharedReader> {
        match &self.pipe {
            Some(Pipe::Input(r)) => Ok(r),
            Some(Pipe::Output(_)) => Err(mlua::Error::runtime(format!("{} is not readable", self.name))),
            None => Err(closed()),
        }
    }

    fn writer(&self) -> mlua::Result<&SharedWriter> {
        match &self.pipe {
            Some(Pipe::Output(w)) => Ok(w),
            Some(Pipe::Input(_)) => Err(mlua::Error::runtime(format!("{} is not writable", self.name))),
            None => Err(closed()),
        }
    }

    /// Flush and detach from the pipe. Later use raises "closed file".
    pub(crate) fn dispose(&mut self) -> std::io::Result<()> {
        match self.pipe.take() {
            Some(Pipe::Output(w)) => lock(&*w).flush(),
            _ => Ok(()),
        }
    }

    pub(crate) fn write_values(&mut self, args: &MultiValue) -> mlua::Result<()> {
        let writer = self.writer()?;
        let mut out = lock(&**writer);
        for (i, value) in args.iter().enumerate() {
            let result = match value {
                Value::String(s) => out.write_all(&s.as_bytes()),
                Value::Integer(n) => write!(out, "{n}"),
                Value::Number(n) => out.write_all(format_number(*n).as_bytes()),
                other => {
                    return Err(mlua::Error::runtime(format!(
                        "bad argument #{} to 'write' (string expected, got {})",
                        i + 1,
                        other.type_name()
                    )));
                }
            };
            result.map_err(mlua::Error::external)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> mlua::Result<()> {
        let writer = self.writer()?;
        lock(&**writer).flush().map_err(mlua::Error::external)
    }

    pub(crate) fn read_values(&mut self, lua: &Lua, formats: MultiValue) -> mlua::Result<MultiValue> {
        if self.cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
            return Err(mlua::Error::runtime("interrupted"));
        }
        let reader = self.reader()?.clone();
        let mut input = lock(&*reader);
        let formats: Vec<Value> = if formats.is_empty() {
            vec![Value::String(lua.create_string("l")?)]
        } else {
            formats.into_iter().collect()
        };

        let mut results = Vec::with_capacity(formats.len());
        for format in formats {
            let value = read_one(lua, &mut *input, &format)?;
            let eof = value.is_nil();
            results.push(value);
            if eof {
                break;
            }
        }
        Ok(results.into_iter().collect())
    }
}

impl UserData for StreamProxy {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("write", |_, (ud, args): (AnyUserData, MultiValue)| {
            ud.borrow_mut::<StreamProxy>()?.write_values(&args)?;
            Ok(ud)
        });

        methods.add_function("flush", |_, ud: AnyUserData| {
            ud.borrow_mut::<StreamProxy>()?.flush()?;
            Ok(ud)
        });

        methods.add_method_mut("read", |lua, this, formats: MultiValue| {
            this.read_values(lua, formats)
        });

        methods.add_function("lines", |lua, (ud, formats): (AnyUserData, MultiValue)| {
            lines_iterator(lua, ud, formats)
        });

        methods.add_method_mut("close", |_, this, ()| {
            if this.pipe.is_none() {
                return Err(closed());
            }
            this.dispose().map_err(mlua::Error::external)?;
            Ok(true)
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            let state = if this.pipe.is_some() { "open" } else { "closed" };
            Ok(format!("file {} ({state})", this.name))
        });
    }
}

fn closed() -> mlua::Error {
    mlua::Error::runtime("attempt to use a closed file")
}

/// Lua prints integral floats with a trailing `.0`.
fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{n:.1}")
    } else {
        format!("{n}")
    }
}

fn lines_iterator(lua: &Lua, ud: AnyUserData, formats: MultiValue) -> mlua::Result<Function> {
    let formats: Vec<Value> = formats.into_iter().collect();
    lua.create_function(move |lua, ()| {
        let mut proxy = ud.borrow_mut::<StreamProxy>()?;
        let mut values = proxy.read_values(lua, formats.iter().cloned().collect())?;
        Ok(values.pop_front().unwrap_or(Value::Nil))
    })
}

fn read_one(lua: &Lua, input: &mut (dyn BufRead + Send), format: &Value) -> mlua::Result<Value> {
    let io_err = mlua::Error::external;
    match format {
        Value::Integer(n) => {
            let count = u64::try_from(*n).unwrap_or(0);
            let mut buf = Vec::new();
            Read::take(&mut *input, count)
                .read_to_end(&mut buf)
                .map_err(io_err)?;
            if buf.is_empty() && count > 0 {
                return Ok(Value::Nil);
            }
            if count == 0 && input.fill_buf().map_err(io_err)?.is_empty() {
                return Ok(Value::Nil);
            }
            Ok(Value::String(lua.create_string(&buf)?))
        }
        Value::String(s) => {
            let spec = s.to_str()?.trim_start_matches('*').to_string();
            match spec.chars().next() {
                Some('l') | Some('L') => {
                    let mut buf = Vec::new();
                    if input.read_until(b'\n', &mut buf).map_err(io_err)? == 0 {
                        return Ok(Value::Nil);
                    }
                    if spec.starts_with('l') && buf.last() == Some(&b'\n') {
                        buf.pop();
                    }
                    Ok(Value::String(lua.create_string(&buf)?))
                }
                Some('a') => {
                    let mut buf = Vec::new();
                    input.read_to_end(&mut buf).map_err(io_err)?;
                    Ok(Value::String(lua.create_string(&buf)?))
                }
                Some('n') => read_number(input),
                _ => Err(mlua::Error::runtime(format!(
                    "bad argument to 'read' (invalid format '{spec}')"
                ))),
            }
        }
        other => Err(mlua::Error::runtime(format!(
            "bad argument to 'read' (invalid format of type {})",
            other.type_name()
        ))),
    }
}

fn read_number(input: &mut (dyn BufRead + Send)) -> mlua::Result<Value> {
    let io_err = mlua::Error::external;
    loop {
        let buf = input.fill_buf().map_err(io_err)?;
        match buf.first() {
            Some(b) if b.is_ascii_whitespace() => input.consume(1),
            Some(_) => break,
            None => return Ok(Value::Nil),
        }
    }
    let mut token = Vec::new();
    loop {
        let buf = input.fill_buf().map_err(io_err)?;
        match buf.first() {
            Some(&b) if b.is_ascii_alphanumeric() || b"+-.".contains(&b) => {
                token.push(b);
                input.consume(1);
            }
            _ => break,
        }
    }
    let token = String::from_utf8_lossy(&token);
    if let Ok(i) = token.parse::<i64>() {
        Ok(Value::Integer(i))
    } else if let Ok(f) = token.parse::<f64>() {
        Ok(Value::Number(f))
    } else {
        Ok(Value::Nil)
    }
}

/// The guest's standard streams, bound to one command for one invocation.
#[derive(Debug)]
pub struct StreamScope {
    io: Table,
    proxies: Vec<AnyUserData>,
    prior: Vec<Value>,
    closed: bool,
}

impl StreamScope {
    /// Install proxies for `pipes` as `io.stdin`, `io.stdout` and `io.stderr`.
    ///
    /// Reads on the input proxy fail once `cancel` is set.
    pub fn open(lua: &Lua, pipes: &CommandIo, cancel: Option<CancelSignal>) -> mlua::Result<Self> {
        let io: Table = lua.globals().get("io")?;
        let proxies = vec![
            lua.create_userdata(StreamProxy::input("stdin", pipes.stdin.clone(), cancel))?,
            lua.create_userdata(StreamProxy::output("stdout", pipes.stdout.clone()))?,
            lua.create_userdata(StreamProxy::output("stderr", pipes.stderr.clone()))?,
        ];
        let mut prior = Vec::with_capacity(STREAM_FIELDS.len());
        for (field, proxy) in STREAM_FIELDS.iter().zip(&proxies) {
            prior.push(io.raw_get::<Value>(*field)?);
            io.raw_set(*field, proxy.clone())?;
        }
        trace!("stream scope opened");
        Ok(Self {
            io,
            proxies,
            prior,
            closed: false,
        })
    }

    /// Dispose the proxies and put back whatever the fields held before.
    ///
    /// Failures are logged; teardown always runs to the end.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for (field, proxy) in STREAM_FIELDS.iter().zip(&self.proxies) {
            match proxy.borrow_mut::<StreamProxy>() {
                Ok(mut p) => {
                    if let Err(e) = p.dispose() {
                        warn!(stream = field, error = %e, "failed to flush stream proxy");
                    }
                }
                Err(e) => warn!(stream = field, error = %e, "stream proxy unavailable at teardown"),
            }
        }
        for (field, prior) in STREAM_FIELDS.iter().zip(self.prior.drain(..)) {
            if let Err(e) = self.io.raw_set(*field, prior) {
                warn!(stream = field, error = %e, "failed to restore io field");
            }
        }
        trace!("stream scope closed");
    }
}

impl Drop for StreamScope {
    fn drop(&mut self) {
        self.close();
    }
}

/// Proxy for `io.<field>`: the current scope's, or one over process stdio.
fn current_proxy(lua: &Lua, field: &'static str) -> mlua::Result<AnyUserData> {
    let io: Table = lua.globals().get("io")?;
    if let Value::UserData(ud) = io.raw_get::<Value>(field)? {
        if ud.is::<StreamProxy>() {
            return Ok(ud);
        }
    }
    let process = CommandIo::process();
    let proxy = match field {
        "stdin" => StreamProxy::input("stdin", process.stdin, None),
        "stderr" => StreamProxy::output("stderr", process.stderr),
        _ => StreamProxy::output("stdout", process.stdout),
    };
    lua.create_userdata(proxy)
}

/// Write text to the guest's current output stream.
pub(crate) fn write_current(lua: &Lua, field: &'static str, text: &str) -> mlua::Result<()> {
    let proxy = current_proxy(lua, field)?;
    let args: MultiValue = std::iter::once(Value::String(lua.create_string(text)?)).collect();
    proxy.borrow_mut::<StreamProxy>()?.write_values(&args)
}

/// Route the io library and `print` through the current scope.
///
/// The C stdio handles are removed so that, outside any scope, the stream
/// fields are absent.
pub(crate) fn install_io(lua: &Lua) -> mlua::Result<()> {
    let io: Table = lua.globals().get("io")?;
    for field in STREAM_FIELDS {
        io.raw_set(field, Value::Nil)?;
    }

    io.raw_set(
        "write",
        lua.create_function(|lua, args: MultiValue| {
            let proxy = current_proxy(lua, "stdout")?;
            proxy.borrow_mut::<StreamProxy>()?.write_values(&args)?;
            Ok(proxy)
        })?,
    )?;

    io.raw_set(
        "read",
        lua.create_function(|lua, formats: MultiValue| {
            let proxy = current_proxy(lua, "stdin")?;
            let mut proxy = proxy.borrow_mut::<StreamProxy>()?;
            proxy.read_values(lua, formats)
        })?,
    )?;

    let file_lines: Function = io.raw_get("lines")?;
    io.raw_set(
        "lines",
        lua.create_function(move |lua, args: MultiValue| {
            if args.front().is_some_and(|v| !v.is_nil()) {
                return file_lines.call::<MultiValue>(args);
            }
            let formats: MultiValue = args.into_iter().skip(1).collect();
            let proxy = current_proxy(lua, "stdin")?;
            let iter = lines_iterator(lua, proxy, formats)?;
            Ok(std::iter::once(Value::Function(iter)).collect())
        })?,
    )?;

    lua.globals().raw_set("print", default_print(lua)?)?;
    Ok(())
}

fn default_print(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(|lua, args: MultiValue| {
        let tostring: Function = lua.globals().get("tostring")?;
        let mut line = Vec::new();
        for (i, value) in args.into_iter().enumerate() {
            if i > 0 {
                line.push(b'\t');
            }
            let s: mlua::String = tostring.call(value)?;
            line.extend_from_slice(&s.as_bytes());
        }
        line.push(b'\n');
        let proxy = current_proxy(lua, "stdout")?;
        let args: MultiValue = std::iter::once(Value::String(lua.create_string(&line)?)).collect();
        proxy.borrow_mut::<StreamProxy>()?.write_values(&args)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn pipes(input: &str) -> (CommandIo, MemoryPipe, MemoryPipe) {
        let out = MemoryPipe::new();
        let err = MemoryPipe::new();
        let io = CommandIo::new(Cursor::new(input.as_bytes().to_vec()), out.clone(), err.clone());
        (io, out, err)
    }

    fn lua() -> Lua {
        let lua = Lua::new();
        install_io(&lua).unwrap();
        lua
    }

    #[test]
    fn test_memory_pipe_limit() {
        let mut pipe = MemoryPipe::with_limit(10);
        pipe.write_all(b"hello").unwrap();
        pipe.write_all(b" world!").unwrap();

        assert!(pipe.was_truncated());
        assert!(pipe.text().starts_with("hello worl"));
        assert!(pipe.text().contains("[output truncated]"));
    }

    #[test]
    fn test_streams_absent_outside_scope() {
        let lua = lua();
        let absent: bool = lua.load("return io.stdout == nil and io.stdin == nil").eval().unwrap();
        assert!(absent);
    }

    #[test]
    fn test_write_and_print_go_to_scope() {
        let lua = lua();
        let (io, out, err) = pipes("");
        let mut scope = StreamScope::open(&lua, &io, None).unwrap();
        lua.load(r#"io.write("a", 1, 2.0, "\n"); print("x", true, nil); io.stderr:write("oops")"#)
            .exec()
            .unwrap();
        scope.close();

        assert_eq!(out.text(), "a12.0\nx\ttrue\tnil\n");
        assert_eq!(err.text(), "oops");
    }

    #[test]
    fn test_read_formats() {
        let lua = lua();
        let (io, _, _) = pipes("first line\n  42 rest\ntail");
        let _scope = StreamScope::open(&lua, &io, None).unwrap();
        let (line, n, rest, eof): (String, i64, String, Option<String>) = lua
            .load(r#"return io.read("l"), io.read("n"), io.read("a"), io.read("l")"#)
            .eval()
            .unwrap();
        assert_eq!(line, "first line");
        assert_eq!(n, 42);
        assert_eq!(rest, " rest\ntail");
        assert!(eof.is_none());
    }

    #[test]
    fn test_lines_iterator() {
        let lua = lua();
        let (io, out, _) = pipes("a\nb\nc\n");
        let _scope = StreamScope::open(&lua, &io, None).unwrap();
        lua.load(r#"for l in io.lines() do io.write("[", l, "]") end"#)
            .exec()
            .unwrap();
        assert_eq!(out.text(), "[a][b][c]");
    }

    #[test]
    fn test_stale_proxy_fails_after_close() {
        let lua = lua();
        let (io, out, _) = pipes("");
        let mut scope = StreamScope::open(&lua, &io, None).unwrap();
        lua.load("saved = io.stdout").exec().unwrap();
        scope.close();

        let err = lua.load(r#"saved:write("late")"#).exec().unwrap_err();
        assert!(err.to_string().contains("closed file"));
        assert_eq!(out.text(), "");
    }

    #[test]
    fn test_nested_scope_restores_outer() {
        let lua = lua();
        let (outer_io, outer_out, _) = pipes("");
        let (inner_io, inner_out, _) = pipes("");

        let _outer = StreamScope::open(&lua, &outer_io, None).unwrap();
        {
            let _inner = StreamScope::open(&lua, &inner_io, None).unwrap();
            lua.load(r#"io.write("inner")"#).exec().unwrap();
        }
        lua.load(r#"io.write("outer")"#).exec().unwrap();

        assert_eq!(inner_out.text(), "inner");
        assert_eq!(outer_out.text(), "outer");
    }

    #[test]
    fn test_cancelled_read_fails() {
        let lua = lua();
        let (io, _, _) = pipes("data\n");
        let cancel = CancelSignal::new();
        let _scope = StreamScope::open(&lua, &io, Some(cancel.clone())).unwrap();
        cancel.cancel();
        let err = lua.load("return io.read()").exec().unwrap_err();
        assert!(err.to_string().contains("interrupted"));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(2.0), "2.0");
        assert_eq!(format_number(2.5), "2.5");
    }
}
