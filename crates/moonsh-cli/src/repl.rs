//! The command loop.
//!
//! Each command line goes through the line filter hook, alias expansion
//! and the argument hook, then runs as a builtin or a child process. A
//! command that cannot be found is offered to the unresolved-command hook
//! before it is reported.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::Context as _;
use moonsh::{
    BasicShell, Bridge, BridgeConfig, BridgeError, CallParam, CancelSignal, Capabilities,
    CollectionKind, CommandIo, EventDispatcher, ExecutionContext, HostFunction, HostValue,
    MemoryPipe, ScalarProperties, Session, ShellSession,
};
use tracing::{debug, info, warn};

use crate::collab::{Aliases, Environment, Events, History, Keymap, Options, split_words};

const DEFAULT_PROMPT: &str = "$P$G";

/// Most output `eval` keeps from one program.
const EVAL_LIMIT: usize = 1 << 20;

/// Cancellation for whatever command is running now.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    current: Arc<Mutex<CancelSignal>>,
}

impl Interrupt {
    /// A fresh signal for the next command.
    fn begin(&self) -> CancelSignal {
        let signal = CancelSignal::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = signal.clone();
        signal
    }

    /// Cancel the running command, if any.
    pub fn fire(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

/// What to run after startup.
#[derive(Debug)]
pub enum Mode {
    Interactive,
    Command(String),
    Script { path: PathBuf, args: Vec<String> },
}

enum Flow {
    Continue(i32),
    Exit(i32),
}

/// An interactive shell with a script session attached.
pub struct Shell {
    terminal: Arc<dyn ShellSession>,
    session: Session,
    events: Arc<Events>,
    env: Arc<Environment>,
    aliases: Arc<Aliases>,
    options: Arc<Options>,
    history: Arc<History>,
    echo: Arc<AtomicBool>,
    interrupt: Interrupt,
    _bridge: Bridge,
}

impl Shell {
    pub fn new(config: BridgeConfig, interrupt: Interrupt) -> anyhow::Result<Self> {
        Self::with_io(config, interrupt, CommandIo::process())
    }

    /// A shell reading commands from, and writing to, the given pipes.
    pub fn with_io(config: BridgeConfig, interrupt: Interrupt, io: CommandIo) -> anyhow::Result<Self> {
        let events = Arc::new(Events::default());
        let env = Arc::new(Environment::from_process());
        let aliases = Arc::new(Aliases::default());
        let options = Arc::new(Options::default());
        let history = Arc::new(History::default());
        let echo = Arc::new(AtomicBool::new(false));
        let title = Arc::new(RwLock::new(String::from("moonsh")));

        let capabilities = Capabilities::new()
            .function("exec", exec_function(env.clone()))
            .function("eval", eval_function(env.clone()))
            .function("getcwd", HostFunction::plain(|_| getcwd()))
            .function("chdir", HostFunction::plain(chdir))
            .scalars(
                ScalarProperties::new()
                    .flag("echo", echo.clone())
                    .text("title", title),
            )
            .collection(CollectionKind::Env, env.clone())
            .collection(CollectionKind::Alias, aliases.clone())
            .collection(CollectionKind::Option, options.clone())
            .collection(CollectionKind::History, history.clone())
            .keys(Arc::new(Keymap::default()));

        let bridge = Bridge::new(config)?.with_events(events.clone());
        let terminal: Arc<dyn ShellSession> = Arc::new(BasicShell::with_io(io));
        let session = bridge.new_session(&terminal, capabilities)?;

        Ok(Self {
            terminal,
            session,
            events,
            env,
            aliases,
            options,
            history,
            echo,
            interrupt,
            _bridge: bridge,
        })
    }

    fn context(&self) -> ExecutionContext {
        ExecutionContext::with_cancel(self.interrupt.begin())
    }

    fn dispatcher(&self) -> EventDispatcher {
        self.events.dispatcher().cloned().unwrap_or_default()
    }

    fn say(&self, text: &str) {
        let stdout = self.terminal.stdout();
        let mut stdout = stdout.lock().unwrap_or_else(PoisonError::into_inner);
        // A closed terminal is not worth failing the command over.
        let _ = stdout.write_all(text.as_bytes()).and_then(|()| stdout.flush());
    }

    pub fn run(&self, mode: Mode) -> anyhow::Result<ExitCode> {
        match self.session.load_startup_scripts(&self.context()) {
            Ok(report) => info!(
                loaded = report.loaded.len(),
                failed = report.failed.len(),
                "startup scripts"
            ),
            Err(e) => self.session.report(&format!("moonsh: startup: {e}")),
        }

        let status = match mode {
            Mode::Command(line) => match self.execute(&line) {
                Flow::Continue(code) | Flow::Exit(code) => code,
            },
            Mode::Script { path, args } => self.run_script(&path, &args),
            Mode::Interactive => self.interactive()?,
        };
        self.session.close();
        Ok(ExitCode::from(u8::try_from(status & 0xff).unwrap_or(1)))
    }

    /// Commands and scripts share one reader, so a script reading input
    /// takes lines the prompt would otherwise have seen, and no more.
    fn interactive(&self) -> anyhow::Result<i32> {
        let stdin = self.terminal.stdin();
        let mut status = 0;
        loop {
            self.show_prompt();
            let mut line = String::new();
            let read = stdin
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .read_line(&mut line)
                .context("reading input")?;
            if read == 0 {
                self.say("\n");
                return Ok(status);
            }
            match self.execute(line.trim_end_matches(['\r', '\n'])) {
                Flow::Continue(code) => status = code,
                Flow::Exit(code) => return Ok(code),
            }
        }
    }

    fn show_prompt(&self) {
        let prompt = match self.session.render_prompt(&self.context(), DEFAULT_PROMPT) {
            Ok(Some(prompt)) => prompt,
            Ok(None) => default_prompt(),
            Err(e) => {
                self.session.report(&format!("prompt: {e}"));
                default_prompt()
            }
        };
        self.say(&prompt);
    }

    fn run_script(&self, path: &Path, args: &[String]) -> i32 {
        let ctx = self.context();
        let name = path.display().to_string();
        let result = self
            .session
            .set_args(&name, args)
            .and_then(|()| self.session.run_file(&ctx, path));
        match result {
            Ok(_) => 0,
            Err(e) => {
                self.session.report(&format!("moonsh: {e}"));
                1
            }
        }
    }

    fn execute(&self, line: &str) -> Flow {
        let ctx = self.context();
        let line = match self.session.filter_line(&ctx, line) {
            Ok(Some(filtered)) => filtered,
            Ok(None) => line.to_string(),
            Err(e) => {
                self.session.report(&format!("filter: {e}"));
                line.to_string()
            }
        };
        let line = line.trim();
        if line.is_empty() {
            return Flow::Continue(0);
        }
        self.history.push(line);

        let words = self.aliases.expand(split_words(line));
        let words = self.dispatcher().on_args(self.terminal.as_ref(), &ctx, words);
        let Some(name) = words.first() else {
            return Flow::Continue(0);
        };
        if self.echo.load(Ordering::Relaxed) || self.options.is_set("echo_commands") {
            self.say(&format!("+ {}\n", words.join(" ")));
        }
        debug!(command = %name, "executing");

        match name.as_str() {
            "exit" => Flow::Exit(words.get(1).and_then(|c| c.parse().ok()).unwrap_or(0)),
            "cd" => Flow::Continue(self.change_dir(words.get(1).map(String::as_str))),
            "history" => {
                for (i, entry) in self.history.lines().iter().enumerate() {
                    self.say(&format!("{:5}  {entry}\n", i + 1));
                }
                Flow::Continue(0)
            }
            "lua" => {
                let source = line.split_once(char::is_whitespace).map_or("", |(_, rest)| rest);
                Flow::Continue(self.report_result(self.session.run_string(&ctx, source)))
            }
            "source" => match words.get(1) {
                Some(path) => Flow::Continue(self.run_script(Path::new(path), &words[2..])),
                None => {
                    self.session.report("source: missing script name");
                    Flow::Continue(1)
                }
            },
            "key" => match words.get(1) {
                Some(key) => {
                    let rest = words[2..].join(" ");
                    match self.session.run_key(&ctx, key, &rest) {
                        Ok(Some(_)) => Flow::Continue(0),
                        Ok(None) => {
                            self.session.report(&format!("key: {key} is not bound to a script"));
                            Flow::Continue(1)
                        }
                        Err(e) => Flow::Continue(self.report_result(Err(e))),
                    }
                }
                None => {
                    self.session.report("key: missing key name");
                    Flow::Continue(1)
                }
            },
            _ => Flow::Continue(self.spawn(&ctx, &words)),
        }
    }

    fn report_result(&self, result: Result<Vec<HostValue>, BridgeError>) -> i32 {
        match result {
            Ok(_) => 0,
            Err(BridgeError::Cancelled) => {
                self.session.report("^C");
                130
            }
            Err(e) => {
                self.session.report(&e.to_string());
                1
            }
        }
    }

    fn change_dir(&self, target: Option<&str>) -> i32 {
        let target = match target {
            Some(dir) => PathBuf::from(dir),
            None => match self.env.get("HOME") {
                Some(home) => PathBuf::from(home),
                None => return 0,
            },
        };
        match std::env::set_current_dir(&target) {
            Ok(()) => 0,
            Err(e) => {
                self.session.report(&format!("cd: {}: {e}", target.display()));
                1
            }
        }
    }

    fn spawn(&self, ctx: &ExecutionContext, words: &[String]) -> i32 {
        let status = Command::new(&words[0])
            .args(&words[1..])
            .env_clear()
            .envs(self.env.vars())
            .status();
        match status {
            Ok(status) => status.code().unwrap_or(130),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self
                    .dispatcher()
                    .on_command_not_found(self.terminal.as_ref(), ctx, words)
                {
                    0
                } else {
                    self.session.report(&format!("moonsh: {}: command not found", words[0]));
                    127
                }
            }
            Err(e) => {
                self.session.report(&format!("moonsh: {}: {e}", words[0]));
                126
            }
        }
    }
}

fn default_prompt() -> String {
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    format!("{cwd}> ")
}

fn getcwd() -> Vec<HostValue> {
    match std::env::current_dir() {
        Ok(dir) => vec![HostValue::from(dir.display().to_string())],
        Err(e) => vec![HostValue::Nil, HostValue::error(e)],
    }
}

fn chdir(args: Vec<HostValue>) -> Vec<HostValue> {
    let Some(dir) = args.first().and_then(HostValue::as_str) else {
        return vec![HostValue::Nil, HostValue::error("chdir: expected a directory name")];
    };
    match std::env::set_current_dir(dir) {
        Ok(()) => vec![HostValue::Bool(true)],
        Err(e) => vec![HostValue::Nil, HostValue::error(format!("{dir}: {e}"))],
    }
}

/// Program and arguments from either one command line or separate words.
fn command_words(name: &str, args: &[HostValue]) -> Result<Vec<String>, HostValue> {
    let words: Vec<String> = args
        .iter()
        .map(|a| String::try_from(a.clone()))
        .collect::<Result<_, _>>()
        .map_err(HostValue::error)?;
    let words = match words.as_slice() {
        [line] => split_words(line),
        _ => words,
    };
    if words.is_empty() {
        return Err(HostValue::error(format!("{name}: missing command")));
    }
    Ok(words)
}

/// `exec(command, ...)` runs a program and copies its output to the
/// invocation's pipes. Returns the exit code, or nil and a message.
fn exec_function(env: Arc<Environment>) -> HostFunction {
    HostFunction::with_call(move |param: &mut CallParam| {
        let words = match command_words("exec", &param.args) {
            Ok(words) => words,
            Err(e) => return vec![HostValue::Nil, e],
        };
        let (program, args) = (&words[0], &words[1..]);
        if param.is_cancelled() {
            return vec![HostValue::Nil, HostValue::error("interrupted")];
        }

        let output = match Command::new(program)
            .args(args)
            .env_clear()
            .envs(env.vars())
            .output()
        {
            Ok(output) => output,
            Err(e) => return vec![HostValue::Nil, HostValue::error(format!("{program}: {e}"))],
        };
        let copied = param
            .stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_all(&output.stdout)
            .and_then(|()| {
                param
                    .stderr
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .write_all(&output.stderr)
            });
        if let Err(e) = copied {
            return vec![HostValue::Nil, HostValue::error(e)];
        }
        vec![HostValue::from(output.status.code().unwrap_or(-1))]
    })
}

/// `eval(command, ...)` runs a program and returns what it printed, less
/// the trailing line break. Error output goes to the terminal.
fn eval_function(env: Arc<Environment>) -> HostFunction {
    HostFunction::with_call(move |param: &mut CallParam| {
        let words = match command_words("eval", &param.args) {
            Ok(words) => words,
            Err(e) => return vec![HostValue::Nil, e],
        };
        let (program, args) = (&words[0], &words[1..]);
        if param.is_cancelled() {
            return vec![HostValue::Nil, HostValue::error("interrupted")];
        }

        let mut child = match Command::new(program)
            .args(args)
            .env_clear()
            .envs(env.vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return vec![HostValue::Nil, HostValue::error(format!("{program}: {e}"))],
        };
        let mut captured = MemoryPipe::with_limit(EVAL_LIMIT);
        let copied = match child.stdout.take() {
            Some(mut out) => io::copy(&mut out, &mut captured).map(drop),
            None => Ok(()),
        };
        let waited = child.wait();
        if let Err(e) = copied.and(waited.map(drop)) {
            return vec![HostValue::Nil, HostValue::error(format!("{program}: {e}"))];
        }
        if captured.was_truncated() {
            warn!(command = %program, limit = EVAL_LIMIT, "eval output truncated");
        }
        let text = captured.text();
        vec![HostValue::from(text.trim_end_matches(['\r', '\n']))]
    })
}
