//! Host bindings installed into an evaluation.
//!
//! Only commands the policy permits are installed. A forbidden binding is
//! never present in [`Bindings`], so a script that names it reaches the
//! policy guard (or fails as an unknown command), never the host.
//!
//! | command        | installed when                          |
//! |----------------|-----------------------------------------|
//! | `session`      | the request names a session             |
//! | `mcp::session` | alias of `session`                      |
//! | `env`          | the policy allows environment access    |
//! | `file`         | the policy allows filesystem access     |
//! | `pwd`          | the policy allows filesystem access     |
//! | `exec`         | the policy allows process spawn         |

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use scriptbox_state::{SessionId, SessionOp, SessionRecord};

use crate::context::ExecutionContext;
use crate::interp::builtins::glob_match;
use crate::interp::{Bindings, HostCommand, HostContext, HostError, Value};
use crate::policy::{normalize_lexically, Capability, SecurityPolicy};

const EXEC_POLL: Duration = Duration::from_millis(10);

/// Install every host command the context's policy permits.
///
/// Returns the installed command names.
pub fn install_host_commands(
    ctx: &ExecutionContext,
    bindings: &mut Bindings,
    session: Option<Arc<SessionBinding>>,
) -> Vec<&'static str> {
    let policy = ctx.policy();
    let mut installed = Vec::new();

    if let Some(session) = session {
        bindings.install("session", Arc::clone(&session) as Arc<dyn HostCommand>);
        bindings.install("mcp::session", session);
        installed.extend(["session", "mcp::session"]);
    }
    if policy.allows(Capability::Environment) {
        bindings.install(
            "env",
            Arc::new(EnvCommand {
                vars: ctx.environment().clone(),
            }),
        );
        installed.push("env");
    }
    if policy.allows(Capability::Filesystem) {
        bindings.install(
            "file",
            Arc::new(FileCommand {
                policy: Arc::clone(policy),
            }),
        );
        bindings.install("pwd", Arc::new(PwdCommand));
        installed.extend(["file", "pwd"]);
    }
    if policy.allows(Capability::Process) {
        bindings.install(
            "exec",
            Arc::new(ExecCommand {
                env: ctx.environment().clone(),
            }),
        );
        installed.push("exec");
    }
    installed
}

fn wrong_args(usage: &str) -> HostError {
    HostError::script(format!("wrong # args: should be \"{usage}\""))
}

fn text(value: &Value) -> String {
    value.as_str().into_owned()
}

// -- session ------------------------------------------------------------------

#[derive(Debug, Default)]
struct Overlay {
    values: BTreeMap<String, serde_json::Value>,
    ops: Vec<SessionOp>,
}

/// The `session` command: a snapshot of the stored session plus the writes
/// this execution has staged.
///
/// Writes become durable only when the pipeline commits
/// [`staged_ops`](Self::staged_ops) after the run.
#[derive(Debug)]
pub struct SessionBinding {
    session_id: SessionId,
    overlay: Mutex<Overlay>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl SessionBinding {
    pub fn new(session_id: SessionId, record: Option<SessionRecord>) -> Self {
        Self {
            session_id,
            overlay: Mutex::new(Overlay {
                values: record.map(|r| r.values).unwrap_or_default(),
                ops: Vec::new(),
            }),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Writes made by the script, in program order.
    pub fn staged_ops(&self) -> Vec<SessionOp> {
        self.overlay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ops
            .clone()
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn read(&self) -> std::sync::MutexGuard<'_, Overlay> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.overlay.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::MutexGuard<'_, Overlay> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.overlay.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HostCommand for SessionBinding {
    fn call(&self, args: &[Value], _cx: &HostContext<'_>) -> Result<Value, HostError> {
        let Some(sub) = args.first() else {
            return Err(wrong_args("session subcommand ?arg ...?"));
        };
        match (sub.as_str().as_ref(), &args[1..]) {
            ("get", [key]) => self
                .read()
                .values
                .get(key.as_str().as_ref())
                .map(Value::from_json)
                .ok_or_else(|| {
                    HostError::script(format!(
                        "no value for key \"{key}\" in session \"{}\"",
                        self.session_id
                    ))
                }),
            ("get", [key, default]) => Ok(self
                .read()
                .values
                .get(key.as_str().as_ref())
                .map_or_else(|| default.clone(), Value::from_json)),
            ("get", _) => Err(wrong_args("session get key ?default?")),
            ("set", [key, value]) => {
                let key = text(key);
                let json = value.to_json();
                let mut overlay = self.write();
                overlay.values.insert(key.clone(), json.clone());
                overlay.ops.push(SessionOp::Set { key, value: json });
                Ok(value.clone())
            }
            ("set", _) => Err(wrong_args("session set key value")),
            ("exists", [key]) => Ok(Value::from(
                self.read().values.contains_key(key.as_str().as_ref()),
            )),
            ("exists", _) => Err(wrong_args("session exists key")),
            ("unset", [key]) => {
                let key = text(key);
                let mut overlay = self.write();
                let existed = overlay.values.remove(&key).is_some();
                if existed {
                    overlay.ops.push(SessionOp::Remove { key });
                }
                Ok(Value::from(existed))
            }
            ("unset", _) => Err(wrong_args("session unset key")),
            ("list", rest) if rest.len() <= 1 => {
                let overlay = self.read();
                let pattern = rest.first().map(text);
                Ok(Value::List(
                    overlay
                        .values
                        .keys()
                        .filter(|k| {
                            pattern
                                .as_deref()
                                .map_or(true, |p| glob_match(p, k, false))
                        })
                        .map(|k| Value::from(k.as_str()))
                        .collect(),
                ))
            }
            ("list", _) => Err(wrong_args("session list ?pattern?")),
            ("clear", []) => {
                let mut overlay = self.write();
                overlay.values.clear();
                overlay.ops.push(SessionOp::Clear);
                Ok(Value::empty())
            }
            ("clear", _) => Err(wrong_args("session clear")),
            (other, _) => Err(HostError::script(format!(
                "unknown or ambiguous subcommand \"{other}\": must be clear, exists, get, list, set, or unset"
            ))),
        }
    }
}

// -- env ----------------------------------------------------------------------

/// Read-only view of the environment injected by the request.
struct EnvCommand {
    vars: BTreeMap<String, String>,
}

impl HostCommand for EnvCommand {
    fn call(&self, args: &[Value], _cx: &HostContext<'_>) -> Result<Value, HostError> {
        let Some(sub) = args.first() else {
            return Err(wrong_args("env subcommand ?arg ...?"));
        };
        match (sub.as_str().as_ref(), &args[1..]) {
            ("get", [name]) => self
                .vars
                .get(name.as_str().as_ref())
                .map(|v| Value::from(v.as_str()))
                .ok_or_else(|| HostError::script(format!("no such variable \"{name}\""))),
            ("get", [name, default]) => Ok(self
                .vars
                .get(name.as_str().as_ref())
                .map_or_else(|| default.clone(), |v| Value::from(v.as_str()))),
            ("get", _) => Err(wrong_args("env get name ?default?")),
            ("names", []) => Ok(Value::List(
                self.vars.keys().map(|k| Value::from(k.as_str())).collect(),
            )),
            ("exists", [name]) => Ok(Value::from(self.vars.contains_key(name.as_str().as_ref()))),
            (other, _) => Err(HostError::script(format!(
                "unknown or ambiguous subcommand \"{other}\": must be exists, get, or names"
            ))),
        }
    }
}

// -- filesystem ---------------------------------------------------------------

/// Resolve `raw` against the working directory and check it against the
/// policy's allowed prefixes.
fn checked_path(
    policy: &SecurityPolicy,
    raw: &Value,
    cx: &HostContext<'_>,
) -> Result<PathBuf, HostError> {
    let raw = PathBuf::from(text(raw));
    let absolute = if raw.is_absolute() {
        raw
    } else {
        match cx.working_dir {
            Some(dir) => dir.join(raw),
            None => {
                return Err(HostError::script(format!(
                    "relative path \"{}\" needs a working directory",
                    raw.display()
                )))
            }
        }
    };
    let path = normalize_lexically(&absolute);
    if !policy.permits_path(&path) {
        return Err(HostError::Denied {
            command: "file".to_string(),
            reason: format!(
                "path {} is outside the paths allowed by the {} policy",
                path.display(),
                policy.name
            ),
        });
    }
    Ok(path)
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> HostError {
    HostError::script(format!("couldn't {action} \"{}\": {err}", path.display()))
}

struct FileCommand {
    policy: Arc<SecurityPolicy>,
}

impl HostCommand for FileCommand {
    fn call(&self, args: &[Value], cx: &HostContext<'_>) -> Result<Value, HostError> {
        let Some(sub) = args.first() else {
            return Err(wrong_args("file subcommand ?arg ...?"));
        };
        match (sub.as_str().as_ref(), &args[1..]) {
            ("read", [path]) => {
                let path = checked_path(&self.policy, path, cx)?;
                let len = std::fs::metadata(&path)
                    .map_err(|e| io_error("read", &path, e))?
                    .len();
                if cx.memory_limit_bytes > 0 && len > cx.memory_limit_bytes {
                    return Err(HostError::script(format!(
                        "file \"{}\" is {len} bytes, larger than the memory limit",
                        path.display()
                    )));
                }
                std::fs::read_to_string(&path)
                    .map(Value::from)
                    .map_err(|e| io_error("read", &path, e))
            }
            ("write", [path, content]) => {
                let path = checked_path(&self.policy, path, cx)?;
                let content = text(content);
                std::fs::write(&path, content.as_bytes())
                    .map_err(|e| io_error("write", &path, e))?;
                Ok(Value::Int(content.len() as i64))
            }
            ("exists", [path]) => {
                let path = checked_path(&self.policy, path, cx)?;
                Ok(Value::from(path.exists()))
            }
            ("delete", [path]) => {
                let path = checked_path(&self.policy, path, cx)?;
                match std::fs::remove_file(&path) {
                    Ok(()) => Ok(Value::from(true)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::from(false)),
                    Err(e) => Err(io_error("delete", &path, e)),
                }
            }
            ("list", [dir]) => {
                let dir = checked_path(&self.policy, dir, cx)?;
                let mut names = Vec::new();
                for entry in std::fs::read_dir(&dir).map_err(|e| io_error("list", &dir, e))? {
                    let entry = entry.map_err(|e| io_error("list", &dir, e))?;
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                Ok(Value::List(names.into_iter().map(Value::Str).collect()))
            }
            ("read" | "exists" | "delete" | "list", _) => Err(wrong_args(&format!("file {sub} path"))),
            ("write", _) => Err(wrong_args("file write path content")),
            (other, _) => Err(HostError::script(format!(
                "unknown or ambiguous subcommand \"{other}\": must be delete, exists, list, read, or write"
            ))),
        }
    }
}

struct PwdCommand;

impl HostCommand for PwdCommand {
    fn call(&self, args: &[Value], cx: &HostContext<'_>) -> Result<Value, HostError> {
        if !args.is_empty() {
            return Err(wrong_args("pwd"));
        }
        cx.working_dir
            .map(|dir| Value::from(dir.display().to_string()))
            .ok_or_else(|| HostError::script("no working directory"))
    }
}

// -- process ------------------------------------------------------------------

/// Runs a program with only the injected environment. Polls for exit so a
/// cancelled evaluation kills the child.
struct ExecCommand {
    env: BTreeMap<String, String>,
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf);
        }
        buf
    })
}

impl HostCommand for ExecCommand {
    fn call(&self, args: &[Value], cx: &HostContext<'_>) -> Result<Value, HostError> {
        let Some((program, rest)) = args.split_first() else {
            return Err(wrong_args("exec program ?arg ...?"));
        };
        let program = text(program);
        let mut command = Command::new(&program);
        command
            .args(rest.iter().map(text))
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cx.working_dir {
            command.current_dir(dir);
        }
        let mut child = command
            .spawn()
            .map_err(|e| HostError::script(format!("couldn't execute \"{program}\": {e}")))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if cx.cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(HostError::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => std::thread::sleep(EXEC_POLL),
                Err(e) => return Err(HostError::script(format!("exec failed: {e}"))),
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        let mut out = String::from_utf8_lossy(&stdout).into_owned();
        if out.ends_with('\n') {
            out.pop();
        }
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(HostError::script(format!(
                "child process exited abnormally ({status}): {}",
                stderr.trim_end()
            )));
        }
        Ok(Value::Str(out))
    }
}
