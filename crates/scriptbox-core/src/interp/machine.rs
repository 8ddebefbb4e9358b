//! `TclInterpreter`: variable frames, procedures, command dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::builtins;
use super::expr::{self, ExprHost};
use super::parser::{self, Part, Script, Word};
use super::{
    Bindings, CancelToken, EvalError, EvalStats, Evaluation, HostCommand, HostContext, HostError,
    Interpreter, InterpreterFactory, InterpreterFault, Value,
};

const PARSE_CACHE_LIMIT: usize = 256;
const DEFAULT_MAX_DEPTH: usize = 1000;
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Non-local control flow through the evaluator.
#[derive(Debug)]
pub(crate) enum Flow {
    Return(Value),
    Break,
    Continue,
    /// Script error; `catch` traps it.
    Error(String),
    /// Ends the evaluation; `catch` does not trap it.
    Abort(EvalError),
}

pub(crate) type Outcome = Result<Value, Flow>;

pub(crate) fn error(message: impl Into<String>) -> Flow {
    Flow::Error(message.into())
}

/// Result of one loop-body evaluation.
pub(crate) enum Step {
    Next,
    Stop,
}

#[derive(Debug)]
pub(crate) struct Proc {
    /// Parameter names with optional defaults; a trailing `args` is variadic.
    pub params: Vec<(String, Option<Value>)>,
    pub body: String,
}

impl Proc {
    fn approx_size(&self) -> usize {
        self.body.len()
            + self
                .params
                .iter()
                .map(|(n, d)| n.len() + d.as_ref().map_or(0, Value::approx_size))
                .sum::<usize>()
    }

    fn usage(&self, name: &str) -> String {
        let mut usage = name.to_string();
        for (i, (param, default)) in self.params.iter().enumerate() {
            usage.push(' ');
            if param == "args" && i + 1 == self.params.len() {
                usage.push_str("?arg ...?");
            } else if default.is_some() {
                usage.push_str(&format!("?{param}?"));
            } else {
                usage.push_str(param);
            }
        }
        usage
    }
}

#[derive(Default)]
struct State {
    globals: HashMap<String, Value>,
    procs: HashMap<String, Arc<Proc>>,
    cache: HashMap<String, Arc<Script>>,
}

/// Built-in Tcl-dialect interpreter.
pub struct TclInterpreter {
    state: State,
    healthy: bool,
    max_depth: usize,
}

impl Default for TclInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl TclInterpreter {
    pub fn new() -> Self {
        Self {
            state: State::default(),
            healthy: true,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Maximum procedure nesting before a script error is raised.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

impl Interpreter for TclInterpreter {
    fn evaluate(&mut self, script: &str, bindings: &Bindings, cancel: &CancelToken) -> Evaluation {
        let started = Instant::now();
        let max_depth = self.max_depth;
        let mut machine = Machine::new(&mut self.state, bindings, cancel, max_depth);
        let outcome = machine.run(script);
        let output = std::mem::take(&mut machine.output);
        let mut stats = std::mem::take(&mut machine.stats);
        drop(machine);

        stats.execution_time_us = started.elapsed().as_micros() as u64;
        if matches!(
            outcome,
            Err(EvalError::Cancelled | EvalError::MemoryLimit { .. })
        ) {
            self.healthy = false;
        }
        Evaluation {
            outcome,
            output,
            stats,
        }
    }

    fn reset(&mut self) -> Result<(), InterpreterFault> {
        if !self.healthy {
            return Err(InterpreterFault(
                "interpreter was interrupted and cannot be reused".to_string(),
            ));
        }
        // Parsed scripts carry no user state; the cache survives.
        self.state.globals.clear();
        self.state.procs.clear();
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}

/// Creates [`TclInterpreter`] instances.
#[derive(Debug, Clone)]
pub struct TclFactory {
    max_depth: usize,
}

impl Default for TclFactory {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl TclFactory {
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

impl InterpreterFactory for TclFactory {
    fn create(&self) -> Result<Box<dyn Interpreter>, InterpreterFault> {
        Ok(Box::new(TclInterpreter::new().with_max_depth(self.max_depth)))
    }
}

#[derive(Default)]
struct Frame {
    locals: HashMap<String, Value>,
    linked: HashSet<String>,
}

impl Frame {
    fn approx_size(&self) -> usize {
        self.locals
            .iter()
            .map(|(k, v)| k.len() + v.approx_size())
            .sum()
    }
}

/// One evaluation in progress.
pub(crate) struct Machine<'a> {
    state: &'a mut State,
    bindings: &'a Bindings,
    cancel: &'a CancelToken,
    frames: Vec<Frame>,
    output: String,
    stats: EvalStats,
    max_depth: usize,
    /// Scripts currently being evaluated, bodies and substitutions included.
    nesting: usize,
    var_bytes: usize,
    proc_bytes: usize,
}

impl<'a> Machine<'a> {
    fn new(
        state: &'a mut State,
        bindings: &'a Bindings,
        cancel: &'a CancelToken,
        max_depth: usize,
    ) -> Self {
        let var_bytes = state
            .globals
            .iter()
            .map(|(k, v)| k.len() + v.approx_size())
            .sum();
        let proc_bytes = state.procs.values().map(|p| p.approx_size()).sum();
        Self {
            state,
            bindings,
            cancel,
            frames: Vec::new(),
            output: String::new(),
            stats: EvalStats::default(),
            max_depth,
            nesting: 0,
            var_bytes,
            proc_bytes,
        }
    }

    fn run(&mut self, script: &str) -> Result<Value, EvalError> {
        let result = self
            .install_variables()
            .and_then(|()| self.eval_text(script));
        match result {
            Ok(value) | Err(Flow::Return(value)) => Ok(value),
            Err(Flow::Break) => Err(EvalError::Script {
                message: "invoked \"break\" outside of a loop".to_string(),
            }),
            Err(Flow::Continue) => Err(EvalError::Script {
                message: "invoked \"continue\" outside of a loop".to_string(),
            }),
            Err(Flow::Error(message)) => Err(EvalError::Script { message }),
            Err(Flow::Abort(err)) => Err(err),
        }
    }

    fn install_variables(&mut self) -> Result<(), Flow> {
        let bindings = self.bindings;
        for (name, value) in &bindings.variables {
            self.set_var(name, value.clone())?;
        }
        Ok(())
    }

    // -- evaluation --------------------------------------------------------

    pub(crate) fn eval_text(&mut self, text: &str) -> Outcome {
        let script = self.parse_cached(text)?;
        self.eval_script(&script)
    }

    fn parse_cached(&mut self, text: &str) -> Result<Arc<Script>, Flow> {
        if let Some(script) = self.state.cache.get(text) {
            return Ok(Arc::clone(script));
        }
        let started = Instant::now();
        let parsed = parser::parse(text).map_err(|e| error(e.to_string()))?;
        self.stats.parse_time_us += started.elapsed().as_micros() as u64;

        if self.state.cache.len() >= PARSE_CACHE_LIMIT {
            self.state.cache.clear();
        }
        let script = Arc::new(parsed);
        self.state
            .cache
            .insert(text.to_string(), Arc::clone(&script));
        Ok(script)
    }

    fn eval_script(&mut self, script: &Script) -> Outcome {
        if self.nesting >= self.max_depth {
            return Err(error("too many nested evaluations (infinite loop?)"));
        }
        self.nesting += 1;
        let result = self.eval_commands(script);
        self.nesting -= 1;
        result
    }

    fn eval_commands(&mut self, script: &Script) -> Outcome {
        let mut result = Value::empty();
        for command in &script.commands {
            let argv = self.substitute_words(&command.words)?;
            if argv.is_empty() {
                continue;
            }
            result = self.invoke(argv)?;
        }
        Ok(result)
    }

    fn substitute_words(&mut self, words: &[Word]) -> Result<Vec<Value>, Flow> {
        let mut argv = Vec::with_capacity(words.len());
        for word in words {
            let value = self.substitute_parts(&word.parts)?;
            if word.expand {
                argv.extend(value.as_list().map_err(error)?);
            } else {
                argv.push(value);
            }
        }
        Ok(argv)
    }

    /// A single part keeps its value's structure; several are concatenated.
    fn substitute_parts(&mut self, parts: &[Part]) -> Outcome {
        match parts {
            [] => Ok(Value::empty()),
            [single] => self.part_value(single),
            many => {
                let mut text = String::new();
                for part in many {
                    text.push_str(&self.part_value(part)?.as_str());
                }
                Ok(Value::Str(text))
            }
        }
    }

    fn part_value(&mut self, part: &Part) -> Outcome {
        match part {
            Part::Text(text) => Ok(Value::Str(text.clone())),
            Part::Var(name) => self.get_var(name),
            Part::Script(script) => self.eval_script(script),
        }
    }

    /// Perform `$var`, `[cmd]` and backslash substitution on `text`.
    pub(crate) fn subst_text(&mut self, text: &str) -> Outcome {
        let parts = parser::parse_template(text).map_err(|e| error(e.to_string()))?;
        self.substitute_parts(&parts)
    }

    pub(crate) fn eval_expr(&mut self, source: &str) -> Outcome {
        expr::eval(source, self)
    }

    pub(crate) fn eval_condition(&mut self, source: &str) -> Result<bool, Flow> {
        self.eval_expr(source)?.as_bool().map_err(error)
    }

    /// Evaluate a loop body, folding `break`/`continue` into a [`Step`].
    pub(crate) fn run_body(&mut self, body: &str) -> Result<Step, Flow> {
        match self.eval_text(body) {
            Ok(_) | Err(Flow::Continue) => Ok(Step::Next),
            Err(Flow::Break) => Ok(Step::Stop),
            Err(other) => Err(other),
        }
    }

    fn invoke(&mut self, argv: Vec<Value>) -> Outcome {
        self.checkpoint()?;
        self.stats.commands_executed += 1;

        let name = argv[0].as_str().into_owned();
        let bindings = self.bindings;
        self.stats.security_checks += 1;
        if let Err(denial) = bindings.guard.check(&name) {
            return Err(Flow::Abort(EvalError::Denied {
                command: denial.command,
                reason: denial.reason,
            }));
        }

        if let Some(proc_) = self.state.procs.get(&name).cloned() {
            return self.call_proc(&name, &proc_, &argv[1..]);
        }
        if let Some(command) = bindings.command(&name) {
            return self.call_host(command.as_ref(), &argv[1..]);
        }
        match builtins::dispatch(self, &name, &argv) {
            Some(result) => result,
            None => Err(error(format!("invalid command name \"{name}\""))),
        }
    }

    fn call_host(&mut self, command: &dyn HostCommand, args: &[Value]) -> Outcome {
        let cx = HostContext {
            cancel: self.cancel,
            working_dir: self.bindings.working_dir.as_deref(),
            memory_limit_bytes: self.bindings.memory_limit_bytes,
        };
        match command.call(args, &cx) {
            Ok(value) => {
                self.ensure_room(value.approx_size())?;
                Ok(value)
            }
            Err(HostError::Script(message)) => Err(Flow::Error(message)),
            Err(HostError::Denied { command, reason }) => {
                Err(Flow::Abort(EvalError::Denied { command, reason }))
            }
            Err(HostError::Cancelled) => Err(Flow::Abort(EvalError::Cancelled)),
        }
    }

    fn call_proc(&mut self, name: &str, proc_: &Proc, args: &[Value]) -> Outcome {
        if self.frames.len() >= self.max_depth {
            return Err(error("too many nested evaluations (infinite loop?)"));
        }
        let wrong_args = || error(format!("wrong # args: should be \"{}\"", proc_.usage(name)));

        let mut frame = Frame::default();
        let mut rest = args;
        let last = proc_.params.len().saturating_sub(1);
        for (i, (param, default)) in proc_.params.iter().enumerate() {
            if param == "args" && i == last {
                frame
                    .locals
                    .insert(param.clone(), Value::List(rest.to_vec()));
                rest = &[];
                break;
            }
            match (rest.split_first(), default) {
                (Some((first, tail)), _) => {
                    frame.locals.insert(param.clone(), first.clone());
                    rest = tail;
                }
                (None, Some(value)) => {
                    frame.locals.insert(param.clone(), value.clone());
                }
                (None, None) => return Err(wrong_args()),
            }
        }
        if !rest.is_empty() {
            return Err(wrong_args());
        }

        self.var_bytes += frame.approx_size();
        self.stats.variables_created += frame.locals.len() as u64;
        self.frames.push(frame);
        let result = self
            .check_memory()
            .and_then(|()| self.eval_text(&proc_.body));
        if let Some(frame) = self.frames.pop() {
            self.var_bytes = self.var_bytes.saturating_sub(frame.approx_size());
        }

        match result {
            Ok(value) | Err(Flow::Return(value)) => Ok(value),
            Err(Flow::Break) => Err(error("invoked \"break\" outside of a loop")),
            Err(Flow::Continue) => Err(error("invoked \"continue\" outside of a loop")),
            Err(other) => Err(other),
        }
    }

    // -- limits ------------------------------------------------------------

    pub(crate) fn checkpoint(&self) -> Result<(), Flow> {
        if self.cancel.is_cancelled() {
            Err(Flow::Abort(EvalError::Cancelled))
        } else {
            Ok(())
        }
    }

    fn used_bytes(&self) -> u64 {
        (self.var_bytes + self.proc_bytes + self.output.len()) as u64
    }

    fn check_memory(&mut self) -> Result<(), Flow> {
        self.ensure_room(0)
    }

    /// Fail if holding `extra` more bytes would exceed the memory limit.
    pub(crate) fn ensure_room(&mut self, extra: usize) -> Result<(), Flow> {
        let used = self.used_bytes().saturating_add(extra as u64);
        self.stats.peak_memory_bytes = self.stats.peak_memory_bytes.max(used);
        let limit = self.bindings.memory_limit_bytes;
        if limit > 0 && used > limit {
            return Err(Flow::Abort(EvalError::MemoryLimit { used, limit }));
        }
        Ok(())
    }

    /// Block for `duration`, waking every few milliseconds to observe
    /// cancellation.
    pub(crate) fn sleep(&self, duration: Duration) -> Result<(), Flow> {
        let deadline = Instant::now() + duration;
        loop {
            self.checkpoint()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    pub(crate) fn emit(&mut self, text: &str) -> Result<(), Flow> {
        self.output.push_str(text);
        self.stats.output_bytes += text.len() as u64;
        self.check_memory()
    }

    // -- variables ---------------------------------------------------------

    fn scope(&self, name: &str) -> (&HashMap<String, Value>, String) {
        if let Some(global) = name.strip_prefix("::") {
            return (&self.state.globals, global.to_string());
        }
        match self.frames.last() {
            Some(frame) if !frame.linked.contains(name) => (&frame.locals, name.to_string()),
            _ => (&self.state.globals, name.to_string()),
        }
    }

    fn scope_mut(&mut self, name: &str) -> (&mut HashMap<String, Value>, String) {
        if let Some(global) = name.strip_prefix("::") {
            return (&mut self.state.globals, global.to_string());
        }
        match self.frames.last_mut() {
            Some(frame) if !frame.linked.contains(name) => {
                (&mut frame.locals, name.to_string())
            }
            _ => (&mut self.state.globals, name.to_string()),
        }
    }

    pub(crate) fn get_var(&self, name: &str) -> Outcome {
        let (scope, key) = self.scope(name);
        scope
            .get(&key)
            .cloned()
            .ok_or_else(|| error(format!("can't read \"{name}\": no such variable")))
    }

    pub(crate) fn var_exists(&self, name: &str) -> bool {
        let (scope, key) = self.scope(name);
        scope.contains_key(&key)
    }

    pub(crate) fn set_var(&mut self, name: &str, value: Value) -> Outcome {
        let added = value.approx_size();
        let (scope, key) = self.scope_mut(name);
        let key_len = key.len();
        let previous = scope.insert(key, value.clone());

        let removed = match &previous {
            Some(old) => old.approx_size(),
            None => {
                self.stats.variables_created += 1;
                0
            }
        };
        let key_bytes = if previous.is_some() { 0 } else { key_len };
        self.var_bytes = (self.var_bytes + added + key_bytes).saturating_sub(removed);
        self.check_memory()?;
        Ok(value)
    }

    pub(crate) fn unset_var(&mut self, name: &str) -> bool {
        let (scope, key) = self.scope_mut(name);
        let key_len = key.len();
        match scope.remove(&key) {
            Some(old) => {
                self.var_bytes = self
                    .var_bytes
                    .saturating_sub(old.approx_size() + key_len);
                true
            }
            None => false,
        }
    }

    /// Make `name` refer to the global variable inside the current procedure.
    pub(crate) fn link_global(&mut self, name: &str) {
        if let Some(frame) = self.frames.last_mut() {
            if let Some(old) = frame.locals.remove(name) {
                self.var_bytes = self
                    .var_bytes
                    .saturating_sub(old.approx_size() + name.len());
            }
            frame.linked.insert(name.to_string());
        }
    }

    pub(crate) fn visible_vars(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.frames.last() {
            Some(frame) => frame
                .locals
                .keys()
                .chain(frame.linked.iter().filter(|n| self.state.globals.contains_key(*n)))
                .cloned()
                .collect(),
            None => self.state.globals.keys().cloned().collect(),
        };
        names.sort();
        names
    }

    pub(crate) fn global_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.globals.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    // -- procedures and host surface ---------------------------------------

    pub(crate) fn define_proc(&mut self, name: String, proc_: Proc) -> Result<(), Flow> {
        let size = proc_.approx_size();
        if let Some(old) = self.state.procs.insert(name, Arc::new(proc_)) {
            self.proc_bytes = self.proc_bytes.saturating_sub(old.approx_size());
        }
        self.proc_bytes += size;
        self.stats.procedures_created += 1;
        self.check_memory()
    }

    pub(crate) fn proc_named(&self, name: &str) -> Option<Arc<Proc>> {
        self.state.procs.get(name).cloned()
    }

    pub(crate) fn proc_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.procs.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn host_command_names(&self) -> Vec<String> {
        self.bindings.command_names().map(str::to_string).collect()
    }

    pub(crate) fn package_version(&self, name: &str) -> Option<&str> {
        self.bindings.packages.get(name).map(String::as_str)
    }

    pub(crate) fn package_names(&self) -> Vec<String> {
        self.bindings.packages.keys().cloned().collect()
    }
}

impl ExprHost for Machine<'_> {
    type Error = Flow;

    fn var(&mut self, name: &str) -> Outcome {
        self.get_var(name)
    }

    fn command(&mut self, script: &str) -> Outcome {
        self.eval_text(script)
    }

    fn substitute(&mut self, text: &str) -> Outcome {
        self.subst_text(text)
    }

    fn fail(&self, message: String) -> Flow {
        Flow::Error(message)
    }
}
