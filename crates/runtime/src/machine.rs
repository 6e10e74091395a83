//! The call-stack machine (component C5): drives a stack of `Context`s one
//! `Line` at a time, resolving calls, intrinsics, and errors.

use std::rc::Rc;

use miniscript_core::value::{MsMap, VarScope};
use miniscript_core::{Error, FunctionValue, Line, Location, Opcode, Result, TypePrototypes, Value};

use crate::context::Context;
use crate::evaluator::{self, StepOutcome};
use crate::intrinsics::{IntrinsicRegistry, TypeKind};
use crate::limits::MachineLimits;

/// Where a running script's `print` output goes. The default writes to
/// stdout; a host embedding the runtime (e.g. the `repl` binary's test
/// harness) installs its own sink to capture output instead.
pub trait HostIo {
    fn print(&mut self, text: &str);
}

pub struct StdoutIo;

impl HostIo for StdoutIo {
    fn print(&mut self, text: &str) {
        println!("{text}");
    }
}

/// The top-level driver: a call stack, the lazily-materialized type
/// prototypes, the intrinsic registry, and host-tunable limits.
pub struct Machine {
    pub(crate) stack: Vec<Context>,
    pub protos: TypePrototypes,
    pub limits: MachineLimits,
    pub intrinsics: IntrinsicRegistry,
    pub io: Box<dyn HostIo>,
    intrinsic_cache: std::collections::HashMap<String, Value>,
    /// §3 "a run-time clock": the monotonic origin `time`/`wait` measure
    /// against, so a script's wall-clock deadlines survive however many
    /// `step()` calls the host spreads them across.
    start: std::time::Instant,
    /// Set by the `yield` intrinsic; a host loop stepping the Machine is
    /// expected to observe and clear this between ticks (§5 "Suspension
    /// points").
    pub yielded: bool,
    /// The cached map the `version` intrinsic hands back, built once on
    /// first access (§3 "a cached version map").
    version_cache: Option<miniscript_core::value::MapRef>,
}

impl Machine {
    pub fn new(limits: MachineLimits) -> Self {
        let global = Context::new(Rc::new(std::cell::RefCell::new(Vec::new())), "<global>");
        Machine {
            stack: vec![global],
            protos: TypePrototypes::default(),
            limits,
            intrinsics: IntrinsicRegistry::standard(),
            io: Box::new(StdoutIo),
            intrinsic_cache: std::collections::HashMap::new(),
            start: std::time::Instant::now(),
            yielded: false,
            version_cache: None,
        }
    }

    pub fn set_io(&mut self, io: Box<dyn HostIo>) {
        self.io = io;
    }

    /// Seconds elapsed since this Machine was created, backing the `time`
    /// intrinsic and `wait`'s deadline arithmetic.
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Append `code` to the global context and run it, as the REPL does for
    /// each accepted line of input. Resets `pc` to just past the previously
    /// loaded code so statements run exactly once.
    pub fn run_code(&mut self, code: Vec<Line>) -> Result<()> {
        let start = self.stack[0].code.borrow().len();
        self.stack[0].code.borrow_mut().extend(code);
        self.stack[0].pc = start;
        self.run()
    }

    /// Run until the stack unwinds below the frame that was on top when
    /// `run` was called, the script yields (a resumable intrinsic is mid-
    /// flight), or the per-call step budget is exhausted.
    pub fn run(&mut self) -> Result<()> {
        let mut steps = 0usize;
        loop {
            if self.is_done() {
                break;
            }
            steps += 1;
            if steps > self.limits.step_budget_per_run {
                return Err(Error::limit_exceeded("step budget exceeded for this run"));
            }
            match self.step() {
                Ok(StepOutcome::Continue) => continue,
                Ok(StepOutcome::Yielded) => break,
                Ok(StepOutcome::Finished) => break,
                Err(e) => {
                    let location = self
                        .stack
                        .last()
                        .map(|c| Location::new(c.context_name.clone(), c.pc.saturating_sub(1)));
                    let e = match location {
                        Some(loc) => e.with_location_if_missing(loc),
                        None => e,
                    };
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn step(&mut self) -> Result<StepOutcome> {
        if self.stack.last().map(|c| c.at_end()).unwrap_or(true) {
            return self.pop_frame();
        }
        let line = self.stack.last().unwrap().current_line();
        let Some(line) = line else {
            return self.pop_frame();
        };
        self.stack.last_mut().unwrap().pc += 1;
        evaluator::exec(self, &line)
    }

    fn pop_frame(&mut self) -> Result<StepOutcome> {
        if self.stack.len() <= 1 {
            return Ok(StepOutcome::Finished);
        }
        let finished = self.stack.pop().unwrap();
        tracing::trace!(context = %finished.context_name, depth = self.stack.len() + 1, "popping call frame");
        let value = finished.return_value();
        if let Some(storage) = finished.result_storage {
            evaluator::store_value(self, &storage, value)?;
        }
        Ok(StepOutcome::Continue)
    }

    pub fn current(&self) -> &Context {
        self.stack.last().expect("machine stack is never empty while running")
    }

    pub fn current_mut(&mut self) -> &mut Context {
        self.stack.last_mut().expect("machine stack is never empty while running")
    }

    pub fn globals(&self) -> &VarScope {
        &self.stack[0].locals
    }

    pub fn push_frame(&mut self, ctx: Context) {
        tracing::trace!(context = %ctx.context_name, depth = self.stack.len() + 1, "pushing call frame");
        self.stack.push(ctx);
    }

    /// §4.5/§5 `done`: true iff only the global frame remains and its `pc`
    /// has reached end-of-code, i.e. the loaded program has nothing left to
    /// run and no call is in progress.
    pub fn is_done(&self) -> bool {
        self.stack.len() == 1 && self.stack[0].at_end()
    }

    /// §4.5 `stop()`: forces the current script to completion by collapsing
    /// the stack to just the global frame and advancing its `pc` to
    /// end-of-code, per §5 "Cancellation & timeouts". Leaves the global
    /// frame's variables and code list intact, unlike `reset`.
    pub fn stop(&mut self) {
        self.stack.truncate(1);
        let len = self.stack[0].code.borrow().len();
        self.stack[0].pc = len;
    }

    /// §4.5 `reset()`: collapses the stack to the global frame and rewinds
    /// its `pc` to the start, so a previously loaded program can be re-run
    /// from the top.
    pub fn reset(&mut self) {
        self.stack.truncate(1);
        self.stack[0].pc = 0;
    }

    /// §4.5 `manually_push_call`: lets the host inject a call to a
    /// MiniScript function from outside any running script. Pushes a fresh
    /// frame with no arguments and no `self`; unspecified parameters take
    /// their declared default (or `Null`), exactly as a zero-argument
    /// script-side call would. The frame's eventual return value is stored
    /// into `result_storage` (an L-value evaluated in the *caller's* frame)
    /// once it completes, or discarded if `result_storage` is `None`.
    pub fn manually_push_call(&mut self, func: &Rc<FunctionValue>, result_storage: Option<Value>) -> Result<()> {
        let mut ctx = Context::new(Rc::clone(&func.code), "<host-call>");
        ctx.outer = func.outer_vars.borrow().clone();
        ctx.result_storage = result_storage;
        for param in &func.params {
            let value = param.default.clone().unwrap_or(Value::Null);
            ctx.set_var(param.name.as_ref(), value)?;
        }
        self.push_frame(ctx);
        Ok(())
    }

    /// Current call-stack depth, used by the auto-invoke synchronous call
    /// path to recognize exactly when the frame it pushed is about to
    /// finish (so it can capture the return value before the generic
    /// `pop_frame` would discard it for lack of `result_storage`).
    pub(crate) fn frame_depth(&self) -> usize {
        self.stack.len()
    }

    /// Pops the top frame and returns its result, bypassing the
    /// `result_storage` L-value mechanism entirely — used only by the
    /// auto-invoke synchronous call path, which has no L-value to store
    /// into and wants the value directly.
    pub(crate) fn pop_top_frame_return_value(&mut self) -> Value {
        self.stack.pop().expect("frame pushed by the caller must exist").return_value()
    }

    /// Name resolution order (§4.3): `self`/`super` and ordinary locals and
    /// outer-capture are handled by the current `Context`; failing that,
    /// globals (if this isn't already the global frame), then the
    /// intrinsic registry, else `UndefinedIdentifier`.
    pub fn get_var(&mut self, name: &str) -> Result<Value> {
        if let Some(v) = self.current().get_var_local_only(name) {
            return Ok(v);
        }
        match name {
            "locals" => return Ok(snapshot_scope(&self.current().locals)),
            "globals" => return Ok(snapshot_scope(&self.stack[0].locals)),
            "outer" => {
                return Ok(self.current().outer.clone().map(|o| snapshot_scope(&o)).unwrap_or(Value::Null));
            }
            _ => {}
        }
        if self.stack.len() > 1 {
            if let Some(v) = self.stack[0].locals.borrow().get(name).cloned() {
                return Ok(v);
            }
        }
        if let Some(v) = self.intrinsic_value(name) {
            return Ok(v);
        }
        Err(Error::undefined_identifier(name))
    }

    pub fn set_var(&mut self, name: &str, v: Value) -> Result<()> {
        self.current_mut().set_var(name, v)
    }

    /// Builds (and caches) the `Value::Function` wrapper for a named
    /// intrinsic: a function whose entire body is one `CallIntrinsicA` line,
    /// so intrinsics and script-defined functions share one call path.
    pub fn intrinsic_value(&mut self, name: &str) -> Option<Value> {
        if let Some(v) = self.intrinsic_cache.get(name) {
            return Some(v.clone());
        }
        let def = self.intrinsics.get(name)?;
        let code = Rc::new(std::cell::RefCell::new(vec![Line::new(
            Some(Value::Temp(0)),
            Opcode::CallIntrinsicA,
            Some(Value::string(name.to_string())),
            None,
        )]));
        let func = Value::Function(Rc::new(miniscript_core::value::FunctionValue {
            params: def.params.clone(),
            code,
            outer_vars: std::cell::RefCell::new(None),
        }));
        self.intrinsic_cache.insert(name.to_string(), func.clone());
        Some(func)
    }

    /// Lazily materializes and returns the per-type prototype map that dot-
    /// access on a primitive value (`"abc".len`, `(1).round` ...) resolves
    /// into, per §4.7.
    pub fn type_proto_for(&mut self, v: &Value) -> Option<miniscript_core::value::MapRef> {
        let kind = match v {
            Value::Number(_) => TypeKind::Number,
            Value::String(_) => TypeKind::String,
            Value::List(_) => TypeKind::List,
            Value::Map(_) => return None,
            Value::Function(_) => TypeKind::Function,
            _ => return None,
        };
        Some(self.proto_for_kind(kind))
    }

    /// Lazily materializes (and caches) the prototype map for `kind`,
    /// binding each of `intrinsics::method_names(kind)` into it so dot-
    /// syntax (`"hello".len`, `[1,2].join(",")`) resolves through the
    /// normal `__isa`/prototype walk rather than a dedicated opcode. Also
    /// backs the `list`/`string`/`map`/`number`/`funcRef` zero-argument
    /// accessor intrinsics, which hand back this very same map.
    pub fn proto_for_kind(&mut self, kind: TypeKind) -> miniscript_core::value::MapRef {
        let existing = match kind {
            TypeKind::Number => self.protos.number.clone(),
            TypeKind::String => self.protos.string.clone(),
            TypeKind::List => self.protos.list.clone(),
            TypeKind::Map => self.protos.map.clone(),
            TypeKind::Function => self.protos.function.clone(),
        };
        if let Some(p) = existing {
            return p;
        }
        let proto = Rc::new(std::cell::RefCell::new(MsMap::new()));
        match kind {
            TypeKind::Number => self.protos.number = Some(Rc::clone(&proto)),
            TypeKind::String => self.protos.string = Some(Rc::clone(&proto)),
            TypeKind::List => self.protos.list = Some(Rc::clone(&proto)),
            TypeKind::Map => self.protos.map = Some(Rc::clone(&proto)),
            TypeKind::Function => self.protos.function = Some(Rc::clone(&proto)),
        }
        for name in crate::intrinsics::method_names(kind) {
            if let Some(func) = self.intrinsic_value(name) {
                proto.borrow_mut().set(Value::string(*name), func);
            }
        }
        proto
    }

    /// Lazily builds and caches the map the `version` intrinsic returns.
    pub fn version_map(&mut self) -> miniscript_core::value::MapRef {
        if let Some(v) = &self.version_cache {
            return Rc::clone(v);
        }
        let mut m = MsMap::new();
        m.set(Value::string("miniscript"), Value::string(env!("CARGO_PKG_VERSION")));
        m.set(Value::string("host"), Value::string("miniscript-rs"));
        let map = Rc::new(std::cell::RefCell::new(m));
        self.version_cache = Some(Rc::clone(&map));
        map
    }
}

fn snapshot_scope(scope: &VarScope) -> Value {
    let mut m = MsMap::new();
    for (k, v) in scope.borrow().iter() {
        m.set(Value::String(Rc::clone(k)), v.clone());
    }
    Value::map(m)
}
