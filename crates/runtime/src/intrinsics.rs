//! The standard intrinsic registry (component C7).
//!
//! Every intrinsic is an ordinary Rust function with the resumable
//! signature `(machine, args, partial) -> Result<Outcome>`; `machine.rs`
//! wraps each one in a single-`CallIntrinsicA`-line `Value::Function` so it
//! is indistinguishable, from the call site, from a script-defined
//! function — dot-call self-binding, argument defaults, and `@` address-of
//! all fall out of that for free.
//!
//! Argument order for each intrinsic is exactly the order its `params`
//! list is declared in below; the evaluator builds `args` by reading the
//! current frame's locals keyed by those same parameter names.

use std::collections::HashMap;
use std::rc::Rc;

use miniscript_core::limits::EQUALITY_RECURSION_LIMIT;
use miniscript_core::value::MsMap;
use miniscript_core::{arithmetic, Error, Param, Result, Value};

use crate::machine::Machine;

/// The result of one (possibly partial) intrinsic invocation.
pub struct Outcome {
    pub value: Value,
    pub done: bool,
    pub partial: Option<Value>,
}

impl Outcome {
    pub fn done(value: Value) -> Self {
        Outcome { value, done: true, partial: None }
    }

    pub fn pending(partial: Value) -> Self {
        Outcome { value: Value::Null, done: false, partial: Some(partial) }
    }
}

pub type IntrinsicFn = fn(&mut Machine, &[Value], Option<Value>) -> Result<Outcome>;

#[derive(Clone)]
pub struct IntrinsicDef {
    pub name: &'static str,
    pub params: Vec<Param>,
    pub func: IntrinsicFn,
}

/// Which per-type prototype map a value's dot-access falls through to.
/// Maps use their own `__isa` chain (see `miniscript_core::value::MsMap`)
/// rather than this mechanism; `Map` is included only so the `map`
/// zero-argument intrinsic has somewhere to materialize its own handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Number,
    String,
    List,
    Map,
    Function,
}

/// The methods bound into each type's lazily-materialized prototype map
/// (§4.7 "selected intrinsics are bound into the per-type prototype maps").
pub fn method_names(kind: TypeKind) -> &'static [&'static str] {
    match kind {
        TypeKind::Number => &[
            "abs", "acos", "asin", "atan", "bitAnd", "bitOr", "bitXor", "ceil", "cos", "floor", "log", "round",
            "sign", "sin", "sqrt", "tan",
        ],
        TypeKind::String => &[
            "code", "hasIndex", "indexes", "indexOf", "insert", "len", "lower", "remove", "replace", "slice",
            "split", "upper", "val", "values",
        ],
        TypeKind::List => &[
            "hasIndex", "indexes", "indexOf", "insert", "join", "len", "pop", "pull", "push", "remove", "replace",
            "shuffle", "slice", "sort", "sum", "values",
        ],
        TypeKind::Map => &["hasIndex", "indexes", "len", "remove", "sum", "values"],
        TypeKind::Function => &[],
    }
}

pub struct IntrinsicRegistry {
    defs: HashMap<String, IntrinsicDef>,
}

impl IntrinsicRegistry {
    pub fn get(&self, name: &str) -> Option<&IntrinsicDef> {
        self.defs.get(name)
    }

    /// Lets a host register (or override) an intrinsic by name, per §4.7's
    /// "host function injection" interface.
    pub fn register(&mut self, def: IntrinsicDef) {
        self.defs.insert(def.name.to_string(), def);
    }

    pub fn standard() -> Self {
        let mut reg = IntrinsicRegistry { defs: HashMap::new() };
        for def in standard_defs() {
            reg.register(def);
        }
        reg
    }
}

fn p(name: &str) -> Param {
    Param { name: Rc::from(name), default: None }
}

fn pd(name: &str, default: Value) -> Param {
    Param { name: Rc::from(name), default: Some(default) }
}

fn standard_defs() -> Vec<IntrinsicDef> {
    vec![
        IntrinsicDef { name: "abs", params: vec![p("self")], func: intr_abs },
        IntrinsicDef { name: "acos", params: vec![p("self")], func: intr_acos },
        IntrinsicDef { name: "asin", params: vec![p("self")], func: intr_asin },
        IntrinsicDef { name: "atan", params: vec![p("self"), pd("x", Value::Number(1.0))], func: intr_atan },
        IntrinsicDef { name: "bitAnd", params: vec![p("self"), p("other")], func: intr_bit_and },
        IntrinsicDef { name: "bitOr", params: vec![p("self"), p("other")], func: intr_bit_or },
        IntrinsicDef { name: "bitXor", params: vec![p("self"), p("other")], func: intr_bit_xor },
        IntrinsicDef { name: "ceil", params: vec![p("self")], func: intr_ceil },
        IntrinsicDef { name: "char", params: vec![p("self")], func: intr_char },
        IntrinsicDef { name: "code", params: vec![p("self")], func: intr_code },
        IntrinsicDef { name: "cos", params: vec![p("self")], func: intr_cos },
        IntrinsicDef { name: "floor", params: vec![p("self")], func: intr_floor },
        IntrinsicDef { name: "funcRef", params: vec![], func: intr_func_ref },
        IntrinsicDef { name: "hash", params: vec![p("self")], func: intr_hash },
        IntrinsicDef { name: "hasIndex", params: vec![p("self"), p("index")], func: intr_has_index },
        IntrinsicDef { name: "indexes", params: vec![p("self")], func: intr_indexes },
        IntrinsicDef {
            name: "indexOf",
            params: vec![p("self"), p("value"), pd("after", Value::Null)],
            func: intr_index_of,
        },
        IntrinsicDef { name: "insert", params: vec![p("self"), p("index"), p("value")], func: intr_insert },
        IntrinsicDef { name: "join", params: vec![p("self"), pd("delimiter", Value::string(" "))], func: intr_join },
        IntrinsicDef { name: "len", params: vec![p("self")], func: intr_len },
        IntrinsicDef { name: "list", params: vec![], func: intr_list_proto },
        IntrinsicDef {
            name: "log",
            params: vec![p("self"), pd("base", Value::Number(std::f64::consts::E))],
            func: intr_log,
        },
        IntrinsicDef { name: "lower", params: vec![p("self")], func: intr_lower },
        IntrinsicDef { name: "map", params: vec![], func: intr_map_proto },
        IntrinsicDef { name: "number", params: vec![], func: intr_number_proto },
        IntrinsicDef { name: "pi", params: vec![], func: intr_pi },
        IntrinsicDef { name: "print", params: vec![pd("s", Value::Null)], func: intr_print },
        IntrinsicDef { name: "pop", params: vec![p("self")], func: intr_pop },
        IntrinsicDef { name: "pull", params: vec![p("self")], func: intr_pull },
        IntrinsicDef { name: "push", params: vec![p("self"), p("value")], func: intr_push },
        IntrinsicDef {
            name: "range",
            params: vec![p("from"), p("to"), pd("step", Value::Number(1.0))],
            func: intr_range,
        },
        IntrinsicDef { name: "remove", params: vec![p("self"), p("key")], func: intr_remove },
        IntrinsicDef {
            name: "replace",
            params: vec![p("self"), p("old"), p("new"), pd("maxCount", Value::Null)],
            func: intr_replace,
        },
        IntrinsicDef { name: "rnd", params: vec![pd("seed", Value::Null)], func: intr_rnd },
        IntrinsicDef { name: "round", params: vec![p("self"), pd("decimals", Value::Number(0.0))], func: intr_round },
        IntrinsicDef { name: "shuffle", params: vec![p("self")], func: intr_shuffle },
        IntrinsicDef { name: "sign", params: vec![p("self")], func: intr_sign },
        IntrinsicDef { name: "sin", params: vec![p("self")], func: intr_sin },
        IntrinsicDef {
            name: "slice",
            params: vec![p("self"), pd("from", Value::Null), pd("to", Value::Null)],
            func: intr_slice,
        },
        IntrinsicDef {
            name: "sort",
            params: vec![p("self"), pd("byKey", Value::Null), pd("ascending", Value::Number(1.0))],
            func: intr_sort,
        },
        IntrinsicDef {
            name: "split",
            params: vec![p("self"), pd("delimiter", Value::string(" ")), pd("maxCount", Value::Number(-1.0))],
            func: intr_split,
        },
        IntrinsicDef { name: "sqrt", params: vec![p("self")], func: intr_sqrt },
        IntrinsicDef { name: "str", params: vec![p("self")], func: intr_str },
        IntrinsicDef { name: "string", params: vec![], func: intr_string_proto },
        IntrinsicDef { name: "sum", params: vec![p("self")], func: intr_sum },
        IntrinsicDef { name: "tan", params: vec![p("self")], func: intr_tan },
        IntrinsicDef { name: "time", params: vec![], func: intr_time },
        IntrinsicDef { name: "upper", params: vec![p("self")], func: intr_upper },
        IntrinsicDef { name: "val", params: vec![p("self")], func: intr_val },
        IntrinsicDef { name: "values", params: vec![p("self")], func: intr_values },
        IntrinsicDef { name: "version", params: vec![], func: intr_version },
        IntrinsicDef { name: "wait", params: vec![pd("seconds", Value::Number(1.0))], func: intr_wait },
        IntrinsicDef { name: "yield", params: vec![], func: intr_yield },
    ]
}

// ---- argument helpers ----------------------------------------------------

fn expect_number(v: &Value) -> Result<f64> {
    match v {
        Value::Number(n) => Ok(*n),
        other => Err(Error::type_error(format!("expected a number, got {}", other.type_name()))),
    }
}

fn expect_string(v: &Value) -> Result<Rc<str>> {
    match v {
        Value::String(s) => Ok(Rc::clone(s)),
        other => Err(Error::type_error(format!("expected a string, got {}", other.type_name()))),
    }
}

fn arg_number_or(args: &[Value], i: usize, default: f64) -> f64 {
    match args.get(i) {
        Some(Value::Number(n)) => *n,
        _ => default,
    }
}

// ---- math -----------------------------------------------------------------

fn intr_abs(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Number(expect_number(&args[0])?.abs())))
}
fn intr_acos(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Number(expect_number(&args[0])?.clamp(-1.0, 1.0).acos())))
}
fn intr_asin(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Number(expect_number(&args[0])?.clamp(-1.0, 1.0).asin())))
}
fn intr_atan(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let y = expect_number(&args[0])?;
    let x = arg_number_or(args, 1, 1.0);
    Ok(Outcome::done(Value::Number(y.atan2(x))))
}
fn intr_bit_and(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let a = expect_number(&args[0])? as i64;
    let b = expect_number(&args[1])? as i64;
    Ok(Outcome::done(Value::Number((a & b) as f64)))
}
fn intr_bit_or(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let a = expect_number(&args[0])? as i64;
    let b = expect_number(&args[1])? as i64;
    Ok(Outcome::done(Value::Number((a | b) as f64)))
}
fn intr_bit_xor(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let a = expect_number(&args[0])? as i64;
    let b = expect_number(&args[1])? as i64;
    Ok(Outcome::done(Value::Number((a ^ b) as f64)))
}
fn intr_ceil(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Number(expect_number(&args[0])?.ceil())))
}
fn intr_floor(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Number(expect_number(&args[0])?.floor())))
}
fn intr_sign(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let n = expect_number(&args[0])?;
    let s = if n > 0.0 { 1.0 } else if n < 0.0 { -1.0 } else { 0.0 };
    Ok(Outcome::done(Value::Number(s)))
}
fn intr_sin(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Number(expect_number(&args[0])?.sin())))
}
fn intr_cos(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Number(expect_number(&args[0])?.cos())))
}
fn intr_tan(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Number(expect_number(&args[0])?.tan())))
}
fn intr_sqrt(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let n = expect_number(&args[0])?;
    if n < 0.0 {
        return Err(Error::runtime("sqrt of a negative number"));
    }
    Ok(Outcome::done(Value::Number(n.sqrt())))
}
fn intr_log(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let n = expect_number(&args[0])?;
    let base = arg_number_or(args, 1, std::f64::consts::E);
    Ok(Outcome::done(Value::Number(n.log(base))))
}
fn intr_round(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let n = expect_number(&args[0])?;
    let decimals = arg_number_or(args, 1, 0.0).max(0.0) as i32;
    let factor = 10f64.powi(decimals);
    Ok(Outcome::done(Value::Number((n * factor).round() / factor)))
}
fn intr_pi(_m: &mut Machine, _args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Number(std::f64::consts::PI)))
}

// ---- string/char conversions ----------------------------------------------

fn intr_char(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let code = expect_number(&args[0])? as u32;
    let c = char::from_u32(code).ok_or_else(|| Error::runtime("invalid character code"))?;
    Ok(Outcome::done(Value::string(c.to_string())))
}
fn intr_code(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let s = expect_string(&args[0])?;
    let code = s.chars().next().map(|c| c as u32 as f64).unwrap_or(-1.0);
    Ok(Outcome::done(Value::Number(code)))
}
fn intr_lower(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::string(expect_string(&args[0])?.to_lowercase())))
}
fn intr_upper(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::string(expect_string(&args[0])?.to_uppercase())))
}
fn intr_val(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let s = expect_string(&args[0])?;
    let n: f64 = s.trim().parse().unwrap_or(0.0);
    Ok(Outcome::done(Value::Number(n)))
}
fn intr_str(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::string(args[0].to_ms_string())))
}

// ---- sequence operations ----------------------------------------------------

fn intr_len(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(arithmetic::length_of(&args[0])?))
}

fn intr_slice(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let from = match args.get(1) {
        Some(Value::Number(n)) => Some(*n),
        _ => None,
    };
    let to = match args.get(2) {
        Some(Value::Number(n)) => Some(*n),
        _ => None,
    };
    Ok(Outcome::done(arithmetic::slice(&args[0], from, to)?))
}

fn intr_has_index(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let found = match &args[0] {
        Value::List(l) => match &args[1] {
            Value::Number(n) => {
                let i = *n as i64;
                let len = l.borrow().len() as i64;
                i >= -len && i < len
            }
            _ => false,
        },
        Value::String(s) => match &args[1] {
            Value::Number(n) => {
                let i = *n as i64;
                let len = s.chars().count() as i64;
                i >= -len && i < len
            }
            _ => false,
        },
        Value::Map(m) => m.borrow().get(&args[1]).is_some(),
        other => return Err(Error::type_error(format!("hasIndex is not defined for {}", other.type_name()))),
    };
    Ok(Outcome::done(Value::Number(if found { 1.0 } else { 0.0 })))
}

fn intr_indexes(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let result = match &args[0] {
        Value::List(l) => (0..l.borrow().len()).map(|i| Value::Number(i as f64)).collect(),
        Value::String(s) => (0..s.chars().count()).map(|i| Value::Number(i as f64)).collect(),
        Value::Map(m) => m.borrow().entries.iter().map(|(k, _)| k.0.clone()).collect(),
        other => return Err(Error::type_error(format!("indexes is not defined for {}", other.type_name()))),
    };
    Ok(Outcome::done(Value::list(result)))
}

fn intr_values(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let result = match &args[0] {
        Value::List(l) => l.borrow().clone(),
        Value::String(s) => s.chars().map(|c| Value::string(c.to_string())).collect(),
        Value::Map(m) => m.borrow().entries.iter().map(|(_, v)| v.clone()).collect(),
        other => return Err(Error::type_error(format!("values is not defined for {}", other.type_name()))),
    };
    Ok(Outcome::done(Value::list(result)))
}

fn intr_index_of(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let after = match args.get(2) {
        Some(Value::Number(n)) => Some(*n as i64),
        _ => None,
    };
    let found = match &args[0] {
        Value::List(l) => l
            .borrow()
            .iter()
            .enumerate()
            .filter(|(i, _)| after.map(|a| *i as i64 > a).unwrap_or(true))
            .find(|(_, v)| v.equality(&args[1], EQUALITY_RECURSION_LIMIT) == 1.0)
            .map(|(i, _)| Value::Number(i as f64)),
        Value::String(s) => {
            let needle = args[1].to_ms_string();
            let chars: Vec<char> = s.chars().collect();
            let start = after.map(|a| (a + 1).max(0) as usize).unwrap_or(0);
            chars[start.min(chars.len())..]
                .windows(needle.chars().count().max(1))
                .position(|w| w.iter().collect::<String>() == needle)
                .map(|i| Value::Number((i + start) as f64))
        }
        Value::Map(m) => m.borrow().entries.iter().find(|(_, v)| v.equality(&args[1], EQUALITY_RECURSION_LIMIT) == 1.0).map(|(k, _)| k.0.clone()),
        other => return Err(Error::type_error(format!("indexOf is not defined for {}", other.type_name()))),
    };
    Ok(Outcome::done(found.unwrap_or(Value::Null)))
}

fn intr_insert(m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    match &args[0] {
        Value::List(l) => {
            let len = l.borrow().len();
            arithmetic::check_list_len(len + 1, m.limits.size_limits())?;
            let idx = (expect_number(&args[1])? as i64).clamp(0, len as i64) as usize;
            l.borrow_mut().insert(idx, args[2].clone());
            Ok(Outcome::done(args[0].clone()))
        }
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = (expect_number(&args[1])? as i64).clamp(0, chars.len() as i64) as usize;
            let inserted = args[2].to_ms_string();
            let mut out: String = chars[..idx].iter().collect();
            out.push_str(&inserted);
            out.extend(&chars[idx..]);
            Ok(Outcome::done(Value::string(out)))
        }
        other => Err(Error::type_error(format!("insert is not defined for {}", other.type_name()))),
    }
}

fn intr_remove(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    match &args[0] {
        Value::List(l) => {
            let len = l.borrow().len();
            let idx = expect_number(&args[1])? as i64;
            let idx = if idx < 0 { idx + len as i64 } else { idx };
            if idx < 0 || idx as usize >= len {
                return Err(Error::index_error("remove index out of range"));
            }
            Ok(Outcome::done(l.borrow_mut().remove(idx as usize)))
        }
        Value::Map(m) => Ok(Outcome::done(m.borrow_mut().remove(&args[1]).unwrap_or(Value::Null))),
        Value::String(s) => {
            let needle = args[1].to_ms_string();
            Ok(Outcome::done(Value::string(s.replacen(&needle, "", 1))))
        }
        other => Err(Error::type_error(format!("remove is not defined for {}", other.type_name()))),
    }
}

fn intr_replace(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let max_count = match args.get(3) {
        Some(Value::Number(n)) => Some(*n as usize),
        _ => None,
    };
    match &args[0] {
        Value::String(s) => {
            let old = args[1].to_ms_string();
            let new = args[2].to_ms_string();
            let replaced = match max_count {
                Some(n) => s.replacen(&old, &new, n),
                None => s.replace(&old, &new),
            };
            Ok(Outcome::done(Value::string(replaced)))
        }
        Value::List(l) => {
            let mut count = 0usize;
            let limit = max_count.unwrap_or(usize::MAX);
            for item in l.borrow_mut().iter_mut() {
                if count >= limit {
                    break;
                }
                if item.equality(&args[1], EQUALITY_RECURSION_LIMIT) == 1.0 {
                    *item = args[2].clone();
                    count += 1;
                }
            }
            Ok(Outcome::done(args[0].clone()))
        }
        other => Err(Error::type_error(format!("replace is not defined for {}", other.type_name()))),
    }
}

fn intr_join(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let Value::List(l) = &args[0] else {
        return Err(Error::type_error("join requires a list"));
    };
    let delimiter = args.get(1).map(|v| v.to_ms_string()).unwrap_or_default();
    let joined = l.borrow().iter().map(|v| v.to_ms_string()).collect::<Vec<_>>().join(&delimiter);
    Ok(Outcome::done(Value::string(joined)))
}

fn intr_split(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let s = expect_string(&args[0])?;
    let delimiter = args.get(1).map(|v| v.to_ms_string()).unwrap_or_else(|| " ".to_string());
    let max_count = match args.get(2) {
        Some(Value::Number(n)) if *n >= 0.0 => Some(*n as usize),
        _ => None,
    };
    let parts: Vec<Value> = if delimiter.is_empty() {
        s.chars().map(|c| Value::string(c.to_string())).collect()
    } else {
        match max_count {
            Some(n) => s.splitn(n.max(1), delimiter.as_str()).map(Value::string).collect(),
            None => s.split(delimiter.as_str()).map(Value::string).collect(),
        }
    };
    Ok(Outcome::done(Value::list(parts)))
}

fn intr_push(m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let Value::List(l) = &args[0] else {
        return Err(Error::type_error("push requires a list"));
    };
    arithmetic::check_list_len(l.borrow().len() + 1, m.limits.size_limits())?;
    l.borrow_mut().push(args[1].clone());
    Ok(Outcome::done(args[0].clone()))
}

fn intr_pop(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let Value::List(l) = &args[0] else {
        return Err(Error::type_error("pop requires a list"));
    };
    Ok(Outcome::done(l.borrow_mut().pop().unwrap_or(Value::Null)))
}

fn intr_pull(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let Value::List(l) = &args[0] else {
        return Err(Error::type_error("pull requires a list"));
    };
    let mut l = l.borrow_mut();
    if l.is_empty() {
        Ok(Outcome::done(Value::Null))
    } else {
        Ok(Outcome::done(l.remove(0)))
    }
}

fn intr_sum(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let total: f64 = match &args[0] {
        Value::List(l) => l.borrow().iter().map(|v| expect_number(v).unwrap_or(0.0)).sum(),
        Value::Map(m) => m.borrow().entries.iter().map(|(_, v)| expect_number(v).unwrap_or(0.0)).sum(),
        other => return Err(Error::type_error(format!("sum is not defined for {}", other.type_name()))),
    };
    Ok(Outcome::done(Value::Number(total)))
}

fn intr_range(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let from = expect_number(&args[0])?;
    let to = expect_number(&args[1])?;
    let step = arg_number_or(args, 2, 1.0);
    if step == 0.0 {
        return Err(Error::runtime("range step must not be zero"));
    }
    let mut out = Vec::new();
    let mut n = from;
    if step > 0.0 {
        while n <= to {
            out.push(Value::Number(n));
            n += step;
        }
    } else {
        while n >= to {
            out.push(Value::Number(n));
            n += step;
        }
    }
    Ok(Outcome::done(Value::list(out)))
}

/// §9's total-order Open Question, decided: numbers and strings compare
/// natively; anything else (including cross-type pairs) falls back to a
/// fixed type-tag rank, giving `sort`/`shuffle`'s comparator a stable,
/// deterministic total order without attempting deep structural comparison.
fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::List(_) => 3,
        Value::Map(_) => 4,
        Value::Function(_) => 5,
        Value::Temp(_) | Value::Var(_, _) | Value::SeqElem(_, _, _) => 6,
    }
}

fn total_cmp(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn sort_key(v: &Value, by_key: &Value) -> Value {
    match v {
        Value::Map(m) if !by_key.is_null() => m.borrow().get(by_key).cloned().unwrap_or(Value::Null),
        other => other.clone(),
    }
}

fn intr_sort(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let Value::List(l) = &args[0] else {
        return Err(Error::type_error("sort requires a list"));
    };
    let by_key = args.get(1).cloned().unwrap_or(Value::Null);
    let ascending = args.get(2).map(|v| v.truth()).unwrap_or(true);
    let mut items = l.borrow().clone();
    items.sort_by(|a, b| {
        let ord = total_cmp(&sort_key(a, &by_key), &sort_key(b, &by_key));
        if ascending {
            ord
        } else {
            ord.reverse()
        }
    });
    *l.borrow_mut() = items;
    Ok(Outcome::done(args[0].clone()))
}

fn intr_shuffle(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    use rand::seq::SliceRandom;
    let Value::List(l) = &args[0] else {
        return Err(Error::type_error("shuffle requires a list"));
    };
    l.borrow_mut().shuffle(&mut rand::thread_rng());
    Ok(Outcome::done(Value::Null))
}

fn intr_rnd(_m: &mut Machine, _args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    use rand::Rng;
    let v: f64 = rand::thread_rng().gen_range(0.0..1.0);
    Ok(Outcome::done(Value::Number(v)))
}

fn intr_hash(_m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Number(args[0].hash_value(EQUALITY_RECURSION_LIMIT) as f64)))
}

// ---- prototype accessors ----------------------------------------------------

fn intr_list_proto(m: &mut Machine, _args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Map(m.proto_for_kind(TypeKind::List))))
}
fn intr_map_proto(m: &mut Machine, _args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Map(m.proto_for_kind(TypeKind::Map))))
}
fn intr_number_proto(m: &mut Machine, _args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Map(m.proto_for_kind(TypeKind::Number))))
}
fn intr_string_proto(m: &mut Machine, _args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Map(m.proto_for_kind(TypeKind::String))))
}
fn intr_func_ref(m: &mut Machine, _args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Map(m.proto_for_kind(TypeKind::Function))))
}

// ---- host interaction -------------------------------------------------------

fn intr_print(m: &mut Machine, args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    let text = args.first().map(|v| v.to_ms_string_with_globals(m.globals())).unwrap_or_default();
    m.io.print(&text);
    Ok(Outcome::done(Value::Null))
}

fn intr_time(m: &mut Machine, _args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Number(m.elapsed_secs())))
}

/// Resumable: stashes the absolute deadline (elapsed seconds) as partial
/// state and keeps returning `done=false` until the clock passes it.
fn intr_wait(m: &mut Machine, args: &[Value], partial: Option<Value>) -> Result<Outcome> {
    let seconds = arg_number_or(args, 0, 1.0).max(0.0);
    let deadline = match partial {
        Some(Value::Number(d)) => d,
        _ => m.elapsed_secs() + seconds,
    };
    if m.elapsed_secs() >= deadline {
        Ok(Outcome::done(Value::Null))
    } else {
        Ok(Outcome::pending(Value::Number(deadline)))
    }
}

/// Resumable: suspends for exactly one step, returning control to the host
/// loop the way `Machine::run` already does for any `done=false` result,
/// then completes on the next poll. Also sets `Machine::yielded` (§5 "the
/// `yield` intrinsic sets a flag on the Machine that the host loop is
/// expected to observe and honor").
fn intr_yield(m: &mut Machine, _args: &[Value], partial: Option<Value>) -> Result<Outcome> {
    match partial {
        None => {
            m.yielded = true;
            Ok(Outcome::pending(Value::Number(1.0)))
        }
        Some(_) => Ok(Outcome::done(Value::Null)),
    }
}

fn intr_version(m: &mut Machine, _args: &[Value], _p: Option<Value>) -> Result<Outcome> {
    Ok(Outcome::done(Value::Map(m.version_map())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::MachineLimits;

    fn machine() -> Machine {
        Machine::new(MachineLimits::default())
    }

    #[test]
    fn abs_and_round_trip_numbers() {
        let mut m = machine();
        let outcome = intr_abs(&mut m, &[Value::Number(-3.5)], None).unwrap();
        assert_eq!(outcome.value, Value::Number(3.5));
    }

    #[test]
    fn push_and_pop_mutate_the_same_list() {
        let mut m = machine();
        let list = Value::list(vec![Value::Number(1.0)]);
        intr_push(&mut m, &[list.clone(), Value::Number(2.0)], None).unwrap();
        let popped = intr_pop(&mut m, &[list.clone()], None).unwrap();
        assert_eq!(popped.value, Value::Number(2.0));
    }

    #[test]
    fn split_respects_empty_delimiter() {
        let mut m = machine();
        let outcome = intr_split(&mut m, &[Value::string("abc"), Value::string("")], None).unwrap();
        let Value::List(l) = outcome.value else { panic!("expected list") };
        assert_eq!(l.borrow().len(), 3);
    }

    #[test]
    fn sort_orders_numbers_ascending() {
        let mut m = machine();
        let list = Value::list(vec![Value::Number(3.0), Value::Number(1.0), Value::Number(2.0)]);
        intr_sort(&mut m, &[list.clone(), Value::Null, Value::Number(1.0)], None).unwrap();
        let Value::List(l) = list else { unreachable!() };
        let nums: Vec<f64> = l.borrow().iter().map(|v| expect_number(v).unwrap()).collect();
        assert_eq!(nums, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn wait_stays_pending_until_deadline_elapses() {
        let mut m = machine();
        let first = intr_wait(&mut m, &[Value::Number(10_000.0)], None).unwrap();
        assert!(!first.done);
        let second = intr_wait(&mut m, &[Value::Number(10_000.0)], first.partial).unwrap();
        assert!(!second.done);
    }

    #[test]
    fn yield_completes_on_second_poll() {
        let mut m = machine();
        let first = intr_yield(&mut m, &[], None).unwrap();
        assert!(!first.done);
        let second = intr_yield(&mut m, &[], first.partial).unwrap();
        assert!(second.done);
    }
}
