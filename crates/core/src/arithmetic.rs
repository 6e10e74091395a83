//! Binary-operator semantics for `Value` (part of component C1, §4.1).
//!
//! These are the operations the evaluator's arithmetic/comparison/indexing
//! opcodes dispatch into. Each function is total over the pairs of operand
//! types the specification assigns a meaning to, and returns a `TypeError`
//! for any other combination.

use crate::error::{Error, Result};
use crate::limits::{DEFAULT_MAX_LIST_LEN, DEFAULT_MAX_MAP_LEN, DEFAULT_MAX_STRING_LEN};
use crate::value::{MsMap, Value};

/// Size caps consulted by the functions below. Callers that own a
/// host-configurable `MachineLimits` pass its values through here instead of
/// the hardcoded defaults, so `--max-string-len` et al. actually take effect.
#[derive(Clone, Copy, Debug)]
pub struct SizeLimits {
    pub max_string_len: usize,
    pub max_list_len: usize,
    pub max_map_len: usize,
}

impl Default for SizeLimits {
    fn default() -> Self {
        SizeLimits {
            max_string_len: DEFAULT_MAX_STRING_LEN,
            max_list_len: DEFAULT_MAX_LIST_LEN,
            max_map_len: DEFAULT_MAX_MAP_LEN,
        }
    }
}

pub fn check_string_len(len: usize, limits: SizeLimits) -> Result<()> {
    if len > limits.max_string_len {
        return Err(Error::limit_exceeded("string exceeds maximum length"));
    }
    Ok(())
}

pub fn check_list_len(len: usize, limits: SizeLimits) -> Result<()> {
    if len > limits.max_list_len {
        return Err(Error::limit_exceeded("list exceeds maximum length"));
    }
    Ok(())
}

pub fn check_map_len(len: usize, limits: SizeLimits) -> Result<()> {
    if len > limits.max_map_len {
        return Err(Error::limit_exceeded("map exceeds maximum size"));
    }
    Ok(())
}

/// Split a non-negative real `factor` into a whole-number repeat count and
/// a fractional prefix length, used by both string and list `*`/`/`.
fn repeat_factor(len: usize, factor: f64) -> (usize, usize) {
    if factor <= 0.0 {
        return (0, 0);
    }
    let whole = factor.trunc() as usize;
    let frac = factor - factor.trunc();
    let prefix_len = (frac * len as f64).round() as usize;
    (whole, prefix_len.min(len))
}

pub fn add(a: &Value, b: &Value, limits: SizeLimits) -> Result<Value> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(Value::Number(x + y)),
        (Value::Null, Value::String(_)) => Ok(b.clone()),
        (Value::String(_), Value::Null) => Ok(a.clone()),
        (Value::String(s), _) => {
            let rhs = b.to_ms_string();
            let combined = format!("{s}{rhs}");
            check_string_len(combined.len(), limits)?;
            Ok(Value::string(combined))
        }
        (_, Value::String(s)) => {
            let lhs = a.to_ms_string();
            let combined = format!("{lhs}{s}");
            check_string_len(combined.len(), limits)?;
            Ok(Value::string(combined))
        }
        (Value::List(x), Value::List(y)) => {
            let mut out = x.borrow().clone();
            out.extend(y.borrow().iter().cloned());
            check_list_len(out.len(), limits)?;
            Ok(Value::list(out))
        }
        (Value::Map(x), Value::Map(y)) => {
            let mut out = MsMap::new();
            for (k, v) in x.borrow().entries.iter() {
                out.set(k.0.clone(), v.clone());
            }
            for (k, v) in y.borrow().entries.iter() {
                out.set(k.0.clone(), v.clone());
            }
            check_map_len(out.len(), limits)?;
            Ok(Value::map(out))
        }
        _ => Err(Error::type_error(format!(
            "cannot add {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

pub fn subtract(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(Value::Number(x - y)),
        (Value::String(s), Value::String(suffix)) => {
            let result = s.strip_suffix(suffix.as_ref()).unwrap_or(s);
            Ok(Value::string(result.to_string()))
        }
        _ => Err(Error::type_error(format!(
            "cannot subtract {} from {}",
            b.type_name(),
            a.type_name()
        ))),
    }
}

pub fn multiply(a: &Value, b: &Value, limits: SizeLimits) -> Result<Value> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(Value::Number(x * y)),
        (Value::String(s), Value::Number(factor)) => {
            Ok(Value::string(replicate_str(s, *factor, limits)?))
        }
        (Value::List(l), Value::Number(factor)) => {
            Ok(Value::list(replicate_list(&l.borrow(), *factor, limits)?))
        }
        _ => Err(Error::type_error(format!(
            "cannot multiply {} by {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

pub fn divide(a: &Value, b: &Value, limits: SizeLimits) -> Result<Value> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(Value::Number(x / y)),
        (Value::String(s), Value::Number(factor)) => {
            if *factor == 0.0 {
                return Err(Error::runtime("division by zero"));
            }
            Ok(Value::string(replicate_str(s, 1.0 / factor, limits)?))
        }
        (Value::List(l), Value::Number(factor)) => {
            if *factor == 0.0 {
                return Err(Error::runtime("division by zero"));
            }
            Ok(Value::list(replicate_list(&l.borrow(), 1.0 / factor, limits)?))
        }
        _ => Err(Error::type_error(format!(
            "cannot divide {} by {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn replicate_str(s: &str, factor: f64, limits: SizeLimits) -> Result<String> {
    let chars: Vec<char> = s.chars().collect();
    let (whole, prefix_len) = repeat_factor(chars.len(), factor);
    check_string_len(chars.len() * whole + prefix_len, limits)?;
    let mut out = String::with_capacity(chars.len() * whole.max(1));
    for _ in 0..whole {
        out.extend(chars.iter());
    }
    out.extend(chars.iter().take(prefix_len));
    Ok(out)
}

fn replicate_list(items: &[Value], factor: f64, limits: SizeLimits) -> Result<Vec<Value>> {
    let (whole, prefix_len) = repeat_factor(items.len(), factor);
    check_list_len(items.len() * whole + prefix_len, limits)?;
    let mut out = Vec::with_capacity(items.len() * whole.max(1));
    for _ in 0..whole {
        out.extend(items.iter().cloned());
    }
    out.extend(items.iter().take(prefix_len).cloned());
    Ok(out)
}

pub fn modulo(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if *y == 0.0 {
                return Err(Error::runtime("mod by zero"));
            }
            Ok(Value::Number(x % y))
        }
        _ => Err(Error::type_error("mod requires two numbers")),
    }
}

pub fn pow(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(Value::Number(x.powf(*y))),
        _ => Err(Error::type_error("^ requires two numbers")),
    }
}

fn num_bool(b: bool) -> Value {
    Value::Number(if b { 1.0 } else { 0.0 })
}

pub fn equal(a: &Value, b: &Value) -> Value {
    num_bool(a.equality(b, crate::limits::EQUALITY_RECURSION_LIMIT) == 1.0)
}

pub fn not_equal(a: &Value, b: &Value) -> Value {
    num_bool(a.equality(b, crate::limits::EQUALITY_RECURSION_LIMIT) != 1.0)
}

/// Ordering comparisons only accept two numbers or two strings (lexical);
/// any other pairing is a `TypeError`, including comparisons against null
/// (per §4.4, only `==`/`!=` may involve null).
fn ordering(a: &Value, b: &Value) -> Result<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.partial_cmp(y).ok_or_else(|| Error::type_error("cannot compare NaN"))
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(Error::type_error(format!(
            "cannot compare {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

pub fn greater_than(a: &Value, b: &Value) -> Result<Value> {
    Ok(num_bool(ordering(a, b)?.is_gt()))
}
pub fn greater_or_equal(a: &Value, b: &Value) -> Result<Value> {
    Ok(num_bool(ordering(a, b)?.is_ge()))
}
pub fn less_than(a: &Value, b: &Value) -> Result<Value> {
    Ok(num_bool(ordering(a, b)?.is_lt()))
}
pub fn less_or_equal(a: &Value, b: &Value) -> Result<Value> {
    Ok(num_bool(ordering(a, b)?.is_le()))
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

fn fuzzy(v: &Value) -> f64 {
    match v {
        Value::Number(n) => clamp01(*n),
        other => {
            if other.truth() {
                1.0
            } else {
                0.0
            }
        }
    }
}

/// `and`: the fuzzy product.
pub fn fuzzy_and(a: &Value, b: &Value) -> Value {
    Value::Number(clamp01(fuzzy(a) * fuzzy(b)))
}

/// `or`: the probabilistic sum.
pub fn fuzzy_or(a: &Value, b: &Value) -> Value {
    let fa = fuzzy(a);
    let fb = fuzzy(b);
    Value::Number(clamp01(fa + fb - fa * fb))
}

/// §4.4 `ElemBofA` numeric indexing into a string or list, supporting
/// negative indices counting from the end.
pub fn index_get(target: &Value, index: &Value) -> Result<Value> {
    match target {
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = resolve_index(index, chars.len())?;
            Ok(Value::string(chars[i].to_string()))
        }
        Value::List(l) => {
            let l = l.borrow();
            let i = resolve_index(index, l.len())?;
            Ok(l[i].clone())
        }
        _ => Err(Error::type_error(format!("cannot index into {}", target.type_name()))),
    }
}

fn resolve_index(index: &Value, len: usize) -> Result<usize> {
    let Value::Number(n) = index else {
        return Err(Error::type_error("index must be a number"));
    };
    let i = n.floor() as i64;
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved as usize >= len {
        Err(Error::index_error(format!("index {i} out of range for length {len}")))
    } else {
        Ok(resolved as usize)
    }
}

pub fn index_set(target: &Value, index: &Value, value: Value, limits: SizeLimits) -> Result<()> {
    match target {
        Value::List(l) => {
            let len = l.borrow().len();
            let i = resolve_index(index, len)?;
            l.borrow_mut()[i] = value;
            Ok(())
        }
        Value::Map(m) => {
            let grows = m.borrow().get(index).is_none();
            if grows {
                check_map_len(m.borrow().len() + 1, limits)?;
            }
            m.borrow_mut().set(index.clone(), value);
            Ok(())
        }
        _ => Err(Error::type_error(format!("cannot index-assign into {}", target.type_name()))),
    }
}

/// The slicing helper referenced by C4's "slicing" responsibility: Python-
/// style half-open `[start, end)` bounds with negative indices allowed and
/// out-of-range bounds clamped rather than erroring.
pub fn slice(target: &Value, start: Option<f64>, end: Option<f64>) -> Result<Value> {
    fn clamp_bound(v: Option<f64>, len: usize, default: usize) -> usize {
        match v {
            None => default,
            Some(n) => {
                let i = n.floor() as i64;
                let resolved = if i < 0 { i + len as i64 } else { i };
                resolved.clamp(0, len as i64) as usize
            }
        }
    }
    match target {
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len();
            let start = clamp_bound(start, len, 0);
            let end = clamp_bound(end, len, len).max(start);
            Ok(Value::string(chars[start..end].iter().collect::<String>()))
        }
        Value::List(l) => {
            let l = l.borrow();
            let len = l.len();
            let start = clamp_bound(start, len, 0);
            let end = clamp_bound(end, len, len).max(start);
            Ok(Value::list(l[start..end].to_vec()))
        }
        _ => Err(Error::type_error(format!("cannot slice {}", target.type_name()))),
    }
}

pub fn length_of(target: &Value) -> Result<Value> {
    match target {
        Value::String(s) => Ok(Value::Number(s.chars().count() as f64)),
        Value::List(l) => Ok(Value::Number(l.borrow().len() as f64)),
        Value::Map(m) => Ok(Value::Number(m.borrow().len() as f64)),
        _ => Err(Error::type_error(format!("cannot take length of {}", target.type_name()))),
    }
}
