//! Dynamic values carried through promise chains.
//!
//! Settlement values, rejection reasons, handler arguments and foreign
//! thenables all travel as [`Value`]. Primitives and arrays compare
//! structurally; objects, functions, errors, promises and typed thenables
//! compare by identity, so the same cancellation error can be recognised at
//! every level of a chain.

use crate::promise::Promise;
use crate::thenable::Thenable;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Signature of every callable: `(this, args) -> Ok(return value) | Err(thrown value)`.
pub type NativeFn = dyn Fn(&Value, &[Value]) -> Result<Value, Value>;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(Rc<str>),
    Array(Rc<[Value]>),
    Object(Object),
    Function(Function),
    Error(Rc<ErrorValue>),
    Promise(Promise),
    Thenable(Rc<dyn Thenable>),
}

impl Value {
    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    pub fn array<I>(items: I) -> Value
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Value::Array(items.into_iter().map(Into::into).collect())
    }

    /// A plain `Error` with the given message.
    pub fn error(message: impl Into<String>) -> Value {
        Value::Error(Rc::new(ErrorValue::new(ErrorKind::Error, message)))
    }

    pub fn type_error(message: impl Into<String>) -> Value {
        Value::Error(Rc::new(ErrorValue::new(ErrorKind::TypeError, message)))
    }

    /// A fresh `CancellationError` (`name() == "cancel"`).
    pub fn cancellation(message: impl Into<String>) -> Value {
        Value::Error(Rc::new(ErrorValue::new(ErrorKind::Cancel, message)))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Value::Error(e) if e.kind() == ErrorKind::Cancel)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&Promise> {
        match self {
            Value::Promise(p) => Some(p),
            _ => None,
        }
    }

    /// Property read with accessor semantics. Non-objects have no properties.
    pub fn get(&self, key: &str) -> Result<Value, Value> {
        match self {
            Value::Object(obj) => obj.get(key),
            _ => Ok(Value::Undefined),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Error(_) => "error",
            Value::Promise(_) => "promise",
            Value::Thenable(_) => "thenable",
        }
    }

    /// JSON rendering used by the demo CLI. Accessor properties are skipped
    /// so that rendering never runs user code.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Undefined | Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n).map(Json::Number).unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.to_string()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(obj) => {
                let map = obj
                    .inner
                    .borrow()
                    .iter()
                    .filter_map(|(k, p)| match p {
                        Property::Data(v) => Some((k.clone(), v.to_json())),
                        Property::Accessor(_) => None,
                    })
                    .collect();
                Json::Object(map)
            }
            Value::Error(e) => serde_json::json!({ "name": e.name(), "message": e.message() }),
            Value::Function(_) | Value::Promise(_) | Value::Thenable(_) => Json::String(self.to_string()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Error(a), Value::Error(b)) => Rc::ptr_eq(a, b),
            (Value::Promise(a), Value::Promise(b)) => a.ptr_eq(b),
            (Value::Thenable(a), Value::Thenable(b)) => std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b)),
            _ => false,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else {
        format!("{n}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::String(s) => f.write_str(s),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    if !item.is_null_or_undefined() {
                        write!(f, "{item}")?;
                    }
                }
                Ok(())
            }
            Value::Object(_) => f.write_str("[object Object]"),
            Value::Function(_) => f.write_str("function () { [native code] }"),
            Value::Error(e) => write!(f, "{e}"),
            Value::Promise(_) => f.write_str("[object Promise]"),
            Value::Thenable(_) => f.write_str("[object Thenable]"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("Undefined"),
            Value::Null => f.write_str("Null"),
            Value::Boolean(b) => write!(f, "Boolean({b})"),
            Value::Number(n) => write!(f, "Number({})", format_number(*n)),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Array(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Object(obj) => write!(f, "{obj:?}"),
            Value::Function(func) => write!(f, "{func:?}"),
            Value::Error(e) => write!(f, "Error({e})"),
            Value::Promise(p) => write!(f, "{p:?}"),
            Value::Thenable(_) => f.write_str("Thenable"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items.into())
    }
}

impl From<Object> for Value {
    fn from(obj: Object) -> Self {
        Value::Object(obj)
    }
}

impl From<Function> for Value {
    fn from(func: Function) -> Self {
        Value::Function(func)
    }
}

impl From<ErrorValue> for Value {
    fn from(err: ErrorValue) -> Self {
        Value::Error(Rc::new(err))
    }
}

impl From<Promise> for Value {
    fn from(p: Promise) -> Self {
        Value::Promise(p)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Undefined, Into::into)
    }
}

/// A reference-counted native callable.
#[derive(Clone)]
pub struct Function {
    inner: Rc<NativeFn>,
}

impl Function {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value, Value> + 'static,
    {
        Function { inner: Rc::new(f) }
    }

    /// A callable that only looks at its first argument (missing arguments
    /// read as `Undefined`) and ignores `this`.
    pub fn unary<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, Value> + 'static,
    {
        Function::new(move |_this, args| f(args.first().cloned().unwrap_or_default()))
    }

    pub fn call(&self, this: &Value, args: &[Value]) -> Result<Value, Value> {
        (self.inner)(this, args)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.inner), Rc::as_ptr(&other.inner))
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({:p})", Rc::as_ptr(&self.inner) as *const ())
    }
}

#[derive(Clone)]
pub enum Property {
    Data(Value),
    Accessor(Function),
}

/// An ordered, shared property bag. Accessor properties run their getter
/// with the object as `this` on every read, which is how foreign thenables
/// can observe (or sabotage) reads of `then`.
#[derive(Clone, Default)]
pub struct Object {
    inner: Rc<RefCell<IndexMap<String, Property>>>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let obj = Object::new();
        for (k, v) in entries {
            obj.set(k, v);
        }
        obj
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.borrow_mut().insert(key.into(), Property::Data(value.into()));
    }

    pub fn define_getter(&self, key: impl Into<String>, getter: Function) {
        self.inner.borrow_mut().insert(key.into(), Property::Accessor(getter));
    }

    pub fn get(&self, key: &str) -> Result<Value, Value> {
        // The borrow must end before a getter runs: getters may touch this object.
        let prop = self.inner.borrow().get(key).cloned();
        match prop {
            None => Ok(Value::Undefined),
            Some(Property::Data(v)) => Ok(v),
            Some(Property::Accessor(getter)) => getter.call(&Value::Object(self.clone()), &[]),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.borrow().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.borrow().keys().cloned().collect()
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn as_ptr(&self) -> *const () {
        Rc::as_ptr(&self.inner).cast()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(props) = self.inner.try_borrow() else {
            return f.write_str("Object { <borrowed> }");
        };
        let mut map = f.debug_map();
        for (k, p) in props.iter() {
            match p {
                Property::Data(v) => map.entry(k, v),
                Property::Accessor(_) => map.entry(k, &"<getter>"),
            };
        }
        map.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    TypeError,
    /// Deliberate abandonment; see [`Promise::cancel`](crate::Promise::cancel).
    Cancel,
}

#[derive(Debug)]
pub struct ErrorValue {
    kind: ErrorKind,
    message: String,
}

impl ErrorValue {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ErrorValue {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::Cancel => "cancel",
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.name())
        } else {
            write!(f, "{}: {}", self.name(), self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn identity_for_reference_values() {
        let a = Value::error("boom");
        let b = Value::error("boom");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);

        let obj = Object::new();
        assert_eq!(Value::Object(obj.clone()), Value::Object(obj));
        assert_eq!(Value::array([1, 2]), Value::array([1, 2]));
    }

    #[test]
    fn getter_runs_on_every_read() {
        let reads = Rc::new(Cell::new(0));
        let obj = Object::new();
        let counter = reads.clone();
        obj.define_getter(
            "then",
            Function::new(move |_, _| {
                counter.set(counter.get() + 1);
                Ok(Value::Undefined)
            }),
        );
        obj.get("then").unwrap();
        obj.get("then").unwrap();
        assert_eq!(reads.get(), 2);
    }

    #[test]
    fn display_follows_script_conventions() {
        assert_eq!(Value::from(2.0).to_string(), "2");
        assert_eq!(Value::from(f64::NAN).to_string(), "NaN");
        assert_eq!(Value::array([Value::from(1), Value::Null, Value::from("x")]).to_string(), "1,,x");
        assert_eq!(Value::cancellation("m").to_string(), "cancel: m");
        assert_eq!(Value::cancellation("").to_string(), "cancel");
    }

    #[test]
    fn json_skips_accessors() {
        let obj = Object::from_entries([("fulfilled", Value::from(true)), ("value", Value::from(3))]);
        obj.define_getter("hidden", Function::new(|_, _| Err(Value::error("never"))));
        assert_eq!(Value::Object(obj).to_json(), serde_json::json!({ "fulfilled": true, "value": 3.0 }));
    }
}
