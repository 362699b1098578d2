//! Runtime values of the strategy interpreter.
//!
//! Containers are reference counted and charge their footprint to the
//! execution's `MemoryMeter`. Dropping a container hands its children to a
//! per-thread queue so that freeing a deeply nested structure never recurses
//! on the host stack. The `Heap` remembers every mutable container so the
//! interpreter can break reference cycles when an execution ends.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::rc::{Rc, Weak};

use chrono::{Datelike, NaiveDate};
use indexmap::IndexMap;

use super::ast::FunctionDef;
use super::interpreter::{Interpreter, Scope};
use crate::domain::error::{ExecutionError, ExecutionErrorKind};
use crate::domain::limits::MemoryMeter;

/// Bytes charged per list/tuple slot.
pub const SLOT_BYTES: usize = std::mem::size_of::<Value>();
/// Fixed cost of any container.
pub const CONTAINER_OVERHEAD: usize = 64;
/// Bytes charged per dict entry.
pub const ENTRY_BYTES: usize = std::mem::size_of::<HashKey>() + 2 * SLOT_BYTES + 16;
/// Strings shorter than this are not metered.
pub const METERED_STRING_BYTES: usize = 256;
/// Nesting beyond which rendering, comparison and hashing give up.
pub const MAX_VALUE_DEPTH: usize = 200;

const RENDER_CHECK_BYTES: usize = 64 * 1024;
const SHORT_REPR_CHARS: usize = 120;

// ---- deferred drop ----

thread_local! {
    static GRAVEYARD: RefCell<Vec<Value>> = const { RefCell::new(Vec::new()) };
    static BURYING: Cell<bool> = const { Cell::new(false) };
}

/// Drop `values` iteratively. Nested drops triggered while the queue drains
/// append to it instead of recursing.
pub(crate) fn bury(values: Vec<Value>) {
    if !values.iter().any(Value::is_compound) {
        return;
    }
    if GRAVEYARD.try_with(|g| g.borrow_mut().extend(values)).is_err() {
        return;
    }
    if BURYING.try_with(|b| b.replace(true)) != Ok(false) {
        return;
    }
    while let Some(value) = GRAVEYARD.try_with(|g| g.borrow_mut().pop()).ok().flatten() {
        drop(value);
    }
    let _ = BURYING.try_with(|b| b.set(false));
}

// ---- strings ----

pub struct StrObj {
    text: Box<str>,
    meter: Option<Rc<MemoryMeter>>,
}

impl StrObj {
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl Deref for StrObj {
    type Target = str;

    fn deref(&self) -> &str {
        &self.text
    }
}

impl PartialEq for StrObj {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for StrObj {}

impl Hash for StrObj {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl std::fmt::Debug for StrObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.text)
    }
}

impl Drop for StrObj {
    fn drop(&mut self) {
        if let Some(meter) = &self.meter {
            meter.release(self.text.len());
        }
    }
}

// ---- lists and tuples ----

/// Backing store of both lists and tuples; tuples are never mutated.
pub struct ListObj {
    items: RefCell<Vec<Value>>,
    charged: Cell<usize>,
    meter: Rc<MemoryMeter>,
}

impl ListObj {
    pub fn borrow(&self) -> Ref<'_, Vec<Value>> {
        self.items.borrow()
    }

    /// Callers that grow the list must call `sync` afterwards.
    pub fn borrow_mut(&self) -> RefMut<'_, Vec<Value>> {
        self.items.borrow_mut()
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.borrow().get(index).cloned()
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.items.borrow().clone()
    }

    pub fn push(&self, value: Value) -> Result<(), ExecutionError> {
        self.meter.charge(SLOT_BYTES)?;
        self.charged.set(self.charged.get() + SLOT_BYTES);
        self.items.borrow_mut().push(value);
        Ok(())
    }

    /// Replace the contents, freeing the old items outside the borrow.
    pub fn replace(&self, items: Vec<Value>) -> Result<(), ExecutionError> {
        let old = std::mem::replace(&mut *self.items.borrow_mut(), items);
        bury(old);
        self.sync()
    }

    /// Bring the charged footprint in line with the current length.
    pub fn sync(&self) -> Result<(), ExecutionError> {
        let wanted = CONTAINER_OVERHEAD + self.items.borrow().len() * SLOT_BYTES;
        let charged = self.charged.get();
        if wanted > charged {
            self.meter.charge(wanted - charged)?;
        } else {
            self.meter.release(charged - wanted);
        }
        self.charged.set(wanted);
        Ok(())
    }
}

impl Drop for ListObj {
    fn drop(&mut self) {
        self.meter.release(self.charged.get());
        bury(std::mem::take(self.items.get_mut()));
    }
}

// ---- dicts ----

/// Hashable projection of a value. Numbers that compare equal share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(Rc<StrObj>),
    Tuple(Vec<HashKey>),
    Date(NaiveDate),
    Type(&'static str),
}

pub struct DictObj {
    entries: RefCell<IndexMap<HashKey, (Value, Value)>>,
    charged: Cell<usize>,
    meter: Rc<MemoryMeter>,
}

impl DictObj {
    pub fn borrow(&self) -> Ref<'_, IndexMap<HashKey, (Value, Value)>> {
        self.entries.borrow()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn get(&self, key: &Value) -> Result<Option<Value>, Fault> {
        let hashed = key.hash_key()?;
        Ok(self.entries.borrow().get(&hashed).map(|(_, v)| v.clone()))
    }

    pub fn get_str(&self, key: &str) -> Option<Value> {
        self.entries
            .borrow()
            .iter()
            .find(|(k, _)| matches!(k, HashKey::Str(s) if s.as_str() == key))
            .map(|(_, (_, v))| v.clone())
    }

    pub fn contains(&self, key: &Value) -> Result<bool, Fault> {
        let hashed = key.hash_key()?;
        Ok(self.entries.borrow().contains_key(&hashed))
    }

    pub fn insert(&self, key: Value, value: Value) -> Result<(), Fault> {
        let hashed = key.hash_key()?;
        let old = self.entries.borrow_mut().insert(hashed, (key, value));
        drop(old);
        self.sync()?;
        Ok(())
    }

    pub fn set_str(&self, key: &str, value: Value) -> Result<(), Fault> {
        self.insert(Value::str(key), value)
    }

    pub fn remove(&self, key: &Value) -> Result<Option<Value>, Fault> {
        let hashed = key.hash_key()?;
        let removed = self.entries.borrow_mut().shift_remove(&hashed);
        self.sync()?;
        Ok(removed.map(|(_, v)| v))
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.borrow().values().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.borrow().values().map(|(_, v)| v.clone()).collect()
    }

    pub fn items(&self) -> Vec<(Value, Value)> {
        self.entries.borrow().values().cloned().collect()
    }

    pub fn clear(&self) -> Result<(), ExecutionError> {
        let old = std::mem::take(&mut *self.entries.borrow_mut());
        bury(old.into_values().flat_map(|(k, v)| [k, v]).collect());
        self.sync()
    }

    pub fn sync(&self) -> Result<(), ExecutionError> {
        let wanted = CONTAINER_OVERHEAD + self.entries.borrow().len() * ENTRY_BYTES;
        let charged = self.charged.get();
        if wanted > charged {
            self.meter.charge(wanted - charged)?;
        } else {
            self.meter.release(charged - wanted);
        }
        self.charged.set(wanted);
        Ok(())
    }
}

impl Drop for DictObj {
    fn drop(&mut self) {
        self.meter.release(self.charged.get());
        let entries = std::mem::take(self.entries.get_mut());
        bury(entries.into_values().flat_map(|(k, v)| [k, v]).collect());
    }
}

// ---- callables and other objects ----

pub struct FunctionObj {
    pub def: Rc<FunctionDef>,
    /// Evaluated defaults, aligned with the trailing parameters that have them.
    pub defaults: Vec<Value>,
    /// Enclosing function scope; `None` for module-level functions.
    pub closure: Option<Rc<Scope>>,
}

impl Drop for FunctionObj {
    fn drop(&mut self) {
        bury(std::mem::take(&mut self.defaults));
    }
}

pub type NativeCall = fn(&mut Interpreter, Args) -> Result<Value, Fault>;

pub struct NativeFn {
    pub name: &'static str,
    pub call: NativeCall,
}

pub struct BoundMethod {
    pub receiver: Value,
    pub name: &'static str,
}

pub struct ModuleObj {
    pub name: &'static str,
    pub members: IndexMap<&'static str, Value>,
}

#[derive(Debug)]
pub struct ExceptionObj {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeObj {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeObj {
    pub fn len(&self) -> usize {
        let (start, stop, step) = (
            i128::from(self.start),
            i128::from(self.stop),
            i128::from(self.step),
        );
        let span = if step > 0 {
            (stop - start + step - 1) / step
        } else {
            (start - stop - step - 1) / -step
        };
        usize::try_from(span.max(0)).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let offset = i128::from(self.step) * index as i128;
        i64::try_from(i128::from(self.start) + offset).ok()
    }
}

// ---- exception hierarchy ----

/// Built-in exception classes and their parents.
pub const EXCEPTION_TYPES: &[(&str, Option<&str>)] = &[
    ("Exception", None),
    ("ArithmeticError", Some("Exception")),
    ("ZeroDivisionError", Some("ArithmeticError")),
    ("OverflowError", Some("ArithmeticError")),
    ("LookupError", Some("Exception")),
    ("KeyError", Some("LookupError")),
    ("IndexError", Some("LookupError")),
    ("ValueError", Some("Exception")),
    ("StatisticsError", Some("ValueError")),
    ("TypeError", Some("Exception")),
    ("RuntimeError", Some("Exception")),
    ("AssertionError", Some("Exception")),
    ("NameError", Some("Exception")),
    ("UnboundLocalError", Some("NameError")),
    ("AttributeError", Some("Exception")),
    ("ImportError", Some("Exception")),
];

pub fn exception_type(name: &str) -> Option<&'static str> {
    EXCEPTION_TYPES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(n, _)| *n)
}

/// Whether an exception of class `kind` is caught by handler class `handler`.
pub fn exception_matches(kind: &str, handler: &str) -> bool {
    let mut current = Some(kind);
    while let Some(name) = current {
        if name == handler {
            return true;
        }
        current = EXCEPTION_TYPES
            .iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, parent)| *parent);
    }
    false
}

// ---- faults ----

/// Abnormal completion of script code.
///
/// `Raised` is an ordinary script exception that `try`/`except` may catch.
/// `Fatal` ends the execution unconditionally: resource breaches and
/// interpreter failures are never visible to the script.
#[derive(Debug)]
pub enum Fault {
    Raised {
        exception: Rc<ExceptionObj>,
        line: Option<usize>,
    },
    Fatal(ExecutionError),
}

impl Fault {
    pub fn raise(kind: &'static str, message: impl Into<String>) -> Self {
        Fault::Raised {
            exception: Rc::new(ExceptionObj {
                kind,
                message: message.into(),
            }),
            line: None,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Fault::raise("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Fault::raise("ValueError", message)
    }

    pub fn with_line(self, at: usize) -> Self {
        match self {
            Fault::Raised { exception, line } => Fault::Raised {
                exception,
                line: line.or(Some(at)),
            },
            Fault::Fatal(err) => Fault::Fatal(err.with_line(at)),
        }
    }

    pub fn into_execution_error(self) -> ExecutionError {
        match self {
            Fault::Raised { exception, line } => {
                let message = if exception.message.is_empty() {
                    exception.kind.to_string()
                } else {
                    format!("{}: {}", exception.kind, exception.message)
                };
                let err = ExecutionError::runtime(message);
                match line {
                    Some(line) => err.with_line(line),
                    None => err,
                }
            }
            Fault::Fatal(err) => err,
        }
    }
}

impl From<ExecutionError> for Fault {
    fn from(err: ExecutionError) -> Self {
        Fault::Fatal(err)
    }
}

// ---- call arguments ----

#[derive(Default)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
}

impl Args {
    pub fn new(positional: Vec<Value>) -> Self {
        Args {
            positional,
            keywords: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty()
    }

    /// Positional arity check; keywords are checked by `finish`.
    pub fn expect(&self, name: &str, min: usize, max: usize) -> Result<(), Fault> {
        let given = self.positional.len();
        if given >= min && given <= max {
            return Ok(());
        }
        let expected = if min == max {
            format!("exactly {min}")
        } else if given < min {
            format!("at least {min}")
        } else {
            format!("at most {max}")
        };
        let noun = if min == max && min == 1 { "argument" } else { "arguments" };
        Err(Fault::type_error(format!(
            "{name}() takes {expected} {noun} ({given} given)"
        )))
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn take_keyword(&mut self, name: &str) -> Option<Value> {
        let index = self.keywords.iter().position(|(k, _)| k == name)?;
        Some(self.keywords.remove(index).1)
    }

    /// Positional `index` or keyword `name`, whichever was given.
    pub fn take(&mut self, index: usize, name: &str) -> Option<Value> {
        let keyword = self.take_keyword(name);
        match self.positional.get(index) {
            Some(value) => Some(value.clone()),
            None => keyword,
        }
    }

    /// Fail on keywords nobody consumed.
    pub fn finish(&self, name: &str) -> Result<(), Fault> {
        match self.keywords.first() {
            Some((key, _)) => Err(Fault::type_error(format!(
                "{name}() got an unexpected keyword argument '{key}'"
            ))),
            None => Ok(()),
        }
    }
}

// ---- values ----

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<StrObj>),
    List(Rc<ListObj>),
    Tuple(Rc<ListObj>),
    Dict(Rc<DictObj>),
    Range(RangeObj),
    Date(NaiveDate),
    Function(Rc<FunctionObj>),
    Native(&'static NativeFn),
    BoundMethod(Rc<BoundMethod>),
    Module(Rc<ModuleObj>),
    ExceptionType(&'static str),
    Exception(Rc<ExceptionObj>),
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.short_repr())
    }
}

/// Numeric view of a value; bools count as ints.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn to_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

impl Value {
    /// Unmetered string; for short or static text.
    pub fn str(text: &str) -> Value {
        Value::Str(Rc::new(StrObj {
            text: text.into(),
            meter: None,
        }))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Range(_) => "range",
            Value::Date(_) => "date",
            Value::Function(_) => "function",
            Value::Native(_) => "builtin_function_or_method",
            Value::BoundMethod(_) => "method",
            Value::Module(_) => "module",
            Value::ExceptionType(_) => "type",
            Value::Exception(e) => e.kind,
        }
    }

    /// Whether dropping this value may cascade into other values.
    pub fn is_compound(&self) -> bool {
        matches!(
            self,
            Value::List(_)
                | Value::Tuple(_)
                | Value::Dict(_)
                | Value::Function(_)
                | Value::BoundMethod(_)
                | Value::Module(_)
        )
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) | Value::Tuple(l) => !l.is_empty(),
            Value::Dict(d) => !d.is_empty(),
            Value::Range(r) => !r.is_empty(),
            _ => true,
        }
    }

    pub fn number(&self) -> Option<Number> {
        match self {
            Value::Bool(b) => Some(Number::Int(i64::from(*b))),
            Value::Int(i) => Some(Number::Int(*i)),
            Value::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.number().map(Number::to_f64)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn expect_f64(&self, context: &str) -> Result<f64, Fault> {
        self.as_f64().ok_or_else(|| {
            Fault::type_error(format!(
                "{context}: must be a real number, not {}",
                self.type_name()
            ))
        })
    }

    pub fn expect_int(&self, context: &str) -> Result<i64, Fault> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(i64::from(*b)),
            _ => Err(Fault::type_error(format!(
                "{context}: expected an integer, not {}",
                self.type_name()
            ))),
        }
    }

    pub fn expect_str(&self, context: &str) -> Result<&str, Fault> {
        self.as_str().ok_or_else(|| {
            Fault::type_error(format!(
                "{context}: expected a string, not {}",
                self.type_name()
            ))
        })
    }

    pub fn hash_key(&self) -> Result<HashKey, Fault> {
        self.hash_key_at(0)
    }

    fn hash_key_at(&self, depth: usize) -> Result<HashKey, Fault> {
        if depth > MAX_VALUE_DEPTH {
            return Err(too_deep("hash"));
        }
        Ok(match self {
            Value::None => HashKey::None,
            Value::Bool(b) => HashKey::Int(i64::from(*b)),
            Value::Int(i) => HashKey::Int(*i),
            Value::Float(f) => match float_as_int(*f) {
                Some(i) => HashKey::Int(i),
                None => HashKey::Float(f.to_bits()),
            },
            Value::Str(s) => HashKey::Str(Rc::clone(s)),
            Value::Tuple(items) => HashKey::Tuple(
                items
                    .borrow()
                    .iter()
                    .map(|v| v.hash_key_at(depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Date(d) => HashKey::Date(*d),
            Value::ExceptionType(name) => HashKey::Type(name),
            other => {
                return Err(Fault::type_error(format!(
                    "unhashable type: '{}'",
                    other.type_name()
                )));
            }
        })
    }

    /// `is` identity.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => std::ptr::eq(*a, *b),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (Value::Date(a), Value::Date(b)) => a == b,
            _ => false,
        }
    }

    /// `repr()` truncated for use inside error messages.
    pub fn short_repr(&self) -> String {
        let mut renderer = Renderer::new(SHORT_REPR_CHARS, None);
        // Unmetered rendering cannot fail.
        let _ = renderer.value(self, true, 0);
        renderer.finish()
    }

    pub fn repr(&self, meter: &MemoryMeter) -> Result<String, ExecutionError> {
        let mut renderer = Renderer::new(usize::MAX, Some(meter));
        renderer.value(self, true, 0)?;
        Ok(renderer.finish())
    }

    pub fn display(&self, meter: &MemoryMeter) -> Result<String, ExecutionError> {
        if let Value::Str(s) = self {
            return Ok(s.as_str().to_string());
        }
        let mut renderer = Renderer::new(usize::MAX, Some(meter));
        renderer.value(self, false, 0)?;
        Ok(renderer.finish())
    }

    /// `str()` cut off near `cap` bytes, for log lines.
    pub fn display_capped(&self, cap: usize) -> String {
        let mut renderer = Renderer::new(cap, None);
        let _ = renderer.value(self, false, 0);
        renderer.finish()
    }
}

fn too_deep(what: &str) -> Fault {
    Fault::Fatal(ExecutionError::new(
        ExecutionErrorKind::RecursionLimit,
        format!("{what} of a value nested more than {MAX_VALUE_DEPTH} levels deep"),
    ))
}

/// `f` as an exact i64, when it has no fractional part and fits.
pub fn float_as_int(f: f64) -> Option<i64> {
    if f.fract() == 0.0 && f >= -9.223_372_036_854_776e18 && f < 9.223_372_036_854_776e18 {
        Some(f as i64)
    } else {
        None
    }
}

// ---- heap ----

/// Contents a container can drop to break reference cycles.
pub trait Sweep {
    fn clear_contents(&self);
}

impl Sweep for ListObj {
    fn clear_contents(&self) {
        let old = std::mem::take(&mut *self.items.borrow_mut());
        bury(old);
    }
}

impl Sweep for DictObj {
    fn clear_contents(&self) {
        let old = std::mem::take(&mut *self.entries.borrow_mut());
        bury(old.into_values().flat_map(|(k, v)| [k, v]).collect());
    }
}

/// Allocation front door for one execution.
pub struct Heap {
    meter: Rc<MemoryMeter>,
    tracked: RefCell<Vec<Weak<dyn Sweep>>>,
    prune_at: Cell<usize>,
}

impl Heap {
    pub fn new(meter: Rc<MemoryMeter>) -> Self {
        Heap {
            meter,
            tracked: RefCell::new(Vec::new()),
            prune_at: Cell::new(1024),
        }
    }

    pub fn meter(&self) -> &MemoryMeter {
        &self.meter
    }

    /// Fail before allocating `bytes` that would not fit.
    pub fn ensure_fits(&self, bytes: usize) -> Result<(), ExecutionError> {
        self.meter.ensure_fits(bytes)
    }

    pub fn track(&self, object: Weak<dyn Sweep>) {
        let mut tracked = self.tracked.borrow_mut();
        tracked.push(object);
        if tracked.len() >= self.prune_at.get() {
            tracked.retain(|w| w.strong_count() > 0);
            self.prune_at.set((tracked.len() * 2).max(1024));
        }
    }

    fn seq(&self, items: Vec<Value>) -> Result<Rc<ListObj>, ExecutionError> {
        let bytes = CONTAINER_OVERHEAD + items.len() * SLOT_BYTES;
        if let Err(err) = self.meter.charge(bytes) {
            bury(items);
            return Err(err);
        }
        Ok(Rc::new(ListObj {
            items: RefCell::new(items),
            charged: Cell::new(bytes),
            meter: Rc::clone(&self.meter),
        }))
    }

    pub fn new_list(&self, items: Vec<Value>) -> Result<Rc<ListObj>, ExecutionError> {
        let list = self.seq(items)?;
        let weak: Weak<dyn Sweep> = Rc::downgrade(&list) as Weak<dyn Sweep>;
        self.track(weak);
        Ok(list)
    }

    pub fn list(&self, items: Vec<Value>) -> Result<Value, ExecutionError> {
        Ok(Value::List(self.new_list(items)?))
    }

    pub fn tuple(&self, items: Vec<Value>) -> Result<Value, ExecutionError> {
        Ok(Value::Tuple(self.seq(items)?))
    }

    pub fn new_dict(&self) -> Result<Rc<DictObj>, ExecutionError> {
        self.meter.charge(CONTAINER_OVERHEAD)?;
        let dict = Rc::new(DictObj {
            entries: RefCell::new(IndexMap::new()),
            charged: Cell::new(CONTAINER_OVERHEAD),
            meter: Rc::clone(&self.meter),
        });
        let weak: Weak<dyn Sweep> = Rc::downgrade(&dict) as Weak<dyn Sweep>;
        self.track(weak);
        Ok(dict)
    }

    pub fn string(&self, text: String) -> Result<Value, ExecutionError> {
        if text.len() < METERED_STRING_BYTES {
            return Ok(Value::str(&text));
        }
        self.meter.charge(text.len())?;
        Ok(Value::Str(Rc::new(StrObj {
            text: text.into_boxed_str(),
            meter: Some(Rc::clone(&self.meter)),
        })))
    }

    pub fn float_list(&self, values: &[f64]) -> Result<Value, ExecutionError> {
        self.ensure_fits(values.len() * SLOT_BYTES)?;
        self.list(values.iter().map(|v| Value::Float(*v)).collect())
    }

    /// Clear every live container so reference cycles can be freed.
    pub fn sweep(&self) {
        let tracked = std::mem::take(&mut *self.tracked.borrow_mut());
        for object in tracked.iter().filter_map(Weak::upgrade) {
            object.clear_contents();
        }
    }
}

// ---- rendering ----

fn write_float(out: &mut String, x: f64) {
    if x.is_nan() {
        out.push_str("nan");
    } else if x.is_infinite() {
        out.push_str(if x > 0.0 { "inf" } else { "-inf" });
    } else if x == 0.0 {
        out.push_str(if x.is_sign_negative() { "-0.0" } else { "0.0" });
    } else if (1e-4..1e16).contains(&x.abs()) {
        let start = out.len();
        let _ = write!(out, "{x}");
        if !out[start..].contains('.') {
            out.push_str(".0");
        }
    } else {
        let text = format!("{x:e}");
        let (mantissa, exponent) = text.split_once('e').unwrap_or((&text, "0"));
        let exponent: i32 = exponent.parse().unwrap_or(0);
        let sign = if exponent < 0 { '-' } else { '+' };
        let _ = write!(out, "{mantissa}e{sign}{:02}", exponent.abs());
    }
}

/// Python-style float text: `1.0`, `0.1`, `1e-05`, `inf`.
pub fn format_float(x: f64) -> String {
    let mut out = String::new();
    write_float(&mut out, x);
    out
}

pub fn quote_str(out: &mut String, text: &str) {
    let quote = if text.contains('\'') && !text.contains('"') { '"' } else { '\'' };
    out.push(quote);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
}

struct Renderer<'a> {
    out: String,
    cap: usize,
    meter: Option<&'a MemoryMeter>,
    checked: usize,
    active: Vec<*const ()>,
}

impl<'a> Renderer<'a> {
    fn new(cap: usize, meter: Option<&'a MemoryMeter>) -> Self {
        Renderer {
            out: String::new(),
            cap,
            meter,
            checked: 0,
            active: Vec::new(),
        }
    }

    fn full(&self) -> bool {
        self.out.len() >= self.cap
    }

    fn push(&mut self, text: &str) -> Result<(), ExecutionError> {
        if self.full() {
            return Ok(());
        }
        self.out.push_str(text);
        self.check()
    }

    fn check(&mut self) -> Result<(), ExecutionError> {
        if self.out.len() - self.checked > RENDER_CHECK_BYTES {
            if let Some(meter) = self.meter {
                meter.ensure_fits(self.out.len())?;
            }
            self.checked = self.out.len();
        }
        Ok(())
    }

    fn finish(mut self) -> String {
        if self.full() && self.cap != usize::MAX {
            self.out.push_str("...");
        }
        self.out
    }

    fn sequence(
        &mut self,
        id: *const (),
        items: &[Value],
        open: &str,
        close: &str,
        depth: usize,
    ) -> Result<(), ExecutionError> {
        if depth >= MAX_VALUE_DEPTH || self.active.contains(&id) {
            return self.push(&format!("{open}...{close}"));
        }
        self.active.push(id);
        self.push(open)?;
        for (i, item) in items.iter().enumerate() {
            if self.full() {
                break;
            }
            if i > 0 {
                self.push(", ")?;
            }
            self.value(item, true, depth + 1)?;
        }
        if open == "(" && items.len() == 1 {
            self.push(",")?;
        }
        self.push(close)?;
        self.active.pop();
        Ok(())
    }

    fn value(&mut self, value: &Value, repr: bool, depth: usize) -> Result<(), ExecutionError> {
        if self.full() {
            return Ok(());
        }
        match value {
            Value::None => self.push("None"),
            Value::Bool(b) => self.push(if *b { "True" } else { "False" }),
            Value::Int(i) => {
                let _ = write!(self.out, "{i}");
                Ok(())
            }
            Value::Float(f) => {
                write_float(&mut self.out, *f);
                Ok(())
            }
            Value::Str(s) if repr => {
                quote_str(&mut self.out, s);
                self.check()
            }
            Value::Str(s) => self.push(s),
            Value::List(items) => {
                let id = Rc::as_ptr(items) as *const ();
                self.sequence(id, &items.borrow(), "[", "]", depth)
            }
            Value::Tuple(items) => {
                let id = Rc::as_ptr(items) as *const ();
                self.sequence(id, &items.borrow(), "(", ")", depth)
            }
            Value::Dict(dict) => {
                let id = Rc::as_ptr(dict) as *const ();
                if depth >= MAX_VALUE_DEPTH || self.active.contains(&id) {
                    return self.push("{...}");
                }
                self.active.push(id);
                self.push("{")?;
                for (i, (key, value)) in dict.borrow().values().enumerate() {
                    if self.full() {
                        break;
                    }
                    if i > 0 {
                        self.push(", ")?;
                    }
                    self.value(key, true, depth + 1)?;
                    self.push(": ")?;
                    self.value(value, true, depth + 1)?;
                }
                self.push("}")?;
                self.active.pop();
                Ok(())
            }
            Value::Range(r) => {
                if r.step == 1 {
                    self.push(&format!("range({}, {})", r.start, r.stop))
                } else {
                    self.push(&format!("range({}, {}, {})", r.start, r.stop, r.step))
                }
            }
            Value::Date(d) if repr => self.push(&format!(
                "datetime.date({}, {}, {})",
                d.year(),
                d.month(),
                d.day()
            )),
            Value::Date(d) => self.push(&d.format("%Y-%m-%d").to_string()),
            Value::Function(f) => self.push(&format!("<function {}>", f.def.name)),
            Value::Native(n) => self.push(&format!("<built-in function {}>", n.name)),
            Value::BoundMethod(m) => self.push(&format!(
                "<built-in method {} of {} object>",
                m.name,
                m.receiver.type_name()
            )),
            Value::Module(m) => self.push(&format!("<module '{}'>", m.name)),
            Value::ExceptionType(name) => self.push(&format!("<class '{name}'>")),
            Value::Exception(e) if repr => {
                let mut text = String::new();
                quote_str(&mut text, &e.message);
                self.push(&format!("{}({text})", e.kind))
            }
            Value::Exception(e) => self.push(&e.message),
        }
    }
}

// ---- equality and ordering ----

pub fn values_equal(a: &Value, b: &Value) -> Result<bool, Fault> {
    equal_at(a, b, 0)
}

fn number_equal(a: Number, b: Number) -> bool {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => x == y,
        (Number::Float(x), Number::Float(y)) => x == y,
        (Number::Int(i), Number::Float(f)) | (Number::Float(f), Number::Int(i)) => {
            float_as_int(f) == Some(i)
        }
    }
}

fn equal_at(a: &Value, b: &Value, depth: usize) -> Result<bool, Fault> {
    if depth > MAX_VALUE_DEPTH {
        return Err(too_deep("comparison"));
    }
    if let (Some(x), Some(y)) = (a.number(), b.number()) {
        return Ok(number_equal(x, y));
    }
    Ok(match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) | (Value::Tuple(x), Value::Tuple(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(true);
            }
            let (xs, ys) = (x.snapshot(), y.snapshot());
            if xs.len() != ys.len() {
                return Ok(false);
            }
            for (p, q) in xs.iter().zip(&ys) {
                if !equal_at(p, q, depth + 1)? {
                    return Ok(false);
                }
            }
            true
        }
        (Value::Dict(x), Value::Dict(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(true);
            }
            if x.len() != y.len() {
                return Ok(false);
            }
            for (key, value) in x.items() {
                match y.get(&key)? {
                    Some(other) if equal_at(&value, &other, depth + 1)? => {}
                    _ => return Ok(false),
                }
            }
            true
        }
        (Value::Range(x), Value::Range(y)) => {
            let (lx, ly) = (x.len(), y.len());
            lx == ly && (lx == 0 || (x.start == y.start && (lx == 1 || x.step == y.step)))
        }
        (Value::Date(x), Value::Date(y)) => x == y,
        (Value::BoundMethod(x), Value::BoundMethod(y)) => {
            x.name == y.name && x.receiver.is_same(&y.receiver)
        }
        _ => a.is_same(b),
    })
}

/// Ordering for `<`-style comparisons; `None` when unordered (NaN).
pub fn compare_values(a: &Value, b: &Value) -> Result<Option<Ordering>, Fault> {
    compare_at(a, b, 0, "<")
}

pub fn compare_with_op(a: &Value, b: &Value, op: &str) -> Result<Option<Ordering>, Fault> {
    compare_at(a, b, 0, op)
}

fn compare_at(a: &Value, b: &Value, depth: usize, op: &str) -> Result<Option<Ordering>, Fault> {
    if depth > MAX_VALUE_DEPTH {
        return Err(too_deep("comparison"));
    }
    if let (Some(x), Some(y)) = (a.number(), b.number()) {
        return Ok(match (x, y) {
            (Number::Int(p), Number::Int(q)) => Some(p.cmp(&q)),
            (p, q) => p.to_f64().partial_cmp(&q.to_f64()),
        });
    }
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(Some(x.as_str().cmp(y.as_str()))),
        (Value::Date(x), Value::Date(y)) => Ok(Some(x.cmp(y))),
        (Value::List(x), Value::List(y)) | (Value::Tuple(x), Value::Tuple(y)) => {
            let (xs, ys) = (x.snapshot(), y.snapshot());
            for (p, q) in xs.iter().zip(&ys) {
                if !equal_at(p, q, depth + 1)? {
                    return compare_at(p, q, depth + 1, op);
                }
            }
            Ok(Some(xs.len().cmp(&ys.len())))
        }
        _ => Err(Fault::type_error(format!(
            "'{op}' not supported between instances of '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

// ---- iteration ----

pub enum ValueIter {
    Range { next: i64, stop: i64, step: i64 },
    Seq { items: Rc<ListObj>, pos: usize },
    Snapshot(std::vec::IntoIter<Value>),
    Chars { text: Rc<StrObj>, pos: usize },
}

impl ValueIter {
    pub fn of(value: &Value) -> Result<Self, Fault> {
        Ok(match value {
            Value::Range(r) => ValueIter::Range {
                next: r.start,
                stop: r.stop,
                step: r.step,
            },
            Value::List(items) | Value::Tuple(items) => ValueIter::Seq {
                items: Rc::clone(items),
                pos: 0,
            },
            Value::Dict(dict) => ValueIter::Snapshot(dict.keys().into_iter()),
            Value::Str(text) => ValueIter::Chars {
                text: Rc::clone(text),
                pos: 0,
            },
            other => {
                return Err(Fault::type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )));
            }
        })
    }

    /// Items still to come, when cheaply known.
    pub fn remaining(&self) -> Option<usize> {
        match self {
            ValueIter::Range { next, stop, step } => Some(
                RangeObj {
                    start: *next,
                    stop: *stop,
                    step: *step,
                }
                .len(),
            ),
            ValueIter::Seq { items, pos } => Some(items.len().saturating_sub(*pos)),
            ValueIter::Snapshot(rest) => Some(rest.len()),
            ValueIter::Chars { .. } => None,
        }
    }
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::Range { next, stop, step } => {
                let more = if *step > 0 { *next < *stop } else { *next > *stop };
                if !more {
                    return None;
                }
                let current = *next;
                match next.checked_add(*step) {
                    Some(n) => *next = n,
                    None => *next = *stop,
                }
                Some(Value::Int(current))
            }
            ValueIter::Seq { items, pos } => {
                let item = items.get(*pos)?;
                *pos += 1;
                Some(item)
            }
            ValueIter::Snapshot(rest) => rest.next(),
            ValueIter::Chars { text, pos } => {
                let c = text.as_str()[*pos..].chars().next()?;
                *pos += c.len_utf8();
                let mut buf = [0u8; 4];
                Some(Value::str(c.encode_utf8(&mut buf)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(MemoryMeter::new(Some(1 << 20)))
    }

    #[test]
    fn float_formatting_matches_script_conventions() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(-2.5), "-2.5");
        assert_eq!(format_float(1e-5), "1e-05");
        assert_eq!(format_float(1.5e16), "1.5e+16");
        assert_eq!(format_float(f64::INFINITY), "inf");
        assert_eq!(format_float(f64::NAN), "nan");
    }

    #[test]
    fn repr_of_nested_containers() {
        let heap = heap();
        let inner = heap.tuple(vec![Value::Int(1)]).unwrap();
        let list = heap
            .list(vec![Value::str("a'b"), inner, Value::None, Value::Float(2.0)])
            .unwrap();
        assert_eq!(list.short_repr(), "[\"a'b\", (1,), None, 2.0]");
    }

    #[test]
    fn self_referencing_list_renders_ellipsis() {
        let heap = heap();
        let list = heap.new_list(vec![Value::Int(1)]).unwrap();
        list.push(Value::List(Rc::clone(&list))).unwrap();
        assert_eq!(Value::List(Rc::clone(&list)).short_repr(), "[1, [...]]");
        heap.sweep();
        assert!(list.is_empty());
    }

    #[test]
    fn numbers_that_compare_equal_share_a_dict_key() {
        let heap = heap();
        let dict = heap.new_dict().unwrap();
        dict.insert(Value::Int(1), Value::str("int")).unwrap();
        dict.insert(Value::Float(1.0), Value::str("float")).unwrap();
        dict.insert(Value::Bool(true), Value::str("bool")).unwrap();
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get(&Value::Int(1)).unwrap().unwrap().as_str(), Some("bool"));
    }

    #[test]
    fn lists_are_unhashable() {
        let heap = heap();
        let list = heap.list(Vec::new()).unwrap();
        match list.hash_key() {
            Err(Fault::Raised { exception, .. }) => {
                assert_eq!(exception.kind, "TypeError");
                assert!(exception.message.contains("unhashable"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn containers_charge_and_release_the_meter() {
        let meter = MemoryMeter::new(Some(1 << 20));
        let heap = Heap::new(Rc::clone(&meter));
        {
            let list = heap.new_list(Vec::new()).unwrap();
            for i in 0..100 {
                list.push(Value::Int(i)).unwrap();
            }
            assert_eq!(meter.used(), CONTAINER_OVERHEAD + 100 * SLOT_BYTES);
        }
        assert_eq!(meter.used(), 0);
    }

    #[test]
    fn oversized_list_is_refused() {
        let heap = Heap::new(MemoryMeter::new(Some(1024)));
        let err = heap.list(vec![Value::None; 1000]).unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::MemoryExceeded);
    }

    #[test]
    fn deeply_nested_lists_drop_without_overflow() {
        let heap = Heap::new(MemoryMeter::new(None));
        let mut value = heap.list(Vec::new()).unwrap();
        for _ in 0..200_000 {
            value = heap.list(vec![value]).unwrap();
        }
        drop(value);
    }

    #[test]
    fn mixed_numeric_equality_and_ordering() {
        assert!(values_equal(&Value::Int(2), &Value::Float(2.0)).unwrap());
        assert!(!values_equal(&Value::Int(2), &Value::str("2")).unwrap());
        assert_eq!(
            compare_values(&Value::Int(1), &Value::Float(1.5)).unwrap(),
            Some(Ordering::Less)
        );
        assert_eq!(compare_values(&Value::Float(f64::NAN), &Value::Int(1)).unwrap(), None);
        assert!(compare_values(&Value::Int(1), &Value::str("a")).is_err());
    }

    #[test]
    fn exception_hierarchy() {
        assert!(exception_matches("ZeroDivisionError", "ArithmeticError"));
        assert!(exception_matches("KeyError", "Exception"));
        assert!(!exception_matches("KeyError", "ValueError"));
    }

    #[test]
    fn range_length_and_iteration() {
        let r = RangeObj {
            start: 10,
            stop: 0,
            step: -3,
        };
        assert_eq!(r.len(), 4);
        let items: Vec<i64> = ValueIter::of(&Value::Range(r))
            .unwrap()
            .map(|v| v.expect_int("test").unwrap())
            .collect();
        assert_eq!(items, vec![10, 7, 4, 1]);
    }

    #[test]
    fn raised_fault_becomes_runtime_error_with_line() {
        let err = Fault::raise("ValueError", "bad window")
            .with_line(7)
            .into_execution_error();
        assert_eq!(err.kind, ExecutionErrorKind::Runtime);
        assert_eq!(err.line, Some(7));
        assert_eq!(err.message, "ValueError: bad window");
    }
}
