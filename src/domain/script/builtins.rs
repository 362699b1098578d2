//! Builtin functions, container methods and item access.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

use chrono::Datelike;

use super::ast::BinOp;
use super::interpreter::{Interpreter, SliceBounds, MAX_LOG_LINE_CHARS};
use super::ops;
use super::value::{
    compare_values, exception_matches, values_equal, Args, BoundMethod, DictObj,
    Fault, Heap, ListObj, NativeFn, RangeObj, Value, EXCEPTION_TYPES, SLOT_BYTES,
};

static BUILTINS: &[NativeFn] = &[
    NativeFn { name: "abs", call: builtin_abs },
    NativeFn { name: "all", call: builtin_all },
    NativeFn { name: "any", call: builtin_any },
    NativeFn { name: "bool", call: builtin_bool },
    NativeFn { name: "dict", call: builtin_dict },
    NativeFn { name: "divmod", call: builtin_divmod },
    NativeFn { name: "enumerate", call: builtin_enumerate },
    NativeFn { name: "filter", call: builtin_filter },
    NativeFn { name: "float", call: builtin_float },
    NativeFn { name: "int", call: builtin_int },
    NativeFn { name: "isinstance", call: builtin_isinstance },
    NativeFn { name: "len", call: builtin_len },
    NativeFn { name: "list", call: builtin_list },
    NativeFn { name: "map", call: builtin_map },
    NativeFn { name: "max", call: builtin_max },
    NativeFn { name: "min", call: builtin_min },
    NativeFn { name: "pow", call: builtin_pow },
    NativeFn { name: "print", call: builtin_print },
    NativeFn { name: "range", call: builtin_range },
    NativeFn { name: "repr", call: builtin_repr },
    NativeFn { name: "reversed", call: builtin_reversed },
    NativeFn { name: "round", call: builtin_round },
    NativeFn { name: "sorted", call: builtin_sorted },
    NativeFn { name: "str", call: builtin_str },
    NativeFn { name: "sum", call: builtin_sum },
    NativeFn { name: "tuple", call: builtin_tuple },
    NativeFn { name: "zip", call: builtin_zip },
];

/// Names visible in every script without an import.
pub fn table() -> HashMap<&'static str, Value> {
    let mut table: HashMap<&'static str, Value> =
        BUILTINS.iter().map(|native| (native.name, Value::Native(native))).collect();
    for &(name, _) in EXCEPTION_TYPES {
        table.insert(name, Value::ExceptionType(name));
    }
    table.insert("True", Value::Bool(true));
    table.insert("False", Value::Bool(false));
    table.insert("None", Value::None);
    table
}

// ---- shared helpers ----

fn index_error(what: &str) -> Fault {
    Fault::raise("IndexError", format!("{what} index out of range"))
}

fn index_arg(key: &Value, what: &str) -> Result<i64, Fault> {
    match key {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(Fault::type_error(format!(
            "{what} indices must be integers, not {}",
            other.type_name()
        ))),
    }
}

/// Resolve a possibly negative index against `len`.
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { index + len } else { index };
    if (0..len).contains(&index) {
        usize::try_from(index).ok()
    } else {
        None
    }
}

fn char_len(text: &str) -> usize {
    if text.is_ascii() {
        text.len()
    } else {
        text.chars().count()
    }
}

fn char_at(text: &str, index: usize) -> Option<&str> {
    if text.is_ascii() {
        return text.get(index..index + 1);
    }
    let (start, c) = text.char_indices().nth(index)?;
    text.get(start..start + c.len_utf8())
}

/// Sort `items`, comparing `keys` when given. Stable, like the script's
/// `sorted`.
fn sort_values(
    interp: &mut Interpreter,
    items: Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
) -> Result<Vec<Value>, Fault> {
    let mut pairs = Vec::with_capacity(items.len());
    for item in items {
        let sort_key = match key {
            Some(func) => interp.call(func, Args::new(vec![item.clone()]))?,
            None => item.clone(),
        };
        pairs.push((sort_key, item));
    }
    let mut failure = None;
    pairs.sort_by(|(a, _), (b, _)| {
        if failure.is_some() {
            return Ordering::Equal;
        }
        match compare_values(a, b) {
            Ok(ordering) => {
                let ordering = ordering.unwrap_or(Ordering::Equal);
                if reverse { ordering.reverse() } else { ordering }
            }
            Err(fault) => {
                failure = Some(fault);
                Ordering::Equal
            }
        }
    });
    match failure {
        Some(fault) => Err(fault),
        None => Ok(pairs.into_iter().map(|(_, item)| item).collect()),
    }
}

/// Optional callable keyword: absent and `None` both mean "not given".
fn callable_keyword(args: &mut Args, name: &str) -> Option<Value> {
    args.take_keyword(name).filter(|v| !matches!(v, Value::None))
}

fn pairs_into(interp: &mut Interpreter, dict: &DictObj, source: &Value) -> Result<(), Fault> {
    if let Value::Dict(other) = source {
        for (key, value) in other.items() {
            dict.insert(key, value)?;
        }
        return Ok(());
    }
    for (i, item) in interp.collect(source)?.into_iter().enumerate() {
        let pair = interp.collect(&item)?;
        let [key, value]: [Value; 2] = pair.try_into().map_err(|pair: Vec<Value>| {
            Fault::value_error(format!(
                "dictionary update sequence element #{i} has length {}; 2 is required",
                pair.len()
            ))
        })?;
        dict.insert(key, value)?;
    }
    Ok(())
}

// ---- builtin functions ----

fn builtin_abs(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("abs", 1, 1)?;
    args.finish("abs")?;
    match &args.positional[0] {
        Value::Int(i) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| Fault::raise("OverflowError", "integer overflow")),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(Fault::type_error(format!(
            "bad operand type for abs(): '{}'",
            other.type_name()
        ))),
    }
}

fn builtin_all(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("all", 1, 1)?;
    let mut result = true;
    interp.walk(&args.positional[0], |_, item| {
        result = item.truthy();
        Ok(result)
    })?;
    Ok(Value::Bool(result))
}

fn builtin_any(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("any", 1, 1)?;
    let mut result = false;
    interp.walk(&args.positional[0], |_, item| {
        result = item.truthy();
        Ok(!result)
    })?;
    Ok(Value::Bool(result))
}

fn builtin_bool(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("bool", 0, 1)?;
    Ok(Value::Bool(args.arg(0).is_some_and(Value::truthy)))
}

fn builtin_dict(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("dict", 0, 1)?;
    let dict = interp.heap().new_dict()?;
    if let Some(source) = args.arg(0) {
        pairs_into(interp, &dict, source)?;
    }
    for (key, value) in args.keywords {
        dict.set_str(&key, value)?;
    }
    Ok(Value::Dict(dict))
}

fn builtin_divmod(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("divmod", 2, 2)?;
    let (a, b) = (&args.positional[0], &args.positional[1]);
    let quotient = ops::binary(interp.heap(), BinOp::FloorDiv, a, b)?;
    let remainder = ops::binary(interp.heap(), BinOp::Mod, a, b)?;
    Ok(interp.heap().tuple(vec![quotient, remainder])?)
}

fn builtin_enumerate(interp: &mut Interpreter, mut args: Args) -> Result<Value, Fault> {
    let start = match args.take(1, "start") {
        Some(value) => value.expect_int("enumerate() start")?,
        None => 0,
    };
    args.expect("enumerate", 1, 2)?;
    args.finish("enumerate")?;
    let items = interp.collect(&args.positional[0])?;
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in (start..).zip(items) {
        out.push(interp.heap().tuple(vec![Value::Int(i), item])?);
    }
    Ok(interp.heap().list(out)?)
}

fn builtin_filter(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("filter", 2, 2)?;
    let func = args.positional[0].clone();
    let items = interp.collect(&args.positional[1])?;
    let mut out = Vec::new();
    for item in items {
        let keep = match &func {
            Value::None => item.truthy(),
            func => interp.call(func, Args::new(vec![item.clone()]))?.truthy(),
        };
        if keep {
            out.push(item);
        }
    }
    Ok(interp.heap().list(out)?)
}

fn parse_float(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let lowered = trimmed.to_ascii_lowercase();
    let unsigned = lowered.trim_start_matches(['+', '-']);
    if matches!(unsigned, "nan" | "inf" | "infinity") {
        let value = if unsigned == "nan" { f64::NAN } else { f64::INFINITY };
        return Some(if lowered.starts_with('-') { -value } else { value });
    }
    if trimmed.contains(|c: char| c.is_ascii_alphabetic() && c != 'e' && c != 'E') {
        return None;
    }
    trimmed.replace('_', "").parse().ok()
}

fn builtin_float(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("float", 0, 1)?;
    let Some(value) = args.arg(0) else {
        return Ok(Value::Float(0.0));
    };
    match value {
        Value::Str(text) => parse_float(text).map(Value::Float).ok_or_else(|| {
            Fault::value_error(format!("could not convert string to float: {}", value.short_repr()))
        }),
        other => other.expect_f64("float()").map(Value::Float),
    }
}

fn float_to_int(f: f64) -> Result<i64, Fault> {
    if f.is_nan() {
        return Err(Fault::value_error("cannot convert float NaN to integer"));
    }
    let truncated = f.trunc();
    if truncated.is_infinite() || truncated < -9.223_372_036_854_776e18 || truncated >= 9.223_372_036_854_776e18 {
        return Err(Fault::raise("OverflowError", "cannot convert float to integer"));
    }
    Ok(truncated as i64)
}

fn builtin_int(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("int", 0, 1)?;
    let Some(value) = args.arg(0) else {
        return Ok(Value::Int(0));
    };
    match value {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Float(f) => float_to_int(*f).map(Value::Int),
        Value::Str(text) => text
            .trim()
            .replace('_', "")
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| {
                Fault::value_error(format!(
                    "invalid literal for int() with base 10: {}",
                    value.short_repr()
                ))
            }),
        other => Err(Fault::type_error(format!(
            "int() argument must be a string or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn instance_of(object: &Value, class: &Value) -> Result<bool, Fault> {
    match class {
        Value::Native(native) => Ok(match native.name {
            "int" => matches!(object, Value::Int(_) | Value::Bool(_)),
            "float" => matches!(object, Value::Float(_)),
            "bool" => matches!(object, Value::Bool(_)),
            "str" => matches!(object, Value::Str(_)),
            "list" => matches!(object, Value::List(_)),
            "tuple" => matches!(object, Value::Tuple(_)),
            "dict" => matches!(object, Value::Dict(_)),
            "range" => matches!(object, Value::Range(_)),
            _ => return Err(Fault::type_error("isinstance() arg 2 must be a type or tuple of types")),
        }),
        Value::ExceptionType(name) => {
            Ok(matches!(object, Value::Exception(e) if exception_matches(e.kind, name)))
        }
        Value::Tuple(classes) => {
            for class in classes.snapshot() {
                if instance_of(object, &class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(Fault::type_error("isinstance() arg 2 must be a type or tuple of types")),
    }
}

fn builtin_isinstance(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("isinstance", 2, 2)?;
    instance_of(&args.positional[0], &args.positional[1]).map(Value::Bool)
}

fn builtin_len(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("len", 1, 1)?;
    let len = match &args.positional[0] {
        Value::Str(text) => char_len(text),
        Value::List(items) | Value::Tuple(items) => items.len(),
        Value::Dict(dict) => dict.len(),
        Value::Range(range) => range.len(),
        other => {
            return Err(Fault::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )));
        }
    };
    Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
}

fn builtin_list(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("list", 0, 1)?;
    let items = match args.arg(0) {
        Some(source) => interp.collect(source)?,
        None => Vec::new(),
    };
    Ok(interp.heap().list(items)?)
}

fn builtin_map(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("map", 2, usize::MAX)?;
    let func = args.positional[0].clone();
    let mut columns = Vec::with_capacity(args.len() - 1);
    for source in &args.positional[1..] {
        columns.push(interp.collect(source)?.into_iter());
    }
    let mut out = Vec::new();
    'rows: loop {
        let mut row = Vec::with_capacity(columns.len());
        for column in &mut columns {
            match column.next() {
                Some(item) => row.push(item),
                None => break 'rows,
            }
        }
        out.push(interp.call(&func, Args::new(row))?);
    }
    Ok(interp.heap().list(out)?)
}

fn extreme(interp: &mut Interpreter, mut args: Args, name: &str, wanted: Ordering) -> Result<Value, Fault> {
    let key = callable_keyword(&mut args, "key");
    let default = args.take_keyword("default");
    args.finish(name)?;
    args.expect(name, 1, usize::MAX)?;
    let mut best: Option<(Value, Value)> = None;
    let mut consider = |interp: &mut Interpreter, item: Value| -> Result<bool, Fault> {
        let item_key = match &key {
            Some(func) => interp.call(func, Args::new(vec![item.clone()]))?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((best_key, _)) => compare_values(&item_key, best_key)? == Some(wanted),
        };
        if replace {
            best = Some((item_key, item));
        }
        Ok(true)
    };
    if args.len() == 1 {
        interp.walk(&args.positional[0], &mut consider)?;
    } else {
        for item in args.positional {
            consider(interp, item)?;
        }
    }
    match (best, default) {
        (Some((_, item)), _) => Ok(item),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(Fault::value_error(format!("{name}() arg is an empty sequence"))),
    }
}

fn builtin_max(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    extreme(interp, args, "max", Ordering::Greater)
}

fn builtin_min(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    extreme(interp, args, "min", Ordering::Less)
}

fn builtin_pow(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("pow", 2, 2)?;
    ops::binary(interp.heap(), BinOp::Pow, &args.positional[0], &args.positional[1])
}

fn builtin_print(interp: &mut Interpreter, mut args: Args) -> Result<Value, Fault> {
    let sep = match args.take_keyword("sep") {
        None | Some(Value::None) => " ".to_string(),
        Some(value) => value.expect_str("print() sep")?.to_string(),
    };
    args.take_keyword("end");
    args.take_keyword("flush");
    args.finish("print")?;

    let mut line = String::new();
    for (i, value) in args.positional.iter().enumerate() {
        if i > 0 {
            line.push_str(&sep);
        }
        line.push_str(&value.display_capped(MAX_LOG_LINE_CHARS * 4));
        if line.len() > MAX_LOG_LINE_CHARS * 4 {
            break;
        }
    }
    interp.log(line);
    Ok(Value::None)
}

fn builtin_range(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("range", 1, 3)?;
    args.finish("range")?;
    let mut bounds = [0i64; 3];
    for (slot, value) in bounds.iter_mut().zip(&args.positional) {
        *slot = value.expect_int("range()")?;
    }
    let (start, stop, step) = match args.len() {
        1 => (0, bounds[0], 1),
        2 => (bounds[0], bounds[1], 1),
        _ => (bounds[0], bounds[1], bounds[2]),
    };
    if step == 0 {
        return Err(Fault::value_error("range() arg 3 must not be zero"));
    }
    Ok(Value::Range(RangeObj { start, stop, step }))
}

fn builtin_repr(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("repr", 1, 1)?;
    let text = args.positional[0].repr(interp.meter())?;
    Ok(interp.heap().string(text)?)
}

fn builtin_reversed(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("reversed", 1, 1)?;
    let mut items = interp.collect(&args.positional[0])?;
    items.reverse();
    Ok(interp.heap().list(items)?)
}

fn builtin_round(_: &mut Interpreter, mut args: Args) -> Result<Value, Fault> {
    let digits = args.take(1, "ndigits").filter(|v| !matches!(v, Value::None));
    args.expect("round", 1, 2)?;
    args.finish("round")?;
    let value = &args.positional[0];
    match (value, digits) {
        (Value::Int(_) | Value::Bool(_), _) => Ok(Value::Int(value.expect_int("round()")?)),
        (_, None) => float_to_int(value.expect_f64("round()")?.round_ties_even()).map(Value::Int),
        (_, Some(digits)) => {
            let x = value.expect_f64("round()")?;
            let digits = digits.expect_int("round() ndigits")?.clamp(-308, 308) as i32;
            let factor = 10f64.powi(digits);
            let scaled = x * factor;
            if !scaled.is_finite() || factor == 0.0 {
                return Ok(Value::Float(x));
            }
            Ok(Value::Float(scaled.round_ties_even() / factor))
        }
    }
}

fn builtin_sorted(interp: &mut Interpreter, mut args: Args) -> Result<Value, Fault> {
    let key = callable_keyword(&mut args, "key");
    let reverse = args.take_keyword("reverse").is_some_and(|v| v.truthy());
    args.expect("sorted", 1, 1)?;
    args.finish("sorted")?;
    let items = interp.collect(&args.positional[0])?;
    let sorted = sort_values(interp, items, key.as_ref(), reverse)?;
    Ok(interp.heap().list(sorted)?)
}

fn builtin_str(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("str", 0, 1)?;
    match args.arg(0) {
        None => Ok(Value::str("")),
        Some(value @ Value::Str(_)) => Ok(value.clone()),
        Some(value) => {
            let text = value.display(interp.meter())?;
            Ok(interp.heap().string(text)?)
        }
    }
}

fn builtin_sum(interp: &mut Interpreter, mut args: Args) -> Result<Value, Fault> {
    let start = args.take(1, "start").unwrap_or(Value::Int(0));
    args.expect("sum", 1, 2)?;
    args.finish("sum")?;
    let mut total = start;
    interp.walk(&args.positional[0], |interp, item| {
        total = ops::binary(interp.heap(), BinOp::Add, &total, &item)?;
        Ok(true)
    })?;
    Ok(total)
}

fn builtin_tuple(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("tuple", 0, 1)?;
    let items = match args.arg(0) {
        Some(Value::Tuple(items)) => return Ok(Value::Tuple(Rc::clone(items))),
        Some(source) => interp.collect(source)?,
        None => Vec::new(),
    };
    Ok(interp.heap().tuple(items)?)
}

fn builtin_zip(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.finish("zip")?;
    let mut columns = Vec::with_capacity(args.len());
    for source in &args.positional {
        columns.push(interp.collect(source)?.into_iter());
    }
    let mut out = Vec::new();
    if columns.is_empty() {
        return Ok(interp.heap().list(out)?);
    }
    'rows: loop {
        let mut row = Vec::with_capacity(columns.len());
        for column in &mut columns {
            match column.next() {
                Some(item) => row.push(item),
                None => break 'rows,
            }
        }
        out.push(interp.heap().tuple(row)?);
    }
    Ok(interp.heap().list(out)?)
}

// ---- attributes and methods ----

const LIST_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "index", "count", "remove", "sort", "reverse", "copy",
    "clear",
];
const TUPLE_METHODS: &[&str] = &["index", "count"];
const DICT_METHODS: &[&str] = &[
    "get", "keys", "values", "items", "pop", "update", "setdefault", "copy", "clear",
];
const STR_METHODS: &[&str] = &[
    "upper", "lower", "strip", "lstrip", "rstrip", "split", "join", "startswith", "endswith",
    "replace", "format", "find", "count",
];
const DATE_METHODS: &[&str] = &["weekday", "isoformat", "add_days"];

fn method_name(receiver: &Value, attr: &str) -> Option<&'static str> {
    let methods = match receiver {
        Value::List(_) => LIST_METHODS,
        Value::Tuple(_) => TUPLE_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Str(_) => STR_METHODS,
        Value::Date(_) => DATE_METHODS,
        _ => return None,
    };
    methods.iter().copied().find(|name| *name == attr)
}

fn no_attribute(object: &Value, attr: &str) -> Fault {
    Fault::raise(
        "AttributeError",
        format!("'{}' object has no attribute '{attr}'", object.type_name()),
    )
}

pub fn get_attribute(object: &Value, attr: &str) -> Result<Value, Fault> {
    match object {
        Value::Module(module) => {
            return module.members.get(attr).cloned().ok_or_else(|| {
                Fault::raise(
                    "AttributeError",
                    format!("module '{}' has no attribute '{attr}'", module.name),
                )
            });
        }
        Value::Date(date) => match attr {
            "year" => return Ok(Value::Int(i64::from(date.year()))),
            "month" => return Ok(Value::Int(i64::from(date.month()))),
            "day" => return Ok(Value::Int(i64::from(date.day()))),
            _ => {}
        },
        _ => {}
    }
    match method_name(object, attr) {
        Some(name) => Ok(Value::BoundMethod(Rc::new(BoundMethod {
            receiver: object.clone(),
            name,
        }))),
        None => Err(no_attribute(object, attr)),
    }
}

pub fn call_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &'static str,
    args: Args,
) -> Result<Value, Fault> {
    match receiver {
        Value::List(list) => list_method(interp, list, name, args),
        Value::Tuple(items) => sequence_search(name, &items.snapshot(), args, "tuple"),
        Value::Dict(dict) => dict_method(interp, dict, name, args),
        Value::Str(text) => str_method(interp, text.as_str(), name, args),
        Value::Date(date) => date_method(*date, name, args),
        other => Err(no_attribute(other, name)),
    }
}

fn sequence_search(name: &str, items: &[Value], args: Args, what: &str) -> Result<Value, Fault> {
    args.expect(name, 1, 1)?;
    let needle = &args.positional[0];
    match name {
        "index" => {
            for (i, item) in items.iter().enumerate() {
                if values_equal(item, needle)? {
                    return Ok(Value::Int(i as i64));
                }
            }
            Err(Fault::value_error(format!("{} is not in {what}", needle.short_repr())))
        }
        _ => {
            let mut count = 0;
            for item in items {
                if values_equal(item, needle)? {
                    count += 1;
                }
            }
            Ok(Value::Int(count))
        }
    }
}

fn list_method(
    interp: &mut Interpreter,
    list: &Rc<ListObj>,
    name: &'static str,
    mut args: Args,
) -> Result<Value, Fault> {
    match name {
        "append" => {
            args.expect("append", 1, 1)?;
            list.push(args.positional.swap_remove(0))?;
            Ok(Value::None)
        }
        "extend" => {
            args.expect("extend", 1, 1)?;
            let items = interp.collect(&args.positional[0])?;
            interp.heap().ensure_fits(items.len().saturating_mul(SLOT_BYTES))?;
            list.borrow_mut().extend(items);
            list.sync()?;
            Ok(Value::None)
        }
        "pop" => {
            args.expect("pop", 0, 1)?;
            let index = match args.arg(0) {
                Some(value) => value.expect_int("pop() index")?,
                None => -1,
            };
            if list.is_empty() {
                return Err(Fault::raise("IndexError", "pop from empty list"));
            }
            let pos = normalize_index(index, list.len())
                .ok_or_else(|| Fault::raise("IndexError", "pop index out of range"))?;
            let item = list.borrow_mut().remove(pos);
            list.sync()?;
            Ok(item)
        }
        "insert" => {
            args.expect("insert", 2, 2)?;
            let index = args.positional[0].expect_int("insert() index")?;
            let len = i64::try_from(list.len()).unwrap_or(i64::MAX);
            let pos = if index < 0 { (index + len).max(0) } else { index.min(len) };
            let item = args.positional.swap_remove(1);
            list.borrow_mut().insert(pos as usize, item);
            list.sync()?;
            Ok(Value::None)
        }
        "index" | "count" => sequence_search(name, &list.snapshot(), args, "list"),
        "remove" => {
            args.expect("remove", 1, 1)?;
            let items = list.snapshot();
            for (i, item) in items.iter().enumerate() {
                if values_equal(item, &args.positional[0])? {
                    let removed = list.borrow_mut().remove(i);
                    list.sync()?;
                    drop(removed);
                    return Ok(Value::None);
                }
            }
            Err(Fault::value_error("list.remove(x): x not in list"))
        }
        "sort" => {
            let key = callable_keyword(&mut args, "key");
            let reverse = args.take_keyword("reverse").is_some_and(|v| v.truthy());
            args.expect("sort", 0, 0)?;
            args.finish("sort")?;
            let sorted = sort_values(interp, list.snapshot(), key.as_ref(), reverse)?;
            list.replace(sorted)?;
            Ok(Value::None)
        }
        "reverse" => {
            args.expect("reverse", 0, 0)?;
            list.borrow_mut().reverse();
            Ok(Value::None)
        }
        "copy" => {
            args.expect("copy", 0, 0)?;
            Ok(interp.heap().list(list.snapshot())?)
        }
        "clear" => {
            args.expect("clear", 0, 0)?;
            list.replace(Vec::new())?;
            Ok(Value::None)
        }
        _ => Err(no_attribute(&Value::List(Rc::clone(list)), name)),
    }
}

fn dict_method(
    interp: &mut Interpreter,
    dict: &Rc<DictObj>,
    name: &'static str,
    mut args: Args,
) -> Result<Value, Fault> {
    match name {
        "get" => {
            args.expect("get", 1, 2)?;
            let found = dict.get(&args.positional[0])?;
            Ok(found.or_else(|| args.arg(1).cloned()).unwrap_or(Value::None))
        }
        "keys" => {
            args.expect("keys", 0, 0)?;
            Ok(interp.heap().list(dict.keys())?)
        }
        "values" => {
            args.expect("values", 0, 0)?;
            Ok(interp.heap().list(dict.values())?)
        }
        "items" => {
            args.expect("items", 0, 0)?;
            let mut pairs = Vec::with_capacity(dict.len());
            for (key, value) in dict.items() {
                pairs.push(interp.heap().tuple(vec![key, value])?);
            }
            Ok(interp.heap().list(pairs)?)
        }
        "pop" => {
            args.expect("pop", 1, 2)?;
            match dict.remove(&args.positional[0])? {
                Some(value) => Ok(value),
                None => args
                    .arg(1)
                    .cloned()
                    .ok_or_else(|| Fault::raise("KeyError", args.positional[0].short_repr())),
            }
        }
        "update" => {
            args.expect("update", 0, 1)?;
            if let Some(source) = args.arg(0) {
                pairs_into(interp, dict, source)?;
            }
            for (key, value) in std::mem::take(&mut args.keywords) {
                dict.set_str(&key, value)?;
            }
            Ok(Value::None)
        }
        "setdefault" => {
            args.expect("setdefault", 1, 2)?;
            let key = args.positional[0].clone();
            if let Some(existing) = dict.get(&key)? {
                return Ok(existing);
            }
            let value = args.arg(1).cloned().unwrap_or(Value::None);
            dict.insert(key, value.clone())?;
            Ok(value)
        }
        "copy" => {
            args.expect("copy", 0, 0)?;
            let copy = interp.heap().new_dict()?;
            for (key, value) in dict.items() {
                copy.insert(key, value)?;
            }
            Ok(Value::Dict(copy))
        }
        "clear" => {
            args.expect("clear", 0, 0)?;
            dict.clear()?;
            Ok(Value::None)
        }
        _ => Err(no_attribute(&Value::Dict(Rc::clone(dict)), name)),
    }
}

fn affixes(value: &Value, method: &str) -> Result<Vec<String>, Fault> {
    match value {
        Value::Str(text) => Ok(vec![text.as_str().to_string()]),
        Value::Tuple(items) => items
            .snapshot()
            .iter()
            .map(|item| item.expect_str(method).map(str::to_string))
            .collect(),
        other => Err(Fault::type_error(format!(
            "{method} arg must be str or a tuple of str, not {}",
            other.type_name()
        ))),
    }
}

fn str_method(interp: &mut Interpreter, text: &str, name: &'static str, mut args: Args) -> Result<Value, Fault> {
    match name {
        "upper" | "lower" => {
            args.expect(name, 0, 0)?;
            let converted = if name == "upper" { text.to_uppercase() } else { text.to_lowercase() };
            Ok(interp.heap().string(converted)?)
        }
        "strip" | "lstrip" | "rstrip" => {
            args.expect(name, 0, 1)?;
            let chars: Option<Vec<char>> = match args.arg(0) {
                None | Some(Value::None) => None,
                Some(value) => Some(value.expect_str(name)?.chars().collect()),
            };
            let matches = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            let stripped = match name {
                "strip" => text.trim_matches(matches),
                "lstrip" => text.trim_start_matches(matches),
                _ => text.trim_end_matches(matches),
            };
            Ok(interp.heap().string(stripped.to_string())?)
        }
        "split" => {
            let sep = args.take(0, "sep").filter(|v| !matches!(v, Value::None));
            let max_split = match args.take(1, "maxsplit") {
                Some(value) => value.expect_int("split() maxsplit")?,
                None => -1,
            };
            args.finish("split")?;
            let parts: Vec<&str> = match &sep {
                None => {
                    if max_split < 0 {
                        text.split_whitespace().collect()
                    } else {
                        split_whitespace_n(text, max_split as usize)
                    }
                }
                Some(sep) => {
                    let sep = sep.expect_str("split() sep")?;
                    if sep.is_empty() {
                        return Err(Fault::value_error("empty separator"));
                    }
                    if max_split < 0 {
                        text.split(sep).collect()
                    } else {
                        text.splitn(max_split as usize + 1, sep).collect()
                    }
                }
            };
            interp.heap().ensure_fits(parts.len().saturating_mul(SLOT_BYTES))?;
            let mut items = Vec::with_capacity(parts.len());
            for part in parts {
                items.push(interp.heap().string(part.to_string())?);
            }
            Ok(interp.heap().list(items)?)
        }
        "join" => {
            args.expect("join", 1, 1)?;
            let items = interp.collect(&args.positional[0])?;
            let mut out = String::new();
            for (i, item) in items.iter().enumerate() {
                let piece = item.as_str().ok_or_else(|| {
                    Fault::type_error(format!(
                        "sequence item {i}: expected str instance, {} found",
                        item.type_name()
                    ))
                })?;
                if i > 0 {
                    out.push_str(text);
                }
                out.push_str(piece);
                if i % 1024 == 1023 {
                    interp.heap().ensure_fits(out.len())?;
                }
            }
            interp.heap().ensure_fits(out.len())?;
            Ok(interp.heap().string(out)?)
        }
        "startswith" | "endswith" => {
            args.expect(name, 1, 1)?;
            let candidates = affixes(&args.positional[0], name)?;
            let found = candidates.iter().any(|affix| {
                if name == "startswith" {
                    text.starts_with(affix.as_str())
                } else {
                    text.ends_with(affix.as_str())
                }
            });
            Ok(Value::Bool(found))
        }
        "replace" => {
            args.expect("replace", 2, 3)?;
            let old = args.positional[0].expect_str("replace()")?;
            let new = args.positional[1].expect_str("replace()")?;
            let limit = match args.arg(2) {
                Some(value) => value.expect_int("replace() count")?,
                None => -1,
            };
            let occurrences = if old.is_empty() { char_len(text) + 1 } else { text.matches(old).count() };
            let occurrences = if limit < 0 { occurrences } else { occurrences.min(limit as usize) };
            let grown = occurrences.saturating_mul(new.len().saturating_sub(old.len()));
            interp.heap().ensure_fits(text.len().saturating_add(grown))?;
            let replaced = if limit < 0 { text.replace(old, new) } else { text.replacen(old, new, occurrences) };
            Ok(interp.heap().string(replaced)?)
        }
        "format" => {
            let formatted = ops::str_format(text, &args, interp.meter())?;
            Ok(interp.heap().string(formatted)?)
        }
        "find" => {
            args.expect("find", 1, 1)?;
            let needle = args.positional[0].expect_str("find()")?;
            Ok(Value::Int(match text.find(needle) {
                Some(byte) => char_len(&text[..byte]) as i64,
                None => -1,
            }))
        }
        "count" => {
            args.expect("count", 1, 1)?;
            let needle = args.positional[0].expect_str("count()")?;
            let count = if needle.is_empty() { char_len(text) + 1 } else { text.matches(needle).count() };
            Ok(Value::Int(count as i64))
        }
        _ => Err(no_attribute(&Value::str(text), name)),
    }
}

fn split_whitespace_n(text: &str, max_split: usize) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = text.trim_start();
    while !rest.is_empty() {
        if parts.len() == max_split {
            parts.push(rest.trim_end());
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                parts.push(&rest[..end]);
                rest = rest[end..].trim_start();
            }
            None => {
                parts.push(rest);
                break;
            }
        }
    }
    parts
}

fn date_method(date: chrono::NaiveDate, name: &'static str, args: Args) -> Result<Value, Fault> {
    match name {
        "weekday" => {
            args.expect("weekday", 0, 0)?;
            Ok(Value::Int(i64::from(date.weekday().num_days_from_monday())))
        }
        "isoformat" => {
            args.expect("isoformat", 0, 0)?;
            Ok(Value::str(&date.format("%Y-%m-%d").to_string()))
        }
        "add_days" => {
            args.expect("add_days", 1, 1)?;
            ops::shift_date(date, args.positional[0].expect_int("add_days()")?)
        }
        _ => Err(no_attribute(&Value::Date(date), name)),
    }
}

// ---- item access ----

pub fn get_item(container: &Value, key: &Value) -> Result<Value, Fault> {
    match container {
        Value::List(items) | Value::Tuple(items) => {
            let what = container.type_name();
            let index = index_arg(key, what)?;
            normalize_index(index, items.len())
                .and_then(|pos| items.get(pos))
                .ok_or_else(|| index_error(what))
        }
        Value::Str(text) => {
            let index = index_arg(key, "string")?;
            normalize_index(index, char_len(text))
                .and_then(|pos| char_at(text, pos))
                .map(Value::str)
                .ok_or_else(|| index_error("string"))
        }
        Value::Range(range) => {
            let index = index_arg(key, "range")?;
            normalize_index(index, range.len())
                .and_then(|pos| range.get(pos))
                .map(Value::Int)
                .ok_or_else(|| index_error("range object"))
        }
        Value::Dict(dict) => dict
            .get(key)?
            .ok_or_else(|| Fault::raise("KeyError", key.short_repr())),
        other => Err(Fault::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub fn set_item(container: &Value, key: Value, value: Value) -> Result<(), Fault> {
    match container {
        Value::List(items) => {
            let index = index_arg(&key, "list")?;
            let pos = normalize_index(index, items.len())
                .ok_or_else(|| Fault::raise("IndexError", "list assignment index out of range"))?;
            let old = std::mem::replace(&mut items.borrow_mut()[pos], value);
            drop(old);
            Ok(())
        }
        Value::Dict(dict) => dict.insert(key, value),
        other => Err(Fault::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

pub fn delete_item(container: &Value, key: &Value) -> Result<(), Fault> {
    match container {
        Value::List(items) => {
            let index = index_arg(key, "list")?;
            let pos = normalize_index(index, items.len())
                .ok_or_else(|| Fault::raise("IndexError", "list assignment index out of range"))?;
            let removed = items.borrow_mut().remove(pos);
            items.sync()?;
            drop(removed);
            Ok(())
        }
        Value::Dict(dict) => match dict.remove(key)? {
            Some(_) => Ok(()),
            None => Err(Fault::raise("KeyError", key.short_repr())),
        },
        other => Err(Fault::type_error(format!(
            "'{}' object doesn't support item deletion",
            other.type_name()
        ))),
    }
}

fn positions(range: &RangeObj) -> impl Iterator<Item = usize> + '_ {
    (0..range.len()).filter_map(|i| range.get(i)).filter_map(|p| usize::try_from(p).ok())
}

pub fn get_slice(heap: &Heap, container: &Value, bounds: SliceBounds) -> Result<Value, Fault> {
    match container {
        Value::List(items) | Value::Tuple(items) => {
            let range = bounds.indices(items.len())?;
            let picked: Vec<Value> = {
                let items = items.borrow();
                positions(&range).filter_map(|p| items.get(p).cloned()).collect()
            };
            if matches!(container, Value::Tuple(_)) {
                Ok(heap.tuple(picked)?)
            } else {
                Ok(heap.list(picked)?)
            }
        }
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            let range = bounds.indices(chars.len())?;
            let picked: String = positions(&range).filter_map(|p| chars.get(p)).collect();
            Ok(heap.string(picked)?)
        }
        Value::Range(source) => {
            let range = bounds.indices(source.len())?;
            let picked: Vec<Value> = positions(&range)
                .filter_map(|p| source.get(p))
                .map(Value::Int)
                .collect();
            heap.ensure_fits(picked.len().saturating_mul(SLOT_BYTES))?;
            Ok(heap.list(picked)?)
        }
        other => Err(Fault::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub fn assign_slice(heap: &Heap, container: &Value, bounds: SliceBounds, items: Vec<Value>) -> Result<(), Fault> {
    let Value::List(list) = container else {
        return Err(Fault::type_error(format!(
            "'{}' object does not support slice assignment",
            container.type_name()
        )));
    };
    let range = bounds.indices(list.len())?;
    heap.ensure_fits(items.len().saturating_mul(SLOT_BYTES))?;
    if range.step == 1 {
        let start = usize::try_from(range.start).unwrap_or(0);
        let stop = usize::try_from(range.stop.max(range.start)).unwrap_or(start);
        let removed: Vec<Value> = list.borrow_mut().splice(start..stop, items).collect();
        list.sync()?;
        drop(removed);
        return Ok(());
    }
    let targets: Vec<usize> = positions(&range).collect();
    if targets.len() != items.len() {
        return Err(Fault::value_error(format!(
            "attempt to assign sequence of size {} to extended slice of size {}",
            items.len(),
            targets.len()
        )));
    }
    let replaced: Vec<Value> = {
        let mut slots = list.borrow_mut();
        targets
            .into_iter()
            .zip(items)
            .map(|(pos, item)| std::mem::replace(&mut slots[pos], item))
            .collect()
    };
    drop(replaced);
    Ok(())
}

pub fn delete_slice(container: &Value, bounds: SliceBounds) -> Result<(), Fault> {
    let Value::List(list) = container else {
        return Err(Fault::type_error(format!(
            "'{}' object doesn't support item deletion",
            container.type_name()
        )));
    };
    let range = bounds.indices(list.len())?;
    let mut doomed = vec![false; list.len()];
    for pos in positions(&range) {
        if let Some(flag) = doomed.get_mut(pos) {
            *flag = true;
        }
    }
    let removed: Vec<Value> = {
        let mut items = list.borrow_mut();
        let (kept, removed): (Vec<(usize, Value)>, Vec<(usize, Value)>) =
            std::mem::take(&mut *items).into_iter().enumerate().partition(|(i, _)| !doomed[*i]);
        *items = kept.into_iter().map(|(_, v)| v).collect();
        removed.into_iter().map(|(_, v)| v).collect()
    };
    list.sync()?;
    drop(removed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::limits::ExecutionBudget;
    use crate::domain::script::parse;

    fn eval(source: &str) -> String {
        let program = parse(&format!("result = {source}\n")).expect("parse");
        let mut interp = Interpreter::new(ExecutionBudget::unlimited(), 64);
        if let Err(fault) = interp.run(&program) {
            panic!("{source}: {}", fault.into_execution_error());
        }
        interp.global("result").expect("result").short_repr()
    }

    fn eval_err(source: &str) -> String {
        let program = parse(&format!("result = {source}\n")).expect("parse");
        let mut interp = Interpreter::new(ExecutionBudget::unlimited(), 64);
        interp.run(&program).expect_err("should fail").into_execution_error().message
    }

    #[test]
    fn numeric_builtins() {
        assert_eq!(eval("abs(-3)"), "3");
        assert_eq!(eval("round(2.5)"), "2");
        assert_eq!(eval("round(3.14159, 2)"), "3.14");
        assert_eq!(eval("int('42')"), "42");
        assert_eq!(eval("int(-2.7)"), "-2");
        assert_eq!(eval("float('1e3')"), "1000.0");
        assert_eq!(eval("divmod(7, -2)"), "(-4, -1)");
        assert_eq!(eval("sum([1, 2, 3], 10)"), "16");
        assert_eq!(eval("pow(2, -1)"), "0.5");
    }

    #[test]
    fn sequence_builtins() {
        assert_eq!(eval("sorted([3, 1, 2], reverse=True)"), "[3, 2, 1]");
        assert_eq!(eval("sorted(['bb', 'a', 'ccc'], key=len)"), "['a', 'bb', 'ccc']");
        assert_eq!(eval("max([1, 5, 3])"), "5");
        assert_eq!(eval("min(4, 2, 8)"), "2");
        assert_eq!(eval("max([], default=0)"), "0");
        assert_eq!(eval("list(enumerate('ab', 1))"), "[(1, 'a'), (2, 'b')]");
        assert_eq!(eval("list(zip([1, 2, 3], 'ab'))"), "[(1, 'a'), (2, 'b')]");
        assert_eq!(eval("list(map(lambda a, b: a * b, [1, 2], [3, 4]))"), "[3, 8]");
        assert_eq!(eval("list(filter(None, [0, 1, '', 'x']))"), "[1, 'x']");
        assert_eq!(eval("list(reversed(range(3)))"), "[2, 1, 0]");
        assert_eq!(eval("len({'a': 1})"), "1");
        assert_eq!(eval("dict([('a', 1)], b=2)"), "{'a': 1, 'b': 2}");
    }

    #[test]
    fn empty_max_raises_value_error() {
        assert_eq!(eval_err("max([])"), "ValueError: max() arg is an empty sequence");
    }

    #[test]
    fn mixed_sort_raises_type_error() {
        assert_eq!(
            eval_err("sorted([1, 'a'])"),
            "TypeError: '<' not supported between instances of 'str' and 'int'"
        );
    }

    #[test]
    fn isinstance_checks() {
        assert_eq!(eval("isinstance(True, int)"), "True");
        assert_eq!(eval("isinstance(1.0, (int, str))"), "False");
        assert_eq!(eval("isinstance(KeyError('k'), LookupError)"), "True");
    }

    #[test]
    fn string_methods() {
        assert_eq!(eval("'  a b  '.strip()"), "'a b'");
        assert_eq!(eval("'a  b c'.split()"), "['a', 'b', 'c']");
        assert_eq!(eval("'a,b,c'.split(',', 1)"), "['a', 'b,c']");
        assert_eq!(eval("'xyz'.startswith(('a', 'x'))"), "True");
        assert_eq!(eval("'aaa'.replace('a', 'b', 2)"), "'bba'");
        assert_eq!(eval("'{} and {name}'.format(1, name='x')"), "'1 and x'");
        assert_eq!(eval("'hello'.find('l')"), "2");
        assert_eq!(eval("'héllo'[1]"), "'é'");
    }

    #[test]
    fn dict_methods() {
        assert_eq!(eval("{'a': 1}.get('b', 7)"), "7");
        assert_eq!(eval("sorted({'b': 1, 'a': 2}.items())"), "[('a', 2), ('b', 1)]");
        assert_eq!(eval("{'a': 1}.pop('a')"), "1");
        assert_eq!(eval_err("{}['x']"), "KeyError: 'x'");
    }

    #[test]
    fn list_methods_mutate_in_place() {
        let program = parse(
            "xs = [3, 1, 2]\nxs.append(4)\nxs.sort()\nxs.insert(0, 0)\nlast = xs.pop()\nxs.remove(2)\nxs.reverse()\n",
        )
        .unwrap();
        let mut interp = Interpreter::new(ExecutionBudget::unlimited(), 64);
        interp.run(&program).unwrap();
        assert_eq!(interp.global("xs").unwrap().short_repr(), "[3, 1, 0]");
        assert_eq!(interp.global("last").unwrap().short_repr(), "4");
    }

    #[test]
    fn attribute_errors_name_the_type() {
        assert_eq!(
            eval_err("(1).foo"),
            "AttributeError: 'int' object has no attribute 'foo'"
        );
    }
}
