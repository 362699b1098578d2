//! Operators, membership and string formatting.

use chrono::TimeDelta;

use super::ast::{BinOp, UnaryOp};
use super::value::{
    format_float, quote_str, values_equal, Args, Fault, Heap, Number, Value, SLOT_BYTES,
};
use crate::domain::limits::MemoryMeter;

fn unsupported(op: &str, left: &Value, right: &Value) -> Fault {
    Fault::type_error(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        left.type_name(),
        right.type_name()
    ))
}

fn overflow() -> Fault {
    Fault::raise("OverflowError", "integer overflow")
}

fn int_result(result: Option<i64>) -> Result<Value, Fault> {
    result.map(Value::Int).ok_or_else(overflow)
}

/// Repetition count; negative counts repeat zero times.
fn repeat_count(count: &Value) -> Option<usize> {
    match count {
        Value::Int(n) => Some(usize::try_from(*n).unwrap_or(0)),
        Value::Bool(b) => Some(usize::from(*b)),
        _ => None,
    }
}

fn repeat_seq(heap: &Heap, items: &[Value], times: usize, tuple: bool) -> Result<Value, Fault> {
    let total = items
        .len()
        .checked_mul(times)
        .ok_or_else(|| Fault::raise("OverflowError", "repeated sequence is too long"))?;
    heap.ensure_fits(total.saturating_mul(SLOT_BYTES))?;
    let mut out = Vec::with_capacity(total);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    Ok(if tuple { heap.tuple(out)? } else { heap.list(out)? })
}

fn repeat_str(heap: &Heap, text: &str, times: usize) -> Result<Value, Fault> {
    let total = text
        .len()
        .checked_mul(times)
        .ok_or_else(|| Fault::raise("OverflowError", "repeated string is too long"))?;
    heap.ensure_fits(total)?;
    Ok(heap.string(text.repeat(times))?)
}

pub(crate) fn shift_date(date: chrono::NaiveDate, days: i64) -> Result<Value, Fault> {
    TimeDelta::try_days(days)
        .and_then(|delta| date.checked_add_signed(delta))
        .map(Value::Date)
        .ok_or_else(|| Fault::raise("OverflowError", "date value out of range"))
}

fn float_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

fn arithmetic(op: BinOp, a: Number, b: Number) -> Result<Value, Fault> {
    use Number::{Float, Int};

    match (op, a, b) {
        (BinOp::Add, Int(x), Int(y)) => int_result(x.checked_add(y)),
        (BinOp::Sub, Int(x), Int(y)) => int_result(x.checked_sub(y)),
        (BinOp::Mul, Int(x), Int(y)) => int_result(x.checked_mul(y)),
        (BinOp::FloorDiv, Int(_), Int(0)) => Err(Fault::raise(
            "ZeroDivisionError",
            "integer division or modulo by zero",
        )),
        (BinOp::FloorDiv, Int(x), Int(y)) => {
            let q = x.checked_div(y).ok_or_else(overflow)?;
            let adjust = x % y != 0 && ((x < 0) != (y < 0));
            Ok(Value::Int(if adjust { q - 1 } else { q }))
        }
        (BinOp::Mod, Int(_), Int(0)) => {
            Err(Fault::raise("ZeroDivisionError", "integer modulo by zero"))
        }
        (BinOp::Mod, Int(x), Int(y)) => {
            let r = x.checked_rem(y).unwrap_or(0);
            Ok(Value::Int(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r }))
        }
        (BinOp::Pow, Int(x), Int(y)) if y >= 0 => match u32::try_from(y) {
            Ok(exp) => int_result(x.checked_pow(exp)),
            Err(_) => match x {
                0 | 1 => Ok(Value::Int(x)),
                -1 => Ok(Value::Int(if y % 2 == 0 { 1 } else { -1 })),
                _ => Err(overflow()),
            },
        },
        (op, a, b) => {
            let (x, y) = (a.to_f64(), b.to_f64());
            let result = match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div => {
                    if y == 0.0 {
                        return Err(Fault::raise("ZeroDivisionError", "division by zero"));
                    }
                    x / y
                }
                BinOp::FloorDiv => {
                    if y == 0.0 {
                        return Err(Fault::raise("ZeroDivisionError", "float floor division by zero"));
                    }
                    (x / y).floor()
                }
                BinOp::Mod => {
                    if y == 0.0 {
                        return Err(Fault::raise("ZeroDivisionError", "float modulo"));
                    }
                    float_mod(x, y)
                }
                BinOp::Pow => {
                    if x == 0.0 && y < 0.0 {
                        return Err(Fault::raise(
                            "ZeroDivisionError",
                            "0.0 cannot be raised to a negative power",
                        ));
                    }
                    if x < 0.0 && y.fract() != 0.0 {
                        return Err(Fault::value_error("math domain error"));
                    }
                    x.powf(y)
                }
            };
            Ok(Value::Float(result))
        }
    }
}

pub fn binary(heap: &Heap, op: BinOp, left: &Value, right: &Value) -> Result<Value, Fault> {
    if let (Some(a), Some(b)) = (left.number(), right.number()) {
        return arithmetic(op, a, b);
    }

    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            heap.ensure_fits(a.len().saturating_add(b.len()))?;
            let mut text = String::with_capacity(a.len() + b.len());
            text.push_str(a);
            text.push_str(b);
            Ok(heap.string(text)?)
        }
        (BinOp::Add, Value::List(a), Value::List(b)) | (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            let total = a.len().saturating_add(b.len());
            heap.ensure_fits(total.saturating_mul(SLOT_BYTES))?;
            let mut items = a.snapshot();
            items.extend(b.snapshot());
            Ok(if matches!(left, Value::Tuple(_)) {
                heap.tuple(items)?
            } else {
                heap.list(items)?
            })
        }
        (BinOp::Add, Value::Date(d), n) | (BinOp::Add, n, Value::Date(d)) if matches!(n, Value::Int(_)) => {
            shift_date(*d, n.expect_int("date offset")?)
        }
        (BinOp::Sub, Value::Date(a), Value::Date(b)) => {
            Ok(Value::Int(a.signed_duration_since(*b).num_days()))
        }
        (BinOp::Sub, Value::Date(d), Value::Int(n)) => {
            let days = n.checked_neg().ok_or_else(overflow)?;
            shift_date(*d, days)
        }
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) => match repeat_count(n) {
            Some(times) => repeat_str(heap, s, times),
            None => Err(unsupported("*", left, right)),
        },
        (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items)) => match repeat_count(n) {
            Some(times) => repeat_seq(heap, &items.snapshot(), times, false),
            None => Err(unsupported("*", left, right)),
        },
        (BinOp::Mul, Value::Tuple(items), n) | (BinOp::Mul, n, Value::Tuple(items)) => match repeat_count(n) {
            Some(times) => repeat_seq(heap, &items.snapshot(), times, true),
            None => Err(unsupported("*", left, right)),
        },
        (BinOp::Mod, Value::Str(template), args) => percent_format(heap, template, args),
        _ => Err(unsupported(op.symbol(), left, right)),
    }
}

pub fn unary(op: UnaryOp, operand: &Value) -> Result<Value, Fault> {
    match (op, operand.number()) {
        (UnaryOp::Not, _) => Ok(Value::Bool(!operand.truthy())),
        (UnaryOp::Neg, Some(Number::Int(i))) => int_result(i.checked_neg()),
        (UnaryOp::Neg, Some(Number::Float(f))) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Some(Number::Int(i))) => Ok(Value::Int(i)),
        (UnaryOp::Pos, Some(Number::Float(f))) => Ok(Value::Float(f)),
        (op, None) => Err(Fault::type_error(format!(
            "bad operand type for unary {}: '{}'",
            if op == UnaryOp::Neg { "-" } else { "+" },
            operand.type_name()
        ))),
    }
}

/// `item in container`
pub fn contains(container: &Value, item: &Value) -> Result<bool, Fault> {
    match container {
        Value::Str(text) => match item {
            Value::Str(needle) => Ok(text.contains(needle.as_str())),
            other => Err(Fault::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) | Value::Tuple(items) => {
            for candidate in items.snapshot() {
                if values_equal(&candidate, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Dict(dict) => dict.contains(item),
        Value::Range(range) => {
            let Some(Number::Int(n)) = item.number() else {
                return Ok(false);
            };
            let (start, stop, step) = (
                i128::from(range.start),
                i128::from(range.stop),
                i128::from(range.step),
            );
            let n = i128::from(n);
            let within = if step > 0 {
                n >= start && n < stop
            } else {
                n <= start && n > stop
            };
            Ok(within && (n - start) % step == 0)
        }
        other => Err(Fault::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

// ---- format specs ----

#[derive(Debug, Default, PartialEq)]
struct FormatSpec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    zero: bool,
    width: usize,
    grouping: bool,
    precision: Option<usize>,
    kind: Option<char>,
}

fn bad_spec(spec: &str) -> Fault {
    Fault::value_error(format!("invalid format specifier '{spec}'"))
}

fn parse_spec(spec: &str) -> Result<FormatSpec, Fault> {
    let chars: Vec<char> = spec.chars().collect();
    let mut out = FormatSpec::default();
    let mut i = 0;

    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        out.fill = Some(chars[0]);
        out.align = Some(chars[1]);
        i = 2;
    } else if chars.first().is_some_and(|c| is_align(*c)) {
        out.align = Some(chars[0]);
        i = 1;
    }
    if let Some(c @ ('+' | '-' | ' ')) = chars.get(i).copied() {
        out.sign = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        out.zero = true;
        i += 1;
    }
    let width_start = i;
    while chars.get(i).is_some_and(char::is_ascii_digit) {
        i += 1;
    }
    if i > width_start {
        let digits: String = chars[width_start..i].iter().collect();
        out.width = digits.parse().map_err(|_| bad_spec(spec))?;
    }
    if chars.get(i) == Some(&',') {
        out.grouping = true;
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while chars.get(i).is_some_and(char::is_ascii_digit) {
            i += 1;
        }
        if i == start {
            return Err(bad_spec(spec));
        }
        let digits: String = chars[start..i].iter().collect();
        out.precision = Some(digits.parse().map_err(|_| bad_spec(spec))?);
    }
    if let Some(&c) = chars.get(i) {
        out.kind = Some(c);
        i += 1;
    }
    if i != chars.len() {
        return Err(bad_spec(spec));
    }
    // Keep widths sane; a spec is never allowed to allocate much.
    if out.width > 10_000 || out.precision.is_some_and(|p| p > 500) {
        return Err(bad_spec(spec));
    }
    Ok(out)
}

fn group_thousands(digits: &str) -> String {
    let (int_part, rest) = match digits.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => digits.split_at(pos),
        None => (digits, ""),
    };
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3 + rest.len());
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped.push_str(rest);
    grouped
}

/// Python-style `e` notation: `1.234560e+01`.
fn format_exponent(x: f64, precision: usize) -> String {
    let text = format!("{x:.precision$e}");
    match text.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => text,
    }
}

fn strip_fraction_zeros(text: &str) -> String {
    match text.split_once('e') {
        Some((mantissa, exponent)) if mantissa.contains('.') => {
            let trimmed = mantissa.trim_end_matches('0').trim_end_matches('.');
            format!("{trimmed}e{exponent}")
        }
        None if text.contains('.') => text.trim_end_matches('0').trim_end_matches('.').to_string(),
        _ => text.to_string(),
    }
}

fn format_general(x: f64, precision: usize) -> String {
    if !x.is_finite() {
        return format_float(x);
    }
    let p = precision.max(1);
    if x == 0.0 {
        return "0".to_string();
    }
    let exponent = x.abs().log10().floor() as i64;
    if exponent >= -4 && exponent < p as i64 {
        let decimals = usize::try_from(p as i64 - 1 - exponent).unwrap_or(0);
        strip_fraction_zeros(&format!("{x:.decimals$}"))
    } else {
        strip_fraction_zeros(&format_exponent(x, p - 1))
    }
}

fn pad(body: String, spec: &FormatSpec, numeric: bool) -> String {
    let len = body.chars().count();
    if len >= spec.width {
        return body;
    }
    let fill_count = spec.width - len;
    let zero_fill = spec.zero && spec.fill.is_none() && spec.align.is_none();
    let fill = spec.fill.unwrap_or(if zero_fill { '0' } else { ' ' });
    let align = spec
        .align
        .unwrap_or(if zero_fill { '=' } else if numeric { '>' } else { '<' });
    let padding = |n: usize| std::iter::repeat_n(fill, n).collect::<String>();

    match align {
        '<' => body + &padding(fill_count),
        '^' => {
            let left = fill_count / 2;
            padding(left) + &body + &padding(fill_count - left)
        }
        '=' if numeric => {
            let sign_len = usize::from(body.starts_with(['-', '+', ' ']));
            let (sign, digits) = body.split_at(sign_len);
            format!("{sign}{}{digits}", padding(fill_count))
        }
        _ => padding(fill_count) + &body,
    }
}

fn signed(text: String, negative: bool, sign: Option<char>) -> String {
    if negative {
        return text;
    }
    match sign {
        Some('+') => format!("+{text}"),
        Some(' ') => format!(" {text}"),
        _ => text,
    }
}

/// Apply a format spec (`.2f`, `>10`, `,d`, `.1%`) to a value.
pub fn format_value(value: &Value, spec: &str, meter: &MemoryMeter) -> Result<String, Fault> {
    if spec.is_empty() {
        return Ok(value.display(meter)?);
    }
    let parsed = parse_spec(spec)?;
    let unknown = |kind: char| {
        Fault::value_error(format!(
            "Unknown format code '{kind}' for object of type '{}'",
            value.type_name()
        ))
    };

    let number = match value {
        Value::Bool(_) if parsed.kind.is_none() => None,
        other => other.number(),
    };

    let Some(number) = number else {
        if let Some(kind) = parsed.kind.filter(|k| *k != 's') {
            return Err(unknown(kind));
        }
        let mut text = value.display(meter)?;
        if let Some(precision) = parsed.precision {
            text = text.chars().take(precision).collect();
        }
        return Ok(pad(text, &parsed, false));
    };

    let (body, negative) = match (parsed.kind, number) {
        (Some('d') | None, Number::Int(i)) if parsed.precision.is_none() || parsed.kind == Some('d') => {
            if parsed.precision.is_some() {
                return Err(Fault::value_error("precision not allowed in integer format specifier"));
            }
            let digits = i.unsigned_abs().to_string();
            let digits = if parsed.grouping { group_thousands(&digits) } else { digits };
            (if i < 0 { format!("-{digits}") } else { digits }, i < 0)
        }
        (Some('d'), Number::Float(_)) => return Err(unknown('d')),
        (Some('s'), _) => return Err(unknown('s')),
        (kind, number) => {
            let x = number.to_f64();
            let precision = parsed.precision.unwrap_or(6);
            let magnitude = x.abs();
            let mut text = match kind {
                Some('f' | 'F') => format!("{magnitude:.precision$}"),
                Some('e' | 'E') => format_exponent(magnitude, precision),
                Some('%') => format!("{:.precision$}%", magnitude * 100.0),
                Some('g' | 'G') => format_general(magnitude, precision),
                None if parsed.precision.is_some() => format_general(magnitude, precision),
                None => format_float(magnitude),
                Some(other) => return Err(unknown(other)),
            };
            if !x.is_finite() {
                text = format_float(magnitude);
            }
            if matches!(kind, Some('E' | 'F' | 'G')) {
                text = text.to_uppercase();
            }
            if parsed.grouping {
                text = group_thousands(&text);
            }
            let negative = x.is_sign_negative() && !(x == 0.0 && kind.is_none());
            (if negative { format!("-{text}") } else { text }, negative)
        }
    };
    Ok(pad(signed(body, negative, parsed.sign), &parsed, true))
}

// ---- printf-style `%` ----

pub fn percent_format(heap: &Heap, template: &str, args: &Value) -> Result<Value, Fault> {
    let values = match args {
        Value::Tuple(items) => items.snapshot(),
        other => vec![other.clone()],
    };
    let mut next = values.into_iter();
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut flags = String::new();
        while let Some(&f) = chars.peek().filter(|f| matches!(f, '-' | '+' | ' ' | '0')) {
            flags.push(f);
            chars.next();
        }
        let mut width = String::new();
        while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            width.push(d);
            chars.next();
        }
        let mut precision = String::new();
        if chars.peek() == Some(&'.') {
            chars.next();
            precision.push('.');
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                precision.push(d);
                chars.next();
            }
        }
        let Some(conversion) = chars.next() else {
            return Err(Fault::value_error("incomplete format"));
        };
        if conversion == '%' {
            out.push('%');
            continue;
        }

        let value = next
            .next()
            .ok_or_else(|| Fault::type_error("not enough arguments for format string"))?;
        let align = if flags.contains('-') { "<" } else { "" };
        let sign = if flags.contains('+') {
            "+"
        } else if flags.contains(' ') {
            " "
        } else {
            ""
        };
        let zero = if flags.contains('0') && align.is_empty() { "0" } else { "" };
        let piece = match conversion {
            's' => {
                let text = value.display(heap.meter())?;
                format_value(&heap.string(text)?, &format!("{align}{width}{precision}"), heap.meter())?
            }
            'r' => {
                let text = value.repr(heap.meter())?;
                format_value(&heap.string(text)?, &format!("{align}{width}{precision}"), heap.meter())?
            }
            'd' | 'i' => {
                let n = match value.number() {
                    Some(Number::Float(f)) => Value::Int(f.trunc() as i64),
                    Some(Number::Int(i)) => Value::Int(i),
                    None => {
                        return Err(Fault::type_error(format!(
                            "%{conversion} format: a real number is required, not {}",
                            value.type_name()
                        )));
                    }
                };
                format_value(&n, &format!("{align}{sign}{zero}{width}d"), heap.meter())?
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
                let x = value.expect_f64(&format!("%{conversion} format"))?;
                let precision = if precision.is_empty() { ".6".to_string() } else { precision.clone() };
                format_value(
                    &Value::Float(x),
                    &format!("{align}{sign}{zero}{width}{precision}{conversion}"),
                    heap.meter(),
                )?
            }
            other => {
                return Err(Fault::value_error(format!(
                    "unsupported format character '{other}'"
                )));
            }
        };
        out.push_str(&piece);
    }
    if next.next().is_some() {
        return Err(Fault::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(heap.string(out)?)
}

// ---- str.format ----

/// `"{} {name:.2f} {0!r}".format(...)`
pub fn str_format(template: &str, args: &Args, meter: &MemoryMeter) -> Result<String, Fault> {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut auto_index = 0usize;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                out.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                out.push('}');
                i += 2;
            }
            '}' => return Err(Fault::value_error("Single '}' encountered in format string")),
            '{' => {
                let end = chars[i..]
                    .iter()
                    .position(|c| *c == '}')
                    .map(|offset| i + offset)
                    .ok_or_else(|| Fault::value_error("Single '{' encountered in format string"))?;
                let field: String = chars[i + 1..end].iter().collect();
                let (head, spec) = field.split_once(':').unwrap_or((field.as_str(), ""));
                let (name, conversion) = match head.split_once('!') {
                    Some((name, conv)) => (name, Some(conv)),
                    None => (head, None),
                };

                let value = if name.is_empty() {
                    let value = args.arg(auto_index);
                    auto_index += 1;
                    value
                } else if let Ok(index) = name.parse::<usize>() {
                    args.arg(index)
                } else {
                    args.keywords.iter().find(|(k, _)| k == name).map(|(_, v)| v)
                };
                let value = value.ok_or_else(|| {
                    if name.is_empty() || name.parse::<usize>().is_ok() {
                        Fault::raise("IndexError", "Replacement index out of range for positional args tuple")
                    } else {
                        Fault::raise("KeyError", format!("'{name}'"))
                    }
                })?;

                let rendered = match conversion {
                    None => format_value(value, spec, meter)?,
                    Some("r") => {
                        let mut text = String::new();
                        match value {
                            Value::Str(s) => quote_str(&mut text, s),
                            other => text = other.repr(meter)?,
                        }
                        format_value(&Value::str(&text), spec, meter)?
                    }
                    Some("s") => format_value(&Value::str(&value.display(meter)?), spec, meter)?,
                    Some(other) => {
                        return Err(Fault::value_error(format!(
                            "Unknown conversion specifier {other}"
                        )));
                    }
                };
                out.push_str(&rendered);
                meter.ensure_fits(out.len())?;
                i = end + 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}
