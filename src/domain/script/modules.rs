//! Importable modules: numeric helpers plus the indicator and simulator
//! library, exposed to scripts under short names.

use std::rc::Rc;

use chrono::NaiveDate;
use indexmap::IndexMap;

use super::interpreter::Interpreter;
use super::value::{Args, Fault, ModuleObj, NativeFn, Value, SLOT_BYTES};
use crate::domain::indicator::{self, Series};
use crate::domain::outcome::TradeSide;
use crate::domain::simulator::{self, SimulationConfig};

/// Every name `import` accepts.
pub const MODULE_NAMES: &[&str] = &["math", "statistics", "datetime", "series", "indicators", "backtest"];

pub fn load(name: &str) -> Option<Value> {
    let (name, functions, constants): (&'static str, &'static [NativeFn], Vec<(&'static str, Value)>) =
        match name {
            "math" => (
                "math",
                MATH,
                vec![
                    ("pi", Value::Float(std::f64::consts::PI)),
                    ("e", Value::Float(std::f64::consts::E)),
                    ("inf", Value::Float(f64::INFINITY)),
                    ("nan", Value::Float(f64::NAN)),
                ],
            ),
            "statistics" => (
                "statistics",
                STATISTICS,
                vec![("StatisticsError", Value::ExceptionType("StatisticsError"))],
            ),
            "datetime" => ("datetime", DATETIME, Vec::new()),
            "series" => ("series", SERIES, Vec::new()),
            "indicators" => ("indicators", INDICATORS, Vec::new()),
            "backtest" => ("backtest", BACKTEST, Vec::new()),
            _ => return None,
        };
    let mut members = IndexMap::new();
    for native in functions {
        members.insert(native.name, Value::Native(native));
    }
    members.extend(constants);
    Some(Value::Module(Rc::new(ModuleObj { name, members })))
}

// ---- argument helpers ----

fn float_arg(args: &Args, index: usize, func: &str) -> Result<f64, Fault> {
    args.positional[index].expect_f64(&format!("{func}()"))
}

/// Optional positive window length, positional or by keyword.
fn period(args: &mut Args, index: usize, keyword: &str, default: Option<usize>, func: &str) -> Result<usize, Fault> {
    let value = match args.take(index, keyword) {
        Some(value) => value.expect_int(&format!("{func}() {keyword}"))?,
        None => match default {
            Some(default) => return Ok(default),
            None => {
                return Err(Fault::type_error(format!(
                    "{func}() missing required argument: '{keyword}'"
                )));
            }
        },
    };
    if value < 1 {
        return Err(Fault::value_error(format!("{func}() {keyword} must be at least 1")));
    }
    Ok(usize::try_from(value).unwrap_or(usize::MAX))
}

fn series_value(interp: &Interpreter, series: Series) -> Result<Value, Fault> {
    interp.heap().ensure_fits(series.len().saturating_mul(SLOT_BYTES))?;
    let items = series
        .into_iter()
        .map(|point| match point {
            Some(x) if !x.is_nan() => Value::Float(x),
            _ => Value::None,
        })
        .collect();
    Ok(interp.heap().list(items)?)
}

fn leading_gaps(values: &[f64]) -> usize {
    values.iter().take_while(|v| v.is_nan()).count()
}

/// Run `calculate` past any leading gaps so warmup output from one
/// indicator can feed another.
fn aligned(values: &[f64], calculate: impl FnOnce(&[f64]) -> Series) -> Series {
    let lead = leading_gaps(values);
    let mut out = vec![None; lead];
    out.extend(calculate(&values[lead..]));
    out
}

fn finite(x: f64) -> Option<f64> {
    x.is_finite().then_some(x)
}

// ---- math ----

static MATH: &[NativeFn] = &[
    NativeFn { name: "sqrt", call: math_sqrt },
    NativeFn { name: "log", call: math_log },
    NativeFn { name: "log10", call: math_log10 },
    NativeFn { name: "exp", call: math_exp },
    NativeFn { name: "floor", call: math_floor },
    NativeFn { name: "ceil", call: math_ceil },
    NativeFn { name: "trunc", call: math_trunc },
    NativeFn { name: "fabs", call: math_fabs },
    NativeFn { name: "pow", call: math_pow },
    NativeFn { name: "isnan", call: math_isnan },
    NativeFn { name: "isinf", call: math_isinf },
    NativeFn { name: "isfinite", call: math_isfinite },
    NativeFn { name: "sin", call: math_sin },
    NativeFn { name: "cos", call: math_cos },
    NativeFn { name: "tan", call: math_tan },
    NativeFn { name: "atan", call: math_atan },
];

fn domain_error() -> Fault {
    Fault::value_error("math domain error")
}

fn unary_math(args: &Args, name: &str) -> Result<f64, Fault> {
    args.expect(name, 1, 1)?;
    args.finish(name)?;
    float_arg(args, 0, name)
}

fn checked_float(x: f64) -> Result<Value, Fault> {
    if x.is_infinite() {
        return Err(Fault::raise("OverflowError", "math range error"));
    }
    Ok(Value::Float(x))
}

fn math_sqrt(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    let x = unary_math(&args, "sqrt")?;
    if x < 0.0 {
        return Err(domain_error());
    }
    Ok(Value::Float(x.sqrt()))
}

fn math_log(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("log", 1, 2)?;
    let x = float_arg(&args, 0, "log")?;
    if x <= 0.0 {
        return Err(domain_error());
    }
    match args.arg(1) {
        None => Ok(Value::Float(x.ln())),
        Some(base) => {
            let base = base.expect_f64("log() base")?;
            if base <= 0.0 || base == 1.0 {
                return Err(domain_error());
            }
            Ok(Value::Float(x.ln() / base.ln()))
        }
    }
}

fn math_log10(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    let x = unary_math(&args, "log10")?;
    if x <= 0.0 {
        return Err(domain_error());
    }
    Ok(Value::Float(x.log10()))
}

fn math_exp(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    let x = unary_math(&args, "exp")?;
    checked_float(x.exp())
}

fn integral(x: f64) -> Result<Value, Fault> {
    if x.is_nan() {
        return Err(Fault::value_error("cannot convert float NaN to integer"));
    }
    if x.is_infinite() || x < -9.223_372_036_854_776e18 || x >= 9.223_372_036_854_776e18 {
        return Err(Fault::raise("OverflowError", "cannot convert float to integer"));
    }
    Ok(Value::Int(x as i64))
}

fn math_floor(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    if let Some(Value::Int(i)) = args.arg(0) {
        return Ok(Value::Int(*i));
    }
    integral(unary_math(&args, "floor")?.floor())
}

fn math_ceil(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    if let Some(Value::Int(i)) = args.arg(0) {
        return Ok(Value::Int(*i));
    }
    integral(unary_math(&args, "ceil")?.ceil())
}

fn math_trunc(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    if let Some(Value::Int(i)) = args.arg(0) {
        return Ok(Value::Int(*i));
    }
    integral(unary_math(&args, "trunc")?.trunc())
}

fn math_fabs(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    Ok(Value::Float(unary_math(&args, "fabs")?.abs()))
}

fn math_pow(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("pow", 2, 2)?;
    let (x, y) = (float_arg(&args, 0, "pow")?, float_arg(&args, 1, "pow")?);
    if x < 0.0 && y.fract() != 0.0 {
        return Err(domain_error());
    }
    checked_float(x.powf(y))
}

fn math_isnan(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    Ok(Value::Bool(unary_math(&args, "isnan")?.is_nan()))
}

fn math_isinf(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    Ok(Value::Bool(unary_math(&args, "isinf")?.is_infinite()))
}

fn math_isfinite(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    Ok(Value::Bool(unary_math(&args, "isfinite")?.is_finite()))
}

fn math_sin(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    Ok(Value::Float(unary_math(&args, "sin")?.sin()))
}

fn math_cos(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    Ok(Value::Float(unary_math(&args, "cos")?.cos()))
}

fn math_tan(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    Ok(Value::Float(unary_math(&args, "tan")?.tan()))
}

fn math_atan(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    Ok(Value::Float(unary_math(&args, "atan")?.atan()))
}

// ---- statistics ----

static STATISTICS: &[NativeFn] = &[
    NativeFn { name: "mean", call: stats_mean },
    NativeFn { name: "median", call: stats_median },
    NativeFn { name: "stdev", call: stats_stdev },
    NativeFn { name: "pstdev", call: stats_pstdev },
    NativeFn { name: "variance", call: stats_variance },
    NativeFn { name: "pvariance", call: stats_pvariance },
];

fn sample(interp: &mut Interpreter, args: &Args, name: &str, minimum: usize) -> Result<Vec<f64>, Fault> {
    args.expect(name, 1, 1)?;
    args.finish(name)?;
    let items = interp.collect(&args.positional[0])?;
    let data = items
        .iter()
        .map(|item| item.expect_f64(&format!("{name}()")))
        .collect::<Result<Vec<_>, _>>()?;
    if data.len() < minimum {
        let message = if minimum == 1 {
            format!("{name} requires at least one data point")
        } else {
            format!("{name} requires at least two data points")
        };
        return Err(Fault::raise("StatisticsError", message));
    }
    Ok(data)
}

fn mean_of(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

fn squared_deviations(data: &[f64]) -> f64 {
    let mean = mean_of(data);
    data.iter().map(|x| (x - mean).powi(2)).sum()
}

fn stats_mean(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    let data = sample(interp, &args, "mean", 1)?;
    Ok(Value::Float(mean_of(&data)))
}

fn stats_median(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    let mut data = sample(interp, &args, "median", 1)?;
    data.sort_by(f64::total_cmp);
    let mid = data.len() / 2;
    let median = if data.len() % 2 == 1 {
        data[mid]
    } else {
        (data[mid - 1] + data[mid]) / 2.0
    };
    Ok(Value::Float(median))
}

fn stats_variance(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    let data = sample(interp, &args, "variance", 2)?;
    Ok(Value::Float(squared_deviations(&data) / (data.len() - 1) as f64))
}

fn stats_pvariance(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    let data = sample(interp, &args, "pvariance", 1)?;
    Ok(Value::Float(squared_deviations(&data) / data.len() as f64))
}

fn stats_stdev(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    let data = sample(interp, &args, "stdev", 2)?;
    Ok(Value::Float((squared_deviations(&data) / (data.len() - 1) as f64).sqrt()))
}

fn stats_pstdev(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    let data = sample(interp, &args, "pstdev", 1)?;
    Ok(Value::Float((squared_deviations(&data) / data.len() as f64).sqrt()))
}

// ---- datetime ----

static DATETIME: &[NativeFn] = &[
    NativeFn { name: "date", call: datetime_date },
    NativeFn { name: "parse_date", call: datetime_parse },
    NativeFn { name: "fromisoformat", call: datetime_parse },
    NativeFn { name: "days_between", call: datetime_days_between },
];

fn datetime_date(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("date", 3, 3)?;
    args.finish("date")?;
    let year = args.positional[0].expect_int("date() year")?;
    let month = args.positional[1].expect_int("date() month")?;
    let day = args.positional[2].expect_int("date() day")?;
    let (Ok(year), Ok(month), Ok(day)) = (i32::try_from(year), u32::try_from(month), u32::try_from(day)) else {
        return Err(Fault::value_error("date value out of range"));
    };
    NaiveDate::from_ymd_opt(year, month, day)
        .map(Value::Date)
        .ok_or_else(|| Fault::value_error("day is out of range for month"))
}

fn datetime_parse(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("parse_date", 1, 1)?;
    let text = args.positional[0].expect_str("parse_date()")?;
    let text = text.trim();
    // Timestamps keep only their date part.
    let date_part = text.split(['T', ' ']).next().unwrap_or(text);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map(Value::Date)
        .map_err(|_| Fault::value_error(format!("Invalid isoformat string: '{text}'")))
}

fn datetime_days_between(_: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("days_between", 2, 2)?;
    match (&args.positional[0], &args.positional[1]) {
        (Value::Date(start), Value::Date(end)) => Ok(Value::Int((*end - *start).num_days())),
        (a, b) => Err(Fault::type_error(format!(
            "days_between() expects two dates, got {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

// ---- series ----

static SERIES: &[NativeFn] = &[
    NativeFn { name: "diff", call: series_diff },
    NativeFn { name: "pct_change", call: series_pct_change },
    NativeFn { name: "cumsum", call: series_cumsum },
    NativeFn { name: "shift", call: series_shift },
    NativeFn { name: "rolling_mean", call: series_rolling_mean },
    NativeFn { name: "rolling_max", call: series_rolling_max },
    NativeFn { name: "rolling_min", call: series_rolling_min },
    NativeFn { name: "crossover", call: series_crossover },
    NativeFn { name: "crossunder", call: series_crossunder },
    NativeFn { name: "mean", call: series_mean },
];

fn lagged(values: &[f64], lag: usize, combine: impl Fn(f64, f64) -> Option<f64>) -> Series {
    (0..values.len())
        .map(|i| {
            if i < lag {
                return None;
            }
            combine(values[i - lag], values[i]).and_then(finite)
        })
        .collect()
}

fn series_diff(interp: &mut Interpreter, mut args: Args) -> Result<Value, Fault> {
    let lag = period(&mut args, 1, "periods", Some(1), "diff")?;
    args.finish("diff")?;
    args.expect("diff", 1, 2)?;
    let values = interp.collect_floats(&args.positional[0], "diff()")?;
    series_value(interp, lagged(&values, lag, |prev, cur| Some(cur - prev)))
}

fn series_pct_change(interp: &mut Interpreter, mut args: Args) -> Result<Value, Fault> {
    let lag = period(&mut args, 1, "periods", Some(1), "pct_change")?;
    args.finish("pct_change")?;
    args.expect("pct_change", 1, 2)?;
    let values = interp.collect_floats(&args.positional[0], "pct_change()")?;
    let out = lagged(&values, lag, |prev, cur| (prev != 0.0).then(|| cur / prev - 1.0));
    series_value(interp, out)
}

fn series_cumsum(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("cumsum", 1, 1)?;
    let values = interp.collect_floats(&args.positional[0], "cumsum()")?;
    let mut total = 0.0;
    let out = values
        .iter()
        .map(|&x| {
            if x.is_nan() {
                return None;
            }
            total += x;
            Some(total)
        })
        .collect();
    series_value(interp, out)
}

fn series_shift(interp: &mut Interpreter, mut args: Args) -> Result<Value, Fault> {
    let lag = match args.take(1, "periods") {
        Some(value) => value.expect_int("shift() periods")?,
        None => 1,
    };
    args.finish("shift")?;
    args.expect("shift", 1, 2)?;
    let items = interp.collect(&args.positional[0])?;
    let len = items.len();
    let offset = usize::try_from(lag.unsigned_abs()).unwrap_or(usize::MAX).min(len);
    let mut out: Vec<Value> = Vec::with_capacity(len);
    if lag >= 0 {
        out.extend(std::iter::repeat_n(Value::None, offset));
        out.extend(items.into_iter().take(len - offset));
    } else {
        out.extend(items.into_iter().skip(offset));
        out.extend(std::iter::repeat_n(Value::None, offset));
    }
    Ok(interp.heap().list(out)?)
}

fn rolling(
    interp: &mut Interpreter,
    mut args: Args,
    name: &str,
    reduce: fn(&[f64]) -> f64,
) -> Result<Value, Fault> {
    let window = period(&mut args, 1, "window", None, name)?;
    args.finish(name)?;
    args.expect(name, 1, 2)?;
    let values = interp.collect_floats(&args.positional[0], &format!("{name}()"))?;
    let out: Series = (0..values.len())
        .map(|i| {
            if i + 1 < window {
                return None;
            }
            let slice = &values[i + 1 - window..=i];
            if slice.iter().any(|x| x.is_nan()) {
                None
            } else {
                Some(reduce(slice))
            }
        })
        .collect();
    series_value(interp, out)
}

fn series_rolling_mean(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    rolling(interp, args, "rolling_mean", mean_of)
}

fn series_rolling_max(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    rolling(interp, args, "rolling_max", |w| w.iter().copied().fold(f64::NEG_INFINITY, f64::max))
}

fn series_rolling_min(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    rolling(interp, args, "rolling_min", |w| w.iter().copied().fold(f64::INFINITY, f64::min))
}

/// Second operand of a cross: a series, or a level applied at every point.
fn cross_operand(interp: &mut Interpreter, value: &Value, len: usize, name: &str) -> Result<Vec<f64>, Fault> {
    match value.as_f64() {
        Some(level) => Ok(vec![level; len]),
        None => interp.collect_floats(value, &format!("{name}()")),
    }
}

fn cross(interp: &mut Interpreter, args: Args, name: &str, upward: bool) -> Result<Value, Fault> {
    args.expect(name, 2, 2)?;
    args.finish(name)?;
    let fast = interp.collect_floats(&args.positional[0], &format!("{name}()"))?;
    let slow = cross_operand(interp, &args.positional[1], fast.len(), name)?;
    let len = fast.len().min(slow.len());
    let out: Vec<Value> = (0..len)
        .map(|i| {
            let crossed = i > 0 && {
                let (prev_fast, prev_slow, cur_fast, cur_slow) = (fast[i - 1], slow[i - 1], fast[i], slow[i]);
                if upward {
                    prev_fast <= prev_slow && cur_fast > cur_slow
                } else {
                    prev_fast >= prev_slow && cur_fast < cur_slow
                }
            };
            Value::Bool(crossed)
        })
        .collect();
    Ok(interp.heap().list(out)?)
}

fn series_crossover(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    cross(interp, args, "crossover", true)
}

fn series_crossunder(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    cross(interp, args, "crossunder", false)
}

fn series_mean(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("mean", 1, 1)?;
    let values = interp.collect_floats(&args.positional[0], "mean()")?;
    let present: Vec<f64> = values.into_iter().filter(|x| !x.is_nan()).collect();
    if present.is_empty() {
        return Ok(Value::None);
    }
    Ok(Value::Float(mean_of(&present)))
}

// ---- indicators ----

static INDICATORS: &[NativeFn] = &[
    NativeFn { name: "sma", call: ind_sma },
    NativeFn { name: "ema", call: ind_ema },
    NativeFn { name: "wma", call: ind_wma },
    NativeFn { name: "rsi", call: ind_rsi },
    NativeFn { name: "roc", call: ind_roc },
    NativeFn { name: "stddev", call: ind_stddev },
    NativeFn { name: "bollinger", call: ind_bollinger },
    NativeFn { name: "macd", call: ind_macd },
    NativeFn { name: "atr", call: ind_atr },
    NativeFn { name: "obv", call: ind_obv },
];

fn windowed(
    interp: &mut Interpreter,
    mut args: Args,
    name: &str,
    default: Option<usize>,
    calculate: fn(&[f64], usize) -> Series,
) -> Result<Value, Fault> {
    let window = period(&mut args, 1, "period", default, name)?;
    args.finish(name)?;
    args.expect(name, 1, 2)?;
    let values = interp.collect_floats(&args.positional[0], &format!("{name}()"))?;
    series_value(interp, aligned(&values, |v| calculate(v, window)))
}

fn ind_sma(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    windowed(interp, args, "sma", None, indicator::calculate_sma)
}

fn ind_ema(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    windowed(interp, args, "ema", None, indicator::calculate_ema)
}

fn ind_wma(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    windowed(interp, args, "wma", None, indicator::calculate_wma)
}

fn ind_rsi(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    windowed(interp, args, "rsi", Some(14), indicator::calculate_rsi)
}

fn ind_roc(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    windowed(interp, args, "roc", None, indicator::calculate_roc)
}

fn ind_stddev(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    windowed(interp, args, "stddev", None, indicator::calculate_stddev)
}

fn bands_dict(interp: &Interpreter, bands: [(&str, Series); 3]) -> Result<Value, Fault> {
    let dict = interp.heap().new_dict()?;
    for (key, series) in bands {
        dict.set_str(key, series_value(interp, series)?)?;
    }
    Ok(Value::Dict(dict))
}

fn ind_bollinger(interp: &mut Interpreter, mut args: Args) -> Result<Value, Fault> {
    let window = period(&mut args, 1, "period", Some(20), "bollinger")?;
    let multiplier = match args.take(2, "mult") {
        Some(value) => value.expect_f64("bollinger() mult")?,
        None => 2.0,
    };
    args.finish("bollinger")?;
    args.expect("bollinger", 1, 3)?;
    let values = interp.collect_floats(&args.positional[0], "bollinger()")?;
    let lead = leading_gaps(&values);
    let bands = indicator::calculate_bollinger(&values[lead..], window, multiplier);
    let pad = |series: Series| {
        let mut out = vec![None; lead];
        out.extend(series);
        out
    };
    bands_dict(
        interp,
        [
            ("upper", pad(bands.upper)),
            ("middle", pad(bands.middle)),
            ("lower", pad(bands.lower)),
        ],
    )
}

fn ind_macd(interp: &mut Interpreter, mut args: Args) -> Result<Value, Fault> {
    use crate::domain::indicator::macd::{DEFAULT_FAST, DEFAULT_SIGNAL, DEFAULT_SLOW};

    let fast = period(&mut args, 1, "fast", Some(DEFAULT_FAST), "macd")?;
    let slow = period(&mut args, 2, "slow", Some(DEFAULT_SLOW), "macd")?;
    let signal = period(&mut args, 3, "signal", Some(DEFAULT_SIGNAL), "macd")?;
    args.finish("macd")?;
    args.expect("macd", 1, 4)?;
    if fast >= slow {
        return Err(Fault::value_error("macd() fast period must be shorter than slow period"));
    }
    let values = interp.collect_floats(&args.positional[0], "macd()")?;
    let lead = leading_gaps(&values);
    let macd = indicator::calculate_macd(&values[lead..], fast, slow, signal);
    let pad = |series: Series| {
        let mut out = vec![None; lead];
        out.extend(series);
        out
    };
    bands_dict(
        interp,
        [
            ("line", pad(macd.line)),
            ("signal", pad(macd.signal)),
            ("histogram", pad(macd.histogram)),
        ],
    )
}

fn ind_atr(interp: &mut Interpreter, mut args: Args) -> Result<Value, Fault> {
    let window = period(&mut args, 3, "period", Some(14), "atr")?;
    args.finish("atr")?;
    args.expect("atr", 3, 4)?;
    let high = interp.collect_floats(&args.positional[0], "atr() high")?;
    let low = interp.collect_floats(&args.positional[1], "atr() low")?;
    let close = interp.collect_floats(&args.positional[2], "atr() close")?;
    let len = high.len().min(low.len()).min(close.len());
    let lead = leading_gaps(&high[..len])
        .max(leading_gaps(&low[..len]))
        .max(leading_gaps(&close[..len]));
    let mut out = vec![None; lead];
    out.extend(indicator::calculate_atr(&high[lead..len], &low[lead..len], &close[lead..len], window));
    series_value(interp, out)
}

fn ind_obv(interp: &mut Interpreter, args: Args) -> Result<Value, Fault> {
    args.expect("obv", 2, 2)?;
    args.finish("obv")?;
    let close = interp.collect_floats(&args.positional[0], "obv() close")?;
    let volume = interp.collect_floats(&args.positional[1], "obv() volume")?;
    let len = close.len().min(volume.len());
    let lead = leading_gaps(&close[..len]).max(leading_gaps(&volume[..len]));
    let mut out = vec![None; lead];
    out.extend(indicator::calculate_obv(&close[lead..len], &volume[lead..len]));
    series_value(interp, out)
}

// ---- backtest ----

static BACKTEST: &[NativeFn] = &[NativeFn { name: "simulate", call: backtest_simulate }];

fn config_from_keywords(args: &mut Args) -> Result<SimulationConfig, Fault> {
    let mut config = SimulationConfig::default();
    let fields: [(&str, &mut f64); 7] = [
        ("initial_capital", &mut config.initial_capital),
        ("position_size", &mut config.position_size),
        ("commission_per_trade", &mut config.commission_per_trade),
        ("commission_pct", &mut config.commission_pct),
        ("slippage_pct", &mut config.slippage_pct),
        ("stop_loss_pct", &mut config.stop_loss_pct),
        ("take_profit_pct", &mut config.take_profit_pct),
    ];
    for (name, slot) in fields {
        if let Some(value) = args.take_keyword(name) {
            let x = value.expect_f64(&format!("simulate() {name}"))?;
            if !x.is_finite() || x < 0.0 {
                return Err(Fault::value_error(format!(
                    "simulate() {name} must be a non-negative number"
                )));
            }
            *slot = x;
        }
    }
    if let Some(value) = args.take_keyword("allow_shorting") {
        config.allow_shorting = value.truthy();
    }
    if config.initial_capital <= 0.0 {
        return Err(Fault::value_error("simulate() initial_capital must be positive"));
    }
    Ok(config)
}

fn backtest_simulate(interp: &mut Interpreter, mut args: Args) -> Result<Value, Fault> {
    let config = config_from_keywords(&mut args)?;
    args.finish("simulate")?;
    args.expect("simulate", 2, 2)?;
    let close = interp.collect_floats(&args.positional[0], "simulate() close")?;
    let signals = interp.collect_floats(&args.positional[1], "simulate() signals")?;
    let result = simulator::simulate(&close, &signals, &config);

    let heap = interp.heap();
    heap.ensure_fits(result.trades.len().saturating_mul(SLOT_BYTES * 8))?;
    let mut trades = Vec::with_capacity(result.trades.len());
    for trade in &result.trades {
        let dict = heap.new_dict()?;
        dict.set_str("pnl", Value::Float(trade.pnl))?;
        if let Some(side) = trade.side {
            let side = match side {
                TradeSide::Long => "long",
                TradeSide::Short => "short",
            };
            dict.set_str("side", Value::str(side))?;
        }
        let indices = [("entry_index", trade.entry_index), ("exit_index", trade.exit_index)];
        for (key, index) in indices {
            if let Some(index) = index {
                dict.set_str(key, Value::Int(i64::try_from(index).unwrap_or(i64::MAX)))?;
            }
        }
        let prices = [
            ("entry_price", trade.entry_price),
            ("exit_price", trade.exit_price),
            ("quantity", trade.quantity),
        ];
        for (key, value) in prices {
            if let Some(value) = value {
                dict.set_str(key, Value::Float(value))?;
            }
        }
        trades.push(Value::Dict(dict));
    }

    let out = heap.new_dict()?;
    out.set_str("trades", heap.list(trades)?)?;
    out.set_str("equity", heap.float_list(&result.equity)?)?;
    Ok(Value::Dict(out))
}

#[cfg(test)]
mod tests {
    use crate::domain::limits::ExecutionBudget;
    use crate::domain::script::interpreter::Interpreter;
    use crate::domain::script::parse;

    fn run(source: &str) -> Interpreter {
        let program = parse(source).expect("parse");
        let mut interp = Interpreter::new(ExecutionBudget::unlimited(), 64);
        if let Err(fault) = interp.run(&program) {
            panic!("script failed: {}", fault.into_execution_error());
        }
        interp
    }

    fn global(interp: &Interpreter, name: &str) -> String {
        interp.global(name).expect("global").short_repr()
    }

    #[test]
    fn every_listed_module_loads() {
        for name in super::MODULE_NAMES {
            assert!(super::load(name).is_some(), "{name}");
        }
        assert!(super::load("os").is_none());
    }

    #[test]
    fn math_functions() {
        let interp = run("import math\na = math.sqrt(16)\nb = math.floor(-1.5)\nc = math.isnan(math.nan)\n");
        assert_eq!(global(&interp, "a"), "4.0");
        assert_eq!(global(&interp, "b"), "-2");
        assert_eq!(global(&interp, "c"), "True");
    }

    #[test]
    fn math_domain_error_is_catchable() {
        let interp = run("import math\ntry:\n    math.sqrt(-1)\n    ok = True\nexcept ValueError:\n    ok = False\n");
        assert_eq!(global(&interp, "ok"), "False");
    }

    #[test]
    fn statistics_functions() {
        let interp = run(
            "from statistics import mean, median, pstdev\na = mean([1, 2, 3, 4])\nb = median([3, 1, 2])\nc = pstdev([2, 4, 4, 4, 5, 5, 7, 9])\n",
        );
        assert_eq!(global(&interp, "a"), "2.5");
        assert_eq!(global(&interp, "b"), "2.0");
        assert_eq!(global(&interp, "c"), "2.0");
    }

    #[test]
    fn datetime_functions() {
        let interp = run(
            "import datetime as dt\nd = dt.date(2024, 1, 31)\nn = dt.days_between(d, dt.parse_date('2024-03-01'))\nw = d.weekday()\ns = d.add_days(1).isoformat()\n",
        );
        assert_eq!(global(&interp, "n"), "30");
        assert_eq!(global(&interp, "w"), "2");
        assert_eq!(global(&interp, "s"), "'2024-02-01'");
    }

    #[test]
    fn series_helpers() {
        let interp = run(
            "import series\nd = series.diff([1, 3, 6])\ns = series.shift([1, 2, 3], 1)\nx = series.crossover([1, 2, 3], [2, 2, 2])\nr = series.rolling_max([1, 3, 2, 5], 2)\n",
        );
        assert_eq!(global(&interp, "d"), "[None, 2.0, 3.0]");
        assert_eq!(global(&interp, "s"), "[None, 1, 2]");
        assert_eq!(global(&interp, "x"), "[False, False, True]");
        assert_eq!(global(&interp, "r"), "[None, 3.0, 3.0, 5.0]");
    }

    #[test]
    fn indicators_chain_past_warmup() {
        let interp = run(
            "from indicators import sma\nfast = sma([1, 2, 3, 4, 5], 2)\nslow = sma(fast, 2)\n",
        );
        assert_eq!(global(&interp, "fast"), "[None, 1.5, 2.5, 3.5, 4.5]");
        assert_eq!(global(&interp, "slow"), "[None, None, 2.0, 3.0, 4.0]");
    }

    #[test]
    fn indicator_period_must_be_positive() {
        let program = parse("import indicators\nindicators.sma([1, 2], 0)\n").unwrap();
        let mut interp = Interpreter::new(ExecutionBudget::unlimited(), 64);
        let err = interp.run(&program).unwrap_err().into_execution_error();
        assert_eq!(err.message, "ValueError: sma() period must be at least 1");
    }

    #[test]
    fn bollinger_and_macd_return_named_bands() {
        let interp = run(
            "import indicators\nb = indicators.bollinger([1.0] * 30, 20)\nm = indicators.macd([float(i) for i in range(60)])\nkeys = sorted(b.keys()) + sorted(m.keys())\n",
        );
        assert_eq!(
            global(&interp, "keys"),
            "['lower', 'middle', 'upper', 'histogram', 'line', 'signal']"
        );
    }

    #[test]
    fn simulate_returns_trades_and_equity() {
        let interp = run(
            "import backtest\nr = backtest.simulate([10, 11, 12, 11], [1, 1, 0, 0], initial_capital=1000)\nn = len(r['trades'])\npnl = r['trades'][0]['pnl']\nlength = len(r['equity'])\n",
        );
        assert_eq!(global(&interp, "n"), "1");
        assert_eq!(global(&interp, "pnl"), "200.0");
        assert_eq!(global(&interp, "length"), "4");
    }
}
