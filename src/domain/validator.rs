//! Static screening of strategy source before it reaches the sandbox.
//!
//! The validator parses the code and walks the syntax tree in source order,
//! stopping at the first forbidden import, name or attribute. It never
//! executes anything.

use serde::Serialize;

use crate::domain::outcome::StrategyCode;
use crate::domain::script::ast::{
    CompClause, ExceptHandler, Expr, ExprKind, FStringPart, FunctionDef, ImportName, Program,
    Stmt, StmtKind, Target,
};
use crate::domain::script::modules::MODULE_NAMES;
use crate::domain::script::parse;

/// Names a strategy may neither call nor mention.
pub const BLOCKED_NAMES: &[&str] = &[
    "exec",
    "eval",
    "compile",
    "__import__",
    "open",
    "input",
    "breakpoint",
    "globals",
    "locals",
    "vars",
    "dir",
    "getattr",
    "setattr",
    "delattr",
    "help",
    "exit",
    "quit",
    "memoryview",
    "__builtins__",
];

/// Introspection attributes. Any other `__dunder__` attribute is refused too.
pub const BLOCKED_ATTRIBUTES: &[&str] = &[
    "__dict__",
    "__class__",
    "__bases__",
    "__base__",
    "__mro__",
    "__subclasses__",
    "__globals__",
    "__builtins__",
    "__code__",
    "__closure__",
    "__func__",
    "__self__",
    "__module__",
    "__getattribute__",
    "__reduce__",
    "__reduce_ex__",
    "__init_subclass__",
    "__loader__",
    "__spec__",
    "f_globals",
    "f_locals",
    "f_back",
    "gi_frame",
    "tb_frame",
    "co_code",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorConfig {
    /// Source larger than this is rejected without parsing.
    pub max_code_bytes: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            max_code_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationVerdict {
    pub is_valid: bool,
    pub reason: Option<String>,
}

impl ValidationVerdict {
    pub fn valid() -> Self {
        ValidationVerdict {
            is_valid: true,
            reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        ValidationVerdict {
            is_valid: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Validator { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn check(&self, code: &StrategyCode) -> ValidationVerdict {
        if code.len() > self.config.max_code_bytes {
            return ValidationVerdict::invalid(format!(
                "strategy source is {} bytes, limit is {}",
                code.len(),
                self.config.max_code_bytes
            ));
        }
        let program = match parse(code.as_str()) {
            Ok(program) => program,
            Err(err) => return ValidationVerdict::invalid(err.to_string()),
        };
        match check_program(&program) {
            Ok(()) => ValidationVerdict::valid(),
            Err(violation) => ValidationVerdict::invalid(violation),
        }
    }
}

type Walk = Result<(), String>;

fn check_program(program: &Program) -> Walk {
    check_block(&program.body)
}

fn check_block(body: &[Stmt]) -> Walk {
    body.iter().try_for_each(check_stmt)
}

fn check_stmt(stmt: &Stmt) -> Walk {
    let line = stmt.line;
    match &stmt.kind {
        StmtKind::Expr(expr) => check_expr(expr),
        StmtKind::Assign { targets, value } => {
            targets.iter().try_for_each(|t| check_target(t, line))?;
            check_expr(value)
        }
        StmtKind::AugAssign { target, value, .. } => {
            check_target(target, line)?;
            check_expr(value)
        }
        StmtKind::If { branches, orelse } => {
            for (test, body) in branches {
                check_expr(test)?;
                check_block(body)?;
            }
            check_block(orelse)
        }
        StmtKind::While { test, body } => {
            check_expr(test)?;
            check_block(body)
        }
        StmtKind::For { target, iter, body } => {
            check_target(target, line)?;
            check_expr(iter)?;
            check_block(body)
        }
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => {
            check_block(body)?;
            handlers.iter().try_for_each(check_handler)?;
            check_block(orelse)?;
            check_block(finalbody)
        }
        StmtKind::FunctionDef(def) => check_function(def),
        StmtKind::Return(value) | StmtKind::Raise(value) => {
            value.as_ref().map_or(Ok(()), check_expr)
        }
        StmtKind::Import(names) => names.iter().try_for_each(|name| {
            check_module(&name.path, line)?;
            check_alias(name, line)
        }),
        StmtKind::FromImport { module, names } => {
            check_module(module, line)?;
            names.iter().try_for_each(|name| {
                check_name(&name.path, line)?;
                check_alias(name, line)
            })
        }
        StmtKind::Assert { test, message } => {
            check_expr(test)?;
            message.as_ref().map_or(Ok(()), check_expr)
        }
        StmtKind::Del(targets) => targets.iter().try_for_each(|t| check_target(t, line)),
        StmtKind::Global(names) | StmtKind::Nonlocal(names) => {
            names.iter().try_for_each(|name| check_name(name, line))
        }
        StmtKind::Break | StmtKind::Continue | StmtKind::Pass => Ok(()),
    }
}

fn check_handler(handler: &ExceptHandler) -> Walk {
    if let Some(kind) = &handler.kind {
        check_expr(kind)?;
    }
    if let Some(name) = &handler.name {
        check_name(name, handler.line)?;
    }
    check_block(&handler.body)
}

fn check_function(def: &FunctionDef) -> Walk {
    check_name(&def.name, def.line)?;
    for param in &def.params {
        check_name(&param.name, def.line)?;
        if let Some(default) = &param.default {
            check_expr(default)?;
        }
    }
    check_block(&def.body)
}

fn check_module(path: &str, line: usize) -> Walk {
    let root = path.split('.').next().unwrap_or(path);
    if MODULE_NAMES.contains(&root) {
        Ok(())
    } else {
        Err(format!("disallowed import '{path}' at line {line}"))
    }
}

fn check_alias(name: &ImportName, line: usize) -> Walk {
    name.alias
        .as_deref()
        .map_or(Ok(()), |alias| check_name(alias, line))
}

fn check_name(name: &str, line: usize) -> Walk {
    if BLOCKED_NAMES.contains(&name) {
        Err(format!("disallowed reference to '{name}' at line {line}"))
    } else {
        Ok(())
    }
}

fn check_attribute(attr: &str, line: usize) -> Walk {
    let dunder = attr.len() > 4 && attr.starts_with("__") && attr.ends_with("__");
    if dunder || BLOCKED_ATTRIBUTES.contains(&attr) {
        Err(format!("disallowed attribute access '{attr}' at line {line}"))
    } else {
        Ok(())
    }
}

fn check_target(target: &Target, line: usize) -> Walk {
    match target {
        Target::Name(name, line) => check_name(name, *line),
        Target::Subscript { value, index } => {
            check_expr(value)?;
            check_expr(index)
        }
        Target::Attribute { value, attr, line } => {
            check_expr(value)?;
            check_attribute(attr, *line)
        }
        Target::Tuple(items) => items.iter().try_for_each(|t| check_target(t, line)),
    }
}

fn check_clauses(clauses: &[CompClause], line: usize) -> Walk {
    clauses.iter().try_for_each(|clause| match clause {
        CompClause::For { target, iter } => {
            check_target(target, line)?;
            check_expr(iter)
        }
        CompClause::If(test) => check_expr(test),
    })
}

fn check_optional(expr: &Option<Box<Expr>>) -> Walk {
    expr.as_deref().map_or(Ok(()), check_expr)
}

fn check_expr(expr: &Expr) -> Walk {
    let line = expr.line;
    match &expr.kind {
        ExprKind::None
        | ExprKind::Bool(_)
        | ExprKind::Int(_)
        | ExprKind::Float(_)
        | ExprKind::Str(_) => Ok(()),
        ExprKind::FString(parts) => parts.iter().try_for_each(|part| match part {
            FStringPart::Literal(_) => Ok(()),
            FStringPart::Field { expr, .. } => check_expr(expr),
        }),
        ExprKind::Name(name) => check_name(name, line),
        ExprKind::List(items) | ExprKind::Tuple(items) => items.iter().try_for_each(check_expr),
        ExprKind::Dict(entries) => entries.iter().try_for_each(|(key, value)| {
            check_expr(key)?;
            check_expr(value)
        }),
        ExprKind::Attribute { value, attr } => {
            check_expr(value)?;
            check_attribute(attr, line)
        }
        ExprKind::Subscript { value, index } => {
            check_expr(value)?;
            check_expr(index)
        }
        ExprKind::Slice { start, stop, step } => {
            check_optional(start)?;
            check_optional(stop)?;
            check_optional(step)
        }
        ExprKind::Call {
            func,
            args,
            keywords,
        } => {
            match &func.kind {
                ExprKind::Name(name) if BLOCKED_NAMES.contains(&name.as_str()) => {
                    return Err(format!("disallowed call to '{name}' at line {}", func.line));
                }
                _ => check_expr(func)?,
            }
            args.iter().try_for_each(check_expr)?;
            keywords.iter().try_for_each(|(_, value)| check_expr(value))
        }
        ExprKind::Unary { operand, .. } => check_expr(operand),
        ExprKind::Binary { left, right, .. } | ExprKind::BoolOp { left, right, .. } => {
            check_expr(left)?;
            check_expr(right)
        }
        ExprKind::Compare { left, ops } => {
            check_expr(left)?;
            ops.iter().try_for_each(|(_, right)| check_expr(right))
        }
        ExprKind::IfExp { test, body, orelse } => {
            check_expr(body)?;
            check_expr(test)?;
            check_expr(orelse)
        }
        ExprKind::Lambda(def) => check_function(def),
        ExprKind::ListComp { element, clauses } => {
            check_expr(element)?;
            check_clauses(clauses, line)
        }
        ExprKind::DictComp {
            key,
            value,
            clauses,
        } => {
            check_expr(key)?;
            check_expr(value)?;
            check_clauses(clauses, line)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(source: &str) -> ValidationVerdict {
        Validator::default().check(&StrategyCode::from(source))
    }

    fn reason(source: &str) -> String {
        let v = verdict(source);
        assert!(!v.is_valid, "expected rejection of {source:?}");
        v.reason.unwrap_or_default()
    }

    #[test]
    fn allow_listed_imports_are_accepted() {
        let v = verdict(
            "import math\nimport indicators as ta\nfrom series import crossover\n\
             from datetime import date\ntrades = [math.sqrt(4.0)]\n",
        );
        assert_eq!(v, ValidationVerdict::valid());
    }

    #[test]
    fn disallowed_import_names_module_and_line() {
        assert_eq!(reason("x = 1\nimport os\n"), "disallowed import 'os' at line 2");
        assert_eq!(
            reason("from subprocess import run\n"),
            "disallowed import 'subprocess' at line 1"
        );
        assert_eq!(reason("import os.path\n"), "disallowed import 'os.path' at line 1");
    }

    #[test]
    fn dotted_import_checks_the_root_module() {
        assert!(verdict("import math.fake\n").is_valid);
    }

    #[test]
    fn blocked_call_is_named_as_a_call() {
        assert_eq!(
            reason("data = open(\"/etc/passwd\")\n"),
            "disallowed call to 'open' at line 1"
        );
    }

    #[test]
    fn blocked_name_in_nested_function_branch() {
        let source = "def strategy(data):\n    if True:\n        f = eval\n    return {}\n";
        assert_eq!(reason(source), "disallowed reference to 'eval' at line 3");
    }

    #[test]
    fn blocked_names_cannot_be_rebound() {
        assert_eq!(reason("open = 1\n"), "disallowed reference to 'open' at line 1");
        assert_eq!(reason("def exec():\n    pass\n"), "disallowed reference to 'exec' at line 1");
        assert_eq!(
            reason("def f(globals):\n    pass\n"),
            "disallowed reference to 'globals' at line 1"
        );
        assert_eq!(
            reason("import math as vars\n"),
            "disallowed reference to 'vars' at line 1"
        );
    }

    #[test]
    fn introspection_attributes_are_blocked() {
        assert_eq!(
            reason("x = [].__class__\n"),
            "disallowed attribute access '__class__' at line 1"
        );
        assert_eq!(
            reason("def f():\n    pass\ng = f.__globals__\n"),
            "disallowed attribute access '__globals__' at line 3"
        );
        assert_eq!(
            reason("x = [1]\ny = x.__len__\n"),
            "disallowed attribute access '__len__' at line 2"
        );
        assert_eq!(reason("y = z.f_back\n"), "disallowed attribute access 'f_back' at line 1");
    }

    #[test]
    fn attribute_assignment_is_checked() {
        assert_eq!(
            reason("x = 1\nx.__dict__ = {}\n"),
            "disallowed attribute access '__dict__' at line 2"
        );
    }

    #[test]
    fn first_violation_in_source_order_wins() {
        assert_eq!(
            reason("import os\nx = eval('1')\n"),
            "disallowed import 'os' at line 1"
        );
        assert_eq!(
            reason("y = [open(p) for p in exec('x')]\n"),
            "disallowed call to 'open' at line 1"
        );
    }

    #[test]
    fn comprehension_and_fstring_contents_are_walked() {
        assert_eq!(
            reason("x = [v for v in range(3) if dir(v)]\n"),
            "disallowed call to 'dir' at line 1"
        );
        assert_eq!(
            reason("x = f\"{getattr(1, 'a')}\"\n"),
            "disallowed call to 'getattr' at line 1"
        );
    }

    #[test]
    fn lambda_bodies_are_walked() {
        assert_eq!(
            reason("f = lambda: __import__('os')\n"),
            "disallowed call to '__import__' at line 1"
        );
    }

    #[test]
    fn syntax_errors_report_position() {
        let r = reason("if True\n    x = 1\n");
        assert!(r.starts_with("syntax error at line 1"), "{r}");
    }

    #[test]
    fn oversized_source_is_rejected_before_parsing() {
        let validator = Validator::new(ValidatorConfig { max_code_bytes: 8 });
        let v = validator.check(&StrategyCode::from("trades = [1, 2, 3]\n"));
        assert!(!v.is_valid);
        assert_eq!(v.reason.as_deref(), Some("strategy source is 19 bytes, limit is 8"));
    }

    #[test]
    fn deep_nesting_is_rejected_not_overflowed() {
        let source = format!("x = {}1{}\n", "(".repeat(5000), ")".repeat(5000));
        assert!(!verdict(&source).is_valid);
    }

    #[test]
    fn ordinary_strategy_is_valid() {
        let source = "\
import indicators
from series import crossover

def strategy(data, params):
    fast = indicators.sma(data['close'], params.get('fast', 5))
    slow = indicators.sma(data['close'], 20)
    trades = []
    for i, hit in enumerate(crossover(fast, slow)):
        if hit:
            trades.append({'pnl': data['close'][i] - data['open'][i]})
    return {'trades': trades, 'equity': []}
";
        assert_eq!(verdict(source), ValidationVerdict::valid());
    }
}
