//! Tree-walking interpreter for strategy programs.
//!
//! Every statement, loop iteration and call ticks the `ExecutionBudget`, so
//! a tripped alarm or exhausted CPU allowance stops the script at the next
//! tick. Resource breaches surface as `Fault::Fatal` and are never visible
//! to `try`/`except` in the script.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use super::ast::{
    BoolOp, CmpOp, CompClause, ExceptHandler, Expr, ExprKind, FStringPart, FunctionDef, ImportName,
    Program, Stmt, StmtKind, Target, UnaryOp,
};
use super::builtins;
use super::modules;
use super::ops;
use super::value::{
    bury, compare_with_op, exception_matches, values_equal, Args, ExceptionObj, Fault, FunctionObj,
    Heap, RangeObj, Sweep, Value, ValueIter, SLOT_BYTES,
};
use crate::domain::error::{ExecutionError, ExecutionErrorKind};
use crate::domain::limits::{ExecutionBudget, MemoryMeter};

/// Lines of script output kept per execution.
pub const MAX_LOG_LINES: usize = 1000;
/// Characters kept per line of script output.
pub const MAX_LOG_LINE_CHARS: usize = 1000;
/// Combined nesting of statements and expressions across all active calls.
pub const MAX_EVAL_DEPTH: usize = 2_000;

/// Variables of one function activation (or comprehension).
pub struct Scope {
    vars: RefCell<HashMap<String, Value>>,
    parent: Option<Rc<Scope>>,
}

impl Scope {
    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars.borrow().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.borrow().contains_key(name)
    }

    pub fn set(&self, name: &str, value: Value) {
        let old = {
            let mut vars = self.vars.borrow_mut();
            match vars.get_mut(name) {
                Some(slot) => Some(std::mem::replace(slot, value)),
                None => {
                    vars.insert(name.to_string(), value);
                    None
                }
            }
        };
        drop(old);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.vars.borrow_mut().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.vars.borrow().keys().cloned().collect()
    }
}

impl Sweep for Scope {
    fn clear_contents(&self) {
        let old = std::mem::take(&mut *self.vars.borrow_mut());
        bury(old.into_values().collect());
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let vars = std::mem::take(self.vars.get_mut());
        bury(vars.into_values().collect());
    }
}

struct Frame {
    /// `None` at module level, where names live in the globals.
    locals: Option<Rc<Scope>>,
    global_names: HashSet<String>,
    nonlocal_names: HashSet<String>,
}

impl Frame {
    fn module() -> Self {
        Frame {
            locals: None,
            global_names: HashSet::new(),
            nonlocal_names: HashSet::new(),
        }
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

pub struct Interpreter {
    heap: Heap,
    budget: ExecutionBudget,
    globals: Rc<Scope>,
    builtins: HashMap<&'static str, Value>,
    modules: HashMap<String, Value>,
    frames: Vec<Frame>,
    /// Exceptions currently being handled, for bare `raise`.
    handling: Vec<Rc<ExceptionObj>>,
    max_call_depth: usize,
    depth: usize,
    logs: Vec<String>,
    suppressed_logs: usize,
}

fn fatal(kind: ExecutionErrorKind, message: impl Into<String>) -> Fault {
    Fault::Fatal(ExecutionError::new(kind, message))
}

impl Interpreter {
    pub fn new(budget: ExecutionBudget, max_call_depth: usize) -> Self {
        let heap = Heap::new(MemoryMeter::new(budget.memory_limit()));
        let globals = Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent: None,
        });
        let weak: Weak<dyn Sweep> = Rc::downgrade(&globals) as Weak<dyn Sweep>;
        heap.track(weak);
        globals.set("__name__", Value::str("strategy"));

        Interpreter {
            heap,
            budget,
            globals,
            builtins: builtins::table(),
            modules: HashMap::new(),
            frames: vec![Frame::module()],
            handling: Vec::new(),
            max_call_depth,
            depth: 0,
            logs: Vec::new(),
            suppressed_logs: 0,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn meter(&self) -> &MemoryMeter {
        self.heap.meter()
    }

    pub fn set_global(&self, name: &str, value: Value) {
        self.globals.set(name, value);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name)
    }

    /// Check the wall-clock and CPU budget.
    pub fn tick(&mut self) -> Result<(), Fault> {
        self.budget.check().map_err(Fault::Fatal)
    }

    /// Record one line of script output.
    pub fn log(&mut self, line: String) {
        tracing::debug!(target: "stratbox::script", "{line}");
        if self.logs.len() >= MAX_LOG_LINES {
            self.suppressed_logs += 1;
            return;
        }
        let line = match line.char_indices().nth(MAX_LOG_LINE_CHARS) {
            Some((cut, _)) => format!("{}...", &line[..cut]),
            None => line,
        };
        self.logs.push(line);
    }

    pub fn take_logs(&mut self) -> Vec<String> {
        let mut logs = std::mem::take(&mut self.logs);
        if self.suppressed_logs > 0 {
            logs.push(format!("... {} more lines suppressed", self.suppressed_logs));
            self.suppressed_logs = 0;
        }
        logs
    }

    pub fn run(&mut self, program: &Program) -> Result<(), Fault> {
        match self.exec_block(&program.body)? {
            Flow::Normal | Flow::Return(_) | Flow::Break | Flow::Continue => Ok(()),
        }
    }

    // ---- helpers used by builtins ----

    /// Materialize an iterable, checking the budget and memory as it grows.
    pub fn collect(&mut self, value: &Value) -> Result<Vec<Value>, Fault> {
        let iter = ValueIter::of(value)?;
        if let Some(n) = iter.remaining() {
            self.heap.ensure_fits(n.saturating_mul(SLOT_BYTES))?;
        }
        let mut out = Vec::new();
        for item in iter {
            if out.len() % 1024 == 1023 {
                self.tick()?;
                self.heap.ensure_fits(out.len() * SLOT_BYTES)?;
            }
            out.push(item);
        }
        Ok(out)
    }

    /// Visit an iterable's items without materializing it. `visit` returns
    /// false to stop early.
    pub fn walk(
        &mut self,
        value: &Value,
        mut visit: impl FnMut(&mut Self, Value) -> Result<bool, Fault>,
    ) -> Result<(), Fault> {
        for (i, item) in ValueIter::of(value)?.enumerate() {
            if i % 1024 == 1023 {
                self.tick()?;
            }
            if !visit(self, item)? {
                break;
            }
        }
        Ok(())
    }

    /// Numbers of an iterable as floats; `None` becomes NaN.
    pub fn collect_floats(&mut self, value: &Value, context: &str) -> Result<Vec<f64>, Fault> {
        let items = self.collect(value)?;
        items
            .iter()
            .map(|item| match item {
                Value::None => Ok(f64::NAN),
                other => other.expect_f64(context),
            })
            .collect()
    }

    pub fn call(&mut self, callee: &Value, args: Args) -> Result<Value, Fault> {
        self.tick()?;
        match callee {
            Value::Function(function) => self.call_function(function, args),
            Value::Native(native) => (native.call)(self, args),
            Value::BoundMethod(method) => {
                let receiver = method.receiver.clone();
                builtins::call_method(self, &receiver, method.name, args)
            }
            Value::ExceptionType(kind) => {
                args.finish(kind)?;
                let message = match args.arg(0) {
                    Some(value) => value.display(self.meter())?,
                    None => String::new(),
                };
                Ok(Value::Exception(Rc::new(ExceptionObj { kind, message })))
            }
            other => Err(Fault::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    // ---- scopes ----

    fn new_scope(&self, parent: Option<Rc<Scope>>) -> Rc<Scope> {
        let scope = Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent,
        });
        let weak: Weak<dyn Sweep> = Rc::downgrade(&scope) as Weak<dyn Sweep>;
        self.heap.track(weak);
        scope
    }

    fn lookup(&self, name: &str) -> Result<Value, Fault> {
        if let Some(frame) = self.frames.last() {
            if !frame.global_names.contains(name) {
                let mut scope = frame.locals.as_deref();
                while let Some(current) = scope {
                    if let Some(value) = current.get(name) {
                        return Ok(value);
                    }
                    scope = current.parent.as_deref();
                }
            }
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value);
        }
        self.builtins
            .get(name)
            .cloned()
            .ok_or_else(|| Fault::raise("NameError", format!("name '{name}' is not defined")))
    }

    /// Scope that `name` binds in for the current frame; `None` means globals.
    fn binding_scope(&self, name: &str) -> Result<Option<Rc<Scope>>, Fault> {
        let Some(frame) = self.frames.last() else {
            return Ok(None);
        };
        if frame.global_names.contains(name) {
            return Ok(None);
        }
        let Some(locals) = &frame.locals else {
            return Ok(None);
        };
        if frame.nonlocal_names.contains(name) {
            let mut scope = locals.parent.as_ref();
            while let Some(current) = scope {
                if current.contains(name) {
                    return Ok(Some(Rc::clone(current)));
                }
                scope = current.parent.as_ref();
            }
            return Err(Fault::raise(
                "NameError",
                format!("no binding for nonlocal '{name}' found"),
            ));
        }
        Ok(Some(Rc::clone(locals)))
    }

    fn store(&mut self, name: &str, value: Value) -> Result<(), Fault> {
        match self.binding_scope(name)? {
            Some(scope) => scope.set(name, value),
            None => self.globals.set(name, value),
        }
        Ok(())
    }

    fn delete_name(&mut self, name: &str) -> Result<(), Fault> {
        let removed = match self.binding_scope(name)? {
            Some(scope) => scope.remove(name),
            None => self.globals.remove(name),
        };
        match removed {
            Some(_) => Ok(()),
            None => Err(Fault::raise("NameError", format!("name '{name}' is not defined"))),
        }
    }

    fn enter(&mut self) -> Result<(), Fault> {
        self.depth += 1;
        if self.depth > MAX_EVAL_DEPTH {
            self.depth -= 1;
            return Err(fatal(
                ExecutionErrorKind::RecursionLimit,
                "evaluation nested too deeply",
            ));
        }
        Ok(())
    }

    // ---- statements ----

    fn exec_block(&mut self, body: &[Stmt]) -> Result<Flow, Fault> {
        for stmt in body {
            match self.exec(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, Fault> {
        self.enter()?;
        let result = self
            .tick()
            .and_then(|()| self.exec_kind(stmt))
            .map_err(|fault| fault.with_line(stmt.line));
        self.depth -= 1;
        result
    }

    fn exec_kind(&mut self, stmt: &Stmt) -> Result<Flow, Fault> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.exec_aug_assign(target, *op, value)?,
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                return self.exec_block(orelse);
            }
            StmtKind::While { test, body } => return self.exec_while(test, body),
            StmtKind::For { target, iter, body } => return self.exec_for(target, iter, body),
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => return self.exec_try(body, handlers, orelse, finalbody),
            StmtKind::FunctionDef(def) => {
                let function = self.make_function(def)?;
                self.store(&def.name, function)?;
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Import(names) => self.exec_import(names)?,
            StmtKind::FromImport { module, names } => self.exec_from_import(module, names)?,
            StmtKind::Raise(exc) => return Err(self.raise_value(exc.as_ref())?),
            StmtKind::Assert { test, message } => {
                if !self.eval(test)?.truthy() {
                    let message = match message {
                        Some(expr) => {
                            let value = self.eval(expr)?;
                            value.display(self.meter())?
                        }
                        None => String::new(),
                    };
                    return Err(Fault::raise("AssertionError", message));
                }
            }
            StmtKind::Del(targets) => {
                for target in targets {
                    self.delete(target)?;
                }
            }
            StmtKind::Global(names) => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.global_names.extend(names.iter().cloned());
                }
            }
            StmtKind::Nonlocal(names) => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.nonlocal_names.extend(names.iter().cloned());
                }
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
        }
        Ok(Flow::Normal)
    }

    fn exec_while(&mut self, test: &Expr, body: &[Stmt]) -> Result<Flow, Fault> {
        loop {
            self.tick()?;
            if !self.eval(test)?.truthy() {
                return Ok(Flow::Normal);
            }
            match self.exec_block(body)? {
                Flow::Break => return Ok(Flow::Normal),
                Flow::Normal | Flow::Continue => {}
                flow @ Flow::Return(_) => return Ok(flow),
            }
        }
    }

    fn exec_for(&mut self, target: &Target, iter: &Expr, body: &[Stmt]) -> Result<Flow, Fault> {
        let iterable = self.eval(iter)?;
        for item in ValueIter::of(&iterable)? {
            self.tick()?;
            self.assign(target, item)?;
            match self.exec_block(body)? {
                Flow::Break => break,
                Flow::Normal | Flow::Continue => {}
                flow @ Flow::Return(_) => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
    ) -> Result<Flow, Fault> {
        let outcome = match self.exec_block(body) {
            Ok(Flow::Normal) => self.exec_block(orelse),
            Ok(flow) => Ok(flow),
            Err(Fault::Raised { exception, line }) => self.handle(exception, line, handlers),
            Err(fatal) => return Err(fatal),
        };
        if finalbody.is_empty() || matches!(outcome, Err(Fault::Fatal(_))) {
            return outcome;
        }
        match self.exec_block(finalbody)? {
            Flow::Normal => outcome,
            flow => Ok(flow),
        }
    }

    fn handle(
        &mut self,
        exception: Rc<ExceptionObj>,
        line: Option<usize>,
        handlers: &[ExceptHandler],
    ) -> Result<Flow, Fault> {
        for handler in handlers {
            let matched = match &handler.kind {
                None => true,
                Some(expr) => {
                    let class = self.eval(expr)?;
                    handler_matches(&exception, &class)?
                }
            };
            if !matched {
                continue;
            }
            if let Some(name) = &handler.name {
                self.store(name, Value::Exception(Rc::clone(&exception)))?;
            }
            self.handling.push(exception);
            let result = self.exec_block(&handler.body);
            self.handling.pop();
            return result;
        }
        Err(Fault::Raised { exception, line })
    }

    fn raise_value(&mut self, exc: Option<&Expr>) -> Result<Fault, Fault> {
        let Some(expr) = exc else {
            return Ok(match self.handling.last() {
                Some(exception) => Fault::Raised {
                    exception: Rc::clone(exception),
                    line: None,
                },
                None => Fault::raise("RuntimeError", "No active exception to reraise"),
            });
        };
        match self.eval(expr)? {
            Value::ExceptionType(kind) => Ok(Fault::raise(kind, "")),
            Value::Exception(exception) => Ok(Fault::Raised {
                exception,
                line: None,
            }),
            other => Ok(Fault::type_error(format!(
                "exceptions must derive from Exception, not {}",
                other.type_name()
            ))),
        }
    }

    fn exec_import(&mut self, names: &[ImportName]) -> Result<(), Fault> {
        for name in names {
            let module = self.import_module(&name.path)?;
            let binding = name.alias.as_deref().unwrap_or(&name.path);
            self.store(binding, module)?;
        }
        Ok(())
    }

    fn exec_from_import(&mut self, module_name: &str, names: &[ImportName]) -> Result<(), Fault> {
        let module = self.import_module(module_name)?;
        let Value::Module(module) = module else {
            return Ok(());
        };
        if names.is_empty() {
            let members: Vec<(&'static str, Value)> =
                module.members.iter().map(|(k, v)| (*k, v.clone())).collect();
            for (name, value) in members {
                self.store(name, value)?;
            }
            return Ok(());
        }
        for name in names {
            let value = module.members.get(name.path.as_str()).cloned().ok_or_else(|| {
                Fault::raise(
                    "ImportError",
                    format!("cannot import name '{}' from '{module_name}'", name.path),
                )
            })?;
            self.store(name.alias.as_deref().unwrap_or(&name.path), value)?;
        }
        Ok(())
    }

    fn import_module(&mut self, path: &str) -> Result<Value, Fault> {
        if let Some(module) = self.modules.get(path) {
            return Ok(module.clone());
        }
        let module = modules::load(path)
            .ok_or_else(|| Fault::raise("ImportError", format!("No module named '{path}'")))?;
        self.modules.insert(path.to_string(), module.clone());
        Ok(module)
    }

    fn make_function(&mut self, def: &Rc<FunctionDef>) -> Result<Value, Fault> {
        let mut defaults = Vec::new();
        for param in &def.params {
            if let Some(default) = &param.default {
                defaults.push(self.eval(default)?);
            }
        }
        let closure = self.frames.last().and_then(|f| f.locals.clone());
        Ok(Value::Function(Rc::new(FunctionObj {
            def: Rc::clone(def),
            defaults,
            closure,
        })))
    }

    fn call_function(&mut self, function: &Rc<FunctionObj>, args: Args) -> Result<Value, Fault> {
        // The module frame does not count as a call.
        if self.frames.len() > self.max_call_depth {
            return Err(fatal(
                ExecutionErrorKind::RecursionLimit,
                format!("maximum call depth of {} exceeded", self.max_call_depth),
            ));
        }
        let def = &function.def;
        let params = &def.params;
        let name = def.name.as_str();
        let Args {
            positional,
            keywords,
        } = args;

        if positional.len() > params.len() {
            return Err(Fault::type_error(format!(
                "{name}() takes {} positional arguments but {} were given",
                params.len(),
                positional.len()
            )));
        }
        let mut bound: Vec<Option<Value>> = vec![None; params.len()];
        for (slot, value) in bound.iter_mut().zip(positional) {
            *slot = Some(value);
        }
        for (keyword, value) in keywords {
            match params.iter().position(|p| p.name == keyword) {
                Some(i) if bound[i].is_none() => bound[i] = Some(value),
                Some(_) => {
                    return Err(Fault::type_error(format!(
                        "{name}() got multiple values for argument '{keyword}'"
                    )));
                }
                None => {
                    return Err(Fault::type_error(format!(
                        "{name}() got an unexpected keyword argument '{keyword}'"
                    )));
                }
            }
        }

        let scope = self.new_scope(function.closure.clone());
        let first_default = params.len() - function.defaults.len();
        for (i, (param, slot)) in params.iter().zip(bound).enumerate() {
            let value = match slot {
                Some(value) => value,
                None if i >= first_default => function.defaults[i - first_default].clone(),
                None => {
                    return Err(Fault::type_error(format!(
                        "{name}() missing required argument: '{}'",
                        param.name
                    )));
                }
            };
            scope.set(&param.name, value);
        }

        self.frames.push(Frame {
            locals: Some(scope),
            global_names: HashSet::new(),
            nonlocal_names: HashSet::new(),
        });
        let result = self.exec_block(&def.body);
        self.frames.pop();
        match result? {
            Flow::Return(value) => Ok(value),
            Flow::Normal | Flow::Break | Flow::Continue => Ok(Value::None),
        }
    }

    // ---- assignment ----

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), Fault> {
        match target {
            Target::Name(name, _) => self.store(name, value),
            Target::Subscript { value: object, index } => {
                let container = self.eval(object)?;
                if let ExprKind::Slice { start, stop, step } = &index.kind {
                    let bounds = self.eval_slice_bounds(start, stop, step)?;
                    let items = self.collect(&value)?;
                    return builtins::assign_slice(&self.heap, &container, bounds, items);
                }
                let key = self.eval(index)?;
                builtins::set_item(&container, key, value)
            }
            Target::Attribute { value: object, attr, .. } => {
                let object = self.eval(object)?;
                Err(Fault::raise(
                    "AttributeError",
                    format!(
                        "'{}' object attribute '{attr}' is read-only",
                        object.type_name()
                    ),
                ))
            }
            Target::Tuple(targets) => {
                let items = self.collect(&value)?;
                if items.len() != targets.len() {
                    let message = if items.len() > targets.len() {
                        format!("too many values to unpack (expected {})", targets.len())
                    } else {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        )
                    };
                    return Err(Fault::value_error(message));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
                Ok(())
            }
        }
    }

    fn delete(&mut self, target: &Target) -> Result<(), Fault> {
        match target {
            Target::Name(name, _) => self.delete_name(name),
            Target::Subscript { value: object, index } => {
                let container = self.eval(object)?;
                if let ExprKind::Slice { start, stop, step } = &index.kind {
                    let bounds = self.eval_slice_bounds(start, stop, step)?;
                    return builtins::delete_slice(&container, bounds);
                }
                let key = self.eval(index)?;
                builtins::delete_item(&container, &key)
            }
            Target::Attribute { attr, .. } => Err(Fault::raise(
                "AttributeError",
                format!("cannot delete attribute '{attr}'"),
            )),
            Target::Tuple(targets) => {
                for target in targets {
                    self.delete(target)?;
                }
                Ok(())
            }
        }
    }

    fn exec_aug_assign(&mut self, target: &Target, op: super::ast::BinOp, value: &Expr) -> Result<(), Fault> {
        match target {
            Target::Name(name, _) => {
                let current = self.lookup(name)?;
                let operand = self.eval(value)?;
                let result = self.augmented(op, current, &operand)?;
                self.store(name, result)
            }
            Target::Subscript { value: object, index } => {
                let container = self.eval(object)?;
                if matches!(index.kind, ExprKind::Slice { .. }) {
                    return Err(Fault::type_error("augmented assignment to a slice is not supported"));
                }
                let key = self.eval(index)?;
                let current = builtins::get_item(&container, &key)?;
                let operand = self.eval(value)?;
                let result = self.augmented(op, current, &operand)?;
                builtins::set_item(&container, key, result)
            }
            Target::Attribute { attr, .. } => Err(Fault::raise(
                "AttributeError",
                format!("attribute '{attr}' is read-only"),
            )),
            Target::Tuple(_) => Err(Fault::type_error(
                "illegal target for augmented assignment",
            )),
        }
    }

    /// `+=` extends lists in place; everything else rebinds.
    fn augmented(&mut self, op: super::ast::BinOp, current: Value, operand: &Value) -> Result<Value, Fault> {
        if let (super::ast::BinOp::Add, Value::List(list)) = (op, &current) {
            let items = self.collect(operand)?;
            self.heap.ensure_fits(items.len().saturating_mul(SLOT_BYTES))?;
            list.borrow_mut().extend(items);
            list.sync()?;
            return Ok(current);
        }
        ops::binary(&self.heap, op, &current, operand)
    }

    // ---- expressions ----

    pub(crate) fn eval(&mut self, expr: &Expr) -> Result<Value, Fault> {
        self.enter()?;
        let result = self.eval_kind(expr).map_err(|fault| fault.with_line(expr.line));
        self.depth -= 1;
        result
    }

    fn eval_kind(&mut self, expr: &Expr) -> Result<Value, Fault> {
        match &expr.kind {
            ExprKind::None => Ok(Value::None),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Int(i) => Ok(Value::Int(*i)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Str(s) => Ok(self.heap.string(s.clone())?),
            ExprKind::FString(parts) => self.eval_fstring(parts),
            ExprKind::Name(name) => self.lookup(name),
            ExprKind::List(items) => {
                let values = self.eval_all(items)?;
                Ok(self.heap.list(values)?)
            }
            ExprKind::Tuple(items) => {
                let values = self.eval_all(items)?;
                Ok(self.heap.tuple(values)?)
            }
            ExprKind::Dict(entries) => self.eval_dict(entries),
            ExprKind::Attribute { value, attr } => {
                let object = self.eval(value)?;
                builtins::get_attribute(&object, attr)
            }
            ExprKind::Subscript { value, index } => self.eval_subscript(value, index),
            ExprKind::Slice { .. } => Err(Fault::type_error("slice used outside of a subscript")),
            ExprKind::Call {
                func,
                args,
                keywords,
            } => self.eval_call(func, args, keywords),
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    _ => ops::unary(*op, &value),
                }
            }
            ExprKind::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                ops::binary(&self.heap, *op, &left, &right)
            }
            ExprKind::BoolOp { op, left, right } => {
                let left = self.eval(left)?;
                let short_circuit = match op {
                    BoolOp::And => !left.truthy(),
                    BoolOp::Or => left.truthy(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            ExprKind::Compare { left, ops } => self.eval_compare(left, ops),
            ExprKind::IfExp { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            ExprKind::Lambda(def) => self.make_function(def),
            ExprKind::ListComp { element, clauses } => self.eval_list_comp(element, clauses),
            ExprKind::DictComp { key, value, clauses } => self.eval_dict_comp(key, value, clauses),
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> Result<Vec<Value>, Fault> {
        let mut values = Vec::with_capacity(exprs.len());
        for expr in exprs {
            values.push(self.eval(expr)?);
        }
        Ok(values)
    }

    fn eval_dict(&mut self, entries: &[(Expr, Expr)]) -> Result<Value, Fault> {
        let dict = self.heap.new_dict()?;
        for (key, value) in entries {
            let key = self.eval(key)?;
            let value = self.eval(value)?;
            dict.insert(key, value)?;
        }
        Ok(Value::Dict(dict))
    }

    fn eval_fstring(&mut self, parts: &[FStringPart]) -> Result<Value, Fault> {
        let mut out = String::new();
        for part in parts {
            match part {
                FStringPart::Literal(text) => out.push_str(text),
                FStringPart::Field {
                    expr,
                    conversion,
                    spec,
                } => {
                    let value = self.eval(expr)?;
                    let value = match conversion {
                        Some('r') => self.heap.string(value.repr(self.meter())?)?,
                        Some(_) => self.heap.string(value.display(self.meter())?)?,
                        None => value,
                    };
                    let spec = match spec {
                        Some(spec) if spec.contains('{') => {
                            let nested = self.expand_nested_spec(spec)?;
                            ops::format_value(&value, &nested, self.meter())?
                        }
                        Some(spec) => ops::format_value(&value, spec, self.meter())?,
                        None => value.display(self.meter())?,
                    };
                    out.push_str(&spec);
                    self.heap.ensure_fits(out.len())?;
                }
            }
        }
        Ok(self.heap.string(out)?)
    }

    /// `{value:.{digits}f}` style specs with a nested name.
    fn expand_nested_spec(&mut self, spec: &str) -> Result<String, Fault> {
        let mut out = String::new();
        let mut rest = spec;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let close = rest[open..]
                .find('}')
                .map(|i| open + i)
                .ok_or_else(|| Fault::value_error("unmatched '{' in format spec"))?;
            let name = rest[open + 1..close].trim();
            let value = self.lookup(name)?;
            out.push_str(&value.display(self.meter())?);
            rest = &rest[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn eval_slice_bounds(
        &mut self,
        start: &Option<Box<Expr>>,
        stop: &Option<Box<Expr>>,
        step: &Option<Box<Expr>>,
    ) -> Result<SliceBounds, Fault> {
        let bound = |this: &mut Self, expr: &Option<Box<Expr>>| -> Result<Option<i64>, Fault> {
            match expr {
                None => Ok(None),
                Some(expr) => match this.eval(expr)? {
                    Value::None => Ok(None),
                    value => value.expect_int("slice indices").map(Some),
                },
            }
        };
        Ok(SliceBounds {
            start: bound(self, start)?,
            stop: bound(self, stop)?,
            step: bound(self, step)?,
        })
    }

    fn eval_subscript(&mut self, value: &Expr, index: &Expr) -> Result<Value, Fault> {
        let container = self.eval(value)?;
        if let ExprKind::Slice { start, stop, step } = &index.kind {
            let bounds = self.eval_slice_bounds(start, stop, step)?;
            return builtins::get_slice(&self.heap, &container, bounds);
        }
        let key = self.eval(index)?;
        builtins::get_item(&container, &key)
    }

    fn eval_call(&mut self, func: &Expr, args: &[Expr], keywords: &[(String, Expr)]) -> Result<Value, Fault> {
        let callee = self.eval(func)?;
        let positional = self.eval_all(args)?;
        let mut named = Vec::with_capacity(keywords.len());
        for (name, expr) in keywords {
            named.push((name.clone(), self.eval(expr)?));
        }
        self.call(
            &callee,
            Args {
                positional,
                keywords: named,
            },
        )
    }

    fn eval_compare(&mut self, left: &Expr, ops: &[(CmpOp, Expr)]) -> Result<Value, Fault> {
        let mut left = self.eval(left)?;
        for (op, right) in ops {
            let right = self.eval(right)?;
            if !compare(*op, &left, &right)? {
                return Ok(Value::Bool(false));
            }
            left = right;
        }
        Ok(Value::Bool(true))
    }

    /// Run `body` with a fresh child scope for comprehension variables.
    fn in_child_scope<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T, Fault>) -> Result<T, Fault> {
        let saved = self.frames.last().and_then(|f| f.locals.clone());
        let child = self.new_scope(saved.clone());
        if let Some(frame) = self.frames.last_mut() {
            frame.locals = Some(child);
        }
        let result = body(self);
        if let Some(frame) = self.frames.last_mut() {
            frame.locals = saved;
        }
        result
    }

    fn run_clauses(
        &mut self,
        clauses: &[CompClause],
        emit: &mut dyn FnMut(&mut Self) -> Result<(), Fault>,
    ) -> Result<(), Fault> {
        let Some((first, rest)) = clauses.split_first() else {
            return emit(self);
        };
        match first {
            CompClause::For { target, iter } => {
                let iterable = self.eval(iter)?;
                for item in ValueIter::of(&iterable)? {
                    self.tick()?;
                    self.assign(target, item)?;
                    self.run_clauses(rest, emit)?;
                }
            }
            CompClause::If(test) => {
                if self.eval(test)?.truthy() {
                    self.run_clauses(rest, emit)?;
                }
            }
        }
        Ok(())
    }

    fn eval_list_comp(&mut self, element: &Expr, clauses: &[CompClause]) -> Result<Value, Fault> {
        let list = self.heap.new_list(Vec::new())?;
        self.in_child_scope(|this| {
            this.run_clauses(clauses, &mut |this| {
                let value = this.eval(element)?;
                list.push(value)?;
                Ok(())
            })
        })?;
        Ok(Value::List(list))
    }

    fn eval_dict_comp(&mut self, key: &Expr, value: &Expr, clauses: &[CompClause]) -> Result<Value, Fault> {
        let dict = self.heap.new_dict()?;
        self.in_child_scope(|this| {
            this.run_clauses(clauses, &mut |this| {
                let k = this.eval(key)?;
                let v = this.eval(value)?;
                dict.insert(k, v)
            })
        })?;
        Ok(Value::Dict(dict))
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        self.modules.clear();
        self.heap.sweep();
    }
}

/// Slice bounds as written; normalized against a length by `indices`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SliceBounds {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl SliceBounds {
    /// Positions selected from a sequence of `len` items.
    pub fn indices(&self, len: usize) -> Result<RangeObj, Fault> {
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(Fault::value_error("slice step cannot be zero"));
        }
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let (lower, upper) = if step > 0 { (0, len) } else { (-1, len - 1) };
        let clamp = |bound: Option<i64>, default: i64| match bound {
            None => default,
            Some(b) if b < 0 => (b.saturating_add(len)).max(lower),
            Some(b) => b.min(upper),
        };
        let start = clamp(self.start, if step > 0 { lower } else { upper });
        let stop = clamp(self.stop, if step > 0 { upper } else { lower });
        Ok(RangeObj { start, stop, step })
    }
}

fn handler_matches(exception: &ExceptionObj, class: &Value) -> Result<bool, Fault> {
    match class {
        Value::ExceptionType(name) => Ok(exception_matches(exception.kind, name)),
        Value::Tuple(classes) => {
            for class in classes.snapshot() {
                if handler_matches(exception, &class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(Fault::type_error(format!(
            "catching '{}' is not allowed; except clauses need exception classes",
            other.type_name()
        ))),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, Fault> {
    use std::cmp::Ordering::{Equal, Greater, Less};

    Ok(match op {
        CmpOp::Eq => values_equal(left, right)?,
        CmpOp::NotEq => !values_equal(left, right)?,
        CmpOp::In => ops::contains(right, left)?,
        CmpOp::NotIn => !ops::contains(right, left)?,
        CmpOp::Is => left.is_same(right),
        CmpOp::IsNot => !left.is_same(right),
        CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE => {
            let ordering = compare_with_op(left, right, op.symbol())?;
            matches!(
                (op, ordering),
                (CmpOp::Lt, Some(Less))
                    | (CmpOp::LtE, Some(Less | Equal))
                    | (CmpOp::Gt, Some(Greater))
                    | (CmpOp::GtE, Some(Greater | Equal))
            )
        }
    })
}
