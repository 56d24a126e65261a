//! Stack-based bytecode virtual machine.
//!
//! This module executes [`Module`]s produced by the compiler using a
//! fetch-decode-execute loop over a flat instruction array. All runtime
//! state lives here: the value stack, the frame stack, the slot-addressed
//! globals (pre-seeded from the built-in registry by name), and the output
//! sink. The VM is single-threaded and synchronous; no instruction may
//! suspend.
//!
//! Every failure (operand mismatch, stack underflow, invalid index, arity
//! mismatch, division by zero) aborts the run with a diagnostic naming
//! the executing function and its instruction pointer.

use std::cell::RefCell;
use std::rc::Rc;

use crate::builtins;
use crate::bytecode::{CompiledFunction, Module, Op};
use crate::error::{Error, Result};
use crate::operators;
use crate::value::{BoundMethod, Cell, Closure, Instance, Value};

/// Callback type for the embedder's output sink.
pub type OutputFn = Box<dyn FnMut(&str)>;

enum Output {
    /// Default: printed lines accumulate until [`Vm::take_output`].
    Buffer(Vec<String>),
    /// Embedder-supplied sink, invoked synchronously by `Print`.
    Callback(OutputFn),
}

/// The record of one active invocation.
struct Frame {
    function: Rc<CompiledFunction>,
    /// Index of the next instruction to execute.
    ip: usize,
    /// Local slots; grown on demand up to the function's `local_count`.
    locals: Vec<Value>,
    /// Shared cells for captured variables.
    cells: Vec<Cell>,
    stack_base: usize,
}

impl Frame {
    /// Slots never stored read as `none`.
    fn local(&self, slot: u32) -> Value {
        self.locals.get(slot as usize).cloned().unwrap_or(Value::None)
    }

    fn set_local(&mut self, slot: u32, value: Value) {
        let slot = slot as usize;
        if slot >= self.locals.len() {
            self.locals.resize(slot + 1, Value::None);
        }
        self.locals[slot] = value;
    }
}

enum Flow {
    Continue,
    Halt(Value),
}

/// The bytecode virtual machine.
///
/// A `Vm` may be reused across `run` calls; each run starts from a clean
/// stack and re-seeds the globals for the module being executed.
pub struct Vm {
    stack: Vec<Value>,
    globals: Vec<Option<Value>>,
    output: Output,
    instruction_limit: Option<u64>,
    call_depth_limit: Option<usize>,
    instruction_count: u64,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            globals: Vec::new(),
            output: Output::Buffer(Vec::new()),
            instruction_limit: None,
            call_depth_limit: None,
            instruction_count: 0,
        }
    }

    /// Install an output callback in place of the default buffer.
    pub fn set_output(&mut self, f: impl FnMut(&str) + 'static) {
        self.output = Output::Callback(Box::new(f));
    }

    /// Drain the buffered output. Empty when a callback is installed.
    pub fn take_output(&mut self) -> Vec<String> {
        match &mut self.output {
            Output::Buffer(lines) => std::mem::take(lines),
            Output::Callback(_) => Vec::new(),
        }
    }

    /// Configure resource limits; `None` disables a limit.
    pub fn set_limits(&mut self, instruction_limit: Option<u64>, call_depth_limit: Option<usize>) {
        self.instruction_limit = instruction_limit;
        self.call_depth_limit = call_depth_limit;
    }

    /// Execute a module's top-level code and return the final value.
    pub fn run(&mut self, module: &Module) -> Result<Value> {
        self.stack.clear();
        self.instruction_count = 0;

        // Seed global slots whose names match the built-in registry.
        self.globals = module
            .globals
            .iter()
            .map(|name| builtins::lookup(name).map(Value::Native))
            .collect();

        let main = Rc::new(CompiledFunction {
            name: "<main>".to_string(),
            arity: 0,
            local_count: 0,
            upvalues: Vec::new(),
            code: module.main_code.clone(),
        });
        let mut frames = vec![Frame {
            function: main,
            ip: 0,
            locals: Vec::new(),
            cells: Vec::new(),
            stack_base: 0,
        }];

        loop {
            let frame = frames.last().expect("frame");
            let function = frame.function.clone();
            let ip = frame.ip;

            if ip >= function.code.len() {
                // Running off the end behaves like a halt.
                return Ok(self.stack.pop().unwrap_or(Value::None));
            }
            let op = function.code[ip];
            frames.last_mut().expect("frame").ip = ip + 1;

            self.instruction_count += 1;
            if let Some(limit) = self.instruction_limit
                && self.instruction_count > limit
            {
                return Err(Error::runtime(format!(
                    "instruction limit of {} exceeded",
                    limit
                ))
                .with_frame(&function.name, ip));
            }

            match self.step(op, module, &mut frames) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt(value)) => return Ok(value),
                Err(err) => return Err(err.with_frame(&function.name, ip)),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn step(&mut self, op: Op, module: &Module, frames: &mut Vec<Frame>) -> Result<Flow> {
        match op {
            Op::LoadConst(i) => {
                let value = self.constant(module, i)?;
                self.stack.push(value);
            }
            Op::LoadVar(i) => {
                let value = frames.last().expect("frame").local(i);
                self.stack.push(value);
            }
            Op::StoreVar(i) => {
                let value = self.pop()?;
                frames.last_mut().expect("frame").set_local(i, value);
            }
            Op::LoadGlobal(i) => {
                let slot = self
                    .globals
                    .get(i as usize)
                    .ok_or_else(|| Error::runtime("global slot out of range"))?;
                match slot {
                    Some(value) => self.stack.push(value.clone()),
                    None => {
                        return Err(Error::runtime(format!(
                            "undefined global '{}'",
                            module.globals[i as usize]
                        )));
                    }
                }
            }
            Op::StoreGlobal(i) => {
                let value = self.pop()?;
                let slot = self
                    .globals
                    .get_mut(i as usize)
                    .ok_or_else(|| Error::runtime("global slot out of range"))?;
                *slot = Some(value);
            }
            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| Error::runtime("stack underflow"))?;
                self.stack.push(top);
            }

            // --- Arithmetic ---
            Op::Add => self.binary(operators::add)?,
            Op::Sub => self.binary(operators::sub)?,
            Op::Mul => self.binary(operators::mul)?,
            Op::Div => self.binary(operators::div)?,
            Op::Mod => self.binary(operators::modulo)?,
            Op::Pow => self.binary(operators::pow)?,
            Op::Neg => {
                let operand = self.pop()?;
                self.stack.push(operators::neg(&operand)?);
            }

            // --- Comparison ---
            Op::Eq => {
                let (left, right) = self.pop_pair()?;
                self.stack.push(Value::Bool(left == right));
            }
            Op::Ne => {
                let (left, right) = self.pop_pair()?;
                self.stack.push(Value::Bool(left != right));
            }
            Op::Lt => self.compare(|o| o == std::cmp::Ordering::Less)?,
            Op::Gt => self.compare(|o| o == std::cmp::Ordering::Greater)?,
            Op::Le => self.compare(|o| o != std::cmp::Ordering::Greater)?,
            Op::Ge => self.compare(|o| o != std::cmp::Ordering::Less)?,

            // --- Logic ---
            Op::And => {
                let (left, right) = self.pop_pair()?;
                self.stack
                    .push(Value::Bool(left.is_truthy() && right.is_truthy()));
            }
            Op::Or => {
                let (left, right) = self.pop_pair()?;
                self.stack
                    .push(Value::Bool(left.is_truthy() || right.is_truthy()));
            }
            Op::Not => {
                let operand = self.pop()?;
                self.stack.push(Value::Bool(!operand.is_truthy()));
            }

            // --- Control flow ---
            Op::Jump(target) => self.jump(frames, target)?,
            Op::JumpIfFalse(target) => {
                if !self.pop()?.is_truthy() {
                    self.jump(frames, target)?;
                }
            }
            Op::JumpIfTrue(target) => {
                if self.pop()?.is_truthy() {
                    self.jump(frames, target)?;
                }
            }

            // --- Functions ---
            Op::Call(argc) => {
                let callee = self.pop()?;
                self.call(callee, argc as usize, frames)?;
            }
            Op::Return => {
                let value = self.pop()?;
                let finished = frames.pop().expect("frame");
                self.stack.truncate(finished.stack_base);
                if frames.is_empty() {
                    return Ok(Flow::Halt(value));
                }
                self.stack.push(value);
            }
            Op::MakeClosure(_) => {
                let function = match self.pop()? {
                    Value::Function(f) => f,
                    other => {
                        return Err(Error::runtime(format!(
                            "MAKE_CLOSURE expects a function constant, got {}",
                            other.type_name()
                        )));
                    }
                };
                let frame = frames.last().expect("frame");
                let mut cells = Vec::with_capacity(function.upvalues.len());
                for descriptor in &function.upvalues {
                    if descriptor.is_local {
                        // A fresh cell initialized from the parent's local.
                        cells.push(Rc::new(RefCell::new(frame.local(descriptor.index))));
                    } else {
                        let cell = frame
                            .cells
                            .get(descriptor.index as usize)
                            .cloned()
                            .ok_or_else(|| Error::runtime("invalid upvalue index"))?;
                        cells.push(cell);
                    }
                }
                self.stack
                    .push(Value::Closure(Rc::new(Closure { function, cells })));
            }
            Op::LoadUpvalue(i) => {
                let frame = frames.last().expect("frame");
                let cell = frame
                    .cells
                    .get(i as usize)
                    .ok_or_else(|| Error::runtime("invalid upvalue index"))?;
                let value = cell.borrow().clone();
                self.stack.push(value);
            }
            Op::StoreUpvalue(i) => {
                let value = self.pop()?;
                let frame = frames.last().expect("frame");
                let cell = frame
                    .cells
                    .get(i as usize)
                    .ok_or_else(|| Error::runtime("invalid upvalue index"))?;
                *cell.borrow_mut() = value;
            }

            // --- Objects ---
            Op::MakeList(n) => {
                let items = self.pop_many(n as usize)?;
                self.stack.push(Value::list(items));
            }
            Op::MakeMap(n) => {
                let raw = self.pop_many(n as usize * 2)?;
                let mut pairs = Vec::with_capacity(n as usize);
                for chunk in raw.chunks(2) {
                    let Value::Str(key) = &chunk[0] else {
                        return Err(Error::runtime(format!(
                            "map keys must be strings, got {}",
                            chunk[0].type_name()
                        )));
                    };
                    pairs.push((key.clone(), chunk[1].clone()));
                }
                self.stack.push(Value::map(pairs));
            }
            Op::GetIndex => {
                let index = self.pop()?;
                let object = self.pop()?;
                let value = self.get_index(&object, &index)?;
                self.stack.push(value);
            }
            Op::SetIndex => {
                let index = self.pop()?;
                let object = self.pop()?;
                let value = self.pop()?;
                self.set_index(&object, &index, value)?;
            }
            Op::GetAttr(i) => {
                let name = self.attr_name(module, i)?;
                let object = self.pop()?;
                let value = self.get_attr(&object, &name)?;
                self.stack.push(value);
            }
            Op::SetAttr(i) => {
                let name = self.attr_name(module, i)?;
                let object = self.pop()?;
                let value = self.pop()?;
                match object {
                    Value::Instance(instance) => {
                        instance.borrow_mut().set_field(&name, value);
                    }
                    other => {
                        return Err(Error::runtime(format!(
                            "cannot set field '{}' on {}",
                            name,
                            other.type_name()
                        )));
                    }
                }
            }
            Op::NewInstance(argc) => {
                let class = match self.pop()? {
                    Value::Class(class) => class,
                    other => {
                        return Err(Error::runtime(format!(
                            "'new' expects a class, got {}",
                            other.type_name()
                        )));
                    }
                };
                let args = self.pop_many(argc as usize)?;
                // Extra arguments are ignored; fields without an argument
                // remain absent.
                let fields = class
                    .fields
                    .iter()
                    .zip(args)
                    .map(|(name, value)| (name.clone(), value))
                    .collect();
                self.stack.push(Value::Instance(Rc::new(RefCell::new(
                    Instance { class, fields },
                ))));
            }

            // --- Built-in ---
            Op::Print(n) => {
                let args = self.pop_many(n as usize)?;
                let line = args
                    .iter()
                    .map(Value::display)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.write(&line);
                self.stack.push(Value::None);
            }

            // --- Meta ---
            Op::Nop => {}
            Op::Halt => {
                return Ok(Flow::Halt(self.stack.pop().unwrap_or(Value::None)));
            }
        }
        Ok(Flow::Continue)
    }

    // -----------------------------------------------------------------------
    // Call dispatch
    // -----------------------------------------------------------------------

    /// Dispatch a call by callee kind. The arguments have the topmost stack
    /// value as the last-declared argument.
    fn call(&mut self, callee: Value, argc: usize, frames: &mut Vec<Frame>) -> Result<()> {
        let args = self.pop_many(argc)?;
        match callee {
            Value::Native(native) => {
                if native.arity >= 0 && native.arity as usize != argc {
                    return Err(Error::runtime(format!(
                        "arity mismatch: {}() expects {} arguments, got {}",
                        native.name, native.arity, argc
                    )));
                }
                let result = (native.f)(&args)?;
                self.stack.push(result);
            }
            Value::Function(function) => {
                self.push_frame(function, args, Vec::new(), frames)?;
            }
            Value::Closure(closure) => {
                self.push_frame(
                    closure.function.clone(),
                    args,
                    closure.cells.clone(),
                    frames,
                )?;
            }
            Value::Bound(bound) => {
                // The declared arity includes the implicit receiver.
                let declared = bound.method.arity as usize;
                if declared != argc + 1 {
                    return Err(Error::runtime(format!(
                        "arity mismatch: {}() expects {} arguments, got {}",
                        bound.method.name,
                        declared - 1,
                        argc
                    )));
                }
                let mut locals = Vec::with_capacity(argc + 1);
                locals.push(bound.receiver.clone());
                locals.extend(args);
                self.push_frame_with_locals(bound.method.clone(), locals, Vec::new(), frames)?;
            }
            Value::Class(class) => {
                return Err(Error::runtime(format!(
                    "class '{}' is not callable; construct it with 'new'",
                    class.name
                )));
            }
            other => {
                return Err(Error::runtime(format!(
                    "value of type {} is not callable",
                    other.type_name()
                )));
            }
        }
        Ok(())
    }

    fn push_frame(
        &mut self,
        function: Rc<CompiledFunction>,
        args: Vec<Value>,
        cells: Vec<Cell>,
        frames: &mut Vec<Frame>,
    ) -> Result<()> {
        if function.arity as usize != args.len() {
            return Err(Error::runtime(format!(
                "arity mismatch: {}() expects {} arguments, got {}",
                function.name,
                function.arity,
                args.len()
            )));
        }
        self.push_frame_with_locals(function, args, cells, frames)
    }

    fn push_frame_with_locals(
        &mut self,
        function: Rc<CompiledFunction>,
        mut locals: Vec<Value>,
        cells: Vec<Cell>,
        frames: &mut Vec<Frame>,
    ) -> Result<()> {
        if let Some(limit) = self.call_depth_limit
            && frames.len() >= limit
        {
            return Err(Error::runtime(format!(
                "call depth limit of {} exceeded",
                limit
            )));
        }
        if locals.len() < function.local_count as usize {
            locals.resize(function.local_count as usize, Value::None);
        }
        frames.push(Frame {
            function,
            ip: 0,
            locals,
            cells,
            stack_base: self.stack.len(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operand helpers
    // -----------------------------------------------------------------------

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Error::runtime("stack underflow"))
    }

    /// Pop `(left, right)` where `right` was on top.
    fn pop_pair(&mut self) -> Result<(Value, Value)> {
        let right = self.pop()?;
        let left = self.pop()?;
        Ok((left, right))
    }

    /// Pop `n` values preserving their push order.
    fn pop_many(&mut self, n: usize) -> Result<Vec<Value>> {
        if self.stack.len() < n {
            return Err(Error::runtime("stack underflow"));
        }
        let start = self.stack.len() - n;
        Ok(self.stack.drain(start..).collect())
    }

    fn binary(&mut self, f: fn(&Value, &Value) -> Result<Value>) -> Result<()> {
        let (left, right) = self.pop_pair()?;
        self.stack.push(f(&left, &right)?);
        Ok(())
    }

    fn compare(&mut self, accept: fn(std::cmp::Ordering) -> bool) -> Result<()> {
        let (left, right) = self.pop_pair()?;
        let ordering = operators::order(&left, &right)?;
        self.stack.push(Value::Bool(accept(ordering)));
        Ok(())
    }

    fn jump(&self, frames: &mut [Frame], target: u32) -> Result<()> {
        let frame = frames.last_mut().expect("frame");
        if target as usize > frame.function.code.len() {
            return Err(Error::runtime(format!("invalid jump target {}", target)));
        }
        frame.ip = target as usize;
        Ok(())
    }

    fn constant(&self, module: &Module, index: u32) -> Result<Value> {
        module
            .constants
            .get(index as usize)
            .cloned()
            .ok_or_else(|| Error::runtime(format!("constant index {} out of range", index)))
    }

    fn attr_name(&self, module: &Module, index: u32) -> Result<String> {
        match self.constant(module, index)? {
            Value::Str(name) => Ok(name),
            other => Err(Error::runtime(format!(
                "attribute name constant is not a string, got {}",
                other.type_name()
            ))),
        }
    }

    fn write(&mut self, line: &str) {
        match &mut self.output {
            Output::Buffer(lines) => lines.push(line.to_string()),
            Output::Callback(f) => f(line),
        }
    }

    // -----------------------------------------------------------------------
    // Indexing and attributes
    // -----------------------------------------------------------------------

    fn get_index(&self, object: &Value, index: &Value) -> Result<Value> {
        match (object, index) {
            (Value::List(items), Value::Int(i)) => {
                let items = items.borrow();
                usize::try_from(*i)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| {
                        Error::runtime(format!(
                            "list index {} out of bounds (len {})",
                            i,
                            items.len()
                        ))
                    })
            }
            (Value::Str(s), Value::Int(i)) => usize::try_from(*i)
                .ok()
                .and_then(|i| s.chars().nth(i))
                .map(|c| Value::Str(c.to_string()))
                .ok_or_else(|| {
                    Error::runtime(format!(
                        "string index {} out of bounds (len {})",
                        i,
                        s.chars().count()
                    ))
                }),
            (Value::Map(pairs), Value::Str(key)) => pairs
                .borrow()
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| Error::runtime(format!("key '{}' not found", key))),
            (Value::Map(_), other) => Err(Error::runtime(format!(
                "map keys are strings, got {}",
                other.type_name()
            ))),
            (other, _) => Err(Error::runtime(format!(
                "type {} is not indexable",
                other.type_name()
            ))),
        }
    }

    fn set_index(&self, object: &Value, index: &Value, value: Value) -> Result<()> {
        match (object, index) {
            (Value::List(items), Value::Int(i)) => {
                let mut items = items.borrow_mut();
                let len = items.len();
                let slot = usize::try_from(*i)
                    .ok()
                    .filter(|i| *i < len)
                    .ok_or_else(|| {
                        Error::runtime(format!("list index {} out of bounds (len {})", i, len))
                    })?;
                items[slot] = value;
                Ok(())
            }
            (Value::Map(pairs), Value::Str(key)) => {
                let mut pairs = pairs.borrow_mut();
                if let Some(entry) = pairs.iter_mut().find(|(k, _)| k == key) {
                    entry.1 = value;
                } else {
                    pairs.push((key.clone(), value));
                }
                Ok(())
            }
            (other, _) => Err(Error::runtime(format!(
                "type {} does not support index assignment",
                other.type_name()
            ))),
        }
    }

    /// Attribute access: instance fields shadow methods; a method resolves
    /// to a bound method carrying the receiver. Lists, maps, and strings
    /// expose `length`.
    fn get_attr(&self, object: &Value, name: &str) -> Result<Value> {
        match object {
            Value::Instance(instance) => {
                let inner = instance.borrow();
                if let Some(value) = inner.field(name) {
                    return Ok(value.clone());
                }
                if let Some(method) = inner.class.method(name) {
                    return Ok(Value::Bound(Rc::new(BoundMethod {
                        receiver: Value::Instance(instance.clone()),
                        method: method.clone(),
                    })));
                }
                Err(Error::runtime(format!(
                    "undefined field or method '{}' on {}",
                    name, inner.class.name
                )))
            }
            Value::List(items) if name == "length" => {
                Ok(Value::Int(items.borrow().len() as i64))
            }
            Value::Map(pairs) if name == "length" => Ok(Value::Int(pairs.borrow().len() as i64)),
            Value::Str(s) if name == "length" => Ok(Value::Int(s.chars().count() as i64)),
            other => Err(Error::runtime(format!(
                "type {} has no attribute '{}'",
                other.type_name(),
                name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;

    fn run(source: &str) -> (Result<Value>, Vec<String>) {
        let module = compile(source).unwrap();
        let mut vm = Vm::new();
        let result = vm.run(&module);
        let output = vm.take_output();
        (result, output)
    }

    #[test]
    fn test_closure_cells_are_shared_not_copied() {
        let (result, _) = run("var c = 0
                               fun make() { c = c + 1 return c }
                               make()
                               make()");
        assert_eq!(result.unwrap(), Value::None);
        let (result, output) = run("var c = 0
                                    fun inc() { c = c + 1 return c }
                                    print(inc())
                                    print(inc())");
        result.unwrap();
        assert_eq!(output, vec!["1", "2"]);
    }

    #[test]
    fn test_print_pushes_none_and_writes_once() {
        let (result, output) = run("let r = print(1, \"two\", 3.0) print(r)");
        result.unwrap();
        assert_eq!(output, vec!["1 two 3", "none"]);
    }

    #[test]
    fn test_output_callback_is_invoked_synchronously() {
        let module = compile("print(\"a\") print(\"b\")").unwrap();
        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = lines.clone();
        let mut vm = Vm::new();
        vm.set_output(move |line| sink.borrow_mut().push(line.to_string()));
        vm.run(&module).unwrap();
        assert_eq!(*lines.borrow(), vec!["a", "b"]);
        assert!(vm.take_output().is_empty());
    }

    #[test]
    fn test_undefined_global_names_the_slot() {
        let (result, _) = run("mystery(1)");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("undefined global 'mystery'"));
    }

    #[test]
    fn test_instruction_limit() {
        let module = compile("while true { }").unwrap();
        let mut vm = Vm::new();
        vm.set_limits(Some(1_000), None);
        let err = vm.run(&module).unwrap_err();
        assert!(err.to_string().contains("instruction limit"));
    }

    #[test]
    fn test_call_depth_limit() {
        let module = compile("fun loop() { return loop() } loop()").unwrap();
        let mut vm = Vm::new();
        vm.set_limits(None, Some(64));
        let err = vm.run(&module).unwrap_err();
        assert!(err.to_string().contains("call depth limit"));
    }

    #[test]
    fn test_runtime_error_carries_function_and_ip() {
        let (result, _) = run("fun boom() { return 1 / 0 } boom()");
        let err = result.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("runtime error in boom at instruction"));
        assert!(message.contains("Division by zero"));
    }

    #[test]
    fn test_globals_resolve_by_slot_with_builtin_seeding() {
        let (result, _) = run("sqrt(16.0)");
        assert_eq!(result.unwrap(), Value::None);
        let (result, output) = run("print(sqrt(16.0))");
        result.unwrap();
        assert_eq!(output, vec!["4"]);
    }

    #[test]
    fn test_shadowing_a_builtin_global() {
        let (result, output) = run("fun sqrt(x) { return 99 } print(sqrt(16.0))");
        result.unwrap();
        assert_eq!(output, vec!["99"]);
    }
}
