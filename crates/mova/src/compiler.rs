//! Bytecode compiler: lowers the AST to a [`Module`] in a single pass.
//!
//! The compiler maintains a constant pool (deduplicated by value equality
//! for primitives), an ordered globals table, and a stack of function
//! contexts. Each context owns its instruction buffer, lexical scope chain,
//! local-slot high-water mark, and upvalue descriptors. Jumps are emitted
//! with a placeholder target of `0` and patched in place once the real
//! target is known.
//!
//! Name resolution walks: current locals, already-captured upvalues, then
//! outward through enclosing function contexts (capturing a chain of
//! upvalue descriptors grounded in a local); anything else becomes a global
//! slot, created on first sight so `new ClassName(...)` may appear before
//! the class declaration.

use std::rc::Rc;

use crate::ast::{
    BinaryOp, ClassDecl, Expr, LambdaBody, MatchArm, Pattern, Program, Stmt, UnaryOp,
};
use crate::bytecode::{CompiledFunction, Module, Op, UpvalueDescriptor};
use crate::error::{Error, Result};
use crate::token::Pos;
use crate::value::{ClassValue, Value};

struct LocalVar {
    name: String,
    depth: u32,
}

struct FunctionContext {
    name: String,
    arity: u32,
    code: Vec<Op>,
    locals: Vec<LocalVar>,
    scope_depth: u32,
    /// High-water mark of local slots; scope exit frees slots for reuse
    /// without shrinking the frame.
    local_count: u32,
    upvalues: Vec<UpvalueDescriptor>,
    upvalue_names: Vec<String>,
    /// Method bodies are detached: they never capture enclosing scopes,
    /// so their free names resolve to globals.
    detached: bool,
}

impl FunctionContext {
    fn new(name: &str, params: &[String], detached: bool) -> Self {
        let locals: Vec<LocalVar> = params
            .iter()
            .map(|p| LocalVar {
                name: p.clone(),
                depth: 0,
            })
            .collect();
        Self {
            name: name.to_string(),
            arity: params.len() as u32,
            local_count: locals.len() as u32,
            code: Vec::new(),
            locals,
            scope_depth: 0,
            upvalues: Vec::new(),
            upvalue_names: Vec::new(),
            detached,
        }
    }
}

enum Binding {
    Local(u32),
    Upvalue(u32),
    Global(u32),
}

enum FnBody<'a> {
    Stmts(&'a [Stmt]),
    Expr(&'a Expr),
}

pub struct Compiler {
    constants: Vec<Value>,
    globals: Vec<String>,
    functions: Vec<Rc<CompiledFunction>>,
    contexts: Vec<FunctionContext>,
    match_counter: usize,
}

impl Compiler {
    /// Compile a parsed program into a module.
    pub fn compile(program: &Program) -> Result<Module> {
        let mut compiler = Compiler {
            constants: Vec::new(),
            globals: Vec::new(),
            functions: Vec::new(),
            contexts: vec![FunctionContext::new("<main>", &[], false)],
            match_counter: 0,
        };

        for stmt in &program.statements {
            compiler.compile_stmt(stmt)?;
        }
        compiler.emit(Op::Halt);

        let main = compiler.contexts.pop().expect("main context");
        Ok(Module {
            constants: compiler.constants,
            globals: compiler.globals,
            functions: compiler.functions,
            main_code: main.code,
        })
    }

    // -----------------------------------------------------------------------
    // Emission helpers
    // -----------------------------------------------------------------------

    fn context(&mut self) -> &mut FunctionContext {
        self.contexts.last_mut().expect("function context")
    }

    fn emit(&mut self, op: Op) {
        self.context().code.push(op);
    }

    fn offset(&self) -> u32 {
        self.contexts.last().expect("function context").code.len() as u32
    }

    /// Emit a jump with a placeholder target; returns its index for patching.
    fn emit_jump(&mut self, make: fn(u32) -> Op) -> usize {
        let idx = self.offset() as usize;
        self.emit(make(0));
        idx
    }

    /// Point a previously emitted jump at the current offset.
    fn patch_jump(&mut self, idx: usize) {
        let target = self.offset();
        match &mut self.context().code[idx] {
            Op::Jump(t) | Op::JumpIfFalse(t) | Op::JumpIfTrue(t) => *t = target,
            other => unreachable!("patch_jump on non-jump {:?}", other),
        }
    }

    /// Intern a constant. Primitives are deduplicated by value equality.
    fn add_const(&mut self, value: Value) -> u32 {
        let primitive = matches!(
            value,
            Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_)
        );
        if primitive
            && let Some(i) = self.constants.iter().position(|c| *c == value)
        {
            return i as u32;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    fn emit_const(&mut self, value: Value) {
        let idx = self.add_const(value);
        self.emit(Op::LoadConst(idx));
    }

    /// Find or create the global slot for a name.
    fn global_slot(&mut self, name: &str) -> u32 {
        if let Some(i) = self.globals.iter().position(|g| g == name) {
            return i as u32;
        }
        self.globals.push(name.to_string());
        (self.globals.len() - 1) as u32
    }

    fn unsupported(&self, what: &str, pos: Pos) -> Error {
        Error::Parse {
            message: format!("{} is not supported by the bytecode compiler", what),
            line: pos.line,
            column: pos.column,
        }
    }

    // -----------------------------------------------------------------------
    // Scopes and name resolution
    // -----------------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.context().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let ctx = self.context();
        ctx.scope_depth -= 1;
        let depth = ctx.scope_depth;
        while ctx.locals.last().is_some_and(|l| l.depth > depth) {
            ctx.locals.pop();
        }
    }

    /// Reserve a fresh local slot for `name` in the current scope.
    fn declare_local(&mut self, name: &str) -> u32 {
        let depth = self.context().scope_depth;
        let ctx = self.context();
        ctx.locals.push(LocalVar {
            name: name.to_string(),
            depth,
        });
        let slot = (ctx.locals.len() - 1) as u32;
        ctx.local_count = ctx.local_count.max(ctx.locals.len() as u32);
        slot
    }

    fn find_local(&self, ctx: usize, name: &str) -> Option<u32> {
        self.contexts[ctx]
            .locals
            .iter()
            .rposition(|l| l.name == name)
            .map(|i| i as u32)
    }

    fn resolve(&mut self, name: &str) -> Binding {
        let current = self.contexts.len() - 1;
        if let Some(slot) = self.find_local(current, name) {
            return Binding::Local(slot);
        }
        if let Some(slot) = self.contexts[current]
            .upvalue_names
            .iter()
            .position(|n| n == name)
        {
            return Binding::Upvalue(slot as u32);
        }
        if let Some(slot) = self.resolve_upvalue(current, name) {
            return Binding::Upvalue(slot);
        }
        Binding::Global(self.global_slot(name))
    }

    /// Capture `name` from an enclosing function context, appending upvalue
    /// descriptors along the chain until one is grounded in a local.
    fn resolve_upvalue(&mut self, ctx: usize, name: &str) -> Option<u32> {
        if ctx == 0 || self.contexts[ctx].detached {
            return None;
        }
        let parent = ctx - 1;
        if let Some(local) = self.find_local(parent, name) {
            return Some(self.add_upvalue(ctx, true, local, name));
        }
        if let Some(up) = self.contexts[parent]
            .upvalue_names
            .iter()
            .position(|n| n == name)
        {
            return Some(self.add_upvalue(ctx, false, up as u32, name));
        }
        let up = self.resolve_upvalue(parent, name)?;
        Some(self.add_upvalue(ctx, false, up, name))
    }

    fn add_upvalue(&mut self, ctx: usize, is_local: bool, index: u32, name: &str) -> u32 {
        if let Some(i) = self.contexts[ctx]
            .upvalues
            .iter()
            .position(|d| d.is_local == is_local && d.index == index)
        {
            return i as u32;
        }
        self.contexts[ctx]
            .upvalues
            .push(UpvalueDescriptor { is_local, index });
        self.contexts[ctx].upvalue_names.push(name.to_string());
        (self.contexts[ctx].upvalues.len() - 1) as u32
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Binding { name, value, .. } => {
                // The value compiles before the name is visible, so
                // `let x = x` refers to any outer or global `x`.
                self.compile_expr(value)?;
                let slot = self.declare_local(name);
                self.emit(Op::StoreVar(slot));
            }

            Stmt::Function(decl) => {
                let func = self.compile_function(
                    &decl.name,
                    &decl.params,
                    FnBody::Stmts(&decl.body),
                    false,
                )?;
                self.emit_function_value(func);
                let slot = self.global_slot(&decl.name);
                self.emit(Op::StoreGlobal(slot));
            }

            Stmt::Class(decl) => {
                let class = self.compile_class(decl)?;
                self.emit_const(Value::Class(class));
                let slot = self.global_slot(&decl.name);
                self.emit(Op::StoreGlobal(slot));
            }

            Stmt::Data { name, fields, pos: _ } => {
                let class = Rc::new(ClassValue {
                    name: name.clone(),
                    fields: fields.clone(),
                    methods: Vec::new(),
                });
                self.emit_const(Value::Class(class));
                let slot = self.global_slot(name);
                self.emit(Op::StoreGlobal(slot));
            }

            Stmt::Trait { pos, .. } => {
                return Err(self.unsupported("trait declarations", *pos));
            }

            Stmt::If {
                condition,
                then_block,
                else_block,
                ..
            } => {
                self.compile_expr(condition)?;
                let to_else = self.emit_jump(Op::JumpIfFalse);
                self.compile_block(then_block)?;
                if let Some(else_block) = else_block {
                    let to_end = self.emit_jump(Op::Jump);
                    self.patch_jump(to_else);
                    self.compile_block(else_block)?;
                    self.patch_jump(to_end);
                } else {
                    self.patch_jump(to_else);
                }
            }

            Stmt::While {
                condition, body, ..
            } => {
                let loop_start = self.offset();
                self.compile_expr(condition)?;
                let to_exit = self.emit_jump(Op::JumpIfFalse);
                self.compile_block(body)?;
                self.emit(Op::Jump(loop_start));
                self.patch_jump(to_exit);
            }

            Stmt::ForIn { pos, .. } => {
                return Err(self.unsupported("for-in loops", *pos));
            }

            Stmt::Return { value, .. } => {
                match value {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit_const(Value::None),
                }
                self.emit(Op::Return);
            }

            Stmt::Break { pos } => {
                return Err(self.unsupported("'break'", *pos));
            }
            Stmt::Continue { pos } => {
                return Err(self.unsupported("'continue'", *pos));
            }

            Stmt::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Pop);
            }

            Stmt::Block { statements, .. } => {
                self.compile_block(statements)?;
            }
        }
        Ok(())
    }

    fn compile_block(&mut self, statements: &[Stmt]) -> Result<()> {
        self.begin_scope();
        for stmt in statements {
            self.compile_stmt(stmt)?;
        }
        self.end_scope();
        Ok(())
    }

    /// Compile a function body in a fresh context and register the result.
    fn compile_function(
        &mut self,
        name: &str,
        params: &[String],
        body: FnBody<'_>,
        detached: bool,
    ) -> Result<Rc<CompiledFunction>> {
        self.contexts
            .push(FunctionContext::new(name, params, detached));

        match body {
            FnBody::Stmts(stmts) => {
                for stmt in stmts {
                    self.compile_stmt(stmt)?;
                }
            }
            FnBody::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Return);
            }
        }

        // The body always closes with an implicit `return none`; a duplicate
        // terminator after an explicit return is unreachable and harmless.
        self.emit_const(Value::None);
        self.emit(Op::Return);

        let ctx = self.contexts.pop().expect("function context");
        let func = Rc::new(CompiledFunction {
            name: ctx.name,
            arity: ctx.arity,
            local_count: ctx.local_count,
            upvalues: ctx.upvalues,
            code: ctx.code,
        });
        self.functions.push(func.clone());
        Ok(func)
    }

    /// Push a function constant, binding its upvalues when it has any.
    fn emit_function_value(&mut self, func: Rc<CompiledFunction>) {
        let upvalue_count = func.upvalues.len() as u32;
        self.emit_const(Value::Function(func));
        if upvalue_count > 0 {
            self.emit(Op::MakeClosure(upvalue_count));
        }
    }

    /// Assemble a class value: field names from the constructor parameters,
    /// methods compiled with the receiver as the first local. Both `self`
    /// aliases reach the same slot because the parser normalizes them.
    fn compile_class(&mut self, decl: &ClassDecl) -> Result<Rc<ClassValue>> {
        let mut methods = Vec::with_capacity(decl.methods.len());
        for method in &decl.methods {
            let mut params = Vec::with_capacity(method.params.len() + 1);
            params.push("self".to_string());
            params.extend(method.params.iter().cloned());
            let func =
                self.compile_function(&method.name, &params, FnBody::Stmts(&method.body), true)?;
            methods.push((method.name.clone(), func));
        }
        Ok(Rc::new(ClassValue {
            name: decl.name.clone(),
            fields: decl.fields.clone(),
            methods,
        }))
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn compile_expr(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Int { value, .. } => self.emit_const(Value::Int(*value)),
            Expr::Float { value, .. } => self.emit_const(Value::Float(*value)),
            Expr::Str { value, .. } => self.emit_const(Value::Str(value.clone())),
            Expr::Bool { value, .. } => self.emit_const(Value::Bool(*value)),
            Expr::None { .. } => self.emit_const(Value::None),

            Expr::Ident { name, .. } => match self.resolve(name) {
                Binding::Local(slot) => self.emit(Op::LoadVar(slot)),
                Binding::Upvalue(slot) => self.emit(Op::LoadUpvalue(slot)),
                Binding::Global(slot) => self.emit(Op::LoadGlobal(slot)),
            },

            Expr::Binary { op, lhs, rhs, .. } => {
                self.compile_expr(lhs)?;
                self.compile_expr(rhs)?;
                self.emit(binary_opcode(*op));
            }

            Expr::Unary { op, operand, .. } => {
                self.compile_expr(operand)?;
                self.emit(match op {
                    UnaryOp::Neg => Op::Neg,
                    UnaryOp::Not => Op::Not,
                });
            }

            Expr::Call { callee, args, .. } => {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.compile_expr(callee)?;
                self.emit(Op::Call(args.len() as u32));
            }

            Expr::Member { object, name, .. } => {
                self.compile_expr(object)?;
                let idx = self.add_const(Value::Str(name.clone()));
                self.emit(Op::GetAttr(idx));
            }

            Expr::Index { object, index, .. } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit(Op::GetIndex);
            }

            Expr::Assign { target, value, .. } => {
                // The duplicated value remains as the expression result.
                self.compile_expr(value)?;
                self.emit(Op::Dup);
                self.compile_store(target)?;
            }

            Expr::Lambda { params, body, .. } => {
                let func = match body {
                    LambdaBody::Expr(expr) => {
                        self.compile_function("<lambda>", params, FnBody::Expr(expr), false)?
                    }
                    LambdaBody::Block(stmts) => {
                        self.compile_function("<lambda>", params, FnBody::Stmts(stmts), false)?
                    }
                };
                self.emit_function_value(func);
            }

            Expr::List { items, .. } => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit(Op::MakeList(items.len() as u32));
            }

            Expr::MapLit { entries, .. } => {
                for (key, value) in entries {
                    self.emit_const(Value::Str(key.clone()));
                    self.compile_expr(value)?;
                }
                self.emit(Op::MakeMap(entries.len() as u32));
            }

            Expr::Pipe { value, func, .. } => {
                // `a |> b` compiles identically to `b(a)`.
                self.compile_expr(value)?;
                self.compile_expr(func)?;
                self.emit(Op::Call(1));
            }

            Expr::New { class, args, .. } => {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                let slot = self.global_slot(class);
                self.emit(Op::LoadGlobal(slot));
                self.emit(Op::NewInstance(args.len() as u32));
            }

            Expr::Await { pos, .. } => {
                return Err(self.unsupported("'await'", *pos));
            }
            Expr::Spawn { pos, .. } => {
                return Err(self.unsupported("'spawn'", *pos));
            }

            Expr::Match { subject, arms, .. } => {
                self.compile_match(subject, arms)?;
            }

            Expr::Print { args, .. } => {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(Op::Print(args.len() as u32));
            }
        }
        Ok(())
    }

    /// Store the top of stack into an assignment target.
    fn compile_store(&mut self, target: &Expr) -> Result<()> {
        match target {
            Expr::Ident { name, .. } => match self.resolve(name) {
                Binding::Local(slot) => self.emit(Op::StoreVar(slot)),
                Binding::Upvalue(slot) => self.emit(Op::StoreUpvalue(slot)),
                Binding::Global(slot) => self.emit(Op::StoreGlobal(slot)),
            },
            Expr::Member { object, name, .. } => {
                self.compile_expr(object)?;
                let idx = self.add_const(Value::Str(name.clone()));
                self.emit(Op::SetAttr(idx));
            }
            Expr::Index { object, index, .. } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit(Op::SetIndex);
            }
            other => {
                return Err(self.unsupported("this assignment target", other.pos()));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Match lowering
    // -----------------------------------------------------------------------

    /// Lower a match expression.
    ///
    /// The subject stays on the stack while arms test a duplicate of it; a
    /// successful arm pops the subject before its body so exactly one value
    /// (the arm result, or `none` on fallthrough) remains.
    fn compile_match(&mut self, subject: &Expr, arms: &[MatchArm]) -> Result<()> {
        self.compile_expr(subject)?;

        let mut end_jumps = Vec::with_capacity(arms.len());
        for arm in arms {
            self.begin_scope();
            self.emit(Op::Dup);
            self.compile_pattern_test(&arm.pattern)?;
            let mut fail_jumps = vec![self.emit_jump(Op::JumpIfFalse)];
            // The identifier binding is stored before the guard runs, so it
            // is visible to both the guard and the body.
            if let Some(guard) = &arm.guard {
                self.compile_expr(guard)?;
                fail_jumps.push(self.emit_jump(Op::JumpIfFalse));
            }
            self.emit(Op::Pop);
            self.compile_expr(&arm.body)?;
            end_jumps.push(self.emit_jump(Op::Jump));
            for fail in fail_jumps {
                self.patch_jump(fail);
            }
            self.end_scope();
        }

        // No arm matched: drop the subject and produce none.
        self.emit(Op::Pop);
        self.emit_const(Value::None);

        for end in end_jumps {
            self.patch_jump(end);
        }
        Ok(())
    }

    /// Consume the duplicated subject on top of the stack and leave a
    /// boolean test result.
    fn compile_pattern_test(&mut self, pattern: &Pattern) -> Result<()> {
        match pattern {
            Pattern::Wildcard { .. } => {
                self.emit(Op::Pop);
                self.emit_const(Value::Bool(true));
            }
            Pattern::Literal { value, .. } => {
                self.compile_expr(value)?;
                self.emit(Op::Eq);
            }
            Pattern::Ident { name, .. } => {
                let slot = self.declare_local(name);
                self.emit(Op::StoreVar(slot));
                self.emit_const(Value::Bool(true));
            }
            Pattern::Range { lo, hi, .. } => {
                // Two comparisons over a hidden local: lo <= subject < hi.
                let hidden = format!("__match_{}", self.match_counter);
                self.match_counter += 1;
                let slot = self.declare_local(&hidden);
                self.emit(Op::StoreVar(slot));
                self.emit(Op::LoadVar(slot));
                self.compile_expr(lo)?;
                self.emit(Op::Ge);
                self.emit(Op::LoadVar(slot));
                self.compile_expr(hi)?;
                self.emit(Op::Lt);
                self.emit(Op::And);
            }
            Pattern::Constructor { pos, .. } => {
                return Err(self.unsupported("constructor patterns", *pos));
            }
        }
        Ok(())
    }
}

fn binary_opcode(op: BinaryOp) -> Op {
    match op {
        BinaryOp::Add => Op::Add,
        BinaryOp::Sub => Op::Sub,
        BinaryOp::Mul => Op::Mul,
        BinaryOp::Div => Op::Div,
        BinaryOp::Mod => Op::Mod,
        BinaryOp::Pow => Op::Pow,
        BinaryOp::Eq => Op::Eq,
        BinaryOp::Ne => Op::Ne,
        BinaryOp::Lt => Op::Lt,
        BinaryOp::Gt => Op::Gt,
        BinaryOp::Le => Op::Le,
        BinaryOp::Ge => Op::Ge,
        BinaryOp::And => Op::And,
        BinaryOp::Or => Op::Or,
    }
}
