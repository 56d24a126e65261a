//! The abstract syntax tree produced by the parser.
//!
//! A tagged tree with explicit source positions on every node so the
//! compiler can report precise locations when it refuses a construct.

use crate::token::Pos;

/// A whole source file: a sequence of statements.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `let` / `var` / `const` binding. Mutability is recorded but has no
    /// semantic effect after compilation.
    Binding {
        mutable: bool,
        name: String,
        value: Expr,
        pos: Pos,
    },
    Function(FunctionDecl),
    Class(ClassDecl),
    /// `trait Name { ... }`: reserved surface, refused by the compiler.
    Trait { name: String, pos: Pos },
    /// `data Name(fields)`: a class with fields and no methods.
    Data {
        name: String,
        fields: Vec<String>,
        pos: Pos,
    },
    If {
        condition: Expr,
        then_block: Vec<Stmt>,
        else_block: Option<Vec<Stmt>>,
        pos: Pos,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
        pos: Pos,
    },
    /// `for x in expr { ... }`: reserved surface, refused by the compiler.
    ForIn {
        variable: String,
        iterable: Expr,
        body: Vec<Stmt>,
        pos: Pos,
    },
    Return { value: Option<Expr>, pos: Pos },
    Break { pos: Pos },
    Continue { pos: Pos },
    Expr(Expr),
    Block { statements: Vec<Stmt>, pos: Pos },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: String,
    /// Constructor parameters; they become the instance field names.
    pub fields: Vec<String>,
    pub methods: Vec<FunctionDecl>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int { value: i64, pos: Pos },
    Float { value: f64, pos: Pos },
    Str { value: String, pos: Pos },
    Bool { value: bool, pos: Pos },
    None { pos: Pos },
    Ident { name: String, pos: Pos },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        pos: Pos,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        pos: Pos,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        pos: Pos,
    },
    Member {
        object: Box<Expr>,
        name: String,
        pos: Pos,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        pos: Pos,
    },
    /// `target = value`; the target is an identifier, member, or index.
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
        pos: Pos,
    },
    Lambda {
        params: Vec<String>,
        body: LambdaBody,
        pos: Pos,
    },
    List { items: Vec<Expr>, pos: Pos },
    MapLit {
        entries: Vec<(String, Expr)>,
        pos: Pos,
    },
    /// `a |> b`: right application, equivalent to `b(a)`.
    Pipe {
        value: Box<Expr>,
        func: Box<Expr>,
        pos: Pos,
    },
    New {
        class: String,
        args: Vec<Expr>,
        pos: Pos,
    },
    /// Reserved surface, refused by the compiler.
    Await { operand: Box<Expr>, pos: Pos },
    /// Reserved surface, refused by the compiler.
    Spawn { operand: Box<Expr>, pos: Pos },
    Match {
        subject: Box<Expr>,
        arms: Vec<MatchArm>,
        pos: Pos,
    },
    /// `print(...)` compiles to the dedicated opcode, not a call.
    Print { args: Vec<Expr>, pos: Pos },
}

impl Expr {
    pub fn pos(&self) -> Pos {
        match self {
            Expr::Int { pos, .. }
            | Expr::Float { pos, .. }
            | Expr::Str { pos, .. }
            | Expr::Bool { pos, .. }
            | Expr::None { pos }
            | Expr::Ident { pos, .. }
            | Expr::Binary { pos, .. }
            | Expr::Unary { pos, .. }
            | Expr::Call { pos, .. }
            | Expr::Member { pos, .. }
            | Expr::Index { pos, .. }
            | Expr::Assign { pos, .. }
            | Expr::Lambda { pos, .. }
            | Expr::List { pos, .. }
            | Expr::MapLit { pos, .. }
            | Expr::Pipe { pos, .. }
            | Expr::New { pos, .. }
            | Expr::Await { pos, .. }
            | Expr::Spawn { pos, .. }
            | Expr::Match { pos, .. }
            | Expr::Print { pos, .. } => *pos,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LambdaBody {
    Expr(Box<Expr>),
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub guard: Option<Expr>,
    pub body: Expr,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Wildcard { pos: Pos },
    Literal { value: Expr, pos: Pos },
    /// Binds the subject to a fresh local visible to the guard and body.
    Ident { name: String, pos: Pos },
    /// Half-open range `lo..hi`, compiled as two comparisons.
    Range {
        lo: Box<Expr>,
        hi: Box<Expr>,
        pos: Pos,
    },
    /// Reserved surface, refused by the compiler.
    Constructor {
        name: String,
        args: Vec<Pattern>,
        pos: Pos,
    },
}

impl Pattern {
    pub fn pos(&self) -> Pos {
        match self {
            Pattern::Wildcard { pos }
            | Pattern::Literal { pos, .. }
            | Pattern::Ident { pos, .. }
            | Pattern::Range { pos, .. }
            | Pattern::Constructor { pos, .. } => *pos,
        }
    }
}
