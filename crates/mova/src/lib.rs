//! Mova: a small, expression-oriented language with a bilingual keyword
//! surface, compiled to compact bytecode and executed on an embeddable
//! stack VM.
//!
//! Source text runs through a hand-written lexer and recursive-descent
//! parser, a single-pass compiler that resolves every identifier to a
//! local, upvalue, or global slot, and a stack machine with call frames,
//! closures, bound methods, and instances. Modules round-trip through a
//! persistent bytecode container.
//!
//! # Quick start
//!
//! ```
//! use mova::{Value, Vm, compile};
//!
//! let module = compile(
//!     r#"
//!     fun fib(n) { if n < 2 { return n } return fib(n - 1) + fib(n - 2) }
//!     print(fib(10))
//!     "#,
//! )
//! .unwrap();
//!
//! let mut vm = Vm::new();
//! vm.run(&module).unwrap();
//! assert_eq!(vm.take_output(), vec!["55"]);
//! ```
//!
//! # Bilingual surface
//!
//! Every keyword has an English and a Ukrainian form mapping to the same
//! token kind, and identifiers may use the Cyrillic blocks:
//!
//! ```
//! use mova::{Vm, compile};
//!
//! let module = compile("нехай х = 4 якщо х > 2 { друк(х) }").unwrap();
//! let mut vm = Vm::new();
//! vm.run(&module).unwrap();
//! assert_eq!(vm.take_output(), vec!["4"]);
//! ```
//!
//! # Persistence
//!
//! ```
//! use mova::{compile, serialize};
//!
//! let module = compile("print(1 + 1)").unwrap();
//! let bytes = serialize::write_module(&module).unwrap();
//! let restored = serialize::read_module(&bytes).unwrap();
//! assert_eq!(module, restored);
//! ```
//!
//! # Not supported
//!
//! `for`-in loops, `break`/`continue`, `async`/`await`/`spawn`, and trait
//! dispatch are reserved in the grammar but refused by the compiler. There
//! is no in-language exception handling: every error is fatal for the
//! current `compile` or `run` call.

mod ast;
mod builtins;
mod bytecode;
mod compiler;
mod error;
mod lexer;
mod operators;
mod parser;
pub mod serialize;
mod token;
mod value;
mod vm;

pub use ast::Program;
pub use bytecode::{CompiledFunction, Module, Op, UpvalueDescriptor};
pub use compiler::Compiler;
pub use error::{Error, Result};
pub use lexer::Lexer;
pub use parser::Parser;
pub use token::{Pos, Token, TokenKind};
pub use value::{BoundMethod, ClassValue, Closure, Instance, NativeFunction, Value};
pub use vm::{OutputFn, Vm};

/// Compile source text into a runnable [`Module`].
///
/// This is the front half of the embedding contract: lexing, parsing, and
/// bytecode compilation. Errors carry a `line:column` position.
pub fn compile(source: &str) -> Result<Module> {
    let tokens = Lexer::tokenize(source)?;
    let program = Parser::parse(tokens)?;
    Compiler::compile(&program)
}
