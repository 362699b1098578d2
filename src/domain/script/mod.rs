//! The strategy scripting language: a Python-flavoured subset with a
//! lexer, a recursive-descent parser and a metered tree-walking interpreter.

pub mod ast;
pub mod builtins;
pub mod interpreter;
pub mod lexer;
pub mod modules;
pub mod ops;
pub mod parser;
pub mod value;

pub use interpreter::Interpreter;
pub use parser::parse;
