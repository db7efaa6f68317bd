//! SBText → Scratch 3 compiler.
//!
//! The pipeline is strictly one-directional:
//!
//! ```text
//! source text → tokens → AST → resolved AST → validated AST
//!             → (project.json, assets) → .sb3 archive
//! ```
//!
//! Each stage lives in its own module; [`compile`] wires them together.
//! Everything is synchronous and single-threaded — a compile owns its block
//! ID counter and broadcast map, so concurrent compiles just use separate
//! invocations.

pub mod ast;
pub mod codegen;
pub mod compile;
pub mod error;
pub mod imports;
pub mod lexer;
pub mod package;
pub mod parser;
pub mod semantic;

pub use compile::{compile_file, compile_source};
pub use error::CompileError;
