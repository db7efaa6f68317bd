//! Typed error hierarchy for the compile pipeline.
//!
//! Every stage of the pipeline has its own error type carrying a human
//! message and, where the source location is known, a (line, column) pair.
//! [`CompileError`] is the single type the pipeline surfaces to callers;
//! each stage error converts into it via `#[from]`.
//!
//! All errors halt the compile immediately — nothing is emitted on error.

use thiserror::Error;

/// Tokenization failure: illegal character or unterminated string.
#[derive(Debug, Clone, Error)]
#[error("{message} (line {line}, column {column})")]
pub struct LexError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl LexError {
    pub fn new(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }
}

/// Syntax failure: unexpected token, missing keyword, unbalanced brackets,
/// or a procedure call in expression position.
#[derive(Debug, Clone, Error)]
#[error("{message} (line {line}, column {column})")]
pub struct ParseError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }
}

/// Failure while resolving top-level imports: missing file, import past
/// top-level code, wrong sprite count, name mismatch, or a cycle.
///
/// File paths and line numbers are embedded in the message because an import
/// error usually spans two files.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ImportError(pub String);

/// Validation failure: duplicate names, unknown variable/list/procedure,
/// arity mismatch, forward procedure call, parameter used as an assignment
/// target.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct SemanticError(pub String);

/// Failure while lowering the AST to the block graph or packaging assets:
/// missing costume file, unsupported asset format, invalid SVG.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CodegenError(pub String);

/// Any error the compile pipeline can produce.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Semantic(#[from] SemanticError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
