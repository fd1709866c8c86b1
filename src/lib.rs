//! # Warbler
//! A compiler from the WebAssembly text format (WAT) to the binary
//! module format.
//!
//! ## Overview of the compilation process
//! Source code enters the pipeline as a [`Source`]: the text plus the
//! path it came from. Regions of a source are marked with `Span`s,
//! which are carried on tokens and IR nodes and used for error
//! reporting; compiler data structures are `Spanned` to say where they
//! originated.
//!
//! Compilation is a straight line of passes, each consuming the
//! previous pass's output:
//!
//! - The `Lexer` reads the source into a stream of `Spanned<Token>`s,
//!   stripping whitespace and comments and resolving each word against
//!   the static opcode table.
//! - The `Reader` groups the tokens by parens into a [`ParseTree`].
//! - The `Lowerer` turns the tree into a [`ModuleExpression`]: folded
//!   s-expressions are desugared into stack form, symbolic names become
//!   numeric indices, duplicate function signatures are interned, and
//!   inline export shorthand becomes real export entries.
//! - The `Checker` verifies every body against an abstract operand
//!   stack.
//! - The `Emitter` writes the standard binary module: `\0asm`,
//!   version 1, sections in canonical order.
//!
//! Any pass can raise a [`Syntax`] error - a reason, the pipeline
//! stage's error kind, and the source locations involved, which can be
//! pretty-printed. The first error stops the compilation; no partial
//! output is produced.
//!
//! ## Compiling a module
//! ```
//! let bytes = warbler::compile("(module (func (export \"nop\") nop))").unwrap();
//! assert_eq!(&bytes[0..4], b"\0asm");
//! ```

pub mod common;
pub mod compiler;
pub mod construct;

pub use common::{Source, Span, Spanned};
pub use compiler::syntax::{ErrorKind, Note};
pub use compiler::Syntax;
pub use construct::ir::ModuleExpression;
pub use construct::token::Token;
pub use construct::tree::{ParseTree, StringTree};

use compiler::{Checker, Emitter, Lexer, Lowerer};

/// Runs the full pipeline: text in, binary module bytes out.
pub fn compile(source: &str) -> Result<Vec<u8>, Syntax> {
    compiler::gen(Source::source(source))
}

/// Lexes and parses only, returning the parse tree.
pub fn parse(source: &str) -> Result<ParseTree, Syntax> {
    compiler::read(Source::source(source))
}

/// A parse tree with lexemes only, for debugging. Print it with
/// [`StringTree::print`].
pub fn string_parse_tree(source: &str) -> Result<StringTree, Syntax> {
    Ok(StringTree::from_parse_tree(&parse(source)?))
}

/// Compiles an already-built parse tree, skipping lex and read.
pub fn compile_parse_tree(tree: ParseTree) -> Result<Vec<u8>, Syntax> {
    let module = Lowerer::lower(tree)?;
    Checker::check(&module)?;
    Emitter::emit(&module)
}

/// Compiles a tree of raw strings: each leaf passes through
/// single-token lexing. Position metadata is absent, so errors carry
/// no source excerpts.
pub fn compile_string_tree(tree: &StringTree) -> Result<Vec<u8>, Syntax> {
    compile_parse_tree(parse_tree_from_strings(tree)?)
}

fn parse_tree_from_strings(tree: &StringTree) -> Result<ParseTree, Syntax> {
    match tree {
        StringTree::Leaf(lexeme) => Ok(ParseTree::Leaf(Spanned::new(
            Lexer::lex_one(lexeme)?,
            Span::empty(),
        ))),
        StringTree::Group(children) => {
            let children = children
                .iter()
                .map(parse_tree_from_strings)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ParseTree::Group(Spanned::new(children, Span::empty())))
        }
    }
}
