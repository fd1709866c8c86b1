//! The compiler pipeline. Each pass turns one artifact into the next:
//!
//! ~> Source (string)
//! -> Tokens            : lex.rs
//! -> ParseTree         : read.rs
//! -> ModuleExpression  : lower.rs
//! ~> (verified)        : check.rs
//! -> module bytes      : gen.rs

pub mod lex;
pub use lex::Lexer;

pub mod read;
pub use read::Reader;

pub mod lower;
pub use lower::Lowerer;

pub mod check;
pub use check::Checker;

pub mod gen;
pub use gen::Emitter;

pub mod syntax;
pub use syntax::Syntax;

use std::rc::Rc;

use crate::common::Source;
use crate::construct::ir::ModuleExpression;
use crate::construct::tree::ParseTree;

#[inline(always)]
pub fn lex(source: Rc<Source>) -> Result<lex::Tokens, Syntax> {
    Lexer::lex(source)
}

#[inline(always)]
pub fn read(source: Rc<Source>) -> Result<ParseTree, Syntax> {
    let tokens = lex(source)?;
    Reader::read(tokens)
}

#[inline(always)]
pub fn lower(source: Rc<Source>) -> Result<ModuleExpression, Syntax> {
    let tree = read(source)?;
    Lowerer::lower(tree)
}

#[inline(always)]
pub fn gen(source: Rc<Source>) -> Result<Vec<u8>, Syntax> {
    let module = lower(source)?;
    Checker::check(&module)?;
    Emitter::emit(&module)
}
