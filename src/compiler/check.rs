//! The type checker walks each lowered body as an abstract stack
//! machine over value types. Instructions with static effects come
//! straight from the opcode table; variable access, calls, and
//! branches derive theirs from the immediate's resolved target.
//! A branch or `unreachable` makes the rest of its sequence
//! polymorphic, so anything following it is accepted.

use crate::common::opcode::{Imm, OpInfo, ValType};
use crate::common::span::Span;
use crate::compiler::syntax::Syntax;
use crate::construct::ir::{
    self, BlockExpression, BlockKind, FunctionExpression, FunctionSignature, Item,
    ModuleExpression, OperationTree, TokenExpression,
};
use crate::construct::token::{Keyword, Token};

/// The abstract operand stack.
#[derive(Debug, Clone, PartialEq)]
struct Stack {
    types: Vec<ValType>,
    /// Set after a branch or `unreachable`: pops always succeed and
    /// the sequence's exit check is waived.
    polymorphic: bool,
}

impl Stack {
    fn seeded(types: Vec<ValType>) -> Stack {
        Stack {
            types,
            polymorphic: false,
        }
    }

    fn push_all(&mut self, types: &[ValType]) {
        self.types.extend_from_slice(types);
    }

    /// Pops an instruction's consumed types, rightmost topmost.
    fn pop_all(&mut self, consumes: &[ValType], what: &str, span: &Span) -> Result<(), Syntax> {
        let available = self.types.len().saturating_sub(consumes.len());
        let got = self.types[available..].to_vec();

        for expected in consumes.iter().rev() {
            match self.types.pop() {
                Some(actual) if actual == *expected => continue,
                None if self.polymorphic => continue,
                _ => {
                    return Err(Syntax::ty(
                        &format!(
                            "`{}` expected [{}] on the stack, got [{}]",
                            what,
                            type_list(consumes),
                            type_list(&got),
                        ),
                        span,
                    ))
                }
            }
        }
        Ok(())
    }

    /// Pops any one type, for `ref.is_null`.
    fn pop_any(&mut self, span: &Span) -> Result<Option<ValType>, Syntax> {
        match self.types.pop() {
            Some(ty) => Ok(Some(ty)),
            None if self.polymorphic => Ok(None),
            None => Err(Syntax::ty("Expected a value on the stack, got none", span)),
        }
    }

    /// The exit check: the remaining stack must equal the declared
    /// result types exactly, unless the sequence went polymorphic.
    fn exit(&self, results: &[ValType], what: &str, span: &Span) -> Result<(), Syntax> {
        if self.polymorphic || self.types == results {
            Ok(())
        } else {
            Err(Syntax::ty(
                &format!(
                    "This {} leaves [{}] on the stack, but declares [{}]",
                    what,
                    type_list(&self.types),
                    type_list(results),
                ),
                span,
            ))
        }
    }

    fn terminate(&mut self) {
        self.types.clear();
        self.polymorphic = true;
    }
}

fn type_list(types: &[ValType]) -> String {
    types
        .iter()
        .map(|ty| ty.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// An instruction's effective stack effect.
struct Effect {
    consumes: Vec<ValType>,
    produces: Vec<ValType>,
    terminator: bool,
}

pub struct Checker<'module> {
    module: &'module ModuleExpression,
}

impl<'module> Checker<'module> {
    /// Verifies every function body, global init, and segment offset of
    /// a lowered module against its declared types.
    pub fn check(module: &ModuleExpression) -> Result<(), Syntax> {
        let checker = Checker { module };

        for function in &module.functions {
            checker.check_function(function)?;
        }
        for global in &module.global_vars {
            checker.check_const(&global.init, global.ty.valtype)?;
        }
        for elem in &module.elems {
            checker.check_const(&elem.offset, ValType::I32)?;
        }
        for data in &module.datas {
            checker.check_const(&data.offset, ValType::I32)?;
        }

        log::debug!("type-checked {} functions", module.functions.len());
        Ok(())
    }

    /// The function-entry stack is empty; parameters are locals,
    /// reached through `local.get`. At the end the stack must hold
    /// exactly the declared results.
    fn check_function(&self, function: &FunctionExpression) -> Result<(), Syntax> {
        let mut stack = Stack::seeded(vec![]);
        self.check_expression(&function.body, &mut stack, 0, &function.signature)?;
        stack.exit(
            &function.signature.signature.results,
            "function body",
            &Span::empty(),
        )
    }

    /// A module-level constant expression must produce exactly one
    /// value of the expected type.
    fn check_const(&self, init: &TokenExpression, expected: ValType) -> Result<(), Syntax> {
        let no_locals = FunctionSignature::default();
        let mut stack = Stack::seeded(vec![]);
        self.check_expression(init, &mut stack, 0, &no_locals)?;
        stack.exit(&[expected], "constant expression", &Span::empty())
    }

    fn check_expression(
        &self,
        expression: &TokenExpression,
        stack: &mut Stack,
        depth: u32,
        signature: &FunctionSignature,
    ) -> Result<(), Syntax> {
        match expression {
            TokenExpression::Operation(tree) => self.check_operation(tree, stack, depth, signature),
            TokenExpression::Unfolded(unfolded) => {
                self.check_items(&unfolded.items, stack, depth, signature)
            }
            TokenExpression::Block(block) => self.check_block(block, stack, depth, signature),
            TokenExpression::Empty => Ok(()),
        }
    }

    fn check_items(
        &self,
        items: &[Item],
        stack: &mut Stack,
        depth: u32,
        signature: &FunctionSignature,
    ) -> Result<(), Syntax> {
        let mut index = 0;
        while index < items.len() {
            match &items[index] {
                Item::Token(token) => match &token.item {
                    Token::Op(op) => {
                        let immediates = &items[index + 1..];
                        let count = ir::immediate_count(op, immediates);
                        self.apply(op, &immediates[..count], &token.span, stack, depth, signature)?;
                        index += 1 + count;
                    }
                    other => {
                        return Err(Syntax::internal(&format!(
                            "stray `{}` in a lowered body",
                            other,
                        )))
                    }
                },
                Item::Operation(tree) => {
                    self.check_operation(tree, stack, depth, signature)?;
                    index += 1;
                }
                Item::Block(block) => {
                    self.check_block(block, stack, depth, signature)?;
                    index += 1;
                }
            }
        }
        Ok(())
    }

    /// A folded operation: the arguments are checked on a fresh inner
    /// stack, which must end holding exactly the operator's consumed
    /// types. The outer stack just sees the operator's produced types.
    fn check_operation(
        &self,
        tree: &OperationTree,
        stack: &mut Stack,
        depth: u32,
        signature: &FunctionSignature,
    ) -> Result<(), Syntax> {
        let op = match &tree.operator.item {
            Token::Op(op) => op,
            other => {
                return Err(Syntax::internal(&format!(
                    "`{}` can't head an operation tree",
                    other,
                )))
            }
        };
        let span = &tree.operator.span;

        let count = ir::immediate_count(op, &tree.operands);
        let (immediates, arguments) = tree.operands.split_at(count);

        let mut inner = Stack::seeded(vec![]);
        self.check_items(arguments, &mut inner, depth, signature)?;

        // ref.is_null accepts either reference type
        if op.code == 0xd1 {
            if let Some(ty) = inner.pop_any(span)? {
                if !ty.is_ref() {
                    return Err(Syntax::ty(
                        &format!("`ref.is_null` expected a reference, got {}", ty),
                        span,
                    ));
                }
            }
            inner.exit(&[], op.mnemonic, span)?;
            stack.push_all(&[ValType::I32]);
            return Ok(());
        }

        let effect = self.effect(op, immediates, span, depth, signature)?;
        if !inner.polymorphic && inner.types != effect.consumes {
            return Err(Syntax::ty(
                &format!(
                    "The arguments of `{}` leave [{}], but it consumes [{}]",
                    op.mnemonic,
                    type_list(&inner.types),
                    type_list(&effect.consumes),
                ),
                span,
            ));
        }

        stack.push_all(&effect.produces);
        if effect.terminator {
            stack.terminate();
        }
        Ok(())
    }

    /// A block construct: the outer stack supplies the parameters (and
    /// the `i32` condition, for `if`), a fresh stack seeded with the
    /// parameters checks the body, and the results land back outside.
    fn check_block(
        &self,
        block: &BlockExpression,
        stack: &mut Stack,
        depth: u32,
        signature: &FunctionSignature,
    ) -> Result<(), Syntax> {
        if block.kind == BlockKind::If {
            stack.pop_all(&[ValType::I32], "if", &block.span)?;
        }
        stack.pop_all(
            &block.signature.params,
            block.kind.keyword().name(),
            &block.span,
        )?;

        let mut inner = Stack::seeded(block.signature.params.clone());
        self.check_expression(&block.body, &mut inner, depth + 1, signature)?;
        inner.exit(
            &block.signature.results,
            block.kind.keyword().name(),
            &block.span,
        )?;

        if let Some(alternate) = &block.alternate {
            let mut inner = Stack::seeded(block.signature.params.clone());
            self.check_expression(alternate, &mut inner, depth + 1, signature)?;
            inner.exit(&block.signature.results, "else", &block.span)?;
        }

        stack.push_all(&block.signature.results);
        Ok(())
    }

    /// Applies one instruction to the stack.
    fn apply(
        &self,
        op: &'static OpInfo,
        immediates: &[Item],
        span: &Span,
        stack: &mut Stack,
        depth: u32,
        signature: &FunctionSignature,
    ) -> Result<(), Syntax> {
        // ref.is_null accepts either reference type, so it bypasses
        // the declared-effect path
        if op.code == 0xd1 {
            if let Some(ty) = stack.pop_any(span)? {
                if !ty.is_ref() {
                    return Err(Syntax::ty(
                        &format!("`ref.is_null` expected a reference, got {}", ty),
                        span,
                    ));
                }
            }
            stack.push_all(&[ValType::I32]);
            return Ok(());
        }

        let effect = self.effect(op, immediates, span, depth, signature)?;
        stack.pop_all(&effect.consumes, op.mnemonic, span)?;
        stack.push_all(&effect.produces);
        if effect.terminator {
            stack.terminate();
        }
        Ok(())
    }

    /// Derives an instruction's effective stack effect from the table
    /// entry and, for context-dependent instructions, the immediate's
    /// resolved target.
    fn effect(
        &self,
        op: &'static OpInfo,
        immediates: &[Item],
        span: &Span,
        depth: u32,
        signature: &FunctionSignature,
    ) -> Result<Effect, Syntax> {
        let static_effect = || Effect {
            consumes: op.consumes.to_vec(),
            produces: op.produces.to_vec(),
            terminator: op.is_terminator(),
        };

        let effect = match op.imm {
            Imm::None | Imm::Literal(_) => static_effect(),
            Imm::LocalIndex => {
                let (index, span) = immediate_index(immediates, span)?;
                let ty = signature.local_type(index).ok_or_else(|| {
                    Syntax::name(&format!("No parameter or local with index {}", index), span)
                })?;
                match op.code {
                    0x20 => Effect {
                        consumes: vec![],
                        produces: vec![ty],
                        terminator: false,
                    },
                    0x21 => Effect {
                        consumes: vec![ty],
                        produces: vec![],
                        terminator: false,
                    },
                    _ => Effect {
                        consumes: vec![ty],
                        produces: vec![ty],
                        terminator: false,
                    },
                }
            }
            Imm::GlobalIndex => {
                let (index, span) = immediate_index(immediates, span)?;
                let ty = self.module.global_type(index).ok_or_else(|| {
                    Syntax::name(&format!("No global with index {}", index), span)
                })?;
                if op.code == 0x23 {
                    Effect {
                        consumes: vec![],
                        produces: vec![ty.valtype],
                        terminator: false,
                    }
                } else {
                    if !ty.mutable {
                        return Err(Syntax::ty(
                            &format!("Global {} is immutable", index),
                            span,
                        ));
                    }
                    Effect {
                        consumes: vec![ty.valtype],
                        produces: vec![],
                        terminator: false,
                    }
                }
            }
            Imm::FuncIndex => {
                let (index, span) = immediate_index(immediates, span)?;
                if op.code == 0xd2 {
                    // ref.func only needs the function to exist
                    if self.module.func_signature(index).is_none() {
                        return Err(Syntax::name(
                            &format!("No function with index {}", index),
                            span,
                        ));
                    }
                    static_effect()
                } else {
                    let callee = self.module.func_signature(index).ok_or_else(|| {
                        Syntax::name(&format!("No function with index {}", index), span)
                    })?;
                    Effect {
                        consumes: callee.params.clone(),
                        produces: callee.results.clone(),
                        terminator: false,
                    }
                }
            }
            Imm::TypeUse => {
                let (index, _) = immediate_index(immediates, span)?;
                let callee = self
                    .module
                    .global_types
                    .get(index as usize)
                    .ok_or_else(|| Syntax::internal("call_indirect typeuse was not interned"))?;
                let mut consumes = callee.params.clone();
                consumes.push(ValType::I32); // the table operand, on top
                Effect {
                    consumes,
                    produces: callee.results.clone(),
                    terminator: false,
                }
            }
            Imm::Label => {
                let (label, span) = immediate_index(immediates, span)?;
                if label > depth {
                    return Err(Syntax::name(
                        &format!("No enclosing block at depth {}", label),
                        span,
                    ));
                }
                static_effect()
            }
            Imm::LabelTable => {
                for item in immediates {
                    let (label, span) = immediate_index(std::slice::from_ref(item), span)?;
                    if label > depth {
                        return Err(Syntax::name(
                            &format!("No enclosing block at depth {}", label),
                            span,
                        ));
                    }
                }
                static_effect()
            }
            Imm::HeapType => {
                let produces = match immediates.first() {
                    Some(Item::Token(token))
                        if token.item == Token::Keyword(Keyword::Extern) =>
                    {
                        vec![ValType::Externref]
                    }
                    _ => vec![ValType::Funcref],
                };
                Effect {
                    consumes: vec![],
                    produces,
                    terminator: false,
                }
            }
        };
        Ok(effect)
    }
}

/// Reads a resolved numeric immediate.
fn immediate_index<'items>(
    immediates: &'items [Item],
    fallback: &'items Span,
) -> Result<(u32, &'items Span), Syntax> {
    match immediates.first() {
        Some(Item::Token(token)) => match token.item {
            Token::Integer(value) if value >= 0 => Ok((value as u32, &token.span)),
            _ => Err(Syntax::internal("malformed immediate in a lowered body")),
        },
        _ => Err(Syntax::ty("Missing immediate", fallback)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::source::Source;
    use crate::compiler::lex::Lexer;
    use crate::compiler::lower::Lowerer;
    use crate::compiler::read::Reader;
    use crate::compiler::syntax::ErrorKind;

    fn check_source(source: &str) -> Result<(), Syntax> {
        let module = Lowerer::lower(Reader::read(Lexer::lex(Source::source(source))?)?)?;
        Checker::check(&module)
    }

    #[test]
    fn constants_and_comparison() {
        // stack trace: [] -> [i32] -> [i32, i32] -> [i32]
        check_source("(module (func (result i32) i32.const 0 i32.const 0 i32.eq))").unwrap();
    }

    #[test]
    fn params_reach_the_stack_through_local_get() {
        check_source(
            "(module (func (param $a f64) (param $b f64) (result f64) \
             (f64.add (local.get $a) (local.get $b))))",
        )
        .unwrap();
    }

    #[test]
    fn operand_type_mismatch() {
        let error =
            check_source("(module (func (result i32) i32.const 0 i32.const 0 i64.eq))")
                .unwrap_err();

        assert_eq!(error.kind, ErrorKind::Type);
        assert!(error.reason.contains("[i64, i64]"));
        assert!(error.reason.contains("[i32, i32]"));
    }

    #[test]
    fn leftover_values_fail_the_exit_check() {
        let error = check_source("(module (func i32.const 0))").unwrap_err();
        assert_eq!(error.kind, ErrorKind::Type);
    }

    #[test]
    fn missing_result_fails_the_exit_check() {
        let error = check_source("(module (func (result i32) nop))").unwrap_err();
        assert_eq!(error.kind, ErrorKind::Type);
    }

    #[test]
    fn blocks_check_their_own_exit() {
        check_source(
            "(module (func (result i32) (block (result i32) i32.const 7)))",
        )
        .unwrap();

        let error = check_source(
            "(module (func (result i32) (block (result i32) nop)))",
        )
        .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Type);
    }

    #[test]
    fn if_pops_its_condition() {
        check_source(
            "(module (func (result i32) \
             (if (result i32) (i32.const 1) (then i32.const 2) (else i32.const 3))))",
        )
        .unwrap();

        // no condition on the stack
        let error = check_source("(module (func (if (then nop))))").unwrap_err();
        assert_eq!(error.kind, ErrorKind::Type);
    }

    #[test]
    fn both_if_arms_must_agree() {
        let error = check_source(
            "(module (func (result i32) \
             (if (result i32) (i32.const 1) (then i32.const 2) (else nop))))",
        )
        .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Type);
    }

    #[test]
    fn branches_make_the_rest_polymorphic() {
        check_source(
            "(module (func (result i32) (block (result i32) \
             i32.const 1 br 0 unreachable)))",
        )
        .unwrap();
        check_source("(module (func (result i32) unreachable))").unwrap();
        check_source("(module (func (result f64) return))").unwrap();
    }

    #[test]
    fn branch_depths_are_validated() {
        let error = check_source("(module (func (block br 5)))").unwrap_err();
        assert_eq!(error.kind, ErrorKind::Name);
    }

    #[test]
    fn calls_use_the_callee_signature() {
        check_source(
            "(module (func $inc (param i32) (result i32) local.get 0) \
             (func (result i32) i32.const 1 call $inc))",
        )
        .unwrap();

        let error = check_source(
            "(module (func $inc (param i32) (result i32) local.get 0) \
             (func (result i32) f64.const 1 call $inc))",
        )
        .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Type);
    }

    #[test]
    fn call_indirect_takes_a_table_operand() {
        check_source(
            "(module (table 1 funcref) (func (result i32) \
             i32.const 4 i32.const 0 call_indirect (param i32) (result i32)))",
        )
        .unwrap();
    }

    #[test]
    fn folded_arguments_must_match_exactly() {
        // i32.eqz takes one argument, not two
        let error = check_source(
            "(module (func (result i32) (i32.eqz (i32.const 1) (i32.const 2))))",
        )
        .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Type);
    }

    #[test]
    fn immutable_globals_reject_set() {
        let error = check_source(
            "(module (global $g i32 (i32.const 0)) \
             (func i32.const 1 global.set $g))",
        )
        .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Type);
    }

    #[test]
    fn global_inits_must_match_their_type() {
        let error = check_source("(module (global $g i32 (f64.const 0)))").unwrap_err();
        assert_eq!(error.kind, ErrorKind::Type);
    }

    #[test]
    fn still_folded_operations_check_on_a_fresh_inner_stack() {
        use crate::common::opcode;
        use crate::common::span::Spanned;
        use crate::construct::ir::OperationTree;

        // a hand-built body that was never unfolded:
        // (i32.eqz (i32.const 7))
        let operation = |mnemonic: &str, operands: Vec<Item>| OperationTree {
            operator: Spanned::new(
                Token::Op(opcode::lookup(mnemonic).unwrap()),
                Span::empty(),
            ),
            operands,
        };
        let body = TokenExpression::Operation(operation(
            "i32.eqz",
            vec![Item::Operation(operation(
                "i32.const",
                vec![Item::Token(Spanned::new(Token::Integer(7), Span::empty()))],
            ))],
        ));

        let mut module = ModuleExpression::default();
        let type_index = module.add_global_type(crate::construct::ir::SignatureType::new(
            vec![],
            vec![ValType::I32],
        ));
        module.functions.push(FunctionExpression {
            signature: FunctionSignature {
                signature: module.global_types[0].clone(),
                ..FunctionSignature::default()
            },
            type_index,
            body,
        });

        Checker::check(&module).unwrap();

        // an extra argument leaves the inner stack too deep
        let extra = TokenExpression::Operation(operation(
            "i32.eqz",
            vec![
                Item::Operation(operation(
                    "i32.const",
                    vec![Item::Token(Spanned::new(Token::Integer(1), Span::empty()))],
                )),
                Item::Operation(operation(
                    "i32.const",
                    vec![Item::Token(Spanned::new(Token::Integer(2), Span::empty()))],
                )),
            ],
        ));
        module.functions[0].body = extra;
        let error = Checker::check(&module).unwrap_err();
        assert_eq!(error.kind, ErrorKind::Type);
    }

    #[test]
    fn reference_instructions() {
        check_source(
            "(module (func $f) (func (result i32) (ref.is_null (ref.func $f))))",
        )
        .unwrap();
        check_source("(module (func (result i32) (ref.is_null (ref.null extern))))").unwrap();

        let error =
            check_source("(module (func (result i32) (ref.is_null (i32.const 1))))").unwrap_err();
        assert_eq!(error.kind, ErrorKind::Type);
    }
}
