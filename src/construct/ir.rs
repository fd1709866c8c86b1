//! The lowered intermediate representation. A `ModuleExpression` owns
//! everything the emitter needs: interned signatures, functions with
//! desugared bodies, resolved exports, and the supplemental sections.
//! Ownership is strictly tree-shaped; lowering threads its context
//! (name environments, label stack) as parameters instead of storing
//! parent pointers.

use crate::common::opcode::{Imm, OpInfo, ValType};
use crate::common::span::{Span, Spanned};
use crate::construct::token::{Keyword, Token};

/// A function-type descriptor: parameter and result value-type lists.
/// Equality is structural; the module interns these so that every
/// distinct signature occurs at most once.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SignatureType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl SignatureType {
    pub fn new(params: Vec<ValType>, results: Vec<ValType>) -> SignatureType {
        SignatureType { params, results }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.results.is_empty()
    }
}

/// A function's full signature: its type plus names.
/// Name-slot counts always equal the corresponding type counts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionSignature {
    pub name: Option<String>,
    pub inline_export: Option<String>,
    pub signature: SignatureType,
    pub param_names: Vec<Option<String>>,
    pub locals: Vec<ValType>,
    pub local_names: Vec<Option<String>>,
}

impl FunctionSignature {
    /// The type of the index'th slot in the params-then-locals space.
    pub fn local_type(&self, index: u32) -> Option<ValType> {
        let params = self.signature.params.len();
        let index = index as usize;
        if index < params {
            Some(self.signature.params[index])
        } else {
            self.locals.get(index - params).copied()
        }
    }

    /// Resolves a symbolic local name to the smallest matching index,
    /// params first, then locals.
    pub fn resolve_local(&self, name: &str) -> Option<u32> {
        let slot = |slot: &Option<String>| slot.as_deref() == Some(name);
        if let Some(index) = self.param_names.iter().position(slot) {
            return Some(index as u32);
        }
        self.local_names
            .iter()
            .position(slot)
            .map(|index| (index + self.param_names.len()) as u32)
    }
}

/// The four importable and exportable entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternKind {
    Func,
    Table,
    Memory,
    Global,
}

impl ExternKind {
    /// The kind's byte in export and import descriptors.
    pub fn code(self) -> u8 {
        match self {
            ExternKind::Func => 0x00,
            ExternKind::Table => 0x01,
            ExternKind::Memory => 0x02,
            ExternKind::Global => 0x03,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ExternKind::Func => "func",
            ExternKind::Table => "table",
            ExternKind::Memory => "memory",
            ExternKind::Global => "global",
        }
    }
}

/// A reference to an entity: already a numeric index, or a symbolic
/// name waiting for the resolution pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    Index(u32),
    Name(String),
}

/// One export entry: the exported name, the entity kind, and the
/// reference into that kind's index space.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportExpression {
    pub name: Vec<u8>,
    pub kind: ExternKind,
    pub reference: Reference,
    pub span: Span,
}

/// One entry of the module's directory of named top-level entities.
/// Every entity in every index space gets an entry, named or not, so an
/// entry's position within its kind is the entity's index.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalName {
    pub name: Option<String>,
    pub kind: ExternKind,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub min: u32,
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableType {
    pub element: ValType,
    pub limits: Limits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    pub mutable: bool,
    pub valtype: ValType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportDesc {
    Func { type_index: u32 },
    Table(TableType),
    Memory(Limits),
    Global(GlobalType),
}

impl ImportDesc {
    pub fn kind(&self) -> ExternKind {
        match self {
            ImportDesc::Func { .. } => ExternKind::Func,
            ImportDesc::Table(_) => ExternKind::Table,
            ImportDesc::Memory(_) => ExternKind::Memory,
            ImportDesc::Global(_) => ExternKind::Global,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportExpression {
    pub module: Vec<u8>,
    pub name: Vec<u8>,
    pub desc: ImportDesc,
}

/// A wasm global definition: its type and its constant init expression.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalExpression {
    pub ty: GlobalType,
    pub init: TokenExpression,
}

/// An active element segment on table 0.
#[derive(Debug, Clone, PartialEq)]
pub struct ElemExpression {
    pub table: u32,
    pub offset: TokenExpression,
    pub funcs: Vec<u32>,
}

/// An active data segment on memory 0.
#[derive(Debug, Clone, PartialEq)]
pub struct DataExpression {
    pub memory: u32,
    pub offset: TokenExpression,
    pub bytes: Vec<u8>,
}

/// A locally-defined function: its signature, the index of that
/// signature in the module's type table, and the lowered body.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionExpression {
    pub signature: FunctionSignature,
    pub type_index: u32,
    pub body: TokenExpression,
}

/// The root IR node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModuleExpression {
    /// Ordered, structurally deduplicated signature table.
    /// First insertion wins the index.
    pub global_types: Vec<SignatureType>,
    pub imports: Vec<ImportExpression>,
    /// Locally-defined functions. The function *index space* is
    /// imported functions first, then these, in order.
    pub functions: Vec<FunctionExpression>,
    /// Directory of top-level entities for symbolic resolution.
    pub globals: Vec<GlobalName>,
    pub exports: Vec<ExportExpression>,
    pub tables: Vec<TableType>,
    pub memories: Vec<Limits>,
    pub global_vars: Vec<GlobalExpression>,
    pub elems: Vec<ElemExpression>,
    pub datas: Vec<DataExpression>,
    pub start: Option<u32>,
}

impl ModuleExpression {
    /// Interns a signature: scans for a structurally equal entry and
    /// appends only if absent. Returns the entry's index either way.
    pub fn add_global_type(&mut self, signature: SignatureType) -> u32 {
        match self.global_types.iter().position(|t| t == &signature) {
            Some(index) => index as u32,
            None => {
                log::trace!(
                    "interning signature ({:?}) -> ({:?}) at index {}",
                    signature.params,
                    signature.results,
                    self.global_types.len(),
                );
                self.global_types.push(signature);
                (self.global_types.len() - 1) as u32
            }
        }
    }

    /// The index of an already-interned signature. `None` means the
    /// signature was never registered, which is a bug in the lowerer;
    /// callers surface it as an internal error.
    pub fn resolve_global_type_index(&self, signature: &SignatureType) -> Option<u32> {
        self.global_types
            .iter()
            .position(|t| t == signature)
            .map(|index| index as u32)
    }

    /// Registers an entity in the name directory, returning its index
    /// within its kind's index space.
    pub fn declare(&mut self, name: Option<String>, kind: ExternKind) -> u32 {
        let index = self.next_index(kind);
        self.globals.push(GlobalName { name, kind, index });
        index
    }

    /// The next free index in a kind's index space.
    pub fn next_index(&self, kind: ExternKind) -> u32 {
        self.globals.iter().filter(|g| g.kind == kind).count() as u32
    }

    /// Resolves a symbolic name within a kind's index space.
    pub fn resolve_name(&self, kind: ExternKind, name: &str) -> Option<u32> {
        self.globals
            .iter()
            .find(|g| g.kind == kind && g.name.as_deref() == Some(name))
            .map(|g| g.index)
    }

    pub fn imported_func_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.desc, ImportDesc::Func { .. }))
            .count() as u32
    }

    /// The signature of a function by its index in the function index
    /// space (imports first).
    pub fn func_signature(&self, index: u32) -> Option<&SignatureType> {
        let mut remaining = index;
        for import in &self.imports {
            if let ImportDesc::Func { type_index } = import.desc {
                if remaining == 0 {
                    return self.global_types.get(type_index as usize);
                }
                remaining -= 1;
            }
        }
        self.functions
            .get(remaining as usize)
            .and_then(|f| self.global_types.get(f.type_index as usize))
    }

    /// The type of a global by its index in the global index space
    /// (imports first).
    pub fn global_type(&self, index: u32) -> Option<GlobalType> {
        let mut remaining = index;
        for import in &self.imports {
            if let ImportDesc::Global(ty) = import.desc {
                if remaining == 0 {
                    return Some(ty);
                }
                remaining -= 1;
            }
        }
        self.global_vars.get(remaining as usize).map(|g| g.ty)
    }
}

/// The three structured control constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Block,
    Loop,
    If,
}

impl BlockKind {
    /// The construct's header byte in the binary format.
    pub fn code(self) -> u8 {
        match self {
            BlockKind::Block => 0x02,
            BlockKind::Loop => 0x03,
            BlockKind::If => 0x04,
        }
    }

    pub fn keyword(self) -> Keyword {
        match self {
            BlockKind::Block => Keyword::Block,
            BlockKind::Loop => Keyword::Loop,
            BlockKind::If => Keyword::If,
        }
    }
}

/// A folded s-expression `(op arg₁ … argₙ)`. The operator's immediate
/// tokens, if any, lead the operand list; the remaining operands are
/// the folded argument expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationTree {
    pub operator: Spanned<Token>,
    pub operands: Vec<Item>,
}

/// A stack-form sequence of instructions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnfoldedTokenExpression {
    pub items: Vec<Item>,
}

/// A structured control construct: `block`, `loop`, or `if`. Introduces
/// a label scope and a typed entry/exit. `alternate` is the `else` arm,
/// present only for `if` (an `if` without `else` carries `Empty`).
#[derive(Debug, Clone, PartialEq)]
pub struct BlockExpression {
    pub kind: BlockKind,
    pub label: Option<String>,
    pub signature: SignatureType,
    pub body: TokenExpression,
    pub alternate: Option<TokenExpression>,
    pub span: Span,
}

/// One item of an instruction sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Token(Spanned<Token>),
    Operation(OperationTree),
    Block(BlockExpression),
}

/// An instruction sequence in any of its shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenExpression {
    Operation(OperationTree),
    Unfolded(UnfoldedTokenExpression),
    Block(Box<BlockExpression>),
    Empty,
}

impl Default for TokenExpression {
    fn default() -> TokenExpression {
        TokenExpression::Empty
    }
}

/// How many leading items of an instruction sequence (or operand list)
/// are the given operator's immediate tokens.
pub fn immediate_count(op: &OpInfo, items: &[Item]) -> usize {
    match op.imm {
        Imm::None => 0,
        Imm::LabelTable => {
            // every leading numeric token belongs to the jump table
            items
                .iter()
                .take_while(|item| matches!(item, Item::Token(t) if matches!(t.item, Token::Integer(_))))
                .count()
        }
        _ => items
            .iter()
            .take_while(|item| matches!(item, Item::Token(_)))
            .count()
            .min(1),
    }
}

/// Splits an operand list into the operator's leading immediate tokens
/// and the remaining argument expressions.
fn split_immediates(op: &OpInfo, operands: Vec<Item>) -> (Vec<Item>, Vec<Item>) {
    let lead = immediate_count(op, &operands);
    let mut operands = operands;
    let rest = operands.split_off(lead);
    (operands, rest)
}

impl TokenExpression {
    /// Desugars folded forms away: `(op a b)` becomes the unfolding of
    /// `a`, then of `b`, then `op` itself, with the operator's
    /// immediates kept glued after the operator. Block constructs stay
    /// structured, their bodies unfolded in place. Total, and
    /// idempotent on already-unfolded forms.
    pub fn unfold(self) -> TokenExpression {
        TokenExpression::Unfolded(UnfoldedTokenExpression {
            items: Self::unfold_expression(self),
        })
    }

    fn unfold_expression(expression: TokenExpression) -> Vec<Item> {
        match expression {
            TokenExpression::Operation(tree) => Self::unfold_operation(tree),
            TokenExpression::Unfolded(unfolded) => unfolded
                .items
                .into_iter()
                .flat_map(Self::unfold_item)
                .collect(),
            TokenExpression::Block(block) => vec![Item::Block(Self::unfold_block(*block))],
            TokenExpression::Empty => vec![],
        }
    }

    fn unfold_item(item: Item) -> Vec<Item> {
        match item {
            Item::Token(token) => vec![Item::Token(token)],
            Item::Operation(tree) => Self::unfold_operation(tree),
            Item::Block(block) => vec![Item::Block(Self::unfold_block(block))],
        }
    }

    fn unfold_operation(tree: OperationTree) -> Vec<Item> {
        let OperationTree { operator, operands } = tree;
        let (immediates, arguments) = match &operator.item {
            Token::Op(op) => split_immediates(op, operands),
            _ => (vec![], operands),
        };

        let mut items: Vec<Item> = arguments.into_iter().flat_map(Self::unfold_item).collect();
        items.push(Item::Token(operator));
        items.extend(immediates);
        items
    }

    fn unfold_block(block: BlockExpression) -> BlockExpression {
        BlockExpression {
            kind: block.kind,
            label: block.label,
            signature: block.signature,
            body: block.body.unfold(),
            alternate: block.alternate.map(TokenExpression::unfold),
            span: block.span,
        }
    }

    /// The flat token rendering of the sequence: block constructs
    /// become an explicit header and a matching `end` (plus `else` for
    /// two-armed `if`s). This is the shape the invariants talk about;
    /// the emitter walks the structured items instead.
    pub fn flatten(&self) -> Vec<Token> {
        let mut tokens = vec![];
        self.flatten_into(&mut tokens);
        tokens
    }

    fn flatten_into(&self, out: &mut Vec<Token>) {
        match self {
            TokenExpression::Operation(tree) => Self::flatten_operation(tree, out),
            TokenExpression::Unfolded(unfolded) => {
                for item in &unfolded.items {
                    Self::flatten_item(item, out);
                }
            }
            TokenExpression::Block(block) => Self::flatten_block(block, out),
            TokenExpression::Empty => {}
        }
    }

    fn flatten_item(item: &Item, out: &mut Vec<Token>) {
        match item {
            Item::Token(token) => out.push(token.item.clone()),
            Item::Operation(tree) => Self::flatten_operation(tree, out),
            Item::Block(block) => Self::flatten_block(block, out),
        }
    }

    fn flatten_operation(tree: &OperationTree, out: &mut Vec<Token>) {
        let (immediates, arguments) = match &tree.operator.item {
            Token::Op(op) => split_immediates(op, tree.operands.clone()),
            _ => (vec![], tree.operands.clone()),
        };

        for argument in &arguments {
            Self::flatten_item(argument, out);
        }
        out.push(tree.operator.item.clone());
        for immediate in &immediates {
            Self::flatten_item(immediate, out);
        }
    }

    fn flatten_block(block: &BlockExpression, out: &mut Vec<Token>) {
        out.push(Token::Keyword(block.kind.keyword()));
        block.body.flatten_into(out);
        if let Some(alternate) = &block.alternate {
            if !matches!(alternate, TokenExpression::Empty) {
                out.push(Token::Keyword(Keyword::Else));
                alternate.flatten_into(out);
            }
        }
        out.push(Token::Keyword(Keyword::End));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::opcode;

    fn token(token: Token) -> Item {
        Item::Token(Spanned::new(token, Span::empty()))
    }

    fn op(mnemonic: &str) -> Spanned<Token> {
        Spanned::new(
            Token::Op(opcode::lookup(mnemonic).unwrap()),
            Span::empty(),
        )
    }

    #[test]
    fn interning_dedups() {
        let mut module = ModuleExpression::default();
        let sig = SignatureType::new(vec![ValType::I32], vec![ValType::I32]);

        assert_eq!(module.add_global_type(sig.clone()), 0);
        assert_eq!(module.add_global_type(SignatureType::default()), 1);
        assert_eq!(module.add_global_type(sig.clone()), 0);
        assert_eq!(module.global_types.len(), 2);
        assert_eq!(module.resolve_global_type_index(&sig), Some(0));
    }

    #[test]
    fn name_directory() {
        let mut module = ModuleExpression::default();
        assert_eq!(module.declare(Some("a".to_string()), ExternKind::Func), 0);
        assert_eq!(module.declare(None, ExternKind::Table), 0);
        assert_eq!(module.declare(Some("b".to_string()), ExternKind::Func), 1);

        assert_eq!(module.resolve_name(ExternKind::Func, "b"), Some(1));
        assert_eq!(module.resolve_name(ExternKind::Func, "c"), None);
        assert_eq!(module.resolve_name(ExternKind::Table, "b"), None);
    }

    #[test]
    fn local_resolution_prefers_params() {
        let signature = FunctionSignature {
            signature: SignatureType::new(vec![ValType::F64], vec![]),
            param_names: vec![Some("x".to_string())],
            locals: vec![ValType::I32, ValType::I32],
            local_names: vec![None, Some("y".to_string())],
            ..FunctionSignature::default()
        };

        assert_eq!(signature.resolve_local("x"), Some(0));
        assert_eq!(signature.resolve_local("y"), Some(2));
        assert_eq!(signature.resolve_local("z"), None);
        assert_eq!(signature.local_type(1), Some(ValType::I32));
        assert_eq!(signature.local_type(3), None);
    }

    #[test]
    fn unfold_folded_operation() {
        // (f64.add (local.get 0) (local.get 1))
        let tree = TokenExpression::Operation(OperationTree {
            operator: op("f64.add"),
            operands: vec![
                Item::Operation(OperationTree {
                    operator: op("local.get"),
                    operands: vec![token(Token::Integer(0))],
                }),
                Item::Operation(OperationTree {
                    operator: op("local.get"),
                    operands: vec![token(Token::Integer(1))],
                }),
            ],
        });

        let flat = tree.unfold().flatten();
        assert_eq!(
            flat,
            vec![
                Token::Op(opcode::lookup("local.get").unwrap()),
                Token::Integer(0),
                Token::Op(opcode::lookup("local.get").unwrap()),
                Token::Integer(1),
                Token::Op(opcode::lookup("f64.add").unwrap()),
            ]
        );
    }

    #[test]
    fn unfold_is_idempotent() {
        let tree = TokenExpression::Operation(OperationTree {
            operator: op("i32.eqz"),
            operands: vec![Item::Operation(OperationTree {
                operator: op("i32.const"),
                operands: vec![token(Token::Integer(7))],
            })],
        });

        let once = tree.unfold();
        let twice = once.clone().unfold();
        assert_eq!(once, twice);
    }

    #[test]
    fn unfold_is_identity_on_flat_streams() {
        let items = vec![
            token(Token::Op(opcode::lookup("i32.const").unwrap())),
            token(Token::Integer(0)),
            token(Token::Op(opcode::lookup("i32.eqz").unwrap())),
        ];
        let expression =
            TokenExpression::Unfolded(UnfoldedTokenExpression { items: items.clone() });

        assert_eq!(
            expression.unfold(),
            TokenExpression::Unfolded(UnfoldedTokenExpression { items })
        );
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        /// A small generator of token expressions: constant leaves,
        /// folded unary/binary arithmetic, and blocks.
        fn arbitrary_expression() -> impl Strategy<Value = TokenExpression> {
            let leaf = any::<i32>().prop_map(|n| {
                TokenExpression::Operation(OperationTree {
                    operator: op("i32.const"),
                    operands: vec![token(Token::Integer(i64::from(n)))],
                })
            });

            leaf.prop_recursive(4, 16, 2, |inner| {
                prop_oneof![
                    inner.clone().prop_map(|a| {
                        TokenExpression::Operation(OperationTree {
                            operator: op("i32.eqz"),
                            operands: vec![Item::Operation(match a {
                                TokenExpression::Operation(tree) => tree,
                                _ => unreachable!(),
                            })],
                        })
                    }),
                    (inner.clone(), inner.clone()).prop_map(|(a, b)| {
                        let unwrap = |e: TokenExpression| match e {
                            TokenExpression::Operation(tree) => Item::Operation(tree),
                            _ => unreachable!(),
                        };
                        TokenExpression::Operation(OperationTree {
                            operator: op("i32.add"),
                            operands: vec![unwrap(a), unwrap(b)],
                        })
                    }),
                ]
            })
        }

        proptest! {
            #[test]
            fn unfold_is_idempotent_on_arbitrary_trees(expression in arbitrary_expression()) {
                let once = expression.unfold();
                let twice = once.clone().unfold();
                prop_assert_eq!(once, twice);
            }

            #[test]
            fn unfolding_preserves_the_flat_rendering(expression in arbitrary_expression()) {
                let flat = expression.flatten();
                prop_assert_eq!(expression.unfold().flatten(), flat);
            }

            #[test]
            fn interning_never_duplicates(signatures in proptest::collection::vec(
                proptest::collection::vec(
                    prop_oneof![Just(ValType::I32), Just(ValType::I64), Just(ValType::F64)],
                    0..3,
                ),
                0..12,
            )) {
                let mut module = ModuleExpression::default();
                for params in signatures {
                    module.add_global_type(SignatureType::new(params, vec![]));
                }
                for (index, signature) in module.global_types.iter().enumerate() {
                    prop_assert_eq!(
                        module.resolve_global_type_index(signature),
                        Some(index as u32)
                    );
                }
            }
        }
    }

    #[test]
    fn blocks_flatten_with_header_and_end() {
        let block = TokenExpression::Block(Box::new(BlockExpression {
            kind: BlockKind::Block,
            label: Some("exit".to_string()),
            signature: SignatureType::default(),
            body: TokenExpression::Unfolded(UnfoldedTokenExpression {
                items: vec![token(Token::Op(opcode::lookup("nop").unwrap()))],
            }),
            alternate: None,
            span: Span::empty(),
        }));

        assert_eq!(
            block.flatten(),
            vec![
                Token::Keyword(Keyword::Block),
                Token::Op(opcode::lookup("nop").unwrap()),
                Token::Keyword(Keyword::End),
            ]
        );
    }
}
