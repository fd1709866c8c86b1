use std::iter::Peekable;
use std::mem;
use std::vec::IntoIter;

use crate::common::opcode::{Imm, OpInfo, ValType};
use crate::common::span::{Span, Spanned};
use crate::compiler::syntax::Syntax;
use crate::construct::ir::{
    BlockExpression, BlockKind, DataExpression, ElemExpression, ExportExpression, ExternKind,
    FunctionExpression, FunctionSignature, GlobalExpression, GlobalType, ImportDesc,
    ImportExpression, Item, Limits, ModuleExpression, OperationTree, Reference, SignatureType,
    TableType, TokenExpression, UnfoldedTokenExpression,
};
use crate::construct::token::{Keyword, Token};
use crate::construct::tree::ParseTree;

type Cursor = Peekable<IntoIter<ParseTree>>;

/// A function body set aside during the header pass,
/// lowered once all module-level names are known.
struct PendingFunction {
    position: usize,
    signature: FunctionSignature,
    items: Vec<ParseTree>,
}

struct PendingConstExpr {
    position: usize,
    items: Vec<ParseTree>,
}

struct PendingElem {
    offset: Vec<ParseTree>,
    refs: Vec<Spanned<Token>>,
}

struct PendingData {
    offset: Vec<ParseTree>,
    bytes: Vec<u8>,
}

/// The lowerer turns the parse tree into a `ModuleExpression`:
/// it desugars folded s-expressions into stack form, resolves symbolic
/// names to numeric indices, interns duplicate signatures, and
/// synthesizes export entries from the inline shorthand.
///
/// Lowering runs in two passes over the module's fields. The first
/// collects every header - signatures, names, imports, declarations -
/// so each index space is complete; the second lowers bodies and
/// constant expressions, which lets forward references to functions
/// resolve.
pub struct Lowerer {
    module: ModuleExpression,
    pending: Vec<PendingFunction>,
    pending_globals: Vec<PendingConstExpr>,
    pending_elems: Vec<PendingElem>,
    pending_datas: Vec<PendingData>,
    pending_start: Option<Spanned<Token>>,
    // which kinds have seen a definition, to keep imports in front
    defined: Vec<ExternKind>,
    // an empty signature for lowering module-level constant expressions
    no_locals: FunctionSignature,
}

impl Lowerer {
    pub fn lower(tree: ParseTree) -> Result<ModuleExpression, Syntax> {
        let mut lowerer = Lowerer {
            module: ModuleExpression::default(),
            pending: vec![],
            pending_globals: vec![],
            pending_elems: vec![],
            pending_datas: vec![],
            pending_start: None,
            defined: vec![],
            no_locals: FunctionSignature::default(),
        };

        let fields = Lowerer::module_fields(tree)?;
        for field in fields {
            lowerer.field_header(field)?;
        }
        lowerer.lower_pending()?;

        log::debug!(
            "lowered module: {} types, {} functions, {} exports",
            lowerer.module.global_types.len(),
            lowerer.module.functions.len(),
            lowerer.module.exports.len(),
        );
        Ok(lowerer.module)
    }

    /// Peels the synthetic root and the `module` head off the tree,
    /// returning the field forms.
    fn module_fields(tree: ParseTree) -> Result<Vec<ParseTree>, Syntax> {
        let span = tree.span().clone();
        let mut children = match tree {
            ParseTree::Group(children) => children.item,
            ParseTree::Leaf(token) => {
                return Err(Syntax::form("Expected a `(module …)` form", &token.span))
            }
        };

        // the reader guarantees exactly one child; hand-built trees
        // might not hold up their end
        if children.len() > 1 {
            return Err(Syntax::form(
                "Expected exactly one top-level form",
                children[1].span(),
            ));
        }
        let module = match children.pop() {
            Some(module) => module,
            None => return Err(Syntax::form("Expected a `(module …)` form", &span)),
        };

        let (mut fields, span) = match module {
            ParseTree::Group(children) => (children.item.into_iter(), children.span),
            ParseTree::Leaf(token) => {
                return Err(Syntax::form("Expected a `(module …)` form", &token.span))
            }
        };

        match fields.next() {
            Some(ParseTree::Leaf(head)) if head.item == Token::Keyword(Keyword::Module) => {}
            _ => return Err(Syntax::form("Expected a form headed by `module`", &span)),
        }

        Ok(fields.collect())
    }

    /// First pass: dispatches one module field by its head keyword and
    /// lowers its header.
    fn field_header(&mut self, field: ParseTree) -> Result<(), Syntax> {
        let span = field.span().clone();
        let children = match field {
            ParseTree::Group(children) => children.item,
            ParseTree::Leaf(token) => {
                return Err(Syntax::form(
                    "Expected a parenthesized module field",
                    &token.span,
                ))
            }
        };

        let mut cursor = children.into_iter().peekable();
        let head = match cursor.next() {
            Some(ParseTree::Leaf(token)) => token,
            _ => return Err(Syntax::form("Expected a field head keyword", &span)),
        };

        match head.item.keyword() {
            Some(Keyword::Func) => self.func_field(cursor, &span),
            Some(Keyword::Import) => self.import_field(cursor, &span),
            Some(Keyword::Type) => self.type_field(cursor, &span),
            Some(Keyword::Table) => self.table_field(cursor, &span),
            Some(Keyword::Memory) => self.memory_field(cursor, &span),
            Some(Keyword::Global) => self.global_field(cursor, &span),
            Some(Keyword::Export) => self.export_field(cursor, &span),
            Some(Keyword::Start) => self.start_field(cursor, &span),
            Some(Keyword::Elem) => self.elem_field(cursor, &span),
            Some(Keyword::Data) => self.data_field(cursor, &span),
            _ => Err(Syntax::form(
                &format!("`{}` is not a module field", head.item),
                &head.span,
            )),
        }
    }

    /// Marks a kind as defined and rejects imports that come after.
    fn define(&mut self, kind: ExternKind) {
        if !self.defined.contains(&kind) {
            self.defined.push(kind);
        }
    }

    // ----- module fields, first pass -----

    /// `(func id? inlineExport? typeuse local* instr*)`
    fn func_field(&mut self, mut cursor: Cursor, span: &Span) -> Result<(), Syntax> {
        let mut signature = FunctionSignature {
            name: self.leading_name(&mut cursor),
            ..FunctionSignature::default()
        };

        // inline-export shorthand, removed here and synthesized below
        while self.peek_head(&mut cursor) == Some(Keyword::Export) {
            let group = self.next_group(&mut cursor).unwrap();
            let export = self.inline_export(group)?;
            if signature.inline_export.is_some() {
                return Err(Syntax::form("Duplicate inline export", &export.span));
            }
            signature.inline_export = Some(export.item);
        }

        self.typeuse_and_locals(&mut cursor, &mut signature)?;

        let type_index = self.module.add_global_type(signature.signature.clone());
        let index = self.module.declare(signature.name.clone(), ExternKind::Func);
        self.define(ExternKind::Func);

        if let Some(export_name) = &signature.inline_export {
            self.module.exports.push(ExportExpression {
                name: export_name.as_bytes().to_vec(),
                kind: ExternKind::Func,
                reference: Reference::Index(index),
                span: span.clone(),
            });
        }

        self.pending.push(PendingFunction {
            position: self.module.functions.len(),
            signature: signature.clone(),
            items: cursor.collect(),
        });
        self.module.functions.push(FunctionExpression {
            signature,
            type_index,
            body: TokenExpression::Empty,
        });
        Ok(())
    }

    /// `(import "module" "name" desc)`
    fn import_field(&mut self, mut cursor: Cursor, span: &Span) -> Result<(), Syntax> {
        let module = self.text_literal(&mut cursor, span)?;
        let name = self.text_literal(&mut cursor, span)?;

        let desc_group = match cursor.next() {
            Some(ParseTree::Group(children)) => children,
            _ => return Err(Syntax::form("Expected an import descriptor form", span)),
        };
        let desc_span = desc_group.span.clone();
        let mut desc_cursor = desc_group.item.into_iter().peekable();
        let head = match desc_cursor.next() {
            Some(ParseTree::Leaf(token)) => token,
            _ => return Err(Syntax::form("Expected an import descriptor", &desc_span)),
        };

        let entity_name = self.leading_name(&mut desc_cursor);
        let (kind, desc) = match head.item.keyword() {
            Some(Keyword::Func) => {
                let mut signature = FunctionSignature::default();
                self.typeuse_and_locals(&mut desc_cursor, &mut signature)?;
                if !signature.locals.is_empty() {
                    return Err(Syntax::form(
                        "An imported function can't declare locals",
                        &desc_span,
                    ));
                }
                let type_index = self.module.add_global_type(signature.signature);
                (ExternKind::Func, ImportDesc::Func { type_index })
            }
            Some(Keyword::Table) => {
                let limits = self.limits(&mut desc_cursor, &desc_span)?;
                let element = self.ref_type(&mut desc_cursor, &desc_span)?;
                (ExternKind::Table, ImportDesc::Table(TableType { element, limits }))
            }
            Some(Keyword::Memory) => {
                let limits = self.limits(&mut desc_cursor, &desc_span)?;
                (ExternKind::Memory, ImportDesc::Memory(limits))
            }
            Some(Keyword::Global) => {
                let ty = self.global_type(&mut desc_cursor, &desc_span)?;
                (ExternKind::Global, ImportDesc::Global(ty))
            }
            _ => {
                return Err(Syntax::form(
                    &format!("`{}` can't be imported", head.item),
                    &head.span,
                ))
            }
        };

        if self.defined.contains(&kind) {
            return Err(Syntax::form(
                &format!(
                    "Imports of {}s must come before the first {} definition",
                    kind.name(),
                    kind.name(),
                ),
                span,
            ));
        }

        self.module.declare(entity_name, kind);
        self.module.imports.push(ImportExpression { module, name, desc });
        Ok(())
    }

    /// `(type id? (func typeuse))` - an explicit entry for the
    /// signature table. Duplicates intern to the existing index.
    fn type_field(&mut self, mut cursor: Cursor, span: &Span) -> Result<(), Syntax> {
        let _name = self.leading_name(&mut cursor);

        let group = match cursor.next() {
            Some(ParseTree::Group(children)) => children,
            _ => return Err(Syntax::form("Expected a `(func …)` type form", span)),
        };
        let mut inner = group.item.into_iter().peekable();
        match inner.next() {
            Some(ParseTree::Leaf(head)) if head.item == Token::Keyword(Keyword::Func) => {}
            _ => return Err(Syntax::form("Expected a form headed by `func`", &group.span)),
        }

        let mut signature = FunctionSignature::default();
        self.typeuse_and_locals(&mut inner, &mut signature)?;
        if !signature.locals.is_empty() {
            return Err(Syntax::form("A type can't declare locals", &group.span));
        }
        self.module.add_global_type(signature.signature);
        Ok(())
    }

    /// `(table id? limits reftype)`
    fn table_field(&mut self, mut cursor: Cursor, span: &Span) -> Result<(), Syntax> {
        let name = self.leading_name(&mut cursor);
        let limits = self.limits(&mut cursor, span)?;
        let element = self.ref_type(&mut cursor, span)?;

        self.module.declare(name, ExternKind::Table);
        self.define(ExternKind::Table);
        self.module.tables.push(TableType { element, limits });
        Ok(())
    }

    /// `(memory id? limits)`
    fn memory_field(&mut self, mut cursor: Cursor, span: &Span) -> Result<(), Syntax> {
        let name = self.leading_name(&mut cursor);
        let limits = self.limits(&mut cursor, span)?;

        self.module.declare(name, ExternKind::Memory);
        self.define(ExternKind::Memory);
        self.module.memories.push(limits);
        Ok(())
    }

    /// `(global id? globaltype initexpr)`
    fn global_field(&mut self, mut cursor: Cursor, span: &Span) -> Result<(), Syntax> {
        let name = self.leading_name(&mut cursor);
        let ty = self.global_type(&mut cursor, span)?;

        self.module.declare(name, ExternKind::Global);
        self.define(ExternKind::Global);
        self.pending_globals.push(PendingConstExpr {
            position: self.module.global_vars.len(),
            items: cursor.collect(),
        });
        self.module.global_vars.push(GlobalExpression {
            ty,
            init: TokenExpression::Empty,
        });
        Ok(())
    }

    /// `(export "name" (kind idOrName))`
    fn export_field(&mut self, mut cursor: Cursor, span: &Span) -> Result<(), Syntax> {
        let name = self.text_literal(&mut cursor, span)?;

        let group = match cursor.next() {
            Some(ParseTree::Group(children)) => children,
            _ => return Err(Syntax::form("Expected an export descriptor form", span)),
        };
        let mut inner = group.item.into_iter();
        let kind = match inner.next() {
            Some(ParseTree::Leaf(token)) => match token.item.keyword() {
                Some(Keyword::Func) => ExternKind::Func,
                Some(Keyword::Table) => ExternKind::Table,
                Some(Keyword::Memory) => ExternKind::Memory,
                Some(Keyword::Global) => ExternKind::Global,
                _ => {
                    return Err(Syntax::form(
                        &format!("`{}` can't be exported", token.item),
                        &token.span,
                    ))
                }
            },
            _ => return Err(Syntax::form("Expected an export kind", &group.span)),
        };

        let reference = match inner.next() {
            Some(ParseTree::Leaf(token)) => match token.item {
                Token::Name(name) => Reference::Name(name),
                Token::Integer(index) => Reference::Index(index_from(index, &token.span)?),
                _ => {
                    return Err(Syntax::form(
                        "Expected an index or a symbolic name",
                        &token.span,
                    ))
                }
            },
            _ => return Err(Syntax::form("Expected an index or a symbolic name", &group.span)),
        };

        self.module.exports.push(ExportExpression {
            name,
            kind,
            reference,
            span: span.clone(),
        });
        Ok(())
    }

    /// `(start idOrName)`
    fn start_field(&mut self, mut cursor: Cursor, span: &Span) -> Result<(), Syntax> {
        if self.pending_start.is_some() {
            return Err(Syntax::form("A module can have only one start function", span));
        }
        match cursor.next() {
            Some(ParseTree::Leaf(token))
                if matches!(token.item, Token::Name(_) | Token::Integer(_)) =>
            {
                self.pending_start = Some(token);
                Ok(())
            }
            _ => Err(Syntax::form("Expected a start function index or name", span)),
        }
    }

    /// `(elem offsetexpr func? funcidx*)` - active segment on table 0.
    fn elem_field(&mut self, mut cursor: Cursor, span: &Span) -> Result<(), Syntax> {
        if let Some(index) = self.leading_index(&mut cursor)? {
            if index.item != Token::Integer(0) {
                return Err(Syntax::form("Only table 0 can take element segments", &index.span));
            }
        }
        let offset = self.offset_expr(&mut cursor, span)?;

        let mut refs = vec![];
        for item in cursor {
            match item {
                // modern element lists lead with a `func` keyword
                ParseTree::Leaf(token) if token.item == Token::Keyword(Keyword::Func) => {}
                ParseTree::Leaf(token)
                    if matches!(token.item, Token::Name(_) | Token::Integer(_)) =>
                {
                    refs.push(token)
                }
                other => {
                    return Err(Syntax::form(
                        "Expected a function index or name",
                        other.span(),
                    ))
                }
            }
        }

        self.pending_elems.push(PendingElem { offset, refs });
        Ok(())
    }

    /// `(data offsetexpr "bytes"*)` - active segment on memory 0.
    fn data_field(&mut self, mut cursor: Cursor, span: &Span) -> Result<(), Syntax> {
        if let Some(index) = self.leading_index(&mut cursor)? {
            if index.item != Token::Integer(0) {
                return Err(Syntax::form("Only memory 0 can take data segments", &index.span));
            }
        }
        let offset = self.offset_expr(&mut cursor, span)?;

        let mut bytes = vec![];
        for item in cursor {
            match item {
                ParseTree::Leaf(Spanned {
                    item: Token::Str(chunk),
                    ..
                }) => bytes.extend(chunk),
                other => return Err(Syntax::form("Expected a text literal", other.span())),
            }
        }

        self.pending_datas.push(PendingData { offset, bytes });
        Ok(())
    }

    // ----- second pass -----

    /// Lowers everything set aside by the header pass, now that every
    /// index space is complete.
    fn lower_pending(&mut self) -> Result<(), Syntax> {
        for pending in mem::take(&mut self.pending) {
            let PendingFunction {
                position,
                signature,
                items,
            } = pending;
            let mut labels = vec![];
            let body = self.lower_body(items, &signature, &mut labels)?.unfold();
            self.module.functions[position].body = body;
        }

        let no_locals = self.no_locals.clone();
        for pending in mem::take(&mut self.pending_globals) {
            let mut labels = vec![];
            let init = self
                .lower_body(pending.items, &no_locals, &mut labels)?
                .unfold();
            self.module.global_vars[pending.position].init = init;
        }

        for pending in mem::take(&mut self.pending_elems) {
            let mut labels = vec![];
            let offset = self
                .lower_body(pending.offset, &no_locals, &mut labels)?
                .unfold();
            let mut funcs = vec![];
            for reference in pending.refs {
                funcs.push(self.entity_index(ExternKind::Func, &reference)?);
            }
            self.module.elems.push(ElemExpression {
                table: 0,
                offset,
                funcs,
            });
        }

        for pending in mem::take(&mut self.pending_datas) {
            let mut labels = vec![];
            let offset = self
                .lower_body(pending.offset, &no_locals, &mut labels)?
                .unfold();
            self.module.datas.push(DataExpression {
                memory: 0,
                offset,
                bytes: pending.bytes,
            });
        }

        if let Some(reference) = self.pending_start.take() {
            let index = self.entity_index(ExternKind::Func, &reference)?;
            let signature = self.module.func_signature(index).cloned();
            match signature {
                Some(signature) if signature.is_empty() => self.module.start = Some(index),
                Some(_) => {
                    return Err(Syntax::form(
                        "The start function must have no parameters and no results",
                        &reference.span,
                    ))
                }
                None => {
                    return Err(Syntax::name(
                        &format!("No function with index {}", index),
                        &reference.span,
                    ))
                }
            }
        }

        let exports = mem::take(&mut self.module.exports);
        self.module.exports = exports
            .into_iter()
            .map(|export| self.resolve_export(export))
            .collect::<Result<_, _>>()?;

        Ok(())
    }

    fn resolve_export(&self, export: ExportExpression) -> Result<ExportExpression, Syntax> {
        let index = match &export.reference {
            Reference::Index(index) => {
                if *index >= self.module.next_index(export.kind) {
                    return Err(Syntax::name(
                        &format!("No {} with index {}", export.kind.name(), index),
                        &export.span,
                    ));
                }
                *index
            }
            Reference::Name(name) => self
                .module
                .resolve_name(export.kind, name)
                .ok_or_else(|| {
                    Syntax::name(
                        &format!("No {} named `${}`", export.kind.name(), name),
                        &export.span,
                    )
                })?,
        };

        Ok(ExportExpression {
            reference: Reference::Index(index),
            ..export
        })
    }

    /// Resolves a token that references an entity by index or name.
    fn entity_index(&self, kind: ExternKind, token: &Spanned<Token>) -> Result<u32, Syntax> {
        match &token.item {
            Token::Integer(index) => {
                let index = index_from(*index, &token.span)?;
                if index >= self.module.next_index(kind) {
                    return Err(Syntax::name(
                        &format!("No {} with index {}", kind.name(), index),
                        &token.span,
                    ));
                }
                Ok(index)
            }
            Token::Name(name) => self.module.resolve_name(kind, name).ok_or_else(|| {
                Syntax::name(
                    &format!("No {} named `${}`", kind.name(), name),
                    &token.span,
                )
            }),
            _ => Err(Syntax::form("Expected an index or a symbolic name", &token.span)),
        }
    }

    // ----- body lowering -----

    /// Lowers an instruction sequence: a mixture of single tokens,
    /// folded s-expressions, and stack-form block constructs.
    fn lower_body(
        &mut self,
        items: Vec<ParseTree>,
        signature: &FunctionSignature,
        labels: &mut Vec<Option<String>>,
    ) -> Result<TokenExpression, Syntax> {
        let mut cursor = items.into_iter().peekable();
        let mut out = vec![];

        while let Some(item) = cursor.next() {
            self.lower_instr(item, &mut cursor, &mut out, signature, labels)?;
        }

        if out.is_empty() {
            Ok(TokenExpression::Empty)
        } else {
            Ok(TokenExpression::Unfolded(UnfoldedTokenExpression { items: out }))
        }
    }

    /// Lowers one body item into `out`. Stack-form instructions pull
    /// their immediates (and, for block keywords, their whole body)
    /// from the cursor.
    fn lower_instr(
        &mut self,
        item: ParseTree,
        cursor: &mut Cursor,
        out: &mut Vec<Item>,
        signature: &FunctionSignature,
        labels: &mut Vec<Option<String>>,
    ) -> Result<(), Syntax> {
        match item {
            ParseTree::Leaf(token) => match token.item {
                Token::Op(op) => {
                    let immediates =
                        self.take_immediates(op, &token.span, cursor, signature, labels)?;
                    out.push(Item::Token(token));
                    out.extend(immediates);
                    Ok(())
                }
                Token::Keyword(Keyword::Block) => {
                    let block =
                        self.stack_block(BlockKind::Block, token.span, cursor, signature, labels)?;
                    out.push(Item::Block(block));
                    Ok(())
                }
                Token::Keyword(Keyword::Loop) => {
                    let block =
                        self.stack_block(BlockKind::Loop, token.span, cursor, signature, labels)?;
                    out.push(Item::Block(block));
                    Ok(())
                }
                Token::Keyword(Keyword::If) => {
                    let block =
                        self.stack_block(BlockKind::If, token.span, cursor, signature, labels)?;
                    out.push(Item::Block(block));
                    Ok(())
                }
                _ => Err(Syntax::form(
                    &format!("Expected an instruction, found `{}`", token.item),
                    &token.span,
                )),
            },
            ParseTree::Group(children) => {
                self.lower_folded(children.item, children.span, out, signature, labels)
            }
        }
    }

    /// Lowers a folded form: `(op …)`, `(block …)`, `(loop …)`, or
    /// `(if …)`.
    fn lower_folded(
        &mut self,
        children: Vec<ParseTree>,
        span: Span,
        out: &mut Vec<Item>,
        signature: &FunctionSignature,
        labels: &mut Vec<Option<String>>,
    ) -> Result<(), Syntax> {
        let mut cursor = children.into_iter().peekable();
        let head = match cursor.next() {
            Some(ParseTree::Leaf(token)) => token,
            _ => return Err(Syntax::form("Expected an instruction form", &span)),
        };

        match head.item {
            Token::Op(op) => {
                let tree = self.folded_operation(head, op, cursor, signature, labels)?;
                out.push(Item::Operation(tree));
                Ok(())
            }
            Token::Keyword(Keyword::Block) => {
                let block =
                    self.folded_block(BlockKind::Block, span, cursor, signature, labels)?;
                out.push(Item::Block(block));
                Ok(())
            }
            Token::Keyword(Keyword::Loop) => {
                let block = self.folded_block(BlockKind::Loop, span, cursor, signature, labels)?;
                out.push(Item::Block(block));
                Ok(())
            }
            Token::Keyword(Keyword::If) => {
                self.folded_if(span, cursor, out, signature, labels)
            }
            _ => Err(Syntax::form(
                &format!("`{}` doesn't start an instruction", head.item),
                &head.span,
            )),
        }
    }

    /// `(op imm* operand*)` - the operator's immediates lead, then the
    /// folded argument expressions.
    fn folded_operation(
        &mut self,
        operator: Spanned<Token>,
        op: &'static OpInfo,
        mut cursor: Cursor,
        signature: &FunctionSignature,
        labels: &mut Vec<Option<String>>,
    ) -> Result<OperationTree, Syntax> {
        let mut operands =
            self.take_immediates(op, &operator.span, &mut cursor, signature, labels)?;

        while let Some(child) = cursor.next() {
            self.lower_instr(child, &mut cursor, &mut operands, signature, labels)?;
        }

        Ok(OperationTree { operator, operands })
    }

    /// Stack-form `block`/`loop`/`if` … `end`, with an optional `else`
    /// arm splitting an `if` body.
    fn stack_block(
        &mut self,
        kind: BlockKind,
        open: Span,
        cursor: &mut Cursor,
        signature: &FunctionSignature,
        labels: &mut Vec<Option<String>>,
    ) -> Result<BlockExpression, Syntax> {
        let label = self.leading_name(cursor);
        let block_signature = self.block_typeuse(cursor)?;

        labels.push(label.clone());
        let mut body = vec![];
        let mut alternate: Option<Vec<Item>> = None;

        let result = loop {
            match cursor.next() {
                None => {
                    break Err(Syntax::form(
                        &format!("Expected `end` to close this `{}`", kind.keyword().name()),
                        &open,
                    ))
                }
                Some(ParseTree::Leaf(token)) if token.item == Token::Keyword(Keyword::End) => {
                    break Ok(())
                }
                Some(ParseTree::Leaf(token)) if token.item == Token::Keyword(Keyword::Else) => {
                    if kind != BlockKind::If || alternate.is_some() {
                        break Err(Syntax::form("`else` only splits an `if` body", &token.span));
                    }
                    alternate = Some(vec![]);
                }
                Some(item) => {
                    let target = match alternate {
                        Some(ref mut alternate) => alternate,
                        None => &mut body,
                    };
                    if let Err(error) = self.lower_instr(item, cursor, target, signature, labels) {
                        break Err(error);
                    }
                }
            }
        };
        labels.pop();
        result?;

        self.intern_block_signature(&block_signature);
        Ok(BlockExpression {
            kind,
            label,
            signature: block_signature,
            body: items_to_expression(body),
            alternate: match kind {
                BlockKind::If => Some(items_to_expression(alternate.unwrap_or_default())),
                _ => alternate.map(items_to_expression),
            },
            span: open,
        })
    }

    /// Folded `(block id? typeuse instr*)` / `(loop …)` - no `end`.
    fn folded_block(
        &mut self,
        kind: BlockKind,
        span: Span,
        mut cursor: Cursor,
        signature: &FunctionSignature,
        labels: &mut Vec<Option<String>>,
    ) -> Result<BlockExpression, Syntax> {
        let label = self.leading_name(&mut cursor);
        let block_signature = self.block_typeuse(&mut cursor)?;

        labels.push(label.clone());
        let mut body = vec![];
        let result: Result<(), Syntax> = (|| {
            while let Some(child) = cursor.next() {
                self.lower_instr(child, &mut cursor, &mut body, signature, labels)?;
            }
            Ok(())
        })();
        labels.pop();
        result?;

        self.intern_block_signature(&block_signature);
        Ok(BlockExpression {
            kind,
            label,
            signature: block_signature,
            body: items_to_expression(body),
            alternate: None,
            span,
        })
    }

    /// Folded `(if id? typeuse condexpr* (then instr*) (else instr*)?)`.
    /// The condition unfolds *before* the block, so this appends to
    /// `out` directly.
    fn folded_if(
        &mut self,
        span: Span,
        mut cursor: Cursor,
        out: &mut Vec<Item>,
        signature: &FunctionSignature,
        labels: &mut Vec<Option<String>>,
    ) -> Result<(), Syntax> {
        let label = self.leading_name(&mut cursor);
        let block_signature = self.block_typeuse(&mut cursor)?;

        // condition expressions sit outside the new label scope
        let mut condition = vec![];
        while cursor.peek().is_some() {
            if matches!(
                self.peek_head(&mut cursor),
                Some(Keyword::Then) | Some(Keyword::Else)
            ) {
                break;
            }
            let child = cursor.next().unwrap();
            self.lower_instr(child, &mut cursor, &mut condition, signature, labels)?;
        }

        let then_group = match self.next_group(&mut cursor) {
            Some(group) if group.item.first().is_some() => group,
            _ => return Err(Syntax::form("Expected a `(then …)` form in this `if`", &span)),
        };
        let mut then_cursor = then_group.item.into_iter().peekable();
        match then_cursor.next() {
            Some(ParseTree::Leaf(head)) if head.item == Token::Keyword(Keyword::Then) => {}
            _ => {
                return Err(Syntax::form(
                    "Expected a form headed by `then`",
                    &then_group.span,
                ))
            }
        }

        labels.push(label.clone());
        let result: Result<(Vec<Item>, Vec<Item>), Syntax> = (|| {
            let mut body = vec![];
            while let Some(child) = then_cursor.next() {
                self.lower_instr(child, &mut then_cursor, &mut body, signature, labels)?;
            }

            let mut alternate = vec![];
            if self.peek_head(&mut cursor) == Some(Keyword::Else) {
                let else_group = self.next_group(&mut cursor).unwrap();
                let mut else_cursor = else_group.item.into_iter().peekable();
                else_cursor.next(); // the `else` head
                while let Some(child) = else_cursor.next() {
                    self.lower_instr(child, &mut else_cursor, &mut alternate, signature, labels)?;
                }
            }
            Ok((body, alternate))
        })();
        labels.pop();
        let (body, alternate) = result?;

        if let Some(extra) = cursor.next() {
            return Err(Syntax::form("Unexpected extra form in this `if`", extra.span()));
        }

        self.intern_block_signature(&block_signature);
        out.extend(condition);
        out.push(Item::Block(BlockExpression {
            kind: BlockKind::If,
            label,
            signature: block_signature,
            body: items_to_expression(body),
            alternate: Some(items_to_expression(alternate)),
            span,
        }));
        Ok(())
    }

    /// Pulls and resolves an opcode's immediates: symbolic names become
    /// numeric index tokens, typeuses become interned type indices.
    fn take_immediates(
        &mut self,
        op: &'static OpInfo,
        op_span: &Span,
        cursor: &mut Cursor,
        signature: &FunctionSignature,
        labels: &[Option<String>],
    ) -> Result<Vec<Item>, Syntax> {
        let missing =
            |what: &str| Syntax::form(&format!("`{}` expects {}", op.mnemonic, what), op_span);

        match op.imm {
            Imm::None => Ok(vec![]),
            Imm::Literal(ty) => match next_leaf(cursor) {
                Some(token) if matches!(token.item, Token::Integer(_)) => {
                    if let Token::Integer(value) = token.item {
                        if ty == ValType::I32 && (value < i64::from(i32::MIN) || value > i64::from(u32::MAX)) {
                            return Err(Syntax::form(
                                &format!("`{}` is out of range for i32", value),
                                &token.span,
                            ));
                        }
                    }
                    Ok(vec![Item::Token(token)])
                }
                Some(token)
                    if matches!(token.item, Token::Float(_))
                        && matches!(ty, ValType::F32 | ValType::F64) =>
                {
                    Ok(vec![Item::Token(token)])
                }
                _ => Err(missing(&format!("a {} literal", ty))),
            },
            Imm::LocalIndex => {
                let token = next_leaf(cursor).ok_or_else(|| missing("a local index or name"))?;
                let index = match &token.item {
                    Token::Integer(index) => index_from(*index, &token.span)?,
                    Token::Name(name) => signature.resolve_local(name).ok_or_else(|| {
                        Syntax::name(&format!("No parameter or local named `${}`", name), &token.span)
                    })?,
                    _ => return Err(missing("a local index or name")),
                };
                Ok(vec![index_token(index, token.span)])
            }
            Imm::GlobalIndex => {
                let token = next_leaf(cursor).ok_or_else(|| missing("a global index or name"))?;
                let index = self.entity_immediate(ExternKind::Global, &token)?;
                Ok(vec![index_token(index, token.span)])
            }
            Imm::FuncIndex => {
                let token = next_leaf(cursor).ok_or_else(|| missing("a function index or name"))?;
                let index = self.entity_immediate(ExternKind::Func, &token)?;
                Ok(vec![index_token(index, token.span)])
            }
            Imm::Label => {
                let token = next_leaf(cursor).ok_or_else(|| missing("a label"))?;
                let depth = resolve_label(&token, labels)?;
                Ok(vec![index_token(depth, token.span)])
            }
            Imm::LabelTable => {
                let mut depths = vec![];
                while let Some(ParseTree::Leaf(peeked)) = cursor.peek() {
                    if !matches!(peeked.item, Token::Integer(_) | Token::Name(_)) {
                        break;
                    }
                    let token = next_leaf(cursor).unwrap();
                    let depth = resolve_label(&token, labels)?;
                    depths.push(index_token(depth, token.span));
                }
                if depths.is_empty() {
                    return Err(missing("at least one label"));
                }
                Ok(depths)
            }
            Imm::TypeUse => {
                let mut typeuse = FunctionSignature::default();
                while matches!(
                    self.peek_head(cursor),
                    Some(Keyword::Param) | Some(Keyword::Result)
                ) {
                    let group = self.next_group(cursor).unwrap();
                    self.binding_group(group, &mut typeuse, false)?;
                }
                let index = self.module.add_global_type(typeuse.signature);
                Ok(vec![index_token(index, op_span.clone())])
            }
            Imm::HeapType => match next_leaf(cursor) {
                Some(token)
                    if matches!(
                        token.item,
                        Token::Keyword(Keyword::Func) | Token::Keyword(Keyword::Extern)
                    ) =>
                {
                    Ok(vec![Item::Token(token)])
                }
                _ => Err(missing("a heap type, `func` or `extern`")),
            },
        }
    }

    /// Resolves a function or global immediate during body lowering.
    fn entity_immediate(&self, kind: ExternKind, token: &Spanned<Token>) -> Result<u32, Syntax> {
        match &token.item {
            Token::Integer(index) => index_from(*index, &token.span),
            Token::Name(name) => self.module.resolve_name(kind, name).ok_or_else(|| {
                Syntax::name(
                    &format!("No {} named `${}`", kind.name(), name),
                    &token.span,
                )
            }),
            _ => Err(Syntax::form("Expected an index or a symbolic name", &token.span)),
        }
    }

    // ----- headers and small forms -----

    /// An optional leading `$name`.
    fn leading_name(&self, cursor: &mut Cursor) -> Option<String> {
        if let Some(ParseTree::Leaf(token)) = cursor.peek() {
            if let Token::Name(_) = token.item {
                if let Some(ParseTree::Leaf(token)) = cursor.next() {
                    if let Token::Name(name) = token.item {
                        return Some(name);
                    }
                }
            }
        }
        None
    }

    /// An optional leading numeric index.
    fn leading_index(&self, cursor: &mut Cursor) -> Result<Option<Spanned<Token>>, Syntax> {
        if let Some(ParseTree::Leaf(token)) = cursor.peek() {
            if let Token::Integer(_) = token.item {
                if let Some(ParseTree::Leaf(token)) = cursor.next() {
                    return Ok(Some(token));
                }
            }
        }
        Ok(None)
    }

    /// The head keyword of the next group, without consuming it.
    fn peek_head(&self, cursor: &mut Cursor) -> Option<Keyword> {
        match cursor.peek() {
            Some(tree @ ParseTree::Group(_)) => tree.head_keyword(),
            _ => None,
        }
    }

    fn next_group(&self, cursor: &mut Cursor) -> Option<Spanned<Vec<ParseTree>>> {
        match cursor.next() {
            Some(ParseTree::Group(children)) => Some(children),
            _ => None,
        }
    }

    fn text_literal(&self, cursor: &mut Cursor, span: &Span) -> Result<Vec<u8>, Syntax> {
        match cursor.next() {
            Some(ParseTree::Leaf(Spanned {
                item: Token::Str(bytes),
                ..
            })) => Ok(bytes),
            Some(other) => Err(Syntax::form("Expected a text literal", other.span())),
            None => Err(Syntax::form("Expected a text literal", span)),
        }
    }

    /// `(export "name")`, the inline shorthand inside a `func` form.
    fn inline_export(&self, group: Spanned<Vec<ParseTree>>) -> Result<Spanned<String>, Syntax> {
        let span = group.span.clone();
        let mut cursor = group.item.into_iter().peekable();
        cursor.next(); // the `export` head

        let name = self.text_literal(&mut cursor, &span)?;
        if cursor.next().is_some() {
            return Err(Syntax::form("An inline export takes just a name", &span));
        }

        let name = String::from_utf8(name)
            .map_err(|_| Syntax::form("An export name must be valid UTF-8", &span))?;
        Ok(Spanned::new(name, span))
    }

    /// Parses the interleaved `(param …)`/`(result …)` typeuse and the
    /// `(local …)` declarations that may follow it.
    fn typeuse_and_locals(
        &mut self,
        cursor: &mut Cursor,
        signature: &mut FunctionSignature,
    ) -> Result<(), Syntax> {
        let mut seen_local = false;
        loop {
            match self.peek_head(cursor) {
                Some(Keyword::Param) | Some(Keyword::Result) if seen_local => {
                    let group = self.next_group(cursor).unwrap();
                    return Err(Syntax::form(
                        "Parameters and results must come before locals",
                        &group.span,
                    ));
                }
                Some(Keyword::Param) | Some(Keyword::Result) => {
                    let group = self.next_group(cursor).unwrap();
                    self.binding_group(group, signature, true)?;
                }
                Some(Keyword::Local) => {
                    seen_local = true;
                    let group = self.next_group(cursor).unwrap();
                    self.binding_group(group, signature, true)?;
                }
                _ => return Ok(()),
            }
        }
    }

    /// One `(param …)`, `(result …)`, or `(local …)` group. A named
    /// binding contributes exactly one slot; an unnamed one contributes
    /// a slot per type. `named` permits `$x` bindings at all (blocks
    /// and call sites take none).
    fn binding_group(
        &mut self,
        group: Spanned<Vec<ParseTree>>,
        signature: &mut FunctionSignature,
        named: bool,
    ) -> Result<(), Syntax> {
        let span = group.span.clone();
        let mut cursor = group.item.into_iter().peekable();
        let head = match cursor.next() {
            Some(ParseTree::Leaf(token)) => token,
            _ => return Err(Syntax::form("Expected `param`, `result`, or `local`", &span)),
        };
        let keyword = head.item.keyword();

        let name = self.leading_name(&mut cursor);
        if name.is_some() && (!named || keyword == Some(Keyword::Result)) {
            return Err(Syntax::form("This binding can't take a name", &span));
        }

        let mut types = vec![];
        for item in cursor {
            match item {
                ParseTree::Leaf(Spanned {
                    item: Token::ValType(ty),
                    ..
                }) => types.push(ty),
                other => return Err(Syntax::form("Expected a value type", other.span())),
            }
        }

        if name.is_some() && types.len() != 1 {
            return Err(Syntax::form(
                "A named binding declares exactly one type",
                &span,
            ));
        }

        match keyword {
            Some(Keyword::Param) => {
                signature
                    .param_names
                    .extend(expand_names(name, types.len()));
                signature.signature.params.extend(types);
            }
            Some(Keyword::Result) => signature.signature.results.extend(types),
            Some(Keyword::Local) => {
                signature
                    .local_names
                    .extend(expand_names(name, types.len()));
                signature.locals.extend(types);
            }
            _ => return Err(Syntax::form("Expected `param`, `result`, or `local`", &head.span)),
        }
        Ok(())
    }

    /// A block's typeuse: unnamed params and results only.
    fn block_typeuse(&mut self, cursor: &mut Cursor) -> Result<SignatureType, Syntax> {
        let mut signature = FunctionSignature::default();
        while matches!(
            self.peek_head(cursor),
            Some(Keyword::Param) | Some(Keyword::Result)
        ) {
            let group = self.next_group(cursor).unwrap();
            self.binding_group(group, &mut signature, false)?;
        }
        Ok(signature.signature)
    }

    /// Interns a block signature that will need a type index in the
    /// binary (anything beyond the single-result shorthands).
    fn intern_block_signature(&mut self, signature: &SignatureType) {
        if !signature.params.is_empty() || signature.results.len() > 1 {
            self.module.add_global_type(signature.clone());
        }
    }

    /// `min max?` limits.
    fn limits(&self, cursor: &mut Cursor, span: &Span) -> Result<Limits, Syntax> {
        let min = match self.leading_index(cursor)? {
            Some(token) => match token.item {
                Token::Integer(value) => index_from(value, &token.span)?,
                _ => unreachable!(),
            },
            None => return Err(Syntax::form("Expected a minimum size", span)),
        };
        let max = match self.leading_index(cursor)? {
            Some(token) => match token.item {
                Token::Integer(value) => Some(index_from(value, &token.span)?),
                _ => unreachable!(),
            },
            None => None,
        };
        Ok(Limits { min, max })
    }

    /// A table element type: `funcref` or `externref`.
    fn ref_type(&self, cursor: &mut Cursor, span: &Span) -> Result<ValType, Syntax> {
        match cursor.next() {
            Some(ParseTree::Leaf(Spanned {
                item: Token::ValType(ty),
                span,
            })) => {
                if ty.is_ref() {
                    Ok(ty)
                } else {
                    Err(Syntax::form(
                        &format!("`{}` is not a reference type", ty),
                        &span,
                    ))
                }
            }
            Some(other) => Err(Syntax::form("Expected a reference type", other.span())),
            None => Err(Syntax::form("Expected a reference type", span)),
        }
    }

    /// `(mut T)` or a bare value type.
    fn global_type(&self, cursor: &mut Cursor, span: &Span) -> Result<GlobalType, Syntax> {
        match cursor.next() {
            Some(ParseTree::Leaf(Spanned {
                item: Token::ValType(valtype),
                ..
            })) => Ok(GlobalType {
                mutable: false,
                valtype,
            }),
            Some(ParseTree::Group(children)) => {
                let span = children.span.clone();
                let mut inner = children.item.into_iter();
                match inner.next() {
                    Some(ParseTree::Leaf(head)) if head.item == Token::Keyword(Keyword::Mut) => {}
                    _ => return Err(Syntax::form("Expected a `(mut T)` form", &span)),
                }
                match inner.next() {
                    Some(ParseTree::Leaf(Spanned {
                        item: Token::ValType(valtype),
                        ..
                    })) => Ok(GlobalType {
                        mutable: true,
                        valtype,
                    }),
                    _ => Err(Syntax::form("Expected a value type", &span)),
                }
            }
            Some(other) => Err(Syntax::form("Expected a global type", other.span())),
            None => Err(Syntax::form("Expected a global type", span)),
        }
    }

    /// An `(offset instr*)` form, or a single folded instruction.
    fn offset_expr(&self, cursor: &mut Cursor, span: &Span) -> Result<Vec<ParseTree>, Syntax> {
        match cursor.next() {
            Some(ParseTree::Group(children)) => {
                if children
                    .item
                    .first()
                    .and_then(|item| match item {
                        ParseTree::Leaf(token) => token.item.keyword(),
                        _ => None,
                    })
                    == Some(Keyword::Offset)
                {
                    Ok(children.item.into_iter().skip(1).collect())
                } else {
                    Ok(vec![ParseTree::Group(children)])
                }
            }
            Some(other) => Err(Syntax::form("Expected an offset expression", other.span())),
            None => Err(Syntax::form("Expected an offset expression", span)),
        }
    }
}

/// Builds the name slots for one binding group: a named binding takes
/// its single slot, an unnamed one contributes an absent slot per
/// declared type. Keeps slot counts equal to type counts.
fn expand_names(name: Option<String>, count: usize) -> Vec<Option<String>> {
    match name {
        Some(name) => vec![Some(name)],
        None => vec![None; count],
    }
}

/// Packs lowered items back into an expression.
fn items_to_expression(items: Vec<Item>) -> TokenExpression {
    if items.is_empty() {
        TokenExpression::Empty
    } else {
        TokenExpression::Unfolded(UnfoldedTokenExpression { items })
    }
}

fn next_leaf(cursor: &mut Cursor) -> Option<Spanned<Token>> {
    match cursor.peek() {
        Some(ParseTree::Leaf(_)) => match cursor.next() {
            Some(ParseTree::Leaf(token)) => Some(token),
            _ => unreachable!(),
        },
        _ => None,
    }
}

fn index_token(index: u32, span: Span) -> Item {
    Item::Token(Spanned::new(Token::Integer(i64::from(index)), span))
}

/// Checks that a literal fits an index.
fn index_from(value: i64, span: &Span) -> Result<u32, Syntax> {
    u32::try_from(value)
        .map_err(|_| Syntax::form(&format!("`{}` is not a valid index", value), span))
}

/// `br $L` resolves to the depth offset from the innermost block to the
/// matching label; depth 0 is the innermost enclosing block.
fn resolve_label(token: &Spanned<Token>, labels: &[Option<String>]) -> Result<u32, Syntax> {
    match &token.item {
        Token::Integer(depth) => index_from(*depth, &token.span),
        Token::Name(name) => labels
            .iter()
            .rev()
            .position(|label| label.as_deref() == Some(name))
            .map(|depth| depth as u32)
            .ok_or_else(|| {
                Syntax::name(&format!("No enclosing block labeled `${}`", name), &token.span)
            }),
        _ => Err(Syntax::form("Expected a label", &token.span)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::opcode;
    use crate::common::source::Source;
    use crate::compiler::lex::Lexer;
    use crate::compiler::read::Reader;
    use crate::compiler::syntax::ErrorKind;

    fn lower_source(source: &str) -> Result<ModuleExpression, Syntax> {
        Lowerer::lower(Reader::read(Lexer::lex(Source::source(source))?)?)
    }

    fn flat_body(module: &ModuleExpression, index: usize) -> Vec<Token> {
        module.functions[index].body.flatten()
    }

    #[test]
    fn empty_function() {
        let module = lower_source("(module (func nop))").unwrap();

        assert_eq!(module.global_types, vec![SignatureType::default()]);
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.functions[0].type_index, 0);
        assert!(module.exports.is_empty());
        assert_eq!(
            flat_body(&module, 0),
            vec![Token::Op(opcode::lookup("nop").unwrap())]
        );
    }

    #[test]
    fn named_params_resolve_to_indices() {
        let module = lower_source(
            "(module (func (param $a f64) (param $b f64) (result f64) \
             (f64.add (local.get $a) (local.get $b))))",
        )
        .unwrap();

        assert_eq!(
            module.global_types,
            vec![SignatureType::new(
                vec![ValType::F64, ValType::F64],
                vec![ValType::F64]
            )]
        );
        assert_eq!(
            flat_body(&module, 0),
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
    fn inline_export_synthesizes_an_entry() {
        let module = lower_source("(module (func (export \"fn\") (param) (result)))").unwrap();

        assert_eq!(module.global_types, vec![SignatureType::default()]);
        assert_eq!(module.exports.len(), 1);
        assert_eq!(module.exports[0].name, b"fn".to_vec());
        assert_eq!(module.exports[0].kind, ExternKind::Func);
        assert_eq!(module.exports[0].reference, Reference::Index(0));
    }

    #[test]
    fn export_resolves_forward_names() {
        let module =
            lower_source("(module (export \"x\" (func $b)) (func $a) (func $b))").unwrap();

        assert_eq!(module.exports[0].reference, Reference::Index(1));
    }

    #[test]
    fn duplicate_signatures_intern_once() {
        let module = lower_source(
            "(module (func (param i32) (result i32) local.get 0) \
             (func (param i32) (result i32) local.get 0))",
        )
        .unwrap();

        assert_eq!(module.global_types.len(), 1);
        assert_eq!(module.functions[0].type_index, 0);
        assert_eq!(module.functions[1].type_index, 0);
    }

    #[test]
    fn stack_and_folded_blocks_agree() {
        let stacked = lower_source("(module (func block $exit nop end))").unwrap();
        let folded = lower_source("(module (func (block $exit nop)))").unwrap();

        // spans differ between the two sources; the token streams don't
        assert_eq!(flat_body(&stacked, 0), flat_body(&folded, 0));
        assert_eq!(
            flat_body(&stacked, 0),
            vec![
                Token::Keyword(Keyword::Block),
                Token::Op(opcode::lookup("nop").unwrap()),
                Token::Keyword(Keyword::End),
            ]
        );
    }

    #[test]
    fn branch_labels_resolve_to_depths() {
        let module = lower_source(
            "(module (func (block $outer (block $inner br $outer br $inner br 0))))",
        )
        .unwrap();

        assert_eq!(
            flat_body(&module, 0),
            vec![
                Token::Keyword(Keyword::Block),
                Token::Keyword(Keyword::Block),
                Token::Op(opcode::lookup("br").unwrap()),
                Token::Integer(1),
                Token::Op(opcode::lookup("br").unwrap()),
                Token::Integer(0),
                Token::Op(opcode::lookup("br").unwrap()),
                Token::Integer(0),
                Token::Keyword(Keyword::End),
                Token::Keyword(Keyword::End),
            ]
        );
    }

    #[test]
    fn call_resolves_forward_references() {
        let module = lower_source("(module (func call $later) (func $later))").unwrap();
        assert_eq!(
            flat_body(&module, 0),
            vec![
                Token::Op(opcode::lookup("call").unwrap()),
                Token::Integer(1),
            ]
        );
    }

    #[test]
    fn unknown_local_is_a_name_error() {
        let error = lower_source("(module (func local.get $missing))").unwrap_err();
        assert_eq!(error.kind, ErrorKind::Name);
    }

    #[test]
    fn unknown_label_is_a_name_error() {
        let error = lower_source("(module (func (block br $nowhere)))").unwrap_err();
        assert_eq!(error.kind, ErrorKind::Name);
    }

    #[test]
    fn if_gets_an_implicit_else() {
        let module =
            lower_source("(module (func (if (i32.const 1) (then nop))))").unwrap();

        assert_eq!(
            flat_body(&module, 0),
            vec![
                Token::Op(opcode::lookup("i32.const").unwrap()),
                Token::Integer(1),
                Token::Keyword(Keyword::If),
                Token::Op(opcode::lookup("nop").unwrap()),
                Token::Keyword(Keyword::End),
            ]
        );
    }

    #[test]
    fn imports_claim_the_front_of_the_index_space() {
        let module = lower_source(
            "(module (import \"env\" \"log\" (func $log (param i32))) \
             (func $main call $log))",
        )
        .unwrap();

        assert_eq!(module.imported_func_count(), 1);
        assert_eq!(
            flat_body(&module, 0),
            vec![
                Token::Op(opcode::lookup("call").unwrap()),
                Token::Integer(0),
            ]
        );
        assert_eq!(module.resolve_name(ExternKind::Func, "main"), Some(1));
    }

    #[test]
    fn imports_after_definitions_are_rejected() {
        let error = lower_source(
            "(module (func $main) (import \"env\" \"log\" (func $log)))",
        )
        .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Form);
    }

    #[test]
    fn params_after_locals_are_rejected() {
        let error =
            lower_source("(module (func (local i32) (param i32)))").unwrap_err();
        assert_eq!(error.kind, ErrorKind::Form);
    }

    #[test]
    fn named_binding_declares_one_type() {
        let error = lower_source("(module (func (param $x i32 i64)))").unwrap_err();
        assert_eq!(error.kind, ErrorKind::Form);
    }

    #[test]
    fn other_sections_lower() {
        let module = lower_source(
            "(module \
             (table $t 1 2 funcref) \
             (memory 1) \
             (global $g (mut i32) (i32.const 42)) \
             (func $f (result i32) global.get $g) \
             (elem (i32.const 0) $f) \
             (data (i32.const 8) \"hi\" \"!\") \
             (start $s) \
             (func $s))",
        )
        .unwrap();

        assert_eq!(module.tables.len(), 1);
        assert_eq!(module.memories, vec![Limits { min: 1, max: None }]);
        assert_eq!(module.global_vars.len(), 1);
        assert!(module.global_vars[0].ty.mutable);
        assert_eq!(module.elems.len(), 1);
        assert_eq!(module.elems[0].funcs, vec![0]);
        assert_eq!(module.datas[0].bytes, b"hi!".to_vec());
        assert_eq!(module.start, Some(1));
    }

    #[test]
    fn start_function_must_be_nullary() {
        let error =
            lower_source("(module (func $s (param i32)) (start $s))").unwrap_err();
        assert_eq!(error.kind, ErrorKind::Form);
    }

    #[test]
    fn multivalue_blocks_intern_their_signature() {
        let module = lower_source(
            "(module (func (result i32) (block (result i32 i32) \
             i32.const 1 i32.const 2) i32.add))",
        )
        .unwrap();

        let block_type = SignatureType::new(vec![], vec![ValType::I32, ValType::I32]);
        assert!(module.resolve_global_type_index(&block_type).is_some());
    }
}
