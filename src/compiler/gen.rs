//! The binary emitter walks a fully-lowered, type-checked
//! `ModuleExpression` and produces the bytes of a WebAssembly module:
//! magic and version, then the sections in canonical order, each
//! length-framed and omitted when empty. By the time it runs, the
//! lowerer has resolved every symbolic name and interned every
//! signature; anything else left in a body is an internal error.

use crate::common::number;
use crate::common::opcode::{Imm, OpInfo, ValType};
use crate::compiler::syntax::Syntax;
use crate::construct::ir::{
    self, BlockExpression, DataExpression, ElemExpression, FunctionExpression, GlobalExpression,
    ImportDesc, ImportExpression, Item, Limits, ModuleExpression, OperationTree, Reference,
    SignatureType, TableType, TokenExpression,
};
use crate::construct::token::{Keyword, Token};

const MAGIC: [u8; 4] = *b"\0asm";
const VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

const FUNC_TYPE: u8 = 0x60;
const EMPTY_BLOCKTYPE: u8 = 0x40;
const ELSE: u8 = 0x05;
const END: u8 = 0x0b;

pub struct Emitter<'module> {
    module: &'module ModuleExpression,
    out: Vec<u8>,
}

impl<'module> Emitter<'module> {
    pub fn emit(module: &ModuleExpression) -> Result<Vec<u8>, Syntax> {
        let mut emitter = Emitter {
            module,
            out: vec![],
        };

        emitter.out.extend_from_slice(&MAGIC);
        emitter.out.extend_from_slice(&VERSION);

        emitter.section(1, module.global_types.len(), Emitter::type_section)?;
        emitter.section(2, module.imports.len(), Emitter::import_section)?;
        emitter.section(3, module.functions.len(), Emitter::function_section)?;
        emitter.section(4, module.tables.len(), Emitter::table_section)?;
        emitter.section(5, module.memories.len(), Emitter::memory_section)?;
        emitter.section(6, module.global_vars.len(), Emitter::global_section)?;
        emitter.section(7, module.exports.len(), Emitter::export_section)?;
        emitter.section(8, module.start.iter().len(), Emitter::start_section)?;
        emitter.section(9, module.elems.len(), Emitter::elem_section)?;
        emitter.section(10, module.functions.len(), Emitter::code_section)?;
        emitter.section(11, module.datas.len(), Emitter::data_section)?;

        log::debug!("emitted {} bytes", emitter.out.len());
        Ok(emitter.out)
    }

    /// Frames one section: id byte, payload size, payload.
    /// Empty sections are omitted.
    fn section(
        &mut self,
        id: u8,
        count: usize,
        payload: impl Fn(&Self, &mut Vec<u8>) -> Result<(), Syntax>,
    ) -> Result<(), Syntax> {
        if count == 0 {
            return Ok(());
        }

        let mut bytes = vec![];
        payload(self, &mut bytes)?;
        self.out.push(id);
        number::unsigned(bytes.len() as u64, &mut self.out);
        self.out.extend(bytes);
        Ok(())
    }

    fn type_section(&self, out: &mut Vec<u8>) -> Result<(), Syntax> {
        number::unsigned(self.module.global_types.len() as u64, out);
        for signature in &self.module.global_types {
            out.push(FUNC_TYPE);
            valtype_vec(&signature.params, out);
            valtype_vec(&signature.results, out);
        }
        Ok(())
    }

    fn import_section(&self, out: &mut Vec<u8>) -> Result<(), Syntax> {
        number::unsigned(self.module.imports.len() as u64, out);
        for ImportExpression { module, name, desc } in &self.module.imports {
            name_vec(module, out);
            name_vec(name, out);
            out.push(desc.kind().code());
            match desc {
                ImportDesc::Func { type_index } => {
                    number::unsigned(u64::from(*type_index), out)
                }
                ImportDesc::Table(table) => table_type(table, out),
                ImportDesc::Memory(limits_) => limits(limits_, out),
                ImportDesc::Global(global) => {
                    out.push(global.valtype.code());
                    out.push(global.mutable as u8);
                }
            }
        }
        Ok(())
    }

    fn function_section(&self, out: &mut Vec<u8>) -> Result<(), Syntax> {
        number::unsigned(self.module.functions.len() as u64, out);
        for function in &self.module.functions {
            number::unsigned(u64::from(function.type_index), out);
        }
        Ok(())
    }

    fn table_section(&self, out: &mut Vec<u8>) -> Result<(), Syntax> {
        number::unsigned(self.module.tables.len() as u64, out);
        for table in &self.module.tables {
            table_type(table, out);
        }
        Ok(())
    }

    fn memory_section(&self, out: &mut Vec<u8>) -> Result<(), Syntax> {
        number::unsigned(self.module.memories.len() as u64, out);
        for memory in &self.module.memories {
            limits(memory, out);
        }
        Ok(())
    }

    fn global_section(&self, out: &mut Vec<u8>) -> Result<(), Syntax> {
        number::unsigned(self.module.global_vars.len() as u64, out);
        for GlobalExpression { ty, init } in &self.module.global_vars {
            out.push(ty.valtype.code());
            out.push(ty.mutable as u8);
            self.expression(init, out)?;
            out.push(END);
        }
        Ok(())
    }

    fn export_section(&self, out: &mut Vec<u8>) -> Result<(), Syntax> {
        number::unsigned(self.module.exports.len() as u64, out);
        for export in &self.module.exports {
            let index = match export.reference {
                Reference::Index(index) => index,
                Reference::Name(_) => {
                    return Err(Syntax::internal(
                        "an export reached emission unresolved",
                    ))
                }
            };
            name_vec(&export.name, out);
            out.push(export.kind.code());
            number::unsigned(u64::from(index), out);
        }
        Ok(())
    }

    fn start_section(&self, out: &mut Vec<u8>) -> Result<(), Syntax> {
        if let Some(start) = self.module.start {
            number::unsigned(u64::from(start), out);
        }
        Ok(())
    }

    fn elem_section(&self, out: &mut Vec<u8>) -> Result<(), Syntax> {
        number::unsigned(self.module.elems.len() as u64, out);
        for ElemExpression {
            table,
            offset,
            funcs,
        } in &self.module.elems
        {
            number::unsigned(u64::from(*table), out);
            self.expression(offset, out)?;
            out.push(END);
            number::unsigned(funcs.len() as u64, out);
            for func in funcs {
                number::unsigned(u64::from(*func), out);
            }
        }
        Ok(())
    }

    fn code_section(&self, out: &mut Vec<u8>) -> Result<(), Syntax> {
        number::unsigned(self.module.functions.len() as u64, out);
        for function in &self.module.functions {
            let body = self.function_body(function)?;
            number::unsigned(body.len() as u64, out);
            out.extend(body);
        }
        Ok(())
    }

    fn data_section(&self, out: &mut Vec<u8>) -> Result<(), Syntax> {
        number::unsigned(self.module.datas.len() as u64, out);
        for DataExpression {
            memory,
            offset,
            bytes,
        } in &self.module.datas
        {
            number::unsigned(u64::from(*memory), out);
            self.expression(offset, out)?;
            out.push(END);
            number::unsigned(bytes.len() as u64, out);
            out.extend_from_slice(bytes);
        }
        Ok(())
    }

    /// One code entry: run-length-grouped local declarations, the
    /// instruction stream, `end`.
    fn function_body(&self, function: &FunctionExpression) -> Result<Vec<u8>, Syntax> {
        let mut out = vec![];

        let mut groups: Vec<(u32, ValType)> = vec![];
        for ty in &function.signature.locals {
            match groups.last_mut() {
                Some((count, grouped)) if grouped == ty => *count += 1,
                _ => groups.push((1, *ty)),
            }
        }
        number::unsigned(groups.len() as u64, &mut out);
        for (count, ty) in groups {
            number::unsigned(u64::from(count), &mut out);
            out.push(ty.code());
        }

        self.expression(&function.body, &mut out)?;
        out.push(END);
        Ok(out)
    }

    /// Encodes an instruction sequence (without a trailing `end`).
    fn expression(&self, expression: &TokenExpression, out: &mut Vec<u8>) -> Result<(), Syntax> {
        match expression {
            TokenExpression::Operation(tree) => self.operation(tree, out),
            TokenExpression::Unfolded(unfolded) => self.items(&unfolded.items, out),
            TokenExpression::Block(block) => self.block(block, out),
            TokenExpression::Empty => Ok(()),
        }
    }

    fn items(&self, items: &[Item], out: &mut Vec<u8>) -> Result<(), Syntax> {
        let mut index = 0;
        while index < items.len() {
            match &items[index] {
                Item::Token(token) => match &token.item {
                    Token::Op(op) => {
                        let immediates = &items[index + 1..];
                        let count = ir::immediate_count(op, immediates);
                        out.push(op.code);
                        self.immediates(op, &immediates[..count], out)?;
                        index += 1 + count;
                    }
                    other => {
                        return Err(Syntax::internal(&format!(
                            "stray `{}` in an emitted body",
                            other,
                        )))
                    }
                },
                Item::Operation(tree) => {
                    self.operation(tree, out)?;
                    index += 1;
                }
                Item::Block(block) => {
                    self.block(block, out)?;
                    index += 1;
                }
            }
        }
        Ok(())
    }

    /// A still-folded operation encodes as its unfolding would:
    /// arguments, operator, immediates.
    fn operation(&self, tree: &OperationTree, out: &mut Vec<u8>) -> Result<(), Syntax> {
        let op = match &tree.operator.item {
            Token::Op(op) => op,
            other => {
                return Err(Syntax::internal(&format!(
                    "`{}` can't head an operation tree",
                    other,
                )))
            }
        };

        let count = ir::immediate_count(op, &tree.operands);
        let (immediates, arguments) = tree.operands.split_at(count);
        self.items(arguments, out)?;
        out.push(op.code);
        self.immediates(op, immediates, out)
    }

    fn block(&self, block: &BlockExpression, out: &mut Vec<u8>) -> Result<(), Syntax> {
        out.push(block.kind.code());
        self.blocktype(&block.signature, out)?;
        self.expression(&block.body, out)?;
        if let Some(alternate) = &block.alternate {
            if !matches!(alternate, TokenExpression::Empty) {
                out.push(ELSE);
                self.expression(alternate, out)?;
            }
        }
        out.push(END);
        Ok(())
    }

    /// The blocktype: empty, a single value type, or the signed index
    /// of the interned signature.
    fn blocktype(&self, signature: &SignatureType, out: &mut Vec<u8>) -> Result<(), Syntax> {
        if signature.params.is_empty() {
            match signature.results.as_slice() {
                [] => {
                    out.push(EMPTY_BLOCKTYPE);
                    return Ok(());
                }
                [single] => {
                    out.push(single.code());
                    return Ok(());
                }
                _ => {}
            }
        }

        let index = self
            .module
            .resolve_global_type_index(signature)
            .ok_or_else(|| Syntax::internal("a block signature was not interned"))?;
        number::signed(i64::from(index), out);
        Ok(())
    }

    fn immediates(
        &self,
        op: &'static OpInfo,
        immediates: &[Item],
        out: &mut Vec<u8>,
    ) -> Result<(), Syntax> {
        match op.imm {
            Imm::None => Ok(()),
            Imm::Literal(ValType::I32) => {
                let value = imm_integer(immediates.first())?;
                number::signed(i64::from(value as u32 as i32), out);
                Ok(())
            }
            Imm::Literal(ValType::I64) => {
                number::signed(imm_integer(immediates.first())?, out);
                Ok(())
            }
            Imm::Literal(ValType::F32) => {
                number::float32(imm_float(immediates.first())? as f32, out);
                Ok(())
            }
            Imm::Literal(_) => {
                number::float64(imm_float(immediates.first())?, out);
                Ok(())
            }
            Imm::LocalIndex | Imm::GlobalIndex | Imm::FuncIndex | Imm::Label => {
                number::unsigned(imm_integer(immediates.first())? as u64, out);
                Ok(())
            }
            Imm::LabelTable => {
                // targets, then the default
                number::unsigned(immediates.len() as u64 - 1, out);
                for immediate in immediates {
                    number::unsigned(imm_integer(Some(immediate))? as u64, out);
                }
                Ok(())
            }
            Imm::TypeUse => {
                number::unsigned(imm_integer(immediates.first())? as u64, out);
                number::unsigned(0, out); // table 0
                Ok(())
            }
            Imm::HeapType => match immediates.first() {
                Some(Item::Token(token)) if token.item == Token::Keyword(Keyword::Extern) => {
                    out.push(ValType::Externref.code());
                    Ok(())
                }
                Some(Item::Token(token)) if token.item == Token::Keyword(Keyword::Func) => {
                    out.push(ValType::Funcref.code());
                    Ok(())
                }
                _ => Err(Syntax::internal("malformed heap-type immediate")),
            },
        }
    }
}

fn valtype_vec(types: &[ValType], out: &mut Vec<u8>) {
    number::unsigned(types.len() as u64, out);
    for ty in types {
        out.push(ty.code());
    }
}

/// A length-prefixed byte string.
fn name_vec(bytes: &[u8], out: &mut Vec<u8>) {
    number::unsigned(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

fn limits(limits: &Limits, out: &mut Vec<u8>) {
    match limits.max {
        Some(max) => {
            out.push(0x01);
            number::unsigned(u64::from(limits.min), out);
            number::unsigned(u64::from(max), out);
        }
        None => {
            out.push(0x00);
            number::unsigned(u64::from(limits.min), out);
        }
    }
}

fn table_type(table: &TableType, out: &mut Vec<u8>) {
    out.push(table.element.code());
    limits(&table.limits, out);
}

fn imm_integer(item: Option<&Item>) -> Result<i64, Syntax> {
    match item {
        Some(Item::Token(token)) => match token.item {
            Token::Integer(value) => Ok(value),
            _ => Err(Syntax::internal("malformed numeric immediate")),
        },
        _ => Err(Syntax::internal("missing immediate in an emitted body")),
    }
}

fn imm_float(item: Option<&Item>) -> Result<f64, Syntax> {
    match item {
        Some(Item::Token(token)) => match token.item {
            Token::Float(value) => Ok(value),
            Token::Integer(value) => Ok(value as f64),
            _ => Err(Syntax::internal("malformed float immediate")),
        },
        _ => Err(Syntax::internal("missing immediate in an emitted body")),
    }
}
