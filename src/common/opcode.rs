//! The static opcode table. Each entry carries the mnemonic, the opcode
//! byte identity, the opcode's static stack effect, and the class of
//! immediate it takes. Opcode tokens are denormalized against this table
//! at lexing time, so the later passes never look mnemonics up again.
//!
//! Context-dependent instructions (variable access, calls, branches)
//! declare an empty static effect here; the type checker derives their
//! real effect from the immediate's resolved target.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;

/// A scalar WebAssembly value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    Funcref,
    Externref,
}

impl ValType {
    /// The type's byte in the binary format.
    pub fn code(self) -> u8 {
        match self {
            ValType::I32 => 0x7f,
            ValType::I64 => 0x7e,
            ValType::F32 => 0x7d,
            ValType::F64 => 0x7c,
            ValType::Funcref => 0x70,
            ValType::Externref => 0x6f,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::Funcref => "funcref",
            ValType::Externref => "externref",
        }
    }

    pub fn is_ref(self) -> bool {
        matches!(self, ValType::Funcref | ValType::Externref)
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The class of immediate an opcode expects after its mnemonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Imm {
    /// No immediate.
    None,
    /// A numeric literal of the given type (`i32.const` and friends).
    Literal(ValType),
    /// An index into the current function's params-then-locals space.
    LocalIndex,
    /// An index into the module's global index space.
    GlobalIndex,
    /// An index into the module's function index space.
    FuncIndex,
    /// A label: a relative depth or a symbolic block label.
    Label,
    /// One or more labels followed by a default (`br_table`).
    LabelTable,
    /// An inline `(param …) (result …)` typeuse (`call_indirect`).
    TypeUse,
    /// A heap type, `func` or `extern` (`ref.null`).
    HeapType,
}

/// One row of the opcode table.
#[derive(Debug, PartialEq)]
pub struct OpInfo {
    pub mnemonic: &'static str,
    pub code: u8,
    pub consumes: &'static [ValType],
    pub produces: &'static [ValType],
    pub imm: Imm,
}

impl OpInfo {
    /// Whether this instruction ends the current sequence's reachable
    /// prefix (everything after it type-checks polymorphically).
    pub fn is_terminator(&self) -> bool {
        matches!(self.code, 0x00 | 0x0c | 0x0e | 0x0f)
    }
}

macro_rules! op {
    ($mnemonic:literal, $code:literal, [$($consume:ident)*] => [$($produce:ident)*]) => {
        op!($mnemonic, $code, [$($consume)*] => [$($produce)*], Imm::None)
    };
    ($mnemonic:literal, $code:literal, [$($consume:ident)*] => [$($produce:ident)*], $imm:expr) => {
        OpInfo {
            mnemonic: $mnemonic,
            code: $code,
            consumes: &[$(ValType::$consume),*],
            produces: &[$(ValType::$produce),*],
            imm: $imm,
        }
    };
}

/// Every opcode of the source-language surface, in opcode-byte order.
pub static OPCODES: &[OpInfo] = &[
    // control
    op!("unreachable", 0x00, [] => []),
    op!("nop", 0x01, [] => []),
    op!("br", 0x0c, [] => [], Imm::Label),
    op!("br_if", 0x0d, [I32] => [], Imm::Label),
    op!("br_table", 0x0e, [I32] => [], Imm::LabelTable),
    op!("return", 0x0f, [] => []),
    op!("call", 0x10, [] => [], Imm::FuncIndex),
    op!("call_indirect", 0x11, [] => [], Imm::TypeUse),
    // variable access
    op!("local.get", 0x20, [] => [], Imm::LocalIndex),
    op!("local.set", 0x21, [] => [], Imm::LocalIndex),
    op!("local.tee", 0x22, [] => [], Imm::LocalIndex),
    op!("global.get", 0x23, [] => [], Imm::GlobalIndex),
    op!("global.set", 0x24, [] => [], Imm::GlobalIndex),
    // constants
    op!("i32.const", 0x41, [] => [I32], Imm::Literal(ValType::I32)),
    op!("i64.const", 0x42, [] => [I64], Imm::Literal(ValType::I64)),
    op!("f32.const", 0x43, [] => [F32], Imm::Literal(ValType::F32)),
    op!("f64.const", 0x44, [] => [F64], Imm::Literal(ValType::F64)),
    // i32 comparison
    op!("i32.eqz", 0x45, [I32] => [I32]),
    op!("i32.eq", 0x46, [I32 I32] => [I32]),
    op!("i32.ne", 0x47, [I32 I32] => [I32]),
    op!("i32.lt_s", 0x48, [I32 I32] => [I32]),
    op!("i32.lt_u", 0x49, [I32 I32] => [I32]),
    op!("i32.gt_s", 0x4a, [I32 I32] => [I32]),
    op!("i32.gt_u", 0x4b, [I32 I32] => [I32]),
    op!("i32.le_s", 0x4c, [I32 I32] => [I32]),
    op!("i32.le_u", 0x4d, [I32 I32] => [I32]),
    op!("i32.ge_s", 0x4e, [I32 I32] => [I32]),
    op!("i32.ge_u", 0x4f, [I32 I32] => [I32]),
    // i64 comparison
    op!("i64.eqz", 0x50, [I64] => [I32]),
    op!("i64.eq", 0x51, [I64 I64] => [I32]),
    op!("i64.ne", 0x52, [I64 I64] => [I32]),
    op!("i64.lt_s", 0x53, [I64 I64] => [I32]),
    op!("i64.lt_u", 0x54, [I64 I64] => [I32]),
    op!("i64.gt_s", 0x55, [I64 I64] => [I32]),
    op!("i64.gt_u", 0x56, [I64 I64] => [I32]),
    op!("i64.le_s", 0x57, [I64 I64] => [I32]),
    op!("i64.le_u", 0x58, [I64 I64] => [I32]),
    op!("i64.ge_s", 0x59, [I64 I64] => [I32]),
    op!("i64.ge_u", 0x5a, [I64 I64] => [I32]),
    // f32 comparison
    op!("f32.eq", 0x5b, [F32 F32] => [I32]),
    op!("f32.ne", 0x5c, [F32 F32] => [I32]),
    op!("f32.lt", 0x5d, [F32 F32] => [I32]),
    op!("f32.gt", 0x5e, [F32 F32] => [I32]),
    op!("f32.le", 0x5f, [F32 F32] => [I32]),
    op!("f32.ge", 0x60, [F32 F32] => [I32]),
    // f64 comparison
    op!("f64.eq", 0x61, [F64 F64] => [I32]),
    op!("f64.ne", 0x62, [F64 F64] => [I32]),
    op!("f64.lt", 0x63, [F64 F64] => [I32]),
    op!("f64.gt", 0x64, [F64 F64] => [I32]),
    op!("f64.le", 0x65, [F64 F64] => [I32]),
    op!("f64.ge", 0x66, [F64 F64] => [I32]),
    // i32 arithmetic
    op!("i32.clz", 0x67, [I32] => [I32]),
    op!("i32.ctz", 0x68, [I32] => [I32]),
    op!("i32.popcnt", 0x69, [I32] => [I32]),
    op!("i32.add", 0x6a, [I32 I32] => [I32]),
    op!("i32.sub", 0x6b, [I32 I32] => [I32]),
    op!("i32.mul", 0x6c, [I32 I32] => [I32]),
    op!("i32.div_s", 0x6d, [I32 I32] => [I32]),
    op!("i32.div_u", 0x6e, [I32 I32] => [I32]),
    op!("i32.rem_s", 0x6f, [I32 I32] => [I32]),
    op!("i32.rem_u", 0x70, [I32 I32] => [I32]),
    op!("i32.and", 0x71, [I32 I32] => [I32]),
    op!("i32.or", 0x72, [I32 I32] => [I32]),
    op!("i32.xor", 0x73, [I32 I32] => [I32]),
    op!("i32.shl", 0x74, [I32 I32] => [I32]),
    op!("i32.shr_s", 0x75, [I32 I32] => [I32]),
    op!("i32.shr_u", 0x76, [I32 I32] => [I32]),
    op!("i32.rotl", 0x77, [I32 I32] => [I32]),
    op!("i32.rotr", 0x78, [I32 I32] => [I32]),
    // i64 arithmetic
    op!("i64.clz", 0x79, [I64] => [I64]),
    op!("i64.ctz", 0x7a, [I64] => [I64]),
    op!("i64.popcnt", 0x7b, [I64] => [I64]),
    op!("i64.add", 0x7c, [I64 I64] => [I64]),
    op!("i64.sub", 0x7d, [I64 I64] => [I64]),
    op!("i64.mul", 0x7e, [I64 I64] => [I64]),
    op!("i64.div_s", 0x7f, [I64 I64] => [I64]),
    op!("i64.div_u", 0x80, [I64 I64] => [I64]),
    op!("i64.rem_s", 0x81, [I64 I64] => [I64]),
    op!("i64.rem_u", 0x82, [I64 I64] => [I64]),
    op!("i64.and", 0x83, [I64 I64] => [I64]),
    op!("i64.or", 0x84, [I64 I64] => [I64]),
    op!("i64.xor", 0x85, [I64 I64] => [I64]),
    op!("i64.shl", 0x86, [I64 I64] => [I64]),
    op!("i64.shr_s", 0x87, [I64 I64] => [I64]),
    op!("i64.shr_u", 0x88, [I64 I64] => [I64]),
    op!("i64.rotl", 0x89, [I64 I64] => [I64]),
    op!("i64.rotr", 0x8a, [I64 I64] => [I64]),
    // f32 arithmetic
    op!("f32.abs", 0x8b, [F32] => [F32]),
    op!("f32.neg", 0x8c, [F32] => [F32]),
    op!("f32.ceil", 0x8d, [F32] => [F32]),
    op!("f32.floor", 0x8e, [F32] => [F32]),
    op!("f32.trunc", 0x8f, [F32] => [F32]),
    op!("f32.nearest", 0x90, [F32] => [F32]),
    op!("f32.sqrt", 0x91, [F32] => [F32]),
    op!("f32.add", 0x92, [F32 F32] => [F32]),
    op!("f32.sub", 0x93, [F32 F32] => [F32]),
    op!("f32.mul", 0x94, [F32 F32] => [F32]),
    op!("f32.div", 0x95, [F32 F32] => [F32]),
    op!("f32.min", 0x96, [F32 F32] => [F32]),
    op!("f32.max", 0x97, [F32 F32] => [F32]),
    op!("f32.copysign", 0x98, [F32 F32] => [F32]),
    // f64 arithmetic
    op!("f64.abs", 0x99, [F64] => [F64]),
    op!("f64.neg", 0x9a, [F64] => [F64]),
    op!("f64.ceil", 0x9b, [F64] => [F64]),
    op!("f64.floor", 0x9c, [F64] => [F64]),
    op!("f64.trunc", 0x9d, [F64] => [F64]),
    op!("f64.nearest", 0x9e, [F64] => [F64]),
    op!("f64.sqrt", 0x9f, [F64] => [F64]),
    op!("f64.add", 0xa0, [F64 F64] => [F64]),
    op!("f64.sub", 0xa1, [F64 F64] => [F64]),
    op!("f64.mul", 0xa2, [F64 F64] => [F64]),
    op!("f64.div", 0xa3, [F64 F64] => [F64]),
    op!("f64.min", 0xa4, [F64 F64] => [F64]),
    op!("f64.max", 0xa5, [F64 F64] => [F64]),
    op!("f64.copysign", 0xa6, [F64 F64] => [F64]),
    // conversions
    op!("i32.wrap_i64", 0xa7, [I64] => [I32]),
    op!("i32.trunc_f32_s", 0xa8, [F32] => [I32]),
    op!("i32.trunc_f32_u", 0xa9, [F32] => [I32]),
    op!("i32.trunc_f64_s", 0xaa, [F64] => [I32]),
    op!("i32.trunc_f64_u", 0xab, [F64] => [I32]),
    op!("i64.extend_i32_s", 0xac, [I32] => [I64]),
    op!("i64.extend_i32_u", 0xad, [I32] => [I64]),
    op!("i64.trunc_f32_s", 0xae, [F32] => [I64]),
    op!("i64.trunc_f32_u", 0xaf, [F32] => [I64]),
    op!("i64.trunc_f64_s", 0xb0, [F64] => [I64]),
    op!("i64.trunc_f64_u", 0xb1, [F64] => [I64]),
    op!("f32.convert_i32_s", 0xb2, [I32] => [F32]),
    op!("f32.convert_i32_u", 0xb3, [I32] => [F32]),
    op!("f32.convert_i64_s", 0xb4, [I64] => [F32]),
    op!("f32.convert_i64_u", 0xb5, [I64] => [F32]),
    op!("f32.demote_f64", 0xb6, [F64] => [F32]),
    op!("f64.convert_i32_s", 0xb7, [I32] => [F64]),
    op!("f64.convert_i32_u", 0xb8, [I32] => [F64]),
    op!("f64.convert_i64_s", 0xb9, [I64] => [F64]),
    op!("f64.convert_i64_u", 0xba, [I64] => [F64]),
    op!("f64.promote_f32", 0xbb, [F32] => [F64]),
    op!("i32.reinterpret_f32", 0xbc, [F32] => [I32]),
    op!("i64.reinterpret_f64", 0xbd, [F64] => [I64]),
    op!("f32.reinterpret_i32", 0xbe, [I32] => [F32]),
    op!("f64.reinterpret_i64", 0xbf, [I64] => [F64]),
    // reference instructions
    op!("ref.null", 0xd0, [] => [], Imm::HeapType),
    op!("ref.is_null", 0xd1, [] => [I32]),
    op!("ref.func", 0xd2, [] => [Funcref], Imm::FuncIndex),
];

static BY_MNEMONIC: Lazy<HashMap<&'static str, &'static OpInfo>> =
    Lazy::new(|| OPCODES.iter().map(|op| (op.mnemonic, op)).collect());

/// Looks a mnemonic up in the table.
pub fn lookup(mnemonic: &str) -> Option<&'static OpInfo> {
    BY_MNEMONIC.get(mnemonic).copied()
}
