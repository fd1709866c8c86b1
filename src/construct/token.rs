use std::collections::HashMap;
use std::fmt::Display;

use once_cell::sync::Lazy;

use crate::common::opcode::{self, OpInfo, ValType};

/// The structural keywords of the text format, a closed enumeration.
/// Anything else word-shaped is a value type, an opcode mnemonic,
/// or a numeric literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Keyword {
    Module,
    Func,
    Param,
    Result,
    Local,
    Export,
    Import,
    Type,
    Block,
    Loop,
    If,
    Then,
    Else,
    End,
    Table,
    Memory,
    Global,
    Data,
    Elem,
    Start,
    Mut,
    Offset,
    Extern,
}

pub static KEYWORDS: Lazy<HashMap<&'static str, Keyword>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("module", Keyword::Module);
    m.insert("func", Keyword::Func);
    m.insert("param", Keyword::Param);
    m.insert("result", Keyword::Result);
    m.insert("local", Keyword::Local);
    m.insert("export", Keyword::Export);
    m.insert("import", Keyword::Import);
    m.insert("type", Keyword::Type);
    m.insert("block", Keyword::Block);
    m.insert("loop", Keyword::Loop);
    m.insert("if", Keyword::If);
    m.insert("then", Keyword::Then);
    m.insert("else", Keyword::Else);
    m.insert("end", Keyword::End);
    m.insert("table", Keyword::Table);
    m.insert("memory", Keyword::Memory);
    m.insert("global", Keyword::Global);
    m.insert("data", Keyword::Data);
    m.insert("elem", Keyword::Elem);
    m.insert("start", Keyword::Start);
    m.insert("mut", Keyword::Mut);
    m.insert("offset", Keyword::Offset);
    m.insert("extern", Keyword::Extern);
    m
});

impl Keyword {
    pub fn name(self) -> &'static str {
        match self {
            Keyword::Module => "module",
            Keyword::Func => "func",
            Keyword::Param => "param",
            Keyword::Result => "result",
            Keyword::Local => "local",
            Keyword::Export => "export",
            Keyword::Import => "import",
            Keyword::Type => "type",
            Keyword::Block => "block",
            Keyword::Loop => "loop",
            Keyword::If => "if",
            Keyword::Then => "then",
            Keyword::Else => "else",
            Keyword::End => "end",
            Keyword::Table => "table",
            Keyword::Memory => "memory",
            Keyword::Global => "global",
            Keyword::Data => "data",
            Keyword::Elem => "elem",
            Keyword::Start => "start",
            Keyword::Mut => "mut",
            Keyword::Offset => "offset",
            Keyword::Extern => "extern",
        }
    }
}

/// These are the different tokens the lexer will output.
/// Tokens with data contain that data: a numeric literal carries its
/// value, an opcode carries its table entry, and so on.
/// Tokens are positioned using `Spanned<Token>`.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // grouping
    Open,
    Close,

    // leafs
    Keyword(Keyword),
    Op(&'static OpInfo),
    ValType(ValType),
    Integer(i64),
    Float(f64),
    Str(Vec<u8>),
    Name(String),
}

static VALTYPES: Lazy<HashMap<&'static str, ValType>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("i32", ValType::I32);
    m.insert("i64", ValType::I64);
    m.insert("f32", ValType::F32);
    m.insert("f64", ValType::F64);
    m.insert("funcref", ValType::Funcref);
    m.insert("externref", ValType::Externref);
    m
});

impl Token {
    /// Classifies a reserved-word run: keyword first, then value type,
    /// then opcode mnemonic. `None` means the run must be numeric to lex.
    pub fn reserved(word: &str) -> Option<Token> {
        if let Some(keyword) = KEYWORDS.get(word) {
            return Some(Token::Keyword(*keyword));
        }
        if let Some(valtype) = VALTYPES.get(word) {
            return Some(Token::ValType(*valtype));
        }
        opcode::lookup(word).map(Token::Op)
    }

    pub fn keyword(&self) -> Option<Keyword> {
        match self {
            Token::Keyword(keyword) => Some(*keyword),
            _ => None,
        }
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Open => write!(f, "("),
            Token::Close => write!(f, ")"),
            Token::Keyword(keyword) => write!(f, "{}", keyword.name()),
            Token::Op(op) => write!(f, "{}", op.mnemonic),
            Token::ValType(valtype) => write!(f, "{}", valtype),
            Token::Integer(n) => write!(f, "{}", n),
            Token::Float(x) => write!(f, "{}", x),
            Token::Str(bytes) => {
                write!(f, "\"")?;
                for byte in bytes {
                    match byte {
                        b'"' => write!(f, "\\\"")?,
                        b'\\' => write!(f, "\\\\")?,
                        b'\n' => write!(f, "\\n")?,
                        b'\t' => write!(f, "\\t")?,
                        b if b.is_ascii_graphic() || *b == b' ' => {
                            write!(f, "{}", *b as char)?
                        }
                        b => write!(f, "\\{:02x}", b)?,
                    }
                }
                write!(f, "\"")
            }
            Token::Name(name) => write!(f, "${}", name),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keywords_before_opcodes() {
        assert_eq!(Token::reserved("func"), Some(Token::Keyword(Keyword::Func)));
        assert_eq!(Token::reserved("i32"), Some(Token::ValType(ValType::I32)));
        assert_eq!(
            Token::reserved("i32.add"),
            Some(Token::Op(opcode::lookup("i32.add").unwrap()))
        );
        assert_eq!(Token::reserved("2"), None);
        assert_eq!(Token::reserved("i32.frobnicate"), None);
    }

    #[test]
    fn string_display_escapes() {
        let token = Token::Str(vec![b'h', b'i', b'\n', 0x01]);
        assert_eq!(format!("{}", token), "\"hi\\n\\01\"");
    }
}
