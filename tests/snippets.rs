//! Snippet tests for the compiler pipeline as a whole: small WAT
//! modules in, lowered IR or binary modules out.

use warbler::common::opcode;
use warbler::compiler;
use warbler::construct::ir::{ExternKind, Item, Reference, TokenExpression};
use warbler::construct::token::Keyword;
use warbler::{ErrorKind, ModuleExpression, Source, Token};

fn lower(source: &str) -> ModuleExpression {
    compiler::lower(Source::source(source)).unwrap()
}

fn flat_body(module: &ModuleExpression, index: usize) -> Vec<Token> {
    module.functions[index].body.flatten()
}

fn op(mnemonic: &str) -> Token {
    Token::Op(opcode::lookup(mnemonic).unwrap())
}

#[test]
fn an_empty_function() {
    let module = lower("(module (func nop))");

    assert_eq!(module.global_types.len(), 1);
    assert!(module.global_types[0].params.is_empty());
    assert!(module.global_types[0].results.is_empty());
    assert_eq!(module.functions.len(), 1);
    assert_eq!(module.functions[0].type_index, 0);
    assert!(module.exports.is_empty());
    assert_eq!(flat_body(&module, 0), vec![op("nop")]);

    warbler::compile("(module (func nop))").unwrap();
}

#[test]
fn constants_compare_and_typecheck() {
    let source = "(module (func (result i32) i32.const 0 i32.const 0 i32.eq))";
    let module = lower(source);

    assert_eq!(module.global_types.len(), 1);
    assert_eq!(
        flat_body(&module, 0),
        vec![
            op("i32.const"),
            Token::Integer(0),
            op("i32.const"),
            Token::Integer(0),
            op("i32.eq"),
        ]
    );

    warbler::compile(source).unwrap();
}

#[test]
fn folded_parameters_unfold_to_indices() {
    let source = "(module (func (param $a f64) (param $b f64) (result f64) \
                  (f64.add (local.get $a) (local.get $b))))";
    let module = lower(source);

    assert_eq!(module.global_types.len(), 1);
    assert_eq!(module.global_types[0].params.len(), 2);
    assert_eq!(module.global_types[0].results.len(), 1);
    assert_eq!(
        flat_body(&module, 0),
        vec![
            op("local.get"),
            Token::Integer(0),
            op("local.get"),
            Token::Integer(1),
            op("f64.add"),
        ]
    );

    warbler::compile(source).unwrap();
}

#[test]
fn inline_export_shorthand() {
    let module = lower("(module (func (export \"fn\") (param) (result)))");

    assert_eq!(module.functions.len(), 1);
    assert_eq!(module.global_types.len(), 1);
    assert_eq!(module.exports.len(), 1);
    assert_eq!(module.exports[0].name, b"fn".to_vec());
    assert_eq!(module.exports[0].kind, ExternKind::Func);
    assert_eq!(module.exports[0].reference, Reference::Index(0));
}

#[test]
fn exports_resolve_symbolic_names() {
    let module = lower("(module (func $a) (func $b) (export \"x\" (func $b)))");
    assert_eq!(module.exports[0].reference, Reference::Index(1));
}

#[test]
fn labeled_blocks() {
    let module = lower("(module (func (block $L nop)))");

    let items = match &module.functions[0].body {
        TokenExpression::Unfolded(unfolded) => &unfolded.items,
        other => panic!("expected an unfolded body, got {:?}", other),
    };
    assert_eq!(items.len(), 1);
    match &items[0] {
        Item::Block(block) => {
            assert_eq!(block.label.as_deref(), Some("L"));
            assert!(block.signature.params.is_empty());
            assert!(block.signature.results.is_empty());
        }
        other => panic!("expected a block, got {:?}", other),
    }

    assert_eq!(
        flat_body(&module, 0),
        vec![
            Token::Keyword(Keyword::Block),
            op("nop"),
            Token::Keyword(Keyword::End),
        ]
    );

    warbler::compile("(module (func (block $L nop)))").unwrap();
}

// ----- round trips -----

#[test]
fn folded_and_unfolded_bodies_emit_identical_bytes() {
    let folded = warbler::compile(
        "(module (func (param f64 f64) (result f64) \
         (f64.add (local.get 0) (local.get 1))))",
    )
    .unwrap();
    let unfolded = warbler::compile(
        "(module (func (param f64 f64) (result f64) \
         local.get 0 local.get 1 f64.add))",
    )
    .unwrap();

    assert_eq!(folded, unfolded);
}

#[test]
fn folded_and_stack_blocks_emit_identical_bytes() {
    let folded = warbler::compile(
        "(module (func (result i32) (block $exit (result i32) i32.const 1)))",
    )
    .unwrap();
    let stacked = warbler::compile(
        "(module (func (result i32) block $exit (result i32) i32.const 1 end))",
    )
    .unwrap();

    assert_eq!(folded, stacked);
}

#[test]
fn folded_and_stack_ifs_emit_identical_bytes() {
    let folded = warbler::compile(
        "(module (func (result i32) \
         (if (result i32) (i32.const 1) (then i32.const 2) (else i32.const 3))))",
    )
    .unwrap();
    let stacked = warbler::compile(
        "(module (func (result i32) \
         i32.const 1 if (result i32) i32.const 2 else i32.const 3 end))",
    )
    .unwrap();

    assert_eq!(folded, stacked);
}

// ----- the other entry points -----

#[test]
fn compiling_a_parse_tree_matches_compiling_text() {
    let source = "(module (func (export \"run\") (result i32) i32.const 12))";

    let tree = warbler::parse(source).unwrap();
    assert_eq!(
        warbler::compile_parse_tree(tree).unwrap(),
        warbler::compile(source).unwrap(),
    );
}

#[test]
fn compiling_a_string_tree_matches_compiling_text() {
    let source = "(module (func (export \"run\") (result f64) \
                  (f64.add (f64.const 1.5) (f64.const 2.5))))";

    let strings = warbler::string_parse_tree(source).unwrap();
    assert_eq!(
        warbler::compile_string_tree(&strings).unwrap(),
        warbler::compile(source).unwrap(),
    );
}

#[test]
fn string_trees_keep_their_lexemes() {
    use warbler::StringTree;

    let strings = warbler::string_parse_tree("(module (func nop))").unwrap();
    let module = match &strings {
        StringTree::Group(children) => &children[0],
        other => panic!("expected a group, got {:?}", other),
    };
    match module {
        StringTree::Group(children) => {
            assert_eq!(children[0], StringTree::Leaf("module".to_string()));
        }
        other => panic!("expected a group, got {:?}", other),
    }
}

// ----- failure modes -----

#[test]
fn unbalanced_parens() {
    let error = warbler::compile("(module (func nop)").unwrap_err();
    assert_eq!(error.kind, ErrorKind::Parse);
}

#[test]
fn unknown_local_name() {
    let error = warbler::compile("(module (func local.get $missing))").unwrap_err();
    assert_eq!(error.kind, ErrorKind::Name);
    assert!(error.reason.contains("$missing"));
}

#[test]
fn operand_stack_mismatch() {
    let error =
        warbler::compile("(module (func (result i32) i32.const 0 i64.eq))").unwrap_err();

    assert_eq!(error.kind, ErrorKind::Type);
    assert!(error.reason.contains("[i64, i64]"), "reason: {}", error.reason);
    assert!(error.reason.contains("[i32]"), "reason: {}", error.reason);
}

#[test]
fn duplicate_signatures_share_a_type_entry() {
    let module = lower(
        "(module (func $a (param i32) (result i32) local.get 0) \
         (func $b (param i32) (result i32) local.get 0))",
    );

    assert_eq!(module.global_types.len(), 1);

    // and the emitted type section holds exactly one entry
    let bytes = warbler::compile(
        "(module (func $a (param i32) (result i32) local.get 0) \
         (func $b (param i32) (result i32) local.get 0))",
    )
    .unwrap();
    let type_section = [0x01, 0x06, 0x01, 0x60, 0x01, 0x7f, 0x01, 0x7f];
    assert!(bytes
        .windows(type_section.len())
        .any(|window| window == type_section));
}

#[test]
fn errors_render_with_a_source_excerpt() {
    let error = warbler::compile("(module (func local.get $missing))").unwrap_err();
    let rendered = format!("{}", error);

    assert!(rendered.contains("Name Error"), "rendered: {}", rendered);
    assert!(rendered.contains("$missing"), "rendered: {}", rendered);
    assert!(rendered.contains("1 |"), "rendered: {}", rendered);
}
