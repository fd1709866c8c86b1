use crate::common::span::{Span, Spanned};
use crate::compiler::lex::Tokens;
use crate::compiler::syntax::Syntax;
use crate::construct::token::Token;
use crate::construct::tree::ParseTree;

/// The reader groups a flat token stream into the parse tree: a single
/// left-to-right scan where an opening paren pushes a new group, a
/// closing paren pops one, and any other token becomes a leaf of the
/// group being built. The result is a synthetic root holding exactly
/// one child, the top-level `(module …)` form.
pub struct Reader {
    tokens: Tokens,
    index: usize,
    // spans of the unclosed opening parens
    opening: Vec<Span>,
    // children collected per open group; the bottom entry is the root
    stack: Vec<Vec<ParseTree>>,
}

impl Reader {
    pub fn read(tokens: Tokens) -> Result<ParseTree, Syntax> {
        let mut reader = Reader {
            tokens,
            index: 0,
            opening: vec![],
            stack: vec![vec![]],
        };

        while let Some(token) = reader.next_token() {
            match token.item {
                Token::Open => {
                    reader.opening.push(token.span);
                    reader.stack.push(vec![]);
                }
                Token::Close => reader.exit_group(token.span)?,
                _ => reader
                    .stack
                    .last_mut()
                    .unwrap()
                    .push(ParseTree::Leaf(token)),
            }
        }

        if let Some(still_open) = reader.opening.last() {
            return Err(Syntax::parse("Unclosed opening paren", still_open));
        }

        let children = reader.stack.pop().unwrap();
        Reader::root(children)
    }

    fn next_token(&mut self) -> Option<Spanned<Token>> {
        if self.index < self.tokens.len() {
            let token = self.tokens[self.index].clone();
            self.index += 1;
            Some(token)
        } else {
            None
        }
    }

    /// Closes the innermost group and appends it to its parent.
    fn exit_group(&mut self, closing: Span) -> Result<(), Syntax> {
        let opening = self
            .opening
            .pop()
            .ok_or_else(|| Syntax::parse("Unexpected closing paren", &closing))?;

        let children = self.stack.pop().unwrap();
        let span = Span::combine(&opening, &closing);
        self.stack
            .last_mut()
            .unwrap()
            .push(ParseTree::Group(Spanned::new(children, span)));
        Ok(())
    }

    /// Checks the collected top level: exactly one parenthesized form.
    fn root(children: Vec<ParseTree>) -> Result<ParseTree, Syntax> {
        match children.first() {
            None => {
                return Err(Syntax::parse(
                    "Expected a top-level `(module …)` form",
                    &Span::empty(),
                ))
            }
            Some(ParseTree::Leaf(token)) => {
                return Err(Syntax::parse(
                    "Expected a parenthesized form at top level",
                    &token.span,
                ))
            }
            Some(ParseTree::Group(_)) => {}
        }

        if children.len() > 1 {
            return Err(Syntax::parse(
                "Unexpected extra tokens after the top-level form",
                children[1].span(),
            ));
        }

        let span = children[0].span().clone();
        Ok(ParseTree::Group(Spanned::new(children, span)))
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;
    use crate::common::opcode;
    use crate::common::source::Source;
    use crate::compiler::lex::Lexer;

    fn read_source(source: &str) -> Result<ParseTree, Syntax> {
        Reader::read(Lexer::lex(Source::source(source))?)
    }

    #[test]
    fn reads_a_module() {
        let tree = read_source("(module (func nop))").unwrap();

        let module = &tree.children().unwrap()[0];
        assert_eq!(module.children().unwrap().len(), 2);
        let func = &module.children().unwrap()[1];
        assert_eq!(func.children().unwrap().len(), 2);
    }

    #[test]
    fn root_holds_exactly_one_child() {
        let tree = read_source("(module)").unwrap();
        assert_eq!(tree.children().unwrap().len(), 1);
    }

    #[test]
    fn no_leaf_is_a_paren() {
        fn check(tree: &ParseTree) {
            match tree {
                ParseTree::Leaf(token) => {
                    assert!(!matches!(token.item, Token::Open | Token::Close))
                }
                ParseTree::Group(children) => children.item.iter().for_each(check),
            }
        }
        check(&read_source("(module (func (result i32) i32.const 3))").unwrap());
    }

    #[test]
    fn unclosed_opening_paren() {
        assert!(read_source("(module").is_err());
        assert!(read_source("(").is_err());
    }

    #[test]
    fn unexpected_closing_paren() {
        assert!(read_source(")").is_err());
        assert!(read_source("(module))").is_err());
    }

    #[test]
    fn missing_top_level_form() {
        assert!(read_source("").is_err());
        assert!(read_source("nop").is_err());
    }

    #[test]
    fn extra_tokens_after_the_form() {
        assert!(read_source("(module) (module)").is_err());
        assert!(read_source("(module) nop").is_err());
    }

    /// Checks if there are a matching number of opening and closing
    /// parens, never dipping negative.
    fn check_if_balanced(tokens: &[Token]) -> bool {
        let mut depth = 0i64;
        for token in tokens {
            match token {
                Token::Open => depth += 1,
                Token::Close => depth -= 1,
                _ => continue,
            }
            if depth < 0 {
                return false;
            }
        }
        depth == 0
    }

    fn arbitrary_token() -> impl Strategy<Value = Token> {
        prop_oneof![
            Just(Token::Open),
            Just(Token::Close),
            Just(Token::Op(opcode::lookup("nop").unwrap())),
            Just(Token::Integer(2)),
        ]
    }

    proptest! {
        #[test]
        fn check_balance(tokens in proptest::collection::vec(arbitrary_token(), 0..24)) {
            let balanced = check_if_balanced(&tokens);
            let spanned = tokens
                .iter()
                .map(|token| Spanned::new(token.clone(), Span::empty()))
                .collect();
            let result = Reader::read(spanned);

            // a balanced soup can still be rejected at the top level
            // (leaves outside any group, or several groups); an
            // unbalanced one must always be
            if !balanced {
                prop_assert!(result.is_err());
            } else if result.is_ok() {
                prop_assert!(check_if_balanced(&tokens));
            }
        }
    }
}
