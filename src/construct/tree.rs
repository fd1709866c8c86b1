use std::borrow::Cow;

use crate::common::span::{Span, Spanned};
use crate::construct::token::Token;

/// The parse tree: a rose tree where each internal node is an
/// s-expression delimited by matched parens and each leaf is a non-paren
/// token. The reader's result is a synthetic root group holding exactly
/// one child, the `(module …)` group.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseTree {
    Leaf(Spanned<Token>),
    Group(Spanned<Vec<ParseTree>>),
}

impl ParseTree {
    pub fn span(&self) -> &Span {
        match self {
            ParseTree::Leaf(token) => &token.span,
            ParseTree::Group(children) => &children.span,
        }
    }

    /// The children of a group, `None` for a leaf.
    pub fn children(&self) -> Option<&[ParseTree]> {
        match self {
            ParseTree::Leaf(_) => None,
            ParseTree::Group(children) => Some(&children.item),
        }
    }

    /// The keyword heading this group, if there is one.
    pub fn head_keyword(&self) -> Option<crate::construct::token::Keyword> {
        match self.children()?.first()? {
            ParseTree::Leaf(token) => token.item.keyword(),
            ParseTree::Group(_) => None,
        }
    }
}

/// The lexeme-only mirror of a `ParseTree`, for debugging: all position
/// metadata dropped, every leaf just its original text. Printable as a
/// tree through `ptree`, and convertible back into a compilable parse
/// tree by single-token lexing each leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringTree {
    Leaf(String),
    Group(Vec<StringTree>),
}

impl StringTree {
    /// Projects a parse tree onto its lexemes.
    pub fn from_parse_tree(tree: &ParseTree) -> StringTree {
        match tree {
            ParseTree::Leaf(token) => {
                let lexeme = if token.span.is_empty() {
                    token.item.to_string()
                } else {
                    token.span.contents()
                };
                StringTree::Leaf(lexeme)
            }
            ParseTree::Group(children) => StringTree::Group(
                children.item.iter().map(StringTree::from_parse_tree).collect(),
            ),
        }
    }

    /// Pretty-prints the tree to standard output.
    pub fn print(&self) -> std::io::Result<()> {
        ptree::print_tree(self)
    }
}

impl ptree::TreeItem for StringTree {
    type Child = Self;

    fn write_self<W: std::io::Write>(&self, f: &mut W, _: &ptree::Style) -> std::io::Result<()> {
        match self {
            StringTree::Leaf(lexeme) => write!(f, "{}", lexeme),
            StringTree::Group(_) => write!(f, "()"),
        }
    }

    fn children(&self) -> Cow<[Self::Child]> {
        match self {
            StringTree::Leaf(_) => Cow::from(vec![]),
            StringTree::Group(children) => Cow::from(children),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::source::Source;

    #[test]
    fn head_keyword() {
        let source = Source::source("(func)");
        let head = ParseTree::Leaf(Spanned::new(
            Token::reserved("func").unwrap(),
            Span::new(&source, 1, 4),
        ));
        let group = ParseTree::Group(Spanned::new(vec![head], Span::new(&source, 0, 6)));

        assert_eq!(
            group.head_keyword(),
            Some(crate::construct::token::Keyword::Func)
        );
        assert_eq!(ParseTree::Group(Spanned::new(vec![], Span::empty())).head_keyword(), None);
    }

    #[test]
    fn lexemes_survive_projection() {
        let source = Source::source("(f64.add)");
        let leaf = ParseTree::Leaf(Spanned::new(
            Token::reserved("f64.add").unwrap(),
            Span::new(&source, 1, 7),
        ));
        let tree = ParseTree::Group(Spanned::new(vec![leaf], Span::new(&source, 0, 9)));

        assert_eq!(
            StringTree::from_parse_tree(&tree),
            StringTree::Group(vec![StringTree::Leaf("f64.add".to_string())])
        );
    }
}
