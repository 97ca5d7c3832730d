//! # Lexer
//!
//! An ordered, first-match prefix tokenizer.
//!
//! The lexer is configured with a list of [`TokenDef`]s, each pairing a
//! caller-supplied kind tag with a regular expression anchored at the cursor.
//! At every position it tries the definitions **in declaration order** and
//! accepts the first whose pattern matches; the cursor advances past the
//! matched text. Declaration order is therefore part of the language
//! definition: an earlier type shadows a later one wherever both match.
//!
//! Matching is first-match, not longest-match, and nothing is skipped
//! implicitly. Whitespace and comments are ordinary token types; the grammar
//! decides whether to consume or ignore them. Concatenating the matched text
//! of all tokens, in order, reconstructs the input exactly.
//!
//! A position where no definition matches is a fatal
//! [`AbcError::Lexical`] with no resynchronization.

use crate::error::AbcError;
use regex::Regex;

/// A token type: a kind tag plus the anchored prefix pattern that matches it.
///
/// Kinds are supplied by the caller (the grammar defines an enum), so two
/// definitions are distinct even if their patterns coincide.
pub struct TokenDef<K> {
    kind: K,
    pattern: Regex,
}

impl<K: Copy> TokenDef<K> {
    /// Compiles a definition from a pattern fragment. The fragment is
    /// anchored at the cursor; it must not carry its own `^`.
    ///
    /// Panics if the pattern does not compile, which is a defect in the
    /// grammar table, not in the input.
    pub fn new(kind: K, pattern: &str) -> Self {
        let anchored = format!("^(?:{pattern})");
        let pattern = Regex::new(&anchored).expect("token pattern must compile");
        Self { kind, pattern }
    }
}

/// A lexical item: the kind that matched and the exact text it covered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<K> {
    pub kind: K,
    pub text: String,
}

/// Splits input text into tokens according to an ordered list of
/// definitions.
pub struct Lexer<K> {
    defs: Vec<TokenDef<K>>,
}

impl<K: Copy> Lexer<K> {
    pub fn new(defs: Vec<TokenDef<K>>) -> Self {
        Self { defs }
    }

    /// Tokenizes `input` completely, covering it with no gaps or overlaps.
    pub fn lex(&self, input: &str) -> Result<Vec<Token<K>>, AbcError> {
        let mut tokens = Vec::new();
        let mut rest = input;

        while !rest.is_empty() {
            let matched = self.defs.iter().find_map(|def| {
                def.pattern
                    .find(rest)
                    // A zero-length match cannot advance the cursor.
                    .filter(|m| m.end() > 0)
                    .map(|m| (def.kind, m.end()))
            });

            match matched {
                Some((kind, end)) => {
                    tokens.push(Token {
                        kind,
                        text: rest[..end].to_string(),
                    });
                    rest = &rest[end..];
                }
                None => {
                    return Err(AbcError::Lexical {
                        rest: rest.chars().take(24).collect(),
                    });
                }
            }
        }

        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Kind {
        Word,
        Digits,
        Space,
        Bang,
    }

    fn lexer() -> Lexer<Kind> {
        Lexer::new(vec![
            TokenDef::new(Kind::Word, "[a-z]+"),
            TokenDef::new(Kind::Digits, r"\d+"),
            TokenDef::new(Kind::Space, r"\s+"),
            TokenDef::new(Kind::Bang, "!"),
        ])
    }

    #[test]
    fn test_covers_input_exactly() {
        let input = "abc 123  def!";
        let tokens = lexer().lex(input).unwrap();
        let rebuilt: String = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(rebuilt, input);
    }

    #[test]
    fn test_kinds_and_text() {
        let tokens = lexer().lex("ab 12!").unwrap();
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![Kind::Word, Kind::Space, Kind::Digits, Kind::Bang]
        );
        assert_eq!(tokens[0].text, "ab");
        assert_eq!(tokens[2].text, "12");
    }

    #[test]
    fn test_declaration_order_wins() {
        // Both patterns match "aa"; the earlier declaration must win.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        enum Order {
            First,
            Second,
        }
        let lexer = Lexer::new(vec![
            TokenDef::new(Order::First, "a"),
            TokenDef::new(Order::Second, "aa"),
        ]);
        let tokens = lexer.lex("aa").unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(tokens.iter().all(|t| t.kind == Order::First));

        // Reversing the declarations reverses the outcome.
        let lexer = Lexer::new(vec![
            TokenDef::new(Order::Second, "aa"),
            TokenDef::new(Order::First, "a"),
        ]);
        let tokens = lexer.lex("aa").unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, Order::Second);
    }

    #[test]
    fn test_whitespace_is_not_skipped() {
        let tokens = lexer().lex("  ab").unwrap();
        assert_eq!(tokens[0].kind, Kind::Space);
        assert_eq!(tokens[0].text, "  ");
    }

    #[test]
    fn test_no_match_is_fatal() {
        let result = lexer().lex("ab @rest");
        match result {
            Err(AbcError::Lexical { rest }) => assert!(rest.starts_with('@')),
            other => panic!("expected a lexical error, got {other:?}"),
        }
    }

    #[test]
    fn test_anchoring_ignores_later_matches() {
        // "!" occurs later in the input, but at the cursor only Word matches.
        let tokens = lexer().lex("ab!cd").unwrap();
        assert_eq!(tokens[0].kind, Kind::Word);
        assert_eq!(tokens[1].kind, Kind::Bang);
        assert_eq!(tokens[2].kind, Kind::Word);
    }
}
