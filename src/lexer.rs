//! SBText tokenizer.
//!
//! Scans UTF-8 source byte-by-byte, tracking 1-based line/column positions.
//! Newlines are significant (they terminate statements) and are emitted as
//! [`TokenKind::Newline`] tokens; all other whitespace is skipped.  `#`
//! starts a line comment.  Keywords are matched case-insensitively; the
//! token carries the lowercased lexeme so the parser can compare directly.

use crate::error::LexError;

// ── Tokens ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Keyword,
    Ident,
    Number,
    Str,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Op,
    Newline,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Lowercased lexeme for keywords, decoded value for strings, raw
    /// lexeme otherwise.
    pub text: String,
    pub line: u32,
    pub column: u32,
}

impl Token {
    pub fn is_keyword(&self, value: &str) -> bool {
        self.kind == TokenKind::Keyword && self.text == value
    }
}

// ── Keyword set ───────────────────────────────────────────────────────────────

/// Every reserved word of the language, sorted for binary search.  A
/// lowercased identifier matching one of these becomes a `Keyword` token.
const KEYWORDS: &[&str] = &[
    "add",
    "all",
    "and",
    "answer",
    "ask",
    "at",
    "backdrop",
    "bounce",
    "broadcast",
    "by",
    "change",
    "clicked",
    "contains",
    "costume",
    "define",
    "delete",
    "direction",
    "edge",
    "else",
    "end",
    "flag",
    "forever",
    "go",
    "hide",
    "i",
    "if",
    "in",
    "insert",
    "item",
    "key",
    "left",
    "length",
    "list",
    "mouse",
    "move",
    "next",
    "not",
    "of",
    "on",
    "or",
    "pick",
    "point",
    "pressed",
    "random",
    "receive",
    "repeat",
    "replace",
    "reset",
    "right",
    "say",
    "set",
    "show",
    "size",
    "sprite",
    "stage",
    "steps",
    "stop",
    "then",
    "think",
    "this",
    "timer",
    "to",
    "turn",
    "var",
    "wait",
    "when",
    "with",
    "x",
    "y",
];

fn is_reserved(lowered: &str) -> bool {
    KEYWORDS.binary_search(&lowered).is_ok()
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

pub struct Lexer<'src> {
    src: &'src str,
    /// Current byte position.
    pos: usize,
    line: u32,
    column: u32,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    /// Tokenize the whole source, appending a final `Eof` token.
    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        while let Some(ch) = self.peek() {
            match ch {
                // A stray BOM may appear if files are concatenated.
                '\u{feff}' => {
                    self.advance();
                }
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '\n' => {
                    tokens.push(self.token_here(TokenKind::Newline, "\n"));
                    self.advance();
                }
                '#' => self.skip_comment(),
                '"' => tokens.push(self.read_string()?),
                '0'..='9' => tokens.push(self.read_number()),
                c if c.is_alphabetic() || c == '_' => tokens.push(self.read_identifier()),
                '(' => tokens.push(self.read_symbol(TokenKind::LParen)),
                ')' => tokens.push(self.read_symbol(TokenKind::RParen)),
                '[' => tokens.push(self.read_symbol(TokenKind::LBracket)),
                ']' => tokens.push(self.read_symbol(TokenKind::RBracket)),
                ',' => tokens.push(self.read_symbol(TokenKind::Comma)),
                '+' | '-' | '*' | '/' | '%' => tokens.push(self.read_symbol(TokenKind::Op)),
                '=' | '!' | '<' | '>' => tokens.push(self.read_operator()),
                other => {
                    return Err(LexError::new(
                        format!("Unexpected character '{other}'"),
                        self.line,
                        self.column,
                    ));
                }
            }
        }
        tokens.push(Token {
            kind: TokenKind::Eof,
            text: String::new(),
            line: self.line,
            column: self.column,
        });
        Ok(tokens)
    }

    // ── scanning primitives ──────────────────────────────────────────────────

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn advance(&mut self) -> char {
        let ch = self
            .peek()
            .expect("advance is only called after a successful peek");
        self.pos += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        ch
    }

    fn token_here(&self, kind: TokenKind, text: &str) -> Token {
        Token {
            kind,
            text: text.to_string(),
            line: self.line,
            column: self.column,
        }
    }

    // ── token readers ────────────────────────────────────────────────────────

    fn read_symbol(&mut self, kind: TokenKind) -> Token {
        let (line, column) = (self.line, self.column);
        let ch = self.advance();
        Token {
            kind,
            text: ch.to_string(),
            line,
            column,
        }
    }

    /// `= ! < >`, optionally paired with a following `=` to form a
    /// two-character comparison operator.
    fn read_operator(&mut self) -> Token {
        let (line, column) = (self.line, self.column);
        let first = self.advance();
        let mut text = first.to_string();
        if self.peek() == Some('=') {
            text.push(self.advance());
        }
        Token {
            kind: TokenKind::Op,
            text,
            line,
            column,
        }
    }

    fn read_identifier(&mut self) -> Token {
        let (line, column) = (self.line, self.column);
        let start = self.pos;
        self.advance();
        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        // A single trailing `?` is part of the identifier (`pressed?`).
        if self.peek() == Some('?') {
            self.advance();
        }
        let value = &self.src[start..self.pos];
        let lowered = value.to_lowercase();
        if is_reserved(&lowered) {
            Token {
                kind: TokenKind::Keyword,
                text: lowered,
                line,
                column,
            }
        } else {
            Token {
                kind: TokenKind::Ident,
                text: value.to_string(),
                line,
                column,
            }
        }
    }

    fn read_number(&mut self) -> Token {
        let (line, column) = (self.line, self.column);
        let start = self.pos;
        self.advance();
        let mut seen_dot = false;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                self.advance();
            } else if ch == '.' && !seen_dot {
                seen_dot = true;
                self.advance();
            } else {
                break;
            }
        }
        Token {
            kind: TokenKind::Number,
            text: self.src[start..self.pos].to_string(),
            line,
            column,
        }
    }

    /// Double-quoted string with `\" \\ \n \r \t` escapes.  Any other escaped
    /// character is taken literally.  A raw newline inside the literal is an
    /// error.
    fn read_string(&mut self) -> Result<Token, LexError> {
        let (line, column) = (self.line, self.column);
        self.advance(); // opening quote
        let mut value = String::new();
        while self.peek().is_some() {
            let ch = self.advance();
            match ch {
                '"' => {
                    return Ok(Token {
                        kind: TokenKind::Str,
                        text: value,
                        line,
                        column,
                    });
                }
                '\\' => {
                    if self.peek().is_none() {
                        break;
                    }
                    let esc = self.advance();
                    value.push(match esc {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        other => other,
                    });
                }
                '\n' => {
                    return Err(LexError::new("Unterminated string literal", line, column));
                }
                other => value.push(other),
            }
        }
        Err(LexError::new("Unterminated string literal", line, column))
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        Lexer::new(src).tokenize().unwrap()
    }

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokens(src).iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_keywords_are_lowercased() {
        let toks = tokens("SET Broadcast WHEN");
        assert_eq!(toks[0].kind, TokenKind::Keyword);
        assert_eq!(toks[0].text, "set");
        assert_eq!(toks[1].text, "broadcast");
        assert_eq!(toks[2].text, "when");
    }

    #[test]
    fn test_ident_preserves_case() {
        let toks = tokens("Score");
        assert_eq!(toks[0].kind, TokenKind::Ident);
        assert_eq!(toks[0].text, "Score");
    }

    #[test]
    fn test_ident_with_question_mark_tail() {
        let toks = tokens("pressed?");
        assert_eq!(toks[0].kind, TokenKind::Ident);
        assert_eq!(toks[0].text, "pressed?");
    }

    #[test]
    fn test_number_with_fraction() {
        let toks = tokens("3.14");
        assert_eq!(toks[0].kind, TokenKind::Number);
        assert_eq!(toks[0].text, "3.14");
    }

    #[test]
    fn test_number_stops_at_second_dot() {
        let toks = tokens("1.2.3");
        assert_eq!(toks[0].text, "1.2");
    }

    #[test]
    fn test_string_escapes() {
        let toks = tokens(r#""a\"b\\c\nd""#);
        assert_eq!(toks[0].kind, TokenKind::Str);
        assert_eq!(toks[0].text, "a\"b\\c\nd");
    }

    #[test]
    fn test_unknown_escape_is_literal() {
        let toks = tokens(r#""a\qb""#);
        assert_eq!(toks[0].text, "aqb");
    }

    #[test]
    fn test_unterminated_string_errors() {
        let err = Lexer::new("\"abc").tokenize().unwrap_err();
        assert!(err.message.contains("Unterminated string"));
        assert_eq!((err.line, err.column), (1, 1));
    }

    #[test]
    fn test_newline_in_string_errors() {
        let err = Lexer::new("\"ab\ncd\"").tokenize().unwrap_err();
        assert!(err.message.contains("Unterminated string"));
    }

    #[test]
    fn test_two_char_operators() {
        let toks = tokens("== != <= >= < >");
        let ops: Vec<&str> = toks
            .iter()
            .filter(|t| t.kind == TokenKind::Op)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(ops, vec!["==", "!=", "<=", ">=", "<", ">"]);
    }

    #[test]
    fn test_symbols_and_arithmetic() {
        assert_eq!(
            kinds("( ) [ ] , + -"),
            vec![
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::LBracket,
                TokenKind::RBracket,
                TokenKind::Comma,
                TokenKind::Op,
                TokenKind::Op,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_newline_token_and_positions() {
        let toks = tokens("say\nmove");
        assert_eq!(toks[0].text, "say");
        assert_eq!((toks[0].line, toks[0].column), (1, 1));
        assert_eq!(toks[1].kind, TokenKind::Newline);
        assert_eq!(toks[2].text, "move");
        assert_eq!((toks[2].line, toks[2].column), (2, 1));
    }

    #[test]
    fn test_comment_skipped_to_newline() {
        let toks = tokens("say # a comment\nmove");
        assert_eq!(toks[0].text, "say");
        assert_eq!(toks[1].kind, TokenKind::Newline);
        assert_eq!(toks[2].text, "move");
    }

    #[test]
    fn test_bom_skipped() {
        let toks = tokens("\u{feff}stage");
        assert_eq!(toks[0].text, "stage");
    }

    #[test]
    fn test_illegal_character_position() {
        let err = Lexer::new("say @").tokenize().unwrap_err();
        assert!(err.message.contains('@'));
        assert_eq!((err.line, err.column), (1, 5));
    }

    #[test]
    fn test_keyword_table_is_sorted() {
        let mut sorted = KEYWORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, KEYWORDS, "binary search requires a sorted table");
    }

    // Concatenating every lexeme (minus newlines) reproduces the source with
    // whitespace and comments removed.
    #[test]
    fn test_lexeme_round_trip_without_whitespace() {
        let src = "set [score] to (1+2)";
        let joined: String = tokens(src)
            .iter()
            .filter(|t| !matches!(t.kind, TokenKind::Newline | TokenKind::Eof))
            .map(|t| t.text.clone())
            .collect();
        let stripped: String = src.chars().filter(|c| !c.is_whitespace()).collect();
        assert_eq!(joined, stripped);
    }
}
