//! The lexer: turns source text into a queue of `Token`s.
//!
//! `Lexer` eagerly tokenizes its whole input in `new` rather than streaming
//! lazily; scripts are small enough in practice that this trades a little
//! memory for a much simpler `peek`/`dequeue` API, and it's what lets
//! `last_token`/`trim_comment` (needed for REPL partial-input detection)
//! work without re-tokenizing.

use crate::token::{Token, TokenType, KEYWORDS};

pub struct Lexer {
    tokens: Vec<Token>,
    pos: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        let tokens = tokenize(source);
        Lexer { tokens, pos: 0 }
    }

    pub fn peek(&self) -> Token {
        self.tokens.get(self.pos).cloned().unwrap_or_else(eof_token)
    }

    pub fn peek_ahead(&self, n: usize) -> Token {
        self.tokens.get(self.pos + n).cloned().unwrap_or_else(eof_token)
    }

    pub fn dequeue(&mut self) -> Token {
        let t = self.peek();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    pub fn line_num(&self) -> usize {
        self.peek().line
    }

    pub fn is_at_whitespace(&self) -> bool {
        self.peek().after_space
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// The last non-comment token type in `src`, used by the REPL to decide
    /// whether a partial line of input is syntactically complete.
    pub fn last_token(src: &str) -> Option<Token> {
        let trimmed = Self::trim_comment(src);
        tokenize(&trimmed).into_iter().filter(|t| t.kind != TokenType::Eof).last()
    }

    /// Strip a trailing `//` comment (outside of a string literal).
    pub fn trim_comment(src: &str) -> String {
        let mut in_string = false;
        let mut chars = src.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => in_string = !in_string,
                '/' if !in_string => {
                    if let Some((_, '/')) = chars.peek() {
                        return src[..i].to_string();
                    }
                }
                _ => {}
            }
        }
        src.to_string()
    }
}

fn eof_token() -> Token {
    Token::new(TokenType::Eof, "", false, 0)
}

fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    let mut line = 0usize;
    let mut after_space = false;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' => {
                after_space = true;
                i += 1;
            }
            '\n' => {
                tokens.push(Token::new(TokenType::Eol, "\n", after_space, line));
                line += 1;
                i += 1;
                after_space = false;
            }
            ';' => {
                tokens.push(Token::new(TokenType::Eol, ";", after_space, line));
                i += 1;
                after_space = false;
            }
            '/' if i + 1 < chars.len() && chars[i + 1] == '/' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '"' => {
                let start = i;
                i += 1;
                let mut s = String::new();
                loop {
                    if i >= chars.len() {
                        tokens.push(Token::new(TokenType::Unknown, source_slice(&chars, start, i), after_space, line));
                        break;
                    }
                    if chars[i] == '"' {
                        // `""` inside a string is an escaped quote.
                        if i + 1 < chars.len() && chars[i + 1] == '"' {
                            s.push('"');
                            i += 2;
                            continue;
                        }
                        i += 1;
                        tokens.push(Token::new(TokenType::String, s, after_space, line));
                        break;
                    }
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                after_space = false;
            }
            c if c.is_ascii_digit() || (c == '.' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit()) => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    i += 1;
                    if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                        i += 1;
                    }
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text = source_slice(&chars, start, i);
                tokens.push(Token::new(TokenType::Number, text, after_space, line));
                after_space = false;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let text = source_slice(&chars, start, i);
                let kind = if KEYWORDS.contains(&text.as_str()) {
                    TokenType::Keyword
                } else {
                    TokenType::Identifier
                };
                tokens.push(Token::new(kind, text, after_space, line));
                after_space = false;
            }
            _ => {
                let (kind, len) = match_symbol(&chars, i);
                let text = source_slice(&chars, i, i + len);
                tokens.push(Token::new(kind, text, after_space, line));
                i += len;
                after_space = false;
            }
        }
    }
    tokens.push(Token::new(TokenType::Eof, "", after_space, line));
    tokens
}

fn source_slice(chars: &[char], start: usize, end: usize) -> String {
    chars[start..end].iter().collect()
}

fn match_symbol(chars: &[char], i: usize) -> (TokenType, usize) {
    let c = chars[i];
    let next = chars.get(i + 1).copied();
    match (c, next) {
        ('=', Some('=')) => (TokenType::OpEqual, 2),
        ('!', Some('=')) => (TokenType::OpNotEqual, 2),
        ('>', Some('=')) => (TokenType::OpGreatEqual, 2),
        ('<', Some('=')) => (TokenType::OpLessEqual, 2),
        ('=', _) => (TokenType::OpAssign, 1),
        ('>', _) => (TokenType::OpGreater, 1),
        ('<', _) => (TokenType::OpLesser, 1),
        ('+', _) => (TokenType::OpPlus, 1),
        ('-', _) => (TokenType::OpMinus, 1),
        ('*', _) => (TokenType::OpTimes, 1),
        ('/', _) => (TokenType::OpDivide, 1),
        ('%', _) => (TokenType::OpMod, 1),
        ('^', _) => (TokenType::OpPower, 1),
        (',', _) => (TokenType::Comma, 1),
        (':', _) => (TokenType::Colon, 1),
        ('.', _) => (TokenType::Dot, 1),
        ('(', _) => (TokenType::LParen, 1),
        (')', _) => (TokenType::RParen, 1),
        ('[', _) => (TokenType::LSquare, 1),
        (']', _) => (TokenType::RSquare, 1),
        ('{', _) => (TokenType::LCurly, 1),
        ('}', _) => (TokenType::RCurly, 1),
        ('@', _) => (TokenType::AddressOf, 1),
        _ => (TokenType::Unknown, 1),
    }
}
