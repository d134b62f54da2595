//! Comment- and string-aware tokenizer. Tokens carry byte offsets into the
//! original text and the parenthesis depth they occur at, so callers can
//! reason about top-level clause structure and splice text back in.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Unquoted word, stored lowercased.
    Word,
    /// Double-quoted identifier, stored without the quotes (case preserved
    /// in `text` lowering left to callers that fold identifiers).
    QuotedWord,
    Number,
    /// Single-quoted string literal (contents dropped; only position kept).
    StringLit,
    Symbol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizeError {
    pub message: String,
}

impl std::fmt::Display for TokenizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TokenizeError {}

fn err(message: &str) -> TokenizeError {
    TokenizeError {
        message: message.to_string(),
    }
}

pub fn tokenize(input: &str) -> Result<Vec<Token>, TokenizeError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut depth: u32 = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        // Line comment.
        if b == b'-' && bytes.get(i + 1) == Some(&b'-') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        // Block comment (non-nesting).
        if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            let mut j = i + 2;
            loop {
                if j + 1 >= bytes.len() {
                    return Err(err("unterminated block comment"));
                }
                if bytes[j] == b'*' && bytes[j + 1] == b'/' {
                    break;
                }
                j += 1;
            }
            i = j + 2;
            continue;
        }

        // String literal; '' is an escaped quote.
        if b == b'\'' {
            let start = i;
            let mut j = i + 1;
            loop {
                if j >= bytes.len() {
                    return Err(err("unterminated string literal"));
                }
                if bytes[j] == b'\'' {
                    if bytes.get(j + 1) == Some(&b'\'') {
                        j += 2;
                        continue;
                    }
                    break;
                }
                j += 1;
            }
            tokens.push(Token {
                kind: TokenKind::StringLit,
                text: String::new(),
                start,
                end: j + 1,
                depth,
            });
            i = j + 1;
            continue;
        }

        // Quoted identifier; "" is an escaped quote.
        if b == b'"' {
            let start = i;
            let mut j = i + 1;
            let mut inner = String::new();
            loop {
                if j >= bytes.len() {
                    return Err(err("unterminated quoted identifier"));
                }
                if bytes[j] == b'"' {
                    if bytes.get(j + 1) == Some(&b'"') {
                        inner.push('"');
                        j += 2;
                        continue;
                    }
                    break;
                }
                inner.push(bytes[j] as char);
                j += 1;
            }
            tokens.push(Token {
                kind: TokenKind::QuotedWord,
                text: inner,
                start,
                end: j + 1,
                depth,
            });
            i = j + 1;
            continue;
        }

        if b.is_ascii_alphabetic() || b == b'_' {
            let start = i;
            let mut j = i;
            while j < bytes.len()
                && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_' || bytes[j] == b'$')
            {
                j += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Word,
                text: input[start..j].to_ascii_lowercase(),
                start,
                end: j,
                depth,
            });
            i = j;
            continue;
        }

        if b.is_ascii_digit() {
            let start = i;
            let mut j = i;
            while j < bytes.len()
                && (bytes[j].is_ascii_digit() || bytes[j] == b'.' || bytes[j] == b'e')
            {
                j += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Number,
                text: input[start..j].to_string(),
                start,
                end: j,
                depth,
            });
            i = j;
            continue;
        }

        if b == b'(' {
            tokens.push(Token {
                kind: TokenKind::Symbol,
                text: "(".to_string(),
                start: i,
                end: i + 1,
                depth,
            });
            depth += 1;
            i += 1;
            continue;
        }

        if b == b')' {
            depth = depth.saturating_sub(1);
            tokens.push(Token {
                kind: TokenKind::Symbol,
                text: ")".to_string(),
                start: i,
                end: i + 1,
                depth,
            });
            i += 1;
            continue;
        }

        tokens.push(Token {
            kind: TokenKind::Symbol,
            text: (b as char).to_string(),
            start: i,
            end: i + 1,
            depth,
        });
        i += 1;
    }

    Ok(tokens)
}
