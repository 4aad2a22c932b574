//! Incremental splitting of interactive input into SQL statements.
//!
//! Statements end at a `;` outside string literals, quoted identifiers,
//! dollar-quoted bodies and comments, so function definitions such as
//! `AS $$ BEGIN RETURN 'x'; END; $$` arrive at the backend in one piece.

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Normal,
    SingleQuote,
    EscapeQuote,
    DoubleQuote,
    LineComment,
    BlockComment(usize),
    Dollar(String),
}

#[derive(Debug)]
pub struct StatementSplitter {
    buf: String,
    pos: usize,
    state: State,
}

impl Default for StatementSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatementSplitter {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            pos: 0,
            state: State::Normal,
        }
    }

    /// Feeds more input and returns every statement completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();
        while let Some(end) = self.scan() {
            let stmt: String = self.buf.drain(..end).collect();
            self.pos = 0;
            if !is_blank(&stmt) {
                out.push(stmt.trim().to_owned());
            }
        }
        out
    }

    /// Returns the unterminated remainder, if it holds anything but whitespace.
    pub fn finish(self) -> Option<String> {
        let rest = self.buf.trim();
        (!rest.is_empty()).then(|| rest.to_owned())
    }

    /// True when buffered input is waiting for a terminator.
    pub fn is_pending(&self) -> bool {
        !self.buf.trim().is_empty()
    }

    /// Advances over the buffer; `Some(end)` is the byte just past a terminating `;`.
    fn scan(&mut self) -> Option<usize> {
        let bytes = self.buf.as_bytes();
        let len = bytes.len();
        let mut i = self.pos;

        while i < len {
            let b = bytes[i];
            match &self.state {
                State::Normal => match b {
                    b';' => {
                        self.pos = i + 1;
                        return Some(i + 1);
                    }
                    b'\'' => {
                        let escaped = i > 0
                            && matches!(bytes[i - 1], b'E' | b'e')
                            && (i < 2 || !is_ident(bytes[i - 2]));
                        self.state = if escaped {
                            State::EscapeQuote
                        } else {
                            State::SingleQuote
                        };
                    }
                    b'"' => self.state = State::DoubleQuote,
                    b'-' | b'/' => {
                        if i + 1 >= len {
                            break;
                        }
                        match (b, bytes[i + 1]) {
                            (b'-', b'-') => {
                                self.state = State::LineComment;
                                i += 1;
                            }
                            (b'/', b'*') => {
                                self.state = State::BlockComment(1);
                                i += 1;
                            }
                            _ => {}
                        }
                    }
                    b'$' if i == 0 || !is_ident(bytes[i - 1]) => match dollar_tag(&bytes[i..]) {
                        Tag::Incomplete => break,
                        Tag::NotATag => {}
                        Tag::Tag(n) => {
                            self.state = State::Dollar(self.buf[i..i + n].to_owned());
                            i += n - 1;
                        }
                    },
                    _ => {}
                },
                State::SingleQuote => {
                    if b == b'\'' {
                        self.state = State::Normal;
                    }
                }
                State::EscapeQuote => match b {
                    b'\\' => {
                        if i + 1 >= len {
                            break;
                        }
                        i += 1;
                    }
                    b'\'' => self.state = State::Normal,
                    _ => {}
                },
                State::DoubleQuote => {
                    if b == b'"' {
                        self.state = State::Normal;
                    }
                }
                State::LineComment => {
                    if b == b'\n' {
                        self.state = State::Normal;
                    }
                }
                State::BlockComment(depth) => {
                    let depth = *depth;
                    if i + 1 >= len {
                        break;
                    }
                    match (b, bytes[i + 1]) {
                        (b'*', b'/') => {
                            self.state = if depth == 1 {
                                State::Normal
                            } else {
                                State::BlockComment(depth - 1)
                            };
                            i += 1;
                        }
                        (b'/', b'*') => {
                            self.state = State::BlockComment(depth + 1);
                            i += 1;
                        }
                        _ => {}
                    }
                }
                State::Dollar(tag) => {
                    if bytes[i..].starts_with(tag.as_bytes()) {
                        i += tag.len() - 1;
                        self.state = State::Normal;
                    } else if b == b'$' && tag.as_bytes().starts_with(&bytes[i..]) {
                        // The closing tag may continue in the next chunk.
                        break;
                    }
                }
            }
            i += 1;
        }

        self.pos = i;
        None
    }
}

enum Tag {
    Tag(usize),
    NotATag,
    Incomplete,
}

/// Recognises `$$` or `$name$` at the start of `bytes`.
fn dollar_tag(bytes: &[u8]) -> Tag {
    let mut j = 1;
    while j < bytes.len() && is_ident(bytes[j]) {
        j += 1;
    }
    if j == bytes.len() {
        return Tag::Incomplete;
    }
    if bytes[j] != b'$' || (j > 1 && bytes[1].is_ascii_digit()) {
        return Tag::NotATag;
    }
    Tag::Tag(j + 1)
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

fn is_blank(stmt: &str) -> bool {
    stmt.trim_end_matches(';').trim().is_empty()
}
