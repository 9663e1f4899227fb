//! Content tokenizer.
//!
//! Thing content is plain text with inline link markers: `#` starts a link,
//! and the link identifier runs for as long as characters are lowercase
//! letters or digits. The first other character ends the link and becomes
//! the first character of the next text span.
//!
//! ```
//! use diaform_migrate::content::{tokenize, Token};
//!
//! assert_eq!(
//!     tokenize("a#link1 more#link2"),
//!     vec![
//!         Token::Text("a".into()),
//!         Token::Link("link1".into()),
//!         Token::Text(" more".into()),
//!         Token::Link("link2".into()),
//!     ]
//! );
//! ```
//!
//! Every `#` yields exactly one link token, including a bare `#` that
//! captures nothing (`Token::Link("")`). Empty text spans are never emitted.

use serde::{Deserialize, Serialize};
use std::str::Chars;

/// One segment of tokenized content.
///
/// Serializes as `{"text": "..."}` or `{"link": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Token {
    /// Plain text span.
    Text(String),
    /// Reference to another thing by name.
    Link(String),
}

/// Which kind of segment the buffer is accumulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    ReadingLink,
}

/// Tokenizer state: the current mode and the characters collected so far.
#[derive(Debug, Clone, PartialEq, Eq)]
struct State {
    mode: Mode,
    buffer: String,
}

impl State {
    fn text(buffer: String) -> Self {
        Self {
            mode: Mode::Text,
            buffer,
        }
    }

    fn link() -> Self {
        Self {
            mode: Mode::ReadingLink,
            buffer: String::new(),
        }
    }

    /// Closes the current segment. Text commits only when non-empty; a link
    /// always commits, even with an empty identifier.
    fn commit(self) -> Option<Token> {
        match self.mode {
            Mode::Text if self.buffer.is_empty() => None,
            Mode::Text => Some(Token::Text(self.buffer)),
            Mode::ReadingLink => Some(Token::Link(self.buffer)),
        }
    }

    /// Advances by one character, returning the next state and any token
    /// completed by this character.
    fn step(mut self, ch: char) -> (Self, Option<Token>) {
        if ch == '#' {
            return (Self::link(), self.commit());
        }
        match self.mode {
            Mode::ReadingLink if is_link_char(ch) => {
                self.buffer.push(ch);
                (self, None)
            }
            Mode::ReadingLink => (Self::text(ch.to_string()), self.commit()),
            Mode::Text => {
                self.buffer.push(ch);
                (self, None)
            }
        }
    }
}

/// Whether `ch` continues a link identifier.
///
/// Lowercase letters and decimal digits only; uppercase letters end the
/// link, as do numeric characters that are not digits (`½`, `Ⅻ`).
pub fn is_link_char(ch: char) -> bool {
    (ch.is_alphanumeric() && ch.is_lowercase()) || ch.is_ascii_digit()
}

/// Lazy token iterator over a content string.
///
/// Restart by calling [`Tokens::new`] again on the same input.
#[derive(Debug, Clone)]
pub struct Tokens<'a> {
    chars: Chars<'a>,
    state: Option<State>,
}

impl<'a> Tokens<'a> {
    /// Starts tokenizing `content`.
    pub fn new(content: &'a str) -> Self {
        Self {
            chars: content.chars(),
            state: Some(State::text(String::new())),
        }
    }
}

impl Iterator for Tokens<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        loop {
            let state = self.state.take()?;
            match self.chars.next() {
                Some(ch) => {
                    let (next, token) = state.step(ch);
                    self.state = Some(next);
                    if token.is_some() {
                        return token;
                    }
                }
                // End of input: final commit, then the iterator is exhausted.
                None => return state.commit(),
            }
        }
    }
}

/// Tokenizes `content` into a flat list of text and link segments.
pub fn tokenize(content: &str) -> Vec<Token> {
    Tokens::new(content).collect()
}

/// Tokenizes `content` into the JSON array stored in `things.json_content`.
pub fn to_json(content: &str) -> serde_json::Value {
    serde_json::Value::Array(
        Tokens::new(content)
            .map(|token| match token {
                Token::Text(text) => serde_json::json!({ "text": text }),
                Token::Link(link) => serde_json::json!({ "link": link }),
            })
            .collect(),
    )
}

/// Rebuilds raw content from tokens, reinserting `#` before each link.
pub fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    for token in tokens {
        match token {
            Token::Text(text) => out.push_str(text),
            Token::Link(link) => {
                out.push('#');
                out.push_str(link);
            }
        }
    }
    out
}
