//! Document building blocks: tokens, token streams and indexed fields.
//!
//! Analysis pipelines live outside this crate; callers hand the writer
//! pre-tokenized fields. A token carries the `(term, position, offset,
//! payload)` tuple an analyzer produces. The whitespace helper below exists
//! so tests and simple callers can build fields without an analyzer.

use crate::types::FieldFeatures;

/// A single token produced by an analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Term bytes.
    pub term: Vec<u8>,

    /// Position within the field. Must be non-decreasing across a field's
    /// token stream; a regression invalidates the document.
    pub position: u32,

    /// Optional (start, end) character offsets. `end < start` invalidates
    /// the document.
    pub offset: Option<(u32, u32)>,

    /// Optional opaque payload attached to this occurrence.
    pub payload: Option<Vec<u8>>,
}

impl Token {
    /// Create a bare token at the given position.
    pub fn new<T: Into<Vec<u8>>>(term: T, position: u32) -> Self {
        Token {
            term: term.into(),
            position,
            offset: None,
            payload: None,
        }
    }

    /// Attach character offsets.
    pub fn with_offset(mut self, start: u32, end: u32) -> Self {
        self.offset = Some((start, end));
        self
    }

    /// Attach a payload.
    pub fn with_payload<P: Into<Vec<u8>>>(mut self, payload: P) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// A stream of tokens for one field of one document.
pub trait TokenStream {
    /// Advance to the next token, returning `None` at end of stream.
    fn next_token(&mut self) -> Option<&Token>;
}

/// A token stream backed by a vector of tokens.
#[derive(Debug, Clone, Default)]
pub struct TokenVec {
    tokens: Vec<Token>,
    cursor: usize,
}

impl TokenVec {
    /// Create a stream over the given tokens.
    pub fn new(tokens: Vec<Token>) -> Self {
        TokenVec { tokens, cursor: 0 }
    }
}

impl TokenStream for TokenVec {
    fn next_token(&mut self) -> Option<&Token> {
        if self.cursor >= self.tokens.len() {
            return None;
        }
        let token = &self.tokens[self.cursor];
        self.cursor += 1;
        Some(token)
    }
}

/// A pre-tokenized field ready for indexing.
#[derive(Debug, Clone)]
pub struct IndexedField {
    /// Field name.
    pub name: String,

    /// Features the postings of this field carry.
    pub features: FieldFeatures,

    /// Tokens in stream order.
    pub tokens: Vec<Token>,
}

impl IndexedField {
    /// Create a field from explicit tokens.
    pub fn new<S: Into<String>>(name: S, features: FieldFeatures, tokens: Vec<Token>) -> Self {
        IndexedField {
            name: name.into(),
            features,
            tokens,
        }
    }

    /// Tokenize `text` on whitespace into a full-text field.
    ///
    /// Positions are sequential, offsets are byte offsets into `text`.
    pub fn text<S: Into<String>>(name: S, text: &str) -> Self {
        let mut tokens = Vec::new();
        let mut position = 0u32;
        let mut offset = 0usize;

        for part in text.split_whitespace() {
            // locate the part to compute its byte offset
            let start = text[offset..]
                .find(part)
                .map(|p| offset + p)
                .unwrap_or(offset);
            let end = start + part.len();

            tokens.push(
                Token::new(part.as_bytes().to_vec(), position).with_offset(start as u32, end as u32),
            );
            position += 1;
            offset = end;
        }

        IndexedField::new(name, FieldFeatures::TEXT, tokens)
    }

    /// A single-token field carrying an exact (untokenized) value.
    pub fn keyword<S: Into<String>, T: Into<Vec<u8>>>(name: S, value: T) -> Self {
        IndexedField::new(
            name,
            FieldFeatures::DOCS,
            vec![Token::new(value, 0)],
        )
    }
}
