//! Token/character offset bookkeeping for question/context pairs
//!
//! Answers live in character space (offsets into the context), the model
//! works in token space. This module keeps the mapping between the two for
//! an encoded pair.
//!
//! Offsets are byte offsets into the segment they belong to: question tokens
//! point into the question, context tokens into the context. Special tokens
//! carry `(0, 0)` and no sequence id. SQuAD answer positions count
//! characters, so lookups in character space take the context text along.

use serde::{Deserialize, Serialize};

/// Encoded question/context pair with per-token offsets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingWithOffsets {
    /// Token IDs
    pub ids: Vec<u32>,
    /// Token type (segment) IDs
    pub type_ids: Vec<u32>,
    /// Token strings
    pub tokens: Vec<String>,
    /// Byte offset for each token: (start, end)
    pub offsets: Vec<(usize, usize)>,
    /// 0 = question, 1 = context, None = special token
    pub sequence_ids: Vec<Option<usize>>,
}

impl EncodingWithOffsets {
    /// Create a new encoding with offsets
    pub fn new(
        ids: Vec<u32>,
        type_ids: Vec<u32>,
        tokens: Vec<String>,
        offsets: Vec<(usize, usize)>,
        sequence_ids: Vec<Option<usize>>,
    ) -> Self {
        Self {
            ids,
            type_ids,
            tokens,
            offsets,
            sequence_ids,
        }
    }

    /// Whether the token at `idx` belongs to the context
    pub fn is_context(&self, idx: usize) -> bool {
        self.sequence_ids.get(idx).copied().flatten() == Some(1)
    }

    /// Whether the token at `idx` is a special token (CLS, SEP, ...)
    pub fn is_special(&self, idx: usize) -> bool {
        self.sequence_ids.get(idx).is_some_and(Option::is_none)
    }

    /// First and last context token indices (inclusive)
    pub fn context_range(&self) -> Option<(usize, usize)> {
        let first = (0..self.len()).find(|&i| self.is_context(i))?;
        let last = (0..self.len()).rev().find(|&i| self.is_context(i))?;
        Some((first, last))
    }

    /// Find the context token that contains the given character position
    pub fn char_to_token(&self, context: &str, char_pos: usize) -> Option<usize> {
        let byte_pos = char_to_byte(context, char_pos)?;
        self.offsets
            .iter()
            .enumerate()
            .position(|(idx, (start, end))| {
                self.is_context(idx) && byte_pos >= *start && byte_pos < *end
            })
    }

    /// Byte range in the context covered by the token span `start..=end`
    ///
    /// Returns None unless both ends are context tokens.
    pub fn token_span_to_byte_range(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        if start > end || !self.is_context(start) || !self.is_context(end) {
            return None;
        }
        let (byte_start, _) = self.offsets[start];
        let (_, byte_end) = self.offsets[end];
        Some((byte_start, byte_end))
    }

    /// Character range in the context covered by the token span `start..=end`
    pub fn token_span_to_char_range(
        &self,
        context: &str,
        start: usize,
        end: usize,
    ) -> Option<(usize, usize)> {
        let (byte_start, byte_end) = self.token_span_to_byte_range(start, end)?;
        Some((
            byte_to_char(context, byte_start)?,
            byte_to_char(context, byte_end)?,
        ))
    }

    /// Get the number of tokens
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Byte offset of the `char_pos`-th character (the end of `text` is allowed)
pub fn char_to_byte(text: &str, char_pos: usize) -> Option<usize> {
    text.char_indices()
        .map(|(b, _)| b)
        .chain(std::iter::once(text.len()))
        .nth(char_pos)
}

/// Number of characters before byte `byte_pos`; None off a char boundary
pub fn byte_to_char(text: &str, byte_pos: usize) -> Option<usize> {
    text.get(..byte_pos).map(|prefix| prefix.chars().count())
}
