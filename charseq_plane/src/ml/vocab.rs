use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::ml::{linear::Linear, LayerValues};

/// Sorted, de-duplicated character set. A character's index is its position in the sorted list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<char>", into = "Vec<char>")]
pub struct CharVocab {
    chars: Vec<char>,
    index: HashMap<char, usize>,
}

impl CharVocab {
    pub fn from_chars<I: IntoIterator<Item = char>>(chars: I) -> Self {
        let chars = chars.into_iter().sorted().dedup().collect_vec();
        let index = chars.iter().enumerate().map(|(i, c)| (*c, i)).collect();
        Self { chars, index }
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn contains(&self, c: char) -> bool {
        self.index.contains_key(&c)
    }

    pub fn chars(&self) -> &[char] {
        &self.chars
    }

    pub fn token_encode(&self, c: char) -> Result<usize> {
        self.index.get(&c).copied().with_context(|| {
            format!("failed to resolve vocab from dict: unknown character token {c:?}")
        })
    }

    pub fn token_decode(&self, encoded: usize) -> Option<char> {
        self.chars.get(encoded).copied()
    }

    pub fn one_hot(&self, idx: usize) -> LayerValues {
        LayerValues::one_hot(self.len(), idx)
    }

    /// Encodes `text` as a `seq_len x len()` one-hot matrix.
    ///
    /// Rows past the end of the text hold the one-hot of `pad`, or stay zero
    /// when `pad` is not part of this vocabulary.
    pub fn encode_one_hot(&self, text: &str, seq_len: usize, pad: char) -> Result<Linear> {
        let tokens: Vec<usize> = text
            .chars()
            .map(|c| self.token_encode(c))
            .collect::<Result<_>>()?;

        if tokens.len() > seq_len {
            return Err(anyhow!(
                "sequence of {} characters exceeds the maximum length of {seq_len}",
                tokens.len()
            ));
        }

        let pad_idx = self.index.get(&pad).copied();
        let mut encoded = Linear::new(seq_len, self.len());
        for (t, row) in encoded.rows_iter_mut().enumerate() {
            if let Some(idx) = tokens.get(t).copied().or(pad_idx) {
                row[idx] = 1.0;
            }
        }

        Ok(encoded)
    }
}

impl From<Vec<char>> for CharVocab {
    fn from(value: Vec<char>) -> Self {
        Self::from_chars(value)
    }
}

impl From<CharVocab> for Vec<char> {
    fn from(value: CharVocab) -> Self {
        value.chars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocab_is_sorted_and_deduplicated() {
        let vocab = CharVocab::from_chars("hello world".chars());

        assert_eq!(&[' ', 'd', 'e', 'h', 'l', 'o', 'r', 'w'], vocab.chars());
        assert_eq!(8, vocab.len());
        assert_eq!(0, vocab.token_encode(' ').unwrap());
        assert_eq!(Some('w'), vocab.token_decode(7));
        assert_eq!(None, vocab.token_decode(8));
    }

    #[test]
    fn vocab_encoding_is_invertible() {
        let vocab = CharVocab::from_chars("Va !\t\nçé".chars());
        for (i, c) in vocab.chars().iter().enumerate() {
            assert_eq!(i, vocab.token_encode(*c).unwrap());
            assert_eq!(Some(*c), vocab.token_decode(i));
        }
    }

    #[test]
    fn vocab_rejects_unknown_characters() {
        let vocab = CharVocab::from_chars("abc".chars());
        let err = vocab.token_encode('z').unwrap_err();
        assert!(err.to_string().contains("'z'"));
        assert!(vocab.encode_one_hot("abz", 4, 'a').is_err());
    }

    #[test]
    fn can_encode_padded_one_hot_sequence() {
        let vocab = CharVocab::from_chars("ab ".chars());
        let encoded = vocab.encode_one_hot("ba", 4, ' ').unwrap();

        let expected: Linear = "0 0 1\n0 1 0\n1 0 0\n1 0 0".parse().unwrap();
        assert_eq!(expected, encoded);
    }

    #[test]
    fn unknown_pad_leaves_zero_rows() {
        let vocab = CharVocab::from_chars("ab".chars());
        let encoded = vocab.encode_one_hot("a", 3, ' ').unwrap();

        let expected: Linear = "1 0\n0 0\n0 0".parse().unwrap();
        assert_eq!(expected, encoded);
    }

    #[test]
    fn rejects_over_long_sequence() {
        let vocab = CharVocab::from_chars("ab".chars());
        assert!(vocab.encode_one_hot("abab", 3, 'a').is_err());
    }

    #[test]
    fn vocab_serializes_as_char_list() {
        let vocab = CharVocab::from_chars("cab".chars());
        let json = serde_json::to_string(&vocab).unwrap();
        assert_eq!("[\"a\",\"b\",\"c\"]", json);

        let restored: CharVocab = serde_json::from_str(&json).unwrap();
        assert_eq!(vocab, restored);
        assert_eq!(2, restored.token_encode('c').unwrap());
    }
}
