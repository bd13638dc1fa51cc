//! Deterministic byte-level tokenizer for unit tests.

use crate::error::{Result, TemplateError};
use crate::{SpecialToken, Tokenizer};

const SPECIAL_TOKENS: &[(&str, u32)] = &[
    ("<s>", 1000),
    ("</s>", 1001),
    ("<pad>", 1002),
    ("<|im_start|>", 1003),
    ("<|im_end|>", 1004),
    ("<|endoftext|>", 1005),
    ("<IMG_CONTEXT>", 1006),
    ("<eos>", 1007),
];

/// Special tokens are matched atomically (longest first); every other byte
/// is its own id.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockTokenizer;

impl MockTokenizer {
    pub(crate) fn new() -> Self {
        Self
    }

    fn special_at(bytes: &[u8]) -> Option<(&'static str, u32)> {
        SPECIAL_TOKENS
            .iter()
            .filter(|(token, _)| bytes.starts_with(token.as_bytes()))
            .max_by_key(|(token, _)| token.len())
            .copied()
    }
}

impl Tokenizer for MockTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let bytes = text.as_bytes();
        let mut ids = Vec::with_capacity(bytes.len() + 1);
        if add_special_tokens {
            ids.push(1000);
        }
        let mut i = 0;
        while i < bytes.len() {
            match Self::special_at(&bytes[i..]) {
                Some((token, id)) => {
                    ids.push(id);
                    i += token.len();
                }
                None => {
                    ids.push(u32::from(bytes[i]));
                    i += 1;
                }
            }
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Ok(byte) = u8::try_from(id) {
                bytes.push(byte);
                continue;
            }
            let (token, _) = SPECIAL_TOKENS
                .iter()
                .find(|(_, special)| *special == id)
                .ok_or_else(|| TemplateError::Tokenizer(format!("unknown id {id}")))?;
            bytes.extend_from_slice(token.as_bytes());
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        SPECIAL_TOKENS
            .iter()
            .find(|(special, _)| *special == token)
            .map(|(_, id)| *id)
    }

    fn special_token_id(&self, token: SpecialToken) -> Option<u32> {
        match token {
            SpecialToken::Bos => Some(1000),
            SpecialToken::Eos => Some(1001),
            SpecialToken::Pad => Some(1002),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specials_are_atomic() {
        let tokenizer = MockTokenizer::new();
        let ids = tokenizer.encode("a<|im_end|>b", false).unwrap();
        assert_eq!(ids, vec![97, 1004, 98]);
        assert_eq!(tokenizer.decode(&ids).unwrap(), "a<|im_end|>b");
        assert_eq!(tokenizer.encode("", true).unwrap(), vec![1000]);
    }
}
