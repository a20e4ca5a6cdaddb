//! Tokenizers
//!
//! Generation only needs encode/decode and the BOS/EOS ids, so it works
//! against the `TextTokenizer` trait. `Tokenizer` wraps a HuggingFace
//! `tokenizer.json` for real checkpoints; `ByteTokenizer` maps UTF-8 bytes
//! directly for synthetic models.

use std::path::Path;

use tokenizers::Tokenizer as HFTokenizer;

use crate::error::{ModelError, Result};

/// Text <-> token id conversion
pub trait TextTokenizer: Send + Sync {
    /// Encode text, optionally framed by BOS/EOS
    fn encode(&self, text: &str, bos: bool, eos: bool) -> Result<Vec<u32>>;

    /// Decode ids, skipping special tokens
    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn bos_id(&self) -> u32;

    fn eos_id(&self) -> u32;

    fn vocab_size(&self) -> usize;
}

/// Wrapper around a HuggingFace Llama tokenizer
pub struct Tokenizer {
    inner: HFTokenizer,
    bos_id: u32,
    eos_id: u32,
}

impl Tokenizer {
    /// Load from a tokenizer.json file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let inner = HFTokenizer::from_file(path)
            .map_err(|e| ModelError::Tokenizer(format!("{}: {e}", path.display())))?;
        let special = |token: &str| {
            inner
                .token_to_id(token)
                .ok_or_else(|| ModelError::Tokenizer(format!("missing special token {token}")))
        };
        let bos_id = special("<s>")?;
        let eos_id = special("</s>")?;

        tracing::info!(
            "Loaded tokenizer from {} (vocab {}, bos {}, eos {})",
            path.display(),
            inner.get_vocab_size(true),
            bos_id,
            eos_id
        );
        Ok(Self { inner, bos_id, eos_id })
    }

    /// Load from a directory containing tokenizer.json
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::from_file(dir.as_ref().join("tokenizer.json"))
    }

    /// Get token for an ID
    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }
}

impl TextTokenizer for Tokenizer {
    fn encode(&self, text: &str, bos: bool, eos: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| ModelError::Tokenizer(format!("encoding failed: {e}")))?;

        let mut ids = Vec::with_capacity(encoding.len() + 2);
        if bos {
            ids.push(self.bos_id);
        }
        ids.extend_from_slice(encoding.get_ids());
        if eos {
            ids.push(self.eos_id);
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| ModelError::Tokenizer(format!("decoding failed: {e}")))
    }

    fn bos_id(&self) -> u32 {
        self.bos_id
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

/// Byte-level tokenizer: ids 0-3 are pad/bos/eos/unk, byte `b` is `b + 4`
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const PAD: u32 = 0;
    pub const BOS: u32 = 1;
    pub const EOS: u32 = 2;
    const OFFSET: u32 = 4;
}

impl TextTokenizer for ByteTokenizer {
    fn encode(&self, text: &str, bos: bool, eos: bool) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(text.len() + 2);
        if bos {
            ids.push(Self::BOS);
        }
        ids.extend(text.bytes().map(|b| b as u32 + Self::OFFSET));
        if eos {
            ids.push(Self::EOS);
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id >= Self::OFFSET)
            .map(|&id| (id - Self::OFFSET).min(255) as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn bos_id(&self) -> u32 {
        Self::BOS
    }

    fn eos_id(&self) -> u32 {
        Self::EOS
    }

    fn vocab_size(&self) -> usize {
        256 + Self::OFFSET as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_tokenizer_framing() {
        let tok = ByteTokenizer;
        let ids = tok.encode("hi", true, true).unwrap();
        assert_eq!(ids, vec![1, b'h' as u32 + 4, b'i' as u32 + 4, 2]);
        assert_eq!(tok.decode(&ids).unwrap(), "hi");
        assert_eq!(tok.vocab_size(), 260);
    }

    #[test]
    fn test_byte_tokenizer_utf8() {
        let tok = ByteTokenizer;
        let ids = tok.encode("héllo", false, false).unwrap();
        assert_eq!(ids.len(), 6);
        assert_eq!(tok.decode(&ids).unwrap(), "héllo");
    }

    // Requires a real tokenizer.json
    #[test]
    #[ignore]
    fn test_llama_tokenizer() {
        let tokenizer = Tokenizer::from_directory("../../llama-2-7b-chat").unwrap();
        assert_eq!(tokenizer.vocab_size(), 32000);
        assert_eq!(tokenizer.bos_id(), 1);
        assert_eq!(tokenizer.eos_id(), 2);
    }
}
