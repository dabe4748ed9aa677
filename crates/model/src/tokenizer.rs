//! Tokenizer seam for the head node
//!
//! Only rank 0 tokenises. The core is specified against this trait; the
//! byte-level implementation below maps every byte to its own token, which
//! keeps detokenisation exact and makes multi-byte UTF-8 sequences span
//! several tokens (the streaming layer must therefore hold back incomplete
//! code points).

use crate::error::Result;

/// Token id
pub type Token = u32;

/// Head-node tokenizer interface
pub trait Tokenizer: Send + Sync {
    /// Encode text to token IDs
    fn tokenize(&self, text: &str, add_bos: bool) -> Vec<Token>;

    /// Decode token IDs back to raw bytes (may split UTF-8 code points)
    fn detokenize(&self, tokens: &[Token]) -> Vec<u8>;

    /// The raw bytes of a single token
    fn token_bytes(&self, token: Token) -> Vec<u8>;

    /// Vocabulary size
    fn vocab_size(&self) -> usize;

    /// BOS token ID
    fn bos_token(&self) -> Token;

    /// EOS token ID
    fn eos_token(&self) -> Token;

    /// Fill-in-middle prefix marker, if the vocabulary has one
    fn fim_prefix_token(&self) -> Option<Token> {
        None
    }

    /// Fill-in-middle suffix marker, if the vocabulary has one
    fn fim_suffix_token(&self) -> Option<Token> {
        None
    }

    /// Whether the token ends generation
    fn is_eog(&self, token: Token) -> bool {
        token == self.eos_token()
    }
}

/// Byte-level tokenizer: token `0..=255` is the byte itself, specials above
pub struct ByteTokenizer {
    vocab_size: usize,
}

/// BOS token id in the byte vocabulary
pub const BYTE_BOS: Token = 256;
/// EOS token id in the byte vocabulary
pub const BYTE_EOS: Token = 257;
/// Fill-in-middle prefix marker
pub const BYTE_FIM_PRE: Token = 258;
/// Fill-in-middle suffix marker
pub const BYTE_FIM_SUF: Token = 259;

/// Smallest vocabulary that fits the byte tokenizer
pub const BYTE_VOCAB_MIN: usize = 260;

impl ByteTokenizer {
    /// Create a byte tokenizer over a vocabulary of at least
    /// [`BYTE_VOCAB_MIN`] entries
    pub fn new(vocab_size: usize) -> Result<Self> {
        if vocab_size < BYTE_VOCAB_MIN {
            return Err(crate::error::ModelError::Config(format!(
                "vocab_size {} too small for byte tokenizer (need {})",
                vocab_size, BYTE_VOCAB_MIN
            )));
        }
        Ok(Self { vocab_size })
    }
}

impl Tokenizer for ByteTokenizer {
    fn tokenize(&self, text: &str, add_bos: bool) -> Vec<Token> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BYTE_BOS);
        }
        tokens.extend(text.bytes().map(|b| b as Token));
        tokens
    }

    fn detokenize(&self, tokens: &[Token]) -> Vec<u8> {
        tokens
            .iter()
            .filter(|&&t| t < 256)
            .map(|&t| t as u8)
            .collect()
    }

    fn token_bytes(&self, token: Token) -> Vec<u8> {
        if token < 256 {
            vec![token as u8]
        } else {
            Vec::new()
        }
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn bos_token(&self) -> Token {
        BYTE_BOS
    }

    fn eos_token(&self) -> Token {
        BYTE_EOS
    }

    fn fim_prefix_token(&self) -> Option<Token> {
        Some(BYTE_FIM_PRE)
    }

    fn fim_suffix_token(&self) -> Option<Token> {
        Some(BYTE_FIM_SUF)
    }
}
