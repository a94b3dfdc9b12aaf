use tokenizers::Tokenizer; // From the 'tokenizers' crate
use std::path::Path;

/// End-of-sequence spellings used by the model families we load.
const KNOWN_EOS_TOKENS: [&str; 5] = ["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>", "<|end_of_text|>"];

#[derive(Debug)]
pub enum TokenizerError {
    Load(String),
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenizerError::Load(s) => write!(f, "Tokenizer load error: {}", s),
            TokenizerError::Encode(s) => write!(f, "Encoding failed: {}", s),
            TokenizerError::Decode(s) => write!(f, "Decoding failed: {}", s),
        }
    }
}

impl std::error::Error for TokenizerError {}

#[derive(Debug, Clone)]
pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
}

impl TokenizerWrapper {
    pub fn new(tokenizer_path: &Path) -> Result<Self, TokenizerError> {
        let tokenizer_instance = Tokenizer::from_file(tokenizer_path).map_err(|e| {
            TokenizerError::Load(format!("Failed to load tokenizer from {:?}: {}", tokenizer_path, e))
        })?;
        Ok(Self { tokenizer: tokenizer_instance })
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, TokenizerError> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| TokenizerError::Encode(format!("text of {} bytes: {}", text.len(), e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, TokenizerError> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| TokenizerError::Decode(format!("{} ids: {}", ids.len(), e)))
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    pub fn get_vocab_size(&self) -> u32 {
        self.tokenizer.get_vocab_size(true) as u32
    }

    /// Ids of any well-known end-of-sequence tokens present in the vocabulary.
    pub fn eos_token_ids(&self) -> Vec<u32> {
        KNOWN_EOS_TOKENS
            .iter()
            .filter_map(|token| self.token_to_id(token))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture_tokenizer_path() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/tokenizer.json")
    }

    #[test]
    fn test_tokenizer_new_load_fails_for_nonexistent_file() {
        let result = TokenizerWrapper::new(Path::new("non_existent_tokenizer.json"));
        match result {
            Err(TokenizerError::Load(msg)) => assert!(msg.contains("Failed to load tokenizer")),
            other => panic!("expected load error, got {:?}", other),
        }
    }

    #[test]
    fn test_tokenizer_encode_decode() {
        let wrapper = TokenizerWrapper::new(&fixture_tokenizer_path())
            .expect("Failed to load fixture tokenizer for encode/decode test.");

        let ids = wrapper.encode("say hi RESPONSE", true).unwrap();
        assert_eq!(ids, vec![7, 8, 4]);
        assert_eq!(wrapper.decode(&ids, true).unwrap(), "say hi RESPONSE");
    }

    #[test]
    fn test_decode_skips_special_tokens() {
        let wrapper = TokenizerWrapper::new(&fixture_tokenizer_path()).unwrap();
        assert_eq!(wrapper.decode(&[5, 6, 1], true).unwrap(), "hello world");
        assert_eq!(wrapper.decode(&[5, 6, 1], false).unwrap(), "hello world </s>");
    }

    #[test]
    fn test_eos_token_discovery() {
        let wrapper = TokenizerWrapper::new(&fixture_tokenizer_path()).unwrap();
        assert_eq!(wrapper.eos_token_ids(), vec![1]);
        assert_eq!(wrapper.get_vocab_size(), 12);
    }
}
