// src/evaluate.rs

use log::debug;

use crate::generation::{self, GenerationConfig, GenerationError};
use crate::model::{CausalLm, ModelError};
use crate::template::{Prompter, TemplateError};
use crate::tokenizer::{TokenizerError, TokenizerWrapper};

#[derive(Debug)]
pub enum EvaluateError {
    Template(TemplateError),
    Tokenizer(TokenizerError),
    Generation(GenerationError),
    Model(ModelError),
}

impl std::fmt::Display for EvaluateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluateError::Template(e) => write!(f, "Prompt template error: {}", e),
            EvaluateError::Tokenizer(e) => write!(f, "Tokenizer error: {}", e),
            EvaluateError::Generation(e) => write!(f, "Generation error: {}", e),
            EvaluateError::Model(e) => write!(f, "Model error: {}", e),
        }
    }
}

impl std::error::Error for EvaluateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EvaluateError::Template(ref e) => Some(e),
            EvaluateError::Tokenizer(ref e) => Some(e),
            EvaluateError::Generation(ref e) => Some(e),
            EvaluateError::Model(ref e) => Some(e),
        }
    }
}

impl From<TemplateError> for EvaluateError {
    fn from(err: TemplateError) -> EvaluateError {
        EvaluateError::Template(err)
    }
}

impl From<TokenizerError> for EvaluateError {
    fn from(err: TokenizerError) -> EvaluateError {
        EvaluateError::Tokenizer(err)
    }
}

impl From<GenerationError> for EvaluateError {
    fn from(err: GenerationError) -> EvaluateError {
        EvaluateError::Generation(err)
    }
}

impl From<ModelError> for EvaluateError {
    fn from(err: ModelError) -> EvaluateError {
        EvaluateError::Model(err)
    }
}

/// Everything needed to answer one instruction: the loaded model, its
/// tokenizer, the prompt template and the decoding settings.
pub struct Evaluator {
    model: Box<dyn CausalLm>,
    tokenizer: TokenizerWrapper,
    prompter: Prompter,
    generation: GenerationConfig,
    eos_token_ids: Vec<u32>,
}

impl Evaluator {
    /// `config_eos` comes from the model's `config.json`; tokens the tokenizer
    /// knows as end-of-sequence are added to it.
    pub fn new(
        model: Box<dyn CausalLm>,
        tokenizer: TokenizerWrapper,
        prompter: Prompter,
        generation: GenerationConfig,
        config_eos: Vec<u32>,
    ) -> Self {
        let mut eos_token_ids = config_eos;
        for id in tokenizer.eos_token_ids() {
            if !eos_token_ids.contains(&id) {
                eos_token_ids.push(id);
            }
        }
        debug!("End-of-sequence token ids: {:?}", eos_token_ids);
        Self { model, tokenizer, prompter, generation, eos_token_ids }
    }

    pub fn generation(&self) -> &GenerationConfig {
        &self.generation
    }

    pub fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }

    /// Generates the response to `instruction` (and `input`, when non-empty).
    pub fn evaluate(&mut self, instruction: &str, input: Option<&str>) -> Result<String, EvaluateError> {
        let prompt = self.prompter.generate_prompt(instruction, input, None)?;
        let prompt_ids = self.tokenizer.encode(&prompt, true)?;

        self.model.reset()?;
        let generated = generation::generate(
            self.model.as_mut(),
            &prompt_ids,
            &self.eos_token_ids,
            &self.generation,
        )?;
        debug!("Generated {} tokens for a {}-token prompt", generated.len(), prompt_ids.len());

        let mut sequence = prompt_ids;
        sequence.extend_from_slice(&generated);
        let output = self.tokenizer.decode(&sequence, true)?;
        Ok(self.prompter.get_response(&output)?)
    }
}
