// src/runner.rs

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::error::Error;
use std::path::{Path, PathBuf};

use crate::config::{ConfigError, ModelConfig};
use crate::dataset::{self, DatasetError, OutputFile, RunParameters};
use crate::evaluate::{EvaluateError, Evaluator};
use crate::generation::{GenerationConfig, GenerationError};
use crate::model::{self, ModelError, ModelFiles};
use crate::system_resources::{bytes_to_gb, SystemResources};
use crate::template::{Prompter, TemplateError};
use crate::tokenizer::{TokenizerError, TokenizerWrapper};
use crate::weights::{WeightsError, WeightsSummary};

pub const DEFAULT_BASE_MODEL: &str = "aurora-m/Aurora-40k-hf";

/// Answer every instruction in one or more JSON input files with a causal
/// language model and write the responses next to the run parameters.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Local model directory or Hugging Face hub repository id
    #[clap(long, alias = "base_model", default_value = DEFAULT_BASE_MODEL)]
    pub base_model: String,
    /// Hub revision (branch, tag or commit)
    #[clap(long, default_value = "main")]
    pub revision: String,
    /// Hub access token for gated or private repositories
    #[clap(long, alias = "auth_token", env = "HF_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    #[clap(long, alias = "max_new_tokens", value_parser, default_value_t = 256)]
    pub max_new_tokens: usize,
    #[clap(long, alias = "num_beams", value_parser, default_value_t = 4)]
    pub num_beams: usize,
    #[clap(long, alias = "top_k", value_parser, default_value_t = 40)]
    pub top_k: usize,
    #[clap(long, alias = "top_p", value_parser, default_value_t = 0.75)]
    pub top_p: f64,
    #[clap(long, value_parser, default_value_t = 0.1)]
    pub temperature: f64,
    /// Sample instead of decoding deterministically (only with --num-beams 1)
    #[clap(long, alias = "do_sample")]
    pub do_sample: bool,
    #[clap(long, value_parser, default_value_t = 299_792_458)]
    pub seed: u64,
    #[clap(long, alias = "repeat_penalty", value_parser, default_value_t = 1.0)]
    pub repeat_penalty: f32,
    #[clap(long, alias = "repeat_last_n", value_parser, default_value_t = 64)]
    pub repeat_last_n: usize,
    /// Exponent applied to the sequence length when ranking beams
    #[clap(long, alias = "length_penalty", value_parser, default_value_t = 1.0)]
    pub length_penalty: f32,

    /// Prompt template JSON; an empty value selects the built-in Alpaca template
    #[clap(long, alias = "prompt_template_path", default_value = "configs/alpaca.json")]
    pub prompt_template_path: String,
    /// One or more JSON files holding `instructions` and optional `inputs`
    #[clap(long, alias = "input_path", num_args = 1.., default_value = "data/test_input.json")]
    pub input_path: Vec<PathBuf>,
    /// Results go to <output-path>/<base-model>/<input file name>
    #[clap(long, alias = "output_path", default_value = "output")]
    pub output_path: PathBuf,

    /// Run on the CPU even when an accelerator is available
    #[clap(long)]
    pub cpu: bool,
    #[clap(long, value_parser = ["f32", "f16", "bf16"])]
    pub dtype: Option<String>,
    /// Log every formatted prompt
    #[clap(long, short)]
    pub verbose: bool,
}

impl CliArgs {
    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: self.max_new_tokens,
            num_beams: self.num_beams,
            top_k: self.top_k,
            top_p: self.top_p,
            temperature: self.temperature,
            do_sample: self.do_sample,
            seed: self.seed,
            repeat_penalty: self.repeat_penalty,
            repeat_last_n: self.repeat_last_n,
            length_penalty: self.length_penalty,
        }
    }
}

// Custom error wrapper to combine the per-module error types
#[derive(Debug)]
pub enum RunError {
    Template(TemplateError),
    Dataset(DatasetError),
    Config(ConfigError),
    Weights(WeightsError),
    Model(ModelError),
    Tokenizer(TokenizerError),
    Generation(GenerationError),
    Task { file: PathBuf, index: usize, source: EvaluateError },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Template(e) => write!(f, "{}", e),
            RunError::Dataset(e) => write!(f, "{}", e),
            RunError::Config(e) => write!(f, "Model config error: {}", e),
            RunError::Weights(e) => write!(f, "Weights error: {}", e),
            RunError::Model(e) => write!(f, "Model error: {}", e),
            RunError::Tokenizer(e) => write!(f, "Tokenizer error: {}", e),
            RunError::Generation(e) => write!(f, "{}", e),
            RunError::Task { file, index, .. } => {
                write!(f, "Failed on instruction {} of {}", index, file.display())
            }
        }
    }
}

impl Error for RunError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RunError::Template(e) => e.source(),
            RunError::Dataset(e) => e.source(),
            RunError::Config(e) => Some(e),
            RunError::Weights(e) => Some(e),
            RunError::Model(e) => Some(e),
            RunError::Tokenizer(e) => Some(e),
            RunError::Generation(e) => e.source(),
            RunError::Task { source, .. } => Some(source),
        }
    }
}

impl From<TemplateError> for RunError {
    fn from(err: TemplateError) -> Self {
        RunError::Template(err)
    }
}

impl From<DatasetError> for RunError {
    fn from(err: DatasetError) -> Self {
        RunError::Dataset(err)
    }
}

impl From<ConfigError> for RunError {
    fn from(err: ConfigError) -> Self {
        RunError::Config(err)
    }
}

impl From<WeightsError> for RunError {
    fn from(err: WeightsError) -> Self {
        RunError::Weights(err)
    }
}

impl From<ModelError> for RunError {
    fn from(err: ModelError) -> Self {
        RunError::Model(err)
    }
}

impl From<TokenizerError> for RunError {
    fn from(err: TokenizerError) -> Self {
        RunError::Tokenizer(err)
    }
}

impl From<GenerationError> for RunError {
    fn from(err: GenerationError) -> Self {
        RunError::Generation(err)
    }
}

/// Per-run settings shared by every input file.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub base_model: String,
    pub prompt_template_path: String,
    pub output_dir: PathBuf,
    pub show_progress: bool,
}

fn model_basename(base_model: &str) -> &str {
    base_model
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(base_model)
}

fn progress_bar(len: usize, message: String, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    let style = ProgressStyle::with_template("{msg}: {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta_precise}]")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_message(message);
    bar
}

/// Answers every instruction in `input_path` and writes the output file.
/// Returns the path written.
pub fn process_input_file(
    evaluator: &mut Evaluator,
    input_path: &Path,
    context: &RunContext,
) -> Result<PathBuf, RunError> {
    let data = dataset::load_input_file(input_path)?;
    let output_path = dataset::output_path_for(&context.output_dir, &context.base_model, input_path)?;
    info!("{} instructions from {}", data.len(), input_path.display());

    let message = format!(
        "Evaluate {} on {}",
        model_basename(&context.base_model),
        dataset::dataset_label(input_path)
    );
    let bar = progress_bar(data.len(), message, context.show_progress);

    let mut outputs = Vec::with_capacity(data.len());
    for (index, task) in data.tasks().enumerate() {
        let response = evaluator
            .evaluate(&task.instruction, task.input.as_deref())
            .map_err(|source| RunError::Task { file: input_path.to_path_buf(), index, source })?;
        outputs.push(response);
        bar.inc(1);
    }
    bar.finish();

    let output = OutputFile {
        parameters: RunParameters {
            model: context.base_model.clone(),
            prompt_template: context.prompt_template_path.clone(),
            generation: evaluator.generation().clone(),
        },
        inputs: data.inputs,
        instructions: data.instructions,
        outputs,
    };
    dataset::write_output_file(&output_path, &output)?;
    info!("Wrote {}", output_path.display());
    Ok(output_path)
}

/// Warning for CPU runs whose weights would not fit in available RAM.
/// Accelerator runs keep the weights in device memory and never warn.
fn ram_warning(needed: u64, on_cpu: bool, resources: &SystemResources) -> Option<String> {
    if !on_cpu || resources.fits_in_ram(needed) {
        return None;
    }
    Some(format!(
        "Model needs about {:.2} GB but only {:.2} GB RAM is available",
        bytes_to_gb(needed),
        resources.ram_available_gb()
    ))
}

fn preflight_weights(files: &ModelFiles, bytes_per_param: usize, on_cpu: bool) -> Result<(), RunError> {
    let summary = WeightsSummary::collect(&files.weights)?;
    let needed = summary.estimated_bytes(bytes_per_param);
    info!(
        "{} tensors in {} file(s), {} parameters ({:.2} GB at {} bytes each)",
        summary.tensors,
        summary.files,
        summary.parameters,
        bytes_to_gb(needed),
        bytes_per_param
    );
    for (dtype, count) in &summary.dtypes {
        info!("  stored as {}: {} parameters", dtype, count);
    }
    let resources = SystemResources::new();
    info!(
        "{} CPU cores, {:.2} GB of {:.2} GB RAM available",
        resources.cpu_core_count,
        resources.ram_available_gb(),
        resources.ram_total_gb()
    );
    if let Some(message) = ram_warning(needed, on_cpu, &resources) {
        warn!("{}", message);
    }
    Ok(())
}

pub fn run(args: CliArgs) -> Result<(), RunError> {
    let generation = args.generation_config();
    generation.validate()?;

    // Template first so a bad path fails before any download.
    let prompter = Prompter::new(&args.prompt_template_path, args.verbose)?;

    let device = model::select_device(args.cpu)?;
    let dtype = model::select_dtype(args.dtype.as_deref(), &device)?;
    let files = ModelFiles::resolve(&args.base_model, &args.revision, args.auth_token.as_deref())?;
    preflight_weights(&files, dtype.size_in_bytes(), device.is_cpu())?;

    let tokenizer = TokenizerWrapper::new(&files.tokenizer)?;
    let (config, raw_config) = ModelConfig::load(&files.config)?;
    let model = model::load_model(&files, &config, &raw_config, &device, dtype)?;
    info!("Model {} loaded", args.base_model);

    let mut evaluator = Evaluator::new(model, tokenizer, prompter, generation, config.eos_token_ids());
    let context = RunContext {
        base_model: args.base_model.clone(),
        prompt_template_path: args.prompt_template_path.clone(),
        output_dir: args.output_path.clone(),
        show_progress: true,
    };
    for input_path in &args.input_path {
        process_input_file(&mut evaluator, input_path, &context)?;
    }
    Ok(())
}

pub fn run_cli() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();
    run(args)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CliArgs::try_parse_from(["generate_answers"]).unwrap();
        assert_eq!(args.base_model, DEFAULT_BASE_MODEL);
        assert_eq!(args.input_path, vec![PathBuf::from("data/test_input.json")]);
        assert_eq!(args.output_path, PathBuf::from("output"));
        assert_eq!(args.prompt_template_path, "configs/alpaca.json");
        assert_eq!(args.generation_config(), GenerationConfig::default());
    }

    #[test]
    fn test_snake_case_aliases() {
        let args = CliArgs::try_parse_from([
            "generate_answers",
            "--base_model",
            "some/model",
            "--num_beams",
            "1",
            "--max_new_tokens",
            "8",
        ])
        .unwrap();
        assert_eq!(args.base_model, "some/model");
        assert_eq!(args.num_beams, 1);
        assert_eq!(args.max_new_tokens, 8);
    }

    #[test]
    fn test_multiple_input_paths() {
        let args = CliArgs::try_parse_from(["generate_answers", "--input-path", "a.json", "b.json"]).unwrap();
        assert_eq!(args.input_path, vec![PathBuf::from("a.json"), PathBuf::from("b.json")]);
    }

    #[test]
    fn test_rejects_unknown_dtype() {
        assert!(CliArgs::try_parse_from(["generate_answers", "--dtype", "int4"]).is_err());
    }

    #[test]
    fn test_ram_warning_only_on_cpu() {
        let resources = SystemResources {
            cpu_core_count: 8,
            ram_total_bytes: 16 << 30,
            ram_available_bytes: 4 << 30,
        };
        let warning = ram_warning(8 << 30, true, &resources);
        assert!(warning.is_some(), "oversized CPU run should warn");
        assert!(warning.unwrap().contains("8.00 GB"));
        assert_eq!(ram_warning(8 << 30, false, &resources), None);
        assert_eq!(ram_warning(2 << 30, true, &resources), None);
    }

    #[test]
    fn test_model_basename() {
        assert_eq!(model_basename("aurora-m/Aurora-40k-hf"), "Aurora-40k-hf");
        assert_eq!(model_basename("local-model"), "local-model");
        assert_eq!(model_basename("./models/m/"), "m");
    }

    #[test]
    fn test_missing_template_fails_before_model_load() {
        let args = CliArgs::try_parse_from([
            "generate_answers",
            "--prompt-template-path",
            "no/such/template.json",
            "--base-model",
            "no/such-model",
        ])
        .unwrap();
        match run(args) {
            Err(RunError::Template(TemplateError::NotFound(path))) => {
                assert_eq!(path, "no/such/template.json")
            }
            other => panic!("expected missing template error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_generation_config_rejected() {
        let args = CliArgs::try_parse_from(["generate_answers", "--num-beams", "0"]).unwrap();
        assert!(matches!(run(args), Err(RunError::Generation(GenerationError::InvalidConfig(_)))));
    }
}
