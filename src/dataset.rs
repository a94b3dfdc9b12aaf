// src/dataset.rs

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use crate::generation::GenerationConfig;

#[derive(Debug)]
pub enum DatasetError {
    Io(PathBuf, std::io::Error),
    Json(PathBuf, serde_json::Error),
    NoInstructions,
    LengthMismatch { instructions: usize, inputs: usize },
    InvalidPath(PathBuf),
}

impl std::fmt::Display for DatasetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetError::Io(path, e) => write!(f, "IO error on {}: {}", path.display(), e),
            DatasetError::Json(path, e) => write!(f, "JSON error in {}: {}", path.display(), e),
            DatasetError::NoInstructions => write!(f, "No instructions provided"),
            DatasetError::LengthMismatch { instructions, inputs } => write!(
                f,
                "Number of instructions ({}) does not match number of inputs ({})",
                instructions, inputs
            ),
            DatasetError::InvalidPath(path) => {
                write!(f, "Input path has no file name: {}", path.display())
            }
        }
    }
}

impl std::error::Error for DatasetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DatasetError::Io(_, e) => Some(e),
            DatasetError::Json(_, e) => Some(e),
            _ => None,
        }
    }
}

/// One instruction and its optional auxiliary input.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub instruction: String,
    pub input: Option<String>,
}

/// Input file as found on disk. Both arrays may be absent or null.
#[derive(Deserialize, Debug, Default)]
pub struct InputFile {
    #[serde(default)]
    pub instructions: Option<Vec<String>>,
    #[serde(default)]
    pub inputs: Option<Vec<Option<String>>>,
}

/// Validated contents of an input file. `inputs` always has one entry per
/// instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub instructions: Vec<String>,
    pub inputs: Vec<Option<String>>,
}

impl InputFile {
    pub fn validate(self) -> Result<Dataset, DatasetError> {
        let instructions = self.instructions.ok_or(DatasetError::NoInstructions)?;
        let inputs = match self.inputs {
            None => vec![None; instructions.len()],
            Some(inputs) if inputs.is_empty() => vec![None; instructions.len()],
            Some(inputs) if inputs.len() != instructions.len() => {
                return Err(DatasetError::LengthMismatch {
                    instructions: instructions.len(),
                    inputs: inputs.len(),
                })
            }
            Some(inputs) => inputs,
        };
        Ok(Dataset { instructions, inputs })
    }
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = Task> + '_ {
        self.instructions
            .iter()
            .zip(self.inputs.iter())
            .map(|(instruction, input)| Task {
                instruction: instruction.clone(),
                input: input.clone(),
            })
    }
}

pub fn load_input_file(path: &Path) -> Result<Dataset, DatasetError> {
    let file = File::open(path).map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
    let raw: InputFile = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| DatasetError::Json(path.to_path_buf(), e))?;
    raw.validate()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunParameters {
    pub model: String,
    pub prompt_template: String,
    pub generation: GenerationConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputFile {
    pub parameters: RunParameters,
    pub inputs: Vec<Option<String>>,
    pub instructions: Vec<String>,
    pub outputs: Vec<String>,
}

/// `<output_dir>/<base_model>/<file name of input_path>`.
///
/// Only the plain name segments of `base_model` are used, so an absolute or
/// `..`-prefixed local model path still lands under `output_dir`.
pub fn output_path_for(
    output_dir: &Path,
    base_model: &str,
    input_path: &Path,
) -> Result<PathBuf, DatasetError> {
    let file_name = input_path
        .file_name()
        .ok_or_else(|| DatasetError::InvalidPath(input_path.to_path_buf()))?;
    let model_dir: PathBuf = Path::new(base_model)
        .components()
        .filter_map(|component| match component {
            Component::Normal(segment) => Some(segment),
            _ => None,
        })
        .collect();
    Ok(output_dir.join(model_dir).join(file_name))
}

/// File name up to its first dot; used to label progress output.
pub fn dataset_label(input_path: &Path) -> String {
    input_path
        .file_name()
        .map(|name| name.to_string_lossy())
        .map(|name| name.split('.').next().unwrap_or_default().to_string())
        .unwrap_or_default()
}

pub fn write_output_file(path: &Path, output: &OutputFile) -> Result<(), DatasetError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| DatasetError::Io(parent.to_path_buf(), e))?;
        }
    }
    let file = File::create(path).map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
    let mut writer = BufWriter::new(file);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut writer, formatter);
    output
        .serialize(&mut serializer)
        .map_err(|e| DatasetError::Json(path.to_path_buf(), e))?;
    writer.flush().map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(json: &str) -> Result<Dataset, DatasetError> {
        let raw: InputFile = serde_json::from_str(json).expect("test JSON must parse");
        raw.validate()
    }

    #[test]
    fn test_empty_inputs_expand_to_nulls() {
        let dataset = parse(r#"{"instructions": ["a", "b", "c"], "inputs": []}"#).unwrap();
        assert_eq!(dataset.inputs, vec![None, None, None]);
    }

    #[test]
    fn test_null_or_missing_inputs_expand_to_nulls() {
        let dataset = parse(r#"{"instructions": ["a", "b"], "inputs": null}"#).unwrap();
        assert_eq!(dataset.inputs, vec![None, None]);
        let dataset = parse(r#"{"instructions": ["a"]}"#).unwrap();
        assert_eq!(dataset.inputs, vec![None]);
    }

    #[test]
    fn test_mismatched_lengths_error() {
        let result = parse(r#"{"instructions": ["a", "b"], "inputs": ["x"]}"#);
        match result {
            Err(e @ DatasetError::LengthMismatch { .. }) => assert_eq!(
                e.to_string(),
                "Number of instructions (2) does not match number of inputs (1)"
            ),
            other => panic!("expected LengthMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_instructions_error() {
        assert!(matches!(parse(r#"{"inputs": []}"#), Err(DatasetError::NoInstructions)));
        assert!(matches!(
            parse(r#"{"instructions": null, "inputs": []}"#),
            Err(DatasetError::NoInstructions)
        ));
    }

    #[test]
    fn test_tasks_pair_instructions_with_inputs() {
        let dataset = parse(r#"{"instructions": ["a", "b"], "inputs": ["x", null]}"#).unwrap();
        let tasks: Vec<Task> = dataset.tasks().collect();
        assert_eq!(
            tasks,
            vec![
                Task { instruction: "a".into(), input: Some("x".into()) },
                Task { instruction: "b".into(), input: None },
            ]
        );
    }

    #[test]
    fn test_output_path_nests_hub_ids() {
        let path = output_path_for(
            Path::new("out"),
            "aurora-m/Aurora-40k-hf",
            Path::new("data/test_input.json"),
        )
        .unwrap();
        assert_eq!(path, Path::new("out/aurora-m/Aurora-40k-hf/test_input.json"));
    }

    #[test]
    fn test_output_path_stays_under_output_dir_for_local_models() {
        for model in ["/models/m", "../models/m", "./models/../models/m"] {
            let path = output_path_for(Path::new("out"), model, Path::new("data/x.json")).unwrap();
            assert!(path.starts_with("out"), "{} escaped the output dir: {}", model, path.display());
            assert!(path.ends_with("models/m/x.json"), "unexpected layout for {}: {}", model, path.display());
        }
    }

    #[test]
    fn test_dataset_label_stops_at_first_dot() {
        assert_eq!(dataset_label(Path::new("data/alpaca.eval.json")), "alpaca");
        assert_eq!(dataset_label(Path::new("plain")), "plain");
    }

    #[test]
    fn test_write_output_file_creates_dirs_and_indents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model/org/input.json");
        let output = OutputFile {
            parameters: RunParameters {
                model: "org/model".into(),
                prompt_template: "configs/alpaca.json".into(),
                generation: GenerationConfig::default(),
            },
            inputs: vec![None],
            instructions: vec!["Say hi".into()],
            outputs: vec!["hi".into()],
        };
        write_output_file(&path, &output).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("{\n    \"parameters\": {\n        \"model\": \"org/model\""));
        assert!(text.contains("\"inputs\": [\n        null\n    ]"));
        let parsed: OutputFile = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, output);
    }

    #[test]
    fn test_load_input_file_reports_path_on_bad_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        let result = load_input_file(&path);
        assert!(matches!(result, Err(DatasetError::Json(p, _)) if p == path));
    }
}
