// src/template.rs

use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Alpaca template used when no template path is given.
const ALPACA_TEMPLATE: &str = r####"{
    "description": "Template used by Alpaca-LoRA.",
    "prompt_input": "Below is an instruction that describes a task, paired with an input that provides further context. Write a response that appropriately completes the request.\n\n### Instruction:\n{instruction}\n\n### Input:\n{input}\n\n### Response:\n",
    "prompt_no_input": "Below is an instruction that describes a task. Write a response that appropriately completes the request.\n\n### Instruction:\n{instruction}\n\n### Response:\n",
    "response_split": "### Response:"
}"####;

#[derive(Debug)]
pub enum TemplateError {
    NotFound(String),
    Io(String, std::io::Error),
    Json(String, serde_json::Error),
    MissingField(String),
    Malformed(String),
    ResponseSplitNotFound(String),
}

impl std::fmt::Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::NotFound(path) => write!(f, "Can't read {}", path),
            TemplateError::Io(path, e) => write!(f, "Failed to read template {}: {}", path, e),
            TemplateError::Json(path, e) => write!(f, "Invalid template JSON in {}: {}", path, e),
            TemplateError::MissingField(name) => {
                write!(f, "Template references field '{{{}}}' which was not supplied", name)
            }
            TemplateError::Malformed(s) => write!(f, "Malformed template: {}", s),
            TemplateError::ResponseSplitNotFound(sep) => {
                write!(f, "Response separator '{}' not found in model output", sep)
            }
        }
    }
}

impl std::error::Error for TemplateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TemplateError::Io(_, e) => Some(e),
            TemplateError::Json(_, e) => Some(e),
            _ => None,
        }
    }
}

/// The JSON record describing how an instruction is embedded into a prompt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    #[serde(default)]
    pub description: String,
    pub prompt_input: String,
    pub prompt_no_input: String,
    pub response_split: String,
}

impl PromptTemplate {
    pub fn alpaca() -> Result<Self, TemplateError> {
        Self::from_json("alpaca", ALPACA_TEMPLATE)
    }

    pub fn from_json(source: &str, json: &str) -> Result<Self, TemplateError> {
        let template: PromptTemplate = serde_json::from_str(json)
            .map_err(|e| TemplateError::Json(source.to_string(), e))?;
        if template.response_split.is_empty() {
            return Err(TemplateError::Malformed(format!(
                "{}: response_split must not be empty",
                source
            )));
        }
        Ok(template)
    }
}

/// Substitutes `{name}` fields in a Python-style format string.
///
/// `{{` and `}}` produce literal braces. Values are inserted verbatim and
/// never re-scanned, so braces inside an instruction are safe.
pub fn format_named(template: &str, fields: &[(&str, &str)]) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len() + fields.iter().map(|(_, v)| v.len()).sum::<usize>());
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut name = String::new();
                let mut closed = false;
                for (_, nc) in chars.by_ref() {
                    if nc == '}' {
                        closed = true;
                        break;
                    }
                    if nc == '{' {
                        break;
                    }
                    name.push(nc);
                }
                if !closed {
                    return Err(TemplateError::Malformed(format!(
                        "unclosed '{{' at byte {}",
                        pos
                    )));
                }
                let value = fields
                    .iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, value)| *value)
                    .ok_or(TemplateError::MissingField(name))?;
                out.push_str(value);
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(TemplateError::Malformed(format!(
                        "single '}}' at byte {}",
                        pos
                    )));
                }
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

/// Builds prompts from a template and extracts responses from model output.
#[derive(Debug, Clone)]
pub struct Prompter {
    template: PromptTemplate,
    verbose: bool,
}

impl Prompter {
    /// Loads the template at `template_path`. An empty path selects the
    /// built-in Alpaca template.
    pub fn new(template_path: &str, verbose: bool) -> Result<Self, TemplateError> {
        let (name, template) = if template_path.is_empty() {
            ("alpaca", PromptTemplate::alpaca()?)
        } else {
            if !Path::new(template_path).exists() {
                return Err(TemplateError::NotFound(template_path.to_string()));
            }
            let contents = fs::read_to_string(template_path)
                .map_err(|e| TemplateError::Io(template_path.to_string(), e))?;
            (template_path, PromptTemplate::from_json(template_path, &contents)?)
        };
        if verbose {
            info!("Using prompt template {}: {}", name, template.description);
        }
        Ok(Self { template, verbose })
    }

    pub fn from_template(template: PromptTemplate, verbose: bool) -> Self {
        Self { template, verbose }
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    /// Full prompt for `instruction` and optional `input`. A present `label`
    /// (the expected response) is appended.
    pub fn generate_prompt(
        &self,
        instruction: &str,
        input: Option<&str>,
        label: Option<&str>,
    ) -> Result<String, TemplateError> {
        let mut prompt = match input.filter(|text| !text.is_empty()) {
            Some(input) => format_named(
                &self.template.prompt_input,
                &[("instruction", instruction), ("input", input)],
            )?,
            None => format_named(&self.template.prompt_no_input, &[("instruction", instruction)])?,
        };
        if let Some(label) = label.filter(|text| !text.is_empty()) {
            prompt.push_str(label);
        }
        if self.verbose {
            info!("{}", prompt);
        }
        Ok(prompt)
    }

    /// The text between the first and second occurrence of the response
    /// separator, trimmed.
    pub fn get_response(&self, output: &str) -> Result<String, TemplateError> {
        output
            .split(self.template.response_split.as_str())
            .nth(1)
            .map(|response| response.trim().to_string())
            .ok_or_else(|| TemplateError::ResponseSplitNotFound(self.template.response_split.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn simple_prompter() -> Prompter {
        Prompter::from_template(
            PromptTemplate {
                description: "test".to_string(),
                prompt_input: "I: {instruction}\nX: {input}\nR:".to_string(),
                prompt_no_input: "I: {instruction}\nR:".to_string(),
                response_split: "R:".to_string(),
            },
            false,
        )
    }

    #[test]
    fn test_builtin_alpaca_parses() {
        let template = PromptTemplate::alpaca().unwrap();
        assert_eq!(template.response_split, "### Response:");
        assert!(template.prompt_input.contains("{input}"));
        assert!(!template.prompt_no_input.contains("{input}"));
    }

    #[test]
    fn test_shipped_alpaca_file_matches_builtin() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/configs/alpaca.json");
        let prompter = Prompter::new(path, false).unwrap();
        assert_eq!(prompter.template(), &PromptTemplate::alpaca().unwrap());
    }

    #[test]
    fn test_generate_prompt_with_input() {
        let prompter = simple_prompter();
        let prompt = prompter.generate_prompt("Translate", Some("bonjour"), None).unwrap();
        assert_eq!(prompt, "I: Translate\nX: bonjour\nR:");
    }

    #[test]
    fn test_generate_prompt_without_input() {
        let prompter = simple_prompter();
        let prompt = prompter.generate_prompt("Say hi", None, None).unwrap();
        assert_eq!(prompt, "I: Say hi\nR:");
    }

    #[test]
    fn test_empty_input_uses_no_input_template() {
        let prompter = simple_prompter();
        let prompt = prompter.generate_prompt("Say hi", Some(""), None).unwrap();
        assert_eq!(prompt, "I: Say hi\nR:");
    }

    #[test]
    fn test_label_is_appended() {
        let prompter = simple_prompter();
        let prompt = prompter.generate_prompt("Say hi", None, Some(" hi")).unwrap();
        assert_eq!(prompt, "I: Say hi\nR: hi");
    }

    #[test]
    fn test_alpaca_prompt_matches_reference_text() {
        let prompter = Prompter::new("", false).unwrap();
        let prompt = prompter.generate_prompt("Name a color.", None, None).unwrap();
        assert_eq!(
            prompt,
            "Below is an instruction that describes a task. Write a response that appropriately completes the request.\n\n### Instruction:\nName a color.\n\n### Response:\n"
        );
    }

    #[test]
    fn test_format_named_escapes_braces() {
        let out = format_named("{{literal}} {name} }}", &[("name", "x")]).unwrap();
        assert_eq!(out, "{literal} x }");
    }

    #[test]
    fn test_format_named_does_not_rescan_values() {
        let out = format_named("<{instruction}>", &[("instruction", "{input}")]).unwrap();
        assert_eq!(out, "<{input}>");
    }

    #[test]
    fn test_format_named_missing_field() {
        let result = format_named("{instruction} {input}", &[("instruction", "a")]);
        assert!(matches!(result, Err(TemplateError::MissingField(name)) if name == "input"));
    }

    #[test]
    fn test_format_named_malformed() {
        assert!(matches!(format_named("oops {", &[]), Err(TemplateError::Malformed(_))));
        assert!(matches!(format_named("oops }", &[]), Err(TemplateError::Malformed(_))));
    }

    #[test]
    fn test_get_response_splits_on_separator() {
        let prompter = simple_prompter();
        let response = prompter.get_response("I: Say hi\nR:   hello there \n").unwrap();
        assert_eq!(response, "hello there");
    }

    #[test]
    fn test_get_response_stops_at_second_separator() {
        let prompter = simple_prompter();
        let response = prompter.get_response("I: q\nR: first R: second").unwrap();
        assert_eq!(response, "first");
    }

    #[test]
    fn test_get_response_missing_separator() {
        let prompter = simple_prompter();
        let result = prompter.get_response("no separator here");
        assert!(matches!(result, Err(TemplateError::ResponseSplitNotFound(sep)) if sep == "R:"));
    }

    #[test]
    fn test_new_missing_file() {
        let result = Prompter::new("definitely/not/here.json", false);
        match result {
            Err(e @ TemplateError::NotFound(_)) => {
                assert_eq!(e.to_string(), "Can't read definitely/not/here.json")
            }
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_new_loads_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"description": "d", "prompt_input": "{{instruction}}|{{input}}", "prompt_no_input": "{{instruction}}", "response_split": "|"}}"#
        )
        .unwrap();
        let prompter = Prompter::new(file.path().to_str().unwrap(), true).unwrap();
        assert_eq!(prompter.template().description, "d");
        assert_eq!(prompter.generate_prompt("a", Some("b"), None).unwrap(), "a|b");
    }

    #[test]
    fn test_empty_response_split_rejected() {
        let json = r#"{"prompt_input": "{instruction}", "prompt_no_input": "{instruction}", "response_split": ""}"#;
        assert!(matches!(PromptTemplate::from_json("t", json), Err(TemplateError::Malformed(_))));
    }

    proptest! {
        #[test]
        fn prop_instruction_is_substituted_verbatim(instruction in ".*") {
            let prompter = simple_prompter();
            let prompt = prompter.generate_prompt(&instruction, None, None).unwrap();
            prop_assert_eq!(prompt, format!("I: {}\nR:", instruction));
        }

        #[test]
        fn prop_response_round_trips(instruction in "[a-z ]{0,20}", response in "[a-z][a-z ]{0,20}[a-z]") {
            let prompter = simple_prompter();
            let prompt = prompter.generate_prompt(&instruction, None, None).unwrap();
            let output = format!("{} {}", prompt, response);
            prop_assert_eq!(prompter.get_response(&output).unwrap(), response);
        }
    }
}
