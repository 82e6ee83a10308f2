use log::info;
use serde::Deserialize;
use std::fs;
use std::io;
use std::sync::Arc;
use thiserror::Error;

const BUILTIN_PROMPTS: &str = include_str!("../../json/prompts.json");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read prompts file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse prompts file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Built-in prompt templates are invalid: {0}")]
    Builtin(#[source] serde_json::Error),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PromptConfig {
    /// System instruction for the report analyst.
    pub instructions: String,
    /// System instruction for the SQL sub-agent.
    pub query_gen: String,
    /// Table description appended to `query_gen`.
    pub data_dictionary: String,
}

/// Any subset of templates; missing keys keep the built-in text.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct PromptOverrides {
    instructions: Option<String>,
    query_gen: Option<String>,
    data_dictionary: Option<String>,
}

impl PromptConfig {
    pub fn builtin() -> Result<Self, ConfigError> {
        serde_json::from_str(BUILTIN_PROMPTS).map_err(ConfigError::Builtin)
    }

    fn apply(mut self, overrides: PromptOverrides) -> Self {
        if let Some(instructions) = overrides.instructions {
            self.instructions = instructions;
        }
        if let Some(query_gen) = overrides.query_gen {
            self.query_gen = query_gen;
        }
        if let Some(data_dictionary) = overrides.data_dictionary {
            self.data_dictionary = data_dictionary;
        }
        self
    }

    pub fn warehouse_system_prompt(&self) -> String {
        format!("<instructions>{}</instructions><data_dict>{}</data_dict>", self.query_gen, self.data_dictionary)
    }
}

pub fn load_prompts(path: Option<&str>) -> Result<Arc<PromptConfig>, ConfigError> {
    let builtin = PromptConfig::builtin()?;
    let Some(path) = path.filter(|p| !p.trim().is_empty()) else {
        return Ok(Arc::new(builtin));
    };

    let file_content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    let overrides: PromptOverrides = serde_json::from_str(&file_content).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })?;
    info!("Loaded prompt overrides from {}", path);
    Ok(Arc::new(builtin.apply(overrides)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_templates_mention_their_tools() {
        let config = PromptConfig::builtin().unwrap();
        assert!(config.instructions.contains("get_omelas_results"));
        assert!(config.query_gen.contains("call_gbq_function"));
        assert!(config.data_dictionary.contains("hack.main"));
    }

    #[test]
    fn warehouse_prompt_wraps_both_sections() {
        let config = PromptConfig {
            instructions: String::new(),
            query_gen: "QG".to_string(),
            data_dictionary: "DD".to_string(),
        };
        assert_eq!(config.warehouse_system_prompt(), "<instructions>QG</instructions><data_dict>DD</data_dict>");
    }

    #[test]
    fn no_path_means_builtin() {
        let config = load_prompts(None).unwrap();
        assert_eq!(*config, PromptConfig::builtin().unwrap());
    }

    #[test]
    fn file_overrides_only_named_templates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"data_dictionary": "custom table"}}"#).unwrap();
        let config = load_prompts(file.path().to_str()).unwrap();
        let builtin = PromptConfig::builtin().unwrap();
        assert_eq!(config.data_dictionary, "custom table");
        assert_eq!(config.query_gen, builtin.query_gen);
    }

    #[test]
    fn unreadable_and_invalid_files_are_reported() {
        let err = load_prompts(Some("/nonexistent/prompts.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"unknown_template": "x"}}"#).unwrap();
        let err = load_prompts(file.path().to_str()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
