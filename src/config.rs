use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Complete configuration for an adaptation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AceConfig {
    pub adaptation: AdaptationConfig,
    pub offline: OfflineConfig,
    pub online: OnlineConfig,
    pub dedup: DedupConfig,
    pub model: ModelConfig,
    pub environment: EnvironmentConfig,
    /// Directory receiving the playbook, metrics and trajectory logs.
    pub output_dir: PathBuf,
}

/// Per-sample loop configuration shared by every adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    /// Step cap for one trajectory (default: 10).
    pub max_steps: usize,
    /// Capacity K of the reflection window handed to the curator (default: 5).
    pub window_size: usize,
    /// Consecutive execution errors after which the session is treated as
    /// unusable. 0 disables the check (default: 0).
    pub max_consecutive_errors: usize,
    /// How many times a failing evaluation call is attempted (default: 3).
    pub evaluation_attempts: usize,
    /// TGC threshold a task must reach to count towards SGC (default: 0.8).
    pub sgc_threshold: f64,
}

/// Multi-epoch training over a fixed sample collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Number of passes over the training samples (default: 3).
    pub epochs: usize,
    /// Deduplicate after every N samples in addition to the end of each
    /// epoch. 0 means end of epoch only (default: 0).
    pub dedup_every: usize,
}

/// Single-pass streaming adaptation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    /// Persist the playbook every N samples; 0 saves only at the end (default: 10).
    pub save_every: usize,
    /// Stop after this many samples even if the producer has more.
    pub max_samples: Option<usize>,
}

/// Which similarity measure the deduplicator uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    /// Cosine similarity over embedding vectors.
    Embedding,
    /// Case-insensitive equality / containment of bullet text.
    Lexical,
}

/// Playbook deduplication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    pub strategy: DedupStrategy,
    /// Cosine similarity above which two bullets are duplicates (default: 0.8).
    pub similarity_threshold: f64,
}

/// Model endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL for the chat completions API.
    pub api_base: String,
    /// API key for the chat model.
    pub api_key: String,
    /// Model used for the generator, reflector and curator roles.
    pub model_id: String,
    pub temperature: f64,
    pub max_tokens: usize,
    /// How many times a role re-asks the model after an unparseable reply (default: 3).
    pub parse_attempts: usize,
    /// Base URL for the embedding API.
    pub embedding_api_base: String,
    pub embedding_api_key: String,
    pub embedding_model_id: String,
}

/// Sandbox server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Base URL of the sandbox server.
    pub base_url: String,
    /// Experiment label sent with every session so the server can group outputs.
    pub experiment_name: String,
}

impl AceConfig {
    /// A copy with every API key blanked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.model.api_key.clear();
        config.model.embedding_api_key.clear();
        config
    }

    /// Write the redacted configuration to `<output_dir>/config.json`.
    pub fn save_snapshot(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;
        let path = self.output_dir.join("config.json");
        let json = serde_json::to_string_pretty(&self.redacted())
            .context("Failed to serialize configuration")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {}", path.display()))?;
        Ok(path)
    }
}

impl Default for AceConfig {
    fn default() -> Self {
        Self {
            adaptation: AdaptationConfig::default(),
            offline: OfflineConfig::default(),
            online: OnlineConfig::default(),
            dedup: DedupConfig::default(),
            model: ModelConfig::default(),
            environment: EnvironmentConfig::default(),
            output_dir: PathBuf::from("outputs"),
        }
    }
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            window_size: 5,
            max_consecutive_errors: 0,
            evaluation_attempts: 3,
            sgc_threshold: 0.8,
        }
    }
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            dedup_every: 0,
        }
    }
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            save_every: 10,
            max_samples: None,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: DedupStrategy::Embedding,
            similarity_threshold: 0.8,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:11434/v1".into(),
            api_key: String::new(),
            model_id: "gpt-oss:20b".into(),
            temperature: 0.7,
            max_tokens: 4096,
            parse_attempts: 3,
            embedding_api_base: "http://localhost:11434/v1".into(),
            embedding_api_key: String::new(),
            embedding_model_id: "qwen3-embedding".into(),
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8777".into(),
            experiment_name: "ace_experiment".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let json = r#"{ "adaptation": { "max_steps": 4 }, "dedup": { "strategy": "lexical" } }"#;
        let config: AceConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.adaptation.max_steps, 4);
        assert_eq!(config.adaptation.window_size, 5);
        assert_eq!(config.dedup.strategy, DedupStrategy::Lexical);
        assert!(config.dedup.enabled);
        assert_eq!(config.offline.epochs, 3);
        assert_eq!(config.output_dir, PathBuf::from("outputs"));
    }

    #[test]
    fn snapshot_omits_api_keys() {
        let dir = std::env::temp_dir().join(format!("ace_config_{}", uuid::Uuid::new_v4()));
        let mut config = AceConfig {
            output_dir: dir.clone(),
            ..AceConfig::default()
        };
        config.model.api_key = "sk-secret".into();
        config.model.embedding_api_key = "sk-secret".into();
        config.adaptation.max_steps = 7;

        let path = config.save_snapshot().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert!(!text.contains("sk-secret"));
        let saved: AceConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(saved.adaptation.max_steps, 7);
        assert_eq!(config.model.api_key, "sk-secret");
    }
}
