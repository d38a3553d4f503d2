use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl Default for ProviderKind {
    fn default() -> Self {
        ProviderKind::OpenAi
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub listen: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub default_provider: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub save_usage: bool,
    #[serde(default)]
    pub storage_type: String,
    #[serde(default)]
    pub storage_uri: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u32,
    #[serde(default = "default_cleanup_enabled")]
    pub cleanup_enabled: bool,
}

fn default_retention_days() -> u32 {
    3
}

fn default_cleanup_interval_hours() -> u32 {
    6
}

fn default_cleanup_enabled() -> bool {
    true
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: String,
    pub access_token: String,
    #[serde(default, rename = "type")]
    pub kind: ProviderKind,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Whole-exchange timeout in seconds; zero or absent means no limit
    /// beyond the shared client default.
    #[serde(default)]
    pub timeout: u64,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("access_token", &"<redacted>")
            .field("kind", &self.kind)
            .field("headers", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(rename = "model")]
    pub name: String,
    #[serde(default)]
    pub providers: Vec<CandidateConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// One `(provider, outbound model)` pair. An empty model keeps the request's
/// original model name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CandidateConfig {
    pub provider: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(rename = "rule")]
    pub expression: String,
    #[serde(default)]
    pub providers: Vec<CandidateConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|err| GatewayError::Config(format!("read config: {err}")))?;
        let mut config: Config = serde_yaml::from_str(&raw)
            .map_err(|err| GatewayError::Config(format!("parse config: {err}")))?;
        config.set_defaults();
        config.apply_port_override(std::env::var("PORT").ok().as_deref());
        config.validate()?;
        Ok(config)
    }

    fn set_defaults(&mut self) {
        if self.storage_type.is_empty() {
            self.storage_type = "sqlite".to_string();
        }
        if self.storage_uri.is_empty() {
            self.storage_uri = "usage.db".to_string();
        }
    }

    /// A `PORT` environment variable replaces the port component of `listen`.
    fn apply_port_override(&mut self, port: Option<&str>) {
        let Some(port) = port.map(str::trim).filter(|value| !value.is_empty()) else {
            return;
        };
        if port.parse::<u16>().is_err() {
            return;
        }
        let host = match self.listen.rfind(':') {
            Some(idx) => &self.listen[..idx],
            None => self.listen.as_str(),
        };
        self.listen = format!("{host}:{port}");
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(GatewayError::Config("listen address is required".into()));
        }

        let mut providers = HashSet::new();
        for provider in &self.providers {
            if provider.id.is_empty() {
                return Err(GatewayError::Config("provider id is required".into()));
            }
            if !providers.insert(provider.id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicated provider id: {}",
                    provider.id
                )));
            }
            if provider.base_url.is_empty() {
                return Err(GatewayError::Config(format!(
                    "provider {} base_url is required",
                    provider.id
                )));
            }
            if provider.access_token.is_empty() {
                return Err(GatewayError::Config(format!(
                    "provider {} access_token is required",
                    provider.id
                )));
            }
        }

        for model in &self.models {
            if model.name.is_empty() {
                return Err(GatewayError::Config("model name is required".into()));
            }
            if model.providers.is_empty() {
                return Err(GatewayError::Config(format!(
                    "model {} must have at least one provider",
                    model.name
                )));
            }
            for candidate in &model.providers {
                if !providers.contains(candidate.provider.as_str()) {
                    return Err(GatewayError::Config(format!(
                        "model {} references unknown provider {}",
                        model.name, candidate.provider
                    )));
                }
            }
            for rule in &model.rules {
                if rule.expression.is_empty() {
                    return Err(GatewayError::Config(format!(
                        "model {} has rule with empty expression",
                        model.name
                    )));
                }
                if rule.providers.is_empty() {
                    return Err(GatewayError::Config(format!(
                        "model {} rule {} must specify providers",
                        model.name, rule.expression
                    )));
                }
                for candidate in &rule.providers {
                    if !providers.contains(candidate.provider.as_str()) {
                        return Err(GatewayError::Config(format!(
                            "model {} rule {} references unknown provider {}",
                            model.name, rule.expression, candidate.provider
                        )));
                    }
                }
            }
        }

        if !self.default_provider.is_empty()
            && !providers.contains(self.default_provider.as_str())
        {
            return Err(GatewayError::Config(format!(
                "default provider {} not found",
                self.default_provider
            )));
        }

        if self.save_usage {
            if self.storage_type != "sqlite" && self.storage_type != "mysql" {
                return Err(GatewayError::Config(format!(
                    "unsupported storage_type {}",
                    self.storage_type
                )));
            }
            if self.storage_uri.trim().is_empty() {
                return Err(GatewayError::Config(
                    "storage_uri is required when save_usage is enabled".into(),
                ));
            }
        }

        Ok(())
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|provider| provider.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            listen: "127.0.0.1:8080".to_string(),
            api_keys: vec!["sk-test".to_string()],
            providers: vec![ProviderConfig {
                id: "p1".to_string(),
                base_url: "https://api.example.com/v1".to_string(),
                access_token: "sk-upstream".to_string(),
                kind: ProviderKind::OpenAi,
                headers: BTreeMap::new(),
                timeout: 0,
            }],
            models: Vec::new(),
            default_provider: String::new(),
            debug: false,
            save_usage: false,
            storage_type: "sqlite".to_string(),
            storage_uri: "usage.db".to_string(),
            retention_days: 3,
            cleanup_interval_hours: 6,
            cleanup_enabled: true,
        }
    }

    #[test]
    fn parses_yaml_with_defaults() {
        let raw = r#"
listen: "0.0.0.0:8080"
api_keys:
  - sk-client
providers:
  - id: openai
    base_url: https://api.openai.com/v1
    access_token: sk-upstream
  - id: claude
    base_url: https://api.anthropic.com
    access_token: sk-ant
    type: anthropic
    timeout: 120
models:
  - model: gpt-4o
    providers:
      - provider: openai
    rules:
      - rule: TokenCount > 1000
        providers:
          - provider: claude
            model: claude-3-5-sonnet
default_provider: openai
"#;
        let mut config: Config = serde_yaml::from_str(raw).expect("parse");
        config.set_defaults();
        config.validate().expect("validate");

        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[1].kind, ProviderKind::Anthropic);
        assert_eq!(config.providers[1].timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.storage_type, "sqlite");
        assert_eq!(config.retention_days, 3);
        assert_eq!(config.cleanup_interval_hours, 6);
        assert!(config.cleanup_enabled);
        assert_eq!(config.models[0].rules[0].providers[0].model, "claude-3-5-sonnet");
    }

    #[test]
    fn rejects_duplicate_provider_ids() {
        let mut config = minimal();
        config.providers.push(config.providers[0].clone());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicated provider id"));
    }

    #[test]
    fn rejects_unknown_rule_provider() {
        let mut config = minimal();
        config.models.push(ModelConfig {
            name: "gpt-4o".to_string(),
            providers: vec![CandidateConfig {
                provider: "p1".to_string(),
                model: String::new(),
            }],
            rules: vec![RuleConfig {
                expression: "TokenCount > 10".to_string(),
                providers: vec![CandidateConfig {
                    provider: "missing".to_string(),
                    model: String::new(),
                }],
            }],
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown provider missing"));
    }

    #[test]
    fn rejects_unknown_default_provider() {
        let mut config = minimal();
        config.default_provider = "ghost".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default provider ghost not found"));
    }

    #[test]
    fn port_env_overrides_listen_port() {
        let mut config = minimal();
        config.apply_port_override(Some("9090"));
        assert_eq!(config.listen, "127.0.0.1:9090");

        let mut config = minimal();
        config.apply_port_override(Some("not-a-port"));
        assert_eq!(config.listen, "127.0.0.1:8080");

        let mut config = minimal();
        config.apply_port_override(None);
        assert_eq!(config.listen, "127.0.0.1:8080");
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = minimal();
        let rendered = format!("{:?}", config.providers[0]);
        assert!(!rendered.contains("sk-upstream"));
        assert!(rendered.contains("<redacted>"));
    }
}
