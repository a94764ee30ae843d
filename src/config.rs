use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    agent_loop::{ArgumentPolicy, LoopConfig, DEFAULT_MAX_TURNS},
    catalog::{CatalogError, ToolCatalog},
    eval::{
        runner::{Harness, ProviderEntry, ProviderSource},
        scenario::{builtin_scenarios, load_scenarios, PromptTemplate, Scenario, ScenarioError},
    },
    pricing::{PriceTable, PricingError},
    providers::{anthropic::Anthropic, gemini::Gemini, groq::Groq, openai::OpenAI},
    LLMError,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unknown provider kind: {0}")]
    UnknownProvider(String),
    #[error("model `{model}` is ambiguous across {providers} providers; use `<provider>=<model>`")]
    AmbiguousModel { model: String, providers: usize },
    #[error("no configured provider of kind `{0}` to apply a model to")]
    ProviderNotSelected(ProviderKind),
    #[error(transparent)]
    Provider(#[from] LLMError),
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Groq,
    Anthropic,
    Gemini,
    Scripted,
}

impl ProviderKind {
    pub const REMOTE: [ProviderKind; 4] = [
        ProviderKind::Openai,
        ProviderKind::Groq,
        ProviderKind::Anthropic,
        ProviderKind::Gemini,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Groq => "groq",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Scripted => "scripted",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Openai => "gpt-4-0125-preview",
            Self::Groq => "llama3-70b-8192",
            Self::Anthropic => "claude-3-sonnet-20240229",
            Self::Gemini => "gemini-1.5-pro-preview-0409",
            Self::Scripted => "scripted",
        }
    }

    pub fn default_system_prompt(&self) -> Option<&'static str> {
        match self {
            Self::Groq => Some(
                "You are a function calling LLM that uses the data extracted from the provided \
tools to answer questions and perform tasks.",
            ),
            _ => None,
        }
    }

    /// Builds the adapter from environment credentials.
    pub fn build_source(&self) -> Result<ProviderSource, LLMError> {
        Ok(match self {
            Self::Openai => ProviderSource::Shared(Arc::new(OpenAI::from_env()?)),
            Self::Groq => ProviderSource::Shared(Arc::new(Groq::from_env()?)),
            Self::Anthropic => ProviderSource::Shared(Arc::new(Anthropic::from_env()?)),
            Self::Gemini => ProviderSource::Shared(Arc::new(Gemini::from_env()?)),
            Self::Scripted => ProviderSource::Scripted,
        })
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "gpt" => Ok(Self::Openai),
            "groq" => Ok(Self::Groq),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" => Ok(Self::Gemini),
            "scripted" => Ok(Self::Scripted),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    /// Report label; defaults to the kind.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl ProviderSettings {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            label: None,
            model: None,
            system_prompt: None,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.kind.as_str().to_string())
    }

    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.kind.default_model().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderSettings>,
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,
    #[serde(default)]
    pub argument_policy: ArgumentPolicy,
    #[serde(default = "default_guard_on_last_step")]
    pub guard_on_last_step: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Handlebars source with `prompt` and `parameters` variables.
    #[serde(default)]
    pub prompt_template: Option<String>,
    /// Price overrides merged over the built-in table.
    #[serde(default)]
    pub prices: Option<PathBuf>,
    #[serde(default)]
    pub catalog: Option<PathBuf>,
    #[serde(default)]
    pub scenarios: Option<PathBuf>,
    #[serde(default)]
    pub out_dir: Option<PathBuf>,
}

fn default_providers() -> Vec<ProviderSettings> {
    ProviderKind::REMOTE
        .into_iter()
        .map(ProviderSettings::new)
        .collect()
}

fn default_max_turns() -> usize {
    DEFAULT_MAX_TURNS
}

fn default_llm_timeout_ms() -> u64 {
    120_000
}

fn default_guard_on_last_step() -> bool {
    true
}

fn default_concurrency() -> usize {
    1
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            max_turns: default_max_turns(),
            llm_timeout_ms: default_llm_timeout_ms(),
            run_timeout_ms: None,
            argument_policy: ArgumentPolicy::default(),
            guard_on_last_step: default_guard_on_last_step(),
            concurrency: default_concurrency(),
            prompt_template: None,
            prices: None,
            catalog: None,
            scenarios: None,
            out_dir: None,
        }
    }
}

impl BenchConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(input)?)
    }

    /// Applies a model override. `<provider>=<model>` targets every entry of that kind; a bare
    /// model id is only accepted when exactly one provider is configured.
    pub fn override_model(&mut self, spec: &str) -> Result<(), ConfigError> {
        if let Some((kind, model)) = spec.split_once('=') {
            let kind: ProviderKind = kind.trim().parse()?;
            let mut matched = false;
            for settings in self.providers.iter_mut().filter(|s| s.kind == kind) {
                settings.model = Some(model.trim().to_string());
                matched = true;
            }
            return if matched {
                Ok(())
            } else {
                Err(ConfigError::ProviderNotSelected(kind))
            };
        }

        match self.providers.as_mut_slice() {
            [only] => {
                only.model = Some(spec.to_string());
                Ok(())
            }
            providers => Err(ConfigError::AmbiguousModel {
                model: spec.to_string(),
                providers: providers.len(),
            }),
        }
    }

    pub fn loop_config(&self, settings: &ProviderSettings) -> LoopConfig {
        let mut config = LoopConfig::new(settings.model())
            .with_max_turns(self.max_turns)
            .with_llm_timeout(Duration::from_millis(self.llm_timeout_ms))
            .with_argument_policy(self.argument_policy);

        if let Some(prompt) = settings
            .system_prompt
            .as_deref()
            .or(settings.kind.default_system_prompt())
        {
            config = config.with_system_prompt(prompt);
        }
        if let Some(ms) = self.run_timeout_ms {
            config = config.with_run_timeout(Duration::from_millis(ms));
        }
        if let Some(max_tokens) = settings.max_tokens {
            config = config.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = settings.temperature {
            config = config.with_temperature(temperature);
        }
        config
    }

    pub fn price_table(&self) -> Result<PriceTable, ConfigError> {
        let table = PriceTable::builtin();
        Ok(match &self.prices {
            Some(path) => table.merged(PriceTable::load(path)?),
            None => table,
        })
    }

    pub fn tool_catalog(&self) -> Result<ToolCatalog, ConfigError> {
        Ok(match &self.catalog {
            Some(path) => ToolCatalog::load(path)?,
            None => ToolCatalog::builtin()?,
        })
    }

    pub fn load_scenarios(&self) -> Result<Vec<Scenario>, ConfigError> {
        Ok(match &self.scenarios {
            Some(path) => load_scenarios(path)?,
            None => builtin_scenarios()?,
        })
    }

    pub fn prompt_template(&self) -> Result<PromptTemplate, ConfigError> {
        Ok(match &self.prompt_template {
            Some(source) => PromptTemplate::new(source)?,
            None => PromptTemplate::builtin()?,
        })
    }

    pub fn provider_entry(&self, settings: &ProviderSettings) -> Result<ProviderEntry, ConfigError> {
        Ok(ProviderEntry::new(
            settings.label(),
            settings.kind.build_source()?,
            self.loop_config(settings),
        ))
    }

    /// Assembles a harness with every configured provider. Fails on the first provider whose
    /// credentials are missing.
    pub fn harness(&self) -> Result<Harness, ConfigError> {
        let mut harness = Harness::new(
            Arc::new(self.tool_catalog()?),
            Arc::new(self.price_table()?),
        )?
        .with_template(self.prompt_template()?)
        .with_concurrency(self.concurrency)
        .with_guard_on_last_step(self.guard_on_last_step);

        for settings in &self.providers {
            harness = harness.with_provider(self.provider_entry(settings)?);
        }
        Ok(harness)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::ModelPrice;

    #[test]
    fn empty_document_uses_defaults() {
        let config = BenchConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, BenchConfig::default());
        assert_eq!(config.providers.len(), 4);
        assert_eq!(config.max_turns, 25);
        assert!(config.guard_on_last_step);
    }

    #[test]
    fn provider_settings_drive_loop_config() {
        let config = BenchConfig::from_yaml_str(
            r#"
max_turns: 12
llm_timeout_ms: 5000
run_timeout_ms: 60000
argument_policy: strict
providers:
  - kind: groq
    model: llama3-8b-8192
  - kind: anthropic
    label: claude-opus
    model: claude-3-opus-20240229
    system_prompt: You are an RPA bot.
    max_tokens: 1024
    temperature: 0.0
"#,
        )
        .unwrap();

        let groq = config.loop_config(&config.providers[0]);
        assert_eq!(groq.model, "llama3-8b-8192");
        assert_eq!(groq.max_turns, 12);
        assert_eq!(groq.llm_timeout, Duration::from_millis(5000));
        assert_eq!(groq.run_timeout, Some(Duration::from_secs(60)));
        assert_eq!(groq.argument_policy, ArgumentPolicy::Strict);
        assert!(groq.system_prompt.unwrap().starts_with("You are a function calling LLM"));

        let claude = config.loop_config(&config.providers[1]);
        assert_eq!(config.providers[1].label(), "claude-opus");
        assert_eq!(claude.system_prompt.as_deref(), Some("You are an RPA bot."));
        assert_eq!(claude.max_tokens, Some(1024));
        assert_eq!(claude.temperature, Some(0.0));
    }

    #[test]
    fn provider_kind_parses_aliases() {
        assert_eq!("claude".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert_eq!("GROQ".parse::<ProviderKind>().unwrap(), ProviderKind::Groq);
        assert!(matches!(
            "mistral".parse::<ProviderKind>(),
            Err(ConfigError::UnknownProvider(_))
        ));
    }

    #[test]
    fn model_override_is_scoped_to_one_provider() {
        let mut config = BenchConfig {
            providers: vec![
                ProviderSettings::new(ProviderKind::Openai),
                ProviderSettings::new(ProviderKind::Groq),
            ],
            ..BenchConfig::default()
        };

        assert!(matches!(
            config.override_model("gpt-4-0125-preview"),
            Err(ConfigError::AmbiguousModel { providers: 2, .. })
        ));
        assert_eq!(config.providers[1].model, None);

        config.override_model("groq=llama3-8b-8192").unwrap();
        assert_eq!(config.providers[0].model, None);
        assert_eq!(config.providers[1].model(), "llama3-8b-8192");

        assert!(matches!(
            config.override_model("gemini=gemini-1.5-pro-preview-0409"),
            Err(ConfigError::ProviderNotSelected(ProviderKind::Gemini))
        ));

        let mut single = BenchConfig {
            providers: vec![ProviderSettings::new(ProviderKind::Anthropic)],
            ..BenchConfig::default()
        };
        single.override_model("claude-3-opus-20240229").unwrap();
        assert_eq!(single.providers[0].model(), "claude-3-opus-20240229");
    }

    #[test]
    fn price_overrides_merge_over_builtin_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prices.yaml");
        fs::write(
            &path,
            "scripted:\n  inputCostPer1MTokens: 1.0\n  outputCostPer1MTokens: 2.0\n",
        )
        .unwrap();

        let config = BenchConfig {
            prices: Some(path),
            ..BenchConfig::default()
        };
        let table = config.price_table().unwrap();
        assert_eq!(table.get("scripted"), Some(&ModelPrice::new(1.0, 2.0)));
        assert!(table.get("llama3-70b-8192").is_some());
    }

    #[test]
    fn scripted_harness_needs_no_credentials() {
        let config = BenchConfig {
            providers: vec![ProviderSettings::new(ProviderKind::Scripted)],
            ..BenchConfig::default()
        };
        let harness = config.harness().unwrap();
        assert_eq!(harness.providers().len(), 1);
        assert_eq!(harness.providers()[0].label, "scripted");
        assert_eq!(harness.providers()[0].loop_config.model, "scripted");
    }
}
