use std::{collections::HashSet, fmt, fs, path::Path};

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::{catalog::ToolCatalog, providers::scripted::ScriptedTurn};

/// Built-in RPA scenarios plus one offline-scripted smoke scenario.
pub const BUILTIN_SCENARIOS: &str = include_str!("../../scenarios/rpa_scenarios.yaml");

/// Task prompt followed by the pretty-printed parameter block, when there is one.
pub const DEFAULT_PROMPT_TEMPLATE: &str =
    "{{prompt}}{{#if parameters}}\n\nAdditional Parameters:\n{{parameters}}{{/if}}";

const TEMPLATE_NAME: &str = "prompt";

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read scenarios: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse scenario YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse scenario JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("scenario `{id}` is invalid: {reason}")]
    Invalid { id: String, reason: String },
    #[error("duplicate scenario id: {0}")]
    DuplicateId(String),
    #[error("invalid prompt template: {0}")]
    Template(#[from] handlebars::TemplateError),
    #[error("failed to render prompt: {0}")]
    Render(#[from] handlebars::RenderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Easy,
    Medium,
    Hard,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    #[serde(alias = "query")]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(alias = "expectedTools")]
    pub expected_tools: Vec<String>,
    #[serde(alias = "expectedLastStep")]
    pub expected_last_step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<Level>,
    /// Canned replies for the offline scripted provider.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scripted: Vec<ScriptedTurn>,
}

impl Scenario {
    /// Structural checks plus, when a catalog is given, that every expected tool exists in it.
    pub fn validate(&self, catalog: Option<&ToolCatalog>) -> Result<(), ScenarioError> {
        let invalid = |reason: String| ScenarioError::Invalid {
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty".into()));
        }
        if self.prompt.trim().is_empty() {
            return Err(invalid("prompt must not be empty".into()));
        }
        if self.expected_tools.is_empty() {
            return Err(invalid("expected_tools must not be empty".into()));
        }
        if self.expected_last_step.trim().is_empty() {
            return Err(invalid("expected_last_step must not be empty".into()));
        }

        if let Some(catalog) = catalog {
            let unknown = self
                .expected_tools
                .iter()
                .chain(std::iter::once(&self.expected_last_step))
                .find(|tool| !catalog.contains(tool));
            if let Some(tool) = unknown {
                return Err(invalid(format!("expects unknown tool `{tool}`")));
            }
        }

        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScenarioFile {
    Many { scenarios: Vec<Scenario> },
    List(Vec<Scenario>),
    One(Scenario),
}

impl ScenarioFile {
    fn into_vec(self) -> Vec<Scenario> {
        match self {
            Self::Many { scenarios } | Self::List(scenarios) => scenarios,
            Self::One(scenario) => vec![scenario],
        }
    }
}

pub fn builtin_scenarios() -> Result<Vec<Scenario>, ScenarioError> {
    let file: ScenarioFile = serde_yaml::from_str(BUILTIN_SCENARIOS)?;
    let scenarios = file.into_vec();
    ensure_unique(&scenarios)?;
    Ok(scenarios)
}

/// Loads a scenario file, or every `.yaml`/`.yml`/`.json` file in a directory sorted by id.
pub fn load_scenarios(path: impl AsRef<Path>) -> Result<Vec<Scenario>, ScenarioError> {
    let path = path.as_ref();
    let scenarios = if path.is_dir() {
        let mut scenarios = Vec::new();
        for entry in fs::read_dir(path)? {
            let p = entry?.path();
            let ext = p.extension().and_then(|s| s.to_str()).unwrap_or("");
            if !matches!(ext, "yaml" | "yml" | "json") {
                continue;
            }
            scenarios.extend(read_file(&p)?);
        }
        scenarios.sort_by(|a, b| a.id.cmp(&b.id));
        scenarios
    } else {
        read_file(path)?
    };

    ensure_unique(&scenarios)?;
    Ok(scenarios)
}

fn read_file(path: &Path) -> Result<Vec<Scenario>, ScenarioError> {
    let bytes = fs::read(path)?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let file: ScenarioFile = if ext == "json" {
        serde_json::from_slice(&bytes)?
    } else {
        serde_yaml::from_slice(&bytes)?
    };
    Ok(file.into_vec())
}

fn ensure_unique(scenarios: &[Scenario]) -> Result<(), ScenarioError> {
    let mut seen = HashSet::new();
    for scenario in scenarios {
        if !seen.insert(scenario.id.as_str()) {
            return Err(ScenarioError::DuplicateId(scenario.id.clone()));
        }
    }
    Ok(())
}

/// Keeps scenarios whose id contains any of `filters`; no filters keeps everything.
pub fn filter_scenarios(mut scenarios: Vec<Scenario>, filters: &[String]) -> Vec<Scenario> {
    if filters.is_empty() {
        return scenarios;
    }
    scenarios.retain(|s| filters.iter().any(|f| s.id.contains(f.as_str())));
    scenarios
}

/// Renders the user turn for a scenario. Template variables: `prompt` and `parameters`
/// (pretty-printed JSON, absent when the scenario has none).
#[derive(Debug)]
pub struct PromptTemplate {
    registry: Handlebars<'static>,
}

impl PromptTemplate {
    pub fn new(source: &str) -> Result<Self, ScenarioError> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_template_string(TEMPLATE_NAME, source)?;
        Ok(Self { registry })
    }

    pub fn builtin() -> Result<Self, ScenarioError> {
        Self::new(DEFAULT_PROMPT_TEMPLATE)
    }

    pub fn render(&self, scenario: &Scenario) -> Result<String, ScenarioError> {
        let parameters = scenario
            .parameters
            .as_ref()
            .map(|params| serde_json::to_string_pretty(params))
            .transpose()?;
        let data = json!({
            "id": scenario.id,
            "prompt": scenario.prompt,
            "parameters": parameters,
        });
        Ok(self.registry.render(TEMPLATE_NAME, &data)?)
    }
}
