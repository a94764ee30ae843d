//! Declarative tool catalog: stub tools described in YAML/JSON, registered into a
//! [`FunctionRegistry`] together with compiled argument validators.

use std::{collections::HashMap, fs, path::Path, sync::Arc};

use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    functions::{FunctionCall, FunctionDefinition, FunctionParameters, KernelFunction},
    FunctionRegistry, LLMError,
};

/// The RPA tool set shipped with the benchmark.
pub const BUILTIN_CATALOG: &str = include_str!("../catalog/rpa_tools.yaml");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse catalog YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse catalog JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid parameter schema for `{tool}`: {message}")]
    Schema { tool: String, message: String },
    #[error(transparent)]
    Registry(#[from] LLMError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<FunctionParameters>,
    #[serde(default)]
    pub fixtures: Vec<ToolFixture>,
    #[serde(default)]
    pub default: Option<ToolResultSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFixture {
    pub when: Value,
    pub then: ToolResultSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolResultSpec {
    Ok { value: Value },
    Err { message: String },
}

pub struct ToolCatalog {
    registry: FunctionRegistry,
    validators: HashMap<String, JSONSchema>,
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCatalog")
            .field("tools", &self.registry.names().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolCatalog {
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_yaml_str(BUILTIN_CATALOG)
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, CatalogError> {
        let document: CatalogDocument = serde_yaml::from_str(input)?;
        Self::from_specs(document.tools)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        let document: CatalogDocument = if ext == "json" {
            serde_json::from_slice(&bytes)?
        } else {
            serde_yaml::from_slice(&bytes)?
        };
        Self::from_specs(document.tools)
    }

    pub fn from_specs(specs: Vec<ToolSpec>) -> Result<Self, CatalogError> {
        let mut registry = FunctionRegistry::new();
        for spec in specs {
            registry.register(Arc::new(StubKernelFunction::new(spec)))?;
        }
        Self::from_registry(registry)
    }

    /// Wraps an existing registry, compiling a validator for every registered function.
    pub fn from_registry(registry: FunctionRegistry) -> Result<Self, CatalogError> {
        let mut validators = HashMap::new();
        for definition in registry.definitions() {
            let schema = definition.parameters_schema()?;
            let compiled = JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(&schema)
                .map_err(|e| CatalogError::Schema {
                    tool: definition.name.clone(),
                    message: e.to_string(),
                })?;
            validators.insert(definition.name, compiled);
        }
        Ok(Self {
            registry,
            validators,
        })
    }

    pub fn definitions(&self) -> Vec<FunctionDefinition> {
        self.registry.definitions()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Schema violations of `arguments` for the named tool. Unknown tools are reported through
    /// [`LLMError::UnknownFunction`] so callers can abort.
    pub fn validate(&self, name: &str, arguments: &Value) -> Result<Vec<String>, LLMError> {
        self.registry.lookup(name)?;
        let Some(schema) = self.validators.get(name) else {
            return Ok(Vec::new());
        };
        let violations = match schema.validate(arguments) {
            Ok(()) => Vec::new(),
            Err(errors) => errors.map(|e| e.to_string()).collect(),
        };
        Ok(violations)
    }

    pub async fn invoke(&self, call: &FunctionCall) -> Result<Value, LLMError> {
        self.registry.invoke(call).await
    }
}

#[derive(Clone)]
struct StubKernelFunction {
    definition: FunctionDefinition,
    fixtures: Vec<ToolFixture>,
    default: Option<ToolResultSpec>,
}

impl StubKernelFunction {
    fn new(tool: ToolSpec) -> Self {
        let mut definition = FunctionDefinition::new(tool.name);
        if let Some(description) = tool.description {
            definition = definition.with_description(description);
        }
        if let Some(parameters) = tool.parameters {
            definition = definition.with_parameters(parameters);
        }

        Self {
            definition,
            fixtures: tool.fixtures,
            default: tool.default,
        }
    }

    fn match_fixture<'a>(&'a self, args: &Value) -> Option<&'a ToolResultSpec> {
        self.fixtures
            .iter()
            .find(|fixture| value_is_subset(&fixture.when, args))
            .map(|fixture| &fixture.then)
            .or(self.default.as_ref())
    }
}

#[async_trait::async_trait]
impl KernelFunction for StubKernelFunction {
    fn definition(&self) -> FunctionDefinition {
        self.definition.clone()
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError> {
        tracing::info!(tool = %self.definition.name, %arguments, "stub tool invoked");

        let Some(result) = self.match_fixture(arguments) else {
            return Err(LLMError::FunctionExecution {
                function: self.definition.name.clone(),
                message: "no matching fixture and no default specified".to_string(),
            });
        };

        match result {
            ToolResultSpec::Ok { value } => Ok(value.clone()),
            ToolResultSpec::Err { message } => Err(LLMError::FunctionExecution {
                function: self.definition.name.clone(),
                message: message.clone(),
            }),
        }
    }
}

fn value_is_subset(expected: &Value, actual: &Value) -> bool {
    let (Value::Object(expected), Value::Object(actual)) = (expected, actual) else {
        return expected == actual;
    };
    expected
        .iter()
        .all(|(k, v)| actual.get(k).is_some_and(|av| value_is_subset(v, av)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn builtin_catalog_loads() {
        let catalog = ToolCatalog::builtin().expect("builtin catalog");
        for name in [
            "navigate_to_url",
            "extract_text",
            "click_element",
            "find_css_selector",
            "download_and_parse_pdf",
            "extract_specs_table",
            "upload_to_file_server",
            "upload_image_to_file_server",
            "handle_login",
        ] {
            assert!(catalog.contains(name), "missing {name}");
        }
        assert_eq!(catalog.len(), 30);
    }

    #[test]
    fn duplicate_tool_names_are_rejected() {
        let yaml = r#"
tools:
  - name: navigate_to_url
    default: { kind: ok, value: { success: true } }
  - name: navigate_to_url
    default: { kind: ok, value: { success: false } }
"#;
        let err = ToolCatalog::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Registry(LLMError::DuplicateFunction(ref name)) if name == "navigate_to_url"
        ));
    }

    #[tokio::test]
    async fn stubs_are_deterministic() {
        let catalog = ToolCatalog::builtin().unwrap();
        let call = FunctionCall::new("extract_text", json!({"selector": ".product"}));
        let first = catalog.invoke(&call).await.unwrap();
        let second = catalog.invoke(&call).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, json!("Product1: $23, Product2: $23, Product3: $232"));
    }

    #[tokio::test]
    async fn fixtures_match_on_argument_subset() {
        let catalog = ToolCatalog::builtin().unwrap();
        let login = catalog
            .invoke(&FunctionCall::new(
                "find_css_selector",
                json!({"element": "login button", "extra": 1}),
            ))
            .await
            .unwrap();
        assert_eq!(login, json!("#login-button"));

        let other = catalog
            .invoke(&FunctionCall::new("find_css_selector", json!({"element": "specs tab"})))
            .await
            .unwrap();
        assert_eq!(other, json!("#sdf123"));
    }

    #[tokio::test]
    async fn err_results_surface_as_execution_errors() {
        let yaml = r#"
tools:
  - name: solve_captcha
    default: { kind: err, message: captcha service unavailable }
"#;
        let catalog = ToolCatalog::from_yaml_str(yaml).unwrap();
        let err = catalog
            .invoke(&FunctionCall::new("solve_captcha", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::FunctionExecution { .. }));
    }

    #[test]
    fn validation_reports_missing_required_arguments() {
        let catalog = ToolCatalog::builtin().unwrap();
        assert!(catalog
            .validate("navigate_to_url", &json!({"url": "https://example.com"}))
            .unwrap()
            .is_empty());

        let violations = catalog.validate("navigate_to_url", &json!({})).unwrap();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("url"));

        assert!(matches!(
            catalog.validate("navigate", &json!({})),
            Err(LLMError::UnknownFunction { .. })
        ));
    }
}
