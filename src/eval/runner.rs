use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use chrono::Utc;
use futures_util::{stream, StreamExt};

use crate::{
    agent_loop::{AgentLoop, FailureKind, LoopConfig, LoopGuard},
    catalog::ToolCatalog,
    eval::{
        report::{CompletedRun, RunOutcome, RunResult},
        scenario::{PromptTemplate, Scenario, ScenarioError},
        score::evaluate,
    },
    pricing::PriceTable,
    providers::scripted::ScriptedProvider,
    LLMProvider,
};

/// Where a provider entry gets its model from for a given scenario.
#[derive(Clone)]
pub enum ProviderSource {
    Shared(Arc<dyn LLMProvider>),
    /// Replays the scenario's own `scripted` turns.
    Scripted,
}

impl ProviderSource {
    fn provider_for(&self, scenario: &Scenario) -> Arc<dyn LLMProvider> {
        match self {
            Self::Shared(provider) => Arc::clone(provider),
            Self::Scripted => Arc::new(ScriptedProvider::from_scripted_turns(
                scenario.scripted.clone(),
            )),
        }
    }
}

#[derive(Clone)]
pub struct ProviderEntry {
    /// Name used in reports and output file names.
    pub label: String,
    pub source: ProviderSource,
    pub loop_config: LoopConfig,
}

impl ProviderEntry {
    pub fn new(label: impl Into<String>, source: ProviderSource, loop_config: LoopConfig) -> Self {
        Self {
            label: label.into(),
            source,
            loop_config,
        }
    }
}

/// Runs every scenario against every provider entry and collects one [`RunResult`] per pair.
pub struct Harness {
    catalog: Arc<ToolCatalog>,
    prices: Arc<PriceTable>,
    template: Arc<PromptTemplate>,
    providers: Vec<ProviderEntry>,
    concurrency: usize,
    guard_on_last_step: bool,
    fail_fast: bool,
}

impl Harness {
    pub fn new(catalog: Arc<ToolCatalog>, prices: Arc<PriceTable>) -> Result<Self, ScenarioError> {
        Ok(Self {
            catalog,
            prices,
            template: Arc::new(PromptTemplate::builtin()?),
            providers: Vec::new(),
            concurrency: 1,
            guard_on_last_step: true,
            fail_fast: false,
        })
    }

    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = Arc::new(template);
        self
    }

    pub fn with_provider(mut self, entry: ProviderEntry) -> Self {
        self.providers.push(entry);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Stop each run right after the scenario's expected last step unless a guard is configured.
    pub fn with_guard_on_last_step(mut self, enabled: bool) -> Self {
        self.guard_on_last_step = enabled;
        self
    }

    /// Skip runs not yet started once any run has failed.
    pub fn with_fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    pub fn providers(&self) -> &[ProviderEntry] {
        &self.providers
    }

    /// Results come back in scenario-major, provider-minor order regardless of completion order.
    pub async fn run(&self, scenarios: &[Scenario]) -> Vec<RunResult> {
        let aborted = AtomicBool::new(false);
        let jobs = scenarios
            .iter()
            .flat_map(|scenario| self.providers.iter().map(move |entry| (scenario, entry)))
            .enumerate();

        let mut results: Vec<(usize, RunResult)> = stream::iter(jobs)
            .map(|(index, (scenario, entry))| {
                let aborted = &aborted;
                async move {
                    if self.fail_fast && aborted.load(Ordering::SeqCst) {
                        tracing::debug!(scenario = %scenario.id, provider = %entry.label, "skipped after failure");
                        return None;
                    }
                    let result = self.run_one(scenario, entry).await;
                    if result.failure().is_some() {
                        aborted.store(true, Ordering::SeqCst);
                    }
                    Some((index, result))
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|result| async move { result })
            .collect()
            .await;

        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    pub async fn run_one(&self, scenario: &Scenario, entry: &ProviderEntry) -> RunResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let outcome = self.execute(scenario, entry).await;

        if let RunOutcome::Failed { kind, message } = &outcome {
            tracing::warn!(
                scenario = %scenario.id,
                provider = %entry.label,
                %kind,
                %message,
                "run failed"
            );
        }

        RunResult {
            scenario_id: scenario.id.clone(),
            level: scenario.level,
            provider: entry.label.clone(),
            model: entry.loop_config.model.clone(),
            started_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
            outcome,
        }
    }

    async fn execute(&self, scenario: &Scenario, entry: &ProviderEntry) -> RunOutcome {
        let invalid = |err: ScenarioError| RunOutcome::Failed {
            kind: FailureKind::InvalidScenario,
            message: err.to_string(),
        };

        if let Err(err) = scenario.validate(Some(&self.catalog)) {
            return invalid(err);
        }
        let prompt = match self.template.render(scenario) {
            Ok(prompt) => prompt,
            Err(err) => return invalid(err),
        };

        let mut config = entry.loop_config.clone();
        if self.guard_on_last_step && matches!(config.guard, LoopGuard::None) {
            config.guard = LoopGuard::stop_after(scenario.expected_last_step.clone());
        }
        let model = config.model.clone();

        let provider = entry.source.provider_for(scenario);
        let trace = match AgentLoop::new(config)
            .run(provider.as_ref(), &self.catalog, prompt)
            .await
        {
            Ok(trace) => trace,
            Err(err) => {
                return RunOutcome::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                }
            }
        };

        let evaluation = match evaluate(scenario, &trace.tools_used()) {
            Ok(evaluation) => evaluation,
            Err(err) => return invalid(err),
        };

        let (cost, pricing_error) = match trace.usage.cost(&model, &self.prices) {
            Ok(cost) => (Some(cost), None),
            Err(err) => {
                tracing::warn!(%model, %err, "run completed without a cost estimate");
                (None, Some(err.to_string()))
            }
        };

        tracing::info!(
            scenario = %scenario.id,
            provider = %entry.label,
            tool_accuracy = evaluation.tool_accuracy,
            ended_correctly = evaluation.ended_correctly,
            "run evaluated"
        );

        RunOutcome::Completed(CompletedRun {
            usage: trace.total_usage(),
            tool_calls: trace.tool_calls,
            final_text: trace.final_text,
            termination: trace.termination,
            narration: trace.narration,
            turns: trace.turns,
            cost,
            pricing_error,
            evaluation,
        })
    }
}
