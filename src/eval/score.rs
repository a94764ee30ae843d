use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::eval::scenario::{Scenario, ScenarioError};

/// Removes repeated names, keeping the first occurrence of each.
pub fn dedupe<S: AsRef<str>>(names: &[S]) -> Vec<&str> {
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|name| name.as_ref())
        .filter(|name| seen.insert(*name))
        .collect()
}

/// Share of distinct expected tools that appear among the distinct tools used.
///
/// Both lists are deduplicated, so the result lies in `[0, 1]` and equals `1.0` exactly when every
/// expected tool was invoked at least once.
pub fn tool_accuracy<U, E>(used: &[U], expected: &[E]) -> Result<f64, ScenarioError>
where
    U: AsRef<str>,
    E: AsRef<str>,
{
    let expected = dedupe(expected);
    if expected.is_empty() {
        return Err(ScenarioError::Invalid {
            id: String::new(),
            reason: "expected tool list is empty".into(),
        });
    }

    let used: HashSet<&str> = used.iter().map(|name| name.as_ref()).collect();
    let hits = expected.iter().filter(|name| used.contains(*name)).count();
    Ok(hits as f64 / expected.len() as f64)
}

/// Distinct expected tools hit, divided by the expected list's length as written. Repeated
/// expected names lower the ceiling below `1.0`; kept for comparison with published figures.
pub fn listed_tool_accuracy<U, E>(used: &[U], expected: &[E]) -> Result<f64, ScenarioError>
where
    U: AsRef<str>,
    E: AsRef<str>,
{
    if expected.is_empty() {
        return Err(ScenarioError::Invalid {
            id: String::new(),
            reason: "expected tool list is empty".into(),
        });
    }

    let expected_names: HashSet<&str> = expected.iter().map(|name| name.as_ref()).collect();
    let hits = dedupe(used)
        .into_iter()
        .filter(|name| expected_names.contains(name))
        .count();
    Ok(hits as f64 / expected.len() as f64)
}

/// Whether the last invoked tool is the expected final step; `false` when nothing was invoked.
pub fn ended_correctly<U: AsRef<str>>(used: &[U], expected_last_step: &str) -> bool {
    used.last()
        .is_some_and(|last| last.as_ref() == expected_last_step)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Over distinct expected tools; see [`tool_accuracy`].
    pub tool_accuracy: f64,
    /// Over the expected list as written; see [`listed_tool_accuracy`].
    pub listed_accuracy: f64,
    pub ended_correctly: bool,
}

pub fn evaluate<U: AsRef<str>>(scenario: &Scenario, used: &[U]) -> Result<Evaluation, ScenarioError> {
    let with_id = |err: ScenarioError| match err {
        ScenarioError::Invalid { reason, .. } => ScenarioError::Invalid {
            id: scenario.id.clone(),
            reason,
        },
        other => other,
    };
    let tool_accuracy = tool_accuracy(used, &scenario.expected_tools).map_err(with_id)?;
    let listed_accuracy = listed_tool_accuracy(used, &scenario.expected_tools).map_err(with_id)?;

    Ok(Evaluation {
        tool_accuracy,
        listed_accuracy,
        ended_correctly: ended_correctly(used, &scenario.expected_last_step),
    })
}
