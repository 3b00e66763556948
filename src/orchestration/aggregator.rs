//! Combining results from several agents into one answer.

use crate::agent::AgentId;
use crate::error::{Error, Result};
use crate::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::collections::BTreeMap;
use tracing::debug;

/// One agent's answer with the agent's confidence in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub value: Payload,
    /// Always within [0, 1], including after deserializing.
    #[serde(deserialize_with = "deserialize_confidence")]
    confidence: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Payload>,
}

impl AgentResult {
    /// A result with full confidence.
    pub fn new(agent_id: impl Into<AgentId>, agent_type: &str, value: Payload) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.to_string(),
            value,
            confidence: 1.0,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

fn deserialize_confidence<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    f64::deserialize(deserializer).map(clamp_confidence)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Majority vote over discrete values.
    #[default]
    Consensus,
    /// Confidence-weighted mean of numbers.
    Weighted,
    /// Every value, as an array.
    Ensemble,
    /// The most confident value.
    Best,
    First,
    /// Key-by-key merge of object values.
    Merge,
}

impl std::str::FromStr for AggregationStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "consensus" => Ok(Self::Consensus),
            "weighted" => Ok(Self::Weighted),
            "ensemble" => Ok(Self::Ensemble),
            "best" => Ok(Self::Best),
            "first" => Ok(Self::First),
            "merge" => Ok(Self::Merge),
            other => Err(Error::Validation(format!(
                "unknown aggregation strategy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericMethod {
    Mean,
    Median,
    Min,
    Max,
    Sum,
}

impl std::str::FromStr for NumericMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" => Ok(Self::Mean),
            "median" => Ok(Self::Median),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "sum" => Ok(Self::Sum),
            other => Err(Error::Validation(format!("unknown numeric method '{}'", other))),
        }
    }
}

/// How strongly a set of results agree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgreementReport {
    /// Share of results equal to the majority value.
    pub agreement_level: f64,
    pub num_unique_values: usize,
    pub majority_value: Option<Payload>,
    pub majority_count: usize,
    pub total_results: usize,
    /// Distinct values with their counts, in first-seen order.
    pub value_distribution: Vec<(Payload, usize)>,
}

/// Combine `results` with `strategy`. `None` when there is nothing to combine.
pub fn aggregate(results: &[AgentResult], strategy: AggregationStrategy) -> Option<Payload> {
    match results {
        [] => None,
        [only] => Some(only.value.clone()),
        _ => {
            debug!(count = results.len(), ?strategy, "aggregating results");
            Some(match strategy {
                AggregationStrategy::Consensus => consensus(results),
                AggregationStrategy::Weighted => weighted(results),
                AggregationStrategy::Ensemble => {
                    Payload::Array(results.iter().map(|r| r.value.clone()).collect())
                }
                AggregationStrategy::Best => best(results)?.value.clone(),
                AggregationStrategy::First => results[0].value.clone(),
                AggregationStrategy::Merge => merge(results),
            })
        }
    }
}

fn is_discrete(value: &Payload) -> bool {
    match value {
        Payload::Null | Payload::Bool(_) | Payload::String(_) => true,
        Payload::Number(n) => n.is_i64() || n.is_u64(),
        _ => false,
    }
}

/// Distinct values with counts, in first-seen order.
fn tally<'a>(values: impl Iterator<Item = &'a Payload>) -> Vec<(Payload, usize)> {
    let mut counts: Vec<(Payload, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(v, _)| v == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((value.clone(), 1)),
        }
    }
    counts
}

/// The most frequent entry; ties go to the first seen.
fn majority(counts: &[(Payload, usize)]) -> Option<&(Payload, usize)> {
    counts
        .iter()
        .fold(None, |best: Option<&(Payload, usize)>, entry| match best {
            Some(b) if b.1 >= entry.1 => Some(b),
            _ => Some(entry),
        })
}

fn consensus(results: &[AgentResult]) -> Payload {
    if !results.iter().all(|r| is_discrete(&r.value)) {
        return weighted(results);
    }
    let counts = tally(results.iter().map(|r| &r.value));
    majority(&counts)
        .map(|(value, _)| value.clone())
        .unwrap_or(Payload::Null)
}

fn weighted(results: &[AgentResult]) -> Payload {
    let numbers: Option<Vec<(f64, f64)>> = results
        .iter()
        .map(|r| r.value.as_f64().map(|v| (v, r.confidence)))
        .collect();

    if let Some(numbers) = numbers {
        let total: f64 = numbers.iter().map(|(_, c)| c).sum();
        if total > 0.0 {
            let sum: f64 = numbers.iter().map(|(v, c)| v * c).sum();
            return json!(sum / total);
        }
    }

    best(results)
        .map(|r| r.value.clone())
        .unwrap_or(Payload::Null)
}

/// Highest confidence; the first result wins ties.
fn best(results: &[AgentResult]) -> Option<&AgentResult> {
    results.iter().fold(None, |best: Option<&AgentResult>, r| match best {
        Some(b) if b.confidence >= r.confidence => Some(b),
        _ => Some(r),
    })
}

fn merge(results: &[AgentResult]) -> Payload {
    let mut merged = Map::new();

    for result in results {
        let Payload::Object(fields) = &result.value else {
            merged.insert(result.agent_type.clone(), result.value.clone());
            continue;
        };
        for (key, value) in fields {
            match merged.get_mut(key) {
                None => {
                    merged.insert(key.clone(), value.clone());
                }
                Some(Payload::Array(existing)) => match value {
                    Payload::Array(more) => existing.extend(more.iter().cloned()),
                    other => existing.push(other.clone()),
                },
                Some(existing) => {
                    let previous = existing.take();
                    *existing = Payload::Array(vec![previous, value.clone()]);
                }
            }
        }
    }

    Payload::Object(merged)
}

/// Reduce the numeric values among `results`; 0.0 when there are none.
pub fn aggregate_numeric(results: &[AgentResult], method: NumericMethod) -> f64 {
    let mut values: Vec<f64> = results.iter().filter_map(|r| r.value.as_f64()).collect();
    if values.is_empty() {
        debug!("no numeric values to aggregate");
        return 0.0;
    }

    match method {
        NumericMethod::Mean => values.iter().sum::<f64>() / values.len() as f64,
        NumericMethod::Median => {
            values.sort_by(f64::total_cmp);
            let mid = values.len() / 2;
            if values.len() % 2 == 0 {
                (values[mid - 1] + values[mid]) / 2.0
            } else {
                values[mid]
            }
        }
        NumericMethod::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        NumericMethod::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        NumericMethod::Sum => values.iter().sum(),
    }
}

/// Flatten array values (non-arrays are taken as single items), optionally
/// dropping repeats while keeping first occurrences.
pub fn aggregate_lists(results: &[AgentResult], unique: bool) -> Vec<Payload> {
    let mut combined = Vec::new();
    for result in results {
        match &result.value {
            Payload::Array(items) => combined.extend(items.iter().cloned()),
            other => combined.push(other.clone()),
        }
    }

    if unique {
        let mut deduped: Vec<Payload> = Vec::with_capacity(combined.len());
        for item in combined {
            if !deduped.contains(&item) {
                deduped.push(item);
            }
        }
        return deduped;
    }
    combined
}

/// The most confident value, if its confidence reaches `threshold`.
pub fn confident_result(results: &[AgentResult], threshold: f64) -> Option<Payload> {
    let best = best(results)?;
    if best.confidence >= threshold {
        Some(best.value.clone())
    } else {
        debug!(confidence = best.confidence, threshold, "best result below threshold");
        None
    }
}

pub fn analyze_agreement(results: &[AgentResult]) -> AgreementReport {
    let counts = tally(results.iter().map(|r| &r.value));
    if results.len() < 2 {
        return AgreementReport {
            agreement_level: 1.0,
            num_unique_values: results.len(),
            majority_value: results.first().map(|r| r.value.clone()),
            majority_count: results.len(),
            total_results: results.len(),
            value_distribution: counts,
        };
    }

    let (majority_value, majority_count) = majority(&counts)
        .map(|(v, c)| (Some(v.clone()), *c))
        .unwrap_or((None, 0));

    AgreementReport {
        agreement_level: majority_count as f64 / results.len() as f64,
        num_unique_values: counts.len(),
        majority_value,
        majority_count,
        total_results: results.len(),
        value_distribution: counts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(agent: &str, value: Payload, confidence: f64) -> AgentResult {
        AgentResult::new(agent, agent, value).with_confidence(confidence)
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(result("a", json!(1), 1.7).confidence(), 1.0);
        assert_eq!(result("a", json!(1), -0.2).confidence(), 0.0);
        assert_eq!(result("a", json!(1), f64::NAN).confidence(), 0.0);
    }

    #[test]
    fn test_deserialized_confidence_is_clamped() {
        let mut raw = serde_json::to_value(AgentResult::new("a", "judge", json!("yes"))).unwrap();
        raw["confidence"] = json!(3.0);
        let high: AgentResult = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(high.confidence(), 1.0);

        raw["confidence"] = json!(-4.5);
        let low: AgentResult = serde_json::from_value(raw).unwrap();
        assert_eq!(low.confidence(), 0.0);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "Merge".parse::<AggregationStrategy>().unwrap(),
            AggregationStrategy::Merge
        );
        assert!("vote".parse::<AggregationStrategy>().is_err());
        assert_eq!("median".parse::<NumericMethod>().unwrap(), NumericMethod::Median);
    }

    #[test]
    fn test_empty_and_single() {
        assert_eq!(aggregate(&[], AggregationStrategy::Best), None);
        let single = [result("a", json!("only"), 0.1)];
        assert_eq!(aggregate(&single, AggregationStrategy::Merge), Some(json!("only")));
    }

    #[test]
    fn test_consensus_majority() {
        let results = [
            result("a", json!("yes"), 0.9),
            result("b", json!("no"), 0.9),
            result("c", json!("no"), 0.2),
        ];
        assert_eq!(aggregate(&results, AggregationStrategy::Consensus), Some(json!("no")));
    }

    #[test]
    fn test_consensus_tie_goes_to_first_seen() {
        let results = [
            result("a", json!(1), 1.0),
            result("b", json!(2), 1.0),
            result("c", json!(2), 1.0),
            result("d", json!(1), 1.0),
        ];
        assert_eq!(aggregate(&results, AggregationStrategy::Consensus), Some(json!(1)));
    }

    #[test]
    fn test_consensus_falls_back_to_weighted() {
        let results = [result("a", json!(1.0), 1.0), result("b", json!(3.0), 1.0)];
        assert_eq!(aggregate(&results, AggregationStrategy::Consensus), Some(json!(2.0)));
    }

    #[test]
    fn test_weighted_mean() {
        let results = [result("a", json!(10), 0.75), result("b", json!(20), 0.25)];
        assert_eq!(aggregate(&results, AggregationStrategy::Weighted), Some(json!(12.5)));
    }

    #[test]
    fn test_weighted_non_numeric_takes_most_confident() {
        let results = [
            result("a", json!({"k": 1}), 0.4),
            result("b", json!({"k": 2}), 0.8),
        ];
        assert_eq!(
            aggregate(&results, AggregationStrategy::Weighted),
            Some(json!({"k": 2}))
        );
    }

    #[test]
    fn test_weighted_zero_confidence_takes_first() {
        let results = [result("a", json!(1), 0.0), result("b", json!(5), 0.0)];
        assert_eq!(aggregate(&results, AggregationStrategy::Weighted), Some(json!(1)));
    }

    #[test]
    fn test_ensemble_first_and_best() {
        let results = [
            result("a", json!("x"), 0.5),
            result("b", json!("y"), 0.9),
            result("c", json!("z"), 0.9),
        ];
        assert_eq!(
            aggregate(&results, AggregationStrategy::Ensemble),
            Some(json!(["x", "y", "z"]))
        );
        assert_eq!(aggregate(&results, AggregationStrategy::First), Some(json!("x")));
        assert_eq!(aggregate(&results, AggregationStrategy::Best), Some(json!("y")));
    }

    #[test]
    fn test_merge() {
        let results = [
            result("researcher", json!({"facts": ["a"], "title": "T1", "n": 1}), 1.0),
            result("checker", json!({"facts": ["b", "c"], "title": "T2"}), 1.0),
            result("writer", json!("free text"), 1.0),
            result("editor", json!({"facts": "d", "title": "T3"}), 1.0),
        ];

        let merged = aggregate(&results, AggregationStrategy::Merge).unwrap();

        assert_eq!(merged["facts"], json!(["a", "b", "c", "d"]));
        assert_eq!(merged["title"], json!(["T1", "T2", "T3"]));
        assert_eq!(merged["n"], json!(1));
        assert_eq!(merged["writer"], json!("free text"));
    }

    #[test]
    fn test_aggregate_numeric() {
        let results = [
            result("a", json!(4), 1.0),
            result("b", json!(1), 1.0),
            result("c", json!("skip"), 1.0),
            result("d", json!(2.5), 1.0),
            result("e", json!(8), 1.0),
        ];

        assert_eq!(aggregate_numeric(&results, NumericMethod::Sum), 15.5);
        assert_eq!(aggregate_numeric(&results, NumericMethod::Mean), 3.875);
        assert_eq!(aggregate_numeric(&results, NumericMethod::Median), 3.25);
        assert_eq!(aggregate_numeric(&results, NumericMethod::Min), 1.0);
        assert_eq!(aggregate_numeric(&results, NumericMethod::Max), 8.0);
        assert_eq!(aggregate_numeric(&results[2..3], NumericMethod::Mean), 0.0);
    }

    #[test]
    fn test_aggregate_lists() {
        let results = [
            result("a", json!(["x", "y"]), 1.0),
            result("b", json!("y"), 1.0),
            result("c", json!(["z", {"k": 1}, {"k": 1}]), 1.0),
        ];

        assert_eq!(aggregate_lists(&results, false).len(), 6);
        assert_eq!(
            aggregate_lists(&results, true),
            vec![json!("x"), json!("y"), json!("z"), json!({"k": 1})]
        );
    }

    #[test]
    fn test_confident_result() {
        let results = [result("a", json!("low"), 0.3), result("b", json!("high"), 0.7)];
        assert_eq!(confident_result(&results, 0.5), Some(json!("high")));
        assert_eq!(confident_result(&results, 0.8), None);
        assert_eq!(confident_result(&[], 0.0), None);
    }

    #[test]
    fn test_analyze_agreement() {
        let results = [
            result("a", json!("yes"), 1.0),
            result("b", json!("yes"), 1.0),
            result("c", json!("no"), 1.0),
            result("d", json!("yes"), 1.0),
        ];

        let report = analyze_agreement(&results);

        assert_eq!(report.agreement_level, 0.75);
        assert_eq!(report.num_unique_values, 2);
        assert_eq!(report.majority_value, Some(json!("yes")));
        assert_eq!(report.majority_count, 3);
        assert_eq!(report.total_results, 4);
        assert_eq!(
            report.value_distribution,
            vec![(json!("yes"), 3), (json!("no"), 1)]
        );
    }

    #[test]
    fn test_analyze_agreement_small_inputs() {
        let empty = analyze_agreement(&[]);
        assert_eq!(empty.agreement_level, 1.0);
        assert_eq!(empty.majority_value, None);

        let one = analyze_agreement(&[result("a", json!(7), 1.0)]);
        assert_eq!(one.agreement_level, 1.0);
        assert_eq!(one.majority_value, Some(json!(7)));
    }
}
