use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use viz_proto::fingerprint_json;

use crate::series::ScalarSeries;

/// Model-level value that can be plotted over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Scalar {
    /// Numeric view used by plots. Booleans map to 0/1, text has none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
            Scalar::Number(value) => Some(*value),
            Scalar::Text(_) => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(value) => write!(f, "{value}"),
            Scalar::Number(value) => write!(f, "{value}"),
            Scalar::Text(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentId {
    Int(i64),
    Text(String),
    /// Grid-position style ids such as `[x, y]`.
    Composite(Vec<i64>),
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentId::Int(id) => write!(f, "{id}"),
            AgentId::Text(id) => f.write_str(id),
            AgentId::Composite(parts) => {
                let joined: Vec<String> = parts.iter().map(i64::to_string).collect();
                write!(f, "({})", joined.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub unique_id: AgentId,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Model fields reported for a single step.
///
/// Scalars (including `null`, kept as `None`) feed the accumulated series;
/// arrays and objects are point-in-time only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSnapshot {
    pub scalars: BTreeMap<String, Option<Scalar>>,
    pub structured: Map<String, Value>,
}

impl ModelSnapshot {
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        let mut snapshot = ModelSnapshot::default();
        for (name, value) in fields {
            let scalar = match value {
                Value::Null => None,
                Value::Bool(flag) => Some(Scalar::Bool(flag)),
                Value::String(text) => Some(Scalar::Text(text)),
                Value::Number(number) => match number.as_f64() {
                    Some(value) => Some(Scalar::Number(value)),
                    None => {
                        snapshot.structured.insert(name, Value::Number(number));
                        continue;
                    }
                },
                other => {
                    snapshot.structured.insert(name, other);
                    continue;
                }
            };
            snapshot.scalars.insert(name, scalar);
        }
        snapshot
    }

    pub fn scalar(&self, field: &str) -> Option<&Scalar> {
        self.scalars.get(field).and_then(Option::as_ref)
    }

    /// The `running` flag every model reports.
    pub fn running(&self) -> Option<bool> {
        match self.scalar("running") {
            Some(Scalar::Bool(flag)) => Some(*flag),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("replica state is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("replica state must be a JSON object")]
    NotAnObject,
    #[error("`agents` must be an array")]
    AgentsNotArray,
    #[error("agent #{index} is invalid: {source}")]
    Agent {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// One replica's payload for a step, split into agent and model parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaState {
    pub agents: Vec<Agent>,
    pub model: ModelSnapshot,
    fingerprint: u64,
}

impl ReplicaState {
    pub fn from_json(value: Value) -> Result<Self, StateError> {
        let fingerprint = fingerprint_json(&value);
        let Value::Object(mut fields) = value else {
            return Err(StateError::NotAnObject);
        };
        let agents = match fields.remove("agents") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(entries)) => entries
                .into_iter()
                .enumerate()
                .map(|(index, entry)| {
                    serde_json::from_value(entry)
                        .map_err(|source| StateError::Agent { index, source })
                })
                .collect::<Result<Vec<Agent>, _>>()?,
            Some(_) => return Err(StateError::AgentsNotArray),
        };
        Ok(Self {
            agents,
            model: ModelSnapshot::from_fields(fields),
            fingerprint,
        })
    }

    pub fn parse_str(text: &str) -> Result<Self, StateError> {
        Self::from_json(serde_json::from_str(text)?)
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

/// Stored entity: one replica at one step.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationStep {
    step: u64,
    agents: Arc<[Agent]>,
    model: ModelSnapshot,
    series: ScalarSeries,
    fingerprint: u64,
}

impl SimulationStep {
    pub fn new(step: u64, state: ReplicaState, series: ScalarSeries) -> Self {
        Self {
            step,
            agents: state.agents.into(),
            model: state.model,
            series,
            fingerprint: state.fingerprint,
        }
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn model(&self) -> &ModelSnapshot {
        &self.model
    }

    pub fn series(&self) -> &ScalarSeries {
        &self.series
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Same snapshot with a re-derived series; the agent list is shared.
    pub fn with_series(&self, series: ScalarSeries) -> Self {
        Self {
            step: self.step,
            agents: Arc::clone(&self.agents),
            model: self.model.clone(),
            series,
            fingerprint: self.fingerprint,
        }
    }
}
