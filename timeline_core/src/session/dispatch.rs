use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};
use viz_proto::{decode_server_message, DecodeError, EncodedJson, ServerMessage, CONNECTED_GREETING};

use super::ViewerSession;
use crate::commands::CommandSink;
use crate::step::{ReplicaState, StateError};
use crate::timeline::{StepOutcome, TimelineError};

#[derive(Debug)]
pub enum DispatchOutcome {
    /// Greeting or empty frame.
    Ignored,
    RunInitialized { replicas: usize, generation: u64 },
    Step(StepOutcome),
    /// A `model_state` from before the current run started.
    StaleDropped { step: u64 },
    RunEnded,
    ChartSpecs { count: usize },
    Parameters { count: usize },
    UnknownKind(String),
    Rejected(DispatchError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("chart spec #{index} is not valid JSON: {source}")]
    ChartSpec {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("state for replica {replica} is invalid: {source}")]
    State {
        replica: usize,
        #[source]
        source: StateError,
    },
    #[error(transparent)]
    Timeline(#[from] TimelineError),
}

impl<S: CommandSink> ViewerSession<S> {
    pub fn dispatch(&mut self, raw: &str) -> DispatchOutcome {
        self.dispatch_at(raw, Instant::now())
    }

    /// Decode one inbound frame and route it. Rejected frames leave all run
    /// state untouched.
    pub fn dispatch_at(&mut self, raw: &str, now: Instant) -> DispatchOutcome {
        self.metrics.frames_received += 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == CONNECTED_GREETING {
            debug!("frame.greeting");
            return DispatchOutcome::Ignored;
        }

        let message = match decode_server_message(trimmed) {
            Ok(message) => message,
            Err(DecodeError::UnknownKind(kind)) => {
                self.metrics.unknown_kinds += 1;
                warn!(%kind, "frame.unknown_kind");
                return DispatchOutcome::UnknownKind(kind);
            }
            Err(err) => return self.reject(err.into()),
        };

        match message {
            ServerMessage::Init { n_sims } => match self.start_run(n_sims) {
                Ok(generation) => DispatchOutcome::RunInitialized {
                    replicas: n_sims,
                    generation,
                },
                Err(err) => self.reject(err.into()),
            },
            ServerMessage::VegaSpecs { data, n_sims } => self.on_chart_specs(data, n_sims),
            ServerMessage::ModelState { step, data } => self.on_model_state(step, data, now),
            ServerMessage::End => {
                if !self.timeline.is_ready() {
                    debug!("frame.end_without_run");
                    return DispatchOutcome::Ignored;
                }
                self.end_run();
                DispatchOutcome::RunEnded
            }
            ServerMessage::ModelParams { data } => {
                let count = data.len();
                self.parameters = data;
                debug!(count, "parameters.replaced");
                DispatchOutcome::Parameters { count }
            }
        }
    }

    fn on_chart_specs(&mut self, data: Vec<EncodedJson>, n_sims: Option<usize>) -> DispatchOutcome {
        let specs = match data
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                spec.decode()
                    .map_err(|source| DispatchError::ChartSpec { index, source })
            })
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(specs) => specs,
            Err(err) => return self.reject(err),
        };

        if let Some(replicas) = n_sims {
            self.announced_replicas = Some(replicas);
            let matches_run =
                self.timeline.is_ready() && self.timeline.replica_count() == replicas;
            if !matches_run {
                if let Err(err) = self.start_run(replicas) {
                    return self.reject(err.into());
                }
            }
        }

        let count = specs.len();
        self.chart_specs = specs;
        info!(count, replicas = ?n_sims, "chart_specs.replaced");
        DispatchOutcome::ChartSpecs { count }
    }

    fn on_model_state(&mut self, step: u64, data: Vec<EncodedJson>, now: Instant) -> DispatchOutcome {
        let states = match data
            .iter()
            .enumerate()
            .map(|(replica, encoded)| {
                encoded
                    .decode()
                    .map_err(StateError::from)
                    .and_then(ReplicaState::from_json)
                    .map_err(|source| DispatchError::State { replica, source })
            })
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(states) => states,
            Err(err) => return self.reject(err),
        };

        if !self.timeline.is_ready() {
            if step != 0 {
                self.metrics.stale_dropped += 1;
                debug!(step, "frame.stale");
                return DispatchOutcome::StaleDropped { step };
            }
            let replicas = self.announced_replicas.unwrap_or(states.len());
            if let Err(err) = self.start_run(replicas) {
                return self.reject(err.into());
            }
        }

        match self.timeline.on_step_received(step, states) {
            Ok(outcome) => {
                self.record_outcome(&outcome, now);
                self.continue_playback(now);
                DispatchOutcome::Step(outcome)
            }
            Err(err) => self.reject(err.into()),
        }
    }

    fn reject(&mut self, err: DispatchError) -> DispatchOutcome {
        self.metrics.decode_errors += 1;
        warn!(error = %err, "frame.rejected");
        DispatchOutcome::Rejected(err)
    }
}
