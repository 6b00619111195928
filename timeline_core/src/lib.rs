//! Step timeline engine for agent-based simulation viewers.
//!
//! A server streams per-replica snapshots step by step. This crate stores
//! them in step-keyed replica timelines, accumulates the model's scalar
//! fields into series, and keeps the ingestion cursor (`live`) apart from the
//! playback cursor (`display`). [`ViewerSession`] ties that together with the
//! outbound command channel and playback.

pub mod commands;
pub mod config;
pub mod metrics;
mod series;
pub mod session;
mod step;
mod store;
pub mod timeline;

pub use commands::{CommandEmitter, CommandSink, EmitError};
pub use config::{load_viewer_config_from_env, ViewerConfig, ViewerConfigError, VIEWER_CONFIG_ENV};
pub use metrics::SessionMetrics;
pub use series::{accumulate, Accumulated, SchemaDrift, ScalarSeries, SeriesValue};
pub use session::{
    AdvanceResult, ConnectionState, DispatchError, DispatchOutcome, PlaybackState, SessionError,
    SessionEvent, ViewerSession,
};
pub use step::{Agent, AgentId, ModelSnapshot, ReplicaState, Scalar, SimulationStep, StateError};
pub use store::{ReplicaTimeline, StepStore, StoreError, UpsertOutcome};
pub use timeline::{
    Advance, StepOutcome, TimelineController, TimelineError, TimelinePhase, REORDER_WINDOW,
};
