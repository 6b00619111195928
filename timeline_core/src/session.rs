//! Run state for one viewer connection.
//!
//! `ViewerSession` is the only owner of the timeline, chart specs, parameter
//! descriptors, playback and the outstanding step request. Transports feed it
//! frames through [`ViewerSession::dispatch`]; user interfaces call its intent
//! methods and read its accessors.

mod dispatch;

use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::commands::{CommandEmitter, CommandSink, EmitError};
use crate::config::{ViewerConfig, MAX_PLAYBACK_INTERVAL_MS, MIN_PLAYBACK_INTERVAL_MS};
use crate::metrics::SessionMetrics;
use crate::step::SimulationStep;
use crate::timeline::{Advance, StepOutcome, TimelineController, TimelineError};

pub use dispatch::{DispatchError, DispatchOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Paused,
    Playing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    RunStarted { replicas: usize, generation: u64 },
    RunEnded { live_step: Option<u64> },
    RequestRetried { step: u64 },
    StepTimedOut { step: u64 },
    ConnectionChanged(ConnectionState),
    CommandFailed { kind: &'static str, error: String },
}

/// Result of a single forward move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceResult {
    /// Display moved through stored history.
    Moved(u64),
    /// A step request went out.
    Requested(u64),
    /// A request for this step is already outstanding.
    AwaitingStep(u64),
    /// The server has to produce the next step but there is no connection.
    Offline,
    Exhausted,
    NotReady,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no run in progress")]
    NotReady,
    #[error("replica {replica} out of range (run has {replicas} replicas)")]
    UnknownReplica { replica: usize, replicas: usize },
    #[error("not connected")]
    Offline,
    #[error(transparent)]
    Emit(#[from] EmitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingStep {
    step: u64,
    generation: u64,
    issued_at: Instant,
    retried: bool,
}

#[derive(Debug)]
pub struct ViewerSession<S> {
    config: ViewerConfig,
    timeline: TimelineController,
    emitter: CommandEmitter<S>,
    chart_specs: Vec<Value>,
    parameters: Vec<Value>,
    announced_replicas: Option<usize>,
    connection: ConnectionState,
    playback: PlaybackState,
    playback_interval: Duration,
    pending: Option<PendingStep>,
    reset_pending: bool,
    last_display_move: Option<Instant>,
    metrics: SessionMetrics,
    events: Vec<SessionEvent>,
}

impl<S: CommandSink> ViewerSession<S> {
    pub fn new(config: ViewerConfig, sink: S) -> Self {
        let playback_interval = config.playback_interval();
        Self {
            config,
            timeline: TimelineController::new(),
            emitter: CommandEmitter::new(sink),
            chart_specs: Vec::new(),
            parameters: Vec::new(),
            announced_replicas: None,
            connection: ConnectionState::Disconnected,
            playback: PlaybackState::Paused,
            playback_interval,
            pending: None,
            reset_pending: false,
            last_display_move: None,
            metrics: SessionMetrics::default(),
            events: Vec::new(),
        }
    }

    pub fn timeline(&self) -> &TimelineController {
        &self.timeline
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn chart_specs(&self) -> &[Value] {
        &self.chart_specs
    }

    pub fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn playback(&self) -> PlaybackState {
        self.playback
    }

    pub fn is_playing(&self) -> bool {
        self.playback == PlaybackState::Playing
    }

    pub fn playback_interval(&self) -> Duration {
        self.playback_interval
    }

    pub fn set_playback_interval(&mut self, interval: Duration) -> Duration {
        let millis = (interval.as_millis() as u64)
            .clamp(MIN_PLAYBACK_INTERVAL_MS, MAX_PLAYBACK_INTERVAL_MS);
        self.playback_interval = Duration::from_millis(millis);
        self.playback_interval
    }

    /// Step number of the outstanding request, if any.
    pub fn pending_step(&self) -> Option<u64> {
        self.pending.map(|pending| pending.step)
    }

    pub fn sink(&self) -> &S {
        self.emitter.sink()
    }

    pub fn sink_mut(&mut self) -> &mut S {
        self.emitter.sink_mut()
    }

    pub fn displayed(&self, replica: usize) -> Option<&Arc<SimulationStep>> {
        self.timeline.displayed(replica)
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        mem::take(&mut self.events)
    }

    pub fn on_connected(&mut self) {
        self.connection = ConnectionState::Connected;
        self.events
            .push(SessionEvent::ConnectionChanged(ConnectionState::Connected));
        info!(
            generation = self.timeline.generation(),
            live_step = ?self.timeline.live_step(),
            "session.connected"
        );
        let wants_reset =
            self.reset_pending || (self.config.reset_on_connect() && !self.timeline.is_ready());
        if wants_reset {
            self.send_reset();
        }
    }

    /// Keeps the timeline; only the outstanding request is dropped.
    pub fn on_disconnected(&mut self) {
        if self.connection == ConnectionState::Disconnected {
            return;
        }
        self.connection = ConnectionState::Disconnected;
        self.pending = None;
        self.events
            .push(SessionEvent::ConnectionChanged(ConnectionState::Disconnected));
        warn!(live_step = ?self.timeline.live_step(), "session.disconnected");
    }

    pub fn advance(&mut self, now: Instant) -> AdvanceResult {
        match self.timeline.request_advance() {
            Advance::Local(step) => {
                self.last_display_move = Some(now);
                AdvanceResult::Moved(step)
            }
            Advance::Exhausted => AdvanceResult::Exhausted,
            Advance::NotReady => AdvanceResult::NotReady,
            Advance::Fetch(step) => self.fetch(step, now),
        }
    }

    fn fetch(&mut self, step: u64, now: Instant) -> AdvanceResult {
        if let Some(pending) = self.pending {
            return AdvanceResult::AwaitingStep(pending.step);
        }
        if !self.is_connected() {
            return AdvanceResult::Offline;
        }
        if self
            .send("step", |emitter| emitter.request_step(step))
            .is_err()
        {
            return AdvanceResult::Offline;
        }
        self.pending = Some(PendingStep {
            step,
            generation: self.timeline.generation(),
            issued_at: now,
            retried: false,
        });
        debug!(step, "step.requested");
        AdvanceResult::Requested(step)
    }

    pub fn step_back(&mut self) -> Result<u64, TimelineError> {
        self.timeline.step_back()
    }

    pub fn set_display_step(&mut self, step: i64) -> Result<u64, TimelineError> {
        self.timeline.set_display_step(step)
    }

    pub fn jump_to_live(&mut self) -> Result<u64, TimelineError> {
        self.timeline.jump_to_live()
    }

    /// Start playback and take the first step right away.
    pub fn play(&mut self, now: Instant) -> AdvanceResult {
        let result = self.advance(now);
        match result {
            AdvanceResult::Exhausted | AdvanceResult::NotReady => {
                self.playback = PlaybackState::Paused;
            }
            _ => {
                self.playback = PlaybackState::Playing;
                info!(?result, "playback.started");
            }
        }
        result
    }

    /// Stop playback. An outstanding request is still honoured when it
    /// arrives; no new one is issued.
    pub fn pause(&mut self) {
        if self.is_playing() {
            info!(display_step = ?self.timeline.display_step(), "playback.paused");
        }
        self.playback = PlaybackState::Paused;
    }

    pub fn toggle_playback(&mut self, now: Instant) -> PlaybackState {
        if self.is_playing() {
            self.pause();
        } else {
            self.play(now);
        }
        self.playback
    }

    /// Drop the current run and ask the server for a new one. Returns whether
    /// the reset command went out; otherwise it is sent on the next
    /// connection.
    pub fn reset(&mut self) -> bool {
        self.timeline.reset();
        self.pending = None;
        self.pause();
        self.metrics.resets += 1;
        self.reset_pending = true;
        if !self.is_connected() {
            debug!("reset.deferred");
            return false;
        }
        self.send_reset()
    }

    /// Whether a reset is waiting for a connection.
    pub fn reset_pending(&self) -> bool {
        self.reset_pending
    }

    fn send_reset(&mut self) -> bool {
        let sent = self
            .send("reset", |emitter| emitter.request_reset())
            .is_ok();
        self.reset_pending = !sent;
        sent
    }

    /// Ask the server to invoke a model method on `replica`; the server
    /// answers by re-emitting its current step.
    pub fn call_method(
        &mut self,
        replica: usize,
        data: Map<String, Value>,
    ) -> Result<(), SessionError> {
        self.ensure_replica(replica)?;
        self.send("call_method", |emitter| {
            emitter.request_method_call(replica, data)
        })
    }

    pub fn key_event(&mut self, replica: usize, key: &str) -> Result<(), SessionError> {
        self.ensure_replica(replica)?;
        self.send("key_press", |emitter| {
            emitter.request_key_event(replica, key)
        })
    }

    /// Drive time-based behaviour: request timeouts and playback pacing.
    pub fn tick(&mut self, now: Instant) -> Option<AdvanceResult> {
        self.poll_timeout(now);
        if !self.is_playing() || self.pending.is_some() {
            return None;
        }
        match self.timeline.next_advance() {
            Advance::Local(_) => {
                let due = self
                    .last_display_move
                    .map_or(true, |last| now.duration_since(last) >= self.playback_interval);
                due.then(|| self.advance(now))
            }
            Advance::Fetch(_) if self.is_connected() => Some(self.advance(now)),
            Advance::Fetch(_) | Advance::NotReady => None,
            Advance::Exhausted => {
                info!("playback.exhausted");
                self.pause();
                None
            }
        }
    }

    /// Re-send an expired request once; a second expiry gives up and stops
    /// playback.
    pub fn poll_timeout(&mut self, now: Instant) {
        let Some(pending) = self.pending else {
            return;
        };
        if pending.generation != self.timeline.generation() {
            self.pending = None;
            return;
        }
        if now.duration_since(pending.issued_at) < self.config.step_timeout() {
            return;
        }
        if pending.retried {
            self.pending = None;
            self.metrics.step_timeouts += 1;
            self.events
                .push(SessionEvent::StepTimedOut { step: pending.step });
            warn!(step = pending.step, "step.timed_out");
            self.pause();
            return;
        }

        self.metrics.step_retries += 1;
        warn!(step = pending.step, "step.retrying");
        if self
            .send("step", |emitter| emitter.request_step(pending.step))
            .is_ok()
        {
            self.pending = Some(PendingStep {
                issued_at: now,
                retried: true,
                ..pending
            });
            self.events
                .push(SessionEvent::RequestRetried { step: pending.step });
        }
    }

    fn ensure_replica(&self, replica: usize) -> Result<(), SessionError> {
        if !self.timeline.is_ready() {
            return Err(SessionError::NotReady);
        }
        let replicas = self.timeline.replica_count();
        if replica >= replicas {
            return Err(SessionError::UnknownReplica { replica, replicas });
        }
        if !self.is_connected() {
            return Err(SessionError::Offline);
        }
        Ok(())
    }

    fn send<F>(&mut self, kind: &'static str, emit: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut CommandEmitter<S>) -> Result<(), EmitError>,
    {
        match emit(&mut self.emitter) {
            Ok(()) => {
                self.metrics.commands_sent += 1;
                Ok(())
            }
            Err(err) => {
                warn!(kind, error = %err, "command.failed");
                self.events.push(SessionEvent::CommandFailed {
                    kind,
                    error: err.to_string(),
                });
                if matches!(err, EmitError::Closed) {
                    self.on_disconnected();
                }
                Err(err.into())
            }
        }
    }

    fn start_run(&mut self, replicas: usize) -> Result<u64, TimelineError> {
        self.timeline.init(replicas)?;
        self.announced_replicas = Some(replicas);
        self.pending = None;
        let generation = self.timeline.generation();
        self.events.push(SessionEvent::RunStarted {
            replicas,
            generation,
        });
        Ok(generation)
    }

    fn record_outcome(&mut self, outcome: &StepOutcome, now: Instant) {
        match *outcome {
            StepOutcome::Applied {
                first,
                last,
                display_followed,
                drift,
            } => {
                self.metrics.steps_applied += last - first + 1;
                self.metrics.schema_drift += drift as u64;
                if display_followed {
                    self.last_display_move = Some(now);
                }
                if self.pending.is_some_and(|pending| last >= pending.step) {
                    self.pending = None;
                }
            }
            StepOutcome::Redelivered { changed, .. } => {
                self.metrics.redeliveries += 1;
                if changed {
                    self.metrics.divergent_redeliveries += 1;
                }
            }
            StepOutcome::Buffered { .. } => self.metrics.buffered_steps += 1,
        }
    }

    /// While playing, a fully applied step at the live edge immediately
    /// requests its successor.
    fn continue_playback(&mut self, now: Instant) {
        if !self.is_playing() || self.pending.is_some() || !self.is_connected() {
            return;
        }
        if let Advance::Fetch(_) = self.timeline.next_advance() {
            self.advance(now);
        }
    }

    fn end_run(&mut self) {
        self.timeline.on_run_end();
        self.pending = None;
        self.pause();
        self.events.push(SessionEvent::RunEnded {
            live_step: self.timeline.live_step(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use viz_proto::{decode_command_json, ClientCommand};

    fn connected_session() -> ViewerSession<Vec<String>> {
        let mut session = ViewerSession::new(ViewerConfig::default(), Vec::new());
        session.on_connected();
        session
    }

    fn sent(session: &ViewerSession<Vec<String>>) -> Vec<ClientCommand> {
        session
            .sink()
            .iter()
            .map(|frame| decode_command_json(frame).expect("command decodes"))
            .collect()
    }

    fn state_frame(step: u64, xs: &[i64]) -> String {
        let data: Vec<String> = xs
            .iter()
            .map(|x| json!({"running": true, "x": x, "agents": []}).to_string())
            .collect();
        json!({"type": "model_state", "step": step, "data": data}).to_string()
    }

    fn running_session(replicas: usize, last: u64) -> ViewerSession<Vec<String>> {
        let mut session = connected_session();
        session.dispatch(&json!({"type": "init", "n_sims": replicas}).to_string());
        for step in 0..=last {
            session.dispatch(&state_frame(step, &vec![step as i64; replicas]));
        }
        session.sink_mut().clear();
        session.take_events();
        session
    }

    #[test]
    fn first_connection_requests_a_reset() {
        let session = connected_session();
        assert_eq!(sent(&session), vec![ClientCommand::Reset {}]);
        assert_eq!(session.metrics().commands_sent, 1);
    }

    #[test]
    fn offline_reset_is_sent_on_reconnect_without_reset_on_connect() {
        let config =
            ViewerConfig::from_json_str(r#"{"reset_on_connect": false}"#).expect("config");
        let mut session = ViewerSession::new(config, Vec::new());
        session.on_connected();
        assert!(sent(&session).is_empty());
        session.dispatch(&json!({"type": "init", "n_sims": 1}).to_string());
        session.dispatch(&state_frame(0, &[1]));

        session.on_disconnected();
        assert!(!session.reset());
        assert!(session.reset_pending());
        assert!(sent(&session).is_empty());

        session.on_connected();
        assert_eq!(sent(&session), vec![ClientCommand::Reset {}]);
        assert!(!session.reset_pending());

        session.sink_mut().clear();
        session.on_disconnected();
        session.on_connected();
        assert!(sent(&session).is_empty());
    }

    #[test]
    fn reconnect_with_a_run_keeps_it() {
        let mut session = running_session(1, 3);
        session.on_disconnected();
        assert!(!session.is_connected());
        session.on_connected();
        assert!(sent(&session).is_empty());
        assert_eq!(session.timeline().live_step(), Some(3));
    }

    #[test]
    fn advance_at_live_edge_requests_once() {
        let mut session = running_session(1, 2);
        let now = Instant::now();
        assert_eq!(session.advance(now), AdvanceResult::Requested(3));
        assert_eq!(session.advance(now), AdvanceResult::AwaitingStep(3));
        assert_eq!(sent(&session), vec![ClientCommand::Step { step: 3 }]);
    }

    #[test]
    fn advance_offline_does_not_send() {
        let mut session = running_session(1, 2);
        session.on_disconnected();
        assert_eq!(session.advance(Instant::now()), AdvanceResult::Offline);
        session.set_display_step(0).expect("scrub");
        assert_eq!(session.advance(Instant::now()), AdvanceResult::Moved(1));
        assert!(sent(&session).is_empty());
    }

    #[test]
    fn playback_alternates_requests_and_steps() {
        let mut session = running_session(1, 0);
        let now = Instant::now();
        assert_eq!(session.play(now), AdvanceResult::Requested(1));
        assert_eq!(session.tick(now), None);

        session.dispatch_at(&state_frame(1, &[1]), now);
        assert_eq!(session.pending_step(), Some(2));
        assert_eq!(
            sent(&session),
            vec![ClientCommand::Step { step: 1 }, ClientCommand::Step { step: 2 }]
        );

        session.pause();
        session.dispatch_at(&state_frame(2, &[2]), now);
        assert_eq!(session.pending_step(), None);
        assert_eq!(sent(&session).len(), 2);
    }

    #[test]
    fn local_playback_is_paced_by_the_interval() {
        let mut session = running_session(1, 4);
        session.set_display_step(0).expect("scrub");
        let start = Instant::now();
        assert_eq!(session.play(start), AdvanceResult::Moved(1));
        assert_eq!(session.tick(start + Duration::from_millis(10)), None);
        let later = start + session.playback_interval();
        assert_eq!(session.tick(later), Some(AdvanceResult::Moved(2)));
        assert!(sent(&session).is_empty());
    }

    #[test]
    fn timeout_retries_once_then_gives_up() {
        let mut session = running_session(1, 0);
        let start = Instant::now();
        session.play(start);
        let timeout = session.config().step_timeout();

        session.poll_timeout(start + timeout);
        assert_eq!(
            session.take_events(),
            vec![SessionEvent::RequestRetried { step: 1 }]
        );
        assert_eq!(session.pending_step(), Some(1));

        session.poll_timeout(start + timeout * 2);
        assert_eq!(
            session.take_events(),
            vec![SessionEvent::StepTimedOut { step: 1 }]
        );
        assert_eq!(session.pending_step(), None);
        assert!(!session.is_playing());
        assert_eq!(session.metrics().step_timeouts, 1);
        assert_eq!(
            sent(&session),
            vec![ClientCommand::Step { step: 1 }, ClientCommand::Step { step: 1 }]
        );
    }

    #[test]
    fn reset_clears_the_run_and_the_request() {
        let mut session = running_session(2, 3);
        session.advance(Instant::now());
        assert!(session.reset());
        assert_eq!(session.pending_step(), None);
        assert!(!session.timeline().is_ready());
        assert_eq!(session.timeline().live_step(), None);
        assert_eq!(
            sent(&session),
            vec![ClientCommand::Step { step: 4 }, ClientCommand::Reset {}]
        );
    }

    #[test]
    fn method_calls_are_checked_against_the_run() {
        let mut session = connected_session();
        assert!(matches!(
            session.call_method(0, Map::new()),
            Err(SessionError::NotReady)
        ));

        let mut session = running_session(2, 0);
        assert!(matches!(
            session.key_event(2, "ArrowUp"),
            Err(SessionError::UnknownReplica {
                replica: 2,
                replicas: 2
            })
        ));
        session.key_event(1, "ArrowUp").expect("key event sent");
        assert_eq!(
            sent(&session),
            vec![ClientCommand::KeyPress {
                model_id: 1,
                data: viz_proto::KeyPayload {
                    key: "ArrowUp".into()
                }
            }]
        );
    }

    #[test]
    fn closed_sink_marks_the_session_disconnected() {
        let (sender, receiver) = crossbeam_channel::unbounded::<String>();
        let mut session = ViewerSession::new(ViewerConfig::default(), sender);
        session.on_connected();
        assert_eq!(receiver.try_recv().ok(), Some(r#"{"type":"reset","data":{}}"#.to_string()));
        drop(receiver);

        session.dispatch(&json!({"type": "init", "n_sims": 1}).to_string());
        session.dispatch(&state_frame(0, &[0]));
        assert_eq!(session.advance(Instant::now()), AdvanceResult::Offline);
        assert!(!session.is_connected());
        assert!(session
            .take_events()
            .iter()
            .any(|event| matches!(event, SessionEvent::CommandFailed { kind: "step", .. })));
    }

    #[test]
    fn playback_interval_is_clamped() {
        let mut session = connected_session();
        assert_eq!(
            session.set_playback_interval(Duration::from_millis(1)),
            Duration::from_millis(50)
        );
        assert_eq!(
            session.set_playback_interval(Duration::from_secs(60)),
            Duration::from_secs(5)
        );
    }
}
