//! Two-cursor timeline: `live` follows ingestion, `display` follows the user.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::series::{accumulate, SchemaDrift, ScalarSeries};
use crate::step::{ReplicaState, SimulationStep};
use crate::store::{StepStore, StoreError, UpsertOutcome};

/// How far past the awaited step an out-of-order step may arrive and still
/// be held for later.
pub const REORDER_WINDOW: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelinePhase {
    Uninitialized,
    Ready,
}

/// What moving one step forward means right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The step is already stored; only the display cursor moves.
    Local(u64),
    /// Local history is exhausted; the server must produce this step.
    Fetch(u64),
    /// The run has ended and the display is at the live edge.
    Exhausted,
    NotReady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Steps `first..=last` were appended (more than one when buffered
    /// successors were drained).
    Applied {
        first: u64,
        last: u64,
        display_followed: bool,
        drift: usize,
    },
    /// A step at or below `live` arrived again.
    Redelivered { step: u64, changed: bool },
    /// Arrived ahead of `awaiting`; held until the gap fills.
    Buffered { step: u64, awaiting: u64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimelineError {
    #[error("timeline has not been initialized")]
    NotReady,
    #[error("no steps received yet")]
    NoSteps,
    #[error("a run needs at least one replica")]
    EmptyRun,
    #[error("expected {expected} replica states, received {received}")]
    ReplicaCountMismatch { expected: usize, received: usize },
    #[error("step {step} is too far ahead of awaited step {awaiting}")]
    TooFarAhead { step: u64, awaiting: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub struct TimelineController {
    phase: TimelinePhase,
    store: StepStore,
    live_step: Option<u64>,
    display_step: Option<u64>,
    run_ended: bool,
    generation: u64,
    reorder: BTreeMap<u64, Vec<ReplicaState>>,
}

impl Default for TimelineController {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelineController {
    pub fn new() -> Self {
        Self {
            phase: TimelinePhase::Uninitialized,
            store: StepStore::default(),
            live_step: None,
            display_step: None,
            run_ended: false,
            generation: 0,
            reorder: BTreeMap::new(),
        }
    }

    pub fn phase(&self) -> TimelinePhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == TimelinePhase::Ready
    }

    /// Highest step received in the current run; `None` before any data.
    pub fn live_step(&self) -> Option<u64> {
        self.live_step
    }

    /// Step shown to the user; `None` before any data.
    pub fn display_step(&self) -> Option<u64> {
        self.display_step
    }

    pub fn run_ended(&self) -> bool {
        self.run_ended
    }

    /// Bumped on every init and reset.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn replica_count(&self) -> usize {
        self.store.replica_count()
    }

    pub fn store(&self) -> &StepStore {
        &self.store
    }

    pub fn buffered_steps(&self) -> usize {
        self.reorder.len()
    }

    pub fn is_caught_up(&self) -> bool {
        self.display_step == self.live_step
    }

    pub fn displayed(&self, replica: usize) -> Option<&Arc<SimulationStep>> {
        self.display_step
            .and_then(|step| self.store.get_by_step(replica, step))
    }

    pub fn init(&mut self, replicas: usize) -> Result<(), TimelineError> {
        if replicas == 0 {
            return Err(TimelineError::EmptyRun);
        }
        self.store = StepStore::with_replicas(replicas);
        self.clear_run_state();
        self.phase = TimelinePhase::Ready;
        info!(
            replicas,
            generation = self.generation,
            "timeline.initialized"
        );
        Ok(())
    }

    pub fn reset(&mut self) {
        self.store = StepStore::default();
        self.clear_run_state();
        self.phase = TimelinePhase::Uninitialized;
        info!(generation = self.generation, "timeline.reset");
    }

    fn clear_run_state(&mut self) {
        self.live_step = None;
        self.display_step = None;
        self.run_ended = false;
        self.reorder.clear();
        self.generation += 1;
    }

    pub fn on_run_end(&mut self) {
        if !self.is_ready() {
            debug!("run end ignored: timeline not initialized");
            return;
        }
        self.run_ended = true;
        info!(live_step = ?self.live_step, "timeline.run_ended");
    }

    pub fn on_step_received(
        &mut self,
        step: u64,
        payloads: Vec<ReplicaState>,
    ) -> Result<StepOutcome, TimelineError> {
        self.ensure_ready()?;
        let expected = self.store.replica_count();
        if payloads.len() != expected {
            return Err(TimelineError::ReplicaCountMismatch {
                expected,
                received: payloads.len(),
            });
        }

        let awaiting = self.live_step.map_or(0, |live| live + 1);
        if step > awaiting {
            if step - awaiting > REORDER_WINDOW {
                return Err(TimelineError::TooFarAhead { step, awaiting });
            }
            debug!(step, awaiting, "step.buffered");
            self.reorder.insert(step, payloads);
            return Ok(StepOutcome::Buffered { step, awaiting });
        }
        if step < awaiting {
            return self.redeliver(step, payloads);
        }

        let caught_up = self.is_caught_up();
        let mut drift = self.append(step, payloads)?;
        let mut last = step;
        while let Some(buffered) = self.reorder.remove(&(last + 1)) {
            last += 1;
            drift += self.append(last, buffered)?;
        }

        self.live_step = Some(self.live_step.map_or(last, |live| live.max(last)));
        if caught_up {
            self.display_step = self.live_step;
        }
        self.run_ended = false;
        debug!(
            first = step,
            last,
            display_step = ?self.display_step,
            "step.applied"
        );
        Ok(StepOutcome::Applied {
            first: step,
            last,
            display_followed: caught_up,
            drift,
        })
    }

    /// Clamp `requested` into `[0, live]` and move the display cursor there.
    pub fn set_display_step(&mut self, requested: i64) -> Result<u64, TimelineError> {
        self.ensure_ready()?;
        let live = self.live_step.ok_or(TimelineError::NoSteps)?;
        let upper = i64::try_from(live).unwrap_or(i64::MAX);
        let clamped = requested.clamp(0, upper);
        if clamped != requested {
            debug!(requested, clamped, "display.clamped");
        }
        let step = clamped as u64;
        self.display_step = Some(step);
        Ok(step)
    }

    pub fn step_back(&mut self) -> Result<u64, TimelineError> {
        self.ensure_ready()?;
        let display = self.display_step.ok_or(TimelineError::NoSteps)?;
        self.set_display_step(display as i64 - 1)
    }

    pub fn jump_to_live(&mut self) -> Result<u64, TimelineError> {
        self.ensure_ready()?;
        let live = self.live_step.ok_or(TimelineError::NoSteps)?;
        self.display_step = Some(live);
        Ok(live)
    }

    /// What [`request_advance`](Self::request_advance) would do, without
    /// moving anything.
    pub fn next_advance(&self) -> Advance {
        if !self.is_ready() {
            return Advance::NotReady;
        }
        match (self.display_step, self.live_step) {
            (Some(display), Some(live)) if display < live => Advance::Local(display + 1),
            _ if self.run_ended => Advance::Exhausted,
            (_, live) => Advance::Fetch(live.map_or(0, |live| live + 1)),
        }
    }

    /// Step forward locally when history allows; otherwise report the step
    /// the server has to produce.
    pub fn request_advance(&mut self) -> Advance {
        let advance = self.next_advance();
        if let Advance::Local(step) = advance {
            self.display_step = Some(step);
        }
        advance
    }

    fn ensure_ready(&self) -> Result<(), TimelineError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(TimelineError::NotReady)
        }
    }

    fn series_before(&self, replica: usize, step: u64) -> ScalarSeries {
        if step == 0 {
            return ScalarSeries::new();
        }
        self.store
            .get_by_step(replica, step - 1)
            .map(|previous| previous.series().clone())
            .unwrap_or_else(|| ScalarSeries::with_placeholders(step as usize))
    }

    fn append(&mut self, step: u64, payloads: Vec<ReplicaState>) -> Result<usize, TimelineError> {
        let mut drift = 0;
        for (replica, state) in payloads.into_iter().enumerate() {
            let accumulated = accumulate(&self.series_before(replica, step), &state.model);
            drift += report_drift(replica, step, &accumulated.drift);
            self.store.upsert(
                replica,
                SimulationStep::new(step, state, accumulated.series),
            )?;
        }
        Ok(drift)
    }

    fn redeliver(
        &mut self,
        step: u64,
        payloads: Vec<ReplicaState>,
    ) -> Result<StepOutcome, TimelineError> {
        let mut changed = false;
        for (replica, state) in payloads.into_iter().enumerate() {
            let identical = self
                .store
                .get_by_step(replica, step)
                .is_some_and(|stored| stored.fingerprint() == state.fingerprint());
            if identical {
                continue;
            }
            let accumulated = accumulate(&self.series_before(replica, step), &state.model);
            let outcome = self.store.upsert(
                replica,
                SimulationStep::new(step, state, accumulated.series),
            )?;
            if outcome == UpsertOutcome::Replaced {
                changed = true;
                self.rederive_after(replica, step)?;
            }
        }
        if changed {
            info!(step, live_step = ?self.live_step, "step.redelivered_changed");
        } else {
            debug!(step, "step.redelivered");
        }
        Ok(StepOutcome::Redelivered { step, changed })
    }

    /// Rebuild the series of every stored step after `step` so each one is
    /// again its predecessor's series plus its own snapshot.
    fn rederive_after(&mut self, replica: usize, step: u64) -> Result<(), TimelineError> {
        let Some(live) = self.live_step else {
            return Ok(());
        };
        for current in step + 1..=live {
            let Some(entity) = self.store.get_by_step(replica, current).cloned() else {
                break;
            };
            let accumulated = accumulate(&self.series_before(replica, current), entity.model());
            self.store
                .replace(replica, entity.with_series(accumulated.series))?;
        }
        Ok(())
    }
}

fn report_drift(replica: usize, step: u64, drift: &[SchemaDrift]) -> usize {
    for change in drift {
        match change {
            SchemaDrift::Appeared { field, .. } => {
                warn!(replica, step, %field, change = "appeared", "series.schema_drift")
            }
            SchemaDrift::Disappeared { field, .. } => {
                warn!(replica, step, %field, change = "disappeared", "series.schema_drift")
            }
        }
    }
    drift.len()
}
