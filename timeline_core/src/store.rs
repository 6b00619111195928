use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::step::SimulationStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Same content was already stored for this step.
    Unchanged,
    /// Different content replaced the stored entity.
    Replaced,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("replica {replica} out of range (run has {replicas} replicas)")]
    UnknownReplica { replica: usize, replicas: usize },
}

/// Step-keyed history of a single replica.
#[derive(Debug, Clone, Default)]
pub struct ReplicaTimeline {
    replica: usize,
    steps: BTreeMap<u64, Arc<SimulationStep>>,
}

impl ReplicaTimeline {
    pub fn new(replica: usize) -> Self {
        Self {
            replica,
            steps: BTreeMap::new(),
        }
    }

    pub fn replica(&self) -> usize {
        self.replica
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, step: u64) -> Option<&Arc<SimulationStep>> {
        self.steps.get(&step)
    }

    pub fn latest(&self) -> Option<&Arc<SimulationStep>> {
        self.steps.values().next_back()
    }

    /// Entities with `from <= step <= to`, in step order.
    pub fn range(&self, from: u64, to: u64) -> impl Iterator<Item = &Arc<SimulationStep>> {
        let bounds = if from <= to { Some(from..=to) } else { None };
        bounds
            .into_iter()
            .flat_map(move |bounds| self.steps.range(bounds).map(|(_, step)| step))
    }

    /// Identical content keeps the stored `Arc`, so readers comparing by
    /// pointer see no change.
    fn upsert(&mut self, entity: SimulationStep) -> UpsertOutcome {
        match self.steps.entry(entity.step()) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(entity));
                UpsertOutcome::Inserted
            }
            Entry::Occupied(slot) if slot.get().fingerprint() == entity.fingerprint() => {
                UpsertOutcome::Unchanged
            }
            Entry::Occupied(mut slot) => {
                slot.insert(Arc::new(entity));
                UpsertOutcome::Replaced
            }
        }
    }

    fn replace(&mut self, entity: SimulationStep) {
        self.steps.insert(entity.step(), Arc::new(entity));
    }

    fn clear(&mut self) {
        self.steps.clear();
    }
}

/// One [`ReplicaTimeline`] per replica of the current run.
#[derive(Debug, Clone, Default)]
pub struct StepStore {
    replicas: Vec<ReplicaTimeline>,
}

impl StepStore {
    pub fn with_replicas(count: usize) -> Self {
        Self {
            replicas: (0..count).map(ReplicaTimeline::new).collect(),
        }
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn replica(&self, replica: usize) -> Option<&ReplicaTimeline> {
        self.replicas.get(replica)
    }

    /// Insert or overwrite the entity for `(replica, entity.step())`.
    pub fn upsert(
        &mut self,
        replica: usize,
        entity: SimulationStep,
    ) -> Result<UpsertOutcome, StoreError> {
        let replicas = self.replicas.len();
        let timeline = self
            .replicas
            .get_mut(replica)
            .ok_or(StoreError::UnknownReplica { replica, replicas })?;
        Ok(timeline.upsert(entity))
    }

    /// Overwrite unconditionally; used when only the derived series changed.
    pub fn replace(&mut self, replica: usize, entity: SimulationStep) -> Result<(), StoreError> {
        let replicas = self.replicas.len();
        self.replicas
            .get_mut(replica)
            .ok_or(StoreError::UnknownReplica { replica, replicas })?
            .replace(entity);
        Ok(())
    }

    pub fn get_by_step(&self, replica: usize, step: u64) -> Option<&Arc<SimulationStep>> {
        self.replicas.get(replica).and_then(|timeline| timeline.get(step))
    }

    pub fn get_range(&self, replica: usize, from: u64, to: u64) -> Vec<Arc<SimulationStep>> {
        self.replicas
            .get(replica)
            .map(|timeline| timeline.range(from, to).cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self, replica: usize) -> Result<(), StoreError> {
        let replicas = self.replicas.len();
        self.replicas
            .get_mut(replica)
            .ok_or(StoreError::UnknownReplica { replica, replicas })?
            .clear();
        Ok(())
    }

    pub fn clear_all(&mut self) {
        for timeline in &mut self.replicas {
            timeline.clear();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.iter().all(ReplicaTimeline::is_empty)
    }
}
