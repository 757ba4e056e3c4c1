//! Bounded, insertion-ordered checkpoint list.

use std::collections::VecDeque;

use taskflow_types::rollback::{Checkpoint, CheckpointType};
use uuid::Uuid;

/// Checkpoints of one instance, oldest first. Pushing beyond `max` evicts
/// from the front.
#[derive(Debug, Clone)]
pub struct CheckpointLog {
    entries: VecDeque<Checkpoint>,
    max: usize,
}

impl CheckpointLog {
    pub fn new(max: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max: max.max(1),
        }
    }

    /// Append `checkpoint`, returning whatever was evicted to stay within
    /// the bound.
    pub fn push(&mut self, checkpoint: Checkpoint) -> Vec<Checkpoint> {
        self.entries.push_back(checkpoint);
        let excess = self.entries.len().saturating_sub(self.max);
        self.entries.drain(..excess).collect()
    }

    /// Replace the contents, keeping the newest `max` by creation time.
    pub fn replace(&mut self, mut checkpoints: Vec<Checkpoint>) {
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let excess = checkpoints.len().saturating_sub(self.max);
        self.entries = checkpoints.into_iter().skip(excess).collect();
    }

    pub fn get(&self, id: Uuid) -> Option<&Checkpoint> {
        self.entries.iter().find(|c| c.id == id)
    }

    pub fn by_type(&self, checkpoint_type: CheckpointType) -> Vec<&Checkpoint> {
        self.entries
            .iter()
            .filter(|c| c.checkpoint_type == checkpoint_type)
            .collect()
    }

    /// Most recent by creation time; ties go to the later insertion.
    pub fn latest(&self) -> Option<&Checkpoint> {
        self.entries.iter().max_by_key(|c| c.created_at)
    }

    pub fn latest_of_type(&self, checkpoint_type: CheckpointType) -> Option<&Checkpoint> {
        self.entries
            .iter()
            .filter(|c| c.checkpoint_type == checkpoint_type)
            .max_by_key(|c| c.created_at)
    }

    pub fn earliest_of_type(&self, checkpoint_type: CheckpointType) -> Option<&Checkpoint> {
        self.entries
            .iter()
            .find(|c| c.checkpoint_type == checkpoint_type)
    }

    pub fn remove(&mut self, id: Uuid) -> Option<Checkpoint> {
        let index = self.entries.iter().position(|c| c.id == id)?;
        self.entries.remove(index)
    }

    pub fn clear(&mut self) -> Vec<Checkpoint> {
        self.entries.drain(..).collect()
    }

    pub fn all(&self) -> Vec<Checkpoint> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::collections::HashMap;
    use taskflow_types::rollback::WorkflowStateSnapshot;

    fn checkpoint(checkpoint_type: CheckpointType, offset_secs: i64) -> Checkpoint {
        let instance_id = Uuid::nil();
        Checkpoint {
            id: Uuid::now_v7(),
            instance_id,
            checkpoint_type,
            state: WorkflowStateSnapshot::new("wf", instance_id),
            created_at: Utc::now() + Duration::seconds(offset_secs),
            name: None,
            description: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn push_evicts_oldest() {
        let mut log = CheckpointLog::new(2);
        let a = checkpoint(CheckpointType::Auto, 0);
        let b = checkpoint(CheckpointType::Auto, 1);
        let c = checkpoint(CheckpointType::Auto, 2);
        assert!(log.push(a.clone()).is_empty());
        assert!(log.push(b.clone()).is_empty());
        let evicted = log.push(c.clone());
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, a.id);
        assert_eq!(log.len(), 2);
        assert!(log.get(a.id).is_none());
        assert_eq!(log.latest().unwrap().id, c.id);
    }

    #[test]
    fn lookups_by_type() {
        let mut log = CheckpointLog::new(10);
        let start = checkpoint(CheckpointType::WorkflowStart, 0);
        let s1 = checkpoint(CheckpointType::StepSuccess, 1);
        let s2 = checkpoint(CheckpointType::StepSuccess, 2);
        let manual = checkpoint(CheckpointType::Manual, 3);
        for c in [&start, &s1, &s2, &manual] {
            log.push(c.clone());
        }
        assert_eq!(log.by_type(CheckpointType::StepSuccess).len(), 2);
        assert_eq!(log.latest_of_type(CheckpointType::StepSuccess).unwrap().id, s2.id);
        assert_eq!(log.earliest_of_type(CheckpointType::WorkflowStart).unwrap().id, start.id);
        assert!(log.latest_of_type(CheckpointType::Milestone).is_none());
        assert_eq!(log.latest().unwrap().id, manual.id);
    }

    #[test]
    fn latest_prefers_later_insertion_on_ties() {
        let mut log = CheckpointLog::new(10);
        let first = checkpoint(CheckpointType::Auto, 0);
        let mut second = checkpoint(CheckpointType::Auto, 0);
        second.created_at = first.created_at;
        log.push(first);
        log.push(second.clone());
        assert_eq!(log.latest().unwrap().id, second.id);
    }

    #[test]
    fn replace_keeps_newest() {
        let mut log = CheckpointLog::new(2);
        let old = checkpoint(CheckpointType::Auto, 0);
        let mid = checkpoint(CheckpointType::Auto, 1);
        let new = checkpoint(CheckpointType::Auto, 2);
        log.replace(vec![new.clone(), old, mid.clone()]);
        let ids: Vec<Uuid> = log.all().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![mid.id, new.id]);
    }

    #[test]
    fn remove_and_clear() {
        let mut log = CheckpointLog::new(5);
        let a = checkpoint(CheckpointType::Auto, 0);
        log.push(a.clone());
        log.push(checkpoint(CheckpointType::Auto, 1));
        assert_eq!(log.remove(a.id).unwrap().id, a.id);
        assert!(log.remove(a.id).is_none());
        assert_eq!(log.clear().len(), 1);
        assert!(log.is_empty());
    }
}
