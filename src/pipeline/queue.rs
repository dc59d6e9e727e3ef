//! Ready queue
//!
//! Units of work ordered by job creation time, ties broken by job id. A job
//! has at most one queued unit at a time.

use crate::jobs::{JobId, Stage};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One `(job, stage)` pair waiting to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkUnit {
    pub job_id: JobId,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    /// Backoff: not eligible before this instant
    pub not_before: Option<DateTime<Utc>>,
}

impl WorkUnit {
    pub fn new(job_id: JobId, stage: Stage, created_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            stage,
            created_at,
            not_before: None,
        }
    }

    pub fn delayed_until(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }
}

type QueueKey = (DateTime<Utc>, JobId);

/// FIFO-by-creation ready queue
#[derive(Debug, Default)]
pub struct ReadyQueue {
    units: BTreeMap<QueueKey, WorkUnit>,
}

impl ReadyQueue {
    /// Queue a unit, replacing any unit already queued for the same job
    pub fn push(&mut self, unit: WorkUnit) -> Option<WorkUnit> {
        self.units.insert((unit.created_at, unit.job_id), unit)
    }

    pub fn remove(&mut self, job_id: JobId, created_at: DateTime<Utc>) -> Option<WorkUnit> {
        self.units.remove(&(created_at, job_id))
    }

    pub fn contains(&self, job_id: JobId, created_at: DateTime<Utc>) -> bool {
        self.units.contains_key(&(created_at, job_id))
    }

    /// Take the first ready unit accepted by `admit`.
    ///
    /// Units that are still backing off or that `admit` rejects keep their
    /// place and do not block the units behind them.
    pub fn pop_eligible<F>(&mut self, now: DateTime<Utc>, mut admit: F) -> Option<WorkUnit>
    where
        F: FnMut(&WorkUnit) -> bool,
    {
        let key = self
            .units
            .iter()
            .find(|(_, unit)| unit.is_ready(now) && admit(unit))
            .map(|(key, _)| *key)?;
        self.units.remove(&key)
    }

    /// Earliest backoff deadline among waiting units
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.units.values().filter_map(|unit| unit.not_before).min()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }
}
