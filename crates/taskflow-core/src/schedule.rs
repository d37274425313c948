//! Schedule definitions and the abstract "advance" operation (spec §3, §4.3).

use crate::ids::ScheduleId;
use crate::job::JobType;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// The abstract "advance" operation spec.md leaves unspecified: cron
/// expression parsing is an explicit Non-goal (spec §1), so `nextRun` is
/// produced by an implementation of this trait rather than a parsed
/// expression.
pub trait NextRun: Send + Sync {
    fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc>;
}

impl fmt::Debug for dyn NextRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<next-run strategy>")
    }
}

/// Fires every fixed interval.
#[derive(Debug, Clone)]
pub struct FixedInterval(pub chrono::Duration);

impl NextRun for FixedInterval {
    fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.0
    }
}

/// Fires once a day at a fixed UTC hour/minute.
#[derive(Debug, Clone)]
pub struct DailyAt {
    pub hour: u32,
    pub minute: u32,
}

impl NextRun for DailyAt {
    fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now
            .date_naive()
            .and_hms_opt(self.hour, self.minute, 0)
            .expect("valid hour/minute");
        let today = DateTime::<Utc>::from_naive_utc_and_offset(today, Utc);
        if today > now {
            today
        } else {
            today + ChronoDuration::days(1)
        }
    }
}

pub struct ScheduleDefinition {
    pub id: ScheduleId,
    pub name: String,
    pub job_type: JobType,
    pub params: Map<String, Value>,
    pub priority: i32,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub max_retries: Option<u32>,
    /// Minimum gap between two forced `triggerSchedule` enqueues (spec §3
    /// "Schedule definition"). `nextRun` already spaces out the
    /// timer-driven `tick`; this exists so an operator can't fire the same
    /// schedule in a tight loop regardless of its configured cadence.
    /// Deliberately tracked against its own `last_triggered` timestamp
    /// rather than `lastRun` — `triggerSchedule` is documented to leave
    /// `nextRun` untouched, and leaving `lastRun` untouched too keeps that
    /// field meaning "last tick-driven run" consistently.
    pub cooldown: Option<chrono::Duration>,
    pub last_triggered: Option<DateTime<Utc>>,
    pub advance: Arc<dyn NextRun>,
}

impl fmt::Debug for ScheduleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("job_type", &self.job_type)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("last_run", &self.last_run)
            .field("next_run", &self.next_run)
            .finish()
    }
}

impl Clone for ScheduleDefinition {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            job_type: self.job_type.clone(),
            params: self.params.clone(),
            priority: self.priority,
            enabled: self.enabled,
            last_run: self.last_run,
            next_run: self.next_run,
            max_retries: self.max_retries,
            cooldown: self.cooldown,
            last_triggered: self.last_triggered,
            advance: Arc::clone(&self.advance),
        }
    }
}

impl ScheduleDefinition {
    pub fn new(
        name: impl Into<String>,
        job_type: JobType,
        advance: Arc<dyn NextRun>,
        starting_from: DateTime<Utc>,
    ) -> Self {
        let next_run = advance.next_after(starting_from);
        Self {
            id: ScheduleId::new(),
            name: name.into(),
            job_type,
            params: Map::new(),
            priority: 0,
            enabled: true,
            last_run: None,
            next_run,
            max_retries: None,
            cooldown: None,
            last_triggered: None,
            advance,
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cooldown(mut self, cooldown: chrono::Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    /// Whether a forced `triggerSchedule` call should be refused right now
    /// because the last forced trigger was within `cooldown`.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        match (self.cooldown, self.last_triggered) {
            (Some(cooldown), Some(last_triggered)) => now - last_triggered < cooldown,
            _ => false,
        }
    }
}
