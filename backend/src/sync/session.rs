use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub interval: Duration,
    pub max_attempts_per_job: u32,
    /// Measured from the first poll of a session.
    pub max_total_duration: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts_per_job: 180,
            max_total_duration: Duration::from_secs(15 * 60),
        }
    }
}

impl SyncPolicy {
    pub fn from_settings(settings: &crate::config::SyncSettings) -> Self {
        Self {
            interval: settings.interval,
            max_attempts_per_job: settings.max_attempts_per_job,
            max_total_duration: settings.max_total_duration,
        }
    }

    pub fn with_interval(self, interval: Duration) -> Self {
        Self { interval, ..self }
    }
}

/// What a finished session did with the jobs it owned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub ticks: u32,
    pub completed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    pub timed_out: Vec<Uuid>,
    /// Still in flight when the session ended.
    pub remaining: Vec<Uuid>,
    pub stopped: bool,
    pub budget_exhausted: bool,
}

/// Per-session polling state: the jobs still being tracked, their attempt counters and
/// the session clock. Dropped when the session ends.
pub struct SyncSession {
    pub id: Uuid,
    policy: SyncPolicy,
    jobs: HashMap<Uuid, Job>,
    attempts: HashMap<Uuid, u32>,
    started_at: Option<Instant>,
    report: SyncReport,
}

impl SyncSession {
    pub fn new(jobs: Vec<Job>, policy: SyncPolicy) -> Self {
        Self::with_id(Uuid::new_v4(), jobs, policy)
    }

    pub fn with_id(id: Uuid, jobs: Vec<Job>, policy: SyncPolicy) -> Self {
        Self {
            id,
            policy,
            jobs: jobs
                .into_iter()
                .filter(Job::is_pollable)
                .map(|job| (job.id, job))
                .collect(),
            attempts: HashMap::new(),
            started_at: None,
            report: SyncReport::default(),
        }
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn job_ids(&self) -> Vec<Uuid> {
        self.jobs.keys().copied().collect()
    }

    pub fn due_jobs(&self) -> Vec<Job> {
        self.jobs
            .values()
            .filter(|job| job.is_pollable())
            .cloned()
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Starts the clock on the first tick and counts ticks.
    pub fn begin_tick(&mut self) {
        self.started_at.get_or_insert_with(Instant::now);
        self.report.ticks += 1;
    }

    pub fn budget_exhausted(&self) -> bool {
        self.started_at
            .map(|started| started.elapsed() >= self.policy.max_total_duration)
            .unwrap_or(false)
    }

    pub fn attempts(&self, job_id: Uuid) -> u32 {
        self.attempts.get(&job_id).copied().unwrap_or(0)
    }

    /// Counts one status check and stores the latest known job state. Terminal jobs leave
    /// the session.
    pub fn record_check(&mut self, job_id: Uuid, latest: Option<Job>) {
        *self.attempts.entry(job_id).or_insert(0) += 1;
        if let Some(job) = latest {
            if job.is_terminal() {
                self.finish(job);
            } else {
                self.jobs.insert(job_id, job);
            }
        }
    }

    /// Removes and returns the jobs whose attempt budget is spent.
    pub fn take_exhausted(&mut self) -> Vec<(Job, u32)> {
        let max = self.policy.max_attempts_per_job;
        let ids: Vec<Uuid> = self
            .jobs
            .keys()
            .filter(|id| self.attempts(**id) >= max)
            .copied()
            .collect();
        ids.into_iter()
            .filter_map(|id| {
                let attempts = self.attempts.remove(&id).unwrap_or(0);
                self.jobs.remove(&id).map(|job| (job, attempts))
            })
            .collect()
    }

    /// Records the outcome of a forced timeout. A job that completed in the meantime
    /// keeps its result.
    pub fn record_timeout(&mut self, job: Job) {
        self.attempts.remove(&job.id);
        self.jobs.remove(&job.id);
        match job.status {
            JobStatus::Completed => self.report.completed.push(job.id),
            _ => self.report.timed_out.push(job.id),
        }
    }

    fn finish(&mut self, job: Job) {
        self.attempts.remove(&job.id);
        self.jobs.remove(&job.id);
        match job.status {
            JobStatus::Completed => self.report.completed.push(job.id),
            _ => self.report.failed.push(job.id),
        }
    }

    pub fn into_report(mut self, stopped: bool, budget_exhausted: bool) -> SyncReport {
        let mut remaining = self.job_ids();
        remaining.sort();
        self.report.remaining = remaining;
        self.report.stopped = stopped;
        self.report.budget_exhausted = budget_exhausted;
        self.report
    }
}
