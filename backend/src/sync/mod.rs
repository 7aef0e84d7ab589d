//! Drives in-flight generation jobs to a terminal state by polling the AI provider.
//!
//! A sync session owns a set of jobs, polls them all on each tick and waits for every
//! check before sleeping again, so ticks never overlap. A job is owned by at most one
//! session at a time; starting a session for jobs that are already tracked is a no-op.

pub mod checker;
pub mod session;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::job::Job;
pub use checker::{
    age_timeout_message, timeout_message, JobStatusChecker, SyncError, TIMEOUT_ERROR_PREFIX,
};
pub use session::{SyncPolicy, SyncReport, SyncSession};

struct SessionControl {
    owner: Option<Uuid>,
    stop: watch::Sender<bool>,
}

pub struct SyncSessionHandle {
    pub session_id: Uuid,
    pub job_ids: Vec<Uuid>,
    pub task: JoinHandle<SyncReport>,
}

#[derive(Clone)]
pub struct JobSynchronizer {
    checker: Arc<JobStatusChecker>,
    policy: SyncPolicy,
    /// job id -> owning session id
    claims: Arc<DashMap<Uuid, Uuid>>,
    sessions: Arc<DashMap<Uuid, SessionControl>>,
}

impl JobSynchronizer {
    pub fn new(checker: Arc<JobStatusChecker>, policy: SyncPolicy) -> Self {
        Self {
            checker,
            policy,
            claims: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub async fn force_timeout(&self, job: Job, message: &str) -> Result<Job, SyncError> {
        self.checker.force_timeout(job, message).await
    }

    /// Starts polling the given jobs at the configured interval. Returns `None` when
    /// none of them needs a new poller.
    pub fn start_sync(&self, jobs: Vec<Job>, owner: Option<Uuid>) -> Option<SyncSessionHandle> {
        self.start_sync_every(jobs, owner, self.policy.interval)
    }

    pub fn start_sync_every(
        &self,
        jobs: Vec<Job>,
        owner: Option<Uuid>,
        interval: Duration,
    ) -> Option<SyncSessionHandle> {
        let session_id = Uuid::new_v4();
        let mut claimed = Vec::new();
        for job in jobs.into_iter().filter(Job::is_pollable) {
            if let Entry::Vacant(vacant) = self.claims.entry(job.id) {
                vacant.insert(session_id);
                claimed.push(job);
            }
        }
        if claimed.is_empty() {
            debug!("every job is already being synced");
            return None;
        }

        let session =
            SyncSession::with_id(session_id, claimed, self.policy.with_interval(interval));
        let job_ids = session.job_ids();
        let (stop, stop_rx) = watch::channel(false);
        self.sessions
            .insert(session_id, SessionControl { owner, stop });

        info!(%session_id, jobs = job_ids.len(), ?owner, "sync session started");
        let this = self.clone();
        let task = tokio::spawn(async move {
            let report = run_session(this.checker.clone(), session, stop_rx).await;
            this.release(session_id);
            info!(
                %session_id,
                ticks = report.ticks,
                completed = report.completed.len(),
                failed = report.failed.len(),
                timed_out = report.timed_out.len(),
                remaining = report.remaining.len(),
                "sync session ended"
            );
            report
        });

        Some(SyncSessionHandle {
            session_id,
            job_ids,
            task,
        })
    }

    /// Cancels a session. In-flight checks are detached, not awaited. Safe to call for a
    /// session that already ended.
    pub fn stop_sync(&self, session_id: Uuid) -> bool {
        match self.sessions.remove(&session_id) {
            Some((_, control)) => {
                let _ = control.stop.send(true);
                true
            }
            None => false,
        }
    }

    pub fn stop_sync_for(&self, owner: Uuid) -> usize {
        let ids: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().owner == Some(owner))
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter().filter(|id| self.stop_sync(*id)).count()
    }

    pub fn stop_all(&self) -> usize {
        let ids: Vec<Uuid> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter(|id| self.stop_sync(*id)).count()
    }

    pub fn is_tracking(&self, job_id: Uuid) -> bool {
        self.claims.contains_key(&job_id)
    }

    pub fn tracked_job_ids(&self) -> Vec<Uuid> {
        self.claims.iter().map(|entry| *entry.key()).collect()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn release(&self, session_id: Uuid) {
        self.sessions.remove(&session_id);
        self.claims.retain(|_, owner| *owner != session_id);
    }
}

async fn run_session(
    checker: Arc<JobStatusChecker>,
    mut session: SyncSession,
    mut stop_rx: watch::Receiver<bool>,
) -> SyncReport {
    let session_id = session.id;
    let interval = session.policy().interval;

    loop {
        if *stop_rx.borrow() {
            return session.into_report(true, false);
        }
        let due = session.due_jobs();
        if due.is_empty() {
            return session.into_report(false, false);
        }
        if session.budget_exhausted() {
            warn!(%session_id, remaining = due.len(), "sync duration budget exhausted");
            return session.into_report(false, true);
        }
        session.begin_tick();

        let mut checks = JoinSet::new();
        for job in due {
            let checker = checker.clone();
            checks.spawn(async move {
                let job_id = job.id;
                (job_id, checker.check_one(job).await)
            });
        }

        loop {
            tokio::select! {
                joined = checks.join_next() => match joined {
                    None => break,
                    Some(Ok((job_id, Ok(job)))) => session.record_check(job_id, Some(job)),
                    Some(Ok((job_id, Err(err)))) => {
                        warn!(%job_id, error = %err, "status check failed, will retry");
                        session.record_check(job_id, None);
                    }
                    Some(Err(join_err)) => warn!(%session_id, ?join_err, "status check task aborted"),
                },
                _ = stop_rx.changed() => {
                    checks.detach_all();
                    return session.into_report(true, false);
                }
            }
        }

        for (job, attempts) in session.take_exhausted() {
            let job_id = job.id;
            match checker.force_timeout(job, &timeout_message(attempts)).await {
                Ok(job) => session.record_timeout(job),
                Err(err) => warn!(%job_id, error = %err, "failed to time out job"),
            }
        }

        if session.is_idle() {
            return session.into_report(false, false);
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop_rx.changed() => return session.into_report(true, false),
        }
    }
}
