//! Job storage implementations.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use conductor_core::{JobId, JobState, OwnerId};

use super::types::Job;

/// Query over stored jobs. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub owner_id: Option<OwnerId>,
    pub state: Option<JobState>,
    pub job_type: Option<String>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_owner(owner_id: OwnerId) -> Self {
        Self {
            owner_id: Some(owner_id),
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.owner_id.as_ref().is_none_or(|o| &job.owner_id == o)
            && self.state.is_none_or(|s| job.state == s)
            && self.job_type.as_deref().is_none_or(|t| job.job_type == t)
    }
}

/// Job store abstraction.
///
/// The store is the single source of truth for job state. Callers serialize
/// writes per job; implementations only have to make each write atomic.
pub trait JobStore: Send + Sync {
    /// Every persisted job, oldest first.
    fn load(&self) -> Result<Vec<Job>, JobStoreError>;

    /// Persist a new job.
    fn insert(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Replace an existing job.
    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs matching `filter`, oldest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job store lock poisoned")]
    Poisoned,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Oldest first; ids break ties deterministically.
pub(crate) fn sort_jobs(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<BTreeMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed the store with already-persisted jobs (e.g. a recovery fixture).
    pub fn with_jobs(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            jobs: RwLock::new(jobs.into_iter().map(|j| (j.id, j)).collect()),
        }
    }
}

impl JobStore for InMemoryJobStore {
    fn load(&self) -> Result<Vec<Job>, JobStoreError> {
        self.list(&JobFilter::all())
    }

    fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::Poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::Poisoned)?;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| JobStoreError::Poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| JobStoreError::Poisoned)?;
        let mut result: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        sort_jobs(&mut result);
        Ok(result)
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn load(&self) -> Result<Vec<Job>, JobStoreError> {
        (**self).load()
    }

    fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).insert(job)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(filter)
    }
}
