//! Durable job store backed by a single versioned JSON file.
//!
//! ## File format
//!
//! ```json
//! { "schemaVersion": 2, "savedAt": "2026-01-01T00:00:00Z", "jobs": [ ... ] }
//! ```
//!
//! Version 1 files (which used `kind` for the job type and `status` for the
//! state) are migrated in memory on load and rewritten as version 2 on the next
//! write.
//!
//! ## Crash consistency
//!
//! Every write serializes the full job set to `<file>.tmp`, fsyncs it and renames
//! it over the live file, so a reader never observes a partial write. A file that
//! fails structural validation is renamed to `<file>.corrupt-<timestamp>` and the
//! store starts empty instead of taking the process down.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use conductor_core::JobId;

use super::store::{JobFilter, JobStore, JobStoreError, sort_jobs};
use super::types::Job;

/// Schema version written by this build.
pub const SCHEMA_VERSION: u64 = 2;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreFileRef<'a> {
    schema_version: u64,
    saved_at: DateTime<Utc>,
    jobs: Vec<&'a Job>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreFile {
    jobs: Vec<Job>,
}

/// File-backed job store.
#[derive(Debug)]
pub struct FileJobStore {
    path: PathBuf,
    jobs: RwLock<BTreeMap<JobId, Job>>,
    quarantined: Option<PathBuf>,
}

impl FileJobStore {
    /// Open (or create) the store at `path`.
    ///
    /// Only IO failures on an existing readable file are errors; corrupt
    /// contents are quarantined.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JobStoreError> {
        let path = path.into();
        let mut quarantined = None;

        let jobs = if path.exists() {
            let bytes = fs::read(&path).map_err(io_err)?;
            match decode(&bytes) {
                Ok(jobs) => jobs,
                Err(reason) => {
                    let target = quarantine(&path)?;
                    warn!(
                        path = %path.display(),
                        quarantined_to = %target.display(),
                        reason = %reason,
                        "job store failed validation; quarantined and starting empty"
                    );
                    quarantined = Some(target);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        info!(path = %path.display(), jobs = jobs.len(), "job store opened");

        Ok(Self {
            path,
            jobs: RwLock::new(jobs.into_iter().map(|j| (j.id, j)).collect()),
            quarantined,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the previous file was moved, if it was quarantined on open.
    pub fn quarantined(&self) -> Option<&Path> {
        self.quarantined.as_deref()
    }

    fn write_with<F>(&self, mutate: F) -> Result<(), JobStoreError>
    where
        F: FnOnce(&mut BTreeMap<JobId, Job>) -> Result<(), JobStoreError>,
    {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::Poisoned)?;
        let mut next = jobs.clone();
        mutate(&mut next)?;
        persist(&self.path, &next)?;
        *jobs = next;
        Ok(())
    }
}

impl JobStore for FileJobStore {
    fn load(&self) -> Result<Vec<Job>, JobStoreError> {
        self.list(&JobFilter::all())
    }

    fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        self.write_with(|jobs| {
            if jobs.contains_key(&job.id) {
                return Err(JobStoreError::AlreadyExists(job.id));
            }
            jobs.insert(job.id, job.clone());
            Ok(())
        })
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        self.write_with(|jobs| match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        })
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

fn io_err(err: std::io::Error) -> JobStoreError {
    JobStoreError::Storage(err.to_string())
}

/// Parse and migrate a store file.
fn decode(bytes: &[u8]) -> Result<Vec<Job>, String> {
    let mut doc: JsonValue = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    let version = doc
        .get("schemaVersion")
        .and_then(JsonValue::as_u64)
        .ok_or_else(|| "missing schemaVersion".to_string())?;

    match version {
        1 => migrate_v1(&mut doc)?,
        SCHEMA_VERSION => {}
        other => return Err(format!("unsupported schemaVersion {other}")),
    }

    let file: StoreFile = serde_json::from_value(doc).map_err(|e| e.to_string())?;
    Ok(file.jobs)
}

/// v1 named the job type `kind` and the state `status`.
fn migrate_v1(doc: &mut JsonValue) -> Result<(), String> {
    let jobs = doc
        .get_mut("jobs")
        .and_then(JsonValue::as_array_mut)
        .ok_or_else(|| "missing jobs array".to_string())?;

    for job in jobs {
        let obj = job
            .as_object_mut()
            .ok_or_else(|| "job entry is not an object".to_string())?;
        for (old, new) in [("kind", "type"), ("status", "state")] {
            if let Some(value) = obj.remove(old) {
                obj.entry(new).or_insert(value);
            }
        }
        obj.entry("version").or_insert(JsonValue::from(1));
        if !obj.contains_key("updatedAt") {
            if let Some(created) = obj.get("createdAt").cloned() {
                obj.insert("updatedAt".into(), created);
            }
        }
    }
    Ok(())
}

fn persist(path: &Path, jobs: &BTreeMap<JobId, Job>) -> Result<(), JobStoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut ordered: Vec<&Job> = jobs.values().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    let file = StoreFileRef {
        schema_version: SCHEMA_VERSION,
        saved_at: Utc::now(),
        jobs: ordered,
    };
    let bytes =
        serde_json::to_vec_pretty(&file).map_err(|e| JobStoreError::Storage(e.to_string()))?;

    let tmp = sibling(path, ".tmp");
    {
        let mut f = File::create(&tmp).map_err(io_err)?;
        f.write_all(&bytes).map_err(io_err)?;
        f.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

fn quarantine(path: &Path) -> Result<PathBuf, JobStoreError> {
    let suffix = format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
    let target = sibling(path, &suffix);
    fs::rename(path, &target).map_err(io_err)?;
    Ok(target)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use conductor_core::{JobRequest, JobState, OwnerId};
    use serde_json::json;

    use super::*;

    fn job() -> Job {
        Job::new(
            JobRequest::new("echo", OwnerId::parse("p1").unwrap(), json!({"n": 1})),
            1,
            None,
            3,
        )
    }

    #[test]
    fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let store = FileJobStore::open(&path).unwrap();
        let mut j = job();
        store.insert(&j).unwrap();
        j.mark_running().unwrap();
        store.update(&j).unwrap();
        drop(store);

        let reopened = FileJobStore::open(&path).unwrap();
        let loaded = reopened.get(j.id).unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Running);
        assert!(reopened.quarantined().is_none());
        assert!(!sibling(&path, ".tmp").exists());

        let raw: JsonValue = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["schemaVersion"], SCHEMA_VERSION);
    }

    #[test]
    fn corrupt_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = FileJobStore::open(&path).unwrap();

        assert!(store.load().unwrap().is_empty());
        let moved = store.quarantined().unwrap().to_path_buf();
        assert!(moved.exists());
        assert_eq!(fs::read(&moved).unwrap(), b"{ not json");
        assert!(!path.exists());
    }

    #[test]
    fn future_schema_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        fs::write(&path, br#"{"schemaVersion": 99, "jobs": []}"#).unwrap();

        let store = FileJobStore::open(&path).unwrap();
        assert!(store.quarantined().is_some());
    }

    #[test]
    fn v1_files_are_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let id = JobId::new();
        let v1 = json!({
            "schemaVersion": 1,
            "jobs": [{
                "id": id,
                "kind": "echo",
                "ownerId": "p1",
                "priority": "background",
                "status": "queued",
                "payload": {"n": 1},
                "attempts": 0,
                "maxAttempts": 3,
                "createdAt": "2025-01-01T00:00:00Z"
            }]
        });
        fs::write(&path, serde_json::to_vec(&v1).unwrap()).unwrap();

        let store = FileJobStore::open(&path).unwrap();
        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.job_type, "echo");
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.version, 1);
        assert!(store.quarantined().is_none());
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path().join("jobs.json")).unwrap();
        let j = job();
        store.insert(&j).unwrap();

        assert_eq!(store.insert(&j), Err(JobStoreError::AlreadyExists(j.id)));
        assert_eq!(store.load().unwrap().len(), 1);
    }
}
