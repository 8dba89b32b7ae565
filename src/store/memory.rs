//! In-memory store, optionally persisted to a JSON file

use super::Store;
use super::storage::save_state;
use crate::error::{Error, Result};
use crate::types::{
    Batch, BatchId, Commit, Feedback, NewPullRequest, NewStaging, PrId, PrState, Priority,
    PullRequest, Split, SplitId, Staging, StagingId, StagingState,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// Everything the store holds, serialized as-is
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    /// Last id handed out
    #[serde(default)]
    pub sequence: u64,
    /// Pull requests by id
    #[serde(default)]
    pub pull_requests: BTreeMap<PrId, PullRequest>,
    /// Batches by id
    #[serde(default)]
    pub batches: BTreeMap<BatchId, Batch>,
    /// Stagings by id
    #[serde(default)]
    pub stagings: BTreeMap<StagingId, Staging>,
    /// Splits by id
    #[serde(default)]
    pub splits: BTreeMap<SplitId, Split>,
    /// Status cache by sha
    #[serde(default)]
    pub commits: BTreeMap<String, Commit>,
    /// Feedback outbox by id
    #[serde(default)]
    pub feedback: BTreeMap<u64, Feedback>,
}

impl StoreData {
    const fn next_id(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

/// Mutex-guarded store; every operation is a transaction
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Empty, non-persistent store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `data`, flushed to `path`
    pub fn with_data(data: StoreData, path: Option<PathBuf>) -> Self {
        Self {
            data: Mutex::new(data),
            path,
        }
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Result<StoreData> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreData>> {
        self.data
            .lock()
            .map_err(|_| Error::Store("store lock poisoned".into()))
    }
}

fn not_found(kind: &'static str, id: impl ToString) -> Error {
    Error::NotFound {
        kind,
        id: id.to_string(),
    }
}

impl Store for MemoryStore {
    fn create_pr(&self, new: NewPullRequest) -> Result<PullRequest> {
        let mut data = self.lock()?;
        if data
            .pull_requests
            .values()
            .any(|p| p.repository == new.repository && p.number == new.number)
        {
            return Err(Error::Store(format!(
                "{}#{} already exists",
                new.repository, new.number
            )));
        }
        let pr = PullRequest {
            id: data.next_id(),
            repository: new.repository,
            number: new.number,
            target: new.target,
            author: new.author,
            head: new.head,
            label: new.label,
            message: new.message,
            draft: new.draft,
            squash: new.squash,
            merge_method: None,
            method_warned: false,
            priority: Priority::Normal,
            state: PrState::Opened,
            reviewed_by: None,
            delegates: Default::default(),
            batch: None,
            commits_map: BTreeMap::new(),
            synced_tags: None,
        };
        data.pull_requests.insert(pr.id, pr.clone());
        Ok(pr)
    }

    fn get_pr(&self, id: PrId) -> Result<PullRequest> {
        self.lock()?
            .pull_requests
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("pull request", id))
    }

    fn find_pr(&self, repository: &str, number: u64) -> Result<Option<PullRequest>> {
        Ok(self
            .lock()?
            .pull_requests
            .values()
            .find(|p| p.repository == repository && p.number == number)
            .cloned())
    }

    fn search_prs(&self, filter: &dyn Fn(&PullRequest) -> bool) -> Result<Vec<PullRequest>> {
        Ok(self
            .lock()?
            .pull_requests
            .values()
            .filter(|p| filter(p))
            .cloned()
            .collect())
    }

    fn write_pr(&self, pr: &PullRequest) -> Result<()> {
        let mut data = self.lock()?;
        let slot = data
            .pull_requests
            .get_mut(&pr.id)
            .ok_or_else(|| not_found("pull request", pr.id))?;
        *slot = pr.clone();
        Ok(())
    }

    fn delete_pr(&self, id: PrId) -> Result<()> {
        self.lock()?
            .pull_requests
            .remove(&id)
            .map(drop)
            .ok_or_else(|| not_found("pull request", id))
    }

    fn create_batch(&self, target: &str, prs: &[PrId]) -> Result<Batch> {
        let mut data = self.lock()?;
        if prs.is_empty() {
            return Err(Error::InvalidBatch("a batch needs at least one PR".into()));
        }
        let mut repositories = HashSet::new();
        for id in prs {
            let pr = data
                .pull_requests
                .get(id)
                .ok_or_else(|| not_found("pull request", id))?;
            if pr.target != target {
                return Err(Error::InvalidBatch(format!(
                    "{} targets {}, not {target}",
                    pr.display_name(),
                    pr.target
                )));
            }
            if !repositories.insert(pr.repository.clone()) {
                return Err(Error::InvalidBatch(format!(
                    "several PRs from {} in one batch",
                    pr.repository
                )));
            }
        }
        let batch = Batch {
            id: data.next_id(),
            target: target.to_string(),
            prs: prs.to_vec(),
            staging: None,
            active: true,
        };
        data.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    fn get_batch(&self, id: BatchId) -> Result<Batch> {
        self.lock()?
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("batch", id))
    }

    fn write_batch(&self, batch: &Batch) -> Result<()> {
        let mut data = self.lock()?;
        let slot = data
            .batches
            .get_mut(&batch.id)
            .ok_or_else(|| not_found("batch", batch.id))?;
        *slot = batch.clone();
        Ok(())
    }

    fn active_staging(&self, target: &str) -> Result<Option<Staging>> {
        Ok(self
            .lock()?
            .stagings
            .values()
            .find(|s| s.active && s.target == target)
            .cloned())
    }

    fn create_staging(&self, new: NewStaging) -> Result<Staging> {
        let mut data = self.lock()?;
        if data
            .stagings
            .values()
            .any(|s| s.active && s.target == new.target)
        {
            return Err(Error::StagingExists(new.target));
        }
        let staging = Staging {
            id: data.next_id(),
            target: new.target,
            batches: new.batches,
            heads: new.heads,
            state: StagingState::Pending,
            active: true,
            staged_at: Utc::now(),
            timeout_limit: new.timeout_limit,
            reason: None,
        };
        for id in &staging.batches {
            if let Some(batch) = data.batches.get_mut(id) {
                batch.staging = Some(staging.id);
            }
        }
        data.stagings.insert(staging.id, staging.clone());
        Ok(staging)
    }

    fn get_staging(&self, id: StagingId) -> Result<Staging> {
        self.lock()?
            .stagings
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("staging", id))
    }

    fn write_staging(&self, staging: &Staging) -> Result<()> {
        let mut data = self.lock()?;
        let slot = data
            .stagings
            .get_mut(&staging.id)
            .ok_or_else(|| not_found("staging", staging.id))?;
        *slot = staging.clone();
        Ok(())
    }

    fn search_stagings(&self, filter: &dyn Fn(&Staging) -> bool) -> Result<Vec<Staging>> {
        Ok(self
            .lock()?
            .stagings
            .values()
            .filter(|s| filter(s))
            .cloned()
            .collect())
    }

    fn create_split(&self, target: &str, parts: Vec<Vec<BatchId>>) -> Result<Split> {
        let mut data = self.lock()?;
        let split = Split {
            id: data.next_id(),
            target: target.to_string(),
            parts,
        };
        data.splits.insert(split.id, split.clone());
        Ok(split)
    }

    fn splits(&self, target: &str) -> Result<Vec<Split>> {
        Ok(self
            .lock()?
            .splits
            .values()
            .filter(|s| s.target == target)
            .cloned()
            .collect())
    }

    fn write_split(&self, split: &Split) -> Result<()> {
        let mut data = self.lock()?;
        let slot = data
            .splits
            .get_mut(&split.id)
            .ok_or_else(|| not_found("split", split.id))?;
        *slot = split.clone();
        Ok(())
    }

    fn delete_split(&self, id: SplitId) -> Result<()> {
        self.lock()?.splits.remove(&id);
        Ok(())
    }

    fn get_commit(&self, sha: &str) -> Result<Option<Commit>> {
        Ok(self.lock()?.commits.get(sha).cloned())
    }

    fn write_commit(&self, commit: &Commit) -> Result<()> {
        self.lock()?
            .commits
            .insert(commit.sha.clone(), commit.clone());
        Ok(())
    }

    fn commits_to_check(&self) -> Result<Vec<Commit>> {
        Ok(self
            .lock()?
            .commits
            .values()
            .filter(|c| c.to_check)
            .cloned()
            .collect())
    }

    fn push_feedback(
        &self,
        repository: &str,
        number: u64,
        message: Option<String>,
        close: bool,
    ) -> Result<()> {
        let mut data = self.lock()?;
        let feedback = Feedback {
            id: data.next_id(),
            repository: repository.to_string(),
            number,
            message,
            close,
        };
        data.feedback.insert(feedback.id, feedback);
        Ok(())
    }

    fn pending_feedback(&self) -> Result<Vec<Feedback>> {
        Ok(self.lock()?.feedback.values().cloned().collect())
    }

    fn remove_feedback(&self, id: u64) -> Result<()> {
        self.lock()?.feedback.remove(&id);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        match &self.path {
            Some(path) => save_state(path, &*self.lock()?),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StagingHead;

    fn new_pr(repository: &str, number: u64, target: &str) -> NewPullRequest {
        NewPullRequest {
            repository: repository.into(),
            number,
            target: target.into(),
            author: "dev".into(),
            head: "a".repeat(40),
            label: "dev:topic".into(),
            message: "title".into(),
            draft: false,
            squash: true,
        }
    }

    fn new_staging(target: &str) -> NewStaging {
        NewStaging {
            target: target.into(),
            batches: vec![],
            heads: vec![StagingHead {
                repository: "acme/app".into(),
                head: "h".into(),
                commit: "h".into(),
                original: "o".into(),
            }],
            timeout_limit: Utc::now(),
        }
    }

    #[test]
    fn test_create_pr_rejects_duplicates() {
        let store = MemoryStore::new();
        let pr = store.create_pr(new_pr("acme/app", 1, "main")).unwrap();
        assert_eq!(pr.state, PrState::Opened);
        assert!(store.create_pr(new_pr("acme/app", 1, "main")).is_err());
        assert_eq!(store.find_pr("acme/app", 1).unwrap().unwrap().id, pr.id);
    }

    #[test]
    fn test_batch_invariants() {
        let store = MemoryStore::new();
        let a = store.create_pr(new_pr("acme/app", 1, "main")).unwrap();
        let b = store.create_pr(new_pr("acme/app", 2, "main")).unwrap();
        let c = store.create_pr(new_pr("acme/lib", 3, "main")).unwrap();
        let d = store.create_pr(new_pr("acme/doc", 4, "stable")).unwrap();

        assert!(matches!(
            store.create_batch("main", &[a.id, b.id]),
            Err(Error::InvalidBatch(_))
        ));
        assert!(matches!(
            store.create_batch("main", &[a.id, d.id]),
            Err(Error::InvalidBatch(_))
        ));
        let batch = store.create_batch("main", &[a.id, c.id]).unwrap();
        assert!(batch.active);
        assert_eq!(batch.prs, vec![a.id, c.id]);
    }

    #[test]
    fn test_one_active_staging_per_branch() {
        let store = MemoryStore::new();
        let first = store.create_staging(new_staging("main")).unwrap();
        assert!(matches!(
            store.create_staging(new_staging("main")),
            Err(Error::StagingExists(ref b)) if b == "main"
        ));
        // other branches are independent
        store.create_staging(new_staging("stable")).unwrap();

        let mut done = first;
        done.active = false;
        store.write_staging(&done).unwrap();
        assert!(store.create_staging(new_staging("main")).is_ok());
    }

    #[test]
    fn test_splits_are_fifo() {
        let store = MemoryStore::new();
        let old = store.create_split("main", vec![vec![1], vec![2]]).unwrap();
        let new = store.create_split("main", vec![vec![3]]).unwrap();
        store.create_split("other", vec![vec![4]]).unwrap();
        let ids: Vec<_> = store.splits("main").unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![old.id, new.id]);
    }

    #[test]
    fn test_flush_persists_and_reloads() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = MemoryStore::with_data(StoreData::default(), Some(path.clone()));
        store.create_pr(new_pr("acme/app", 9, "main")).unwrap();
        store
            .push_feedback("acme/app", 9, Some("hi".into()), false)
            .unwrap();
        store.flush().unwrap();

        let reloaded = super::super::load_state(&path).unwrap();
        assert_eq!(reloaded.pull_requests.len(), 1);
        assert_eq!(reloaded.feedback.len(), 1);
        assert_eq!(reloaded.sequence, 2);
    }
}
