//! Commit Log
//!
//! Append-only, capacity-bounded history of full dataset snapshots. Each
//! successful mutation appends one immutable commit; when the log is at
//! capacity the oldest entry is evicted (FIFO). Rollback is expressed as a
//! regular append with action `"rollback"`, so prior history is never
//! rewritten and a rollback can itself be rolled back.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Dataset, DatasetStats};

/// Default number of commits retained per dataset.
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Action tag recorded for rollback commits.
pub const ROLLBACK_ACTION: &str = "rollback";

/// Origin of a mutation. `Primary` is the human editor, `Secondary` the
/// automated agent; unknown tags round-trip through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitSource {
    Primary,
    Secondary,
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for CommitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitSource::Primary => write!(f, "primary"),
            CommitSource::Secondary => write!(f, "secondary"),
            CommitSource::Other(tag) => write!(f, "{tag}"),
        }
    }
}

/// An immutable history entry: metadata plus a full deep copy of the dataset
/// at the moment after the mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: CommitSource,
    pub action: String,
    pub summary: String,
    pub stats: DatasetStats,
    pub snapshot: Dataset,
}

impl Commit {
    /// Metadata view without the snapshot (listing cost control).
    pub fn meta(&self) -> CommitMeta {
        CommitMeta {
            id: self.id.clone(),
            timestamp: self.timestamp,
            source: self.source.clone(),
            action: self.action.clone(),
            summary: self.summary.clone(),
            stats: self.stats,
        }
    }
}

/// Commit metadata, excluding the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMeta {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: CommitSource,
    pub action: String,
    pub summary: String,
    pub stats: DatasetStats,
}

/// Detail view of one commit: its snapshot plus the snapshot of the
/// immediately preceding commit (None for the first retained commit).
#[derive(Debug, Clone, Serialize)]
pub struct CommitDetail {
    pub commit: CommitMeta,
    pub snapshot: Dataset,
    #[serde(rename = "prevSnapshot")]
    pub prev_snapshot: Option<Dataset>,
}

/// Per-dataset bounded commit history.
///
/// Canonical internal order is chronological ascending; presentation order is
/// a consumer concern. Capacity is a fixed configuration constant, not
/// adjustable per dataset.
#[derive(Debug)]
pub struct CommitLog {
    entries: VecDeque<Commit>,
    capacity: usize,
}

impl CommitLog {
    /// Create an empty log retaining at most `capacity` commits.
    pub fn new(capacity: usize) -> Self {
        CommitLog {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    /// Rebuild a log from persisted commits, trimming to capacity from the
    /// oldest end if the persisted history is longer.
    pub fn from_commits(capacity: usize, commits: Vec<Commit>) -> Self {
        let mut log = CommitLog::new(capacity);
        for commit in commits {
            if log.entries.len() == log.capacity {
                log.entries.pop_front();
            }
            log.entries.push_back(commit);
        }
        log
    }

    /// Append a new commit built from a post-mutation snapshot, evicting the
    /// oldest entry if at capacity. Stats are computed from the snapshot.
    pub fn append(
        &mut self,
        source: CommitSource,
        action: &str,
        summary: String,
        snapshot: Dataset,
    ) -> CommitMeta {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        let commit = Commit {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source,
            action: action.to_string(),
            summary,
            stats: snapshot.stats(),
            snapshot,
        };
        let meta = commit.meta();
        self.entries.push_back(commit);
        meta
    }

    /// Commit metadata in chronological ascending order, snapshots excluded.
    pub fn list(&self) -> Vec<CommitMeta> {
        self.entries.iter().map(Commit::meta).collect()
    }

    /// Full commit plus the immediately preceding commit's snapshot.
    pub fn get(&self, commit_id: &str) -> Option<CommitDetail> {
        let idx = self.entries.iter().position(|c| c.id == commit_id)?;
        let commit = &self.entries[idx];
        let prev_snapshot = idx
            .checked_sub(1)
            .map(|i| self.entries[i].snapshot.clone());
        Some(CommitDetail {
            commit: commit.meta(),
            snapshot: commit.snapshot.clone(),
            prev_snapshot,
        })
    }

    /// Snapshot stored in a commit, for rollback.
    pub fn snapshot_of(&self, commit_id: &str) -> Option<&Dataset> {
        self.entries
            .iter()
            .find(|c| c.id == commit_id)
            .map(|c| &c.snapshot)
    }

    /// Drop the newest commit. Used to unwind an append when the persistence
    /// write behind it could not be completed.
    pub fn pop_newest(&mut self) -> Option<Commit> {
        self.entries.pop_back()
    }

    /// All commits, chronological ascending. Used by the persist layer.
    pub fn commits(&self) -> impl Iterator<Item = &Commit> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, Dataset};

    fn snapshot_with_categories(n: usize) -> Dataset {
        let mut ds = Dataset::new("test");
        for i in 0..n {
            ds.categories.push(Category::new(format!("cat{i}")));
        }
        ds
    }

    #[test]
    fn test_append_computes_stats() {
        let mut log = CommitLog::new(10);
        let meta = log.append(
            CommitSource::Primary,
            "add_category",
            "Added category \"Mobs\"".to_string(),
            snapshot_with_categories(1),
        );
        assert_eq!(meta.stats.categories, 1);
        assert_eq!(meta.stats.chunks, 0);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_fifo_eviction_at_capacity() {
        let mut log = CommitLog::new(3);
        let mut ids = Vec::new();
        for i in 0..5 {
            let meta = log.append(
                CommitSource::Primary,
                "edit",
                format!("edit {i}"),
                snapshot_with_categories(i),
            );
            ids.push(meta.id);
        }
        assert_eq!(log.len(), 3);
        let listed: Vec<String> = log.list().into_iter().map(|m| m.id).collect();
        // Oldest two evicted, order preserved
        assert_eq!(listed, ids[2..].to_vec());
    }

    #[test]
    fn test_list_is_chronological_ascending() {
        let mut log = CommitLog::new(10);
        for i in 0..4 {
            log.append(
                CommitSource::Secondary,
                "edit",
                format!("edit {i}"),
                snapshot_with_categories(i),
            );
        }
        let listed = log.list();
        for pair in listed.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn test_get_returns_previous_snapshot() {
        let mut log = CommitLog::new(10);
        let first = log.append(
            CommitSource::Primary,
            "a",
            "first".to_string(),
            snapshot_with_categories(1),
        );
        let second = log.append(
            CommitSource::Primary,
            "b",
            "second".to_string(),
            snapshot_with_categories(2),
        );

        let detail = log.get(&first.id).unwrap();
        assert!(detail.prev_snapshot.is_none());

        let detail = log.get(&second.id).unwrap();
        assert_eq!(detail.snapshot.categories.len(), 2);
        assert_eq!(detail.prev_snapshot.unwrap().categories.len(), 1);

        assert!(log.get("missing").is_none());
    }

    #[test]
    fn test_snapshot_does_not_alias_live_state() {
        let mut log = CommitLog::new(10);
        let mut live = snapshot_with_categories(1);
        log.append(
            CommitSource::Primary,
            "a",
            "first".to_string(),
            live.snapshot(),
        );
        live.categories[0].name = "renamed".to_string();

        let listed = log.list();
        let detail = log.get(&listed[0].id).unwrap();
        assert_eq!(detail.snapshot.categories[0].name, "cat0");
    }

    #[test]
    fn test_commit_source_serde() {
        assert_eq!(
            serde_json::to_string(&CommitSource::Primary).unwrap(),
            "\"primary\""
        );
        let parsed: CommitSource = serde_json::from_str("\"secondary\"").unwrap();
        assert_eq!(parsed, CommitSource::Secondary);
        let parsed: CommitSource = serde_json::from_str("\"batch-job\"").unwrap();
        assert_eq!(parsed, CommitSource::Other("batch-job".to_string()));
    }

    #[test]
    fn test_commit_meta_excludes_snapshot() {
        let mut log = CommitLog::new(10);
        log.append(
            CommitSource::Primary,
            "a",
            "s".to_string(),
            snapshot_with_categories(2),
        );
        let json = serde_json::to_value(&log.list()[0]).unwrap();
        assert!(json.get("snapshot").is_none());
        assert!(json.get("stats").is_some());
    }

    #[test]
    fn test_from_commits_trims_to_capacity() {
        let mut source = CommitLog::new(10);
        for i in 0..6 {
            source.append(
                CommitSource::Primary,
                "edit",
                format!("edit {i}"),
                snapshot_with_categories(i),
            );
        }
        let commits: Vec<Commit> = source.commits().cloned().collect();
        let rebuilt = CommitLog::from_commits(4, commits);
        assert_eq!(rebuilt.len(), 4);
        assert_eq!(rebuilt.list()[0].summary, "edit 2");
    }
}
