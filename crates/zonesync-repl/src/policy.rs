//! Bucket sync policy: pipes, filters and rule selection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A zone and bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipeEndpoint {
    /// Zone name.
    pub zone: String,
    /// Bucket name.
    pub bucket: String,
}

/// Object predicate of a pipe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeFilter {
    /// Objects must start with this prefix.
    pub prefix: Option<String>,
    /// Objects must carry every one of these tags.
    pub tags: Vec<(String, String)>,
}

impl PipeFilter {
    /// True if `key` with `tags` passes the filter.
    pub fn matches(&self, key: &str, tags: &[(String, String)]) -> bool {
        if let Some(prefix) = &self.prefix {
            if !key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.tags.iter().all(|t| tags.contains(t))
    }

    fn prefix_len(&self) -> usize {
        self.prefix.as_ref().map_or(0, |p| p.len())
    }
}

/// A configured source-bucket to destination-bucket mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicyPipe {
    /// Pipe id.
    pub id: String,
    /// Where data comes from.
    pub source: PipeEndpoint,
    /// Which source objects the pipe carries.
    #[serde(default)]
    pub filter: PipeFilter,
    /// Where data goes.
    pub dest: PipeEndpoint,
    /// Tie-break between pipes with equally long prefixes; higher wins.
    #[serde(default)]
    pub priority: i32,
}

/// Pipes sharing one source and destination bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipeRules {
    pipes: Vec<SyncPolicyPipe>,
}

impl PipeRules {
    /// Rules over `pipes`.
    pub fn new(pipes: Vec<SyncPolicyPipe>) -> Self {
        Self { pipes }
    }

    /// The pipe handling `key`: longest matching prefix, then highest priority.
    pub fn select(&self, key: &str, tags: &[(String, String)]) -> Option<&SyncPolicyPipe> {
        self.pipes
            .iter()
            .filter(|p| p.filter.matches(key, tags))
            .max_by_key(|p| (p.filter.prefix_len(), p.priority))
    }

    /// Pipes in these rules.
    pub fn pipes(&self) -> &[SyncPolicyPipe] {
        &self.pipes
    }
}

/// All pipes from one source bucket into one destination bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeGroup {
    /// Source zone and bucket.
    pub source: PipeEndpoint,
    /// Destination bucket in the local zone.
    pub dest_bucket: String,
    /// Rules choosing a pipe per object.
    pub rules: PipeRules,
}

/// Groups the pipes that deliver into `local_zone` by source and destination bucket.
pub fn group_pipes(pipes: &[SyncPolicyPipe], local_zone: &str) -> Vec<PipeGroup> {
    let mut groups: BTreeMap<(String, String, String), Vec<SyncPolicyPipe>> = BTreeMap::new();
    for pipe in pipes.iter().filter(|p| p.dest.zone == local_zone) {
        groups
            .entry((
                pipe.source.zone.clone(),
                pipe.source.bucket.clone(),
                pipe.dest.bucket.clone(),
            ))
            .or_default()
            .push(pipe.clone());
    }
    groups
        .into_iter()
        .map(|((zone, bucket, dest_bucket), pipes)| PipeGroup {
            source: PipeEndpoint { zone, bucket },
            dest_bucket,
            rules: PipeRules::new(pipes),
        })
        .collect()
}
