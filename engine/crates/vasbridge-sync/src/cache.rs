//! Per-task record of what a sink already told its downstream

use std::collections::{HashMap, HashSet};
use vasbridge_core::Vulnerability;

/// Change of one task between the known state and a new report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// In the report but not yet published
    pub news: HashSet<Vulnerability>,
    /// Published before but gone from the report
    pub outdated: HashSet<Vulnerability>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.news.is_empty() && self.outdated.is_empty()
    }

    pub fn len(&self) -> usize {
        self.news.len() + self.outdated.len()
    }
}

/// Known vulnerabilities per task
///
/// Reads never mutate. Each sink owns one cache and commits a diff only
/// after its side effect went through, so a failed publish is derived
/// again on the next poll.
#[derive(Debug, Default)]
pub struct VulnerabilityCache {
    known: HashMap<String, HashSet<Vulnerability>>,
}

impl VulnerabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `incoming` minus what is known for `task_id`
    pub fn indicate_new(&self, task_id: &str, incoming: &HashSet<Vulnerability>) -> HashSet<Vulnerability> {
        match self.known.get(task_id) {
            Some(known) => incoming.difference(known).cloned().collect(),
            None => incoming.clone(),
        }
    }

    /// What is known for `task_id` minus `incoming`
    pub fn indicate_outdated(&self, task_id: &str, incoming: &HashSet<Vulnerability>) -> HashSet<Vulnerability> {
        match self.known.get(task_id) {
            Some(known) => known.difference(incoming).cloned().collect(),
            None => HashSet::new(),
        }
    }

    pub fn diff(&self, task_id: &str, incoming: &HashSet<Vulnerability>) -> Diff {
        Diff {
            news: self.indicate_new(task_id, incoming),
            outdated: self.indicate_outdated(task_id, incoming),
        }
    }

    pub fn add_to_task<'a>(&mut self, task_id: &str, vulnerabilities: impl IntoIterator<Item = &'a Vulnerability>) {
        self.known
            .entry(task_id.to_string())
            .or_default()
            .extend(vulnerabilities.into_iter().cloned());
    }

    pub fn remove_from_task<'a>(
        &mut self,
        task_id: &str,
        vulnerabilities: impl IntoIterator<Item = &'a Vulnerability>,
    ) {
        if let Some(known) = self.known.get_mut(task_id) {
            for v in vulnerabilities {
                known.remove(v);
            }
        }
    }

    /// Record `diff` as published: outdated entries go first, then news
    pub fn commit(&mut self, task_id: &str, diff: &Diff) {
        self.remove_from_task(task_id, &diff.outdated);
        self.add_to_task(task_id, &diff.news);
    }

    /// Known set of `task_id`, `None` for a task never seen
    pub fn known(&self, task_id: &str) -> Option<&HashSet<Vulnerability>> {
        self.known.get(task_id)
    }

    /// Number of tasks with any history
    pub fn task_count(&self) -> usize {
        self.known.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(id: &str) -> Vulnerability {
        Vulnerability::builder(id, "10.0.0.1").build()
    }

    fn set(ids: &[&str]) -> HashSet<Vulnerability> {
        ids.iter().map(|id| v(id)).collect()
    }

    #[test]
    fn test_unknown_task_is_empty() {
        let cache = VulnerabilityCache::new();
        assert_eq!(cache.indicate_new("t1", &set(&["a", "b"])), set(&["a", "b"]));
        assert!(cache.indicate_outdated("t1", &set(&["a"])).is_empty());
        assert!(cache.known("t1").is_none());
    }

    #[test]
    fn test_set_replace_semantics() {
        let mut cache = VulnerabilityCache::new();
        let first = set(&["a", "b"]);
        let diff = cache.diff("t1", &first);
        cache.commit("t1", &diff);
        assert_eq!(cache.known("t1"), Some(&first));

        let second = set(&["b", "c"]);
        let diff = cache.diff("t1", &second);
        assert_eq!(diff.news, set(&["c"]));
        assert_eq!(diff.outdated, set(&["a"]));

        cache.commit("t1", &diff);
        assert_eq!(cache.known("t1"), Some(&second));
    }

    #[test]
    fn test_reads_do_not_mutate() {
        let mut cache = VulnerabilityCache::new();
        cache.add_to_task("t1", &set(&["a"]));

        let _ = cache.diff("t1", &set(&["b"]));
        assert_eq!(cache.known("t1"), Some(&set(&["a"])));
        assert!(cache.diff("t1", &set(&["a"])).is_empty());
    }

    #[test]
    fn test_tasks_are_independent() {
        let mut cache = VulnerabilityCache::new();
        cache.add_to_task("t1", &set(&["a"]));
        cache.add_to_task("t2", &set(&["b"]));
        cache.remove_from_task("t1", &set(&["a", "b"]));

        assert!(cache.known("t1").map_or(false, HashSet::is_empty));
        assert_eq!(cache.known("t2"), Some(&set(&["b"])));
        assert_eq!(cache.task_count(), 2);
    }

    #[test]
    fn test_changed_field_is_new_entry() {
        let mut cache = VulnerabilityCache::new();
        cache.add_to_task("t1", &set(&["a"]));

        let mut changed = v("a");
        changed.description = "updated".into();
        let incoming: HashSet<Vulnerability> = [changed.clone()].into_iter().collect();

        let diff = cache.diff("t1", &incoming);
        assert_eq!(diff.news, incoming);
        assert_eq!(diff.outdated, set(&["a"]));
        assert_eq!(diff.len(), 2);
    }
}
