use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::identity::ContainerIdentity;
use crate::record::ClassRecord;

/// Everything decoded from one container, keyed by class name.
///
/// Indexes are immutable once built and are shared between module views as
/// `Arc<PerContainerIndex>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerContainerIndex {
    pub identity: ContainerIdentity,
    pub classes: BTreeMap<String, ClassRecord>,
    /// At least one entry failed to decode, fully or partially.
    pub incomplete: bool,
    /// `(entry name, reason)` for every entry that did not decode cleanly.
    pub failures: Vec<(String, String)>,
}

impl PerContainerIndex {
    pub fn new(identity: ContainerIdentity) -> Self {
        Self {
            identity,
            classes: BTreeMap::new(),
            incomplete: false,
            failures: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ClassRecord> {
        self.classes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &ClassRecord> {
        self.classes.values()
    }

    /// Adds a decoded record. A second record with the same name (two entries
    /// claiming one class) is dropped and noted as a failure.
    pub fn insert(&mut self, entry: &str, record: ClassRecord) {
        if self.classes.contains_key(&record.name) {
            self.record_failure(entry, format!("duplicate definition of {}", record.name));
            return;
        }
        if record.partial {
            self.incomplete = true;
        }
        self.classes.insert(record.name.clone(), record);
    }

    pub fn record_failure(&mut self, entry: &str, reason: impl Into<String>) {
        self.incomplete = true;
        self.failures.push((entry.to_string(), reason.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ContainerIdentity {
        ContainerIdentity {
            path: "/lib/a.jar".to_string(),
            size: 1,
            last_modified: 1,
            digest: None,
        }
    }

    #[test]
    fn partial_records_mark_index_incomplete() {
        let mut index = PerContainerIndex::new(identity());
        index.insert("a/A.class", ClassRecord::new("a.A"));
        assert!(!index.incomplete);

        let mut partial = ClassRecord::new("a.B");
        partial.partial = true;
        index.insert("a/B.class", partial);
        assert!(index.incomplete);
        assert_eq!(index.class_names().collect::<Vec<_>>(), vec!["a.A", "a.B"]);
    }

    #[test]
    fn duplicate_class_keeps_first() {
        let mut index = PerContainerIndex::new(identity());
        let mut first = ClassRecord::new("a.A");
        first.interfaces.push("x.I".to_string());
        index.insert("a/A.class", first);
        index.insert("b/A.class", ClassRecord::new("a.A"));

        assert_eq!(index.len(), 1);
        assert_eq!(index.get("a.A").unwrap().interfaces, vec!["x.I".to_string()]);
        assert!(index.incomplete);
        assert_eq!(index.failures[0].0, "b/A.class");
    }
}
