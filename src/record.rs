// Generic record trait for any storable type

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Core trait that any storable record must implement
pub trait Record: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static {
    /// Identifier assigned to this record
    ///
    /// The store looks records up by this value but never checks it for uniqueness.
    fn id(&self) -> &str;

    /// Slot name for this record type (e.g., "farmers")
    /// Determines the slot filename: {slot}.json
    fn slot_name() -> &'static str
    where
        Self: Sized;

    /// Fields to index for filtering
    /// Return empty HashMap if no fields should be indexed
    fn indexed_fields(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// What changed in a sequence since the last one a [`SeenIds`] was given
#[derive(Debug)]
pub struct SequenceDelta<'a, R> {
    /// Records whose id was not in the previous sequence, in sequence order
    pub added: Vec<&'a R>,
    /// Ids from the previous sequence that are gone
    pub removed: usize,
}

impl<R> SequenceDelta<'_, R> {
    /// The sequence was rewritten rather than appended to
    pub fn is_replacement(&self) -> bool {
        self.removed > 0
    }
}

/// Ids a watcher has already reported
#[derive(Debug, Default)]
pub struct SeenIds {
    ids: HashSet<String>,
}

impl SeenIds {
    pub fn from_records<R: Record>(records: &[R]) -> Self {
        Self {
            ids: records.iter().map(|r| r.id().to_string()).collect(),
        }
    }

    /// Compare by id against the previous sequence, then remember this one
    pub fn update<'a, R: Record>(&mut self, records: &'a [R]) -> SequenceDelta<'a, R> {
        let current: HashSet<String> = records.iter().map(|r| r.id().to_string()).collect();

        let mut reported = HashSet::new();
        let added = records
            .iter()
            .filter(|&r| !self.ids.contains(r.id()) && reported.insert(r.id()))
            .collect();
        let removed = self.ids.difference(&current).count();

        self.ids = current;
        SequenceDelta { added, removed }
    }
}
