//! Named transaction checkpoints.

use std::collections::{HashMap, HashSet};

use crate::hooks::AuditEvent;
use crate::types::{Invid, ObjectStatus};
use crate::value::FieldMap;

/// Everything needed to rewind a transaction's private state: audit
/// events, shadow contents, and deletion bookkeeping. Namespace and link
/// state is checkpointed by the registries themselves under the same name.
#[derive(Debug, Clone)]
pub(crate) struct Checkpoint {
    pub events: Vec<AuditEvent>,
    pub objects: HashMap<Invid, (FieldMap, ObjectStatus)>,
    pub delete_locks: HashSet<Invid>,
    pub deleting: HashSet<Invid>,
}

/// A stack of named checkpoints.
///
/// Names may repeat; operations resolve a name to its most recent
/// occurrence and discard everything stacked above it.
#[derive(Debug, Default)]
pub(crate) struct CheckpointStack {
    entries: Vec<(String, Checkpoint)>,
}

impl CheckpointStack {
    pub fn push(&mut self, name: &str, checkpoint: Checkpoint) {
        self.entries.push((name.to_owned(), checkpoint));
    }

    /// Removes the most recent checkpoint called `name`, discarding any
    /// checkpoints stacked above it.
    pub fn pop(&mut self, name: &str) -> Option<Checkpoint> {
        let index = self.entries.iter().rposition(|(n, _)| n == name)?;
        self.entries.truncate(index + 1);
        self.entries.pop().map(|(_, checkpoint)| checkpoint)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            events: Vec::new(),
            objects: HashMap::new(),
            delete_locks: HashSet::new(),
            deleting: HashSet::new(),
        }
    }

    #[test]
    fn pop_resolves_most_recent_name() {
        let mut stack = CheckpointStack::default();
        stack.push("a", checkpoint());
        stack.push("b", checkpoint());
        stack.push("a", checkpoint());

        assert!(stack.pop("a").is_some());
        // The earlier "a" and the "b" remain.
        assert!(stack.pop("b").is_some());
        assert!(stack.pop("a").is_some());
        assert!(stack.is_empty());
    }

    #[test]
    fn pop_discards_everything_above() {
        let mut stack = CheckpointStack::default();
        stack.push("outer", checkpoint());
        stack.push("inner", checkpoint());

        assert!(stack.pop("outer").is_some());
        assert!(stack.pop("inner").is_none());
    }

    #[test]
    fn pop_unknown_name_is_none() {
        let mut stack = CheckpointStack::default();
        stack.push("a", checkpoint());
        assert!(stack.pop("missing").is_none());
        assert!(!stack.is_empty());
    }
}
