//! Contact directory: best-effort id to display-name cache.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::identity::PeerId;

/// Result of recording a name in the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactUpdate {
    /// The id was not known before.
    Added,
    /// The id was known under another name.
    Renamed { previous: String },
    /// Nothing changed.
    Unchanged,
}

/// Shared map from peer id to last-known display name.
///
/// Entries are only added or renamed during a run; nothing is ever removed.
/// Every read-modify-write happens under a single lock acquisition.
#[derive(Debug, Default)]
pub struct ContactDirectory {
    entries: RwLock<HashMap<PeerId, String>>,
}

impl ContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id → name`, replacing any previous name for the id.
    pub fn upsert(&self, id: &PeerId, name: &str) -> ContactUpdate {
        let mut entries = self.entries.write();
        match entries.get_mut(id) {
            Some(existing) if existing == name => ContactUpdate::Unchanged,
            Some(existing) => {
                let previous = std::mem::replace(existing, name.to_string());
                ContactUpdate::Renamed { previous }
            }
            None => {
                entries.insert(id.clone(), name.to_string());
                ContactUpdate::Added
            }
        }
    }

    /// Record `id → name` only if the id is unknown. Returns whether it was added.
    pub fn insert_if_absent(&self, id: &PeerId, name: &str) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(id) {
            return false;
        }
        entries.insert(id.clone(), name.to_string());
        true
    }

    /// Look up the display name for `id`.
    pub fn resolve(&self, id: &PeerId) -> Option<String> {
        self.entries.read().get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All contacts sorted by name, for display.
    pub fn snapshot(&self) -> Vec<(PeerId, String)> {
        let mut all: Vec<(PeerId, String)> = self
            .entries
            .read()
            .iter()
            .map(|(id, name)| (id.clone(), name.clone()))
            .collect();
        all.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
        all
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_upsert_updates_without_duplicating() {
        let contacts = ContactDirectory::new();
        let id = PeerId::from_string("sam");

        assert_eq!(contacts.upsert(&id, "Sam"), ContactUpdate::Added);
        assert_eq!(contacts.upsert(&id, "Sam"), ContactUpdate::Unchanged);
        assert_eq!(
            contacts.upsert(&id, "Samuel"),
            ContactUpdate::Renamed {
                previous: "Sam".to_string()
            }
        );
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts.resolve(&id).as_deref(), Some("Samuel"));
    }

    #[test]
    fn test_insert_if_absent_never_overwrites() {
        let contacts = ContactDirectory::new();
        let id = PeerId::from_string("host");

        contacts.upsert(&id, "Hana");
        assert!(!contacts.insert_if_absent(&id, "Host (host)"));
        assert_eq!(contacts.resolve(&id).as_deref(), Some("Hana"));

        let other = PeerId::from_string("new");
        assert!(contacts.insert_if_absent(&other, "Peer (new)"));
        assert!(contacts.contains(&other));
    }

    #[test]
    fn test_resolve_unknown() {
        let contacts = ContactDirectory::new();
        assert!(contacts.is_empty());
        assert!(contacts.resolve(&PeerId::from_string("ghost")).is_none());
    }

    #[test]
    fn test_concurrent_inserts_keyed_by_id() {
        let contacts = Arc::new(ContactDirectory::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let contacts = Arc::clone(&contacts);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let id = PeerId::from_string(format!("peer-{i}"));
                        contacts.insert_if_absent(&id, &format!("thread-{t}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(contacts.len(), 100);
    }

    #[test]
    fn test_snapshot_sorted_by_name() {
        let contacts = ContactDirectory::new();
        contacts.upsert(&PeerId::from_string("2"), "Zoe");
        contacts.upsert(&PeerId::from_string("1"), "Ana");
        let names: Vec<String> = contacts.snapshot().into_iter().map(|(_, n)| n).collect();
        assert_eq!(names, vec!["Ana", "Zoe"]);
    }
}
