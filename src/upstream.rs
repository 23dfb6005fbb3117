//! # Upstream Change Stream
//!
//! The event shape the core consumes from whatever collaborator is
//! watching the replicated directory. The collaborator
//! itself (an LDAP syncrepl client, a filesystem watcher, …) is out of
//! scope for this crate; only the queue contract it must honor is
//! defined here.

use crate::value::AttributeMap;

/// One upstream notification, keyed by a text uuid.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// Initial census entry; ignored by the core.
    Present { uuid: String },
    Add { uuid: String, attrs: AttributeMap },
    /// Lowered to `delete` then `add` before it reaches the router;
    /// carried as one event here so the controller can decide how to
    /// interleave it with other uuids.
    Modify { uuid: String, attrs: AttributeMap },
    Delete { uuid: String },
}

impl ChangeEvent {
    pub fn uuid(&self) -> &str {
        match self {
            ChangeEvent::Present { uuid }
            | ChangeEvent::Add { uuid, .. }
            | ChangeEvent::Modify { uuid, .. }
            | ChangeEvent::Delete { uuid } => uuid,
        }
    }
}

/// A resume token the controller persists to `syncrepl_cookie` and
/// presents back to the collaborator on restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookie(pub Vec<u8>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_accessor_covers_every_variant() {
        let events = vec![
            ChangeEvent::Present { uuid: "a".to_string() },
            ChangeEvent::Add {
                uuid: "b".to_string(),
                attrs: AttributeMap::new(),
            },
            ChangeEvent::Modify {
                uuid: "c".to_string(),
                attrs: AttributeMap::new(),
            },
            ChangeEvent::Delete { uuid: "d".to_string() },
        ];
        let uuids: Vec<&str> = events.iter().map(ChangeEvent::uuid).collect();
        assert_eq!(uuids, vec!["a", "b", "c", "d"]);
    }
}
