use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle to a live WebSocket session.
///
/// Identifiers are issued from a process-wide monotonic counter, so a value
/// is never reused across disconnect/reconnect. Users hold identifiers,
/// never sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_are_unique_and_ordered() {
        let a = SessionId::next();
        let b = SessionId::next();
        let c = SessionId::next();
        assert!(a < b);
        assert!(b < c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_identifier_is_printable_and_hashable() {
        let id = SessionId::next();
        assert_eq!(format!("{}", id), format!("{}", id.value()));

        let mut set = std::collections::BTreeSet::new();
        set.insert(id);
        assert!(set.contains(&id));
    }
}
