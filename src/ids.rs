//! Message id and timestamp generation.
//!
//! Ids are epoch-millisecond strings, the same scheme the UI uses for messages
//! it creates itself. When that collides with an existing id, an index plus a
//! short random suffix is appended.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashSet;
use tracing::warn;

use crate::store::Message;

/// Source of "now". Injected so id generation is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// ISO 8601 with millisecond precision and a `Z` suffix
pub fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_iso(clock: &dyn Clock) -> String {
    iso(clock.now())
}

/// Hands out ids that do not collide with any id seen so far
pub struct IdAllocator<'a> {
    taken: HashSet<String>,
    clock: &'a dyn Clock,
}

impl<'a> IdAllocator<'a> {
    pub fn new<I, S>(existing: I, clock: &'a dyn Clock) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            taken: existing.into_iter().map(Into::into).collect(),
            clock,
        }
    }

    pub fn for_messages(messages: &[Message], clock: &'a dyn Clock) -> Self {
        Self::new(messages.iter().map(|m| m.id.clone()), clock)
    }

    /// Reserve an id that was chosen elsewhere. Returns false if already taken.
    pub fn reserve(&mut self, id: &str) -> bool {
        self.taken.insert(id.to_string())
    }

    pub fn next_id(&mut self) -> String {
        let base = self.clock.now().timestamp_millis().to_string();
        if self.taken.insert(base.clone()) {
            return base;
        }
        let mut index = 1usize;
        loop {
            let candidate = format!("{}-{}-{}", base, index, random_suffix());
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            index += 1;
        }
    }
}

fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..6].to_string()
}

/// Rewrite every repeated id (second occurrence onward) with a fresh one.
/// Returns how many messages were rewritten.
pub fn dedupe_ids(messages: &mut [Message], clock: &dyn Clock) -> usize {
    let mut seen: HashSet<String> = HashSet::new();
    let mut duplicates = Vec::new();
    for (idx, msg) in messages.iter().enumerate() {
        if !seen.insert(msg.id.clone()) {
            duplicates.push(idx);
        }
    }
    if duplicates.is_empty() {
        return 0;
    }

    let mut alloc = IdAllocator::new(seen, clock);
    for &idx in &duplicates {
        let fresh = alloc.next_id();
        warn!("Duplicate message id {} rewritten to {}", messages[idx].id, fresh);
        messages[idx].id = fresh;
    }
    duplicates.len()
}


#[cfg(test)]
mod tests {
    use super::test_clock::FixedClock;
    use super::*;

    #[test]
    fn test_iso_format() {
        let clock = FixedClock(1_700_000_000_000);
        assert_eq!(now_iso(&clock), "2023-11-14T22:13:20.000Z");
    }

    #[test]
    fn test_allocator_avoids_collisions() {
        let clock = FixedClock(1_700_000_000_000);
        let mut alloc = IdAllocator::new(["1700000000000"], &clock);
        let a = alloc.next_id();
        let b = alloc.next_id();
        assert!(a.starts_with("1700000000000-1-"));
        assert_ne!(a, b);
        assert_ne!(a, "1700000000000");
    }

    #[test]
    fn test_allocator_uses_plain_timestamp_when_free() {
        let clock = FixedClock(42);
        let mut alloc = IdAllocator::new(Vec::<String>::new(), &clock);
        assert_eq!(alloc.next_id(), "42");
        assert!(!alloc.reserve("42"));
    }

    #[test]
    fn test_dedupe_ids() {
        let clock = FixedClock(5);
        let mut msgs = vec![
            Message::new("a", "one", "t"),
            Message::new("a", "two", "t"),
            Message::new("b", "three", "t"),
            Message::new("a", "four", "t"),
        ];
        assert_eq!(dedupe_ids(&mut msgs, &clock), 2);
        let ids: HashSet<&str> = msgs.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(msgs[0].id, "a");
        assert_eq!(msgs[2].id, "b");
    }
}
