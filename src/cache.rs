//! Channel state cache: per-room topic and membership.
//!
//! The whole cache sits behind one `RwLock`. Room entries appear lazily on
//! first observed activity and are never removed; a stale entry is harmless
//! and gets rebuilt by the next full member listing. All room and member keys
//! are case-folded by the caller before they reach this module.
//!
//! Cascading operations (nick change, quit) scan every cached room, mutate,
//! and hand each affected room to the caller's notify closure before the
//! write lock is released, so no reader can observe a transitional state.
//! Affected rooms are collected into a temporary list first; the member maps
//! are never mutated while being iterated.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Cached view of one room.
#[derive(Clone, Debug, Default)]
pub struct ChannelState {
    /// Topic text, if any has been observed.
    pub topic: Option<String>,
    /// Display nick of whoever set the topic.
    pub topic_set_by: Option<String>,
    /// When the topic was set.
    pub topic_set_at: Option<DateTime<Utc>>,
    /// Folded member nick → power level.
    pub members: HashMap<String, u32>,
    /// Whether `members` reflects a confirmed-complete listing. Consumers
    /// must not treat a partial map as authoritative.
    pub members_complete: bool,
    /// A member-list burst is in progress.
    syncing: bool,
}

/// The per-session room cache.
#[derive(Debug, Default)]
pub struct ChannelCache {
    rooms: RwLock<HashMap<String, ChannelState>>,
}

impl ChannelCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone the cached state for a room, if present.
    pub fn snapshot(&self, room: &str) -> Option<ChannelState> {
        self.rooms.read().get(room).cloned()
    }

    /// Merge one chunk of a member listing.
    ///
    /// The first chunk of a fresh burst clears the previous membership and
    /// the completeness flag; every following chunk merges in. Entries are
    /// (folded nick, power level).
    pub fn apply_names_chunk<I>(&self, room: &str, entries: I)
    where
        I: IntoIterator<Item = (String, u32)>,
    {
        let mut rooms = self.rooms.write();
        let state = rooms.entry(room.to_string()).or_default();
        if !state.syncing {
            state.members.clear();
            state.members_complete = false;
            state.syncing = true;
        }
        state.members.extend(entries);
    }

    /// Mark a room's member listing complete. Returns `false` when the room
    /// was never cached (nothing to mark).
    pub fn mark_complete(&self, room: &str) -> bool {
        let mut rooms = self.rooms.write();
        match rooms.get_mut(room) {
            Some(state) => {
                state.members_complete = true;
                state.syncing = false;
                true
            }
            None => false,
        }
    }

    /// Set the topic text, creating the room entry if needed.
    pub fn set_topic(&self, room: &str, topic: String) {
        let mut rooms = self.rooms.write();
        rooms.entry(room.to_string()).or_default().topic = Some(topic);
    }

    /// Merge topic metadata; either part may be absent and previously-known
    /// values survive.
    pub fn set_topic_meta(
        &self,
        room: &str,
        set_by: Option<String>,
        set_at: Option<DateTime<Utc>>,
    ) {
        let mut rooms = self.rooms.write();
        let state = rooms.entry(room.to_string()).or_default();
        if set_by.is_some() {
            state.topic_set_by = set_by;
        }
        if set_at.is_some() {
            state.topic_set_at = set_at;
        }
    }

    /// Record a join for an already-cached room. Returns whether the room was
    /// cached; uncached rooms are left alone (the membership event still goes
    /// out, the next listing rebuilds the map).
    pub fn member_join(&self, room: &str, nick: &str) -> bool {
        let mut rooms = self.rooms.write();
        match rooms.get_mut(room) {
            Some(state) => {
                state.members.insert(nick.to_string(), 0);
                true
            }
            None => false,
        }
    }

    /// Record a part for an already-cached room. Returns whether the room was
    /// cached.
    pub fn member_part(&self, room: &str, nick: &str) -> bool {
        let mut rooms = self.rooms.write();
        match rooms.get_mut(room) {
            Some(state) => {
                state.members.remove(nick);
                true
            }
            None => false,
        }
    }

    /// Rename a member across every room containing them, preserving the
    /// power level. `notify` runs once per affected room, under the write
    /// lock, with the room key and the carried-over power level.
    pub fn rename_member<F>(&self, old_nick: &str, new_nick: &str, mut notify: F)
    where
        F: FnMut(&str, u32),
    {
        let mut rooms = self.rooms.write();
        let affected: Vec<(String, u32)> = rooms
            .iter()
            .filter_map(|(room, state)| {
                state.members.get(old_nick).map(|pl| (room.clone(), *pl))
            })
            .collect();
        for (room, pl) in affected {
            let state = rooms.get_mut(&room).expect("collected from this map");
            state.members.remove(old_nick);
            state.members.insert(new_nick.to_string(), pl);
            notify(&room, pl);
        }
    }

    /// Remove a member from every room containing them (disconnect). `notify`
    /// runs once per affected room, under the write lock.
    pub fn remove_member<F>(&self, nick: &str, mut notify: F)
    where
        F: FnMut(&str, u32),
    {
        let mut rooms = self.rooms.write();
        let affected: Vec<(String, u32)> = rooms
            .iter()
            .filter_map(|(room, state)| state.members.get(nick).map(|pl| (room.clone(), *pl)))
            .collect();
        for (room, pl) in affected {
            rooms
                .get_mut(&room)
                .expect("collected from this map")
                .members
                .remove(nick);
            notify(&room, pl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(entries: &[(&str, u32)]) -> Vec<(String, u32)> {
        entries.iter().map(|(n, p)| (n.to_string(), *p)).collect()
    }

    #[test]
    fn test_burst_then_complete_replaces_membership() {
        let cache = ChannelCache::new();
        cache.apply_names_chunk("#a", chunk(&[("stale", 0)]));
        cache.mark_complete("#a");

        // A fresh burst starts: the stale member must not survive, and the
        // map must not read as complete mid-burst.
        cache.apply_names_chunk("#a", chunk(&[("alice", 50), ("bob", 0)]));
        let mid = cache.snapshot("#a").unwrap();
        assert!(!mid.members_complete);
        assert!(!mid.members.contains_key("stale"));

        cache.apply_names_chunk("#a", chunk(&[("carol", 1)]));
        assert!(cache.mark_complete("#a"));

        let state = cache.snapshot("#a").unwrap();
        assert!(state.members_complete);
        assert_eq!(state.members.len(), 3);
        assert_eq!(state.members["alice"], 50);
        assert_eq!(state.members["carol"], 1);
    }

    #[test]
    fn test_mark_complete_uncached_room() {
        let cache = ChannelCache::new();
        assert!(!cache.mark_complete("#nowhere"));
    }

    #[test]
    fn test_nick_change_cascades_to_exactly_member_rooms() {
        let cache = ChannelCache::new();
        cache.apply_names_chunk("#a", chunk(&[("alice", 50), ("dave", 0)]));
        cache.apply_names_chunk("#b", chunk(&[("alice", 1)]));
        cache.apply_names_chunk("#c", chunk(&[("dave", 0)]));

        let mut notified = Vec::new();
        cache.rename_member("alice", "bob", |room, pl| {
            notified.push((room.to_string(), pl));
        });
        notified.sort();

        assert_eq!(
            notified,
            vec![("#a".to_string(), 50), ("#b".to_string(), 1)]
        );
        let a = cache.snapshot("#a").unwrap();
        assert!(!a.members.contains_key("alice"));
        assert_eq!(a.members["bob"], 50);
        let b = cache.snapshot("#b").unwrap();
        assert_eq!(b.members["bob"], 1);
        assert!(!cache.snapshot("#c").unwrap().members.contains_key("bob"));
    }

    #[test]
    fn test_quit_removes_from_every_room() {
        let cache = ChannelCache::new();
        cache.apply_names_chunk("#a", chunk(&[("alice", 0), ("bob", 50)]));
        cache.apply_names_chunk("#b", chunk(&[("alice", 1)]));

        let mut rooms = Vec::new();
        cache.remove_member("alice", |room, _| rooms.push(room.to_string()));
        rooms.sort();

        assert_eq!(rooms, vec!["#a", "#b"]);
        assert!(!cache.snapshot("#a").unwrap().members.contains_key("alice"));
        assert!(cache.snapshot("#a").unwrap().members.contains_key("bob"));
    }

    #[test]
    fn test_join_part_uncached_room_is_noop() {
        let cache = ChannelCache::new();
        assert!(!cache.member_join("#x", "alice"));
        assert!(!cache.member_part("#x", "alice"));
        assert!(cache.snapshot("#x").is_none());
    }

    #[test]
    fn test_topic_parts_merge_in_any_order() {
        let cache = ChannelCache::new();
        let when = DateTime::from_timestamp(1_700_000_000, 0);
        cache.set_topic_meta("#a", None, when);
        cache.set_topic("#a", "welcome".into());
        cache.set_topic_meta("#a", Some("alice".into()), None);

        let state = cache.snapshot("#a").unwrap();
        assert_eq!(state.topic.as_deref(), Some("welcome"));
        assert_eq!(state.topic_set_by.as_deref(), Some("alice"));
        assert_eq!(state.topic_set_at, when);
    }
}
