//! Per-connection replay protection.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use strata_types::{AccountAddress, Timestamp};

/// Key of one client connection.
pub(crate) type ConnectionKey = (AccountAddress, u64);

/// Highest sequence number accepted on a connection, and the newest request
/// timestamp seen on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReplayMark {
    pub signee: AccountAddress,
    pub connection_id: u64,
    pub seq_no: u64,
    pub latest: Timestamp,
}

impl ReplayMark {
    fn key(&self) -> ConnectionKey {
        (self.signee, self.connection_id)
    }
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// Sequence number not above the last one accepted.
    Replayed { last: u64 },
    /// Signed before the guard was restored from disk.
    BeforeRestart,
}

/// Accepts a request only if its sequence number is above the last one
/// seen on its connection.
///
/// Requests older than `window` already fail the freshness check, so a mark
/// whose newest timestamp has fallen out of the window can be forgotten.
/// After a restart, requests signed before `floor` are rejected: their marks
/// may not have reached disk.
#[derive(Debug)]
pub(crate) struct ReplayGuard {
    window: Duration,
    floor: Timestamp,
    marks: HashMap<ConnectionKey, ReplayMark>,
    dirty: BTreeSet<ConnectionKey>,
}

impl ReplayGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            floor: Timestamp::EPOCH,
            marks: HashMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// A guard rebuilt from persisted marks at `now`.
    pub fn restore(window: Duration, marks: impl IntoIterator<Item = ReplayMark>, now: Timestamp) -> Self {
        let mut guard = Self::new(window);
        guard.floor = now;
        guard.marks = marks.into_iter().map(|m| (m.key(), m)).collect();
        guard.prune(now);
        guard
    }

    /// Oldest `latest` a mark may have and still matter at `now`.
    pub fn cutoff(&self, now: Timestamp) -> Timestamp {
        now.saturating_sub(self.window)
    }

    fn prune(&mut self, now: Timestamp) {
        let cutoff = self.cutoff(now);
        self.marks.retain(|_, mark| mark.latest >= cutoff);
        let marks = &self.marks;
        self.dirty.retain(|key| marks.contains_key(key));
    }

    pub fn check(
        &mut self,
        signee: AccountAddress,
        connection_id: u64,
        seq_no: u64,
        timestamp: Timestamp,
        now: Timestamp,
    ) -> Result<(), Rejection> {
        if timestamp < self.floor {
            return Err(Rejection::BeforeRestart);
        }
        self.prune(now);
        let key = (signee, connection_id);
        if let Some(mark) = self.marks.get_mut(&key) {
            if seq_no <= mark.seq_no {
                return Err(Rejection::Replayed { last: mark.seq_no });
            }
            mark.seq_no = seq_no;
            mark.latest = mark.latest.max(timestamp);
        } else {
            self.marks.insert(
                key,
                ReplayMark {
                    signee,
                    connection_id,
                    seq_no,
                    latest: timestamp,
                },
            );
        }
        self.dirty.insert(key);
        Ok(())
    }

    /// Marks changed since the last call, for persisting.
    pub fn take_dirty(&mut self) -> Vec<ReplayMark> {
        let keys = std::mem::take(&mut self.dirty);
        keys.into_iter()
            .filter_map(|key| self.marks.get(&key).copied())
            .collect()
    }

    /// Puts back marks whose write did not commit.
    pub fn restore_dirty(&mut self, marks: &[ReplayMark]) {
        self.dirty.extend(marks.iter().map(ReplayMark::key));
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use strata_types::Hash;

    const WINDOW: Duration = Duration::from_secs(60);

    fn user(byte: u8) -> AccountAddress {
        AccountAddress::from(Hash::from_bytes([byte; 32]))
    }

    fn at(secs: u64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    #[test]
    fn test_sequence_must_increase_per_connection() {
        let mut guard = ReplayGuard::new(WINDOW);
        let now = at(1000);

        guard.check(user(1), 1, 1, now, now).unwrap();
        guard.check(user(1), 2, 1, now, now).unwrap();
        guard.check(user(2), 1, 1, now, now).unwrap();
        assert_eq!(
            guard.check(user(1), 1, 1, now, now),
            Err(Rejection::Replayed { last: 1 })
        );
        guard.check(user(1), 1, 5, now, now).unwrap();
        assert_eq!(
            guard.check(user(1), 1, 4, now, now),
            Err(Rejection::Replayed { last: 5 })
        );
    }

    #[test]
    fn test_marks_out_of_window_are_pruned() {
        let mut guard = ReplayGuard::new(WINDOW);
        guard.check(user(1), 1, 9, at(1000), at(1000)).unwrap();
        guard.check(user(1), 2, 1, at(1050), at(1050)).unwrap();
        assert_eq!(guard.len(), 2);

        guard.check(user(2), 1, 1, at(1070), at(1070)).unwrap();
        assert_eq!(guard.len(), 2);
        guard.check(user(1), 1, 1, at(1070), at(1070)).unwrap();
    }

    #[test]
    fn test_restore_rejects_requests_signed_before_restart() {
        let mark = ReplayMark {
            signee: user(1),
            connection_id: 1,
            seq_no: 3,
            latest: at(990),
        };
        let mut guard = ReplayGuard::restore(WINDOW, [mark], at(1000));

        assert_eq!(
            guard.check(user(1), 1, 4, at(995), at(1001)),
            Err(Rejection::BeforeRestart)
        );
        assert_eq!(
            guard.check(user(1), 1, 3, at(1001), at(1001)),
            Err(Rejection::Replayed { last: 3 })
        );
        guard.check(user(1), 1, 4, at(1001), at(1001)).unwrap();
    }

    #[test]
    fn test_dirty_marks_are_handed_out_once() {
        let mut guard = ReplayGuard::new(WINDOW);
        guard.check(user(1), 1, 1, at(10), at(10)).unwrap();
        guard.check(user(1), 1, 2, at(11), at(11)).unwrap();

        let dirty = guard.take_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].seq_no, 2);
        assert_eq!(dirty[0].latest, at(11));
        assert!(guard.take_dirty().is_empty());

        guard.restore_dirty(&dirty);
        assert_eq!(guard.take_dirty(), dirty);
    }

    proptest! {
        #[test]
        fn prop_accepted_sequence_strictly_increases(seqs in prop::collection::vec(0u64..50, 1..40)) {
            let mut guard = ReplayGuard::new(WINDOW);
            let mut last = None;
            for seq in seqs {
                let accepted = guard.check(user(1), 1, seq, at(100), at(100)).is_ok();
                prop_assert_eq!(accepted, last.is_none_or(|l| seq > l));
                if accepted {
                    last = Some(seq);
                }
            }
        }
    }
}
