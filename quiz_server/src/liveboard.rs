// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Caches the latest leaderboard per session and rate-limits its fan-out.
//! Deltas arrive from the scoring worker over the bus; broadcasts go out at
//! most once per second per session, always carrying the newest snapshot.

use core_protocol::dto::LeaderboardEntryDto;
use core_protocol::id::SessionId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const BROADCAST_PERIOD: Duration = Duration::from_secs(1);

struct Board {
    rankings: Vec<LeaderboardEntryDto>,
    dirty: bool,
    last_broadcast: Option<Instant>,
}

/// Manages the live leaderboards of every owned session.
#[derive(Default)]
pub struct LiveboardRepo {
    boards: HashMap<SessionId, Board>,
}

impl LiveboardRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called on every delta from the scoring worker.
    pub fn put(&mut self, session_id: SessionId, rankings: Vec<LeaderboardEntryDto>) {
        let board = self.boards.entry(session_id).or_insert(Board {
            rankings: Vec::new(),
            dirty: false,
            last_broadcast: None,
        });
        if board.rankings != rankings {
            board.rankings = rankings;
            board.dirty = true;
        }
    }

    /// Latest snapshot for recovery payloads.
    pub fn get(&self, session_id: SessionId) -> &[LeaderboardEntryDto] {
        self.boards
            .get(&session_id)
            .map(|b| b.rankings.as_slice())
            .unwrap_or_default()
    }

    /// Sessions whose snapshot changed and whose broadcast budget allows a
    /// send now. Marks them clean.
    pub fn take_due(&mut self, now: Instant) -> Vec<(SessionId, Vec<LeaderboardEntryDto>)> {
        let mut due = Vec::new();
        for (&session_id, board) in &mut self.boards {
            if !board.dirty {
                continue;
            }
            let ready = board
                .last_broadcast
                .map(|at| now.duration_since(at) >= BROADCAST_PERIOD)
                .unwrap_or(true);
            if ready {
                board.dirty = false;
                board.last_broadcast = Some(now);
                due.push((session_id, board.rankings.clone()));
            }
        }
        due
    }

    /// Forces the next `take_due` to include the session (question reveal
    /// wants the final board out immediately).
    pub fn mark_urgent(&mut self, session_id: SessionId) {
        if let Some(board) = self.boards.get_mut(&session_id) {
            board.last_broadcast = None;
            board.dirty = !board.rankings.is_empty();
        }
    }

    pub fn forget(&mut self, session_id: SessionId) {
        self.boards.remove(&session_id);
    }
}

#[cfg(test)]
mod test {
    use crate::liveboard::LiveboardRepo;
    use core_protocol::dto::LeaderboardEntryDto;
    use core_protocol::id::{ParticipantId, SessionId};
    use core_protocol::name::Nickname;
    use std::num::NonZeroU64;
    use std::time::{Duration, Instant};

    fn sid(n: u64) -> SessionId {
        SessionId(NonZeroU64::new(n).unwrap())
    }

    fn entry(pid: u64, score: u64) -> LeaderboardEntryDto {
        LeaderboardEntryDto {
            rank: 1,
            participant_id: ParticipantId(NonZeroU64::new(pid).unwrap()),
            nickname: Nickname::new("p").unwrap(),
            total_score: score,
            total_time_ms: 0,
        }
    }

    #[test]
    fn rate_limited_to_one_per_period() {
        let mut repo = LiveboardRepo::new();
        let t0 = Instant::now();

        repo.put(sid(1), vec![entry(1, 100)]);
        assert_eq!(repo.take_due(t0).len(), 1);

        // A fresh delta within the period is withheld...
        repo.put(sid(1), vec![entry(1, 200)]);
        assert!(repo.take_due(t0 + Duration::from_millis(300)).is_empty());

        // ...and released, newest snapshot wins, once the period elapses.
        repo.put(sid(1), vec![entry(1, 300)]);
        let due = repo.take_due(t0 + Duration::from_millis(1100));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1[0].total_score, 300);
    }

    #[test]
    fn unchanged_snapshot_is_not_rebroadcast() {
        let mut repo = LiveboardRepo::new();
        let t0 = Instant::now();
        repo.put(sid(1), vec![entry(1, 100)]);
        assert_eq!(repo.take_due(t0).len(), 1);
        repo.put(sid(1), vec![entry(1, 100)]);
        assert!(repo.take_due(t0 + Duration::from_secs(5)).is_empty());
    }
}
