// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The session store: ordered session, participant, and answer records plus
//! the leaderboard sorted set. One implementation talks to Redis; the other
//! is an in-memory fake with the same invariants, injected by tests.
//!
//! Failure semantics: every Redis error surfaces as
//! [`CoreError::StorageUnavailable`]; callers classify with the retry
//! predicates and only retry idempotent operations.

use crate::clock::Clock;
use crate::redis_key::*;
use crate::store_schema::{
    parse_answer_id, parse_participant_id, AnswerRecord, ParticipantRecord, SessionRecord,
};
use async_trait::async_trait;
use core_protocol::dto::SessionState;
use core_protocol::error::CoreError;
use core_protocol::id::{AnswerId, JoinCode, ParticipantId, QuestionId, SessionId, SessionToken};
use core_protocol::UnixTime;
use deadpool_redis::redis::{self, AsyncCommands, Script};
use deadpool_redis::{Config, Pool, Runtime};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fields written together by a CAS state transition. The write is all or
/// nothing; a rejected CAS means a racing driver advanced the state first.
#[derive(Clone, Debug)]
pub struct SessionCasUpdate {
    pub state: SessionState,
    pub current_question_index: i32,
    pub question_started_at: Option<UnixTime>,
    pub paused_remaining_ms: Option<u64>,
    pub ended_at: Option<UnixTime>,
}

impl SessionCasUpdate {
    fn to_pairs(&self) -> Vec<(&'static str, String)> {
        fn opt(value: Option<u64>) -> String {
            value.map(|v| v.to_string()).unwrap_or_default()
        }
        vec![
            ("state", self.state.as_str().to_owned()),
            (
                "current_question_index",
                self.current_question_index.to_string(),
            ),
            ("question_started_at", opt(self.question_started_at)),
            ("paused_remaining_ms", opt(self.paused_remaining_ms)),
            ("ended_at", opt(self.ended_at)),
        ]
    }

    fn apply(&self, record: &mut SessionRecord) {
        record.state = self.state;
        record.current_question_index = self.current_question_index;
        record.question_started_at = self.question_started_at;
        record.paused_remaining_ms = self.paused_remaining_ms;
        record.ended_at = self.ended_at;
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Liveness probe for health monitoring.
    async fn ping(&self) -> Result<(), CoreError>;

    // Sessions.
    async fn put_session(&self, record: &SessionRecord) -> Result<(), CoreError>;
    async fn get_session(&self, sid: SessionId) -> Result<Option<SessionRecord>, CoreError>;
    /// Compare-and-set on `session.state`; returns false when `expected`
    /// no longer matches and nothing was written.
    async fn cas_session_state(
        &self,
        sid: SessionId,
        expected: SessionState,
        update: &SessionCasUpdate,
    ) -> Result<bool, CoreError>;
    async fn add_live_session(&self, sid: SessionId) -> Result<(), CoreError>;
    async fn live_sessions(&self) -> Result<Vec<SessionId>, CoreError>;
    /// Deletes every key belonging to the session.
    async fn evict_session(
        &self,
        sid: SessionId,
        join_code: JoinCode,
        question_ids: &[QuestionId],
    ) -> Result<(), CoreError>;

    // Join codes.
    async fn claim_join_code(&self, code: JoinCode, sid: SessionId) -> Result<bool, CoreError>;
    async fn lookup_join_code(&self, code: JoinCode) -> Result<Option<SessionId>, CoreError>;

    // Owner lease.
    async fn acquire_owner_lease(
        &self,
        sid: SessionId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError>;
    async fn refresh_owner_lease(
        &self,
        sid: SessionId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError>;
    async fn release_owner_lease(&self, sid: SessionId, owner: &str) -> Result<(), CoreError>;

    // Participants.
    async fn put_participant(&self, record: &ParticipantRecord) -> Result<(), CoreError>;
    async fn get_participant(
        &self,
        pid: ParticipantId,
    ) -> Result<Option<ParticipantRecord>, CoreError>;
    /// Case-insensitive uniqueness claim; false when the nickname is taken.
    async fn claim_nickname(
        &self,
        sid: SessionId,
        canonical: &str,
        pid: ParticipantId,
    ) -> Result<bool, CoreError>;
    async fn add_participant_to_session(
        &self,
        sid: SessionId,
        pid: ParticipantId,
        nickname: &str,
    ) -> Result<(), CoreError>;
    async fn session_participants(&self, sid: SessionId) -> Result<Vec<ParticipantId>, CoreError>;
    async fn set_participant_active(&self, pid: ParticipantId, active: bool)
        -> Result<(), CoreError>;
    async fn set_participant_eliminated(
        &self,
        pid: ParticipantId,
        eliminated: bool,
    ) -> Result<(), CoreError>;
    async fn set_participant_banned(&self, pid: ParticipantId) -> Result<(), CoreError>;
    /// Single atomic write of the score fields; invoked only by the scoring
    /// worker.
    async fn update_participant_score(
        &self,
        pid: ParticipantId,
        total_score: u64,
        total_time_ms: u64,
        last_question_score: i64,
        streak_count: u32,
    ) -> Result<(), CoreError>;
    async fn bump_answer_seq(&self, pid: ParticipantId, seq: u64) -> Result<(), CoreError>;

    // Scoring idempotence markers.
    async fn get_scored_marker(
        &self,
        pid: ParticipantId,
        qid: QuestionId,
    ) -> Result<Option<AnswerId>, CoreError>;
    async fn set_scored_marker(
        &self,
        pid: ParticipantId,
        qid: QuestionId,
        aid: AnswerId,
    ) -> Result<(), CoreError>;

    // Answers.
    /// At-most-once claim per `(participant, question)`; false when an answer
    /// was already recorded.
    async fn claim_answer(
        &self,
        sid: SessionId,
        qid: QuestionId,
        pid: ParticipantId,
        aid: AnswerId,
    ) -> Result<bool, CoreError>;
    async fn append_answer(&self, record: &AnswerRecord) -> Result<(), CoreError>;
    /// Participants that already claimed an answer for the question; used to
    /// rebuild the at-most-once gate when adopting an orphaned session.
    async fn answer_claims(
        &self,
        sid: SessionId,
        qid: QuestionId,
    ) -> Result<Vec<ParticipantId>, CoreError>;
    /// Idempotent on answer id; re-inserting overwrites with identical data.
    async fn batch_insert_answers(&self, records: &[AnswerRecord]) -> Result<(), CoreError>;
    async fn get_answer(
        &self,
        sid: SessionId,
        aid: AnswerId,
    ) -> Result<Option<AnswerRecord>, CoreError>;
    async fn buffer_answer_for_scoring(
        &self,
        sid: SessionId,
        qid: QuestionId,
        aid: AnswerId,
    ) -> Result<(), CoreError>;
    /// Atomically takes the whole per-question buffer.
    async fn drain_answer_buffer(
        &self,
        sid: SessionId,
        qid: QuestionId,
    ) -> Result<Vec<AnswerId>, CoreError>;

    // Leaderboard.
    async fn upsert_leaderboard(
        &self,
        sid: SessionId,
        pid: ParticipantId,
        leaderboard_score: f64,
    ) -> Result<(), CoreError>;
    /// Top-N members, best first.
    async fn get_leaderboard(
        &self,
        sid: SessionId,
        top_n: usize,
    ) -> Result<Vec<(ParticipantId, f64)>, CoreError>;
    /// 1-based rank.
    async fn get_rank(&self, sid: SessionId, pid: ParticipantId)
        -> Result<Option<u32>, CoreError>;
}

fn storage(e: impl Display) -> CoreError {
    CoreError::StorageUnavailable(e.to_string())
}

/// The real store.
pub struct RedisSessionStore {
    pool: Pool,
    cas_script: Script,
    lease_refresh_script: Script,
    lease_release_script: Script,
    drain_script: Script,
}

impl RedisSessionStore {
    pub fn new(redis_url: &str) -> Result<Self, CoreError> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(storage)?;
        Ok(Self {
            pool,
            // Write the transition fields only if the state still matches.
            cas_script: Script::new(
                r#"
                if redis.call('HGET', KEYS[1], 'state') == ARGV[1] then
                    for i = 2, #ARGV, 2 do
                        redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
                    end
                    return 1
                end
                return 0
                "#,
            ),
            lease_refresh_script: Script::new(
                r#"
                if redis.call('GET', KEYS[1]) == ARGV[1] then
                    redis.call('PEXPIRE', KEYS[1], ARGV[2])
                    return 1
                end
                return 0
                "#,
            ),
            lease_release_script: Script::new(
                r#"
                if redis.call('GET', KEYS[1]) == ARGV[1] then
                    redis.call('DEL', KEYS[1])
                    return 1
                end
                return 0
                "#,
            ),
            drain_script: Script::new(
                r#"
                local items = redis.call('LRANGE', KEYS[1], 0, -1)
                redis.call('DEL', KEYS[1])
                return items
                "#,
            ),
        })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, CoreError> {
        self.pool.get().await.map_err(storage)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn ping(&self) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(storage)?;
        Ok(())
    }

    async fn put_session(&self, record: &SessionRecord) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        conn.hset_multiple::<_, _, _, ()>(session_key(record.session_id), &record.to_pairs())
            .await
            .map_err(storage)
    }

    async fn get_session(&self, sid: SessionId) -> Result<Option<SessionRecord>, CoreError> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> =
            conn.hgetall(session_key(sid)).await.map_err(storage)?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(SessionRecord::from_map(&map))
    }

    async fn cas_session_state(
        &self,
        sid: SessionId,
        expected: SessionState,
        update: &SessionCasUpdate,
    ) -> Result<bool, CoreError> {
        let mut conn = self.conn().await?;
        let mut invocation = self.cas_script.key(session_key(sid));
        invocation.arg(expected.as_str());
        for (field, value) in update.to_pairs() {
            invocation.arg(field).arg(value);
        }
        let swapped: i32 = invocation.invoke_async(&mut conn).await.map_err(storage)?;
        Ok(swapped == 1)
    }

    async fn add_live_session(&self, sid: SessionId) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        conn.sadd::<_, _, ()>(live_sessions_key(), sid.0.get())
            .await
            .map_err(storage)
    }

    async fn live_sessions(&self) -> Result<Vec<SessionId>, CoreError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn.smembers(live_sessions_key()).await.map_err(storage)?;
        Ok(raw
            .iter()
            .filter_map(|s| parse_participant_id(s).map(|p| SessionId(p.0)))
            .collect())
    }

    async fn evict_session(
        &self,
        sid: SessionId,
        join_code: JoinCode,
        question_ids: &[QuestionId],
    ) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        let pids: Vec<String> = conn
            .hkeys(participants_key(sid))
            .await
            .map_err(storage)?;

        let mut keys = vec![
            session_key(sid),
            session_owner_key(sid),
            participants_key(sid),
            nicknames_key(sid),
            leaderboard_key(sid),
            answer_log_key(sid),
            join_code_key(join_code),
        ];
        for pid in pids.iter().filter_map(|p| parse_participant_id(p)) {
            keys.push(participant_key(pid));
        }
        for &qid in question_ids {
            keys.push(answer_claims_key(sid, qid));
            keys.push(scoring_buffer_key(sid, qid));
        }
        conn.del::<_, ()>(keys).await.map_err(storage)?;
        conn.srem::<_, _, ()>(live_sessions_key(), sid.0.get())
            .await
            .map_err(storage)
    }

    async fn claim_join_code(&self, code: JoinCode, sid: SessionId) -> Result<bool, CoreError> {
        let mut conn = self.conn().await?;
        let claimed: Option<String> = redis::cmd("SET")
            .arg(join_code_key(code))
            .arg(sid.0.get())
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        Ok(claimed.is_some())
    }

    async fn lookup_join_code(&self, code: JoinCode) -> Result<Option<SessionId>, CoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(join_code_key(code)).await.map_err(storage)?;
        Ok(raw
            .as_deref()
            .and_then(parse_participant_id)
            .map(|p| SessionId(p.0)))
    }

    async fn acquire_owner_lease(
        &self,
        sid: SessionId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let mut conn = self.conn().await?;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(session_owner_key(sid))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        Ok(acquired.is_some())
    }

    async fn refresh_owner_lease(
        &self,
        sid: SessionId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let mut conn = self.conn().await?;
        let refreshed: i32 = self
            .lease_refresh_script
            .key(session_owner_key(sid))
            .arg(owner)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        Ok(refreshed == 1)
    }

    async fn release_owner_lease(&self, sid: SessionId, owner: &str) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        let _: i32 = self
            .lease_release_script
            .key(session_owner_key(sid))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn put_participant(&self, record: &ParticipantRecord) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        conn.hset_multiple::<_, _, _, ()>(
            participant_key(record.participant_id),
            &record.to_pairs(),
        )
        .await
        .map_err(storage)
    }

    async fn get_participant(
        &self,
        pid: ParticipantId,
    ) -> Result<Option<ParticipantRecord>, CoreError> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> =
            conn.hgetall(participant_key(pid)).await.map_err(storage)?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(ParticipantRecord::from_map(&map))
    }

    async fn claim_nickname(
        &self,
        sid: SessionId,
        canonical: &str,
        pid: ParticipantId,
    ) -> Result<bool, CoreError> {
        let mut conn = self.conn().await?;
        conn.hset_nx(nicknames_key(sid), canonical, pid.0.get())
            .await
            .map_err(storage)
    }

    async fn add_participant_to_session(
        &self,
        sid: SessionId,
        pid: ParticipantId,
        nickname: &str,
    ) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(participants_key(sid), pid.0.get(), nickname)
            .await
            .map_err(storage)
    }

    async fn session_participants(&self, sid: SessionId) -> Result<Vec<ParticipantId>, CoreError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn.hkeys(participants_key(sid)).await.map_err(storage)?;
        Ok(raw.iter().filter_map(|s| parse_participant_id(s)).collect())
    }

    async fn set_participant_active(
        &self,
        pid: ParticipantId,
        active: bool,
    ) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(participant_key(pid), "is_active", if active { "1" } else { "0" })
            .await
            .map_err(storage)
    }

    async fn set_participant_eliminated(
        &self,
        pid: ParticipantId,
        eliminated: bool,
    ) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(
            participant_key(pid),
            "is_eliminated",
            if eliminated { "1" } else { "0" },
        )
        .await
        .map_err(storage)
    }

    async fn set_participant_banned(&self, pid: ParticipantId) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(participant_key(pid), "is_banned", "1")
            .await
            .map_err(storage)
    }

    async fn update_participant_score(
        &self,
        pid: ParticipantId,
        total_score: u64,
        total_time_ms: u64,
        last_question_score: i64,
        streak_count: u32,
    ) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        conn.hset_multiple::<_, _, _, ()>(
            participant_key(pid),
            &[
                ("total_score", total_score.to_string()),
                ("total_time_ms", total_time_ms.to_string()),
                ("last_question_score", last_question_score.to_string()),
                ("streak_count", streak_count.to_string()),
            ],
        )
        .await
        .map_err(storage)
    }

    async fn bump_answer_seq(&self, pid: ParticipantId, seq: u64) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(participant_key(pid), "answer_seq", seq.to_string())
            .await
            .map_err(storage)
    }

    async fn get_scored_marker(
        &self,
        pid: ParticipantId,
        qid: QuestionId,
    ) -> Result<Option<AnswerId>, CoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .hget(participant_key(pid), format!("scored:{}", qid.0))
            .await
            .map_err(storage)?;
        Ok(raw.as_deref().and_then(parse_answer_id))
    }

    async fn set_scored_marker(
        &self,
        pid: ParticipantId,
        qid: QuestionId,
        aid: AnswerId,
    ) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(
            participant_key(pid),
            format!("scored:{}", qid.0),
            aid.0.get(),
        )
        .await
        .map_err(storage)
    }

    async fn claim_answer(
        &self,
        sid: SessionId,
        qid: QuestionId,
        pid: ParticipantId,
        aid: AnswerId,
    ) -> Result<bool, CoreError> {
        let mut conn = self.conn().await?;
        conn.hset_nx(answer_claims_key(sid, qid), pid.0.get(), aid.0.get())
            .await
            .map_err(storage)
    }

    async fn append_answer(&self, record: &AnswerRecord) -> Result<(), CoreError> {
        self.batch_insert_answers(std::slice::from_ref(record)).await
    }

    async fn answer_claims(
        &self,
        sid: SessionId,
        qid: QuestionId,
    ) -> Result<Vec<ParticipantId>, CoreError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn
            .hkeys(answer_claims_key(sid, qid))
            .await
            .map_err(storage)?;
        Ok(raw.iter().filter_map(|s| parse_participant_id(s)).collect())
    }

    async fn batch_insert_answers(&self, records: &[AnswerRecord]) -> Result<(), CoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        // All answers in a batch belong to sessions this process owns; group
        // per session so each HSET stays single-key.
        let mut by_session: HashMap<SessionId, Vec<(u64, String)>> = HashMap::new();
        for record in records {
            let json = serde_json::to_string(record)
                .map_err(|e| CoreError::Internal(e.to_string()))?;
            by_session
                .entry(record.session_id)
                .or_default()
                .push((record.answer_id_u64(), json));
        }
        for (sid, pairs) in by_session {
            conn.hset_multiple::<_, _, _, ()>(answer_log_key(sid), &pairs)
                .await
                .map_err(storage)?;
        }
        Ok(())
    }

    async fn get_answer(
        &self,
        sid: SessionId,
        aid: AnswerId,
    ) -> Result<Option<AnswerRecord>, CoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .hget(answer_log_key(sid), aid.0.get())
            .await
            .map_err(storage)?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| CoreError::Internal(e.to_string())),
            None => Ok(None),
        }
    }

    async fn buffer_answer_for_scoring(
        &self,
        sid: SessionId,
        qid: QuestionId,
        aid: AnswerId,
    ) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        conn.rpush::<_, _, ()>(scoring_buffer_key(sid, qid), aid.0.get())
            .await
            .map_err(storage)
    }

    async fn drain_answer_buffer(
        &self,
        sid: SessionId,
        qid: QuestionId,
    ) -> Result<Vec<AnswerId>, CoreError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = self
            .drain_script
            .key(scoring_buffer_key(sid, qid))
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        Ok(raw.iter().filter_map(|s| parse_answer_id(s)).collect())
    }

    async fn upsert_leaderboard(
        &self,
        sid: SessionId,
        pid: ParticipantId,
        leaderboard_score: f64,
    ) -> Result<(), CoreError> {
        let mut conn = self.conn().await?;
        conn.zadd::<_, _, _, ()>(leaderboard_key(sid), pid.0.get(), leaderboard_score)
            .await
            .map_err(storage)
    }

    async fn get_leaderboard(
        &self,
        sid: SessionId,
        top_n: usize,
    ) -> Result<Vec<(ParticipantId, f64)>, CoreError> {
        if top_n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let raw: Vec<(String, f64)> = conn
            .zrevrange_withscores(leaderboard_key(sid), 0, top_n as isize - 1)
            .await
            .map_err(storage)?;
        Ok(raw
            .iter()
            .filter_map(|(member, score)| parse_participant_id(member).map(|p| (p, *score)))
            .collect())
    }

    async fn get_rank(
        &self,
        sid: SessionId,
        pid: ParticipantId,
    ) -> Result<Option<u32>, CoreError> {
        let mut conn = self.conn().await?;
        let rank: Option<i64> = conn
            .zrevrank(leaderboard_key(sid), pid.0.get())
            .await
            .map_err(storage)?;
        Ok(rank.map(|r| r as u32 + 1))
    }
}

/// In-memory store with the same invariants, for tests and for running
/// without Redis in development.
pub struct MemorySessionStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<SessionId, SessionRecord>,
    participants: HashMap<ParticipantId, ParticipantRecord>,
    session_participants: HashMap<SessionId, Vec<ParticipantId>>,
    nicknames: HashMap<(SessionId, String), ParticipantId>,
    leaderboards: HashMap<SessionId, HashMap<ParticipantId, f64>>,
    answer_claims: HashMap<(SessionId, QuestionId, ParticipantId), AnswerId>,
    answer_log: HashMap<(SessionId, AnswerId), AnswerRecord>,
    buffers: HashMap<(SessionId, QuestionId), Vec<AnswerId>>,
    scored_markers: HashMap<(ParticipantId, QuestionId), AnswerId>,
    live: HashSet<SessionId>,
    join_codes: HashMap<JoinCode, SessionId>,
    /// Owner and expiry in clock milliseconds.
    leases: HashMap<SessionId, (String, UnixTime)>,
}

impl MemorySessionStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ranked(scores: &HashMap<ParticipantId, f64>) -> Vec<(ParticipantId, f64)> {
        let mut entries: Vec<_> = scores.iter().map(|(&p, &s)| (p, s)).collect();
        entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then(a.0.cmp(&b.0)));
        entries
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn ping(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn put_session(&self, record: &SessionRecord) -> Result<(), CoreError> {
        self.lock().sessions.insert(record.session_id, record.clone());
        Ok(())
    }

    async fn get_session(&self, sid: SessionId) -> Result<Option<SessionRecord>, CoreError> {
        Ok(self.lock().sessions.get(&sid).cloned())
    }

    async fn cas_session_state(
        &self,
        sid: SessionId,
        expected: SessionState,
        update: &SessionCasUpdate,
    ) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        match inner.sessions.get_mut(&sid) {
            Some(record) if record.state == expected => {
                update.apply(record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_live_session(&self, sid: SessionId) -> Result<(), CoreError> {
        self.lock().live.insert(sid);
        Ok(())
    }

    async fn live_sessions(&self) -> Result<Vec<SessionId>, CoreError> {
        Ok(self.lock().live.iter().copied().collect())
    }

    async fn evict_session(
        &self,
        sid: SessionId,
        join_code: JoinCode,
        question_ids: &[QuestionId],
    ) -> Result<(), CoreError> {
        let mut inner = self.lock();
        inner.sessions.remove(&sid);
        inner.live.remove(&sid);
        inner.join_codes.remove(&join_code);
        inner.leases.remove(&sid);
        inner.leaderboards.remove(&sid);
        inner.nicknames.retain(|(s, _), _| *s != sid);
        inner.answer_log.retain(|(s, _), _| *s != sid);
        if let Some(pids) = inner.session_participants.remove(&sid) {
            for pid in pids {
                inner.participants.remove(&pid);
                inner.scored_markers.retain(|(p, _), _| *p != pid);
            }
        }
        for &qid in question_ids {
            inner.answer_claims.retain(|(s, q, _), _| !(*s == sid && *q == qid));
            inner.buffers.remove(&(sid, qid));
        }
        Ok(())
    }

    async fn claim_join_code(&self, code: JoinCode, sid: SessionId) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        if inner.join_codes.contains_key(&code) {
            Ok(false)
        } else {
            inner.join_codes.insert(code, sid);
            Ok(true)
        }
    }

    async fn lookup_join_code(&self, code: JoinCode) -> Result<Option<SessionId>, CoreError> {
        Ok(self.lock().join_codes.get(&code).copied())
    }

    async fn acquire_owner_lease(
        &self,
        sid: SessionId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        match inner.leases.get(&sid) {
            Some((_, expiry)) if *expiry > now => Ok(false),
            _ => {
                inner
                    .leases
                    .insert(sid, (owner.to_owned(), now + ttl.as_millis() as u64));
                Ok(true)
            }
        }
    }

    async fn refresh_owner_lease(
        &self,
        sid: SessionId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        match inner.leases.get_mut(&sid) {
            Some((holder, expiry)) if holder == owner && *expiry > now => {
                *expiry = now + ttl.as_millis() as u64;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_owner_lease(&self, sid: SessionId, owner: &str) -> Result<(), CoreError> {
        let mut inner = self.lock();
        if matches!(inner.leases.get(&sid), Some((holder, _)) if holder == owner) {
            inner.leases.remove(&sid);
        }
        Ok(())
    }

    async fn put_participant(&self, record: &ParticipantRecord) -> Result<(), CoreError> {
        self.lock()
            .participants
            .insert(record.participant_id, record.clone());
        Ok(())
    }

    async fn get_participant(
        &self,
        pid: ParticipantId,
    ) -> Result<Option<ParticipantRecord>, CoreError> {
        Ok(self.lock().participants.get(&pid).cloned())
    }

    async fn claim_nickname(
        &self,
        sid: SessionId,
        canonical: &str,
        pid: ParticipantId,
    ) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        let key = (sid, canonical.to_owned());
        if inner.nicknames.contains_key(&key) {
            Ok(false)
        } else {
            inner.nicknames.insert(key, pid);
            Ok(true)
        }
    }

    async fn add_participant_to_session(
        &self,
        sid: SessionId,
        pid: ParticipantId,
        _nickname: &str,
    ) -> Result<(), CoreError> {
        let mut inner = self.lock();
        let pids = inner.session_participants.entry(sid).or_default();
        if !pids.contains(&pid) {
            pids.push(pid);
        }
        Ok(())
    }

    async fn session_participants(&self, sid: SessionId) -> Result<Vec<ParticipantId>, CoreError> {
        Ok(self
            .lock()
            .session_participants
            .get(&sid)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_participant_active(
        &self,
        pid: ParticipantId,
        active: bool,
    ) -> Result<(), CoreError> {
        if let Some(p) = self.lock().participants.get_mut(&pid) {
            p.is_active = active;
        }
        Ok(())
    }

    async fn set_participant_eliminated(
        &self,
        pid: ParticipantId,
        eliminated: bool,
    ) -> Result<(), CoreError> {
        if let Some(p) = self.lock().participants.get_mut(&pid) {
            p.is_eliminated = eliminated;
        }
        Ok(())
    }

    async fn set_participant_banned(&self, pid: ParticipantId) -> Result<(), CoreError> {
        if let Some(p) = self.lock().participants.get_mut(&pid) {
            p.is_banned = true;
        }
        Ok(())
    }

    async fn update_participant_score(
        &self,
        pid: ParticipantId,
        total_score: u64,
        total_time_ms: u64,
        last_question_score: i64,
        streak_count: u32,
    ) -> Result<(), CoreError> {
        if let Some(p) = self.lock().participants.get_mut(&pid) {
            p.total_score = total_score;
            p.total_time_ms = total_time_ms;
            p.last_question_score = last_question_score;
            p.streak_count = streak_count;
        }
        Ok(())
    }

    async fn bump_answer_seq(&self, pid: ParticipantId, seq: u64) -> Result<(), CoreError> {
        if let Some(p) = self.lock().participants.get_mut(&pid) {
            p.answer_seq = seq;
        }
        Ok(())
    }

    async fn get_scored_marker(
        &self,
        pid: ParticipantId,
        qid: QuestionId,
    ) -> Result<Option<AnswerId>, CoreError> {
        Ok(self.lock().scored_markers.get(&(pid, qid)).copied())
    }

    async fn set_scored_marker(
        &self,
        pid: ParticipantId,
        qid: QuestionId,
        aid: AnswerId,
    ) -> Result<(), CoreError> {
        self.lock().scored_markers.insert((pid, qid), aid);
        Ok(())
    }

    async fn claim_answer(
        &self,
        sid: SessionId,
        qid: QuestionId,
        pid: ParticipantId,
        aid: AnswerId,
    ) -> Result<bool, CoreError> {
        let mut inner = self.lock();
        let key = (sid, qid, pid);
        if inner.answer_claims.contains_key(&key) {
            Ok(false)
        } else {
            inner.answer_claims.insert(key, aid);
            Ok(true)
        }
    }

    async fn append_answer(&self, record: &AnswerRecord) -> Result<(), CoreError> {
        self.batch_insert_answers(std::slice::from_ref(record)).await
    }

    async fn answer_claims(
        &self,
        sid: SessionId,
        qid: QuestionId,
    ) -> Result<Vec<ParticipantId>, CoreError> {
        Ok(self
            .lock()
            .answer_claims
            .iter()
            .filter(|((s, q, _), _)| *s == sid && *q == qid)
            .map(|((_, _, p), _)| *p)
            .collect())
    }

    async fn batch_insert_answers(&self, records: &[AnswerRecord]) -> Result<(), CoreError> {
        let mut inner = self.lock();
        for record in records {
            inner
                .answer_log
                .insert((record.session_id, record.answer_id), record.clone());
        }
        Ok(())
    }

    async fn get_answer(
        &self,
        sid: SessionId,
        aid: AnswerId,
    ) -> Result<Option<AnswerRecord>, CoreError> {
        Ok(self.lock().answer_log.get(&(sid, aid)).cloned())
    }

    async fn buffer_answer_for_scoring(
        &self,
        sid: SessionId,
        qid: QuestionId,
        aid: AnswerId,
    ) -> Result<(), CoreError> {
        self.lock().buffers.entry((sid, qid)).or_default().push(aid);
        Ok(())
    }

    async fn drain_answer_buffer(
        &self,
        sid: SessionId,
        qid: QuestionId,
    ) -> Result<Vec<AnswerId>, CoreError> {
        Ok(self.lock().buffers.remove(&(sid, qid)).unwrap_or_default())
    }

    async fn upsert_leaderboard(
        &self,
        sid: SessionId,
        pid: ParticipantId,
        leaderboard_score: f64,
    ) -> Result<(), CoreError> {
        self.lock()
            .leaderboards
            .entry(sid)
            .or_default()
            .insert(pid, leaderboard_score);
        Ok(())
    }

    async fn get_leaderboard(
        &self,
        sid: SessionId,
        top_n: usize,
    ) -> Result<Vec<(ParticipantId, f64)>, CoreError> {
        let inner = self.lock();
        let Some(scores) = inner.leaderboards.get(&sid) else {
            return Ok(Vec::new());
        };
        let mut entries = Self::ranked(scores);
        entries.truncate(top_n);
        Ok(entries)
    }

    async fn get_rank(
        &self,
        sid: SessionId,
        pid: ParticipantId,
    ) -> Result<Option<u32>, CoreError> {
        let inner = self.lock();
        let Some(scores) = inner.leaderboards.get(&sid) else {
            return Ok(None);
        };
        Ok(Self::ranked(scores)
            .iter()
            .position(|(p, _)| *p == pid)
            .map(|i| i as u32 + 1))
    }
}

#[cfg(test)]
mod test {
    use crate::clock::ManualClock;
    use crate::store::{MemorySessionStore, SessionCasUpdate, SessionStore};
    use crate::store_schema::SessionRecord;
    use core_protocol::dto::SessionState;
    use core_protocol::id::{AnswerId, JoinCode, ParticipantId, QuestionId, QuizId, SessionId, SessionToken};
    use std::num::{NonZeroU32, NonZeroU64};
    use std::time::Duration;

    fn sid(n: u64) -> SessionId {
        SessionId(NonZeroU64::new(n).unwrap())
    }

    fn pid(n: u64) -> ParticipantId {
        ParticipantId(NonZeroU64::new(n).unwrap())
    }

    fn qid(n: u32) -> QuestionId {
        QuestionId(NonZeroU32::new(n).unwrap())
    }

    fn aid(n: u64) -> AnswerId {
        AnswerId(NonZeroU64::new(n).unwrap())
    }

    fn store() -> MemorySessionStore {
        MemorySessionStore::new(ManualClock::new(1_000_000))
    }

    fn session_record(id: SessionId) -> SessionRecord {
        SessionRecord {
            session_id: id,
            quiz_id: QuizId(NonZeroU64::new(1).unwrap()),
            join_code: JoinCode::new("AAAAAA").unwrap(),
            state: SessionState::Lobby,
            current_question_index: -1,
            question_started_at: None,
            paused_remaining_ms: None,
            created_at: 0,
            ended_at: None,
            host_token: SessionToken(NonZeroU64::new(5).unwrap()),
        }
    }

    #[tokio::test]
    async fn cas_rejects_stale_expectation() {
        let store = store();
        store.put_session(&session_record(sid(1))).await.unwrap();

        let to_active = SessionCasUpdate {
            state: SessionState::ActiveQuestion,
            current_question_index: 0,
            question_started_at: Some(123),
            paused_remaining_ms: None,
            ended_at: None,
        };
        assert!(store
            .cas_session_state(sid(1), SessionState::Lobby, &to_active)
            .await
            .unwrap());
        // A second driver with the same expectation loses.
        assert!(!store
            .cas_session_state(sid(1), SessionState::Lobby, &to_active)
            .await
            .unwrap());

        let record = store.get_session(sid(1)).await.unwrap().unwrap();
        assert_eq!(record.state, SessionState::ActiveQuestion);
        assert_eq!(record.question_started_at, Some(123));
    }

    #[tokio::test]
    async fn answer_claims_are_at_most_once() {
        let store = store();
        assert!(store.claim_answer(sid(1), qid(1), pid(1), aid(1)).await.unwrap());
        assert!(!store.claim_answer(sid(1), qid(1), pid(1), aid(2)).await.unwrap());
        // Different question is independent.
        assert!(store.claim_answer(sid(1), qid(2), pid(1), aid(3)).await.unwrap());
    }

    #[tokio::test]
    async fn leaderboard_orders_by_score_then_member() {
        let store = store();
        store.upsert_leaderboard(sid(1), pid(1), 500.0 - 45e-6).await.unwrap();
        store.upsert_leaderboard(sid(1), pid(2), 500.0 - 40e-6).await.unwrap();
        store.upsert_leaderboard(sid(1), pid(3), 700.0).await.unwrap();

        let top = store.get_leaderboard(sid(1), 10).await.unwrap();
        let order: Vec<_> = top.iter().map(|(p, _)| *p).collect();
        // Equal points: the participant with less accumulated time ranks higher.
        assert_eq!(order, vec![pid(3), pid(2), pid(1)]);
        assert_eq!(store.get_rank(sid(1), pid(2)).await.unwrap(), Some(2));
        assert_eq!(store.get_rank(sid(1), pid(9)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let clock = ManualClock::new(1_000_000);
        let store = MemorySessionStore::new(clock.clone());
        let ttl = Duration::from_secs(15);

        assert!(store.acquire_owner_lease(sid(1), "a", ttl).await.unwrap());
        assert!(!store.acquire_owner_lease(sid(1), "b", ttl).await.unwrap());
        assert!(store.refresh_owner_lease(sid(1), "a", ttl).await.unwrap());
        assert!(!store.refresh_owner_lease(sid(1), "b", ttl).await.unwrap());

        clock.advance(16_000);
        // Expired: a new owner can take over, and the old one cannot refresh.
        assert!(store.acquire_owner_lease(sid(1), "b", ttl).await.unwrap());
        assert!(!store.refresh_owner_lease(sid(1), "a", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn scoring_buffer_drains_once() {
        let store = store();
        store.buffer_answer_for_scoring(sid(1), qid(1), aid(1)).await.unwrap();
        store.buffer_answer_for_scoring(sid(1), qid(1), aid(2)).await.unwrap();
        assert_eq!(
            store.drain_answer_buffer(sid(1), qid(1)).await.unwrap(),
            vec![aid(1), aid(2)]
        );
        assert!(store.drain_answer_buffer(sid(1), qid(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nickname_claims_case_insensitive_by_canonical() {
        let store = store();
        assert!(store.claim_nickname(sid(1), "alice", pid(1)).await.unwrap());
        assert!(!store.claim_nickname(sid(1), "alice", pid(2)).await.unwrap());
        // Other session is independent.
        assert!(store.claim_nickname(sid(2), "alice", pid(2)).await.unwrap());
    }
}
