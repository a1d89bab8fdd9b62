// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Rebuilds the exact view a reconnecting participant should see. Pure reads
//! of the owner's in-memory state, so repeated calls return the same
//! snapshot until something actually changes.

use crate::liveboard::LiveboardRepo;
use crate::session::{LiveSession, SessionRepo};
use core_protocol::dto::{QuestionDto, RecoveryDto, SessionState};
use core_protocol::error::CoreError;
use core_protocol::id::{ParticipantId, SessionId, SessionToken};
use core_protocol::UnixTime;

/// Assembles the recovery payload, enforcing the validation order: identity,
/// then session liveness, then participant standing.
pub fn recover(
    sessions: &SessionRepo,
    liveboard: &LiveboardRepo,
    session_id: SessionId,
    participant_id: ParticipantId,
    session_token: SessionToken,
    now: UnixTime,
) -> Result<RecoveryDto, CoreError> {
    let session = sessions.get(session_id).ok_or(CoreError::SessionNotFound)?;

    let participant = session
        .participant(participant_id)
        .ok_or(CoreError::ParticipantNotFound)?;
    if participant.record.session_token != session_token {
        return Err(CoreError::ParticipantNotFound);
    }
    if session.state() == SessionState::Ended {
        return Err(CoreError::SessionEnded);
    }
    if participant.record.is_banned {
        return Err(CoreError::ParticipantBanned);
    }

    let current_question = match session.state() {
        SessionState::Lobby => None,
        _ => session.current_question().map(QuestionDto::from),
    };
    let remaining_seconds = match session.state() {
        SessionState::ActiveQuestion => {
            (session.remaining_ms(now) + 999) as u32 / 1000
        }
        _ => 0,
    };

    Ok(RecoveryDto {
        session_id,
        state: session.state(),
        current_question_index: session.record.current_question_index,
        current_question,
        remaining_seconds,
        total_score: participant.record.total_score,
        streak_count: participant.record.streak_count,
        rank: rank_of(session, participant_id),
        leaderboard: liveboard.get(session_id).to_vec(),
        is_eliminated: participant.record.is_eliminated,
        is_spectator: participant.record.is_spectator,
    })
}

/// 1-based rank among all participants by leaderboard score. Computed from
/// the owner's full roster, so it works even outside the cached top-N.
fn rank_of(session: &LiveSession, participant_id: ParticipantId) -> Option<u32> {
    let target = session.participant(participant_id)?;
    let target_score = leaderboard_score(&target.record);
    let higher = session
        .participants
        .values()
        .filter(|p| leaderboard_score(&p.record) > target_score)
        .count();
    Some(higher as u32 + 1)
}

fn leaderboard_score(record: &server_util::store_schema::ParticipantRecord) -> f64 {
    record.total_score as f64 - record.total_time_ms as f64 * 1e-9
}

#[cfg(test)]
mod test {
    use crate::liveboard::LiveboardRepo;
    use crate::quiz_service::fixture;
    use crate::recovery::recover;
    use crate::session::{LiveSession, ParticipantState, SessionRepo, TransitionIntent};
    use core_protocol::dto::SessionState;
    use core_protocol::error::CoreError;
    use core_protocol::id::{JoinCode, ParticipantId, SessionId, SessionToken};
    use core_protocol::quiz::QuestionType;
    use server_util::store_schema::{ParticipantRecord, SessionRecord};
    use std::num::NonZeroU64;
    use std::sync::Arc;
    use std::time::Duration;

    fn sid() -> SessionId {
        SessionId(NonZeroU64::new(8).unwrap())
    }

    fn pid(n: u64) -> ParticipantId {
        ParticipantId(NonZeroU64::new(n).unwrap())
    }

    fn token(n: u64) -> SessionToken {
        SessionToken(NonZeroU64::new(n).unwrap())
    }

    fn repo() -> SessionRepo {
        let quiz = fixture::quiz(
            1,
            vec![fixture::question(
                1,
                QuestionType::Mc,
                30,
                vec![fixture::option(1, true), fixture::option(2, false)],
                fixture::scoring(100, 0.0, false),
            )],
        );
        let record = SessionRecord {
            session_id: sid(),
            quiz_id: fixture::quiz_id(1),
            join_code: JoinCode::new("AAAAAA").unwrap(),
            state: SessionState::Lobby,
            current_question_index: -1,
            question_started_at: None,
            paused_remaining_ms: None,
            created_at: 0,
            ended_at: None,
            host_token: token(1),
        };
        let mut session = LiveSession::new(record, Arc::new(quiz));
        for (n, score, time_ms) in [(1u64, 500u64, 30_000u64), (2, 700, 10_000)] {
            session.participants.insert(
                pid(n),
                ParticipantState::new(ParticipantRecord {
                    participant_id: pid(n),
                    session_id: sid(),
                    nickname: core_protocol::name::Nickname::new(&format!("p{}", n)).unwrap(),
                    session_token: token(n + 10),
                    is_active: true,
                    is_eliminated: false,
                    is_spectator: false,
                    is_banned: false,
                    total_score: score,
                    total_time_ms: time_ms,
                    streak_count: 2,
                    last_question_score: 0,
                    answer_seq: 1,
                    joined_at: 0,
                }),
            );
        }
        let mut repo = SessionRepo::new("owner".to_owned());
        repo.sessions.insert(sid(), session);
        repo
    }

    fn start(repo: &mut SessionRepo, now: u64) {
        let prepared = repo
            .prepare_transition(sid(), TransitionIntent::StartSession, now)
            .unwrap();
        repo.apply_transition(sid(), &prepared, now, Duration::from_secs(600));
    }

    #[test]
    fn reconnect_mid_question_reports_remaining_time() {
        let mut repo = repo();
        start(&mut repo, 100_000);

        // Disconnected 8 s in, reconnects 10 s later: 12 s should remain.
        let dto = recover(&repo, &LiveboardRepo::new(), sid(), pid(1), token(11), 118_000).unwrap();
        assert_eq!(dto.state, SessionState::ActiveQuestion);
        assert_eq!(dto.remaining_seconds, 12);
        assert_eq!(dto.total_score, 500);
        assert_eq!(dto.streak_count, 2);
        assert_eq!(dto.rank, Some(2));
        let question = dto.current_question.unwrap();
        assert_eq!(question.question_id, fixture::question_id(1));
        // Correct-answer flags are stripped from the payload entirely.
        assert_eq!(question.options.len(), 2);
    }

    #[test]
    fn idempotent_without_state_change() {
        let mut repo = repo();
        start(&mut repo, 100_000);
        let liveboard = LiveboardRepo::new();

        let a = recover(&repo, &liveboard, sid(), pid(2), token(12), 110_000).unwrap();
        let b = recover(&repo, &liveboard, sid(), pid(2), token(12), 110_400).unwrap();
        assert_eq!(a.remaining_seconds, b.remaining_seconds);
        assert_eq!(a.total_score, b.total_score);
        assert_eq!(a.rank, b.rank);
        assert_eq!(a.current_question_index, b.current_question_index);
    }

    #[test]
    fn validation_order() {
        let mut repo = repo();
        start(&mut repo, 100_000);

        // Bad token looks identical to a missing participant.
        assert!(matches!(
            recover(&repo, &LiveboardRepo::new(), sid(), pid(1), token(99), 110_000),
            Err(CoreError::ParticipantNotFound)
        ));
        assert!(matches!(
            recover(
                &repo,
                &LiveboardRepo::new(),
                SessionId(NonZeroU64::new(404).unwrap()),
                pid(1),
                token(11),
                110_000
            ),
            Err(CoreError::SessionNotFound)
        ));

        // Banned participants cannot recover.
        repo.get_mut(sid())
            .unwrap()
            .participant_mut(pid(1))
            .unwrap()
            .record
            .is_banned = true;
        assert!(matches!(
            recover(&repo, &LiveboardRepo::new(), sid(), pid(1), token(11), 110_000),
            Err(CoreError::ParticipantBanned)
        ));
    }

    #[test]
    fn ended_session_rejected() {
        let mut repo = repo();
        start(&mut repo, 100_000);
        let prepared = repo
            .prepare_transition(sid(), TransitionIntent::EndSession, 120_000)
            .unwrap();
        repo.apply_transition(sid(), &prepared, 120_000, Duration::from_secs(600));

        assert!(matches!(
            recover(&repo, &LiveboardRepo::new(), sid(), pid(1), token(11), 121_000),
            Err(CoreError::SessionEnded)
        ));
    }
}
