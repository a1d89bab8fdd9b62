// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Drives a whole question lifecycle through the public pieces: state
//! machine transitions, answer ingest, scoring finalization, leaderboard.

use core_protocol::dto::SessionState;
use core_protocol::id::{JoinCode, ParticipantId, QuizId, SessionId, SessionToken};
use core_protocol::name::Nickname;
use core_protocol::quiz::QuestionType;
use quiz_server::answer::AnswerRepo;
use quiz_server::metric::SharedScoringMetrics;
use quiz_server::quiz_service::{fixture, InMemoryQuizStore, QuizStore};
use quiz_server::scoring::ScoringWorker;
use quiz_server::session::{LiveSession, ParticipantState, SessionRepo, TransitionIntent};
use server_util::clock::ManualClock;
use server_util::pubsub::LocalPubSub;
use server_util::store::{MemorySessionStore, SessionStore};
use server_util::store_schema::{ParticipantRecord, SessionRecord};
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

fn sid() -> SessionId {
    SessionId(NonZeroU64::new(77).unwrap())
}

fn pid(n: u64) -> ParticipantId {
    ParticipantId(NonZeroU64::new(n).unwrap())
}

fn participant_record(n: u64) -> ParticipantRecord {
    ParticipantRecord {
        participant_id: pid(n),
        session_id: sid(),
        nickname: Nickname::new(&format!("player{}", n)).unwrap(),
        session_token: SessionToken(NonZeroU64::new(n + 1000).unwrap()),
        is_active: true,
        is_eliminated: false,
        is_spectator: false,
        is_banned: false,
        total_score: 0,
        total_time_ms: 0,
        streak_count: 0,
        last_question_score: 0,
        answer_seq: 1,
        joined_at: 0,
    }
}

#[tokio::test]
async fn question_lifecycle_scores_and_ranks() {
    let clock = ManualClock::new(1_000_000);
    let store = Arc::new(MemorySessionStore::new(clock.clone()));
    let quizzes = InMemoryQuizStore::new();
    quizzes.insert(fixture::quiz(
        1,
        vec![fixture::question(
            1,
            QuestionType::Mc,
            30,
            vec![fixture::option(1, true), fixture::option(2, false)],
            fixture::scoring(100, 0.0, false),
        )],
    ));
    let quiz = quizzes.get_quiz(fixture::quiz_id(1)).await.unwrap();

    let record = SessionRecord {
        session_id: sid(),
        quiz_id: QuizId(NonZeroU64::new(1).unwrap()),
        join_code: JoinCode::new("LIVE01").unwrap(),
        state: SessionState::Lobby,
        current_question_index: -1,
        question_started_at: None,
        paused_remaining_ms: None,
        created_at: 1_000_000,
        ended_at: None,
        host_token: SessionToken(NonZeroU64::new(5).unwrap()),
    };
    store.put_session(&record).await.unwrap();

    let mut sessions = SessionRepo::new("owner-test".to_owned());
    let mut session = LiveSession::new(record, quiz);
    for n in [1, 2] {
        let participant = participant_record(n);
        store.put_participant(&participant).await.unwrap();
        session
            .participants
            .insert(pid(n), ParticipantState::new(participant));
    }
    sessions.sessions.insert(sid(), session);

    // LOBBY -> ACTIVE_QUESTION, mirrored through the store CAS.
    let prepared = sessions
        .prepare_transition(sid(), TransitionIntent::StartSession, 1_000_000)
        .unwrap();
    assert!(store
        .cas_session_state(sid(), prepared.expected, &prepared.update)
        .await
        .unwrap());
    sessions.apply_transition(sid(), &prepared, 1_000_000, Duration::from_secs(600));

    // Both participants pick the correct answer; player 2 is faster.
    for (n, at) in [(1u64, 1_010_000u64), (2, 1_005_000)] {
        let session = sessions.get_mut(sid()).unwrap();
        let answer = AnswerRepo::prepare_submission(
            session,
            pid(n),
            fixture::question_id(1),
            vec![fixture::option_id(1)],
            at,
        )
        .unwrap();
        assert!(store
            .claim_answer(sid(), fixture::question_id(1), pid(n), answer.answer_id)
            .await
            .unwrap());
        store.append_answer(&answer).await.unwrap();
        store
            .buffer_answer_for_scoring(sid(), fixture::question_id(1), answer.answer_id)
            .await
            .unwrap();
    }

    // ACTIVE_QUESTION -> REVEAL; the scoring worker settles the buffer and
    // acks within the finalization window.
    let prepared = sessions
        .prepare_transition(sid(), TransitionIntent::EndQuestion, 1_020_000)
        .unwrap();
    assert!(store
        .cas_session_state(sid(), prepared.expected, &prepared.update)
        .await
        .unwrap());
    sessions.apply_transition(sid(), &prepared, 1_020_000, Duration::from_secs(600));

    let handle = ScoringWorker::new(
        store.clone(),
        quizzes,
        LocalPubSub::new(),
        clock,
        Arc::new(SharedScoringMetrics::default()),
        10,
    )
    .spawn();
    assert!(
        handle
            .finalize(sid(), fixture::question_id(1), Duration::from_secs(3))
            .await
    );

    // Both scored the base 100; equal points, so less accumulated time wins.
    let p1 = store.get_participant(pid(1)).await.unwrap().unwrap();
    let p2 = store.get_participant(pid(2)).await.unwrap().unwrap();
    assert_eq!(p1.total_score, 100);
    assert_eq!(p2.total_score, 100);
    assert_eq!(p1.total_time_ms, 10_000);
    assert_eq!(p2.total_time_ms, 5_000);
    assert_eq!(p1.streak_count, 1);

    let top = store.get_leaderboard(sid(), 10).await.unwrap();
    let order: Vec<ParticipantId> = top.iter().map(|(p, _)| *p).collect();
    assert_eq!(order, vec![pid(2), pid(1)]);

    // Re-finalizing is idempotent: nothing double counts.
    assert!(
        handle
            .finalize(sid(), fixture::question_id(1), Duration::from_secs(3))
            .await
    );
    let p1_again = store.get_participant(pid(1)).await.unwrap().unwrap();
    assert_eq!(p1_again.total_score, 100);

    // REVEAL -> ENDED (single-question quiz).
    let prepared = sessions
        .prepare_transition(sid(), TransitionIntent::NextQuestion, 1_030_000)
        .unwrap();
    assert!(store
        .cas_session_state(sid(), prepared.expected, &prepared.update)
        .await
        .unwrap());
    let state = sessions
        .apply_transition(sid(), &prepared, 1_030_000, Duration::from_secs(600))
        .unwrap();
    assert_eq!(state, SessionState::Ended);
}
