mod common;

use common::{harness, pool_with, week_42_monday};
use dutybot_id::{AssignmentId, CycleNumber, MemberId};
use dutybot_rotation::model::{AssignmentStatus, Member, ResponseKind};
use dutybot_rotation::period::PeriodLabel;
use dutybot_rotation::RotationError;
use rstest::rstest;

fn week_42() -> PeriodLabel {
    PeriodLabel::containing(week_42_monday())
}

fn ids(members: &[Member]) -> Vec<MemberId> {
    members.iter().map(|m| m.member_id).collect()
}

#[rstest]
#[case(false)]
#[case(true)]
#[tokio::test]
async fn test_held_week_is_not_picked_twice(#[case] confirmed: bool) {
    let h = harness(101);
    let (pool, _) = pool_with(&h.engine, "chat-1", &["A", "B", "C"]).await;

    let first = h.engine.select_for_period(pool.pool_id, week_42()).await.unwrap();
    assert_eq!(first.period_label, week_42());
    if confirmed {
        let response = h.engine.confirm(pool.pool_id, first.assignment_id).await.unwrap();
        assert_eq!(response.kind, ResponseKind::Confirmed);
    }
    let expected = if confirmed {
        AssignmentStatus::Confirmed
    } else {
        AssignmentStatus::Pending
    };

    let err = h
        .engine
        .select_for_period(pool.pool_id, week_42())
        .await
        .unwrap_err();
    match err {
        RotationError::PeriodTaken {
            assignment_id,
            status,
            ..
        } => {
            assert_eq!(assignment_id, first.assignment_id);
            assert_eq!(status, expected);
        }
        other => panic!("expected PeriodTaken, got {other:?}"),
    }
    assert_eq!(h.engine.get_history(pool.pool_id, 10).await.unwrap().len(), 1);

    // Other weeks are unaffected.
    let next_week = PeriodLabel::new(2026, 43).unwrap();
    let second = h.engine.select_for_period(pool.pool_id, next_week).await.unwrap();
    assert_ne!(second.member_id, first.member_id);
}

#[tokio::test]
async fn test_decline_reopens_week_for_someone_else() {
    let h = harness(102);
    let (pool, _) = pool_with(&h.engine, "chat-1", &["A", "B", "C"]).await;

    let first = h.engine.select_for_period(pool.pool_id, week_42()).await.unwrap();
    let response = h.engine.decline(pool.pool_id, first.assignment_id).await.unwrap();
    assert_eq!(response.kind, ResponseKind::Declined);
    assert_eq!(response.responded_at, week_42_monday());

    let entry = h
        .engine
        .get_assignment(pool.pool_id, first.assignment_id)
        .await
        .unwrap();
    assert_eq!(entry.status(), AssignmentStatus::Declined);
    assert_eq!(entry.response, Some(response));

    // Declining still counts as the member's turn.
    let eligible = ids(&h.engine.preview_eligible(pool.pool_id).await.unwrap());
    assert_eq!(eligible.len(), 2);
    assert!(!eligible.contains(&first.member_id));

    let second = h.engine.select_for_period(pool.pool_id, week_42()).await.unwrap();
    assert_ne!(second.member_id, first.member_id);
    assert_eq!(second.cycle_number, CycleNumber::FIRST);
    assert_eq!(second.period_label, week_42());
}

#[tokio::test]
async fn test_week_declined_by_everyone_has_no_candidates() {
    let h = harness(103);
    let (pool, _) = pool_with(&h.engine, "chat-1", &["A", "B"]).await;

    for _ in 0..2 {
        let pick = h.engine.select_for_period(pool.pool_id, week_42()).await.unwrap();
        h.engine.decline(pool.pool_id, pick.assignment_id).await.unwrap();
    }

    let err = h
        .engine
        .select_for_period(pool.pool_id, week_42())
        .await
        .unwrap_err();
    assert!(matches!(err, RotationError::NoCandidates { period, .. } if period == week_42()));
    assert!(err.is_user_facing());

    // The failed attempt did not start a new cycle.
    let pool = h.engine.pools().get_pool(pool.pool_id).await.unwrap();
    assert_eq!(pool.current_cycle, CycleNumber::FIRST);

    // The next week starts the next cycle as usual.
    let next = h
        .engine
        .select_for_period(pool.pool_id, PeriodLabel::new(2026, 43).unwrap())
        .await
        .unwrap();
    assert!(next.cycle_reset);
}

#[tokio::test]
async fn test_assignment_is_answered_once() {
    let h = harness(104);
    let (pool, _) = pool_with(&h.engine, "chat-1", &["A", "B"]).await;
    let pick = h.engine.select_next(pool.pool_id).await.unwrap();

    h.engine.confirm(pool.pool_id, pick.assignment_id).await.unwrap();
    let err = h
        .engine
        .decline(pool.pool_id, pick.assignment_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RotationError::AlreadyResponded {
            status: AssignmentStatus::Confirmed,
            ..
        }
    ));

    let unknown = AssignmentId::new();
    let err = h.engine.confirm(pool.pool_id, unknown).await.unwrap_err();
    assert!(matches!(
        err,
        RotationError::AssignmentNotFound { assignment_id, .. } if assignment_id == unknown
    ));
    assert!(matches!(
        h.engine.get_assignment(pool.pool_id, unknown).await,
        Err(RotationError::AssignmentNotFound { .. })
    ));
}

#[tokio::test]
async fn test_assignment_lookup_is_scoped_to_its_pool() {
    let h = harness(105);
    let (pool, _) = pool_with(&h.engine, "chat-1", &["A"]).await;
    let (other, _) = pool_with(&h.engine, "chat-2", &["B"]).await;
    let pick = h.engine.select_next(pool.pool_id).await.unwrap();

    assert!(matches!(
        h.engine.confirm(other.pool_id, pick.assignment_id).await,
        Err(RotationError::AssignmentNotFound { .. })
    ));
    let entry = h
        .engine
        .get_assignment(pool.pool_id, pick.assignment_id)
        .await
        .unwrap();
    assert_eq!(entry.status(), AssignmentStatus::Pending);
}

#[rstest]
#[case(false)]
#[case(true)]
#[tokio::test]
async fn test_forced_assignment_replaces_holder(#[case] confirmed: bool) {
    let h = harness(106);
    let (pool, members) = pool_with(&h.engine, "chat-1", &["A", "B", "C"]).await;

    let holder = h.engine.select_for_period(pool.pool_id, week_42()).await.unwrap();
    if confirmed {
        h.engine.confirm(pool.pool_id, holder.assignment_id).await.unwrap();
    }
    let stand_in = members
        .iter()
        .find(|m| m.member_id != holder.member_id)
        .unwrap()
        .member_id;

    let err = h
        .engine
        .assign_member_for_period(pool.pool_id, stand_in, week_42(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, RotationError::PeriodTaken { .. }));

    let forced = h
        .engine
        .assign_member_for_period(pool.pool_id, stand_in, week_42(), true)
        .await
        .unwrap();
    assert_eq!(forced.member_id, stand_in);
    assert_eq!(forced.period_label, week_42());
    assert_eq!(forced.cycle_number, CycleNumber::FIRST);

    let replaced = h
        .engine
        .get_assignment(pool.pool_id, holder.assignment_id)
        .await
        .unwrap();
    assert_eq!(replaced.status(), AssignmentStatus::Replaced);
    let current = h
        .engine
        .get_assignment(pool.pool_id, forced.assignment_id)
        .await
        .unwrap();
    assert_eq!(current.status(), AssignmentStatus::Pending);

    // The replaced member gets the turn back within the same cycle.
    let eligible = ids(&h.engine.preview_eligible(pool.pool_id).await.unwrap());
    assert!(eligible.contains(&holder.member_id));
    assert!(!eligible.contains(&stand_in));

    let again = h
        .engine
        .assign_member(pool.pool_id, holder.member_id)
        .await
        .unwrap();
    assert_eq!(again.cycle_number, CycleNumber::FIRST);
    assert_eq!(h.engine.get_history(pool.pool_id, 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_failed_force_leaves_holder_in_place() {
    let h = harness(107);
    let (pool, _) = pool_with(&h.engine, "chat-1", &["A", "B", "C"]).await;

    let served = h.engine.select_next(pool.pool_id).await.unwrap();
    h.clock.advance(chrono::Duration::days(7));
    let week_43 = PeriodLabel::new(2026, 43).unwrap();
    let holder = h.engine.select_for_period(pool.pool_id, week_43).await.unwrap();

    let err = h
        .engine
        .assign_member_for_period(pool.pool_id, served.member_id, week_43, true)
        .await
        .unwrap_err();
    assert!(matches!(err, RotationError::AlreadyServed { .. }));

    let entry = h
        .engine
        .get_assignment(pool.pool_id, holder.assignment_id)
        .await
        .unwrap();
    assert_eq!(entry.status(), AssignmentStatus::Pending);
    let eligible = ids(&h.engine.preview_eligible(pool.pool_id).await.unwrap());
    assert!(!eligible.contains(&holder.member_id));
}

#[tokio::test]
async fn test_force_on_open_week_is_a_plain_assignment() {
    let h = harness(108);
    let (pool, members) = pool_with(&h.engine, "chat-1", &["A", "B"]).await;

    let result = h
        .engine
        .assign_member_for_period(pool.pool_id, members[1].member_id, week_42(), true)
        .await
        .unwrap();
    assert_eq!(result.member_id, members[1].member_id);
    assert_eq!(h.engine.get_history(pool.pool_id, 10).await.unwrap().len(), 1);
}
