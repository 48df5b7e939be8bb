//! Session lifecycle through the signaling gateway.
//!
//! Covers joining, leaving, explicit end and the router lifecycle, using
//! the in-memory harness from `signaling-test-utils`.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use common::types::SessionStatus;
use signaling_service::audit::{AuditAction, SYSTEM_ACTOR};
use signaling_service::signaling::protocol::ServerEvent;
use signaling_service::signaling::GatewayPhase;
use signaling_test_utils::{frames, MockStore, TestAppointment, TestHarness};
use std::time::Duration;

async fn harness_for(appointment: &TestAppointment) -> TestHarness {
    TestHarness::start(MockStore::new().with_appointment(appointment)).await
}

async fn wait_for_status(harness: &TestHarness, room_id: &str, status: SessionStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.store.last_status(room_id) != Some(status) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("status was not persisted");
}

#[tokio::test]
async fn test_doctor_then_patient_then_both_leave() {
    let appointment = TestAppointment::new("room-1");
    let harness = harness_for(&appointment).await;
    let mut doctor = harness.connect("conn-doctor");
    let mut patient = harness.connect("conn-patient");

    // Doctor alone: waiting
    doctor.send(appointment.join_doctor()).await;
    doctor.expect("router-capabilities").await;
    let session = harness
        .registry
        .get(appointment.room_id.clone())
        .await
        .unwrap()
        .expect("session should be live");
    assert_eq!(
        session.get_state().await.unwrap().status,
        SessionStatus::Waiting
    );

    // Patient joins: connected, both sides told
    patient.send(appointment.join_patient()).await;
    patient.expect("router-capabilities").await;
    let ServerEvent::ParticipantJoined(existing) = patient.expect("participant-joined").await
    else {
        unreachable!()
    };
    assert_eq!(existing.participant_id, appointment.doctor_id);

    let ServerEvent::ParticipantJoined(joined) = doctor.expect("participant-joined").await else {
        unreachable!()
    };
    assert_eq!(joined.participant_id, appointment.patient_id);
    assert_eq!(
        session.get_state().await.unwrap().status,
        SessionStatus::Connected
    );
    wait_for_status(&harness, &appointment.room_id, SessionStatus::Connected).await;

    // Doctor leaves: patient notified, session stays
    doctor.disconnect().await;
    let ServerEvent::ParticipantDisconnected(left) =
        patient.expect("participant-disconnected").await
    else {
        unreachable!()
    };
    assert_eq!(left.participant_id, appointment.doctor_id);
    assert_eq!(left.participant_name, "Dr. Test");
    assert!(harness
        .registry
        .get(appointment.room_id.clone())
        .await
        .unwrap()
        .is_some());

    // Patient leaves: finalized and removed, nobody left to notify
    patient.disconnect().await;
    harness.wait_for_session_removed(&appointment.room_id).await;
    patient.assert_no_event().await;

    assert_eq!(harness.engine.open_routers(), 0);
    assert_eq!(harness.engine.router_close_calls(), 1);
    wait_for_status(&harness, &appointment.room_id, SessionStatus::Ended).await;
    assert_eq!(patient.phase(), GatewayPhase::Left);
}

#[tokio::test]
async fn test_end_session_notifies_all_and_is_idempotent() {
    let appointment = TestAppointment::new("room-end");
    let harness = harness_for(&appointment).await;
    let mut doctor = harness.connect("conn-doctor");
    let mut patient = harness.connect("conn-patient");

    doctor.send(appointment.join_doctor()).await;
    doctor.expect("router-capabilities").await;
    patient.send(appointment.join_patient()).await;
    patient.expect("router-capabilities").await;
    patient.expect("participant-joined").await;
    doctor.expect("participant-joined").await;

    doctor.send(frames::end_session(&appointment.room_id)).await;

    for client in [&mut doctor, &mut patient] {
        let ServerEvent::SessionEnded(ended) = client.expect("session-ended").await else {
            unreachable!()
        };
        assert_eq!(ended.session_id, appointment.room_id);
    }

    // Second end from either side changes nothing
    doctor.send(frames::end_session(&appointment.room_id)).await;
    patient.send(frames::end_session(&appointment.room_id)).await;
    doctor.assert_no_event().await;
    patient.assert_no_event().await;

    harness.wait_for_session_removed(&appointment.room_id).await;
    assert_eq!(harness.engine.router_close_calls(), 1);

    // Joins for both participants, then one end
    harness.wait_for_audit_records(3).await;
    let ends: Vec<_> = harness
        .store
        .audit_events()
        .into_iter()
        .filter(|e| e.action == AuditAction::EndSession)
        .collect();
    assert_eq!(ends.len(), 1);
    assert!(ends.iter().all(|e| e.actor_id == appointment.doctor_id));
    assert!(ends.iter().all(|e| e.resource_id == appointment.patient_id));

    // The ended session no longer accepts requests from this connection
    patient.send(frames::chat(&appointment.room_id, "still there?")).await;
    patient.expect_error(4).await;
}

#[tokio::test]
async fn test_last_participant_leaving_is_audited_as_system() {
    let appointment = TestAppointment::new("room-sys");
    let harness = harness_for(&appointment).await;
    let mut doctor = harness.connect("conn-doctor");

    doctor.send(appointment.join_doctor()).await;
    doctor.expect("router-capabilities").await;
    doctor.disconnect().await;
    harness.wait_for_session_removed(&appointment.room_id).await;

    // join, leave, end
    harness.wait_for_audit_records(3).await;
    let end = harness
        .store
        .audit_events()
        .into_iter()
        .find(|e| e.action == AuditAction::EndSession)
        .expect("end should be audited");
    assert_eq!(end.actor_id, SYSTEM_ACTOR);
    assert_eq!(end.details["sessionId"], appointment.room_id.as_str());
}

#[tokio::test]
async fn test_denied_join_creates_no_session() {
    let appointment = TestAppointment::new("room-deny");
    let harness = harness_for(&appointment).await;
    let mut intruder = harness.connect("conn-intruder");

    intruder
        .send(frames::join(
            &appointment.room_id,
            "someone-else",
            "patient",
            "Intruder",
        ))
        .await;
    intruder.expect_error(2).await;

    assert_eq!(harness.engine.open_routers(), 0);
    assert!(harness
        .registry
        .get(appointment.room_id.clone())
        .await
        .unwrap()
        .is_none());

    harness.wait_for_audit_records(1).await;
    assert_eq!(
        harness.store.audit_actions(),
        vec![(AuditAction::JoinSession, false)]
    );
}

#[tokio::test]
async fn test_observer_is_not_admitted() {
    let appointment = TestAppointment::new("room-observer");
    let harness = harness_for(&appointment).await;
    let mut observer = harness.connect("conn-observer");

    observer
        .send(frames::join(
            &appointment.room_id,
            &appointment.doctor_id,
            "observer",
            "Watcher",
        ))
        .await;

    observer.expect_error(2).await;
    assert_eq!(harness.engine.open_routers(), 0);
}

#[tokio::test]
async fn test_unknown_room_is_not_found() {
    let harness = TestHarness::start(MockStore::new()).await;
    let mut client = harness.connect("conn-1");

    client
        .send(frames::join("room-missing", "doctor-1", "doctor", "Dr. Test"))
        .await;

    client.expect_error(4).await;
}

#[tokio::test]
async fn test_directory_outage_is_a_storage_error() {
    let appointment = TestAppointment::new("room-down");
    let harness = harness_for(&appointment).await;
    harness.store.fail_directory(true);
    let mut doctor = harness.connect("conn-doctor");

    doctor.send(appointment.join_doctor()).await;

    doctor.expect_error(6).await;
    assert_eq!(harness.engine.open_routers(), 0);
}

#[tokio::test]
async fn test_same_participant_twice_conflicts() {
    let appointment = TestAppointment::new("room-dup");
    let harness = harness_for(&appointment).await;
    let mut first = harness.connect("conn-1");
    let mut second = harness.connect("conn-2");

    first.send(appointment.join_doctor()).await;
    first.expect("router-capabilities").await;

    second.send(appointment.join_doctor()).await;
    second.expect_error(5).await;
    assert_eq!(second.phase(), GatewayPhase::Unjoined);
}

#[tokio::test]
async fn test_session_cap_rejects_new_rooms() {
    let first_room = TestAppointment::new("room-a");
    let second_room = TestAppointment::new("room-b");
    let store = MockStore::new()
        .with_appointment(&first_room)
        .with_appointment(&second_room);
    let harness = TestHarness::with_settings(
        store,
        signaling_test_utils::default_session_settings(),
        1,
        1,
    )
    .await;

    let mut a = harness.connect("conn-a");
    a.send(first_room.join_doctor()).await;
    a.expect("router-capabilities").await;

    let mut b = harness.connect("conn-b");
    b.send(second_room.join_doctor()).await;
    b.expect_error(7).await;
    assert_eq!(harness.engine.open_routers(), 1);
}

#[tokio::test]
async fn test_room_can_be_rejoined_after_it_ends() {
    let appointment = TestAppointment::new("room-again");
    let harness = harness_for(&appointment).await;
    let mut doctor = harness.connect("conn-doctor");

    doctor.send(appointment.join_doctor()).await;
    doctor.expect("router-capabilities").await;
    doctor.send(frames::end_session(&appointment.room_id)).await;
    doctor.expect("session-ended").await;
    harness.wait_for_session_removed(&appointment.room_id).await;

    doctor.send(appointment.join_doctor()).await;
    doctor.expect("router-capabilities").await;
    assert_eq!(harness.engine.open_routers(), 1);
}
