//! Chat, vitals and recording through a live session.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use common::types::SessionStatus;
use serde_json::json;
use signaling_service::audit::AuditAction;
use signaling_service::signaling::protocol::ServerEvent;
use signaling_test_utils::{frames, MockStore, TestAppointment, TestClient, TestHarness};

async fn joined_pair(
    harness: &TestHarness,
    appointment: &TestAppointment,
) -> (TestClient, TestClient) {
    let mut doctor = harness.connect("conn-doctor");
    let mut patient = harness.connect("conn-patient");

    doctor.send(appointment.join_doctor()).await;
    doctor.expect("router-capabilities").await;
    patient.send(appointment.join_patient()).await;
    patient.expect("router-capabilities").await;
    patient.expect("participant-joined").await;
    doctor.expect("participant-joined").await;

    (doctor, patient)
}

#[tokio::test]
async fn test_chat_is_persisted_then_echoed_to_present_participants() {
    let appointment = TestAppointment::new("room-chat");
    let harness = TestHarness::start(MockStore::new().with_appointment(&appointment)).await;
    let mut doctor = harness.connect("conn-doctor");

    doctor.send(appointment.join_doctor()).await;
    doctor.expect("router-capabilities").await;
    doctor
        .send(frames::chat(&appointment.room_id, "Hello, I will be with you shortly"))
        .await;

    let ServerEvent::ChatMessage(echo) = doctor.expect("chat-message").await else {
        unreachable!()
    };
    assert!(echo.id.starts_with("msg_"));
    assert_eq!(echo.sender_id, appointment.doctor_id);
    assert_eq!(echo.sender_name, "Dr. Test");
    assert_eq!(harness.store.chat_messages(), vec![echo]);

    // Joining later does not replay history
    let mut patient = harness.connect("conn-patient");
    patient.send(appointment.join_patient()).await;
    patient.expect("router-capabilities").await;
    patient.expect("participant-joined").await;
    patient.assert_no_event().await;
}

#[tokio::test]
async fn test_chat_persistence_failure_only_reaches_sender() {
    let appointment = TestAppointment::new("room-chat-down");
    let harness = TestHarness::start(MockStore::new().with_appointment(&appointment)).await;
    let (mut doctor, mut patient) = joined_pair(&harness, &appointment).await;
    harness.store.fail_chat_writes(true);

    doctor.send(frames::chat(&appointment.room_id, "are you there?")).await;

    doctor.expect_error(6).await;
    patient.assert_no_event().await;
    assert!(harness.store.chat_messages().is_empty());
}

#[tokio::test]
async fn test_chat_is_delivered_in_order() {
    let appointment = TestAppointment::new("room-order");
    let harness = TestHarness::start(MockStore::new().with_appointment(&appointment)).await;
    let (mut doctor, mut patient) = joined_pair(&harness, &appointment).await;

    for i in 0..5 {
        doctor
            .send(frames::chat(&appointment.room_id, &format!("message {i}")))
            .await;
    }

    for i in 0..5 {
        let ServerEvent::ChatMessage(received) = patient.expect("chat-message").await else {
            unreachable!()
        };
        assert_eq!(received.message, format!("message {i}"));
        doctor.expect("chat-message").await;
    }

    let stored: Vec<String> = harness
        .store
        .chat_messages()
        .into_iter()
        .map(|m| m.message)
        .collect();
    assert_eq!(stored, (0..5).map(|i| format!("message {i}")).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_blank_chat_is_rejected() {
    let appointment = TestAppointment::new("room-blank");
    let harness = TestHarness::start(MockStore::new().with_appointment(&appointment)).await;
    let (mut doctor, mut patient) = joined_pair(&harness, &appointment).await;

    doctor.send(frames::chat(&appointment.room_id, "   ")).await;

    doctor.expect_error(1).await;
    patient.assert_no_event().await;
}

#[tokio::test]
async fn test_doctor_cannot_share_vitals() {
    let appointment = TestAppointment::new("room-vitals-deny");
    let harness = TestHarness::start(MockStore::new().with_appointment(&appointment)).await;
    let (mut doctor, mut patient) = joined_pair(&harness, &appointment).await;

    doctor
        .send(frames::share_vitals(
            &appointment.room_id,
            json!({ "heartRate": 72 }),
        ))
        .await;

    doctor.expect_error(3).await;
    patient.assert_no_event().await;
    assert!(harness.store.vitals().is_empty());

    // Joins for both participants, then the refused share
    harness.wait_for_audit_records(3).await;
    assert!(harness
        .store
        .audit_actions()
        .contains(&(AuditAction::ShareVitals, false)));
}

#[tokio::test]
async fn test_patient_vitals_are_stored_and_broadcast() {
    let appointment = TestAppointment::new("room-vitals");
    let harness = TestHarness::start(MockStore::new().with_appointment(&appointment)).await;
    let (mut doctor, mut patient) = joined_pair(&harness, &appointment).await;

    patient
        .send(frames::share_vitals(
            &appointment.room_id,
            json!({
                "heartRate": 72,
                "bloodPressure": { "systolic": 120, "diastolic": 80 },
                "oxygenSaturation": 98
            }),
        ))
        .await;

    for client in [&mut doctor, &mut patient] {
        let ServerEvent::VitalsShared(shared) = client.expect("vitals-shared").await else {
            unreachable!()
        };
        assert_eq!(shared.patient_id, appointment.patient_id);
        assert_eq!(shared.patient_name, "Test Patient");
        assert_eq!(shared.vitals.heart_rate, Some(72.0));
    }

    let stored = harness.store.vitals();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored.first().unwrap().session_id, appointment.room_id);
}

#[tokio::test]
async fn test_impossible_vitals_are_rejected() {
    let appointment = TestAppointment::new("room-vitals-range");
    let harness = TestHarness::start(MockStore::new().with_appointment(&appointment)).await;
    let (mut doctor, mut patient) = joined_pair(&harness, &appointment).await;

    patient
        .send(frames::share_vitals(
            &appointment.room_id,
            json!({ "temperature": 80 }),
        ))
        .await;

    let error = patient.expect_error(1).await;
    assert!(error.message.contains("temperature"));
    doctor.assert_no_event().await;
    assert!(harness.store.vitals().is_empty());
}

#[tokio::test]
async fn test_recording_is_doctor_only() {
    let appointment = TestAppointment::new("room-recording");
    let harness = TestHarness::start(MockStore::new().with_appointment(&appointment)).await;
    let (mut doctor, mut patient) = joined_pair(&harness, &appointment).await;

    patient
        .send(frames::start_recording(&appointment.room_id))
        .await;
    patient.expect_error(3).await;
    doctor.assert_no_event().await;

    doctor.send(frames::start_recording(&appointment.room_id)).await;
    for client in [&mut doctor, &mut patient] {
        let ServerEvent::RecordingStateChanged(changed) =
            client.expect("recording-state-changed").await
        else {
            unreachable!()
        };
        assert!(changed.recording);
        assert_eq!(changed.changed_by, appointment.doctor_id);
    }

    // Already recording
    doctor.send(frames::start_recording(&appointment.room_id)).await;
    doctor.expect_error(5).await;

    let session = harness
        .registry
        .get(appointment.room_id.clone())
        .await
        .unwrap()
        .expect("session should be live");
    assert_eq!(
        session.get_state().await.unwrap().status,
        SessionStatus::Recording
    );
}
