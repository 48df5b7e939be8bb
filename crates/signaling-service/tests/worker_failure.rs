//! Media worker death is fatal to the process.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use signaling_test_utils::{
    default_session_settings, MockStore, TestAppointment, TestHarness,
};
use std::time::Duration;

#[tokio::test]
async fn test_worker_death_cancels_fatal_token() {
    let appointment = TestAppointment::new("room-fatal");
    let harness = TestHarness::with_settings(
        MockStore::new().with_appointment(&appointment),
        default_session_settings(),
        2,
        10,
    )
    .await;
    assert!(!harness.fatal.is_cancelled());

    let workers = harness.engine.workers();
    assert_eq!(workers.len(), 2);
    workers.last().unwrap().kill("SIGKILL");

    tokio::time::timeout(Duration::from_secs(5), harness.fatal.cancelled())
        .await
        .expect("worker death should cancel the fatal token");
}

#[tokio::test]
async fn test_join_on_dead_worker_is_an_internal_error() {
    let appointment = TestAppointment::new("room-dead");
    let harness = TestHarness::start(MockStore::new().with_appointment(&appointment)).await;
    for worker in harness.engine.workers() {
        worker.kill("segfault");
    }

    let mut doctor = harness.connect("conn-doctor");
    doctor.send(appointment.join_doctor()).await;

    let error = doctor.expect_error(6).await;
    assert_eq!(error.message, "An internal error occurred");
    assert_eq!(harness.engine.open_routers(), 0);

    tokio::time::timeout(Duration::from_secs(5), harness.fatal.cancelled())
        .await
        .expect("fatal token should be cancelled");
}
