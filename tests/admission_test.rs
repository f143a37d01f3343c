//! Tests for the admission controller: FIFO slot grants, cancellation while
//! queued, queue timeouts and gauge accuracy.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_test::task;
use tokio_test::{assert_pending, assert_ready_ok};

use huginn::telemetry;
use huginn::{AdmissionController, HuginnError, Recorder, RecorderConfig, RequestStatus};

// ============================================================================
// Helpers
// ============================================================================

fn controller(limit: usize) -> (AdmissionController, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::new(RecorderConfig::new().model_name("test-model")).unwrap());
    let controller = AdmissionController::new(Arc::clone(&recorder), limit).unwrap();
    (controller, recorder)
}

fn gauge(recorder: &Recorder, name: &str) -> f64 {
    recorder.snapshot().scalar(name, &[]).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn zero_limit_is_rejected() {
    let recorder = Arc::new(Recorder::new(RecorderConfig::default()).unwrap());
    let err = AdmissionController::new(recorder, 0).unwrap_err();
    assert!(matches!(err, HuginnError::Configuration(_)));
}

#[tokio::test]
async fn below_limit_admits_immediately() {
    let (controller, recorder) = controller(2);

    let a = controller.acquire(None).await.unwrap();
    let b = controller.acquire(None).await.unwrap();
    assert_eq!(a.queue_duration(), Duration::ZERO);
    assert_eq!(b.queue_duration(), Duration::ZERO);
    assert_eq!(controller.running(), 2);
    assert_eq!(gauge(&recorder, telemetry::NUM_REQUESTS_RUNNING), 2.0);
    assert_eq!(gauge(&recorder, telemetry::NUM_REQUESTS_WAITING), 0.0);

    drop(a);
    drop(b);
    assert_eq!(controller.running(), 0);
    assert_eq!(gauge(&recorder, telemetry::NUM_REQUESTS_RUNNING), 0.0);
}

#[tokio::test]
async fn slots_are_granted_in_arrival_order() {
    let (controller, recorder) = controller(1);
    let first = controller.acquire(None).await.unwrap();

    let mut second = task::spawn(controller.acquire(None));
    let mut third = task::spawn(controller.acquire(None));
    assert_pending!(second.poll());
    assert_pending!(third.poll());
    assert_eq!(controller.waiting(), 2);
    assert_eq!(gauge(&recorder, telemetry::NUM_REQUESTS_WAITING), 2.0);

    drop(first);
    assert!(second.is_woken());
    assert_pending!(third.poll());
    let second_permit = assert_ready_ok!(second.poll());
    assert_eq!(controller.running(), 1);
    assert_eq!(controller.waiting(), 1);

    drop(second_permit);
    let third_permit = assert_ready_ok!(third.poll());
    assert_eq!(controller.waiting(), 0);
    assert_eq!(gauge(&recorder, telemetry::NUM_REQUESTS_WAITING), 0.0);
    assert_eq!(gauge(&recorder, telemetry::NUM_REQUESTS_RUNNING), 1.0);
    drop(third_permit);
}

#[tokio::test]
async fn cancel_while_queued_consumes_no_slot() {
    let (controller, recorder) = controller(1);
    let held = controller.acquire(None).await.unwrap();

    let mut waiter = task::spawn(controller.acquire(None));
    assert_pending!(waiter.poll());
    assert_eq!(controller.waiting(), 1);

    drop(waiter);
    assert_eq!(controller.waiting(), 0);
    assert_eq!(gauge(&recorder, telemetry::NUM_REQUESTS_WAITING), 0.0);
    assert_eq!(controller.running(), 1);

    held.finish(RequestStatus::Success);
    assert_eq!(controller.running(), 0);

    // The canceled waiter is not handed the freed slot.
    let mut next = task::spawn(controller.acquire(None));
    let permit = assert_ready_ok!(next.poll());
    assert_eq!(permit.queue_duration(), Duration::ZERO);
    permit.finish(RequestStatus::Success);

    let snap = recorder.snapshot();
    assert_eq!(snap.requests_with_status(RequestStatus::Canceled), 1.0);
    assert_eq!(snap.requests_with_status(RequestStatus::Success), 2.0);
    assert_eq!(gauge(&recorder, telemetry::NUM_REQUESTS_RUNNING), 0.0);
}

#[tokio::test(start_paused = true)]
async fn queue_timeout_rejects_without_touching_running() {
    let (controller, recorder) = controller(1);
    let held = controller.acquire(None).await.unwrap();

    let err = controller
        .acquire(Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, HuginnError::AdmissionTimeout { .. }));
    assert_eq!(err.status(), RequestStatus::Rejected);

    assert_eq!(controller.waiting(), 0);
    assert_eq!(controller.running(), 1);
    let snap = recorder.snapshot();
    assert_eq!(snap.requests_with_status(RequestStatus::Rejected), 1.0);
    assert_eq!(snap.scalar(telemetry::NUM_REQUESTS_WAITING, &[]), Some(0.0));
    assert_eq!(snap.scalar(telemetry::NUM_REQUESTS_RUNNING, &[]), Some(1.0));

    drop(held);
}

#[tokio::test(start_paused = true)]
async fn third_of_three_requests_waits_with_limit_two() {
    let (controller, _recorder) = controller(2);

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let controller = controller.clone();
            tokio::spawn(async move {
                let mut permit = controller.acquire(None).await.unwrap();
                let waited = permit.queue_duration();
                tokio::time::sleep(Duration::from_millis(50)).await;
                permit.set_status(RequestStatus::Success);
                waited
            })
        })
        .collect();

    let mut waits = Vec::new();
    for handle in handles {
        waits.push(handle.await.unwrap());
    }
    waits.sort();
    assert_eq!(waits[0], Duration::ZERO);
    assert_eq!(waits[1], Duration::ZERO);
    assert!(waits[2] >= Duration::from_millis(50), "got {:?}", waits[2]);
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_limit() {
    const LIMIT: usize = 3;
    const REQUESTS: usize = 20;

    let (controller, recorder) = controller(LIMIT);
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..REQUESTS)
        .map(|_| {
            let controller = controller.clone();
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let mut permit = controller.acquire(None).await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                permit.set_status(RequestStatus::Success);
                permit.queue_duration()
            })
        })
        .collect();

    let mut queued = 0;
    for handle in handles {
        if handle.await.unwrap() > Duration::ZERO {
            queued += 1;
        }
    }

    assert!(peak.load(Ordering::SeqCst) <= LIMIT);
    assert_eq!(queued, REQUESTS - LIMIT);

    let snap = recorder.snapshot();
    assert_eq!(
        snap.requests_with_status(RequestStatus::Success),
        REQUESTS as f64
    );
    assert_eq!(snap.scalar(telemetry::NUM_REQUESTS_RUNNING, &[]), Some(0.0));
    assert_eq!(snap.scalar(telemetry::NUM_REQUESTS_WAITING, &[]), Some(0.0));
    let queue_time = snap
        .histogram(telemetry::REQUEST_QUEUE_TIME_SECONDS, &[])
        .unwrap();
    assert_eq!(queue_time.count, REQUESTS as u64);
}

#[tokio::test]
async fn first_token_is_recorded_once() {
    let (controller, recorder) = controller(1);
    let mut permit = controller.acquire(None).await.unwrap();

    assert!(permit.mark_first_token());
    assert!(!permit.mark_first_token());
    assert!(!permit.mark_first_token());
    permit.finish(RequestStatus::Success);

    let snap = recorder.snapshot();
    let ttft = snap
        .histogram(telemetry::TIME_TO_FIRST_TOKEN_SECONDS, &[])
        .unwrap();
    assert_eq!(ttft.count, 1);
}

#[tokio::test]
async fn dropped_permit_finalizes_as_canceled() {
    let (controller, recorder) = controller(1);
    let mut permit = controller.acquire(None).await.unwrap();
    permit.set_usage(11, 0);
    drop(permit);

    let snap = recorder.snapshot();
    assert_eq!(snap.requests_with_status(RequestStatus::Canceled), 1.0);
    assert_eq!(snap.requests_with_status(RequestStatus::Success), 0.0);
    assert_eq!(snap.scalar(telemetry::PROMPT_TOKENS_TOTAL, &[]), Some(11.0));
}
