//! Fleet scaler behaviour against an in-memory queue and fleet.

mod common;

use std::sync::Arc;

use common::{FakeFleet, MemoryQueue};
use flowrun::fleet::{FleetScaler, ScalingDecision, ScalingError, ScalingPolicy};
use flowrun::scheduler::{Envelope, MessageQueue};
use serde_json::json;

async fn fill(queue: &MemoryQueue, count: usize) {
    for i in 0..count {
        queue
            .publish(Envelope::new(json!({"taskType": "test-run", "n": i})))
            .await
            .unwrap();
    }
}

async fn drain(queue: &MemoryQueue) {
    while let Some(envelope) = queue
        .receive(std::time::Duration::from_millis(1))
        .await
        .unwrap()
    {
        queue.ack(&envelope).await.unwrap();
    }
}

fn scaler(
    queue: &Arc<MemoryQueue>,
    fleet: &Arc<FakeFleet>,
    policy: ScalingPolicy,
) -> FleetScaler {
    FleetScaler::new(queue.clone(), fleet.clone(), policy)
}

#[tokio::test]
async fn test_idle_fleet_holds() {
    let queue = Arc::new(MemoryQueue::new("exec"));
    let fleet = Arc::new(FakeFleet::new());
    let scaler = scaler(&queue, &fleet, ScalingPolicy::default());

    let report = scaler.tick().await.unwrap();
    assert_eq!(report.decision, ScalingDecision::Hold);
    assert_eq!(report.backlog, 0);
    assert_eq!(fleet.len(), 0);
}

#[tokio::test]
async fn test_launches_to_desired_capacity() {
    let queue = Arc::new(MemoryQueue::new("exec"));
    let fleet = Arc::new(FakeFleet::new());
    let policy = ScalingPolicy {
        messages_per_worker: 2,
        ..Default::default()
    };
    let scaler = scaler(&queue, &fleet, policy);
    fill(&queue, 7).await;

    let report = scaler.tick().await.unwrap();
    assert_eq!(report.desired_workers, 4);
    assert_eq!(report.decision, ScalingDecision::Launch(4));
    assert_eq!(report.launched.len(), 4);
    assert_eq!(fleet.len(), 4);

    // Already at capacity.
    let report = scaler.tick().await.unwrap();
    assert_eq!(report.decision, ScalingDecision::Hold);
    assert_eq!(fleet.len(), 4);
}

#[tokio::test]
async fn test_growth_is_stepped_and_capped() {
    let queue = Arc::new(MemoryQueue::new("exec"));
    let fleet = Arc::new(FakeFleet::new());
    let policy = ScalingPolicy {
        max_workers: 8,
        max_step: 5,
        ..Default::default()
    };
    let scaler = scaler(&queue, &fleet, policy);
    fill(&queue, 50).await;

    assert_eq!(scaler.tick().await.unwrap().decision, ScalingDecision::Launch(5));
    assert_eq!(scaler.tick().await.unwrap().decision, ScalingDecision::Launch(3));
    assert_eq!(scaler.tick().await.unwrap().decision, ScalingDecision::Hold);
    assert_eq!(fleet.len(), 8);
}

#[tokio::test]
async fn test_scale_down_after_sustained_surplus() {
    let queue = Arc::new(MemoryQueue::new("exec"));
    let fleet = Arc::new(FakeFleet::with_workers(4));
    let policy = ScalingPolicy {
        min_workers: 1,
        scale_down_after_ticks: 3,
        ..Default::default()
    };
    let scaler = scaler(&queue, &fleet, policy);

    assert_eq!(scaler.tick().await.unwrap().decision, ScalingDecision::Hold);
    assert_eq!(scaler.tick().await.unwrap().decision, ScalingDecision::Hold);

    let report = scaler.tick().await.unwrap();
    assert_eq!(report.decision, ScalingDecision::Decommission(3));
    // Newest first: the oldest worker survives.
    assert_eq!(report.decommissioned, vec!["worker-3", "worker-2", "worker-1"]);
    assert_eq!(fleet.worker_ids(), vec!["worker-0"]);

    // At the floor now.
    assert_eq!(scaler.tick().await.unwrap().decision, ScalingDecision::Hold);
    assert_eq!(fleet.len(), 1);
}

#[tokio::test]
async fn test_busy_workers_are_not_decommissioned() {
    let queue = Arc::new(MemoryQueue::new("exec"));
    let fleet = Arc::new(FakeFleet::with_workers(3));
    let scaler = scaler(&queue, &fleet, ScalingPolicy::default());
    fill(&queue, 3).await;

    // Every worker holds a message, so nothing is left waiting.
    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(
            queue
                .receive(std::time::Duration::from_millis(1))
                .await
                .unwrap()
                .unwrap(),
        );
    }

    for _ in 0..5 {
        let report = scaler.tick().await.unwrap();
        assert_eq!(report.backlog, 0);
        assert_eq!(report.in_flight, 3);
        assert_eq!(report.desired_workers, 3);
        assert_eq!(report.decision, ScalingDecision::Hold);
    }
    assert_eq!(fleet.len(), 3);

    for envelope in &held {
        queue.ack(envelope).await.unwrap();
    }
    assert_eq!(scaler.tick().await.unwrap().decision, ScalingDecision::Hold);
    assert_eq!(scaler.tick().await.unwrap().decision, ScalingDecision::Hold);
    assert_eq!(
        scaler.tick().await.unwrap().decision,
        ScalingDecision::Decommission(3)
    );
    assert_eq!(fleet.len(), 0);
}

#[tokio::test]
async fn test_in_flight_work_counts_toward_launches() {
    let queue = Arc::new(MemoryQueue::new("exec"));
    let fleet = Arc::new(FakeFleet::with_workers(1));
    let scaler = scaler(&queue, &fleet, ScalingPolicy::default());
    fill(&queue, 3).await;
    queue
        .receive(std::time::Duration::from_millis(1))
        .await
        .unwrap()
        .unwrap();

    let report = scaler.tick().await.unwrap();
    assert_eq!(report.backlog, 2);
    assert_eq!(report.in_flight, 1);
    assert_eq!(report.decision, ScalingDecision::Launch(2));
    assert_eq!(fleet.len(), 3);
}

#[tokio::test]
async fn test_returning_demand_resets_surplus() {
    let queue = Arc::new(MemoryQueue::new("exec"));
    let fleet = Arc::new(FakeFleet::with_workers(2));
    let policy = ScalingPolicy {
        scale_down_after_ticks: 2,
        ..Default::default()
    };
    let scaler = scaler(&queue, &fleet, policy);

    assert_eq!(scaler.tick().await.unwrap().decision, ScalingDecision::Hold);

    fill(&queue, 2).await;
    assert_eq!(scaler.tick().await.unwrap().decision, ScalingDecision::Hold);

    drain(&queue).await;
    // The streak starts over, so one surplus tick is not enough.
    assert_eq!(scaler.tick().await.unwrap().decision, ScalingDecision::Hold);
    assert_eq!(
        scaler.tick().await.unwrap().decision,
        ScalingDecision::Decommission(2)
    );
    assert_eq!(fleet.len(), 0);
}

#[tokio::test]
async fn test_launch_failures_are_reported_not_raised() {
    let queue = Arc::new(MemoryQueue::new("exec"));
    let fleet = Arc::new(FakeFleet::new());
    fleet.set_fail_launches(true);
    let scaler = scaler(&queue, &fleet, ScalingPolicy::default());
    fill(&queue, 2).await;

    let report = scaler.tick().await.unwrap();
    assert_eq!(report.decision, ScalingDecision::Launch(2));
    assert!(report.launched.is_empty());
    assert_eq!(report.failures.len(), 2);
    assert!(report.warning().unwrap().contains("capacity exhausted"));
}

#[tokio::test]
async fn test_unreadable_fleet_fails_the_tick() {
    let queue = Arc::new(MemoryQueue::new("exec"));
    let fleet = Arc::new(FakeFleet::new());
    fleet.set_fail_listing(true);
    let scaler = scaler(&queue, &fleet, ScalingPolicy::default());

    let err = scaler.tick().await.unwrap_err();
    assert!(matches!(err, ScalingError::Fleet(_)));
}

#[tokio::test]
async fn test_concurrent_ticks_do_not_double_launch() {
    let queue = Arc::new(MemoryQueue::new("exec"));
    let fleet = Arc::new(FakeFleet::new());
    let scaler = Arc::new(scaler(&queue, &fleet, ScalingPolicy::default()));
    fill(&queue, 3).await;

    let (first, second) = tokio::join!(scaler.tick(), scaler.tick());
    let launched = first.unwrap().launched.len() + second.unwrap().launched.len();

    assert_eq!(launched, 3);
    assert_eq!(fleet.len(), 3);
}

#[tokio::test]
async fn test_report_serializes_decision() {
    let queue = Arc::new(MemoryQueue::new("exec"));
    let fleet = Arc::new(FakeFleet::new());
    let scaler = scaler(&queue, &fleet, ScalingPolicy::default());
    fill(&queue, 1).await;

    let value = serde_json::to_value(scaler.tick().await.unwrap()).unwrap();
    assert_eq!(value["decision"], json!({"action": "launch", "count": 1}));
    assert_eq!(value["activeWorkers"], json!(0));
    assert_eq!(value["launched"][0]["id"], json!("worker-0"));
}
