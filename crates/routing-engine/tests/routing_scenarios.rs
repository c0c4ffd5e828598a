//! End-to-end routing scenarios
//!
//! Escalation scenarios run on a paused Tokio clock so step timeouts elapse
//! instantly and deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rvoip_routing_engine::prelude::*;
use tokio::sync::broadcast;

fn sales_expression() -> Expression {
    Expression::new(vec![Term::new(
        "sales",
        RelationalOperator::Eq,
        AttributeValue::Bool(true),
    )])
}

fn attributes(sales: bool) -> AttributeSet {
    let mut attributes: AttributeSet = HashMap::new();
    attributes.insert("sales".into(), AttributeValue::Bool(sales));
    attributes
}

/// Step 0 needs "sales" for 30s, step 1 takes anyone
fn two_step_queue() -> QueueDefinition {
    QueueDefinition::new("sales", "Sales", "chat")
        .with_step(StepDefinition::new(vec![sales_expression()], 30).with_id("sales-only"))
        .with_step(StepDefinition::new(Vec::new(), 0).with_id("everyone"))
}

async fn ready_agent(engine: &RoutingEngine, id: &str, sales: bool) -> AgentId {
    let agent_id = AgentId::from(id);
    engine
        .register_agent(Agent::new(id, id, attributes(sales)))
        .await
        .unwrap();
    engine.set_agent_state(&agent_id, AgentState::Ready).await.unwrap();
    engine
        .set_media_domain_state(&agent_id, "chat".into(), MediaDomainState::Ready)
        .await
        .unwrap();
    agent_id
}

/// Let routers and the timer driver drain their pending work
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn next_outcome(outcomes: &mut broadcast::Receiver<RoutingOutcome>) -> RoutingOutcome {
    tokio::time::timeout(Duration::from_secs(300), outcomes.recv())
        .await
        .expect("no routing outcome")
        .expect("outcome channel closed")
}

async fn next_reservation(outcomes: &mut broadcast::Receiver<RoutingOutcome>) -> (TaskId, AgentId, usize) {
    loop {
        if let RoutingOutcome::Reserved {
            task,
            agent_id,
            step_index,
            ..
        } = next_outcome(outcomes).await
        {
            return (task.task_id, agent_id, step_index);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_escalates_to_wider_step_after_timeout() {
    let engine = RoutingEngine::new(RoutingEngineConfig::default()).unwrap();
    let mut outcomes = engine.outcomes();
    engine.create_queue(two_step_queue()).await.unwrap();

    let a = ready_agent(&engine, "a", true).await;
    engine.set_non_interruptible(&a, true).await.unwrap();
    let b = ready_agent(&engine, "b", false).await;

    let started = tokio::time::Instant::now();
    assert!(engine
        .admit_task(TaskRequest::new("t", "conv", "sales").with_priority(5))
        .await
        .unwrap());

    // A is busy and B is only eligible from step 1
    assert!(tokio::time::timeout(Duration::from_secs(29), outcomes.recv())
        .await
        .is_err());

    match next_outcome(&mut outcomes).await {
        RoutingOutcome::Escalated { from_step, to_step, .. } => {
            assert_eq!((from_step, to_step), (0, 1));
        }
        other => panic!("expected escalation, got {:?}", other),
    }
    let (task_id, agent_id, step_index) = next_reservation(&mut outcomes).await;
    assert_eq!(task_id, TaskId::from("t"));
    assert_eq!(agent_id, b);
    assert_eq!(step_index, 1);
    assert!(started.elapsed() >= Duration::from_secs(30));

    assert!(engine.queue(&QueueId::from("sales")).unwrap().is_empty());
    assert!(!engine.timers().is_armed(&TaskId::from("t")));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_priority_served_before_arrival_order() {
    let engine = RoutingEngine::new(RoutingEngineConfig::default()).unwrap();
    let mut outcomes = engine.outcomes();
    engine
        .create_queue(
            QueueDefinition::new("sales", "Sales", "chat")
                .with_step(StepDefinition::new(Vec::new(), 0)),
        )
        .await
        .unwrap();

    let agent_id = AgentId::from("solo");
    engine
        .register_agent(Agent::new("solo", "Solo", AttributeSet::new()))
        .await
        .unwrap();
    engine.set_agent_state(&agent_id, AgentState::Ready).await.unwrap();

    engine
        .admit_task(TaskRequest::new("t1", "c1", "sales").with_priority(5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    engine
        .admit_task(TaskRequest::new("t2", "c2", "sales").with_priority(10))
        .await
        .unwrap();
    settle().await;

    let queue = engine.queue(&QueueId::from("sales")).unwrap();
    assert_eq!(queue.peek_head().unwrap().task_id, TaskId::from("t2"));

    // the agent becomes available on the queue's media domain
    engine
        .set_media_domain_state(&agent_id, "chat".into(), MediaDomainState::Ready)
        .await
        .unwrap();
    let (first, _, _) = next_reservation(&mut outcomes).await;
    assert_eq!(first, TaskId::from("t2"));

    engine.accept_reservation(&agent_id).await.unwrap();
    let (second, _, _) = next_reservation(&mut outcomes).await;
    assert_eq!(second, TaskId::from("t1"));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_attribute_update_removes_agent_from_step() {
    let engine = RoutingEngine::new(RoutingEngineConfig::default()).unwrap();
    let mut outcomes = engine.outcomes();
    let queue = engine
        .create_queue(
            QueueDefinition::new("sales", "Sales", "chat")
                .with_step(StepDefinition::new(vec![sales_expression()], 0)),
        )
        .await
        .unwrap();

    let a = ready_agent(&engine, "a", true).await;
    assert!(queue.step_at(0).unwrap().contains(&a));

    engine.update_agent_attributes(&a, attributes(false)).await.unwrap();
    assert!(!queue.step_at(0).unwrap().contains(&a));

    engine.admit_task(TaskRequest::new("t", "c", "sales")).await.unwrap();
    assert!(tokio::time::timeout(Duration::from_secs(60), outcomes.recv())
        .await
        .is_err());
    assert_eq!(queue.len(), 1);

    // restoring the attribute makes the queued task routable again
    engine.update_agent_attributes(&a, attributes(true)).await.unwrap();
    let (task_id, agent_id, _) = next_reservation(&mut outcomes).await;
    assert_eq!((task_id, agent_id), (TaskId::from("t"), a));
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_queues_reserve_agent_once() {
    let engine = Arc::new(RoutingEngine::new(RoutingEngineConfig::default()).unwrap());
    let mut outcomes = engine.outcomes();
    for id in ["east", "west"] {
        engine
            .create_queue(
                QueueDefinition::new(id, id, "chat").with_step(StepDefinition::new(Vec::new(), 0)),
            )
            .await
            .unwrap();
    }
    let shared = ready_agent(&engine, "shared", true).await;

    let east = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.admit_task(TaskRequest::new("e1", "c", "east")).await })
    };
    let west = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.admit_task(TaskRequest::new("w1", "c", "west")).await })
    };
    assert!(east.await.unwrap().unwrap());
    assert!(west.await.unwrap().unwrap());

    let (winner, agent_id, _) = next_reservation(&mut outcomes).await;
    assert_eq!(agent_id, shared);
    assert!(tokio::time::timeout(Duration::from_millis(200), next_reservation(&mut outcomes))
        .await
        .is_err());

    let waiting = engine.queue_stats(&QueueId::from("east")).unwrap().total_tasks
        + engine.queue_stats(&QueueId::from("west")).unwrap().total_tasks;
    assert_eq!(waiting, 1);

    // accepting frees the slot and the losing queue gets the agent next
    let accepted = engine.accept_reservation(&shared).await.unwrap();
    assert_eq!(accepted.task_id(), &winner);
    let (loser, _, _) = next_reservation(&mut outcomes).await;
    assert_ne!(loser, winner);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_racing_timer_is_silent() {
    let engine = RoutingEngine::new(RoutingEngineConfig::default()).unwrap();
    let mut outcomes = engine.outcomes();
    let queue = engine
        .create_queue(
            QueueDefinition::new("sales", "Sales", "chat")
                .with_step(StepDefinition::new(vec![sales_expression()], 5))
                .with_step(StepDefinition::new(vec![sales_expression()], 5))
                .with_step(StepDefinition::new(Vec::new(), 0)),
        )
        .await
        .unwrap();

    let task_id = TaskId::from("t");
    engine.admit_task(TaskRequest::new("t", "c", "sales")).await.unwrap();
    settle().await;
    assert!(engine.timers().is_armed(&task_id));

    // wake exactly when the step timer is due
    tokio::time::sleep(Duration::from_secs(5) - Duration::from_millis(10)).await;
    assert!(engine.cancel_task(queue.id(), &task_id).await.unwrap());
    assert!(!engine.cancel_task(queue.id(), &task_id).await.unwrap());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(queue.is_empty());
    assert!(!engine.timers().is_armed(&task_id));

    let mut removed = false;
    while let Ok(outcome) = outcomes.try_recv() {
        match outcome {
            RoutingOutcome::Removed { task_id: id, .. } => {
                assert_eq!(id, task_id);
                removed = true;
            }
            RoutingOutcome::Escalated { to_step, .. } => assert!(to_step <= 1),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert!(removed);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_admission_is_noop() {
    let engine = RoutingEngine::new(RoutingEngineConfig::default()).unwrap();
    engine.create_queue(two_step_queue()).await.unwrap();

    assert!(engine.admit_task(TaskRequest::new("t", "c", "sales").with_priority(1)).await.unwrap());
    assert!(!engine.admit_task(TaskRequest::new("t", "c", "sales").with_priority(9)).await.unwrap());

    let queued = engine.queued_task(&QueueId::from("sales"), &TaskId::from("t")).unwrap();
    assert_eq!(queued.priority, 1);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_steps_are_passed_over() {
    let engine = RoutingEngine::new(RoutingEngineConfig::default()).unwrap();
    let mut outcomes = engine.outcomes();
    engine
        .create_queue(
            QueueDefinition::new("sales", "Sales", "chat")
                .with_step(StepDefinition::new(vec![sales_expression()], 0))
                .with_step(StepDefinition::new(vec![sales_expression()], 20))
                .with_step(StepDefinition::new(vec![sales_expression()], 0)),
        )
        .await
        .unwrap();

    engine.admit_task(TaskRequest::new("t", "c", "sales")).await.unwrap();
    match next_outcome(&mut outcomes).await {
        RoutingOutcome::Escalated { from_step, to_step, .. } => assert_eq!((from_step, to_step), (0, 1)),
        other => panic!("unexpected outcome {:?}", other),
    }

    let before = tokio::time::Instant::now();
    match next_outcome(&mut outcomes).await {
        RoutingOutcome::Escalated { from_step, to_step, .. } => assert_eq!((from_step, to_step), (1, 2)),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(before.elapsed() >= Duration::from_secs(20));
    assert!(!engine.timers().is_armed(&TaskId::from("t")));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_least_loaded_agent_preferred() {
    let engine = RoutingEngine::new(RoutingEngineConfig::default()).unwrap();
    let mut outcomes = engine.outcomes();
    engine
        .create_queue(
            QueueDefinition::new("sales", "Sales", "chat")
                .with_step(StepDefinition::new(Vec::new(), 0)),
        )
        .await
        .unwrap();

    let busy = ready_agent(&engine, "busy", true).await;
    let idle = ready_agent(&engine, "idle", true).await;
    engine
        .add_active_task(&busy, "chat".into(), ActiveTask::new("earlier".into(), TaskMode::Queue))
        .await
        .unwrap();
    // push-delivered work does not count against the idle agent
    engine
        .add_active_task(&idle, "chat".into(), ActiveTask::new("push".into(), TaskMode::PushOutbound))
        .await
        .unwrap();

    engine.admit_task(TaskRequest::new("t", "c", "sales")).await.unwrap();
    let (_, agent_id, _) = next_reservation(&mut outcomes).await;
    assert_eq!(agent_id, idle);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_last_assigned_agent_behind_flag() {
    for enabled in [false, true] {
        let mut config = RoutingEngineConfig::default();
        config.router.assign_to_last_agent = enabled;
        let engine = RoutingEngine::new(config).unwrap();
        let mut outcomes = engine.outcomes();
        engine
            .create_queue(
                QueueDefinition::new("sales", "Sales", "chat")
                    .with_step(StepDefinition::new(Vec::new(), 0)),
            )
            .await
            .unwrap();

        let first = ready_agent(&engine, "first", true).await;
        let previous = ready_agent(&engine, "previous", true).await;

        engine
            .admit_task(TaskRequest::new("t", "c", "sales").with_last_assigned_agent("previous"))
            .await
            .unwrap();
        let (_, agent_id, _) = next_reservation(&mut outcomes).await;
        if enabled {
            assert_eq!(agent_id, previous);
        } else {
            assert_eq!(agent_id, first);
        }
        engine.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_routing_disabled_still_escalates() {
    let mut config = RoutingEngineConfig::default();
    config.router.routing_enabled = false;
    let engine = RoutingEngine::new(config).unwrap();
    let mut outcomes = engine.outcomes();
    engine.create_queue(two_step_queue()).await.unwrap();
    ready_agent(&engine, "a", true).await;

    engine.admit_task(TaskRequest::new("t", "c", "sales")).await.unwrap();
    match next_outcome(&mut outcomes).await {
        RoutingOutcome::Escalated { to_step, .. } => assert_eq!(to_step, 1),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(tokio::time::timeout(Duration::from_secs(60), outcomes.recv())
        .await
        .is_err());
    assert_eq!(engine.queue_stats(&QueueId::from("sales")).unwrap().total_tasks, 1);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_revoked_task_returns_at_its_step() {
    let engine = RoutingEngine::new(RoutingEngineConfig::default()).unwrap();
    let mut outcomes = engine.outcomes();
    let queue = engine.create_queue(two_step_queue()).await.unwrap();

    engine.admit_task(TaskRequest::new("t", "c", "sales")).await.unwrap();
    let original = queue.get_task(&TaskId::from("t")).unwrap();

    // no sales agent: the task escalates, then anyone may take it
    tokio::time::sleep(Duration::from_secs(31)).await;
    let b = ready_agent(&engine, "b", false).await;
    let (_, agent_id, step_index) = next_reservation(&mut outcomes).await;
    assert_eq!((agent_id.clone(), step_index), (b.clone(), 1));

    // take the agent out before revoking so the task stays queued
    engine.set_agent_state(&b, AgentState::NotReady).await.unwrap();
    let revoked = engine.revoke_reservation(&b).await.unwrap();
    assert_eq!(revoked.task_id(), &TaskId::from("t"));
    settle().await;

    let requeued = queue.get_task(&TaskId::from("t")).unwrap();
    assert_eq!(requeued.step_index, 1);
    assert_eq!(requeued.enqueued_at, original.enqueued_at);
    assert!(requeued.assigned_to.is_none());

    engine.set_agent_state(&b, AgentState::Ready).await.unwrap();
    let (task_id, agent_id, _) = next_reservation(&mut outcomes).await;
    assert_eq!((task_id, agent_id), (TaskId::from("t"), b));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_removed_agent_releases_reservation() {
    let engine = RoutingEngine::new(RoutingEngineConfig::default()).unwrap();
    let mut outcomes = engine.outcomes();
    let queue = engine
        .create_queue(
            QueueDefinition::new("sales", "Sales", "chat")
                .with_step(StepDefinition::new(Vec::new(), 0)),
        )
        .await
        .unwrap();

    let a = ready_agent(&engine, "a", true).await;
    engine.admit_task(TaskRequest::new("t", "c", "sales")).await.unwrap();
    next_reservation(&mut outcomes).await;
    assert!(queue.is_empty());

    let requeued = engine.remove_agent(&a).await.unwrap().unwrap();
    assert_eq!(requeued.task_id, TaskId::from("t"));
    settle().await;
    assert_eq!(queue.len(), 1);
    assert!(!queue.step_at(0).unwrap().contains(&a));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_appended_step_extends_escalation() {
    let engine = RoutingEngine::new(RoutingEngineConfig::default()).unwrap();
    let mut outcomes = engine.outcomes();
    let queue_id = QueueId::from("sales");
    let queue = engine
        .create_queue(
            QueueDefinition::new("sales", "Sales", "chat")
                .with_step(StepDefinition::new(vec![sales_expression()], 10)),
        )
        .await
        .unwrap();

    // alone on the last step, the task has nowhere to go
    engine.admit_task(TaskRequest::new("t", "c", "sales")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(queue.get_task(&TaskId::from("t")).unwrap().step_index, 0);

    engine
        .add_step(&queue_id, StepDefinition::new(Vec::new(), 0))
        .await
        .unwrap();
    loop {
        if let RoutingOutcome::Escalated { task_id, from_step, to_step, .. } = next_outcome(&mut outcomes).await {
            assert_eq!((task_id, from_step, to_step), (TaskId::from("t"), 0, 1));
            break;
        }
    }

    let b = ready_agent(&engine, "b", false).await;
    assert_eq!(next_reservation(&mut outcomes).await, (TaskId::from("t"), b, 1));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_queue_configuration_errors() {
    let mut config = RoutingEngineConfig::default();
    config.queues.max_steps_per_queue = 2;
    let engine = RoutingEngine::new(config).unwrap();
    let queue_id = QueueId::from("sales");
    engine.create_queue(two_step_queue()).await.unwrap();

    assert!(matches!(
        engine.create_queue(two_step_queue()).await,
        Err(RoutingError::AlreadyExists(_))
    ));
    assert!(matches!(
        engine.add_step(&queue_id, StepDefinition::new(Vec::new(), 0)).await,
        Err(RoutingError::Configuration(_))
    ));
    assert!(matches!(
        engine.admit_task(TaskRequest::new("t", "c", "missing")).await,
        Err(RoutingError::NotFound(_))
    ));

    engine.delete_step(&queue_id, &StepId::from("sales-only")).await.unwrap();
    engine
        .update_step(&queue_id, &StepId::from("everyone"), StepDefinition::new(vec![sales_expression()], 0))
        .await
        .unwrap();
    let queue = engine.queue(&queue_id).unwrap();
    assert_eq!(queue.step_count(), 1);
    assert_eq!(queue.step_at(0).unwrap().id(), &StepId::from("everyone"));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_flush_and_delete_queue() {
    let engine = RoutingEngine::new(RoutingEngineConfig::default()).unwrap();
    let queue_id = QueueId::from("sales");
    engine.create_queue(two_step_queue()).await.unwrap();

    for id in ["a", "b", "c"] {
        engine.admit_task(TaskRequest::new(id, "c", "sales")).await.unwrap();
    }
    settle().await;
    assert_eq!(engine.timers().armed_count(), 3);

    let flushed = engine.flush_queue(&queue_id).await.unwrap();
    assert_eq!(flushed.len(), 3);
    assert_eq!(engine.timers().armed_count(), 0);

    engine.admit_task(TaskRequest::new("d", "c", "sales")).await.unwrap();
    let dropped = engine.delete_queue(&queue_id).await.unwrap();
    assert_eq!(dropped.len(), 1);
    assert!(engine.queue(&queue_id).is_none());
    engine.shutdown().await;
}
