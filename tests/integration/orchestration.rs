//! Dependency-ordered execution tests.
//!
//! These tests verify that the orchestrator runs tasks in an order that
//! respects both dependencies and priorities, spreads work across agents
//! and leaves unrunnable work pending.

use serde_json::json;

use hive::agent::{AgentId, AgentSpec};
use hive::core::TaskSource;
use hive::orchestration::{result_key, task_key};
use hive::{Priority, TaskSpec, TaskStatus};

use crate::fixtures::{
    actions, echo_worker, flaky_worker, orchestrator, recording_worker, work_log,
};

/// Test: Two-step pipeline with one agent
/// Given A (High) and B (Medium, depends on A)
/// When the orchestrator runs
/// Then A completes before B and both results are recorded
#[tokio::test]
async fn test_dependent_tasks_run_in_order() {
    let orchestrator = orchestrator();
    let log = work_log();
    let agent = AgentId::from("analyst-1");
    orchestrator
        .register_worker(
            AgentSpec::new("analyst").with_id(agent.clone()),
            recording_worker(&agent, &log),
        )
        .await
        .unwrap();

    let a = orchestrator
        .submit(TaskSpec::new("analyst", "collect").priority(Priority::High))
        .await
        .unwrap();
    let b = orchestrator
        .submit(
            TaskSpec::new("analyst", "summarise")
                .priority(Priority::Medium)
                .depends_on(a.id),
        )
        .await
        .unwrap();

    let summary = orchestrator.run(10).await;

    assert_eq!(summary.total_tasks, 2);
    assert_eq!(summary.completed, vec![a.id, b.id]);
    assert!(summary.failed.is_empty());
    assert!(summary.cancelled.is_empty());
    assert_eq!(actions(&log), vec!["collect", "summarise"]);

    let finished_b = orchestrator.get_task(&b.id).unwrap();
    assert_eq!(finished_b.status, TaskStatus::Completed);
    assert_eq!(finished_b.agent_id, Some(agent.clone()));
    assert_eq!(
        orchestrator.get_task_result(&b.id),
        Some(json!({ "done": "summarise", "by": "analyst-1" }))
    );

    let board = orchestrator.blackboard();
    assert!(board.exists(&task_key(&a.id)));
    assert_eq!(
        board.read_entry(&result_key(&a.id)).unwrap().author,
        "analyst-1"
    );

    orchestrator.shutdown().await;
}

/// Test: Dependencies beat priorities
/// Given a Critical task that depends on a Low task
/// When the orchestrator runs
/// Then the Low task still runs first
#[tokio::test]
async fn test_dependency_outranks_priority() {
    let orchestrator = orchestrator();
    let log = work_log();
    let agent = AgentId::from("w");
    orchestrator
        .register_worker(
            AgentSpec::new("worker").with_id(agent.clone()),
            recording_worker(&agent, &log),
        )
        .await
        .unwrap();

    let low = orchestrator
        .submit(TaskSpec::new("worker", "foundation").priority(Priority::Low))
        .await
        .unwrap();
    orchestrator
        .submit(
            TaskSpec::new("worker", "roof")
                .priority(Priority::Critical)
                .depends_on(low.id),
        )
        .await
        .unwrap();

    orchestrator.run(10).await;

    assert_eq!(actions(&log), vec!["foundation", "roof"]);
    orchestrator.shutdown().await;
}

/// Test: Independent tasks are served by priority
/// Given Low, High and Medium tasks submitted in that order
/// When the orchestrator runs
/// Then they execute High, Medium, Low
#[tokio::test]
async fn test_independent_tasks_follow_priority() {
    let orchestrator = orchestrator();
    let log = work_log();
    let agent = AgentId::from("w");
    orchestrator
        .register_worker(
            AgentSpec::new("worker").with_id(agent.clone()),
            recording_worker(&agent, &log),
        )
        .await
        .unwrap();

    for (action, priority) in [
        ("low", Priority::Low),
        ("high", Priority::High),
        ("medium", Priority::Medium),
    ] {
        orchestrator
            .submit(TaskSpec::new("worker", action).priority(priority))
            .await
            .unwrap();
    }

    let summary = orchestrator.run(10).await;

    assert_eq!(summary.completed.len(), 3);
    assert_eq!(actions(&log), vec!["high", "medium", "low"]);
    orchestrator.shutdown().await;
}

/// Test: No agent for a task type
/// Given a task nobody can run
/// When the orchestrator runs with a small iteration cap
/// Then every iteration is spent retrying it, and it ends cancelled and still Pending
#[tokio::test]
async fn test_task_without_agent_stays_pending() {
    let orchestrator = orchestrator();
    orchestrator
        .register_worker(AgentSpec::new("writer"), echo_worker())
        .await
        .unwrap();
    let task = orchestrator
        .submit(TaskSpec::new("translator", "translate"))
        .await
        .unwrap();

    let summary = orchestrator.run(5).await;

    assert!(summary.completed.is_empty());
    assert!(summary.failed.is_empty());
    assert_eq!(summary.cancelled, vec![task.id]);
    assert_eq!(summary.iterations, 5);
    assert_eq!(
        orchestrator.get_task(&task.id).unwrap().status,
        TaskStatus::Pending
    );
    orchestrator.shutdown().await;
}

/// Test: Deferred work resumes once an agent appears
/// Given a task that was deferred for lack of an agent
/// When a matching worker registers and the orchestrator runs again
/// Then the task completes
#[tokio::test]
async fn test_deferred_task_runs_after_agent_registers() {
    let orchestrator = orchestrator();
    let task = orchestrator
        .submit(TaskSpec::new("translator", "translate").input(json!("hola")))
        .await
        .unwrap();

    let first = orchestrator.run(3).await;
    assert_eq!(first.cancelled, vec![task.id]);

    orchestrator
        .register_worker(AgentSpec::new("translator"), echo_worker())
        .await
        .unwrap();
    let second = orchestrator.run(10).await;

    assert_eq!(second.completed, vec![task.id]);
    assert_eq!(
        orchestrator.get_task_result(&task.id),
        Some(json!({ "action": "translate", "input": "hola" }))
    );
    orchestrator.shutdown().await;
}

/// Test: Agent arrives while the orchestrator is running
/// Given a task with no agent and a run with a generous iteration cap
/// When a matching worker registers part-way through the run
/// Then the same run hands the task to it and finishes before the cap
#[tokio::test]
async fn test_agent_registered_during_run_receives_deferred_task() {
    let orchestrator = orchestrator();
    let task = orchestrator
        .submit(TaskSpec::new("translator", "translate").input(json!("hola")))
        .await
        .unwrap();

    let (summary, _) = tokio::join!(orchestrator.run(1000), async {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        orchestrator
            .register_worker(AgentSpec::new("translator"), echo_worker())
            .await
            .unwrap()
    });

    assert_eq!(summary.completed, vec![task.id]);
    assert!(summary.cancelled.is_empty());
    assert!(summary.iterations < 1000);
    assert_eq!(
        orchestrator.get_task_result(&task.id),
        Some(json!({ "action": "translate", "input": "hola" }))
    );
    orchestrator.shutdown().await;
}

/// Test: Failure blocks dependents
/// Given B depending on A, where A fails
/// When the orchestrator runs
/// Then A is failed, B is left pending and the run ends early
#[tokio::test]
async fn test_failed_dependency_blocks_dependents() {
    let orchestrator = orchestrator();
    orchestrator
        .register_worker(AgentSpec::new("worker"), flaky_worker())
        .await
        .unwrap();

    let a = orchestrator
        .submit(TaskSpec::new("worker", "fail"))
        .await
        .unwrap();
    let b = orchestrator
        .submit(TaskSpec::new("worker", "after").depends_on(a.id))
        .await
        .unwrap();

    let summary = orchestrator.run(50).await;

    assert_eq!(summary.failed, vec![a.id]);
    assert_eq!(summary.cancelled, vec![b.id]);
    assert!(summary.iterations < 50);

    let failed = orchestrator.get_task(&a.id).unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.error.unwrap().contains("cannot fail"));
    assert_eq!(orchestrator.get_task_result(&a.id), None);
    orchestrator.shutdown().await;
}

/// Test: Least-loaded agent wins
/// Given two agents of the same type, one already busy
/// When a task is run
/// Then the idle agent gets it and the workloads are balanced afterwards
#[tokio::test]
async fn test_dispatch_prefers_least_loaded_agent() {
    let orchestrator = orchestrator();
    let busy = AgentId::from("w1");
    let idle = AgentId::from("w2");
    for id in [&busy, &idle] {
        orchestrator
            .register_worker(AgentSpec::new("worker").with_id(id.clone()), echo_worker())
            .await
            .unwrap();
    }
    orchestrator
        .directory()
        .write()
        .await
        .increment_agent_workload(&busy)
        .unwrap();

    let task = orchestrator
        .submit(TaskSpec::new("worker", "job"))
        .await
        .unwrap();
    orchestrator.run(5).await;

    assert_eq!(orchestrator.get_task(&task.id).unwrap().agent_id, Some(idle.clone()));

    let directory = orchestrator.directory().read().await;
    let idle_info = directory.get_agent(&idle).unwrap();
    assert_eq!(idle_info.workload, 0);
    assert_eq!(idle_info.tasks_completed, 1);
    assert_eq!(directory.get_agent(&busy).unwrap().workload, 1);
    drop(directory);

    orchestrator.shutdown().await;
}

/// Test: Status snapshot after a run
#[tokio::test]
async fn test_system_status_after_run() {
    let orchestrator = orchestrator();
    orchestrator
        .register_worker(AgentSpec::new("worker"), echo_worker())
        .await
        .unwrap();
    for i in 0..3 {
        orchestrator
            .submit(TaskSpec::new("worker", &format!("job-{}", i)))
            .await
            .unwrap();
    }

    orchestrator.run(10).await;
    let status = orchestrator.system_status().await;

    assert_eq!(status.running_runtimes, 1);
    assert_eq!(status.task_queue.completed_tasks, 3);
    assert_eq!(status.dependency_graph.total_nodes, 3);
    assert!(status.message_bus.messages_sent >= 6);
    assert_eq!(orchestrator.queue().pending_ids().len(), 0);

    orchestrator.shutdown().await;
    assert_eq!(orchestrator.system_status().await.running_runtimes, 0);
}
