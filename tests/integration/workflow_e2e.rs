//! Full workflow execution tests.
//!
//! These tests load workflow definitions, submit them to an orchestrator
//! with a small team of workers and check the outcome, including
//! combining answers from several agents.

use serde_json::json;

use hive::agent::{AgentId, AgentSpec};
use hive::core::TaskSource;
use hive::orchestration::{aggregate, analyze_agreement, AgentResult, AggregationStrategy};
use hive::workflow::STEP_ID_KEY;
use hive::{Error, FnWorker, TaskSpec, TaskStatus, WorkflowDefinition, WorkflowStep};

use crate::fixtures::{
    actions, echo_worker, orchestrator, recording_worker, work_log, RESEARCH_WORKFLOW,
};

/// Test: Workflow from a JSON file runs to completion
/// Given a four-step research workflow on disk and one worker per type
/// When it is submitted and run
/// Then every step completes in dependency order
#[tokio::test]
async fn test_workflow_file_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("research.json");
    std::fs::write(&path, RESEARCH_WORKFLOW).unwrap();
    let workflow = WorkflowDefinition::load(&path).unwrap();

    let orchestrator = orchestrator();
    let log = work_log();
    for agent_type in ["researcher", "checker", "writer"] {
        let id = AgentId::from(format!("{}-1", agent_type).as_str());
        orchestrator
            .register_worker(
                AgentSpec::new(agent_type).with_id(id.clone()),
                recording_worker(&id, &log),
            )
            .await
            .unwrap();
    }

    let handle = orchestrator.submit_workflow(&workflow).await.unwrap();
    assert_eq!(handle.len(), 4);

    let summary = orchestrator.run(20).await;

    assert_eq!(summary.completed.len(), 4);
    assert!(summary.failed.is_empty());
    assert!(summary.cancelled.is_empty());

    let done = actions(&log);
    let pos = |action: &str| done.iter().position(|a| a == action).unwrap();
    assert_eq!(pos("gather"), 0);
    assert!(pos("verify") < pos("draft"));
    assert!(pos("outline") < pos("draft"));
    assert_eq!(pos("draft"), 3);

    let draft_id = handle.task_id("draft").unwrap();
    let draft = orchestrator.get_task(&draft_id).unwrap();
    assert_eq!(draft.status, TaskStatus::Completed);
    assert_eq!(draft.agent_id, Some(AgentId::from("writer-1")));
    assert_eq!(draft.metadata[STEP_ID_KEY], json!("draft"));
    assert_eq!(draft.metadata["workflow"], json!("research-report"));
    assert_eq!(draft.metadata["parameters"], json!({ "topic": "ownership" }));
    assert_eq!(draft.timeout, Some(std::time::Duration::from_secs(5)));

    orchestrator.shutdown().await;
}

/// Test: Workflow plan matches the orchestrator's plan
#[tokio::test]
async fn test_workflow_layers_match_execution_plan() {
    let workflow = WorkflowDefinition::from_json(RESEARCH_WORKFLOW).unwrap();
    let layers = workflow.execution_layers().unwrap();
    assert_eq!(layers.len(), 3);
    assert_eq!(layers[0], vec!["gather".to_string()]);
    assert_eq!(layers[2], vec!["draft".to_string()]);

    let orchestrator = orchestrator();
    let handle = orchestrator.submit_workflow(&workflow).await.unwrap();
    let plan = orchestrator.execution_plan().await.unwrap();

    let as_tasks: Vec<Vec<_>> = layers
        .iter()
        .map(|layer| {
            let mut ids: Vec<_> = layer.iter().map(|s| handle.task_id(s).unwrap()).collect();
            ids.sort();
            ids
        })
        .collect();
    let sorted_plan: Vec<Vec<_>> = plan
        .into_iter()
        .map(|mut layer| {
            layer.sort();
            layer
        })
        .collect();
    assert_eq!(sorted_plan, as_tasks);
}

/// Test: Invalid workflow submits nothing
/// Given a workflow with a dependency cycle
/// When it is submitted
/// Then a validation error is returned and the queue stays empty
#[tokio::test]
async fn test_cyclic_workflow_is_rejected() {
    let workflow = WorkflowDefinition::new(
        "loop",
        vec![
            WorkflowStep::new("a", "worker", "one").depends_on("b"),
            WorkflowStep::new("b", "worker", "two").depends_on("a"),
        ],
    );

    let orchestrator = orchestrator();
    let result = orchestrator.submit_workflow(&workflow).await;

    assert!(matches!(result, Err(Error::Validation(_))));
    assert!(orchestrator.queue().is_empty());
    assert!(orchestrator.graph().read().await.is_empty());
}

/// Test: Several experts answer, results are combined
/// Given three estimators that answer the same question differently
/// When each runs a task and the answers are aggregated
/// Then consensus picks the majority and the agreement report reflects the split
#[tokio::test]
async fn test_results_from_several_agents_are_aggregated() {
    let orchestrator = orchestrator();
    let answers = [("est-1", "large"), ("est-2", "small"), ("est-3", "large")];
    let mut tasks = Vec::new();

    for (id, answer) in answers {
        let agent_type = format!("estimator-{}", id);
        orchestrator
            .register_worker(
                AgentSpec::new(&agent_type).with_id(id),
                std::sync::Arc::new(FnWorker::new(move |_| Ok(json!(answer)))),
            )
            .await
            .unwrap();
        let task = orchestrator
            .submit(TaskSpec::new(&agent_type, "estimate"))
            .await
            .unwrap();
        tasks.push((AgentId::from(id), agent_type, task.id));
    }

    let summary = orchestrator.run(10).await;
    assert_eq!(summary.completed.len(), 3);

    let results: Vec<AgentResult> = tasks
        .iter()
        .map(|(agent, agent_type, task_id)| {
            AgentResult::new(
                agent.clone(),
                agent_type,
                orchestrator.get_task_result(task_id).unwrap(),
            )
        })
        .collect();

    assert_eq!(
        aggregate(&results, AggregationStrategy::Consensus),
        Some(json!("large"))
    );
    assert_eq!(
        aggregate(&results, AggregationStrategy::Ensemble),
        Some(json!(["large", "small", "large"]))
    );

    let report = analyze_agreement(&results);
    assert_eq!(report.majority_count, 2);
    assert_eq!(report.num_unique_values, 2);
    assert!((report.agreement_level - 2.0 / 3.0).abs() < 1e-9);

    orchestrator.shutdown().await;
}

/// Test: Merge strategy over workflow outputs
#[tokio::test]
async fn test_merge_of_step_outputs() {
    let orchestrator = orchestrator();
    orchestrator
        .register_worker(AgentSpec::new("collector"), echo_worker())
        .await
        .unwrap();

    let workflow = WorkflowDefinition::new(
        "collect",
        vec![
            WorkflowStep::new("left", "collector", "scan"),
            WorkflowStep::new("right", "collector", "sweep"),
        ],
    );
    let handle = orchestrator.submit_workflow(&workflow).await.unwrap();
    orchestrator.run(10).await;

    let results: Vec<AgentResult> = handle
        .tasks()
        .iter()
        .map(|(step, id)| {
            AgentResult::new("collector", step, orchestrator.get_task_result(id).unwrap())
        })
        .collect();
    let merged = aggregate(&results, AggregationStrategy::Merge).unwrap();

    let mut merged_actions: Vec<String> = merged["action"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    merged_actions.sort();
    assert_eq!(merged_actions, vec!["scan", "sweep"]);
    assert_eq!(merged["input"], json!([null, null]));

    orchestrator.shutdown().await;
}
