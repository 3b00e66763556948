//! Message bus and blackboard tests.
//!
//! These tests verify the shared communication channels under realistic
//! use: request/reply between tasks, fan-out to subscribers and many
//! writers hitting the blackboard at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;

use hive::agent::AgentId;
use hive::bus::HistoryFilter;
use hive::{Blackboard, BlackboardConfig, Message, MessageBus, MessageType};

const WAIT: Duration = Duration::from_secs(2);

/// Test: Question and answer between two agents
/// Given a planner and a coder on the same bus
/// When the planner asks a question from one task and the coder answers from another
/// Then each side receives the other's message and history records both
#[tokio::test]
async fn test_question_answer_round_trip() {
    let bus = Arc::new(MessageBus::new());
    let planner = AgentId::from("planner");
    let coder = AgentId::from("coder");
    bus.register_agent(&planner);
    bus.register_agent(&coder);

    let responder = {
        let bus = Arc::clone(&bus);
        let coder = coder.clone();
        tokio::spawn(async move {
            let question = bus.receive(&coder, WAIT).await.unwrap().unwrap();
            assert_eq!(question.msg_type(), MessageType::Question);
            bus.send(Message::new(
                coder.clone(),
                question.sender().clone(),
                MessageType::Result,
                json!({ "answer": 42, "re": question.content()["question"] }),
            ));
        })
    };

    bus.send(Message::new(
        planner.clone(),
        coder.clone(),
        MessageType::Question,
        json!({ "question": "how many?" }),
    ));
    let answer = bus.receive(&planner, WAIT).await.unwrap().unwrap();
    responder.await.unwrap();

    assert_eq!(answer.sender(), &coder);
    assert_eq!(answer.content(), &json!({ "answer": 42, "re": "how many?" }));

    let history = bus.history(&HistoryFilter {
        agent: Some(planner.clone()),
        ..Default::default()
    });
    assert_eq!(history.len(), 2);
    assert_eq!(bus.stats().messages_received, 2);
}

/// Test: Broadcast fan-out
/// Given three agents, two subscribed to notifications
/// When a notification is broadcast
/// Then only subscribers receive it, each as a separately addressed copy
#[tokio::test]
async fn test_broadcast_reaches_subscribers_only() {
    let bus = MessageBus::new();
    let agents: Vec<AgentId> = ["a", "b", "c"].into_iter().map(AgentId::from).collect();
    for agent in &agents {
        bus.register_agent(agent);
    }
    bus.subscribe(&agents[0], MessageType::Notification);
    bus.subscribe(&agents[1], MessageType::Notification);

    let announcement = Message::broadcast(
        AgentId::orchestrator(),
        MessageType::Notification,
        json!("deploy starting"),
    );
    assert_eq!(bus.broadcast(&announcement), 2);

    let first = bus.try_receive(&agents[0]).unwrap().unwrap();
    let second = bus.try_receive(&agents[1]).unwrap().unwrap();
    assert_eq!(first.receiver(), &agents[0]);
    assert_eq!(second.receiver(), &agents[1]);
    assert_ne!(first.id(), second.id());
    assert_eq!(first.content(), &json!("deploy starting"));
    assert!(!bus.has_messages(&agents[2]));
}

/// Test: Receive wakes on delivery
/// Given an agent already waiting on an empty mailbox
/// When a message arrives later
/// Then the wait returns that message well before its timeout
#[tokio::test]
async fn test_receive_wakes_on_late_delivery() {
    let bus = Arc::new(MessageBus::new());
    let agent = AgentId::from("listener");
    bus.register_agent(&agent);

    let waiter = {
        let bus = Arc::clone(&bus);
        let agent = agent.clone();
        tokio::spawn(async move { bus.receive(&agent, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.send(Message::new(
        AgentId::orchestrator(),
        agent.clone(),
        MessageType::Notification,
        json!("ping"),
    ));

    let received = tokio::time::timeout(WAIT, waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(received.unwrap().content(), &json!("ping"));
}

/// Test: Concurrent blackboard writers
/// Given 16 threads writing the same key
/// When all writes finish
/// Then every write got a distinct version from 1 to 16
#[test]
fn test_blackboard_concurrent_writes_get_distinct_versions() {
    let board = Arc::new(Blackboard::new());
    let writers = 16;

    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let board = Arc::clone(&board);
            thread::spawn(move || board.write("counter", json!(i), &format!("writer-{}", i)))
        })
        .collect();
    let mut versions: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    versions.sort_unstable();

    assert_eq!(versions, (1..=writers as u64).collect::<Vec<_>>());
    assert_eq!(board.read_entry("counter").unwrap().version, writers as u64);
    assert_eq!(board.stats().writes, writers as u64);
}

/// Test: Observers see every write
#[test]
fn test_blackboard_observer_counts_concurrent_writes() {
    let board = Arc::new(Blackboard::new());
    let seen = Arc::new(AtomicUsize::new(0));
    {
        let seen = Arc::clone(&seen);
        board.subscribe("status", move |_key, _entry| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
    }

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let board = Arc::clone(&board);
            thread::spawn(move || board.write("status", json!(i), "worker"))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(seen.load(Ordering::SeqCst), 8);
}

/// Test: Snapshot survives a restart
/// Given a persistent blackboard with a few entries
/// When it is reopened from the same file
/// Then values, versions and authors are restored
#[test]
fn test_blackboard_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("board.json");

    {
        let board = Blackboard::open(BlackboardConfig::persistent(&path));
        board.write("plan", json!(["a", "b"]), "planner");
        board.write("plan", json!(["a", "b", "c"]), "planner");
        board.write("scratch", json!(1), "coder");
        assert!(board.delete("scratch"));
    }

    let reopened = Blackboard::open(BlackboardConfig::persistent(&path));
    let entry = reopened.read_entry("plan").unwrap();
    assert_eq!(entry.value, json!(["a", "b", "c"]));
    assert_eq!(entry.version, 2);
    assert_eq!(entry.author, "planner");
    assert!(!reopened.exists("scratch"));
    assert_eq!(reopened.keys(), vec!["plan".to_string()]);
}
