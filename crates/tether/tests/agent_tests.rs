//! End-to-end scenarios against the session agent, wired through in-memory
//! collaborators.

use tether::session::{SessionStatus, StartRequest, StopReason};
use tether_protocol::{
    ClientEvent, ClientMessage, MessageParts, Role, RunnerCommand, RunnerMessage, ToolCallStatus,
};

mod common;
use common::*;

/// Scenario: prompts queued before the runner exists drain in FIFO order on
/// arrival, the second only after the first completes.
#[tokio::test]
async fn queued_prompts_drain_on_runner_arrival() {
    let env = test_env();
    let handle = env.registry.ensure("s-drain").await.unwrap();

    handle
        .start(StartRequest {
            initial_prompt: Some("hello".to_string()),
            ..start_request_provisioned()
        })
        .await
        .unwrap();

    handle
        .prompt("world".to_string(), None, false, Some(OWNER.to_string()))
        .await
        .unwrap();

    let (conn_id, mut rx) = handle.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();

    match next_command(&mut rx).await {
        RunnerCommand::Prompt { content, author, .. } => {
            assert_eq!(content, "hello");
            assert_eq!(author.id, OWNER);
        }
        other => panic!("expected first prompt, got {:?}", other),
    }

    // Nothing else until the first turn completes.
    assert!(rx.try_recv().is_err());
    handle.runner_frame(conn_id, RunnerMessage::Complete);

    match next_command(&mut rx).await {
        RunnerCommand::Prompt { content, .. } => assert_eq!(content, "world"),
        other => panic!("expected second prompt, got {:?}", other),
    }

    let snapshot = handle.status().await.unwrap();
    assert!(snapshot.runner_busy);
    assert_eq!(snapshot.queue_depth, 0);
}

/// Scenario: an interrupt prompt aborts in-flight work, displaces the queue,
/// and is dispatched after the runner acknowledges the abort.
#[tokio::test]
async fn interrupt_mid_turn() {
    let env = test_env();
    let handle = env.registry.ensure("s-interrupt").await.unwrap();
    handle.start(start_request_inline()).await.unwrap();

    let (conn_id, mut rx) = handle.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();

    handle
        .prompt("prompt A".to_string(), None, false, None)
        .await
        .unwrap();
    match next_command(&mut rx).await {
        RunnerCommand::Prompt { content, .. } => assert_eq!(content, "prompt A"),
        other => panic!("expected prompt A, got {:?}", other),
    }

    // Another prompt piles up behind A, then the interrupt displaces it.
    handle
        .prompt("stale".to_string(), None, false, None)
        .await
        .unwrap();
    handle
        .prompt("STOP".to_string(), None, true, None)
        .await
        .unwrap();

    assert!(matches!(next_command(&mut rx).await, RunnerCommand::Abort));
    let snapshot = handle.status().await.unwrap();
    assert_eq!(snapshot.queue_depth, 1, "queue must contain only the interrupt");

    handle.runner_frame(conn_id, RunnerMessage::Aborted);
    match next_command(&mut rx).await {
        RunnerCommand::Prompt { content, .. } => assert_eq!(content, "STOP"),
        other => panic!("expected STOP prompt, got {:?}", other),
    }
}

/// Scenario: tool frames upsert one transcript row per call id; clients see
/// one `message` then one `message.updated`.
#[tokio::test]
async fn tool_call_upsert() {
    let env = test_env();
    let handle = env.registry.ensure("s-tool").await.unwrap();
    handle.start(start_request_inline()).await.unwrap();

    let (_client, mut events) = handle.connect_client(OWNER.to_string()).await.unwrap();
    let (conn_id, _rx) = handle.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();

    handle.runner_frame(
        conn_id,
        RunnerMessage::Tool {
            call_id: "c1".to_string(),
            name: "bash".to_string(),
            status: ToolCallStatus::Pending,
            args: Some(serde_json::json!({"command": "ls"})),
            result: None,
        },
    );
    handle.runner_frame(
        conn_id,
        RunnerMessage::Tool {
            call_id: "c1".to_string(),
            name: "bash".to_string(),
            status: ToolCallStatus::Completed,
            args: Some(serde_json::json!({"command": "ls"})),
            result: Some(serde_json::json!({"ok": true})),
        },
    );

    let first = next_event_where(&mut events, |e| matches!(e, ClientEvent::Message { .. })).await;
    match first {
        ClientEvent::Message { message } => assert_eq!(message.id, "c1"),
        _ => unreachable!(),
    }
    let second =
        next_event_where(&mut events, |e| matches!(e, ClientEvent::MessageUpdated { .. })).await;
    match second {
        ClientEvent::MessageUpdated { message } => {
            assert_eq!(message.id, "c1");
            match message.parts.unwrap() {
                MessageParts::Tool { status, result, .. } => {
                    assert_eq!(status, ToolCallStatus::Completed);
                    assert_eq!(result.unwrap()["ok"], true);
                }
                _ => panic!("wrong parts"),
            }
        }
        _ => unreachable!(),
    }

    let messages = handle.messages(100, None).await.unwrap();
    let tool_rows: Vec<_> = messages.iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(tool_rows.len(), 1);
    assert_eq!(tool_rows[0].id, "c1");
}

/// Scenario: the idle alarm hibernates a running session; a prompt while
/// hibernated queues, restores, and drains on runner reconnect.
#[tokio::test]
async fn hibernate_then_auto_wake_on_prompt() {
    let env = test_env();
    let handle = env.registry.ensure("s-sleep").await.unwrap();
    handle
        .start(StartRequest {
            idle_timeout_ms: Some(60),
            ..start_request_inline()
        })
        .await
        .unwrap();

    wait_for_status(&handle, SessionStatus::Hibernated).await;
    let snapshot = handle.status().await.unwrap();
    assert!(snapshot.snapshot_id.is_some());
    assert!(snapshot.sandbox_id.is_none());

    handle
        .prompt("resume".to_string(), None, false, None)
        .await
        .unwrap();
    wait_for_status(&handle, SessionStatus::Running).await;

    let snapshot = handle.status().await.unwrap();
    assert!(snapshot.sandbox_id.is_some(), "restore stored a new sandbox id");
    assert_eq!(snapshot.queue_depth, 1);

    let calls = env.provisioner.calls().await;
    assert!(calls.iter().any(|c| c.starts_with("snapshot:")));
    assert!(calls.iter().any(|c| c.starts_with("restore:")));

    // Runner reconnects after restore and receives the queued prompt.
    let (_conn, mut rx) = handle.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();
    match next_command(&mut rx).await {
        RunnerCommand::Prompt { content, .. } => assert_eq!(content, "resume"),
        other => panic!("expected resume prompt, got {:?}", other),
    }
}

/// A busy runner holds off idle hibernation past the threshold; the session
/// stays running until the turn completes, then hibernates.
#[tokio::test]
async fn busy_runner_defers_idle_hibernation() {
    let env = test_env();
    let handle = env.registry.ensure("s-busy").await.unwrap();
    handle
        .start(StartRequest {
            idle_timeout_ms: Some(100),
            ..start_request_inline()
        })
        .await
        .unwrap();

    let (conn_id, mut rx) = handle.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();
    handle.prompt("long turn".to_string(), None, false, None).await.unwrap();
    let _ = next_command(&mut rx).await;

    // Well past the idle threshold, still mid-turn: no snapshot call.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let snapshot = handle.status().await.unwrap();
    assert_eq!(snapshot.status, SessionStatus::Running);
    assert!(
        !env.provisioner.calls().await.iter().any(|c| c.starts_with("snapshot:")),
        "no hibernation while the runner is busy"
    );

    handle.runner_frame(conn_id, RunnerMessage::Complete);
    wait_for_status(&handle, SessionStatus::Hibernated).await;
}

/// Scenario: spawn-child inherits git context and injects the owner's token
/// and git identity into the cloned environment.
#[tokio::test]
async fn spawn_child_inherits_git_context() {
    let env = test_env();
    let handle = env.registry.ensure("s-parent").await.unwrap();
    handle.start(start_request_inline()).await.unwrap();

    seed_git_state(&env, "s-parent");
    let sealed = env.sealer.seal("ghp_owner_token").unwrap();
    env.directory.seed_oauth_token(OWNER, "github", &sealed);

    let (conn_id, mut rx) = handle.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();
    handle.runner_frame(
        conn_id,
        RunnerMessage::SpawnChild {
            request_id: "r1".to_string(),
            task: "lint".to_string(),
            workspace: Some("/w".to_string()),
            repo_url: None,
            branch: None,
            model: None,
            env: Default::default(),
        },
    );

    let child_id = match next_command(&mut rx).await {
        RunnerCommand::SpawnChildResult(outcome) => {
            assert_eq!(outcome.request_id, "r1");
            assert!(outcome.error.is_none(), "spawn failed: {:?}", outcome.error);
            outcome.result.unwrap()["sessionId"].as_str().unwrap().to_string()
        }
        other => panic!("expected spawn-child-result, got {:?}", other),
    };

    let row = env.directory.session(&child_id).expect("child directory row");
    assert_eq!(row.parent_session_id.as_deref(), Some("s-parent"));
    assert_eq!(row.user_id, OWNER);
    assert_eq!(row.workspace, "/w");

    let git = env.directory.git_state(&child_id).expect("child git state");
    assert_eq!(git.repo_url.as_deref(), Some("https://github.com/acme/app"));
    assert_eq!(git.branch.as_deref(), Some("feat-x"));

    // The child's provisioner spawn carries the filled-in environment.
    let child = env.registry.get(&child_id).await.unwrap().expect("child agent");
    wait_for_status(&child, SessionStatus::Running).await;
    let spawn = env
        .provisioner
        .spawn_requests()
        .await
        .pop()
        .expect("child spawn request");
    assert_eq!(spawn.env.get("GITHUB_TOKEN").map(String::as_str), Some("ghp_owner_token"));
    assert_eq!(spawn.env.get("GIT_USER_NAME").map(String::as_str), Some("Sam Doe"));
    assert_eq!(
        spawn.env.get("GIT_USER_EMAIL").map(String::as_str),
        Some("sam@git.example.com")
    );

    // The child holds the task as its queued initial prompt.
    let child_snapshot = child.status().await.unwrap();
    assert_eq!(child_snapshot.queue_depth, 1);
}

/// A runner-reported PR lands in the directory's git-state row with number,
/// title, URL, state, and creation time.
#[tokio::test]
async fn pr_created_updates_git_state() {
    let env = test_env();
    let handle = env.registry.ensure("s-pr").await.unwrap();
    handle.start(start_request_inline()).await.unwrap();

    let (conn_id, _rx) = handle.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();
    handle.runner_frame(
        conn_id,
        RunnerMessage::PrCreated {
            pr: tether_protocol::runner::PrInfo {
                number: 7,
                title: "Fix flaky retry".to_string(),
                url: "https://github.com/acme/app/pull/7".to_string(),
                state: Some("open".to_string()),
                created_at: Some("2026-07-30T12:00:00Z".to_string()),
            },
        },
    );

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
    loop {
        if let Some(git) = env.directory.git_state("s-pr") {
            if git.pr_number == Some(7) {
                assert_eq!(git.pr_title.as_deref(), Some("Fix flaky retry"));
                assert_eq!(git.pr_url.as_deref(), Some("https://github.com/acme/app/pull/7"));
                assert_eq!(git.pr_state.as_deref(), Some("open"));
                assert_eq!(git.pr_created_at.as_deref(), Some("2026-07-30T12:00:00Z"));
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "PR never reached git state");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

/// Scenario: revert deletes the contiguous suffix, tells clients which ids
/// vanished, and tells the runner where history now ends.
#[tokio::test]
async fn revert_deletes_suffix() {
    let env = test_env();
    let handle = env.registry.ensure("s-revert").await.unwrap();
    handle.start(start_request_inline()).await.unwrap();

    let (conn_id, mut rx) = handle.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();

    // Turn one: u1 -> a1 + t1.
    handle.prompt("first".to_string(), None, false, None).await.unwrap();
    let _ = next_command(&mut rx).await;
    handle.runner_frame(
        conn_id,
        RunnerMessage::Result {
            content: "answer one".to_string(),
        },
    );
    handle.runner_frame(
        conn_id,
        RunnerMessage::Tool {
            call_id: "t1".to_string(),
            name: "bash".to_string(),
            status: ToolCallStatus::Completed,
            args: None,
            result: None,
        },
    );
    handle.runner_frame(conn_id, RunnerMessage::Complete);

    // Turn two: u2 -> a2.
    let u2 = handle.prompt("second".to_string(), None, false, None).await.unwrap();
    let _ = next_command(&mut rx).await;
    handle.runner_frame(
        conn_id,
        RunnerMessage::Result {
            content: "answer two".to_string(),
        },
    );
    handle.runner_frame(conn_id, RunnerMessage::Complete);

    // Let the second turn settle before attaching the observer client.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
    loop {
        if handle.messages(100, None).await.unwrap().len() == 5 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "transcript never settled");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let (client_conn, mut events) = handle.connect_client(OWNER.to_string()).await.unwrap();
    handle.client_frame(client_conn, ClientMessage::Revert { message_id: u2.clone() });

    let removed =
        next_event_where(&mut events, |e| matches!(e, ClientEvent::MessagesRemoved { .. })).await;
    match removed {
        ClientEvent::MessagesRemoved { ids } => {
            assert_eq!(ids.len(), 2);
            assert_eq!(ids[0], u2);
        }
        _ => unreachable!(),
    }

    match next_command(&mut rx).await {
        RunnerCommand::Revert { message_id } => assert_eq!(message_id, u2),
        other => panic!("expected revert command, got {:?}", other),
    }

    let remaining = handle.messages(100, None).await.unwrap();
    assert_eq!(remaining.len(), 3);
    assert!(remaining.iter().all(|m| m.content != "second" && m.content != "answer two"));
}

/// Hibernation race: a 409 from the snapshot call is a clean termination.
#[tokio::test]
async fn snapshot_conflict_terminates() {
    let env = test_env();
    let handle = env.registry.ensure("s-gone").await.unwrap();
    handle.start(start_request_inline()).await.unwrap();

    env.provisioner
        .gone_on_snapshot
        .store(true, std::sync::atomic::Ordering::SeqCst);
    handle.hibernate().await.unwrap();

    wait_for_status(&handle, SessionStatus::Terminated).await;
    let reasons = env.events.events_named("session.stopped");
    assert!(reasons.iter().any(|p| p["reason"] == "sandbox_exited"));
}

/// Stop on an already-terminated session is a no-op returning success.
#[tokio::test]
async fn stop_is_idempotent() {
    let env = test_env();
    let handle = env.registry.ensure("s-stop").await.unwrap();
    handle.start(start_request_inline()).await.unwrap();

    let first = handle.stop(StopReason::UserStopped).await.unwrap();
    assert_eq!(first.status, SessionStatus::Terminated);

    let second = handle.stop(StopReason::UserStopped).await.unwrap();
    assert_eq!(second.status, SessionStatus::Terminated);
    assert_eq!(env.events.events_named("session.stopped").len(), 1);
}

/// A prompt caught mid-turn by runner disconnect is requeued, not lost, and
/// re-dispatched on reconnect.
#[tokio::test]
async fn runner_disconnect_requeues_in_flight_prompt() {
    let env = test_env();
    let handle = env.registry.ensure("s-requeue").await.unwrap();
    handle.start(start_request_inline()).await.unwrap();

    let (conn_id, mut rx) = handle.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();
    handle.prompt("survives".to_string(), None, false, None).await.unwrap();
    let _ = next_command(&mut rx).await;

    handle.disconnect_runner(conn_id);
    drop(rx);

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
    loop {
        let snapshot = handle.status().await.unwrap();
        if snapshot.queue_depth == 1 && !snapshot.runner_busy {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "prompt was not requeued");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let (_conn, mut rx) = handle.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();
    match next_command(&mut rx).await {
        RunnerCommand::Prompt { content, .. } => assert_eq!(content, "survives"),
        other => panic!("expected redispatched prompt, got {:?}", other),
    }
}

/// Accepting a second runner connection displaces the first.
#[tokio::test]
async fn second_runner_displaces_first() {
    let env = test_env();
    let handle = env.registry.ensure("s-displace").await.unwrap();
    handle.start(start_request_inline()).await.unwrap();

    let (_first_conn, mut first_rx) =
        handle.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();
    let (_second_conn, _second_rx) =
        handle.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();

    // The first channel ends once the replacement is accepted.
    let closed = tokio::time::timeout(std::time::Duration::from_secs(1), async {
        loop {
            if first_rx.recv().await.is_none() {
                return true;
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(closed, "first runner channel should close");

    // A bad token is rejected outright.
    let err = handle.connect_runner("wrong".to_string()).await.unwrap_err();
    assert!(matches!(err, tether::session::AgentError::InvalidToken));
}

/// Questions are single-shot: the first answer lands with the runner, a
/// second answer is a no-op.
#[tokio::test]
async fn question_answer_is_single_shot() {
    let env = test_env();
    let handle = env.registry.ensure("s-question").await.unwrap();
    // Long idle timeout keeps the idle alarm out of the way.
    handle
        .start(StartRequest {
            idle_timeout_ms: Some(3_600_000),
            ..start_request_inline()
        })
        .await
        .unwrap();

    let (client_conn, mut events) = handle.connect_client(OWNER.to_string()).await.unwrap();
    let (conn_id, mut rx) = handle.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();

    handle.runner_frame(
        conn_id,
        RunnerMessage::Question {
            text: "continue?".to_string(),
            options: vec!["yes".to_string(), "no".to_string()],
        },
    );

    let question =
        next_event_where(&mut events, |e| matches!(e, ClientEvent::Question { .. })).await;
    let question_id = match question {
        ClientEvent::Question { question } => {
            assert_eq!(question.options.len(), 2);
            question.id
        }
        _ => unreachable!(),
    };

    // Answering twice: only the first lands with the runner.
    handle.client_frame(
        client_conn,
        ClientMessage::Answer {
            question_id: question_id.clone(),
            answer: "yes".to_string(),
        },
    );
    handle.client_frame(
        client_conn,
        ClientMessage::Answer {
            question_id: question_id.clone(),
            answer: "no".to_string(),
        },
    );

    match next_command(&mut rx).await {
        RunnerCommand::Answer {
            question_id: qid,
            answer,
        } => {
            assert_eq!(qid, question_id);
            assert_eq!(answer, "yes");
        }
        other => panic!("expected answer, got {:?}", other),
    }
    assert!(rx.try_recv().is_err(), "second answer must be a no-op");
}

/// Cross-session messaging requires same-user ownership.
#[tokio::test]
async fn session_message_enforces_ownership() {
    let env = test_env();
    let parent = env.registry.ensure("s-owner-a").await.unwrap();
    parent.start(start_request_inline()).await.unwrap();

    let other = env.registry.ensure("s-other-user").await.unwrap();
    other
        .start(StartRequest {
            user_id: "u2".to_string(),
            ..start_request_inline()
        })
        .await
        .unwrap();

    let (conn_id, mut rx) = parent.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();
    parent.runner_frame(
        conn_id,
        RunnerMessage::SessionMessage {
            request_id: "r-own".to_string(),
            session_id: "s-other-user".to_string(),
            content: "hi".to_string(),
            interrupt: false,
        },
    );

    match next_command(&mut rx).await {
        RunnerCommand::SessionMessageResult(outcome) => {
            assert_eq!(outcome.request_id, "r-own");
            assert!(outcome.error.unwrap().contains("different user"));
        }
        other => panic!("expected session-message-result, got {:?}", other),
    }
}

/// Forwarded messages land in the caller's transcript as assistant rows with
/// provenance parts.
#[tokio::test]
async fn forward_messages_carries_provenance() {
    let env = test_env();
    let parent = env.registry.ensure("s-fwd-parent").await.unwrap();
    parent.start(start_request_inline()).await.unwrap();

    let child = env.registry.ensure("s-fwd-child").await.unwrap();
    child
        .start(StartRequest {
            initial_prompt: Some("child work".to_string()),
            ..start_request_inline()
        })
        .await
        .unwrap();

    let (conn_id, mut rx) = parent.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();
    parent.runner_frame(
        conn_id,
        RunnerMessage::ForwardMessages {
            request_id: "r-fwd".to_string(),
            session_id: "s-fwd-child".to_string(),
            limit: Some(10),
            after: None,
        },
    );

    match next_command(&mut rx).await {
        RunnerCommand::ForwardMessagesResult(outcome) => {
            assert!(outcome.error.is_none(), "forward failed: {:?}", outcome.error);
            assert_eq!(outcome.result.unwrap()["forwarded"], 1);
        }
        other => panic!("expected forward-messages-result, got {:?}", other),
    }

    let messages = parent.messages(100, None).await.unwrap();
    let forwarded: Vec<_> = messages
        .iter()
        .filter(|m| matches!(m.parts, Some(MessageParts::Forwarded { .. })))
        .collect();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].role, Role::Assistant);
    match forwarded[0].parts.as_ref().unwrap() {
        MessageParts::Forwarded {
            source_session_id,
            original_role,
            ..
        } => {
            assert_eq!(source_session_id, "s-fwd-child");
            assert_eq!(*original_role, Role::User);
        }
        _ => unreachable!(),
    }
}

/// Stop cascades to non-terminated children recorded in the directory.
#[tokio::test]
async fn stop_cascades_to_children() {
    let env = test_env();
    let parent = env.registry.ensure("s-casc-parent").await.unwrap();
    parent.start(start_request_inline()).await.unwrap();

    seed_git_state(&env, "s-casc-parent");
    let (conn_id, mut rx) = parent.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();
    parent.runner_frame(
        conn_id,
        RunnerMessage::SpawnChild {
            request_id: "r-c".to_string(),
            task: "background task".to_string(),
            workspace: None,
            repo_url: None,
            branch: None,
            model: None,
            env: Default::default(),
        },
    );
    let child_id = match next_command(&mut rx).await {
        RunnerCommand::SpawnChildResult(outcome) => outcome.result.unwrap()["sessionId"]
            .as_str()
            .unwrap()
            .to_string(),
        other => panic!("expected spawn-child-result, got {:?}", other),
    };

    parent.stop(StopReason::UserStopped).await.unwrap();

    let child = env.registry.get(&child_id).await.unwrap().unwrap();
    wait_for_status(&child, SessionStatus::Terminated).await;
}

/// Reverting the first message empties the transcript.
#[tokio::test]
async fn revert_first_message_removes_everything() {
    let env = test_env();
    let handle = env.registry.ensure("s-revert-all").await.unwrap();
    handle.start(start_request_inline()).await.unwrap();

    let first = handle.prompt("only".to_string(), None, false, None).await.unwrap();
    let (client_conn, mut events) = handle.connect_client(OWNER.to_string()).await.unwrap();
    handle.client_frame(client_conn, ClientMessage::Revert { message_id: first });

    let removed =
        next_event_where(&mut events, |e| matches!(e, ClientEvent::MessagesRemoved { .. })).await;
    match removed {
        ClientEvent::MessagesRemoved { ids } => assert_eq!(ids.len(), 1),
        _ => unreachable!(),
    }
    assert!(handle.messages(100, None).await.unwrap().is_empty());
}

/// `hibernate` then `wake` with no client activity preserves the transcript.
#[tokio::test]
async fn hibernate_wake_roundtrip_preserves_transcript() {
    let env = test_env();
    let handle = env.registry.ensure("s-roundtrip").await.unwrap();
    handle.start(start_request_inline()).await.unwrap();

    let (conn_id, mut rx) = handle.connect_runner(RUNNER_TOKEN.to_string()).await.unwrap();
    handle.prompt("before sleep".to_string(), None, false, None).await.unwrap();
    let _ = next_command(&mut rx).await;
    handle.runner_frame(
        conn_id,
        RunnerMessage::Result {
            content: "done".to_string(),
        },
    );
    handle.runner_frame(conn_id, RunnerMessage::Complete);

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
    while handle.messages(100, None).await.unwrap().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let before = handle.messages(100, None).await.unwrap();

    handle.hibernate().await.unwrap();
    wait_for_status(&handle, SessionStatus::Hibernated).await;
    handle.wake().await.unwrap();
    wait_for_status(&handle, SessionStatus::Running).await;

    let after = handle.messages(100, None).await.unwrap();
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.content, b.content);
    }
}
