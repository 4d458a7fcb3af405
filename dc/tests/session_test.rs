//! End-to-end session tests
//!
//! A scripted engine stands in for the LLM and the peer talks to the served
//! session over an in-memory duplex, exactly as it would over a socket.

mod common;

use std::sync::Arc;

use common::{Peer, Script, ScriptedFactory, progress, settings, terminals};
use deskconnector::engine::{CommitInfo, EDITS_APPLIED_ACK, Engine, History, Mode, Role};
use serde_json::json;

// =============================================================================
// Plain prompts
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_prompt_streams_chunks_then_finishes_once() {
    let factory = Arc::new(ScriptedFactory::new().with_script(Mode::Code, Script::chunks(&["Fixed ", "the bug."])));
    let mut peer = Peer::start(factory.clone(), settings(1, 3)).await;

    peer.send(json!({"action": "prompt", "prompt": "fix the bug", "promptId": "p1"}))
        .await;
    let events = peer.read_until("prompt-finished").await;

    let chunks: Vec<_> = progress(&events).iter().map(|e| e["content"].clone()).collect();
    assert_eq!(chunks, vec![json!("Fixed "), json!("the bug.")]);

    let done = terminals(&events);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0]["content"], "Fixed the bug.");
    assert_eq!(done[0]["editedFiles"], json!([]));
    assert!(done[0].get("interrupted").is_none());
    assert_eq!(events.last().unwrap()["promptId"], "p1");

    // Terminal, then the context sync, then the completion marker
    let position = |action: &str| events.iter().rposition(|e| e["action"] == action).unwrap();
    let terminal_at = events.iter().position(|e| e["finished"] == true).unwrap();
    assert!(terminal_at < position("update-context-files"));
    assert!(position("tokens-info") < position("prompt-finished"));

    // The next action produces no second completion marker
    peer.send(json!({"action": "add-message", "content": "remember this"})).await;
    let after = peer.read_until("tokens-info").await;
    assert!(after.iter().all(|e| e["action"] != "prompt-finished"));

    let history = factory.engines()[0].history();
    assert_eq!(history.done.last().unwrap().content, "Ok.");
    assert_eq!(factory.run_count(), 1);

    peer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prompt_without_id_sends_no_completion_marker() {
    let factory = Arc::new(ScriptedFactory::new().with_script(Mode::Code, Script::chunks(&["ok"])));
    let mut peer = Peer::start(factory, settings(1, 3)).await;

    peer.send(json!({"action": "prompt", "prompt": "hello"})).await;
    let events = peer.read_until("tokens-info").await;
    assert_eq!(terminals(&events).len(), 1);

    peer.send(json!({"action": "prompt", "prompt": "again", "promptId": "p2"}))
        .await;
    let events = peer.read_until("prompt-finished").await;
    let finished: Vec<_> = events.iter().filter(|e| e["action"] == "prompt-finished").collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0]["promptId"], "p2");

    peer.close().await;
}

// =============================================================================
// Architect hand-off
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_architect_plan_handed_to_editor_on_yes() {
    let planner = Script {
        chunks: vec!["Plan: ".to_string(), "edit foo".to_string()],
        ask_edit: true,
        cost_per_run: 0.5,
        ..Default::default()
    };
    let editor = Script {
        chunks: vec!["Applied".to_string()],
        commit: Some(CommitInfo {
            hash: "abc123".to_string(),
            message: "edit foo".to_string(),
        }),
        cost_per_run: 0.25,
        ..Default::default()
    };
    let factory = Arc::new(
        ScriptedFactory::new()
            .with_script(Mode::Architect, planner)
            .with_script(Mode::Editor, editor),
    );
    let mut peer = Peer::start(factory.clone(), settings(1, 3)).await;

    peer.send(json!({
        "action": "prompt",
        "prompt": "refactor foo",
        "mode": "architect",
        "architectModel": "scripted-planner",
        "promptId": "arch",
    }))
    .await;

    let before = peer.read_until("ask-question").await;
    assert_eq!(before.last().unwrap()["question"], "Edit the files?");
    let planned: Vec<_> = progress(&before).iter().map(|e| e["content"].clone()).collect();
    assert_eq!(planned, vec![json!("Plan: "), json!("edit foo")]);

    peer.send(json!({"action": "answer-question", "answer": "y"})).await;
    let events = peer.read_until("prompt-finished").await;

    // Planning closes before the editor streams
    let done = terminals(&events);
    assert_eq!(done.len(), 2);
    assert_eq!(done[0]["content"], "Plan: edit foo");
    let planning_at = events.iter().position(|e| e["finished"] == true).unwrap();
    let editor_at = events
        .iter()
        .position(|e| e["action"] == "response" && e["content"] == "Applied" && e["finished"] == false)
        .unwrap();
    assert!(planning_at < editor_at);

    assert_eq!(done[1]["content"], "Applied");
    assert_eq!(done[1]["commitHash"], "abc123");
    assert_eq!(done[1]["commitMessage"], "edit foo");

    // Primary, planner, editor, rebuilt primary
    let modes: Vec<_> = factory.specs().into_iter().map(|s| s.mode).collect();
    assert_eq!(modes, vec![Mode::Code, Mode::Architect, Mode::Editor, Mode::Code]);
    let specs = factory.specs();
    assert_eq!(specs[1].model.main, "scripted-planner");
    assert_eq!(specs[1].model.editor.as_deref(), Some("scripted-main"));
    assert_eq!(specs[2].model.main, "scripted-main");

    let primary = factory.last_engine();
    let history = primary.history();
    assert!(
        history
            .done
            .iter()
            .any(|m| m.role == Role::Assistant && m.content == EDITS_APPLIED_ACK)
    );
    assert_eq!(primary.commit_hashes(), vec!["abc123".to_string()]);
    assert!((primary.total_cost() - 0.75).abs() < 1e-9);

    peer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_architect_plan_declined_keeps_planner_terminal() {
    let planner = Script {
        chunks: vec!["Plan".to_string()],
        ask_edit: true,
        ..Default::default()
    };
    let factory = Arc::new(ScriptedFactory::new().with_script(Mode::Architect, planner));
    let mut peer = Peer::start(factory.clone(), settings(1, 3)).await;

    peer.send(json!({"action": "prompt", "prompt": "think", "mode": "architect", "promptId": "a"}))
        .await;
    peer.read_until("ask-question").await;
    peer.send(json!({"action": "answer-question", "answer": "no"})).await;
    let events = peer.read_until("prompt-finished").await;

    let done = terminals(&events);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0]["content"], "Plan");
    assert!(factory.specs().iter().all(|s| s.mode != Mode::Editor));

    peer.close().await;
}

fn planner_and_editor(editor_chunks: &[&str]) -> Arc<ScriptedFactory> {
    let planner = Script {
        chunks: vec!["Plan".to_string()],
        ask_edit: true,
        ..Default::default()
    };
    Arc::new(
        ScriptedFactory::new()
            .with_script(Mode::Architect, planner)
            .with_script(Mode::Editor, Script::chunks(editor_chunks)),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupt_during_editor_pass_is_recorded_not_acknowledged() {
    let factory = planner_and_editor(&["e1 ", "e2 ", "e3"]);
    let mut peer = Peer::start(factory.clone(), settings(300, 3)).await;

    peer.send(json!({"action": "prompt", "prompt": "p", "mode": "architect", "promptId": "e"}))
        .await;
    peer.read_until("ask-question").await;
    peer.send(json!({"action": "answer-question", "answer": "y"})).await;

    let mut before = Vec::new();
    loop {
        let event = peer.next_event().await;
        let first_edit = event["action"] == "response" && event["finished"] == false && event["content"] == "e1 ";
        before.push(event);
        if first_edit {
            break;
        }
    }
    peer.send(json!({"action": "interrupt-response"})).await;
    let events = peer.read_until("prompt-finished").await;

    // Planning closed before the editor's first chunk
    assert_eq!(terminals(&before).len(), 1);
    assert_eq!(terminals(&before)[0]["content"], "Plan");

    assert!(progress(&events).is_empty());
    let done = terminals(&events);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0]["content"], "e1 ");
    assert_eq!(done[0]["interrupted"], true);

    let history = factory.last_engine().history();
    let contents: Vec<_> = history.done.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["p", "Plan", "e1  (interrupted)"]);
    assert!(history.done.iter().all(|m| m.content != EDITS_APPLIED_ACK));

    peer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_answer_clears_interrupt_sent_while_waiting() {
    let factory = planner_and_editor(&["Applied ", "all"]);
    let mut peer = Peer::start(factory.clone(), settings(1, 3)).await;

    peer.send(json!({"action": "prompt", "prompt": "p", "mode": "architect", "promptId": "w"}))
        .await;
    peer.read_until("ask-question").await;
    peer.send(json!({"action": "interrupt-response"})).await;
    peer.send(json!({"action": "answer-question", "answer": "y"})).await;
    let events = peer.read_until("prompt-finished").await;

    let done = terminals(&events);
    assert_eq!(done.len(), 2);
    assert_eq!(done[1]["content"], "Applied all");
    assert!(done[1].get("interrupted").is_none());

    let history = factory.last_engine().history();
    assert_eq!(history.done.last().unwrap().content, EDITS_APPLIED_ACK);

    peer.close().await;
}

// =============================================================================
// Cleared context
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_cleared_context_leaves_primary_history_alone() {
    let factory = Arc::new(ScriptedFactory::new().with_script(Mode::Code, Script::chunks(&["fresh"])));
    let mut peer = Peer::start(factory.clone(), settings(1, 3)).await;

    peer.send(json!({"action": "add-message", "content": "context"})).await;
    peer.read_until("tokens-info").await;
    let before = factory.engines()[0].history();
    assert_eq!(before.done.len(), 2);

    peer.send(json!({"action": "prompt", "prompt": "start over", "clearContext": true, "promptId": "c"}))
        .await;
    let events = peer.read_until("prompt-finished").await;
    assert_eq!(terminals(&events)[0]["content"], "fresh");

    // Primary, cleared sub-execution, rebuilt primary
    let engines = factory.engines();
    assert_eq!(engines.len(), 3);
    assert_eq!(factory.specs()[1].history, Some(History::default()));

    let scratch: Vec<_> = engines[1].history().done.into_iter().map(|m| m.content).collect();
    assert_eq!(scratch, vec!["start over".to_string(), "fresh".to_string()]);
    assert_eq!(engines[2].history(), before);

    peer.close().await;
}

// =============================================================================
// Interrupts
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupt_stops_stream_and_marks_history() {
    let factory = Arc::new(
        ScriptedFactory::new().with_script(Mode::Code, Script::chunks(&["one ", "two ", "three ", "four ", "five"])),
    );
    let mut peer = Peer::start(factory.clone(), settings(300, 3)).await;

    peer.send(json!({"action": "prompt", "prompt": "count", "promptId": "i"}))
        .await;

    let mut streamed = 0;
    while streamed < 2 {
        let event = peer.next_event().await;
        if event["action"] == "response" && event["finished"] == false {
            streamed += 1;
        }
    }
    peer.send(json!({"action": "interrupt-response"})).await;

    let events = peer.read_until("prompt-finished").await;
    assert!(progress(&events).is_empty());
    let done = terminals(&events);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0]["content"], "one two ");
    assert_eq!(done[0]["interrupted"], true);

    let history = factory.engines()[0].history();
    let last = history.cur.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, "one two  (interrupted)");

    peer.close().await;
}

// =============================================================================
// Reflections
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_reflections_within_bound() {
    let script = Script {
        chunks: vec!["done".to_string()],
        reflections: 2,
        ..Default::default()
    };
    let factory = Arc::new(ScriptedFactory::new().with_script(Mode::Code, script));
    let mut peer = Peer::start(factory.clone(), settings(1, 3)).await;

    peer.send(json!({"action": "prompt", "prompt": "lint", "promptId": "r"}))
        .await;
    let events = peer.read_until("prompt-finished").await;

    assert_eq!(factory.run_count(), 3);
    let done = terminals(&events);
    assert_eq!(done.len(), 3);
    assert!(done[0].get("reflectedMessage").is_none());
    assert_eq!(done[1]["reflectedMessage"], "Fix the lint errors");
    assert_eq!(done[2]["reflectedMessage"], "Fix the lint errors");

    let loading = events
        .iter()
        .filter(|e| e["action"] == "log" && e["level"] == "loading")
        .count();
    assert_eq!(loading, 2);
    assert!(!events.iter().any(|e| e["level"] == "warning"));

    peer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reflections_past_bound_warn_and_stop() {
    let script = Script {
        chunks: vec!["done".to_string()],
        reflections: 3,
        ..Default::default()
    };
    let factory = Arc::new(ScriptedFactory::new().with_script(Mode::Code, script));
    let mut peer = Peer::start(factory.clone(), settings(1, 2)).await;

    peer.send(json!({"action": "prompt", "prompt": "lint", "promptId": "r"}))
        .await;
    let events = peer.read_until("prompt-finished").await;

    assert_eq!(factory.run_count(), 3);
    assert_eq!(terminals(&events).len(), 3);
    let warnings: Vec<_> = events
        .iter()
        .filter(|e| e["action"] == "log" && e["level"] == "warning")
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0]["message"], "Only 2 reflections allowed, stopping.");

    peer.close().await;
}

// =============================================================================
// Protocol errors
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_action_reported_and_session_continues() {
    let factory = Arc::new(ScriptedFactory::new().with_script(Mode::Code, Script::chunks(&["fine"])));
    let mut peer = Peer::start(factory, settings(1, 3)).await;

    peer.send(json!({"action": "teleport", "to": "mars"})).await;
    let events = peer.read_until("error").await;
    assert_eq!(events.last().unwrap()["error"], "Unknown action: teleport");

    peer.send(json!({"action": "prompt", "prompt": "still there?", "promptId": "x"}))
        .await;
    let events = peer.read_until("prompt-finished").await;
    assert_eq!(terminals(&events)[0]["content"], "fine");

    peer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_sync_precedes_prompt_output() {
    let factory = Arc::new(ScriptedFactory::new().with_script(Mode::Code, Script::chunks(&["hi"])));
    let mut peer = Peer::start(factory, settings(1, 3)).await;

    let first = peer.next_event().await;
    assert_eq!(first["action"], "init");
    assert_eq!(first["baseDir"], "/work/repo");

    let events = peer.read_until("set-models").await;
    assert_eq!(events.last().unwrap()["mainModel"], "scripted-main");
    assert_eq!(events.last().unwrap()["weakModel"], "scripted-weak");

    let autocompletion = events
        .iter()
        .find(|e| e["action"] == "update-autocompletion")
        .unwrap();
    assert_eq!(autocompletion["models"], json!(["scripted-main", "scripted-planner"]));

    peer.close().await;
}
