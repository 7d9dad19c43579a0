//! End-to-end turns through the default pipeline with a scripted provider.

use std::sync::Arc;
use std::time::Duration;

use helm_core::context::event_kinds;
use helm_core::events::{ToolPhase, TASK_TOOL_NAME};
use helm_core::stream::{ProviderEvent, ToolUse};
use helm_core::{PipelineError, SessionId, SessionStatus, ToolUseId};
use helm_engine::mock::{RecordingSinks, ScriptedGateway, ScriptedTurn};
use helm_engine::{
    Collaborators, ConcurrencyManager, MessagePipeline, PipelineConfig, SessionContextStore,
    SubagentCircuitBreaker, default_stages,
};
use serde_json::json;

struct Harness {
    pipeline: Arc<MessagePipeline>,
    sinks: RecordingSinks,
    breaker: Arc<SubagentCircuitBreaker>,
    collaborators: Arc<Collaborators>,
}

fn harness(turns: Vec<ScriptedTurn>) -> Harness {
    harness_with(turns, PipelineConfig::default())
}

fn harness_with(turns: Vec<ScriptedTurn>, config: PipelineConfig) -> Harness {
    let sinks = RecordingSinks::default();
    let breaker = Arc::new(SubagentCircuitBreaker::default());
    let collaborators = Arc::new(
        Collaborators::new(Arc::new(ScriptedGateway::new(turns)), Arc::clone(&breaker))
            .with_sinks(sinks.splitter_sinks()),
    );
    let pipeline = Arc::new(MessagePipeline::new(
        default_stages(),
        config,
        Arc::new(ConcurrencyManager::new()),
        Arc::new(SessionContextStore::default()),
    ));
    Harness {
        pipeline,
        sinks,
        breaker,
        collaborators,
    }
}

fn text(t: &str) -> ProviderEvent {
    ProviderEvent::TextSnapshot { text: t.into() }
}

fn tool(id: &str, name: &str) -> ProviderEvent {
    ProviderEvent::ToolUse(ToolUse {
        tool_use_id: ToolUseId::from_raw(id),
        tool_name: name.into(),
        input: json!({}),
        parent_tool_use_id: None,
    })
}

fn task(id: &str, subagent_type: &str) -> ProviderEvent {
    ProviderEvent::ToolUse(ToolUse {
        tool_use_id: ToolUseId::from_raw(id),
        tool_name: TASK_TOOL_NAME.into(),
        input: json!({"subagent_type": subagent_type}),
        parent_tool_use_id: None,
    })
}

fn task_result(id: &str, is_error: bool) -> ProviderEvent {
    ProviderEvent::ToolResult {
        tool_use_id: ToolUseId::from_raw(id),
        tool_name: TASK_TOOL_NAME.into(),
        output: Some("done".into()),
        is_error,
        parent_tool_use_id: None,
    }
}

#[tokio::test]
async fn full_turn_walks_every_stage() {
    let h = harness(vec![ScriptedTurn::text("Hello there")]);
    let sid = SessionId::from_raw("s1");

    let ctx = h
        .pipeline
        .submit(&sid, "hi", Arc::clone(&h.collaborators))
        .await
        .unwrap();

    assert_eq!(ctx.status, SessionStatus::Idle);
    assert!(ctx.queue.inbound.is_empty());
    assert_eq!(ctx.queue.outbound.len(), 1);
    assert_eq!(ctx.queue.outbound[0].content, "Hello there");

    let kinds = event_kinds(&ctx);
    for expected in [
        "pipeline:start",
        "stage:context_injection:start",
        "stage:context_injection:complete",
        "stage:streaming:start",
        "stage:streaming:complete",
        "stage:finalization:start",
        "stage:finalization:complete",
        "pipeline:complete",
    ] {
        assert!(kinds.contains(&expected), "missing {expected}");
    }
    assert!(!h.pipeline.locks().is_processing(&sid));
    assert_eq!(h.pipeline.store().get(&sid).unwrap().status, SessionStatus::Idle);
    assert_eq!(h.sinks.finalized().len(), 1);
}

#[tokio::test]
async fn text_then_tool_produces_three_emissions() {
    let h = harness(vec![ScriptedTurn::Events(vec![
        text("Let me look."),
        tool("t1", "Read"),
        text("Let me look.\n\nAll good."),
        ProviderEvent::Done,
    ])]);
    let _ = h
        .pipeline
        .submit(&SessionId::from_raw("s1"), "check", Arc::clone(&h.collaborators))
        .await
        .unwrap();

    // streaming, finalized, new streaming, then the end-of-turn finalization
    let messages = h.sinks.messages();
    assert_eq!(messages.len(), 4);
    let original = messages[0].id.clone();
    assert!(messages[0].streaming);
    assert_eq!((messages[1].id.clone(), messages[1].streaming), (original.clone(), false));
    assert!(messages[2].streaming);
    assert_ne!(messages[2].id, original);
    assert_eq!(messages[2].content, "All good.");
    assert_eq!(messages[3].id, messages[2].id);
    assert!(!messages[3].streaming);

    assert_eq!(h.sinks.tools()[0].message_id, original);
}

#[tokio::test]
async fn leading_tools_share_the_original_message() {
    let h = harness(vec![ScriptedTurn::Events(vec![
        tool("t1", "Read"),
        tool("t2", "Grep"),
        tool("t3", "Read"),
        text("Summary"),
        ProviderEvent::Done,
    ])]);
    let ctx = h
        .pipeline
        .submit(&SessionId::from_raw("s1"), "go", Arc::clone(&h.collaborators))
        .await
        .unwrap();

    let tools = h.sinks.tools();
    assert_eq!(tools.len(), 3);
    let id = tools[0].message_id.clone();
    assert!(tools.iter().all(|t| t.message_id == id));
    assert!(h.sinks.messages().iter().all(|m| m.id == id));
    assert_eq!(ctx.queue.outbound.len(), 1);
    assert_eq!(ctx.queue.outbound[0].id, id);
}

#[tokio::test]
async fn nested_tasks_attribute_to_innermost() {
    let h = harness(vec![ScriptedTurn::Events(vec![
        task("A", "explore"),
        task("B", "explore"),
        tool("r1", "Read"),
        task_result("B", false),
        tool("r2", "Read"),
        task_result("A", false),
        ProviderEvent::Done,
    ])]);
    let _ = h
        .pipeline
        .submit(&SessionId::from_raw("s1"), "go", Arc::clone(&h.collaborators))
        .await
        .unwrap();

    let started: Vec<_> = h
        .sinks
        .tools()
        .into_iter()
        .filter(|t| t.phase == ToolPhase::Started && t.tool_name == "Read")
        .collect();
    assert_eq!(started[0].parent_tool_use_id, Some(ToolUseId::from_raw("B")));
    assert_eq!(started[1].parent_tool_use_id, Some(ToolUseId::from_raw("A")));
    assert!(h.breaker.get_state().is_empty());
}

#[tokio::test(start_paused = true)]
async fn turns_in_one_session_are_serialized() {
    let h = harness(vec![
        ScriptedTurn::Paced(Duration::from_secs(1), vec![text("first"), ProviderEvent::Done]),
        ScriptedTurn::text("second"),
    ]);
    let sid = SessionId::from_raw("s1");

    let first = {
        let (p, c, sid) = (Arc::clone(&h.pipeline), Arc::clone(&h.collaborators), sid.clone());
        tokio::spawn(async move { p.submit(&sid, "one", c).await })
    };
    while !h.pipeline.is_running(&sid) {
        tokio::task::yield_now().await;
    }
    let second = {
        let (p, c, sid) = (Arc::clone(&h.pipeline), Arc::clone(&h.collaborators), sid.clone());
        tokio::spawn(async move { p.submit(&sid, "two", c).await })
    };
    while h.pipeline.locks().queue_depth(&sid) == 0 {
        tokio::task::yield_now().await;
    }
    assert!(h.pipeline.locks().is_processing(&sid));

    first.await.unwrap().unwrap();
    let ctx = second.await.unwrap().unwrap();

    let replies: Vec<_> = ctx.queue.outbound.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(replies, vec!["first", "second"]);
    assert!(event_kinds(&ctx).contains(&"lock:waited"));
    assert!(!h.pipeline.locks().is_processing(&sid));
}

#[tokio::test(start_paused = true)]
async fn failure_rejects_waiters_and_releases_lock() {
    let h = harness(vec![
        ScriptedTurn::Paced(
            Duration::from_secs(1),
            vec![ProviderEvent::Error {
                message: "overloaded".into(),
            }],
        ),
        ScriptedTurn::text("recovered"),
    ]);
    let sid = SessionId::from_raw("s1");

    let first = {
        let (p, c, sid) = (Arc::clone(&h.pipeline), Arc::clone(&h.collaborators), sid.clone());
        tokio::spawn(async move { p.submit(&sid, "one", c).await })
    };
    while !h.pipeline.is_running(&sid) {
        tokio::task::yield_now().await;
    }
    let second = {
        let (p, c, sid) = (Arc::clone(&h.pipeline), Arc::clone(&h.collaborators), sid.clone());
        tokio::spawn(async move { p.submit(&sid, "two", c).await })
    };
    while h.pipeline.locks().queue_depth(&sid) == 0 {
        tokio::task::yield_now().await;
    }

    let err = first.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "Stage streaming failed: provider error: overloaded");
    let rejected = second.await.unwrap().unwrap_err();
    assert!(matches!(rejected, PipelineError::SessionCleared { .. }));
    assert!(rejected.to_string().contains("cleared while messages were pending"));

    assert!(!h.pipeline.locks().is_processing(&sid));
    let stored = h.pipeline.store().get(&sid).unwrap();
    assert_eq!(stored.status, SessionStatus::Error);
    assert_eq!(stored.current_message.as_ref().unwrap().content, "one");

    let ctx = h
        .pipeline
        .submit(&sid, "three", Arc::clone(&h.collaborators))
        .await
        .unwrap();
    assert_eq!(ctx.status, SessionStatus::Idle);
    assert_eq!(ctx.queue.outbound.last().unwrap().content, "recovered");
}

#[tokio::test(start_paused = true)]
async fn stage_timeout_fails_the_turn() {
    let mut config = PipelineConfig::default();
    let _ = config
        .stage_timeouts
        .insert("streaming".into(), Duration::from_secs(5));
    let h = harness_with(
        vec![ScriptedTurn::Paced(
            Duration::from_secs(60),
            vec![text("too slow"), ProviderEvent::Done],
        )],
        config,
    );
    let sid = SessionId::from_raw("s1");

    let err = h
        .pipeline
        .submit(&sid, "hi", Arc::clone(&h.collaborators))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Stage streaming timed out after 5000ms");
    assert!(!h.pipeline.locks().is_processing(&sid));
    assert_eq!(h.pipeline.store().get(&sid).unwrap().status, SessionStatus::Error);
}

#[tokio::test]
async fn repeated_subtask_failures_open_the_breaker() {
    let failing_turn = |id: &str| {
        ScriptedTurn::Events(vec![task(id, "explore"), task_result(id, true), ProviderEvent::Done])
    };
    let h = harness(vec![
        failing_turn("a"),
        failing_turn("b"),
        failing_turn("c"),
        ScriptedTurn::Events(vec![task("d", "explore"), tool("r1", "Read"), ProviderEvent::Done]),
    ]);
    let sid = SessionId::from_raw("s1");

    for _ in 0..4 {
        let _ = h
            .pipeline
            .submit(&sid, "go", Arc::clone(&h.collaborators))
            .await
            .unwrap();
    }

    let activities = h.sinks.activities();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].activity_type(), "subtask_blocked");
    assert!(activities[0].is_error());

    let read = h
        .sinks
        .tools()
        .into_iter()
        .find(|t| t.tool_use_id == ToolUseId::from_raw("r1"))
        .unwrap();
    assert_eq!(read.parent_tool_use_id, None);
    assert_eq!(h.breaker.get_state()["explore"].recent_failures, 4);
    assert!(!h.breaker.should_allow("explore"));
}

#[tokio::test]
async fn sessions_run_independently() {
    let h = harness(vec![ScriptedTurn::text("a"), ScriptedTurn::text("b")]);
    let a_id = SessionId::from_raw("a");
    let b_id = SessionId::from_raw("b");
    let (a, b) = tokio::join!(
        h.pipeline.submit(&a_id, "x", Arc::clone(&h.collaborators)),
        h.pipeline.submit(&b_id, "y", Arc::clone(&h.collaborators)),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.pipeline.store().len(), 2);
    assert_eq!(h.pipeline.locks().active_sessions(), 0);
}
