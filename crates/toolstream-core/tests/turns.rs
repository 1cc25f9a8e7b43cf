use std::sync::Arc;

use serde_json::json;

use toolstream_core::{
    CompressionConfig, MemoryEntryStore, MessageEntryStore, RetryConfig, ToolStreamRunner, TurnContext,
};
use toolstream_providers::{Provider, ProviderError, ProviderRegistry, ScriptedProvider, ScriptedTurn};
use toolstream_tools::ToolCatalog;
use toolstream_types::{ContentPart, ConversationMessage, EntryStatus, MessageRole, ToolSchema};

fn schemas() -> Vec<ToolSchema> {
    vec![
        ToolSchema::new(
            "done",
            "Finish the turn with a final response",
            json!({
                "type": "object",
                "properties": {"final_response": {"type": "string"}},
                "required": ["final_response"]
            }),
        ),
        ToolSchema::new(
            "sequential_thinking",
            "Think step by step",
            json!({
                "type": "object",
                "properties": {
                    "thought": {"type": "string"},
                    "nextThoughtNeeded": {"type": "boolean"}
                },
                "required": ["thought", "nextThoughtNeeded"]
            }),
        ),
    ]
}

async fn runner_with(provider: Arc<ScriptedProvider>, max_retries: u32) -> (ToolStreamRunner, Arc<MemoryEntryStore>) {
    let catalog = ToolCatalog::from_schemas(schemas()).await.expect("catalog");
    let store = Arc::new(MemoryEntryStore::new());
    let provider: Arc<dyn Provider> = provider;
    let runner = ToolStreamRunner::new(
        ProviderRegistry::with_providers(vec![provider], None),
        catalog,
        store.clone(),
    )
    .with_retry(RetryConfig {
        max_retries,
        max_backoff_ms: 0,
        exponential_backoff: true,
    });
    (runner, store)
}

fn ctx() -> TurnContext {
    TurnContext {
        message_id: "msg-1".to_string(),
        chat_id: "chat-1".to_string(),
        current_step: Some("analysis".to_string()),
        ..TurnContext::default()
    }
}

#[tokio::test]
async fn streamed_call_is_persisted_and_accepted() {
    let provider = Arc::new(ScriptedProvider::new("scripted").with_turn(ScriptedTurn::tool_call(
        "c1",
        "sequential_thinking",
        r#"{"thought": "Check the revenue table first", "nextThoughtNeeded": false}"#,
        3,
    )));
    let (runner, store) = runner_with(provider, 2).await;
    let mut events = runner.bus().subscribe();

    let outcome = runner
        .run_turn(vec![ConversationMessage::user("why did revenue dip?")], &ctx())
        .await
        .expect("turn");

    assert_eq!(outcome.tool_calls.len(), 1);
    assert_eq!(outcome.tool_calls[0].args["nextThoughtNeeded"], false);
    let entries = store.entries("msg-1").await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, EntryStatus::Completed);
    assert_eq!(entries[0].content["text"], "Check the revenue table first");
    assert_eq!(entries[0].content["finished_reasoning"], true);
    assert!(entries[0].sequence > 1);

    let first = events.recv().await.expect("event");
    assert_eq!(first.event_type, "tool_call.started");
}

#[tokio::test]
async fn unknown_tool_is_reasked_and_the_retry_succeeds() {
    let provider = Arc::new(
        ScriptedProvider::new("scripted")
            .with_turn(ScriptedTurn::tool_call("c1", "lookup_everything", "{}", 4))
            .with_turn(ScriptedTurn::tool_call(
                "c2",
                "done",
                r#"{"final_response": "All good"}"#,
                4,
            )),
    );
    let (runner, _store) = runner_with(provider.clone(), 2).await;

    let outcome = runner
        .run_turn(vec![ConversationMessage::user("summarize")], &ctx())
        .await
        .expect("turn");

    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.tool_calls.len(), 1);
    assert_eq!(outcome.tool_calls[0].name, "done");
    let roles = outcome.messages.iter().map(|m| m.role).collect::<Vec<_>>();
    assert_eq!(
        roles,
        vec![MessageRole::User, MessageRole::Assistant, MessageRole::Tool, MessageRole::Assistant]
    );

    let requests = provider.requests().await;
    assert_eq!(requests.len(), 2);
    let healing = requests[1]
        .iter()
        .find(|m| m.role == "tool")
        .expect("healing message sent");
    assert_eq!(healing.tool_call_id.as_deref(), Some("c1"));
    assert!(healing.content.contains("done, sequential_thinking"));
    assert!(healing.content.contains("analysis"));
}

#[tokio::test]
async fn misnamed_tool_is_corrected_in_place() {
    let provider = Arc::new(ScriptedProvider::new("scripted").with_turn(ScriptedTurn::tool_call(
        "c1",
        "Done",
        r#"{"final_response": "ok"}"#,
        64,
    )));
    let (runner, _store) = runner_with(provider.clone(), 2).await;
    let outcome = runner
        .run_turn(vec![ConversationMessage::user("hi")], &ctx())
        .await
        .expect("turn");

    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.tool_calls[0].name, "done");
    let ContentPart::ToolCall { tool_name, .. } = &outcome.messages[1].content[0] else {
        panic!("expected tool call part");
    };
    assert_eq!(tool_name, "done");
    assert!(provider.prompts().await.is_empty());
}

#[tokio::test]
async fn invalid_arguments_are_regenerated_without_restreaming() {
    let provider = Arc::new(
        ScriptedProvider::new("scripted")
            .with_turn(ScriptedTurn::tool_call("c1", "done", r#"{"response": "ok"}"#, 6))
            .with_completion(r#"{"final_response": "ok"}"#),
    );
    let (runner, _store) = runner_with(provider.clone(), 2).await;
    let outcome = runner
        .run_turn(vec![ConversationMessage::user("hi")], &ctx())
        .await
        .expect("turn");

    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.tool_calls[0].args, json!({"final_response": "ok"}));
    assert_eq!(provider.requests().await.len(), 1);
    assert_eq!(provider.prompts().await.len(), 1);
}

#[tokio::test]
async fn exhausted_reasks_leave_failures_unresolved() {
    let provider = Arc::new(
        ScriptedProvider::new("scripted").with_turn(ScriptedTurn::tool_call("c1", "lookup_everything", "{}", 4)),
    );
    let (runner, _store) = runner_with(provider, 0).await;
    let outcome = runner
        .run_turn(vec![ConversationMessage::user("hi")], &ctx())
        .await
        .expect("turn");
    assert_eq!(outcome.unresolved.len(), 1);
    assert_eq!(outcome.unresolved[0].code(), "no_such_tool");
    assert!(outcome.tool_calls.is_empty());
}

#[tokio::test]
async fn server_errors_are_retried_without_healing() {
    let provider = Arc::new(
        ScriptedProvider::new("scripted")
            .with_turn(ScriptedTurn::Fail(ProviderError::Status {
                status: 503,
                detail: "overloaded".to_string(),
            }))
            .with_turn(ScriptedTurn::text("Revenue is flat.")),
    );
    let (runner, _store) = runner_with(provider.clone(), 2).await;
    let outcome = runner
        .run_turn(vec![ConversationMessage::user("hi")], &ctx())
        .await
        .expect("turn");

    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.text, "Revenue is flat.");
    let requests = provider.requests().await;
    assert_eq!(requests[0], requests[1]);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let provider = Arc::new(ScriptedProvider::new("scripted").with_turn(ScriptedTurn::Fail(ProviderError::Status {
        status: 401,
        detail: "bad key".to_string(),
    })));
    let (runner, _store) = runner_with(provider.clone(), 3).await;
    let err = runner
        .run_turn(vec![ConversationMessage::user("hi")], &ctx())
        .await
        .expect_err("should fail");
    assert_eq!(
        err.downcast_ref::<ProviderError>().and_then(ProviderError::status),
        Some(401)
    );
    assert_eq!(provider.requests().await.len(), 1);
}

#[tokio::test]
async fn retries_stop_at_the_configured_limit() {
    let provider = Arc::new(
        ScriptedProvider::new("scripted")
            .with_turn(ScriptedTurn::Fail(ProviderError::Timeout("30s".to_string())))
            .with_turn(ScriptedTurn::Fail(ProviderError::Timeout("30s".to_string()))),
    );
    let (runner, _store) = runner_with(provider.clone(), 1).await;
    let err = runner
        .run_turn(vec![ConversationMessage::user("hi")], &ctx())
        .await
        .expect_err("should fail");
    assert!(format!("{err:#}").contains("giving up after 1 retries"));
    assert_eq!(provider.requests().await.len(), 2);
}

#[tokio::test]
async fn overloaded_provider_falls_back_to_the_next_one() {
    let primary = Arc::new(ScriptedProvider::new("primary").with_turn(ScriptedTurn::Fail(ProviderError::Status {
        status: 503,
        detail: "overloaded".to_string(),
    })));
    let secondary = Arc::new(ScriptedProvider::new("secondary").with_turn(ScriptedTurn::text("Revenue is flat.")));
    let catalog = ToolCatalog::from_schemas(schemas()).await.expect("catalog");
    let providers = ProviderRegistry::with_providers(
        vec![primary.clone() as Arc<dyn Provider>, secondary.clone() as Arc<dyn Provider>],
        Some("primary".to_string()),
    )
    .with_fallbacks(vec!["secondary".to_string()]);
    let runner = ToolStreamRunner::new(providers, catalog, Arc::new(MemoryEntryStore::new())).with_retry(RetryConfig {
        max_retries: 2,
        max_backoff_ms: 60_000,
        exponential_backoff: true,
    });
    let mut events = runner.bus().subscribe();

    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        runner.run_turn(vec![ConversationMessage::user("hi")], &ctx()),
    )
    .await
    .expect("fallback does not wait for backoff")
    .expect("turn");

    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.text, "Revenue is flat.");
    assert_eq!(primary.requests().await.len(), 1);
    assert_eq!(secondary.requests().await.len(), 1);

    let mut fallback = None;
    while let Ok(event) = events.try_recv() {
        if event.event_type == "turn.fallback" {
            fallback = Some(event);
        }
    }
    let fallback = fallback.expect("fallback event");
    assert_eq!(fallback.properties["from"], "primary");
    assert_eq!(fallback.properties["to"], "secondary");
}

#[tokio::test]
async fn client_errors_do_not_fall_back() {
    let primary = Arc::new(ScriptedProvider::new("primary").with_turn(ScriptedTurn::Fail(ProviderError::Status {
        status: 401,
        detail: "bad key".to_string(),
    })));
    let secondary = Arc::new(ScriptedProvider::new("secondary").with_turn(ScriptedTurn::text("unused")));
    let catalog = ToolCatalog::from_schemas(schemas()).await.expect("catalog");
    let providers = ProviderRegistry::with_providers(
        vec![primary.clone() as Arc<dyn Provider>, secondary.clone() as Arc<dyn Provider>],
        Some("primary".to_string()),
    )
    .with_fallbacks(vec!["secondary".to_string()]);
    let runner = ToolStreamRunner::new(providers, catalog, Arc::new(MemoryEntryStore::new()));

    runner
        .run_turn(vec![ConversationMessage::user("hi")], &ctx())
        .await
        .expect_err("should fail");
    assert!(secondary.requests().await.is_empty());
}

#[tokio::test]
async fn long_history_is_compressed_before_streaming() {
    let provider = Arc::new(ScriptedProvider::new("scripted").with_turn(ScriptedTurn::text("Revenue is flat.")));
    let (runner, _store) = runner_with(provider.clone(), 0).await;
    let runner = runner.with_compression(CompressionConfig {
        message_threshold: 4,
        keep_recent: 2,
        ..CompressionConfig::default()
    });

    let mut messages = vec![
        ConversationMessage::system("You are a data analyst."),
        ConversationMessage::user("why did revenue dip?"),
    ];
    for round in 0..3 {
        messages.push(ConversationMessage::text(MessageRole::Assistant, format!("answer {round}")));
        messages.push(ConversationMessage::user(format!("follow-up {round}")));
    }

    let outcome = runner.run_turn(messages, &ctx()).await.expect("turn");

    let requests = provider.requests().await;
    assert_eq!(requests[0].len(), 5);
    assert_eq!(requests[0][1].content, "why did revenue dip?");
    assert!(requests[0][2].content.contains("4 earlier messages were removed"));
    assert_eq!(requests[0][4].content, "follow-up 2");
    assert_eq!(outcome.messages.len(), 6);
}
