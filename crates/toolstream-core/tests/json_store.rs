use std::sync::Arc;

use serde_json::json;

use toolstream_core::{
    EventBus, HandlerRegistry, JsonFileEntryStore, LifecycleContext, MessageEntryStore, ToolCallLifecycle,
};
use toolstream_types::{EntryKind, EntryStatus};

#[tokio::test]
async fn lifecycle_snapshots_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(JsonFileEntryStore::open(dir.path()).await.expect("open"));
    let mut lifecycle = ToolCallLifecycle::new(
        LifecycleContext::new("msg-7", "chat-1"),
        HandlerRegistry::with_defaults(),
        store.clone(),
        EventBus::new(),
    );

    lifecycle.on_start("c1", "create_metrics").await.expect("start");
    for piece in [
        r#"{"files": [{"name": "revenue.yml", "#,
        r#""yml_content": "name: revenue\n"#,
        r#"type: sum"}]}"#,
    ] {
        lifecycle.on_delta("c1", piece).await.expect("delta");
    }
    lifecycle.on_start("c2", "done").await.expect("start");
    lifecycle
        .on_delta("c2", r#"{"final_response": "Created one metric"}"#)
        .await
        .expect("delta");
    lifecycle.finish_open().await.expect("finish");
    store.close().await.expect("close");
    assert!(store.message_path("msg-7").exists());

    let reopened = JsonFileEntryStore::open(dir.path()).await.expect("reopen");
    let entries = reopened.entries("msg-7").await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].tool_call_id, "c1");
    assert_eq!(entries[0].status, EntryStatus::Completed);
    assert_eq!(entries[0].content["files"][0]["name"], "revenue.yml");
    assert_eq!(entries[0].content["files"][0]["yml_content"], "name: revenue\ntype: sum");
    assert_eq!(entries[0].content["files"][0]["status"], "completed");
    assert_eq!(entries[1].kind, EntryKind::Response);
    assert_eq!(entries[1].content, json!({"message": "Created one metric"}));

    let receipt = reopened
        .upsert(entries[1].clone())
        .await
        .expect("upsert after reopen");
    assert!(receipt.sequence_number > entries[1].sequence);
}

#[tokio::test]
async fn closed_store_skips_lifecycle_updates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(JsonFileEntryStore::open(dir.path()).await.expect("open"));
    store.close().await.expect("close");

    let mut lifecycle = ToolCallLifecycle::new(
        LifecycleContext::new("msg-1", "chat-1"),
        HandlerRegistry::with_defaults(),
        store.clone(),
        EventBus::new(),
    );
    let receipt = lifecycle.on_start("c1", "done").await.expect("start");
    assert_eq!(receipt.map(|r| r.skipped), Some(true));
    assert!(store.entries("msg-1").await.is_empty());
}
