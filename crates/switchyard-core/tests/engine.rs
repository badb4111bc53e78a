//! End-to-end tests: workflow definitions compiled through the engine
//! context, against fake tool servers and a rule-driven model.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::*;
use switchyard_core::assistant::handoff_tool_name;
use switchyard_core::graph::GraphKind;
use switchyard_core::llm::{ChatMessage, Role};
use switchyard_core::models::{EdgeMode, PluginRef, ToolOverride, FALLBACK_WORKFLOW_ID};
use switchyard_core::plugins::PluginStatus;
use switchyard_core::results::{DisplayPayload, ToolEnvelope};
use switchyard_core::{CompiledRuntime, EntryState};

fn names(items: impl IntoIterator<Item = String>) -> BTreeSet<String> {
    items.into_iter().collect()
}

fn system_mentions(request: &switchyard_core::llm::ChatRequest, who: &str) -> bool {
    request
        .messages
        .first()
        .map(|m| m.role == Role::System && m.content.contains(who))
        .unwrap_or(false)
}

#[tokio::test]
async fn test_missing_start_node_serves_fallback() {
    let h = harness(RuleModel::echo("hello from fallback"), &[]);
    h.source.upsert_assistant(assistant("a", "Alpha", vec![]));
    h.source
        .upsert_workflow(workflow("wf", &[("n1", "a", false)], &[]));

    let runtime = h.ctx.runtimes.get("wf").await.expect("fallback is always served");
    assert_eq!(runtime.kind(), GraphKind::Fallback);
    assert_eq!(runtime.nodes(), vec!["chat"]);
    assert!(runtime
        .fallback_reason()
        .expect("reason recorded")
        .contains("no start node"));

    let output = runtime.invoke("t1", "hi").await.expect("invoke");
    assert_eq!(output.reply(), Some("hello from fallback"));
    assert_eq!(h.ctx.runtimes.state("wf"), EntryState::Clean);
}

#[tokio::test]
async fn test_unknown_and_sentinel_workflows_serve_fallback() {
    let h = harness(RuleModel::echo("ok"), &[]);

    let unknown = h.ctx.runtimes.get("nope").await.expect("unknown id");
    assert_eq!(unknown.kind(), GraphKind::Fallback);
    assert!(unknown.fallback_reason().unwrap().contains("not found"));

    let sentinel = h
        .ctx
        .runtimes
        .get(FALLBACK_WORKFLOW_ID)
        .await
        .expect("sentinel id");
    assert_eq!(sentinel.kind(), GraphKind::Fallback);
    assert_eq!(sentinel.workflow_id(), FALLBACK_WORKFLOW_ID);
}

#[tokio::test]
async fn test_start_assistant_missing_serves_fallback() {
    let h = harness(RuleModel::echo("ok"), &[]);
    h.source.upsert_assistant(assistant("b", "Beta", vec![]));
    h.source.upsert_workflow(workflow(
        "wf",
        &[("n1", "ghost", true), ("n2", "b", false)],
        &[("n1", "n2", EdgeMode::Single)],
    ));

    let runtime = h.ctx.runtimes.get("wf").await.expect("get");
    assert_eq!(runtime.kind(), GraphKind::Fallback);
    assert!(runtime.fallback_reason().unwrap().contains("ghost"));
}

#[tokio::test]
async fn test_non_start_assistant_missing_is_skipped() {
    let h = harness(RuleModel::echo("ok"), &[]);
    h.source.upsert_assistant(assistant("a", "Alpha", vec![]));
    h.source.upsert_workflow(workflow(
        "wf",
        &[("n1", "a", true), ("n2", "ghost", false)],
        &[("n1", "n2", EdgeMode::Bidirectional)],
    ));

    let runtime = h.ctx.runtimes.get("wf").await.expect("get");
    assert_eq!(runtime.kind(), GraphKind::MultiAgent);
    let assistants = runtime.assistants().unwrap();
    assert_eq!(assistants.len(), 1);
    assert!(assistants["Alpha"].destinations.is_empty());
}

#[tokio::test]
async fn test_destinations_follow_edge_modes() {
    let h = harness(RuleModel::echo("ok"), &[]);
    for (id, name) in [("a", "A"), ("b", "B"), ("c", "C")] {
        h.source.upsert_assistant(assistant(id, name, vec![]));
    }
    h.source.upsert_workflow(workflow(
        "wf",
        &[("n1", "a", true), ("n2", "b", false), ("n3", "c", false)],
        &[
            ("n1", "n2", EdgeMode::Single),
            ("n2", "n3", EdgeMode::Bidirectional),
        ],
    ));

    let runtime = h.ctx.runtimes.get("wf").await.expect("get");
    assert_eq!(runtime.nodes(), vec!["entry", "router", "exit"]);
    assert_eq!(runtime.default_assistant(), Some("A"));

    let assistants = runtime.assistants().unwrap();
    let dest = |name: &str| names(assistants[name].destinations.iter().cloned());
    assert_eq!(dest("A"), names(["B".to_string()]));
    assert_eq!(dest("B"), names(["C".to_string()]));
    assert_eq!(dest("C"), names(["B".to_string()]));

    let tools: Vec<String> = assistants["A"]
        .tool_definitions()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(tools, vec![handoff_tool_name("B")]);
}

#[tokio::test]
async fn test_broken_plugins_do_not_break_the_assistant() {
    let h = harness(
        RuleModel::echo("ok"),
        &[
            ("weather", remote_manifest("weather", "")),
            ("broken", "id: [unclosed\n".to_string()),
            ("down", remote_manifest("down", "")),
            ("slow", remote_manifest("slow", "")),
        ],
    );
    h.connector
        .serve(&plugin_url("weather"), FakeServer::with_tools(&["forecast"]));
    h.connector.serve(&plugin_url("down"), FakeServer::failing());
    h.connector
        .serve(&plugin_url("slow"), FakeServer::slow(Duration::from_secs(2)));

    assert!(h.ctx.registry.get("broken").is_none());
    assert_eq!(h.ctx.registry.len(), 3);

    h.source.upsert_assistant(assistant(
        "a",
        "Alpha",
        ["weather", "broken", "down", "slow"]
            .into_iter()
            .map(PluginRef::new)
            .collect(),
    ));
    h.source
        .upsert_workflow(workflow("wf", &[("n1", "a", true)], &[]));

    let runtime = h.ctx.runtimes.get("wf").await.expect("get");
    assert_eq!(runtime.kind(), GraphKind::MultiAgent);

    let alpha = &runtime.assistants().unwrap()["Alpha"];
    assert_eq!(alpha.plugins.keys().collect::<Vec<_>>(), vec!["weather"]);
    assert_eq!(
        alpha.unavailable.keys().collect::<Vec<_>>(),
        vec!["down", "slow"]
    );
    assert!(alpha.unavailable["slow"].contains("timed out"));

    let tools: Vec<String> = alpha.tool_definitions().into_iter().map(|t| t.name).collect();
    assert_eq!(tools, vec!["forecast".to_string()]);

    let down = h.ctx.plugins.get_or_create_singleton("down").await;
    assert_eq!(down.status(), PluginStatus::Error);
}

#[tokio::test]
async fn test_renamed_tool_call_returns_envelope() {
    let h = harness(
        RuleModel::new(|request| {
            let offers_alias = request.tools.iter().any(|t| t.name == "weather_now");
            if fresh_turn(request) && offers_alias {
                ChatMessage::assistant("")
                    .with_tool_calls(vec![tool_call("weather_now", json!({ "city": "Oslo" }))])
            } else {
                ChatMessage::assistant("It is 3 degrees in Oslo.")
            }
        }),
        &[("weather", remote_manifest("weather", ""))],
    );
    h.connector.serve(
        &plugin_url("weather"),
        FakeServer::with_tools(&["forecast", "alerts"]),
    );

    let mut link = PluginRef::new("weather");
    link.tools_default_enabled = false;
    link.tools.push(ToolOverride {
        name: "forecast".to_string(),
        enabled: Some(true),
        rename: Some("weather_now".to_string()),
        description: None,
    });
    h.source
        .upsert_assistant(assistant("a", "Forecaster", vec![link]));
    h.source
        .upsert_workflow(workflow("wf", &[("n1", "a", true)], &[]));

    let runtime = h.ctx.runtimes.get("wf").await.expect("get");
    let forecaster = &runtime.assistants().unwrap()["Forecaster"];
    let tools: Vec<String> = forecaster
        .tool_definitions()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(tools, vec!["weather_now".to_string()]);

    let output = runtime.invoke("t1", "weather?").await.expect("invoke");
    assert_eq!(output.reply(), Some("It is 3 degrees in Oslo."));
    assert_eq!(output.artifacts.len(), 1);

    // The server saw the original tool name.
    let calls = h.connector.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![("forecast".to_string(), json!({ "city": "Oslo" }))]);

    let tool_message = output
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool message");
    // The model sees only the short text; the envelope rides alongside.
    let envelope: &ToolEnvelope = tool_message.artifact.as_ref().expect("envelope kept");
    assert_eq!(envelope, &output.artifacts[0]);
    assert_eq!(tool_message.content, envelope.model_text);
    assert!(envelope.model_text.starts_with("2 rows"));
    assert!(!tool_message.content.contains(&envelope.artifact_id));

    let record = h.ctx.results.get(&envelope.artifact_id).expect("record kept");
    assert_eq!(record.metadata["row_count"], json!(2));
    assert_eq!(record.metadata["tool"], json!("forecast"));
    match &record.display[0] {
        DisplayPayload::Table { columns, .. } => assert!(columns.contains(&"city".to_string())),
        other => panic!("expected table, got {:?}", other),
    }
}

#[tokio::test]
async fn test_handoff_routes_and_resumes_from_checkpoint() {
    let model = RuleModel::new(|request| {
        if system_mentions(request, "Triage") {
            ChatMessage::assistant("").with_tool_calls(vec![tool_call(
                &handoff_tool_name("Billing"),
                json!({}),
            )])
        } else {
            ChatMessage::assistant("Billing here.")
        }
    });
    let h = harness(model.clone(), &[]);
    h.source.upsert_assistant(assistant("t", "Triage", vec![]));
    h.source.upsert_assistant(assistant("b", "Billing", vec![]));
    h.source.upsert_workflow(workflow(
        "support",
        &[("triage", "t", true), ("billing", "b", false)],
        &[("triage", "billing", EdgeMode::Single)],
    ));

    let runtime = h.ctx.runtimes.get("support").await.expect("get");
    let first = runtime.invoke("thread-1", "my invoice").await.expect("invoke");
    assert_eq!(first.active_assistant.as_deref(), Some("Billing"));
    assert_eq!(first.reply(), Some("Billing here."));
    assert!(first
        .messages
        .iter()
        .any(|m| m.role == Role::Tool && m.content == "Successfully transferred to Billing"));
    assert_eq!(model.calls.load(Ordering::SeqCst), 2);

    // The next turn resumes with Billing instead of the start assistant.
    let second = runtime.invoke("thread-1", "thanks").await.expect("invoke");
    assert_eq!(second.active_assistant.as_deref(), Some("Billing"));
    assert_eq!(model.calls.load(Ordering::SeqCst), 3);

    let state = runtime
        .checkpoints()
        .load_latest("thread-1")
        .await
        .expect("load")
        .expect("state saved");
    assert_eq!(state.active_assistant.as_deref(), Some("Billing"));
    assert_eq!(state.messages.first().map(|m| m.content.as_str()), Some("my invoice"));

    // A different thread starts over at the start assistant.
    let other = runtime.invoke("thread-2", "hello").await.expect("invoke");
    assert_eq!(other.active_assistant.as_deref(), Some("Billing"));
    assert_eq!(model.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_checkpoints_survive_rebuild() {
    let h = harness(RuleModel::echo("ok"), &[]);
    h.source.upsert_assistant(assistant("a", "Alpha", vec![]));
    h.source
        .upsert_workflow(workflow("wf", &[("n1", "a", true)], &[]));

    let before = h.ctx.runtimes.get("wf").await.expect("get");
    before.invoke("t1", "remember me").await.expect("invoke");

    let after = h.ctx.runtimes.rebuild("wf").await.expect("rebuild");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!Arc::ptr_eq(&before, &after));
    // Still held here, so the replaced graph is not released yet.
    let old_store = before.checkpoints().clone();
    assert!(!old_store.is_closed());

    drop(before);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(old_store.is_closed());

    let state = after
        .checkpoints()
        .load_latest("t1")
        .await
        .expect("load")
        .expect("state kept across rebuild");
    assert_eq!(state.messages[0].content, "remember me");
}

#[tokio::test]
async fn test_request_in_flight_survives_rebuild() {
    let schema = "config_schema:\n  - name: dsn\n    type: string\n";
    let h = harness(
        RuleModel::slow_echo("done", Duration::from_millis(150)),
        &[("sql", remote_manifest("sql", schema))],
    );
    h.connector
        .serve(&plugin_url("sql"), FakeServer::with_tools(&["query"]));
    let mut link = PluginRef::new("sql");
    link.config.insert("dsn".to_string(), json!("postgres://live"));
    h.source.upsert_assistant(assistant("a", "Alpha", vec![link]));
    h.source
        .upsert_workflow(workflow("wf", &[("n1", "a", true)], &[]));

    let runtime = h.ctx.runtimes.get("wf").await.expect("get");
    let plugin = runtime.assistants().unwrap()["Alpha"].plugins["sql"].clone();
    let running = tokio::spawn(async move { runtime.invoke("t1", "hi").await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let rebuilt = h.ctx.runtimes.rebuild("wf").await.expect("rebuild");
    assert!(!plugin.is_closed());

    let output = running.await.expect("join").expect("turn completes");
    assert_eq!(output.reply(), Some("done"));

    // The turn was saved, and the new graph sees it.
    let state = rebuilt
        .checkpoints()
        .load_latest("t1")
        .await
        .expect("load")
        .expect("saved");
    assert_eq!(state.messages.len(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(plugin.is_closed());
    assert_eq!(h.connector.closes(), 1);
}

#[tokio::test]
async fn test_singleton_shared_across_workflows() {
    let h = harness(
        RuleModel::echo("ok"),
        &[("weather", remote_manifest("weather", ""))],
    );
    h.connector
        .serve(&plugin_url("weather"), FakeServer::with_tools(&["forecast"]));
    h.source.upsert_assistant(assistant(
        "a",
        "Alpha",
        vec![PluginRef::new("weather")],
    ));
    h.source
        .upsert_workflow(workflow("one", &[("n1", "a", true)], &[]));
    h.source
        .upsert_workflow(workflow("two", &[("n1", "a", true)], &[]));

    let one = h.ctx.runtimes.get("one").await.expect("get");
    let two = h.ctx.runtimes.get("two").await.expect("get");
    assert!(Arc::ptr_eq(
        &one.assistants().unwrap()["Alpha"].plugins["weather"],
        &two.assistants().unwrap()["Alpha"].plugins["weather"],
    ));
    assert_eq!(h.connector.connects(), 1);
    assert_eq!(h.ctx.plugins.singleton_count().await, 1);

    // Graph scopes never own singletons.
    h.ctx.runtimes.close_all().await;
    assert_eq!(h.connector.closes(), 0);

    h.ctx.shutdown().await;
    assert_eq!(h.connector.closes(), 1);
}

#[tokio::test]
async fn test_hot_swap_releases_previous_per_link_plugins() {
    let schema = "config_schema:\n  - name: dsn\n    type: string\n    required: true\n    secret: true\n";
    let h = harness(
        RuleModel::echo("ok"),
        &[("sql", remote_manifest("sql", schema))],
    );
    h.connector
        .serve(&plugin_url("sql"), FakeServer::with_tools(&["query"]));

    let mut link = PluginRef::new("sql");
    link.config
        .insert("dsn".to_string(), json!("postgres://reports"));
    h.source
        .upsert_assistant(assistant("a", "Analyst", vec![link]));
    h.source
        .upsert_workflow(workflow("reports", &[("n1", "a", true)], &[]));

    let swaps = Arc::new(AtomicUsize::new(0));
    let serving: Arc<Mutex<Option<Arc<CompiledRuntime>>>> = Arc::new(Mutex::new(None));
    {
        let swaps = swaps.clone();
        let serving = serving.clone();
        h.ctx.runtimes.register_rebuild_callback(move |id, runtime| {
            if id == "reports" {
                swaps.fetch_add(1, Ordering::SeqCst);
                *serving.lock().unwrap() = Some(runtime);
            }
        });
    }

    let old = h.ctx.runtimes.get("reports").await.expect("get");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(swaps.load(Ordering::SeqCst), 1);
    assert_eq!(h.connector.connects(), 1);

    h.ctx.runtimes.invalidate("reports");
    assert_eq!(h.ctx.runtimes.state("reports"), EntryState::Dirty);
    let new = h.ctx.runtimes.get("reports").await.expect("get");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(swaps.load(Ordering::SeqCst), 2);
    let current = serving.lock().unwrap().clone().expect("swapped");
    assert!(Arc::ptr_eq(&current, &new));

    assert_eq!(h.connector.connects(), 2);
    // The previous graph stays usable until its last holder lets go.
    let old_plugin = old.assistants().unwrap()["Analyst"].plugins["sql"].clone();
    assert_eq!(h.connector.closes(), 0);
    assert!(!old_plugin.is_closed());

    drop(old);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.connector.closes(), 1);
    assert!(old_plugin.is_closed());
    assert!(!new.assistants().unwrap()["Analyst"].plugins["sql"].is_closed());

    drop((new, current));
    serving.lock().unwrap().take();
    h.ctx.shutdown().await;
    assert_eq!(h.connector.closes(), 2);
}

#[tokio::test]
async fn test_invalid_config_still_starts_plugin() {
    let schema = "config_schema:\n  - name: port\n    type: integer\n    required: true\n";
    let h = harness(
        RuleModel::echo("ok"),
        &[("db", remote_manifest("db", schema))],
    );
    h.connector
        .serve(&plugin_url("db"), FakeServer::with_tools(&["query"]));

    let mut link = PluginRef::new("db");
    link.config.insert("port".to_string(), json!("not a number"));
    h.source.upsert_assistant(assistant("a", "Alpha", vec![link]));
    h.source
        .upsert_workflow(workflow("wf", &[("n1", "a", true)], &[]));

    let runtime = h.ctx.runtimes.get("wf").await.expect("get");
    let alpha = &runtime.assistants().unwrap()["Alpha"];
    assert!(alpha.plugins["db"].is_active());
    assert!(alpha.unavailable.is_empty());
}
