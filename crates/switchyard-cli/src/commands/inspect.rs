//! `switchyard inspect` — Build a workflow and print what it compiled into.

use serde_json::json;
use switchyard_core::EngineContext;

use super::print_json;

pub async fn run(ctx: &EngineContext, workflow_id: &str) -> Result<(), String> {
    let runtime = ctx
        .runtimes
        .get(workflow_id)
        .await
        .map_err(|e| e.to_string())?;

    let assistants: Vec<serde_json::Value> = runtime
        .assistants()
        .map(|assistants| {
            assistants
                .values()
                .map(|a| {
                    let plugins: Vec<serde_json::Value> = a
                        .plugins
                        .values()
                        .map(|p| {
                            json!({
                                "id": p.registry_id(),
                                "kind": p.kind(),
                                "status": p.status(),
                                "tools": p.list_tools().iter().map(|t| &t.exposed_name).cloned().collect::<Vec<_>>(),
                            })
                        })
                        .collect();
                    json!({
                        "id": a.id,
                        "name": a.name,
                        "destinations": a.destinations,
                        "handoffTools": a.handoffs.iter().map(|h| &h.name).collect::<Vec<_>>(),
                        "plugins": plugins,
                        "unavailable": a.unavailable,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    print_json(&json!({
        "workflowId": runtime.workflow_id(),
        "kind": runtime.kind(),
        "nodes": runtime.nodes(),
        "fallbackReason": runtime.fallback_reason(),
        "defaultAssistant": runtime.default_assistant(),
        "builtAt": runtime.built_at().to_rfc3339(),
        "assistants": assistants,
        "cache": ctx.runtimes.snapshot(),
    }));
    Ok(())
}
