//! `switchyard plugins` — List discovered plugin manifests.

use serde_json::json;
use switchyard_core::models::ExecutionMode;
use switchyard_core::EngineContext;

use super::print_json;

pub async fn list(ctx: &EngineContext) -> Result<(), String> {
    let plugins: Vec<serde_json::Value> = ctx
        .registry
        .list()
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "displayName": m.display_name,
                "version": m.version,
                "mode": match m.execution.mode {
                    ExecutionMode::Local => "local",
                    ExecutionMode::Remote => "remote",
                },
                "configFree": m.is_config_free(),
                "config": m.config_schema.iter().map(|f| json!({
                    "name": f.name,
                    "type": f.field_type.to_string(),
                    "required": f.required,
                    "secret": f.secret,
                })).collect::<Vec<_>>(),
                "servers": m.servers.keys().collect::<Vec<_>>(),
                "dir": m.base_dir,
            })
        })
        .collect();

    print_json(&json!({
        "count": plugins.len(),
        "dirs": ctx.config.plugin_dirs,
        "plugins": plugins,
    }));
    Ok(())
}
