//! `switchyard watch` — Rebuild workflows when their definition files change.
//!
//! A `notify` poll watcher observes the workflow directory and every plugin
//! directory. Each batch of relevant events reloads the plugin registry and
//! requests a debounced rebuild of every known workflow; completed rebuilds
//! are reported through a rebuild callback.

use std::collections::BTreeSet;
use std::time::Duration;

use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use switchyard_core::store::YamlWorkflowSource;
use switchyard_core::EngineContext;

pub async fn run(ctx: &EngineContext, interval_ms: u64) -> Result<(), String> {
    let dir = ctx.config.workflow_dir_or_default();
    let source = YamlWorkflowSource::new(dir.clone());
    let debounce = ctx.config.rebuild_debounce();

    ctx.runtimes.register_rebuild_callback(|workflow_id, runtime| {
        println!(
            "[swap] {} -> {:?}{}",
            workflow_id,
            runtime.kind(),
            runtime
                .fallback_reason()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
    });

    // Warm every workflow so the first change has something to replace.
    for id in source.workflow_ids().await.map_err(|e| e.to_string())? {
        if let Err(e) = ctx.runtimes.get(&id).await {
            tracing::warn!("[Watch] Initial build of '{}' failed: {}", id, e);
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = PollWatcher::new(
        move |res| {
            // The receiver only goes away when the command ends.
            let _ = tx.send(res);
        },
        Config::default().with_poll_interval(Duration::from_millis(interval_ms.max(50))),
    )
    .map_err(|e| format!("Failed to start watcher: {}", e))?;

    watcher
        .watch(&dir, RecursiveMode::Recursive)
        .map_err(|e| format!("Failed to watch {}: {}", dir.display(), e))?;
    for plugin_dir in ctx.config.plugin_dirs.iter().filter(|d| d.is_dir()) {
        if let Err(e) = watcher.watch(plugin_dir, RecursiveMode::Recursive) {
            tracing::warn!("[Watch] Cannot watch {}: {}", plugin_dir.display(), e);
        }
    }

    println!("Watching {} (Ctrl+C to stop)", dir.display());
    loop {
        let first = tokio::select! {
            event = rx.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping watch");
                return Ok(());
            }
        };
        let Some(first) = first else {
            return Err("File watcher stopped unexpectedly".to_string());
        };
        if !drain_batch(first, &mut rx) {
            continue;
        }

        let mut ids: BTreeSet<String> = ctx
            .runtimes
            .snapshot()
            .into_iter()
            .map(|entry| entry.workflow_id)
            .collect();
        match source.workflow_ids().await {
            Ok(found) => ids.extend(found),
            Err(e) => tracing::warn!("[Watch] Cannot list workflows: {}", e),
        }

        let reloaded = ctx.registry.reload();
        tracing::info!(
            "[Watch] Change detected; {} plugin manifest(s), rebuilding {} workflow(s)",
            reloaded,
            ids.len()
        );
        for id in &ids {
            ctx.runtimes.request_rebuild(id, debounce);
        }
    }
}

/// Consume `first` and whatever else is already queued. Returns whether any
/// of it touched a definition document.
fn drain_batch(
    first: notify::Result<Event>,
    rx: &mut UnboundedReceiver<notify::Result<Event>>,
) -> bool {
    let mut relevant = false;
    let mut next = Some(first);
    while let Some(res) = next {
        match res {
            Ok(event) => relevant |= is_relevant(&event),
            Err(e) => tracing::warn!("[Watch] Watch error: {}", e),
        }
        next = rx.try_recv().ok();
    }
    relevant
}

fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| YamlWorkflowSource::is_document(p))
}
