//! `switchyard chat` — Talk to a compiled workflow.
//!
//! With `--message` a single turn is run and the reply printed; otherwise a
//! REPL reads one user turn per line until `/quit`.

use std::io::{self, BufRead, Write};

use switchyard_core::graph::RunOutput;
use switchyard_core::EngineContext;

pub async fn run(
    ctx: &EngineContext,
    workflow_id: &str,
    thread_id: &str,
    message: Option<&str>,
) -> Result<(), String> {
    if let Some(text) = message {
        let output = turn(ctx, workflow_id, thread_id, text).await?;
        print_output(&output);
        return Ok(());
    }

    let runtime = ctx
        .runtimes
        .get(workflow_id)
        .await
        .map_err(|e| e.to_string())?;

    println!("Switchyard Chat");
    println!("══════════════════════════════════════");
    println!("Workflow: {} ({:?})", workflow_id, runtime.kind());
    if let Some(reason) = runtime.fallback_reason() {
        println!("Fallback: {}", reason);
    }
    println!("Thread: {}", thread_id);
    println!("══════════════════════════════════════");
    println!();
    println!("Type your message and press Enter. Type /quit to exit.");
    println!("Commands: /rebuild, /threads, /quit");
    println!();

    let stdin = io::stdin();
    let reader = stdin.lock();
    prompt();

    for line in reader.lines() {
        let line = line.map_err(|e| format!("Failed to read input: {}", e))?;
        let trimmed = line.trim();

        if trimmed.is_empty() {
            prompt();
            continue;
        }

        match trimmed {
            "/quit" | "/exit" | "/q" => {
                println!("Goodbye!");
                break;
            }
            "/rebuild" => match ctx.runtimes.rebuild(workflow_id).await {
                Ok(runtime) => println!("Rebuilt '{}' ({:?})", workflow_id, runtime.kind()),
                Err(e) => println!("Rebuild failed: {}", e),
            },
            "/threads" => {
                let runtime = ctx
                    .runtimes
                    .get(workflow_id)
                    .await
                    .map_err(|e| e.to_string())?;
                match runtime.checkpoints().list_threads().await {
                    Ok(threads) => println!("{}", threads.join("\n")),
                    Err(e) => println!("Error: {}", e),
                }
            }
            text => match turn(ctx, workflow_id, thread_id, text).await {
                Ok(output) => print_output(&output),
                Err(e) => println!("Error: {}", e),
            },
        }
        prompt();
    }

    Ok(())
}

/// Fetch the current runtime per turn so rebuilds are picked up.
async fn turn(
    ctx: &EngineContext,
    workflow_id: &str,
    thread_id: &str,
    text: &str,
) -> Result<RunOutput, String> {
    let runtime = ctx
        .runtimes
        .get(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    runtime
        .invoke(thread_id, text)
        .await
        .map_err(|e| e.to_string())
}

fn print_output(output: &RunOutput) {
    for envelope in &output.artifacts {
        println!("  [artifact {}] {}", envelope.artifact_id, envelope.model_text);
    }
    let speaker = output.active_assistant.as_deref().unwrap_or("assistant");
    match output.reply() {
        Some(reply) => println!("{}: {}", speaker, reply),
        None => println!("{}: (no reply)", speaker),
    }
}

fn prompt() {
    print!("> ");
    io::stdout().flush().ok();
}
