use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use holt_engine::boot::load_world;
use holt_engine::cli::Args;
use holt_engine::config;
use holt_engine::runtime::{Engine, EngineOptions, TracingTelemetry};
use holt_world::memory::{AllowChallenges, MemoryIntervals, MemoryQueue, MemoryStore};
use holt_world::{Challenges, ObjectId};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = config::resolve(&args)?;

    let storage = Arc::new(MemoryStore::new());
    load_world(&settings.world_root, &storage)
        .with_context(|| format!("booting world from {}", settings.world_root.display()))?;

    let queue = Arc::new(MemoryQueue::system());
    let intervals = Arc::new(MemoryIntervals::new());
    let challenges: Arc<dyn Challenges> = Arc::new(AllowChallenges);
    let engine = Arc::new(Engine::new(
        storage.clone(),
        queue,
        intervals,
        challenges,
        Arc::new(TracingTelemetry),
        EngineOptions {
            script_timeout: settings.script_timeout,
        },
    ));

    // Refresh every object once so top-level script effects (listener
    // registrations, self-winding timers) exist before traffic arrives.
    for id in storage.object_ids() {
        if let Err(err) = engine.executor().refresh(&id).await {
            tracing::warn!(object = %id, error = %err, "boot refresh failed");
        }
    }

    engine.recover();
    let pump = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_pump().await })
    };

    let avatar = ObjectId::new(settings.avatar.clone());
    let mut session = engine.connections().attach(&avatar);
    tokio::spawn(async move {
        while let Some(line) = session.recv().await {
            println!("{line}");
        }
    });

    info!(avatar = %avatar, "session ready");
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        match engine.command(&avatar, &line).await {
            Ok(true) => {}
            Ok(false) => println!("Nothing here responds to that."),
            Err(err) => println!("error: {err}"),
        }
    }

    pump.abort();
    engine.connections().detach(&avatar);
    Ok(())
}
