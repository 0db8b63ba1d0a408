//! Run shortcuts in-process, without a daemon.
//!
//! Launches a short job wrapped by a hook, prints its events, then launches a
//! long one and kills it.

use shortcut_manager::{ExecutionManager, HookDefinition, HookEngine, Shortcut};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().without_time())
        .with(EnvFilter::from_default_env().add_directive("shortcut_manager=info".parse()?))
        .init();

    let mut hooks = BTreeMap::new();
    hooks.insert(
        "announce".to_string(),
        HookDefinition {
            description: "Say hello and goodbye".to_string(),
            pre: vec!["echo \"starting $SHORTCUT_NAME\"".to_string()],
            post: vec!["echo \"finished $SHORTCUT_NAME\"".to_string()],
        },
    );
    let manager = ExecutionManager::builder()
        .hooks(HookEngine::new(hooks))
        .build();

    let job =
        Shortcut::script("Count", "for i in 1 2 3; do sleep 0.1; done").with_hooks(["announce"]);
    let mut events = manager.subscribe(&job.id);
    manager.launch(&job).await?;
    while let Some(event) = events.recv().await {
        println!("{}: {:?}", job.name, event.kind);
        if event.is_stop() {
            break;
        }
    }

    let long = Shortcut::script("Nap", "sleep 60");
    let _printer = manager.on_event(&long.id, |event| println!("Nap: {:?}", event.kind));
    let handle = manager.launch(&long).await?;
    println!("Nap running as pid {}", handle.pid());
    tokio::time::sleep(Duration::from_millis(200)).await;
    manager.kill(&long.id).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("Nap running: {}", manager.is_running(&long.id));
    Ok(())
}
