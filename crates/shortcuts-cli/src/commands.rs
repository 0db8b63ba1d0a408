//! Client subcommands, each a short exchange with the daemon.

use std::collections::BTreeSet;

use anyhow::{Context, Result, bail};
use tokio::signal;
use tracing::{debug, info};

use shortcut_manager::{
    Client, EngineConfig, Event, EventKind, IPCConnection, IPCResponse, Shortcut,
    ShortcutsDictionary,
};

use crate::{Args, Command, SettingCommand};

/// Run a client subcommand, returning the process exit code
pub async fn run(args: &Args, config: &EngineConfig) -> Result<i32> {
    let mut connection = connect(args, config).await?;

    match &args.command {
        Command::Daemon => bail!("the daemon runs without a client connection"),
        Command::List { json } => {
            let shortcuts = connection
                .list_shortcuts()
                .await
                .context("Failed to list shortcuts")?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&shortcuts)?);
            } else {
                let running: BTreeSet<String> = connection.running().await?.into_iter().collect();
                print_shortcuts(&shortcuts, &running);
            }
        }
        Command::Add {
            name,
            cmd,
            id,
            app,
            hooks,
        } => {
            let shortcuts = connection.list_shortcuts().await?;
            let mut shortcut = Shortcut::script(name.clone(), cmd.clone())
                .with_position(shortcuts.next_position())
                .with_hooks(hooks.iter());
            if let Some(id) = id {
                shortcut = shortcut.with_id(id.clone());
            }
            if *app {
                shortcut = shortcut.app();
            }
            let id = shortcut.id.clone();
            connection
                .add_shortcut(shortcut)
                .await
                .context("Failed to add shortcut")?;
            println!("{id}");
        }
        Command::Edit {
            id,
            name,
            cmd,
            app,
            hooks,
            clear_hooks,
        } => {
            let shortcuts = connection.list_shortcuts().await?;
            let mut shortcut = shortcuts
                .get(id)
                .cloned()
                .with_context(|| format!("No shortcut with id {id}"))?;
            if let Some(name) = name {
                shortcut.name = name.clone();
            }
            if let Some(cmd) = cmd {
                shortcut.cmd = cmd.clone();
            }
            if let Some(app) = app {
                shortcut.is_app = *app;
            }
            if *clear_hooks {
                shortcut.hooks.clear();
            } else if !hooks.is_empty() {
                shortcut.hooks = hooks.clone();
            }
            connection
                .mod_shortcut(shortcut)
                .await
                .context("Failed to update shortcut")?;
        }
        Command::Remove { id } => {
            connection
                .remove_shortcut(id)
                .await
                .context("Failed to remove shortcut")?;
        }
        Command::Move { id, index } => {
            let mut shortcuts = connection.list_shortcuts().await?;
            if !shortcuts.move_to(id, *index) {
                bail!("No shortcut with id {id}");
            }
            connection
                .set_shortcuts(shortcuts)
                .await
                .context("Failed to reorder shortcuts")?;
        }
        Command::Launch { id, flags, wait } => {
            if *wait {
                connection.subscribe(id).await?;
            }
            let pid = connection
                .launch(id, flags.clone())
                .await
                .with_context(|| format!("Failed to launch {id}"))?;
            info!("Launched {} (pid {})", id, pid);
            if *wait {
                return wait_for_stop(&mut connection, id).await;
            }
        }
        Command::Kill { id } => {
            connection
                .kill(id)
                .await
                .with_context(|| format!("Failed to kill {id}"))?;
        }
        Command::Status { id: Some(id) } => {
            let running = connection.is_running(id).await?;
            println!("{}", if running { "running" } else { "idle" });
            return Ok(if running { 0 } else { 1 });
        }
        Command::Status { id: None } => {
            for id in connection.running().await? {
                println!("{id}");
            }
        }
        Command::Watch { ids, json } => watch(&mut connection, ids, *json).await?,
        Command::Setting { action } => match action {
            SettingCommand::Get { key } => {
                let value = connection.get_setting(key, None).await?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            SettingCommand::Set { key, value } => {
                let value = serde_json::from_str(value)
                    .unwrap_or_else(|_| serde_json::Value::String(value.clone()));
                connection.set_setting(key, value).await?;
            }
        },
        Command::AppEnded { id, status } => {
            if !connection.app_ended(id, *status).await? {
                debug!("No running app was waiting for {}", id);
            }
        }
        Command::Log { message, level } => connection.log(level, message).await?,
        Command::Shutdown => connection.shutdown().await.context("Failed to stop daemon")?,
    }
    Ok(0)
}

async fn connect(args: &Args, config: &EngineConfig) -> Result<IPCConnection> {
    let mut client = Client::new_with_socket(&config.socket_path);
    if !args.no_spawn {
        let mut daemon_args = vec![
            "--socket".to_string(),
            config.socket_path.display().to_string(),
        ];
        if let Some(path) = &args.config {
            daemon_args.push("--config".to_string());
            daemon_args.push(path.display().to_string());
        }
        client = client.with_auto_spawn_server(daemon_args);
    }
    let client = client
        .connect()
        .await
        .context("Failed to connect to shortcuts daemon")?;
    if let Some(pid) = client.server_pid() {
        info!("Started daemon (PID: {})", pid);
    }
    Ok(client.into_connection()?)
}

fn print_shortcuts(shortcuts: &ShortcutsDictionary, running: &BTreeSet<String>) {
    for (index, shortcut) in shortcuts.ordered().into_iter().enumerate() {
        let mut tags = Vec::new();
        if shortcut.is_app {
            tags.push("app".to_string());
        }
        if running.contains(&shortcut.id) {
            tags.push("running".to_string());
        }
        if !shortcut.hooks.is_empty() {
            tags.push(format!("hooks: {}", shortcut.hooks.join(", ")));
        }
        let tags = if tags.is_empty() {
            String::new()
        } else {
            format!(" ({})", tags.join("; "))
        };
        println!("{index:>3}  {}  {}{tags}", shortcut.id, shortcut.name);
        println!("     $ {}", shortcut.cmd);
    }
}

/// The message shown when a run ends
fn outcome(kind: &EventKind) -> Option<&'static str> {
    match kind {
        EventKind::End { status: 0 } => Some("Shortcut execution finished."),
        EventKind::End { .. } | EventKind::Killed => Some("Shortcut execution was canceled."),
        EventKind::LaunchFailed { .. } => Some("Shortcut failed. Check the command."),
        EventKind::Started { .. } => None,
    }
}

fn describe(event: &Event) -> String {
    match &event.kind {
        EventKind::Started { pid } => format!("{}: started (pid {pid})", event.shortcut_id),
        EventKind::LaunchFailed { reason } => {
            format!("{}: launch failed: {reason}", event.shortcut_id)
        }
        EventKind::End { status } => format!("{}: ended with status {status}", event.shortcut_id),
        EventKind::Killed => format!("{}: killed", event.shortcut_id),
    }
}

/// Exit code for a finished run: the status for `end`, 130 for `killed`
fn exit_code(kind: &EventKind) -> i32 {
    match kind {
        EventKind::End { status } if *status >= 0 => *status,
        EventKind::End { status } => 128 - status,
        EventKind::Killed => 130,
        _ => 1,
    }
}

async fn wait_for_stop(connection: &mut IPCConnection, id: &str) -> Result<i32> {
    loop {
        let push = tokio::select! {
            push = connection.recv_event() => Some(push.context("Lost connection to daemon")?),
            _ = signal::ctrl_c() => None,
        };
        match push {
            Some(IPCResponse::Event(event)) if event.shortcut_id == id && event.is_stop() => {
                if let Some(message) = outcome(&event.kind) {
                    eprintln!("{message}");
                }
                return Ok(exit_code(&event.kind));
            }
            Some(other) => debug!("Ignoring {:?}", other),
            None => {
                info!("Interrupted, killing {}", id);
                connection
                    .kill(id)
                    .await
                    .with_context(|| format!("Failed to kill {id}"))?;
            }
        }
    }
}

async fn watch(connection: &mut IPCConnection, ids: &[String], json: bool) -> Result<()> {
    let ids = if ids.is_empty() {
        connection.list_shortcuts().await?.iter().map(|s| s.id.clone()).collect()
    } else {
        ids.to_vec()
    };
    for id in &ids {
        connection.subscribe(id).await?;
    }
    info!("Watching {} shortcut(s)", ids.len());

    loop {
        tokio::select! {
            push = connection.recv_event() => {
                let push = push.context("Lost connection to daemon")?;
                if json {
                    println!("{}", serde_json::to_string(&push)?);
                    continue;
                }
                match push {
                    IPCResponse::Event(event) => {
                        println!("{}", describe(&event));
                        if let Some(message) = outcome(&event.kind) {
                            println!("  {message}");
                        }
                    }
                    IPCResponse::Toast { title, message } => println!("[{title}] {message}"),
                    other => debug!("Ignoring {:?}", other),
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                return Ok(());
            }
        }
    }
}
