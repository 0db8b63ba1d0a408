//! A client that starts its own daemon when none is listening.
//!
//! Run without arguments; the example re-executes itself with `--server` to
//! host the daemon.

use shortcut_manager::{Client, EngineConfig, IPCResponse, Server, Shortcut};
use std::env;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const SOCKET_PATH: &str = "/tmp/shortcut-manager-example.sock";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().without_time())
        .with(EnvFilter::from_default_env().add_directive("shortcut_manager=info".parse()?))
        .init();

    let dir = env::temp_dir().join("shortcut-manager-example");
    if env::args().nth(1).as_deref() == Some("--server") {
        let config = EngineConfig::default()
            .with_socket_path(SOCKET_PATH)
            .with_store_path(dir.join("store.json"));
        Server::new(config).run().await?;
        return Ok(());
    }

    let mut client = Client::new_with_socket(SOCKET_PATH)
        .with_server_command(env::current_exe()?, ["--server"])
        .with_server_startup_timeout(Duration::from_millis(1000))
        .connect()
        .await?;
    info!("Connected to server (PID: {:?})", client.server_pid());

    let connection = client.connection()?;
    let hello = Shortcut::script("Hello", "echo hello; sleep 0.5");
    connection.add_shortcut(hello.clone()).await?;
    connection.subscribe(&hello.id).await?;
    let pid = connection.launch(&hello.id, Vec::new()).await?;
    println!("Launched {} as pid {pid}", hello.name);

    loop {
        match connection.recv_event().await? {
            IPCResponse::Event(event) => {
                println!("{:?}", event.kind);
                if event.is_stop() {
                    break;
                }
            }
            IPCResponse::Toast { title, message } => println!("[{title}] {message}"),
            other => println!("Received: {other:?}"),
        }
    }

    connection.remove_shortcut(&hello.id).await?;
    client.disconnect(true).await?;
    println!("Done!");
    Ok(())
}
