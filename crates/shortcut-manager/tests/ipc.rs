use shortcut_manager::{
    Client, EngineConfig, Event, EventKind, IPCConnection, IPCResponse, Server, Shortcut,
};
use std::path::Path;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn connect(socket: &Path) -> IPCConnection {
    for _ in 0..100 {
        if let Ok(client) = Client::new_with_socket(socket).connect().await {
            return client.into_connection().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server did not come up");
}

async fn next_push(connection: &mut IPCConnection) -> IPCResponse {
    timeout(WAIT, connection.recv_event())
        .await
        .expect("timed out waiting for push")
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_add_launch_observe_and_query() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("shortcuts.sock");
    let config = EngineConfig::default()
        .with_socket_path(&socket)
        .with_store_path(dir.path().join("store.json"));
    let server = tokio::spawn(Server::new(config).run());

    let mut connection = connect(&socket).await;

    let shortcut = Shortcut::script("Nap", "sleep 0.2").with_id("s1");
    let shortcuts = connection.add_shortcut(shortcut.clone()).await.unwrap();
    assert_eq!(shortcuts.get("s1"), Some(&shortcut));
    assert_eq!(connection.list_shortcuts().await.unwrap(), shortcuts);

    connection.subscribe("s1").await.unwrap();
    let pid = connection.launch("s1", Vec::new()).await.unwrap();
    assert!(pid > 0);
    assert!(connection.is_running("s1").await.unwrap());
    assert_eq!(connection.running().await.unwrap(), vec!["s1".to_string()]);

    // A second launch is refused while the first is still running
    assert!(connection.launch("s1", Vec::new()).await.is_err());

    assert_eq!(
        next_push(&mut connection).await,
        IPCResponse::Event(Event::new("s1", EventKind::Started { pid }))
    );
    assert_eq!(
        next_push(&mut connection).await,
        IPCResponse::Event(Event::new("s1", EventKind::End { status: 0 }))
    );
    assert!(!connection.is_running("s1").await.unwrap());

    connection.shutdown().await.unwrap();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failures_are_reported_and_toasted() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("shortcuts.sock");
    let config = EngineConfig::default()
        .with_socket_path(&socket)
        .with_store_path(dir.path().join("store.json"));
    let server = tokio::spawn(Server::new(config).run());

    let mut connection = connect(&socket).await;

    assert!(connection.launch("missing", Vec::new()).await.is_err());
    assert!(connection.kill("missing").await.is_err());
    assert_eq!(
        next_push(&mut connection).await,
        IPCResponse::Toast {
            title: "Error".to_string(),
            message: "Failed to kill shortcut.".to_string(),
        }
    );

    let hooked = Shortcut::script("Hooked", "true")
        .with_id("h1")
        .with_hooks(["undefined"]);
    connection.add_shortcut(hooked).await.unwrap();
    connection.subscribe("h1").await.unwrap();
    assert!(connection.launch("h1", Vec::new()).await.is_err());

    let mut failed = false;
    let mut toasted = false;
    while !(failed && toasted) {
        match next_push(&mut connection).await {
            IPCResponse::Event(event) => {
                assert!(matches!(event.kind, EventKind::LaunchFailed { .. }));
                failed = true;
            }
            IPCResponse::Toast { message, .. } => {
                assert_eq!(message, "Shortcut failed. Check the command.");
                toasted = true;
            }
            other => panic!("unexpected push {other:?}"),
        }
    }

    connection.shutdown().await.unwrap();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_app_ended_and_settings_over_ipc() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("shortcuts.sock");
    let config = EngineConfig::default()
        .with_socket_path(&socket)
        .with_store_path(dir.path().join("store.json"));
    let server = tokio::spawn(Server::new(config).run());

    let mut connection = connect(&socket).await;

    connection
        .set_setting("theme", serde_json::json!("dark"))
        .await
        .unwrap();
    assert_eq!(
        connection.get_setting("theme", None).await.unwrap(),
        serde_json::json!("dark")
    );
    assert_eq!(
        connection
            .get_setting("unset", Some(serde_json::json!(7)))
            .await
            .unwrap(),
        serde_json::json!(7)
    );

    let game = Shortcut::script("Game", "true").with_id("g1").app();
    connection.add_shortcut(game).await.unwrap();
    connection.subscribe("g1").await.unwrap();
    connection.launch("g1", Vec::new()).await.unwrap();
    assert!(matches!(
        next_push(&mut connection).await,
        IPCResponse::Event(Event {
            kind: EventKind::Started { .. },
            ..
        })
    ));
    assert!(connection.is_running("g1").await.unwrap());

    assert!(connection.app_ended("g1", 0).await.unwrap());
    assert_eq!(
        next_push(&mut connection).await,
        IPCResponse::Event(Event::new("g1", EventKind::End { status: 0 }))
    );
    connection.log("info", "front end says hi").await.unwrap();

    connection.shutdown().await.unwrap();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}
