use execfork::configuration::{
    CommandSettings, EnvironmentVariable, ForkSettings, ProbeSettings, Settings,
};
use execfork::telemetry::{get_subscriber, init_subscriber};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

pub const SERVER_STARTED: &str = "Server Started!";

// Ensure that the `tracing` stack is only initialised once using `LazyLock`
static TRACING: LazyLock<()> = LazyLock::new(|| {
    let default_filter_level = "info".to_string();
    let subscriber_name = "test".to_string();
    // The sink is part of the type returned by `get_subscriber`, hence the
    // two branches.
    if std::env::var("TEST_LOG").is_ok() {
        let subscriber = get_subscriber(subscriber_name, default_filter_level, std::io::stdout);
        init_subscriber(subscriber);
    } else {
        let subscriber = get_subscriber(subscriber_name, default_filter_level, std::io::sink);
        init_subscriber(subscriber);
    }
});

pub fn init_tracing() {
    LazyLock::force(&TRACING);
}

pub fn probe_settings(port: u16) -> ProbeSettings {
    ProbeSettings {
        url: format!("http://127.0.0.1:{}/", port),
        expected_body: "PING".into(),
        connect_timeout_milliseconds: 1000,
        socket_timeout_milliseconds: 1000,
    }
}

pub fn settings(port: u16, forks: Vec<ForkSettings>) -> Settings {
    Settings {
        probe: probe_settings(port),
        forks,
    }
}

/// A fork of the `spawn_test_server` fixture listening on `port`.
pub fn test_server(name: &str, port: u16) -> ForkSettings {
    let mut fork = ForkSettings::exec(name, env!("CARGO_BIN_EXE_spawn_test_server"));
    fork.command = CommandSettings::Exec {
        executable: env!("CARGO_BIN_EXE_spawn_test_server").into(),
        args: Vec::new(),
    };
    fork.environment = vec![variable("PORT", &port.to_string())];
    fork.wait_for_output = Some(SERVER_STARTED.into());
    fork.wait_for_port = Some(port);
    fork.timeout_seconds = 10;
    fork
}

pub fn variable(name: &str, value: &str) -> EnvironmentVariable {
    EnvironmentVariable {
        name: name.into(),
        value: value.into(),
    }
}

/// Accepts connections and reads requests, but never writes a response.
pub async fn spawn_silent_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind a silent server.");
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buffer = [0u8; 1024];
                while let Ok(read) = socket.read(&mut buffer).await {
                    if read == 0 {
                        break;
                    }
                }
            });
        }
    });
    port
}

pub async fn assert_port_closes(port: u16) {
    for _ in 0..50 {
        if !execfork::port::is_port_open(port).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("Port {} is still open.", port);
}

/// Wait for a process to write its pid to `path`.
pub async fn read_pid_file(path: &Path) -> u32 {
    for _ in 0..100 {
        if let Some(pid) = std::fs::read_to_string(path)
            .ok()
            .and_then(|contents| contents.trim().parse().ok())
        {
            return pid;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("No pid was written to {}.", path.display());
}
