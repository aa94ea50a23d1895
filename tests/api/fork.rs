use crate::helpers::{
    SERVER_STARTED, assert_port_closes, init_tracing, probe_settings, test_server, variable,
};
use execfork::fork::{ForkError, ForkedProcess};
use execfork::port::{PortError, find_open_port, is_port_open};
use execfork::probe::PingProbe;
use std::time::{Duration, Instant};

#[tokio::test]
async fn forked_server_is_ready_and_probed_until_stopped() {
    init_tracing();
    let port = find_open_port().await.unwrap();
    let settings = test_server("startPingServer", port);

    let mut fork = ForkedProcess::start(&settings)
        .await
        .expect("Failed to start the test server.");

    assert!(is_port_open(port).await);
    assert!(fork.is_running());
    let probe = PingProbe::new(&probe_settings(port)).unwrap();
    probe.check().await.expect("The forked server did not answer PING.");

    assert_eq!(fork.stop_name(), "stopPingServer");
    fork.stop().await;
    assert!(!fork.is_running());
    assert_port_closes(port).await;
}

#[tokio::test]
async fn start_waits_for_a_slow_server() {
    init_tracing();
    let port = find_open_port().await.unwrap();
    let mut settings = test_server("runSlowServer", port);
    settings
        .environment
        .push(variable("STARTUP_DELAY_MILLISECONDS", "500"));

    let mut fork = ForkedProcess::start(&settings).await.unwrap();

    assert!(is_port_open(port).await);
    fork.stop().await;
}

#[tokio::test]
async fn start_fails_when_the_port_never_opens() {
    init_tracing();
    let port = find_open_port().await.unwrap();
    let other_port = find_open_port().await.unwrap();
    let mut settings = test_server("startServer", port);
    settings.wait_for_output = Some(SERVER_STARTED.into());
    settings.wait_for_port = Some(other_port);
    settings.timeout_seconds = 1;

    let outcome = ForkedProcess::start(&settings).await;

    match outcome {
        Err(ForkError::PortNotReady { name, source }) => {
            assert_eq!(name, "startServer");
            assert_eq!(source, PortError::TimedOut(other_port));
        }
        other => panic!("Unexpected outcome: {:?}", other),
    }
    // The server that did start was stopped again
    assert_port_closes(port).await;
}

#[tokio::test]
async fn mismatching_server_is_reported_as_an_assertion_failure() {
    init_tracing();
    let port = find_open_port().await.unwrap();
    let mut settings = test_server("execPongServer", port);
    settings.environment.push(variable("RESPONSE_BODY", "PONG\n"));

    let mut fork = ForkedProcess::start(&settings).await.unwrap();
    let outcome = PingProbe::new(&probe_settings(port)).unwrap().check().await;
    fork.stop().await;

    assert!(outcome.unwrap_err().is_assertion_failure());
}

#[tokio::test]
async fn standard_output_file_receives_the_announcement() {
    init_tracing();
    let port = find_open_port().await.unwrap();
    let output = std::env::temp_dir()
        .join(format!("execfork-{}", uuid::Uuid::new_v4()))
        .join("server.log");
    let mut settings = test_server("startLoggedServer", port);
    settings.standard_output = Some(output.clone());

    let mut fork = ForkedProcess::start(&settings).await.unwrap();
    fork.stop().await;

    let contents = std::fs::read_to_string(&output).unwrap();
    assert!(contents.contains(SERVER_STARTED));
    assert!(contents.contains(&format!("127.0.0.1:{}", port)));
}

#[tokio::test]
async fn silent_forked_server_times_out_the_ping_check() {
    init_tracing();
    let port = find_open_port().await.unwrap();
    let mut settings = test_server("startSilentServer", port);
    settings.environment.push(variable("SILENT", "1"));

    let mut fork = ForkedProcess::start(&settings).await.unwrap();
    let started = Instant::now();
    let outcome = PingProbe::new(&probe_settings(port)).unwrap().check().await;
    let elapsed = started.elapsed();
    fork.stop().await;

    assert!(outcome.unwrap_err().is_transport());
    assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);
    assert_port_closes(port).await;
}
