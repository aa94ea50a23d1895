use crate::helpers::{init_tracing, probe_settings, spawn_silent_server};
use execfork::port::find_open_port;
use execfork::probe::{PingProbe, ProbeError};
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn probe_against_body(body: &str) -> Result<(), ProbeError> {
    init_tracing();
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&mock_server)
        .await;
    let port = mock_server.address().port();

    PingProbe::new(&probe_settings(port))
        .expect("Failed to build the probe.")
        .check()
        .await
}

#[tokio::test]
async fn probe_passes_when_the_server_answers_ping() {
    for body in ["PING", "PING\n", "\t PING \r\n"] {
        let outcome = probe_against_body(body).await;

        assert!(outcome.is_ok(), "body {:?} was rejected: {:?}", body, outcome);
    }
}

#[tokio::test]
async fn probe_reports_a_mismatch_for_any_other_body() {
    for body in ["ping", "PONG", "", "PING PING"] {
        let error = probe_against_body(body).await.unwrap_err();

        assert!(error.is_assertion_failure(), "body {:?}: {:?}", body, error);
        assert_eq!(
            error.to_string(),
            format!(
                "Expected the response body to be \"PING\", but it was {:?}.",
                body.trim()
            )
        );
    }
}

#[tokio::test]
async fn probe_fails_with_a_transport_error_when_nothing_listens() {
    init_tracing();
    let port = find_open_port().await.unwrap();
    let probe = PingProbe::new(&probe_settings(port)).unwrap();

    let started = Instant::now();
    let error = probe.check().await.unwrap_err();

    assert!(error.is_transport(), "{:?}", error);
    assert!(!error.is_assertion_failure());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn probe_fails_with_a_transport_error_when_the_server_never_responds() {
    init_tracing();
    let port = spawn_silent_server().await;
    let probe = PingProbe::new(&probe_settings(port)).unwrap();

    let started = Instant::now();
    let error = probe.check().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(error.is_transport(), "{:?}", error);
    assert!(elapsed >= Duration::from_millis(900), "gave up after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "gave up after {:?}", elapsed);
}

#[tokio::test]
async fn probe_honours_a_configured_socket_timeout() {
    init_tracing();
    let port = spawn_silent_server().await;
    let mut settings = probe_settings(port);
    settings.socket_timeout_milliseconds = 200;
    let probe = PingProbe::new(&settings).unwrap();

    let started = Instant::now();
    let error = probe.check().await.unwrap_err();

    assert!(error.is_transport());
    assert!(started.elapsed() < Duration::from_millis(900));
}
