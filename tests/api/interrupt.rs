// Sends real signals and inspects `/proc`.
#![cfg(target_os = "linux")]

use crate::helpers::{init_tracing, read_pid_file};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

#[tokio::test]
async fn ctrl_c_during_startup_stops_forks_and_exits_with_130() {
    init_tracing();
    let directory = std::env::temp_dir().join(format!("execfork-{}", uuid::Uuid::new_v4()));
    let pid_file = directory.join("fork.pid");
    std::fs::create_dir_all(directory.join("configuration")).unwrap();
    let base = format!(
        r#"
probe:
  url: "http://127.0.0.1:9/"
  expected_body: "PING"
  connect_timeout_milliseconds: 1000
  socket_timeout_milliseconds: 1000
forks:
  - name: startSleeper
    command:
      kind: exec
      executable: sh
      args: ["-c", "echo $$ > '{}'; exec sleep 60"]
    wait_for_output: "never printed"
"#,
        pid_file.display()
    );
    std::fs::write(directory.join("configuration").join("base.yaml"), base).unwrap();

    let mut execfork = tokio::process::Command::new(env!("CARGO_BIN_EXE_execfork"))
        .current_dir(&directory)
        .env("APP_ENVIRONMENT", "local")
        .stdout(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to launch execfork.");
    let fork_pid = read_pid_file(&pid_file).await;
    let execfork_pid = execfork.id().unwrap() as i32;

    // SAFETY: `kill` takes plain integers and touches no memory of ours.
    assert_eq!(unsafe { libc::kill(execfork_pid, libc::SIGINT) }, 0);
    let status = tokio::time::timeout(Duration::from_secs(30), execfork.wait())
        .await
        .expect("execfork did not exit after Ctrl-C.")
        .unwrap();

    assert_eq!(status.code(), Some(130));
    assert!(
        !Path::new(&format!("/proc/{}", fork_pid)).exists(),
        "fork {} outlived execfork",
        fork_pid
    );
}
