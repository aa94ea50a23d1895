use crate::configuration::{CommandSettings, ForkSettings};
use crate::naming::stop_name_for;
use crate::pipe::{LogWriter, OutputPipe, PipeError};
use crate::port::{PortError, ProcessLiveness, wait_for_port_open};
use crate::telemetry::error_chain_fmt;
use reqwest::Url;
use std::ffi::OsString;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tempfile::TempPath;
use tokio::io::AsyncWrite;
use tokio::process::{Child, Command};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// How long a process gets to exit after each stop request.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(15);
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type OutputSink = Box<dyn AsyncWrite + Unpin + Send>;

#[derive(thiserror::Error)]
pub enum ForkError {
    #[error("Failed to prepare the environment of `{name}`.")]
    Prepare {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("The command line of `{name}` is {length} characters long, over the limit of {limit}.")]
    CommandLineTooLong {
        name: String,
        length: usize,
        limit: usize,
    },
    #[error("Failed to launch `{name}`.")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("`{name}` did not produce its expected output.")]
    OutputNotReady {
        name: String,
        #[source]
        source: PipeError,
    },
    #[error("`{name}` did not open its port.")]
    PortNotReady {
        name: String,
        #[source]
        source: PortError,
    },
}

impl std::fmt::Debug for ForkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// A process launched in the background, kept alive until [`ForkedProcess::stop`].
pub struct ForkedProcess {
    name: String,
    child: Child,
    force_kill: bool,
    kill_descendants: bool,
    stdout: OutputPipe,
    stderr: OutputPipe,
    errors_merged: bool,
    pathing_jar: Option<TempPath>,
    stopped: bool,
}

impl std::fmt::Debug for ForkedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkedProcess")
            .field("name", &self.name)
            .field("pid", &self.child.id())
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl ForkedProcess {
    /// Launch the configured process and wait until it is ready: its output
    /// patterns have appeared and its port accepts connections.
    ///
    /// A process that fails to become ready is stopped before the error is
    /// returned.
    #[tracing::instrument(name = "Starting fork", skip(settings), fields(fork = %settings.name))]
    pub async fn start(settings: &ForkSettings) -> Result<Self, ForkError> {
        let mut fork = Self::spawn(settings).await?;
        if let Err(e) = fork.wait_until_ready(settings).await {
            fork.stop_unready(&e).await;
            return Err(e);
        }
        Ok(fork)
    }

    /// Launch the configured process without waiting for it to become ready.
    pub async fn spawn(settings: &ForkSettings) -> Result<Self, ForkError> {
        let name = settings.name.clone();
        let ProcessArgs { args, pathing_jar } = process_args(settings)?;

        let mut command = Command::new(&args[0]);
        command
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(working_dir) = &settings.working_dir {
            tokio::fs::create_dir_all(working_dir)
                .await
                .map_err(|source| ForkError::Prepare {
                    name: name.clone(),
                    source,
                })?;
            command.current_dir(working_dir);
        }
        for variable in &settings.environment {
            command.env(&variable.name, &variable.value);
        }
        if settings.kill_descendants {
            lead_own_process_group(&mut command);
        }

        tracing::info!("Running process: `{}`", args.join(" "));
        let mut child = command.spawn().map_err(|source| ForkError::Spawn {
            name: name.clone(),
            source,
        })?;

        let (stdout, stderr, errors_merged) = match install_pipes(&mut child, settings).await {
            Ok(pipes) => pipes,
            Err(source) => {
                let _ = child.start_kill();
                return Err(ForkError::Prepare { name, source });
            }
        };

        Ok(Self {
            name,
            child,
            force_kill: settings.force_kill,
            kill_descendants: settings.kill_descendants,
            stdout,
            stderr,
            errors_merged,
            pathing_jar,
            stopped: false,
        })
    }

    /// Stop a fork that did not become ready, logging why.
    pub async fn stop_unready(&mut self, reason: &(dyn std::error::Error + 'static)) {
        tracing::error!(
            error.cause_chain = ?reason,
            error.message = %reason,
            "Fork `{}` did not become ready, stopping it",
            self.name,
        );
        self.stop().await;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the action stopping this fork, e.g. `stopServer` for `startServer`.
    pub fn stop_name(&self) -> String {
        stop_name_for(&self.name)
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn is_running(&mut self) -> bool {
        self.child.is_alive()
    }

    /// Wait for the output patterns, then for the port, each bounded by the
    /// configured timeout.
    pub async fn wait_until_ready(&mut self, settings: &ForkSettings) -> Result<(), ForkError> {
        let timeout = settings.timeout();

        if self.errors_merged {
            wait_for_merged_pattern(&mut self.stdout, &mut self.stderr, timeout)
                .await
                .map_err(|source| self.output_not_ready(source))?;
        } else {
            self.stderr
                .wait_for_pattern_timeout(timeout)
                .await
                .map_err(|source| self.output_not_ready(source))?;
            self.stdout
                .wait_for_pattern_timeout(timeout)
                .await
                .map_err(|source| self.output_not_ready(source))?;
        }

        if let Some(port) = settings.wait_for_port {
            wait_for_port_open(port, timeout, &mut self.child)
                .await
                .map_err(|source| ForkError::PortNotReady {
                    name: self.name.clone(),
                    source,
                })?;
        }
        tracing::info!(pid = ?self.id(), "Fork `{}` is ready", self.name);
        Ok(())
    }

    fn output_not_ready(&self, source: PipeError) -> ForkError {
        ForkError::OutputNotReady {
            name: self.name.clone(),
            source,
        }
    }

    /// Stop the process and, unless disabled, its descendants. Calling this
    /// more than once is harmless.
    #[tracing::instrument(
        name = "Stopping fork",
        skip(self),
        fields(fork = %self.name, stop_name = %self.stop_name())
    )]
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if self.kill_descendants {
            if let Err(e) = self.stop_descendants() {
                tracing::warn!(
                    error.cause_chain = ?e,
                    error.message = %e,
                    "Failed to stop descendants.",
                );
            }
        }
        self.stop_root_process().await;
        self.drain_pipes().await;

        if let Some(jar) = self.pathing_jar.take() {
            if let Err(e) = jar.close() {
                tracing::warn!(error.message = %e, "Failed to delete the classpath jar.");
            }
        }
    }

    #[cfg(unix)]
    fn stop_descendants(&mut self) -> io::Result<()> {
        if !self.child.is_alive() {
            return Ok(());
        }
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let signal = if self.force_kill {
            libc::SIGKILL
        } else {
            libc::SIGTERM
        };
        // The child leads its own process group, so a negative pid reaches
        // every descendant that stayed in it.
        send_signal(-(pid as i32), signal)
    }

    #[cfg(not(unix))]
    fn stop_descendants(&mut self) -> io::Result<()> {
        tracing::warn!("Stopping descendants is not supported on this platform.");
        Ok(())
    }

    async fn stop_root_process(&mut self) {
        if self.child.is_alive() && !self.force_kill {
            if let Err(e) = self.terminate() {
                tracing::warn!(error.message = %e, "Failed to request termination.");
            }
            self.wait_for_exit().await;
        }
        if self.child.is_alive() {
            if let Err(e) = self.child.start_kill() {
                tracing::warn!(error.message = %e, "Failed to kill the process.");
            }
            self.wait_for_exit().await;
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        match self.child.id() {
            Some(pid) => send_signal(pid as i32, libc::SIGTERM),
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait_for_exit(&mut self) -> Option<ExitStatus> {
        match tokio::time::timeout(STOP_GRACE_PERIOD, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(%status, "Process exited");
                Some(status)
            }
            Ok(Err(e)) => {
                tracing::warn!(error.message = %e, "Failed to wait for the process to exit.");
                None
            }
            Err(_) => {
                tracing::warn!(
                    "Process did not exit within {} seconds.",
                    STOP_GRACE_PERIOD.as_secs()
                );
                None
            }
        }
    }

    async fn drain_pipes(&mut self) {
        // Swap in finished placeholders so the real pipes can be consumed
        let stdout = std::mem::replace(&mut self.stdout, closed_pipe("stdout"));
        let stderr = std::mem::replace(&mut self.stderr, closed_pipe("stderr"));
        for pipe in [stdout, stderr] {
            if let Err(e) = pipe.finish_timeout(PIPE_DRAIN_TIMEOUT).await {
                tracing::warn!(error.cause_chain = ?e, error.message = %e, "Output was not fully copied.");
            }
        }
    }
}

// Descendants are found through the process group the child leads
#[cfg(unix)]
fn lead_own_process_group(command: &mut Command) {
    command.process_group(0);
}

#[cfg(not(unix))]
fn lead_own_process_group(_command: &mut Command) {}

#[cfg(unix)]
fn send_signal(pid: i32, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: `kill` takes plain integers and touches no memory of ours.
    let result = unsafe { libc::kill(pid, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn closed_pipe(stream: &'static str) -> OutputPipe {
    OutputPipe::spawn(stream, tokio::io::empty(), tokio::io::sink(), None)
}

/// With a shared sink, either stream may carry the output pattern. A stream
/// closing early only fails the wait once both have closed.
async fn wait_for_merged_pattern(
    stdout: &mut OutputPipe,
    stderr: &mut OutputPipe,
    timeout: Duration,
) -> Result<(), PipeError> {
    let pattern = stdout.pattern().unwrap_or_default().to_string();
    let closed_pattern = pattern.clone();
    let either = async move {
        tokio::select! {
            Ok(()) = stdout.wait_for_pattern() => Ok(()),
            Ok(()) = stderr.wait_for_pattern() => Ok(()),
            else => Err(PipeError::StreamClosed {
                stream: "stdout and stderr".into(),
                pattern: closed_pattern,
            }),
        }
    };
    match tokio::time::timeout(timeout, either).await {
        Ok(outcome) => outcome,
        Err(_) => Err(PipeError::TimedOut {
            stream: "stdout and stderr".into(),
            pattern,
        }),
    }
}

/// Start copying the child's output. Returns the stdout and stderr pipes,
/// and whether stderr shares the stdout sink.
async fn install_pipes(
    child: &mut Child,
    settings: &ForkSettings,
) -> io::Result<(OutputPipe, OutputPipe, bool)> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("standard output was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("error output was not captured"))?;

    let (stdout_sink, merged_stderr_sink): (OutputSink, OutputSink) =
        match &settings.standard_output {
            Some(path) => {
                let file = create_output_file(path).await?;
                let shared = file.try_clone().await?;
                (Box::new(file), Box::new(shared))
            }
            None => (
                Box::new(LogWriter::new(&settings.name, "stdout")),
                Box::new(LogWriter::new(&settings.name, "stderr")),
            ),
        };
    let stdout_pipe = OutputPipe::spawn(
        "stdout",
        stdout,
        stdout_sink,
        settings.wait_for_output.clone(),
    );

    let (stderr_pipe, errors_merged) = match &settings.error_output {
        Some(path) => {
            let file = create_output_file(path).await?;
            let pipe = OutputPipe::spawn("stderr", stderr, file, settings.wait_for_error.clone());
            (pipe, false)
        }
        None => {
            let pipe = OutputPipe::spawn(
                "stderr",
                stderr,
                merged_stderr_sink,
                settings.wait_for_output.clone(),
            );
            (pipe, true)
        }
    };

    Ok((stdout_pipe, stderr_pipe, errors_merged))
}

async fn create_output_file(path: &Path) -> io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::File::create(path).await
}

/// Command line of a fork, executable first.
pub struct ProcessArgs {
    pub args: Vec<String>,
    /// Jar carrying the classpath when it did not fit on the command line.
    /// Deleted when dropped.
    pub pathing_jar: Option<TempPath>,
}

pub fn process_args(settings: &ForkSettings) -> Result<ProcessArgs, ForkError> {
    let mut pathing_jar = None;
    let args = match &settings.command {
        CommandSettings::Exec { executable, args } => std::iter::once(executable.clone())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>(),
        CommandSettings::Java {
            main_class,
            classpath,
            jvm_args,
            args,
            java_home,
        } => {
            let prepare_error = |source| ForkError::Prepare {
                name: settings.name.clone(),
                source,
            };
            let joined_classpath = std::env::join_paths(classpath)
                .map_err(|e| prepare_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
            let mut process_args = vec![
                java_executable(java_home.as_deref()),
                "-cp".to_string(),
                joined_classpath.to_string_lossy().into_owned(),
            ];
            process_args.extend(jvm_args.iter().cloned());
            process_args.push(main_class.clone());
            process_args.extend(args.iter().cloned());

            if command_line_length(&process_args) > max_command_line_length() {
                let jar = write_pathing_jar(classpath).map_err(prepare_error)?;
                tracing::info!(
                    "Classpath of `{}` moved to `{}`",
                    settings.name,
                    jar.display()
                );
                process_args[2] = jar.to_string_lossy().into_owned();
                pathing_jar = Some(jar);
            }
            process_args
        }
    };

    let length = command_line_length(&args);
    let limit = max_command_line_length();
    if length > limit {
        return Err(ForkError::CommandLineTooLong {
            name: settings.name.clone(),
            length,
            limit,
        });
    }
    Ok(ProcessArgs { args, pathing_jar })
}

fn command_line_length(args: &[String]) -> usize {
    args.join(" ").len()
}

/// Write an otherwise empty jar whose manifest `Class-Path` lists every
/// classpath entry as a file URL.
fn write_pathing_jar(classpath: &[PathBuf]) -> io::Result<TempPath> {
    let urls = classpath
        .iter()
        .map(|entry| class_path_url(entry))
        .collect::<io::Result<Vec<_>>>()?;

    let (file, path) = tempfile::Builder::new()
        .prefix("execfork-classpath")
        .suffix(".jar")
        .tempfile()?
        .into_parts();
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let mut jar = ZipWriter::new(file);
    jar.add_directory("META-INF/", options)
        .map_err(io::Error::other)?;
    jar.start_file("META-INF/MANIFEST.MF", options)
        .map_err(io::Error::other)?;
    jar.write_all(manifest(&urls).as_bytes())?;
    jar.finish().map_err(io::Error::other)?;
    Ok(path)
}

fn class_path_url(entry: &Path) -> io::Result<String> {
    let absolute = std::path::absolute(entry)?;
    let url = if absolute.is_dir() {
        Url::from_directory_path(&absolute)
    } else {
        Url::from_file_path(&absolute)
    };
    url.map(String::from).map_err(|()| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("`{}` cannot be expressed as a file URL.", entry.display()),
        )
    })
}

// Manifest lines hold at most 72 bytes; longer values continue on lines
// starting with a space.
const MANIFEST_LINE_WIDTH: usize = 72;

fn manifest(class_path: &[String]) -> String {
    let mut manifest = String::new();
    for header in [
        "Manifest-Version: 1.0".to_string(),
        format!("Class-Path: {}", class_path.join(" ")),
    ] {
        let mut width = 0;
        for c in header.chars() {
            if width + c.len_utf8() > MANIFEST_LINE_WIDTH {
                manifest.push_str("\r\n ");
                width = 1;
            }
            manifest.push(c);
            width += c.len_utf8();
        }
        manifest.push_str("\r\n");
    }
    manifest.push_str("\r\n");
    manifest
}

fn java_executable(java_home: Option<&Path>) -> String {
    resolve_java_executable(java_home, std::env::var_os("JAVA_HOME"))
}

/// `<java_home>/bin/java`, then `$JAVA_HOME/bin/java`, then `java` from `PATH`.
fn resolve_java_executable(
    java_home: Option<&Path>,
    java_home_variable: Option<OsString>,
) -> String {
    let binary = if cfg!(windows) { "java.exe" } else { "java" };
    java_home
        .map(Path::to_path_buf)
        .or_else(|| java_home_variable.map(PathBuf::from))
        .map(|home| home.join("bin").join(binary).to_string_lossy().into_owned())
        .unwrap_or_else(|| binary.to_string())
}

// Windows: CreateProcess limit. Elsewhere: MAX_ARG_STRLEN from execve(2).
fn max_command_line_length() -> usize {
    if cfg!(windows) { 32767 } else { 131072 }
}
