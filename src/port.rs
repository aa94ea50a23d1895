use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PortError {
    #[error("Timed out waiting for port {0} to be opened.")]
    TimedOut(u16),
    #[error("Process died before port {0} was opened.")]
    ProcessDied(u16),
}

/// Anything whose liveness can be polled while waiting for it to open a port.
pub trait ProcessLiveness {
    fn is_alive(&mut self) -> bool;
}

impl ProcessLiveness for tokio::process::Child {
    fn is_alive(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }
}

/// Find a port that is available to listen on locally.
pub async fn find_open_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    Ok(listener.local_addr()?.port())
}

/// Whether something accepts TCP connections on the given local port.
pub async fn is_port_open(port: u16) -> bool {
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect(address).await.is_ok()
}

/// Poll every 100 ms until `port` accepts connections, failing if `timeout`
/// elapses first or the process exits before the port opens.
#[tracing::instrument(name = "Waiting for port to open", skip(process))]
pub async fn wait_for_port_open<P>(
    port: u16,
    timeout: Duration,
    process: &mut P,
) -> Result<(), PortError>
where
    P: ProcessLiveness + ?Sized,
{
    let wait_until = Instant::now() + timeout;

    while Instant::now() < wait_until {
        tokio::time::sleep(POLL_INTERVAL).await;
        if !process.is_alive() {
            return Err(PortError::ProcessDied(port));
        }
        if is_port_open(port).await {
            tracing::debug!("Port {} is open", port);
            return Ok(());
        }
    }

    Err(PortError::TimedOut(port))
}
