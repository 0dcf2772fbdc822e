//! TCP reachability probing.
//!
//! A probe dials `host:port`, waits briefly for the peer to speak, and only
//! then runs a caller-supplied verification step. Conditions that are
//! expected while a machine boots (timeouts, refused or unreachable hosts,
//! permission errors from half-configured firewalls) count as "not yet"
//! rather than failures.

use std::future::Future;
use std::io::{self, ErrorKind};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::poll::Clock;

/// Default time allowed for connecting and for the peer to become readable.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default pause after a refused or unreachable connection.
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 2;

/// Errors that end probing.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// Connecting failed in a way that will not resolve by waiting.
    #[error("cannot reach {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The port never became reachable within the configured budget.
    #[error("{host}:{port} still unreachable after {attempts} attempts")]
    Unreachable { host: String, port: u16, attempts: u32 },

    /// The verification step after connecting failed.
    #[error(transparent)]
    Verify(#[from] anyhow::Error),
}

/// Probe timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Bound on connecting, and separately on waiting for the banner.
    pub connect_timeout: Duration,
    /// Pause after a refused or unreachable connection.
    pub retry_backoff: Duration,
    /// Give up [`wait_for_port`] after this long. `None` waits forever.
    pub budget: Option<Duration>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            retry_backoff: Duration::from_secs(DEFAULT_RETRY_BACKOFF_SECS),
            budget: None,
        }
    }
}

/// Opens connections for the prober.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect within `timeout`, then wait up to `timeout` for the socket to
    /// become readable. Returns the first banner line (possibly empty if the
    /// peer closed), or `None` if it stayed quiet. The connection is closed
    /// before returning.
    async fn dial(&self, host: &str, port: u16, timeout: Duration) -> io::Result<Option<String>>;
}

/// Bytes read from the peer when looking for a banner.
const BANNER_READ_LEN: usize = 256;

/// Real TCP dialer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16, timeout: Duration) -> io::Result<Option<String>> {
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| io::Error::new(ErrorKind::TimedOut, "connect timed out"))??;

        // Readable data or EOF both count as an answer
        let mut buf = [0u8; BANNER_READ_LEN];
        match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) => Ok(Some(banner_line(&buf[..n]))),
            Ok(Err(e)) => {
                debug!(host, port, error = %e, "Reading from peer failed");
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }
}

/// First line of `bytes`, decoded lossily.
fn banner_line(bytes: &[u8]) -> String {
    let line = bytes
        .split(|&b| b == b'\n')
        .next()
        .unwrap_or_default();
    String::from_utf8_lossy(line).trim_end().to_string()
}

/// How a failed connection should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transient {
    /// Try again straight away.
    Retry,
    /// Pause before trying again.
    Backoff,
}

fn classify(err: &io::Error) -> Option<Transient> {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::PermissionDenied => Some(Transient::Retry),
        ErrorKind::ConnectionRefused | ErrorKind::HostUnreachable => Some(Transient::Backoff),
        _ => None,
    }
}

/// Probe `host:port` once.
///
/// Returns `true` only after `on_connect` has completed successfully.
///
/// # Errors
/// Returns [`ProbeError::Connect`] for non-transient I/O errors (for example
/// a host name that does not resolve) and [`ProbeError::Verify`] if
/// `on_connect` fails.
pub async fn probe<F, Fut>(
    dialer: &dyn Dialer,
    clock: &dyn Clock,
    host: &str,
    port: u16,
    config: &ProbeConfig,
    on_connect: F,
) -> Result<bool, ProbeError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    match dialer.dial(host, port, config.connect_timeout).await {
        Ok(Some(banner)) => {
            debug!(host, port, banner = %banner, "Port is answering");
            on_connect().await?;
            Ok(true)
        }
        Ok(None) => {
            debug!(host, port, "Connected but peer is silent");
            Ok(false)
        }
        Err(e) => match classify(&e) {
            Some(Transient::Retry) => {
                debug!(host, port, error = %e, "Connection attempt failed");
                Ok(false)
            }
            Some(Transient::Backoff) => {
                debug!(host, port, error = %e, "Connection attempt failed, backing off");
                clock.sleep(config.retry_backoff).await;
                Ok(false)
            }
            None => Err(ProbeError::Connect {
                host: host.to_string(),
                port,
                source: e,
            }),
        },
    }
}

/// Probe until the port answers.
///
/// `on_tick` runs after every unsuccessful attempt. Returns the number of
/// attempts made.
///
/// # Errors
/// Propagates [`probe`] errors, and returns [`ProbeError::Unreachable`] once
/// the configured budget is spent.
pub async fn wait_for_port<F, Fut>(
    dialer: &dyn Dialer,
    clock: &dyn Clock,
    host: &str,
    port: u16,
    config: &ProbeConfig,
    on_tick: &(dyn Fn() + Sync),
    mut on_connect: F,
) -> Result<u32, ProbeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let start = clock.now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        if probe(dialer, clock, host, port, config, &mut on_connect).await? {
            return Ok(attempts);
        }
        on_tick();

        let elapsed = clock.now().saturating_duration_since(start);
        if config.budget.is_some_and(|budget| elapsed >= budget) {
            return Err(ProbeError::Unreachable {
                host: host.to_string(),
                port,
                attempts,
            });
        }
    }
}
