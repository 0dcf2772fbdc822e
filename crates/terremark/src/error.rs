//! Error types for provisioning runs.

use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::poll::PollError;
use crate::probe::ProbeError;
use crate::providers::ProviderError;

/// Problems found before any remote call is made.
#[derive(Error, Debug)]
pub enum PreflightError {
    /// No server name was given.
    #[error("Server Name cannot be empty")]
    MissingServerName,

    /// No SSH key name was given.
    #[error("SSH Key Name cannot be empty")]
    MissingSshKeyName,

    /// No username or password for the provider.
    #[error("Missing Credentials")]
    MissingCredentials,

    /// Stored configuration could not be read.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Remote steps of a provisioning run, in order.
///
/// Validation failures are [`PreflightError`]s and handoff failures are
/// [`ProvisionError::Bootstrap`], so neither has a stage here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Look up the SSH key.
    ResolveKey,
    /// Instantiate the vApp.
    Create,
    /// Wait for instantiation to finish.
    WaitReady,
    /// Attach additional disks.
    ConfigureDisks,
    /// Power on and wait.
    PowerOn,
    /// Expose ports.
    OpenNetworkServices,
    /// Re-read addresses.
    RefreshHandle,
    /// Wait for sshd.
    WaitSshReachable,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResolveKey => write!(f, "resolve_key"),
            Self::Create => write!(f, "create"),
            Self::WaitReady => write!(f, "wait_ready"),
            Self::ConfigureDisks => write!(f, "configure_disks"),
            Self::PowerOn => write!(f, "power_on"),
            Self::OpenNetworkServices => write!(f, "open_network_services"),
            Self::RefreshHandle => write!(f, "refresh_handle"),
            Self::WaitSshReachable => write!(f, "wait_ssh_reachable"),
        }
    }
}

/// Failure of a stage that runs after the vApp exists.
#[derive(Error, Debug)]
pub enum StageError {
    /// Provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Waiting on the provider failed.
    #[error(transparent)]
    Poll(#[from] PollError<ProviderError>),

    /// SSH probing failed.
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// The vApp has no public address after its services were created.
    #[error("no public address assigned")]
    MissingPublicAddress,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// Server is up and bootstrapped.
    Completed,
    /// Stopped before anything was created.
    Aborted,
    /// Stopped after the vApp was created. It is left in place.
    FailedMidFlight,
}

/// Errors from a provisioning run.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Request or configuration is incomplete.
    #[error(transparent)]
    Preflight(#[from] PreflightError),

    /// No SSH key with that exact name exists.
    #[error("Could not find an SSH key named '{0}'")]
    KeyNotFound(String),

    /// Provider call failed before the vApp was created.
    #[error("{stage} failed: {source}")]
    Provider {
        stage: Stage,
        #[source]
        source: ProviderError,
    },

    /// A stage failed after the vApp was created.
    #[error("{stage} failed for vApp {server_id}: {source}")]
    MidFlight {
        server_id: String,
        stage: Stage,
        #[source]
        source: StageError,
    },

    /// Bootstrap failed.
    #[error("{source}")]
    Bootstrap {
        server_id: String,
        #[source]
        source: BootstrapError,
    },
}

impl ProvisionError {
    /// Wrap a failure of `stage` for the vApp `server_id`.
    #[must_use]
    pub fn mid_flight(server_id: &str, stage: Stage, source: impl Into<StageError>) -> Self {
        Self::MidFlight {
            server_id: server_id.to_string(),
            stage,
            source: source.into(),
        }
    }

    /// Where this error leaves the run.
    #[must_use]
    pub fn terminal_state(&self) -> TerminalState {
        match self {
            Self::Preflight(_) | Self::KeyNotFound(_) | Self::Provider { .. } => {
                TerminalState::Aborted
            }
            Self::MidFlight { .. } | Self::Bootstrap { .. } => TerminalState::FailedMidFlight,
        }
    }

    /// The vApp left behind, if any.
    #[must_use]
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::MidFlight { server_id, .. } | Self::Bootstrap { server_id, .. } => {
                Some(server_id)
            }
            _ => None,
        }
    }
}
