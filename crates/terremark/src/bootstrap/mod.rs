//! Handoff from a provisioned server to configuration management.
//!
//! The orchestrator builds a [`BootstrapInput`] once the server answers on
//! SSH and passes it to a [`Bootstrapper`]. [`KnifeBootstrap`] runs
//! `knife bootstrap`.

mod input;
mod knife;

use async_trait::async_trait;
use thiserror::Error;

pub use input::{BootstrapInput, BootstrapOptions, DEFAULT_DISTRO, DEFAULT_SSH_USER};
pub use knife::{KnifeBootstrap, DEFAULT_KNIFE_PROGRAM};

/// Errors raised by a bootstrap run.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// The bootstrap command could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The bootstrap command exited unsuccessfully.
    #[error("{program} bootstrap exited with {}", exit_description(.code))]
    Failed { program: String, code: Option<i32> },
}

/// Configures a freshly provisioned server.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Bootstrap the server described by `input`.
    async fn bootstrap(&self, input: &BootstrapInput) -> Result<(), BootstrapError>;
}

fn exit_description(code: &Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}"))
}
