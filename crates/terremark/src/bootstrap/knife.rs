//! `knife bootstrap` runner.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{BootstrapError, BootstrapInput, Bootstrapper};

/// Program used when none is configured.
pub const DEFAULT_KNIFE_PROGRAM: &str = "knife";

/// Bootstraps servers by shelling out to `knife bootstrap`.
#[derive(Debug, Clone)]
pub struct KnifeBootstrap {
    program: String,
}

impl Default for KnifeBootstrap {
    fn default() -> Self {
        Self::new()
    }
}

impl KnifeBootstrap {
    /// Use `knife` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: DEFAULT_KNIFE_PROGRAM.to_string(),
        }
    }

    /// Use a different executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Command-line arguments for `input`.
    #[must_use]
    pub fn args(input: &BootstrapInput) -> Vec<String> {
        let mut args = vec![
            "bootstrap".to_string(),
            input.address.clone(),
            "--ssh-user".to_string(),
            input.ssh_user.clone(),
        ];

        if let Some(identity) = &input.identity_file {
            args.push("--identity-file".to_string());
            args.push(identity.display().to_string());
        }

        args.push("--node-name".to_string());
        args.push(input.node_name.clone());
        args.push("--distro".to_string());
        args.push(input.distro.clone());

        if let Some(template) = &input.template_file {
            args.push("--template-file".to_string());
            args.push(template.display().to_string());
        }
        if let Some(version) = &input.bootstrap_version {
            args.push("--bootstrap-version".to_string());
            args.push(version.clone());
        }
        if !input.run_list.is_empty() {
            args.push("--run-list".to_string());
            args.push(input.run_list.join(","));
        }
        if input.use_sudo {
            args.push("--sudo".to_string());
        }

        args
    }
}

#[async_trait]
impl Bootstrapper for KnifeBootstrap {
    async fn bootstrap(&self, input: &BootstrapInput) -> Result<(), BootstrapError> {
        let args = Self::args(input);
        info!(
            address = %input.address,
            node_name = %input.node_name,
            "Running {} bootstrap",
            self.program
        );
        debug!(program = %self.program, ?args, "Bootstrap command");

        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .await
            .map_err(|source| BootstrapError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(BootstrapError::Failed {
                program: self.program.clone(),
                code: status.code(),
            })
        }
    }
}
