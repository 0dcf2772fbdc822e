//! Bootstrap input record.

use std::path::PathBuf;

use serde::Serialize;

/// SSH user when nothing else is configured.
pub const DEFAULT_SSH_USER: &str = "root";

/// Bootstrap template when nothing else is configured.
pub const DEFAULT_DISTRO: &str = "ubuntu10.04-gems";

/// Bootstrap settings chosen by the user, already resolved against stored
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOptions {
    /// SSH user to log in as.
    pub ssh_user: String,
    /// Private key for SSH.
    pub identity_file: Option<PathBuf>,
    /// Roles and recipes to apply.
    pub run_list: Vec<String>,
    /// Node name. Falls back to the server id.
    pub node_name: Option<String>,
    /// Bootstrap template name.
    pub distro: String,
    /// Custom bootstrap template.
    pub template_file: Option<PathBuf>,
    /// Version of the configuration tool to install.
    pub bootstrap_version: Option<String>,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            ssh_user: DEFAULT_SSH_USER.to_string(),
            identity_file: None,
            run_list: Vec::new(),
            node_name: None,
            distro: DEFAULT_DISTRO.to_string(),
            template_file: None,
            bootstrap_version: None,
        }
    }
}

/// Everything the bootstrap step needs about one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapInput {
    /// Address to connect to.
    pub address: String,
    /// Roles and recipes to apply.
    pub run_list: Vec<String>,
    /// SSH user.
    pub ssh_user: String,
    /// Private key for SSH.
    pub identity_file: Option<PathBuf>,
    /// Node name to register.
    pub node_name: String,
    /// Bootstrap template name.
    pub distro: String,
    /// Custom bootstrap template.
    pub template_file: Option<PathBuf>,
    /// Run the bootstrap with elevated privileges.
    pub use_sudo: bool,
    /// Version of the configuration tool to install.
    pub bootstrap_version: Option<String>,
}

impl BootstrapInput {
    /// Build the input for the server `server_id`, reachable at `address`.
    #[must_use]
    pub fn new(options: &BootstrapOptions, server_id: &str, address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            run_list: options.run_list.clone(),
            ssh_user: options.ssh_user.clone(),
            identity_file: options.identity_file.clone(),
            node_name: options
                .node_name
                .clone()
                .unwrap_or_else(|| server_id.to_string()),
            distro: options.distro.clone(),
            template_file: options.template_file.clone(),
            use_sudo: options.ssh_user != DEFAULT_SSH_USER,
            bootstrap_version: options.bootstrap_version.clone(),
        }
    }
}
