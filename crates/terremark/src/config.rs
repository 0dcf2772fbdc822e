//! Configuration for `server create`.
//!
//! Values come from three places, highest precedence first: command-line
//! options (some also read from the environment), the stored TOML config,
//! and built-in defaults. [`Settings::resolve`] applies that order once so
//! nothing downstream looks configuration up again.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bootstrap::{BootstrapOptions, DEFAULT_DISTRO, DEFAULT_KNIFE_PROGRAM, DEFAULT_SSH_USER};
use crate::error::PreflightError;
use crate::provision::{ProvisionRequest, Timing, DEFAULT_MEMORY_MB, DEFAULT_VCPUS};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "TERREMARK_CONFIG";

/// Config directory under the home directory.
const CONFIG_DIR: &str = ".terremark";

/// Config file name.
const CONFIG_FILE: &str = "config.toml";

/// Stored configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredConfig {
    /// Terremark vCloud username.
    pub username: Option<String>,
    /// Terremark vCloud password.
    pub password: Option<String>,
    /// API endpoint override.
    pub api_url: Option<String>,
    /// Default vApp name.
    pub server_name: Option<String>,
    /// Default catalog image.
    pub image: Option<String>,
    /// Default SSH key name.
    pub ssh_key_name: Option<String>,
    /// Private key for SSH.
    pub identity_file: Option<PathBuf>,
    /// Default virtual CPU count.
    pub vcpus: Option<u32>,
    /// Default memory in MB.
    pub memory: Option<u32>,
    /// Node name to register.
    pub chef_node_name: Option<String>,
    /// Bootstrap template name.
    pub distro: Option<String>,
    /// Custom bootstrap template.
    pub template_file: Option<PathBuf>,
    /// Version of the configuration tool to install.
    pub bootstrap_version: Option<String>,
    /// SSH user.
    pub ssh_user: Option<String>,
    /// Program used to bootstrap (`knife` by default).
    pub bootstrap_command: Option<String>,
    /// Waits and delays.
    pub timing: TimingConfig,
}

/// `[timing]` table, all values in seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay between status polls.
    pub poll_interval_secs: Option<u64>,
    /// Give up waiting on vApp status after this long.
    pub wait_timeout_secs: Option<u64>,
    /// Pause after disks are attached.
    pub disk_settle_secs: Option<u64>,
    /// SSH connect and banner timeout.
    pub ssh_connect_timeout_secs: Option<u64>,
    /// Pause after a refused or unreachable SSH connection.
    pub ssh_retry_backoff_secs: Option<u64>,
    /// Pause after sshd first answers.
    pub sshd_settle_secs: Option<u64>,
    /// Give up waiting for sshd after this long.
    pub ssh_wait_timeout_secs: Option<u64>,
}

impl StoredConfig {
    /// `~/.terremark/config.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Parse TOML text.
    ///
    /// # Errors
    /// Returns [`PreflightError::Config`] if the text is not valid config.
    pub fn from_toml(text: &str) -> Result<Self, PreflightError> {
        toml::from_str(text).map_err(|e| PreflightError::Config(e.to_string()))
    }

    /// Load the config file.
    ///
    /// An explicit path (argument, then `TERREMARK_CONFIG`) must exist. The
    /// default location is optional.
    ///
    /// # Errors
    /// Returns [`PreflightError::Config`] if a file cannot be read or parsed.
    pub fn load(explicit: Option<&Path>) -> Result<Self, PreflightError> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let (path, required) = match explicit {
            Some(path) => (path, true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path).map_err(|e| {
            PreflightError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::from_toml(&text)
    }
}

/// Options for `server create`.
#[derive(Debug, Clone, Default, Args)]
pub struct CreateOptions {
    /// Terremark vCloud username.
    #[arg(short = 'A', long = "terremark-username", env = "TERREMARK_USERNAME")]
    pub username: Option<String>,

    /// Terremark vCloud password.
    #[arg(
        short = 'K',
        long = "terremark-password",
        env = "TERREMARK_PASSWORD",
        hide_env_values = true
    )]
    pub password: Option<String>,

    /// The vApp name.
    #[arg(long)]
    pub server_name: Option<String>,

    /// Catalog image to instantiate.
    #[arg(short = 'I', long = "terremark-image")]
    pub image: Option<String>,

    /// Name of the SSH key registered with the organization.
    #[arg(short = 'S', long = "ssh-key")]
    pub ssh_key_name: Option<String>,

    /// Private key for SSH.
    #[arg(short = 'i', long)]
    pub identity_file: Option<PathBuf>,

    /// Number of virtual CPUs.
    #[arg(short = 'v', long)]
    pub vcpus: Option<u32>,

    /// Memory in MB.
    #[arg(short = 'm', long)]
    pub memory: Option<u32>,

    /// Additional disk sizes in GB (e.g., 25,50).
    #[arg(short = 'D', long, value_delimiter = ',', value_parser = parse_trimmed::<u32>)]
    pub disks: Vec<u32>,

    /// TCP ports to expose (e.g., 80,443). 22 is always exposed.
    #[arg(short = 'T', long, value_delimiter = ',', value_parser = parse_trimmed::<u16>)]
    pub tcp: Vec<u16>,

    /// UDP ports to expose.
    #[arg(short = 'U', long, value_delimiter = ',', value_parser = parse_trimmed::<u16>)]
    pub udp: Vec<u16>,

    /// SSH user.
    #[arg(short = 'x', long)]
    pub ssh_user: Option<String>,

    /// Comma separated run-list (e.g., "role[web],recipe[nginx]").
    #[arg(short = 'r', long)]
    pub run_list: Option<String>,

    /// Node name to register.
    #[arg(short = 'N', long)]
    pub node_name: Option<String>,

    /// Bootstrap template name.
    #[arg(short = 'd', long)]
    pub distro: Option<String>,

    /// Custom bootstrap template.
    #[arg(long)]
    pub template_file: Option<PathBuf>,

    /// Version of the configuration tool to install.
    #[arg(long)]
    pub bootstrap_version: Option<String>,

    /// Give up waiting on any single step after this many seconds.
    #[arg(long)]
    pub wait_timeout: Option<u64>,
}

/// Provider credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Fully resolved settings for one `server create` run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Provider credentials.
    pub credentials: Credentials,
    /// API endpoint override.
    pub api_url: Option<String>,
    /// What to build.
    pub request: ProvisionRequest,
    /// Waits and delays.
    pub timing: Timing,
    /// Program used to bootstrap.
    pub bootstrap_command: String,
}

/// Explicit value, else stored value, else default.
#[must_use]
pub fn resolve<T>(explicit: Option<T>, stored: Option<T>, default: T) -> T {
    explicit.or(stored).unwrap_or(default)
}

/// Split a run-list on commas and whitespace.
#[must_use]
pub fn parse_run_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse one item of a comma separated number list, ignoring surrounding spaces.
fn parse_trimmed<T>(raw: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let item = raw.trim();
    item.parse().map_err(|e| format!("invalid value '{item}': {e}"))
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty()).cloned()
}

impl Settings {
    /// Merge options with stored configuration.
    ///
    /// # Errors
    /// Returns [`PreflightError`] when the server name, SSH key name or
    /// credentials are missing, checked in that order.
    pub fn resolve(options: &CreateOptions, stored: &StoredConfig) -> Result<Self, PreflightError> {
        let name = non_empty(options.server_name.as_ref())
            .or_else(|| non_empty(stored.server_name.as_ref()))
            .ok_or(PreflightError::MissingServerName)?;
        let ssh_key_name = non_empty(options.ssh_key_name.as_ref())
            .or_else(|| non_empty(stored.ssh_key_name.as_ref()))
            .ok_or(PreflightError::MissingSshKeyName)?;

        let username = non_empty(options.username.as_ref())
            .or_else(|| non_empty(stored.username.as_ref()));
        let password = non_empty(options.password.as_ref())
            .or_else(|| non_empty(stored.password.as_ref()));
        let (Some(username), Some(password)) = (username, password) else {
            return Err(PreflightError::MissingCredentials);
        };

        let bootstrap = BootstrapOptions {
            ssh_user: resolve(
                options.ssh_user.clone(),
                stored.ssh_user.clone(),
                DEFAULT_SSH_USER.to_string(),
            ),
            identity_file: options
                .identity_file
                .clone()
                .or_else(|| stored.identity_file.clone()),
            run_list: options
                .run_list
                .as_deref()
                .map(parse_run_list)
                .unwrap_or_default(),
            node_name: options
                .node_name
                .clone()
                .or_else(|| stored.chef_node_name.clone()),
            distro: resolve(
                options.distro.clone(),
                stored.distro.clone(),
                DEFAULT_DISTRO.to_string(),
            ),
            template_file: options
                .template_file
                .clone()
                .or_else(|| stored.template_file.clone()),
            bootstrap_version: options
                .bootstrap_version
                .clone()
                .or_else(|| stored.bootstrap_version.clone()),
        };

        let request = ProvisionRequest::new(name, ssh_key_name)?
            .with_image(options.image.clone().or_else(|| stored.image.clone()))
            .with_hardware(
                resolve(options.vcpus, stored.vcpus, DEFAULT_VCPUS),
                resolve(options.memory, stored.memory, DEFAULT_MEMORY_MB),
            )
            .with_disks(options.disks.clone())
            .with_tcp_ports(options.tcp.iter().copied())
            .with_udp_ports(options.udp.iter().copied())
            .with_bootstrap(bootstrap);

        Ok(Self {
            credentials: Credentials { username, password },
            api_url: stored.api_url.clone(),
            request,
            timing: Self::timing(options, &stored.timing),
            bootstrap_command: stored
                .bootstrap_command
                .clone()
                .unwrap_or_else(|| DEFAULT_KNIFE_PROGRAM.to_string()),
        })
    }

    fn timing(options: &CreateOptions, stored: &TimingConfig) -> Timing {
        let defaults = Timing::default();
        let wait_timeout = options
            .wait_timeout
            .or(stored.wait_timeout_secs)
            .map(Duration::from_secs);

        let mut timing = defaults.clone();
        timing.poll.interval = stored
            .poll_interval_secs
            .map_or(defaults.poll.interval, Duration::from_secs);
        timing.poll.timeout = wait_timeout;
        timing.disk_settle = stored
            .disk_settle_secs
            .map_or(defaults.disk_settle, Duration::from_secs);
        timing.probe.connect_timeout = stored
            .ssh_connect_timeout_secs
            .map_or(defaults.probe.connect_timeout, Duration::from_secs);
        timing.probe.retry_backoff = stored
            .ssh_retry_backoff_secs
            .map_or(defaults.probe.retry_backoff, Duration::from_secs);
        timing.probe.budget = options
            .wait_timeout
            .or(stored.ssh_wait_timeout_secs)
            .or(stored.wait_timeout_secs)
            .map(Duration::from_secs);
        timing.sshd_settle = stored
            .sshd_settle_secs
            .map_or(defaults.sshd_settle, Duration::from_secs);
        timing
    }
}
