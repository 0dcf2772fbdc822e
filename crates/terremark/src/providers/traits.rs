//! Provider trait and common types for vCloud providers.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SSH is always exposed, whatever the caller asks for.
pub const SSH_PORT: u16 = 22;

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The account has no organization to provision into.
    #[error("No organization available for this account")]
    NoOrganization,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// vApp status as reported by Terremark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VappStatus {
    /// Still being instantiated.
    Unresolved,
    /// Instantiated but not yet deployed.
    Resolved,
    /// Deployed and powered off.
    Off,
    /// Suspended.
    Suspended,
    /// Powered on.
    On,
    /// Unknown status code.
    Unknown,
}

impl VappStatus {
    /// Map a Terremark numeric status code.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "0" => Self::Unresolved,
            "1" => Self::Resolved,
            "2" => Self::Off,
            "3" => Self::Suspended,
            "4" => Self::On,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for VappStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved => write!(f, "unresolved"),
            Self::Resolved => write!(f, "resolved"),
            Self::Off => write!(f, "off"),
            Self::Suspended => write!(f, "suspended"),
            Self::On => write!(f, "on"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Virtual hardware attached to a vApp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hardware {
    /// Virtual CPU count.
    pub cpus: u32,
    /// Memory in MB.
    pub memory_mb: u32,
    /// Disk sizes in GB, boot disk first.
    pub disks: Vec<u32>,
}

/// Snapshot of a vApp. Re-fetch after anything that changes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHandle {
    /// Provider-assigned identifier.
    pub id: String,
    /// vApp name.
    pub name: String,
    /// Current status.
    pub status: VappStatus,
    /// Public (internet service) address.
    pub public_address: Option<String>,
    /// Private address inside the vDC.
    pub private_address: Option<String>,
    /// Hardware profile.
    pub hardware: Hardware,
    /// Guest operating system description.
    pub operating_system: Option<String>,
}

impl ServerHandle {
    /// Deployed and idle. Terremark reports an idle, freshly deployed vApp
    /// as powered off.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == VappStatus::Off
    }

    /// Powered on.
    #[must_use]
    pub fn is_on(&self) -> bool {
        self.status == VappStatus::On
    }
}

/// An SSH key registered with the organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKey {
    /// Key name.
    pub name: String,
    /// Key fingerprint.
    pub fingerprint: String,
}

/// Request to instantiate a new vApp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateServerRequest {
    /// vApp name.
    pub name: String,
    /// Catalog image / template identifier.
    pub image: Option<String>,
    /// Fingerprint of the SSH key to authorize.
    pub ssh_key_fingerprint: String,
    /// Virtual CPU count.
    pub cpus: u32,
    /// Memory in MB.
    pub memory_mb: u32,
}

/// Request to change the hardware of an existing vApp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigureRequest {
    /// vApp name.
    pub name: String,
    /// Virtual CPU count.
    pub cpus: u32,
    /// Memory in MB.
    pub memory_mb: u32,
    /// Additional disk sizes in GB.
    pub disks: Vec<u32>,
}

/// Ports to expose through internet and node services.
///
/// Always contains port 22 in `tcp`; duplicates collapse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkServiceSpec {
    /// TCP ports.
    pub tcp: BTreeSet<u16>,
    /// UDP ports.
    pub udp: BTreeSet<u16>,
}

impl NetworkServiceSpec {
    /// Build the service set from requested ports.
    #[must_use]
    pub fn new(tcp: impl IntoIterator<Item = u16>, udp: impl IntoIterator<Item = u16>) -> Self {
        let mut tcp: BTreeSet<u16> = tcp.into_iter().collect();
        tcp.insert(SSH_PORT);
        Self {
            tcp,
            udp: udp.into_iter().collect(),
        }
    }
}

/// Trait for vCloud providers.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Identifier of the account's default organization.
    async fn default_organization(&self) -> Result<String, ProviderError>;

    /// SSH keys registered with an organization.
    async fn list_keys(&self, org_id: &str) -> Result<Vec<SshKey>, ProviderError>;

    /// Find a key by exact name.
    async fn find_key_by_name(
        &self,
        org_id: &str,
        name: &str,
    ) -> Result<Option<SshKey>, ProviderError> {
        Ok(self
            .list_keys(org_id)
            .await?
            .into_iter()
            .find(|key| key.name == name))
    }

    /// Instantiate a new vApp.
    async fn create_server(&self, req: &CreateServerRequest) -> Result<ServerHandle, ProviderError>;

    /// Change hardware of a vApp.
    async fn reconfigure(&self, id: &str, req: &ReconfigureRequest) -> Result<(), ProviderError>;

    /// Power a vApp on.
    async fn power_on(&self, id: &str) -> Result<(), ProviderError>;

    /// Create internet and node services for the given ports.
    async fn create_network_services(
        &self,
        id: &str,
        spec: &NetworkServiceSpec,
    ) -> Result<(), ProviderError>;

    /// Get vApp by ID.
    async fn get_server(&self, id: &str) -> Result<ServerHandle, ProviderError>;

    /// Remove every internet service pointing at a vApp.
    async fn delete_network_services(&self, id: &str) -> Result<(), ProviderError>;

    /// Delete a vApp.
    async fn delete_server(&self, id: &str) -> Result<(), ProviderError>;
}
