//! Terremark vCloud API request and response models.

use serde::{Deserialize, Serialize};

// ============================================================================
// Organization and key types
// ============================================================================

/// Organization list response.
#[derive(Debug, Deserialize)]
pub struct OrganizationList {
    /// Organizations visible to the account.
    #[serde(default)]
    pub organizations: Vec<OrganizationResource>,
}

/// Organization resource.
#[derive(Debug, Deserialize)]
pub struct OrganizationResource {
    /// Organization ID.
    pub id: String,
    /// Organization name.
    pub name: String,
}

/// Key list response.
#[derive(Debug, Deserialize)]
pub struct KeyList {
    /// Keys registered with the organization.
    #[serde(default)]
    pub keys: Vec<KeyResource>,
}

/// SSH key resource.
#[derive(Debug, Deserialize)]
pub struct KeyResource {
    /// Key ID.
    pub id: String,
    /// Key name.
    pub name: String,
    /// Key fingerprint.
    pub fingerprint: String,
    /// Whether this is the organization's default key.
    #[serde(default)]
    pub is_default: bool,
}

// ============================================================================
// vApp types
// ============================================================================

/// vApp status code. The API sends either `"4"` or `4`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StatusField {
    /// Numeric form.
    Number(u8),
    /// String form.
    Text(String),
}

impl StatusField {
    /// Code as text.
    #[must_use]
    pub fn as_code(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

/// vApp resource from API.
#[derive(Debug, Deserialize)]
pub struct VappResource {
    /// vApp ID.
    pub id: String,
    /// vApp name.
    pub name: String,
    /// Status code.
    pub status: StatusField,
    /// Private IP address.
    pub ip_address: Option<String>,
    /// Public IP address, once an internet service exists.
    pub public_ip_address: Option<String>,
    /// Virtual hardware.
    #[serde(default)]
    pub virtual_hardware: Option<VirtualHardware>,
    /// Guest operating system.
    #[serde(default)]
    pub operating_system: Option<OperatingSystem>,
}

/// Virtual hardware section.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct VirtualHardware {
    /// Virtual CPU count.
    pub cpus: u32,
    /// Memory in MB.
    pub memory_mb: u32,
    /// Attached disks.
    #[serde(default)]
    pub disks: Vec<VirtualDisk>,
}

/// Virtual disk.
#[derive(Debug, Deserialize, Serialize)]
pub struct VirtualDisk {
    /// Size in GB.
    pub size_gb: u32,
}

/// Guest operating system section.
#[derive(Debug, Deserialize)]
pub struct OperatingSystem {
    /// Human readable description.
    pub description: String,
}

// ============================================================================
// Request bodies
// ============================================================================

/// Body for instantiating a vApp.
#[derive(Debug, Serialize)]
pub struct InstantiateBody {
    /// vApp name.
    pub name: String,
    /// Catalog item to instantiate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Fingerprint of the key to authorize.
    pub ssh_key_fingerprint: String,
    /// Virtual CPU count.
    pub cpus: u32,
    /// Memory in MB.
    pub memory_mb: u32,
}

/// Body for reconfiguring a vApp.
#[derive(Debug, Serialize)]
pub struct ConfigureBody {
    /// vApp name.
    pub name: String,
    /// Hardware to apply.
    pub virtual_hardware: VirtualHardware,
}

/// Body for creating internet and node services.
#[derive(Debug, Serialize)]
pub struct InternetServicesBody {
    /// TCP ports.
    pub tcp: Vec<u16>,
    /// UDP ports.
    pub udp: Vec<u16>,
}
