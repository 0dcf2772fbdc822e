//! Terremark vCloud API client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::models::{
    ConfigureBody, InstantiateBody, InternetServicesBody, KeyList, OrganizationList,
    VappResource, VirtualDisk, VirtualHardware,
};
use crate::providers::traits::{
    CloudProvider, CreateServerRequest, Hardware, NetworkServiceSpec, ProviderError,
    ReconfigureRequest, ServerHandle, SshKey, VappStatus,
};

/// Base URL for the Terremark vCloud Express API.
pub const API_BASE_URL: &str = "https://services.vcloudexpress.terremark.com/api/v0.8a-ext1.6";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Terremark vCloud provider.
#[derive(Clone)]
pub struct Terremark {
    /// HTTP client.
    client: Client,
    /// API base URL.
    base_url: String,
    /// Account username.
    username: String,
    /// Account password.
    password: String,
}

impl Terremark {
    /// Create a new Terremark provider.
    ///
    /// # Arguments
    /// * `username` - Terremark vCloud username
    /// * `password` - Terremark vCloud password
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: API_BASE_URL.to_string(),
            username: username.into(),
            password: password.into(),
        })
    }

    /// Point the client at a different API endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Make an authenticated POST request.
    async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Make an authenticated POST request that returns empty body.
    async fn post_empty<B: serde::Serialize>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request (empty response)");

        let mut request = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password));
        if let Some(body) = body {
            request = request.json(body);
        }

        Self::expect_success(request.send().await?).await
    }

    /// Make an authenticated PUT request that returns empty body.
    async fn put_empty<B: serde::Serialize>(&self, path: &str, body: &B) -> Result<(), ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "PUT request");

        let response = self
            .client
            .put(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await?;

        Self::expect_success(response).await
    }

    /// Make an authenticated DELETE request.
    async fn delete(&self, path: &str) -> Result<(), ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "DELETE request");

        let response = self
            .client
            .delete(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        Self::expect_success(response).await
    }

    /// Map a non-2xx response without a body we care about.
    async fn expect_success(response: reqwest::Response) -> Result<(), ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            Err(ProviderError::NotFound(text))
        } else {
            Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Handle API response, parsing JSON or error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                ProviderError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(ProviderError::NotFound(text))
        } else {
            Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Convert API vApp resource to our handle.
    fn to_server(resource: VappResource) -> ServerHandle {
        let hardware = resource
            .virtual_hardware
            .map(|hw| Hardware {
                cpus: hw.cpus,
                memory_mb: hw.memory_mb,
                disks: hw.disks.iter().map(|d| d.size_gb).collect(),
            })
            .unwrap_or_default();

        ServerHandle {
            status: VappStatus::from_code(&resource.status.as_code()),
            id: resource.id,
            name: resource.name,
            public_address: resource.public_ip_address.filter(|ip| !ip.is_empty()),
            private_address: resource.ip_address.filter(|ip| !ip.is_empty()),
            hardware,
            operating_system: resource.operating_system.map(|os| os.description),
        }
    }
}

#[async_trait]
impl CloudProvider for Terremark {
    async fn default_organization(&self) -> Result<String, ProviderError> {
        let response: OrganizationList = self.get("/org").await?;
        let org = response
            .organizations
            .into_iter()
            .next()
            .ok_or(ProviderError::NoOrganization)?;

        debug!(org_id = %org.id, org_name = %org.name, "Using default organization");
        Ok(org.id)
    }

    async fn list_keys(&self, org_id: &str) -> Result<Vec<SshKey>, ProviderError> {
        let response: KeyList = self.get(&format!("/org/{org_id}/keys")).await?;
        Ok(response
            .keys
            .into_iter()
            .map(|key| SshKey {
                name: key.name,
                fingerprint: key.fingerprint,
            })
            .collect())
    }

    async fn create_server(&self, req: &CreateServerRequest) -> Result<ServerHandle, ProviderError> {
        info!(
            name = %req.name,
            image = ?req.image,
            cpus = req.cpus,
            memory_mb = req.memory_mb,
            "Instantiating vApp"
        );

        let body = InstantiateBody {
            name: req.name.clone(),
            image: req.image.clone(),
            ssh_key_fingerprint: req.ssh_key_fingerprint.clone(),
            cpus: req.cpus,
            memory_mb: req.memory_mb,
        };

        let resource: VappResource = self.post("/vapps", &body).await?;
        let server = Self::to_server(resource);

        info!(server_id = %server.id, status = %server.status, "vApp instantiated");
        Ok(server)
    }

    async fn reconfigure(&self, id: &str, req: &ReconfigureRequest) -> Result<(), ProviderError> {
        info!(server_id = %id, disks = ?req.disks, "Reconfiguring vApp");

        let body = ConfigureBody {
            name: req.name.clone(),
            virtual_hardware: VirtualHardware {
                cpus: req.cpus,
                memory_mb: req.memory_mb,
                disks: req
                    .disks
                    .iter()
                    .map(|&size_gb| VirtualDisk { size_gb })
                    .collect(),
            },
        };

        self.put_empty(&format!("/vapps/{id}/configure"), &body)
            .await
    }

    async fn power_on(&self, id: &str) -> Result<(), ProviderError> {
        info!(server_id = %id, "Powering on vApp");
        self.post_empty::<()>(&format!("/vapps/{id}/power/action/powerOn"), None)
            .await
    }

    async fn create_network_services(
        &self,
        id: &str,
        spec: &NetworkServiceSpec,
    ) -> Result<(), ProviderError> {
        info!(server_id = %id, tcp = ?spec.tcp, udp = ?spec.udp, "Creating internet services");

        let body = InternetServicesBody {
            tcp: spec.tcp.iter().copied().collect(),
            udp: spec.udp.iter().copied().collect(),
        };

        self.post_empty(&format!("/vapps/{id}/internetServices"), Some(&body))
            .await
    }

    async fn get_server(&self, id: &str) -> Result<ServerHandle, ProviderError> {
        let resource: VappResource = self.get(&format!("/vapps/{id}")).await?;
        Ok(Self::to_server(resource))
    }

    async fn delete_network_services(&self, id: &str) -> Result<(), ProviderError> {
        info!(server_id = %id, "Deleting internet services");
        self.delete(&format!("/vapps/{id}/internetServices")).await
    }

    async fn delete_server(&self, id: &str) -> Result<(), ProviderError> {
        info!(server_id = %id, "Deleting vApp");
        self.delete(&format!("/vapps/{id}")).await?;
        info!(server_id = %id, "vApp deleted");
        Ok(())
    }
}
