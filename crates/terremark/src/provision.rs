//! Server provisioning orchestration.
//!
//! Turns a [`ProvisionRequest`] into a running, SSH-reachable vApp and hands
//! it to a [`Bootstrapper`]. Stages run strictly in order:
//!
//! 1. validate the request
//! 2. resolve the SSH key by exact name
//! 3. instantiate the vApp
//! 4. wait until it is deployed
//! 5. attach additional disks (only when requested) and wait again
//! 6. power on and wait
//! 7. open internet services for the requested ports
//! 8. re-read the vApp for its addresses
//! 9. wait for sshd on the public address
//! 10. bootstrap
//!
//! Once step 3 succeeds a failure leaves the vApp in place. Nothing is
//! rolled back; the error names the vApp so it can be deleted.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info};

use crate::bootstrap::{BootstrapInput, BootstrapOptions, Bootstrapper};
use crate::error::{PreflightError, ProvisionError, Stage, StageError, TerminalState};
use crate::output::ProgressSink;
use crate::poll::{self, Clock, PollConfig, PollError, TokioClock};
use crate::probe::{self, Dialer, ProbeConfig, TcpDialer};
use crate::providers::{
    CloudProvider, CreateServerRequest, NetworkServiceSpec, ProviderError, ReconfigureRequest,
    ServerHandle, SSH_PORT,
};

/// Default virtual CPU count.
pub const DEFAULT_VCPUS: u32 = 1;

/// Default memory in MB.
pub const DEFAULT_MEMORY_MB: u32 = 512;

/// Default pause after disks are attached.
pub const DEFAULT_DISK_SETTLE_SECS: u64 = 10;

/// Default pause after sshd first answers.
pub const DEFAULT_SSHD_SETTLE_SECS: u64 = 10;

static TOKIO_CLOCK: TokioClock = TokioClock;
static TCP_DIALER: TcpDialer = TcpDialer;

/// What to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// vApp name.
    pub name: String,
    /// Catalog image to instantiate.
    pub image: Option<String>,
    /// Name of the SSH key to authorize.
    pub ssh_key_name: String,
    /// Virtual CPU count.
    pub vcpus: u32,
    /// Memory in MB.
    pub memory_mb: u32,
    /// Additional disk sizes in GB.
    pub disks: Vec<u32>,
    /// TCP ports to expose. Port 22 is added again when services are built.
    pub tcp_ports: BTreeSet<u16>,
    /// UDP ports to expose.
    pub udp_ports: BTreeSet<u16>,
    /// Bootstrap settings.
    pub bootstrap: BootstrapOptions,
}

impl ProvisionRequest {
    /// Create a request with default hardware and only SSH exposed.
    ///
    /// # Errors
    /// Returns [`PreflightError`] if the name or key name is blank.
    pub fn new(
        name: impl Into<String>,
        ssh_key_name: impl Into<String>,
    ) -> Result<Self, PreflightError> {
        let request = Self {
            name: name.into(),
            image: None,
            ssh_key_name: ssh_key_name.into(),
            vcpus: DEFAULT_VCPUS,
            memory_mb: DEFAULT_MEMORY_MB,
            disks: Vec::new(),
            tcp_ports: BTreeSet::from([SSH_PORT]),
            udp_ports: BTreeSet::new(),
            bootstrap: BootstrapOptions::default(),
        };
        request.validate()?;
        Ok(request)
    }

    /// Set the image.
    #[must_use]
    pub fn with_image(mut self, image: Option<String>) -> Self {
        self.image = image;
        self
    }

    /// Set CPU and memory.
    #[must_use]
    pub fn with_hardware(mut self, vcpus: u32, memory_mb: u32) -> Self {
        self.vcpus = vcpus;
        self.memory_mb = memory_mb;
        self
    }

    /// Set additional disks.
    #[must_use]
    pub fn with_disks(mut self, disks: Vec<u32>) -> Self {
        self.disks = disks;
        self
    }

    /// Set TCP ports. Port 22 is kept regardless.
    #[must_use]
    pub fn with_tcp_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.tcp_ports = ports.into_iter().collect();
        self.tcp_ports.insert(SSH_PORT);
        self
    }

    /// Set UDP ports.
    #[must_use]
    pub fn with_udp_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.udp_ports = ports.into_iter().collect();
        self
    }

    /// Set bootstrap settings.
    #[must_use]
    pub fn with_bootstrap(mut self, bootstrap: BootstrapOptions) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Check required fields.
    ///
    /// # Errors
    /// Returns [`PreflightError`] if the name or key name is blank.
    pub fn validate(&self) -> Result<(), PreflightError> {
        if self.name.trim().is_empty() {
            return Err(PreflightError::MissingServerName);
        }
        if self.ssh_key_name.trim().is_empty() {
            return Err(PreflightError::MissingSshKeyName);
        }
        Ok(())
    }

    /// Internet services to create.
    #[must_use]
    pub fn network_services(&self) -> NetworkServiceSpec {
        NetworkServiceSpec::new(
            self.tcp_ports.iter().copied(),
            self.udp_ports.iter().copied(),
        )
    }
}

/// Waits and settle delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    /// Polling of vApp status.
    pub poll: PollConfig,
    /// Pause after additional disks are attached.
    pub disk_settle: Duration,
    /// SSH probing.
    pub probe: ProbeConfig,
    /// Pause after sshd first answers.
    pub sshd_settle: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            disk_settle: Duration::from_secs(DEFAULT_DISK_SETTLE_SECS),
            probe: ProbeConfig::default(),
            sshd_settle: Duration::from_secs(DEFAULT_SSHD_SETTLE_SECS),
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct Provisioned {
    /// Final vApp snapshot.
    pub server: ServerHandle,
    /// Services that were opened.
    pub services: NetworkServiceSpec,
    /// What was handed to bootstrap.
    pub bootstrap: BootstrapInput,
}

/// Classify the outcome of [`Provisioner::run`].
#[must_use]
pub fn terminal_state(result: &Result<Provisioned, ProvisionError>) -> TerminalState {
    match result {
        Ok(_) => TerminalState::Completed,
        Err(e) => e.terminal_state(),
    }
}

/// Runs the provisioning stages against a provider.
pub struct Provisioner<'a> {
    provider: &'a dyn CloudProvider,
    bootstrapper: &'a dyn Bootstrapper,
    sink: &'a dyn ProgressSink,
    clock: &'a dyn Clock,
    dialer: &'a dyn Dialer,
    timing: Timing,
}

impl<'a> Provisioner<'a> {
    /// Create a provisioner using the wall clock and real TCP connections.
    #[must_use]
    pub fn new(
        provider: &'a dyn CloudProvider,
        bootstrapper: &'a dyn Bootstrapper,
        sink: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            provider,
            bootstrapper,
            sink,
            clock: &TOKIO_CLOCK,
            dialer: &TCP_DIALER,
            timing: Timing::default(),
        }
    }

    /// Use a different time source.
    #[must_use]
    pub fn with_clock(mut self, clock: &'a dyn Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Use a different dialer for SSH probing.
    #[must_use]
    pub fn with_dialer(mut self, dialer: &'a dyn Dialer) -> Self {
        self.dialer = dialer;
        self
    }

    /// Override waits and delays.
    #[must_use]
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Provision one server end to end.
    ///
    /// # Errors
    /// Returns [`ProvisionError`]; see [`ProvisionError::terminal_state`] for
    /// whether a vApp was left behind.
    pub async fn run(&self, request: &ProvisionRequest) -> Result<Provisioned, ProvisionError> {
        request.validate()?;

        let fingerprint = self.resolve_key(request).await?;

        self.sink
            .status(&format!("Instantiating vApp {}", request.name));
        let created = self
            .provider
            .create_server(&CreateServerRequest {
                name: request.name.clone(),
                image: request.image.clone(),
                ssh_key_fingerprint: fingerprint,
                cpus: request.vcpus,
                memory_mb: request.memory_mb,
            })
            .await
            .map_err(|source| ProvisionError::Provider {
                stage: Stage::Create,
                source,
            })?;
        let id = created.id.clone();
        info!(server_id = %id, name = %created.name, "vApp instantiated");
        self.sink.info(&format!(
            "Instantiated vApp named [{}] as [{}]",
            created.name, id
        ));

        self.sink.status("Waiting for server to be Instantiated");
        let server = self
            .wait_for(&id, ServerHandle::is_ready)
            .await
            .map_err(|e| ProvisionError::mid_flight(&id, Stage::WaitReady, e))?;

        if !request.disks.is_empty() {
            self.configure_disks(&server, &request.disks)
                .await
                .map_err(|e| ProvisionError::mid_flight(&id, Stage::ConfigureDisks, e))?;
        }

        self.sink.status("Waiting for server to be Powered On");
        self.provider
            .power_on(&id)
            .await
            .map_err(|e| ProvisionError::mid_flight(&id, Stage::PowerOn, e))?;
        self.wait_for(&id, ServerHandle::is_on)
            .await
            .map_err(|e| ProvisionError::mid_flight(&id, Stage::PowerOn, e))?;

        self.sink
            .status("Creating Internet and Node Services for SSH and other services");
        let services = request.network_services();
        self.provider
            .create_network_services(&id, &services)
            .await
            .map_err(|e| ProvisionError::mid_flight(&id, Stage::OpenNetworkServices, e))?;

        let server = self
            .provider
            .get_server(&id)
            .await
            .map_err(|e| ProvisionError::mid_flight(&id, Stage::RefreshHandle, e))?;
        self.sink.field(
            "Public IP Address",
            server.public_address.as_deref().unwrap_or_default(),
        );
        self.sink.field(
            "Private IP Address",
            server.private_address.as_deref().unwrap_or_default(),
        );
        let address = server.public_address.clone().ok_or_else(|| {
            ProvisionError::mid_flight(
                &id,
                Stage::RefreshHandle,
                StageError::MissingPublicAddress,
            )
        })?;

        self.sink.status("Waiting for sshd");
        self.wait_for_ssh(&address)
            .await
            .map_err(|e| ProvisionError::mid_flight(&id, Stage::WaitSshReachable, e))?;

        let input = BootstrapInput::new(&request.bootstrap, &id, &address);
        self.sink.status(&format!("Bootstrapping {}...", request.name));
        info!(
            server_id = %id,
            address = %address,
            node_name = %input.node_name,
            use_sudo = input.use_sudo,
            "Handing off to bootstrap"
        );
        self.bootstrapper
            .bootstrap(&input)
            .await
            .map_err(|source| ProvisionError::Bootstrap {
                server_id: id.clone(),
                source,
            })?;

        info!(server_id = %id, "Provisioning complete");
        Ok(Provisioned {
            server,
            services,
            bootstrap: input,
        })
    }

    /// Fingerprint of the requested key.
    async fn resolve_key(&self, request: &ProvisionRequest) -> Result<String, ProvisionError> {
        let provider_error = |source| ProvisionError::Provider {
            stage: Stage::ResolveKey,
            source,
        };

        let org_id = self
            .provider
            .default_organization()
            .await
            .map_err(provider_error)?;
        let key = self
            .provider
            .find_key_by_name(&org_id, &request.ssh_key_name)
            .await
            .map_err(provider_error)?
            .ok_or_else(|| ProvisionError::KeyNotFound(request.ssh_key_name.clone()))?;

        debug!(key_name = %key.name, fingerprint = %key.fingerprint, "Resolved SSH key");
        Ok(key.fingerprint)
    }

    /// Attach disks, keeping CPU and memory as they are.
    async fn configure_disks(
        &self,
        server: &ServerHandle,
        disks: &[u32],
    ) -> Result<(), StageError> {
        self.sink
            .status("Waiting for additional disks to be configured");
        info!(server_id = %server.id, ?disks, "Attaching disks");

        self.provider
            .reconfigure(
                &server.id,
                &ReconfigureRequest {
                    name: server.name.clone(),
                    cpus: server.hardware.cpus,
                    memory_mb: server.hardware.memory_mb,
                    disks: disks.to_vec(),
                },
            )
            .await?;

        self.wait_for(&server.id, ServerHandle::is_ready).await?;
        self.clock.sleep(self.timing.disk_settle).await;
        Ok(())
    }

    /// Poll the vApp until `predicate` holds.
    async fn wait_for(
        &self,
        id: &str,
        predicate: fn(&ServerHandle) -> bool,
    ) -> Result<ServerHandle, PollError<ProviderError>> {
        let server = poll::wait_until(
            self.clock,
            &self.timing.poll,
            || self.provider.get_server(id),
            predicate,
            &|| self.sink.tick(),
        )
        .await?;

        debug!(server_id = %id, status = %server.status, "vApp reached expected state");
        Ok(server)
    }

    /// Wait for sshd on `address`, then let it settle.
    async fn wait_for_ssh(&self, address: &str) -> Result<(), probe::ProbeError> {
        let clock = self.clock;
        let sink = self.sink;
        let settle = self.timing.sshd_settle;

        let attempts = probe::wait_for_port(
            self.dialer,
            self.clock,
            address,
            SSH_PORT,
            &self.timing.probe,
            &|| self.sink.tick(),
            move || async move {
                clock.sleep(settle).await;
                sink.done();
                anyhow::Ok(())
            },
        )
        .await?;

        info!(address = %address, attempts, "sshd is reachable");
        Ok(())
    }
}
