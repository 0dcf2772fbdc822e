//! Provisioning flow tests
//!
//! Drives the orchestrator end to end against an in-process provider,
//! dialer and bootstrapper, with a virtual clock so settle delays and
//! back-offs cost nothing.

#![allow(clippy::too_many_lines)]

use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use terremark::bootstrap::{BootstrapError, BootstrapInput, BootstrapOptions, Bootstrapper};
use terremark::output::ProgressSink;
use terremark::poll::{ManualClock, PollConfig, PollError};
use terremark::probe::{Dialer, ProbeConfig, ProbeError};
use terremark::providers::{
    CloudProvider, CreateServerRequest, Hardware, NetworkServiceSpec, ProviderError,
    ReconfigureRequest, ServerHandle, SshKey, VappStatus,
};
use terremark::provision::terminal_state;
use terremark::{
    ProvisionError, ProvisionRequest, Provisioner, Stage, StageError, TerminalState, Timing,
};

// ============================================================================
// Fakes
// ============================================================================

const SERVER_ID: &str = "vapp-1";
const PUBLIC_IP: &str = "203.0.113.10";
const PRIVATE_IP: &str = "10.0.0.5";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    ListKeys,
    Create(CreateServerRequest),
    Get,
    Reconfigure(ReconfigureRequest),
    PowerOn,
    Services(NetworkServiceSpec),
}

/// Provider that models a vApp lifecycle in memory.
struct FakeProvider {
    keys: Vec<SshKey>,
    /// Statuses reported by successive `get_server` calls before settling.
    script: Mutex<VecDeque<VappStatus>>,
    server: Mutex<Option<ServerHandle>>,
    /// Hardware the template actually provides.
    template_hardware: Option<Hardware>,
    assign_public_ip: bool,
    fail_power_on: bool,
    /// Status every `get_server` call reports once the script runs out.
    stuck_at: Option<VappStatus>,
    calls: Mutex<Vec<Call>>,
}

impl FakeProvider {
    fn new(key_names: &[&str]) -> Self {
        Self {
            keys: key_names
                .iter()
                .map(|name| SshKey {
                    name: (*name).to_string(),
                    fingerprint: format!("fp:{name}"),
                })
                .collect(),
            script: Mutex::new(VecDeque::new()),
            server: Mutex::new(None),
            template_hardware: None,
            assign_public_ip: true,
            fail_power_on: false,
            stuck_at: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn with_script(self, statuses: &[VappStatus]) -> Self {
        *self.script.lock().unwrap() = statuses.iter().copied().collect();
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn with_server<T>(&self, f: impl FnOnce(&mut ServerHandle) -> T) -> Result<T, ProviderError> {
        let mut guard = self.server.lock().unwrap();
        let server = guard
            .as_mut()
            .ok_or_else(|| ProviderError::NotFound(SERVER_ID.to_string()))?;
        Ok(f(server))
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    async fn default_organization(&self) -> Result<String, ProviderError> {
        Ok("org-1".to_string())
    }

    async fn list_keys(&self, org_id: &str) -> Result<Vec<SshKey>, ProviderError> {
        assert_eq!(org_id, "org-1");
        self.record(Call::ListKeys);
        Ok(self.keys.clone())
    }

    async fn create_server(&self, req: &CreateServerRequest) -> Result<ServerHandle, ProviderError> {
        self.record(Call::Create(req.clone()));
        let server = ServerHandle {
            id: SERVER_ID.to_string(),
            name: req.name.clone(),
            status: VappStatus::Unresolved,
            public_address: None,
            private_address: None,
            hardware: self.template_hardware.clone().unwrap_or(Hardware {
                cpus: req.cpus,
                memory_mb: req.memory_mb,
                disks: vec![10],
            }),
            operating_system: None,
        };
        *self.server.lock().unwrap() = Some(server.clone());
        Ok(server)
    }

    async fn reconfigure(&self, id: &str, req: &ReconfigureRequest) -> Result<(), ProviderError> {
        assert_eq!(id, SERVER_ID);
        self.record(Call::Reconfigure(req.clone()));
        self.with_server(|server| {
            server.status = VappStatus::Resolved;
            server.hardware.disks.extend(&req.disks);
        })
    }

    async fn power_on(&self, id: &str) -> Result<(), ProviderError> {
        assert_eq!(id, SERVER_ID);
        self.record(Call::PowerOn);
        if self.fail_power_on {
            return Err(ProviderError::Api {
                status: 500,
                message: "vApp is busy".to_string(),
            });
        }
        self.with_server(|server| server.status = VappStatus::On)
    }

    async fn create_network_services(
        &self,
        id: &str,
        spec: &NetworkServiceSpec,
    ) -> Result<(), ProviderError> {
        assert_eq!(id, SERVER_ID);
        self.record(Call::Services(spec.clone()));
        let assign = self.assign_public_ip;
        self.with_server(|server| {
            if assign {
                server.public_address = Some(PUBLIC_IP.to_string());
            }
            server.private_address = Some(PRIVATE_IP.to_string());
        })
    }

    async fn get_server(&self, id: &str) -> Result<ServerHandle, ProviderError> {
        assert_eq!(id, SERVER_ID);
        self.record(Call::Get);
        let scripted = self.script.lock().unwrap().pop_front();
        let stuck_at = self.stuck_at;
        self.with_server(|server| {
            match scripted.or(stuck_at) {
                Some(status) => server.status = status,
                None if matches!(server.status, VappStatus::Unresolved | VappStatus::Resolved) => {
                    server.status = VappStatus::Off;
                }
                None => {}
            }
            server.clone()
        })
    }

    async fn delete_network_services(&self, _: &str) -> Result<(), ProviderError> {
        unreachable!("provisioning never deletes services")
    }

    async fn delete_server(&self, _: &str) -> Result<(), ProviderError> {
        unreachable!("provisioning never deletes servers")
    }
}

/// Dialer replaying canned outcomes, then answering with an SSH banner.
#[derive(Default)]
struct FakeDialer {
    outcomes: Mutex<VecDeque<io::Result<Option<String>>>>,
    dialed: Mutex<Vec<(String, u16)>>,
}

impl FakeDialer {
    fn scripted(outcomes: Vec<io::Result<Option<String>>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            dialed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, host: &str, port: u16, _: Duration) -> io::Result<Option<String>> {
        self.dialed.lock().unwrap().push((host.to_string(), port));
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Some("SSH-2.0-OpenSSH_5.3p1".to_string())))
    }
}

#[derive(Default)]
struct RecordingBootstrapper {
    inputs: Mutex<Vec<BootstrapInput>>,
    fail: bool,
}

#[async_trait]
impl Bootstrapper for RecordingBootstrapper {
    async fn bootstrap(&self, input: &BootstrapInput) -> Result<(), BootstrapError> {
        self.inputs.lock().unwrap().push(input.clone());
        if self.fail {
            Err(BootstrapError::Failed {
                program: "knife".to_string(),
                code: Some(1),
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl ProgressSink for RecordingSink {
    fn status(&self, message: &str) {
        self.push(format!("status:{message}"));
    }
    fn info(&self, message: &str) {
        self.push(format!("info:{message}"));
    }
    fn tick(&self) {
        self.push(".".to_string());
    }
    fn field(&self, label: &str, value: &str) {
        self.push(format!("{label}={value}"));
    }
    fn done(&self) {
        self.push("done".to_string());
    }
    fn warn(&self, message: &str) {
        self.push(format!("warn:{message}"));
    }
    fn error(&self, message: &str) {
        self.push(format!("error:{message}"));
    }
}

/// Everything a run needs, owned in one place.
struct Harness {
    provider: FakeProvider,
    dialer: FakeDialer,
    bootstrapper: RecordingBootstrapper,
    sink: RecordingSink,
    clock: ManualClock,
    timing: Timing,
}

impl Harness {
    fn new(provider: FakeProvider) -> Self {
        Self {
            provider,
            dialer: FakeDialer::default(),
            bootstrapper: RecordingBootstrapper::default(),
            sink: RecordingSink::default(),
            clock: ManualClock::new(),
            timing: Timing::default(),
        }
    }

    async fn run(&self, request: &ProvisionRequest) -> Result<terremark::Provisioned, ProvisionError> {
        Provisioner::new(&self.provider, &self.bootstrapper, &self.sink)
            .with_clock(&self.clock)
            .with_dialer(&self.dialer)
            .with_timing(self.timing.clone())
            .run(request)
            .await
    }

    fn count(&self, wanted: &Call) -> usize {
        self.provider.calls().iter().filter(|c| *c == wanted).count()
    }
}

fn web1() -> ProvisionRequest {
    ProvisionRequest::new("web1", "deploy")
        .unwrap()
        .with_image(Some("Ubuntu JeOS 10.04 (64-bit)".to_string()))
        .with_tcp_ports([80])
        .with_bootstrap(BootstrapOptions {
            ssh_user: "deploy".to_string(),
            run_list: vec!["role[web]".to_string()],
            ..BootstrapOptions::default()
        })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn end_to_end_completes_and_hands_off() {
    let harness = Harness::new(FakeProvider::new(&["alpha", "deploy"]));

    let result = harness.run(&web1()).await;
    assert_eq!(terminal_state(&result), TerminalState::Completed);
    let provisioned = result.unwrap();

    assert_eq!(provisioned.services.tcp, BTreeSet::from([22, 80]));
    assert_eq!(provisioned.server.public_address.as_deref(), Some(PUBLIC_IP));

    let input = &provisioned.bootstrap;
    assert_eq!(input.address, PUBLIC_IP);
    assert_eq!(input.ssh_user, "deploy");
    assert!(input.use_sudo);
    assert_eq!(input.node_name, SERVER_ID);
    assert_eq!(input.distro, "ubuntu10.04-gems");
    assert_eq!(input.run_list, vec!["role[web]".to_string()]);
    assert_eq!(*harness.bootstrapper.inputs.lock().unwrap(), vec![input.clone()]);

    let calls = harness.provider.calls();
    assert_eq!(calls[0], Call::ListKeys);
    assert_eq!(
        calls[1],
        Call::Create(CreateServerRequest {
            name: "web1".to_string(),
            image: Some("Ubuntu JeOS 10.04 (64-bit)".to_string()),
            ssh_key_fingerprint: "fp:deploy".to_string(),
            cpus: 1,
            memory_mb: 512,
        })
    );
    assert_eq!(harness.count(&Call::PowerOn), 1);
    assert!(!calls.iter().any(|c| matches!(c, Call::Reconfigure(_))));

    // Services open only after power on, and the handle is re-read after
    let power_on = calls.iter().position(|c| *c == Call::PowerOn).unwrap();
    let services = calls
        .iter()
        .position(|c| matches!(c, Call::Services(_)))
        .unwrap();
    assert!(services > power_on);
    assert_eq!(calls.last(), Some(&Call::Get));

    assert_eq!(
        *harness.dialer.dialed.lock().unwrap(),
        vec![(PUBLIC_IP.to_string(), 22)]
    );
    assert!(harness.clock.sleeps().contains(&Duration::from_secs(10)));

    let events = harness.sink.events();
    assert!(events.contains(&"status:Instantiating vApp web1".to_string()));
    assert!(events.contains(&"info:Instantiated vApp named [web1] as [vapp-1]".to_string()));
    assert!(events.contains(&format!("Public IP Address={PUBLIC_IP}")));
    assert!(events.contains(&format!("Private IP Address={PRIVATE_IP}")));
    assert_eq!(events.iter().filter(|e| *e == "done").count(), 1);
    assert_eq!(events.last(), Some(&"status:Bootstrapping web1...".to_string()));
}

#[tokio::test]
async fn missing_key_aborts_before_create() {
    let harness = Harness::new(FakeProvider::new(&["alpha", "beta"]));
    let request = ProvisionRequest::new("web1", "gamma").unwrap();

    let result = harness.run(&request).await;
    assert_eq!(terminal_state(&result), TerminalState::Aborted);
    match result {
        Err(ProvisionError::KeyNotFound(name)) => assert_eq!(name, "gamma"),
        other => panic!("unexpected result: {other:?}"),
    }

    assert_eq!(harness.provider.calls(), vec![Call::ListKeys]);
    assert!(harness.bootstrapper.inputs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn key_match_is_exact() {
    let harness = Harness::new(FakeProvider::new(&["deploy-old", "Deploy"]));

    let result = harness.run(&web1()).await;
    assert!(matches!(result, Err(ProvisionError::KeyNotFound(_))));
    assert!(!harness
        .provider
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Create(_))));
}

#[tokio::test]
async fn waits_until_ready_with_one_fetch_per_poll() {
    let provider = FakeProvider::new(&["deploy"]).with_script(&[
        VappStatus::Unresolved,
        VappStatus::Unresolved,
        VappStatus::Unresolved,
        VappStatus::Off,
    ]);
    let harness = Harness::new(provider);

    harness.run(&web1()).await.unwrap();

    let calls = harness.provider.calls();
    let power_on = calls.iter().position(|c| *c == Call::PowerOn).unwrap();
    let ready_fetches = calls[..power_on].iter().filter(|c| **c == Call::Get).count();
    assert_eq!(ready_fetches, 4);

    let events = harness.sink.events();
    let instantiated = events
        .iter()
        .position(|e| e == "status:Waiting for server to be Instantiated")
        .unwrap();
    let powering = events
        .iter()
        .position(|e| e == "status:Waiting for server to be Powered On")
        .unwrap();
    let ticks = events[instantiated..powering]
        .iter()
        .filter(|e| *e == ".")
        .count();
    assert_eq!(ticks, 4);
    assert_eq!(
        harness.clock.sleeps()[..3],
        [Duration::from_secs(1); 3]
    );
}

#[tokio::test]
async fn no_disks_means_no_reconfigure() {
    let harness = Harness::new(FakeProvider::new(&["deploy"]));
    harness.run(&web1().with_disks(Vec::new())).await.unwrap();

    assert!(!harness
        .provider
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Reconfigure(_))));
    assert!(!harness
        .sink
        .events()
        .contains(&"status:Waiting for additional disks to be configured".to_string()));
}

#[tokio::test]
async fn disks_reconfigure_once_with_existing_hardware() {
    let mut provider = FakeProvider::new(&["deploy"]);
    provider.template_hardware = Some(Hardware {
        cpus: 2,
        memory_mb: 2048,
        disks: vec![10],
    });
    let harness = Harness::new(provider);

    let request = web1().with_hardware(1, 512).with_disks(vec![25, 50]);
    let provisioned = harness.run(&request).await.unwrap();

    let reconfigures: Vec<ReconfigureRequest> = harness
        .provider
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Reconfigure(req) => Some(req),
            _ => None,
        })
        .collect();
    assert_eq!(
        reconfigures,
        vec![ReconfigureRequest {
            name: "web1".to_string(),
            cpus: 2,
            memory_mb: 2048,
            disks: vec![25, 50],
        }]
    );
    assert_eq!(provisioned.server.hardware.disks, vec![10, 25, 50]);

    // Reconfigure happens before power on, followed by the settle delay
    let calls = harness.provider.calls();
    let reconfigure = calls
        .iter()
        .position(|c| matches!(c, Call::Reconfigure(_)))
        .unwrap();
    let power_on = calls.iter().position(|c| *c == Call::PowerOn).unwrap();
    assert!(reconfigure < power_on);
    assert_eq!(
        harness
            .clock
            .sleeps()
            .iter()
            .filter(|d| **d == Duration::from_secs(10))
            .count(),
        2
    );
}

#[tokio::test]
async fn failure_after_create_leaves_server_in_place() {
    let mut provider = FakeProvider::new(&["deploy"]);
    provider.fail_power_on = true;
    let harness = Harness::new(provider);

    let result = harness.run(&web1()).await;
    assert_eq!(terminal_state(&result), TerminalState::FailedMidFlight);

    let err = result.unwrap_err();
    assert_eq!(err.server_id(), Some(SERVER_ID));
    assert!(matches!(
        err,
        ProvisionError::MidFlight {
            stage: Stage::PowerOn,
            source: StageError::Provider(ProviderError::Api { status: 500, .. }),
            ..
        }
    ));

    assert!(!harness
        .provider
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Services(_))));
    assert!(harness.bootstrapper.inputs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_public_address_stops_before_probing() {
    let mut provider = FakeProvider::new(&["deploy"]);
    provider.assign_public_ip = false;
    let harness = Harness::new(provider);

    let err = harness.run(&web1()).await.unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::MidFlight {
            stage: Stage::RefreshHandle,
            source: StageError::MissingPublicAddress,
            ..
        }
    ));
    assert!(harness.dialer.dialed.lock().unwrap().is_empty());
    assert!(harness.sink.events().contains(&"Public IP Address=".to_string()));
}

#[tokio::test]
async fn ssh_wait_tolerates_transient_errors() {
    let mut harness = Harness::new(FakeProvider::new(&["deploy"]));
    harness.dialer = FakeDialer::scripted(vec![
        Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
        Err(io::Error::from(io::ErrorKind::TimedOut)),
        Err(io::Error::from(io::ErrorKind::HostUnreachable)),
        Ok(None),
    ]);

    harness.run(&web1()).await.unwrap();

    assert_eq!(harness.dialer.dialed.lock().unwrap().len(), 5);
    let events = harness.sink.events();
    let waiting = events
        .iter()
        .position(|e| e == "status:Waiting for sshd")
        .unwrap();
    let done = events.iter().position(|e| e == "done").unwrap();
    assert_eq!(events[waiting + 1..done], [".", ".", ".", "."]);

    let backoffs = harness
        .clock
        .sleeps()
        .iter()
        .filter(|d| **d == Duration::from_secs(2))
        .count();
    assert_eq!(backoffs, 2);
}

#[tokio::test]
async fn bootstrap_failure_is_the_command_failure() {
    let mut harness = Harness::new(FakeProvider::new(&["deploy"]));
    harness.bootstrapper.fail = true;

    let result = harness.run(&web1()).await;
    assert_eq!(terminal_state(&result), TerminalState::FailedMidFlight);

    let err = result.unwrap_err();
    assert!(matches!(err, ProvisionError::Bootstrap { .. }));
    assert_eq!(err.to_string(), "knife bootstrap exited with status 1");
    assert_eq!(err.server_id(), Some(SERVER_ID));
}

#[tokio::test]
async fn invalid_request_makes_no_remote_calls() {
    let harness = Harness::new(FakeProvider::new(&["deploy"]));
    let mut request = web1();
    request.ssh_key_name = String::new();

    let result = harness.run(&request).await;
    assert_eq!(terminal_state(&result), TerminalState::Aborted);
    assert!(matches!(result, Err(ProvisionError::Preflight(_))));
    assert!(harness.provider.calls().is_empty());
}

#[tokio::test]
async fn node_name_override_reaches_bootstrap() {
    let harness = Harness::new(FakeProvider::new(&["deploy"]));
    let request = web1().with_bootstrap(BootstrapOptions {
        node_name: Some("web1.example.com".to_string()),
        ..BootstrapOptions::default()
    });

    let provisioned = harness.run(&request).await.unwrap();
    assert_eq!(provisioned.bootstrap.node_name, "web1.example.com");
    assert_eq!(provisioned.bootstrap.ssh_user, "root");
    assert!(!provisioned.bootstrap.use_sudo);
}

#[tokio::test]
async fn wait_timeout_ends_instantiation_wait() {
    let mut provider = FakeProvider::new(&["deploy"]);
    provider.stuck_at = Some(VappStatus::Unresolved);
    let mut harness = Harness::new(provider);
    harness.timing.poll = PollConfig::default().with_timeout(Some(Duration::from_secs(5)));

    let result = harness.run(&web1()).await;
    assert_eq!(terminal_state(&result), TerminalState::FailedMidFlight);

    let err = result.unwrap_err();
    assert_eq!(err.server_id(), Some(SERVER_ID));
    match err {
        ProvisionError::MidFlight {
            stage: Stage::WaitReady,
            source: StageError::Poll(PollError::Exhausted { elapsed, .. }),
            ..
        } => assert!(elapsed >= Duration::from_secs(5)),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(harness.count(&Call::PowerOn), 0);
}

#[tokio::test]
async fn wait_timeout_ends_power_on_wait() {
    let mut provider = FakeProvider::new(&["deploy"]);
    provider.stuck_at = Some(VappStatus::Off);
    let mut harness = Harness::new(provider);
    harness.timing.poll = PollConfig::default().with_timeout(Some(Duration::from_secs(5)));

    let err = harness.run(&web1()).await.unwrap_err();
    assert_eq!(err.server_id(), Some(SERVER_ID));
    assert!(matches!(
        err,
        ProvisionError::MidFlight {
            stage: Stage::PowerOn,
            source: StageError::Poll(PollError::Exhausted { .. }),
            ..
        }
    ));
    assert_eq!(harness.count(&Call::PowerOn), 1);
    assert!(!harness
        .provider
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Services(_))));
}

#[tokio::test]
async fn ssh_wait_budget_keeps_server_id() {
    let mut harness = Harness::new(FakeProvider::new(&["deploy"]));
    harness.dialer = FakeDialer::scripted(
        (0..10)
            .map(|_| Err(io::Error::from(io::ErrorKind::ConnectionRefused)))
            .collect(),
    );
    harness.timing.probe = ProbeConfig {
        budget: Some(Duration::from_secs(5)),
        ..ProbeConfig::default()
    };

    let result = harness.run(&web1()).await;
    assert_eq!(terminal_state(&result), TerminalState::FailedMidFlight);

    let err = result.unwrap_err();
    assert_eq!(err.server_id(), Some(SERVER_ID));
    match err {
        ProvisionError::MidFlight {
            stage: Stage::WaitSshReachable,
            source: StageError::Probe(ProbeError::Unreachable { host, port, attempts }),
            ..
        } => {
            assert_eq!(host, PUBLIC_IP);
            assert_eq!(port, 22);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(harness.bootstrapper.inputs.lock().unwrap().is_empty());
}
