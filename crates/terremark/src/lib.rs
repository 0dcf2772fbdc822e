//! Terremark vCloud server provisioning.
//!
//! This crate builds a vApp on Terremark vCloud, waits for it to come up,
//! exposes its ports, waits for sshd, and hands the machine over to
//! `knife bootstrap`.
//!
//! # Example
//!
//! ```rust,ignore
//! use terremark::bootstrap::KnifeBootstrap;
//! use terremark::output::TerminalSink;
//! use terremark::providers::terremark::Terremark;
//! use terremark::{ProvisionRequest, Provisioner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let provider = Terremark::new("user@example.com", "password")?;
//!     let knife = KnifeBootstrap::new();
//!     let request = ProvisionRequest::new("web1", "deploy")?.with_tcp_ports([80]);
//!
//!     let provisioned = Provisioner::new(&provider, &knife, &TerminalSink)
//!         .run(&request)
//!         .await?;
//!     println!("{:?}", provisioned.server.public_address);
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod output;
pub mod poll;
pub mod probe;
pub mod providers;
pub mod provision;

pub use error::{PreflightError, ProvisionError, Stage, StageError, TerminalState};
pub use providers::terremark::Terremark;
pub use providers::{CloudProvider, NetworkServiceSpec, ProviderError, ServerHandle};
pub use provision::{ProvisionRequest, Provisioned, Provisioner, Timing};
