//! Provider abstractions for vCloud providers.

pub mod terremark;
mod traits;

pub use traits::{
    CloudProvider, CreateServerRequest, Hardware, NetworkServiceSpec, ProviderError,
    ReconfigureRequest, ServerHandle, SshKey, VappStatus, SSH_PORT,
};
