//! Terremark vCloud Express provider.
//!
//! Implements the [`CloudProvider`](super::CloudProvider) trait for the
//! Terremark vCloud API.

mod client;
mod models;

pub use client::Terremark;
pub use models::*;
