//! Elastic instance-group controller for vSphere.
//!
//! [`group::InstanceGroup`] is the entry point: it validates the plugin
//! configuration, opens a gateway session and scales the group out and in.

pub mod config;
pub mod error;
pub mod group;
pub mod http;
pub mod lifecycle;
pub mod naming;
pub mod network;
pub mod provider_manager;
pub mod provisioner;
pub mod readiness;
pub mod remote;
pub mod teardown;

pub use config::{GroupConfig, PluginConfig};
pub use error::{GroupError, TaskPhase};
pub use group::{DecreaseFailure, IncreaseReport, InstanceGroup, ProvisionOutcome};
pub use readiness::ReadinessPolicy;
