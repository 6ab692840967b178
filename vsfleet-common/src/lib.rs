use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod version;

// --- Enums ---

/// Lifecycle of one managed VM as reported to the host runtime.
///
/// Never stored: recomputed from power state and guest network on every observation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Creating, // Powered on, guest tools have not reported an IPv4 address yet
    Running,  // Powered on with a routable IPv4 address
    Deleting, // Not powered on: not a member of the live fleet
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Creating => "creating",
            LifecycleState::Running => "running",
            LifecycleState::Deleting => "deleting",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How new instances are materialized from the source template.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DeployType {
    InstantClone,
    FullClone,
    LibraryDeploy,
}

impl DeployType {
    /// Accepts the historical plugin spellings as well as the kebab-case names.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instantclone" | "instant-clone" => Some(DeployType::InstantClone),
            "clone" | "full-clone" | "fullclone" => Some(DeployType::FullClone),
            "librarydeploy" | "contentlibrary" | "content-library" | "library-deploy" => {
                Some(DeployType::LibraryDeploy)
            }
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeployType::InstantClone => "instant-clone",
            DeployType::FullClone => "full-clone",
            DeployType::LibraryDeploy => "library-deploy",
        }
    }
}

impl fmt::Display for DeployType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Host contract ---

/// How the host runtime should reach an instance once it has an address.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectorConfig {
    pub os: String,
    pub arch: String,
    pub protocol: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    pub use_static_credentials: bool,
}

/// Settings handed over by the host runtime at Init.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub connector_config: ConnectorConfig,
}

impl Settings {
    pub fn use_static_credentials(&self) -> bool {
        self.connector_config.use_static_credentials
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: String,
    pub max_size: usize,
    pub version: String,
    pub build_info: String,
}

/// Connection details for one instance, valid until `expires`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    #[serde(flatten)]
    pub connector_config: ConnectorConfig,
    pub id: String,
    pub internal_addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_addr: Option<String>,
    pub expires: Option<DateTime<Utc>>,
}

/// One observation reported by `Update`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InstanceObservation {
    pub name: String,
    pub state: LifecycleState,
}
