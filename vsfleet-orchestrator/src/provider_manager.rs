use std::env;
use std::sync::Arc;
use vsfleet_providers::GatewayConnector;

pub struct ProviderManager;

impl ProviderManager {
    pub fn current_provider_name() -> String {
        env::var("VSFLEET_GATEWAY")
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "vsphere".to_string())
    }

    /// Connector for the named gateway, if it was compiled in.
    pub fn get_connector(provider_name: &str) -> Option<Arc<dyn GatewayConnector>> {
        match provider_name.to_lowercase().as_str() {
            #[cfg(feature = "provider-vsphere")]
            "vsphere" => {
                let mut connector = vsfleet_providers::vsphere::VsphereConnector::new();
                if let Some(secs) = env::var("VSPHERE_TASK_POLL_SECS")
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .filter(|s| *s > 0)
                {
                    connector = connector.with_task_poll_interval(std::time::Duration::from_secs(secs));
                }
                Some(Arc::new(connector))
            }
            #[cfg(feature = "provider-mock")]
            "mock" => Some(Arc::new(vsfleet_providers::mock::Simulator::vpx())),
            _ => None,
        }
    }
}
