use vsfleet_common::LifecycleState;
use vsfleet_providers::inventory::{GuestNic, PowerState};

use crate::network;

/// Derive the lifecycle state from observed power state and guest network.
///
/// Anything not powered on (off, suspended, unknown) is `Deleting`: the VM is not
/// part of the live fleet, whatever its network reports.
pub fn classify(power_state: PowerState, nics: &[GuestNic]) -> LifecycleState {
    if power_state != PowerState::PoweredOn {
        return LifecycleState::Deleting;
    }
    match network::resolve_ipv4(nics) {
        Some(_) => LifecycleState::Running,
        None => LifecycleState::Creating,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        let ready = vec![GuestNic::with_addresses("00:50:56:00:00:01", &["10.0.0.5"])];
        let v6_only = vec![GuestNic::with_addresses("00:50:56:00:00:01", &["fe80::1"])];

        for (power, nics, expected) in [
            (PowerState::PoweredOn, ready.clone(), LifecycleState::Running),
            (PowerState::PoweredOn, v6_only.clone(), LifecycleState::Creating),
            (PowerState::PoweredOn, vec![], LifecycleState::Creating),
            (PowerState::PoweredOff, ready.clone(), LifecycleState::Deleting),
            (PowerState::Suspended, ready.clone(), LifecycleState::Deleting),
            (PowerState::Unknown, vec![], LifecycleState::Deleting),
        ] {
            assert_eq!(classify(power, &nics), expected, "{:?} {:?}", power, nics);
            // Same inputs, same answer.
            assert_eq!(classify(power, &nics), classify(power, &nics));
        }
    }
}
