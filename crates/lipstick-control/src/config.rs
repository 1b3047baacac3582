//! Manager configuration

use std::time::Duration;

use lipstick_router::SniffLimits;

use crate::registry::RegistrationPolicy;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Byte/time budget for finding the target domain of an inbound connection
    pub sniff: SniffLimits,
    /// How long an inbound connection waits for its proxy stream
    pub pairing_timeout: Duration,
    /// Bound of each of the three ingress queues
    pub queue_capacity: usize,
    pub registration_policy: RegistrationPolicy,
    /// Outgoing message buffer per control link
    pub link_channel_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            sniff: SniffLimits::default(),
            pairing_timeout: Duration::from_secs(10),
            queue_capacity: 1024,
            registration_policy: RegistrationPolicy::Reject,
            link_channel_capacity: 256,
        }
    }
}
