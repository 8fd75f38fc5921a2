//! Which process to observe.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

#[derive(Default, Debug, Serialize, Deserialize, Validate, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    /// Process id of the target. Takes precedence over `window_name`.
    #[serde(default)]
    pub process_id: Option<u32>,

    /// Process name to resolve the target by.
    #[validate(length(min = 1, max = 255))]
    #[serde(default)]
    pub window_name: Option<String>,

    /// Forces the monitored local address instead of deriving it from the
    /// target's connections.
    #[serde(default)]
    pub local_ip: Option<Ipv4Addr>,
}

impl TargetConfig {
    pub fn is_configured(&self) -> bool {
        self.process_id.is_some() || self.window_name.is_some()
    }
}
