//! User-visible messages raised by the liveness monitors.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    HealthCheckFailed,
    HealthCheckSuccess,
    IpAddressDown,
    IpAddressUp,
    NodeInactive,
    RemoteStartFailed,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HealthCheckFailed => "HealthCheckFailed",
            Self::HealthCheckSuccess => "HealthCheckSuccess",
            Self::IpAddressDown => "IpAddressDown",
            Self::IpAddressUp => "IpAddressUp",
            Self::NodeInactive => "NodeInactive",
            Self::RemoteStartFailed => "RemoteStartFailed",
        }
    }

    pub fn default_level(&self) -> MessageLevel {
        match self {
            Self::HealthCheckFailed | Self::IpAddressDown | Self::NodeInactive => {
                MessageLevel::Error
            }
            Self::HealthCheckSuccess | Self::IpAddressUp => MessageLevel::Success,
            Self::RemoteStartFailed => MessageLevel::Warning,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl MessageLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}
