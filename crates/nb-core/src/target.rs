use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL).
const MAX_INTERFACE_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Accept,
    Drop,
    Reject,
}

impl Action {
    /// Jump target understood by the packet filter
    pub fn as_target(&self) -> &'static str {
        match self {
            Action::Accept => "ACCEPT",
            Action::Drop => "DROP",
            Action::Reject => "REJECT",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Accept => "accept",
            Action::Drop => "drop",
            Action::Reject => "reject",
        }
    }

    /// Actions that must be removed for a target before this one is applied
    pub fn conflicts(&self) -> &'static [Action] {
        match self {
            Action::Accept => &[Action::Reject, Action::Drop],
            Action::Drop => &[Action::Reject],
            Action::Reject => &[Action::Drop],
        }
    }

    pub fn is_denying(&self) -> bool {
        !matches!(self, Action::Accept)
    }

    pub(crate) fn from_target(target: &str) -> Option<Self> {
        match target {
            "ACCEPT" => Some(Action::Accept),
            "DROP" => Some(Action::Drop),
            "REJECT" => Some(Action::Reject),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accept" => Ok(Action::Accept),
            "drop" => Ok(Action::Drop),
            "reject" => Ok(Action::Reject),
            _ => Err(TargetError::UnknownAction(s.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("unknown action '{0}' (expected accept, drop or reject)")]
    UnknownAction(String),

    #[error("invalid TCP port {0}")]
    InvalidPort(u32),

    #[error("invalid IPv4 address '{0}'")]
    InvalidAddress(String),

    #[error("invalid interface name '{0}'")]
    InvalidInterface(String),

    #[error("a source address or an interface is required")]
    EmptySource,
}

/// Traffic selector named by a control request.
///
/// Built only through [`Target::tcp_port`] and [`Target::source`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Target {
    Port {
        port: u16,
    },
    Source {
        #[serde(skip_serializing_if = "Option::is_none")]
        address: Option<Ipv4Addr>,
        #[serde(skip_serializing_if = "Option::is_none")]
        interface: Option<String>,
    },
}

impl Target {
    pub fn tcp_port(port: u16) -> Result<Self, TargetError> {
        if port == 0 {
            return Err(TargetError::InvalidPort(0));
        }
        Ok(Target::Port { port })
    }

    /// Build a source target; empty strings count as absent.
    pub fn source(address: &str, interface: &str) -> Result<Self, TargetError> {
        let address = address.trim();
        let interface = interface.trim();

        let address = if address.is_empty() {
            None
        } else {
            let host = address.strip_suffix("/32").unwrap_or(address);
            Some(
                host.parse::<Ipv4Addr>()
                    .map_err(|_| TargetError::InvalidAddress(address.to_string()))?,
            )
        };

        let interface = if interface.is_empty() {
            None
        } else {
            validate_interface(interface)?;
            Some(interface.to_string())
        };

        if address.is_none() && interface.is_none() {
            return Err(TargetError::EmptySource);
        }

        Ok(Target::Source { address, interface })
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Port { .. } => "port",
            Target::Source { .. } => "source",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Port { port } => write!(f, "tcp port {}", port),
            Target::Source {
                address: Some(addr),
                interface: Some(iface),
            } => write!(f, "source {} on {}", addr, iface),
            Target::Source {
                address: Some(addr),
                interface: None,
            } => write!(f, "source {}", addr),
            Target::Source {
                address: None,
                interface: Some(iface),
            } => write!(f, "interface {}", iface),
            Target::Source {
                address: None,
                interface: None,
            } => f.write_str("empty source"),
        }
    }
}

fn validate_interface(name: &str) -> Result<(), TargetError> {
    let invalid = name.len() > MAX_INTERFACE_LEN
        || name.chars().any(|c| c.is_whitespace() || c == '/');
    if invalid {
        return Err(TargetError::InvalidInterface(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_actions() {
        assert_eq!(Action::Drop.conflicts(), &[Action::Reject]);
        assert_eq!(Action::Reject.conflicts(), &[Action::Drop]);
        assert_eq!(Action::Accept.conflicts(), &[Action::Reject, Action::Drop]);
    }

    #[test]
    fn parses_actions_case_insensitively() {
        assert_eq!("DROP".parse::<Action>().unwrap(), Action::Drop);
        assert_eq!("reject".parse::<Action>().unwrap(), Action::Reject);
        assert!("block".parse::<Action>().is_err());
    }

    #[test]
    fn port_zero_is_rejected() {
        assert_eq!(Target::tcp_port(0), Err(TargetError::InvalidPort(0)));
        assert_eq!(Target::tcp_port(8529).unwrap(), Target::Port { port: 8529 });
    }

    #[test]
    fn source_requires_address_or_interface() {
        assert_eq!(Target::source("", " "), Err(TargetError::EmptySource));

        let target = Target::source("10.0.0.5/32", "").unwrap();
        assert_eq!(target.to_string(), "source 10.0.0.5");

        let target = Target::source("", "eth0").unwrap();
        assert_eq!(target.to_string(), "interface eth0");
    }

    #[test]
    fn source_rejects_bad_input() {
        assert!(matches!(
            Target::source("10.0.0.300", ""),
            Err(TargetError::InvalidAddress(_))
        ));
        assert!(matches!(
            Target::source("::1", ""),
            Err(TargetError::InvalidAddress(_))
        ));
        assert!(matches!(
            Target::source("", "a-very-long-interface-name"),
            Err(TargetError::InvalidInterface(_))
        ));
    }
}
