use crate::filter::{FILTER_TABLE, FilterError, PacketFilter};
use crate::retry::RetryPolicy;
use crate::target::{Action, Target};
use serde::Serialize;

/// Reads the private chain back from the packet filter
#[derive(Debug, Clone)]
pub struct RuleQuery {
    retry: RetryPolicy,
}

impl RuleQuery {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// Rule lines in evaluation order (first match wins)
    pub fn rules(&self, filter: &dyn PacketFilter, chain: &str) -> Result<Vec<String>, FilterError> {
        self.retry
            .retry("list rules", || filter.list(FILTER_TABLE, chain))
    }
}

/// An active admission decision recovered from a rule line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub target: Target,
    pub action: Action,
}

impl Decision {
    /// Parse a `-A <chain> ...` line as written by this service.
    ///
    /// Returns `None` for chain headers, the fall-through rule and anything
    /// this service would not have produced.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "-A" {
            return None;
        }
        tokens.next()?;

        let mut protocol = None;
        let mut port = None;
        let mut address = None;
        let mut interface = None;
        let mut action = None;

        while let Some(flag) = tokens.next() {
            let value = tokens.next()?;
            match flag {
                "-p" => protocol = Some(value),
                "-m" => {}
                "--dport" => port = Some(value.parse::<u16>().ok()?),
                "-s" => address = Some(value.strip_suffix("/32")?),
                "-i" => interface = Some(value),
                "-j" => action = Some(Action::from_target(value)?),
                // iptables echoes the default REJECT type back
                "--reject-with" => {}
                _ => return None,
            }
        }

        let target = match (protocol, port, address, interface) {
            (Some("tcp"), Some(port), None, None) => Target::tcp_port(port).ok()?,
            (None, None, address, interface) => {
                Target::source(address.unwrap_or_default(), interface.unwrap_or_default()).ok()?
            }
            _ => return None,
        };

        Some(Self {
            target,
            action: action?,
        })
    }

    pub fn from_lines(lines: &[String]) -> Vec<Self> {
        lines.iter().filter_map(|line| Self::parse(line)).collect()
    }
}
