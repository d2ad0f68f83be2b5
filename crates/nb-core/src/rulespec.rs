// Match/action token builders
use crate::target::{Action, Target};
use std::net::Ipv4Addr;

/// Rule spec for a target, in the exact token order the filter echoes back
pub fn rule_spec(target: &Target, action: Action) -> Vec<String> {
    match target {
        Target::Port { port } => build_port_spec(*port, action),
        Target::Source { address, interface } => {
            build_source_spec(address.as_ref(), interface.as_deref(), action)
        }
    }
}

pub fn build_port_spec(port: u16, action: Action) -> Vec<String> {
    let mut spec = tokens(&["-p", "tcp", "-m", "tcp", "--dport"]);
    spec.push(port.to_string());
    spec.extend(jump(action.as_target()));
    spec
}

pub fn build_source_spec(
    address: Option<&Ipv4Addr>,
    interface: Option<&str>,
    action: Action,
) -> Vec<String> {
    let mut spec = Vec::new();
    if let Some(addr) = address {
        spec.push("-s".to_string());
        spec.push(format!("{}/32", addr));
    }
    if let Some(iface) = interface {
        spec.push("-i".to_string());
        spec.push(iface.to_string());
    }
    spec.extend(jump(action.as_target()));
    spec
}

/// Terminal rule that hands control back to the calling chain
pub fn fall_through_spec() -> Vec<String> {
    jump("RETURN")
}

/// Hook-point rule that sends traffic into `chain`
pub fn jump_spec(chain: &str) -> Vec<String> {
    jump(chain)
}

fn jump(target: &str) -> Vec<String> {
    vec!["-j".to_string(), target.to_string()]
}

fn tokens(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_spec_matches_tcp_destination() {
        assert_eq!(
            build_port_spec(8529, Action::Drop),
            vec!["-p", "tcp", "-m", "tcp", "--dport", "8529", "-j", "DROP"]
        );
    }

    #[test]
    fn source_spec_uses_single_host_and_interface() {
        let addr: Ipv4Addr = "10.0.0.5".parse().unwrap();
        assert_eq!(
            build_source_spec(Some(&addr), Some("eth1"), Action::Reject),
            vec!["-s", "10.0.0.5/32", "-i", "eth1", "-j", "REJECT"]
        );
        assert_eq!(
            build_source_spec(None, Some("eth1"), Action::Drop),
            vec!["-i", "eth1", "-j", "DROP"]
        );
    }

    #[test]
    fn specs_are_deterministic() {
        let target = Target::source("192.168.1.20", "br0").unwrap();
        assert_eq!(
            rule_spec(&target, Action::Drop),
            rule_spec(&target, Action::Drop)
        );
        assert_ne!(
            rule_spec(&target, Action::Drop),
            rule_spec(&target, Action::Reject)
        );
    }
}
