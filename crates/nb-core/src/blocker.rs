use crate::applier::RuleApplier;
use crate::chain::{ChainManager, CleanupReport, HookPoint};
use crate::config::BlockerConfig;
use crate::error::BlockerError;
use crate::filter::PacketFilter;
use crate::query::{Decision, RuleQuery};
use crate::target::{Action, Target};

/// One service instance: a packet filter handle plus the private chain it owns.
///
/// Every call blocks until the packet filter answers or the retry budget runs
/// out. A failed `apply` is fail-open: see [`crate::TargetState`].
pub struct Blocker {
    filter: Box<dyn PacketFilter>,
    chain: ChainManager,
    applier: RuleApplier,
    query: RuleQuery,
}

impl Blocker {
    /// Validate `config` and pick a fresh random chain name
    pub fn new(filter: Box<dyn PacketFilter>, config: &BlockerConfig) -> Result<Self, BlockerError> {
        config.validate()?;
        let name = ChainManager::generate_name(&config.chain_prefix);
        Ok(Self::with_chain_name(filter, name, config))
    }

    pub fn with_chain_name(
        filter: Box<dyn PacketFilter>,
        name: impl Into<String>,
        config: &BlockerConfig,
    ) -> Self {
        Self {
            filter,
            chain: ChainManager::new(name, config.hook_outbound, config.retry.clone()),
            applier: RuleApplier::new(config.retry.clone(), config.rollback_on_failure),
            query: RuleQuery::new(config.retry.clone()),
        }
    }

    pub fn chain_name(&self) -> &str {
        self.chain.name()
    }

    pub fn hooks(&self) -> &[HookPoint] {
        self.chain.hooks()
    }

    /// Create the chain and link it in. The service must not serve requests
    /// when this fails.
    pub fn initialize(&self) -> Result<(), BlockerError> {
        self.chain
            .initialize(self.filter.as_ref())
            .map_err(|source| BlockerError::Initialize {
                chain: self.chain.name().to_string(),
                source,
            })
    }

    /// Best-effort teardown; failures are logged and reported, never raised
    pub fn cleanup(&self) -> CleanupReport {
        self.chain.cleanup(self.filter.as_ref())
    }

    pub fn apply(&self, target: &Target, action: Action) -> Result<(), BlockerError> {
        self.applier
            .apply(self.filter.as_ref(), self.chain.name(), target, action)?;
        Ok(())
    }

    pub fn rules(&self) -> Result<Vec<String>, BlockerError> {
        self.query
            .rules(self.filter.as_ref(), self.chain.name())
            .map_err(|source| BlockerError::List {
                chain: self.chain.name().to_string(),
                source,
            })
    }

    /// Active decisions in evaluation order
    pub fn decisions(&self) -> Result<Vec<Decision>, BlockerError> {
        Ok(Decision::from_lines(&self.rules()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TargetState;
    use crate::filter::FILTER_TABLE;
    use crate::memory::{FilterOp, MemoryFilter};
    use crate::retry::RetryPolicy;

    const CHAIN: &str = "NETBLK-cafe0001";

    fn blocker() -> (MemoryFilter, Blocker) {
        let filter = MemoryFilter::new();
        let config = BlockerConfig {
            retry: RetryPolicy::immediate(3),
            ..BlockerConfig::default()
        };
        let blocker = Blocker::with_chain_name(Box::new(filter.clone()), CHAIN, &config);
        blocker.initialize().unwrap();
        (filter, blocker)
    }

    fn rules_for(blocker: &Blocker, target: &Target) -> Vec<Decision> {
        blocker
            .decisions()
            .unwrap()
            .into_iter()
            .filter(|d| &d.target == target)
            .collect()
    }

    #[test]
    fn new_generates_prefixed_chain_name() {
        let config = BlockerConfig {
            chain_prefix: "TESTBLK".into(),
            ..BlockerConfig::default()
        };
        let blocker = Blocker::new(Box::new(MemoryFilter::new()), &config).unwrap();
        assert!(blocker.chain_name().starts_with("TESTBLK-"));
        assert_eq!(blocker.hooks().len(), 3);
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = BlockerConfig {
            chain_prefix: String::new(),
            ..BlockerConfig::default()
        };
        assert!(matches!(
            Blocker::new(Box::new(MemoryFilter::new()), &config),
            Err(BlockerError::Config(_))
        ));
    }

    #[test]
    fn drop_then_rules_lists_one_drop() {
        let (_, blocker) = blocker();
        let port = Target::tcp_port(8529).unwrap();

        blocker.apply(&port, Action::Drop).unwrap();

        let rules = blocker.rules().unwrap();
        assert!(rules.contains(&format!("-A {} -p tcp -m tcp --dport 8529 -j DROP", CHAIN)));
        assert!(!rules.iter().any(|r| r.contains("8529") && r.ends_with("REJECT")));
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let (_, blocker) = blocker();
        let port = Target::tcp_port(8529).unwrap();

        for _ in 0..2 {
            blocker.apply(&port, Action::Reject).unwrap();
            assert_eq!(rules_for(&blocker, &port).len(), 1);
        }
    }

    #[test]
    fn drop_then_reject_leaves_only_reject() {
        let (_, blocker) = blocker();
        let port = Target::tcp_port(8529).unwrap();

        blocker.apply(&port, Action::Drop).unwrap();
        blocker.apply(&port, Action::Reject).unwrap();

        let decisions = rules_for(&blocker, &port);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, Action::Reject);
    }

    #[test]
    fn accept_removes_denying_rule() {
        let (_, blocker) = blocker();
        let source = Target::source("10.0.0.5", "").unwrap();

        blocker.apply(&source, Action::Reject).unwrap();
        blocker.apply(&source, Action::Accept).unwrap();

        assert!(!blocker.rules().unwrap().iter().any(|r| r.contains("10.0.0.5")));
    }

    #[test]
    fn accept_without_rule_is_noop() {
        let (_, blocker) = blocker();
        let before = blocker.rules().unwrap();

        blocker
            .apply(&Target::tcp_port(22).unwrap(), Action::Accept)
            .unwrap();

        assert_eq!(blocker.rules().unwrap(), before);
    }

    #[test]
    fn new_rules_precede_fall_through() {
        let (_, blocker) = blocker();
        blocker
            .apply(&Target::source("", "eth1").unwrap(), Action::Drop)
            .unwrap();

        let rules = blocker.rules().unwrap();
        assert_eq!(rules.last().unwrap(), &format!("-A {} -j RETURN", CHAIN));
        assert_eq!(rules[1], format!("-A {} -i eth1 -j DROP", CHAIN));
    }

    #[test]
    fn distinct_targets_coexist() {
        let (_, blocker) = blocker();
        let port = Target::tcp_port(8529).unwrap();
        let source = Target::source("10.0.0.5", "eth0").unwrap();

        blocker.apply(&port, Action::Drop).unwrap();
        blocker.apply(&source, Action::Reject).unwrap();
        blocker.apply(&port, Action::Accept).unwrap();

        let decisions = blocker.decisions().unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].target, source);
    }

    #[test]
    fn exhausted_retries_name_target_and_action() {
        let (filter, blocker) = blocker();
        filter.fail_next(FilterOp::Exists, 3, true);

        let err = blocker
            .apply(&Target::tcp_port(8529).unwrap(), Action::Drop)
            .unwrap_err();

        assert_eq!(err.target_state(), Some(TargetState::Unchanged));
        let message = err.to_string();
        assert!(message.contains("tcp port 8529"));
        assert!(message.contains("drop"));

        // the caller keeps working once the filter recovers
        blocker
            .apply(&Target::tcp_port(8529).unwrap(), Action::Drop)
            .unwrap();
    }

    #[test]
    fn concurrent_applies_leave_one_denying_rule() {
        let (_, blocker) = blocker();
        let port = Target::tcp_port(8529).unwrap();

        std::thread::scope(|scope| {
            for i in 0..8 {
                let (blocker, port) = (&blocker, &port);
                scope.spawn(move || {
                    let action = if i % 2 == 0 { Action::Drop } else { Action::Reject };
                    for _ in 0..25 {
                        blocker.apply(port, action).unwrap();
                    }
                });
            }
        });

        assert_eq!(rules_for(&blocker, &port).len(), 1);
    }

    #[test]
    fn list_failure_surfaces_after_retries() {
        let (filter, blocker) = blocker();
        filter.fail_next(FilterOp::List, 3, true);

        assert!(matches!(blocker.rules(), Err(BlockerError::List { .. })));
        assert!(blocker.rules().is_ok());
    }

    #[test]
    fn initialize_failure_is_reported() {
        let filter = MemoryFilter::new();
        filter.fail_next(FilterOp::ClearChain, 5, true);
        let config = BlockerConfig {
            retry: RetryPolicy::immediate(2),
            ..BlockerConfig::default()
        };
        let blocker = Blocker::with_chain_name(Box::new(filter), CHAIN, &config);

        assert!(matches!(
            blocker.initialize(),
            Err(BlockerError::Initialize { .. })
        ));
    }

    #[test]
    fn separate_instances_do_not_interfere() {
        let filter = MemoryFilter::new();
        let config = BlockerConfig {
            retry: RetryPolicy::immediate(1),
            ..BlockerConfig::default()
        };
        let a = Blocker::with_chain_name(Box::new(filter.clone()), "NETBLK-a", &config);
        let b = Blocker::with_chain_name(Box::new(filter.clone()), "NETBLK-b", &config);
        a.initialize().unwrap();
        b.initialize().unwrap();

        a.apply(&Target::tcp_port(80).unwrap(), Action::Drop).unwrap();
        assert!(b.decisions().unwrap().is_empty());

        assert!(b.cleanup().is_clean());
        assert!(filter.chain_exists(FILTER_TABLE, "NETBLK-a"));
        assert_eq!(a.decisions().unwrap().len(), 1);
    }
}
