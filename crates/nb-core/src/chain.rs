use crate::filter::{FILTER_TABLE, FilterError, PacketFilter};
use crate::retry::RetryPolicy;
use crate::rulespec::{fall_through_spec, jump_spec};
use rand::Rng;
use std::fmt;

/// Stage of host traffic processing a chain can be linked into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    Inbound,
    Forwarded,
    Outbound,
}

impl HookPoint {
    /// Built-in chain implementing this stage
    pub fn chain(&self) -> &'static str {
        match self {
            HookPoint::Inbound => "INPUT",
            HookPoint::Forwarded => "FORWARD",
            HookPoint::Outbound => "OUTPUT",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.chain())
    }
}

/// Step of a best-effort cleanup that failed
#[derive(Debug, Clone)]
pub struct CleanupFailure {
    pub step: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: String, result: Result<(), FilterError>) {
        if let Err(err) = result {
            tracing::warn!(step = %step, error = %err, "cleanup step failed");
            self.failures.push(CleanupFailure {
                step,
                error: err.to_string(),
            });
        }
    }
}

/// Owns the lifecycle of the private chain
#[derive(Debug, Clone)]
pub struct ChainManager {
    name: String,
    hooks: Vec<HookPoint>,
    retry: RetryPolicy,
}

impl ChainManager {
    pub fn new(name: impl Into<String>, hook_outbound: bool, retry: RetryPolicy) -> Self {
        let mut hooks = vec![HookPoint::Inbound, HookPoint::Forwarded];
        if hook_outbound {
            hooks.push(HookPoint::Outbound);
        }
        Self {
            name: name.into(),
            hooks,
            retry,
        }
    }

    /// `<prefix>-<8 hex chars>`, unique enough to keep concurrent instances apart
    pub fn generate_name(prefix: &str) -> String {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 4] = rng.r#gen();
        format!(
            "{}-{:02x}{:02x}{:02x}{:02x}",
            prefix, bytes[0], bytes[1], bytes[2], bytes[3]
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hooks(&self) -> &[HookPoint] {
        &self.hooks
    }

    /// Reset the chain, add the fall-through rule and link it into every hook
    /// point. The whole sequence is retried as one unit.
    pub fn initialize(&self, filter: &dyn PacketFilter) -> Result<(), FilterError> {
        let jump = jump_spec(&self.name);

        self.retry.retry("initialize chain", || -> Result<(), FilterError> {
            filter.clear_chain(FILTER_TABLE, &self.name)?;
            filter.append(FILTER_TABLE, &self.name, &fall_through_spec())?;
            for hook in &self.hooks {
                // a previous attempt may already have linked this hook
                if !filter.exists(FILTER_TABLE, hook.chain(), &jump)? {
                    filter.insert(FILTER_TABLE, hook.chain(), 1, &jump)?;
                }
            }
            Ok(())
        })?;

        tracing::info!(chain = %self.name, hooks = ?self.hooks, "chain initialized");
        Ok(())
    }

    /// Unlink, flush and delete the chain. Every step runs once, and a failed
    /// step never stops the ones after it.
    pub fn cleanup(&self, filter: &dyn PacketFilter) -> CleanupReport {
        let mut report = CleanupReport::default();
        let jump = jump_spec(&self.name);

        for hook in &self.hooks {
            let result = filter
                .delete(FILTER_TABLE, hook.chain(), &jump)
                .map(|removed| {
                    if !removed {
                        tracing::debug!(hook = %hook, chain = %self.name, "chain was not linked");
                    }
                });
            report.record(format!("remove {} jump rule", hook), result);
        }

        report.record(
            format!("flush '{}' chain", self.name),
            filter.flush_chain(FILTER_TABLE, &self.name),
        );
        report.record(
            format!("remove '{}' chain", self.name),
            filter.delete_chain(FILTER_TABLE, &self.name),
        );

        if report.is_clean() {
            tracing::info!(chain = %self.name, "chain removed");
        }
        report
    }
}
