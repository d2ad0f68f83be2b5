use crate::error::{ApplyError, ApplyStage, TargetState};
use crate::filter::{FILTER_TABLE, FilterError, PacketFilter};
use crate::retry::RetryPolicy;
use crate::rulespec::rule_spec;
use crate::target::{Action, Target};
use std::sync::Mutex;

/// Installs admission decisions into the private chain.
///
/// For any target the chain holds at most one denying rule. Accepting a
/// target means removing its denying rule; no ACCEPT rule is ever written.
#[derive(Debug)]
pub struct RuleApplier {
    retry: RetryPolicy,
    rollback_on_failure: bool,
    // serializes check-then-mutate sequences issued by this process
    writer: Mutex<()>,
}

impl RuleApplier {
    pub fn new(retry: RetryPolicy, rollback_on_failure: bool) -> Self {
        Self {
            retry,
            rollback_on_failure,
            writer: Mutex::new(()),
        }
    }

    pub fn apply(
        &self,
        filter: &dyn PacketFilter,
        chain: &str,
        target: &Target,
        action: Action,
    ) -> Result<(), ApplyError> {
        let _writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut removed: Vec<Action> = Vec::new();

        for &conflicting in action.conflicts() {
            let spec = rule_spec(target, conflicting);
            let found = self
                .retry
                .retry("check rule", || filter.exists(FILTER_TABLE, chain, &spec))
                .map_err(|source| {
                    failure(target, action, ApplyStage::CheckConflict(conflicting), &removed, source)
                })?;
            if !found {
                continue;
            }

            let deleted = self
                .retry
                .retry("remove rule", || filter.delete(FILTER_TABLE, chain, &spec))
                .map_err(|source| {
                    failure(target, action, ApplyStage::RemoveConflict(conflicting), &removed, source)
                })?;
            if deleted {
                tracing::debug!(%target, action = %conflicting, chain, "removed conflicting rule");
            }
            removed.push(conflicting);
        }

        if !action.is_denying() {
            if removed.is_empty() {
                tracing::debug!(%target, chain, "already accepting");
            } else {
                tracing::info!("Accepting traffic for {}", target);
            }
            return Ok(());
        }

        let spec = rule_spec(target, action);
        let inserted = self
            .retry
            .retry("insert rule", || -> Result<bool, FilterError> {
                if filter.exists(FILTER_TABLE, chain, &spec)? {
                    return Ok(false);
                }
                filter.insert(FILTER_TABLE, chain, 1, &spec)?;
                Ok(true)
            });

        match inserted {
            Ok(true) => {
                tracing::info!("Denying traffic for {} ({})", target, action.as_target());
                Ok(())
            }
            Ok(false) => {
                tracing::debug!(%target, %action, chain, "rule already present");
                Ok(())
            }
            Err(source) => {
                tracing::error!(%target, %action, error = %source, "failed to insert rule");
                let state = if removed.is_empty()
                    || (self.rollback_on_failure && self.restore(filter, chain, target, &removed))
                {
                    TargetState::Unchanged
                } else {
                    TargetState::Accepting
                };
                Err(ApplyError {
                    target: target.clone(),
                    action,
                    stage: ApplyStage::Insert,
                    state,
                    source,
                })
            }
        }
    }

    /// Put back rules removed earlier in a failed apply
    fn restore(
        &self,
        filter: &dyn PacketFilter,
        chain: &str,
        target: &Target,
        removed: &[Action],
    ) -> bool {
        removed.iter().all(|&action| {
            let spec = rule_spec(target, action);
            let result = self
                .retry
                .retry("restore rule", || -> Result<(), FilterError> {
                    if !filter.exists(FILTER_TABLE, chain, &spec)? {
                        filter.insert(FILTER_TABLE, chain, 1, &spec)?;
                    }
                    Ok(())
                });
            match result {
                Ok(()) => {
                    tracing::warn!(%target, %action, "restored previous rule after failed apply");
                    true
                }
                Err(err) => {
                    tracing::error!(%target, %action, error = %err, "failed to restore previous rule");
                    false
                }
            }
        })
    }
}

fn failure(
    target: &Target,
    action: Action,
    stage: ApplyStage,
    removed: &[Action],
    source: FilterError,
) -> ApplyError {
    tracing::error!(%target, %action, %stage, error = %source, "apply failed");
    ApplyError {
        target: target.clone(),
        action,
        stage,
        state: if removed.is_empty() {
            TargetState::Unchanged
        } else {
            TargetState::Accepting
        },
        source,
    }
}
