//! Rule-management engine for the network blocker.
//!
//! Owns one private iptables chain per process and installs accept, drop or
//! reject decisions for TCP ports and traffic sources inside it.

pub mod applier;
pub mod blocker;
pub mod chain;
pub mod config;
pub mod error;
pub mod filter;
pub mod memory;
pub mod query;
pub mod retry;
pub mod rulespec;
pub mod target;

pub use applier::RuleApplier;
pub use blocker::Blocker;
pub use chain::{ChainManager, CleanupFailure, CleanupReport, HookPoint};
pub use config::{BlockerConfig, ConfigError, ServiceConfig};
pub use error::{ApplyError, ApplyStage, BlockerError, TargetState};
pub use filter::{FILTER_TABLE, FilterError, PacketFilter};
pub use memory::{FilterCall, FilterOp, MemoryFilter};
pub use query::{Decision, RuleQuery};
pub use retry::{RetryPolicy, Retryable};
pub use target::{Action, Target, TargetError};
