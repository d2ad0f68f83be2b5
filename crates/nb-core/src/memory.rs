//! In-memory packet filter.
//!
//! Keeps chains as token lists and answers the same questions the iptables
//! backend does. Used by `--dry-run` and throughout the tests, where fault
//! injection stands in for a busy or broken host.

use crate::filter::{FILTER_TABLE, FilterError, PacketFilter};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

const BUILTIN_CHAINS: [&str; 3] = ["INPUT", "FORWARD", "OUTPUT"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    ClearChain,
    FlushChain,
    DeleteChain,
    Append,
    Insert,
    Exists,
    Delete,
    List,
}

/// One recorded call: the operation and the chain it touched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCall {
    pub op: FilterOp,
    pub chain: String,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    remaining: usize,
    transient: bool,
}

#[derive(Debug, Default)]
struct State {
    // (table, chain) -> rules in evaluation order
    chains: BTreeMap<(String, String), Vec<Vec<String>>>,
    faults: HashMap<FilterOp, Fault>,
    calls: Vec<FilterCall>,
}

/// Cloning shares the underlying tables, so a test can keep a handle while the
/// engine owns another.
#[derive(Debug, Clone)]
pub struct MemoryFilter {
    state: Arc<Mutex<State>>,
}

impl MemoryFilter {
    /// A host with empty INPUT, FORWARD and OUTPUT chains in the filter table
    pub fn new() -> Self {
        let mut state = State::default();
        for chain in BUILTIN_CHAINS {
            state
                .chains
                .insert((FILTER_TABLE.to_string(), chain.to_string()), Vec::new());
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Make the next `times` calls of `op` fail
    pub fn fail_next(&self, op: FilterOp, times: usize, transient: bool) {
        self.lock().faults.insert(
            op,
            Fault {
                remaining: times,
                transient,
            },
        );
    }

    pub fn calls(&self) -> Vec<FilterCall> {
        self.lock().calls.clone()
    }

    pub fn chain_exists(&self, table: &str, chain: &str) -> bool {
        self.lock()
            .chains
            .contains_key(&(table.to_string(), chain.to_string()))
    }

    /// Raw rule specs of a chain, without the chain header
    pub fn rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.lock()
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call and consume an injected fault, if any
    fn enter(&self, op: FilterOp, chain: &str) -> Result<MutexGuard<'_, State>, FilterError> {
        let mut state = self.lock();
        state.calls.push(FilterCall {
            op,
            chain: chain.to_string(),
        });

        if let Some(fault) = state.faults.get_mut(&op) {
            if fault.remaining > 0 {
                fault.remaining -= 1;
                return Err(FilterError::Unavailable {
                    message: format!("injected {:?} failure on {}", op, chain),
                    transient: fault.transient,
                });
            }
        }
        Ok(state)
    }
}

impl Default for MemoryFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn key(table: &str, chain: &str) -> (String, String) {
    (table.to_string(), chain.to_string())
}

fn no_chain(table: &str, chain: &str) -> FilterError {
    FilterError::Command {
        command: format!("memory -t {} {}", table, chain),
        code: Some(1),
        stderr: "No chain/target/match by that name.".to_string(),
    }
}

impl PacketFilter for MemoryFilter {
    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), FilterError> {
        let mut state = self.enter(FilterOp::ClearChain, chain)?;
        state.chains.insert(key(table, chain), Vec::new());
        Ok(())
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), FilterError> {
        let mut state = self.enter(FilterOp::FlushChain, chain)?;
        state
            .chains
            .get_mut(&key(table, chain))
            .ok_or_else(|| no_chain(table, chain))?
            .clear();
        Ok(())
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), FilterError> {
        let mut state = self.enter(FilterOp::DeleteChain, chain)?;
        let referenced = state
            .chains
            .values()
            .flatten()
            .any(|rule| rule.last().map(String::as_str) == Some(chain));
        if referenced {
            return Err(FilterError::Command {
                command: format!("memory -t {} -X {}", table, chain),
                code: Some(1),
                stderr: "Too many links.".to_string(),
            });
        }
        match state.chains.remove(&key(table, chain)) {
            Some(_) => Ok(()),
            None => Err(no_chain(table, chain)),
        }
    }

    fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), FilterError> {
        let mut state = self.enter(FilterOp::Append, chain)?;
        let rules = state
            .chains
            .get_mut(&key(table, chain))
            .ok_or_else(|| no_chain(table, chain))?;
        rules.push(spec.to_vec());
        Ok(())
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        spec: &[String],
    ) -> Result<(), FilterError> {
        let mut state = self.enter(FilterOp::Insert, chain)?;
        let rules = state
            .chains
            .get_mut(&key(table, chain))
            .ok_or_else(|| no_chain(table, chain))?;
        let index = (position.max(1) as usize - 1).min(rules.len());
        rules.insert(index, spec.to_vec());
        Ok(())
    }

    fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool, FilterError> {
        let state = self.enter(FilterOp::Exists, chain)?;
        Ok(state
            .chains
            .get(&key(table, chain))
            .is_some_and(|rules| rules.iter().any(|rule| rule == spec)))
    }

    fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool, FilterError> {
        let mut state = self.enter(FilterOp::Delete, chain)?;
        let rules = state
            .chains
            .get_mut(&key(table, chain))
            .ok_or_else(|| no_chain(table, chain))?;
        match rules.iter().position(|rule| rule == spec) {
            Some(index) => {
                rules.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, FilterError> {
        let state = self.enter(FilterOp::List, chain)?;
        let rules = state
            .chains
            .get(&key(table, chain))
            .ok_or_else(|| no_chain(table, chain))?;

        let header = if BUILTIN_CHAINS.contains(&chain) {
            format!("-P {} ACCEPT", chain)
        } else {
            format!("-N {}", chain)
        };
        let mut lines = vec![header];
        lines.extend(
            rules
                .iter()
                .map(|rule| format!("-A {} {}", chain, rule.join(" "))),
        );
        Ok(lines)
    }
}
