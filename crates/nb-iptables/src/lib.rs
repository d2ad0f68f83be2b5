//! iptables backend: one `iptables` process per packet-filter operation.

use nb_core::{FilterError, PacketFilter};
use std::process::{Command, Output};

/// Shells out to the `iptables` binary.
///
/// `--wait` makes iptables queue behind other holders of the xtables lock
/// instead of failing outright.
#[derive(Debug, Clone)]
pub struct IptablesCli {
    program: String,
}

impl IptablesCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command_args(table: &str, op: &str, chain: &str, extra: &[String]) -> Vec<String> {
        let mut args = vec![
            "--wait".to_string(),
            "-t".to_string(),
            table.to_string(),
            op.to_string(),
            chain.to_string(),
        ];
        args.extend(extra.iter().cloned());
        args
    }

    fn run(&self, args: &[String]) -> Result<Output, FilterError> {
        tracing::trace!(program = %self.program, args = ?args, "running packet filter command");
        Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| FilterError::Spawn {
                program: self.program.clone(),
                source,
            })
    }

    fn failure(&self, args: &[String], output: &Output) -> FilterError {
        FilterError::Command {
            command: format!("{} {}", self.program, args.join(" ")),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    /// Run and require a zero exit status
    fn exec(&self, args: &[String]) -> Result<Output, FilterError> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(self.failure(args, &output));
        }
        Ok(output)
    }
}

impl Default for IptablesCli {
    fn default() -> Self {
        Self::new("iptables")
    }
}

/// iptables reports a missing rule with exit status 1 and this hint
fn is_missing_rule(output: &Output) -> bool {
    output.status.code() == Some(1)
        && String::from_utf8_lossy(&output.stderr).contains("does a matching rule exist")
}

fn is_existing_chain(output: &Output) -> bool {
    output.status.code() == Some(1)
        && String::from_utf8_lossy(&output.stderr).contains("already exists")
}

impl PacketFilter for IptablesCli {
    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), FilterError> {
        let args = Self::command_args(table, "-N", chain, &[]);
        let output = self.run(&args)?;
        if output.status.success() {
            return Ok(());
        }
        if !is_existing_chain(&output) {
            return Err(self.failure(&args, &output));
        }
        self.exec(&Self::command_args(table, "-F", chain, &[]))?;
        Ok(())
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), FilterError> {
        self.exec(&Self::command_args(table, "-F", chain, &[]))?;
        Ok(())
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), FilterError> {
        self.exec(&Self::command_args(table, "-X", chain, &[]))?;
        Ok(())
    }

    fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), FilterError> {
        self.exec(&Self::command_args(table, "-A", chain, spec))?;
        Ok(())
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        spec: &[String],
    ) -> Result<(), FilterError> {
        let mut extra = vec![position.max(1).to_string()];
        extra.extend(spec.iter().cloned());
        self.exec(&Self::command_args(table, "-I", chain, &extra))?;
        Ok(())
    }

    fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool, FilterError> {
        let args = Self::command_args(table, "-C", chain, spec);
        let output = self.run(&args)?;
        if output.status.success() {
            return Ok(true);
        }
        // -C answers "no" with exit status 1
        if output.status.code() == Some(1) {
            return Ok(false);
        }
        Err(self.failure(&args, &output))
    }

    fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool, FilterError> {
        let args = Self::command_args(table, "-D", chain, spec);
        let output = self.run(&args)?;
        if output.status.success() {
            return Ok(true);
        }
        if is_missing_rule(&output) {
            return Ok(false);
        }
        Err(self.failure(&args, &output))
    }

    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, FilterError> {
        let output = self.exec(&Self::command_args(table, "-S", chain, &[]))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}
