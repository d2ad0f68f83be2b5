use thiserror::Error;

/// Table every chain and rule of this service lives in.
pub const FILTER_TABLE: &str = "filter";

/// Operations the engine needs from the host packet filter.
///
/// Every method is a blocking call. Implementations own whatever handle they
/// need (a binary path, an in-memory table) so several instances can coexist
/// in one process.
pub trait PacketFilter: Send + Sync {
    /// Create `chain`, or flush it when it already exists
    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), FilterError>;

    /// Remove every rule of an existing `chain`; a missing chain is an error
    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), FilterError>;

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), FilterError>;

    fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), FilterError>;

    /// Insert at a 1-based position
    fn insert(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        spec: &[String],
    ) -> Result<(), FilterError>;

    fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool, FilterError>;

    /// Delete the first matching rule. Returns `false` when nothing matched.
    fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool, FilterError>;

    /// Rules of `chain` in evaluation order, one line per rule
    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, FilterError>;
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed with {}: {stderr}", exit_label(.code))]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("packet filter unavailable: {message}")]
    Unavailable { message: String, transient: bool },
}

impl FilterError {
    /// Whether repeating the same call can reasonably succeed
    pub fn is_transient(&self) -> bool {
        match self {
            FilterError::Spawn { source, .. } => !matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            // iptables exits 2 on invalid or conflicting arguments
            FilterError::Command { code, .. } => *code != Some(2),
            FilterError::Unavailable { transient, .. } => *transient,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}
