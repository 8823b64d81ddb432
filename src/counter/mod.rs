//! Install counter persistence
//!
//! The cache engine only talks to [`CounterStore`]; two interchangeable backends exist:
//!
//! - [`MemoryCounterStore`]: key-value layout (`installs:<plugin>` → decimal string) with a
//!   relaxed read-then-write increment. Concurrent increments of the same plugin may lose
//!   updates; this matches the key-value deployment and is accepted.
//! - [`SqliteCounterStore`]: document-style tables with an atomic upsert increment and
//!   transactional bulk imports.

use crate::error::CounterError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryCounterStore;
pub use sqlite::SqliteCounterStore;

/// Install count for a single plugin, as listed and imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallEntry {
    pub plugin: String,
    pub installs: u64,
}

/// Result of a bulk import. A repeated import id is rejected, never re-applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ImportOutcome {
    #[serde(rename_all = "camelCase")]
    Applied {
        name: String,
        entries: usize,
        total_installs: u64,
    },
    Duplicate { name: String },
}

impl ImportOutcome {
    /// Summary of an import about to be applied. Fails when the total does not fit in `u64`.
    pub(crate) fn applied(name: &str, entries: &[InstallEntry]) -> Result<Self, CounterError> {
        let total_installs = entries
            .iter()
            .try_fold(0u64, |total, e| total.checked_add(e.installs))
            .ok_or_else(|| CounterError::Overflow(format!("import {name}")))?;
        Ok(ImportOutcome::Applied {
            name: name.to_string(),
            entries: entries.len(),
            total_installs,
        })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, ImportOutcome::Duplicate { .. })
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Current install count, 0 when the plugin has never been installed.
    async fn get(&self, plugin: &str) -> Result<u64, CounterError>;

    async fn set(&self, plugin: &str, installs: u64) -> Result<(), CounterError>;

    /// Add one install and return the new count.
    async fn increment(&self, plugin: &str) -> Result<u64, CounterError>;

    async fn list_installs(&self) -> Result<Vec<InstallEntry>, CounterError>;

    /// Add `entries` to the stored counts once per `import_name`.
    async fn bulk_import(
        &self,
        import_name: &str,
        entries: Vec<InstallEntry>,
    ) -> Result<ImportOutcome, CounterError>;

    fn backend_name(&self) -> &'static str;
}
