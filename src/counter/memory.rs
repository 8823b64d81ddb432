use super::{CounterStore, ImportOutcome, InstallEntry};
use crate::error::CounterError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;

const KEY_PREFIX: &str = "installs:";

/// In-process key-value counter store.
#[derive(Default)]
pub struct MemoryCounterStore {
    values: DashMap<String, String>,
    imports: DashMap<String, Vec<InstallEntry>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(plugin: &str) -> String {
        format!("{KEY_PREFIX}{plugin}")
    }

    fn parse(value: Option<&str>) -> u64 {
        value.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, plugin: &str) -> Result<u64, CounterError> {
        let value = self.values.get(&Self::key(plugin));
        Ok(Self::parse(value.as_deref().map(String::as_str)))
    }

    async fn set(&self, plugin: &str, installs: u64) -> Result<(), CounterError> {
        self.values.insert(Self::key(plugin), installs.to_string());
        Ok(())
    }

    async fn increment(&self, plugin: &str) -> Result<u64, CounterError> {
        // Read and write are separate operations; concurrent increments may collapse.
        let next = self
            .get(plugin)
            .await?
            .checked_add(1)
            .ok_or_else(|| CounterError::Overflow(plugin.to_string()))?;
        self.set(plugin, next).await?;
        Ok(next)
    }

    async fn list_installs(&self) -> Result<Vec<InstallEntry>, CounterError> {
        let mut installs: Vec<InstallEntry> = self
            .values
            .iter()
            .filter_map(|kv| {
                kv.key().strip_prefix(KEY_PREFIX).map(|plugin| InstallEntry {
                    plugin: plugin.to_string(),
                    installs: Self::parse(Some(kv.value())),
                })
            })
            .collect();
        installs.sort_by(|a, b| a.plugin.cmp(&b.plugin));
        Ok(installs)
    }

    async fn bulk_import(
        &self,
        import_name: &str,
        entries: Vec<InstallEntry>,
    ) -> Result<ImportOutcome, CounterError> {
        let slot = match self.imports.entry(import_name.to_string()) {
            Entry::Occupied(_) => {
                return Ok(ImportOutcome::Duplicate {
                    name: import_name.to_string(),
                })
            }
            Entry::Vacant(slot) => slot,
        };
        let outcome = ImportOutcome::applied(import_name, &entries)?;

        // Nothing is written unless every count fits.
        let mut staged: HashMap<String, u64> = HashMap::new();
        for entry in &entries {
            let key = Self::key(&entry.plugin);
            let current = match staged.get(&key) {
                Some(current) => *current,
                None => Self::parse(self.values.get(&key).as_deref().map(String::as_str)),
            };
            let next = current
                .checked_add(entry.installs)
                .ok_or_else(|| CounterError::Overflow(entry.plugin.clone()))?;
            staged.insert(key, next);
        }

        slot.insert(entries.clone());
        for (key, installs) in staged {
            self.values.insert(key, installs.to_string());
        }

        tracing::info!(
            import = import_name,
            entries = entries.len(),
            "Applied install import"
        );
        Ok(outcome)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
