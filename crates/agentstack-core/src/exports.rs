//! Cross-stack export channel.
//!
//! A named key/value registry shared by every stack in one account/region.
//! Producers publish outputs under globally unique export names; consumers
//! record an intent to import a name and resolve it at deploy time, after
//! the producer has been deployed.
//!
//! Each producer has an open scope while it deploys. Publishes inside the
//! scope are recorded in an undo log so that a rolled-back stack leaves no
//! exports behind; `commit` closes the scope.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::{Error, Result};

/// A published export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    pub name: String,
    pub value: String,
    /// Stack that wrote the export. Exactly one producer per name.
    pub producer: String,
}

/// Serializable view of committed exports and the stacks importing them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub exports: BTreeMap<String, Export>,
    /// Export name to importing stacks.
    pub importers: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Default)]
struct ChannelState {
    exports: BTreeMap<String, Export>,
    importers: BTreeMap<String, BTreeSet<String>>,
    /// Undo log per producer with an open scope: (name, value before the publish).
    open: HashMap<String, Vec<(String, Option<Export>)>>,
}

impl ChannelState {
    fn consumers_of(&self, name: &str, producer: &str) -> Vec<String> {
        self.importers
            .get(name)
            .map(|set| set.iter().filter(|c| *c != producer).cloned().collect())
            .unwrap_or_default()
    }
}

/// Injected export/import registry. Construct one per scenario in tests.
#[derive(Debug, Default)]
pub struct CrossStackChannel {
    state: Mutex<ChannelState>,
}

impl CrossStackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a channel from a committed snapshot.
    pub fn from_snapshot(snapshot: ChannelSnapshot) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                exports: snapshot.exports,
                importers: snapshot.importers,
                open: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ChannelState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("export channel lock poisoned".to_string()))
    }

    /// Register an export on behalf of `producer`.
    ///
    /// Fails with `Conflict` when another stack owns the name, when the same
    /// scope already published a different value, or when the value would
    /// change while other stacks import it.
    pub fn publish(&self, producer: &str, name: &str, value: &str) -> Result<()> {
        let mut state = self.lock()?;

        let previous = match state.exports.get(name) {
            Some(existing) if existing.producer != producer => {
                return Err(Error::conflict(
                    name,
                    format!(
                        "already exported by stack '{}', cannot be written by '{}'",
                        existing.producer, producer
                    ),
                ));
            }
            Some(existing) if existing.value == value => {
                debug!(export = %name, stack = %producer, "Export unchanged");
                return Ok(());
            }
            Some(existing) => {
                let in_scope = state
                    .open
                    .get(producer)
                    .is_some_and(|log| log.iter().any(|(n, _)| n == name));
                if in_scope {
                    return Err(Error::conflict(
                        name,
                        format!(
                            "stack '{}' published '{}' and then '{}' in one deployment",
                            producer, existing.value, value
                        ),
                    ));
                }

                let consumers = state.consumers_of(name, producer);
                if !consumers.is_empty() {
                    return Err(Error::conflict(
                        name,
                        format!(
                            "cannot change value while in use by stack(s) {}",
                            consumers.join(", ")
                        ),
                    ));
                }
                Some(existing.clone())
            }
            None => None,
        };

        state
            .open
            .entry(producer.to_string())
            .or_default()
            .push((name.to_string(), previous));
        state.exports.insert(
            name.to_string(),
            Export {
                name: name.to_string(),
                value: value.to_string(),
                producer: producer.to_string(),
            },
        );

        info!(export = %name, stack = %producer, "Published export");
        Ok(())
    }

    /// Look up an export published in the current or an earlier deployment.
    pub fn resolve(&self, name: &str) -> Result<String> {
        let state = self.lock()?;
        state
            .exports
            .get(name)
            .map(|e| e.value.clone())
            .ok_or_else(|| Error::UnresolvedImport {
                export: name.to_string(),
                stack: None,
            })
    }

    /// Resolve an export for `consumer` without recording the edge.
    pub fn resolve_for(&self, consumer: &str, name: &str) -> Result<String> {
        match self.resolve(name) {
            Err(Error::UnresolvedImport { .. }) => Err(Error::unresolved(name, consumer)),
            other => other,
        }
    }

    /// Resolve an export for `consumer` and record the import edge.
    pub fn import(&self, consumer: &str, name: &str) -> Result<String> {
        let mut state = self.lock()?;
        let value = state
            .exports
            .get(name)
            .map(|e| e.value.clone())
            .ok_or_else(|| Error::unresolved(name, consumer))?;

        state
            .importers
            .entry(name.to_string())
            .or_default()
            .insert(consumer.to_string());
        debug!(export = %name, stack = %consumer, "Recorded import");
        Ok(value)
    }

    /// Drop every import edge held by `consumer`.
    pub fn release_imports(&self, consumer: &str) -> Result<()> {
        let mut state = self.lock()?;
        for set in state.importers.values_mut() {
            set.remove(consumer);
        }
        state.importers.retain(|_, set| !set.is_empty());
        Ok(())
    }

    /// Close the producer's scope, keeping everything it published.
    pub fn commit(&self, producer: &str) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(log) = state.open.remove(producer) {
            debug!(stack = %producer, exports = log.len(), "Committed exports");
        }
        Ok(())
    }

    /// Undo every publish made in the producer's open scope.
    /// Returns the names whose values were withdrawn or restored.
    pub fn rollback(&self, producer: &str) -> Result<Vec<String>> {
        let mut state = self.lock()?;
        let Some(log) = state.open.remove(producer) else {
            return Ok(Vec::new());
        };

        let mut touched = Vec::with_capacity(log.len());
        for (name, previous) in log.into_iter().rev() {
            match previous {
                Some(prev) => {
                    state.exports.insert(name.clone(), prev);
                }
                None => {
                    state.exports.remove(&name);
                }
            }
            touched.push(name);
        }

        info!(stack = %producer, exports = ?touched, "Rolled back exports");
        Ok(touched)
    }

    /// Remove all exports of a destroyed stack, along with its own imports.
    /// Refused while any other stack still imports one of them.
    pub fn retract(&self, producer: &str) -> Result<Vec<String>> {
        let mut state = self.lock()?;

        let owned: Vec<String> = state
            .exports
            .values()
            .filter(|e| e.producer == producer)
            .map(|e| e.name.clone())
            .collect();

        for name in &owned {
            let consumers = state.consumers_of(name, producer);
            if !consumers.is_empty() {
                return Err(Error::conflict(
                    name.clone(),
                    format!(
                        "cannot remove export of stack '{}' while imported by {}",
                        producer,
                        consumers.join(", ")
                    ),
                ));
            }
        }

        for name in &owned {
            state.exports.remove(name);
            state.importers.remove(name);
        }
        for set in state.importers.values_mut() {
            set.remove(producer);
        }
        state.importers.retain(|_, set| !set.is_empty());
        state.open.remove(producer);

        info!(stack = %producer, exports = ?owned, "Retracted exports");
        Ok(owned)
    }

    /// Remove one export the producer no longer declares. The removal is
    /// part of the producer's open scope and is undone by `rollback`.
    pub fn withdraw(&self, producer: &str, name: &str) -> Result<()> {
        let mut state = self.lock()?;
        let Some(existing) = state.exports.get(name).cloned() else {
            return Ok(());
        };
        if existing.producer != producer {
            return Err(Error::conflict(
                name,
                format!(
                    "owned by stack '{}', cannot be withdrawn by '{}'",
                    existing.producer, producer
                ),
            ));
        }

        let consumers = state.consumers_of(name, producer);
        if !consumers.is_empty() {
            return Err(Error::conflict(
                name,
                format!("cannot withdraw while in use by stack(s) {}", consumers.join(", ")),
            ));
        }

        state.exports.remove(name);
        state
            .open
            .entry(producer.to_string())
            .or_default()
            .push((name.to_string(), Some(existing)));
        info!(export = %name, stack = %producer, "Withdrew export");
        Ok(())
    }

    pub fn exports_of(&self, producer: &str) -> Result<Vec<Export>> {
        let state = self.lock()?;
        Ok(state
            .exports
            .values()
            .filter(|e| e.producer == producer)
            .cloned()
            .collect())
    }

    pub fn importers_of(&self, name: &str) -> Result<Vec<String>> {
        let state = self.lock()?;
        Ok(state
            .importers
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Committed view: values published in still-open scopes are left out.
    pub fn snapshot(&self) -> Result<ChannelSnapshot> {
        let state = self.lock()?;
        let mut exports = state.exports.clone();
        for log in state.open.values() {
            for (name, previous) in log.iter().rev() {
                match previous {
                    Some(prev) => {
                        exports.insert(name.clone(), prev.clone());
                    }
                    None => {
                        exports.remove(name);
                    }
                }
            }
        }
        Ok(ChannelSnapshot {
            exports,
            importers: state.importers.clone(),
        })
    }
}
