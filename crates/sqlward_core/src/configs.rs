//! Named per-handle configuration callbacks.
//!
//! Configs run in ascending `order` (ties keep registration order) whenever a
//! handle is issued and the set changed since the handle was last configured.

use crate::error::CoreResult;
use crate::handle::Handle;
use std::fmt;
use std::sync::Arc;

/// Callback run against a handle before it is issued.
pub type HandleConfig = Arc<dyn Fn(&mut Handle) -> CoreResult<()> + Send + Sync>;

/// Order of the built-in config that applies [`crate::Config`] pragmas.
pub const BASIC_CONFIG_ORDER: i32 = i32::MIN;

/// Name of the built-in config that applies [`crate::Config`] pragmas.
pub const BASIC_CONFIG_NAME: &str = "sqlward.basic";

#[derive(Clone)]
struct Entry {
    name: String,
    order: i32,
    callback: HandleConfig,
}

/// Ordered set of named configs with a version stamp.
#[derive(Clone, Default)]
pub(crate) struct HandleConfigs {
    entries: Vec<Entry>,
    version: u64,
}

impl fmt::Debug for HandleConfigs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleConfigs")
            .field("names", &self.names())
            .field("version", &self.version)
            .finish()
    }
}

impl HandleConfigs {
    /// Installs or replaces the config called `name`.
    pub fn set(&mut self, name: &str, order: i32, callback: HandleConfig) {
        self.entries.retain(|e| e.name != name);
        let at = self
            .entries
            .iter()
            .position(|e| e.order > order)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            at,
            Entry {
                name: name.to_string(),
                order,
                callback,
            },
        );
        self.version += 1;
    }

    /// Removes the config called `name`. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        let removed = self.entries.len() != before;
        if removed {
            self.version += 1;
        }
        removed
    }

    /// Config names in application order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns whether `handle` must be configured again.
    pub fn is_stale(&self, handle: &Handle) -> bool {
        handle.config_version != Some(self.version)
    }

    /// Runs every config against `handle` and stamps it.
    pub fn apply(&self, handle: &mut Handle) -> CoreResult<()> {
        for entry in &self.entries {
            (entry.callback)(handle)?;
        }
        handle.config_version = Some(self.version);
        Ok(())
    }
}
