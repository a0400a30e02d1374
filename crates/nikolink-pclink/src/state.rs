//! In-memory mirror of every known module's output state.
//!
//! The cache maps module addresses to their 12-byte output vectors so the
//! host can read channel states synchronously. Entries are created from
//! the configuration at startup and never removed.
//!
//! Write discipline: the facade applies optimistic writes before a frame
//! is transmitted; the listener applies feedback answers; the scheduler
//! applies acknowledged write answers. All three serialize through the
//! `RwLock` write path; reads never block each other.

use std::collections::HashMap;
use std::sync::RwLock;

use nikolink_core::config::ModuleRegistry;
use nikolink_core::error::{Error, Result};
use nikolink_core::types::{Group, ModuleAddress, OutputState};

/// Shared module-state mirror.
#[derive(Debug)]
pub struct StateCache {
    inner: RwLock<HashMap<ModuleAddress, OutputState>>,
}

impl StateCache {
    /// Create the cache with an all-off entry per configured module.
    pub fn new(registry: &ModuleRegistry) -> Self {
        let inner = registry
            .modules()
            .map(|m| (m.address, OutputState::new()))
            .collect();
        StateCache {
            inner: RwLock::new(inner),
        }
    }

    /// State byte of one channel.
    pub fn channel(&self, module: ModuleAddress, channel: u8) -> Result<u8> {
        let map = self.inner.read().expect("state cache poisoned");
        map.get(&module)
            .map(|s| s.channel(channel))
            .ok_or_else(|| Error::UnknownModule(module.to_string()))
    }

    /// Optimistically set one channel, ahead of the bus acknowledging it.
    pub fn set_channel(&self, module: ModuleAddress, channel: u8, value: u8) -> Result<()> {
        let mut map = self.inner.write().expect("state cache poisoned");
        let state = map
            .get_mut(&module)
            .ok_or_else(|| Error::UnknownModule(module.to_string()))?;
        state.set_channel(channel, value);
        Ok(())
    }

    /// The 6 bytes of one group.
    pub fn group(&self, module: ModuleAddress, group: Group) -> Result<[u8; 6]> {
        let map = self.inner.read().expect("state cache poisoned");
        map.get(&module)
            .map(|s| s.group(group))
            .ok_or_else(|| Error::UnknownModule(module.to_string()))
    }

    /// Overwrite one group from an answer frame.
    pub fn apply_group(&self, module: ModuleAddress, group: Group, bytes: [u8; 6]) -> Result<()> {
        let mut map = self.inner.write().expect("state cache poisoned");
        let state = map
            .get_mut(&module)
            .ok_or_else(|| Error::UnknownModule(module.to_string()))?;
        state.set_group(group, bytes);
        Ok(())
    }

    /// Full 12-byte snapshot of one module.
    pub fn snapshot(&self, module: ModuleAddress) -> Result<OutputState> {
        let map = self.inner.read().expect("state cache poisoned");
        map.get(&module)
            .copied()
            .ok_or_else(|| Error::UnknownModule(module.to_string()))
    }

    /// Whether the module is known to the cache.
    pub fn contains(&self, module: ModuleAddress) -> bool {
        self.inner
            .read()
            .expect("state cache poisoned")
            .contains_key(&module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nikolink_core::config::BusConfig;

    fn cache() -> StateCache {
        let config: BusConfig = serde_json::from_str(
            r#"{
                "modules": [
                    {"type": "switch", "address": "4707", "channels": [
                        {"description": "1"}, {"description": "2"}, {"description": "3"},
                        {"description": "4"}, {"description": "5"}, {"description": "6"},
                        {"description": "7"}, {"description": "8"}, {"description": "9"},
                        {"description": "10"}, {"description": "11"}, {"description": "12"}
                    ]}
                ]
            }"#,
        )
        .unwrap();
        StateCache::new(&ModuleRegistry::new(&config))
    }

    fn addr(s: &str) -> ModuleAddress {
        ModuleAddress::from_hex(s).unwrap()
    }

    #[test]
    fn starts_all_off() {
        let cache = cache();
        for channel in 1..=12 {
            assert_eq!(cache.channel(addr("4707"), channel).unwrap(), 0x00);
        }
    }

    #[test]
    fn optimistic_channel_write() {
        let cache = cache();
        cache.set_channel(addr("4707"), 1, 0xFF).unwrap();
        assert_eq!(cache.channel(addr("4707"), 1).unwrap(), 0xFF);
        assert_eq!(cache.channel(addr("4707"), 2).unwrap(), 0x00);
    }

    #[test]
    fn group_apply_updates_the_right_half() {
        let cache = cache();
        cache
            .apply_group(addr("4707"), Group::Two, [1, 2, 3, 4, 5, 6])
            .unwrap();
        assert_eq!(cache.channel(addr("4707"), 7).unwrap(), 1);
        assert_eq!(cache.channel(addr("4707"), 12).unwrap(), 6);
        // Group 1 untouched.
        assert_eq!(cache.group(addr("4707"), Group::One).unwrap(), [0; 6]);
    }

    #[test]
    fn unknown_module_errors() {
        let cache = cache();
        let missing = addr("BEEF");
        assert!(matches!(
            cache.channel(missing, 1),
            Err(Error::UnknownModule(_))
        ));
        assert!(matches!(
            cache.set_channel(missing, 1, 0xFF),
            Err(Error::UnknownModule(_))
        ));
        assert!(matches!(
            cache.apply_group(missing, Group::One, [0; 6]),
            Err(Error::UnknownModule(_))
        ));
        assert!(!cache.contains(missing));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let cache = cache();
        let before = cache.snapshot(addr("4707")).unwrap();
        cache.set_channel(addr("4707"), 1, 0xFF).unwrap();
        assert_eq!(before.channel(1), 0x00);
        assert_eq!(cache.snapshot(addr("4707")).unwrap().channel(1), 0xFF);
    }
}
