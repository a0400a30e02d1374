//! Structured bus configuration consumed by the protocol engine.
//!
//! The host is responsible for loading and validating its JSON config
//! files; the engine only consumes the structured data modelled here. The
//! shapes match the upstream file layout: a module list, a button list
//! with impacted-module mappings, and scene definitions.
//!
//! `operation_time` values appear in the wild both as JSON strings
//! (`"40"`) and as numbers; [`ChannelConfig`] and [`ButtonConfig`] accept
//! either.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};
use crate::types::{ButtonAddress, Group, ModuleAddress, ModuleKind};

/// Default shutter travel time when a roller channel has none configured.
pub const DEFAULT_OPERATION_TIME_S: f64 = 40.0;

/// One output channel of a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub description: String,
    /// Wall button that drives this channel on; when set, the facade
    /// presses the button instead of issuing a group write.
    #[serde(default)]
    pub led_on: Option<ButtonAddress>,
    /// Wall button that drives this channel off / closed.
    #[serde(default)]
    pub led_off: Option<ButtonAddress>,
    /// Shutter travel time for 0 -> 100 %, in seconds (rollers only).
    #[serde(default, deserialize_with = "de_opt_seconds")]
    pub operation_time: Option<f64>,
    /// Host-side entity override; opaque to the engine.
    #[serde(default)]
    pub entity_type: Option<String>,
}

/// One Nikobus output module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(rename = "type")]
    pub kind: ModuleKind,
    pub address: ModuleAddress,
    pub channels: Vec<ChannelConfig>,
}

impl ModuleConfig {
    /// Number of physical outputs (4, 6, or 12).
    pub fn channel_count(&self) -> u8 {
        self.channels.len() as u8
    }

    /// The wire groups this module answers for: group 1 always, group 2
    /// only when the module has more than 6 outputs.
    pub fn groups(&self) -> &'static [Group] {
        if self.channel_count() > 6 {
            &[Group::One, Group::Two]
        } else {
            &[Group::One]
        }
    }
}

/// A module impacted by a button press, used to trigger a targeted refresh
/// after release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactedModule {
    pub address: ModuleAddress,
    pub group: Group,
    /// The specific channel the button drives, when the host knows it.
    #[serde(default)]
    pub channel: Option<u8>,
}

/// A physical wall button.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonConfig {
    pub address: ButtonAddress,
    #[serde(rename = "impacted_module", default)]
    pub impacted_modules: Vec<ImpactedModule>,
    /// Shutter travel override applied when this button drives a cover.
    #[serde(default, deserialize_with = "de_opt_seconds")]
    pub operation_time: Option<f64>,
}

/// One channel assignment inside a scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneChannel {
    #[serde(rename = "module_id")]
    pub module: ModuleAddress,
    pub channel: u8,
    pub state: u8,
}

/// A scene: a set of channel states applied together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    pub id: String,
    pub channels: Vec<SceneChannel>,
}

/// The complete bus configuration handed to the engine at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    #[serde(default)]
    pub buttons: Vec<ButtonConfig>,
    #[serde(default)]
    pub scenes: Vec<SceneConfig>,
}

/// Indexed view over a [`BusConfig`], built once at engine startup.
///
/// Module records live for the whole process; their mutable output state
/// is kept in the engine's state cache, not here.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<ModuleAddress, ModuleConfig>,
    buttons: HashMap<ButtonAddress, ButtonConfig>,
    scenes: HashMap<String, SceneConfig>,
}

impl ModuleRegistry {
    /// Build the registry from a parsed configuration.
    pub fn new(config: &BusConfig) -> Self {
        let modules = config
            .modules
            .iter()
            .map(|m| (m.address, m.clone()))
            .collect();
        let buttons = config
            .buttons
            .iter()
            .map(|b| (b.address, b.clone()))
            .collect();
        let scenes = config
            .scenes
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();
        ModuleRegistry {
            modules,
            buttons,
            scenes,
        }
    }

    /// Look up a module, failing with [`Error::UnknownModule`].
    pub fn module(&self, address: ModuleAddress) -> Result<&ModuleConfig> {
        self.modules
            .get(&address)
            .ok_or_else(|| Error::UnknownModule(address.to_string()))
    }

    /// All configured modules.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleConfig> {
        self.modules.values()
    }

    /// Button config for an address, if known.
    pub fn button(&self, address: ButtonAddress) -> Option<&ButtonConfig> {
        self.buttons.get(&address)
    }

    /// Scene by id.
    pub fn scene(&self, id: &str) -> Option<&SceneConfig> {
        self.scenes.get(id)
    }

    /// Validate that `channel` exists on the module and return its config.
    pub fn channel(&self, address: ModuleAddress, channel: u8) -> Result<&ChannelConfig> {
        let module = self.module(address)?;
        if channel == 0 || channel > module.channel_count() {
            return Err(Error::InvalidArgument(format!(
                "channel {channel} out of range for module {address} ({} outputs)",
                module.channel_count()
            )));
        }
        Ok(&module.channels[(channel - 1) as usize])
    }

    /// Validate that `channel` exists and the module is of `kind`.
    pub fn channel_of_kind(
        &self,
        address: ModuleAddress,
        channel: u8,
        kind: ModuleKind,
    ) -> Result<&ChannelConfig> {
        let module = self.module(address)?;
        if module.kind != kind {
            return Err(Error::InvalidArgument(format!(
                "module {address} is a {} module, not {kind}",
                module.kind
            )));
        }
        self.channel(address, channel)
    }

    /// Travel time for a roller channel, falling back to the default.
    pub fn operation_time(&self, address: ModuleAddress, channel: u8) -> f64 {
        self.channel(address, channel)
            .ok()
            .and_then(|c| c.operation_time)
            .unwrap_or(DEFAULT_OPERATION_TIME_S)
    }
}

/// Accept `"40"`, `40`, and `40.5` for optional second counts.
fn de_opt_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<f64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Num(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<f64>()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("invalid seconds value: {s}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> BusConfig {
        serde_json::from_str(
            r#"{
                "modules": [
                    {
                        "type": "switch",
                        "address": "4707",
                        "channels": [
                            {"description": "Kitchen"},
                            {"description": "Hall", "led_on": "1A2B3C", "led_off": "1A2B3D"},
                            {"description": "not_in_use 3"},
                            {"description": "not_in_use 4"},
                            {"description": "not_in_use 5"},
                            {"description": "not_in_use 6"},
                            {"description": "Garage"},
                            {"description": "not_in_use 8"},
                            {"description": "not_in_use 9"},
                            {"description": "not_in_use 10"},
                            {"description": "not_in_use 11"},
                            {"description": "not_in_use 12"}
                        ]
                    },
                    {
                        "type": "roller",
                        "address": "9105",
                        "channels": [
                            {"description": "Living shutter", "operation_time": "40"},
                            {"description": "Bedroom shutter", "operation_time": 25}
                        ]
                    }
                ],
                "buttons": [
                    {
                        "address": "4ECB1A",
                        "impacted_module": [{"address": "4707", "group": "1"}],
                        "operation_time": "12"
                    }
                ],
                "scenes": [
                    {
                        "id": "evening",
                        "channels": [
                            {"module_id": "4707", "channel": 1, "state": 255},
                            {"module_id": "4707", "channel": 7, "state": 255}
                        ]
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_upstream_shaped_json() {
        let config = sample_config();
        assert_eq!(config.modules.len(), 2);
        assert_eq!(config.buttons.len(), 1);
        assert_eq!(config.scenes.len(), 1);

        let switch = &config.modules[0];
        assert_eq!(switch.kind, ModuleKind::Switch);
        assert_eq!(switch.channel_count(), 12);
        assert_eq!(switch.groups(), &[Group::One, Group::Two]);

        let roller = &config.modules[1];
        assert_eq!(roller.channel_count(), 2);
        assert_eq!(roller.groups(), &[Group::One]);
    }

    #[test]
    fn operation_time_accepts_string_and_number() {
        let config = sample_config();
        let roller = &config.modules[1];
        assert_eq!(roller.channels[0].operation_time, Some(40.0));
        assert_eq!(roller.channels[1].operation_time, Some(25.0));
        assert_eq!(config.buttons[0].operation_time, Some(12.0));
    }

    #[test]
    fn registry_module_lookup() {
        let registry = ModuleRegistry::new(&sample_config());
        let addr = ModuleAddress::from_hex("4707").unwrap();
        assert_eq!(registry.module(addr).unwrap().kind, ModuleKind::Switch);

        let missing = ModuleAddress::from_hex("BEEF").unwrap();
        assert!(matches!(
            registry.module(missing),
            Err(Error::UnknownModule(_))
        ));
    }

    #[test]
    fn registry_channel_validation() {
        let registry = ModuleRegistry::new(&sample_config());
        let addr = ModuleAddress::from_hex("9105").unwrap();

        assert!(registry.channel(addr, 1).is_ok());
        assert!(matches!(
            registry.channel(addr, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.channel(addr, 3),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn registry_kind_validation() {
        let registry = ModuleRegistry::new(&sample_config());
        let roller = ModuleAddress::from_hex("9105").unwrap();

        assert!(registry
            .channel_of_kind(roller, 1, ModuleKind::Roller)
            .is_ok());
        assert!(matches!(
            registry.channel_of_kind(roller, 1, ModuleKind::Switch),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn registry_operation_time_with_default() {
        let registry = ModuleRegistry::new(&sample_config());
        let roller = ModuleAddress::from_hex("9105").unwrap();
        assert_eq!(registry.operation_time(roller, 1), 40.0);
        assert_eq!(registry.operation_time(roller, 2), 25.0);

        // Unknown channel falls back to the default.
        assert_eq!(registry.operation_time(roller, 9), DEFAULT_OPERATION_TIME_S);
    }

    #[test]
    fn registry_button_and_scene_lookup() {
        let registry = ModuleRegistry::new(&sample_config());
        let button = ButtonAddress::from_hex("4ECB1A").unwrap();

        let cfg = registry.button(button).unwrap();
        assert_eq!(cfg.impacted_modules.len(), 1);
        assert_eq!(cfg.impacted_modules[0].group, Group::One);

        assert!(registry.scene("evening").is_some());
        assert!(registry.scene("morning").is_none());
    }

    #[test]
    fn empty_config_deserializes() {
        let config: BusConfig = serde_json::from_str("{}").unwrap();
        assert!(config.modules.is_empty());
        let registry = ModuleRegistry::new(&config);
        assert_eq!(registry.modules().count(), 0);
    }
}
