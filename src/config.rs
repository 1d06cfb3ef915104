//! Configuration of the bridge module
//!
//! The module is configured either from a JSON file (handy for the simulator
//! and for tests) or from the host's `key=value` module argument string. Both
//! paths end in [`BridgeConfig::validate`]; a rejected configuration aborts
//! module init and nothing else.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::codec::MAX_CHANNELS;
use crate::error::ConfigError;
use crate::host::PropertyList;

/// Stream identity used to merge streams onto one bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeMode {
    /// Every stream gets its own bridge
    None,
    /// Streams of the same process share a bridge
    ByPid,
    /// Streams of the same executable share a bridge
    ByBinary,
    /// Streams reporting the same application name share a bridge
    ByAppName,
}

impl MergeMode {
    /// Parse a module argument value. Accepts the short aliases too.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "no" | "off" => Some(MergeMode::None),
            "pid" | "by-pid" | "process" => Some(MergeMode::ByPid),
            "binary" | "by-binary" => Some(MergeMode::ByBinary),
            "name" | "by-app-name" | "app-name" => Some(MergeMode::ByAppName),
            _ => None,
        }
    }
}

impl Default for MergeMode {
    fn default() -> Self {
        MergeMode::ByPid
    }
}

/// Complete module configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Wire new ports to physical graph ports
    pub autoconnect: bool,
    pub merge_mode: MergeMode,
    /// Grace period before an unused bridge is torn down; 0 disables idle unload
    pub idle_unload_delay_secs: u64,
    /// Route streams that already exist when the module starts
    pub prepare_existing: bool,
    /// Named graph server instance to connect to
    pub server_name: Option<String>,
    /// Applied over the built-in sink properties
    pub sink_properties: PropertyList,
    /// Applied over the built-in source properties
    pub source_properties: PropertyList,
    /// Channel count used when a stream does not specify one
    pub default_channels: u32,
    /// Name of the bridge created at startup
    pub default_bridge_name: String,
    /// Upper bound the realtime side waits for a render reply
    pub render_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            autoconnect: true,
            merge_mode: MergeMode::ByPid,
            idle_unload_delay_secs: 5,
            prepare_existing: true,
            server_name: None,
            sink_properties: PropertyList::new(),
            source_properties: PropertyList::new(),
            default_channels: 2,
            default_bridge_name: "pulseaudio".to_string(),
            render_timeout_ms: 200,
        }
    }
}

const VALID_ARGUMENTS: &[&str] = &[
    "connect",
    "merge",
    "delay",
    "prepare_existing",
    "server_name",
    "sink_properties",
    "source_properties",
    "channels",
    "name",
    "render_timeout",
];

impl BridgeConfig {
    /// Load configuration from a JSON file
    ///
    /// Missing fields take their defaults. The result is validated.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(&path).map_err(|err| {
            log::warn!(
                "[Config] Failed to read config file {:?}: {}",
                path.as_ref(),
                err
            );
            ConfigError::Io {
                path: path.as_ref().display().to_string(),
                reason: err.to_string(),
            }
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
        Ok(config)
    }

    /// Parse a module argument string such as
    /// `connect=no merge=binary sink_properties="device.description='Studio out'"`.
    pub fn from_module_args(args: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in parse_pairs(args)? {
            if !VALID_ARGUMENTS.contains(&key.as_str()) {
                return Err(ConfigError::UnknownArgument { key });
            }
            let invalid = || ConfigError::InvalidArgument {
                key: key.clone(),
                value: value.clone(),
            };
            match key.as_str() {
                "connect" => config.autoconnect = parse_bool(&value).ok_or_else(invalid)?,
                "merge" => config.merge_mode = MergeMode::parse(&value).ok_or_else(invalid)?,
                "delay" => config.idle_unload_delay_secs = value.parse().map_err(|_| invalid())?,
                "prepare_existing" => {
                    config.prepare_existing = parse_bool(&value).ok_or_else(invalid)?
                }
                "server_name" => {
                    config.server_name = Some(value.clone()).filter(|v| !v.is_empty())
                }
                "sink_properties" => {
                    config.sink_properties = parse_properties(&value).map_err(|_| invalid())?
                }
                "source_properties" => {
                    config.source_properties = parse_properties(&value).map_err(|_| invalid())?
                }
                "channels" => config.default_channels = value.parse().map_err(|_| invalid())?,
                "name" => config.default_bridge_name = value.clone(),
                "render_timeout" => {
                    config.render_timeout_ms = value.parse().map_err(|_| invalid())?
                }
                _ => return Err(ConfigError::UnknownArgument { key: key.clone() }),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_channels == 0 || self.default_channels as usize > MAX_CHANNELS {
            return Err(ConfigError::InvalidArgument {
                key: "channels".to_string(),
                value: self.default_channels.to_string(),
            });
        }
        if self.default_bridge_name.trim().is_empty() {
            return Err(ConfigError::InvalidArgument {
                key: "name".to_string(),
                value: self.default_bridge_name.clone(),
            });
        }
        if self.render_timeout_ms == 0 {
            return Err(ConfigError::InvalidArgument {
                key: "render_timeout".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// `None` when idle unload is disabled.
    pub fn idle_unload_delay(&self) -> Option<Duration> {
        match self.idle_unload_delay_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }
}

/// Parse a boolean module argument.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "y" | "yes" | "true" | "on" => Some(true),
        "0" | "n" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a property list in the same `key=value` syntax.
pub fn parse_properties(value: &str) -> Result<PropertyList, ConfigError> {
    Ok(parse_pairs(value)?.into_iter().collect())
}

/// Split `key=value` pairs separated by whitespace. Values may be quoted with
/// single or double quotes; a backslash escapes the next character.
pub fn parse_pairs(input: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut pairs = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        if chars.next() != Some('=') || key.is_empty() {
            return Err(ConfigError::ParseFailed {
                reason: format!("expected key=value near '{}'", key),
            });
        }

        let mut value = String::new();
        match chars.peek().copied() {
            Some(quote @ ('"' | '\'')) => {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        c => value.push(c),
                    }
                }
                if !closed {
                    return Err(ConfigError::ParseFailed {
                        reason: format!("unterminated quote in value of '{}'", key),
                    });
                }
            }
            _ => {
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    if c == '\\' {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    } else {
                        value.push(c);
                    }
                }
            }
        }

        pairs.push((key, value));
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert!(config.autoconnect);
        assert_eq!(config.merge_mode, MergeMode::ByPid);
        assert_eq!(config.idle_unload_delay(), Some(Duration::from_secs(5)));
        assert!(config.prepare_existing);
        assert_eq!(config.server_name, None);
        assert_eq!(config.default_channels, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip() {
        let mut config = BridgeConfig::default();
        config.merge_mode = MergeMode::ByAppName;
        config
            .sink_properties
            .insert("device.icon_name".to_string(), "audio-card".to_string());
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"by-app-name\""));
        let parsed: BridgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed: BridgeConfig =
            serde_json::from_str(r#"{"autoconnect": false, "merge_mode": "by-binary"}"#).unwrap();
        assert!(!parsed.autoconnect);
        assert_eq!(parsed.merge_mode, MergeMode::ByBinary);
        assert_eq!(parsed.idle_unload_delay_secs, 5);
    }

    #[test]
    fn test_module_args() {
        let config = BridgeConfig::from_module_args(
            "connect=no merge=binary delay=0 server_name=studio \
             sink_properties=\"device.description='Studio out' device.icon_name=audio\"",
        )
        .unwrap();
        assert!(!config.autoconnect);
        assert_eq!(config.merge_mode, MergeMode::ByBinary);
        assert_eq!(config.idle_unload_delay(), None);
        assert_eq!(config.server_name.as_deref(), Some("studio"));
        assert_eq!(
            config.sink_properties.get("device.description").map(String::as_str),
            Some("Studio out")
        );
        assert_eq!(config.sink_properties.len(), 2);
    }

    #[test]
    fn test_module_args_errors() {
        assert_eq!(
            BridgeConfig::from_module_args("connect=maybe"),
            Err(ConfigError::InvalidArgument {
                key: "connect".to_string(),
                value: "maybe".to_string()
            })
        );
        assert_eq!(
            BridgeConfig::from_module_args("bogus=1"),
            Err(ConfigError::UnknownArgument {
                key: "bogus".to_string()
            })
        );
        assert!(matches!(
            BridgeConfig::from_module_args("name=\"unterminated"),
            Err(ConfigError::ParseFailed { .. })
        ));
        assert!(matches!(
            BridgeConfig::from_module_args("channels=0"),
            Err(ConfigError::InvalidArgument { .. })
        ));
        assert!(matches!(
            BridgeConfig::from_module_args("justakey"),
            Err(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn test_parse_bool_variants() {
        for yes in ["1", "yes", "true", "on", "Y"] {
            assert_eq!(parse_bool(yes), Some(true), "{}", yes);
        }
        for no in ["0", "no", "false", "off"] {
            assert_eq!(parse_bool(no), Some(false), "{}", no);
        }
        assert_eq!(parse_bool("sometimes"), None);
    }

    #[test]
    fn test_merge_mode_aliases() {
        assert_eq!(MergeMode::parse("pid"), Some(MergeMode::ByPid));
        assert_eq!(MergeMode::parse("binary"), Some(MergeMode::ByBinary));
        assert_eq!(MergeMode::parse("name"), Some(MergeMode::ByAppName));
        assert_eq!(MergeMode::parse("none"), Some(MergeMode::None));
        assert_eq!(MergeMode::parse("by-app-name"), Some(MergeMode::ByAppName));
        assert_eq!(MergeMode::parse("socket"), None);
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = BridgeConfig::load_from_file("/nonexistent/bridge.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
