//! `bridge.toml` loading.
//!
//! ```toml
//! [channel]
//! handshake_timeout_ms = 250
//! handshake_attempts = 5
//!
//! [addressing.trusted]
//! offset = 2
//! stride = 2
//!
//! [addressing.untrusted]
//! offset = 1
//! stride = 2
//! ```
//!
//! Every field is optional. Missing fields take the values above.

use bridge_channel::ChannelConfig;
use bridge_coords::{AddressSpace, ComponentId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::BridgeError;

const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 250;
const DEFAULT_HANDSHAKE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub channel: ChannelSection,
    pub addressing: AddressingSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    /// Wait per handshake attempt, in milliseconds
    pub handshake_timeout_ms: Option<u64>,
    /// Handshake requests sent before giving up
    pub handshake_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressingSection {
    pub trusted: SpaceSection,
    pub untrusted: SpaceSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceSection {
    pub offset: Option<u32>,
    pub stride: Option<u32>,
}

impl SpaceSection {
    fn resolve(&self, default: AddressSpace, side: &str) -> Result<AddressSpace, BridgeError> {
        let offset = self.offset.unwrap_or(default.offset());
        let stride = self.stride.unwrap_or(default.stride());
        AddressSpace::new(offset, stride)
            .map_err(|e| BridgeError::config(format!("addressing.{side}: {e}")))
    }
}

impl BridgeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, BridgeError> {
        let config: BridgeConfig =
            toml::from_str(text).map_err(|e| BridgeError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::config(format!("reading {}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded bridge config");
        Self::from_toml_str(&text)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(
            self.channel
                .handshake_timeout_ms
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS),
        )
    }

    pub fn handshake_attempts(&self) -> u32 {
        self.channel
            .handshake_attempts
            .unwrap_or(DEFAULT_HANDSHAKE_ATTEMPTS)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            handshake_timeout: self.handshake_timeout(),
            handshake_attempts: self.handshake_attempts(),
        }
    }

    pub fn trusted_space(&self) -> Result<AddressSpace, BridgeError> {
        self.addressing
            .trusted
            .resolve(AddressSpace::trusted(), "trusted")
    }

    pub fn untrusted_space(&self) -> Result<AddressSpace, BridgeError> {
        self.addressing
            .untrusted
            .resolve(AddressSpace::untrusted(), "untrusted")
    }

    /// Rejects settings that can never work. Two spaces that only collide
    /// far into their sequences are not detected.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.handshake_timeout().is_zero() {
            return Err(BridgeError::config("channel.handshake_timeout_ms must be positive"));
        }
        if self.handshake_attempts() == 0 {
            return Err(BridgeError::config("channel.handshake_attempts must be positive"));
        }
        let trusted = self.trusted_space()?;
        let untrusted = self.untrusted_space()?;
        if trusted.owns(ComponentId(untrusted.offset()))
            || untrusted.owns(ComponentId(trusted.offset()))
        {
            return Err(BridgeError::config(format!(
                "address spaces overlap: trusted {}+{}n, untrusted {}+{}n",
                trusted.offset(),
                trusted.stride(),
                untrusted.offset(),
                untrusted.stride()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config.handshake_timeout(), Duration::from_millis(250));
        assert_eq!(config.handshake_attempts(), 5);
        assert_eq!(config.trusted_space().unwrap(), AddressSpace::trusted());
        assert_eq!(config.untrusted_space().unwrap(), AddressSpace::untrusted());
    }

    #[test]
    fn test_partial_override() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [channel]
            handshake_attempts = 2

            [addressing.trusted]
            offset = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.handshake_attempts(), 2);
        assert_eq!(config.handshake_timeout(), Duration::from_millis(250));
        let trusted = config.trusted_space().unwrap();
        assert_eq!((trusted.offset(), trusted.stride()), (4, 2));
    }

    #[test]
    fn test_rejects_unusable_settings() {
        let zero_stride = BridgeConfig::from_toml_str("[addressing.untrusted]\nstride = 0\n");
        assert_eq!(zero_stride.unwrap_err().code(), 11502);

        let zero_attempts = BridgeConfig::from_toml_str("[channel]\nhandshake_attempts = 0\n");
        assert!(zero_attempts.is_err());

        let zero_timeout = BridgeConfig::from_toml_str("[channel]\nhandshake_timeout_ms = 0\n");
        assert!(zero_timeout.is_err());

        let overlap = BridgeConfig::from_toml_str(
            "[addressing.trusted]\noffset = 3\nstride = 2\n",
        )
        .unwrap_err();
        assert!(overlap.to_string().contains("overlap"));

        let bad_toml = BridgeConfig::from_toml_str("[channel\n");
        assert!(matches!(bad_toml, Err(BridgeError::Config { .. })));
    }
}
