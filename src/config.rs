use crate::{
    error::{Error, Result},
    key::{MAX_KEY_BITS, MAX_VALIDITY_SECS, MIN_KEY_BITS, MIN_VALIDITY_SECS},
    MAX_TOKEN_SIZE,
};
use serde::{Deserialize, Serialize};

/// Defaults a [`Domain`][crate::Domain] applies when publishing keys and sealing tokens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// How long a published key is used for signing before it's rotated.
    pub validity_window_secs: u32,
    /// Requested key strength. Must be within 512..=2048.
    pub key_bits: u32,
    /// Largest token that issuance or delegation will produce.
    pub max_token_size: usize,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            validity_window_secs: 86_400,
            key_bits: 2048,
            max_token_size: MAX_TOKEN_SIZE,
        }
    }
}

impl DomainConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_VALIDITY_SECS..=MAX_VALIDITY_SECS).contains(&self.validity_window_secs) {
            return Err(Error::InvalidParameter(format!(
                "validity window must be {}..={} seconds, got {}",
                MIN_VALIDITY_SECS, MAX_VALIDITY_SECS, self.validity_window_secs
            )));
        }
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&self.key_bits) {
            return Err(Error::InvalidParameter(format!(
                "key size must be {}..={} bits, got {}",
                MIN_KEY_BITS, MAX_KEY_BITS, self.key_bits
            )));
        }
        if self.max_token_size < crate::codec::MIN_TOKEN_SIZE || self.max_token_size > MAX_TOKEN_SIZE {
            return Err(Error::InvalidParameter(format!(
                "max token size must be {}..={} bytes, got {}",
                crate::codec::MIN_TOKEN_SIZE,
                MAX_TOKEN_SIZE,
                self.max_token_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        DomainConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json() {
        let config: DomainConfig = serde_json::from_str(r#"{"validity_window_secs": 60}"#).unwrap();
        assert_eq!(config.validity_window_secs, 60);
        assert_eq!(config.key_bits, 2048);
        config.validate().unwrap();
    }

    #[test]
    fn ranges() {
        let mut config = DomainConfig::default();
        config.validity_window_secs = 0;
        assert!(config.validate().is_err());
        config.validity_window_secs = 31_536_001;
        assert!(config.validate().is_err());
        config.validity_window_secs = 31_536_000;
        config.key_bits = 511;
        assert!(config.validate().is_err());
        config.key_bits = 512;
        config.validate().unwrap();
        config.max_token_size = 10;
        assert!(config.validate().is_err());
    }
}
