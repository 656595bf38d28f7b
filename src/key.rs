//! Signing key material and its validity window.

use crate::{
    error::{Error, Result},
    timestamp::Timestamp,
};
use fog_crypto::identity::{Identity, IdentityKey};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    convert::TryFrom,
    fmt,
    sync::{Mutex, PoisonError},
};

pub const MIN_VALIDITY_SECS: u32 = 1;
/// One year.
pub const MAX_VALIDITY_SECS: u32 = 31_536_000;
pub const MIN_KEY_BITS: u32 = 512;
pub const MAX_KEY_BITS: u32 = 2048;

/// Shared source of new key pairs. Generation runs under a single lock, so one generator can be
/// handed to any number of threads.
pub struct KeyGenerator {
    rng: Mutex<StdRng>,
}

impl KeyGenerator {
    /// A generator seeded from the operating system.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// A deterministic generator. Only suitable for tests.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn generate(&self) -> IdentityKey {
        // A panic elsewhere can't leave the rng in a state that matters here
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        IdentityKey::with_rng(&mut *rng)
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyGenerator").finish_non_exhaustive()
    }
}

/// A signing key pair bound to one application instance of one identity.
///
/// Key material starts out unpublished. Once published it carries the publication time, from
/// which both its expiry and its [timestamp token][KeyMaterial::timestamp_token] are derived.
/// Expiry is logical: an expired key still verifies until it has been rotated out twice.
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    key: IdentityKey,
    identity_name: String,
    app_instance_id: String,
    validity_window_ms: i64,
    key_bits: u32,
    published_at: Option<Timestamp>,
}

impl KeyMaterial {
    /// Generate fresh, unpublished key material.
    pub fn generate(
        generator: &KeyGenerator,
        identity_name: &str,
        app_instance_id: &str,
        validity_window_secs: u32,
        key_bits: u32,
    ) -> Result<Self> {
        if !(MIN_VALIDITY_SECS..=MAX_VALIDITY_SECS).contains(&validity_window_secs) {
            return Err(Error::InvalidParameter(format!(
                "validity window must be {}..={} seconds, got {}",
                MIN_VALIDITY_SECS, MAX_VALIDITY_SECS, validity_window_secs
            )));
        }
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&key_bits) {
            return Err(Error::InvalidParameter(format!(
                "key size must be {}..={} bits, got {}",
                MIN_KEY_BITS, MAX_KEY_BITS, key_bits
            )));
        }
        if identity_name.is_empty() || app_instance_id.is_empty() {
            return Err(Error::InvalidParameter(
                "identity name and app instance id must be non-empty".into(),
            ));
        }
        Ok(Self {
            key: generator.generate(),
            identity_name: identity_name.to_owned(),
            app_instance_id: app_instance_id.to_owned(),
            validity_window_ms: i64::from(validity_window_secs) * 1000,
            key_bits,
            published_at: None,
        })
    }

    /// True once more than the validity window has passed since publication. Unpublished
    /// material is always expired.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        match self.published_at {
            Some(at) => now.millis_since(at) > self.validity_window_ms,
            None => true,
        }
    }

    /// `YYYYMMDDHHMMSS` of the publication time. This is both the registry lookup suffix for
    /// the public key and the timestamp every manifest signed by this key carries.
    pub fn timestamp_token(&self) -> Result<String> {
        self.published_at
            .ok_or(Error::KeyNotPublished)?
            .key_token()
    }

    /// Replace the key pair with a fresh one. The material becomes unpublished.
    pub(crate) fn regenerate(&mut self, generator: &KeyGenerator) {
        self.key = generator.generate();
        self.published_at = None;
    }

    pub(crate) fn mark_published(&mut self, at: Timestamp) {
        self.published_at = Some(at);
    }

    pub(crate) fn signing_key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn public_key(&self) -> &Identity {
        self.key.id()
    }

    /// The public key in the hex form stored in the registry.
    pub fn public_key_hex(&self) -> String {
        encode_public_key(self.key.id())
    }

    pub fn identity_name(&self) -> &str {
        &self.identity_name
    }

    pub fn app_instance_id(&self) -> &str {
        &self.app_instance_id
    }

    pub fn validity_window_secs(&self) -> u32 {
        (self.validity_window_ms / 1000) as u32
    }

    pub fn key_bits(&self) -> u32 {
        self.key_bits
    }

    pub fn published_at(&self) -> Option<Timestamp> {
        self.published_at
    }
}

pub fn encode_public_key(id: &Identity) -> String {
    let mut raw = Vec::with_capacity(id.size());
    id.encode_vec(&mut raw);
    hex::encode(raw)
}

pub fn decode_public_key(encoded: &str) -> Result<Identity> {
    let raw = hex::decode(encoded)
        .map_err(|e| Error::InvalidParameter(format!("public key isn't valid hex: {}", e)))?;
    Ok(Identity::try_from(raw.as_slice())?)
}
