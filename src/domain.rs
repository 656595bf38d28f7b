//! Issuing, delegating, and verifying tokens against an identity registry.
//!
//! A [`Domain`] is the only part of the crate that talks to the [`Registry`] or signs anything.
//! Public keys are published as target associations of the signing identity under the token
//! kind's registry name, tagged `<app>=cur` (or `<app>=prev`) and `<app>=<timestamp>`:
//!
//! - `cur` marks the key currently used for signing.
//! - `prev` marks the single previous generation, kept so tokens signed just before a rotation
//!   still verify.
//! - The timestamp tag is what verifiers filter on, using the sender key timestamp from the
//!   token's manifest.
//!
//! Rotation is three separate registry writes (drop `prev`, retag `cur` to `prev`, publish the
//! new `cur`). The registry offers no transaction around them, so two processes renewing the same
//! application instance at once can interleave; the worst outcome is a key that's missing its
//! `cur`/`prev` tag, which makes tokens signed by it unverifiable once it should have been the
//! grace key. Callers that run several processes per application instance need to serialize
//! renewal themselves.
//!
//! Verification checks only the outermost signature. That signature covers the bytes of every
//! earlier hop, but the signatures inside the prior history are never checked on their own.

use crate::{
    clock::{Clock, SystemClock},
    codec::TOKEN_VERSION,
    config::DomainConfig,
    error::{Error, Result, VerifyError},
    key::{decode_public_key, KeyGenerator, KeyMaterial},
    registry::{IdentityEntry, Registry, RegistryUser},
    token::{Manifest, Token, UserRecord},
};
use log::{debug, info, warn};
use std::{marker::PhantomData, sync::Arc};

/// Distinguishes families of tokens that share the protocol but publish their keys in different
/// registries.
pub trait TokenKind: Send + Sync + 'static {
    /// Registry the signing keys are published under.
    const REGISTRY_NAME: &'static str;
    /// Short name used in log lines.
    const LABEL: &'static str;
}

/// Tokens vouching that a user authenticated.
#[derive(Clone, Copy, Debug, Default)]
pub struct AuthenticationKind;

impl TokenKind for AuthenticationKind {
    const REGISTRY_NAME: &'static str = "EIM_AUTH_TOKEN_KEYS";
    const LABEL: &'static str = "authentication";
}

/// Tokens asserting a user's identity without a fresh authentication.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityKind;

impl TokenKind for IdentityKind {
    const REGISTRY_NAME: &'static str = "EIM_IDENTITY_TOKEN_KEYS";
    const LABEL: &'static str = "identity";
}

pub type AuthenticationDomain<R> = Domain<AuthenticationKind, R>;
pub type IdentityDomain<R> = Domain<IdentityKind, R>;

/// Tag on the key an application instance currently signs with.
pub fn cur_tag(app_instance_id: &str) -> String {
    format!("{}=cur", app_instance_id)
}

/// Tag on the previous key generation of an application instance.
pub fn prev_tag(app_instance_id: &str) -> String {
    format!("{}=prev", app_instance_id)
}

/// Tag identifying one exact key generation of an application instance.
pub fn key_tag(app_instance_id: &str, timestamp_token: &str) -> String {
    format!("{}={}", app_instance_id, timestamp_token)
}

pub struct Domain<K: TokenKind, R: Registry> {
    registry: R,
    generator: Arc<KeyGenerator>,
    clock: Arc<dyn Clock>,
    config: DomainConfig,
    kind: PhantomData<fn() -> K>,
}

impl<K: TokenKind, R: Registry> Domain<K, R> {
    /// A domain on the system clock with the default configuration.
    pub fn new(registry: R) -> Self {
        Self {
            registry,
            generator: Arc::new(KeyGenerator::new()),
            clock: Arc::new(SystemClock),
            config: DomainConfig::default(),
            kind: PhantomData,
        }
    }

    pub fn with_clock(registry: R, clock: Arc<dyn Clock>, config: DomainConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            generator: Arc::new(KeyGenerator::new()),
            clock,
            config,
            kind: PhantomData,
        })
    }

    /// Share a key generator with other domains.
    pub fn with_generator(mut self, generator: Arc<KeyGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    /// Generate and publish new key material for an application instance, replacing whatever
    /// `cur` and `prev` keys it had.
    pub fn publish(
        &self,
        identity: &str,
        app_instance_id: &str,
        validity_window_secs: u32,
        key_bits: u32,
    ) -> Result<KeyMaterial> {
        let mut key = KeyMaterial::generate(
            &self.generator,
            identity,
            app_instance_id,
            validity_window_secs,
            key_bits,
        )?;
        self.require_identity(identity)?;
        self.remove_tagged(identity, &cur_tag(app_instance_id))?;
        self.remove_tagged(identity, &prev_tag(app_instance_id))?;
        self.publish_material(&mut key)?;
        Ok(key)
    }

    /// [`publish`][Self::publish] with the configured validity window and key size.
    pub fn publish_default(&self, identity: &str, app_instance_id: &str) -> Result<KeyMaterial> {
        self.publish(
            identity,
            app_instance_id,
            self.config.validity_window_secs,
            self.config.key_bits,
        )
    }

    /// Remove the `cur` and `prev` keys of this key material's application instance. Tokens
    /// they signed stop verifying.
    pub fn unpublish(&self, key: &KeyMaterial) -> Result<usize> {
        let identity = key.identity_name();
        let app = key.app_instance_id();
        let removed =
            self.remove_tagged(identity, &cur_tag(app))? + self.remove_tagged(identity, &prev_tag(app))?;
        info!(
            "Unpublished {} {} key(s) for {}/{}",
            removed,
            K::LABEL,
            identity,
            app
        );
        Ok(removed)
    }

    /// Rotate the key if its validity window has passed. Returns whether a rotation happened.
    ///
    /// On rotation the `prev` key is deleted, the `cur` key becomes `prev`, and a fresh key pair
    /// is generated into `key` and published as `cur`. A failure part-way leaves the registry
    /// partially updated and the error is returned; nothing is signed with the stale key.
    ///
    /// If `key` was never published and its instance has no `cur` key, an earlier rotation got as
    /// far as retagging and then failed to publish. Only the publish is retried then, so the
    /// `prev` key it retagged survives.
    pub fn renew_if_expired(&self, key: &mut KeyMaterial) -> Result<bool> {
        if !key.is_expired(self.clock.now()) {
            return Ok(false);
        }
        let identity = key.identity_name().to_owned();
        let app = key.app_instance_id().to_owned();
        let cur = cur_tag(&app);
        let prev = prev_tag(&app);

        let current = self
            .registry
            .find_target_associations(&identity, K::REGISTRY_NAME, Some(&cur))?;
        if current.is_empty() && key.published_at().is_none() {
            info!(
                "Resuming interrupted {} key rotation for {}/{}",
                K::LABEL,
                identity,
                app
            );
            self.publish_material(key)?;
            return Ok(true);
        }

        self.remove_tagged(&identity, &prev)?;
        if current.is_empty() {
            warn!(
                "No current {} key for {}/{} while rotating; another process may be renewing it",
                K::LABEL,
                identity,
                app
            );
        }
        for user in current {
            self.registry
                .remove_additional_info(&identity, K::REGISTRY_NAME, &user.user_name, &cur)?;
            self.registry
                .add_additional_info(&identity, K::REGISTRY_NAME, &user.user_name, &prev)?;
        }

        key.regenerate(&self.generator);
        self.publish_material(key)?;
        Ok(true)
    }

    /// Issue a first-hop token vouching that `user` authenticated against `user_registry`,
    /// addressed to the given receiver.
    pub fn issue(
        &self,
        key: &mut KeyMaterial,
        user: &str,
        user_registry: &str,
        receiver_identity: &str,
        receiver_instance: &str,
    ) -> Result<Token> {
        self.renew_if_expired(key)?;
        let manifest = self.manifest_for(key, 1, receiver_identity, receiver_instance)?;
        let token = Token::seal(
            key.signing_key(),
            manifest,
            Vec::new(),
            UserRecord::new(user, user_registry),
            self.config.max_token_size,
        )?;
        debug!(
            "Issued {} token for {}@{} from {}/{} to {}/{}",
            K::LABEL,
            user,
            user_registry,
            key.identity_name(),
            key.app_instance_id(),
            receiver_identity,
            receiver_instance
        );
        Ok(token)
    }

    /// Extend a token's trust chain with a hop from this key's application to a new receiver.
    ///
    /// The token must currently be addressed to this key's identity and application instance,
    /// and must verify. On success the token is replaced in place; on failure it is untouched.
    pub fn delegate(
        &self,
        key: &mut KeyMaterial,
        token: &mut Token,
        receiver_identity: &str,
        receiver_instance: &str,
    ) -> Result<()> {
        self.verify(token, key.identity_name(), key.app_instance_id())?;
        self.renew_if_expired(key)?;
        let counter = token.counter().checked_add(1).ok_or_else(|| {
            Error::InvalidParameter("token chain counter would overflow".into())
        })?;
        let manifest = self.manifest_for(key, counter, receiver_identity, receiver_instance)?;
        let delegated = Token::seal(
            key.signing_key(),
            manifest,
            token.extended_history()?,
            token.user().clone(),
            self.config.max_token_size,
        )?;
        debug!(
            "Delegated {} token for {} to {}/{} at hop {}",
            K::LABEL,
            delegated.user_name(),
            receiver_identity,
            receiver_instance,
            counter
        );
        *token = delegated;
        Ok(())
    }

    /// Check that the token is addressed to this identity and application instance, and that its
    /// outermost signature was made by the sender's published key.
    pub fn verify(&self, token: &Token, identity: &str, app_instance_id: &str) -> Result<()> {
        match self.check(token, identity, app_instance_id) {
            Ok(()) => {
                debug!(
                    "Verified {} token from {}/{} at hop {}",
                    K::LABEL,
                    token.sender_identity(),
                    token.sender_instance(),
                    token.counter()
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Rejected {} token from {}/{}: {}",
                    K::LABEL,
                    token.sender_identity(),
                    token.sender_instance(),
                    e
                );
                Err(e)
            }
        }
    }

    fn check(&self, token: &Token, identity: &str, app_instance_id: &str) -> Result<()> {
        let manifest = token.manifest();
        if manifest.receiver_identity != identity {
            return Err(VerifyError::ReceiverIdentityMismatch {
                expected: identity.to_owned(),
                actual: manifest.receiver_identity.clone(),
            }
            .into());
        }
        if manifest.receiver_instance != app_instance_id {
            return Err(VerifyError::ReceiverInstanceMismatch {
                expected: app_instance_id.to_owned(),
                actual: manifest.receiver_instance.clone(),
            }
            .into());
        }

        let sender = self.require_identity(&manifest.sender_identity)?;
        let filter = key_tag(&manifest.sender_instance, &manifest.sender_key_timestamp);
        let mut keys =
            self.registry
                .find_target_associations(&sender.name, K::REGISTRY_NAME, Some(&filter))?;
        let published = match keys.len() {
            0 => {
                return Err(VerifyError::PublicKeyNotFound {
                    identity: sender.name,
                    filter,
                }
                .into())
            }
            1 => keys.remove(0),
            count => {
                return Err(VerifyError::Ambiguous {
                    what: format!("public key for {:?}", filter),
                    count,
                }
                .into())
            }
        };

        let public_key = decode_public_key(&published.user_name).map_err(|e| {
            warn!(
                "Published {} key for {} under {:?} doesn't decode: {}",
                K::LABEL,
                sender.name,
                filter,
                e
            );
            VerifyError::SignatureInvalid
        })?;
        if !token.signature_matches(&public_key)? {
            return Err(VerifyError::SignatureInvalid.into());
        }
        Ok(())
    }

    /// Verify the token, then map its user into `target_registry`.
    ///
    /// Several mappings that all name the same target user count as one. Mappings to different
    /// users are ambiguous.
    pub fn resolve_target_user(
        &self,
        token: &Token,
        target_registry: &str,
        identity: &str,
        app_instance_id: &str,
    ) -> Result<Option<RegistryUser>> {
        self.verify(token, identity, app_instance_id)?;
        let mut found = self.registry.find_target_from_source(
            token.user_name(),
            token.source_registry(),
            target_registry,
        )?;
        let Some(first) = found.pop() else {
            return Ok(None);
        };
        let distinct = found
            .iter()
            .filter(|u| u.user_name != first.user_name)
            .count();
        if distinct > 0 {
            let mut names: Vec<&str> = found.iter().map(|u| u.user_name.as_str()).collect();
            names.push(&first.user_name);
            names.sort_unstable();
            names.dedup();
            return Err(VerifyError::Ambiguous {
                what: format!("{} user for {}", target_registry, token.user_name()),
                count: names.len(),
            }
            .into());
        }
        Ok(Some(first))
    }

    /// Look up the one identity carrying `alias`.
    pub fn identity_for_alias(&self, alias: &str) -> Result<IdentityEntry> {
        let found = self.registry.find_identities_by_alias(alias)?;
        exactly_one(found, || format!("identity with alias {:?}", alias))
            .map_err(|e| match e {
                Error::Verify(VerifyError::IdentityNotFound(_)) => {
                    Error::from(VerifyError::IdentityNotFound(alias.to_owned()))
                }
                e => e,
            })
    }

    /// [`issue`][Self::issue], returning the token's wire form.
    pub fn issue_bytes(
        &self,
        key: &mut KeyMaterial,
        user: &str,
        user_registry: &str,
        receiver_identity: &str,
        receiver_instance: &str,
    ) -> Result<Vec<u8>> {
        self.issue(key, user, user_registry, receiver_identity, receiver_instance)?
            .to_bytes()
    }

    /// Parse and [`verify`][Self::verify] a token's wire form.
    pub fn verify_bytes(&self, buf: &[u8], identity: &str, app_instance_id: &str) -> Result<Token> {
        let token = Token::from_bytes(buf)?;
        self.verify(&token, identity, app_instance_id)?;
        Ok(token)
    }

    /// Parse and [`delegate`][Self::delegate] a token's wire form.
    pub fn delegate_bytes(
        &self,
        key: &mut KeyMaterial,
        buf: &[u8],
        receiver_identity: &str,
        receiver_instance: &str,
    ) -> Result<Vec<u8>> {
        let mut token = Token::from_bytes(buf)?;
        self.delegate(key, &mut token, receiver_identity, receiver_instance)?;
        token.to_bytes()
    }

    fn manifest_for(
        &self,
        key: &KeyMaterial,
        counter: u32,
        receiver_identity: &str,
        receiver_instance: &str,
    ) -> Result<Manifest> {
        Ok(Manifest {
            version: TOKEN_VERSION,
            counter,
            sender_identity: key.identity_name().to_owned(),
            sender_instance: key.app_instance_id().to_owned(),
            sender_key_timestamp: key.timestamp_token()?,
            receiver_identity: receiver_identity.to_owned(),
            receiver_instance: receiver_instance.to_owned(),
        })
    }

    fn require_identity(&self, name: &str) -> Result<IdentityEntry> {
        let found = self.registry.find_identities_by_name(name)?;
        exactly_one(found, || format!("identity named {:?}", name)).map_err(|e| match e {
            Error::Verify(VerifyError::IdentityNotFound(_)) => {
                Error::from(VerifyError::IdentityNotFound(name.to_owned()))
            }
            e => e,
        })
    }

    fn publish_material(&self, key: &mut KeyMaterial) -> Result<()> {
        let now = self.clock.now();
        let timestamp = now.key_token()?;
        let app = key.app_instance_id();
        let tags = [cur_tag(app), key_tag(app, &timestamp)];
        self.registry.add_target_association(
            key.identity_name(),
            K::REGISTRY_NAME,
            &key.public_key_hex(),
            &tags,
        )?;
        key.mark_published(now);
        info!(
            "Published {} key for {}/{} at {}",
            K::LABEL,
            key.identity_name(),
            key.app_instance_id(),
            timestamp
        );
        Ok(())
    }

    fn remove_tagged(&self, identity: &str, tag: &str) -> Result<usize> {
        let found = self
            .registry
            .find_target_associations(identity, K::REGISTRY_NAME, Some(tag))?;
        for user in found.iter() {
            self.registry
                .remove_target_association(identity, K::REGISTRY_NAME, &user.user_name)?;
        }
        Ok(found.len())
    }
}

fn exactly_one(mut found: Vec<IdentityEntry>, what: impl FnOnce() -> String) -> Result<IdentityEntry> {
    match found.len() {
        0 => Err(VerifyError::IdentityNotFound(String::new()).into()),
        1 => Ok(found.remove(0)),
        count => Err(VerifyError::Ambiguous {
            what: what(),
            count,
        }
        .into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        clock::ManualClock,
        error::{ParseError, RegistryError},
        registry::MemoryRegistry,
        timestamp::Timestamp,
    };
    use byteorder::{BigEndian, ByteOrder};
    use rand::Rng;
    use std::sync::atomic::{AtomicBool, Ordering};

    const WINDOW: u32 = 60;

    struct Fixture {
        registry: Arc<MemoryRegistry>,
        clock: Arc<ManualClock>,
        generator: Arc<KeyGenerator>,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(MemoryRegistry::new());
            registry.add_identity("App A", &["a.example.com"]);
            registry.add_identity("App B", &["b.example.com"]);
            registry.add_identity("App C", &[]);
            Self {
                registry,
                clock: Arc::new(ManualClock::new(Timestamp::from_sec(1_792_056_600))),
                generator: Arc::new(KeyGenerator::from_seed(11)),
            }
        }

        fn domain(&self) -> AuthenticationDomain<Arc<MemoryRegistry>> {
            let config = DomainConfig {
                validity_window_secs: WINDOW,
                key_bits: 1024,
                ..DomainConfig::default()
            };
            Domain::with_clock(self.registry.clone(), self.clock.clone(), config)
                .unwrap()
                .with_generator(self.generator.clone())
        }
    }

    fn verify_err(result: Result<()>) -> VerifyError {
        match result {
            Err(Error::Verify(e)) => e,
            other => panic!("expected a verification error, got {:?}", other),
        }
    }

    /// Count the (header, manifest) pairs in a prior history by hopping over record lengths.
    fn history_pairs(mut history: &[u8]) -> usize {
        let mut records = 0;
        while !history.is_empty() {
            let len = BigEndian::read_u32(&history[0..4]) as usize;
            history = &history[len..];
            records += 1;
        }
        assert_eq!(records % 2, 0);
        records / 2
    }

    #[test]
    fn publish_tags_key() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let key = domain.publish_default("App A", "a-1").unwrap();
        let ts = key.timestamp_token().unwrap();
        assert_eq!(ts, "20261015093000");
        let cur = fx
            .registry
            .find_target_associations("App A", AuthenticationKind::REGISTRY_NAME, Some("a-1=cur"))
            .unwrap();
        assert_eq!(cur.len(), 1);
        assert_eq!(cur[0].user_name, key.public_key_hex());
        assert!(cur[0].additional_info.contains(&key_tag("a-1", &ts)));
    }

    #[test]
    fn publish_replaces_old_keys() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key = domain.publish_default("App A", "a-1").unwrap();
        fx.clock.advance_secs(i64::from(WINDOW) + 1);
        assert!(domain.renew_if_expired(&mut key).unwrap());
        fx.clock.advance_secs(1);

        let fresh = domain.publish_default("App A", "a-1").unwrap();
        let all = fx
            .registry
            .find_target_associations("App A", AuthenticationKind::REGISTRY_NAME, None)
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].user_name, fresh.public_key_hex());
    }

    #[test]
    fn publish_needs_registered_identity() {
        let fx = Fixture::new();
        let err = fx.domain().publish_default("Nobody", "n-1").unwrap_err();
        assert_eq!(
            err.as_verify(),
            Some(&VerifyError::IdentityNotFound("Nobody".into()))
        );
        assert!(fx.domain().publish("App A", "a-1", 0, 1024).is_err());
    }

    #[test]
    fn issue_delegate_verify_scenario() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key_a = domain.publish_default("App A", "a-1").unwrap();
        let mut key_b = domain.publish_default("App B", "b-1").unwrap();

        let mut token = domain.issue(&mut key_a, "ALICE", "LDAP", "App B", "b-1").unwrap();
        assert_eq!(token.counter(), 1);
        assert!(token.prior_history().is_empty());
        domain.verify(&token, "App B", "b-1").unwrap();
        let original = token.clone();

        domain.delegate(&mut key_b, &mut token, "App C", "c-1").unwrap();
        assert_eq!(token.counter(), 2);
        assert_eq!(token.prior_history(), original.extended_history().unwrap().as_slice());
        assert_eq!(token.user(), original.user());
        assert_eq!(token.sender_identity(), "App B");

        domain.verify(&token, "App C", "c-1").unwrap();
        assert_eq!(
            verify_err(domain.verify(&token, "App B", "b-1")),
            VerifyError::ReceiverIdentityMismatch {
                expected: "App B".into(),
                actual: "App C".into()
            }
        );

        // Survives the wire
        let bytes = token.to_bytes().unwrap();
        let parsed = domain.verify_bytes(&bytes, "App C", "c-1").unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn counter_tracks_delegations() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key_a = domain.publish_default("App A", "a-1").unwrap();
        let mut key_b = domain.publish_default("App B", "b-1").unwrap();

        let mut token = domain.issue(&mut key_a, "ALICE", "LDAP", "App B", "b-1").unwrap();
        for n in 1..=6u32 {
            // Bounce between A and B
            let (key, to, to_app) = if n % 2 == 1 {
                (&mut key_b, "App A", "a-1")
            } else {
                (&mut key_a, "App B", "b-1")
            };
            domain.delegate(key, &mut token, to, to_app).unwrap();
            assert_eq!(token.counter(), n + 1);
            assert_eq!(history_pairs(token.prior_history()), n as usize);
            let reparsed = Token::from_bytes(&token.to_bytes().unwrap()).unwrap();
            assert_eq!(reparsed, token);
        }
        domain.verify(&token, "App B", "b-1").unwrap();
    }

    #[test]
    fn delegation_requires_being_the_receiver() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key_a = domain.publish_default("App A", "a-1").unwrap();
        let mut key_c = domain.publish_default("App C", "c-1").unwrap();
        let mut token = domain.issue(&mut key_a, "ALICE", "LDAP", "App B", "b-1").unwrap();
        let before = token.clone();
        let err = domain
            .delegate(&mut key_c, &mut token, "App A", "a-1")
            .unwrap_err();
        assert!(matches!(
            err.as_verify(),
            Some(VerifyError::ReceiverIdentityMismatch { .. })
        ));
        assert_eq!(token, before);
    }

    #[test]
    fn receiver_instance_binding() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key_a = domain.publish_default("App A", "a-1").unwrap();
        let token = domain.issue(&mut key_a, "ALICE", "LDAP", "App B", "b-1").unwrap();
        assert_eq!(
            verify_err(domain.verify(&token, "App B", "b-2")),
            VerifyError::ReceiverInstanceMismatch {
                expected: "b-2".into(),
                actual: "b-1".into()
            }
        );
    }

    #[test]
    fn tampering_is_detected() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key_a = domain.publish_default("App A", "a-1").unwrap();
        let mut key_b = domain.publish_default("App B", "b-1").unwrap();
        let mut token = domain.issue(&mut key_a, "ALICE", "LDAP", "App B", "b-1").unwrap();
        domain.delegate(&mut key_b, &mut token, "App C", "c-1").unwrap();
        let bytes = token.to_bytes().unwrap();

        let header_len = BigEndian::read_u32(&bytes[0..4]) as usize;
        let manifest_len = BigEndian::read_u32(&bytes[header_len..header_len + 4]) as usize;
        let history_start = header_len + manifest_len;
        let user_len = BigEndian::read_u32(&bytes[bytes.len() - 4..]) as usize;
        let user_start = bytes.len() - user_len;

        let check = |pos: usize, bit: u8| {
            let mut bad = bytes.clone();
            bad[pos] ^= 1 << bit;
            match domain.verify_bytes(&bad, "App C", "c-1") {
                Err(Error::Verify(VerifyError::SignatureInvalid)) => (),
                other => panic!("flip at {} gave {:?}", pos, other.map(|_| ())),
            }
        };

        // Manifest counter: 2 -> 3
        check(header_len + 11, 0);
        // First character of the user name: 'A' -> '@'
        check(user_start + 25, 0);
        // Anywhere in the prior history
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            check(rng.gen_range(history_start..user_start), rng.gen_range(0..8));
        }
    }

    #[test]
    fn rotation_grace_window() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key_a = domain.publish_default("App A", "a-1").unwrap();
        let first_ts = key_a.timestamp_token().unwrap();
        let token = domain.issue(&mut key_a, "ALICE", "LDAP", "App B", "b-1").unwrap();

        // First rotation: the old key is kept as prev
        fx.clock.advance_secs(i64::from(WINDOW) + 1);
        domain.issue(&mut key_a, "BOB", "LDAP", "App B", "b-1").unwrap();
        assert_ne!(key_a.timestamp_token().unwrap(), first_ts);
        let prev = fx
            .registry
            .find_target_associations("App A", AuthenticationKind::REGISTRY_NAME, Some("a-1=prev"))
            .unwrap();
        assert_eq!(prev.len(), 1);
        assert!(prev[0].additional_info.contains(&key_tag("a-1", &first_ts)));
        domain.verify(&token, "App B", "b-1").unwrap();

        // Second rotation: the old key is gone
        fx.clock.advance_secs(i64::from(WINDOW) + 1);
        domain.issue(&mut key_a, "BOB", "LDAP", "App B", "b-1").unwrap();
        assert!(matches!(
            verify_err(domain.verify(&token, "App B", "b-1")),
            VerifyError::PublicKeyNotFound { .. }
        ));
    }

    #[test]
    fn renewal_only_when_expired() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key = domain.publish_default("App A", "a-1").unwrap();
        let public = key.public_key_hex();
        fx.clock.advance_secs(i64::from(WINDOW));
        assert!(!domain.renew_if_expired(&mut key).unwrap());
        assert_eq!(key.public_key_hex(), public);
        fx.clock.advance_millis(1);
        assert!(domain.renew_if_expired(&mut key).unwrap());
        assert_ne!(key.public_key_hex(), public);
    }

    #[test]
    fn renewal_without_cur_still_publishes() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key = domain.publish_default("App A", "a-1").unwrap();
        domain.unpublish(&key).unwrap();
        fx.clock.advance_secs(i64::from(WINDOW) + 1);
        assert!(domain.renew_if_expired(&mut key).unwrap());
        let cur = fx
            .registry
            .find_target_associations("App A", AuthenticationKind::REGISTRY_NAME, Some("a-1=cur"))
            .unwrap();
        assert_eq!(cur.len(), 1);
    }

    #[test]
    fn ambiguous_sender_identity() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key_a = domain.publish_default("App A", "a-1").unwrap();
        let token = domain.issue(&mut key_a, "ALICE", "LDAP", "App B", "b-1").unwrap();
        fx.registry.add_identity("App A", &[]);
        assert_eq!(
            verify_err(domain.verify(&token, "App B", "b-1")),
            VerifyError::Ambiguous {
                what: "identity named \"App A\"".into(),
                count: 2
            }
        );
    }

    #[test]
    fn ambiguous_public_key() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key_a = domain.publish_default("App A", "a-1").unwrap();
        let token = domain.issue(&mut key_a, "ALICE", "LDAP", "App B", "b-1").unwrap();
        let tag = key_tag("a-1", &key_a.timestamp_token().unwrap());
        fx.registry
            .add_target_association("App A", AuthenticationKind::REGISTRY_NAME, "00ff", &[tag])
            .unwrap();
        assert!(matches!(
            verify_err(domain.verify(&token, "App B", "b-1")),
            VerifyError::Ambiguous { count: 2, .. }
        ));
    }

    #[test]
    fn unknown_sender() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key_a = domain.publish_default("App A", "a-1").unwrap();
        let token = domain.issue(&mut key_a, "ALICE", "LDAP", "App B", "b-1").unwrap();

        let elsewhere = Arc::new(MemoryRegistry::new());
        let other: AuthenticationDomain<_> = Domain::new(elsewhere);
        assert_eq!(
            verify_err(other.verify(&token, "App B", "b-1")),
            VerifyError::IdentityNotFound("App A".into())
        );
    }

    #[test]
    fn token_kinds_are_separate() {
        let fx = Fixture::new();
        let auth = fx.domain();
        let ident: IdentityDomain<_> = Domain::with_clock(
            fx.registry.clone(),
            fx.clock.clone(),
            DomainConfig::default(),
        )
        .unwrap();
        let mut key_a = auth.publish_default("App A", "a-1").unwrap();
        let token = auth.issue(&mut key_a, "ALICE", "LDAP", "App B", "b-1").unwrap();
        assert!(matches!(
            verify_err(ident.verify(&token, "App B", "b-1")),
            VerifyError::PublicKeyNotFound { .. }
        ));
    }

    #[test]
    fn key_swapped_under_same_tag() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key_a = domain.publish_default("App A", "a-1").unwrap();
        let token = domain.issue(&mut key_a, "ALICE", "LDAP", "App B", "b-1").unwrap();
        let tags = fx
            .registry
            .find_target_associations("App A", AuthenticationKind::REGISTRY_NAME, Some("a-1=cur"))
            .unwrap()
            .remove(0)
            .additional_info;
        fx.registry
            .remove_target_association("App A", AuthenticationKind::REGISTRY_NAME, &key_a.public_key_hex())
            .unwrap();
        let impostor = KeyMaterial::generate(&fx.generator, "App A", "a-1", WINDOW, 1024).unwrap();
        fx.registry
            .add_target_association(
                "App A",
                AuthenticationKind::REGISTRY_NAME,
                &impostor.public_key_hex(),
                &tags,
            )
            .unwrap();
        assert_eq!(
            verify_err(domain.verify(&token, "App B", "b-1")),
            VerifyError::SignatureInvalid
        );
    }

    #[test]
    fn undecodable_published_key() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key_a = domain.publish_default("App A", "a-1").unwrap();
        let token = domain.issue(&mut key_a, "ALICE", "LDAP", "App B", "b-1").unwrap();
        let tags = fx
            .registry
            .find_target_associations("App A", AuthenticationKind::REGISTRY_NAME, Some("a-1=cur"))
            .unwrap()
            .remove(0)
            .additional_info;
        fx.registry
            .remove_target_association("App A", AuthenticationKind::REGISTRY_NAME, &key_a.public_key_hex())
            .unwrap();

        // Not hex at all, then hex that isn't a key
        for bad in ["zz", "00ff"] {
            fx.registry
                .add_target_association("App A", AuthenticationKind::REGISTRY_NAME, bad, &tags)
                .unwrap();
            let err = domain.verify(&token, "App B", "b-1").unwrap_err();
            assert_eq!(err.as_verify(), Some(&VerifyError::SignatureInvalid));
            fx.registry
                .remove_target_association("App A", AuthenticationKind::REGISTRY_NAME, bad)
                .unwrap();
        }
    }

    #[test]
    fn resolve_target_user() {
        let fx = Fixture::new();
        let domain = fx.domain();
        fx.registry.add_identity("Alice Smith", &[]);
        fx.registry
            .add_source_association("Alice Smith", "LDAP", "ALICE")
            .unwrap();
        fx.registry
            .add_target_association("Alice Smith", "UNIX", "asmith", &[])
            .unwrap();
        let mut key_a = domain.publish_default("App A", "a-1").unwrap();
        let token = domain.issue(&mut key_a, "ALICE", "LDAP", "App B", "b-1").unwrap();

        let found = domain
            .resolve_target_user(&token, "UNIX", "App B", "b-1")
            .unwrap()
            .unwrap();
        assert_eq!(found.user_name, "asmith");
        assert!(domain
            .resolve_target_user(&token, "WINDOWS", "App B", "b-1")
            .unwrap()
            .is_none());

        // A second identity mapping to the same user is a duplicate, not ambiguity
        fx.registry.add_identity("A. Smith", &[]);
        fx.registry
            .add_source_association("A. Smith", "LDAP", "ALICE")
            .unwrap();
        fx.registry
            .add_target_association("A. Smith", "UNIX", "asmith", &[])
            .unwrap();
        let found = domain
            .resolve_target_user(&token, "UNIX", "App B", "b-1")
            .unwrap()
            .unwrap();
        assert_eq!(found.user_name, "asmith");

        fx.registry
            .add_target_association("A. Smith", "UNIX", "alice2", &[])
            .unwrap();
        let err = domain
            .resolve_target_user(&token, "UNIX", "App B", "b-1")
            .unwrap_err();
        assert!(matches!(
            err.as_verify(),
            Some(VerifyError::Ambiguous { count: 2, .. })
        ));

        // Resolution never skips verification
        assert!(domain
            .resolve_target_user(&token, "UNIX", "App C", "c-1")
            .is_err());
    }

    #[test]
    fn alias_lookup() {
        let fx = Fixture::new();
        let domain = fx.domain();
        assert_eq!(domain.identity_for_alias("a.example.com").unwrap().name, "App A");
        assert_eq!(
            domain.identity_for_alias("z.example.com").unwrap_err().as_verify(),
            Some(&VerifyError::IdentityNotFound("z.example.com".into()))
        );
        fx.registry.add_identity("App A2", &["a.example.com"]);
        assert!(matches!(
            domain.identity_for_alias("a.example.com").unwrap_err().as_verify(),
            Some(VerifyError::Ambiguous { count: 2, .. })
        ));
    }

    #[test]
    fn byte_level_operations() {
        let fx = Fixture::new();
        let domain = fx.domain();
        let mut key_a = domain.publish_default("App A", "a-1").unwrap();
        let mut key_b = domain.publish_default("App B", "b-1").unwrap();
        let bytes = domain
            .issue_bytes(&mut key_a, "ALICE", "LDAP", "App B", "b-1")
            .unwrap();
        let bytes = domain
            .delegate_bytes(&mut key_b, &bytes, "App C", "c-1")
            .unwrap();
        let token = domain.verify_bytes(&bytes, "App C", "c-1").unwrap();
        assert_eq!(token.counter(), 2);

        let err = domain.verify_bytes(&bytes[..50], "App C", "c-1").unwrap_err();
        assert!(matches!(err.as_parse(), Some(ParseError::TooShort { .. })));
    }

    #[test]
    fn oversized_delegation_is_refused() {
        let fx = Fixture::new();
        let config = DomainConfig {
            validity_window_secs: WINDOW,
            key_bits: 1024,
            max_token_size: 700,
        };
        let domain: AuthenticationDomain<_> =
            Domain::with_clock(fx.registry.clone(), fx.clock.clone(), config).unwrap();
        let mut key_a = domain.publish_default("App A", "a-1").unwrap();
        let mut key_b = domain.publish_default("App B", "b-1").unwrap();
        let mut token = domain.issue(&mut key_a, "ALICE", "LDAP", "App B", "b-1").unwrap();
        let mut result = Ok(());
        for _ in 0..8 {
            result = domain.delegate(&mut key_b, &mut token, "App B", "b-1");
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(Error::TokenTooLarge { max: 700, .. })));
    }

    /// Passes through to a memory registry, but can be told to fail writes.
    struct FlakyRegistry {
        inner: MemoryRegistry,
        fail_writes: AtomicBool,
        fail_adds: AtomicBool,
    }

    impl FlakyRegistry {
        fn write(&self, op: &'static str) -> Result<(), RegistryError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                Err(RegistryError::new(op, "connection reset"))
            } else {
                Ok(())
            }
        }
    }

    impl Registry for FlakyRegistry {
        fn find_identities_by_name(&self, name: &str) -> Result<Vec<IdentityEntry>, RegistryError> {
            self.inner.find_identities_by_name(name)
        }
        fn find_identities_by_alias(&self, alias: &str) -> Result<Vec<IdentityEntry>, RegistryError> {
            self.inner.find_identities_by_alias(alias)
        }
        fn find_target_associations(
            &self,
            identity: &str,
            registry: &str,
            filter: Option<&str>,
        ) -> Result<Vec<RegistryUser>, RegistryError> {
            self.inner.find_target_associations(identity, registry, filter)
        }
        fn add_target_association(
            &self,
            identity: &str,
            registry: &str,
            user_name: &str,
            additional_info: &[String],
        ) -> Result<(), RegistryError> {
            self.write("add target association")?;
            if self.fail_adds.load(Ordering::SeqCst) {
                return Err(RegistryError::new("add target association", "reset"));
            }
            self.inner
                .add_target_association(identity, registry, user_name, additional_info)
        }
        fn remove_target_association(
            &self,
            identity: &str,
            registry: &str,
            user_name: &str,
        ) -> Result<(), RegistryError> {
            self.write("remove target association")?;
            self.inner.remove_target_association(identity, registry, user_name)
        }
        fn add_additional_info(
            &self,
            identity: &str,
            registry: &str,
            user_name: &str,
            info: &str,
        ) -> Result<(), RegistryError> {
            self.write("add additional info")?;
            self.inner.add_additional_info(identity, registry, user_name, info)
        }
        fn remove_additional_info(
            &self,
            identity: &str,
            registry: &str,
            user_name: &str,
            info: &str,
        ) -> Result<(), RegistryError> {
            self.write("remove additional info")?;
            self.inner.remove_additional_info(identity, registry, user_name, info)
        }
        fn find_target_from_source(
            &self,
            user: &str,
            source_registry: &str,
            target_registry: &str,
        ) -> Result<Vec<RegistryUser>, RegistryError> {
            self.inner
                .find_target_from_source(user, source_registry, target_registry)
        }
    }

    fn flaky_domain() -> (AuthenticationDomain<FlakyRegistry>, Arc<ManualClock>) {
        let registry = FlakyRegistry {
            inner: MemoryRegistry::new(),
            fail_writes: AtomicBool::new(false),
            fail_adds: AtomicBool::new(false),
        };
        registry.inner.add_identity("App A", &[]);
        let clock = Arc::new(ManualClock::new(Timestamp::from_sec(1_792_056_600)));
        let config = DomainConfig {
            validity_window_secs: WINDOW,
            ..DomainConfig::default()
        };
        let domain = Domain::with_clock(registry, clock.clone(), config).unwrap();
        (domain, clock)
    }

    #[test]
    fn failed_renewal_aborts_issue() {
        let (domain, clock) = flaky_domain();
        let mut key = domain.publish_default("App A", "a-1").unwrap();
        let signing_ts = key.timestamp_token().unwrap();
        domain.issue(&mut key, "ALICE", "LDAP", "App B", "b-1").unwrap();

        clock.advance_secs(i64::from(WINDOW) + 1);
        domain.registry().fail_writes.store(true, Ordering::SeqCst);
        let err = domain
            .issue(&mut key, "ALICE", "LDAP", "App B", "b-1")
            .unwrap_err();
        match err {
            Error::Registry(e) => assert_eq!(e.message, "connection reset"),
            other => panic!("expected a registry error, got {:?}", other),
        }
        // Still due for renewal, and no token was signed with the stale key
        assert!(key.is_expired(clock.now()));
        assert_eq!(key.timestamp_token().unwrap(), signing_ts);
    }

    #[test]
    fn retried_rotation_keeps_prev_key() {
        let (domain, clock) = flaky_domain();
        let mut key = domain.publish_default("App A", "a-1").unwrap();
        let first_ts = key.timestamp_token().unwrap();
        let token = domain.issue(&mut key, "ALICE", "LDAP", "App B", "b-1").unwrap();

        // Rotation retags cur to prev, then fails to publish the new key
        clock.advance_secs(i64::from(WINDOW) + 1);
        domain.registry().fail_adds.store(true, Ordering::SeqCst);
        let err = domain
            .issue(&mut key, "BOB", "LDAP", "App B", "b-1")
            .unwrap_err();
        assert!(matches!(err, Error::Registry(_)));
        assert!(key.published_at().is_none());

        clock.advance_secs(1);
        domain.registry().fail_adds.store(false, Ordering::SeqCst);
        domain.issue(&mut key, "BOB", "LDAP", "App B", "b-1").unwrap();
        assert_ne!(key.timestamp_token().unwrap(), first_ts);

        let registry = domain.registry();
        let prev = registry
            .find_target_associations("App A", AuthenticationKind::REGISTRY_NAME, Some("a-1=prev"))
            .unwrap();
        assert_eq!(prev.len(), 1);
        assert!(prev[0].additional_info.contains(&key_tag("a-1", &first_ts)));
        let cur = registry
            .find_target_associations("App A", AuthenticationKind::REGISTRY_NAME, Some("a-1=cur"))
            .unwrap();
        assert_eq!(cur.len(), 1);
        assert_eq!(cur[0].user_name, key.public_key_hex());

        // Exactly one rotation happened, so the first key is still the grace key
        domain.verify(&token, "App B", "b-1").unwrap();
    }
}
