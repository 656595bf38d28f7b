//! identity-token issues, delegates, and verifies signed tokens that let one application vouch
//! to another that a user authenticated, without the user's credentials travelling along.
//!
//! A token says: user U, authenticated against registry R, was vouched for by application A and
//! is intended for application B. Application B may pass it on to C by delegating it, which adds
//! a hop to the token's trust chain and re-signs the whole chain.
//!
//! The pieces:
//!
//! - A self-describing binary envelope ([`codec`]): a signature header, the current manifest,
//!     the opaque history of earlier hops, and the user record, with a trailing length so the
//!     user record can be found without walking the chain.
//! - Signing keys ([`KeyMaterial`]) with a validity window, published in an identity
//!     [`Registry`] and rotated with a one-generation grace period.
//! - A [`Domain`] tying it together: it issues, delegates, verifies, and maps the token's user
//!     into other registries.
//!
//! ```
//! use identity_token::{AuthenticationDomain, Domain, MemoryRegistry};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(MemoryRegistry::new());
//! registry.add_identity("Payroll", &[]);
//! registry.add_identity("Ledger", &[]);
//!
//! let domain: AuthenticationDomain<_> = Domain::new(registry.clone());
//! let mut payroll = domain.publish("Payroll", "payroll-1", 3600, 1024).unwrap();
//!
//! let bytes = domain
//!     .issue_bytes(&mut payroll, "ALICE", "LDAP", "Ledger", "ledger-1")
//!     .unwrap();
//! let token = domain.verify_bytes(&bytes, "Ledger", "ledger-1").unwrap();
//! assert_eq!(token.user_name(), "ALICE");
//! ```
//!
//! Transport of token bytes, and how an application learns the identity of its peers, are left
//! to the caller.

pub mod clock;
pub mod codec;
mod config;
mod domain;
pub mod error;
mod key;
mod registry;
mod timestamp;
mod token;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::config::DomainConfig;
pub use self::domain::{
    cur_tag, key_tag, prev_tag, AuthenticationDomain, AuthenticationKind, Domain, IdentityDomain,
    IdentityKind, TokenKind,
};
pub use self::error::{Error, ParseError, RegistryError, Result, VerifyError};
pub use self::key::{
    decode_public_key, encode_public_key, KeyGenerator, KeyMaterial, MAX_KEY_BITS,
    MAX_VALIDITY_SECS, MIN_KEY_BITS, MIN_VALIDITY_SECS,
};
pub use self::registry::{IdentityEntry, MemoryRegistry, Registry, RegistryUser};
pub use self::timestamp::Timestamp;
pub use self::token::{Manifest, SignatureHeader, Token, UserRecord};
pub use fog_crypto;

/// The maximum allowed size of an encoded token, including every hop of its chain, is 1 MiB.
pub const MAX_TOKEN_SIZE: usize = 1usize << 20; // 1 MiB
