//! Token records and assembly.
//!
//! A [`Token`] holds the outermost [`SignatureHeader`], the current [`Manifest`], the opaque bytes
//! of every earlier hop, and the single [`UserRecord`] created at issuance. Tokens are only ever
//! built by [`Token::from_bytes`] or by sealing a new hop in the [`Domain`][crate::Domain].

use crate::{
    codec,
    error::{Error, ParseError, Result},
};
use fog_crypto::{
    hash::Hash,
    identity::{IdentityKey, UnverifiedSignature},
};
use std::convert::TryFrom;

/// Describes the current (outermost) signing hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureHeader {
    pub version: u32,
    /// Length of the whole token, starting at this header.
    pub total_token_length: u32,
    /// Length of the signed region: current manifest, prior history, and user record.
    pub signed_length: u32,
    /// Encoded signature over the signed region.
    pub signature: Vec<u8>,
}

/// One hop's sender, receiver, and signing-key timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub version: u32,
    /// Hop count of the trust chain. Starts at 1.
    pub counter: u32,
    pub sender_identity: String,
    pub sender_instance: String,
    /// Timestamp token of the key that signed this hop, so verifiers can find that exact key.
    pub sender_key_timestamp: String,
    pub receiver_identity: String,
    pub receiver_instance: String,
}

/// The authenticated user, and the registry it was authenticated against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserRecord {
    pub version: u32,
    pub user_name: String,
    pub source_registry: String,
}

impl UserRecord {
    pub fn new(user_name: &str, source_registry: &str) -> Self {
        Self {
            version: codec::TOKEN_VERSION,
            user_name: user_name.to_owned(),
            source_registry: source_registry.to_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    header: SignatureHeader,
    manifest: Manifest,
    prior_history: Vec<u8>,
    user: UserRecord,
}

impl Token {
    pub(crate) fn assemble(
        header: SignatureHeader,
        manifest: Manifest,
        prior_history: Vec<u8>,
        user: UserRecord,
    ) -> Self {
        Self {
            header,
            manifest,
            prior_history,
            user,
        }
    }

    /// Sign a new hop and assemble the token. `prior_history` must already hold every earlier
    /// (header, manifest) pair, newest first.
    pub(crate) fn seal(
        key: &IdentityKey,
        manifest: Manifest,
        prior_history: Vec<u8>,
        user: UserRecord,
        max_size: usize,
    ) -> Result<Self> {
        let signed = signed_region(&manifest, &prior_history, &user)?;
        let signature = key.sign(&Hash::new(signed.as_slice()));
        let mut sig_raw = Vec::with_capacity(signature.size());
        signature.encode_vec(&mut sig_raw);

        let total = codec::header_len(sig_raw.len()) + signed.len();
        if total > max_size {
            return Err(Error::TokenTooLarge {
                max: max_size,
                actual: total,
            });
        }
        let header = SignatureHeader {
            version: codec::TOKEN_VERSION,
            total_token_length: total as u32,
            signed_length: signed.len() as u32,
            signature: sig_raw,
        };
        Ok(Self::assemble(header, manifest, prior_history, user))
    }

    /// Parse a token from its wire form.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ParseError> {
        codec::parse_token(buf)
    }

    /// Encode the token into its wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = codec::write_signature_header(&self.header)?;
        out.reserve(self.header.signed_length as usize);
        out.extend(self.signed_bytes()?);
        Ok(out)
    }

    /// The bytes the outermost signature covers.
    pub fn signed_bytes(&self) -> Result<Vec<u8>> {
        signed_region(&self.manifest, &self.prior_history, &self.user)
    }

    /// This token's current hop, serialized, followed by everything before it. This is what the
    /// next delegation carries as its prior history.
    pub(crate) fn extended_history(&self) -> Result<Vec<u8>> {
        let mut out = codec::write_signature_header(&self.header)?;
        out.extend(codec::write_manifest(&self.manifest)?);
        out.extend_from_slice(&self.prior_history);
        Ok(out)
    }

    /// Check the outermost signature against the signed region, and require that it was made by
    /// `signer`.
    pub(crate) fn signature_matches(&self, signer: &fog_crypto::identity::Identity) -> Result<bool> {
        let unverified = match UnverifiedSignature::try_from(self.header.signature.as_slice()) {
            Ok(u) => u,
            Err(_) => return Ok(false),
        };
        let hash = Hash::new(self.signed_bytes()?.as_slice());
        Ok(match unverified.verify(&hash) {
            Ok(verified) => verified.signer() == signer,
            Err(_) => false,
        })
    }

    pub fn header(&self) -> &SignatureHeader {
        &self.header
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Serialized (header, manifest) pairs of every earlier hop, newest first. Never parsed.
    pub fn prior_history(&self) -> &[u8] {
        &self.prior_history
    }

    pub fn user(&self) -> &UserRecord {
        &self.user
    }

    /// Number of hops in the trust chain.
    pub fn counter(&self) -> u32 {
        self.manifest.counter
    }

    pub fn user_name(&self) -> &str {
        &self.user.user_name
    }

    pub fn source_registry(&self) -> &str {
        &self.user.source_registry
    }

    pub fn receiver_identity(&self) -> &str {
        &self.manifest.receiver_identity
    }

    pub fn receiver_instance(&self) -> &str {
        &self.manifest.receiver_instance
    }

    pub fn sender_identity(&self) -> &str {
        &self.manifest.sender_identity
    }

    pub fn sender_instance(&self) -> &str {
        &self.manifest.sender_instance
    }
}

fn signed_region(manifest: &Manifest, prior_history: &[u8], user: &UserRecord) -> Result<Vec<u8>> {
    let mut out = codec::write_manifest(manifest)?;
    out.extend_from_slice(prior_history);
    out.extend(codec::write_user_record(user)?);
    Ok(out)
}
