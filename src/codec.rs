//! Bit-exact conversion between token records and bytes.
//!
//! Every record starts with a fixed region of big-endian `u32` words: its own length, its version,
//! any integer fields, then one `(offset, length)` pair per variable field. The variable fields
//! follow the fixed region in declaration order. Offsets are relative to the start of the record
//! and lengths are in bytes. Strings are UTF-16BE.
//!
//! A token is laid out as:
//!
//! ```text
//! | SignatureHeader | Manifest | prior history (opaque) | UserRecord | UserRecord length |
//! ```
//!
//! The trailing word lets [`parse_token`] jump straight to the user record without walking any
//! of the earlier hops stored in the prior history.

use crate::{
    error::{Error, ParseError, Result},
    token::{Manifest, SignatureHeader, Token, UserRecord},
    MAX_TOKEN_SIZE,
};
use byteorder::{BigEndian, ByteOrder};
use std::convert::TryFrom;

/// The only record version this crate reads or writes.
pub const TOKEN_VERSION: u32 = 1;

// Signature header:
//  0. record length
//  4. version
//  8. total token length
// 12. signed length
// 16. signature (offset, length)
// 24. signature bytes
pub(crate) const HEADER_FIXED_LEN: usize = 24;
const TOTAL_LENGTH_OFFSET: usize = 8;

// Manifest:
//  0. record length
//  4. version
//  8. counter
// 12. sender identity name (offset, length)
// 20. sender app instance id
// 28. sender key timestamp
// 36. receiver identity name
// 44. receiver app instance id
// 52. strings
pub(crate) const MANIFEST_FIXED_LEN: usize = 52;

// User record:
//  0. record length, including the trailer
//  4. version
//  8. user name (offset, length)
// 16. source registry name
// 24. strings
//  .. record length again
pub(crate) const USER_FIXED_LEN: usize = 24;
pub(crate) const TRAILER_LEN: usize = 4;

/// Smallest byte length any token can have: every fixed region, no variable data.
pub const MIN_TOKEN_SIZE: usize = HEADER_FIXED_LEN + MANIFEST_FIXED_LEN + USER_FIXED_LEN + TRAILER_LEN;

/// Size of an encoded signature header carrying a signature of `signature_len` bytes.
pub fn header_len(signature_len: usize) -> usize {
    HEADER_FIXED_LEN + signature_len
}

fn to_u32(val: usize, what: &str) -> Result<u32> {
    u32::try_from(val).map_err(|_| {
        Error::InvalidParameter(format!("{} is {} bytes, too long to encode", what, val))
    })
}

fn utf16_bytes(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}

fn utf16_string(raw: &[u8], field: &'static str) -> Result<String, ParseError> {
    if raw.len() % 2 != 0 {
        return Err(ParseError::BadString(field));
    }
    let units: Vec<u16> = raw.chunks_exact(2).map(BigEndian::read_u16).collect();
    String::from_utf16(&units).map_err(|_| ParseError::BadString(field))
}

/// Builds one record: a zeroed fixed region that gets filled in as variable fields are appended.
struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    fn new(fixed_len: usize, version: u32) -> Self {
        let mut buf = vec![0u8; fixed_len];
        BigEndian::write_u32(&mut buf[4..8], version);
        Self { buf }
    }

    fn put_u32(&mut self, at: usize, val: u32) {
        BigEndian::write_u32(&mut self.buf[at..at + 4], val);
    }

    /// Append a variable field and point the descriptor at `at` to it. The length written is
    /// always the length of the bytes appended here.
    fn push_field(&mut self, at: usize, data: &[u8], what: &str) -> Result<()> {
        let offset = to_u32(self.buf.len(), "record")?;
        let len = to_u32(data.len(), what)?;
        self.put_u32(at, offset);
        self.put_u32(at + 4, len);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn push_str(&mut self, at: usize, s: &str, what: &str) -> Result<()> {
        self.push_field(at, &utf16_bytes(s), what)
    }

    fn finish(mut self, with_trailer: bool) -> Result<Vec<u8>> {
        let total = self.buf.len() + if with_trailer { TRAILER_LEN } else { 0 };
        let total = to_u32(total, "record")?;
        self.put_u32(0, total);
        if with_trailer {
            self.buf.extend_from_slice(&total.to_be_bytes());
        }
        Ok(self.buf)
    }
}

/// Encode a signature header. The lengths it declares for the token are taken from the header as
/// given; [`Token`] assembly is responsible for setting them.
pub fn write_signature_header(header: &SignatureHeader) -> Result<Vec<u8>> {
    let mut w = RecordWriter::new(HEADER_FIXED_LEN, header.version);
    w.put_u32(TOTAL_LENGTH_OFFSET, header.total_token_length);
    w.put_u32(12, header.signed_length);
    w.push_field(16, &header.signature, "signature")?;
    w.finish(false)
}

pub fn write_manifest(manifest: &Manifest) -> Result<Vec<u8>> {
    let mut w = RecordWriter::new(MANIFEST_FIXED_LEN, manifest.version);
    w.put_u32(8, manifest.counter);
    w.push_str(12, &manifest.sender_identity, "sender identity")?;
    w.push_str(20, &manifest.sender_instance, "sender instance")?;
    w.push_str(28, &manifest.sender_key_timestamp, "sender key timestamp")?;
    w.push_str(36, &manifest.receiver_identity, "receiver identity")?;
    w.push_str(44, &manifest.receiver_instance, "receiver instance")?;
    w.finish(false)
}

pub fn write_user_record(user: &UserRecord) -> Result<Vec<u8>> {
    let mut w = RecordWriter::new(USER_FIXED_LEN, user.version);
    w.push_str(8, &user.user_name, "user name")?;
    w.push_str(16, &user.source_registry, "source registry")?;
    w.finish(true)
}

/// A bounds-checked view of one record inside a token buffer.
struct RecordReader<'a> {
    raw: &'a [u8],
    name: &'static str,
    cursor: usize,
    var_end: usize,
}

impl<'a> RecordReader<'a> {
    /// Locate a record of at least `fixed_len` bytes starting at `at`, no further than `limit`.
    fn open(
        buf: &'a [u8],
        at: usize,
        limit: usize,
        fixed_len: usize,
        name: &'static str,
    ) -> Result<Self, ParseError> {
        let avail = limit.saturating_sub(at);
        if avail < fixed_len {
            return Err(ParseError::TooShort {
                step: name,
                actual: avail,
                expected: fixed_len,
            });
        }
        let record_len = BigEndian::read_u32(&buf[at..at + 4]) as usize;
        if record_len < fixed_len || record_len > avail {
            return Err(ParseError::BadLayout(format!(
                "{} claims {} bytes, but only {}..={} are possible",
                name, record_len, fixed_len, avail
            )));
        }
        Ok(Self {
            raw: &buf[at..at + record_len],
            name,
            cursor: fixed_len,
            var_end: record_len,
        })
    }

    fn u32(&self, at: usize) -> u32 {
        BigEndian::read_u32(&self.raw[at..at + 4])
    }

    fn check_version(&self) -> Result<(), ParseError> {
        let version = self.u32(4);
        if version != TOKEN_VERSION {
            return Err(ParseError::UnsupportedVersion {
                record: self.name,
                version,
            });
        }
        Ok(())
    }

    /// Read the variable field described at `at`. Fields must be packed in order right after the
    /// fixed region, so a parsed record always re-encodes to the same bytes.
    fn field(&mut self, at: usize, field: &'static str) -> Result<&'a [u8], ParseError> {
        let offset = self.u32(at) as usize;
        let len = self.u32(at + 4) as usize;
        if offset != self.cursor {
            return Err(ParseError::BadLayout(format!(
                "{} field {} at offset {}, expected {}",
                self.name, field, offset, self.cursor
            )));
        }
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.var_end)
            .ok_or_else(|| {
                ParseError::BadLayout(format!(
                    "{} field {} runs past the end of the record",
                    self.name, field
                ))
            })?;
        self.cursor = end;
        let raw = self.raw;
        Ok(&raw[offset..end])
    }

    fn string(&mut self, at: usize, field: &'static str) -> Result<String, ParseError> {
        utf16_string(self.field(at, field)?, field)
    }

    fn finish(self) -> Result<(), ParseError> {
        if self.cursor != self.var_end {
            return Err(ParseError::BadLayout(format!(
                "{} has {} unclaimed bytes",
                self.name,
                self.var_end - self.cursor
            )));
        }
        Ok(())
    }
}

/// Parse a complete token.
///
/// The user record is located from the trailing length word, so the prior history between the
/// current manifest and the user record is captured as-is, without being parsed.
pub fn parse_token(buf: &[u8]) -> Result<Token, ParseError> {
    if buf.len() < MIN_TOKEN_SIZE {
        return Err(ParseError::TooShort {
            step: "token fixed regions",
            actual: buf.len(),
            expected: MIN_TOKEN_SIZE,
        });
    }
    if buf.len() > MAX_TOKEN_SIZE {
        return Err(ParseError::LengthTooLong {
            max: MAX_TOKEN_SIZE,
            actual: buf.len(),
        });
    }

    let total = BigEndian::read_u32(&buf[TOTAL_LENGTH_OFFSET..TOTAL_LENGTH_OFFSET + 4]) as usize;
    if total != buf.len() {
        return Err(ParseError::LengthMismatch {
            step: "total token length",
            declared: total,
            actual: buf.len(),
        });
    }

    let user_len = BigEndian::read_u32(&buf[buf.len() - TRAILER_LEN..]) as usize;
    let max_user_len = buf.len() - HEADER_FIXED_LEN - MANIFEST_FIXED_LEN;
    if user_len < USER_FIXED_LEN + TRAILER_LEN || user_len > max_user_len {
        return Err(ParseError::BadLayout(format!(
            "trailing user record length {} is outside {}..={}",
            user_len,
            USER_FIXED_LEN + TRAILER_LEN,
            max_user_len
        )));
    }
    let user_offset = buf.len() - user_len;

    // Signature header
    let mut header = RecordReader::open(buf, 0, user_offset, HEADER_FIXED_LEN, "signature header")?;
    header.check_version()?;
    let signed_length = header.u32(12);
    let signature = header.field(16, "signature")?.to_vec();
    let header_end = header.var_end;
    header.finish()?;
    if signed_length as usize != buf.len() - header_end {
        return Err(ParseError::LengthMismatch {
            step: "signed length",
            declared: signed_length as usize,
            actual: buf.len() - header_end,
        });
    }
    let header = SignatureHeader {
        version: TOKEN_VERSION,
        total_token_length: total as u32,
        signed_length,
        signature,
    };

    // Current manifest
    let mut m = RecordReader::open(buf, header_end, user_offset, MANIFEST_FIXED_LEN, "manifest")?;
    m.check_version()?;
    let counter = m.u32(8);
    let manifest = Manifest {
        version: TOKEN_VERSION,
        counter,
        sender_identity: m.string(12, "sender identity")?,
        sender_instance: m.string(20, "sender instance")?,
        sender_key_timestamp: m.string(28, "sender key timestamp")?,
        receiver_identity: m.string(36, "receiver identity")?,
        receiver_instance: m.string(44, "receiver instance")?,
    };
    let manifest_end = header_end + m.var_end;
    m.finish()?;

    // Prior history, kept opaque
    let prior_history = &buf[manifest_end..user_offset];
    match counter {
        0 => return Err(ParseError::BadLayout("chain counter is 0".into())),
        1 if !prior_history.is_empty() => {
            return Err(ParseError::BadLayout(format!(
                "first-hop token carries {} bytes of prior history",
                prior_history.len()
            )))
        }
        c if c > 1 && prior_history.is_empty() => {
            return Err(ParseError::BadLayout(format!(
                "token at hop {} carries no prior history",
                c
            )))
        }
        _ => (),
    }

    // User record
    let mut u = RecordReader::open(buf, user_offset, buf.len(), USER_FIXED_LEN, "user record")?;
    if u.var_end != user_len {
        return Err(ParseError::LengthMismatch {
            step: "user record length",
            declared: u.var_end,
            actual: user_len,
        });
    }
    u.var_end -= TRAILER_LEN;
    u.check_version()?;
    let user = UserRecord {
        version: TOKEN_VERSION,
        user_name: u.string(8, "user name")?,
        source_registry: u.string(16, "source registry")?,
    };
    u.finish()?;

    Ok(Token::assemble(header, manifest, prior_history.to_vec(), user))
}
