use fog_crypto::CryptoError;
use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure to turn a byte buffer into a [`Token`][crate::Token]. Always fatal to the single parse
/// call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The buffer ended before a fixed region could be read.
    TooShort {
        step: &'static str,
        actual: usize,
        expected: usize,
    },
    /// A declared length disagrees with the number of bytes actually present.
    LengthMismatch {
        step: &'static str,
        declared: usize,
        actual: usize,
    },
    /// The token is larger than [`MAX_TOKEN_SIZE`][crate::MAX_TOKEN_SIZE].
    LengthTooLong { max: usize, actual: usize },
    /// A record carries a version word this crate does not understand.
    UnsupportedVersion { record: &'static str, version: u32 },
    /// Offsets, record lengths, or the chain counter don't describe a well-formed token.
    BadLayout(String),
    /// A string field isn't valid UTF-16.
    BadString(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ParseError::TooShort {
                step,
                actual,
                expected,
            } => write!(
                f,
                "Expected at least {} bytes, but got {} on step [{}]",
                expected, actual, step
            ),
            ParseError::LengthMismatch {
                step,
                declared,
                actual,
            } => write!(
                f,
                "Declared length {} doesn't match actual length {} on step [{}]",
                declared, actual, step
            ),
            ParseError::LengthTooLong { max, actual } => write!(
                f,
                "Token too long: was {} bytes, maximum allowed is {}",
                actual, max
            ),
            ParseError::UnsupportedVersion { record, version } => {
                write!(f, "Unsupported {} version {}", record, version)
            }
            ParseError::BadLayout(ref err) => write!(f, "Bad token layout: {}", err),
            ParseError::BadString(field) => write!(f, "Field {} is not valid UTF-16", field),
        }
    }
}

impl std::error::Error for ParseError {}

/// A token that failed verification. Every variant is a definitive "not trustworthy" answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyError {
    /// The token names a different receiving identity.
    ReceiverIdentityMismatch { expected: String, actual: String },
    /// The token names a different receiving application instance.
    ReceiverInstanceMismatch { expected: String, actual: String },
    /// No registry identity matches the name.
    IdentityNotFound(String),
    /// No published public key matches the sender's instance and key timestamp.
    PublicKeyNotFound { identity: String, filter: String },
    /// A lookup that must be unique returned more than one result.
    Ambiguous { what: String, count: usize },
    /// The signature doesn't match the signed bytes or the published key.
    SignatureInvalid,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            VerifyError::ReceiverIdentityMismatch {
                ref expected,
                ref actual,
            } => write!(
                f,
                "Token was issued to identity {:?}, expected {:?}",
                actual, expected
            ),
            VerifyError::ReceiverInstanceMismatch {
                ref expected,
                ref actual,
            } => write!(
                f,
                "Token was issued to application instance {:?}, expected {:?}",
                actual, expected
            ),
            VerifyError::IdentityNotFound(ref name) => {
                write!(f, "No identity found for {:?}", name)
            }
            VerifyError::PublicKeyNotFound {
                ref identity,
                ref filter,
            } => write!(
                f,
                "No public key published for identity {:?} under {:?}",
                identity, filter
            ),
            VerifyError::Ambiguous { ref what, count } => {
                write!(f, "Expected exactly one {}, found {}", what, count)
            }
            VerifyError::SignatureInvalid => f.write_str("Token signature failed to verify"),
        }
    }
}

impl std::error::Error for VerifyError {}

/// Failure reported by a [`Registry`][crate::Registry] implementation. Never retried here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryError {
    pub operation: &'static str,
    pub message: String,
}

impl RegistryError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Registry {} failed: {}", self.operation, self.message)
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug)]
pub enum Error {
    /// Token bytes failed to parse.
    Parse(ParseError),
    /// Token failed verification.
    Verify(VerifyError),
    /// The identity registry failed.
    Registry(RegistryError),
    /// Failure within the cryptographic submodule.
    Crypto(CryptoError),
    /// A caller-supplied value was out of range.
    InvalidParameter(String),
    /// Issuing or delegating would produce a token over the size limit.
    TokenTooLarge { max: usize, actual: usize },
    /// The key material has never been published, so it has no timestamp token.
    KeyNotPublished,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Parse(ref err) => write!(f, "Parse failure: {}", err),
            Error::Verify(ref err) => write!(f, "Verification failure: {}", err),
            Error::Registry(ref err) => write!(f, "{}", err),
            Error::Crypto(_) => write!(f, "Cryptographic Error"),
            Error::InvalidParameter(ref err) => write!(f, "Invalid parameter: {}", err),
            Error::TokenTooLarge { max, actual } => write!(
                f,
                "Token would be {} bytes, maximum allowed is {}",
                actual, max
            ),
            Error::KeyNotPublished => f.write_str("Key material has not been published"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Parse(ref err) => Some(err),
            Error::Verify(ref err) => Some(err),
            Error::Registry(ref err) => Some(err),
            Error::Crypto(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<VerifyError> for Error {
    fn from(e: VerifyError) -> Self {
        Self::Verify(e)
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Self::Crypto(e)
    }
}

impl Error {
    /// The verification failure behind this error, if that's what it is.
    pub fn as_verify(&self) -> Option<&VerifyError> {
        match self {
            Error::Verify(err) => Some(err),
            _ => None,
        }
    }

    /// The parse failure behind this error, if that's what it is.
    pub fn as_parse(&self) -> Option<&ParseError> {
        match self {
            Error::Parse(err) => Some(err),
            _ => None,
        }
    }
}
