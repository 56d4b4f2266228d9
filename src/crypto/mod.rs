//! Stream codec used on the tunnel leg.
//!
//! An encryptor turns plaintext into salted, length-prefixed AEAD chunks and
//! a decryptor reverses that, buffering partial chunks internally. The two
//! halves are independent so each relay direction can own one.

use easy_error::{Error, err_msg};

mod aead;

pub use aead::{AeadDecryptor, AeadEncryptor, CipherKind};

pub const TAG_LEN: usize = 16;
pub const CHUNK_LEN_BYTES: usize = 2;
pub const CHUNK_LEN_MASK: usize = 0x3FFF;
pub const MAX_SALT_LEN: usize = 32;
/// Length field and payload each carry a tag.
pub const CHUNK_OVERHEAD: usize = TAG_LEN * 2 + CHUNK_LEN_BYTES;
pub const MAX_CHUNK_SIZE: usize = CHUNK_LEN_MASK + CHUNK_OVERHEAD;

/// Network receive quantum for both relay directions.
pub const RECV_SIZE: usize = 2048;
pub const BUFFER_SIZE: usize = RECV_SIZE + MAX_CHUNK_SIZE + MAX_SALT_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    Disposed,
    BufferTooSmall { need: usize, have: usize },
    InvalidChunkLength(usize),
    Authentication,
    KeyDerivation,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disposed => write!(f, "cipher already disposed"),
            Self::BufferTooSmall { need, have } => {
                write!(f, "output buffer too small: need {} have {}", need, have)
            }
            Self::InvalidChunkLength(len) => write!(f, "invalid chunk length: {}", len),
            Self::Authentication => write!(f, "chunk authentication failed"),
            Self::KeyDerivation => write!(f, "session key derivation failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

pub trait Encryptor: Send {
    /// Length of the address header at the start of the first plaintext.
    fn set_addr_len(&mut self, len: usize);
    /// Writes ciphertext for `plain` into `out` and returns its length.
    fn encrypt(&mut self, plain: &[u8], out: &mut [u8]) -> Result<usize, CryptoError>;
    fn dispose(&mut self);
}

pub trait Decryptor: Send {
    /// Returns 0 when more input is needed before a chunk completes.
    fn decrypt(&mut self, cipher: &[u8], out: &mut [u8]) -> Result<usize, CryptoError>;
    fn dispose(&mut self);
}

pub struct Codec {
    pub encryptor: Box<dyn Encryptor>,
    pub decryptor: Box<dyn Decryptor>,
}

pub fn new_codec(method: &str, password: &str) -> Result<Codec, Error> {
    let kind = CipherKind::from_method(method)
        .ok_or_else(|| err_msg(format!("unsupported method: {}", method)))?;
    let key = kind.master_key(password);
    Ok(Codec {
        encryptor: Box::new(AeadEncryptor::new(kind, key.clone())),
        decryptor: Box::new(AeadDecryptor::new(kind, key)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_hold_worst_case_output() {
        // a full receive plus one split address chunk and the salt
        assert!(RECV_SIZE + 2 * CHUNK_OVERHEAD + MAX_SALT_LEN <= BUFFER_SIZE);
        // a pending partial chunk plus one receive
        assert!(MAX_CHUNK_SIZE + RECV_SIZE <= BUFFER_SIZE);
    }

    #[test]
    fn unknown_method() {
        assert!(new_codec("rc4-md5", "pw").is_err());
        assert!(new_codec("aes-256-gcm", "pw").is_ok());
    }
}
