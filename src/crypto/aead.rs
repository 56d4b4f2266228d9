use aes_gcm::{
    Aes128Gcm, Aes256Gcm,
    aead::{AeadInPlace, KeyInit, generic_array::GenericArray},
};
use bytes::{Buf, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest, Md5};
use rand::RngCore;
use sha1::Sha1;

use super::{
    CHUNK_LEN_BYTES, CHUNK_LEN_MASK, CHUNK_OVERHEAD, CryptoError, Decryptor, Encryptor, TAG_LEN,
};

const NONCE_LEN: usize = 12;
const SUBKEY_INFO: &[u8] = b"ss-subkey";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    pub fn from_method(method: &str) -> Option<Self> {
        match method.to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Some(Self::Aes128Gcm),
            "aes-256-gcm" => Some(Self::Aes256Gcm),
            "chacha20-ietf-poly1305" => Some(Self::ChaCha20Poly1305),
            _ => None,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => 32,
        }
    }

    pub fn salt_len(self) -> usize {
        self.key_len()
    }

    /// OpenSSL `EVP_BytesToKey` with MD5 and no salt.
    pub fn master_key(self, password: &str) -> Vec<u8> {
        let len = self.key_len();
        let mut key = Vec::with_capacity(len + 16);
        let mut prev: Vec<u8> = vec![];
        while key.len() < len {
            let mut h = Md5::new();
            h.update(&prev);
            h.update(password.as_bytes());
            prev = h.finalize().to_vec();
            key.extend_from_slice(&prev);
        }
        key.truncate(len);
        key
    }
}

enum SessionCipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl SessionCipher {
    fn derive(kind: CipherKind, master_key: &[u8], salt: &[u8]) -> Result<Self, CryptoError> {
        let mut subkey = vec![0u8; kind.key_len()];
        Hkdf::<Sha1>::new(Some(salt), master_key)
            .expand(SUBKEY_INFO, &mut subkey)
            .map_err(|_| CryptoError::KeyDerivation)?;
        let cipher = match kind {
            CipherKind::Aes128Gcm => Self::Aes128(Box::new(
                Aes128Gcm::new_from_slice(&subkey).map_err(|_| CryptoError::KeyDerivation)?,
            )),
            CipherKind::Aes256Gcm => Self::Aes256(Box::new(
                Aes256Gcm::new_from_slice(&subkey).map_err(|_| CryptoError::KeyDerivation)?,
            )),
            CipherKind::ChaCha20Poly1305 => Self::ChaCha(Box::new(
                ChaCha20Poly1305::new_from_slice(&subkey)
                    .map_err(|_| CryptoError::KeyDerivation)?,
            )),
        };
        Ok(cipher)
    }

    /// Encrypts `plain` into `out` followed by its tag.
    fn seal(&self, nonce: &[u8; NONCE_LEN], plain: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        let n = plain.len();
        let need = n + TAG_LEN;
        if out.len() < need {
            return Err(CryptoError::BufferTooSmall {
                need,
                have: out.len(),
            });
        }
        out[..n].copy_from_slice(plain);
        let nonce = GenericArray::from_slice(&nonce[..]);
        let (body, rest) = out.split_at_mut(n);
        let tag = match self {
            Self::Aes128(c) => c.encrypt_in_place_detached(nonce, &[], body),
            Self::Aes256(c) => c.encrypt_in_place_detached(nonce, &[], body),
            Self::ChaCha(c) => c.encrypt_in_place_detached(nonce, &[], body),
        }
        .map_err(|_| CryptoError::Authentication)?;
        rest[..TAG_LEN].copy_from_slice(&tag);
        Ok(need)
    }

    /// Decrypts `sealed` (payload and tag) into `out`.
    fn open(&self, nonce: &[u8; NONCE_LEN], sealed: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        let n = sealed.len() - TAG_LEN;
        if out.len() < n {
            return Err(CryptoError::BufferTooSmall {
                need: n,
                have: out.len(),
            });
        }
        out[..n].copy_from_slice(&sealed[..n]);
        let nonce = GenericArray::from_slice(&nonce[..]);
        let tag = GenericArray::from_slice(&sealed[n..]);
        let body = &mut out[..n];
        match self {
            Self::Aes128(c) => c.decrypt_in_place_detached(nonce, &[], body, tag),
            Self::Aes256(c) => c.decrypt_in_place_detached(nonce, &[], body, tag),
            Self::ChaCha(c) => c.decrypt_in_place_detached(nonce, &[], body, tag),
        }
        .map_err(|_| CryptoError::Authentication)?;
        Ok(n)
    }
}

fn increment(nonce: &mut [u8; NONCE_LEN]) {
    for b in nonce.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}

pub struct AeadEncryptor {
    kind: CipherKind,
    master_key: Vec<u8>,
    cipher: Option<SessionCipher>,
    nonce: [u8; NONCE_LEN],
    addr_len: usize,
    disposed: bool,
}

impl AeadEncryptor {
    pub fn new(kind: CipherKind, master_key: Vec<u8>) -> Self {
        Self {
            kind,
            master_key,
            cipher: None,
            nonce: [0; NONCE_LEN],
            addr_len: 0,
            disposed: false,
        }
    }

    fn seal_chunk(
        cipher: &SessionCipher,
        nonce: &mut [u8; NONCE_LEN],
        payload: &[u8],
        out: &mut [u8],
    ) -> Result<usize, CryptoError> {
        let need = payload.len() + CHUNK_OVERHEAD;
        if out.len() < need {
            return Err(CryptoError::BufferTooSmall {
                need,
                have: out.len(),
            });
        }
        let len = (payload.len() as u16).to_be_bytes();
        let mut pos = cipher.seal(nonce, &len, out)?;
        increment(nonce);
        pos += cipher.seal(nonce, payload, &mut out[pos..])?;
        increment(nonce);
        Ok(pos)
    }
}

impl Encryptor for AeadEncryptor {
    fn set_addr_len(&mut self, len: usize) {
        self.addr_len = len;
    }

    fn encrypt(&mut self, plain: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        if self.disposed {
            return Err(CryptoError::Disposed);
        }
        let mut plain = plain;
        let mut pos = 0;
        if self.cipher.is_none() {
            let salt_len = self.kind.salt_len();
            if out.len() < salt_len {
                return Err(CryptoError::BufferTooSmall {
                    need: salt_len,
                    have: out.len(),
                });
            }
            rand::rng().fill_bytes(&mut out[..salt_len]);
            let cipher = SessionCipher::derive(self.kind, &self.master_key, &out[..salt_len])?;
            pos = salt_len;
            if self.addr_len > 0 && self.addr_len < plain.len() {
                let (header, rest) = plain.split_at(self.addr_len);
                pos += Self::seal_chunk(&cipher, &mut self.nonce, header, &mut out[pos..])?;
                plain = rest;
            }
            self.cipher = Some(cipher);
        }
        let Some(cipher) = self.cipher.as_ref() else {
            return Err(CryptoError::Disposed);
        };
        for chunk in plain.chunks(CHUNK_LEN_MASK) {
            pos += Self::seal_chunk(cipher, &mut self.nonce, chunk, &mut out[pos..])?;
        }
        Ok(pos)
    }

    fn dispose(&mut self) {
        self.disposed = true;
        self.cipher = None;
        self.master_key.fill(0);
    }
}

pub struct AeadDecryptor {
    kind: CipherKind,
    master_key: Vec<u8>,
    cipher: Option<SessionCipher>,
    nonce: [u8; NONCE_LEN],
    pending: BytesMut,
    disposed: bool,
}

impl AeadDecryptor {
    pub fn new(kind: CipherKind, master_key: Vec<u8>) -> Self {
        Self {
            kind,
            master_key,
            cipher: None,
            nonce: [0; NONCE_LEN],
            pending: BytesMut::new(),
            disposed: false,
        }
    }
}

impl Decryptor for AeadDecryptor {
    fn decrypt(&mut self, input: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        if self.disposed {
            return Err(CryptoError::Disposed);
        }
        self.pending.extend_from_slice(input);
        if self.cipher.is_none() {
            let salt_len = self.kind.salt_len();
            if self.pending.len() < salt_len {
                return Ok(0);
            }
            let salt = self.pending.split_to(salt_len);
            self.cipher = Some(SessionCipher::derive(self.kind, &self.master_key, &salt)?);
        }
        let Some(cipher) = self.cipher.as_ref() else {
            return Err(CryptoError::Disposed);
        };

        let header_len = CHUNK_LEN_BYTES + TAG_LEN;
        let mut produced = 0;
        while self.pending.len() >= header_len {
            // peek at the length; the nonce only advances once the whole chunk is here
            let mut len = [0u8; CHUNK_LEN_BYTES];
            cipher.open(&self.nonce, &self.pending[..header_len], &mut len)?;
            let len = u16::from_be_bytes(len) as usize;
            if len > CHUNK_LEN_MASK {
                return Err(CryptoError::InvalidChunkLength(len));
            }
            let total = header_len + len + TAG_LEN;
            if self.pending.len() < total {
                break;
            }
            let mut payload_nonce = self.nonce;
            increment(&mut payload_nonce);
            produced += cipher.open(
                &payload_nonce,
                &self.pending[header_len..total],
                &mut out[produced..],
            )?;
            increment(&mut payload_nonce);
            self.nonce = payload_nonce;
            self.pending.advance(total);
        }
        Ok(produced)
    }

    fn dispose(&mut self) {
        self.disposed = true;
        self.cipher = None;
        self.pending.clear();
        self.master_key.fill(0);
    }
}
