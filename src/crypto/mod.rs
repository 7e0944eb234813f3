//! Keyring unlock and streaming object decryption.
//!
//! Key derivation: PBKDF2-HMAC-SHA1(passphrase, salt, 200,000 rounds) → 64 bytes
//!
//! Keyring file layout (`encryptionv3.dat` — the V3 file carries the V2 magic):
//!
//! ```ascii
//! "ENCRYPTIONV2" (12 B) | salt (8 B) | HMAC-SHA256 (32 B) | IV (16 B)
//! | AES-256-CBC(key1 | key2 | key3 | padding)
//! ```
//!
//! Encrypted object layout:
//!
//! ```ascii
//! "ARQO" (4 B) | HMAC-SHA256 (32 B) | master IV (16 B)
//! | wrapped data-IV + session key (64 B) | AES-256-CBC payload
//! ```
//!
//! The HMAC covers everything after the stored HMAC itself and is keyed by
//! `key2`; it is checked when the upstream is exhausted, so a fully-consumed
//! stream is always authenticated. Callers see plaintext with the PKCS
//! padding already stripped.

use std::io::{self, Read};
use std::mem;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use aes::Aes256;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

use crate::decode::TeeReader;

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const KEYRING_MAGIC: &[u8; 12] = b"ENCRYPTIONV2";
const PBKDF2_ROUNDS: u32 = 200_000;
const OBJECT_MAGIC: &[u8; 4] = b"ARQO";
const LEGACY_PREFIX: &[u8; 9] = b"encrypted";

/// AES block size; also the PKCS padding block size for object payloads.
pub const BLOCK_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid encryption header")]
    InvalidHeader,
    #[error("invalid password")]
    WrongPassword,
    #[error("malformed keyring: {0}")]
    MalformedKeyring(&'static str),
    #[error("invalid header in encrypted object")]
    InvalidObjectHeader,
    #[error("HMAC for encrypted object did not match")]
    HmacMismatch,
}

// ── Keyring ──────────────────────────────────────────────────────────────────

/// The three master keys unwrapped from the user passphrase.
///
/// `key1` wraps per-object session keys, `key2` authenticates objects.
/// `key3` is carried but unused by the read path.
#[derive(Clone)]
pub struct Keyring {
    key1: [u8; 32],
    key2: [u8; 32],
    #[allow(dead_code)]
    key3: [u8; 32],
}

impl Keyring {
    /// Parse and unwrap an `encryptionv3.dat` stream.
    ///
    /// The passphrase check is the HMAC over `iv || enc_keys` with the lower
    /// half of the derived key; it runs before any AES work touches the key
    /// material, so a wrong passphrase fails as [`CryptoError::WrongPassword`]
    /// without decrypting anything.
    pub fn unlock<R: Read>(mut reader: R, passphrase: &str) -> Result<Keyring, CryptoError> {
        let mut header = [0u8; 12];
        reader.read_exact(&mut header)?;
        if &header != KEYRING_MAGIC {
            return Err(CryptoError::InvalidHeader);
        }
        let mut salt = [0u8; 8];
        reader.read_exact(&mut salt)?;
        let mut stored_hmac = [0u8; 32];
        reader.read_exact(&mut stored_hmac)?;
        let mut iv = [0u8; 16];
        reader.read_exact(&mut iv)?;
        let mut enc_keys = Vec::new();
        reader.read_to_end(&mut enc_keys)?;
        if enc_keys.is_empty() || enc_keys.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::MalformedKeyring(
                "key material is not a whole number of cipher blocks",
            ));
        }

        let mut derived = [0u8; 64];
        pbkdf2_hmac::<Sha1>(passphrase.as_bytes(), &salt, PBKDF2_ROUNDS, &mut derived);

        let mut mac = HmacSha256::new_from_slice(&derived[32..])
            .map_err(|_| CryptoError::MalformedKeyring("bad HMAC key length"))?;
        mac.update(&iv);
        mac.update(&enc_keys);
        let tag = mac.finalize().into_bytes();
        if !bool::from(tag.ct_eq(&stored_hmac)) {
            return Err(CryptoError::WrongPassword);
        }

        let mut cipher = Aes256CbcDec::new_from_slices(&derived[..32], &iv)
            .map_err(|_| CryptoError::MalformedKeyring("bad cipher key length"))?;
        let mut plain = enc_keys;
        for block in plain.chunks_exact_mut(BLOCK_SIZE) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }

        if plain.len() < 97 {
            return Err(CryptoError::MalformedKeyring("key material too short"));
        }
        if plain[96] != BLOCK_SIZE as u8 {
            return Err(CryptoError::MalformedKeyring("bad padding marker"));
        }
        let mut key1 = [0u8; 32];
        let mut key2 = [0u8; 32];
        let mut key3 = [0u8; 32];
        key1.copy_from_slice(&plain[..32]);
        key2.copy_from_slice(&plain[32..64]);
        key3.copy_from_slice(&plain[64..96]);
        debug!("unlocked keyring");
        Ok(Keyring { key1, key2, key3 })
    }
}

// ── Object decrypt stream ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Fault {
    HmacMismatch,
    TruncatedBlock,
    Io(io::ErrorKind),
}

impl Fault {
    fn to_io(self) -> io::Error {
        match self {
            Fault::HmacMismatch => io::Error::new(
                io::ErrorKind::InvalidData,
                CryptoError::HmacMismatch.to_string(),
            ),
            Fault::TruncatedBlock => io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated cipher block in encrypted object",
            ),
            Fault::Io(kind) => io::Error::new(kind, "encrypted object read failed"),
        }
    }
}

/// Block-at-a-time AES-CBC decrypter over an encrypted object body.
///
/// Every ciphertext byte pulled from the upstream also feeds the HMAC
/// accumulator; when the upstream is exhausted the accumulated MAC must
/// match the stored one. After any error the stream is poisoned and keeps
/// returning the same kind of error.
pub struct ObjectReader<R: Read> {
    tee: TeeReader<R, HmacSha256>,
    stored_hmac: [u8; 32],
    cipher: Aes256CbcDec,
    buf: [u8; BLOCK_SIZE],
    buf_start: usize,
    buf_len: usize,
    eof: bool,
    verified: bool,
    fault: Option<Fault>,
}

impl<R: Read> ObjectReader<R> {
    fn new(mut upstream: R, keys: &Keyring) -> Result<Self, CryptoError> {
        consume_object_header(&mut upstream)?;
        let mut stored_hmac = [0u8; 32];
        upstream.read_exact(&mut stored_hmac)?;

        // Everything after the stored HMAC is authenticated; from here on the
        // upstream is only read through the MAC tee.
        let mac = HmacSha256::new_from_slice(&keys.key2)
            .map_err(|_| CryptoError::MalformedKeyring("bad HMAC key length"))?;
        let mut tee = TeeReader::new(upstream, mac);

        let mut master_iv = [0u8; 16];
        tee.read_exact(&mut master_iv)?;
        let mut wrapped = [0u8; 64];
        tee.read_exact(&mut wrapped)?;
        let mut key_unwrap = Aes256CbcDec::new_from_slices(&keys.key1, &master_iv)
            .map_err(|_| CryptoError::MalformedKeyring("bad cipher key length"))?;
        for block in wrapped.chunks_exact_mut(BLOCK_SIZE) {
            key_unwrap.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        // Bytes 0..16 are the data IV, 16..48 the session key; the rest is
        // wrapping overhead.
        let cipher = Aes256CbcDec::new_from_slices(&wrapped[16..48], &wrapped[..16])
            .map_err(|_| CryptoError::MalformedKeyring("bad cipher key length"))?;

        Ok(Self {
            tee,
            stored_hmac,
            cipher,
            buf: [0u8; BLOCK_SIZE],
            buf_start: 0,
            buf_len: 0,
            eof: false,
            verified: false,
            fault: None,
        })
    }

    /// Whether the trailing HMAC has been checked and passed. Only true after
    /// the stream has been read to the end; an abandoned reader stays
    /// unverified.
    pub fn verified(&self) -> bool {
        self.verified
    }

    fn check_hmac(&self) -> Result<(), Fault> {
        let tag = self.tee.digest().clone().finalize().into_bytes();
        if !bool::from(tag.ct_eq(&self.stored_hmac)) {
            return Err(Fault::HmacMismatch);
        }
        Ok(())
    }

    fn fill_block(&mut self) -> Result<(), Fault> {
        let n = read_full(&mut self.tee, &mut self.buf).map_err(|e| Fault::Io(e.kind()))?;
        if n == 0 {
            // Upstream exhausted: the MAC has now seen the whole body.
            self.check_hmac()?;
            self.verified = true;
            self.eof = true;
            return Ok(());
        }
        if n != BLOCK_SIZE {
            // A mismatching MAC outranks the short read.
            self.check_hmac()?;
            return Err(Fault::TruncatedBlock);
        }
        self.cipher
            .decrypt_block_mut(GenericArray::from_mut_slice(&mut self.buf));
        self.buf_start = 0;
        self.buf_len = BLOCK_SIZE;
        Ok(())
    }
}

impl<R: Read> Read for ObjectReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if let Some(fault) = self.fault {
            return Err(fault.to_io());
        }
        if out.is_empty() {
            return Ok(0);
        }
        if self.buf_len == 0 {
            if self.eof {
                return Ok(0);
            }
            if let Err(fault) = self.fill_block() {
                self.fault = Some(fault);
                return Err(fault.to_io());
            }
            if self.eof {
                return Ok(0);
            }
        }
        let n = out.len().min(self.buf_len);
        out[..n].copy_from_slice(&self.buf[self.buf_start..self.buf_start + n]);
        self.buf_start += n;
        self.buf_len -= n;
        Ok(n)
    }
}

fn consume_object_header<R: Read>(r: &mut R) -> Result<(), CryptoError> {
    let mut head = [0u8; 4];
    r.read_exact(&mut head)?;
    if &head == OBJECT_MAGIC {
        return Ok(());
    }
    // Legacy objects carry an "encrypted" prefix before the magic. The
    // stream never rewinds: the four bytes already read must be the start
    // of that prefix.
    let mut prefix = [0u8; 9];
    prefix[..4].copy_from_slice(&head);
    r.read_exact(&mut prefix[4..])?;
    if &prefix != LEGACY_PREFIX {
        return Err(CryptoError::InvalidObjectHeader);
    }
    r.read_exact(&mut head)?;
    if &head != OBJECT_MAGIC {
        return Err(CryptoError::InvalidObjectHeader);
    }
    Ok(())
}

// ── PKCS de-padding reader ───────────────────────────────────────────────────

/// Strips PKCS-style padding from the tail of a block-aligned stream.
///
/// Keeps one block of lookahead so the final block is recognised at upstream
/// EOF. A final byte `p` with `1 ≤ p ≤ block_size` whose last `p` bytes all
/// equal `p` is removed; anything else passes through unchanged.
pub struct PaddedReader<R> {
    inner: R,
    block_size: usize,
    current: Vec<u8>,
    next: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> PaddedReader<R> {
    pub fn new(inner: R, block_size: usize) -> Self {
        Self {
            inner,
            block_size,
            current: Vec::with_capacity(block_size),
            next: Vec::with_capacity(block_size),
            pos: 0,
            eof: false,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    fn fill(&mut self) -> io::Result<()> {
        mem::swap(&mut self.current, &mut self.next);
        self.pos = 0;
        if self.eof {
            return Ok(());
        }
        self.next.resize(self.block_size, 0);
        let n = read_full(&mut self.inner, &mut self.next)?;
        if n == 0 {
            self.eof = true;
            self.next.clear();
        } else if n != self.block_size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected a block of {} bytes, got {}", self.block_size, n),
            ));
        }
        if self.eof {
            self.strip_padding();
        }
        Ok(())
    }

    fn strip_padding(&mut self) {
        let Some(&last) = self.current.last() else {
            return;
        };
        let p = last as usize;
        if p == 0 || p > self.block_size || p > self.current.len() {
            return;
        }
        let tail = self.current.len() - p;
        if self.current[tail..].iter().all(|&b| b == last) {
            self.current.truncate(tail);
        }
    }
}

impl<R: Read> Read for PaddedReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.current.len() && !self.eof {
            self.fill()?;
        }
        if self.pos == self.current.len() {
            return Ok(0);
        }
        let n = out.len().min(self.current.len() - self.pos);
        out[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Layer an encrypted object into a plaintext stream: header consume and
/// session-key unwrap up front, then block-at-a-time decryption with the
/// trailing HMAC check at upstream EOF and PKCS padding stripped off the end.
pub fn object_reader<R: Read>(
    upstream: R,
    keys: &Keyring,
) -> Result<PaddedReader<ObjectReader<R>>, CryptoError> {
    Ok(PaddedReader::new(
        ObjectReader::new(upstream, keys)?,
        BLOCK_SIZE,
    ))
}

/// Decrypt a whole object held in memory.
pub fn decrypt_object(bytes: &[u8], keys: &Keyring) -> Result<Vec<u8>, CryptoError> {
    let mut reader = object_reader(bytes, keys)?;
    let mut out = Vec::with_capacity(bytes.len());
    match reader.read_to_end(&mut out) {
        Ok(_) => Ok(out),
        Err(e) => match reader.get_ref().fault {
            Some(Fault::HmacMismatch) => Err(CryptoError::HmacMismatch),
            _ => Err(CryptoError::Io(e)),
        },
    }
}

/// Read until `buf` is full or the source reports EOF; returns bytes read.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}
