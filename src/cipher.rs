//! Optional payload encryption for transfers.
//!
//! Encrypted payloads use a framed AEAD layout so they can be produced and
//! consumed as a stream:
//!
//! ```text
//! [nonce prefix (7)] [frame 0 + tag] [frame 1 + tag] ... [last frame + tag]
//! ```
//!
//! Every frame except the last carries exactly [`FRAME_SIZE`] plaintext bytes.
//! The nonce of frame `n` is `prefix || n (u32 BE) || last flag`, so dropped,
//! reordered or truncated frames fail authentication.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::rand_core::RngCore;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use hkdf::Hkdf;
use sha2::Sha256;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::errors::{Result, TransferError};

/// Plaintext bytes sealed per frame.
pub const FRAME_SIZE: usize = 4096;

const TAG_SIZE: usize = 16;
const PREFIX_SIZE: usize = 7;
const NONCE_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Plaintext in, ciphertext out (uploads)
    Encrypt,
    /// Ciphertext in, plaintext out (downloads)
    Decrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    ChaCha20Poly1305,
    Aes256Gcm,
}

impl Algorithm {
    pub fn label(&self) -> &'static str {
        match self {
            Algorithm::ChaCha20Poly1305 => "chacha20-poly1305",
            Algorithm::Aes256Gcm => "aes-256-gcm",
        }
    }

    /// Parses an optional identifier, treating `None` and `""` as "no encryption".
    pub fn from_identifier(identifier: Option<&str>) -> Result<Option<Self>> {
        match identifier.map(str::trim) {
            None | Some("") => Ok(None),
            Some(id) => id.parse().map(Some),
        }
    }
}

impl FromStr for Algorithm {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chacha20-poly1305" | "chacha20poly1305" => Ok(Algorithm::ChaCha20Poly1305),
            "aes-256-gcm" | "aes256gcm" => Ok(Algorithm::Aes256Gcm),
            other => Err(TransferError::crypto_config(format!("Unsupported algorithm: {}", other))),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Shared secret the per-transfer keys are derived from.
#[derive(Clone, Default)]
pub struct Secret(Arc<[u8]>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn derive_key(&self, algorithm: Algorithm) -> Result<[u8; 32]> {
        if self.is_empty() {
            return Err(TransferError::crypto_config("Shared secret is empty"));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(algorithm.label().as_bytes()), &self.0);
        let mut key = [0u8; 32];
        hkdf.expand(&[], &mut key)
            .map_err(|err| TransferError::crypto_config(err.to_string()))?;

        Ok(key)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(<{} bytes>)", self.0.len())
    }
}

enum FrameCipher {
    ChaCha(ChaCha20Poly1305),
    Aes(Box<Aes256Gcm>),
}

impl FrameCipher {
    fn new(algorithm: Algorithm, key: &[u8; 32]) -> Result<Self> {
        let invalid_key = |_| TransferError::crypto_config("Invalid key length");

        Ok(match algorithm {
            Algorithm::ChaCha20Poly1305 => {
                FrameCipher::ChaCha(ChaCha20Poly1305::new_from_slice(key).map_err(invalid_key)?)
            }
            Algorithm::Aes256Gcm => {
                FrameCipher::Aes(Box::new(Aes256Gcm::new_from_slice(key).map_err(invalid_key)?))
            }
        })
    }

    fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        let sealed = match self {
            FrameCipher::ChaCha(cipher) => cipher.encrypt(nonce, plaintext),
            FrameCipher::Aes(cipher) => cipher.encrypt(nonce, plaintext),
        };

        sealed.map_err(|_| TransferError::crypto("Frame encryption failed"))
    }

    fn open(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        let opened = match self {
            FrameCipher::ChaCha(cipher) => cipher.decrypt(nonce, ciphertext),
            FrameCipher::Aes(cipher) => cipher.decrypt(nonce, ciphertext),
        };

        opened.map_err(|_| TransferError::crypto("Frame authentication failed"))
    }
}

/// Incremental encrypt/decrypt transform over a byte stream.
pub struct StreamTransform {
    cipher: FrameCipher,
    direction: Direction,
    prefix: Option<[u8; PREFIX_SIZE]>,
    header_written: bool,
    counter: u32,
    buffer: Vec<u8>,
}

impl StreamTransform {
    pub fn new(direction: Direction, algorithm: Algorithm, secret: &Secret) -> Result<Self> {
        let key = secret.derive_key(algorithm)?;
        let cipher = FrameCipher::new(algorithm, &key)?;

        let prefix = match direction {
            Direction::Encrypt => {
                let mut prefix = [0u8; PREFIX_SIZE];
                OsRng.fill_bytes(&mut prefix);
                Some(prefix)
            }
            Direction::Decrypt => None,
        };

        Ok(Self {
            cipher,
            direction,
            prefix,
            header_written: false,
            counter: 0,
            buffer: Vec::with_capacity(FRAME_SIZE + TAG_SIZE),
        })
    }

    /// Builds a transform for an item's algorithm identifier; `None` when unencrypted.
    pub fn for_item(direction: Direction, algorithm: Option<&str>, secret: &Secret) -> Result<Option<Self>> {
        match Algorithm::from_identifier(algorithm)? {
            Some(algorithm) => Self::new(direction, algorithm, secret).map(Some),
            None => Ok(None),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Feeds bytes in and returns whatever output is ready.
    pub fn update(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.buffer.extend_from_slice(input);

        match self.direction {
            Direction::Encrypt => {
                let mut out = self.take_header();
                // Strictly greater: the last frame must stay buffered for finish()
                while self.buffer.len() > FRAME_SIZE {
                    let frame: Vec<u8> = self.buffer.drain(..FRAME_SIZE).collect();
                    out.extend(self.seal_frame(&frame, false)?);
                }
                Ok(out)
            }
            Direction::Decrypt => {
                let mut out = Vec::new();
                if self.prefix.is_none() && self.buffer.len() >= PREFIX_SIZE {
                    let mut prefix = [0u8; PREFIX_SIZE];
                    prefix.copy_from_slice(&self.buffer[..PREFIX_SIZE]);
                    self.buffer.drain(..PREFIX_SIZE);
                    self.prefix = Some(prefix);
                }
                if self.prefix.is_some() {
                    while self.buffer.len() > FRAME_SIZE + TAG_SIZE {
                        let frame: Vec<u8> = self.buffer.drain(..FRAME_SIZE + TAG_SIZE).collect();
                        out.extend(self.open_frame(&frame, false)?);
                    }
                }
                Ok(out)
            }
        }
    }

    /// Emits the final frame. Must be called exactly once at end of stream.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        let remaining = std::mem::take(&mut self.buffer);

        match self.direction {
            Direction::Encrypt => {
                let mut out = self.take_header();
                out.extend(self.seal_frame(&remaining, true)?);
                Ok(out)
            }
            Direction::Decrypt => {
                if self.prefix.is_none() || remaining.len() < TAG_SIZE {
                    return Err(TransferError::crypto("Encrypted stream is truncated"));
                }
                self.open_frame(&remaining, true)
            }
        }
    }

    fn take_header(&mut self) -> Vec<u8> {
        if self.header_written {
            return Vec::new();
        }

        self.header_written = true;
        self.prefix.map(|prefix| prefix.to_vec()).unwrap_or_default()
    }

    fn next_nonce(&mut self, last: bool) -> Result<[u8; NONCE_SIZE]> {
        let prefix = self.prefix
            .ok_or_else(|| TransferError::crypto("Missing nonce prefix"))?;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..PREFIX_SIZE].copy_from_slice(&prefix);
        nonce[PREFIX_SIZE..NONCE_SIZE - 1].copy_from_slice(&self.counter.to_be_bytes());
        nonce[NONCE_SIZE - 1] = last as u8;

        self.counter = self.counter
            .checked_add(1)
            .ok_or_else(|| TransferError::crypto("Encrypted stream too long"))?;

        Ok(nonce)
    }

    fn seal_frame(&mut self, frame: &[u8], last: bool) -> Result<Vec<u8>> {
        let nonce = self.next_nonce(last)?;
        self.cipher.seal(&nonce, frame)
    }

    fn open_frame(&mut self, frame: &[u8], last: bool) -> Result<Vec<u8>> {
        let nonce = self.next_nonce(last)?;
        self.cipher.open(&nonce, frame)
    }
}

/// Writer layered over a raw sink that optionally runs bytes through a
/// [`StreamTransform`].
///
/// The raw sink is only borrowed: [`CipherWriter::finish`] writes the last
/// frame and flushes, but closing the raw sink stays with its owner.
pub struct CipherWriter<'a, W> {
    inner: &'a mut W,
    transform: Option<StreamTransform>,
}

impl<'a, W> CipherWriter<'a, W>
where
    W: AsyncWrite + Unpin,
{
    pub fn wrap(inner: &'a mut W, direction: Direction, algorithm: Option<&str>, secret: &Secret) -> Result<Self> {
        let transform = StreamTransform::for_item(direction, algorithm, secret)?;
        Ok(Self { inner, transform })
    }

    pub fn is_passthrough(&self) -> bool {
        self.transform.is_none()
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self.transform.as_mut() {
            Some(transform) => {
                let out = transform.update(buf)?;
                if !out.is_empty() {
                    self.inner.write_all(&out).await?;
                }
            }
            None => self.inner.write_all(buf).await?,
        }

        Ok(())
    }

    pub async fn finish(self) -> Result<()> {
        if let Some(transform) = self.transform {
            let tail = transform.finish()?;
            self.inner.write_all(&tail).await?;
        }
        self.inner.flush().await?;

        Ok(())
    }
}
