use crate::{Error, Result};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use std::path::Path;
use tokio::fs;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Encryptor is the symmetric cipher capability consumed by the block storage.
pub trait Encryptor: Send + Sync + 'static {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-GCM encryptor with a node wide key.
///
/// Payload format: nonce (12 bytes) || ciphertext (includes the GCM tag)
pub struct AesEncryptor {
    cipher: Aes256Gcm,
}

impl AesEncryptor {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(GenericArray::from_slice(key)),
        }
    }

    /// encryptor with a throw away key, blocks encrypted with it can only be
    /// read back by this process
    pub fn ephemeral() -> Self {
        Self::new(&rand::random::<[u8; KEY_LEN]>())
    }

    /// loads the key stored at path, or generates a new key and persists it
    /// there if the file does not exist yet.
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::read(path).await {
            Ok(key) => {
                let key: [u8; KEY_LEN] = key.as_slice().try_into().map_err(|_| {
                    Error::Other(anyhow::anyhow!(
                        "key file '{}' must hold exactly {} bytes",
                        path.display(),
                        KEY_LEN
                    ))
                })?;
                debug!("loaded encryption key from {}", path.display());
                Ok(Self::new(&key))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                let key = rand::random::<[u8; KEY_LEN]>();
                fs::write(path, key).await?;
                info!("generated new encryption key at {}", path.display());
                Ok(Self::new(&key))
            }
            Err(err) => Err(Error::IO(err)),
        }
    }
}

impl Encryptor for AesEncryptor {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let nonce = rand::random::<[u8; NONCE_LEN]>();
        let encrypted = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| Error::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_LEN + encrypted.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&encrypted);
        Ok(out)
    }

    fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>> {
        if encrypted.len() < NONCE_LEN {
            return Err(Error::Encryption);
        }
        let (nonce, data) = encrypted.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), data)
            .map_err(|_| Error::Encryption)
    }
}
