use super::{crypto::Encryptor, schema::BlockSchema};
use crate::{Error, Result};

/// Block is a schema record together with the payload currently held in memory.
///
/// Depending on `schema.encrypted` and the last transition applied, `data`
/// holds either the plain bytes or the ciphertext.
#[derive(Debug, Clone)]
pub struct Block {
    pub schema: BlockSchema,
    pub data: Vec<u8>,
}

impl Block {
    /// new plain block for the given content, fails if the content does not
    /// fit the size field of the record
    pub fn new<S: Into<String>>(hash: S, data: Vec<u8>) -> Result<Self> {
        let schema = BlockSchema::new(hash, record_size(&data)?, false);
        Ok(Self { schema, data })
    }

    /// block read back from disk, data is still in its stored form
    pub fn from_stored(schema: BlockSchema, data: Vec<u8>) -> Self {
        Self { schema, data }
    }

    /// replace the payload with its ciphertext and mark the block encrypted
    pub fn encrypt(&mut self, encryptor: &dyn Encryptor) -> Result<()> {
        if self.schema.encrypted {
            return Ok(());
        }

        let data = encryptor.encrypt(&self.data)?;
        self.schema.size = record_size(&data)?;
        self.data = data;
        self.schema.encrypted = true;
        Ok(())
    }

    /// reverse of [`Block::encrypt`]
    pub fn decrypt(&mut self, encryptor: &dyn Encryptor) -> Result<()> {
        if !self.schema.encrypted {
            return Ok(());
        }

        let data = encryptor.decrypt(&self.data)?;
        self.schema.size = record_size(&data)?;
        self.data = data;
        self.schema.encrypted = false;
        Ok(())
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

fn record_size(data: &[u8]) -> Result<u32> {
    u32::try_from(data.len()).map_err(|_| Error::TooLarge(data.len()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bfs::crypto::AesEncryptor;
    use crate::hash::calculate_hash;

    #[test]
    fn encrypt_transition_updates_size() {
        let enc = AesEncryptor::ephemeral();
        let data = b"hello world".to_vec();
        let mut block = Block::new(calculate_hash(&data), data.clone()).unwrap();
        assert_eq!(block.schema.size, 11);

        block.encrypt(&enc).unwrap();
        assert!(block.schema.encrypted);
        assert_ne!(block.data, data);
        assert_eq!(block.schema.size as usize, block.data.len());

        // second encrypt is a no-op
        let ciphertext = block.data.clone();
        block.encrypt(&enc).unwrap();
        assert_eq!(block.data, ciphertext);

        block.decrypt(&enc).unwrap();
        assert!(!block.schema.encrypted);
        assert_eq!(block.schema.size, 11);
        assert_eq!(block.into_data(), data);
    }
}
