//! Long-term node identity.

use std::{
    fmt::{self, Debug, Formatter},
    fs::{self, OpenOptions},
    io::{self, Write},
    path::Path,
};

use crc::{Crc, CRC_32_ISCSI};
use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, info};

use crate::common::Id;

const KEY_TYPE_ED25519: u8 = 1;
const CHECKSUM_SIZE: usize = 4;
const KEY_FILE_SIZE: usize = 1 + SECRET_KEY_LENGTH + CHECKSUM_SIZE;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The asymmetric keypair identifying this node on the network.
///
/// Created once on first run, loaded on every run after that, never mutated.
#[derive(Clone)]
pub struct NodeIdentity {
    signing_key: SigningKey,
}

impl Debug for NodeIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIdentity({})", self.peer_id())
    }
}

impl NodeIdentity {
    /// Generate a fresh ed25519 identity.
    pub fn generate() -> Self {
        let mut secret = [0_u8; SECRET_KEY_LENGTH];
        OsRng.fill_bytes(&mut secret);

        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    /// Load the identity stored at `path`, or generate and store a new one
    /// if there is no file there yet.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref();

        match fs::read(path) {
            Ok(bytes) => {
                let identity = Self::decode(&bytes)?;
                debug!(?path, peer_id = %identity.peer_id(), "Loaded node identity");

                Ok(identity)
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                let identity = Self::generate();
                identity.save(path)?;
                info!(?path, peer_id = %identity.peer_id(), "Generated new node identity");

                Ok(identity)
            }
            Err(error) => Err(error.into()),
        }
    }

    // === Getters ===

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The peer id derived from this identity's public key.
    pub fn peer_id(&self) -> Id {
        Id::from_public_key(&self.public_key())
    }

    // === Private Methods ===

    /// Write the identity to a new file readable and writable by the owner only.
    fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path)?;
        file.write_all(&self.encode())?;
        file.sync_all()?;

        Ok(())
    }

    /// `[key type][secret key][crc32c of the previous bytes]`
    fn encode(&self) -> [u8; KEY_FILE_SIZE] {
        let mut bytes = [0_u8; KEY_FILE_SIZE];

        bytes[0] = KEY_TYPE_ED25519;
        bytes[1..1 + SECRET_KEY_LENGTH].copy_from_slice(self.signing_key.as_bytes());

        let checksum = CASTAGNOLI.checksum(&bytes[..1 + SECRET_KEY_LENGTH]);
        bytes[1 + SECRET_KEY_LENGTH..].copy_from_slice(&checksum.to_be_bytes());

        bytes
    }

    fn decode(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != KEY_FILE_SIZE {
            return Err(IdentityError::Corrupt("unexpected key file length"));
        }

        let (payload, checksum) = bytes.split_at(1 + SECRET_KEY_LENGTH);

        if CASTAGNOLI.checksum(payload).to_be_bytes() != checksum {
            return Err(IdentityError::Corrupt("checksum mismatch"));
        }

        if payload[0] != KEY_TYPE_ED25519 {
            return Err(IdentityError::Corrupt("unsupported key type"));
        }

        let secret: [u8; SECRET_KEY_LENGTH] = payload[1..]
            .try_into()
            .map_err(|_| IdentityError::Corrupt("unexpected secret key length"))?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }
}

impl From<SigningKey> for NodeIdentity {
    fn from(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors loading or creating the node identity.
pub enum IdentityError {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] io::Error),

    #[error("Identity file is corrupt: {0}")]
    Corrupt(&'static str),
}
