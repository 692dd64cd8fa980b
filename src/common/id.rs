//! Peer id or a store key target
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use ed25519_dalek::VerifyingKey;
use rand::Rng;
use serde::{Serialize, Serializer};
use sha1_smol::Sha1;

/// The size of ids in bytes.
pub const ID_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Peer id or a store key target, both living in the same 160 bit keyspace.
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// The peer id of a node owning this ed25519 public key.
    pub fn from_public_key(public_key: &VerifyingKey) -> Id {
        Self::hash(public_key.as_bytes())
    }

    /// The keyspace position of a distributed store key.
    pub fn for_key(key: &[u8]) -> Id {
        Self::hash(key)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, InvalidId> {
        let bytes = bytes.as_ref();

        let id: [u8; ID_SIZE] = bytes
            .try_into()
            .map_err(|_| InvalidId::Size(bytes.len()))?;

        Ok(Id(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    fn hash(bytes: &[u8]) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(bytes);

        Id(hasher.digest().bytes())
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_SIZE * 2 {
            return Err(InvalidId::Size(s.len() / 2));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = s.get(i * 2..i * 2 + 2).ok_or(InvalidId::Hex)?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| InvalidId::Hex)?;
        }

        Ok(Id(bytes))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors parsing an [Id].
pub enum InvalidId {
    #[error("Invalid Id size, expected {ID_SIZE}, got {0}")]
    Size(usize),

    #[error("Invalid Id encoding, expected lowercase hex")]
    Hex,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_and_parse() {
        let id = Id::random();
        let parsed: Id = id.to_string().parse().unwrap();

        assert_eq!(parsed, id);
        assert_eq!(id.to_string().len(), 40);
    }

    #[test]
    fn reject_invalid_strings() {
        assert_eq!("abcd".parse::<Id>(), Err(InvalidId::Size(2)));
        assert_eq!(
            "zz".repeat(ID_SIZE).parse::<Id>(),
            Err(InvalidId::Hex)
        );
    }

    #[test]
    fn xor_with_self_is_zero() {
        let id = Id::random();

        assert_eq!(id.xor(&id), Id([0; ID_SIZE]));
    }

    #[test]
    fn key_targets_are_stable() {
        assert_eq!(Id::for_key(b"/fn/alice.fn"), Id::for_key(b"/fn/alice.fn"));
        assert_ne!(Id::for_key(b"/fn/alice.fn"), Id::for_key(b"/fn/bob.fn"));
    }

    #[test]
    fn from_bytes_checks_length() {
        assert!(Id::from_bytes([0_u8; 20]).is_ok());
        assert_eq!(Id::from_bytes([0_u8; 19]), Err(InvalidId::Size(19)));
    }
}
