//! Check codes for the safety and redundancy layers
//!
//! Both layers append a trailing check code to every packet. The safety layer
//! uses an optionally keyed hash (the "safety code"); the redundancy layer uses
//! a plain CRC. Codecs only see the [`Checksum`] trait, so any other primitive
//! can be plugged in.
use std::fmt;

use blake2::digest::consts::U16;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use md4::{Digest, Md4};

use crate::errors::{RastaError, Result};

/// Pluggable check code primitive
pub trait Checksum {
    /// Length in bytes of the produced check code
    fn code_len(&self) -> usize;

    /// Compute the check code over `data`
    fn digest(&self, data: &[u8]) -> Vec<u8>;

    /// Verify `code` against `data`
    fn verify(&self, data: &[u8], code: &[u8]) -> bool {
        self.digest(data) == code
    }
}

/// Safety code algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SafetyCodeType {
    /// No safety code
    None,
    /// CRC-32 (IEEE), 4 bytes
    Crc32,
    /// Keyed MD4, lower half (8 bytes)
    #[default]
    Md4Lower,
    /// Keyed MD4, full digest (16 bytes)
    Md4Full,
    /// Keyed BLAKE2b-128, lower half (8 bytes)
    Blake2bLower,
    /// Keyed BLAKE2b-128, full digest (16 bytes)
    Blake2bFull,
}

impl SafetyCodeType {
    pub fn code_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Crc32 => 4,
            Self::Md4Lower | Self::Blake2bLower => 8,
            Self::Md4Full | Self::Blake2bFull => 16,
        }
    }

    /// Maximum accepted key length for the algorithm
    pub fn max_key_len(self) -> usize {
        match self {
            Self::Blake2bLower | Self::Blake2bFull => 64,
            _ => usize::MAX,
        }
    }
}

/// Safety code primitive with its key applied
#[derive(Clone)]
enum Primitive {
    None,
    Crc32,
    Md4 { key: Vec<u8>, len: usize },
    Blake2b { mac: Blake2bMac<U16>, len: usize },
}

impl Primitive {
    fn new(kind: SafetyCodeType, key: &[u8]) -> Result<Self> {
        if key.len() > kind.max_key_len() {
            return Err(RastaError::InvalidKeyLength(key.len()));
        }
        let len = kind.code_len();
        Ok(match kind {
            SafetyCodeType::None => Self::None,
            SafetyCodeType::Crc32 => Self::Crc32,
            SafetyCodeType::Md4Lower | SafetyCodeType::Md4Full => Self::Md4 { key: key.to_vec(), len },
            SafetyCodeType::Blake2bLower | SafetyCodeType::Blake2bFull => {
                let mac = Blake2bMac::<U16>::new_with_salt_and_personal(key, &[], &[])
                    .map_err(|_| RastaError::InvalidKeyLength(key.len()))?;
                Self::Blake2b { mac, len }
            }
        })
    }

    fn compute(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::None => Vec::new(),
            Self::Crc32 => crc32fast::hash(data).to_le_bytes().to_vec(),
            Self::Md4 { key, len } => {
                let mut hasher = Md4::new();
                hasher.update(key);
                hasher.update(data);
                let digest = hasher.finalize();
                digest[..*len].to_vec()
            }
            Self::Blake2b { mac, len } => {
                let mut mac = mac.clone();
                mac.update(data);
                let digest = mac.finalize().into_bytes();
                digest[..*len].to_vec()
            }
        }
    }
}

impl fmt::Debug for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::Crc32 => "Crc32",
            Self::Md4 { .. } => "Md4",
            Self::Blake2b { .. } => "Blake2b",
        };
        f.write_str(name)
    }
}

/// Keyed safety code with key rotation
///
/// After a rotation the previous key keeps verifying until the next one.
#[derive(Debug, Clone)]
pub struct SafetyCode {
    kind: SafetyCodeType,
    active: Primitive,
    previous: Option<Primitive>,
}

impl SafetyCode {
    pub fn new(kind: SafetyCodeType, key: &[u8]) -> Result<Self> {
        Ok(Self { kind, active: Primitive::new(kind, key)?, previous: None })
    }

    /// Safety code without any check bytes
    pub fn none() -> Self {
        Self { kind: SafetyCodeType::None, active: Primitive::None, previous: None }
    }

    pub fn kind(&self) -> SafetyCodeType {
        self.kind
    }

    /// Replace the active key, keeping the current one for verification
    pub fn rotate_key(&mut self, key: &[u8]) -> Result<()> {
        let next = Primitive::new(self.kind, key)?;
        self.previous = Some(std::mem::replace(&mut self.active, next));
        Ok(())
    }
}

impl Checksum for SafetyCode {
    fn code_len(&self) -> usize {
        self.kind.code_len()
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        self.active.compute(data)
    }

    fn verify(&self, data: &[u8], code: &[u8]) -> bool {
        if self.active.compute(data) == code {
            return true;
        }
        self.previous.as_ref().is_some_and(|previous| previous.compute(data) == code)
    }
}

/// Redundancy layer check code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedundancyCheckCode {
    None,
    #[default]
    Crc32,
}

impl Checksum for RedundancyCheckCode {
    fn code_len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Crc32 => 4,
        }
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::None => Vec::new(),
            Self::Crc32 => crc32fast::hash(data).to_le_bytes().to_vec(),
        }
    }
}
