//! Node identity and base58 peer ids.
//!
//! Every node owns an ed25519 keypair persisted in the data directory; the
//! peer id other nodes see is a base58check encoding of the hashed public
//! key. The same id doubles as the default miner key credited in blocks.

use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

const BASE58_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerId {
    payload: [u8; 20],
}

impl PeerId {
    pub fn from_public_key(pubkey: &VerifyingKey) -> Self {
        let digest = Sha256::digest(pubkey.as_bytes());
        let mut payload = [0u8; 20];
        payload.copy_from_slice(&digest[..20]);
        Self { payload }
    }

    pub fn from_string(s: &str) -> Result<Self, IdentityError> {
        let decoded = decode_base58(s)?;
        if decoded.len() != 24 {
            return Err(IdentityError::InvalidPayload);
        }
        let (payload_bytes, checksum) = decoded.split_at(20);
        if checksum != &compute_checksum(payload_bytes)[..4] {
            return Err(IdentityError::InvalidChecksum);
        }
        let mut payload = [0u8; 20];
        payload.copy_from_slice(payload_bytes);
        Ok(Self { payload })
    }

    pub fn as_string(&self) -> String {
        let checksum = compute_checksum(&self.payload);
        let mut data = Vec::with_capacity(24);
        data.extend_from_slice(&self.payload);
        data.extend_from_slice(&checksum[..4]);
        encode_base58(&data)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

/// The node's keypair. Loaded from `node_key` in the data directory,
/// generated on first start.
pub struct NodeIdentity {
    signing_key: SigningKey,
    peer_id: PeerId,
}

impl NodeIdentity {
    pub fn load_or_generate(data_dir: &Path) -> Result<Self, IdentityError> {
        let key_path = data_dir.join("node_key");
        let signing_key = if key_path.exists() {
            let raw = std::fs::read(&key_path).map_err(IdentityError::KeyFile)?;
            let bytes: [u8; 32] = raw
                .as_slice()
                .try_into()
                .map_err(|_| IdentityError::InvalidPayload)?;
            SigningKey::from_bytes(&bytes)
        } else {
            let key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
            std::fs::write(&key_path, key.to_bytes()).map_err(IdentityError::KeyFile)?;
            key
        };
        let peer_id = PeerId::from_public_key(&signing_key.verifying_key());
        Ok(Self {
            signing_key,
            peer_id,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

fn compute_checksum(data: &[u8]) -> [u8; 4] {
    let hash1 = Sha256::digest(data);
    let hash2 = Sha256::digest(hash1);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&hash2[..4]);
    checksum
}

fn encode_base58(data: &[u8]) -> String {
    let mut num = num_bigint::BigUint::from_bytes_be(data);
    let base = num_bigint::BigUint::from(58u32);
    let mut result = String::new();

    while num > num_bigint::BigUint::from(0u32) {
        let remainder = &num % &base;
        num /= &base;
        let digits = remainder.to_u32_digits();
        let idx = if digits.is_empty() { 0 } else { digits[0] } as usize;
        result.insert(0, BASE58_ALPHABET[idx] as char);
    }

    // Leading zero bytes become leading '1's
    for &byte in data {
        if byte == 0 {
            result.insert(0, '1');
        } else {
            break;
        }
    }

    result
}

fn decode_base58(s: &str) -> Result<Vec<u8>, IdentityError> {
    let mut num = num_bigint::BigUint::from(0u32);
    let base = num_bigint::BigUint::from(58u32);

    for ch in s.chars() {
        let idx = BASE58_ALPHABET
            .iter()
            .position(|&c| c == ch as u8)
            .ok_or(IdentityError::InvalidBase58)?;
        num = num * &base + idx;
    }

    let mut bytes = num.to_bytes_be();
    let leading_ones = s.chars().take_while(|&c| c == '1').count();
    let mut result = vec![0u8; leading_ones];
    result.append(&mut bytes);

    Ok(result)
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Invalid payload")]
    InvalidPayload,
    #[error("Invalid checksum")]
    InvalidChecksum,
    #[error("Invalid base58 character")]
    InvalidBase58,
    #[error("Failed to read or write node key: {0}")]
    KeyFile(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_round_trip() {
        let signing_key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let id = PeerId::from_public_key(&signing_key.verifying_key());
        let parsed = PeerId::from_string(&id.as_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn corrupted_id_fails_checksum() {
        let signing_key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let id = PeerId::from_public_key(&signing_key.verifying_key());
        let mut s = id.as_string();
        let flipped = if s.ends_with('2') { '3' } else { '2' };
        s.pop();
        s.push(flipped);
        assert!(PeerId::from_string(&s).is_err());
    }

    #[test]
    fn identity_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = NodeIdentity::load_or_generate(dir.path()).unwrap();
        let second = NodeIdentity::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }
}
