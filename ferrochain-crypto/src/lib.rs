use anyhow::{anyhow, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Canonical JSON encoding used both as the hash preimage and as the signature
/// subject. `serde_json::Value` serialises object keys out of a `BTreeMap`
/// (we don't enable the `preserve_order` feature anywhere in this workspace),
/// so routing a value through `Value` before encoding is enough to get sorted
/// keys at every nesting level with no extra whitespace.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let as_value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&as_value)?)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
}

pub fn generate_keypair() -> KeyPair {
    let signing_key = SigningKey::generate(&mut OsRng);
    KeyPair {
        public_key: hex::encode(signing_key.verifying_key().to_bytes()),
        private_key: hex::encode(signing_key.to_bytes()),
    }
}

pub fn sign(private_key_hex: &str, message: &[u8]) -> Result<String> {
    let bytes = hex::decode(private_key_hex)?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("private key must be 32 bytes"))?;
    let signing_key = SigningKey::from_bytes(&seed);
    let signature = signing_key.sign(message);
    Ok(hex::encode(signature.to_bytes()))
}

pub fn verify(public_key_hex: &str, message: &[u8], signature_hex: &str) -> bool {
    verify_inner(public_key_hex, message, signature_hex).unwrap_or(false)
}

fn verify_inner(public_key_hex: &str, message: &[u8], signature_hex: &str) -> Result<bool> {
    let pk_bytes: [u8; 32] = hex::decode(public_key_hex)?
        .try_into()
        .map_err(|_| anyhow!("public key must be 32 bytes"))?;
    let sig_bytes: [u8; 64] = hex::decode(signature_hex)?
        .try_into()
        .map_err(|_| anyhow!("signature must be 64 bytes"))?;
    let verifying_key = VerifyingKey::from_bytes(&pk_bytes)?;
    let signature = Signature::from_bytes(&sig_bytes);
    Ok(verifying_key.verify(message, &signature).is_ok())
}

/// 64 random bits, hex-encoded — used for block nonces and node identifiers.
pub fn random_hex_u64() -> String {
    use rand::RngCore;
    let mut rng = rand::thread_rng();
    format!("{:x}", rng.next_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let kp = generate_keypair();
        let msg = b"hello ferrochain";
        let sig = sign(&kp.private_key, msg).unwrap();
        assert!(verify(&kp.public_key, msg, &sig));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let kp = generate_keypair();
        let sig = sign(&kp.private_key, b"original").unwrap();
        assert!(!verify(&kp.public_key, b"tampered", &sig));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let kp_a = generate_keypair();
        let kp_b = generate_keypair();
        let sig = sign(&kp_a.private_key, b"msg").unwrap();
        assert!(!verify(&kp_b.public_key, b"msg", &sig));
    }

    #[test]
    fn canonical_json_sorts_keys() {
        #[derive(Serialize)]
        struct Unsorted {
            z: u8,
            a: u8,
        }
        let encoded = canonical_json(&Unsorted { z: 1, a: 2 }).unwrap();
        let text = String::from_utf8(encoded).unwrap();
        assert_eq!(text, r#"{"a":2,"z":1}"#);
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
