//! Session description encryption for signaling payloads
//!
//! Compatible with the Trystero room password scheme:
//! 1. key = SHA256("<password>:<appId>:<roomName>")
//! 2. ciphertext = AES-256-GCM(key, random 16-byte IV, plaintext)
//! 3. wire = "<iv bytes as comma separated decimals>$<base64(ciphertext || tag)>"
//!
//! An empty password is a valid key, not "no encryption".

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// AES-256-GCM with the 128-bit IV used by WebCrypto callers
type Cipher = AesGcm<Aes256, U16>;

/// IV size in bytes
pub const IV_SIZE: usize = 16;

/// Auth tag size for AES-GCM
const TAG_SIZE: usize = 16;

const IV_SEPARATOR: char = '$';

/// Encryption error
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Malformed ciphertext: {0}")]
    Malformed(String),
}

/// Symmetric key shared by every member of a password protected room
#[derive(Clone)]
pub struct SignalKey([u8; 32]);

impl SignalKey {
    /// Derive the room key from password and room coordinates
    pub fn derive(password: &str, app_id: &str, room_name: &str) -> Self {
        let digest = Sha256::digest(format!("{}:{}:{}", password, app_id, room_name).as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn cipher(&self) -> Cipher {
        Cipher::new(self.0.as_slice().into())
    }
}

impl std::fmt::Debug for SignalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SignalKey(..)")
    }
}

/// Encrypt text into the `iv$ciphertext` wire form
pub fn encrypt(key: &SignalKey, plaintext: &str) -> Result<String, CryptoError> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = key
        .cipher()
        .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let iv_text = iv
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(",");

    Ok(format!("{}{}{}", iv_text, IV_SEPARATOR, STANDARD.encode(ciphertext)))
}

/// Decrypt the `iv$ciphertext` wire form
pub fn decrypt(key: &SignalKey, wire: &str) -> Result<String, CryptoError> {
    let (iv_text, body) = wire
        .split_once(IV_SEPARATOR)
        .ok_or_else(|| CryptoError::Malformed("missing IV separator".to_string()))?;

    let iv = parse_iv(iv_text)?;
    let ciphertext = STANDARD
        .decode(body)
        .map_err(|e| CryptoError::Malformed(e.to_string()))?;

    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::Malformed("ciphertext too short".to_string()));
    }

    let plaintext = key
        .cipher()
        .decrypt(Nonce::<U16>::from_slice(&iv), ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}

/// Whether a string has the shape of an encrypted payload
pub fn looks_encrypted(wire: &str) -> bool {
    wire.split_once(IV_SEPARATOR)
        .map(|(iv, _)| parse_iv(iv).is_ok())
        .unwrap_or(false)
}

fn parse_iv(text: &str) -> Result<[u8; IV_SIZE], CryptoError> {
    let mut iv = [0u8; IV_SIZE];
    let mut count = 0;
    for part in text.split(',') {
        if count == IV_SIZE {
            return Err(CryptoError::Malformed("IV too long".to_string()));
        }
        iv[count] = part
            .trim()
            .parse::<u8>()
            .map_err(|_| CryptoError::Malformed(format!("bad IV byte {:?}", part)))?;
        count += 1;
    }
    if count != IV_SIZE {
        return Err(CryptoError::Malformed(format!("IV has {} bytes", count)));
    }
    Ok(iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\n";

    #[test]
    fn test_key_derivation_vector() {
        // SHA256(":demo:lobby")
        let key = SignalKey::derive("", "demo", "lobby");
        let hex: String = key.as_bytes().iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(
            hex,
            "85dee12751e3dd41dee2510f046a09a915b630f05bf3e006ed5339393bc8d0d4"
        );
    }

    #[test]
    fn test_roundtrip() {
        let key = SignalKey::derive("hunter2", "demo", "lobby");
        let wire = encrypt(&key, SDP).unwrap();
        assert_eq!(decrypt(&key, &wire).unwrap(), SDP);
    }

    #[test]
    fn test_empty_password_still_encrypts() {
        let key = SignalKey::derive("", "demo", "lobby");
        let wire = encrypt(&key, SDP).unwrap();
        assert!(!wire.contains("v=0"));
        assert!(looks_encrypted(&wire));
        assert_eq!(decrypt(&key, &wire).unwrap(), SDP);
    }

    #[test]
    fn test_wire_shape() {
        let key = SignalKey::derive("pw", "demo", "lobby");
        let wire = encrypt(&key, "x").unwrap();
        let (iv, body) = wire.split_once('$').unwrap();
        assert_eq!(iv.split(',').count(), IV_SIZE);
        // 1 byte of plaintext + 16 byte tag
        assert_eq!(STANDARD.decode(body).unwrap().len(), 1 + TAG_SIZE);
    }

    #[test]
    fn test_wrong_password_fails() {
        let key = SignalKey::derive("right", "demo", "lobby");
        let other = SignalKey::derive("wrong", "demo", "lobby");
        let wire = encrypt(&key, SDP).unwrap();
        assert!(matches!(decrypt(&other, &wire), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_other_room_fails() {
        let key = SignalKey::derive("pw", "demo", "lobby");
        let other = SignalKey::derive("pw", "demo", "lobby2");
        let wire = encrypt(&key, SDP).unwrap();
        assert!(decrypt(&other, &wire).is_err());
    }

    #[test]
    fn test_malformed_inputs() {
        let key = SignalKey::derive("pw", "demo", "lobby");
        assert!(matches!(decrypt(&key, "no separator"), Err(CryptoError::Malformed(_))));
        assert!(matches!(decrypt(&key, "1,2,3$AAAA"), Err(CryptoError::Malformed(_))));
        assert!(matches!(
            decrypt(&key, "1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16$!!!"),
            Err(CryptoError::Malformed(_))
        ));
        assert!(!looks_encrypted(SDP));
    }
}
