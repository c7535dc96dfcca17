//! Re-encryption of plaintexts to a user's ephemeral decryption key.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::CoprocessorError;

const PK_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Ephemeral X25519 key pair generated for one decryption grant.
pub struct DecryptionKeypair {
    secret: StaticSecret,
    pub public_key: [u8; 32],
}

impl DecryptionKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public_key = *PublicKey::from(&secret).as_bytes();
        Self { secret, public_key }
    }

    pub fn from_secret(secret_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        let public_key = *PublicKey::from(&secret).as_bytes();
        Self { secret, public_key }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        format!("0x{}", hex::encode(self.public_key))
    }

    pub fn secret_key_hex(&self) -> String {
        format!("0x{}", hex::encode(self.secret.to_bytes()))
    }
}

impl std::fmt::Debug for DecryptionKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionKeypair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

fn derive_transport_key(shared_secret: &[u8], ephemeral_pk: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key("veil-user-decrypt-v1");
    hasher.update(shared_secret);
    hasher.update(ephemeral_pk);
    *hasher.finalize().as_bytes()
}

/// Encrypt `value` for the holder of `recipient_pk`.
///
/// Output layout: `ephemeral_pk (32) || nonce (12) || ciphertext`.
pub fn reencrypt(value: u64, recipient_pk: &[u8; 32]) -> Result<Vec<u8>, CoprocessorError> {
    let mut rng = rand::thread_rng();
    let ephemeral_secret = EphemeralSecret::random_from_rng(&mut rng);
    let ephemeral_pk = PublicKey::from(&ephemeral_secret);

    let shared_secret = ephemeral_secret.diffie_hellman(&PublicKey::from(*recipient_pk));
    let key = derive_transport_key(shared_secret.as_bytes(), ephemeral_pk.as_bytes());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce_bytes);

    let cipher =
        ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CoprocessorError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), value.to_be_bytes().as_slice())
        .map_err(|_| CoprocessorError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(PK_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_pk.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a payload produced by [`reencrypt`].
pub fn open_reencrypted(
    keypair: &DecryptionKeypair,
    payload: &[u8],
) -> Result<u64, CoprocessorError> {
    if payload.len() <= PK_LEN + NONCE_LEN {
        return Err(CoprocessorError::ReencryptionFailed);
    }
    let mut ephemeral_pk = [0u8; PK_LEN];
    ephemeral_pk.copy_from_slice(&payload[..PK_LEN]);
    let nonce = Nonce::from_slice(&payload[PK_LEN..PK_LEN + NONCE_LEN]);

    let shared_secret = keypair
        .secret
        .diffie_hellman(&PublicKey::from(ephemeral_pk));
    let key = derive_transport_key(shared_secret.as_bytes(), &ephemeral_pk);

    let cipher =
        ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CoprocessorError::ReencryptionFailed)?;
    let plaintext = cipher
        .decrypt(nonce, &payload[PK_LEN + NONCE_LEN..])
        .map_err(|_| CoprocessorError::ReencryptionFailed)?;

    let bytes: [u8; 8] = plaintext
        .try_into()
        .map_err(|_| CoprocessorError::ReencryptionFailed)?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reencrypt_roundtrip() {
        let keypair = DecryptionKeypair::generate();
        let payload = reencrypt(42, &keypair.public_key).unwrap();
        assert_eq!(open_reencrypted(&keypair, &payload).unwrap(), 42);
    }

    #[test]
    fn test_wrong_key_cannot_open() {
        let keypair = DecryptionKeypair::generate();
        let other = DecryptionKeypair::generate();
        let payload = reencrypt(7, &keypair.public_key).unwrap();
        assert!(matches!(
            open_reencrypted(&other, &payload),
            Err(CoprocessorError::ReencryptionFailed)
        ));
    }

    #[test]
    fn test_keypair_from_secret_is_stable() {
        let keypair = DecryptionKeypair::generate();
        let restored = DecryptionKeypair::from_secret(keypair.secret_bytes());
        assert_eq!(keypair.public_key, restored.public_key);
    }
}
