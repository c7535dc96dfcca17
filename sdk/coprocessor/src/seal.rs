//! Encrypted input sealing
//!
//! An encrypted input is a list of typed plaintexts sealed with
//! ChaCha20-Poly1305 under a key shared by the client and the mock node.
//! The associated data binds the proof to one (chain, contract, user)
//! triple, so a proof replayed for another contract or sender fails to open.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::RngCore;
use veil_types::{Address, FheType, Handle};

use crate::error::CoprocessorError;

const NONCE_LEN: usize = 12;
const ENTRY_LEN: usize = 9;
const MAX_VALUES: usize = 256;

/// Symmetric key used to seal inputs for one verifier deployment.
#[derive(Clone)]
pub struct InputKey([u8; 32]);

impl InputKey {
    /// Derives the key from the input-verifier contract address and chain id.
    pub fn derive(input_verifier: &Address, chain_id: u64) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key("veil-mock-input-v1");
        hasher.update(input_verifier.as_bytes());
        hasher.update(&chain_id.to_be_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

impl std::fmt::Debug for InputKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputKey").finish_non_exhaustive()
    }
}

/// Output of sealing: one handle per value, in insertion order, plus the proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedInput {
    pub handles: Vec<Handle>,
    pub proof: Vec<u8>,
}

fn binding(chain_id: u64, contract: &Address, user: &Address) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + 40);
    aad.extend_from_slice(&chain_id.to_be_bytes());
    aad.extend_from_slice(contract.as_bytes());
    aad.extend_from_slice(user.as_bytes());
    aad
}

fn derive_handles(
    proof: &[u8],
    chain_id: u64,
    contract: &Address,
    user: &Address,
    types: impl Iterator<Item = FheType>,
) -> Vec<Handle> {
    let mut hasher = blake3::Hasher::new_derive_key("veil-input-handle-v1");
    hasher.update(proof);
    hasher.update(contract.as_bytes());
    hasher.update(user.as_bytes());
    let digest = *hasher.finalize().as_bytes();

    types
        .enumerate()
        .map(|(i, t)| Handle::compose(&digest, i as u8, chain_id, t))
        .collect()
}

/// Seal typed values into an input proof bound to `contract` and `user`.
pub fn seal_input(
    key: &InputKey,
    chain_id: u64,
    contract: &Address,
    user: &Address,
    values: &[(FheType, u64)],
) -> Result<SealedInput, CoprocessorError> {
    if values.len() > MAX_VALUES {
        return Err(CoprocessorError::EncryptionFailed);
    }

    let mut plaintext = Vec::with_capacity(values.len() * ENTRY_LEN);
    for (fhe_type, value) in values {
        plaintext.push(fhe_type.tag());
        plaintext.extend_from_slice(&value.to_be_bytes());
    }

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
        .map_err(|_| CoprocessorError::EncryptionFailed)?;
    let aad = binding(chain_id, contract, user);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| CoprocessorError::EncryptionFailed)?;

    let mut proof = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    proof.extend_from_slice(&nonce_bytes);
    proof.extend_from_slice(&ciphertext);

    let handles = derive_handles(
        &proof,
        chain_id,
        contract,
        user,
        values.iter().map(|(t, _)| *t),
    );

    Ok(SealedInput { handles, proof })
}

/// Verify and open an input proof, returning `(handle, type, value)` per entry.
pub fn open_input(
    key: &InputKey,
    chain_id: u64,
    contract: &Address,
    user: &Address,
    proof: &[u8],
) -> Result<Vec<(Handle, FheType, u64)>, CoprocessorError> {
    if proof.len() <= NONCE_LEN {
        return Err(CoprocessorError::MalformedProof);
    }
    let (nonce_bytes, ciphertext) = proof.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
        .map_err(|_| CoprocessorError::InvalidProof)?;
    let aad = binding(chain_id, contract, user);
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| CoprocessorError::InvalidProof)?;

    if plaintext.len() % ENTRY_LEN != 0 {
        return Err(CoprocessorError::MalformedProof);
    }

    let mut entries = Vec::with_capacity(plaintext.len() / ENTRY_LEN);
    for chunk in plaintext.chunks_exact(ENTRY_LEN) {
        let fhe_type = FheType::from_tag(chunk[0]).map_err(|_| CoprocessorError::MalformedProof)?;
        let mut value = [0u8; 8];
        value.copy_from_slice(&chunk[1..]);
        entries.push((fhe_type, u64::from_be_bytes(value)));
    }

    let handles = derive_handles(proof, chain_id, contract, user, entries.iter().map(|(t, _)| *t));

    Ok(handles
        .into_iter()
        .zip(entries)
        .map(|(h, (t, v))| (h, t, v))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (InputKey, Address, Address) {
        let key = InputKey::derive(&Address([9u8; 20]), 31337);
        (key, Address([1u8; 20]), Address([2u8; 20]))
    }

    #[test]
    fn test_open_recovers_values_and_handles() {
        let (key, contract, user) = setup();
        let values = [(FheType::Euint8, 2), (FheType::Ebool, 1), (FheType::Euint64, u64::MAX)];

        let sealed = seal_input(&key, 31337, &contract, &user, &values).unwrap();
        assert_eq!(sealed.handles.len(), 3);

        let opened = open_input(&key, 31337, &contract, &user, &sealed.proof).unwrap();
        for (i, (handle, t, v)) in opened.iter().enumerate() {
            assert_eq!(*handle, sealed.handles[i]);
            assert_eq!(handle.index() as usize, i);
            assert_eq!((*t, *v), values[i]);
        }
    }

    #[test]
    fn test_proof_is_bound_to_user() {
        let (key, contract, user) = setup();
        let sealed = seal_input(&key, 31337, &contract, &user, &[(FheType::Euint8, 1)]).unwrap();

        let other_user = Address([3u8; 20]);
        let result = open_input(&key, 31337, &contract, &other_user, &sealed.proof);
        assert!(matches!(result, Err(CoprocessorError::InvalidProof)));
    }

    #[test]
    fn test_truncated_proof_rejected() {
        let (key, contract, user) = setup();
        let result = open_input(&key, 31337, &contract, &user, &[0u8; 4]);
        assert!(matches!(result, Err(CoprocessorError::MalformedProof)));
    }
}
