//! Encryption backends
//!
//! A session wraps exactly one backend, chosen once by the capability
//! resolver: the mock coprocessor of a local development node, or a remote
//! relayer for production networks.

pub mod mock;
pub mod relayer;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use veil_coprocessor::{CoprocessorError, DecryptionKeypair, Eip712Payload, SealedInput};
use veil_types::{Address, FheType, Handle};

use crate::capability::BackendDescriptor;
use crate::rpc::{Connector, RpcError};

pub use mock::MockBackend;
pub use relayer::{RelayerBackend, RelayerSettings};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("relayer error: {0}")]
    Relayer(String),

    #[error("no relayer configured for chain {chain_id}")]
    RelayerUnavailable { chain_id: u64 },

    #[error(transparent)]
    Coprocessor(#[from] CoprocessorError),

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

/// A ciphertext handle together with the contract that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleContractPair {
    pub handle: Handle,
    pub contract_address: Address,
}

/// Everything a backend needs to serve one user decryption.
#[derive(Debug)]
pub struct UserDecryptRequest<'a> {
    pub handles: &'a [HandleContractPair],
    pub keypair: &'a DecryptionKeypair,
    pub signature: &'a [u8],
    pub contract_addresses: &'a [Address],
    pub user_address: &'a Address,
    pub start_timestamp: u64,
    pub duration_days: u32,
}

impl UserDecryptRequest<'_> {
    pub fn to_wire(&self) -> UserDecryptWire {
        UserDecryptWire {
            handle_contract_pairs: self.handles.to_vec(),
            public_key: self.keypair.public_key_hex(),
            signature: format!("0x{}", hex::encode(self.signature)),
            contract_addresses: self.contract_addresses.to_vec(),
            user_address: *self.user_address,
            start_timestamp: self.start_timestamp,
            duration_days: self.duration_days,
        }
    }
}

/// Wire form of a user decryption request (mock RPC and relayer alike).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDecryptWire {
    pub handle_contract_pairs: Vec<HandleContractPair>,
    pub public_key: String,
    pub signature: String,
    pub contract_addresses: Vec<Address>,
    pub user_address: Address,
    pub start_timestamp: u64,
    pub duration_days: u32,
}

/// One value re-encrypted to the requester's public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReencryptedValue {
    pub handle: Handle,
    /// Hex payload produced by `veil_coprocessor::reencrypt`
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDecryptResponse {
    pub results: Vec<ReencryptedValue>,
}

/// Open every re-encrypted value with the grant's key pair.
pub(crate) fn open_results(
    keypair: &DecryptionKeypair,
    response: UserDecryptResponse,
) -> Result<HashMap<Handle, u64>, BackendError> {
    response
        .results
        .into_iter()
        .map(|r| {
            let payload = hex::decode(r.payload.trim_start_matches("0x"))
                .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
            let value = veil_coprocessor::open_reencrypted(keypair, &payload)?;
            Ok((r.handle, value))
        })
        .collect()
}

pub(crate) fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, BackendError> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| BackendError::InvalidResponse(format!("{}: {}", field, e)))
}

/// Capability every backend provides.
pub trait EncryptionBackend: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Encrypt typed values for `contract`, bound to `user`; one handle per value.
    fn encrypt_input(
        &self,
        contract: &Address,
        user: &Address,
        values: &[(FheType, u64)],
    ) -> impl Future<Output = Result<SealedInput, BackendError>> + Send;

    fn generate_keypair(&self) -> DecryptionKeypair;

    fn create_eip712(
        &self,
        public_key_hex: &str,
        contract_addresses: &[Address],
        start_timestamp: u64,
        duration_days: u32,
    ) -> Eip712Payload;

    fn user_decrypt(
        &self,
        request: UserDecryptRequest<'_>,
    ) -> impl Future<Output = Result<HashMap<Handle, u64>, BackendError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Mock,
    Relayer,
}

pub enum Backend {
    Mock(MockBackend),
    Relayer(RelayerBackend),
}

impl EncryptionBackend for Backend {
    fn chain_id(&self) -> u64 {
        match self {
            Backend::Mock(b) => b.chain_id(),
            Backend::Relayer(b) => b.chain_id(),
        }
    }

    async fn encrypt_input(
        &self,
        contract: &Address,
        user: &Address,
        values: &[(FheType, u64)],
    ) -> Result<SealedInput, BackendError> {
        match self {
            Backend::Mock(b) => b.encrypt_input(contract, user, values).await,
            Backend::Relayer(b) => b.encrypt_input(contract, user, values).await,
        }
    }

    fn generate_keypair(&self) -> DecryptionKeypair {
        match self {
            Backend::Mock(b) => b.generate_keypair(),
            Backend::Relayer(b) => b.generate_keypair(),
        }
    }

    fn create_eip712(
        &self,
        public_key_hex: &str,
        contract_addresses: &[Address],
        start_timestamp: u64,
        duration_days: u32,
    ) -> Eip712Payload {
        match self {
            Backend::Mock(b) => {
                b.create_eip712(public_key_hex, contract_addresses, start_timestamp, duration_days)
            }
            Backend::Relayer(b) => {
                b.create_eip712(public_key_hex, contract_addresses, start_timestamp, duration_days)
            }
        }
    }

    async fn user_decrypt(
        &self,
        request: UserDecryptRequest<'_>,
    ) -> Result<HashMap<Handle, u64>, BackendError> {
        match self {
            Backend::Mock(b) => b.user_decrypt(request).await,
            Backend::Relayer(b) => b.user_decrypt(request).await,
        }
    }
}

// ============================================================================
// Encryption session
// ============================================================================

/// A ready-to-use backend bound to one chain.
pub struct EncryptionSession {
    chain_id: u64,
    backend: Backend,
}

impl EncryptionSession {
    pub fn new(backend: Backend) -> Self {
        Self {
            chain_id: backend.chain_id(),
            backend,
        }
    }

    /// Build the backend a descriptor calls for.
    pub async fn open(
        descriptor: &BackendDescriptor,
        connector: &Arc<dyn Connector>,
        relayer: Option<&RelayerSettings>,
    ) -> Result<Self, BackendError> {
        let backend = match descriptor {
            BackendDescriptor::Mock {
                chain_id,
                rpc_url,
                metadata,
            } => {
                let rpc = connector.connect(rpc_url)?;
                Backend::Mock(MockBackend::new(*chain_id, rpc, metadata.clone()))
            }
            BackendDescriptor::Production { chain_id } => {
                let settings = relayer
                    .filter(|settings| settings.serves(*chain_id))
                    .ok_or(BackendError::RelayerUnavailable {
                        chain_id: *chain_id,
                    })?;
                Backend::Relayer(RelayerBackend::connect(settings, *chain_id).await?)
            }
        };
        let session = Self::new(backend);
        info!(
            "Encryption session opened (chain={}, backend={:?})",
            session.chain_id,
            session.kind()
        );
        Ok(session)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn kind(&self) -> BackendKind {
        match self.backend {
            Backend::Mock(_) => BackendKind::Mock,
            Backend::Relayer(_) => BackendKind::Relayer,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

impl std::fmt::Debug for EncryptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionSession")
            .field("chain_id", &self.chain_id)
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::HttpConnector;

    #[tokio::test]
    async fn test_production_without_relayer_is_unavailable() {
        let connector: Arc<dyn Connector> = Arc::new(HttpConnector::default());
        let result = EncryptionSession::open(
            &BackendDescriptor::Production { chain_id: 11155111 },
            &connector,
            None,
        )
        .await;
        assert!(matches!(
            result,
            Err(BackendError::RelayerUnavailable { chain_id: 11155111 })
        ));
    }

    #[tokio::test]
    async fn test_relayer_for_other_chain_is_unavailable() {
        let connector: Arc<dyn Connector> = Arc::new(HttpConnector::default());
        let settings = RelayerSettings {
            chain_id: Some(11155111),
            ..RelayerSettings::new("http://relayer.invalid")
        };
        let result = EncryptionSession::open(
            &BackendDescriptor::Production { chain_id: 1 },
            &connector,
            Some(&settings),
        )
        .await;
        assert!(matches!(
            result,
            Err(BackendError::RelayerUnavailable { chain_id: 1 })
        ));
    }

    #[test]
    fn test_open_results_rejects_bad_hex() {
        let keypair = DecryptionKeypair::generate();
        let response = UserDecryptResponse {
            results: vec![ReencryptedValue {
                handle: Handle([1u8; 32]),
                payload: "0xnothex".into(),
            }],
        };
        assert!(matches!(
            open_results(&keypair, response),
            Err(BackendError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_open_results_roundtrip() {
        let keypair = DecryptionKeypair::generate();
        let payload = veil_coprocessor::reencrypt(9, &keypair.public_key).unwrap();
        let response = UserDecryptResponse {
            results: vec![ReencryptedValue {
                handle: Handle([1u8; 32]),
                payload: hex::encode(payload),
            }],
        };
        let values = open_results(&keypair, response).unwrap();
        assert_eq!(values.get(&Handle([1u8; 32])), Some(&9));
    }
}
