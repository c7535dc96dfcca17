//! Mock coprocessor backend for local development nodes.
//!
//! Inputs are sealed in-process with a key derived from the node's input
//! verifier address; decryption goes through the node's
//! `fhevm_mock_user_decrypt` RPC method, which checks the signed request and
//! returns values re-encrypted to the caller's key pair.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::debug;
use veil_coprocessor::{
    DecryptionKeypair, Eip712Payload, InputKey, SealedInput, seal_input, user_decrypt_request,
};
use veil_types::{Address, FheType, Handle};

use super::{BackendError, EncryptionBackend, UserDecryptRequest, UserDecryptResponse, open_results};
use crate::capability::MockMetadata;
use crate::rpc::{self, RpcTransport};

pub const USER_DECRYPT_METHOD: &str = "fhevm_mock_user_decrypt";

pub struct MockBackend {
    chain_id: u64,
    rpc: Arc<dyn RpcTransport>,
    metadata: MockMetadata,
    input_key: InputKey,
}

impl MockBackend {
    pub fn new(chain_id: u64, rpc: Arc<dyn RpcTransport>, metadata: MockMetadata) -> Self {
        let input_key = InputKey::derive(&metadata.input_verifier_address, chain_id);
        Self {
            chain_id,
            rpc,
            metadata,
            input_key,
        }
    }

    pub fn metadata(&self) -> &MockMetadata {
        &self.metadata
    }
}

impl EncryptionBackend for MockBackend {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn encrypt_input(
        &self,
        contract: &Address,
        user: &Address,
        values: &[(FheType, u64)],
    ) -> Result<SealedInput, BackendError> {
        let sealed = seal_input(&self.input_key, self.chain_id, contract, user, values)?;
        debug!(
            "Sealed {} value(s) for contract {} ({} byte proof)",
            sealed.handles.len(),
            contract,
            sealed.proof.len()
        );
        Ok(sealed)
    }

    fn generate_keypair(&self) -> DecryptionKeypair {
        DecryptionKeypair::generate()
    }

    fn create_eip712(
        &self,
        public_key_hex: &str,
        contract_addresses: &[Address],
        start_timestamp: u64,
        duration_days: u32,
    ) -> Eip712Payload {
        user_decrypt_request(
            &self.metadata.kms_verifier_address,
            self.chain_id,
            public_key_hex,
            contract_addresses,
            start_timestamp,
            duration_days,
        )
    }

    async fn user_decrypt(
        &self,
        request: UserDecryptRequest<'_>,
    ) -> Result<HashMap<Handle, u64>, BackendError> {
        let wire = request.to_wire();
        let params = serde_json::to_value(&wire)
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        let response: UserDecryptResponse =
            rpc::call(self.rpc.as_ref(), USER_DECRYPT_METHOD, json!([params])).await?;
        open_results(request.keypair, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::Value;
    use std::sync::Mutex;
    use veil_coprocessor::open_input;

    use crate::rpc::RpcError;

    fn metadata() -> MockMetadata {
        MockMetadata {
            acl_address: Address([1u8; 20]),
            input_verifier_address: Address([2u8; 20]),
            kms_verifier_address: Address([3u8; 20]),
        }
    }

    /// Answers every user decryption with a fixed value per handle.
    struct EchoNode {
        value: u64,
        seen: Mutex<Vec<Value>>,
    }

    impl RpcTransport for EchoNode {
        fn request<'a>(
            &'a self,
            method: &'a str,
            params: Value,
        ) -> BoxFuture<'a, Result<Value, RpcError>> {
            Box::pin(async move {
                if method != USER_DECRYPT_METHOD {
                    return Err(RpcError::method_not_found(method));
                }
                self.seen.lock().unwrap().push(params.clone());
                let wire: super::super::UserDecryptWire =
                    serde_json::from_value(params[0].clone()).unwrap();
                let pk_bytes = hex::decode(wire.public_key.trim_start_matches("0x")).unwrap();
                let mut pk = [0u8; 32];
                pk.copy_from_slice(&pk_bytes);
                let results: Vec<Value> = wire
                    .handle_contract_pairs
                    .iter()
                    .map(|pair| {
                        let payload = veil_coprocessor::reencrypt(self.value, &pk).unwrap();
                        json!({ "handle": pair.handle, "payload": hex::encode(payload) })
                    })
                    .collect();
                Ok(json!({ "results": results }))
            })
        }
    }

    #[tokio::test]
    async fn test_encrypt_input_opens_with_node_key() {
        let node = Arc::new(EchoNode {
            value: 0,
            seen: Mutex::new(Vec::new()),
        });
        let backend = MockBackend::new(31337, node, metadata());
        let contract = Address([9u8; 20]);
        let user = Address([8u8; 20]);

        let sealed = backend
            .encrypt_input(&contract, &user, &[(FheType::Euint8, 2)])
            .await
            .unwrap();
        assert_eq!(sealed.handles.len(), 1);

        let key = InputKey::derive(&metadata().input_verifier_address, 31337);
        let opened = open_input(&key, 31337, &contract, &user, &sealed.proof).unwrap();
        assert_eq!(opened[0].2, 2);
    }

    #[test]
    fn test_eip712_uses_kms_verifier() {
        let node = Arc::new(EchoNode {
            value: 0,
            seen: Mutex::new(Vec::new()),
        });
        let backend = MockBackend::new(31337, node, metadata());
        let payload = backend.create_eip712("0xab", &[Address([9u8; 20])], 100, 365);
        assert_eq!(
            payload.domain["verifyingContract"],
            Address([3u8; 20]).to_string()
        );
        assert_eq!(payload.domain["chainId"], 31337);
    }

    #[tokio::test]
    async fn test_user_decrypt_roundtrip() {
        let node = Arc::new(EchoNode {
            value: 5,
            seen: Mutex::new(Vec::new()),
        });
        let backend = MockBackend::new(31337, node.clone(), metadata());
        let keypair = backend.generate_keypair();
        let contract = Address([9u8; 20]);
        let user = Address([8u8; 20]);
        let pairs = [super::super::HandleContractPair {
            handle: Handle([4u8; 32]),
            contract_address: contract,
        }];

        let values = backend
            .user_decrypt(UserDecryptRequest {
                handles: &pairs,
                keypair: &keypair,
                signature: &[1, 2, 3],
                contract_addresses: &[contract],
                user_address: &user,
                start_timestamp: 10,
                duration_days: 365,
            })
            .await
            .unwrap();

        assert_eq!(values.get(&Handle([4u8; 32])), Some(&5));
        let seen = node.seen.lock().unwrap();
        assert_eq!(seen[0][0]["signature"], "0x010203");
        assert_eq!(seen[0][0]["durationDays"], 365);
    }
}
