//! JSON-RPC methods the dev chain answers.

use futures::future::BoxFuture;
use serde_json::{Value, json};
use tracing::debug;
use veil_coprocessor::{Eip712Payload, reencrypt, user_decrypt_request};
use veil_types::Address;

use super::DevChain;
use crate::backend::{ReencryptedValue, UserDecryptResponse, UserDecryptWire};
use crate::backend::mock::USER_DECRYPT_METHOD;
use crate::rpc::{RpcError, RpcTransport};
use crate::wallet::verify_dev_signature;

const SECONDS_PER_DAY: u64 = 86_400;

fn rejected(message: impl Into<String>) -> RpcError {
    RpcError::Remote {
        code: -32000,
        message: message.into(),
    }
}

fn invalid_params(message: impl Into<String>) -> RpcError {
    RpcError::Remote {
        code: -32602,
        message: message.into(),
    }
}

impl DevChain {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let hang = {
            let mut state = self.state.lock().await;
            *state.requests.entry(method.to_string()).or_default() += 1;
            state.hang_on.contains(method)
        };
        if hang {
            debug!("dev chain: {} hangs", method);
            return futures::future::pending().await;
        }

        match method {
            "eth_chainId" => Ok(json!(format!("0x{:x}", self.config.chain_id))),
            "web3_clientVersion" => Ok(json!(self.config.client_version)),
            "fhevm_relayer_metadata" => Ok(self
                .config
                .metadata_override
                .clone()
                .unwrap_or_else(|| json!(self.metadata))),
            "eth_accounts" | "eth_requestAccounts" => {
                let accounts: Vec<Address> = self.wallets.iter().map(|w| w.address()).collect();
                Ok(json!(accounts))
            }
            "eth_signTypedData_v4" => self.sign_typed_data(params),
            USER_DECRYPT_METHOD => self.user_decrypt(params).await,
            other => Err(RpcError::method_not_found(other)),
        }
    }

    fn sign_typed_data(&self, params: Value) -> Result<Value, RpcError> {
        let account: Address = serde_json::from_value(params[0].clone())
            .map_err(|e| invalid_params(e.to_string()))?;
        let typed_data = params[1]
            .as_str()
            .ok_or_else(|| invalid_params("typed data must be a JSON string"))?;
        let payload: Eip712Payload =
            serde_json::from_str(typed_data).map_err(|e| invalid_params(e.to_string()))?;

        let wallet = self
            .wallets
            .iter()
            .find(|w| w.address() == account)
            .ok_or_else(|| rejected(format!("unknown account {}", account)))?;
        let signature = wallet.sign(&payload).map_err(|e| rejected(e.to_string()))?;
        Ok(json!(format!("0x{}", hex::encode(signature))))
    }

    async fn user_decrypt(&self, params: Value) -> Result<Value, RpcError> {
        let request: UserDecryptWire = serde_json::from_value(params[0].clone())
            .map_err(|e| invalid_params(e.to_string()))?;

        let public_key: [u8; 32] = hex::decode(request.public_key.trim_start_matches("0x"))
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| invalid_params("publicKey must be 32 bytes of hex"))?;
        let signature = hex::decode(request.signature.trim_start_matches("0x"))
            .map_err(|e| invalid_params(e.to_string()))?;

        // The signature must cover exactly the request being made.
        let payload = user_decrypt_request(
            &self.metadata.kms_verifier_address,
            self.config.chain_id,
            &request.public_key,
            &request.contract_addresses,
            request.start_timestamp,
            request.duration_days,
        );
        let signer = verify_dev_signature(&payload, &signature)
            .map_err(|e| rejected(e.to_string()))?;
        if signer != request.user_address {
            return Err(rejected("signature does not match userAddress"));
        }

        let now = self.clock.now();
        let expires_at = request
            .start_timestamp
            .saturating_add(u64::from(request.duration_days) * SECONDS_PER_DAY);
        if now < request.start_timestamp || now >= expires_at {
            return Err(rejected("user decryption request expired"));
        }

        let state = self.state.lock().await;
        let mut results = Vec::with_capacity(request.handle_contract_pairs.len());
        for pair in &request.handle_contract_pairs {
            if !request.contract_addresses.contains(&pair.contract_address) {
                return Err(rejected(format!(
                    "contract {} not in signed contract list",
                    pair.contract_address
                )));
            }
            if !state.store.is_allowed(&pair.handle, &request.user_address) {
                return Err(rejected(format!(
                    "{} is not allowed to decrypt {}",
                    request.user_address, pair.handle
                )));
            }
            let (_, value) = state
                .store
                .cleartext(&pair.handle)
                .map_err(|e| rejected(e.to_string()))?;
            let payload = reencrypt(value, &public_key).map_err(|e| rejected(e.to_string()))?;
            results.push(ReencryptedValue {
                handle: pair.handle,
                payload: hex::encode(payload),
            });
        }

        serde_json::to_value(UserDecryptResponse { results })
            .map_err(|e| RpcError::InvalidResponse(e.to_string()))
    }
}

impl RpcTransport for DevChain {
    fn request<'a>(&'a self, method: &'a str, params: Value) -> BoxFuture<'a, Result<Value, RpcError>> {
        Box::pin(self.dispatch(method, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{self, parse_quantity};

    #[tokio::test]
    async fn test_node_identity() {
        let chain = DevChain::default();
        let id = chain.request("eth_chainId", json!([])).await.unwrap();
        assert_eq!(parse_quantity(&id).unwrap(), 31337);

        let version: String = rpc::call(&chain, "web3_clientVersion", json!([])).await.unwrap();
        assert!(version.starts_with("HardhatNetwork/"));

        let metadata = chain.request("fhevm_relayer_metadata", json!([])).await.unwrap();
        assert_eq!(
            metadata["KMSVerifierAddress"],
            chain.metadata().kms_verifier_address.to_string()
        );
        assert_eq!(chain.request_count("eth_chainId").await, 1);
    }

    #[tokio::test]
    async fn test_sign_typed_data_for_dev_account() {
        let chain = DevChain::default();
        let account = chain.wallets()[0].address();
        let payload = user_decrypt_request(
            &chain.metadata().kms_verifier_address,
            31337,
            "0xab",
            &[chain.ledger_address()],
            0,
            365,
        );
        let typed_data = serde_json::to_string(&payload).unwrap();

        let signature: String = rpc::call(
            &chain,
            "eth_signTypedData_v4",
            json!([account, typed_data]),
        )
        .await
        .unwrap();
        let bytes = hex::decode(signature.trim_start_matches("0x")).unwrap();
        assert_eq!(verify_dev_signature(&payload, &bytes).unwrap(), account);

        let err = chain
            .request("eth_signTypedData_v4", json!([Address([0xee; 20]), "{}"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote { .. }));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let chain = DevChain::default();
        let err = chain.request("eth_mining", json!([])).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote { code: -32601, .. }));
    }
}
