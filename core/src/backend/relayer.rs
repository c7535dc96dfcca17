//! Relayer backend for production networks.
//!
//! ```text
//! ┌──────────────┐  GET  /v1/keys          ┌──────────────┐
//! │ VeilClient   │ ──────────────────────▶ │   Relayer    │
//! │              │  POST /v1/input-proof   │              │
//! │              │ ──────────────────────▶ │  (gateway +  │
//! │              │  POST /v1/user-decrypt  │   KMS)       │
//! │              │ ──────────────────────▶ │              │
//! └──────────────┘                         └──────────────┘
//! ```
//!
//! Every response is wrapped in `{"status": "success", "data": ...}` or
//! `{"status": "error", "message": ..., "code": ...}`.

use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use veil_config::RelayerConfig;
use veil_coprocessor::{
    DecryptionKeypair, Eip712Payload, SealedInput, reencrypt, user_decrypt_request,
};
use veil_types::{Address, FheType, Handle};

use super::{
    BackendError, EncryptionBackend, UserDecryptRequest, UserDecryptResponse, decode_hex,
    open_results,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayerSettings {
    pub url: String,
    pub timeout: Duration,
    /// Chain the relayer serves; `None` accepts whatever its keys report
    pub chain_id: Option<u64>,
}

impl RelayerSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(30),
            chain_id: None,
        }
    }

    /// `None` when no relayer URL is configured.
    pub fn from_config(config: &RelayerConfig) -> Option<Self> {
        config.url.as_ref().map(|url| Self {
            url: url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            chain_id: Some(config.chain_id),
        })
    }

    pub fn serves(&self, chain_id: u64) -> bool {
        self.chain_id.is_none_or(|served| served == chain_id)
    }
}

/// API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ApiResponse<T> {
    Success {
        data: T,
    },
    Error {
        message: String,
        code: Option<String>,
    },
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, BackendError> {
        match self {
            ApiResponse::Success { data } => Ok(data),
            ApiResponse::Error { message, code } => Err(BackendError::Relayer(format!(
                "({}): {}",
                code.unwrap_or_else(|| "unknown".to_string()),
                message
            ))),
        }
    }
}

/// Public material the relayer publishes for one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayerKeys {
    pub chain_id: u64,
    /// X25519 key inputs are encrypted to (hex)
    pub encryption_key: String,
    pub acl_address: Address,
    pub input_verifier_address: Address,
    pub kms_verifier_address: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputValue {
    pub fhe_type: FheType,
    /// Value encrypted to the relayer key (hex)
    pub ciphertext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputProofRequest {
    pub chain_id: u64,
    pub contract_address: Address,
    pub user_address: Address,
    pub values: Vec<InputValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputProofResponse {
    pub handles: Vec<Handle>,
    pub input_proof: String,
}

pub struct RelayerBackend {
    settings: RelayerSettings,
    client: reqwest::Client,
    keys: RelayerKeys,
    encryption_key: [u8; 32],
}

impl RelayerBackend {
    /// Fetch the relayer's keys for `chain_id`.
    pub async fn connect(settings: &RelayerSettings, chain_id: u64) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| BackendError::Relayer(e.to_string()))?;

        let url = format!("{}/v1/keys?chainId={}", settings.url, chain_id);
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::Relayer(format!("failed to reach relayer: {}", e)))?;
        let keys: RelayerKeys = read_envelope(response).await?;

        if keys.chain_id != chain_id {
            return Err(BackendError::InvalidResponse(format!(
                "relayer serves chain {}, expected {}",
                keys.chain_id, chain_id
            )));
        }
        let encryption_key = parse_key(&keys.encryption_key)?;

        info!("Connected to relayer {} (chain={})", settings.url, chain_id);
        Ok(Self {
            settings: settings.clone(),
            client,
            keys,
            encryption_key,
        })
    }

    pub fn keys(&self) -> &RelayerKeys {
        &self.keys
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        let url = format!("{}{}", self.settings.url, path);
        debug!("relayer POST {}", url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Relayer(format!("failed to reach relayer: {}", e)))?;
        read_envelope(response).await
    }

    fn build_input_request(
        &self,
        contract: &Address,
        user: &Address,
        values: &[(FheType, u64)],
    ) -> Result<InputProofRequest, BackendError> {
        let values = values
            .iter()
            .map(|(fhe_type, value)| {
                let ciphertext = reencrypt(*value, &self.encryption_key)?;
                Ok(InputValue {
                    fhe_type: *fhe_type,
                    ciphertext: hex::encode(ciphertext),
                })
            })
            .collect::<Result<Vec<_>, BackendError>>()?;

        Ok(InputProofRequest {
            chain_id: self.keys.chain_id,
            contract_address: *contract,
            user_address: *user,
            values,
        })
    }
}

async fn read_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, BackendError> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Relayer(format!(
            "relayer returned {}: {}",
            status, body
        )));
    }
    let envelope: ApiResponse<T> = response
        .json()
        .await
        .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
    envelope.into_result()
}

fn parse_key(hex_key: &str) -> Result<[u8; 32], BackendError> {
    let bytes = decode_hex("encryptionKey", hex_key)?;
    bytes
        .try_into()
        .map_err(|_| BackendError::InvalidResponse("encryptionKey must be 32 bytes".into()))
}

impl EncryptionBackend for RelayerBackend {
    fn chain_id(&self) -> u64 {
        self.keys.chain_id
    }

    async fn encrypt_input(
        &self,
        contract: &Address,
        user: &Address,
        values: &[(FheType, u64)],
    ) -> Result<SealedInput, BackendError> {
        let request = self.build_input_request(contract, user, values)?;
        let response: InputProofResponse = self.post("/v1/input-proof", &request).await?;

        if response.handles.len() != values.len() {
            return Err(BackendError::InvalidResponse(format!(
                "relayer returned {} handle(s) for {} value(s)",
                response.handles.len(),
                values.len()
            )));
        }
        Ok(SealedInput {
            handles: response.handles,
            proof: decode_hex("inputProof", &response.input_proof)?,
        })
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
            &self.keys.kms_verifier_address,
            self.keys.chain_id,
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
        let response: UserDecryptResponse = self.post("/v1/user-decrypt", &wire).await?;
        open_results(request.keypair, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_coprocessor::open_reencrypted;

    fn backend_with(keypair: &DecryptionKeypair) -> RelayerBackend {
        RelayerBackend {
            settings: RelayerSettings::new("http://relayer.invalid"),
            client: reqwest::Client::new(),
            keys: RelayerKeys {
                chain_id: 11155111,
                encryption_key: keypair.public_key_hex(),
                acl_address: Address([1u8; 20]),
                input_verifier_address: Address([2u8; 20]),
                kms_verifier_address: Address([3u8; 20]),
            },
            encryption_key: keypair.public_key,
        }
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = RelayerConfig::default();
        assert!(RelayerSettings::from_config(&config).is_none());

        config.url = Some("https://relayer.example/".into());
        config.timeout_secs = 5;
        let settings = RelayerSettings::from_config(&config).unwrap();
        assert_eq!(settings.url, "https://relayer.example");
        assert_eq!(settings.timeout, Duration::from_secs(5));
        assert_eq!(settings.chain_id, Some(11155111));
        assert!(settings.serves(11155111));
        assert!(!settings.serves(1));
        assert!(RelayerSettings::new("http://relayer.invalid").serves(1));
    }

    #[test]
    fn test_input_request_encrypts_to_relayer_key() {
        let relayer_key = DecryptionKeypair::generate();
        let backend = backend_with(&relayer_key);

        let request = backend
            .build_input_request(
                &Address([9u8; 20]),
                &Address([8u8; 20]),
                &[(FheType::Euint8, 1), (FheType::Ebool, 1)],
            )
            .unwrap();

        assert_eq!(request.chain_id, 11155111);
        assert_eq!(request.values.len(), 2);
        assert_eq!(request.values[1].fhe_type, FheType::Ebool);
        let ct = hex::decode(&request.values[0].ciphertext).unwrap();
        assert_eq!(open_reencrypted(&relayer_key, &ct).unwrap(), 1);
    }

    #[test]
    fn test_api_response_envelope() {
        let ok: ApiResponse<u64> =
            serde_json::from_str(r#"{"status":"success","data":7}"#).unwrap();
        assert_eq!(ok.into_result().unwrap(), 7);

        let err: ApiResponse<u64> =
            serde_json::from_str(r#"{"status":"error","message":"denied","code":"ACL"}"#)
                .unwrap();
        match err.into_result() {
            Err(BackendError::Relayer(msg)) => assert!(msg.contains("ACL")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_eip712_targets_relayer_chain() {
        let backend = backend_with(&DecryptionKeypair::generate());
        let payload = backend.create_eip712("0xab", &[Address([9u8; 20])], 100, 365);
        assert_eq!(payload.domain["chainId"], 11155111);
    }
}
