//! EIP-712 payload for user decryption requests.
//!
//! The payload is produced by the backend and must reach the signer exactly
//! as built; [`Eip712Payload::signing_bytes`] is the canonical encoding that
//! signers sign and verifiers check.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use veil_types::Address;

use crate::CoprocessorError;

pub const USER_DECRYPT_PRIMARY_TYPE: &str = "UserDecryptRequestVerification";

const DOMAIN_NAME: &str = "Decryption";
const DOMAIN_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip712Payload {
    pub domain: Value,
    pub types: Value,
    pub primary_type: String,
    pub message: Value,
}

impl Eip712Payload {
    /// Canonical JSON encoding of the full structured message.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CoprocessorError> {
        serde_json::to_vec(self).map_err(|e| CoprocessorError::Encoding(e.to_string()))
    }

    /// Field list of the primary type, if present.
    pub fn primary_fields(&self) -> Option<&Vec<Value>> {
        self.types.get(&self.primary_type)?.as_array()
    }
}

/// Build the `UserDecryptRequestVerification` payload.
pub fn user_decrypt_request(
    verifying_contract: &Address,
    chain_id: u64,
    public_key_hex: &str,
    contract_addresses: &[Address],
    start_timestamp: u64,
    duration_days: u32,
) -> Eip712Payload {
    let contracts: Vec<String> = contract_addresses.iter().map(|a| a.to_string()).collect();

    Eip712Payload {
        domain: json!({
            "name": DOMAIN_NAME,
            "version": DOMAIN_VERSION,
            "chainId": chain_id,
            "verifyingContract": verifying_contract.to_string(),
        }),
        types: json!({
            "EIP712Domain": [
                { "name": "name", "type": "string" },
                { "name": "version", "type": "string" },
                { "name": "chainId", "type": "uint256" },
                { "name": "verifyingContract", "type": "address" },
            ],
            USER_DECRYPT_PRIMARY_TYPE: [
                { "name": "publicKey", "type": "bytes" },
                { "name": "contractAddresses", "type": "address[]" },
                { "name": "startTimestamp", "type": "uint256" },
                { "name": "durationDays", "type": "uint256" },
                { "name": "extraData", "type": "bytes" },
            ],
        }),
        primary_type: USER_DECRYPT_PRIMARY_TYPE.to_string(),
        message: json!({
            "publicKey": public_key_hex,
            "contractAddresses": contracts,
            "startTimestamp": start_timestamp.to_string(),
            "durationDays": duration_days.to_string(),
            "extraData": "0x00",
        }),
    }
}
