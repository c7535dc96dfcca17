//! Decryption authorization
//!
//! ```text
//!  signer.address() ──▶ now, 365 days ──▶ fresh key pair
//!                                              │
//!        DecryptionGrant ◀── signature ◀── EIP-712 payload (from backend)
//! ```
//!
//! A grant is built in one go or not at all. It lives in memory only: it is
//! neither `Clone` nor serializable, and its `Debug` output omits the key
//! pair and signature.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info};
use veil_coprocessor::{DecryptionKeypair, USER_DECRYPT_PRIMARY_TYPE};
use veil_types::{Address, Handle};

use crate::backend::{
    BackendError, EncryptionBackend, EncryptionSession, HandleContractPair, UserDecryptRequest,
};
use crate::clock::Clock;
use crate::wallet::{TypedDataSigner, WalletError};

/// Validity of every grant, in days.
pub const GRANT_DURATION_DAYS: u32 = 365;

const SECONDS_PER_DAY: u64 = 86_400;

/// Step of the authorization flow that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    SignerAddress,
    TypedData,
    Signature,
}

impl std::fmt::Display for AuthStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuthStep::SignerAddress => "reading signer address",
            AuthStep::TypedData => "building typed data",
            AuthStep::Signature => "signing typed data",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("authorization failed while {step}: {reason}; re-authorize to continue")]
    Failed { step: AuthStep, reason: String },
}

impl AuthorizationError {
    fn at(step: AuthStep, reason: impl ToString) -> Self {
        AuthorizationError::Failed {
            step,
            reason: reason.to_string(),
        }
    }

    pub fn step(&self) -> AuthStep {
        match self {
            AuthorizationError::Failed { step, .. } => *step,
        }
    }

    /// The signer declined to sign.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AuthorizationError::Failed {
                step: AuthStep::Signature,
                reason,
            } if reason.contains("rejected")
        )
    }
}

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("decryption grant is outside its validity window (now {now}, valid {start}..{expires_at}); re-authorize")]
    GrantExpired { now: u64, start: u64, expires_at: u64 },

    #[error("contract {0} is not covered by the decryption grant; re-authorize for it")]
    UnauthorizedContract(Address),

    #[error("backend returned no value for handle {0}")]
    MissingResult(Handle),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Signed, time-boxed permission to decrypt handles of a set of contracts.
pub struct DecryptionGrant {
    keypair: DecryptionKeypair,
    signature: Vec<u8>,
    start_timestamp: u64,
    duration_days: u32,
    user_address: Address,
    contract_addresses: Vec<Address>,
}

impl DecryptionGrant {
    pub fn user_address(&self) -> &Address {
        &self.user_address
    }

    pub fn contract_addresses(&self) -> &[Address] {
        &self.contract_addresses
    }

    pub fn start_timestamp(&self) -> u64 {
        self.start_timestamp
    }

    pub fn duration_days(&self) -> u32 {
        self.duration_days
    }

    pub fn expires_at(&self) -> u64 {
        self.start_timestamp
            .saturating_add(u64::from(self.duration_days) * SECONDS_PER_DAY)
    }

    pub fn is_valid_at(&self, now: u64) -> bool {
        now >= self.start_timestamp && now < self.expires_at()
    }

    pub fn authorizes(&self, contract: &Address) -> bool {
        self.contract_addresses.contains(contract)
    }

    pub fn public_key_hex(&self) -> String {
        self.keypair.public_key_hex()
    }
}

impl std::fmt::Debug for DecryptionGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionGrant")
            .field("user_address", &self.user_address)
            .field("contract_addresses", &self.contract_addresses)
            .field("start_timestamp", &self.start_timestamp)
            .field("duration_days", &self.duration_days)
            .finish_non_exhaustive()
    }
}

/// Authorize decryption of `contract`'s handles for `signer`.
pub async fn authorize<S: TypedDataSigner>(
    session: &EncryptionSession,
    contract: Address,
    signer: &S,
    clock: &dyn Clock,
) -> Result<DecryptionGrant, AuthorizationError> {
    authorize_for(session, &[contract], signer, clock).await
}

/// Same as [`authorize`] for several contracts at once.
pub async fn authorize_for<S: TypedDataSigner>(
    session: &EncryptionSession,
    contracts: &[Address],
    signer: &S,
    clock: &dyn Clock,
) -> Result<DecryptionGrant, AuthorizationError> {
    let user_address = signer
        .address()
        .await
        .map_err(|e| AuthorizationError::at(AuthStep::SignerAddress, e))?;

    let start_timestamp = clock.now();
    let duration_days = GRANT_DURATION_DAYS;

    let keypair = session.backend().generate_keypair();

    if contracts.is_empty() {
        return Err(AuthorizationError::at(
            AuthStep::TypedData,
            "no contract addresses to authorize",
        ));
    }
    let payload = session.backend().create_eip712(
        &keypair.public_key_hex(),
        contracts,
        start_timestamp,
        duration_days,
    );
    if payload.primary_type != USER_DECRYPT_PRIMARY_TYPE || payload.primary_fields().is_none() {
        return Err(AuthorizationError::at(
            AuthStep::TypedData,
            format!("unexpected primary type {}", payload.primary_type),
        ));
    }

    let signature = signer
        .sign_typed_data(&payload)
        .await
        .map_err(|e: WalletError| AuthorizationError::at(AuthStep::Signature, e))?;

    info!(
        "Decryption authorized for {} ({} contract(s), {} days)",
        user_address,
        contracts.len(),
        duration_days
    );
    Ok(DecryptionGrant {
        keypair,
        signature,
        start_timestamp,
        duration_days,
        user_address,
        contract_addresses: contracts.to_vec(),
    })
}

/// Decrypt `handles` with `grant`. Every handle's contract must be covered.
pub async fn decrypt(
    session: &EncryptionSession,
    grant: &DecryptionGrant,
    handles: &[HandleContractPair],
    clock: &dyn Clock,
) -> Result<HashMap<Handle, u64>, DecryptError> {
    let now = clock.now();
    if !grant.is_valid_at(now) {
        return Err(DecryptError::GrantExpired {
            now,
            start: grant.start_timestamp,
            expires_at: grant.expires_at(),
        });
    }
    if let Some(pair) = handles.iter().find(|p| !grant.authorizes(&p.contract_address)) {
        return Err(DecryptError::UnauthorizedContract(pair.contract_address));
    }
    if handles.is_empty() {
        return Ok(HashMap::new());
    }

    debug!("Decrypting {} handle(s)", handles.len());
    let values = session
        .backend()
        .user_decrypt(UserDecryptRequest {
            handles,
            keypair: &grant.keypair,
            signature: &grant.signature,
            contract_addresses: &grant.contract_addresses,
            user_address: &grant.user_address,
            start_timestamp: grant.start_timestamp,
            duration_days: grant.duration_days,
        })
        .await?;

    if let Some(missing) = handles.iter().find(|p| !values.contains_key(&p.handle)) {
        return Err(DecryptError::MissingResult(missing.handle));
    }
    Ok(values)
}
