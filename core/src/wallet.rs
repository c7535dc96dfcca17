//! Wallet glue
//!
//! Signers produce EIP-712 signatures over the payload exactly as the
//! backend built it. [`RpcWallet`] forwards to an injected provider via
//! `eth_signTypedData_v4`; [`DevWallet`] holds a local ed25519 key and is
//! what the dev chain's accounts sign with.
//!
//! [`WalletConnector`] reproduces the connect / auto-connect / disconnect
//! flow, with "was connected before" kept in an explicit [`ConnectionStore`]
//! (written on connect, cleared on disconnect).

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};
use veil_coprocessor::Eip712Payload;
use veil_types::Address;

use crate::rpc::{self, RpcError, RpcTransport, parse_quantity};

/// EIP-1193 "user rejected the request".
const USER_REJECTED_CODE: i64 = 4001;

const DEV_SIGNATURE_LEN: usize = 32 + 64;

#[derive(Debug, Clone, Error)]
pub enum WalletError {
    #[error("request rejected by user: {0}")]
    Rejected(String),

    #[error("wallet exposes no accounts")]
    NoAccounts,

    #[error("account {0} is not managed by this wallet")]
    UnknownAccount(Address),

    #[error("wallet switched from {expected} to {current}")]
    AccountChanged { expected: Address, current: Address },

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error(transparent)]
    Rpc(RpcError),

    #[error("connection store error: {0}")]
    Store(String),

    #[error("typed data could not be encoded: {0}")]
    Payload(String),
}

impl From<RpcError> for WalletError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote { code, message } if code == USER_REJECTED_CODE => {
                WalletError::Rejected(message)
            }
            other => WalletError::Rpc(other),
        }
    }
}

/// Anything that can sign an EIP-712 payload on behalf of one account.
pub trait TypedDataSigner: Send + Sync {
    fn address(&self) -> impl Future<Output = Result<Address, WalletError>> + Send;

    /// Sign the full structured message.
    fn sign_typed_data(
        &self,
        payload: &Eip712Payload,
    ) -> impl Future<Output = Result<Vec<u8>, WalletError>> + Send;
}

// ============================================================================
// Dev wallet
// ============================================================================

/// Local ed25519 account. Signatures are `pubkey || sig` over the payload's
/// canonical encoding.
#[derive(Clone)]
pub struct DevWallet {
    signing_key: SigningKey,
}

impl DevWallet {
    pub fn new_random() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn address(&self) -> Address {
        dev_address(&self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, payload: &Eip712Payload) -> Result<Vec<u8>, WalletError> {
        let signature = self.signing_key.sign(&signing_bytes(payload)?);
        let mut out = Vec::with_capacity(DEV_SIGNATURE_LEN);
        out.extend_from_slice(&self.signing_key.verifying_key().to_bytes());
        out.extend_from_slice(&signature.to_bytes());
        Ok(out)
    }
}

impl std::fmt::Debug for DevWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevWallet")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl TypedDataSigner for DevWallet {
    async fn address(&self) -> Result<Address, WalletError> {
        Ok(DevWallet::address(self))
    }

    async fn sign_typed_data(&self, payload: &Eip712Payload) -> Result<Vec<u8>, WalletError> {
        self.sign(payload)
    }
}

fn signing_bytes(payload: &Eip712Payload) -> Result<Vec<u8>, WalletError> {
    payload
        .signing_bytes()
        .map_err(|e| WalletError::Payload(e.to_string()))
}

/// Address of a dev account: last 20 bytes of blake3(pubkey).
pub fn dev_address(public_key: &[u8; 32]) -> Address {
    Address::from_digest(blake3::hash(public_key).as_bytes())
}

/// Check a dev-wallet signature and return the signing address.
pub fn verify_dev_signature(
    payload: &Eip712Payload,
    signature: &[u8],
) -> Result<Address, WalletError> {
    if signature.len() != DEV_SIGNATURE_LEN {
        return Err(WalletError::InvalidSignature(format!(
            "expected {} bytes, got {}",
            DEV_SIGNATURE_LEN,
            signature.len()
        )));
    }
    let (pk_bytes, sig_bytes) = signature.split_at(32);
    let mut pk = [0u8; 32];
    pk.copy_from_slice(pk_bytes);
    let mut sig = [0u8; 64];
    sig.copy_from_slice(sig_bytes);

    let verifying_key =
        VerifyingKey::from_bytes(&pk).map_err(|e| WalletError::InvalidSignature(e.to_string()))?;
    verifying_key
        .verify(&signing_bytes(payload)?, &Signature::from_bytes(&sig))
        .map_err(|e| WalletError::InvalidSignature(e.to_string()))?;
    Ok(dev_address(&pk))
}

// ============================================================================
// Provider-backed wallet
// ============================================================================

/// Account behind an EIP-1193 style provider.
#[derive(Clone)]
pub struct RpcWallet {
    transport: Arc<dyn RpcTransport>,
    account: Address,
}

impl RpcWallet {
    pub fn new(transport: Arc<dyn RpcTransport>, account: Address) -> Self {
        Self { transport, account }
    }
}

impl std::fmt::Debug for RpcWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcWallet")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

impl TypedDataSigner for RpcWallet {
    /// The bound account, confirmed against the provider's current selection.
    async fn address(&self) -> Result<Address, WalletError> {
        let accounts: Vec<Address> =
            rpc::call(self.transport.as_ref(), "eth_accounts", json!([])).await?;
        match accounts.first() {
            None => Err(WalletError::NoAccounts),
            Some(current) if *current != self.account => Err(WalletError::AccountChanged {
                expected: self.account,
                current: *current,
            }),
            Some(_) => Ok(self.account),
        }
    }

    async fn sign_typed_data(&self, payload: &Eip712Payload) -> Result<Vec<u8>, WalletError> {
        // eth_signTypedData_v4 takes the typed data as a JSON string.
        let typed_data =
            serde_json::to_string(payload).map_err(|e| WalletError::Payload(e.to_string()))?;
        let signature: String = rpc::call(
            self.transport.as_ref(),
            "eth_signTypedData_v4",
            json!([self.account, typed_data]),
        )
        .await?;
        hex::decode(signature.trim_start_matches("0x"))
            .map_err(|e| WalletError::InvalidSignature(e.to_string()))
    }
}

// ============================================================================
// Connection persistence
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConnection {
    pub connected: bool,
    #[serde(default)]
    pub address: Option<Address>,
}

/// "Remember last connection" as a JSON file.
#[derive(Debug, Clone)]
pub struct ConnectionStore {
    path: PathBuf,
}

impl ConnectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the configured path, or `None` when remembering is disabled.
    pub fn from_config(config: &veil_config::VeilConfig) -> Option<Self> {
        if !config.wallet.remember_connection {
            return None;
        }
        config.connection_store_path().map(Self::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable files read as "not connected".
    pub fn load(&self) -> StoredConnection {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or_default()
    }

    pub fn was_connected(&self) -> bool {
        self.load().connected
    }

    pub fn remember(&self, address: Address) -> Result<(), WalletError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| WalletError::Store(e.to_string()))?;
        }
        let record = StoredConnection {
            connected: true,
            address: Some(address),
        };
        let contents = serde_json::to_string_pretty(&record)
            .map_err(|e| WalletError::Store(e.to_string()))?;
        fs::write(&self.path, contents).map_err(|e| WalletError::Store(e.to_string()))
    }

    pub fn forget(&self) -> Result<(), WalletError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WalletError::Store(e.to_string())),
        }
    }
}

// ============================================================================
// Connector
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletConnection {
    pub address: Address,
    pub chain_id: u64,
}

pub struct WalletConnector {
    transport: Arc<dyn RpcTransport>,
    store: Option<ConnectionStore>,
}

impl WalletConnector {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            transport,
            store: None,
        }
    }

    pub fn with_store(mut self, store: ConnectionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(&self) -> Arc<dyn RpcTransport> {
        self.transport.clone()
    }

    /// Prompting connect (`eth_requestAccounts`). No accounts is an error here.
    pub async fn connect(&self) -> Result<WalletConnection, WalletError> {
        self.establish("eth_requestAccounts")
            .await?
            .ok_or(WalletError::NoAccounts)
    }

    /// Silent reconnect (`eth_accounts`), only if a previous connection was
    /// remembered. `Ok(None)` means "not connected".
    pub async fn auto_connect(&self) -> Result<Option<WalletConnection>, WalletError> {
        let remembered = self.store.as_ref().is_some_and(|s| s.was_connected());
        if !remembered {
            debug!("No remembered wallet connection, skipping auto-connect");
            return Ok(None);
        }
        self.establish("eth_accounts").await
    }

    pub fn disconnect(&self) -> Result<(), WalletError> {
        if let Some(store) = &self.store {
            store.forget()?;
        }
        info!("Wallet disconnected");
        Ok(())
    }

    pub fn signer(&self, connection: &WalletConnection) -> RpcWallet {
        RpcWallet::new(self.transport.clone(), connection.address)
    }

    async fn establish(&self, method: &str) -> Result<Option<WalletConnection>, WalletError> {
        let accounts: Vec<Address> = rpc::call(self.transport.as_ref(), method, json!([])).await?;
        let Some(address) = accounts.first().copied() else {
            debug!("{} returned no accounts", method);
            return Ok(None);
        };

        let chain: Value = self.transport.request("eth_chainId", json!([])).await?;
        let chain_id = parse_quantity(&chain)?;

        if let Some(store) = &self.store {
            store.remember(address)?;
        }
        info!("Wallet connected: {} (chain={})", address, chain_id);
        Ok(Some(WalletConnection { address, chain_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::Mutex;
    use veil_coprocessor::user_decrypt_request;

    fn payload() -> Eip712Payload {
        user_decrypt_request(&Address([3u8; 20]), 31337, "0xab", &[Address([9u8; 20])], 100, 365)
    }

    struct FakeProvider {
        accounts: Vec<Address>,
        reject_signing: bool,
        calls: Mutex<Vec<String>>,
    }

    impl RpcTransport for FakeProvider {
        fn request<'a>(
            &'a self,
            method: &'a str,
            _params: Value,
        ) -> BoxFuture<'a, Result<Value, RpcError>> {
            self.calls.lock().unwrap().push(method.to_string());
            let result = match method {
                "eth_accounts" | "eth_requestAccounts" => Ok(json!(self.accounts)),
                "eth_chainId" => Ok(json!("0x7a69")),
                "eth_signTypedData_v4" if self.reject_signing => Err(RpcError::Remote {
                    code: USER_REJECTED_CODE,
                    message: "User denied message signature".into(),
                }),
                "eth_signTypedData_v4" => Ok(json!("0xdeadbeef")),
                other => Err(RpcError::method_not_found(other)),
            };
            Box::pin(async move { result })
        }
    }

    fn provider(accounts: Vec<Address>, reject_signing: bool) -> Arc<FakeProvider> {
        Arc::new(FakeProvider {
            accounts,
            reject_signing,
            calls: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_dev_signature_verifies() {
        let wallet = DevWallet::from_seed(&[7u8; 32]);
        let payload = payload();
        let signature = wallet.sign(&payload).unwrap();
        assert_eq!(verify_dev_signature(&payload, &signature).unwrap(), wallet.address());
    }

    #[test]
    fn test_dev_signature_covers_whole_message() {
        let wallet = DevWallet::from_seed(&[7u8; 32]);
        let signature = wallet.sign(&payload()).unwrap();
        let mut tampered = payload();
        tampered.message["durationDays"] = json!("366");
        assert!(verify_dev_signature(&tampered, &signature).is_err());
        assert!(verify_dev_signature(&payload(), &signature[..10]).is_err());
    }

    #[tokio::test]
    async fn test_rpc_wallet_maps_rejection() {
        let wallet = RpcWallet::new(provider(vec![Address([1u8; 20])], true), Address([1u8; 20]));
        let err = wallet.sign_typed_data(&payload()).await.unwrap_err();
        assert!(matches!(err, WalletError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_rpc_wallet_decodes_signature() {
        let wallet = RpcWallet::new(provider(vec![Address([1u8; 20])], false), Address([1u8; 20]));
        assert_eq!(
            wallet.sign_typed_data(&payload()).await.unwrap(),
            vec![0xde, 0xad, 0xbe, 0xef]
        );
    }

    #[tokio::test]
    async fn test_rpc_wallet_address_follows_provider() {
        let account = Address([1u8; 20]);
        let wallet = RpcWallet::new(provider(vec![account], false), account);
        assert_eq!(TypedDataSigner::address(&wallet).await.unwrap(), account);

        let switched = RpcWallet::new(provider(vec![Address([2u8; 20]), account], false), account);
        assert!(matches!(
            TypedDataSigner::address(&switched).await,
            Err(WalletError::AccountChanged { current, .. }) if current == Address([2u8; 20])
        ));

        let locked = RpcWallet::new(provider(vec![], false), account);
        assert!(matches!(
            TypedDataSigner::address(&locked).await,
            Err(WalletError::NoAccounts)
        ));
    }

    #[tokio::test]
    async fn test_connect_remembers_and_disconnect_forgets() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectionStore::new(dir.path().join("connection.json"));
        let connector = WalletConnector::new(provider(vec![Address([1u8; 20])], false))
            .with_store(store.clone());

        let connection = connector.connect().await.unwrap();
        assert_eq!(connection.address, Address([1u8; 20]));
        assert_eq!(connection.chain_id, 31337);
        assert!(store.was_connected());
        assert_eq!(store.load().address, Some(Address([1u8; 20])));

        connector.disconnect().unwrap();
        assert!(!store.was_connected());
    }

    #[tokio::test]
    async fn test_auto_connect_requires_remembered_connection() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectionStore::new(dir.path().join("connection.json"));
        let fake = provider(vec![Address([1u8; 20])], false);
        let connector = WalletConnector::new(fake.clone()).with_store(store.clone());

        assert_eq!(connector.auto_connect().await.unwrap(), None);
        assert!(fake.calls.lock().unwrap().is_empty());

        store.remember(Address([1u8; 20])).unwrap();
        let connection = connector.auto_connect().await.unwrap().unwrap();
        assert_eq!(connection.address, Address([1u8; 20]));
        assert_eq!(fake.calls.lock().unwrap()[0], "eth_accounts");
    }

    #[tokio::test]
    async fn test_no_accounts() {
        let connector = WalletConnector::new(provider(vec![], false));
        assert!(matches!(
            connector.connect().await,
            Err(WalletError::NoAccounts)
        ));
    }

    #[test]
    fn test_store_from_config() {
        let mut config = veil_config::VeilConfig::default();
        config.wallet.store_path = Some("/tmp/veil-test/connection.json".into());
        let store = ConnectionStore::from_config(&config).unwrap();
        assert_eq!(store.path(), Path::new("/tmp/veil-test/connection.json"));

        config.wallet.remember_connection = false;
        assert!(ConnectionStore::from_config(&config).is_none());
    }
}
