//! In-process development chain
//!
//! ```text
//! ┌─────────────────────────────── DevChain ───────────────────────────────┐
//! │                                                                        │
//! │   JSON-RPC (node.rs)                    Ledger (ledger.rs)             │
//! │   eth_chainId                           createProposal / vote          │
//! │   web3_clientVersion ("HardhatNetwork") revealResult / revealMyVote    │
//! │   fhevm_relayer_metadata                views                          │
//! │   eth_accounts / eth_signTypedData_v4          │                       │
//! │   fhevm_mock_user_decrypt                      │                       │
//! │            │                                   ▼                       │
//! │            └──────────────▶ CiphertextStore (values + ACL)             │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Plays the role of a local development node running the voting contract
//! with the mock coprocessor. Clones share state, so one clone can serve as
//! the RPC endpoint while another is driven as the ledger.

mod ledger;
mod node;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use veil_coprocessor::{CiphertextStore, InputKey};
use veil_types::{Address, Handle, TxHash};

use crate::backend::EncryptionSession;
use crate::capability::{CapabilityResolver, DEFAULT_MOCK_CHAIN_ID, MockMetadata};
use crate::clock::{Clock, SystemClock};
use crate::ledger::{LedgerParameters, Proposal};
use crate::rpc::{Connector, ProviderSource, RpcError, RpcTransport};
use crate::session::SessionError;
use crate::wallet::DevWallet;

pub const DEV_CLIENT_VERSION: &str = "HardhatNetwork/2.22.19/@fhevm/mock-utils/0.1.0";

/// Dev chain configuration
#[derive(Debug, Clone)]
pub struct DevChainConfig {
    pub chain_id: u64,
    pub client_version: String,
    /// Raw `fhevm_relayer_metadata` answer; `None` serves the real metadata
    pub metadata_override: Option<Value>,
    pub ledger_address: Address,
    /// Initial ledger parameters; see [`DevChain::set_parameters`]
    pub parameters: LedgerParameters,
    /// Number of funded dev accounts
    pub accounts: usize,
}

impl Default for DevChainConfig {
    fn default() -> Self {
        Self {
            chain_id: DEFAULT_MOCK_CHAIN_ID,
            client_version: DEV_CLIENT_VERSION.to_string(),
            metadata_override: None,
            ledger_address: derive_address("veil-dev-ledger", 0),
            parameters: LedgerParameters::default(),
            accounts: 4,
        }
    }
}

fn derive_address(context: &str, index: u64) -> Address {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(&index.to_be_bytes());
    Address::from_digest(hasher.finalize().as_bytes())
}

pub(crate) struct ProposalRecord {
    pub proposal: Proposal,
    /// Encrypted per-option counters
    pub tallies: Vec<Handle>,
    /// Each voter's encrypted choice
    pub ballots: HashMap<Address, Handle>,
}

#[derive(Default)]
pub(crate) struct ChainState {
    pub parameters: LedgerParameters,
    pub proposals: Vec<ProposalRecord>,
    pub store: CiphertextStore,
    pub tx_count: u64,
    pub requests: HashMap<String, u64>,
    pub hang_on: HashSet<String>,
}

impl ChainState {
    pub fn next_tx(&mut self) -> TxHash {
        self.tx_count += 1;
        let mut hasher = blake3::Hasher::new_derive_key("veil-dev-tx");
        hasher.update(&self.tx_count.to_be_bytes());
        TxHash(*hasher.finalize().as_bytes())
    }
}

#[derive(Clone)]
pub struct DevChain {
    config: Arc<DevChainConfig>,
    metadata: MockMetadata,
    input_key: InputKey,
    wallets: Arc<Vec<DevWallet>>,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<ChainState>>,
}

impl Default for DevChain {
    fn default() -> Self {
        Self::new(DevChainConfig::default())
    }
}

impl DevChain {
    pub fn new(config: DevChainConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: DevChainConfig, clock: Arc<dyn Clock>) -> Self {
        let metadata = MockMetadata {
            acl_address: derive_address("veil-dev-acl", config.chain_id),
            input_verifier_address: derive_address("veil-dev-input-verifier", config.chain_id),
            kms_verifier_address: derive_address("veil-dev-kms-verifier", config.chain_id),
        };
        let input_key = InputKey::derive(&metadata.input_verifier_address, config.chain_id);
        let wallets = (0..config.accounts as u64)
            .map(|i| {
                let mut hasher = blake3::Hasher::new_derive_key("veil-dev-account");
                hasher.update(&i.to_be_bytes());
                DevWallet::from_seed(hasher.finalize().as_bytes())
            })
            .collect();
        let state = ChainState {
            parameters: config.parameters,
            store: CiphertextStore::new(config.chain_id),
            ..ChainState::default()
        };

        Self {
            config: Arc::new(config),
            metadata,
            input_key,
            wallets: Arc::new(wallets),
            clock,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn ledger_address(&self) -> Address {
        self.config.ledger_address
    }

    pub fn metadata(&self) -> &MockMetadata {
        &self.metadata
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn wallets(&self) -> &[DevWallet] {
        &self.wallets
    }

    /// Live provider for this chain.
    pub fn provider(&self) -> ProviderSource {
        ProviderSource::Transport(Arc::new(self.clone()))
    }

    /// Connector that routes every URL to this chain.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(DevConnector(self.clone()))
    }

    /// Resolver with the default mock chain map, wired to this chain.
    pub fn resolver(&self) -> CapabilityResolver {
        CapabilityResolver::new(self.connector())
    }

    /// Resolve and open a session without a lifecycle manager.
    pub async fn open_session(&self) -> Result<EncryptionSession, SessionError> {
        let resolver = self.resolver();
        let descriptor = resolver
            .resolve(&self.provider(), &CancellationToken::new())
            .await?;
        Ok(EncryptionSession::open(&descriptor, resolver.connector(), None).await?)
    }

    /// Change the ledger's bounds, as a contract upgrade would.
    pub async fn set_parameters(&self, parameters: LedgerParameters) {
        self.state.lock().await.parameters = parameters;
    }

    /// How many times `method` was requested over RPC.
    pub async fn request_count(&self, method: &str) -> u64 {
        self.state
            .lock()
            .await
            .requests
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    /// Make `method` never answer (to exercise cancellation).
    pub async fn set_hang_on(&self, method: &str, hang: bool) {
        let mut state = self.state.lock().await;
        if hang {
            state.hang_on.insert(method.to_string());
        } else {
            state.hang_on.remove(method);
        }
    }
}

impl std::fmt::Debug for DevChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevChain")
            .field("chain_id", &self.config.chain_id)
            .field("ledger_address", &self.config.ledger_address)
            .finish_non_exhaustive()
    }
}

pub struct DevConnector(DevChain);

impl Connector for DevConnector {
    fn connect(&self, _url: &str) -> Result<Arc<dyn RpcTransport>, RpcError> {
        Ok(Arc::new(self.0.clone()))
    }
}
