//! Veil confidential voting client
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Veil voting client                        │
//! │                                                                  │
//! │  wallet connect                                                  │
//! │       │                                                          │
//! │       ▼                                                          │
//! │  ┌────────────────┐   resolve   ┌─────────────────────┐          │
//! │  │ SessionManager │ ──────────▶ │ CapabilityResolver  │          │
//! │  │ (single-flight)│             │ mock │ production   │          │
//! │  └───────┬────────┘             └─────────────────────┘          │
//! │          │ EncryptionSession (MockBackend │ RelayerBackend)      │
//! │          ▼                                                       │
//! │  ┌────────────────┐  encrypted ballot  ┌──────────────────────┐  │
//! │  │  VotingClient  │ ─────────────────▶ │  Ledger (contract)   │  │
//! │  │  (lifecycle)   │ ◀── handles ────── │  proposals, tallies  │  │
//! │  └───────┬────────┘                    └──────────────────────┘  │
//! │          │ authorize (EIP-712) + decrypt                         │
//! │          ▼                                                       │
//! │     DecryptionGrant ──▶ plaintext tallies                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod authorization;
pub mod backend;
pub mod capability;
pub mod clock;
pub mod devnet;
pub mod input;
pub mod ledger;
pub mod proposal;
pub mod rpc;
pub mod session;
pub mod wallet;

pub use authorization::{
    AuthStep, AuthorizationError, DecryptError, DecryptionGrant, GRANT_DURATION_DAYS, authorize,
    authorize_for, decrypt,
};
pub use backend::{
    Backend, BackendError, BackendKind, EncryptionBackend, EncryptionSession, HandleContractPair,
    MockBackend, RelayerBackend, RelayerSettings,
};
pub use capability::{BackendDescriptor, CapabilityResolver, MockMetadata, ResolveError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use devnet::{DevChain, DevChainConfig, DevConnector};
pub use input::{EncryptedInput, FinalizedInput, InputError};
pub use ledger::{
    Ledger, LedgerError, LedgerParameters, NewProposal, Proposal, RevertReason,
};
pub use proposal::{OptionResult, ProposalError, ProposalPhase, VotingClient};
pub use rpc::{Connector, HttpConnector, HttpTransport, ProviderSource, RpcError, RpcTransport};
pub use session::{SessionError, SessionManager, SessionState};
pub use wallet::{
    ConnectionStore, DevWallet, RpcWallet, TypedDataSigner, WalletConnection, WalletConnector,
    WalletError,
};

#[cfg(test)]
mod tests;
