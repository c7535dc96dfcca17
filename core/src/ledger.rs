//! Ledger contract surface
//!
//! The voting contract is the system of record for proposals and encrypted
//! tallies. This module describes what the client consumes from it; the
//! in-process [`DevChain`](crate::devnet::DevChain) is one implementation.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use veil_types::{Address, Handle, TxHash};

/// On-chain proposal record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: u64,
    pub title: String,
    pub description: String,
    pub options: Vec<String>,
    pub creator: Address,
    pub start_time: u64,
    pub end_time: u64,
    pub min_voters: u64,
    pub total_voters: u64,
    pub is_revealed: bool,
}

/// Arguments of a `createProposal` transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProposal {
    pub title: String,
    pub description: String,
    pub options: Vec<String>,
    pub duration_secs: u64,
    pub min_voters: u64,
}

/// Bounds the ledger enforces on new proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerParameters {
    pub min_duration_secs: u64,
    pub min_options: usize,
    pub max_options: usize,
}

impl Default for LedgerParameters {
    fn default() -> Self {
        Self {
            min_duration_secs: 3600,
            min_options: 2,
            max_options: 10,
        }
    }
}

/// Named custom errors the voting contract reverts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RevertReason {
    InvalidDuration,
    TooManyOptions,
    AlreadyVoted,
    ProposalNotActive,
    AlreadyRevealed,
    NotVoted,
    ProposalNotFound,
    InvalidOption,
    InvalidInputProof,
}

impl RevertReason {
    pub const ALL: [RevertReason; 9] = [
        RevertReason::InvalidDuration,
        RevertReason::TooManyOptions,
        RevertReason::AlreadyVoted,
        RevertReason::ProposalNotActive,
        RevertReason::AlreadyRevealed,
        RevertReason::NotVoted,
        RevertReason::ProposalNotFound,
        RevertReason::InvalidOption,
        RevertReason::InvalidInputProof,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RevertReason::InvalidDuration => "InvalidDuration",
            RevertReason::TooManyOptions => "TooManyOptions",
            RevertReason::AlreadyVoted => "AlreadyVoted",
            RevertReason::ProposalNotActive => "ProposalNotActive",
            RevertReason::AlreadyRevealed => "AlreadyRevealed",
            RevertReason::NotVoted => "NotVoted",
            RevertReason::ProposalNotFound => "ProposalNotFound",
            RevertReason::InvalidOption => "InvalidOption",
            RevertReason::InvalidInputProof => "InvalidInputProof",
        }
    }

    /// Match a revert message such as `"reverted with custom error 'NotVoted()'"`.
    pub fn from_message(message: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|reason| message.contains(reason.name()))
    }
}

impl fmt::Display for RevertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("ledger reverted: {0}")]
    Revert(RevertReason),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl From<RevertReason> for LedgerError {
    fn from(reason: RevertReason) -> Self {
        LedgerError::Revert(reason)
    }
}

/// Voting contract as seen from a client. State-changing calls take the
/// transaction sender explicitly.
pub trait Ledger: Send + Sync {
    /// Deployed contract address (what grants must authorize).
    fn address(&self) -> Address;

    fn parameters(&self) -> impl Future<Output = Result<LedgerParameters, LedgerError>> + Send;

    /// Returns the new proposal id.
    fn create_proposal(
        &self,
        sender: &Address,
        proposal: &NewProposal,
    ) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    fn vote(
        &self,
        sender: &Address,
        proposal_id: u64,
        choice: Handle,
        proof: &[u8],
    ) -> impl Future<Output = Result<TxHash, LedgerError>> + Send;

    fn reveal_result(
        &self,
        sender: &Address,
        proposal_id: u64,
    ) -> impl Future<Output = Result<TxHash, LedgerError>> + Send;

    /// Handle of the sender's own encrypted choice.
    fn reveal_my_vote(
        &self,
        sender: &Address,
        proposal_id: u64,
    ) -> impl Future<Output = Result<Handle, LedgerError>> + Send;

    fn proposal_count(&self) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    fn get_proposal(
        &self,
        proposal_id: u64,
    ) -> impl Future<Output = Result<Proposal, LedgerError>> + Send;

    fn has_voted(
        &self,
        proposal_id: u64,
        voter: &Address,
    ) -> impl Future<Output = Result<bool, LedgerError>> + Send;

    fn get_option_votes(
        &self,
        proposal_id: u64,
        option_index: usize,
    ) -> impl Future<Output = Result<Handle, LedgerError>> + Send;

    fn is_active(&self, proposal_id: u64) -> impl Future<Output = Result<bool, LedgerError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revert_reason_from_message() {
        assert_eq!(
            RevertReason::from_message("reverted with custom error 'AlreadyVoted()'"),
            Some(RevertReason::AlreadyVoted)
        );
        assert_eq!(
            RevertReason::from_message("execution reverted: NotVoted"),
            Some(RevertReason::NotVoted)
        );
        assert_eq!(RevertReason::from_message("out of gas"), None);
    }

    #[test]
    fn test_revert_names_are_distinct() {
        for reason in RevertReason::ALL {
            assert_eq!(RevertReason::from_message(reason.name()), Some(reason));
        }
    }
}
