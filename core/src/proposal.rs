//! Proposal Lifecycle Controller
//!
//! ```text
//!  Pending ──start_time──▶ Active ──end_time──▶ Ended ──revealResult──▶ Revealed
//! ```
//!
//! The ledger enforces every transition. The client checks locally first so
//! that obviously doomed transactions are never sent. A local check that
//! mirrors a ledger revert fails with the same [`ProposalError::Ledger`] the
//! ledger would have produced, so callers match one variant either way.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use veil_types::{Address, Handle, TxHash};

use crate::authorization::{self, AuthorizationError, DecryptError};
use crate::backend::{EncryptionSession, HandleContractPair};
use crate::clock::Clock;
use crate::input::InputError;
use crate::ledger::{Ledger, LedgerError, LedgerParameters, NewProposal, Proposal, RevertReason};
use crate::wallet::TypedDataSigner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalPhase {
    Pending,
    Active,
    Ended,
    Revealed,
}

impl ProposalPhase {
    pub fn of(proposal: &Proposal, now: u64) -> Self {
        if now < proposal.start_time {
            ProposalPhase::Pending
        } else if now < proposal.end_time {
            ProposalPhase::Active
        } else if proposal.is_revealed {
            ProposalPhase::Revealed
        } else {
            ProposalPhase::Ended
        }
    }
}

#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("a proposal needs at least {min} options, got {got}")]
    TooFewOptions { got: usize, min: usize },

    #[error("a proposal takes at most {max} options, got {got}")]
    TooManyOptions { got: usize, max: usize },

    #[error("duration {got}s is below the ledger minimum of {min}s")]
    InvalidDuration { got: u64, min: u64 },

    #[error("choice {choice} is out of range for {options} options")]
    InvalidChoice { choice: usize, options: usize },

    #[error("results of proposal {0} are not revealed yet")]
    NotRevealed(u64),

    /// Rejected by the ledger, or by a local check for the same condition.
    #[error("{}", rejection(.reason, .proposal))]
    Ledger {
        reason: RevertReason,
        proposal: Option<u64>,
    },

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Decrypt(#[from] DecryptError),
}

impl From<LedgerError> for ProposalError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Revert(reason) => ProposalError::Ledger {
                reason,
                proposal: None,
            },
            LedgerError::Unavailable(message) => ProposalError::Unavailable(message),
        }
    }
}

impl ProposalError {
    fn rejected(reason: RevertReason, proposal_id: u64) -> Self {
        ProposalError::Ledger {
            reason,
            proposal: Some(proposal_id),
        }
    }

    /// Ledger failure name this error corresponds to. The bound checks on
    /// proposal creation keep their own variants for the numbers they carry.
    pub fn reason(&self) -> Option<RevertReason> {
        match self {
            ProposalError::Ledger { reason, .. } => Some(*reason),
            ProposalError::TooFewOptions { .. } | ProposalError::TooManyOptions { .. } => {
                Some(RevertReason::TooManyOptions)
            }
            ProposalError::InvalidDuration { .. } => Some(RevertReason::InvalidDuration),
            _ => None,
        }
    }
}

fn rejection(reason: &RevertReason, proposal: &Option<u64>) -> String {
    match proposal {
        Some(id) => format!("proposal {} rejected with {}", id, reason),
        None => format!("ledger reverted with {}", reason),
    }
}

/// Attach the proposal id to a ledger revert.
fn for_proposal(proposal_id: u64) -> impl Fn(LedgerError) -> ProposalError {
    move |err| match err {
        LedgerError::Revert(reason) => ProposalError::rejected(reason, proposal_id),
        other => other.into(),
    }
}

/// Decrypted tally for one option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionResult {
    pub index: usize,
    pub label: String,
    pub votes: u64,
    /// Share of `total_voters`, 0..=100
    pub percentage: f64,
}

/// Voting operations for one account against one ledger.
pub struct VotingClient<L> {
    ledger: L,
    account: Address,
    clock: Arc<dyn Clock>,
    /// Cleared when the ledger rejects bounds the cached copy accepted
    params: Mutex<Option<LedgerParameters>>,
}

impl<L: Ledger> VotingClient<L> {
    pub fn new(ledger: L, account: Address, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            account,
            clock,
            params: Mutex::new(None),
        }
    }

    pub fn account(&self) -> &Address {
        &self.account
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Ledger-reported bounds, cached until the ledger contradicts them.
    pub async fn parameters(&self) -> Result<LedgerParameters, ProposalError> {
        let mut cached = self.params.lock().await;
        if let Some(params) = *cached {
            return Ok(params);
        }
        let params = self.ledger.parameters().await?;
        *cached = Some(params);
        Ok(params)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub async fn create_proposal(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
        options: Vec<String>,
        duration_secs: u64,
        min_voters: u64,
    ) -> Result<u64, ProposalError> {
        let params = self.parameters().await?;
        if options.len() < params.min_options {
            return Err(ProposalError::TooFewOptions {
                got: options.len(),
                min: params.min_options,
            });
        }
        if options.len() > params.max_options {
            return Err(ProposalError::TooManyOptions {
                got: options.len(),
                max: params.max_options,
            });
        }
        if duration_secs < params.min_duration_secs {
            return Err(ProposalError::InvalidDuration {
                got: duration_secs,
                min: params.min_duration_secs,
            });
        }

        let proposal = NewProposal {
            title: title.into(),
            description: description.into(),
            options,
            duration_secs,
            min_voters,
        };
        let id = match self.ledger.create_proposal(&self.account, &proposal).await {
            Ok(id) => id,
            Err(LedgerError::Revert(
                reason @ (RevertReason::InvalidDuration | RevertReason::TooManyOptions),
            )) => {
                debug!("Ledger rejected cached bounds with {}, refreshing", reason);
                self.params.lock().await.take();
                return Err(LedgerError::Revert(reason).into());
            }
            Err(err) => return Err(err.into()),
        };
        info!(
            "Proposal {} created: {:?} ({} options, {}s)",
            id,
            proposal.title,
            proposal.options.len(),
            duration_secs
        );
        Ok(id)
    }

    /// Cast an encrypted vote for `choice` (zero-based option index).
    pub async fn vote(
        &self,
        session: &EncryptionSession,
        proposal_id: u64,
        choice: usize,
    ) -> Result<TxHash, ProposalError> {
        let proposal = self.proposal(proposal_id).await?;
        if self.phase(&proposal) != ProposalPhase::Active {
            return Err(ProposalError::rejected(RevertReason::ProposalNotActive, proposal_id));
        }
        let invalid_choice = ProposalError::InvalidChoice {
            choice,
            options: proposal.options.len(),
        };
        if choice >= proposal.options.len() {
            return Err(invalid_choice);
        }
        let encoded = u8::try_from(choice).map_err(|_| invalid_choice)?;

        if self.has_voted(proposal_id).await? {
            return Err(ProposalError::rejected(RevertReason::AlreadyVoted, proposal_id));
        }

        let mut input = session.create_encrypted_input(self.ledger.address(), self.account);
        input.add8(encoded)?;
        let encrypted = input.finalize().await?;

        let tx = self
            .ledger
            .vote(&self.account, proposal_id, encrypted.handles[0], &encrypted.proof)
            .await
            .map_err(for_proposal(proposal_id))?;
        info!("Vote submitted on proposal {} by {} (tx={})", proposal_id, self.account, tx);
        Ok(tx)
    }

    pub async fn reveal_result(&self, proposal_id: u64) -> Result<TxHash, ProposalError> {
        let proposal = self.proposal(proposal_id).await?;
        match self.phase(&proposal) {
            ProposalPhase::Revealed => {
                return Err(ProposalError::rejected(RevertReason::AlreadyRevealed, proposal_id));
            }
            ProposalPhase::Pending | ProposalPhase::Active => {
                return Err(ProposalError::rejected(RevertReason::ProposalNotActive, proposal_id));
            }
            ProposalPhase::Ended => {}
        }

        let tx = self
            .ledger
            .reveal_result(&self.account, proposal_id)
            .await
            .map_err(for_proposal(proposal_id))?;
        info!("Result of proposal {} revealed (tx={})", proposal_id, tx);
        Ok(tx)
    }

    /// Handle of this account's own encrypted choice.
    pub async fn reveal_my_vote(&self, proposal_id: u64) -> Result<Handle, ProposalError> {
        if !self.has_voted(proposal_id).await? {
            return Err(ProposalError::rejected(RevertReason::NotVoted, proposal_id));
        }
        self.ledger
            .reveal_my_vote(&self.account, proposal_id)
            .await
            .map_err(for_proposal(proposal_id))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn proposal(&self, proposal_id: u64) -> Result<Proposal, ProposalError> {
        self.ledger
            .get_proposal(proposal_id)
            .await
            .map_err(for_proposal(proposal_id))
    }

    /// All proposals in id order.
    pub async fn proposals(&self) -> Result<Vec<Proposal>, ProposalError> {
        let count = self.ledger.proposal_count().await?;
        let mut proposals = Vec::with_capacity(count as usize);
        for id in 0..count {
            proposals.push(self.ledger.get_proposal(id).await?);
        }
        Ok(proposals)
    }

    /// Proposals `voter` has voted on, in id order.
    pub async fn voting_history(&self, voter: &Address) -> Result<Vec<Proposal>, ProposalError> {
        let mut voted = Vec::new();
        for proposal in self.proposals().await? {
            if self.ledger.has_voted(proposal.id, voter).await? {
                voted.push(proposal);
            }
        }
        Ok(voted)
    }

    pub async fn has_voted(&self, proposal_id: u64) -> Result<bool, ProposalError> {
        self.ledger
            .has_voted(proposal_id, &self.account)
            .await
            .map_err(for_proposal(proposal_id))
    }

    pub async fn is_active(&self, proposal_id: u64) -> Result<bool, ProposalError> {
        self.ledger
            .is_active(proposal_id)
            .await
            .map_err(for_proposal(proposal_id))
    }

    pub fn phase(&self, proposal: &Proposal) -> ProposalPhase {
        ProposalPhase::of(proposal, self.clock.now())
    }

    /// Encrypted tally of one option. Readable in any phase, decryptable once revealed.
    pub async fn get_option_votes(
        &self,
        proposal_id: u64,
        option_index: usize,
    ) -> Result<Handle, ProposalError> {
        let proposal = self.proposal(proposal_id).await?;
        if option_index >= proposal.options.len() {
            return Err(ProposalError::InvalidChoice {
                choice: option_index,
                options: proposal.options.len(),
            });
        }
        self.ledger
            .get_option_votes(proposal_id, option_index)
            .await
            .map_err(for_proposal(proposal_id))
    }

    // ========================================================================
    // Decryption
    // ========================================================================

    /// Decrypt every option's tally of a revealed proposal.
    pub async fn decrypt_results<S: TypedDataSigner>(
        &self,
        session: &EncryptionSession,
        signer: &S,
        proposal_id: u64,
    ) -> Result<Vec<OptionResult>, ProposalError> {
        let proposal = self.proposal(proposal_id).await?;
        if !proposal.is_revealed {
            return Err(ProposalError::NotRevealed(proposal_id));
        }

        let contract = self.ledger.address();
        let mut pairs = Vec::with_capacity(proposal.options.len());
        for index in 0..proposal.options.len() {
            pairs.push(HandleContractPair {
                handle: self.ledger.get_option_votes(proposal_id, index).await?,
                contract_address: contract,
            });
        }

        let grant = authorization::authorize(session, contract, signer, self.clock.as_ref()).await?;
        let values = authorization::decrypt(session, &grant, &pairs, self.clock.as_ref()).await?;
        debug!("Decrypted {} tallies of proposal {}", values.len(), proposal_id);

        let results = proposal
            .options
            .iter()
            .zip(&pairs)
            .enumerate()
            .map(|(index, (label, pair))| {
                let votes = values.get(&pair.handle).copied().unwrap_or(0);
                OptionResult {
                    index,
                    label: label.clone(),
                    votes,
                    percentage: percentage(votes, proposal.total_voters),
                }
            })
            .collect();
        Ok(results)
    }

    /// Decrypt this account's own choice.
    pub async fn decrypt_my_vote<S: TypedDataSigner>(
        &self,
        session: &EncryptionSession,
        signer: &S,
        proposal_id: u64,
    ) -> Result<u64, ProposalError> {
        let handle = self.reveal_my_vote(proposal_id).await?;
        self.decrypt_handle(session, signer, handle).await
    }

    /// Decrypt one handle owned by the ledger contract.
    pub async fn decrypt_handle<S: TypedDataSigner>(
        &self,
        session: &EncryptionSession,
        signer: &S,
        handle: Handle,
    ) -> Result<u64, ProposalError> {
        let contract = self.ledger.address();
        let grant = authorization::authorize(session, contract, signer, self.clock.as_ref()).await?;
        let pair = HandleContractPair {
            handle,
            contract_address: contract,
        };
        let values = authorization::decrypt(session, &grant, &[pair], self.clock.as_ref()).await?;
        values
            .get(&handle)
            .copied()
            .ok_or(ProposalError::Decrypt(DecryptError::MissingResult(handle)))
    }
}

fn percentage(votes: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    votes as f64 * 100.0 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(start: u64, end: u64, revealed: bool) -> Proposal {
        Proposal {
            id: 0,
            title: "T".into(),
            description: String::new(),
            options: vec!["A".into(), "B".into()],
            creator: Address::ZERO,
            start_time: start,
            end_time: end,
            min_voters: 1,
            total_voters: 0,
            is_revealed: revealed,
        }
    }

    #[test]
    fn test_phase_boundaries() {
        let p = proposal(100, 200, false);
        assert_eq!(ProposalPhase::of(&p, 99), ProposalPhase::Pending);
        assert_eq!(ProposalPhase::of(&p, 100), ProposalPhase::Active);
        assert_eq!(ProposalPhase::of(&p, 199), ProposalPhase::Active);
        assert_eq!(ProposalPhase::of(&p, 200), ProposalPhase::Ended);
        assert_eq!(
            ProposalPhase::of(&proposal(100, 200, true), 200),
            ProposalPhase::Revealed
        );
    }

    #[test]
    fn test_reason_normalizes_local_checks() {
        assert_eq!(
            ProposalError::TooFewOptions { got: 1, min: 2 }.reason(),
            Some(RevertReason::TooManyOptions)
        );
        assert_eq!(
            ProposalError::from(LedgerError::Revert(RevertReason::NotVoted)).reason(),
            Some(RevertReason::NotVoted)
        );
        assert_eq!(ProposalError::NotRevealed(0).reason(), None);
    }

    #[test]
    fn test_local_and_ledger_rejections_share_a_variant() {
        let local = ProposalError::rejected(RevertReason::AlreadyVoted, 7);
        let remote = for_proposal(7)(LedgerError::Revert(RevertReason::AlreadyVoted));
        for err in [&local, &remote] {
            assert!(matches!(
                err,
                ProposalError::Ledger {
                    reason: RevertReason::AlreadyVoted,
                    proposal: Some(7)
                }
            ));
        }
        assert_eq!(local.to_string(), remote.to_string());
        assert!(local.to_string().contains("proposal 7"));
        assert!(matches!(
            for_proposal(7)(LedgerError::Unavailable("down".into())),
            ProposalError::Unavailable(_)
        ));
    }

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(1, 4), 25.0);
        assert!((percentage(2, 3) - 66.666).abs() < 0.01);
    }
}
