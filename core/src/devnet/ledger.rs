//! Voting contract semantics on the dev chain.

use tracing::debug;
use veil_coprocessor::{CiphertextStore, CoprocessorError, open_input};
use veil_types::{Address, FheType, Handle, TxHash};

use super::{ChainState, DevChain, ProposalRecord};
use crate::ledger::{Ledger, LedgerError, LedgerParameters, NewProposal, Proposal, RevertReason};

fn record(state: &ChainState, id: u64) -> Result<&ProposalRecord, LedgerError> {
    state
        .proposals
        .get(id as usize)
        .ok_or(LedgerError::Revert(RevertReason::ProposalNotFound))
}

fn record_mut(state: &mut ChainState, id: u64) -> Result<&mut ProposalRecord, LedgerError> {
    state
        .proposals
        .get_mut(id as usize)
        .ok_or(LedgerError::Revert(RevertReason::ProposalNotFound))
}

fn coprocessor(err: CoprocessorError) -> LedgerError {
    LedgerError::Unavailable(err.to_string())
}

/// `tally[i] += (choice == i)` for every option.
fn accumulate(
    store: &mut CiphertextStore,
    tallies: &mut [Handle],
    choice: &Handle,
) -> Result<(), CoprocessorError> {
    let one = store.trivial_encrypt(FheType::Euint32, 1);
    let zero = store.trivial_encrypt(FheType::Euint32, 0);
    for (index, tally) in tallies.iter_mut().enumerate() {
        let hit = store.eq_scalar(choice, index as u64)?;
        let increment = store.select(&hit, &one, &zero)?;
        *tally = store.add(tally, &increment)?;
    }
    Ok(())
}

impl DevChain {
    fn verify_inputs(
        &self,
        sender: &Address,
        proof: &[u8],
    ) -> Result<Vec<(Handle, FheType, u64)>, LedgerError> {
        open_input(
            &self.input_key,
            self.config.chain_id,
            &self.config.ledger_address,
            sender,
            proof,
        )
        .map_err(|_| LedgerError::Revert(RevertReason::InvalidInputProof))
    }

    /// Ingest external inputs on the ledger contract and allow `sender` to
    /// decrypt them. Every handle must be covered by `proof`.
    pub async fn accept_inputs(
        &self,
        sender: &Address,
        handles: &[Handle],
        proof: &[u8],
    ) -> Result<TxHash, LedgerError> {
        let opened = self.verify_inputs(sender, proof)?;
        let mut state = self.state.lock().await;
        for handle in handles {
            let (_, fhe_type, value) = opened
                .iter()
                .find(|(h, _, _)| h == handle)
                .copied()
                .ok_or(LedgerError::Revert(RevertReason::InvalidInputProof))?;
            state.store.insert_verified(*handle, fhe_type, value);
            state.store.allow(handle, *sender);
        }
        debug!("dev chain: {} input(s) accepted from {}", handles.len(), sender);
        Ok(state.next_tx())
    }
}

impl Ledger for DevChain {
    fn address(&self) -> Address {
        self.config.ledger_address
    }

    async fn parameters(&self) -> Result<LedgerParameters, LedgerError> {
        Ok(self.state.lock().await.parameters)
    }

    async fn create_proposal(
        &self,
        sender: &Address,
        proposal: &NewProposal,
    ) -> Result<u64, LedgerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let params = state.parameters;
        if proposal.duration_secs < params.min_duration_secs {
            return Err(RevertReason::InvalidDuration.into());
        }
        if proposal.options.len() < params.min_options
            || proposal.options.len() > params.max_options
        {
            return Err(RevertReason::TooManyOptions.into());
        }

        let id = state.proposals.len() as u64;
        let tallies = proposal
            .options
            .iter()
            .map(|_| state.store.trivial_encrypt(FheType::Euint32, 0))
            .collect();

        state.proposals.push(ProposalRecord {
            proposal: Proposal {
                id,
                title: proposal.title.clone(),
                description: proposal.description.clone(),
                options: proposal.options.clone(),
                creator: *sender,
                start_time: now,
                end_time: now.saturating_add(proposal.duration_secs),
                min_voters: proposal.min_voters,
                total_voters: 0,
                is_revealed: false,
            },
            tallies,
            ballots: Default::default(),
        });
        state.next_tx();
        debug!("dev chain: proposal {} created by {}", id, sender);
        Ok(id)
    }

    async fn vote(
        &self,
        sender: &Address,
        proposal_id: u64,
        choice: Handle,
        proof: &[u8],
    ) -> Result<TxHash, LedgerError> {
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let entry = record(state, proposal_id)?;
        if now < entry.proposal.start_time || now >= entry.proposal.end_time {
            return Err(RevertReason::ProposalNotActive.into());
        }
        if entry.ballots.contains_key(sender) {
            return Err(RevertReason::AlreadyVoted.into());
        }

        let (_, fhe_type, value) = self
            .verify_inputs(sender, proof)?
            .into_iter()
            .find(|(handle, _, _)| *handle == choice)
            .ok_or(LedgerError::Revert(RevertReason::InvalidInputProof))?;
        state.store.insert_verified(choice, fhe_type, value);

        let entry = record_mut(state, proposal_id)?;
        let mut tallies = entry.tallies.clone();
        accumulate(&mut state.store, &mut tallies, &choice).map_err(coprocessor)?;
        state.store.allow(&choice, *sender);

        let entry = record_mut(state, proposal_id)?;
        entry.tallies = tallies;
        entry.ballots.insert(*sender, choice);
        entry.proposal.total_voters += 1;

        debug!("dev chain: vote on proposal {} by {}", proposal_id, sender);
        Ok(state.next_tx())
    }

    async fn reveal_result(&self, sender: &Address, proposal_id: u64) -> Result<TxHash, LedgerError> {
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let entry = record_mut(state, proposal_id)?;
        if now < entry.proposal.end_time {
            return Err(RevertReason::ProposalNotActive.into());
        }
        if entry.proposal.is_revealed {
            return Err(RevertReason::AlreadyRevealed.into());
        }
        entry.proposal.is_revealed = true;
        let tallies = entry.tallies.clone();

        for tally in &tallies {
            state.store.make_public(tally);
        }
        debug!("dev chain: proposal {} revealed by {}", proposal_id, sender);
        Ok(state.next_tx())
    }

    async fn reveal_my_vote(&self, sender: &Address, proposal_id: u64) -> Result<Handle, LedgerError> {
        let state = self.state.lock().await;
        record(&state, proposal_id)?
            .ballots
            .get(sender)
            .copied()
            .ok_or(LedgerError::Revert(RevertReason::NotVoted))
    }

    async fn proposal_count(&self) -> Result<u64, LedgerError> {
        Ok(self.state.lock().await.proposals.len() as u64)
    }

    async fn get_proposal(&self, proposal_id: u64) -> Result<Proposal, LedgerError> {
        let state = self.state.lock().await;
        Ok(record(&state, proposal_id)?.proposal.clone())
    }

    async fn has_voted(&self, proposal_id: u64, voter: &Address) -> Result<bool, LedgerError> {
        let state = self.state.lock().await;
        Ok(record(&state, proposal_id)?.ballots.contains_key(voter))
    }

    async fn get_option_votes(
        &self,
        proposal_id: u64,
        option_index: usize,
    ) -> Result<Handle, LedgerError> {
        let state = self.state.lock().await;
        record(&state, proposal_id)?
            .tallies
            .get(option_index)
            .copied()
            .ok_or(LedgerError::Revert(RevertReason::InvalidOption))
    }

    async fn is_active(&self, proposal_id: u64) -> Result<bool, LedgerError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let proposal = &record(&state, proposal_id)?.proposal;
        Ok(now >= proposal.start_time && now < proposal.end_time)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::devnet::DevChainConfig;
    use veil_coprocessor::seal_input;

    fn new_proposal(options: usize, duration_secs: u64) -> NewProposal {
        NewProposal {
            title: "T".into(),
            description: "d".into(),
            options: (0..options).map(|i| format!("option {}", i)).collect(),
            duration_secs,
            min_voters: 1,
        }
    }

    fn sealed_choice(chain: &DevChain, voter: &Address, choice: u64) -> (Handle, Vec<u8>) {
        let sealed = seal_input(
            &chain.input_key,
            chain.chain_id(),
            &chain.ledger_address(),
            voter,
            &[(FheType::Euint8, choice)],
        )
        .unwrap();
        (sealed.handles[0], sealed.proof)
    }

    #[tokio::test]
    async fn test_option_and_duration_bounds() {
        let chain = DevChain::default();
        let creator = Address([1u8; 20]);

        for n in [1usize, 11, 12] {
            let err = chain.create_proposal(&creator, &new_proposal(n, 3600)).await.unwrap_err();
            assert!(matches!(err, LedgerError::Revert(RevertReason::TooManyOptions)));
        }
        for n in 2..=10 {
            assert!(chain.create_proposal(&creator, &new_proposal(n, 3600)).await.is_ok());
        }
        let err = chain.create_proposal(&creator, &new_proposal(2, 3599)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Revert(RevertReason::InvalidDuration)));
        assert_eq!(chain.proposal_count().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_vote_rejects_proof_for_other_sender() {
        let clock = ManualClock::new(1_000);
        let chain = DevChain::with_clock(DevChainConfig::default(), Arc::new(clock));
        let alice = Address([1u8; 20]);
        let bob = Address([2u8; 20]);
        let id = chain.create_proposal(&alice, &new_proposal(2, 3600)).await.unwrap();

        let (handle, proof) = sealed_choice(&chain, &alice, 1);
        let err = chain.vote(&bob, id, handle, &proof).await.unwrap_err();
        assert!(matches!(err, LedgerError::Revert(RevertReason::InvalidInputProof)));

        chain.vote(&alice, id, handle, &proof).await.unwrap();
        assert!(chain.has_voted(id, &alice).await.unwrap());
        assert!(!chain.has_voted(id, &bob).await.unwrap());
    }

    #[tokio::test]
    async fn test_tallies_follow_votes() {
        let clock = ManualClock::new(1_000);
        let chain = DevChain::with_clock(DevChainConfig::default(), Arc::new(clock.clone()));
        let id = chain
            .create_proposal(&Address([9u8; 20]), &new_proposal(3, 3600))
            .await
            .unwrap();

        for (i, choice) in [0u64, 2, 0].into_iter().enumerate() {
            let voter = Address([i as u8 + 1; 20]);
            let (handle, proof) = sealed_choice(&chain, &voter, choice);
            chain.vote(&voter, id, handle, &proof).await.unwrap();
        }

        let state = chain.state.lock().await;
        let counts: Vec<u64> = state.proposals[0]
            .tallies
            .iter()
            .map(|h| state.store.cleartext(h).unwrap().1)
            .collect();
        assert_eq!(counts, vec![2, 0, 1]);
        assert_eq!(state.proposals[0].proposal.total_voters, 3);
    }

    #[tokio::test]
    async fn test_vote_outside_window() {
        let clock = ManualClock::new(1_000);
        let chain = DevChain::with_clock(DevChainConfig::default(), Arc::new(clock.clone()));
        let voter = Address([1u8; 20]);
        let id = chain.create_proposal(&voter, &new_proposal(2, 3600)).await.unwrap();

        clock.advance(3600);
        let (handle, proof) = sealed_choice(&chain, &voter, 0);
        let err = chain.vote(&voter, id, handle, &proof).await.unwrap_err();
        assert!(matches!(err, LedgerError::Revert(RevertReason::ProposalNotActive)));
        assert!(!chain.is_active(id).await.unwrap());
    }
}
