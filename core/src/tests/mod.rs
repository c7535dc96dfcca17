
use std::sync::Arc;

use crate::backend::EncryptionSession;
use crate::clock::ManualClock;
use crate::devnet::{DevChain, DevChainConfig};
use crate::ledger::LedgerParameters;
use crate::proposal::VotingClient;
use crate::wallet::DevWallet;

const GENESIS: u64 = 1_700_000_000;

/// Dev chain + shared manual clock + a ready mock session.
struct Fixture {
    chain: DevChain,
    clock: ManualClock,
    session: EncryptionSession,
}

impl Fixture {
    async fn new() -> Self {
        Self::with_parameters(LedgerParameters::default()).await
    }

    async fn with_parameters(parameters: LedgerParameters) -> Self {
        let clock = ManualClock::new(GENESIS);
        let chain = DevChain::with_clock(
            DevChainConfig {
                parameters,
                ..DevChainConfig::default()
            },
            Arc::new(clock.clone()),
        );
        let session = chain.open_session().await.unwrap();
        Self {
            chain,
            clock,
            session,
        }
    }

    fn wallet(&self, index: usize) -> DevWallet {
        self.chain.wallets()[index].clone()
    }

    fn client(&self, index: usize) -> VotingClient<DevChain> {
        VotingClient::new(
            self.chain.clone(),
            self.wallet(index).address(),
            Arc::new(self.clock.clone()),
        )
    }
}

fn labels(labels: &[&str]) -> Vec<String> {
    labels.iter().map(|s| s.to_string()).collect()
}
