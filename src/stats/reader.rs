//! Point-in-time reads against the ZeroSum contract and the chain.

use crate::source::abi::IZeroSum;
use crate::source::SourceError;
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider};
use async_trait::async_trait;

impl From<alloy::contract::Error> for SourceError {
    fn from(e: alloy::contract::Error) -> Self {
        SourceError::Unavailable(e.to_string())
    }
}

/// Read-only view calls. Every call is independent; a failure in one says
/// nothing about the others.
#[async_trait]
pub trait StatsReader: Send + Sync + 'static {
    async fn wins(&self, player: Address) -> Result<u64, SourceError>;
    async fn losses(&self, player: Address) -> Result<u64, SourceError>;
    /// Native balance in wei.
    async fn balance(&self, player: Address) -> Result<U256, SourceError>;
    async fn staked_amount(&self, player: Address) -> Result<U256, SourceError>;
    async fn players(&self, game_id: u64) -> Result<Vec<Address>, SourceError>;
    async fn game_count(&self) -> Result<u64, SourceError>;
}

/// [`StatsReader`] over the alloy contract bindings.
pub struct RpcStatsReader {
    provider: DynProvider,
    contract: IZeroSum::IZeroSumInstance<DynProvider>,
}

impl RpcStatsReader {
    pub fn new(provider: DynProvider, contract: Address) -> Self {
        Self {
            contract: IZeroSum::new(contract, provider.clone()),
            provider,
        }
    }
}

#[async_trait]
impl StatsReader for RpcStatsReader {
    async fn wins(&self, player: Address) -> Result<u64, SourceError> {
        let wins = self.contract.playerWins(player).call().await?;
        Ok(wins.saturating_to())
    }

    async fn losses(&self, player: Address) -> Result<u64, SourceError> {
        let losses = self.contract.playerLosses(player).call().await?;
        Ok(losses.saturating_to())
    }

    async fn balance(&self, player: Address) -> Result<U256, SourceError> {
        Ok(self.provider.get_balance(player).await?)
    }

    async fn staked_amount(&self, player: Address) -> Result<U256, SourceError> {
        Ok(self.contract.stakedAmount(player).call().await?)
    }

    async fn players(&self, game_id: u64) -> Result<Vec<Address>, SourceError> {
        Ok(self.contract.getPlayers(U256::from(game_id)).call().await?)
    }

    async fn game_count(&self) -> Result<u64, SourceError> {
        let count = self.contract.gameCounter().call().await?;
        Ok(count.saturating_to())
    }
}
