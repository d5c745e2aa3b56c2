use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::{
    abi::{self, Abi},
    core::types::{Address, Bytes, TransactionReceipt, TransactionRequest, H256, U256},
    prelude::*,
    providers::{Http, Provider},
    signers::{LocalWallet, Signer},
};
use std::{future::Future, str::FromStr, sync::Arc, time::Duration};
use tracing::{debug, info, instrument};

use crate::types::ChainConfig;

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Result of the resolver's `crossChainChecker` view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerOutput {
    pub can_exec: bool,
    pub exec_payload: Bytes,
    pub nonce: U256,
}

/// Everything the pipeline needs from one chain endpoint.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain(&self) -> &Arc<ChainConfig>;

    async fn cross_chain_checker(
        &self,
        resolver: Address,
        dest_chain_id: u32,
    ) -> Result<CheckerOutput>;

    /// Sends `requestRemoteExecution` and returns its inclusion receipt.
    async fn request_remote_execution(
        &self,
        resolver: Address,
        dest_chain_id: u32,
    ) -> Result<TransactionReceipt>;

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>>;

    /// Sends raw calldata to `to` and waits for inclusion. Reverted
    /// transactions still return their receipt.
    async fn send_calldata(&self, to: Address, data: Bytes, gas: U256)
        -> Result<TransactionReceipt>;
}

pub struct EthersChainClient {
    chain: Arc<ChainConfig>,
    client: Arc<SignerClient>,
    resolver_abi: Abi,
    confirmation_timeout: Duration,
}

impl EthersChainClient {
    pub fn new(
        chain: Arc<ChainConfig>,
        private_key: &str,
        rpc_timeout: Duration,
        confirmation_timeout: Duration,
    ) -> Result<Self> {
        let url = reqwest::Url::parse(&chain.rpc_url)
            .with_context(|| format!("Invalid RPC url for {}", chain.name))?;
        let http_client = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let provider = Provider::new(Http::new_with_client(url, http_client));

        // Create wallet
        let wallet = LocalWallet::from_str(private_key)
            .context("Failed to create wallet")?
            .with_chain_id(chain.chain_id);
        let client = SignerMiddleware::new(provider, wallet);

        // Create ABI for the cross-chain resolver interface
        let resolver_abi = abi::parse_abi(&[
            "function crossChainChecker(uint32 destinationChainId) external view returns (bool canExec, bytes memory execPayload, uint256 nonce)",
            "function requestRemoteExecution(uint32 destinationChainId) external",
        ])?;

        Ok(Self {
            chain,
            client: Arc::new(client),
            resolver_abi,
            confirmation_timeout,
        })
    }

    fn resolver(&self, address: Address) -> Contract<SignerClient> {
        Contract::new(address, self.resolver_abi.clone(), Arc::clone(&self.client))
    }

    async fn await_inclusion<F>(&self, tx_hash: H256, pending: F) -> Result<TransactionReceipt>
    where
        F: Future<Output = Result<Option<TransactionReceipt>, ProviderError>>,
    {
        tokio::time::timeout(self.confirmation_timeout, pending)
            .await
            .map_err(|_| {
                anyhow!(
                    "Timed out after {:?} waiting for {tx_hash:?} on {}",
                    self.confirmation_timeout,
                    self.chain.name
                )
            })??
            .ok_or_else(|| anyhow!("Transaction receipt not found for {tx_hash:?}"))
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    fn chain(&self) -> &Arc<ChainConfig> {
        &self.chain
    }

    #[instrument(skip(self), fields(chain = %self.chain.name))]
    async fn cross_chain_checker(
        &self,
        resolver: Address,
        dest_chain_id: u32,
    ) -> Result<CheckerOutput> {
        debug!("Calling crossChainChecker() on resolver");
        let (can_exec, exec_payload, nonce): (bool, Bytes, U256) = self
            .resolver(resolver)
            .method("crossChainChecker", dest_chain_id)?
            .call()
            .await?;
        Ok(CheckerOutput {
            can_exec,
            exec_payload,
            nonce,
        })
    }

    #[instrument(skip(self), fields(chain = %self.chain.name))]
    async fn request_remote_execution(
        &self,
        resolver: Address,
        dest_chain_id: u32,
    ) -> Result<TransactionReceipt> {
        info!("Calling requestRemoteExecution on resolver");
        let contract = self.resolver(resolver);
        let tx_req = contract.method::<_, ()>("requestRemoteExecution", dest_chain_id)?;
        let tx = tx_req.send().await?;

        let tx_hash = tx.tx_hash();
        info!(?tx_hash, "Transaction sent");

        let receipt = self.await_inclusion(tx_hash, tx).await?;
        info!(
            ?tx_hash,
            block_number = ?receipt.block_number,
            "Transaction confirmed"
        );
        Ok(receipt)
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>> {
        Ok(self.client.get_transaction_receipt(tx_hash).await?)
    }

    #[instrument(skip(self, data), fields(chain = %self.chain.name, data_len = data.len()))]
    async fn send_calldata(
        &self,
        to: Address,
        data: Bytes,
        gas: U256,
    ) -> Result<TransactionReceipt> {
        let tx = TransactionRequest::new().to(to).data(data).gas(gas);
        let pending = self.client.send_transaction(tx, None).await?;

        let tx_hash = pending.tx_hash();
        info!(?tx_hash, "Transaction sent");

        self.await_inclusion(tx_hash, pending).await
    }
}
