use anyhow::Result;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{info, instrument, warn};

use crate::chain::{ChainClient, EthersChainClient};
use crate::proof_fetcher::{ProofApi, ProofApiClient};
use crate::{EventDeliverer, EventGenerator, ProofFetcher, RelayerConfig};

/// Wires event generator -> proof fetcher -> event deliverer.
pub struct RelayerApp {
    event_generator: Arc<EventGenerator>,
    proof_fetcher: Arc<ProofFetcher>,
    event_deliverer: Arc<EventDeliverer>,
}

impl RelayerApp {
    #[instrument(skip_all, fields(config.chains_count = config.chains.len(), config.pairs_count = config.relay_pairs.len()))]
    pub fn new(config: RelayerConfig, private_key: &str, api_token: String) -> Result<Self> {
        info!("Initializing relayer application");
        config.validate()?;

        let rpc_timeout = Duration::from_millis(config.timeouts.rpc_timeout_ms);
        let confirmation_timeout = Duration::from_millis(config.timeouts.confirmation_timeout_ms);

        let clients = config
            .chains
            .iter()
            .map(|chain| {
                let client = EthersChainClient::new(
                    Arc::new(chain.clone()),
                    private_key,
                    rpc_timeout,
                    confirmation_timeout,
                )?;
                Ok((chain.chain_id, Arc::new(client) as Arc<dyn ChainClient>))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        let api = ProofApiClient::new(api_token, config.proof_api.endpoint.clone(), rpc_timeout)?;

        Self::from_parts(&config, clients, Arc::new(api))
    }

    /// Build the pipeline over already constructed clients.
    pub fn from_parts(
        config: &RelayerConfig,
        clients: HashMap<u64, Arc<dyn ChainClient>>,
        api: Arc<dyn ProofApi>,
    ) -> Result<Self> {
        let retry = config.retry.policy();

        let event_deliverer = Arc::new(EventDeliverer::new(
            clients.clone(),
            config.delivery_gas_limit,
            retry,
        ));
        let proof_fetcher = Arc::new(ProofFetcher::new(
            api,
            config.proof_api.poll_policy(),
            retry,
            event_deliverer.clone(),
        ));
        let event_generator = Arc::new(EventGenerator::new(
            config.relay_pairs.clone(),
            clients,
            config.polling_interval(),
            proof_fetcher.clone(),
        )?);

        Ok(Self {
            event_generator,
            proof_fetcher,
            event_deliverer,
        })
    }

    /// Poll until [`RelayerApp::stop`] is called. The proof and delivery
    /// stages run on their own consumer tasks as work arrives.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<()> {
        info!("Starting all relayer components");
        self.event_generator.start().await
    }

    pub fn stop(&self) {
        info!("Stopping event generator");
        self.event_generator.stop();
    }

    /// Wait for queued proofs and deliveries, up to `timeout`.
    /// Returns `false` if work was still queued when the timeout hit.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let idle = async {
            self.proof_fetcher.wait_idle().await;
            self.event_deliverer.wait_idle().await;
        };
        match tokio::time::timeout(timeout, idle).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    proofs_pending = self.proof_fetcher.pending(),
                    deliveries_pending = self.event_deliverer.pending(),
                    "Drain timed out, queued work will be lost"
                );
                false
            }
        }
    }

    pub fn event_generator(&self) -> &Arc<EventGenerator> {
        &self.event_generator
    }

    pub fn proof_fetcher(&self) -> &Arc<ProofFetcher> {
        &self.proof_fetcher
    }

    pub fn event_deliverer(&self) -> &Arc<EventDeliverer> {
        &self.event_deliverer
    }
}
