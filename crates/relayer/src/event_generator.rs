use crate::chain::ChainClient;
use crate::queue::RelaySink;
use crate::types::{EventMeta, RelayEvent, RelayPair};
use anyhow::{anyhow, Context, Result};
use ethers::{
    core::types::{Address, TransactionReceipt, H256, U256},
    utils::keccak256,
};
use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument};

/// Event: CrossChainExecRequested(uint32 indexed destinationChainId, bytes execPayload, uint256 indexed nonce)
pub const CROSS_CHAIN_EXEC_REQUESTED: &str = "CrossChainExecRequested(uint32,bytes,uint256)";

pub fn request_topic() -> H256 {
    H256::from(keccak256(CROSS_CHAIN_EXEC_REQUESTED.as_bytes()))
}

struct Route {
    pair: RelayPair,
    resolver: Address,
    dest_dapp: Address,
}

pub struct EventGenerator {
    routes: Vec<Route>,
    clients: HashMap<u64, Arc<dyn ChainClient>>,
    polling_interval: Duration,
    event_sink: Arc<dyn RelaySink<RelayEvent>>,
    stop_tx: watch::Sender<bool>,
}

impl EventGenerator {
    pub fn new(
        relay_pairs: Vec<RelayPair>,
        clients: HashMap<u64, Arc<dyn ChainClient>>,
        polling_interval: Duration,
        event_sink: Arc<dyn RelaySink<RelayEvent>>,
    ) -> Result<Self> {
        let routes = relay_pairs
            .into_iter()
            .map(|pair| {
                let resolver = Address::from_str(&pair.source_resolver_address)
                    .context("Invalid resolver address")?;
                let dest_dapp = Address::from_str(&pair.dest_dapp_address)
                    .context("Invalid destination dapp address")?;
                Ok(Route {
                    pair,
                    resolver,
                    dest_dapp,
                })
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            routes,
            clients,
            polling_interval,
            event_sink,
            stop_tx: watch::channel(false).0,
        })
    }

    /// Poll every relay pair until [`EventGenerator::stop`] is called.
    #[instrument(skip(self), name = "event_generator_start")]
    pub async fn start(&self) -> Result<()> {
        info!(pairs = self.routes.len(), "Starting event generator");

        let mut stop_rx = self.stop_tx.subscribe();
        let mut interval_timer = time::interval(self.polling_interval);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = interval_timer.tick() => {}
                _ = stop_rx.changed() => continue,
            }
            self.check_all_pairs().await;
        }

        info!("Event generator stopped");
        Ok(())
    }

    /// Halts polling once the current iteration finishes.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Run one polling iteration, returning how many events were emitted.
    #[instrument(skip(self))]
    pub async fn check_all_pairs(&self) -> usize {
        let mut emitted = 0;
        for route in &self.routes {
            match self.check_cross_chain_events(route).await {
                Ok(Some(event)) => {
                    self.event_sink.submit(event);
                    emitted += 1;
                }
                Ok(None) => {}
                Err(e) => error!(
                    source_chain = route.pair.source_chain_id,
                    dest_chain = route.pair.dest_chain_id,
                    resolver = %route.pair.source_resolver_address,
                    error = %format!("{e:#}"),
                    "Error checking cross-chain events"
                ),
            }
        }
        emitted
    }

    fn client(&self, chain_id: u64) -> Result<&Arc<dyn ChainClient>> {
        self.clients
            .get(&chain_id)
            .ok_or_else(|| anyhow!("Chain {chain_id} not found in config"))
    }

    #[instrument(skip(self, route), fields(source_chain = route.pair.source_chain_id, dest_chain = route.pair.dest_chain_id))]
    async fn check_cross_chain_events(&self, route: &Route) -> Result<Option<RelayEvent>> {
        let source = self.client(route.pair.source_chain_id)?;
        let dest = self.client(route.pair.dest_chain_id)?;
        let dest_chain_id = u32::try_from(route.pair.dest_chain_id)
            .context("Destination chain id does not fit in uint32")?;

        let output = source
            .cross_chain_checker(route.resolver, dest_chain_id)
            .await?;
        if !output.can_exec {
            debug!("⏳ No cross-chain execution needed");
            return Ok(None);
        }

        info!(
            nonce = %output.nonce,
            source_chain = %source.chain().name,
            dest_chain = %dest.chain().name,
            "✅ Cross-chain execution needed"
        );

        let receipt = source
            .request_remote_execution(route.resolver, dest_chain_id)
            .await?;
        let tx_hash = receipt.transaction_hash;

        // The request already landed on chain, so a missing log is not retried here.
        let meta = extract_event_meta(&receipt, route.resolver)
            .with_context(|| format!("Request {tx_hash:?} confirmed without a usable request log"))?;

        info!(
            ?tx_hash,
            block_number = meta.block_number,
            log_index = meta.log_index,
            "Relay event detected"
        );

        Ok(Some(RelayEvent {
            source_chain: Arc::clone(source.chain()),
            source_resolver_address: route.resolver,
            destination_chain: Arc::clone(dest.chain()),
            dest_dapp_address: route.dest_dapp,
            exec_payload: output.exec_payload,
            nonce: output.nonce,
            meta: Some(meta),
        }))
    }
}

/// Locate the resolver's `CrossChainExecRequested` log and its receipt coordinates.
pub fn extract_event_meta(receipt: &TransactionReceipt, resolver: Address) -> Result<EventMeta> {
    let topic = request_topic();
    let log = receipt
        .logs
        .iter()
        .find(|log| log.address == resolver && log.topics.first() == Some(&topic))
        .ok_or_else(|| anyhow!("CrossChainExecRequested event not found in transaction"))?;

    let block_number = receipt
        .block_number
        .ok_or_else(|| anyhow!("block_number not found from receipt"))?
        .as_u64();
    let tx_index = u32::try_from(receipt.transaction_index.as_u64())
        .context("transaction_index out of range")?;
    let log_index = log
        .log_index
        .filter(|index| *index <= U256::from(u32::MAX))
        .ok_or_else(|| anyhow!("log_index not found from CrossChainExecRequested event"))?
        .as_u32();

    Ok(EventMeta {
        tx_hash: receipt.transaction_hash,
        block_number,
        tx_index,
        log_index,
    })
}
