use crate::chain::ChainClient;
use crate::queue::{Processor, RelaySink, RetryPolicy, WorkQueue};
use crate::types::{DeliveryRequest, RelayerError};
use anyhow::anyhow;
use async_trait::async_trait;
use ethers::core::types::{U256, U64};
use std::{collections::HashMap, sync::Arc};
use tracing::{info, info_span, Span};

/// Submits `exec_payload || proof` to the destination dapp.
pub struct DeliveryWorker {
    clients: HashMap<u64, Arc<dyn ChainClient>>,
    gas_limit: U256,
}

#[async_trait]
impl Processor for DeliveryWorker {
    type Item = DeliveryRequest;
    const NAME: &'static str = "event_deliverer";

    fn span(&self, delivery: &DeliveryRequest) -> Span {
        info_span!(
            "deliver_event",
            source_chain = %delivery.event.source_chain.name,
            dest_chain = %delivery.event.destination_chain.name,
            dest_contract = ?delivery.destination_contract_address,
            nonce = %delivery.event.nonce,
        )
    }

    async fn process(&self, delivery: &DeliveryRequest) -> Result<(), RelayerError> {
        let client = self
            .clients
            .get(&delivery.destination_chain_id)
            .ok_or_else(|| {
                anyhow!(
                    "Destination chain {} not found in config",
                    delivery.destination_chain_id
                )
            })?;

        info!("Submitting proof to destination chain");
        let receipt = client
            .send_calldata(
                delivery.destination_contract_address,
                delivery.calldata(),
                self.gas_limit,
            )
            .await
            .map_err(RelayerError::from_delivery_failure)?;

        // Fixed gas skips estimation, so a rejected proof only shows up as a reverted receipt.
        if receipt.status == Some(U64::zero()) {
            return Err(RelayerError::Transient(anyhow!(
                "Delivery transaction {:?} reverted in block {:?}",
                receipt.transaction_hash,
                receipt.block_number
            )));
        }

        info!(
            tx_hash = ?receipt.transaction_hash,
            block_number = ?receipt.block_number,
            "Proof submission confirmed"
        );
        Ok(())
    }
}

pub struct EventDeliverer {
    queue: Arc<WorkQueue<DeliveryWorker>>,
}

impl EventDeliverer {
    pub fn new(
        clients: HashMap<u64, Arc<dyn ChainClient>>,
        gas_limit: u64,
        retry: RetryPolicy,
    ) -> Self {
        let worker = DeliveryWorker {
            clients,
            gas_limit: U256::from(gas_limit),
        };
        Self {
            queue: WorkQueue::new(worker, retry),
        }
    }

    pub fn submit(&self, delivery: DeliveryRequest) {
        self.queue.submit(delivery);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }
}

impl RelaySink<DeliveryRequest> for EventDeliverer {
    fn submit(&self, delivery: DeliveryRequest) {
        EventDeliverer::submit(self, delivery);
    }
}
