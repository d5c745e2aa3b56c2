mod client;

pub use client::{decode_proof, fetch_proof, PollPolicy, ProofApi, ProofApiClient, ProofStatus};

use crate::queue::{Processor, RelaySink, RetryPolicy, WorkQueue};
use crate::types::{DeliveryRequest, ProofRequest, RelayEvent, RelayerError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, info_span, Span};

/// Turns a detected [`RelayEvent`] into a [`DeliveryRequest`] carrying its proof.
pub struct ProofWorker {
    api: Arc<dyn ProofApi>,
    poll: PollPolicy,
    delivery: Arc<dyn RelaySink<DeliveryRequest>>,
}

#[async_trait]
impl Processor for ProofWorker {
    type Item = RelayEvent;
    const NAME: &'static str = "proof_fetcher";

    fn span(&self, event: &RelayEvent) -> Span {
        info_span!(
            "fetch_proof",
            source_chain_id = event.source_chain.chain_id,
            dest_chain_id = event.destination_chain.chain_id,
            nonce = %event.nonce,
            tx_hash = ?event.meta.as_ref().map(|m| m.tx_hash),
        )
    }

    async fn process(&self, event: &RelayEvent) -> Result<(), RelayerError> {
        let request = ProofRequest::try_from(event)?;

        info!("Fetching proof from Polymer API");
        let proof = fetch_proof(self.api.as_ref(), &request, self.poll).await?;
        info!(proof_len = proof.len(), "Proof fetched successfully");

        self.delivery
            .submit(DeliveryRequest::new(event.clone(), proof));
        Ok(())
    }
}

pub struct ProofFetcher {
    queue: Arc<WorkQueue<ProofWorker>>,
}

impl ProofFetcher {
    pub fn new(
        api: Arc<dyn ProofApi>,
        poll: PollPolicy,
        retry: RetryPolicy,
        delivery: Arc<dyn RelaySink<DeliveryRequest>>,
    ) -> Self {
        let worker = ProofWorker {
            api,
            poll,
            delivery,
        };
        Self {
            queue: WorkQueue::new(worker, retry),
        }
    }

    pub fn submit(&self, event: RelayEvent) {
        self.queue.submit(event);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }
}

impl RelaySink<RelayEvent> for ProofFetcher {
    fn submit(&self, event: RelayEvent) {
        ProofFetcher::submit(self, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttestationRpcError, ChainConfig, EventMeta};
    use anyhow::Result;
    use ethers::types::{Address, Bytes, H256, U256};
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicU32, Ordering},
            Mutex,
        },
        time::Duration,
    };
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeApi {
        request_errors: Mutex<VecDeque<&'static str>>,
        statuses: Mutex<VecDeque<ProofStatus>>,
        requests: AtomicU32,
        queries: AtomicU32,
    }

    impl FakeApi {
        fn with_statuses(statuses: &[(&str, &str)]) -> Self {
            let api = Self::default();
            *api.statuses.lock().unwrap() = statuses
                .iter()
                .map(|(status, proof)| ProofStatus {
                    status: status.to_string(),
                    proof: proof.to_string(),
                })
                .collect();
            api
        }

        fn failing_requests(self, errors: &[&'static str]) -> Self {
            self.request_errors.lock().unwrap().extend(errors);
            self
        }
    }

    #[async_trait]
    impl ProofApi for FakeApi {
        async fn request_proof(&self, _: &ProofRequest) -> Result<i64> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            match self.request_errors.lock().unwrap().pop_front() {
                Some(message) => Err(AttestationRpcError {
                    method: "log_requestProof",
                    code: -32000,
                    message: message.into(),
                }
                .into()),
                None => Ok(55),
            }
        }

        async fn query_proof(&self, job_id: i64) -> Result<ProofStatus> {
            assert_eq!(job_id, 55);
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ProofStatus {
                    status: "pending".into(),
                    proof: String::new(),
                }))
        }
    }

    fn chain(chain_id: u64) -> Arc<ChainConfig> {
        Arc::new(ChainConfig {
            name: format!("chain-{chain_id}"),
            chain_id,
            rpc_url: "http://localhost:8545".into(),
        })
    }

    fn event(meta: Option<EventMeta>) -> RelayEvent {
        RelayEvent {
            source_chain: chain(11155420),
            source_resolver_address: Address::repeat_byte(1),
            destination_chain: chain(84532),
            dest_dapp_address: Address::repeat_byte(2),
            exec_payload: Bytes::from(vec![0xab, 0xcd]),
            nonce: U256::from(7),
            meta,
        }
    }

    fn located() -> RelayEvent {
        event(Some(EventMeta {
            tx_hash: H256::repeat_byte(0xaa),
            block_number: 100,
            tx_index: 1,
            log_index: 2,
        }))
    }

    fn fetcher(
        api: Arc<FakeApi>,
        retry: RetryPolicy,
    ) -> (ProofFetcher, mpsc::UnboundedReceiver<DeliveryRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let poll = PollPolicy {
            max_attempts: 5,
            interval: Duration::ZERO,
        };
        (ProofFetcher::new(api, poll, retry, Arc::new(tx)), rx)
    }

    #[tokio::test]
    async fn ready_proof_becomes_delivery_request() {
        let api = Arc::new(FakeApi::with_statuses(&[
            ("pending", ""),
            ("ready", "0x1234"),
        ]));
        let (fetcher, mut rx) = fetcher(api.clone(), RetryPolicy::IMMEDIATE);

        fetcher.submit(located());
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.event, located());
        assert_eq!(delivery.proof, Bytes::from(vec![0x12, 0x34]));
        assert_eq!(delivery.destination_chain_id, 84532);
        assert_eq!(api.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_coordinates_are_dropped_without_calling_api() {
        let api = Arc::new(FakeApi::default());
        let (fetcher, mut rx) = fetcher(api.clone(), RetryPolicy::IMMEDIATE);

        fetcher.submit(event(None));
        fetcher.wait_idle().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(api.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn not_found_is_dropped() {
        let api = Arc::new(FakeApi::default().failing_requests(&["log not found"]));
        let (fetcher, mut rx) = fetcher(api.clone(), RetryPolicy::IMMEDIATE);

        fetcher.submit(located());
        fetcher.wait_idle().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(api.requests.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.pending(), 0);
    }

    #[tokio::test]
    async fn transient_request_failure_is_retried() {
        let api = Arc::new(
            FakeApi::with_statuses(&[("complete", "EjQ=")]).failing_requests(&["503 unavailable"]),
        );
        let (fetcher, mut rx) = fetcher(api.clone(), RetryPolicy::IMMEDIATE);

        fetcher.submit(located());
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.event, located());
        assert_eq!(api.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_for_every_poll_times_out() {
        let api = Arc::new(FakeApi::default());
        let err = fetch_proof(
            api.as_ref(),
            &ProofRequest::try_from(&located()).unwrap(),
            PollPolicy::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RelayerError::ProofTimeout { attempts: 5 }));
        assert_eq!(api.queries.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn timeout_requeues_event() {
        let api = Arc::new(FakeApi::default());
        let retry = RetryPolicy {
            max_attempts: Some(2),
            ..RetryPolicy::IMMEDIATE
        };
        let (fetcher, mut rx) = fetcher(api.clone(), retry);

        fetcher.submit(located());
        fetcher.wait_idle().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(api.requests.load(Ordering::SeqCst), 2);
        assert_eq!(api.queries.load(Ordering::SeqCst), 10);
    }
}
