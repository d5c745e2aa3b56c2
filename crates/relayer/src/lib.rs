mod app;
pub mod chain;
mod config;
mod event_deliverer;
mod event_generator;
pub mod proof_fetcher;
pub mod queue;
#[cfg(test)]
mod test_support;
mod types;

pub use app::RelayerApp;
pub use config::{
    ChainConfig, ProofApiConfig, RelayPair, RelayerConfig, RetryConfig, TimeoutConfig,
    API_TOKEN_ENV, PRIVATE_KEY_ENV,
};
pub use event_deliverer::{DeliveryWorker, EventDeliverer};
pub use event_generator::{extract_event_meta, request_topic, EventGenerator};
pub use proof_fetcher::{ProofFetcher, ProofWorker};
pub use types::{
    AttestationRpcError, DeliveryRequest, Disposition, EventMeta, ProofRequest, RelayEvent,
    RelayerError,
};
