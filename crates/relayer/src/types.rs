use ethers::core::types::{Address, Bytes, H256, U256};
use std::sync::Arc;

// Re-export the config types
pub use crate::config::{ChainConfig, RelayPair};

/// Where the request log landed on the source chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub tx_hash: H256,
    pub block_number: u64,
    pub tx_index: u32,
    pub log_index: u32,
}

// Event detected by the event generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    pub source_chain: Arc<ChainConfig>,
    pub source_resolver_address: Address,
    pub destination_chain: Arc<ChainConfig>,
    pub dest_dapp_address: Address,
    pub exec_payload: Bytes,
    /// Assigned by the resolver contract, only used for correlation.
    pub nonce: U256,
    pub meta: Option<EventMeta>,
}

/// Coordinates the attestation service needs to locate the request log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofRequest {
    pub chain_id: u64,
    pub block_number: u64,
    pub tx_index: u32,
    pub log_index: u32,
}

impl TryFrom<&RelayEvent> for ProofRequest {
    type Error = RelayerError;

    fn try_from(event: &RelayEvent) -> Result<Self, Self::Error> {
        let meta = event
            .meta
            .as_ref()
            .ok_or(RelayerError::MissingCoordinates)?;
        Ok(Self {
            chain_id: event.source_chain.chain_id,
            block_number: meta.block_number,
            tx_index: meta.tx_index,
            log_index: meta.log_index,
        })
    }
}

// Delivery request sent to the event deliverer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub destination_chain_id: u64,
    pub destination_contract_address: Address,
    pub event: RelayEvent,
    pub proof: Bytes,
}

impl DeliveryRequest {
    pub fn new(event: RelayEvent, proof: Bytes) -> Self {
        Self {
            destination_chain_id: event.destination_chain.chain_id,
            destination_contract_address: event.dest_dapp_address,
            event,
            proof,
        }
    }

    /// Calldata sent to the destination: `exec_payload || proof`.
    pub fn calldata(&self) -> Bytes {
        let mut data = Vec::with_capacity(self.event.exec_payload.len() + self.proof.len());
        data.extend_from_slice(&self.event.exec_payload);
        data.extend_from_slice(&self.proof);
        Bytes::from(data)
    }
}

/// What a stage does with an item after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Drop,
}

// Define error types
#[derive(Debug, thiserror::Error)]
pub enum RelayerError {
    #[error("Event is missing receipt coordinates")]
    MissingCoordinates,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transaction already known or superseded: {0}")]
    AlreadyKnown(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Timeout waiting for proof after {attempts} attempts")]
    ProofTimeout { attempts: u32 },

    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

/// Error object returned by the attestation service's JSON-RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{method} failed with code {code}: {message}")]
pub struct AttestationRpcError {
    pub method: &'static str,
    pub code: i64,
    pub message: String,
}

const ALREADY_KNOWN_PATTERNS: &[&str] = &[
    "nonce too low",
    "already known",
    "replacement transaction underpriced",
];

const MALFORMED_PATTERNS: &[&str] = &[
    "invalid argument",
    "invalid_argument",
    "abi encoding",
    "abi error",
    "invalid hex",
    "odd number of digits",
];

impl RelayerError {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::ProofTimeout { .. } | Self::Transient(_) => Disposition::Retry,
            Self::MissingCoordinates
            | Self::NotFound(_)
            | Self::AlreadyKnown(_)
            | Self::Malformed(_) => Disposition::Drop,
        }
    }

    /// Classify a failure while obtaining a proof. Only the service's own
    /// error message can mark the log or job as unresolvable.
    pub fn from_proof_failure(err: anyhow::Error) -> Self {
        match err.downcast_ref::<AttestationRpcError>() {
            Some(rpc) if rpc.message.to_lowercase().contains("not found") => {
                Self::NotFound(rpc.to_string())
            }
            _ => Self::Transient(err),
        }
    }

    /// Classify a failure while submitting to the destination chain.
    pub fn from_delivery_failure(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        let lower = message.to_lowercase();
        if ALREADY_KNOWN_PATTERNS.iter().any(|p| lower.contains(p)) {
            Self::AlreadyKnown(message)
        } else if MALFORMED_PATTERNS.iter().any(|p| lower.contains(p)) {
            Self::Malformed(message)
        } else {
            Self::Transient(err)
        }
    }
}
