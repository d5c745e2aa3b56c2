use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use ethers::{types::Bytes, utils::hex};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::types::{AttestationRpcError, ProofRequest, RelayerError};

#[derive(Serialize)]
struct JsonRpcRequest<P> {
    jsonrpc: &'static str,
    id: i64,
    method: &'static str,
    params: P,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Status of a proof job as reported by `log_queryProof`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ProofStatus {
    #[serde(default)]
    pub proof: String,
    pub status: String,
}

impl ProofStatus {
    pub fn is_ready(&self) -> bool {
        self.status == "ready" || self.status == "complete"
    }
}

/// The attestation service's asynchronous job API.
#[async_trait]
pub trait ProofApi: Send + Sync {
    async fn request_proof(&self, request: &ProofRequest) -> Result<i64>;

    async fn query_proof(&self, job_id: i64) -> Result<ProofStatus>;
}

pub struct ProofApiClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ProofApiClient {
    pub fn new(token: String, endpoint: String, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("Attestation token is not a valid header value")?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("Failed to build attestation HTTP client")?;
        Ok(Self { http, endpoint })
    }

    async fn call<P: Serialize + Send + Sync, T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: P,
    ) -> Result<T> {
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?;

        let status = response.status();
        let text = response.text().await?;
        debug!(response = %text, method, status = status.as_u16(), "Raw attestation response");
        if !status.is_success() {
            bail!("{method} returned HTTP status {}", status.as_u16());
        }
        let response: JsonRpcResponse<T> = serde_json::from_str(&text)
            .with_context(|| format!("Unexpected {method} response body"))?;

        match (response.result, response.error) {
            (_, Some(error)) => Err(AttestationRpcError {
                method,
                code: error.code,
                message: error.message,
            }
            .into()),
            (Some(result), None) => Ok(result),
            (None, None) => Err(anyhow!("{method} returned neither result nor error")),
        }
    }
}

#[async_trait]
impl ProofApi for ProofApiClient {
    #[instrument(skip(self), fields(chain_id = request.chain_id, block_number = request.block_number, tx_index = request.tx_index, log_index = request.log_index))]
    async fn request_proof(&self, request: &ProofRequest) -> Result<i64> {
        let params = [
            request.chain_id,
            request.block_number,
            u64::from(request.tx_index),
            u64::from(request.log_index),
        ];
        self.call("log_requestProof", params).await
    }

    #[instrument(skip(self))]
    async fn query_proof(&self, job_id: i64) -> Result<ProofStatus> {
        self.call("log_queryProof", [job_id]).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(2),
        }
    }
}

/// Submit a proof job and poll it until it is ready or the attempts run out.
#[instrument(skip(api, policy), fields(chain_id = request.chain_id, block_number = request.block_number, tx_index = request.tx_index, log_index = request.log_index))]
pub async fn fetch_proof(
    api: &dyn ProofApi,
    request: &ProofRequest,
    policy: PollPolicy,
) -> Result<Bytes, RelayerError> {
    let job_id = api
        .request_proof(request)
        .await
        .map_err(RelayerError::from_proof_failure)?;
    info!(job_id, "Proof job submitted");

    for attempt in 1..=policy.max_attempts {
        let status = api
            .query_proof(job_id)
            .await
            .map_err(RelayerError::from_proof_failure)?;
        if status.is_ready() {
            return decode_proof(&status.proof).map_err(RelayerError::from_proof_failure);
        }

        debug!(job_id, attempt, status = %status.status, "Proof not ready");
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(RelayerError::ProofTimeout {
        attempts: policy.max_attempts,
    })
}

/// Proofs arrive either as `0x` hex or as base64.
pub fn decode_proof(raw: &str) -> Result<Bytes> {
    let raw = raw.trim();
    let bytes = match raw.strip_prefix("0x") {
        Some(digits) => hex::decode(digits).context("Proof is not valid hex")?,
        None => general_purpose::STANDARD
            .decode(raw)
            .context("Proof is not valid base64")?,
    };
    ensure!(!bytes.is_empty(), "Proof is empty");
    Ok(Bytes::from(bytes))
}
