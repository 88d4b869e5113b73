//! HTTP bindings for the wallet and presence services.

use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use spoils_of_war::proto::{CollaboratorError, TransactionId, TransferRequest};
use spoils_of_war::{PresenceOracle, TransactionIssuer};

use crate::SchedulerError;

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    transaction_id: TransactionId,
}

#[derive(Debug, Deserialize)]
struct PresenceResponse {
    online: bool,
}

/// `POST {base_url}/transactions` with the request as JSON and its
/// idempotency key in the `Idempotency-Key` header.
#[derive(Debug, Clone)]
pub struct HttpTransactionIssuer {
    endpoint: Url,
    client: Client,
    timeout_ms: u64,
}

impl HttpTransactionIssuer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SchedulerError> {
        let endpoint = endpoint_url(base_url, &["transactions"])?;
        Ok(Self {
            endpoint,
            client: build_client(timeout)?,
            timeout_ms: millis(timeout),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl TransactionIssuer for HttpTransactionIssuer {
    fn transfer(&self, request: &TransferRequest) -> Result<TransactionId, CollaboratorError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(IDEMPOTENCY_KEY_HEADER, request.idempotency_key.as_str())
            .json(request)
            .send()
            .map_err(|err| transport_error("transfer", self.timeout_ms, err))?;
        let body: TransactionResponse = decode(response, "transfer")?;
        if body.transaction_id.trim().is_empty() {
            return Err(CollaboratorError::Rejected {
                reason: "wallet returned an empty transaction id".to_string(),
            });
        }
        Ok(body.transaction_id)
    }
}

/// `GET {base_url}/players/{player_id}/presence?at_ms=…`.
#[derive(Debug, Clone)]
pub struct HttpPresenceOracle {
    base_url: Url,
    client: Client,
    timeout_ms: u64,
}

impl HttpPresenceOracle {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SchedulerError> {
        Ok(Self {
            base_url: endpoint_url(base_url, &[])?,
            client: build_client(timeout)?,
            timeout_ms: millis(timeout),
        })
    }

    fn presence_url(&self, player_id: &str, at_ms: i64) -> Result<Url, CollaboratorError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CollaboratorError::Rejected {
                reason: format!("presence base url cannot carry a path: {}", self.base_url),
            })?
            .pop_if_empty()
            .extend(["players", player_id, "presence"]);
        url.query_pairs_mut()
            .append_pair("at_ms", &at_ms.to_string());
        Ok(url)
    }
}

impl PresenceOracle for HttpPresenceOracle {
    fn is_online(&self, player_id: &str, at_ms: i64) -> Result<bool, CollaboratorError> {
        let url = self.presence_url(player_id, at_ms)?;
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| transport_error("presence", self.timeout_ms, err))?;
        let body: PresenceResponse = decode(response, "presence")?;
        Ok(body.online)
    }
}

fn build_client(timeout: Duration) -> Result<Client, SchedulerError> {
    Client::builder()
        .timeout(timeout.max(Duration::from_millis(1)))
        .build()
        .map_err(|err| SchedulerError::BuildClient {
            message: err.to_string(),
        })
}

fn endpoint_url(base_url: &str, segments: &[&str]) -> Result<Url, SchedulerError> {
    let mut url = Url::parse(base_url.trim()).map_err(|err| SchedulerError::InvalidConfig {
        reason: format!("invalid service url {base_url}: {err}"),
    })?;
    if !segments.is_empty() {
        url.path_segments_mut()
            .map_err(|_| SchedulerError::InvalidConfig {
                reason: format!("service url cannot carry a path: {base_url}"),
            })?
            .pop_if_empty()
            .extend(segments);
    }
    Ok(url)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn transport_error(operation: &str, timeout_ms: u64, err: reqwest::Error) -> CollaboratorError {
    if err.is_timeout() {
        return CollaboratorError::Timeout {
            operation: operation.to_string(),
            timeout_ms,
        };
    }
    CollaboratorError::Unavailable {
        reason: format!("{operation} request failed: {err}"),
    }
}

fn decode<T: DeserializeOwned>(
    response: Response,
    operation: &str,
) -> Result<T, CollaboratorError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().unwrap_or_default();
        return Err(classify_status(operation, status, message));
    }
    response.json().map_err(|err| CollaboratorError::Rejected {
        reason: format!("{operation} response could not be decoded: {err}"),
    })
}

/// Server errors, 408 and 429 may succeed on retry; every other non-2xx
/// status is a rejection.
pub fn classify_status(operation: &str, status: StatusCode, message: String) -> CollaboratorError {
    let reason = format!("{operation} returned {}: {message}", status.as_u16());
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        CollaboratorError::Unavailable { reason }
    } else {
        CollaboratorError::Rejected { reason }
    }
}
