//! [`LedgerClient`] over the ledger gateway's HTTP API.
//!
//! The gateway fronts the ledger network and owns signing and consensus. This
//! client only speaks JSON to it:
//!
//! - `POST {endpoint}/mints` and `POST {endpoint}/transfers` submit operations
//! - `GET {endpoint}/receipts/{idempotency_key}` looks up a previous submission
//!
//! A `4xx` answer is a deterministic refusal, except 401, 403, 408, 409 and
//! 429. Those, `5xx` answers and connection failures leave the outcome unknown.

use impact_core::ledger::{
    IdempotencyKey, LedgerClient, LedgerError, LedgerFuture, MintReceipt, MintRequest,
    ReceiptId, ReceiptStatus, TransferReceipt, TransferRequest,
};
use impact_core::types::LedgerAccount;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

#[derive(Deserialize)]
struct MintBody {
    receipt_id: String,
    serial: u64,
}

#[derive(Deserialize)]
struct TransferBody {
    receipt_id: String,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ReceiptBody {
    Confirmed {
        receipt_id: String,
        serial: Option<u64>,
    },
    Rejected {
        reason: String,
    },
    Unknown,
}

impl From<ReceiptBody> for ReceiptStatus {
    fn from(body: ReceiptBody) -> Self {
        match body {
            ReceiptBody::Confirmed { receipt_id, serial } => Self::Confirmed {
                receipt_id: ReceiptId::new(receipt_id),
                serial,
            },
            ReceiptBody::Rejected { reason } => Self::Rejected { reason },
            ReceiptBody::Unknown => Self::Unknown,
        }
    }
}

/// Ledger gateway client.
#[derive(Clone, Debug)]
pub struct HttpLedgerClient {
    client: Client,
    endpoint: String,
    operator: LedgerAccount,
    api_key: String,
}

impl HttpLedgerClient {
    /// Create a client for `endpoint`, acting as `operator`.
    ///
    /// `request_timeout` caps the transport; the services apply their own,
    /// usually shorter, deadline on top.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Transport`] if the HTTP client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        operator: LedgerAccount,
        api_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            operator,
            api_key: api_key.into(),
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.api_key)
            .header("x-ledger-operator", self.operator.as_str())
    }

    async fn send(builder: RequestBuilder) -> Result<Response, LedgerError> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LedgerError::Timeout
            } else {
                LedgerError::Transport(e.to_string())
            }
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, LedgerError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| LedgerError::Transport(format!("undecodable answer: {e}")));
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, body))
    }
}

/// Client errors that say nothing final about the submitted operation.
///
/// 408 and 429 ask for a retry, 409 means the same idempotency key is still
/// being processed, and 401/403 point at the operator's credentials.
fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::REQUEST_TIMEOUT
            | StatusCode::CONFLICT
            | StatusCode::TOO_MANY_REQUESTS
    )
}

fn classify(status: StatusCode, body: String) -> LedgerError {
    if status.is_client_error() && !is_retryable(status) {
        LedgerError::Rejected {
            reason: if body.is_empty() {
                status.to_string()
            } else {
                body
            },
        }
    } else {
        LedgerError::Transport(format!("gateway answered {status}: {body}"))
    }
}

impl LedgerClient for HttpLedgerClient {
    fn mint(&self, request: MintRequest) -> LedgerFuture<'_, MintReceipt> {
        Box::pin(async move {
            let builder = self
                .client
                .post(format!("{}/mints", self.endpoint))
                .header("idempotency-key", request.key.as_str())
                .json(&request);
            let response = Self::send(self.authorized(builder)).await?;
            let body: MintBody = Self::decode(response).await?;
            Ok(MintReceipt {
                receipt_id: ReceiptId::new(body.receipt_id),
                serial: body.serial,
            })
        })
    }

    fn transfer(&self, request: TransferRequest) -> LedgerFuture<'_, TransferReceipt> {
        Box::pin(async move {
            let builder = self
                .client
                .post(format!("{}/transfers", self.endpoint))
                .header("idempotency-key", request.key.as_str())
                .json(&request);
            let response = Self::send(self.authorized(builder)).await?;
            let body: TransferBody = Self::decode(response).await?;
            Ok(TransferReceipt {
                receipt_id: ReceiptId::new(body.receipt_id),
            })
        })
    }

    fn query_receipt(&self, key: &IdempotencyKey) -> LedgerFuture<'_, ReceiptStatus> {
        let url = format!("{}/receipts/{}", self.endpoint, key.as_str());
        Box::pin(async move {
            let response = Self::send(self.authorized(self.client.get(url))).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(ReceiptStatus::Unknown);
            }
            let body: ReceiptBody = Self::decode(response).await?;
            Ok(body.into())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use impact_core::ledger::MintMetadata;
    use impact_core::types::{EventId, RequestId, TicketKind};

    #[test]
    fn receipt_bodies_map_to_statuses() {
        let confirmed: ReceiptBody =
            serde_json::from_str(r#"{"status":"confirmed","receipt_id":"0.0.5@1","serial":3}"#)
                .unwrap();
        assert_eq!(
            ReceiptStatus::from(confirmed),
            ReceiptStatus::Confirmed {
                receipt_id: ReceiptId::new("0.0.5@1"),
                serial: Some(3)
            }
        );

        let unknown: ReceiptBody = serde_json::from_str(r#"{"status":"unknown"}"#).unwrap();
        assert_eq!(ReceiptStatus::from(unknown), ReceiptStatus::Unknown);
    }

    #[test]
    fn only_final_client_errors_reject() {
        assert!(matches!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, "insufficient balance".to_string()),
            LedgerError::Rejected { reason } if reason == "insufficient balance"
        ));
        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::CONFLICT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
        ] {
            assert!(classify(status, String::new()).is_indeterminate(), "{status}");
        }
    }

    /// Serve `status` with `body` for every mint, on a random local port.
    async fn gateway(status: u16, body: &'static str) -> HttpLedgerClient {
        let code = axum::http::StatusCode::from_u16(status).unwrap();
        let app = axum::Router::new().route(
            "/mints",
            axum::routing::post(move || async move {
                (code, [("content-type", "application/json")], body)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        HttpLedgerClient::new(
            format!("http://{addr}"),
            LedgerAccount::parse("0.0.1").unwrap(),
            "key",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn mint_request() -> MintRequest {
        let event_id = EventId::new();
        let account = LedgerAccount::parse("0.0.42").unwrap();
        MintRequest {
            key: IdempotencyKey::for_mint(event_id, &RequestId::parse("r1").unwrap()),
            event_id,
            recipient: account.clone(),
            metadata: MintMetadata {
                event_id,
                buyer_account: account,
                kind: TicketKind::Standard,
                purchased_at: chrono::Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn in_flight_key_leaves_the_mint_unknown() {
        let client = gateway(409, r#"{"error":"duplicate in flight"}"#).await;
        let err = client.mint(mint_request()).await.unwrap_err();
        assert!(matches!(err, LedgerError::Transport(_)), "{err:?}");
    }

    #[tokio::test]
    async fn throttling_leaves_the_mint_unknown() {
        let client = gateway(429, "").await;
        let err = client.mint(mint_request()).await.unwrap_err();
        assert!(err.is_indeterminate());
    }

    #[tokio::test]
    async fn refusals_are_final() {
        let client = gateway(422, "event closed").await;
        let err = client.mint(mint_request()).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::Rejected {
                reason: "event closed".to_string()
            }
        );
    }

    #[tokio::test]
    async fn accepted_mints_decode() {
        let client = gateway(200, r#"{"receipt_id":"0.0.5@7","serial":12}"#).await;
        let receipt = client.mint(mint_request()).await.unwrap();
        assert_eq!(receipt.receipt_id, ReceiptId::new("0.0.5@7"));
        assert_eq!(receipt.serial, 12);
    }

    #[test]
    fn endpoint_is_normalized() {
        let client = HttpLedgerClient::new(
            "http://gateway.local/",
            LedgerAccount::parse("0.0.1").unwrap(),
            "key",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.endpoint, "http://gateway.local");
    }
}
