//! Pull-mode callback delivery.
//!
//! Each dispatched event's result is POSTed to the upstream at
//! `/callbacks/{callbackId}`. Delivery follows the transport retry
//! taxonomy:
//!
//! - transport errors and 5xx: retried, at most 3 attempts with jittered
//!   backoff
//! - 404: terminal - the callback expired upstream
//! - 400: retried once with the payload wrapped as `{result: payload}`
//! - any other 4xx: terminal rejection
//!
//! Delivery failure never fails the stream; the caller logs and the cursor
//! advances regardless.

use serde_json::{json, Value};

use relay_core::retry::RetryPolicy;

/// Terminal state of one callback delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackDelivery {
    /// The upstream acknowledged the result.
    Delivered,
    /// The callback id expired upstream (404).
    Expired,
    /// The upstream rejected the payload (non-retryable 4xx).
    Rejected {
        /// The HTTP status received.
        status: u16,
    },
    /// The transport retry budget was exhausted.
    Exhausted {
        /// The last failure observed.
        reason: String,
    },
}

impl CallbackDelivery {
    /// Returns true when the upstream acknowledged the result.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Posts per-event results back to the upstream.
#[derive(Debug, Clone)]
pub struct CallbackPoster {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl CallbackPoster {
    /// Creates a poster for the given upstream base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token,
        }
    }

    /// Delivers one result payload.
    pub async fn post(&self, callback_id: &str, payload: &Value) -> CallbackDelivery {
        let url = format!(
            "{}/callbacks/{callback_id}",
            self.base_url.trim_end_matches('/')
        );
        let policy = RetryPolicy::storage();

        let mut wrapped = false;
        let mut attempt = 0;
        let mut last_failure = String::new();

        while attempt < policy.max_attempts {
            attempt += 1;

            let body = if wrapped {
                json!({ "result": payload })
            } else {
                payload.clone()
            };
            let mut request = self.client.post(&url).json(&body);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let status = match request.send().await {
                Ok(response) => response.status(),
                Err(e) => {
                    last_failure = e.to_string();
                    tracing::warn!(callback_id, attempt, error = %e, "Callback transport failure");
                    tokio::time::sleep(policy.delay(attempt)).await;
                    continue;
                }
            };

            if status.is_success() {
                return CallbackDelivery::Delivered;
            }
            if status == reqwest::StatusCode::NOT_FOUND {
                return CallbackDelivery::Expired;
            }
            if status == reqwest::StatusCode::BAD_REQUEST {
                if wrapped {
                    return CallbackDelivery::Rejected {
                        status: status.as_u16(),
                    };
                }
                // One wrapped retry: some upstreams expect an enveloped body.
                wrapped = true;
                continue;
            }
            if status.is_client_error() {
                return CallbackDelivery::Rejected {
                    status: status.as_u16(),
                };
            }

            last_failure = format!("status {status}");
            tracing::warn!(callback_id, attempt, %status, "Callback rejected, retrying");
            tokio::time::sleep(policy.delay(attempt)).await;
        }

        CallbackDelivery::Exhausted {
            reason: last_failure,
        }
    }
}
