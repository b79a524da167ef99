use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{sync::Mutex, time::Duration};
use tracing::debug;

use crate::credential::CardIdentity;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider returned {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Short machine-readable code stored with failed sync jobs.
    pub fn code(&self) -> String {
        match self {
            ProviderError::Api {
                code: Some(code), ..
            } => code.clone(),
            ProviderError::Api { status, .. } => format!("HTTP_{status}"),
            ProviderError::Transport(e) if e.is_timeout() => "TIMEOUT".to_string(),
            ProviderError::Transport(_) => "NETWORK_ERROR".to_string(),
            ProviderError::Decode(_) => "DECODE_ERROR".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterCardRequest {
    pub identity: CardIdentity,
    pub display_name: Option<String>,
    pub initial_points: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredCard {
    #[serde(alias = "cardId")]
    pub remote_card_id: String,
    #[serde(default, alias = "passId")]
    pub remote_pass_id: Option<String>,
    #[serde(default)]
    pub qr_code: Option<String>,
}

/// Reference sent with balance-changing calls. The provider uses
/// `reference` to recognise a repeated call for the same job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionContext {
    pub reference: String,
    pub reason: Option<String>,
    pub order_id: Option<i64>,
}

/// Operations on the wallet provider.
///
/// Every call may be repeated for the same job after a crash or lease
/// expiry, so implementations must be idempotent: points updates set an
/// absolute balance rather than adding to it.
#[async_trait]
pub trait LoyaltyProvider: Send + Sync {
    async fn register_card(&self, req: &RegisterCardRequest) -> Result<RegisteredCard, ProviderError>;

    /// Set the card's balance to `balance`.
    async fn update_points(
        &self,
        remote_card_id: &str,
        balance: i64,
        tx: &TransactionContext,
    ) -> Result<Value, ProviderError>;

    async fn redeem_points(
        &self,
        remote_card_id: &str,
        points: i64,
        tx: &TransactionContext,
    ) -> Result<Value, ProviderError>;

    async fn deactivate_card(&self, remote_card_id: &str) -> Result<Value, ProviderError>;

    async fn update_tier(&self, remote_card_id: &str, tier: &str) -> Result<Value, ProviderError>;

    async fn update_profile(&self, remote_card_id: &str, profile: &Value) -> Result<Value, ProviderError>;
}

/// REST client for the Luyoa loyalty API.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Value, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "calling loyalty provider");

        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_key);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let message = body["message"]
                .as_str()
                .or_else(|| status.canonical_reason())
                .unwrap_or("request failed")
                .to_string();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                code: body["code"].as_str().map(String::from),
                message,
            });
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(json!({}));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl LoyaltyProvider for HttpProvider {
    async fn register_card(&self, req: &RegisterCardRequest) -> Result<RegisteredCard, ProviderError> {
        let body = serde_json::to_value(req).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let reference = format!("register-{}", req.identity.pass_serial_number);
        let response = self
            .send(Method::POST, "/cards", Some(&body), Some(&reference))
            .await?;

        // Some endpoints wrap the card in `data`.
        let card = response.get("data").cloned().unwrap_or(response);
        serde_json::from_value(card).map_err(|e| ProviderError::Decode(e.to_string()))
    }

    async fn update_points(
        &self,
        remote_card_id: &str,
        balance: i64,
        tx: &TransactionContext,
    ) -> Result<Value, ProviderError> {
        let body = json!({ "points": balance, "transaction": tx });
        self.send(
            Method::PUT,
            &format!("/cards/{remote_card_id}/points"),
            Some(&body),
            Some(&tx.reference),
        )
        .await
    }

    async fn redeem_points(
        &self,
        remote_card_id: &str,
        points: i64,
        tx: &TransactionContext,
    ) -> Result<Value, ProviderError> {
        let body = json!({ "points": points, "transaction": tx });
        self.send(
            Method::POST,
            &format!("/cards/{remote_card_id}/redeem"),
            Some(&body),
            Some(&tx.reference),
        )
        .await
    }

    async fn deactivate_card(&self, remote_card_id: &str) -> Result<Value, ProviderError> {
        self.send(
            Method::POST,
            &format!("/cards/{remote_card_id}/deactivate"),
            None,
            None,
        )
        .await
    }

    async fn update_tier(&self, remote_card_id: &str, tier: &str) -> Result<Value, ProviderError> {
        let body = json!({ "tier": tier });
        self.send(
            Method::PUT,
            &format!("/cards/{remote_card_id}/tier"),
            Some(&body),
            None,
        )
        .await
    }

    async fn update_profile(&self, remote_card_id: &str, profile: &Value) -> Result<Value, ProviderError> {
        self.send(
            Method::PUT,
            &format!("/cards/{remote_card_id}/profile"),
            Some(profile),
            None,
        )
        .await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCall {
    RegisterCard { client_id: i64 },
    UpdatePoints { remote_card_id: String, balance: i64 },
    RedeemPoints { remote_card_id: String, points: i64 },
    DeactivateCard { remote_card_id: String },
    UpdateTier { remote_card_id: String, tier: String },
    UpdateProfile { remote_card_id: String },
}

/// Mock implementation for testing
#[derive(Default)]
pub struct MockProvider {
    calls: Mutex<Vec<ProviderCall>>,
    failures_left: Mutex<u32>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with a 503.
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut left) = self.failures_left.lock() {
            *left = count;
        }
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: ProviderCall) -> Result<(), ProviderError> {
        if let Ok(mut left) = self.failures_left.lock() {
            if *left > 0 {
                *left -= 1;
                return Err(ProviderError::Api {
                    status: 503,
                    code: Some("SERVICE_UNAVAILABLE".to_string()),
                    message: "mock provider unavailable".to_string(),
                });
            }
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        Ok(())
    }
}

#[async_trait]
impl LoyaltyProvider for MockProvider {
    async fn register_card(&self, req: &RegisterCardRequest) -> Result<RegisteredCard, ProviderError> {
        self.record(ProviderCall::RegisterCard {
            client_id: req.identity.client_id,
        })?;
        Ok(RegisteredCard {
            remote_card_id: format!("luyoa-card-{}", req.identity.pass_serial_number),
            remote_pass_id: Some(format!("luyoa-pass-{}", req.identity.client_id)),
            qr_code: None,
        })
    }

    async fn update_points(
        &self,
        remote_card_id: &str,
        balance: i64,
        _tx: &TransactionContext,
    ) -> Result<Value, ProviderError> {
        self.record(ProviderCall::UpdatePoints {
            remote_card_id: remote_card_id.to_string(),
            balance,
        })?;
        Ok(json!({ "success": true, "points": balance }))
    }

    async fn redeem_points(
        &self,
        remote_card_id: &str,
        points: i64,
        _tx: &TransactionContext,
    ) -> Result<Value, ProviderError> {
        self.record(ProviderCall::RedeemPoints {
            remote_card_id: remote_card_id.to_string(),
            points,
        })?;
        Ok(json!({ "success": true, "redeemed": points }))
    }

    async fn deactivate_card(&self, remote_card_id: &str) -> Result<Value, ProviderError> {
        self.record(ProviderCall::DeactivateCard {
            remote_card_id: remote_card_id.to_string(),
        })?;
        Ok(json!({ "success": true }))
    }

    async fn update_tier(&self, remote_card_id: &str, tier: &str) -> Result<Value, ProviderError> {
        self.record(ProviderCall::UpdateTier {
            remote_card_id: remote_card_id.to_string(),
            tier: tier.to_string(),
        })?;
        Ok(json!({ "success": true, "tier": tier }))
    }

    async fn update_profile(&self, remote_card_id: &str, _profile: &Value) -> Result<Value, ProviderError> {
        self.record(ProviderCall::UpdateProfile {
            remote_card_id: remote_card_id.to_string(),
        })?;
        Ok(json!({ "success": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let api = ProviderError::Api {
            status: 429,
            code: Some("RATE_LIMITED".to_string()),
            message: "slow down".to_string(),
        };
        assert_eq!(api.code(), "RATE_LIMITED");

        let bare = ProviderError::Api {
            status: 502,
            code: None,
            message: "Bad Gateway".to_string(),
        };
        assert_eq!(bare.code(), "HTTP_502");
        assert_eq!(ProviderError::Decode("x".to_string()).code(), "DECODE_ERROR");
    }

    #[test]
    fn test_registered_card_accepts_provider_field_names() {
        let card: RegisteredCard = serde_json::from_value(json!({
            "cardId": "c-1",
            "passId": "p-1",
            "qrCode": "QR"
        }))
        .unwrap();
        assert_eq!(card.remote_card_id, "c-1");
        assert_eq!(card.remote_pass_id.as_deref(), Some("p-1"));
        assert_eq!(card.qr_code.as_deref(), Some("QR"));
    }

    #[tokio::test]
    async fn test_mock_fails_then_recovers() {
        let mock = MockProvider::new();
        let tx = TransactionContext {
            reference: "job-1".to_string(),
            reason: None,
            order_id: None,
        };
        mock.fail_next(1);

        let first = mock.update_points("card", 10, &tx).await;
        assert!(matches!(first, Err(ProviderError::Api { status: 503, .. })));

        mock.update_points("card", 10, &tx).await.unwrap();
        assert_eq!(
            mock.calls(),
            vec![ProviderCall::UpdatePoints {
                remote_card_id: "card".to_string(),
                balance: 10
            }]
        );
    }
}
