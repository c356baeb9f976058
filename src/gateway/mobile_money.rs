//! Mobile-money rail client
//!
//! Logs in with merchant credentials, caches the bearer token, and sends
//! STK push and B2C payout requests. A 401 drops the cached token and the
//! call is retried once with a fresh login.

use super::{whole_units, PayoutRequest, PayoutResponse, PushPaymentGateway, PushRequest, PushResponse};
use crate::cache::{Clock, TtlCache};
use crate::config::PushPaymentConfig;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const TOKEN_KEY: &str = "mobile_money";

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Serialize)]
struct StkRequest<'a> {
    amount: String,
    currency: &'a str,
    description: &'a str,
    customer_phone: &'a str,
    callback_url: &'a str,
    order_id: &'a str,
}

#[derive(Serialize)]
struct B2cRequest<'a> {
    amount: String,
    phone_number: &'a str,
    description: &'a str,
    remarks: &'a str,
    order_id: &'a str,
    callback_url: &'a str,
}

/// HTTP client for the mobile-money rail
pub struct MobileMoneyClient {
    http: reqwest::Client,
    config: PushPaymentConfig,
    tokens: TtlCache<String>,
}

impl MobileMoneyClient {
    /// Create a client
    pub fn new(config: PushPaymentConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let tokens = TtlCache::new(chrono::Duration::seconds(config.token_ttl_secs as i64), clock);
        Ok(Self { http, config, tokens })
    }

    async fn login(&self) -> anyhow::Result<String> {
        let url = format!("{}/api/v1/merchants/login", self.config.base_url);
        info!("Mobile money: logging in at {}", url);
        let response = self
            .http
            .post(&url)
            .json(&LoginRequest {
                email: &self.config.email,
                password: &self.config.password,
            })
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Mobile money login failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            error!("Mobile money login returned {}", status);
            return Err(anyhow::anyhow!("Mobile money login returned {}", status));
        }
        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse login response: {}", e))?;
        Ok(login.token)
    }

    async fn token(&self) -> anyhow::Result<String> {
        self.tokens.get_or_refresh(TOKEN_KEY, || self.login()).await
    }

    /// POST a JSON body with the cached token, retrying once on 401
    async fn post_authorized<B, R>(&self, path: &str, body: &B) -> anyhow::Result<R>
    where
        B: Serialize + ?Sized,
        R: for<'de> Deserialize<'de> + Default,
    {
        let url = format!("{}{}", self.config.base_url, path);
        for attempt in 0..2 {
            let token = self.token().await?;
            let response = self
                .http
                .post(&url)
                .bearer_auth(&token)
                .json(body)
                .send()
                .await
                .map_err(|e| {
                    error!("Mobile money request to {} failed: {}", url, e);
                    anyhow::anyhow!("Mobile money request failed: {}", e)
                })?;

            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                info!("Mobile money token rejected, logging in again");
                self.tokens.invalidate(TOKEN_KEY).await;
                continue;
            }

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                error!("Mobile money returned error: {} - {}", status, text);
                return Err(anyhow::anyhow!("Mobile money returned error: {} - {}", status, text));
            }

            let text = response.text().await?;
            if text.trim().is_empty() {
                return Ok(R::default());
            }
            return serde_json::from_str(&text)
                .map_err(|e| anyhow::anyhow!("Failed to parse mobile money response: {}", e));
        }
        Err(anyhow::anyhow!("Mobile money rejected credentials"))
    }
}

#[async_trait]
impl PushPaymentGateway for MobileMoneyClient {
    async fn initiate_push(&self, req: &PushRequest) -> anyhow::Result<PushResponse> {
        info!(
            "Mobile money: STK push order_id={} amount={} phone={}",
            req.order_id, req.amount, req.phone
        );
        let body = StkRequest {
            amount: whole_units(req.amount),
            currency: &req.currency,
            description: &req.description,
            customer_phone: &req.phone,
            callback_url: req.callback_url.as_deref().unwrap_or(""),
            order_id: &req.order_id,
        };
        self.post_authorized("/api/v1/transactions/mpesa", &body).await
    }

    async fn initiate_payout(&self, req: &PayoutRequest) -> anyhow::Result<PayoutResponse> {
        info!(
            "Mobile money: B2C payout order_id={} amount={} phone={}",
            req.order_id, req.amount, req.phone
        );
        let body = B2cRequest {
            amount: whole_units(req.amount),
            phone_number: &req.phone,
            description: "B2C Payment to customer",
            remarks: "Withdrawal payment",
            order_id: &req.order_id,
            callback_url: req.callback_url.as_deref().unwrap_or(""),
        };
        self.post_authorized("/api/v1/transactions/mpesa/b2c", &body).await
    }
}
