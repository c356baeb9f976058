//! On-chain deposit rail client

use super::{DepositGateway, DepositRequest, DepositResponse};
use crate::cache::{Clock, TtlCache};
use crate::config::OnChainConfig;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const TOKEN_KEY: &str = "onchain";

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct RatesResponse {
    #[serde(default)]
    usdt_buying_rate: f64,
}

#[derive(Serialize)]
struct InitiateRequest<'a> {
    expected_amount: f64,
    webhook_url: &'a str,
    notes: &'a str,
    deposit_id: &'a str,
}

/// HTTP client for the on-chain deposit rail
pub struct DepositClient {
    http: reqwest::Client,
    config: OnChainConfig,
    tokens: TtlCache<String>,
}

impl DepositClient {
    /// Create a client
    pub fn new(config: OnChainConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let tokens = TtlCache::new(chrono::Duration::seconds(config.token_ttl_secs as i64), clock);
        Ok(Self { http, config, tokens })
    }

    async fn login(&self) -> anyhow::Result<String> {
        let url = format!("{}/merchants/login", self.config.base_url);
        info!("Deposit rail: logging in at {}", url);
        let response = self
            .http
            .post(&url)
            .json(&LoginRequest {
                email: &self.config.email,
                password: &self.config.password,
            })
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Deposit rail login failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            error!("Deposit rail login returned {}", status);
            return Err(anyhow::anyhow!("Deposit rail login returned {}", status));
        }
        let login: LoginResponse = response.json().await?;
        Ok(login.token)
    }

    async fn send(&self, build: impl Fn(&str) -> reqwest::RequestBuilder) -> anyhow::Result<reqwest::Response> {
        for attempt in 0..2 {
            let token = self
                .tokens
                .get_or_refresh(TOKEN_KEY, || self.login())
                .await?;
            let response = build(&token)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("Deposit rail request failed: {}", e))?;
            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                self.tokens.invalidate(TOKEN_KEY).await;
                continue;
            }
            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                error!("Deposit rail returned error: {} - {}", status, text);
                return Err(anyhow::anyhow!("Deposit rail returned error: {} - {}", status, text));
            }
            return Ok(response);
        }
        Err(anyhow::anyhow!("Deposit rail rejected credentials"))
    }
}

#[async_trait]
impl DepositGateway for DepositClient {
    async fn rate(&self) -> anyhow::Result<f64> {
        let url = format!("{}/merchants/rates", self.config.base_url);
        let response = self.send(|token| self.http.get(&url).bearer_auth(token)).await?;
        let rates: RatesResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse rates response: {}", e))?;
        info!("Deposit rail: {} rate {}", self.config.asset, rates.usdt_buying_rate);
        Ok(rates.usdt_buying_rate)
    }

    async fn initiate_deposit(&self, req: &DepositRequest) -> anyhow::Result<DepositResponse> {
        let url = format!("{}/merchants/solana/deposit/initiate", self.config.base_url);
        info!(
            "Deposit rail: initiating deposit {} for {} {}",
            req.deposit_id, req.expected_amount, self.config.asset
        );
        let body = InitiateRequest {
            expected_amount: req.expected_amount,
            webhook_url: req.webhook_url.as_deref().unwrap_or(""),
            notes: &req.notes,
            deposit_id: &req.deposit_id,
        };
        let response = self
            .send(|token| self.http.post(&url).bearer_auth(token).json(&body))
            .await?;
        let deposit: DepositResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse deposit response: {}", e))?;
        if deposit.page_url.is_empty() {
            return Err(anyhow::anyhow!("Deposit rail returned no payment page"));
        }
        Ok(deposit)
    }
}
