//! External payment rail clients
//!
//! Settlement flows talk to the rails through these traits so tests can run
//! against in-process fakes. The HTTP implementations live in
//! [`mobile_money`] and [`deposit`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod deposit;
pub mod mobile_money;

pub use deposit::DepositClient;
pub use mobile_money::MobileMoneyClient;

/// Push-payment (STK prompt) request
#[derive(Debug, Clone)]
pub struct PushRequest {
    /// Our order ID; echoed back by the webhook
    pub order_id: String,
    /// Amount in minor units
    pub amount: i64,
    /// Currency code
    pub currency: String,
    /// Payer phone, normalised
    pub phone: String,
    /// Text shown on the prompt
    pub description: String,
    /// Where the rail should post the confirmation
    pub callback_url: Option<String>,
}

/// Push-payment acknowledgement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushResponse {
    /// Rail-side checkout reference
    #[serde(default)]
    pub checkout_request_id: Option<String>,
    /// Rail-side status
    #[serde(default)]
    pub status: Option<String>,
    /// Message for the payer
    #[serde(default)]
    pub customer_message: Option<String>,
}

/// Mobile-money disbursement request
#[derive(Debug, Clone)]
pub struct PayoutRequest {
    /// Our order ID; echoed back by the webhook
    pub order_id: String,
    /// Amount in minor units
    pub amount: i64,
    /// Recipient phone, normalised
    pub phone: String,
    /// Where the rail should post the result
    pub callback_url: Option<String>,
}

/// Disbursement acknowledgement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayoutResponse {
    /// Rail-side conversation ID
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Rail-side status
    #[serde(default)]
    pub status: Option<String>,
}

/// On-chain deposit request
#[derive(Debug, Clone)]
pub struct DepositRequest {
    /// Our deposit ID; echoed back as `merchant_deposit_id`
    pub deposit_id: String,
    /// Asset amount the payer must send
    pub expected_amount: f64,
    /// Where the rail should post the result
    pub webhook_url: Option<String>,
    /// Free-text notes
    pub notes: String,
}

/// On-chain deposit acknowledgement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepositResponse {
    /// Payment page for the payer
    #[serde(default)]
    pub page_url: String,
    /// When the deposit window closes
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// Mobile-money rail: payer prompts and payouts
#[async_trait]
pub trait PushPaymentGateway: Send + Sync {
    /// Trigger a payment prompt on the payer's phone
    async fn initiate_push(&self, req: &PushRequest) -> anyhow::Result<PushResponse>;

    /// Send money from platform float to a phone
    async fn initiate_payout(&self, req: &PayoutRequest) -> anyhow::Result<PayoutResponse>;
}

/// On-chain deposit rail
#[async_trait]
pub trait DepositGateway: Send + Sync {
    /// Local currency units per asset unit
    async fn rate(&self) -> anyhow::Result<f64>;

    /// Open a deposit window for the payer
    async fn initiate_deposit(&self, req: &DepositRequest) -> anyhow::Result<DepositResponse>;
}

/// Normalise a Kenyan mobile number to `254XXXXXXXXX`
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let normalized = if let Some(rest) = digits.strip_prefix('0') {
        format!("254{}", rest)
    } else if digits.starts_with("254") {
        digits
    } else {
        format!("254{}", digits)
    };
    (normalized.len() == 12).then_some(normalized)
}

/// Whole-currency amount string for rails that do not take minor units;
/// anything below one unit is sent as "1"
pub fn whole_units(minor: i64) -> String {
    if minor > 0 && minor < 100 {
        return "1".to_string();
    }
    (minor / 100).to_string()
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::sync::Mutex;

    /// Records calls; fails when told to
    #[derive(Default)]
    pub struct FakePushGateway {
        pub pushes: Mutex<Vec<PushRequest>>,
        pub payouts: Mutex<Vec<PayoutRequest>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl FakePushGateway {
        pub fn failing() -> Self {
            let fake = Self::default();
            fake.fail.store(true, std::sync::atomic::Ordering::SeqCst);
            fake
        }
    }

    #[async_trait]
    impl PushPaymentGateway for FakePushGateway {
        async fn initiate_push(&self, req: &PushRequest) -> anyhow::Result<PushResponse> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(anyhow::anyhow!("push rejected by rail"));
            }
            self.pushes.lock().unwrap().push(req.clone());
            Ok(PushResponse {
                checkout_request_id: Some(format!("ws_{}", req.order_id)),
                status: Some("PENDING".to_string()),
                customer_message: None,
            })
        }

        async fn initiate_payout(&self, req: &PayoutRequest) -> anyhow::Result<PayoutResponse> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(anyhow::anyhow!("payout rejected by rail"));
            }
            self.payouts.lock().unwrap().push(req.clone());
            Ok(PayoutResponse {
                conversation_id: Some(format!("conv_{}", req.order_id)),
                status: Some("PENDING".to_string()),
            })
        }
    }

    /// Fixed rate, records deposits
    pub struct FakeDepositGateway {
        pub rate: f64,
        pub deposits: Mutex<Vec<DepositRequest>>,
        pub fail: bool,
    }

    impl FakeDepositGateway {
        pub fn with_rate(rate: f64) -> Self {
            Self {
                rate,
                deposits: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl DepositGateway for FakeDepositGateway {
        async fn rate(&self) -> anyhow::Result<f64> {
            Ok(self.rate)
        }

        async fn initiate_deposit(&self, req: &DepositRequest) -> anyhow::Result<DepositResponse> {
            if self.fail {
                return Err(anyhow::anyhow!("deposit rail unavailable"));
            }
            self.deposits.lock().unwrap().push(req.clone());
            Ok(DepositResponse {
                page_url: format!("https://pay.example.com/d/{}", req.deposit_id),
                expires_at: None,
            })
        }
    }
}
