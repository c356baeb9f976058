//! Database models

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Stores a fieldless enum as its upper-case text tag
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Text tag as stored and returned by the API
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} value: {}", stringify!($ty), other)),
                }
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

/// Payment status; COMPLETED, FAILED and CANCELLED are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

text_enum!(PaymentStatus {
    Pending => "PENDING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
    Expired => "EXPIRED",
});

impl PaymentStatus {
    /// Whether no further transition is allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Payment rail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderTag {
    Wallet,
    PushPayment,
    OnChain,
    Generic,
}

text_enum!(ProviderTag {
    Wallet => "WALLET",
    PushPayment => "PUSH_PAYMENT",
    OnChain => "ON_CHAIN",
    Generic => "GENERIC",
});

/// Interaction request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InteractionStatus {
    Pending,
    PendingVerification,
    Accepted,
    Rejected,
    Expired,
}

text_enum!(InteractionStatus {
    Pending => "PENDING",
    PendingVerification => "PENDING_VERIFICATION",
    Accepted => "ACCEPTED",
    Rejected => "REJECTED",
    Expired => "EXPIRED",
});

/// What the requester is paying for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InteractionKind {
    Chat,
    Video,
    Booking,
}

text_enum!(InteractionKind {
    Chat => "CHAT",
    Video => "VIDEO",
    Booking => "BOOKING",
});

/// Wallet ledger entry type; PAYMENT is a requester spending gross balance on a settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxType {
    Earning,
    Withdrawal,
    BoostPayment,
    ReferralCommission,
    ReferralBonus,
    Refund,
    PlatformFee,
    Payment,
}

text_enum!(TxType {
    Earning => "EARNING",
    Withdrawal => "WITHDRAWAL",
    BoostPayment => "BOOST_PAYMENT",
    ReferralCommission => "REFERRAL_COMMISSION",
    ReferralBonus => "REFERRAL_BONUS",
    Refund => "REFUND",
    PlatformFee => "PLATFORM_FEE",
    Payment => "PAYMENT",
});

/// Which wallet balance a ledger entry moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Bucket {
    Gross,
    Withdrawable,
}

text_enum!(Bucket {
    Gross => "GROSS",
    Withdrawable => "WITHDRAWABLE",
});

/// User role as far as settlement is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Requester,
    Provider,
}

text_enum!(Role {
    Requester => "REQUESTER",
    Provider => "PROVIDER",
});

/// Withdrawal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Failed,
}

text_enum!(WithdrawalStatus {
    Pending => "PENDING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

/// Interaction a settlement will open once paid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionTarget {
    /// Provider being paid
    pub provider_id: String,
    /// Interaction kind
    pub kind: InteractionKind,
    /// Requested session length
    pub duration_minutes: i64,
}

/// Per-rail context carried alongside a payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flow", rename_all = "snake_case")]
pub enum PaymentContext {
    /// Fully covered by the requester's gross balance
    WalletOnly {
        /// Interaction to open
        target: InteractionTarget,
    },
    /// Mobile-money prompt for the remainder after the wallet portion
    PushPayment {
        /// Interaction to open
        target: InteractionTarget,
        /// Amount already debited from the requester's wallet
        wallet_portion: i64,
        /// Normalised payer phone number
        phone: String,
    },
    /// On-chain deposit for the remainder after the wallet portion
    OnChain {
        /// Interaction to open
        target: InteractionTarget,
        /// Amount already debited from the requester's wallet
        wallet_portion: i64,
        /// Settlement asset symbol
        asset: String,
        /// Asset amount requested from the payer
        asset_amount: f64,
        /// Local units per asset unit at initiation
        rate: f64,
    },
    /// Payment created outside the settlement flows
    Generic {
        /// Free-text description
        #[serde(default)]
        description: Option<String>,
    },
}

impl PaymentContext {
    /// Amount pre-debited from the payer's wallet
    pub fn wallet_portion(&self) -> i64 {
        match self {
            Self::PushPayment { wallet_portion, .. } | Self::OnChain { wallet_portion, .. } => {
                *wallet_portion
            }
            Self::WalletOnly { .. } | Self::Generic { .. } => 0,
        }
    }

    /// Interaction this payment pays for, if any
    pub fn target(&self) -> Option<&InteractionTarget> {
        match self {
            Self::WalletOnly { target }
            | Self::PushPayment { target, .. }
            | Self::OnChain { target, .. } => Some(target),
            Self::Generic { .. } => None,
        }
    }
}

impl ToSql for PaymentContext {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let json = serde_json::to_string(self)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::from(json))
    }
}

impl FromSql for PaymentContext {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        serde_json::from_str(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Payment database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentModel {
    /// Payment ID
    pub id: String,
    /// User who pays
    pub payer_id: String,
    /// Amount in minor units
    pub amount: i64,
    /// Currency code
    pub currency: String,
    /// Rail that carries the payment
    pub provider: ProviderTag,
    /// External reference, unique across rails
    pub provider_ref: String,
    /// Caller-supplied idempotency key
    pub idempotency_key: String,
    /// Current status
    pub status: PaymentStatus,
    /// Rail-specific context
    pub context: PaymentContext,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Completion time
    pub completed_at: Option<DateTime<Utc>>,
}

/// Interaction request database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionModel {
    /// Request ID
    pub id: String,
    /// User who asked
    pub requester_id: String,
    /// User being asked
    pub provider_id: String,
    /// Interaction kind
    pub kind: InteractionKind,
    /// Linked payment
    pub payment_id: Option<String>,
    /// Stored status
    pub status: InteractionStatus,
    /// Session length once accepted
    pub duration_minutes: i64,
    /// When a PENDING request stops being actionable
    pub expires_at: DateTime<Utc>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Acceptance time
    pub accepted_at: Option<DateTime<Utc>>,
    /// Rejection time
    pub rejected_at: Option<DateTime<Utc>>,
    /// Service completion time
    pub service_completed_at: Option<DateTime<Utc>>,
}

impl InteractionModel {
    /// Status as readers should see it: PENDING past expiry reads as EXPIRED
    pub fn effective_status(&self, now: DateTime<Utc>) -> InteractionStatus {
        if self.status == InteractionStatus::Pending && self.expires_at <= now {
            InteractionStatus::Expired
        } else {
            self.status
        }
    }
}

/// Chat session database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSessionModel {
    /// Session ID
    pub id: String,
    /// Owning interaction
    pub interaction_id: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Scheduled end
    pub ends_at: DateTime<Utc>,
    /// Actual end
    pub ended_at: Option<DateTime<Utc>>,
}

impl ChatSessionModel {
    /// Whether messages may still be exchanged
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.ended_at.is_none() && self.ends_at > now
    }
}

/// Chat message database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageModel {
    /// Message ID
    pub id: String,
    /// Owning session
    pub session_id: String,
    /// Author
    pub sender_id: String,
    /// Message text
    pub body: String,
    /// Send time
    pub created_at: DateTime<Utc>,
}

/// Wallet database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletModel {
    /// Owner
    pub user_id: String,
    /// Gross balance
    pub balance: i64,
    /// Balance cleared for payout
    pub withdrawable: i64,
    /// Currency code
    pub currency: String,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

/// Wallet ledger row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransactionModel {
    /// Row ID
    pub id: String,
    /// Wallet owner
    pub user_id: String,
    /// Signed amount
    pub amount: i64,
    /// Balance the amount applied to
    pub bucket: Bucket,
    /// Entry type
    pub tx_type: TxType,
    /// Free-text reference
    pub reference: String,
    /// Entry time
    pub created_at: DateTime<Utc>,
}

/// Referral database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralModel {
    /// Referral ID
    pub id: String,
    /// User who referred
    pub referrer_id: String,
    /// User who was referred
    pub referred_user_id: String,
    /// Commission-bearing transactions so far
    pub completed_count: i64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Withdrawal database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalModel {
    /// Withdrawal ID
    pub id: String,
    /// Wallet owner
    pub user_id: String,
    /// Amount in minor units
    pub amount: i64,
    /// Destination phone
    pub phone: String,
    /// Order ID sent to the payout rail
    pub order_id: String,
    /// Current status
    pub status: WithdrawalStatus,
    /// Why it failed
    pub failure_reason: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Profile database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileModel {
    /// User ID
    pub user_id: String,
    /// Role
    pub role: Role,
    /// Identity verification complete
    pub verified: bool,
    /// Provider takes requests at all
    pub accepting_requests: bool,
    /// Provider is free right now
    pub available: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}
