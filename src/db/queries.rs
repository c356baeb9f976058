//! Database queries
//!
//! Query structs borrow a connection, so the same methods work on a plain
//! connection and inside a transaction. Status changes are compare-and-swap
//! updates that report whether they won.

use super::{
    ChatMessageModel, ChatSessionModel, InteractionModel, InteractionStatus, PaymentModel,
    PaymentStatus, ProfileModel, ProviderTag, ReferralModel, WithdrawalModel, WithdrawalStatus,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

const PAYMENT_COLUMNS: &str = "id, payer_id, amount, currency, provider, provider_ref, \
     idempotency_key, status, context, created_at, completed_at";

const INTERACTION_COLUMNS: &str = "id, requester_id, provider_id, kind, payment_id, status, \
     duration_minutes, expires_at, created_at, accepted_at, rejected_at, service_completed_at";

fn map_payment(row: &Row<'_>) -> rusqlite::Result<PaymentModel> {
    Ok(PaymentModel {
        id: row.get(0)?,
        payer_id: row.get(1)?,
        amount: row.get(2)?,
        currency: row.get(3)?,
        provider: row.get(4)?,
        provider_ref: row.get(5)?,
        idempotency_key: row.get(6)?,
        status: row.get(7)?,
        context: row.get(8)?,
        created_at: row.get(9)?,
        completed_at: row.get(10)?,
    })
}

fn map_interaction(row: &Row<'_>) -> rusqlite::Result<InteractionModel> {
    Ok(InteractionModel {
        id: row.get(0)?,
        requester_id: row.get(1)?,
        provider_id: row.get(2)?,
        kind: row.get(3)?,
        payment_id: row.get(4)?,
        status: row.get(5)?,
        duration_minutes: row.get(6)?,
        expires_at: row.get(7)?,
        created_at: row.get(8)?,
        accepted_at: row.get(9)?,
        rejected_at: row.get(10)?,
        service_completed_at: row.get(11)?,
    })
}

/// Payment queries
pub struct PaymentQueries<'a> {
    conn: &'a Connection,
}

impl<'a> PaymentQueries<'a> {
    /// Create a new query instance
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a new payment
    pub fn insert(&self, payment: &PaymentModel) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO payments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                PAYMENT_COLUMNS
            ),
            params![
                payment.id,
                payment.payer_id,
                payment.amount,
                payment.currency,
                payment.provider,
                payment.provider_ref,
                payment.idempotency_key,
                payment.status,
                payment.context,
                payment.created_at,
                payment.completed_at,
            ],
        )?;
        info!(
            "DB: Inserted payment: id={}, payer={}, amount={}, provider={}, status={}",
            payment.id, payment.payer_id, payment.amount, payment.provider, payment.status
        );
        Ok(())
    }

    /// Get a payment by ID
    pub fn get(&self, id: &str) -> Result<Option<PaymentModel>> {
        self.get_by("id", id)
    }

    /// Get a payment by its external reference
    pub fn get_by_provider_ref(&self, provider_ref: &str) -> Result<Option<PaymentModel>> {
        self.get_by("provider_ref", provider_ref)
    }

    /// Get a payment by idempotency key
    pub fn get_by_idempotency_key(&self, key: &str) -> Result<Option<PaymentModel>> {
        self.get_by("idempotency_key", key)
    }

    fn get_by(&self, column: &str, value: &str) -> Result<Option<PaymentModel>> {
        let payment = self
            .conn
            .query_row(
                &format!("SELECT {} FROM payments WHERE {} = ?1", PAYMENT_COLUMNS, column),
                [value],
                map_payment,
            )
            .optional()?;
        Ok(payment)
    }

    /// Move a payment from one status to another; false if it was not in `from`
    pub fn transition(
        &self,
        id: &str,
        from: PaymentStatus,
        to: PaymentStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE payments SET status = ?1, completed_at = COALESCE(?2, completed_at)
             WHERE id = ?3 AND status = ?4",
            params![to, completed_at, id, from],
        )?;
        if rows == 1 {
            info!("DB: Payment {} {} -> {}", id, from, to);
        }
        Ok(rows == 1)
    }

    /// PENDING payments on a rail created at or before `created_before`,
    /// oldest first
    pub fn list_stale_pending(
        &self,
        provider: ProviderTag,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<PaymentModel>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM payments
             WHERE status = 'PENDING' AND provider = ?1 AND created_at <= ?2
             ORDER BY created_at",
            PAYMENT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![provider, created_before], map_payment)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Current status of a payment
    pub fn status(&self, id: &str) -> Result<Option<PaymentStatus>> {
        let status = self
            .conn
            .query_row("SELECT status FROM payments WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(status)
    }
}

/// Interaction request queries
pub struct InteractionQueries<'a> {
    conn: &'a Connection,
}

impl<'a> InteractionQueries<'a> {
    /// Create a new query instance
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a new interaction request
    pub fn insert(&self, ir: &InteractionModel) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO interaction_requests ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                INTERACTION_COLUMNS
            ),
            params![
                ir.id,
                ir.requester_id,
                ir.provider_id,
                ir.kind,
                ir.payment_id,
                ir.status,
                ir.duration_minutes,
                ir.expires_at,
                ir.created_at,
                ir.accepted_at,
                ir.rejected_at,
                ir.service_completed_at,
            ],
        )?;
        info!(
            "DB: Inserted interaction: id={}, requester={}, provider={}, kind={}, status={}",
            ir.id, ir.requester_id, ir.provider_id, ir.kind, ir.status
        );
        Ok(())
    }

    /// Get an interaction by ID
    pub fn get(&self, id: &str) -> Result<Option<InteractionModel>> {
        let ir = self
            .conn
            .query_row(
                &format!("SELECT {} FROM interaction_requests WHERE id = ?1", INTERACTION_COLUMNS),
                [id],
                map_interaction,
            )
            .optional()?;
        Ok(ir)
    }

    /// Get the interaction paid for by a payment
    pub fn get_by_payment(&self, payment_id: &str) -> Result<Option<InteractionModel>> {
        let ir = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM interaction_requests WHERE payment_id = ?1",
                    INTERACTION_COLUMNS
                ),
                [payment_id],
                map_interaction,
            )
            .optional()?;
        Ok(ir)
    }

    /// Plain status change; false if the request was not in `from`
    pub fn transition(
        &self,
        id: &str,
        from: InteractionStatus,
        to: InteractionStatus,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE interaction_requests SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![to, id, from],
        )?;
        if rows == 1 {
            info!("DB: Interaction {} {} -> {}", id, from, to);
        }
        Ok(rows == 1)
    }

    /// PENDING -> ACCEPTED, only while unexpired, paid, and the provider has
    /// no other open accepted engagement
    pub fn accept(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn.execute(
            r#"
            UPDATE interaction_requests SET status = 'ACCEPTED', accepted_at = ?2
            WHERE id = ?1
              AND status = 'PENDING'
              AND expires_at > ?2
              AND payment_id IS NOT NULL
              AND EXISTS (
                  SELECT 1 FROM payments p
                  WHERE p.id = interaction_requests.payment_id AND p.status = 'COMPLETED'
              )
              AND NOT EXISTS (
                  SELECT 1 FROM interaction_requests o
                  JOIN chat_sessions s ON s.interaction_id = o.id
                  WHERE o.provider_id = interaction_requests.provider_id
                    AND o.id != interaction_requests.id
                    AND o.status = 'ACCEPTED'
                    AND o.service_completed_at IS NULL
                    AND s.ended_at IS NULL
                    AND s.ends_at > ?2
              )
            "#,
            params![id, now],
        )?;
        if rows == 1 {
            info!("DB: Interaction {} PENDING -> ACCEPTED", id);
        }
        Ok(rows == 1)
    }

    /// Reject from `from` (PENDING or PENDING_VERIFICATION)
    pub fn reject(&self, id: &str, from: InteractionStatus, now: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE interaction_requests SET status = 'REJECTED', rejected_at = ?2
             WHERE id = ?1 AND status = ?3",
            params![id, now, from],
        )?;
        if rows == 1 {
            info!("DB: Interaction {} {} -> REJECTED", id, from);
        }
        Ok(rows == 1)
    }

    /// PENDING_VERIFICATION -> PENDING with a fresh expiry
    pub fn release(&self, id: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE interaction_requests SET status = 'PENDING', expires_at = ?2
             WHERE id = ?1 AND status = 'PENDING_VERIFICATION'",
            params![id, expires_at],
        )?;
        if rows == 1 {
            info!("DB: Interaction {} PENDING_VERIFICATION -> PENDING", id);
        }
        Ok(rows == 1)
    }

    /// Stamp service completion on an accepted request, once
    pub fn complete_service(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE interaction_requests SET service_completed_at = ?2
             WHERE id = ?1 AND status = 'ACCEPTED' AND service_completed_at IS NULL",
            params![id, now],
        )?;
        if rows == 1 {
            info!("DB: Interaction {} service completed", id);
        }
        Ok(rows == 1)
    }

    /// PENDING requests for a provider, oldest first, excluding one id
    pub fn list_pending_for_provider(
        &self,
        provider_id: &str,
        exclude_id: &str,
    ) -> Result<Vec<InteractionModel>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM interaction_requests
             WHERE provider_id = ?1 AND status = 'PENDING' AND id != ?2
             ORDER BY created_at",
            INTERACTION_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![provider_id, exclude_id], map_interaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Stored-PENDING requests whose expiry has passed
    pub fn list_expired_pending(&self, now: DateTime<Utc>) -> Result<Vec<InteractionModel>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM interaction_requests
             WHERE status = 'PENDING' AND expires_at <= ?1
             ORDER BY expires_at",
            INTERACTION_COLUMNS
        ))?;
        let rows = stmt
            .query_map([now], map_interaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Requests from a requester in a given status, oldest first
    pub fn list_for_requester(
        &self,
        requester_id: &str,
        status: InteractionStatus,
    ) -> Result<Vec<InteractionModel>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM interaction_requests
             WHERE requester_id = ?1 AND status = ?2
             ORDER BY created_at",
            INTERACTION_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![requester_id, status], map_interaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Chat session and message queries
pub struct ChatQueries<'a> {
    conn: &'a Connection,
}

impl<'a> ChatQueries<'a> {
    /// Create a new query instance
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Open a session for an accepted interaction
    pub fn create_session(
        &self,
        interaction_id: &str,
        started_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<ChatSessionModel> {
        let session = ChatSessionModel {
            id: uuid::Uuid::new_v4().to_string(),
            interaction_id: interaction_id.to_string(),
            started_at,
            ends_at,
            ended_at: None,
        };
        self.conn.execute(
            "INSERT INTO chat_sessions (id, interaction_id, started_at, ends_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            params![session.id, session.interaction_id, session.started_at, session.ends_at],
        )?;
        info!(
            "DB: Created chat session {} for interaction {} (ends {})",
            session.id, interaction_id, ends_at
        );
        Ok(session)
    }

    /// Session belonging to an interaction
    pub fn get_session_by_interaction(&self, interaction_id: &str) -> Result<Option<ChatSessionModel>> {
        let session = self
            .conn
            .query_row(
                "SELECT id, interaction_id, started_at, ends_at, ended_at
                 FROM chat_sessions WHERE interaction_id = ?1",
                [interaction_id],
                |row| {
                    Ok(ChatSessionModel {
                        id: row.get(0)?,
                        interaction_id: row.get(1)?,
                        started_at: row.get(2)?,
                        ends_at: row.get(3)?,
                        ended_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    /// Stamp the end of a session; false if it had already ended
    pub fn end_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE chat_sessions SET ended_at = ?2 WHERE id = ?1 AND ended_at IS NULL",
            params![session_id, now],
        )?;
        Ok(rows == 1)
    }

    /// Delete every message of a session
    pub fn purge_messages(&self, session_id: &str) -> Result<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM chat_messages WHERE session_id = ?1", [session_id])?;
        info!("DB: Purged {} messages from session {}", rows, session_id);
        Ok(rows)
    }

    /// Store a message
    pub fn insert_message(&self, session_id: &str, sender_id: &str, body: &str) -> Result<ChatMessageModel> {
        let message = ChatMessageModel {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        };
        self.conn.execute(
            "INSERT INTO chat_messages (id, session_id, sender_id, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.session_id,
                message.sender_id,
                message.body,
                message.created_at
            ],
        )?;
        Ok(message)
    }

    /// Messages of a session, oldest first
    pub fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessageModel>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, sender_id, body, created_at
             FROM chat_messages WHERE session_id = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt
            .query_map([session_id], |row| {
                Ok(ChatMessageModel {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    sender_id: row.get(2)?,
                    body: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Referral queries
pub struct ReferralQueries<'a> {
    conn: &'a Connection,
}

impl<'a> ReferralQueries<'a> {
    /// Create a new query instance
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Record that `referred_user_id` was referred; None if they already were
    pub fn insert(&self, referrer_id: &str, referred_user_id: &str) -> Result<Option<ReferralModel>> {
        let referral = ReferralModel {
            id: uuid::Uuid::new_v4().to_string(),
            referrer_id: referrer_id.to_string(),
            referred_user_id: referred_user_id.to_string(),
            completed_count: 0,
            created_at: Utc::now(),
        };
        let rows = self.conn.execute(
            "INSERT OR IGNORE INTO referrals (id, referrer_id, referred_user_id, completed_count, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![
                referral.id,
                referral.referrer_id,
                referral.referred_user_id,
                referral.created_at
            ],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        info!("DB: Referral recorded: {} referred {}", referrer_id, referred_user_id);
        Ok(Some(referral))
    }

    /// Referral for a referred user
    pub fn get_by_referred_user(&self, user_id: &str) -> Result<Option<ReferralModel>> {
        let referral = self
            .conn
            .query_row(
                "SELECT id, referrer_id, referred_user_id, completed_count, created_at
                 FROM referrals WHERE referred_user_id = ?1",
                [user_id],
                |row| {
                    Ok(ReferralModel {
                        id: row.get(0)?,
                        referrer_id: row.get(1)?,
                        referred_user_id: row.get(2)?,
                        completed_count: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(referral)
    }

    /// Whether a commission was already paid for a payment
    pub fn has_commission(&self, payment_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM referral_commissions WHERE payment_id = ?1",
            [payment_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Take one commission slot if the referral is below `max`
    pub fn claim_slot(&self, referral_id: &str, max: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE referrals SET completed_count = completed_count + 1
             WHERE id = ?1 AND completed_count < ?2",
            params![referral_id, max],
        )?;
        Ok(rows == 1)
    }

    /// Remember the commission paid for a payment; false if one exists
    pub fn record_commission(
        &self,
        payment_id: &str,
        referral: &ReferralModel,
        amount: i64,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            "INSERT OR IGNORE INTO referral_commissions (payment_id, referral_id, referrer_id, amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![payment_id, referral.id, referral.referrer_id, amount, Utc::now()],
        )?;
        Ok(rows == 1)
    }
}

/// Withdrawal queries
pub struct WithdrawalQueries<'a> {
    conn: &'a Connection,
}

impl<'a> WithdrawalQueries<'a> {
    /// Create a new query instance
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a new withdrawal
    pub fn insert(&self, w: &WithdrawalModel) -> Result<()> {
        self.conn.execute(
            "INSERT INTO withdrawals (id, user_id, amount, phone, order_id, status, failure_reason, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                w.id,
                w.user_id,
                w.amount,
                w.phone,
                w.order_id,
                w.status,
                w.failure_reason,
                w.created_at,
                w.updated_at
            ],
        )?;
        info!(
            "DB: Inserted withdrawal: id={}, user={}, amount={}, order_id={}",
            w.id, w.user_id, w.amount, w.order_id
        );
        Ok(())
    }

    /// Get a withdrawal by the order ID sent to the payout rail
    pub fn get_by_order_id(&self, order_id: &str) -> Result<Option<WithdrawalModel>> {
        let w = self
            .conn
            .query_row(
                "SELECT id, user_id, amount, phone, order_id, status, failure_reason, created_at, updated_at
                 FROM withdrawals WHERE order_id = ?1",
                [order_id],
                |row| {
                    Ok(WithdrawalModel {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        amount: row.get(2)?,
                        phone: row.get(3)?,
                        order_id: row.get(4)?,
                        status: row.get(5)?,
                        failure_reason: row.get(6)?,
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(w)
    }

    /// Move a withdrawal out of PENDING; false if it already left
    pub fn finish(
        &self,
        order_id: &str,
        to: WithdrawalStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE withdrawals SET status = ?1, failure_reason = ?2, updated_at = ?3
             WHERE order_id = ?4 AND status = 'PENDING'",
            params![to, failure_reason, Utc::now(), order_id],
        )?;
        if rows == 1 {
            info!("DB: Withdrawal {} PENDING -> {}", order_id, to);
        }
        Ok(rows == 1)
    }
}

/// Profile queries
pub struct ProfileQueries<'a> {
    conn: &'a Connection,
}

impl<'a> ProfileQueries<'a> {
    /// Create a new query instance
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert or replace a profile
    pub fn upsert(&self, p: &ProfileModel) -> Result<()> {
        self.conn.execute(
            "INSERT INTO profiles (user_id, role, verified, accepting_requests, available, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                role = excluded.role,
                verified = excluded.verified,
                accepting_requests = excluded.accepting_requests,
                available = excluded.available",
            params![p.user_id, p.role, p.verified, p.accepting_requests, p.available, p.created_at],
        )?;
        Ok(())
    }

    /// Get a profile
    pub fn get(&self, user_id: &str) -> Result<Option<ProfileModel>> {
        let p = self
            .conn
            .query_row(
                "SELECT user_id, role, verified, accepting_requests, available, created_at
                 FROM profiles WHERE user_id = ?1",
                [user_id],
                |row| {
                    Ok(ProfileModel {
                        user_id: row.get(0)?,
                        role: row.get(1)?,
                        verified: row.get(2)?,
                        accepting_requests: row.get(3)?,
                        available: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(p)
    }

    /// Mark a user verified; false if they already were or do not exist
    pub fn set_verified(&self, user_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE profiles SET verified = 1 WHERE user_id = ?1 AND verified = 0",
            [user_id],
        )?;
        Ok(rows == 1)
    }

    /// Flip a provider's availability
    pub fn set_available(&self, user_id: &str, available: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE profiles SET available = ?2 WHERE user_id = ?1",
            params![user_id, available],
        )?;
        Ok(())
    }
}
