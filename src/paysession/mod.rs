//! Payment-session store: the authoritative handoff between checkout and
//! the asynchronous webhook, plus the idempotency gates.
//!
//! The store keeps a hot `psid -> session` map with a TTL slightly above
//! the reservation TTL, a pending index ordered by creation time for the
//! admin feed, a single-shot fulfillment gate per psid, and a single-shot
//! event-seen key per provider idempotency key.
//!
//! Two backends share the contract: [`redis::RedisSessionStore`] over a hot
//! KV store and [`postgres::PgSessionStore`] over four small tables. The
//! hot KV stores string -> string fields; [`PaymentSession`] marshals at
//! that boundary.

pub mod postgres;
pub mod redis;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::accounting::{TicketClass, TransferId};

/// Hot-store TTL grace above the reservation TTL, seconds.
pub const SESSION_TTL_GRACE_SECS: u64 = 60;
/// Fulfillment gates outlive any webhook redelivery window.
pub const FULFILL_GATE_TTL_SECS: u64 = 24 * 3600;
/// Event-seen keys only need to cover provider retry bursts.
pub const EVENT_SEEN_TTL_SECS: u64 = 3600;

#[derive(Error, Debug)]
pub enum SessionStoreError {
    #[error("hot store error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt session record for psid {psid}: {detail}")]
    Corrupt { psid: String, detail: String },
}

/// The handoff record written by checkout and consumed by the webhook.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentSession {
    pub order_id: String,
    pub cls: TicketClass,
    pub qty: u32,
    pub amount: i64,
    pub currency: String,
    pub customer_email: String,
    pub ticket_transfer_id: TransferId,
    pub goodie_transfer_id: TransferId,
    pub try_goodie: bool,
    pub created_at: f64,
}

impl PaymentSession {
    /// Marshal into the string->string field map the hot KV stores.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("order_id", self.order_id.clone()),
            ("cls", self.cls.as_str().to_string()),
            ("qty", self.qty.to_string()),
            ("amount", self.amount.to_string()),
            ("currency", self.currency.clone()),
            ("customer_email", self.customer_email.clone()),
            ("ticket_transfer_id", self.ticket_transfer_id.to_string()),
            ("goodie_transfer_id", self.goodie_transfer_id.to_string()),
            ("try_goodie", (if self.try_goodie { "1" } else { "0" }).to_string()),
            ("created_at", self.created_at.to_string()),
        ]
    }

    /// Unmarshal from a field map. `None` when a required field is missing
    /// or unparsable.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let get = |k: &str| fields.get(k).map(String::as_str);
        Some(Self {
            order_id: get("order_id")?.to_string(),
            cls: get("cls")?.parse().ok()?,
            qty: get("qty")?.parse().ok()?,
            amount: get("amount")?.parse().ok()?,
            currency: get("currency").unwrap_or("eur").to_string(),
            customer_email: get("customer_email").unwrap_or_default().to_string(),
            ticket_transfer_id: get("ticket_transfer_id")?.parse().ok()?,
            goodie_transfer_id: get("goodie_transfer_id")?.parse().ok()?,
            try_goodie: get("try_goodie") == Some("1"),
            created_at: get("created_at")?.parse().ok()?,
        })
    }
}

/// Result of the combined fulfillment/idempotency check.
///
/// `event_seen` is `None` when it was not checked (gate already existed)
/// or no event id was provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FulfillFlags {
    pub already_fulfilled: bool,
    pub event_seen: Option<bool>,
}

impl FulfillFlags {
    /// The webhook must drop the event and answer idempotent-OK.
    pub fn short_circuit(&self) -> bool {
        self.already_fulfilled || self.event_seen == Some(true)
    }
}

/// One row of the admin pending feed.
#[derive(Debug, Clone, Serialize)]
pub struct PendingItem {
    pub psid: String,
    pub created_at: f64,
    pub age_ms: i64,
    pub order_id: String,
    pub cls: String,
    pub qty: u32,
    pub email: String,
    pub amount: i64,
    pub currency: String,
    pub try_goodie: bool,
    pub status: &'static str,
}

#[async_trait]
pub trait PaymentSessionStore: Send + Sync {
    /// Upsert the session and index it into the pending set.
    async fn save_session(
        &self,
        psid: &str,
        session: &PaymentSession,
    ) -> Result<(), SessionStoreError>;

    async fn get_session(&self, psid: &str) -> Result<Option<PaymentSession>, SessionStoreError>;

    /// Drop the psid from the pending index (and the hot hash, where the
    /// backend keeps one). Called on every terminal webhook outcome.
    async fn remove_pending(&self, psid: &str) -> Result<(), SessionStoreError>;

    /// Atomic combined guard: set the fulfillment gate, and if it was set
    /// just now, mark the provider event as seen.
    async fn fulfill_and_mark_event(
        &self,
        psid: &str,
        event_id: Option<&str>,
    ) -> Result<FulfillFlags, SessionStoreError>;

    /// `(total_pending, newest_items)` for the admin feed, with
    /// opportunistic cleanup of index entries whose session is gone.
    async fn list_recent_pending(
        &self,
        limit: usize,
    ) -> Result<(i64, Vec<PendingItem>), SessionStoreError>;
}

pub(crate) fn pending_item(psid: &str, session: &PaymentSession, now: f64) -> PendingItem {
    PendingItem {
        psid: psid.to_string(),
        created_at: session.created_at,
        age_ms: ((now - session.created_at).max(0.0) * 1000.0) as i64,
        order_id: session.order_id.clone(),
        cls: session.cls.as_str().to_string(),
        qty: session.qty,
        email: session.customer_email.clone(),
        amount: session.amount,
        currency: session.currency.clone(),
        try_goodie: session.try_goodie,
        status: "PENDING",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PaymentSession {
        PaymentSession {
            order_id: "ord123".into(),
            cls: TicketClass::A,
            qty: 1,
            amount: 6500,
            currency: "eur".into(),
            customer_email: "a@x.com".into(),
            ticket_transfer_id: TransferId::new(),
            goodie_transfer_id: TransferId::new(),
            try_goodie: true,
            created_at: 1_700_000_000.25,
        }
    }

    #[test]
    fn test_field_map_roundtrip() {
        let session = sample();
        let map: HashMap<String, String> = session
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let back = PaymentSession::from_fields(&map).expect("roundtrip");
        assert_eq!(back, session);
    }

    #[test]
    fn test_from_fields_rejects_missing_required() {
        let session = sample();
        for dropped in ["order_id", "cls", "ticket_transfer_id", "created_at"] {
            let map: HashMap<String, String> = session
                .to_fields()
                .into_iter()
                .filter(|(k, _)| *k != dropped)
                .map(|(k, v)| (k.to_string(), v))
                .collect();
            assert!(
                PaymentSession::from_fields(&map).is_none(),
                "must reject missing {dropped}"
            );
        }
    }

    #[test]
    fn test_from_fields_defaults() {
        let session = sample();
        let mut map: HashMap<String, String> = session
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        map.remove("currency");
        map.remove("customer_email");
        map.insert("try_goodie".into(), "0".into());
        let back = PaymentSession::from_fields(&map).unwrap();
        assert_eq!(back.currency, "eur");
        assert_eq!(back.customer_email, "");
        assert!(!back.try_goodie);
    }

    #[test]
    fn test_short_circuit_matrix() {
        let cases = [
            (true, None, true),
            (true, Some(true), true),
            (false, Some(true), true),
            (false, Some(false), false),
            (false, None, false),
        ];
        for (already, seen, expect) in cases {
            let flags = FulfillFlags {
                already_fulfilled: already,
                event_seen: seen,
            };
            assert_eq!(flags.short_circuit(), expect, "{already} {seen:?}");
        }
    }

    #[test]
    fn test_pending_item_age_clamped() {
        let session = sample();
        let item = pending_item("ps1", &session, session.created_at - 5.0);
        assert_eq!(item.age_ms, 0);
        let item = pending_item("ps1", &session, session.created_at + 1.5);
        assert_eq!(item.age_ms, 1500);
        assert_eq!(item.status, "PENDING");
    }
}
