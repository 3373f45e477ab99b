//! Hot-KV session store.
//!
//! Layout:
//! - `ps:{psid}`      hash with the session fields, TTL = reservation + grace
//! - `pendings`       sorted set of psids scored by created_at
//! - `fulfill:{psid}` NX-set fulfillment gate, 24h TTL
//! - `idemp:{event}`  NX-set event-seen key, 1h TTL
//!
//! The combined guard is two sequential NX-sets with a short-circuit: if
//! the gate already existed the event key is not touched.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::{
    pending_item, FulfillFlags, PaymentSession, PaymentSessionStore, PendingItem,
    SessionStoreError, EVENT_SEEN_TTL_SECS, FULFILL_GATE_TTL_SECS, SESSION_TTL_GRACE_SECS,
};
use crate::util::now_ts;

const PENDING_INDEX: &str = "pendings";

fn k_ps(psid: &str) -> String {
    format!("ps:{psid}")
}

fn k_fulfill(psid: &str) -> String {
    format!("fulfill:{psid}")
}

fn k_idemp(event_id: &str) -> String {
    format!("idemp:{event_id}")
}

pub struct RedisSessionStore {
    conn: ConnectionManager,
    ttl_seconds: u64,
    /// Bounds commands in flight on the multiplexed connection, the same
    /// role the DB gate plays for SQL.
    gate: Arc<Semaphore>,
}

impl RedisSessionStore {
    pub fn new(conn: ConnectionManager, reservation_ttl_seconds: u64, max_in_flight: usize) -> Self {
        Self {
            conn,
            ttl_seconds: reservation_ttl_seconds + SESSION_TTL_GRACE_SECS,
            gate: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    async fn permit(&self) -> tokio::sync::SemaphorePermit<'_> {
        self.gate.acquire().await.expect("redis gate semaphore closed")
    }

    /// `SET key 1 NX EX ttl` -> true when the key was set just now.
    async fn set_nx_ex(&self, key: &str, ttl: u64) -> Result<bool, SessionStoreError> {
        let _permit = self.permit().await;
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl)
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn mark_event_seen(&self, event_id: &str) -> Result<bool, SessionStoreError> {
        self.set_nx_ex(&k_idemp(event_id), EVENT_SEEN_TTL_SECS).await
    }
}

#[async_trait]
impl PaymentSessionStore for RedisSessionStore {
    async fn save_session(
        &self,
        psid: &str,
        session: &PaymentSession,
    ) -> Result<(), SessionStoreError> {
        let _permit = self.permit().await;
        let mut conn = self.conn.clone();
        let fields = session.to_fields();
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(k_ps(psid), &fields)
            .ignore()
            .expire(k_ps(psid), self.ttl_seconds as i64)
            .ignore()
            .zadd(PENDING_INDEX, psid, session.created_at)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_session(&self, psid: &str) -> Result<Option<PaymentSession>, SessionStoreError> {
        let fields: HashMap<String, String> = {
            let _permit = self.permit().await;
            let mut conn = self.conn.clone();
            conn.hgetall(k_ps(psid)).await?
        };
        if fields.is_empty() {
            return Ok(None);
        }
        match PaymentSession::from_fields(&fields) {
            Some(session) => Ok(Some(session)),
            None => Err(SessionStoreError::Corrupt {
                psid: psid.to_string(),
                detail: "missing or unparsable fields".into(),
            }),
        }
    }

    async fn remove_pending(&self, psid: &str) -> Result<(), SessionStoreError> {
        let _permit = self.permit().await;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(PENDING_INDEX, psid)
            .ignore()
            .del(k_ps(psid))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn fulfill_and_mark_event(
        &self,
        psid: &str,
        event_id: Option<&str>,
    ) -> Result<FulfillFlags, SessionStoreError> {
        let gate_set_now = self.set_nx_ex(&k_fulfill(psid), FULFILL_GATE_TTL_SECS).await?;
        if !gate_set_now {
            // gate already existed; idempotency key deliberately untouched
            return Ok(FulfillFlags {
                already_fulfilled: true,
                event_seen: None,
            });
        }
        let event_seen = match event_id {
            Some(event_id) => Some(!self.mark_event_seen(event_id).await?),
            None => None,
        };
        Ok(FulfillFlags {
            already_fulfilled: false,
            event_seen,
        })
    }

    async fn list_recent_pending(
        &self,
        limit: usize,
    ) -> Result<(i64, Vec<PendingItem>), SessionStoreError> {
        // permit scoped to the direct commands; the housekeeping below
        // re-acquires through remove_pending
        let (total, psids, rows) = {
            let _permit = self.permit().await;
            let mut conn = self.conn.clone();
            let total: i64 = conn.zcard(PENDING_INDEX).await?;
            let psids: Vec<String> = conn
                .zrevrange(PENDING_INDEX, 0, limit.saturating_sub(1) as isize)
                .await?;
            if psids.is_empty() {
                return Ok((total, Vec::new()));
            }

            let mut pipe = redis::pipe();
            for psid in &psids {
                pipe.hgetall(k_ps(psid));
            }
            let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;
            (total, psids, rows)
        };

        let now = now_ts();
        let mut items = Vec::with_capacity(psids.len());
        for (psid, fields) in psids.iter().zip(rows) {
            if fields.is_empty() {
                // dangling index entry: the hash expired, clean it up
                self.remove_pending(psid).await?;
                continue;
            }
            match PaymentSession::from_fields(&fields) {
                Some(session) => items.push(pending_item(psid, &session, now)),
                None => {
                    tracing::warn!(psid = %psid, "dropping unparsable pending session");
                    self.remove_pending(psid).await?;
                }
            }
        }
        Ok((total, items))
    }
}
