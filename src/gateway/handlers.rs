//! HTTP handlers: checkout, webhook fulfillment, and the read APIs.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::error::ApiError;
use super::types::{
    AdminOrderItem, AdminOrdersResponse, CheckoutRequest, CheckoutResponse, EmitRequest,
    EmitResponse, GoodiesResponse, MockPayView, OrderStatusResponse, PendingResponse, WebhookAck,
};
use super::AppState;
use crate::accounting::TicketClass;
use crate::mockpay::{EventKind, ProviderEvent, SIGNATURE_HEADER};
use crate::orders::{OrderRecord, OrderStatus};
use crate::paysession::PaymentSession;
use crate::util::{is_valid_email, new_ticket_code, now_ts};

/// GET /api/v1/health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================================
// Checkout
// ============================================================================

/// POST /api/checkout
///
/// Reserves one ticket and one goodie slot, parks the handoff record in the
/// session store, and hands the buyer the provider redirect. Nothing is
/// written to the durable order store here; that happens only when the
/// order terminates successfully.
pub async fn create_checkout(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let customer_email = req.customer_email.trim().to_string();
    if !is_valid_email(&customer_email) {
        return Err(ApiError::bad_request(
            "customer_email is required and must be a valid email address",
        ));
    }
    let cls: TicketClass = req
        .cls
        .parse()
        .map_err(|_| ApiError::bad_request("invalid ticket class"))?;

    // Single-ticket policy.
    let qty = 1u32;

    let hold = state
        .accounting
        .hold_tickets(cls, qty, state.reservation_ttl)
        .await?;

    if !hold.ticket_ok {
        if hold.goodie_ok {
            // release the goodie early instead of letting it time out
            if let Err(e) = state.accounting.cancel_only_goodie(hold.goodie_id).await {
                tracing::debug!(error = %e, "goodie release on sold-out failed");
            }
        }
        return Err(ApiError::SoldOut);
    }

    let amount = cls.price_cents() * qty as i64;
    let order_id = Uuid::new_v4().simple().to_string();
    let handle = state.adapter.create_session_handle();

    let session = PaymentSession {
        order_id: order_id.clone(),
        cls,
        qty,
        amount,
        currency: "eur".into(),
        customer_email,
        ticket_transfer_id: hold.ticket_id,
        goodie_transfer_id: hold.goodie_id,
        try_goodie: hold.goodie_ok,
        created_at: now_ts(),
    };
    state.sessions.save_session(&handle.psid, &session).await?;

    tracing::info!(
        order_id = %order_id,
        psid = %handle.psid,
        cls = %cls,
        try_goodie = hold.goodie_ok,
        "checkout reserved"
    );

    Ok(Json(CheckoutResponse {
        order_id,
        redirect_url: handle.redirect_url,
        amount,
        currency: "eur".into(),
    }))
}

// ============================================================================
// Order status (polled by the success page)
// ============================================================================

/// GET /api/orders/{order_id}
///
/// 404 is the normal "webhook hasn't finished" signal; clients poll.
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<Json<OrderStatusResponse>, ApiError> {
    let record = state
        .orders
        .get_order(&order_id)
        .await?
        .ok_or_else(|| ApiError::not_found("order not found"))?;
    Ok(Json(OrderStatusResponse::from(&record)))
}

// ============================================================================
// Webhook
// ============================================================================

/// POST /payments/webhook
///
/// Idempotent commit/void of a reservation. The fulfillment gate is taken
/// before any ledger work, so a concurrent or replayed delivery
/// short-circuits instead of doing duplicate work; the cost is that a
/// crash after the gate leaves remediation to the operator (provider
/// redeliveries answer idempotent-OK from then on).
pub async fn payments_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let event = state.adapter.verify_webhook(&body, signature)?;
    let kind = event
        .kind()
        .ok_or_else(|| ApiError::bad_request(format!("unknown event type '{}'", event.event_type)))?;
    let psid = event.payment_session_id.clone();
    if psid.is_empty() {
        return Err(ApiError::bad_request("missing payment_session_id"));
    }

    let session = state
        .sessions
        .get_session(&psid)
        .await?
        .ok_or_else(|| ApiError::not_found("payment session not found"))?;

    // Combined guard: one durable transaction on PG, 1-2 round trips on the
    // hot KV. From here on this request exclusively owns the psid.
    let flags = state
        .sessions
        .fulfill_and_mark_event(&psid, event.idempotency_key.as_deref())
        .await?;
    if flags.short_circuit() {
        tracing::info!(psid = %psid, "duplicate webhook dropped");
        return Ok(Json(WebhookAck::idempotent()));
    }

    match kind {
        EventKind::Succeeded => handle_succeeded(&state, &psid, &session).await,
        EventKind::Failed | EventKind::Canceled => {
            handle_not_paid(&state, &psid, &session, kind).await
        }
    }
}

async fn handle_succeeded(
    state: &AppState,
    psid: &str,
    session: &PaymentSession,
) -> Result<Json<WebhookAck>, ApiError> {
    // Ledger first; no DB transaction is held across this call.
    let (mut gets_ticket, mut gets_goodie) = state
        .accounting
        .commit_order(
            session.ticket_transfer_id,
            session.goodie_transfer_id,
            session.cls,
            session.qty,
            session.try_goodie,
        )
        .await?;

    if !gets_ticket {
        // The hold expired before the provider called back; try to book
        // leftover capacity directly.
        let rebook = state
            .accounting
            .book_immediately(session.cls, session.qty)
            .await?;
        if rebook.ticket_ok {
            gets_ticket = true;
            gets_goodie = gets_goodie || rebook.goodie_ok;
        }
    }

    let ticket_code = gets_ticket.then(new_ticket_code);
    let status = if gets_ticket {
        OrderStatus::Paid
    } else {
        OrderStatus::PaidUnfulfilled
    };

    let record = OrderRecord {
        order_id: session.order_id.clone(),
        ticket_transfer_id: session.ticket_transfer_id,
        goodie_transfer_id: session.goodie_transfer_id,
        try_goodie: session.try_goodie,
        cls: session.cls,
        qty: session.qty,
        amount: session.amount,
        currency: session.currency.clone(),
        customer_email: session.customer_email.clone(),
        status,
        created_at: session.created_at,
        paid_at: Some(now_ts()),
        ticket_code,
        got_goodie: gets_goodie,
    };
    let inserted = state.orders.insert_order(&record).await?;
    if !inserted {
        // a unique key fired: an idempotent replay raced the first write
        tracing::info!(order_id = %record.order_id, "duplicate order insert collapsed");
    }

    if let Err(e) = state.sessions.remove_pending(psid).await {
        // non-fatal; the TTL reclaims the entry
        tracing::warn!(psid = %psid, error = %e, "pending cleanup failed");
    }

    tracing::info!(
        order_id = %record.order_id,
        status = %status,
        got_goodie = gets_goodie,
        "order fulfilled"
    );
    Ok(Json(WebhookAck::terminal(status.as_str())))
}

async fn handle_not_paid(
    state: &AppState,
    psid: &str,
    session: &PaymentSession,
    kind: EventKind,
) -> Result<Json<WebhookAck>, ApiError> {
    state
        .accounting
        .cancel_order(
            session.ticket_transfer_id,
            session.goodie_transfer_id,
            session.cls,
            session.qty,
        )
        .await?;

    if let Err(e) = state.sessions.remove_pending(psid).await {
        tracing::warn!(psid = %psid, error = %e, "pending cleanup failed");
    }

    // No durable write for failure/cancel: abandoned reservations never
    // pollute the order table.
    let status = match kind {
        EventKind::Failed => OrderStatus::Failed,
        _ => OrderStatus::Canceled,
    };
    tracing::info!(order_id = %session.order_id, status = %status, "order released");
    Ok(Json(WebhookAck::terminal(status.as_str())))
}

// ============================================================================
// Read APIs
// ============================================================================

/// GET /api/inventory
pub async fn get_inventory(
    State(state): State<Arc<AppState>>,
) -> Result<Json<crate::accounting::InventoryReport>, ApiError> {
    Ok(Json(state.accounting.compute_inventory().await?))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

fn clamp_limit(limit: Option<usize>, default: usize) -> usize {
    limit.unwrap_or(default).clamp(1, 500)
}

/// GET /api/pending?limit=N
pub async fn get_pending(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<PendingResponse>, ApiError> {
    let limit = clamp_limit(query.limit, 100);
    let (total, items) = state.sessions.list_recent_pending(limit).await?;
    Ok(Json(PendingResponse {
        items,
        total,
        limit,
        enabled: true,
    }))
}

/// GET /api/admin/goodies
pub async fn admin_goodies(
    State(state): State<Arc<AppState>>,
) -> Result<Json<GoodiesResponse>, ApiError> {
    let used = state.accounting.goodies_posted().await?;
    Ok(Json(GoodiesResponse {
        used,
        limit: state.goodie_limit,
    }))
}

/// GET /api/admin/orders?limit=N
pub async fn admin_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<AdminOrdersResponse>, ApiError> {
    let limit = clamp_limit(query.limit, 200);
    let records = state.orders.list_recent(limit).await?;
    Ok(Json(AdminOrdersResponse {
        items: records.iter().map(AdminOrderItem::from).collect(),
        limit,
    }))
}

// ============================================================================
// Provider-mock endpoints
// ============================================================================

/// GET /mockpay/{psid}
///
/// Session summary for the provider-mock screen.
pub async fn mockpay_view(
    State(state): State<Arc<AppState>>,
    Path(psid): Path<String>,
) -> Result<Json<MockPayView>, ApiError> {
    let session = state
        .sessions
        .get_session(&psid)
        .await?
        .ok_or_else(|| ApiError::not_found("payment session not found"))?;
    Ok(Json(MockPayView {
        psid,
        order_id: session.order_id,
        cls: session.cls.as_str().to_string(),
        qty: session.qty,
        amount: session.amount,
        currency: session.currency,
        webhook_url: state.webhook_url.clone(),
    }))
}

/// POST /mockpay/{psid}/emit
///
/// Build, sign, and self-deliver the provider event for this session.
/// Delivery failure is not fatal: the buyer can retry from the provider
/// screen, exactly as a real provider would redeliver.
pub async fn mockpay_emit(
    State(state): State<Arc<AppState>>,
    Path(psid): Path<String>,
    Json(req): Json<EmitRequest>,
) -> Result<Json<EmitResponse>, ApiError> {
    let kind = EventKind::parse(&req.t).ok_or_else(|| ApiError::bad_request("invalid kind"))?;

    let session = state
        .sessions
        .get_session(&psid)
        .await?
        .ok_or_else(|| ApiError::not_found("payment session not found"))?;

    let event = ProviderEvent {
        event_type: format!("payment.{}", kind.as_str()),
        payment_session_id: psid.clone(),
        order_id: session.order_id.clone(),
        amount: session.amount,
        currency: session.currency.clone(),
        created_at: now_ts() as i64,
        idempotency_key: Some(format!("evt_{}", Uuid::new_v4().simple())),
    };
    let payload = serde_json::to_vec(&event)
        .map_err(|e| ApiError::Internal(format!("event serialization: {e}")))?;
    let signature = state.adapter.sign(&payload);

    let delivery = state
        .http
        .post(&state.webhook_url)
        .header(SIGNATURE_HEADER, signature)
        .header("content-type", "application/json")
        .body(payload)
        .send()
        .await;
    if let Err(e) = delivery {
        tracing::warn!(psid = %psid, error = %e, "webhook delivery failed");
    }

    Ok(Json(EmitResponse {
        ok: true,
        kind: kind.as_str(),
        order_id: session.order_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None, 100), 100);
        assert_eq!(clamp_limit(Some(0), 100), 1);
        assert_eq!(clamp_limit(Some(5), 100), 5);
        assert_eq!(clamp_limit(Some(10_000), 100), 500);
    }
}
