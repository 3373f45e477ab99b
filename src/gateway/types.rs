//! Request/response DTOs for the HTTP surface.

use serde::{Deserialize, Serialize};

use crate::orders::{OrderRecord, OrderStatus};
use crate::paysession::PendingItem;
use crate::util::to_iso;

/// `POST /api/checkout` body.
#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    #[serde(default)]
    pub cls: String,
    #[serde(default)]
    pub customer_email: String,
}

/// `POST /api/checkout` response.
#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub order_id: String,
    pub redirect_url: String,
    pub amount: i64,
    pub currency: String,
}

/// `GET /api/orders/{id}` response.
#[derive(Debug, Serialize)]
pub struct OrderStatusResponse {
    pub order_id: String,
    pub status: OrderStatus,
    pub cls: String,
    pub qty: u32,
    pub amount: i64,
    pub currency: String,
    pub paid_at: Option<String>,
    pub ticket_code: String,
    pub got_goodie: bool,
}

impl From<&OrderRecord> for OrderStatusResponse {
    fn from(record: &OrderRecord) -> Self {
        Self {
            order_id: record.order_id.clone(),
            status: record.status,
            cls: record.cls.as_str().to_string(),
            qty: record.qty,
            amount: record.amount,
            currency: record.currency.clone(),
            paid_at: record.paid_at.map(to_iso),
            ticket_code: record.ticket_code.clone().unwrap_or_default(),
            got_goodie: record.got_goodie,
        }
    }
}

/// `POST /payments/webhook` response.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_status: Option<&'static str>,
}

impl WebhookAck {
    pub fn idempotent() -> Self {
        Self {
            ok: true,
            idempotent: Some(true),
            order_status: None,
        }
    }

    pub fn terminal(status: &'static str) -> Self {
        Self {
            ok: true,
            idempotent: None,
            order_status: Some(status),
        }
    }
}

/// `GET /api/pending` response.
#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub items: Vec<PendingItem>,
    pub total: i64,
    pub limit: usize,
    pub enabled: bool,
}

/// `GET /api/admin/goodies` response.
#[derive(Debug, Serialize)]
pub struct GoodiesResponse {
    pub used: i64,
    pub limit: i64,
}

/// One row of `GET /api/admin/orders`.
#[derive(Debug, Serialize)]
pub struct AdminOrderItem {
    pub id: String,
    pub status: OrderStatus,
    pub cls: String,
    pub qty: u32,
    pub amount: i64,
    pub currency: String,
    pub paid_at_iso: String,
    pub got_goodie: bool,
    pub ticket_code: String,
    pub email: String,
}

impl From<&OrderRecord> for AdminOrderItem {
    fn from(record: &OrderRecord) -> Self {
        Self {
            id: record.order_id.clone(),
            status: record.status,
            cls: record.cls.as_str().to_string(),
            qty: record.qty,
            amount: record.amount,
            currency: record.currency.clone(),
            paid_at_iso: record.paid_at.map(to_iso).unwrap_or_else(|| "-".into()),
            got_goodie: record.got_goodie,
            ticket_code: record.ticket_code.clone().unwrap_or_default(),
            email: record.customer_email.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AdminOrdersResponse {
    pub items: Vec<AdminOrderItem>,
    pub limit: usize,
}

/// `GET /mockpay/{psid}` response, consumed by the provider-mock screen.
#[derive(Debug, Serialize)]
pub struct MockPayView {
    pub psid: String,
    pub order_id: String,
    pub cls: String,
    pub qty: u32,
    pub amount: i64,
    pub currency: String,
    pub webhook_url: String,
}

/// `POST /mockpay/{psid}/emit` body: which event to fire.
#[derive(Debug, Deserialize)]
pub struct EmitRequest {
    pub t: String,
}

#[derive(Debug, Serialize)]
pub struct EmitResponse {
    pub ok: bool,
    pub kind: &'static str,
    pub order_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_ack_shapes() {
        let v = serde_json::to_value(WebhookAck::idempotent()).unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(v["idempotent"], true);
        assert!(v.get("order_status").is_none());

        let v = serde_json::to_value(WebhookAck::terminal("PAID")).unwrap();
        assert_eq!(v["order_status"], "PAID");
        assert!(v.get("idempotent").is_none());
    }

    #[test]
    fn test_checkout_request_tolerates_missing_fields() {
        let req: CheckoutRequest = serde_json::from_str("{}").unwrap();
        assert!(req.cls.is_empty());
        assert!(req.customer_email.is_empty());
    }
}
