//! Payment-provider adapter.
//!
//! The provider speaks a three-event protocol (`payment.succeeded`,
//! `payment.failed`, `payment.canceled`) delivered as signed JSON webhooks:
//! `x-mockpay-signature: Base64(HMAC-SHA256(secret, raw_body))`. The
//! adapter owns session-id/redirect generation, signature creation, and
//! constant-time verification; handlers never touch key material.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Signature header on webhook deliveries.
pub const SIGNATURE_HEADER: &str = "x-mockpay-signature";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("invalid signature")]
    BadSignature,

    #[error("invalid JSON payload")]
    BadPayload,
}

/// Webhook event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Succeeded,
    Failed,
    Canceled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Succeeded => "succeeded",
            EventKind::Failed => "failed",
            EventKind::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(EventKind::Succeeded),
            "failed" => Some(EventKind::Failed),
            "canceled" => Some(EventKind::Canceled),
            _ => None,
        }
    }
}

/// A provider event, as carried in the webhook body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEvent {
    /// `payment.succeeded` | `payment.failed` | `payment.canceled`
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payment_session_id: String,
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl ProviderEvent {
    /// The event kind, from the suffix of `type`.
    pub fn kind(&self) -> Option<EventKind> {
        let suffix = self.event_type.rsplit('.').next()?;
        EventKind::parse(suffix)
    }
}

/// A freshly created payment session handle.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub psid: String,
    pub redirect_url: String,
}

/// Boundary to the payment provider.
pub trait PaymentAdapter: Send + Sync {
    /// Mint a new session id and the URL the buyer is redirected to.
    fn create_session_handle(&self) -> SessionHandle;

    /// Verify the signature over the raw body and parse the event.
    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<ProviderEvent, WebhookError>;

    /// Sign a payload the way the provider would.
    fn sign(&self, payload: &[u8]) -> String;
}

pub struct MockPay {
    secret: String,
}

impl MockPay {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key length")
    }
}

impl PaymentAdapter for MockPay {
    fn create_session_handle(&self) -> SessionHandle {
        let psid = format!("mock_{}", Uuid::new_v4().simple());
        let redirect_url = format!("/mockpay/{psid}");
        SessionHandle { psid, redirect_url }
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<ProviderEvent, WebhookError> {
        let signature = signature.ok_or(WebhookError::MissingSignature)?;
        let sig_bytes = BASE64
            .decode(signature.trim())
            .map_err(|_| WebhookError::BadSignature)?;

        let mut mac = self.mac();
        mac.update(payload);
        // verify_slice is constant-time
        mac.verify_slice(&sig_bytes)
            .map_err(|_| WebhookError::BadSignature)?;

        serde_json::from_slice(payload).map_err(|_| WebhookError::BadPayload)
    }

    fn sign(&self, payload: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(payload);
        BASE64.encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_json(kind: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "type": format!("payment.{kind}"),
            "payment_session_id": "mock_abc",
            "order_id": "ord1",
            "amount": 6500,
            "currency": "eur",
            "created_at": 1_700_000_000,
            "idempotency_key": "evt_1",
        }))
        .unwrap()
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let adapter = MockPay::new("supersecret".into());
        let payload = event_json("succeeded");
        let sig = adapter.sign(&payload);

        let event = adapter.verify_webhook(&payload, Some(&sig)).unwrap();
        assert_eq!(event.kind(), Some(EventKind::Succeeded));
        assert_eq!(event.payment_session_id, "mock_abc");
        assert_eq!(event.idempotency_key.as_deref(), Some("evt_1"));
    }

    #[test]
    fn test_missing_signature() {
        let adapter = MockPay::new("supersecret".into());
        assert_eq!(
            adapter.verify_webhook(b"{}", None).unwrap_err(),
            WebhookError::MissingSignature
        );
    }

    #[test]
    fn test_forged_signature() {
        let adapter = MockPay::new("supersecret".into());
        let payload = event_json("succeeded");
        let other = MockPay::new("wrong-secret".into());
        let forged = other.sign(&payload);
        assert_eq!(
            adapter.verify_webhook(&payload, Some(&forged)).unwrap_err(),
            WebhookError::BadSignature
        );
        assert_eq!(
            adapter
                .verify_webhook(&payload, Some("not-base64!!"))
                .unwrap_err(),
            WebhookError::BadSignature
        );
    }

    #[test]
    fn test_tampered_body() {
        let adapter = MockPay::new("supersecret".into());
        let payload = event_json("succeeded");
        let sig = adapter.sign(&payload);
        let tampered = event_json("failed");
        assert_eq!(
            adapter.verify_webhook(&tampered, Some(&sig)).unwrap_err(),
            WebhookError::BadSignature
        );
    }

    #[test]
    fn test_valid_signature_bad_json() {
        let adapter = MockPay::new("supersecret".into());
        let payload = b"not json at all";
        let sig = adapter.sign(payload);
        assert_eq!(
            adapter.verify_webhook(payload, Some(&sig)).unwrap_err(),
            WebhookError::BadPayload
        );
    }

    #[test]
    fn test_event_kinds() {
        for (raw, kind) in [
            ("payment.succeeded", EventKind::Succeeded),
            ("payment.failed", EventKind::Failed),
            ("payment.canceled", EventKind::Canceled),
        ] {
            let event = ProviderEvent {
                event_type: raw.into(),
                payment_session_id: String::new(),
                order_id: String::new(),
                amount: 0,
                currency: String::new(),
                created_at: 0,
                idempotency_key: None,
            };
            assert_eq!(event.kind(), Some(kind));
        }

        let unknown = ProviderEvent {
            event_type: "payment.refunded".into(),
            payment_session_id: String::new(),
            order_id: String::new(),
            amount: 0,
            currency: String::new(),
            created_at: 0,
            idempotency_key: None,
        };
        assert_eq!(unknown.kind(), None);
    }

    #[test]
    fn test_session_handle_shape() {
        let adapter = MockPay::new("s".into());
        let handle = adapter.create_session_handle();
        assert!(handle.psid.starts_with("mock_"));
        assert_eq!(handle.redirect_url, format!("/mockpay/{}", handle.psid));
    }
}
