//! hotseat - ticket drop service with a hard no-oversell invariant.
//!
//! Two ticket classes and one cross-class goodie pool, each with finite
//! capacity. A checkout tentatively reserves one ticket and one goodie slot
//! through a two-phase accounting protocol; the payment provider's signed
//! webhook later commits or releases the reservation, idempotently, with a
//! reservation timeout as the safety net.
//!
//! # Modules
//!
//! - [`config`] - environment-driven configuration
//! - [`accounting`] - capacity ledger (external atomic ledger or Postgres)
//!   and the transfer batcher
//! - [`paysession`] - checkout -> webhook handoff store and idempotency
//!   gates (hot KV or Postgres)
//! - [`orders`] - durable log of terminal orders
//! - [`mockpay`] - payment-provider adapter and webhook signatures
//! - [`gateway`] - the HTTP surface
//! - [`db`] - Postgres pool and the DB gate
//! - [`util`] - timestamps, email validation, constant-time compare

pub mod accounting;
pub mod config;
pub mod db;
pub mod gateway;
pub mod logging;
pub mod mockpay;
pub mod orders;
pub mod paysession;
pub mod util;

// Convenient re-exports at crate root
pub use accounting::{Accounting, HoldPair, Resource, TicketClass, TransferId};
pub use config::{AcctBackend, AppConfig, SessionBackend};
pub use db::DbGate;
pub use gateway::AppState;
pub use orders::{OrderRecord, OrderStatus, OrderStore};
pub use paysession::{FulfillFlags, PaymentSession, PaymentSessionStore};
