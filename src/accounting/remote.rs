//! External atomic-ledger backend.
//!
//! Capacity is modeled as double-entry accounts: per resource an operator
//! account, a budget account flagged `debits_must_not_exceed_credits`, and a
//! spent account. Seeding credits the budget with the capacity; a
//! reservation is a PENDING transfer budget -> spent with a per-transfer
//! timeout, so the ledger itself enforces the capacity invariant and expires
//! abandoned holds. Commit posts the pending transfer, cancel voids it.
//!
//! All transfer traffic goes through the [`ChainedTransferBatcher`]; account
//! lookups are direct calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::batcher::{ChainedTransferBatcher, MAX_BATCH};
use super::error::AccountingError;
use super::{
    Accounting, HoldPair, InventoryReport, InventorySnapshot, Resource, TicketClass, TransferId,
};
use crate::config::Capacities;
use crate::util::now_ts;

/// Ledger namespace for ticket resources.
const LEDGER_TICKETS: u32 = 2000;
/// Transfer code for reservations/commits/voids.
const CODE_RESERVATION: u16 = 20;
/// Transfer code for capacity seeding.
const CODE_SEED: u16 = 1;

/// Failure code the ledger returns when a pending transfer was already
/// posted; a replayed commit with this code still counts as committed.
const ALREADY_POSTED: &str = "pending_transfer_already_posted";

/// Account triple backing one resource.
#[derive(Debug, Clone, Copy)]
struct ResourceAccounts {
    operator: u64,
    budget: u64,
    spent: u64,
}

fn accounts_for(resource: Resource) -> ResourceAccounts {
    match resource {
        Resource::Goodie => ResourceAccounts {
            operator: 2110,
            budget: 2115,
            spent: 2119,
        },
        Resource::ClassA => ResourceAccounts {
            operator: 2120,
            budget: 2125,
            spent: 2129,
        },
        Resource::ClassB => ResourceAccounts {
            operator: 2220,
            budget: 2225,
            spent: 2229,
        },
    }
}

/// Transfer flags on the ledger wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFlags {
    None,
    Pending,
    PostPending,
    VoidPending,
}

impl TransferFlags {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferFlags::None => "none",
            TransferFlags::Pending => "pending",
            TransferFlags::PostPending => "post_pending_transfer",
            TransferFlags::VoidPending => "void_pending_transfer",
        }
    }
}

/// One transfer to create, in caller-chosen-id form.
#[derive(Debug, Clone, Copy)]
pub struct NewTransfer {
    pub id: u128,
    pub debit_account: u64,
    pub credit_account: u64,
    pub amount: u64,
    /// Seconds until an unresolved pending transfer auto-releases; 0 = none.
    pub timeout_secs: u32,
    /// Pending transfer being posted/voided; 0 = none.
    pub pending_id: u128,
    pub flags: TransferFlags,
}

/// Per-index failure in a create-transfers response.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TransferFailure {
    pub index: usize,
    pub code: String,
}

/// Transport the batcher drives: one RPC per assembled batch.
#[async_trait]
pub trait LedgerTransport: Send + Sync + 'static {
    async fn create_transfers(
        &self,
        batch: Vec<NewTransfer>,
    ) -> Result<Vec<TransferFailure>, AccountingError>;
}

// === Wire types ===

#[derive(Serialize)]
struct WireAccount {
    id: u64,
    ledger: u32,
    code: u16,
    flags: Vec<&'static str>,
}

#[derive(Serialize)]
struct WireTransfer {
    id: String,
    debit_account_id: u64,
    credit_account_id: u64,
    amount: u64,
    ledger: u32,
    code: u16,
    flags: &'static str,
    timeout: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_id: Option<String>,
}

impl WireTransfer {
    fn from_new(t: &NewTransfer) -> Self {
        Self {
            id: Uuid::from_u128(t.id).to_string(),
            debit_account_id: t.debit_account,
            credit_account_id: t.credit_account,
            amount: t.amount,
            ledger: LEDGER_TICKETS,
            code: CODE_RESERVATION,
            flags: t.flags.as_str(),
            timeout: t.timeout_secs,
            pending_id: (t.pending_id != 0).then(|| Uuid::from_u128(t.pending_id).to_string()),
        }
    }
}

#[derive(Serialize)]
struct CreateAccountsRequest<'a> {
    cluster_id: u32,
    accounts: &'a [WireAccount],
}

#[derive(Serialize)]
struct CreateTransfersRequest {
    cluster_id: u32,
    transfers: Vec<WireTransfer>,
}

#[derive(Deserialize)]
struct FailuresResponse {
    #[serde(default)]
    failures: Vec<TransferFailure>,
}

#[derive(Serialize)]
struct LookupAccountsRequest<'a> {
    cluster_id: u32,
    ids: &'a [u64],
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountBalance {
    pub id: u64,
    pub credits_posted: u64,
    pub credits_pending: u64,
    #[serde(default)]
    pub debits_posted: u64,
    #[serde(default)]
    pub debits_pending: u64,
}

#[derive(Deserialize)]
struct LookupAccountsResponse {
    accounts: Vec<AccountBalance>,
}

/// HTTP client for the atomic-ledger service.
pub struct AtomicLedgerClient {
    http: reqwest::Client,
    base: String,
    cluster_id: u32,
}

impl AtomicLedgerClient {
    pub fn new(base: String, cluster_id: u32) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("ledger HTTP client");
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            cluster_id,
        }
    }

    async fn post_json<B: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, AccountingError> {
        let url = format!("{}{}", self.base, path);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AccountingError::Transport(format!("{url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(AccountingError::Rejected(format!(
                "{url}: HTTP {}",
                resp.status()
            )));
        }
        resp.json::<R>()
            .await
            .map_err(|e| AccountingError::Transport(format!("{url}: bad response: {e}")))
    }

    /// Create the resource accounts. Returns true when the accounts were
    /// created fresh (so capacity still needs seeding), false when they
    /// already existed.
    async fn create_accounts(&self, accounts: &[WireAccount]) -> Result<bool, AccountingError> {
        let resp: FailuresResponse = self
            .post_json(
                "/accounts/create",
                &CreateAccountsRequest {
                    cluster_id: self.cluster_id,
                    accounts,
                },
            )
            .await?;
        Ok(resp.failures.is_empty())
    }

    pub async fn lookup_accounts(
        &self,
        ids: &[u64],
    ) -> Result<Vec<AccountBalance>, AccountingError> {
        let resp: LookupAccountsResponse = self
            .post_json(
                "/accounts/lookup",
                &LookupAccountsRequest {
                    cluster_id: self.cluster_id,
                    ids,
                },
            )
            .await?;
        Ok(resp.accounts)
    }
}

#[async_trait]
impl LedgerTransport for AtomicLedgerClient {
    async fn create_transfers(
        &self,
        batch: Vec<NewTransfer>,
    ) -> Result<Vec<TransferFailure>, AccountingError> {
        let transfers = batch.iter().map(WireTransfer::from_new).collect();
        let resp: FailuresResponse = self
            .post_json(
                "/transfers/create",
                &CreateTransfersRequest {
                    cluster_id: self.cluster_id,
                    transfers,
                },
            )
            .await?;
        Ok(resp.failures)
    }
}

/// Did the leg at `index` go through? An already-posted replay counts.
fn leg_posted(failures: &[TransferFailure], index: usize) -> bool {
    match failures.iter().find(|f| f.index == index) {
        None => true,
        Some(f) => f.code == ALREADY_POSTED,
    }
}

/// Was the leg at `index` accepted (no failure at all)?
fn leg_accepted(failures: &[TransferFailure], index: usize) -> bool {
    !failures.iter().any(|f| f.index == index)
}

/// Accounting backend over the external atomic ledger.
pub struct LedgerAccounting {
    client: Arc<AtomicLedgerClient>,
    batcher: ChainedTransferBatcher,
    capacities: Capacities,
}

impl LedgerAccounting {
    pub fn new(client: Arc<AtomicLedgerClient>, capacities: Capacities) -> Self {
        let batcher = ChainedTransferBatcher::new(client.clone(), MAX_BATCH);
        Self {
            client,
            batcher,
            capacities,
        }
    }

    fn capacity(&self, resource: Resource) -> i64 {
        match resource {
            Resource::ClassA => self.capacities.class_a,
            Resource::ClassB => self.capacities.class_b,
            Resource::Goodie => self.capacities.goodie,
        }
    }

    /// Idempotent bootstrap: create the nine resource accounts and, on a
    /// fresh cluster, seed each budget with its capacity.
    pub async fn setup(&self) -> Result<(), AccountingError> {
        let mut accounts = Vec::new();
        for resource in [Resource::ClassA, Resource::ClassB, Resource::Goodie] {
            let accts = accounts_for(resource);
            accounts.push(WireAccount {
                id: accts.operator,
                ledger: LEDGER_TICKETS,
                code: CODE_RESERVATION,
                flags: vec![],
            });
            accounts.push(WireAccount {
                id: accts.budget,
                ledger: LEDGER_TICKETS,
                code: CODE_RESERVATION,
                flags: vec!["debits_must_not_exceed_credits"],
            });
            accounts.push(WireAccount {
                id: accts.spent,
                ledger: LEDGER_TICKETS,
                code: CODE_RESERVATION,
                flags: vec![],
            });
        }

        let fresh = self.client.create_accounts(&accounts).await?;
        if !fresh {
            tracing::info!("ledger accounts already provisioned");
            return Ok(());
        }

        let seeds: Vec<NewTransfer> = [Resource::ClassA, Resource::ClassB, Resource::Goodie]
            .into_iter()
            .map(|resource| {
                let accts = accounts_for(resource);
                NewTransfer {
                    id: TransferId::new().as_uuid().as_u128(),
                    debit_account: accts.operator,
                    credit_account: accts.budget,
                    amount: self.capacity(resource) as u64,
                    timeout_secs: 0,
                    pending_id: 0,
                    flags: TransferFlags::None,
                }
            })
            .collect();
        let seed_wire: Vec<WireTransfer> = seeds
            .iter()
            .map(|t| {
                let mut w = WireTransfer::from_new(t);
                w.code = CODE_SEED;
                w
            })
            .collect();
        let resp: FailuresResponse = self
            .client
            .post_json(
                "/transfers/create",
                &CreateTransfersRequest {
                    cluster_id: self.client.cluster_id,
                    transfers: seed_wire,
                },
            )
            .await?;
        if !resp.failures.is_empty() {
            return Err(AccountingError::Rejected(format!(
                "capacity seeding failed: {:?}",
                resp.failures
            )));
        }
        tracing::info!("ledger accounts created and capacity seeded");
        Ok(())
    }

    fn pending_transfer(
        &self,
        resource: Resource,
        qty: u32,
        ttl: Duration,
        id: TransferId,
    ) -> NewTransfer {
        let accts = accounts_for(resource);
        NewTransfer {
            id: id.as_uuid().as_u128(),
            debit_account: accts.budget,
            credit_account: accts.spent,
            amount: qty as u64,
            timeout_secs: ttl.as_secs() as u32,
            pending_id: 0,
            flags: TransferFlags::Pending,
        }
    }

    fn booked_transfer(&self, resource: Resource, qty: u32, id: TransferId) -> NewTransfer {
        let accts = accounts_for(resource);
        NewTransfer {
            id: id.as_uuid().as_u128(),
            debit_account: accts.budget,
            credit_account: accts.spent,
            amount: qty as u64,
            timeout_secs: 0,
            pending_id: 0,
            flags: TransferFlags::None,
        }
    }

    fn resolution_transfer(
        &self,
        resource: Resource,
        qty: u32,
        pending: TransferId,
        flags: TransferFlags,
    ) -> NewTransfer {
        let accts = accounts_for(resource);
        NewTransfer {
            id: TransferId::new().as_uuid().as_u128(),
            debit_account: accts.budget,
            credit_account: accts.spent,
            amount: qty as u64,
            timeout_secs: 0,
            pending_id: pending.as_uuid().as_u128(),
            flags,
        }
    }

    fn snapshot(&self, resource: Resource, balance: &AccountBalance, now: f64) -> InventorySnapshot {
        InventorySnapshot::new(
            self.capacity(resource),
            balance.credits_posted as i64,
            balance.credits_pending as i64,
            now,
        )
    }
}

#[async_trait]
impl Accounting for LedgerAccounting {
    async fn reserve(
        &self,
        resource: Resource,
        qty: u32,
        ttl: Duration,
    ) -> Result<(TransferId, bool), AccountingError> {
        let id = TransferId::new();
        let failures = self
            .batcher
            .submit(vec![self.pending_transfer(resource, qty, ttl, id)])
            .await?;
        Ok((id, leg_accepted(&failures, 0)))
    }

    async fn post(
        &self,
        pending: TransferId,
        resource: Resource,
        qty: u32,
    ) -> Result<bool, AccountingError> {
        let failures = self
            .batcher
            .submit(vec![self.resolution_transfer(
                resource,
                qty,
                pending,
                TransferFlags::PostPending,
            )])
            .await?;
        Ok(leg_posted(&failures, 0))
    }

    async fn void(
        &self,
        pending: TransferId,
        resource: Resource,
        qty: u32,
    ) -> Result<(), AccountingError> {
        let failures = self
            .batcher
            .submit(vec![self.resolution_transfer(
                resource,
                qty,
                pending,
                TransferFlags::VoidPending,
            )])
            .await?;
        if !failures.is_empty() {
            tracing::debug!(pending = %pending, ?failures, "void was a no-op");
        }
        Ok(())
    }

    async fn fast_book(
        &self,
        resource: Resource,
        qty: u32,
    ) -> Result<(TransferId, bool), AccountingError> {
        let id = TransferId::new();
        let failures = self
            .batcher
            .submit(vec![self.booked_transfer(resource, qty, id)])
            .await?;
        Ok((id, leg_accepted(&failures, 0)))
    }

    async fn hold_tickets(
        &self,
        cls: TicketClass,
        qty: u32,
        ttl: Duration,
    ) -> Result<HoldPair, AccountingError> {
        let ticket_id = TransferId::new();
        let goodie_id = TransferId::new();
        let failures = self
            .batcher
            .submit(vec![
                self.pending_transfer(cls.resource(), qty, ttl, ticket_id),
                self.pending_transfer(Resource::Goodie, 1, ttl, goodie_id),
            ])
            .await?;
        Ok(HoldPair {
            ticket_id,
            goodie_id,
            ticket_ok: leg_accepted(&failures, 0),
            goodie_ok: leg_accepted(&failures, 1),
        })
    }

    async fn book_immediately(
        &self,
        cls: TicketClass,
        qty: u32,
    ) -> Result<HoldPair, AccountingError> {
        let ticket_id = TransferId::new();
        let goodie_id = TransferId::new();
        let failures = self
            .batcher
            .submit(vec![
                self.booked_transfer(cls.resource(), qty, ticket_id),
                self.booked_transfer(Resource::Goodie, 1, goodie_id),
            ])
            .await?;
        Ok(HoldPair {
            ticket_id,
            goodie_id,
            ticket_ok: leg_accepted(&failures, 0),
            goodie_ok: leg_accepted(&failures, 1),
        })
    }

    async fn commit_order(
        &self,
        ticket: TransferId,
        goodie: TransferId,
        cls: TicketClass,
        qty: u32,
        try_goodie: bool,
    ) -> Result<(bool, bool), AccountingError> {
        let mut transfers = vec![self.resolution_transfer(
            cls.resource(),
            qty,
            ticket,
            TransferFlags::PostPending,
        )];
        if try_goodie {
            transfers.push(self.resolution_transfer(
                Resource::Goodie,
                1,
                goodie,
                TransferFlags::PostPending,
            ));
        }
        let failures = self.batcher.submit(transfers).await?;

        let gets_ticket = leg_posted(&failures, 0);
        let gets_goodie = try_goodie && leg_posted(&failures, 1);
        Ok((gets_ticket, gets_goodie))
    }

    async fn cancel_order(
        &self,
        ticket: TransferId,
        goodie: TransferId,
        cls: TicketClass,
        qty: u32,
    ) -> Result<(), AccountingError> {
        let failures = self
            .batcher
            .submit(vec![
                self.resolution_transfer(cls.resource(), qty, ticket, TransferFlags::VoidPending),
                self.resolution_transfer(Resource::Goodie, 1, goodie, TransferFlags::VoidPending),
            ])
            .await?;
        if !failures.is_empty() {
            tracing::debug!(ticket = %ticket, goodie = %goodie, ?failures, "cancel was partial no-op");
        }
        Ok(())
    }

    async fn cancel_only_goodie(&self, goodie: TransferId) -> Result<(), AccountingError> {
        self.void(goodie, Resource::Goodie, 1).await
    }

    async fn inventory(&self, resource: Resource) -> Result<InventorySnapshot, AccountingError> {
        let accts = accounts_for(resource);
        let balances = self.client.lookup_accounts(&[accts.spent]).await?;
        let balance = balances
            .first()
            .ok_or_else(|| AccountingError::UnknownResource(resource.name().to_string()))?;
        Ok(self.snapshot(resource, balance, now_ts()))
    }

    async fn compute_inventory(&self) -> Result<InventoryReport, AccountingError> {
        let a = accounts_for(Resource::ClassA).spent;
        let b = accounts_for(Resource::ClassB).spent;
        let balances = self.client.lookup_accounts(&[a, b]).await?;
        let now = now_ts();

        let find = |id: u64, name: &str| -> Result<&AccountBalance, AccountingError> {
            balances
                .iter()
                .find(|bal| bal.id == id)
                .ok_or_else(|| AccountingError::UnknownResource(name.to_string()))
        };
        Ok(InventoryReport {
            class_a: self.snapshot(Resource::ClassA, find(a, "class_a")?, now),
            class_b: self.snapshot(Resource::ClassB, find(b, "class_b")?, now),
        })
    }

    async fn goodies_posted(&self) -> Result<i64, AccountingError> {
        let accts = accounts_for(Resource::Goodie);
        let balances = self.client.lookup_accounts(&[accts.spent]).await?;
        Ok(balances
            .first()
            .map(|b| b.credits_posted as i64)
            .unwrap_or(0))
    }

    async fn shutdown(&self) {
        let backlog = self.batcher.backlog().await;
        if backlog > 0 {
            tracing::info!(backlog, "flushing ledger batcher before shutdown");
        }
        self.batcher.flush_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_ids_distinct() {
        let mut ids = Vec::new();
        for resource in [Resource::ClassA, Resource::ClassB, Resource::Goodie] {
            let a = accounts_for(resource);
            ids.extend([a.operator, a.budget, a.spent]);
        }
        let mut dedup = ids.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), ids.len());
    }

    #[test]
    fn test_leg_outcomes() {
        let failures = vec![TransferFailure {
            index: 1,
            code: "exceeds_credits".into(),
        }];
        assert!(leg_accepted(&failures, 0));
        assert!(!leg_accepted(&failures, 1));
        assert!(leg_posted(&failures, 0));
        assert!(!leg_posted(&failures, 1));

        // a replayed post counts as posted
        let replay = vec![TransferFailure {
            index: 0,
            code: ALREADY_POSTED.into(),
        }];
        assert!(leg_posted(&replay, 0));
        assert!(!leg_accepted(&replay, 0));
    }

    #[test]
    fn test_wire_transfer_shape() {
        let t = NewTransfer {
            id: 7,
            debit_account: 2125,
            credit_account: 2129,
            amount: 1,
            timeout_secs: 300,
            pending_id: 0,
            flags: TransferFlags::Pending,
        };
        let wire = WireTransfer::from_new(&t);
        let v = serde_json::to_value(&wire).unwrap();
        assert_eq!(v["flags"], "pending");
        assert_eq!(v["timeout"], 300);
        assert_eq!(v["ledger"], LEDGER_TICKETS);
        assert!(v.get("pending_id").is_none());

        let post = NewTransfer {
            pending_id: 7,
            flags: TransferFlags::PostPending,
            timeout_secs: 0,
            ..t
        };
        let v = serde_json::to_value(WireTransfer::from_new(&post)).unwrap();
        assert_eq!(v["flags"], "post_pending_transfer");
        assert_eq!(v["pending_id"], Uuid::from_u128(7).to_string());
    }
}
