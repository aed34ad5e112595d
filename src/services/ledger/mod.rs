//! Ledger Gateway
//!
//! Thin wrapper over the TigerBeetle client. Every pre-trade reservation,
//! cancel release and settlement leg is a double-entry transfer against a
//! per-symbol escrow account; the engine enforces that user accounts never
//! overdraw (debits must not exceed credits).
//!
//! Transfer codes:
//!   1001 cash reservation, 1002 asset reservation, 1005 deposit,
//!   2001 release, 3001 cash settlement, 3002 asset settlement.

pub mod accounts;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tigerbeetle_unofficial::account::Flags as AccountFlags;
use tigerbeetle_unofficial::transfer::Flags as TransferFlags;
use tigerbeetle_unofficial::{Account, Client, Transfer};

pub const CODE_CASH_RESERVATION: u16 = 1001;
pub const CODE_ASSET_RESERVATION: u16 = 1002;
pub const CODE_DEPOSIT: u16 = 1005;
pub const CODE_RELEASE: u16 = 2001;
pub const CODE_CASH_SETTLEMENT: u16 = 3001;
pub const CODE_ASSET_SETTLEMENT: u16 = 3002;

/// Account codes (the engine's 16-bit account category field).
pub const ACCOUNT_CODE_USER: u16 = 1;
pub const ACCOUNT_CODE_ESCROW: u16 = 2;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger client: {0}")]
    Client(String),

    /// The engine rejected one or more entries of a batch.
    #[error("transfer rejected: {0}")]
    TransferRejected(String),

    #[error("malformed 128-bit account id: {0}")]
    InvalidAccountId(String),
}

/// One transfer of a settlement or reservation, fully resolved to engine
/// account ids.
#[derive(Debug, Clone)]
pub struct TransferSpec {
    pub debit: u128,
    pub credit: u128,
    pub amount: u128,
    pub ledger: u32,
    pub code: u16,
}

pub struct LedgerGateway {
    client: Client,
}

impl LedgerGateway {
    pub fn connect(cluster_id: u128, address: &str) -> Result<Self, LedgerError> {
        let client =
            Client::new(cluster_id, address).map_err(|e| LedgerError::Client(format!("{e:?}")))?;
        Ok(Self { client })
    }

    /// Pre-trade reservation: user account -> escrow. Returns the transfer id.
    pub async fn reserve(&self, spec: TransferSpec) -> Result<u128, LedgerError> {
        let id = next_transfer_id();
        self.submit(vec![build_transfer(id, &spec)]).await?;
        Ok(id)
    }

    /// Release a reservation remainder back to the user (cancel path).
    pub async fn release(&self, spec: TransferSpec) -> Result<u128, LedgerError> {
        let id = next_transfer_id();
        self.submit(vec![build_transfer(id, &spec)]).await?;
        Ok(id)
    }

    /// Settle one trade: cash-escrow -> seller and asset-escrow -> buyer,
    /// submitted as a linked pair so the two legs post or reject together.
    /// Returns (cash transfer id, asset transfer id); the cash id becomes the
    /// trade row's `ledger_transfer_id`.
    pub async fn settle(
        &self,
        cash: &TransferSpec,
        asset: &TransferSpec,
    ) -> Result<(u128, u128), LedgerError> {
        let cash_id = next_transfer_id();
        let asset_id = next_transfer_id();
        let batch = vec![
            build_transfer(cash_id, cash).with_flags(TransferFlags::LINKED),
            build_transfer(asset_id, asset),
        ];
        self.submit(batch).await?;
        Ok((cash_id, asset_id))
    }

    /// Create a per-symbol escrow account. Re-creation of an existing account
    /// is treated as success.
    pub async fn create_escrow_account(&self, id: u128, ledger: u32) -> Result<(), LedgerError> {
        let account = Account::new(id, ledger, ACCOUNT_CODE_ESCROW).with_flags(AccountFlags::HISTORY);
        self.create_accounts(vec![account]).await
    }

    /// Create a user account on a ledger. The overdraw guard lives here:
    /// debits must not exceed credits.
    pub async fn create_user_account(&self, id: u128, ledger: u32) -> Result<(), LedgerError> {
        let account = Account::new(id, ledger, ACCOUNT_CODE_USER)
            .with_flags(AccountFlags::DEBITS_MUST_NOT_EXCEED_CREDITS);
        self.create_accounts(vec![account]).await
    }

    async fn create_accounts(&self, batch: Vec<Account>) -> Result<(), LedgerError> {
        match self.client.create_accounts(batch).await {
            Ok(_) => Ok(()),
            // Idempotent bootstrap: an already-existing account is fine.
            Err(e) if format!("{e:?}").contains("Exists") => Ok(()),
            Err(e) => Err(LedgerError::Client(format!("{e:?}"))),
        }
    }

    async fn submit(&self, batch: Vec<Transfer>) -> Result<(), LedgerError> {
        self.client
            .create_transfers(batch)
            .await
            .map_err(|e| LedgerError::TransferRejected(format!("{e:?}")))
    }
}

fn build_transfer(id: u128, spec: &TransferSpec) -> Transfer {
    Transfer::new(id)
        .with_debit_account_id(spec.debit)
        .with_credit_account_id(spec.credit)
        .with_amount(spec.amount)
        .with_ledger(spec.ledger)
        .with_code(spec.code)
}

// --- id helpers ---

static TRANSFER_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Time-based unique transfer id: millisecond timestamp in the high bits, a
/// per-process sequence in the low bits.
pub fn next_transfer_id() -> u128 {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u128;
    let seq = TRANSFER_SEQUENCE.fetch_add(1, Ordering::SeqCst) as u128;
    (timestamp_ms << 64) | seq
}

/// Parse a NUMERIC(39,0) column value back into an engine account id.
pub fn parse_account_id(s: &str) -> Result<u128, LedgerError> {
    s.parse::<u128>()
        .map_err(|_| LedgerError::InvalidAccountId(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_ids_are_unique_and_increasing_within_a_tick() {
        let a = next_transfer_id();
        let b = next_transfer_id();
        assert_ne!(a, b);
        // Low 64 bits carry the sequence; same-millisecond ids still differ.
        assert!(b > a);
    }

    #[test]
    fn account_id_round_trip() {
        let id: u128 = (7u128 << 64) | 42;
        assert_eq!(parse_account_id(&id.to_string()).unwrap(), id);
        assert!(parse_account_id("not-a-number").is_err());
        assert!(parse_account_id("").is_err());
    }
}
