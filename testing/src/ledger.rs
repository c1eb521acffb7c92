//! A ledger whose answers are programmed by the test.
//!
//! `ScriptedLedger` keeps a receipt book keyed by idempotency key, like a real
//! ledger: a key that was executed once is never executed again, and
//! `query_receipt` reports what happened to it. Each call consumes the next
//! scripted [`Behavior`] for its operation, or accepts when the script is empty.

use impact_core::ledger::{
    IdempotencyKey, LedgerClient, LedgerError, LedgerFuture, MintReceipt, MintRequest,
    ReceiptId, ReceiptStatus, TransferReceipt, TransferRequest,
};
use impact_core::types::EventId;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// What the ledger does with the next call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// Execute and answer.
    Accept,
    /// Refuse deterministically.
    Reject(String),
    /// Execute, then lose the answer (the caller sees a timeout).
    AcceptThenTimeout,
    /// Never receive the request (the caller sees a timeout).
    Timeout,
    /// Execute, but only answer after the given delay.
    Hang(Duration),
}

#[derive(Clone, Debug)]
enum Entry {
    Minted { receipt_id: ReceiptId, serial: u64 },
    Transferred { receipt_id: ReceiptId },
    Refused { reason: String },
}

#[derive(Debug, Default)]
struct Book {
    entries: HashMap<IdempotencyKey, Entry>,
    serials: HashMap<EventId, u64>,
    mint_script: VecDeque<Behavior>,
    transfer_script: VecDeque<Behavior>,
    query_timeouts: usize,
    receipts_issued: u64,
    executed_transfers: Vec<TransferRequest>,
}

impl Book {
    fn next_receipt(&mut self, prefix: &str) -> ReceiptId {
        self.receipts_issued += 1;
        ReceiptId::new(format!("{prefix}-{:06}", self.receipts_issued))
    }

    fn mint(&mut self, request: &MintRequest) -> Entry {
        if let Some(entry) = self.entries.get(&request.key) {
            return entry.clone();
        }
        let serial = self.serials.entry(request.event_id).or_insert(0);
        *serial += 1;
        let serial = *serial;
        let entry = Entry::Minted {
            receipt_id: self.next_receipt("mint"),
            serial,
        };
        self.entries.insert(request.key.clone(), entry.clone());
        entry
    }

    fn transfer(&mut self, request: &TransferRequest) -> Entry {
        if let Some(entry) = self.entries.get(&request.key) {
            return entry.clone();
        }
        let entry = Entry::Transferred {
            receipt_id: self.next_receipt("transfer"),
        };
        self.executed_transfers.push(request.clone());
        self.entries.insert(request.key.clone(), entry.clone());
        entry
    }

    fn refuse(&mut self, key: &IdempotencyKey, reason: String) -> Entry {
        self.entries
            .entry(key.clone())
            .or_insert(Entry::Refused { reason })
            .clone()
    }
}

/// Programmable fake [`LedgerClient`].
///
/// Clones share the same book, so a test keeps one handle for scripting and
/// assertions while the services hold another.
#[derive(Clone, Debug, Default)]
pub struct ScriptedLedger {
    book: Arc<Mutex<Book>>,
    mint_calls: Arc<AtomicUsize>,
    transfer_calls: Arc<AtomicUsize>,
    query_calls: Arc<AtomicUsize>,
}

impl ScriptedLedger {
    /// A ledger that accepts everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the behavior of the next mint call
    pub fn script_mint(&self, behavior: Behavior) {
        self.book().mint_script.push_back(behavior);
    }

    /// Queue the behavior of the next transfer call
    pub fn script_transfer(&self, behavior: Behavior) {
        self.book().transfer_script.push_back(behavior);
    }

    /// Make the next `count` receipt queries time out
    pub fn fail_queries(&self, count: usize) {
        self.book().query_timeouts += count;
    }

    /// Record a refusal for `key` as if an earlier call had been rejected.
    pub fn record_rejection(&self, key: &IdempotencyKey, reason: impl Into<String>) {
        self.book().refuse(key, reason.into());
    }

    /// Number of mint calls received (including replays and timeouts)
    #[must_use]
    pub fn mint_calls(&self) -> usize {
        self.mint_calls.load(Ordering::SeqCst)
    }

    /// Number of transfer calls received
    #[must_use]
    pub fn transfer_calls(&self) -> usize {
        self.transfer_calls.load(Ordering::SeqCst)
    }

    /// Number of receipt queries received
    #[must_use]
    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    /// Issuance records actually minted for an event
    #[must_use]
    pub fn minted(&self, event_id: EventId) -> u64 {
        self.book().serials.get(&event_id).copied().unwrap_or(0)
    }

    /// Transfers actually executed, in order
    #[must_use]
    pub fn executed_transfers(&self) -> Vec<TransferRequest> {
        self.book().executed_transfers.clone()
    }
}

fn mint_answer(entry: Entry) -> Result<MintReceipt, LedgerError> {
    match entry {
        Entry::Minted { receipt_id, serial } => Ok(MintReceipt { receipt_id, serial }),
        Entry::Refused { reason } => Err(LedgerError::Rejected { reason }),
        Entry::Transferred { .. } => Err(LedgerError::Rejected {
            reason: "idempotency key already used for a transfer".to_string(),
        }),
    }
}

fn transfer_answer(entry: Entry) -> Result<TransferReceipt, LedgerError> {
    match entry {
        Entry::Transferred { receipt_id } => Ok(TransferReceipt { receipt_id }),
        Entry::Refused { reason } => Err(LedgerError::Rejected { reason }),
        Entry::Minted { .. } => Err(LedgerError::Rejected {
            reason: "idempotency key already used for a mint".to_string(),
        }),
    }
}

impl LedgerClient for ScriptedLedger {
    fn mint(&self, request: MintRequest) -> LedgerFuture<'_, MintReceipt> {
        Box::pin(async move {
            self.mint_calls.fetch_add(1, Ordering::SeqCst);
            let behavior = self.book().mint_script.pop_front().unwrap_or(Behavior::Accept);
            tracing::trace!(key = %request.key, ?behavior, "scripted mint");

            match behavior {
                Behavior::Accept => mint_answer(self.book().mint(&request)),
                Behavior::Reject(reason) => mint_answer(self.book().refuse(&request.key, reason)),
                Behavior::AcceptThenTimeout => {
                    self.book().mint(&request);
                    Err(LedgerError::Timeout)
                }
                Behavior::Timeout => Err(LedgerError::Timeout),
                Behavior::Hang(delay) => {
                    tokio::time::sleep(delay).await;
                    mint_answer(self.book().mint(&request))
                }
            }
        })
    }

    fn transfer(&self, request: TransferRequest) -> LedgerFuture<'_, TransferReceipt> {
        Box::pin(async move {
            self.transfer_calls.fetch_add(1, Ordering::SeqCst);
            let behavior = self
                .book()
                .transfer_script
                .pop_front()
                .unwrap_or(Behavior::Accept);
            tracing::trace!(key = %request.key, ?behavior, "scripted transfer");

            match behavior {
                Behavior::Accept => transfer_answer(self.book().transfer(&request)),
                Behavior::Reject(reason) => {
                    transfer_answer(self.book().refuse(&request.key, reason))
                }
                Behavior::AcceptThenTimeout => {
                    self.book().transfer(&request);
                    Err(LedgerError::Timeout)
                }
                Behavior::Timeout => Err(LedgerError::Timeout),
                Behavior::Hang(delay) => {
                    tokio::time::sleep(delay).await;
                    transfer_answer(self.book().transfer(&request))
                }
            }
        })
    }

    fn query_receipt(&self, key: &IdempotencyKey) -> LedgerFuture<'_, ReceiptStatus> {
        let key = key.clone();
        Box::pin(async move {
            self.query_calls.fetch_add(1, Ordering::SeqCst);
            let mut book = self.book();
            if book.query_timeouts > 0 {
                book.query_timeouts -= 1;
                return Err(LedgerError::Timeout);
            }
            Ok(match book.entries.get(&key) {
                Some(Entry::Minted { receipt_id, serial }) => ReceiptStatus::Confirmed {
                    receipt_id: receipt_id.clone(),
                    serial: Some(*serial),
                },
                Some(Entry::Transferred { receipt_id }) => ReceiptStatus::Confirmed {
                    receipt_id: receipt_id.clone(),
                    serial: None,
                },
                Some(Entry::Refused { reason }) => ReceiptStatus::Rejected {
                    reason: reason.clone(),
                },
                None => ReceiptStatus::Unknown,
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use crate::mocks::epoch;
    use impact_core::ledger::MintMetadata;
    use impact_core::types::{LedgerAccount, Money, RequestId, SourceRef, TicketKind};

    fn mint_request(event_id: EventId, request: &str) -> MintRequest {
        let account = LedgerAccount::parse("0.0.42").unwrap();
        MintRequest {
            key: IdempotencyKey::for_mint(event_id, &RequestId::parse(request).unwrap()),
            event_id,
            recipient: account.clone(),
            metadata: MintMetadata {
                event_id,
                buyer_account: account,
                kind: TicketKind::Standard,
                purchased_at: epoch(),
            },
        }
    }

    #[tokio::test]
    async fn replayed_mints_return_the_first_receipt() {
        let ledger = ScriptedLedger::new();
        let event_id = EventId::new();

        let first = ledger.mint(mint_request(event_id, "a")).await.unwrap();
        let second = ledger.mint(mint_request(event_id, "a")).await.unwrap();
        let other = ledger.mint(mint_request(event_id, "b")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(other.serial, 2);
        assert_eq!(ledger.minted(event_id), 2);
        assert_eq!(ledger.mint_calls(), 3);
    }

    #[tokio::test]
    async fn lost_answers_are_visible_to_queries() {
        let ledger = ScriptedLedger::new();
        let event_id = EventId::new();
        let request = mint_request(event_id, "a");
        let key = request.key.clone();

        ledger.script_mint(Behavior::AcceptThenTimeout);
        assert_eq!(ledger.mint(request).await, Err(LedgerError::Timeout));

        ledger.fail_queries(1);
        assert_eq!(ledger.query_receipt(&key).await, Err(LedgerError::Timeout));
        assert!(matches!(
            ledger.query_receipt(&key).await.unwrap(),
            ReceiptStatus::Confirmed { serial: Some(1), .. }
        ));
    }

    #[tokio::test]
    async fn timeouts_before_delivery_leave_no_trace() {
        let ledger = ScriptedLedger::new();
        let transfer = TransferRequest {
            key: IdempotencyKey::for_donation(&SourceRef::parse("ref1").unwrap()),
            from: LedgerAccount::parse("0.0.1").unwrap(),
            to: LedgerAccount::parse("0.0.2").unwrap(),
            amount: Money::from_minor(100),
        };
        ledger.script_transfer(Behavior::Timeout);
        assert!(ledger.transfer(transfer.clone()).await.is_err());
        assert_eq!(
            ledger.query_receipt(&transfer.key).await.unwrap(),
            ReceiptStatus::Unknown
        );
        assert!(ledger.executed_transfers().is_empty());
    }
}
