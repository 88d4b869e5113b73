//! Transaction-issuing collaborator seam.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use rust_decimal::Decimal;
use spoils_of_war_proto::{CollaboratorError, TransactionId, TransferRequest};

/// Moves currency between accounts. Implementations must treat
/// `idempotency_key` as the dedupe key: repeating a request returns the
/// original transaction id without moving funds twice.
pub trait TransactionIssuer: Send + Sync {
    fn transfer(&self, request: &TransferRequest) -> Result<TransactionId, CollaboratorError>;
}

/// Enforces a hard deadline on every transfer of the wrapped issuer.
#[derive(Clone)]
pub struct BoundedTransactionIssuer {
    inner: Arc<dyn TransactionIssuer>,
    timeout: Duration,
}

impl BoundedTransactionIssuer {
    pub fn new(inner: Arc<dyn TransactionIssuer>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl TransactionIssuer for BoundedTransactionIssuer {
    fn transfer(&self, request: &TransferRequest) -> Result<TransactionId, CollaboratorError> {
        let (result_tx, result_rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let request = request.clone();
        thread::Builder::new()
            .name("spoils-transfer".to_string())
            .spawn(move || {
                let _ = result_tx.send(inner.transfer(&request));
            })
            .map_err(|err| CollaboratorError::Unavailable {
                reason: format!("spawn transfer worker failed: {err}"),
            })?;

        match result_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(CollaboratorError::Timeout {
                operation: "transfer".to_string(),
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(CollaboratorError::Unavailable {
                reason: "transfer worker exited without a result".to_string(),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct InMemoryIssuerState {
    next_id: u64,
    calls: u64,
    executed: Vec<(TransactionId, TransferRequest)>,
    by_key: BTreeMap<String, usize>,
    balances: BTreeMap<String, Decimal>,
    queued_failures: VecDeque<CollaboratorError>,
    key_failures: BTreeMap<String, CollaboratorError>,
    delay: Option<Duration>,
}

/// Wallet double that keeps balances in memory, dedupes on idempotency key and
/// can be scripted to fail.
#[derive(Debug, Default)]
pub struct InMemoryTransactionIssuer {
    state: Mutex<InMemoryIssuerState>,
}

impl InMemoryTransactionIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next call (whatever its key) with `error`.
    pub fn fail_next(&self, error: CollaboratorError) {
        self.lock().queued_failures.push_back(error);
    }

    /// Fails the first call carrying `idempotency_key` with `error`.
    pub fn fail_once_on_key(&self, idempotency_key: &str, error: CollaboratorError) {
        self.lock()
            .key_failures
            .insert(idempotency_key.to_string(), error);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    pub fn balance(&self, account: &str) -> Decimal {
        self.lock()
            .balances
            .get(account)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn executed(&self) -> Vec<(TransactionId, TransferRequest)> {
        self.lock().executed.clone()
    }

    pub fn call_count(&self) -> u64 {
        self.lock().calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryIssuerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TransactionIssuer for InMemoryTransactionIssuer {
    fn transfer(&self, request: &TransferRequest) -> Result<TransactionId, CollaboratorError> {
        let delay = {
            let mut state = self.lock();
            state.calls += 1;
            state.delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut state = self.lock();
        if let Some(error) = state.queued_failures.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.key_failures.remove(&request.idempotency_key) {
            return Err(error);
        }
        if request.amount <= Decimal::ZERO {
            return Err(CollaboratorError::Rejected {
                reason: format!("transfer amount {} must be positive", request.amount),
            });
        }
        if let Some(index) = state.by_key.get(&request.idempotency_key).copied() {
            let (transaction_id, original) = &state.executed[index];
            if original.amount != request.amount || original.to_account != request.to_account {
                return Err(CollaboratorError::Rejected {
                    reason: format!(
                        "idempotency key {} reused with a different payload",
                        request.idempotency_key
                    ),
                });
            }
            return Ok(transaction_id.clone());
        }

        state.next_id += 1;
        let transaction_id = format!("tx-{:06}", state.next_id);
        let from = state
            .balances
            .entry(request.from_account.clone())
            .or_insert(Decimal::ZERO);
        *from -= request.amount;
        *state
            .balances
            .entry(request.to_account.clone())
            .or_insert(Decimal::ZERO) += request.amount;
        state
            .executed
            .push((transaction_id.clone(), request.clone()));
        let index = state.executed.len() - 1;
        state.by_key.insert(request.idempotency_key.clone(), index);
        Ok(transaction_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: &str, amount: i64) -> TransferRequest {
        TransferRequest {
            idempotency_key: key.to_string(),
            from_account: "pool".to_string(),
            to_account: "player-a".to_string(),
            amount: Decimal::new(amount, 2),
            reference: "ref".to_string(),
            group: "spoil of war".to_string(),
            subgroup: "Spoils of War from Battle #1".to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn repeated_key_returns_original_transaction() {
        let issuer = InMemoryTransactionIssuer::new();
        let first = issuer.transfer(&request("k-1", 150)).expect("first");
        let again = issuer.transfer(&request("k-1", 150)).expect("again");
        assert_eq!(first, again);
        assert_eq!(issuer.balance("player-a"), Decimal::new(150, 2));
        assert_eq!(issuer.balance("pool"), Decimal::new(-150, 2));
        assert_eq!(issuer.executed().len(), 1);
    }

    #[test]
    fn reused_key_with_other_amount_is_rejected() {
        let issuer = InMemoryTransactionIssuer::new();
        issuer.transfer(&request("k-1", 150)).expect("first");
        let err = issuer.transfer(&request("k-1", 151)).expect_err("mismatch");
        assert!(!err.is_transient());
    }

    #[test]
    fn scripted_failure_fires_once() {
        let issuer = InMemoryTransactionIssuer::new();
        issuer.fail_once_on_key(
            "k-1",
            CollaboratorError::Unavailable {
                reason: "503".to_string(),
            },
        );
        assert!(issuer.transfer(&request("k-1", 100)).is_err());
        assert!(issuer.transfer(&request("k-1", 100)).is_ok());
        assert_eq!(issuer.call_count(), 2);
    }

    #[test]
    fn bounded_issuer_times_out_slow_transfers() {
        let slow = Arc::new(InMemoryTransactionIssuer::new());
        slow.set_delay(Some(Duration::from_millis(200)));
        let bounded = BoundedTransactionIssuer::new(slow, Duration::from_millis(20));
        let err = bounded.transfer(&request("k-1", 100)).expect_err("timeout");
        assert!(matches!(err, CollaboratorError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn bounded_issuer_passes_through_fast_transfers() {
        let fast = Arc::new(InMemoryTransactionIssuer::new());
        let bounded = BoundedTransactionIssuer::new(fast.clone(), Duration::from_secs(2));
        let transaction_id = bounded.transfer(&request("k-1", 100)).expect("transfer");
        assert_eq!(transaction_id, "tx-000001");
        assert_eq!(fast.balance("player-a"), Decimal::ONE);
    }
}
