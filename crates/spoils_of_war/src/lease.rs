// Lease-based single-writer coordination per spoils ledger.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use spoils_of_war_proto::blake3_hex;

use crate::SpoilsError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseState {
    pub holder_id: String,
    pub lease_id: String,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseDecision {
    pub granted: bool,
    pub lease: Option<LeaseState>,
    pub reason: Option<String>,
}

impl LeaseDecision {
    fn denied(lease: Option<LeaseState>, reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            lease,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaseManager {
    lease: Option<LeaseState>,
    next_term: u64,
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self {
            lease: None,
            next_term: 1,
        }
    }
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&LeaseState> {
        self.lease.as_ref()
    }

    pub fn is_active(&self, now_ms: i64) -> bool {
        self.lease
            .as_ref()
            .map(|lease| lease.expires_at_ms > now_ms)
            .unwrap_or(false)
    }

    pub fn try_acquire(&mut self, holder_id: &str, now_ms: i64, ttl_ms: i64) -> LeaseDecision {
        if ttl_ms <= 0 {
            return LeaseDecision::denied(self.lease.clone(), "ttl must be positive");
        }
        if self.is_active(now_ms) {
            return LeaseDecision::denied(self.lease.clone(), "lease already held");
        }

        let term = self.next_term;
        let next_term = match checked_lease_term_increment(term) {
            Ok(next_term) => next_term,
            Err(reason) => return LeaseDecision::denied(self.lease.clone(), reason),
        };
        let expires_at_ms = match checked_lease_expiry(now_ms, ttl_ms) {
            Ok(expires_at_ms) => expires_at_ms,
            Err(reason) => return LeaseDecision::denied(self.lease.clone(), reason),
        };
        let lease = LeaseState {
            holder_id: holder_id.to_string(),
            lease_id: lease_id_for(holder_id, now_ms, term),
            acquired_at_ms: now_ms,
            expires_at_ms,
            term,
        };
        self.next_term = next_term;
        self.lease = Some(lease.clone());

        LeaseDecision {
            granted: true,
            lease: Some(lease),
            reason: None,
        }
    }

    /// Pushes the expiry of a live lease to `now_ms + ttl_ms`. An expired
    /// lease is not revived since another holder may already have seen it free.
    pub fn renew(&mut self, lease_id: &str, now_ms: i64, ttl_ms: i64) -> LeaseDecision {
        if ttl_ms <= 0 {
            return LeaseDecision::denied(self.lease.clone(), "ttl must be positive");
        }
        let Some(lease) = self.lease.as_mut() else {
            return LeaseDecision::denied(None, "lease not held");
        };
        if lease.lease_id != lease_id {
            return LeaseDecision::denied(Some(lease.clone()), "lease held by another caller");
        }
        if lease.expires_at_ms <= now_ms {
            return LeaseDecision::denied(Some(lease.clone()), "lease expired");
        }
        let expires_at_ms = match checked_lease_expiry(now_ms, ttl_ms) {
            Ok(expires_at_ms) => expires_at_ms,
            Err(reason) => return LeaseDecision::denied(Some(lease.clone()), reason),
        };
        lease.expires_at_ms = lease.expires_at_ms.max(expires_at_ms);
        LeaseDecision {
            granted: true,
            lease: Some(lease.clone()),
            reason: None,
        }
    }

    pub fn release(&mut self, lease_id: &str) -> bool {
        if let Some(lease) = &self.lease {
            if lease.lease_id == lease_id {
                self.lease = None;
                return true;
            }
        }
        false
    }
}

/// One independent lease per scope (here: per battle ledger).
#[derive(Debug, Clone, Default)]
pub struct ScopedLeaseManager {
    leases: HashMap<String, LeaseManager>,
}

impl ScopedLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, scope: &str) -> Option<&LeaseState> {
        self.leases.get(scope).and_then(LeaseManager::current)
    }

    pub fn try_acquire(
        &mut self,
        scope: &str,
        holder_id: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> LeaseDecision {
        if scope.trim().is_empty() {
            return LeaseDecision::denied(None, "scope cannot be empty");
        }
        self.leases
            .entry(scope.to_string())
            .or_default()
            .try_acquire(holder_id, now_ms, ttl_ms)
    }

    pub fn renew(
        &mut self,
        scope: &str,
        lease_id: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> LeaseDecision {
        match self.leases.get_mut(scope) {
            Some(manager) => manager.renew(lease_id, now_ms, ttl_ms),
            None => LeaseDecision::denied(None, "lease not held"),
        }
    }

    pub fn release(&mut self, scope: &str, lease_id: &str) -> bool {
        let Some(manager) = self.leases.get_mut(scope) else {
            return false;
        };
        let released = manager.release(lease_id);
        if released && manager.current().is_none() {
            self.leases.remove(scope);
        }
        released
    }

    pub fn scope_count(&self) -> usize {
        self.leases.len()
    }
}

/// Shared lease table handing out RAII guards for ledger mutations.
#[derive(Debug, Clone)]
pub struct LedgerLeases {
    inner: Arc<Mutex<ScopedLeaseManager>>,
    holder_id: String,
    ttl_ms: i64,
}

impl LedgerLeases {
    pub fn new(holder_id: impl Into<String>, ttl_ms: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScopedLeaseManager::new())),
            holder_id: holder_id.into(),
            ttl_ms,
        }
    }

    pub fn acquire(&self, battle_id: &str, now_ms: i64) -> Result<LedgerLeaseGuard, SpoilsError> {
        let mut leases = self
            .inner
            .lock()
            .map_err(|_| SpoilsError::Io("ledger lease table lock poisoned".into()))?;
        let decision = leases.try_acquire(battle_id, &self.holder_id, now_ms, self.ttl_ms);
        match decision.lease {
            Some(lease) if decision.granted => Ok(LedgerLeaseGuard {
                inner: Arc::clone(&self.inner),
                scope: battle_id.to_string(),
                lease_id: lease.lease_id,
                ttl_ms: self.ttl_ms,
                acquired_at_ms: now_ms,
                acquired: Instant::now(),
            }),
            _ => Err(SpoilsError::Busy {
                battle_id: battle_id.to_string(),
                reason: decision
                    .reason
                    .unwrap_or_else(|| "lease not granted".to_string()),
            }),
        }
    }

    pub fn held_count(&self) -> usize {
        self.inner
            .lock()
            .map(|leases| leases.scope_count())
            .unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct LedgerLeaseGuard {
    inner: Arc<Mutex<ScopedLeaseManager>>,
    scope: String,
    lease_id: String,
    ttl_ms: i64,
    acquired_at_ms: i64,
    acquired: Instant,
}

impl LedgerLeaseGuard {
    pub fn lease_id(&self) -> &str {
        self.lease_id.as_str()
    }

    /// Renews on the acquiring caller's clock advanced by the wall time spent
    /// holding the lease.
    pub fn renew(&self) -> Result<(), SpoilsError> {
        let held_ms = i64::try_from(self.acquired.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.renew_at(self.acquired_at_ms.saturating_add(held_ms))
    }

    /// Extends the lease to `now_ms + ttl`. Fails with `Busy` once the lease
    /// has expired or been taken over.
    pub fn renew_at(&self, now_ms: i64) -> Result<(), SpoilsError> {
        let mut leases = self
            .inner
            .lock()
            .map_err(|_| SpoilsError::Io("ledger lease table lock poisoned".into()))?;
        let decision = leases.renew(&self.scope, &self.lease_id, now_ms, self.ttl_ms);
        if decision.granted {
            return Ok(());
        }
        Err(SpoilsError::Busy {
            battle_id: self.scope.clone(),
            reason: format!(
                "ledger lease lost: {}",
                decision.reason.as_deref().unwrap_or("renew denied")
            ),
        })
    }
}

impl Drop for LedgerLeaseGuard {
    fn drop(&mut self) {
        let mut leases = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        leases.release(&self.scope, &self.lease_id);
    }
}

fn checked_lease_term_increment(value: u64) -> Result<u64, String> {
    value
        .checked_add(1)
        .ok_or_else(|| format!("lease term overflow at {value}"))
}

fn checked_lease_expiry(now_ms: i64, ttl_ms: i64) -> Result<i64, String> {
    now_ms
        .checked_add(ttl_ms)
        .ok_or_else(|| format!("lease expires_at overflow: now_ms={now_ms}, ttl_ms={ttl_ms}"))
}

fn lease_id_for(holder_id: &str, now_ms: i64, term: u64) -> String {
    let payload = format!("{holder_id}:{now_ms}:{term}");
    blake3_hex(payload.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_acquire_when_active() {
        let mut manager = LeaseManager::new();
        assert!(manager.try_acquire("worker-1", 100, 50).granted);
        let second = manager.try_acquire("worker-2", 120, 50);
        assert!(!second.granted);
        assert_eq!(second.reason.as_deref(), Some("lease already held"));
    }

    #[test]
    fn allow_acquire_after_expiry() {
        let mut manager = LeaseManager::new();
        assert!(manager.try_acquire("worker-1", 100, 10).granted);
        let second = manager.try_acquire("worker-2", 200, 10);
        assert!(second.granted);
        assert_eq!(second.lease.expect("lease").term, 2);
    }

    #[test]
    fn try_acquire_rejects_expiry_overflow_without_mutation() {
        let mut manager = LeaseManager::new();
        let decision = manager.try_acquire("worker-1", i64::MAX - 1, 10);
        assert!(!decision.granted);
        assert!(decision
            .reason
            .as_ref()
            .is_some_and(|reason| reason.contains("expires_at overflow")));
        assert!(manager.current().is_none());
    }

    #[test]
    fn scoped_manager_isolates_ledgers() {
        let mut scoped = ScopedLeaseManager::new();
        let first = scoped.try_acquire("battle-a", "worker-1", 100, 20);
        assert!(first.granted);
        assert!(scoped.try_acquire("battle-b", "worker-1", 100, 20).granted);
        assert!(!scoped.try_acquire("battle-a", "worker-2", 110, 20).granted);
        let lease_id = first.lease.expect("lease").lease_id;
        assert!(scoped.release("battle-a", &lease_id));
        assert!(scoped.current("battle-a").is_none());
        assert_eq!(scoped.scope_count(), 1);
    }

    #[test]
    fn guard_releases_on_drop() {
        let leases = LedgerLeases::new("ledger", 1_000);
        let guard = leases.acquire("battle-1", 10).expect("first");
        let err = leases.acquire("battle-1", 11).expect_err("busy");
        assert!(matches!(err, SpoilsError::Busy { .. }));
        drop(guard);
        assert_eq!(leases.held_count(), 0);
        leases.acquire("battle-1", 12).expect("reacquire");
    }

    #[test]
    fn renew_extends_live_lease_only() {
        let mut manager = LeaseManager::new();
        let lease_id = manager
            .try_acquire("worker-1", 100, 50)
            .lease
            .expect("lease")
            .lease_id;
        assert!(manager.renew(&lease_id, 140, 50).granted);
        assert_eq!(manager.current().expect("lease").expires_at_ms, 190);
        assert!(!manager.try_acquire("worker-2", 170, 50).granted);

        let expired = manager.renew(&lease_id, 190, 50);
        assert!(!expired.granted);
        assert_eq!(expired.reason.as_deref(), Some("lease expired"));
        assert!(!manager.renew("other-lease", 150, 50).granted);
    }

    #[test]
    fn renewed_guard_keeps_ledger_past_original_ttl() {
        let leases = LedgerLeases::new("ledger", 100);
        let guard = leases.acquire("battle-1", 1_000).expect("acquire");
        guard.renew_at(1_080).expect("renew");
        let err = leases.acquire("battle-1", 1_150).expect_err("still held");
        assert!(matches!(err, SpoilsError::Busy { .. }));
    }

    #[test]
    fn guard_that_lost_its_lease_cannot_renew() {
        let leases = LedgerLeases::new("ledger", 100);
        let stale = leases.acquire("battle-1", 1_000).expect("acquire");
        let takeover = leases.acquire("battle-1", 1_200).expect("expired lease taken over");
        let err = stale.renew_at(1_210).expect_err("lost");
        match err {
            SpoilsError::Busy { reason, .. } => assert!(reason.contains("lease lost")),
            other => panic!("unexpected error: {other:?}"),
        }
        takeover.renew_at(1_250).expect("new holder renews");
        drop(stale);
        assert_eq!(leases.held_count(), 1);
    }
}
