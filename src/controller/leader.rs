//! # Leader Election
//!
//! Lease-based leader election gating the reconcile loop when several
//! replicas run at once. Only the lease holder reconciles; without this
//! gate, concurrent replicas would race each other's optimistic-concurrency
//! writes.
//!
//! The lock is a `coordination.k8s.io/v1` Lease with a fixed name. Each
//! replica carries a unique identity (hostname plus a random suffix).
//! Acquisition and takeover go through create/replace calls that carry the
//! lease's `resourceVersion`, so two replicas racing for the same lock
//! resolve to exactly one winner; the loser observes a conflict and retries
//! after the retry period.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{LEASE_DURATION_SECS, RENEW_DEADLINE_SECS, RETRY_PERIOD_SECS};
use crate::observability::metrics;

/// Admits only one active replica's run loop across a fleet.
#[derive(Clone)]
pub struct LeaderElector {
    api: Api<Lease>,
    lock_name: String,
    identity: String,
    lease_duration_seconds: i32,
    renew_deadline: Duration,
    retry_period: Duration,
}

impl fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderElector")
            .field("lock_name", &self.lock_name)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    #[must_use]
    pub fn new(client: Client, namespace: &str, lock_name: &str) -> Self {
        let hostname = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "pod-timestamp-controller".to_string());
        Self {
            api: Api::namespaced(client, namespace),
            lock_name: lock_name.to_string(),
            identity: format!("{hostname}_{}", uuid::Uuid::new_v4()),
            lease_duration_seconds: LEASE_DURATION_SECS,
            renew_deadline: Duration::from_secs(RENEW_DEADLINE_SECS),
            retry_period: Duration::from_secs(RETRY_PERIOD_SECS),
        }
    }

    /// Acquire the lock, then invoke `run` with a child token that is
    /// cancelled when leadership is lost. Returns once `run` completes or
    /// `shutdown` fires before acquisition.
    pub async fn run<F, Fut>(&self, shutdown: CancellationToken, run: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        info!(lock = %self.lock_name, identity = %self.identity, "attempting to acquire leader lease");
        if !self.acquire(&shutdown).await {
            return Ok(());
        }
        info!(lock = %self.lock_name, identity = %self.identity, "acquired leadership");
        metrics::set_leader(true);

        let lease_token = shutdown.child_token();
        let renewer = tokio::spawn(renew_loop(self.clone(), lease_token.clone()));

        run(lease_token).await;

        renewer.abort();
        metrics::set_leader(false);
        self.release().await;
        Ok(())
    }

    /// Loop until the lock is acquired or `shutdown` fires. Returns whether
    /// the lock was acquired.
    async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        loop {
            if shutdown.is_cancelled() {
                return false;
            }
            match self.try_acquire().await {
                Ok(true) => return true,
                Ok(false) => debug!(lock = %self.lock_name, "lease held by another replica"),
                Err(err) => warn!(error = %err, "lease acquisition attempt failed"),
            }
            tokio::select! {
                () = shutdown.cancelled() => return false,
                () = tokio::time::sleep(self.retry_period) => {}
            }
        }
    }

    /// One acquisition attempt. `Ok(false)` means the lock is validly held
    /// elsewhere or another replica won a race; both retry.
    async fn try_acquire(&self) -> Result<bool, kube::Error> {
        let now = Utc::now();
        match self.api.get_opt(&self.lock_name).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lock_name.clone()),
                        ..ObjectMeta::default()
                    },
                    spec: Some(self.owned_spec(now, 0)),
                };
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                    Err(err) => Err(err),
                }
            }
            Some(current) => {
                let holder = current
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.holder_identity.as_deref());
                if holder == Some(self.identity.as_str()) {
                    // Still ours from a previous attempt; refresh it.
                    self.replace_as_owner(current, now).await
                } else if lease_expired(current.spec.as_ref(), now) {
                    info!(lock = %self.lock_name, previous = ?holder, "taking over expired lease");
                    self.replace_as_owner(current, now).await
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Replace `current` with a spec naming us as holder, using its
    /// `resourceVersion` so a racing replica surfaces as a conflict.
    async fn replace_as_owner(&self, current: Lease, now: DateTime<Utc>) -> Result<bool, kube::Error> {
        let transitions = current
            .spec
            .as_ref()
            .and_then(|spec| spec.lease_transitions)
            .unwrap_or(0);
        let was_ours = current
            .spec
            .as_ref()
            .and_then(|spec| spec.holder_identity.as_deref())
            == Some(self.identity.as_str());
        let mut lease = current;
        lease.spec = Some(self.owned_spec(now, if was_ours { transitions } else { transitions + 1 }));
        match self.api.replace(&self.lock_name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Renew our hold on the lease. `Ok(false)` means the lease is no
    /// longer ours; the caller must stand down.
    async fn try_renew(&self) -> Result<bool, kube::Error> {
        let now = Utc::now();
        match self.api.get_opt(&self.lock_name).await? {
            None => Ok(false),
            Some(current) => {
                let ours = current
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.holder_identity.as_deref())
                    == Some(self.identity.as_str());
                if ours {
                    self.replace_as_owner(current, now).await
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Best-effort release on clean exit so a standby replica can take over
    /// without waiting out the lease duration.
    async fn release(&self) {
        match self.api.get_opt(&self.lock_name).await {
            Ok(Some(mut lease)) => {
                let ours = lease
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.holder_identity.as_deref())
                    == Some(self.identity.as_str());
                if !ours {
                    return;
                }
                if let Some(spec) = lease.spec.as_mut() {
                    spec.holder_identity = None;
                    spec.renew_time = None;
                }
                if let Err(err) = self
                    .api
                    .replace(&self.lock_name, &PostParams::default(), &lease)
                    .await
                {
                    debug!(error = %err, "failed to release leader lease");
                }
            }
            Ok(None) => {}
            Err(err) => debug!(error = %err, "failed to read leader lease during release"),
        }
    }

    fn owned_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration_seconds),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..LeaseSpec::default()
        }
    }
}

/// A lease with no holder, no timestamps, or a last renewal older than its
/// duration is up for grabs.
fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    if spec.holder_identity.as_deref().is_none_or(str::is_empty) {
        return true;
    }
    let Some(duration) = spec.lease_duration_seconds else {
        return true;
    };
    let last = spec
        .renew_time
        .as_ref()
        .or(spec.acquire_time.as_ref())
        .map(|t| t.0);
    match last {
        Some(last) => last + chrono::Duration::seconds(i64::from(duration)) < now,
        None => true,
    }
}

/// Keep the lease fresh; cancel `lease_token` the moment leadership is lost
/// so the wrapped run loop stops.
async fn renew_loop(elector: LeaderElector, lease_token: CancellationToken) {
    let mut last_renewal = tokio::time::Instant::now();
    loop {
        tokio::select! {
            () = lease_token.cancelled() => return,
            () = tokio::time::sleep(elector.retry_period) => {}
        }
        match elector.try_renew().await {
            Ok(true) => last_renewal = tokio::time::Instant::now(),
            Ok(false) => {
                error!(lock = %elector.lock_name, "leader lease lost to another replica");
                break;
            }
            Err(err) => {
                warn!(error = %err, "leader lease renewal failed");
                if last_renewal.elapsed() >= elector.renew_deadline {
                    error!(lock = %elector.lock_name, "renew deadline exceeded, giving up leadership");
                    break;
                }
            }
        }
    }
    metrics::set_leader(false);
    lease_token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(holder: Option<&str>, duration: Option<i32>, renewed_secs_ago: Option<i64>) -> LeaseSpec {
        let now = Utc::now();
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            lease_duration_seconds: duration,
            renew_time: renewed_secs_ago.map(|ago| MicroTime(now - chrono::Duration::seconds(ago))),
            ..LeaseSpec::default()
        }
    }

    #[test]
    fn test_missing_spec_is_expired() {
        assert!(lease_expired(None, Utc::now()));
    }

    #[test]
    fn test_unheld_lease_is_expired() {
        let spec = spec(None, Some(15), Some(1));
        assert!(lease_expired(Some(&spec), Utc::now()));

        let spec = self::spec(Some(""), Some(15), Some(1));
        assert!(lease_expired(Some(&spec), Utc::now()));
    }

    #[test]
    fn test_recently_renewed_lease_is_held() {
        let spec = spec(Some("other"), Some(15), Some(1));
        assert!(!lease_expired(Some(&spec), Utc::now()));
    }

    #[test]
    fn test_stale_lease_is_expired() {
        let spec = spec(Some("other"), Some(15), Some(60));
        assert!(lease_expired(Some(&spec), Utc::now()));
    }

    #[test]
    fn test_lease_without_timestamps_is_expired() {
        let spec = spec(Some("other"), Some(15), None);
        assert!(lease_expired(Some(&spec), Utc::now()));
    }

    #[test]
    fn test_acquire_time_counts_when_never_renewed() {
        let mut spec = spec(Some("other"), Some(15), None);
        spec.acquire_time = Some(MicroTime(Utc::now()));
        assert!(!lease_expired(Some(&spec), Utc::now()));
    }
}
