//! # Pod Reconciler
//!
//! Core reconciliation logic: drains the work queue with a fixed pool of
//! workers and brings each Pod toward the desired annotation state.
//!
//! The reconcile function is idempotent. It reads the cached Pod, skips Pods
//! that are already stamped (or not gated when gating is enabled), and
//! otherwise writes the timestamp annotation back through the apiserver
//! carrying the cached `resourceVersion` so concurrent modifications surface
//! as conflicts rather than lost updates.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, PostParams};
use kube::Client;
use kube_runtime::reflector::{ObjectRef, Store};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{GATE_ANNOTATION, TIMESTAMP_ANNOTATION};
use crate::controller::queue::RateLimitingQueue;
use crate::observability::metrics;

/// Identifies a target Pod within the watched scope.
///
/// Serialized as `namespace/name`, the form the work queue carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for a Pod event payload. `None` if the payload carries no
    /// namespace or name (nothing downstream could do with it).
    #[must_use]
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let name = pod.metadata.name.as_deref()?;
        let namespace = pod.metadata.namespace.as_deref()?;
        Some(Self::new(namespace, name))
    }

    #[must_use]
    pub fn object_ref(&self) -> ObjectRef<Pod> {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("malformed object key {0:?}: expected namespace/name")]
    Malformed(String),
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("pod update failed: {0}")]
    Update(#[from] kube::Error),
}

/// Remote write seam for the reconciler.
///
/// The apiserver rejects the update with a conflict when the carried
/// `resourceVersion` is stale; callers surface that error unchanged so the
/// worker loop can requeue.
#[async_trait]
pub trait PodUpdater: Send + Sync {
    async fn update_pod(&self, namespace: &str, name: &str, pod: &Pod) -> Result<Pod, kube::Error>;
}

/// [`PodUpdater`] backed by a [`kube::Client`].
#[derive(Clone)]
pub struct ApiPodUpdater {
    client: Client,
}

impl ApiPodUpdater {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl fmt::Debug for ApiPodUpdater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiPodUpdater").finish_non_exhaustive()
    }
}

#[async_trait]
impl PodUpdater for ApiPodUpdater {
    async fn update_pod(&self, namespace: &str, name: &str, pod: &Pod) -> Result<Pod, kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), pod).await
    }
}

/// Reconciles Pods from the work queue with a fixed worker pool.
///
/// Listens on Pod add and update events (fed into the queue by
/// [`crate::controller::watch`]) and adds the capture timestamp, as an
/// annotation, to Pods that don't already carry it. If
/// `require_gate_annotation` is set, only Pods annotated with
/// `add-timestamp` are stamped.
pub struct PodReconciler {
    cache: Store<Pod>,
    pods: Arc<dyn PodUpdater>,
    queue: Arc<RateLimitingQueue<String>>,
    require_gate_annotation: bool,
}

impl fmt::Debug for PodReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PodReconciler")
            .field("require_gate_annotation", &self.require_gate_annotation)
            .finish_non_exhaustive()
    }
}

impl PodReconciler {
    #[must_use]
    pub fn new(
        cache: Store<Pod>,
        pods: Arc<dyn PodUpdater>,
        queue: Arc<RateLimitingQueue<String>>,
        require_gate_annotation: bool,
    ) -> Self {
        Self {
            cache,
            pods,
            queue,
            require_gate_annotation,
        }
    }

    /// Run `workers` concurrent reconcile workers until `shutdown` fires,
    /// then shut the queue down and wait for every worker to exit.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken, workers: usize) {
        info!(workers, "starting Pod reconcile workers");
        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            let reconciler = Arc::clone(&self);
            tasks.spawn(async move { reconciler.worker_loop().await });
        }

        shutdown.cancelled().await;
        self.queue.shut_down();
        while tasks.join_next().await.is_some() {}
        info!("all reconcile workers stopped");
    }

    /// Dequeue keys and reconcile them until the queue shuts down.
    ///
    /// Reconcile errors never escape this loop; they only feed the queue's
    /// backoff bookkeeping.
    async fn worker_loop(&self) {
        while let Some(raw) = self.queue.get().await {
            metrics::increment_reconciliations();
            let start = Instant::now();
            let result = match raw.parse::<ObjectKey>() {
                Ok(key) => self.reconcile(&key).await,
                Err(err) => {
                    // A malformed key cannot succeed on retry; drop it.
                    warn!(key = %raw, error = %err, "dropping malformed work queue key");
                    Ok(())
                }
            };
            self.queue.done(&raw);
            metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
            match result {
                Ok(()) => self.queue.forget(&raw),
                Err(err) => {
                    metrics::increment_reconciliation_errors();
                    warn!(key = %raw, error = %err, "reconcile failed, requeueing");
                    self.queue.add_rate_limited(raw);
                }
            }
        }
    }

    /// Bring one Pod toward the desired annotation state.
    ///
    /// A Pod missing from the cache counts as success: it was deleted
    /// between enqueue and processing and there is nothing left to do.
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        debug!(%key, "reconciling Pod");
        let Some(pod) = self.cache.get(&key.object_ref()) else {
            debug!(%key, "Pod no longer in cache, nothing to do");
            return Ok(());
        };

        let mut annotations = pod.metadata.annotations.clone().unwrap_or_default();
        if self.require_gate_annotation && !annotations.contains_key(GATE_ANNOTATION) {
            debug!(%key, "gate annotation absent, ignoring Pod");
            return Ok(());
        }
        if annotations.contains_key(TIMESTAMP_ANNOTATION) {
            debug!(%key, "Pod already stamped");
            return Ok(());
        }

        let stamp = Utc::now().to_rfc3339();
        annotations.insert(TIMESTAMP_ANNOTATION.to_string(), stamp.clone());
        let mut updated = Pod::clone(&pod);
        updated.metadata.annotations = Some(annotations);

        // The cached resourceVersion rides along; a concurrent writer turns
        // this into a conflict instead of a lost update.
        self.pods
            .update_pod(&key.namespace, &key.name, &updated)
            .await?;
        metrics::increment_annotations_written();
        info!(%key, %stamp, "added timestamp annotation to Pod");
        Ok(())
    }
}
