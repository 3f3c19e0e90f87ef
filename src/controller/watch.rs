//! # Pod Watch Cache
//!
//! Local mirror of the watched Pod collection, kept current via list+watch,
//! plus the event enqueuer feeding the work queue.
//!
//! A reflector maintains the point-lookup store; a single pump task drives
//! the watch stream so notifications are delivered in order on one path.
//! Every add and update notification enqueues the Pod's key unconditionally;
//! the queue's dedup absorbs the redundancy. Deletions are not enqueued, the
//! controller performs no work on removed Pods.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{Stream, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use kube_runtime::reflector::{self, Store};
use kube_runtime::{watcher, WatchStreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::CACHE_SYNC_TIMEOUT_SECS;
use crate::controller::queue::RateLimitingQueue;
use crate::controller::reconciler::ObjectKey;

/// Handle to the running watch mirror.
pub struct PodWatcher {
    store: Store<Pod>,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for PodWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodWatcher").finish_non_exhaustive()
    }
}

impl PodWatcher {
    /// Establish the initial full listing plus the continuous change stream,
    /// scoped to `namespace` when given, and block until the initial sync
    /// completes.
    ///
    /// # Errors
    ///
    /// Fails when the initial sync does not complete within the bounded
    /// wait. This is a startup-time hard failure; callers abort the process.
    pub async fn start(
        client: Client,
        namespace: Option<&str>,
        queue: Arc<RateLimitingQueue<String>>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        match namespace {
            Some(ns) => info!(namespace = %ns, "initializing Pod watch"),
            None => info!("initializing Pod watch across all namespaces"),
        }
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };

        let (store, writer) = reflector::store();
        let stream = reflector::reflector(
            writer,
            watcher(api, watcher::Config::default()).default_backoff(),
        );
        let pump = tokio::spawn(pump_events(stream, queue, shutdown));

        tokio::time::timeout(
            Duration::from_secs(CACHE_SYNC_TIMEOUT_SECS),
            store.wait_until_ready(),
        )
        .await
        .context("timed out waiting for the initial Pod cache sync")?
        .context("Pod watch ended before the initial cache sync completed")?;
        info!("initial Pod cache sync complete");

        Ok(Self { store, pump })
    }

    /// Point-lookup mirror of the watched Pods. Reads may lag the
    /// authoritative state; consumers validate before mutating.
    #[must_use]
    pub fn store(&self) -> Store<Pod> {
        self.store.clone()
    }

    /// Wait for the pump task to exit (it stops when the shutdown token
    /// fires or the stream ends).
    pub async fn join(self) {
        let _ = self.pump.await;
    }
}

/// Drive the watch stream, translating cache notifications into queue
/// insertions, until shutdown.
async fn pump_events<S>(
    stream: S,
    queue: Arc<RateLimitingQueue<String>>,
    shutdown: CancellationToken,
) where
    S: Stream<Item = Result<watcher::Event<Pod>, watcher::Error>> + Send + 'static,
{
    tokio::pin!(stream);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!("Pod event pump stopping");
                return;
            }
            event = stream.try_next() => match event {
                Ok(Some(event)) => handle_event(&event, &queue),
                Ok(None) => {
                    warn!("Pod watch stream ended");
                    return;
                }
                // The stream backs off and re-lists on its own; just record it.
                Err(err) => warn!(error = %err, "Pod watch error"),
            },
        }
    }
}

/// Enqueue the key for add and update notifications; ignore deletions.
fn handle_event(event: &watcher::Event<Pod>, queue: &RateLimitingQueue<String>) {
    match event {
        watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
            if let Some(key) = ObjectKey::from_pod(pod) {
                debug!(%key, "enqueueing Pod");
                queue.add(key.to_string());
            } else {
                warn!("Pod event without namespace/name, ignoring");
            }
        }
        watcher::Event::Delete(pod) => {
            if let Some(key) = ObjectKey::from_pod(pod) {
                debug!(%key, "Pod deleted, not enqueueing");
            }
        }
        watcher::Event::Init | watcher::Event::InitDone => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn make_pod(namespace: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    fn queue() -> RateLimitingQueue<String> {
        RateLimitingQueue::new(Duration::from_secs(1), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_apply_events_enqueue_the_pod_key() {
        let q = queue();
        handle_event(&watcher::Event::Apply(make_pod("default", "a")), &q);
        handle_event(&watcher::Event::InitApply(make_pod("default", "b")), &q);

        assert_eq!(q.get().await, Some("default/a".to_string()));
        assert_eq!(q.get().await, Some("default/b".to_string()));
    }

    #[tokio::test]
    async fn test_repeated_updates_are_absorbed_by_queue_dedup() {
        let q = queue();
        for _ in 0..5 {
            handle_event(&watcher::Event::Apply(make_pod("default", "a")), &q);
        }
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_events_are_not_enqueued() {
        let q = queue();
        handle_event(&watcher::Event::Delete(make_pod("default", "a")), &q);
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn test_pod_without_name_is_ignored() {
        let q = queue();
        let mut pod = make_pod("default", "a");
        pod.metadata.name = None;
        handle_event(&watcher::Event::Apply(pod), &q);
        assert_eq!(q.len(), 0);
    }
}
