//! Keeps every (multiclusterapp, target) pair converged.
//!
//! A single loop task owns the store watch, the resync timer and the command
//! channel; it only enqueues keys. A pool of workers pulls keys from the
//! queue and runs the reconciler.

use crate::config::ControllerConfig;
use crate::errors::{ControllerError, FanoutError};
use crate::metrics_defs::{RECONCILE_DURATION, RECONCILE_OUTCOMES, RESYNCS};
use crate::reconciler::{TargetKey, TargetReconciler};
use crate::work_queue::WorkQueue;
use parking_lot::Mutex;
use shared::{counter, histogram};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use store::types::{BindingFilter, BindingScope, MultiClusterApp, RoleBinding};
use store::{Object, SharedStore, StoreError, WatchEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug)]
enum Command {
    // Run a full resync now. Replies once every key has been enqueued.
    Resync(oneshot::Sender<Result<(), FanoutError>>),
    Shutdown,
}

struct ControllerInner {
    queue: Arc<WorkQueue<TargetKey>>,
    ready: Arc<AtomicBool>,
    tx: mpsc::Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the running controller. Cheap to clone.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    /// Subscribes to the store and spawns the controller tasks. Must be
    /// called from within a tokio runtime.
    pub fn start(
        store: SharedStore,
        reconciler: TargetReconciler,
        config: &ControllerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Command>(16);
        let queue = Arc::new(WorkQueue::new(config.backoff()));
        let ready = Arc::new(AtomicBool::new(false));

        // Subscribe before the first resync so no write falls in between.
        let events = store.watch();
        let event_loop = EventLoop {
            store,
            queue: queue.clone(),
            ready: ready.clone(),
            resync_interval: config.resync_interval(),
        };

        let mut workers = JoinSet::new();
        let reconciler = Arc::new(reconciler);
        for _ in 0..config.workers {
            workers.spawn(worker(queue.clone(), reconciler.clone()));
        }

        let handle = tokio::spawn(async move {
            event_loop.run(events, rx).await;
            event_loop.queue.shutdown();
            while workers.join_next().await.is_some() {}
            tracing::info!("controller stopped");
        });

        Controller {
            inner: Arc::new(ControllerInner {
                queue,
                ready,
                tx,
                handle: Mutex::new(Some(handle)),
            }),
        }
    }

    /// True once the first full resync has enqueued every known target.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Triggers a full resync outside of the regular interval.
    pub async fn resync(&self) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Command::Resync(reply))
            .await
            .map_err(|_| ControllerError::Stopped)?;
        rx.await.map_err(|_| ControllerError::Stopped)??;
        Ok(())
    }

    /// Stops the loop and waits for in-flight reconciles to finish.
    pub async fn shutdown(&self) {
        let _ = self.inner.tx.send(Command::Shutdown).await;
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "controller task failed");
        }
    }
}

async fn worker(queue: Arc<WorkQueue<TargetKey>>, reconciler: Arc<TargetReconciler>) {
    while let Some(key) = queue.get().await {
        let start = Instant::now();
        match reconciler.reconcile(&key).await {
            Ok(phase) => {
                queue.forget(&key);
                counter!(RECONCILE_OUTCOMES, "outcome" => "ok").increment(1);
                tracing::debug!(key = %key, ?phase, "reconciled");
            }
            Err(e) => {
                let retry_in = queue.add_rate_limited(key.clone());
                counter!(RECONCILE_OUTCOMES, "outcome" => "error").increment(1);
                tracing::warn!(key = %key, error = %e, ?retry_in, "reconcile failed");
            }
        }
        histogram!(RECONCILE_DURATION).record(start.elapsed().as_secs_f64());
        queue.done(&key);
    }
}

struct EventLoop {
    store: SharedStore,
    queue: Arc<WorkQueue<TargetKey>>,
    ready: Arc<AtomicBool>,
    resync_interval: Duration,
}

impl EventLoop {
    async fn run(
        &self,
        mut events: broadcast::Receiver<WatchEvent>,
        mut rx: mpsc::Receiver<Command>,
    ) {
        // The first tick fires immediately and performs the initial resync.
        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = resync.tick() => {
                    if let Err(e) = self.resync().await {
                        tracing::error!(error = %e, "resync failed");
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            tracing::error!(error = %e, "could not handle watch event");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "watch lagged, resyncing");
                        if let Err(e) = self.resync().await {
                            tracing::error!(error = %e, "resync failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("store watch closed");
                        return;
                    }
                },
                cmd = rx.recv() => match cmd {
                    Some(Command::Resync(reply)) => {
                        let _ = reply.send(self.resync().await);
                    }
                    Some(Command::Shutdown) | None => return,
                },
            }
        }
    }

    fn enqueue_targets(&self, mcapp: &MultiClusterApp) {
        let id = mcapp.id();
        let projects = mcapp
            .spec
            .targets
            .iter()
            .map(|t| &t.project_id)
            .chain(mcapp.status.targets.iter().map(|t| &t.project_id));
        for project in projects {
            self.queue.add(TargetKey::new(&id, project));
        }
    }

    async fn handle_event(&self, event: WatchEvent) -> Result<(), FanoutError> {
        match event {
            WatchEvent::Added(Object::MultiClusterApp(mcapp)) => self.enqueue_targets(&mcapp),
            WatchEvent::Modified {
                old: Object::MultiClusterApp(old),
                new: Object::MultiClusterApp(new),
            } => {
                // Status-only writes come from the workers themselves.
                if old.metadata.generation == new.metadata.generation
                    && old.metadata.updated_by == new.metadata.updated_by
                {
                    return Ok(());
                }
                self.enqueue_targets(&old);
                self.enqueue_targets(&new);
            }
            WatchEvent::Deleted(Object::MultiClusterApp(mcapp)) => self.enqueue_targets(&mcapp),
            WatchEvent::Deleted(Object::App(app)) => {
                self.queue
                    .add(TargetKey::new(&app.multi_cluster_app_id, &app.project_id));
            }
            WatchEvent::Deleted(Object::RoleBinding(binding)) => {
                self.enqueue_binding_dependents(&binding).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// A deleted binding may have been shared by several multiclusterapps
    /// declaring the same role. Every target it covered is enqueued so the
    /// binding is recreated if still desired.
    async fn enqueue_binding_dependents(&self, binding: &RoleBinding) -> Result<(), FanoutError> {
        if let (Some(owner), BindingScope::Project(project)) = (&binding.owner, &binding.scope) {
            self.queue.add(TargetKey::new(owner, project));
        }

        for mcapp in self.store.list_mcapps().await? {
            if !mcapp.spec.roles.contains(&binding.role_template_id) {
                continue;
            }
            let id = mcapp.id();
            for target in &mcapp.spec.targets {
                let covered = match &binding.scope {
                    BindingScope::Project(project) => &target.project_id == project,
                    BindingScope::Cluster(cluster) => target.project_id.cluster() == cluster,
                };
                if covered {
                    self.queue.add(TargetKey::new(&id, &target.project_id));
                }
            }
        }
        Ok(())
    }

    /// Enqueues every declared and every recorded target, plus the targets
    /// of apps and bindings left behind by removed multiclusterapps. Owned
    /// cluster bindings no target accounts for are deleted directly.
    async fn resync(&self) -> Result<(), FanoutError> {
        let mcapps = self.store.list_mcapps().await?;
        let mut keys = HashSet::new();
        for mcapp in &mcapps {
            let id = mcapp.id();
            for target in &mcapp.spec.targets {
                keys.insert(TargetKey::new(&id, &target.project_id));
            }
            for status in &mcapp.status.targets {
                keys.insert(TargetKey::new(&id, &status.project_id));
            }
        }

        for app in self.store.list_apps(&Default::default()).await? {
            keys.insert(TargetKey::new(&app.multi_cluster_app_id, &app.project_id));
        }

        for binding in self.store.list_bindings(&BindingFilter::default()).await? {
            let Some(owner) = &binding.owner else {
                continue;
            };
            match &binding.scope {
                BindingScope::Project(project) => {
                    keys.insert(TargetKey::new(owner, project));
                }
                BindingScope::Cluster(cluster) => {
                    let needed = mcapps.iter().any(|m| {
                        &m.id() == owner
                            && m.spec.targets.iter().any(|t| t.project_id.cluster() == cluster)
                    });
                    if needed {
                        continue;
                    }
                    match self.store.delete_binding(&binding.id).await {
                        Ok(_) => tracing::info!(
                            binding = %binding.id,
                            owner = %owner,
                            "deleted orphaned cluster role binding"
                        ),
                        Err(StoreError::NotFound { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        let count = keys.len();
        for key in keys {
            self.queue.add(key);
        }
        self.ready.store(true, Ordering::Relaxed);
        counter!(RESYNCS).increment(1);
        tracing::debug!(keys = count, "resync complete");
        Ok(())
    }
}
