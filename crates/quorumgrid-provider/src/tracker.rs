//! Provider tracker — caches expensive cloud provider handles.
//!
//! Each namespace gets at most one in-flight construction at a time. The
//! first caller for a namespace spawns the build and every concurrent
//! caller waits on the same result. Successful builds are cached until
//! invalidated; failures are handed to the waiters and then forgotten so
//! the next request retries.
//!
//! # Concurrency model
//!
//! The namespace map sits behind a single mutex that is never held across
//! an await. Builds run on their own task, so requests for different
//! namespaces proceed in parallel and a cancelled caller does not abandon
//! the build for the others. Killing the tracker wakes every waiter with
//! [`TrackerError::Dying`]; in-flight builds run to completion but their
//! results are discarded.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

use quorum_core::CONTROLLER_NAMESPACE;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{TrackerError, TrackerResult};

/// Everything needed to construct a provider for one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub namespace: String,
    pub cloud: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Constructs provider handles. Supplied by the surrounding system.
pub trait ProviderBuilder: Send + Sync + 'static {
    type Provider: Send + Sync + 'static;

    fn build(
        &self,
        config: ProviderConfig,
    ) -> impl Future<Output = anyhow::Result<Self::Provider>> + Send;
}

/// Looks up the current provider config for a namespace.
pub trait ConfigSource: Send + Sync + 'static {
    fn provider_config(
        &self,
        namespace: &str,
    ) -> impl Future<Output = anyhow::Result<ProviderConfig>> + Send;
}

/// Which namespaces a tracker serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerMode {
    /// Exactly one namespace, fixed at construction.
    Singular(String),
    /// Any tenant namespace, supplied per call.
    Multi,
}

type Outcome<P> = Option<TrackerResult<Arc<P>>>;

enum Slot<P> {
    Ready(Arc<P>),
    Building {
        id: u64,
        done: watch::Receiver<Outcome<P>>,
    },
}

struct State<P> {
    entries: HashMap<String, Slot<P>>,
    next_id: u64,
    dying: bool,
}

struct Shared<B: ProviderBuilder, C> {
    builder: B,
    source: C,
    state: Mutex<State<B::Provider>>,
    dying: watch::Sender<bool>,
}

/// Single-flight cache of provider handles keyed by namespace.
pub struct ProviderTracker<B: ProviderBuilder, C: ConfigSource> {
    mode: TrackerMode,
    shared: Arc<Shared<B, C>>,
}

impl<B: ProviderBuilder, C: ConfigSource> Clone for ProviderTracker<B, C> {
    fn clone(&self) -> Self {
        Self {
            mode: self.mode.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: ProviderBuilder, C: ConfigSource> ProviderTracker<B, C> {
    /// Tracker serving exactly `namespace`.
    pub fn singular(namespace: impl Into<String>, builder: B, source: C) -> TrackerResult<Self> {
        let namespace = namespace.into();
        if namespace.is_empty() {
            return Err(TrackerError::Validation(
                "singular tracker requires a namespace".into(),
            ));
        }
        info!(%namespace, "starting singular provider tracker");
        Ok(Self::with_mode(TrackerMode::Singular(namespace), builder, source))
    }

    /// Tracker serving any tenant namespace.
    pub fn multi(builder: B, source: C) -> Self {
        info!("starting multi-namespace provider tracker");
        Self::with_mode(TrackerMode::Multi, builder, source)
    }

    fn with_mode(mode: TrackerMode, builder: B, source: C) -> Self {
        let (dying, _) = watch::channel(false);
        Self {
            mode,
            shared: Arc::new(Shared {
                builder,
                source,
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    next_id: 0,
                    dying: false,
                }),
                dying,
            }),
        }
    }

    pub fn mode(&self) -> &TrackerMode {
        &self.mode
    }

    /// Provider for a singular tracker's namespace.
    pub async fn provider(&self) -> TrackerResult<Arc<B::Provider>> {
        match &self.mode {
            TrackerMode::Singular(namespace) => self.get(namespace).await,
            TrackerMode::Multi => Err(TrackerError::Validation(
                "multi-namespace tracker requires provider_for_model".into(),
            )),
        }
    }

    /// Provider for a tenant namespace on a multi tracker.
    pub async fn provider_for_model(&self, namespace: &str) -> TrackerResult<Arc<B::Provider>> {
        match &self.mode {
            TrackerMode::Singular(own) => Err(TrackerError::Validation(format!(
                "singular tracker for {own:?} does not serve provider_for_model({namespace:?}); use provider"
            ))),
            TrackerMode::Multi if namespace.is_empty() => {
                Err(TrackerError::Validation("namespace must not be empty".into()))
            }
            TrackerMode::Multi if namespace == CONTROLLER_NAMESPACE => Err(
                TrackerError::Validation(format!("{CONTROLLER_NAMESPACE:?} is not a tenant namespace")),
            ),
            TrackerMode::Multi => self.get(namespace).await,
        }
    }

    /// Build a provider straight from `config`, bypassing the cache.
    pub async fn ephemeral_provider_from_config(
        &self,
        config: ProviderConfig,
    ) -> TrackerResult<B::Provider> {
        if self.is_dying() {
            return Err(TrackerError::Dying);
        }
        let namespace = config.namespace.clone();
        let mut dying = self.shared.dying.subscribe();

        tokio::select! {
            biased;
            _ = dying.wait_for(|d| *d) => Err(TrackerError::Dying),
            result = self.shared.builder.build(config) => {
                result.map_err(|e| TrackerError::build(&namespace, &e))
            }
        }
    }

    /// Drop the cached (or in-flight) provider for `namespace` so the next
    /// request rebuilds it. Returns whether anything was dropped.
    pub fn invalidate(&self, namespace: &str) -> bool {
        let mut state = self.shared.state.lock().expect("tracker state lock");
        let removed = state.entries.remove(namespace).is_some();
        if removed {
            info!(%namespace, "provider invalidated");
        }
        removed
    }

    /// Namespaces with a ready provider, sorted.
    pub fn cached_namespaces(&self) -> Vec<String> {
        let state = self.shared.state.lock().expect("tracker state lock");
        let mut names: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Stop the tracker. Waiting and future calls fail with
    /// [`TrackerError::Dying`].
    pub fn kill(&self) {
        {
            let mut state = self.shared.state.lock().expect("tracker state lock");
            if state.dying {
                return;
            }
            state.dying = true;
            state.entries.clear();
        }
        self.shared.dying.send_replace(true);
        info!("provider tracker stopped");
    }

    pub fn is_dying(&self) -> bool {
        *self.shared.dying.borrow()
    }

    /// Kill the tracker once `shutdown` flips to `true` (or its sender
    /// goes away).
    pub fn kill_on_shutdown(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            tracker.kill();
        })
    }

    async fn get(&self, namespace: &str) -> TrackerResult<Arc<B::Provider>> {
        let mut dying = self.shared.dying.subscribe();

        let (id, mut done) = {
            let mut state = self.shared.state.lock().expect("tracker state lock");
            if state.dying {
                return Err(TrackerError::Dying);
            }
            match state.entries.get(namespace) {
                Some(Slot::Ready(provider)) => {
                    debug!(%namespace, "provider cache hit");
                    return Ok(Arc::clone(provider));
                }
                Some(Slot::Building { id, done }) => {
                    debug!(%namespace, "joining in-flight provider build");
                    (*id, done.clone())
                }
                None => {
                    let id = state.next_id;
                    state.next_id += 1;
                    let (tx, rx) = watch::channel(None);
                    state.entries.insert(
                        namespace.to_string(),
                        Slot::Building {
                            id,
                            done: rx.clone(),
                        },
                    );
                    self.spawn_build(namespace.to_string(), id, tx);
                    (id, rx)
                }
            }
        };

        tokio::select! {
            biased;
            _ = dying.wait_for(|d| *d) => Err(TrackerError::Dying),
            outcome = wait_outcome(&mut done) => match outcome {
                Some(result) => result,
                None => {
                    // The build task went away without reporting.
                    self.forget(namespace, id);
                    Err(TrackerError::Build {
                        namespace: namespace.to_string(),
                        message: "provider construction aborted".into(),
                    })
                }
            },
        }
    }

    fn spawn_build(&self, namespace: String, id: u64, tx: watch::Sender<Outcome<B::Provider>>) {
        let shared = Arc::clone(&self.shared);
        debug!(%namespace, "building provider");

        tokio::spawn(async move {
            let outcome = match construct(&shared, &namespace).await {
                Ok(provider) => {
                    info!(%namespace, "provider ready");
                    Ok(Arc::new(provider))
                }
                Err(e) => {
                    warn!(%namespace, error = %e, "provider construction failed");
                    Err(TrackerError::build(&namespace, &e))
                }
            };

            {
                let mut state = shared.state.lock().expect("tracker state lock");
                let current = matches!(
                    state.entries.get(&namespace),
                    Some(Slot::Building { id: current, .. }) if *current == id
                );
                if current {
                    match &outcome {
                        Ok(provider) => {
                            state
                                .entries
                                .insert(namespace.clone(), Slot::Ready(Arc::clone(provider)));
                        }
                        Err(_) => {
                            state.entries.remove(&namespace);
                        }
                    }
                } else {
                    debug!(%namespace, "discarding superseded provider build");
                }
            }

            tx.send_replace(Some(outcome));
        });
    }

    fn forget(&self, namespace: &str, id: u64) {
        let mut state = self.shared.state.lock().expect("tracker state lock");
        if matches!(
            state.entries.get(namespace),
            Some(Slot::Building { id: current, .. }) if *current == id
        ) {
            state.entries.remove(namespace);
        }
    }
}

async fn construct<B: ProviderBuilder, C: ConfigSource>(
    shared: &Shared<B, C>,
    namespace: &str,
) -> anyhow::Result<B::Provider> {
    let config = shared.source.provider_config(namespace).await?;
    shared.builder.build(config).await
}

async fn wait_outcome<P>(done: &mut watch::Receiver<Outcome<P>>) -> Outcome<P> {
    match done.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone(),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct FakeProvider {
        config: ProviderConfig,
        serial: usize,
    }

    /// Counts builds, optionally fails the first N, and blocks until the
    /// gate opens.
    struct FakeBuilder {
        calls: Arc<AtomicUsize>,
        failures: Arc<AtomicUsize>,
        gate: watch::Receiver<bool>,
        blocked: Vec<String>,
    }

    impl ProviderBuilder for FakeBuilder {
        type Provider = FakeProvider;

        async fn build(&self, config: ProviderConfig) -> anyhow::Result<FakeProvider> {
            let serial = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.blocked.is_empty() || self.blocked.contains(&config.namespace) {
                let mut gate = self.gate.clone();
                if gate.wait_for(|open| *open).await.is_err() {
                    anyhow::bail!("gate dropped");
                }
            }
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("cloud api unavailable");
            }
            Ok(FakeProvider { config, serial })
        }
    }

    struct FakeSource;

    impl ConfigSource for FakeSource {
        async fn provider_config(&self, namespace: &str) -> anyhow::Result<ProviderConfig> {
            if namespace == "broken" {
                anyhow::bail!("no cloud credential for {namespace}");
            }
            Ok(ProviderConfig {
                namespace: namespace.to_string(),
                cloud: "lxd".to_string(),
                attributes: BTreeMap::new(),
            })
        }
    }

    struct Harness {
        calls: Arc<AtomicUsize>,
        failures: Arc<AtomicUsize>,
        gate: watch::Sender<bool>,
    }

    impl Harness {
        fn new(open: bool, failures: usize) -> (Self, FakeBuilder) {
            Self::blocking(open, failures, Vec::new())
        }

        fn blocking(open: bool, failures: usize, blocked: Vec<String>) -> (Self, FakeBuilder) {
            let calls = Arc::new(AtomicUsize::new(0));
            let failures = Arc::new(AtomicUsize::new(failures));
            let (gate, gate_rx) = watch::channel(open);
            let builder = FakeBuilder {
                calls: Arc::clone(&calls),
                failures: Arc::clone(&failures),
                gate: gate_rx,
                blocked,
            };
            (Self { calls, failures, gate }, builder)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn open(&self) {
            self.gate.send_replace(true);
        }
    }

    fn config(namespace: &str) -> ProviderConfig {
        ProviderConfig {
            namespace: namespace.to_string(),
            cloud: "lxd".to_string(),
            attributes: BTreeMap::from([("region".to_string(), "localhost".to_string())]),
        }
    }

    #[tokio::test]
    async fn singular_serves_only_provider() {
        let (harness, builder) = Harness::new(true, 0);
        let tracker = ProviderTracker::singular("hunter2", builder, FakeSource).unwrap();

        let err = tracker.provider_for_model("hunter2").await.unwrap_err();
        assert!(matches!(err, TrackerError::Validation(_)));

        let provider = tracker.provider().await.unwrap();
        assert_eq!(provider.config.namespace, "hunter2");
        assert_eq!(harness.calls(), 1);
    }

    #[test]
    fn singular_requires_namespace() {
        let (_harness, builder) = Harness::new(true, 0);
        assert!(matches!(
            ProviderTracker::singular("", builder, FakeSource),
            Err(TrackerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn multi_rejects_controller_and_empty_namespace() {
        let (harness, builder) = Harness::new(true, 0);
        let tracker = ProviderTracker::multi(builder, FakeSource);

        for bad in ["controller", ""] {
            let err = tracker.provider_for_model(bad).await.unwrap_err();
            assert!(matches!(err, TrackerError::Validation(_)), "{bad:?}");
        }
        assert!(matches!(tracker.provider().await, Err(TrackerError::Validation(_))));
        assert_eq!(harness.calls(), 0);
    }

    #[tokio::test]
    async fn cached_after_first_build() {
        let (harness, builder) = Harness::new(true, 0);
        let tracker = ProviderTracker::multi(builder, FakeSource);

        let first = tracker.provider_for_model("alpha").await.unwrap();
        let second = tracker.provider_for_model("alpha").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(harness.calls(), 1);
        assert_eq!(tracker.cached_namespaces(), vec!["alpha".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_build() {
        let (harness, builder) = Harness::new(false, 0);
        let tracker = ProviderTracker::multi(builder, FakeSource);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.provider_for_model("alpha").await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.open();

        let mut providers = Vec::new();
        for handle in handles {
            providers.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(harness.calls(), 1);
        assert!(providers.iter().all(|p| Arc::ptr_eq(p, &providers[0])));
        assert_eq!(providers[0].serial, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_failure() {
        let (harness, builder) = Harness::new(false, 1);
        let tracker = ProviderTracker::multi(builder, FakeSource);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.provider_for_model("alpha").await })
            })
            .collect();

        // Every caller is parked on the gate before the build may finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.open();

        let results: Vec<_> = collect_results(handles).await;
        assert_eq!(harness.calls(), 1);
        let first = results[0].as_ref().unwrap_err().clone();
        assert!(matches!(first, TrackerError::Build { .. }));
        assert!(results.iter().all(|r| r.as_ref().err() == Some(&first)));
        assert!(tracker.cached_namespaces().is_empty());
    }

    async fn collect_results(
        handles: Vec<JoinHandle<TrackerResult<Arc<FakeProvider>>>>,
    ) -> Vec<TrackerResult<Arc<FakeProvider>>> {
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let (harness, builder) = Harness::new(true, 1);
        let tracker = ProviderTracker::multi(builder, FakeSource);

        let err = tracker.provider_for_model("alpha").await.unwrap_err();
        assert!(matches!(err, TrackerError::Build { ref namespace, .. } if namespace == "alpha"));
        assert!(tracker.cached_namespaces().is_empty());

        let provider = tracker.provider_for_model("alpha").await.unwrap();
        assert_eq!(provider.serial, 2);
        assert_eq!(harness.calls(), 2);
        assert_eq!(harness.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn config_source_errors_surface_as_build_errors() {
        let (harness, builder) = Harness::new(true, 0);
        let tracker = ProviderTracker::multi(builder, FakeSource);

        let err = tracker.provider_for_model("broken").await.unwrap_err();
        match err {
            TrackerError::Build { namespace, message } => {
                assert_eq!(namespace, "broken");
                assert!(message.contains("no cloud credential"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(harness.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn different_namespaces_build_in_parallel() {
        let (harness, builder) = Harness::blocking(false, 0, vec!["slow".to_string()]);
        let tracker = ProviderTracker::multi(builder, FakeSource);

        let slow = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.provider_for_model("slow").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fast = tokio::time::timeout(
            Duration::from_secs(5),
            tracker.provider_for_model("fast"),
        )
        .await
        .expect("fast namespace must not wait on slow one")
        .unwrap();
        assert_eq!(fast.config.namespace, "fast");
        assert!(!slow.is_finished());

        harness.open();
        assert_eq!(slow.await.unwrap().unwrap().config.namespace, "slow");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kill_wakes_waiters_with_dying() {
        let (harness, builder) = Harness::new(false, 0);
        let tracker = ProviderTracker::multi(builder, FakeSource);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.provider_for_model("alpha").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tracker.kill();
        assert_eq!(waiter.await.unwrap().unwrap_err(), TrackerError::Dying);

        // The build finishing afterwards must not resurrect the entry.
        harness.open();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(tracker.cached_namespaces().is_empty());
        assert_eq!(
            tracker.provider_for_model("alpha").await.unwrap_err(),
            TrackerError::Dying
        );
    }

    #[tokio::test]
    async fn kill_hides_cached_providers() {
        let (_harness, builder) = Harness::new(true, 0);
        let tracker = ProviderTracker::singular("hunter2", builder, FakeSource).unwrap();

        tracker.provider().await.unwrap();
        tracker.kill();
        tracker.kill();

        assert!(tracker.is_dying());
        assert!(tracker.provider().await.unwrap_err().is_dying());
        assert!(
            tracker
                .ephemeral_provider_from_config(config("hunter2"))
                .await
                .unwrap_err()
                .is_dying()
        );
    }

    #[tokio::test]
    async fn kill_on_shutdown_follows_channel() {
        let (_harness, builder) = Harness::new(true, 0);
        let tracker = ProviderTracker::multi(builder, FakeSource);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tracker.kill_on_shutdown(shutdown_rx);
        assert!(!tracker.is_dying());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(tracker.is_dying());
    }

    #[tokio::test]
    async fn invalidate_forces_rebuild() {
        let (harness, builder) = Harness::new(true, 0);
        let tracker = ProviderTracker::multi(builder, FakeSource);

        let first = tracker.provider_for_model("alpha").await.unwrap();
        assert!(tracker.invalidate("alpha"));
        assert!(!tracker.invalidate("alpha"));

        let second = tracker.provider_for_model("alpha").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(harness.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalidated_in_flight_build_is_not_cached() {
        let (harness, builder) = Harness::new(false, 0);
        let tracker = ProviderTracker::multi(builder, FakeSource);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.provider_for_model("alpha").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(tracker.invalidate("alpha"));
        harness.open();

        // The original waiter still gets its provider...
        let stale = waiter.await.unwrap().unwrap();
        assert_eq!(stale.serial, 1);
        // ...but it was never cached.
        assert!(tracker.cached_namespaces().is_empty());
        let fresh = tracker.provider_for_model("alpha").await.unwrap();
        assert_eq!(fresh.serial, 2);
    }

    #[tokio::test]
    async fn ephemeral_is_never_cached() {
        let (harness, builder) = Harness::new(true, 0);
        let tracker = ProviderTracker::multi(builder, FakeSource);

        let a = tracker.ephemeral_provider_from_config(config("beta")).await.unwrap();
        let b = tracker.ephemeral_provider_from_config(config("beta")).await.unwrap();
        assert_eq!(a.serial, 1);
        assert_eq!(b.serial, 2);
        assert_eq!(a.config.attributes.get("region").map(String::as_str), Some("localhost"));
        assert!(tracker.cached_namespaces().is_empty());
        assert_eq!(harness.calls(), 2);
    }

    #[tokio::test]
    async fn ephemeral_failure_is_build_error() {
        let (_harness, builder) = Harness::new(true, 1);
        let tracker = ProviderTracker::multi(builder, FakeSource);

        let err = tracker
            .ephemeral_provider_from_config(config("beta"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Build { .. }));
    }

    #[test]
    fn provider_config_round_trips_through_json() {
        let json = serde_json::to_string(&config("alpha")).unwrap();
        let back: ProviderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config("alpha"));
    }
}
