use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use log::{debug, error, warn};
use reqwest::blocking::Client;
use serde_json::Value;

use crate::error::Error;
use crate::growthbook::SDK_VERSION;
use crate::model::FeatureMap;
use crate::util;

/// Subscriber invoked with the new feature snapshot after every successful
/// refresh.
#[derive(Clone)]
pub struct FeatureRefreshCallback(pub Arc<dyn Fn(Arc<FeatureMap>) + Send + Sync>);

impl FeatureRefreshCallback {
    pub fn new(callback: impl Fn(Arc<FeatureMap>) + Send + Sync + 'static) -> Self {
        FeatureRefreshCallback(Arc::new(callback))
    }
}

impl Debug for FeatureRefreshCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<callback_function>")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshStrategy {
    /// Refresh on a timer every `ttl_seconds`, in addition to stale reads.
    #[default]
    Periodic,
    /// Refresh only on explicit `refresh()` calls and stale reads.
    Manual,
}

#[derive(Debug, Clone)]
enum RepositoryStatus {
    Pending,
    Ready,
    Error(Error),
}

#[derive(Debug)]
struct RepositoryState {
    features: Arc<FeatureMap>,
    last_fetch: Option<DateTime<Utc>>,
    status: RepositoryStatus,
    shutdown: bool,
}

impl Default for RepositoryState {
    fn default() -> Self {
        RepositoryState {
            features: Arc::new(FeatureMap::default()),
            last_fetch: None,
            status: RepositoryStatus::Pending,
            shutdown: false,
        }
    }
}

/// Background-refreshing cache of feature definitions.
///
/// The feature map is immutable once published; refreshes replace it by
/// swapping the inner `Arc`, so readers always work on a consistent
/// snapshot and never block on an in-flight HTTP request.
#[derive(Builder, Debug)]
#[builder(default, build_fn(validate = "Self::validate"))]
pub struct FeatureRepository {
    #[builder(default = "\"https://cdn.growthbook.io\".to_string()")]
    pub api_host: String,
    pub client_key: String,
    pub decryption_key: Option<String>,
    #[builder(default = "60")]
    pub ttl_seconds: u64,
    #[builder(default = "10")]
    pub http_timeout_seconds: u64,
    pub refresh_strategy: RefreshStrategy,
    #[builder(default = "5000")]
    pub initialization_timeout_ms: u64,
    /// Subscriber registered before the repository starts.
    pub on_refresh: Option<FeatureRefreshCallback>,

    #[builder(setter(skip))]
    state: Arc<(Mutex<RepositoryState>, Condvar)>,
    #[builder(setter(skip))]
    subscribers: Arc<RwLock<BTreeMap<u64, FeatureRefreshCallback>>>,
    #[builder(setter(skip))]
    next_subscriber_id: AtomicU64,
    #[builder(setter(skip))]
    refresh_in_flight: AtomicBool,
    #[builder(setter(skip))]
    self_handle: RwLock<Weak<FeatureRepository>>,
}

impl Default for FeatureRepository {
    fn default() -> Self {
        FeatureRepository {
            api_host: "https://cdn.growthbook.io".to_string(),
            client_key: String::new(),
            decryption_key: None,
            ttl_seconds: 60,
            http_timeout_seconds: 10,
            refresh_strategy: RefreshStrategy::default(),
            initialization_timeout_ms: 5000,
            on_refresh: None,
            state: Arc::default(),
            subscribers: Arc::default(),
            next_subscriber_id: AtomicU64::new(0),
            refresh_in_flight: AtomicBool::new(false),
            self_handle: RwLock::new(Weak::new()),
        }
    }
}

impl FeatureRepositoryBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.client_key.as_ref().map_or(true, |key| key.is_empty()) {
            return Err("client_key is required".to_string());
        }
        if let Some(host) = &self.api_host {
            if host.is_empty() {
                return Err("api_host must not be empty".to_string());
            }
        }
        Ok(())
    }

    /// Builds the repository, starts it and blocks until the first fetch
    /// settles, up to the configured initialization timeout.
    pub fn init(&self) -> Result<Arc<FeatureRepository>, Error> {
        let repository = self.build().map_err(|e| Error::Config(e.to_string()))?;
        let timeout = Duration::from_millis(repository.initialization_timeout_ms);
        let repository = repository.start();
        repository.await_initialization(Some(timeout))?;
        Ok(repository)
    }
}

impl FeatureRepository {
    /// Spawns the initial fetch and, for the periodic strategy, the refresh
    /// timer. Consumes the configured repository and returns the shared
    /// handle evaluators hold on to.
    pub fn start(mut self) -> Arc<FeatureRepository> {
        if let Some(callback) = self.on_refresh.take() {
            let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
            match self.subscribers.write() {
                Ok(mut subscribers) => {
                    subscribers.insert(id, callback);
                }
                Err(e) => error!("Error registering on_refresh callback: {}", e),
            }
        }

        let repository = Arc::new(self);
        match repository.self_handle.write() {
            Ok(mut handle) => *handle = Arc::downgrade(&repository),
            Err(e) => error!("Error storing repository handle: {}", e),
        }

        let initial = Arc::clone(&repository);
        thread::spawn(move || {
            let _ = initial.refresh_once();
        });

        if repository.refresh_strategy == RefreshStrategy::Periodic {
            FeatureRepository::spawn_refresh_timer(&repository);
        }

        repository
    }

    fn spawn_refresh_timer(repository: &Arc<FeatureRepository>) {
        let state = Arc::clone(&repository.state);
        let weak = Arc::downgrade(repository);
        let interval = Duration::from_secs(repository.ttl_seconds.max(1));

        thread::spawn(move || {
            let (lock, cvar) = &*state;
            loop {
                let guard = match lock.lock() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                if guard.shutdown {
                    return;
                }
                // woken early by publishes and shutdowns; staleness is
                // re-checked so spurious wakeups don't refresh
                let (guard, _) = match cvar.wait_timeout(guard, interval) {
                    Ok(result) => result,
                    Err(_) => return,
                };
                if guard.shutdown {
                    return;
                }
                let repository = match weak.upgrade() {
                    Some(repository) => repository,
                    None => return,
                };
                let stale = repository.is_stale(&guard);
                drop(guard);
                if stale {
                    let _ = repository.refresh_once();
                }
            }
        });
    }

    fn is_stale(&self, state: &RepositoryState) -> bool {
        match (state.last_fetch, &state.status) {
            (Some(fetched_at), _) => {
                Utc::now().signed_duration_since(fetched_at)
                    > chrono::Duration::milliseconds(self.ttl_seconds as i64 * 1000)
            }
            // a failed initial fetch may be retried on read
            (None, RepositoryStatus::Error(_)) => true,
            (None, _) => false,
        }
    }

    /// Blocks until the repository leaves the pending state, i.e. the first
    /// fetch succeeded or failed. The in-flight fetch is not cancelled on
    /// timeout. `None` uses the configured initialization timeout.
    pub fn await_initialization(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let timeout = timeout.unwrap_or(Duration::from_millis(self.initialization_timeout_ms));
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.state;

        let mut guard = lock.lock()?;
        loop {
            if guard.shutdown {
                return Err(Error::Shutdown);
            }
            match &guard.status {
                RepositoryStatus::Ready => return Ok(()),
                RepositoryStatus::Error(e) => return Err(e.clone()),
                RepositoryStatus::Pending => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::InitializationTimeout);
            }
            let (next_guard, _) = cvar.wait_timeout(guard, deadline - now)?;
            guard = next_guard;
        }
    }

    /// Returns the current feature snapshot without blocking. A stale read
    /// kicks off at most one background refresh (stale-while-revalidate).
    pub fn get_features(&self) -> Arc<FeatureMap> {
        let (stale, snapshot) = {
            let guard = match self.state.0.lock() {
                Ok(guard) => guard,
                Err(e) => {
                    error!("Error reading features: {}", e);
                    return Arc::new(FeatureMap::default());
                }
            };
            let stale = !guard.shutdown && self.is_stale(&guard);
            (stale, Arc::clone(&guard.features))
        };

        if stale
            && self
                .refresh_in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let weak = match self.self_handle.read() {
                Ok(handle) => handle.clone(),
                Err(_) => Weak::new(),
            };
            match weak.upgrade() {
                Some(repository) => {
                    thread::spawn(move || {
                        let _ = repository.refresh_once();
                        repository.refresh_in_flight.store(false, Ordering::SeqCst);
                    });
                }
                // not started; the flag must not stay locked
                None => self.refresh_in_flight.store(false, Ordering::SeqCst),
            }
        }

        snapshot
    }

    /// Fetches and publishes synchronously.
    pub fn refresh(&self) -> Result<(), Error> {
        self.refresh_once()
    }

    pub fn subscribe(&self, callback: FeatureRefreshCallback) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        match self.subscribers.write() {
            Ok(mut subscribers) => {
                subscribers.insert(id, callback);
            }
            Err(e) => error!("Error adding refresh callback: {}", e),
        }
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        match self.subscribers.write() {
            Ok(mut subscribers) => {
                subscribers.remove(&id);
            }
            Err(e) => error!("Error removing refresh callback: {}", e),
        }
    }

    pub fn clear_subscribers(&self) {
        match self.subscribers.write() {
            Ok(mut subscribers) => subscribers.clear(),
            Err(e) => error!("Error clearing refresh callbacks: {}", e),
        }
    }

    /// Stops the refresh timer and wakes pending initialization waiters
    /// with a shutdown error. The last published snapshot stays readable.
    pub fn shutdown(&self) {
        match self.state.0.lock() {
            Ok(mut guard) => {
                guard.shutdown = true;
                self.state.1.notify_all();
            }
            Err(e) => error!("Error shutting down repository: {}", e),
        }
    }

    fn refresh_once(&self) -> Result<(), Error> {
        match self.fetch_features() {
            Ok(features) => {
                self.publish(features);
                Ok(())
            }
            Err(e) => {
                error!("Feature refresh failed: {}", e);
                self.record_failure(e.clone());
                Err(e)
            }
        }
    }

    fn fetch_features(&self) -> Result<FeatureMap, Error> {
        let api_host = self.api_host.trim_end_matches('/');
        let url = format!("{}/api/features/{}", api_host, self.client_key);
        let client = Client::new();

        let response = client
            .get(url)
            .header(
                "User-Agent",
                format!("growthbook-client-rust/{}", SDK_VERSION),
            )
            .timeout(Duration::from_secs(self.http_timeout_seconds))
            .send()
            .map_err(|e| Error::Fetch(format!("transport error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("unexpected HTTP status {}", status)));
        }

        let body: Value = response
            .json()
            .map_err(|e| Error::Fetch(format!("invalid JSON response: {}", e)))?;
        self.parse_payload(body)
    }

    fn parse_payload(&self, body: Value) -> Result<FeatureMap, Error> {
        if let Some(encrypted) = body.get("encryptedFeatures").and_then(Value::as_str) {
            let key = self.decryption_key.as_deref().ok_or_else(|| {
                Error::Fetch(
                    "response contains encrypted features but no decryption key is configured"
                        .to_string(),
                )
            })?;
            let plaintext = util::decrypt_string(encrypted, key)?;
            return serde_json::from_str(&plaintext).map_err(|e| {
                Error::Decryption(format!("decrypted payload is not a feature map: {}", e))
            });
        }

        if let Some(features) = body.get("features") {
            return serde_json::from_value(features.clone())
                .map_err(|e| Error::Fetch(format!("invalid features payload: {}", e)));
        }

        Err(Error::Fetch(
            "response has neither features nor encryptedFeatures".to_string(),
        ))
    }

    fn publish(&self, features: FeatureMap) {
        let snapshot = Arc::new(features);

        match self.state.0.lock() {
            Ok(mut guard) => {
                if guard.shutdown {
                    warn!("Discarding refresh result after shutdown");
                    return;
                }
                guard.features = Arc::clone(&snapshot);
                guard.last_fetch = Some(Utc::now());
                guard.status = RepositoryStatus::Ready;
                self.state.1.notify_all();
            }
            Err(e) => {
                error!("Error publishing features: {}", e);
                return;
            }
        }

        debug!("Published {} features", snapshot.len());
        self.notify_subscribers(snapshot);
    }

    fn record_failure(&self, e: Error) {
        match self.state.0.lock() {
            Ok(mut guard) => {
                // only the initial fetch flips the status; later failures
                // keep serving the cached snapshot
                if let RepositoryStatus::Pending = guard.status {
                    guard.status = RepositoryStatus::Error(e);
                    self.state.1.notify_all();
                }
            }
            Err(e) => error!("Error recording fetch failure: {}", e),
        }
    }

    fn notify_subscribers(&self, features: Arc<FeatureMap>) {
        let subscribers = match self.subscribers.read() {
            Ok(subscribers) => subscribers,
            Err(e) => {
                error!("Error reading refresh callbacks: {}", e);
                return;
            }
        };
        for (id, callback) in subscribers.iter() {
            let callback = callback.clone();
            let snapshot = Arc::clone(&features);
            if catch_unwind(AssertUnwindSafe(move || (callback.0)(snapshot))).is_err() {
                error!("Refresh callback {} panicked", id);
            }
        }
    }
}
