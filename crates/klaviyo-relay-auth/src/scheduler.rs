//! Scheduler/Supervisor: keeps the session alive by re-running the login on
//! a fixed interval.
//!
//! A cycle makes up to `1 + max_retries` independent login runs with a
//! fixed delay between them. A successful run is persisted to the Credential
//! Store and the proxy is told to reload. After the last failure the cycle
//! gives up and the supervisor waits for the next interval.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};

use klaviyo_relay_config::SchedulerConfig;

use crate::error::{AuthError, Result};
use crate::login::Authenticator;
use crate::retry::{RetryPolicy, retry_fixed};
use crate::session::{LiveSession, SessionMaterializer};
use crate::store::CredentialStore;

// ============================================================================
// Traits
// ============================================================================

/// One complete login run.
#[async_trait]
pub trait LoginFlow: Send + Sync {
    async fn login(&self, attempt: u32) -> Result<LiveSession>;
}

#[async_trait]
impl LoginFlow for Authenticator {
    async fn login(&self, attempt: u32) -> Result<LiveSession> {
        self.login_attempt(attempt).await
    }
}

/// Tells the proxy that the Credential Store has new contents.
#[async_trait]
pub trait ReloadNotifier: Send + Sync {
    async fn notify_reload(&self) -> Result<()>;
}

/// Shared notifier for use across async contexts.
pub type SharedReloadNotifier = Arc<dyn ReloadNotifier>;

/// Posts to a running proxy's `/reload` endpoint.
#[derive(Debug, Clone)]
pub struct HttpReloadNotifier {
    http: reqwest::Client,
    url: String,
}

impl HttpReloadNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AuthError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReloadNotifier for HttpReloadNotifier {
    async fn notify_reload(&self) -> Result<()> {
        let response = self.http.post(&self.url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Network(format!(
                "reload returned {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Interval and retry budget.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub interval: Duration,
    pub retry: RetryPolicy,
}

impl SupervisorSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            interval: config.interval(),
            retry: RetryPolicy::new(config.max_retries, config.retry_delay()),
        }
    }
}

/// What one refresh cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A login run succeeded and the session was persisted.
    Refreshed { attempts: u32, elapsed: Duration },
    /// Every run failed; waiting for the next interval.
    GaveUp { attempts: u32, last_error: String },
    /// Another cycle was already running.
    Skipped,
}

/// Runs login cycles and publishes their results.
pub struct Supervisor {
    flow: Arc<dyn LoginFlow>,
    materializer: SessionMaterializer,
    store: CredentialStore,
    notifier: Option<SharedReloadNotifier>,
    settings: SupervisorSettings,
    in_progress: AtomicBool,
    cycles: AtomicU64,
}

impl Supervisor {
    pub fn new(
        flow: Arc<dyn LoginFlow>,
        materializer: SessionMaterializer,
        store: CredentialStore,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            flow,
            materializer,
            store,
            notifier: None,
            settings,
            in_progress: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
        }
    }

    /// Notify `notifier` after every successful refresh.
    pub fn with_notifier(mut self, notifier: SharedReloadNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Whether a cycle is running right now.
    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Number of cycles started (skipped ones excluded).
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Run one refresh cycle unless one is already in progress.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("Refresh already in progress, skipping");
            return CycleOutcome::Skipped;
        }
        let _guard = InProgress(&self.in_progress);

        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        tracing::info!(
            cycle,
            max_attempts = self.settings.retry.attempts(),
            "Session refresh started"
        );

        let result = retry_fixed(self.settings.retry, "login", |attempt| async move {
            self.attempt(attempt).await.map(|_| attempt)
        })
        .await;

        match result {
            Ok(attempts) => {
                let elapsed = started.elapsed();
                tracing::info!(
                    cycle,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Session refreshed"
                );
                CycleOutcome::Refreshed { attempts, elapsed }
            }
            Err(exhausted) => {
                tracing::error!(
                    cycle,
                    attempts = exhausted.attempts,
                    next_in_secs = self.settings.interval.as_secs(),
                    "Giving up until the next scheduled refresh"
                );
                CycleOutcome::GaveUp {
                    attempts: exhausted.attempts,
                    last_error: exhausted.last_error.to_string(),
                }
            }
        }
    }

    async fn attempt(&self, attempt: u32) -> Result<()> {
        let live = self.flow.login(attempt).await?;
        self.materializer.persist(&live, &self.store)?;

        // The store is already updated; the proxy's watcher picks it up even
        // if this signal is lost.
        if let Some(notifier) = &self.notifier
            && let Err(e) = notifier.notify_reload().await
        {
            tracing::warn!(error = %e, "Reload signal failed");
        }
        Ok(())
    }

    /// Cycle now, then once per interval until `shutdown` resolves.
    ///
    /// A cycle in progress finishes before shutdown is observed.
    pub async fn run<S>(&self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let interval = if self.settings.interval.is_zero() {
            let fallback = SchedulerConfig::default().interval();
            tracing::warn!(
                fallback_secs = fallback.as_secs(),
                "Zero supervisor interval, using the default"
            );
            fallback
        } else {
            self.settings.interval
        };

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            interval_secs = interval.as_secs(),
            "Supervisor started"
        );
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }
        tracing::info!("Supervisor stopped");
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("store", &self.store.path())
            .field("settings", &self.settings)
            .field("in_progress", &self.is_running())
            .finish_non_exhaustive()
    }
}

struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookies::StoredCookie;
    use crate::session::SessionSettings;
    use std::sync::atomic::AtomicU32;
    use tempfile::tempdir;

    fn materializer() -> SessionMaterializer {
        SessionMaterializer::new(SessionSettings {
            base_url: "https://www.klaviyo.com".to_string(),
            user_agent: "test".to_string(),
            cookie_domains: Vec::new(),
            timeout: Duration::from_secs(30),
            max_redirects: 5,
        })
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            interval: Duration::from_secs(23 * 3600),
            retry: RetryPolicy::new(30, Duration::from_secs(60)),
        }
    }

    /// Fails the first `failures` runs, then succeeds.
    struct StubFlow {
        calls: AtomicU32,
        failures: u32,
        run_time: Duration,
    }

    impl StubFlow {
        fn failing_forever() -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures: u32::MAX,
                run_time: Duration::ZERO,
            }
        }

        fn failing(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                run_time: Duration::ZERO,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LoginFlow for StubFlow {
        async fn login(&self, _attempt: u32) -> Result<LiveSession> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.run_time.is_zero() {
                tokio::time::sleep(self.run_time).await;
            }
            if n <= self.failures {
                return Err(AuthError::CaptchaSolveFailed("stub".to_string()));
            }
            let live = materializer().fresh()?;
            live.jar()
                .insert(StoredCookie::new("kl_csrftoken", "abc", "www.klaviyo.com"));
            Ok(live)
        }
    }

    #[derive(Default)]
    struct CountingNotifier(AtomicU32);

    #[async_trait]
    impl ReloadNotifier for CountingNotifier {
        async fn notify_reload(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_thirty_retries() {
        let temp = tempdir().unwrap();
        let flow = Arc::new(StubFlow::failing_forever());
        let supervisor = Supervisor::new(
            flow.clone(),
            materializer(),
            CredentialStore::new(temp.path().join("session.json")),
            settings(),
        );

        let started = Instant::now();
        let outcome = supervisor.run_cycle().await;

        assert!(matches!(outcome, CycleOutcome::GaveUp { attempts: 31, .. }));
        assert_eq!(flow.calls(), 31);
        assert_eq!(started.elapsed(), Duration::from_secs(30 * 60));
        assert!(!supervisor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_next_interval_after_giving_up() {
        let temp = tempdir().unwrap();
        let flow = Arc::new(StubFlow::failing_forever());
        let supervisor = Supervisor::new(
            flow.clone(),
            materializer(),
            CredentialStore::new(temp.path().join("session.json")),
            settings(),
        );

        // Before the second interval: only the first cycle ran.
        supervisor
            .run(tokio::time::sleep(Duration::from_secs(22 * 3600)))
            .await;
        assert_eq!(flow.calls(), 31);
        assert_eq!(supervisor.cycles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_cycle_on_interval() {
        let temp = tempdir().unwrap();
        let flow = Arc::new(StubFlow::failing_forever());
        let supervisor = Supervisor::new(
            flow.clone(),
            materializer(),
            CredentialStore::new(temp.path().join("session.json")),
            settings(),
        );

        supervisor
            .run(tokio::time::sleep(Duration::from_secs(23 * 3600 + 1)))
            .await;
        assert_eq!(flow.calls(), 62);
        assert_eq!(supervisor.cycles(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_persists_and_notifies() {
        let temp = tempdir().unwrap();
        let store = CredentialStore::new(temp.path().join("session.json"));
        let flow = Arc::new(StubFlow::failing(2));
        let notifier = Arc::new(CountingNotifier::default());
        let supervisor = Supervisor::new(flow.clone(), materializer(), store.clone(), settings())
            .with_notifier(notifier.clone());

        let outcome = supervisor.run_cycle().await;

        assert_eq!(
            outcome,
            CycleOutcome::Refreshed {
                attempts: 3,
                elapsed: Duration::from_secs(120)
            }
        );
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
        let state = store.load().unwrap();
        assert_eq!(state.cookies.len(), 1);
        assert_eq!(state.cookies[0].key, "kl_csrftoken");
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_cycle_is_skipped() {
        let temp = tempdir().unwrap();
        let flow = Arc::new(StubFlow {
            calls: AtomicU32::new(0),
            failures: 0,
            run_time: Duration::from_secs(10),
        });
        let supervisor = Supervisor::new(
            flow.clone(),
            materializer(),
            CredentialStore::new(temp.path().join("session.json")),
            settings(),
        );

        let (a, b) = tokio::join!(supervisor.run_cycle(), supervisor.run_cycle());

        assert!(matches!(a, CycleOutcome::Refreshed { attempts: 1, .. }));
        assert_eq!(b, CycleOutcome::Skipped);
        assert_eq!(flow.calls(), 1);
        assert!(!supervisor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_uses_default_period() {
        let temp = tempdir().unwrap();
        let flow = Arc::new(StubFlow::failing_forever());
        let supervisor = Supervisor::new(
            flow.clone(),
            materializer(),
            CredentialStore::new(temp.path().join("session.json")),
            SupervisorSettings {
                interval: Duration::ZERO,
                retry: RetryPolicy::new(0, Duration::ZERO),
            },
        );

        supervisor
            .run(tokio::time::sleep(Duration::from_secs(3600)))
            .await;
        assert_eq!(flow.calls(), 1);
        assert_eq!(supervisor.cycles(), 1);
    }
}
