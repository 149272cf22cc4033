//! Per-provider request queue with rolling-window rate limits and adaptive
//! throttling.
//!
//! Every provider call is routed through [`RateLimiter::enqueue`]. A call is
//! released only when it is at the head of its provider's queue, the
//! provider has a free concurrency slot, and fewer than the effective RPM
//! limit of requests started inside the rolling window. Calls that wait
//! longer than the queue timeout are rejected without running.
//!
//! Adaptive throttling watches recent outcomes per provider. A high error
//! rate (or an explicit `rate_limit` response) shrinks the effective limits
//! multiplicatively; a sustained healthy period grows them back towards the
//! configured caps.
//!
//! The limiter is an explicit object: construct it, call
//! [`RateLimiter::start`] to run the periodic maintenance task, and call
//! [`RateLimiter::destroy`] to stop it and reject pending work.

use crate::error::{ErrorKind, ProviderError, SyncError};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Ordering of tasks waiting in one provider's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueStrategy {
    /// Strict enqueue order; priorities are ignored
    #[default]
    Fifo,
    /// Highest priority first, ties broken by enqueue order
    Priority,
}

impl FromStr for QueueStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(QueueStrategy::Fifo),
            "priority" => Ok(QueueStrategy::Priority),
            other => anyhow::bail!("Unknown queue strategy: '{}'", other),
        }
    }
}

/// Configured caps for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderLimits {
    /// Requests allowed to start inside one rolling window
    pub rpm: u32,
    /// Requests allowed in flight at once
    pub concurrency: usize,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            rpm: 60,
            concurrency: 5,
        }
    }
}

/// Adaptive throttling thresholds.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    /// Error rate (0.0..=1.0) at which limits are reduced
    pub error_threshold: f64,
    /// Outcomes required before the error rate is trusted
    pub min_samples: usize,
    /// Number of recent outcomes kept per provider
    pub sample_size: usize,
    /// Multiplier applied to effective limits on reduction
    pub decrease_factor: f64,
    /// Fraction of the configured cap restored per recovery step
    pub increase_step: f64,
    /// Healthy time required after the last adjustment before growing limits
    pub recovery_period: Duration,
    /// Average response time above which a provider counts as degraded
    pub slow_response: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            error_threshold: 0.3,
            min_samples: 5,
            sample_size: 20,
            decrease_factor: 0.5,
            increase_step: 0.1,
            recovery_period: Duration::from_secs(30),
            slow_response: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub strategy: QueueStrategy,
    /// Longest a task may wait in a queue before being rejected
    pub queue_timeout: Duration,
    /// Length of the rolling window the RPM limit applies to
    pub window: Duration,
    /// Limits for providers without an explicit entry
    pub default_limits: ProviderLimits,
    pub providers: HashMap<String, ProviderLimits>,
    pub adaptive: AdaptiveConfig,
    /// Period of the maintenance task started by [`RateLimiter::start`]
    pub maintenance_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            strategy: QueueStrategy::Fifo,
            queue_timeout: Duration::from_secs(60),
            window: Duration::from_secs(60),
            default_limits: ProviderLimits::default(),
            providers: HashMap::new(),
            adaptive: AdaptiveConfig::default(),
            maintenance_interval: Duration::from_secs(5),
        }
    }
}

impl RateLimiterConfig {
    pub fn with_provider(mut self, name: impl Into<String>, limits: ProviderLimits) -> Self {
        self.providers.insert(name.into(), limits);
        self
    }

    pub fn limits_for(&self, provider: &str) -> ProviderLimits {
        self.providers
            .get(provider)
            .copied()
            .unwrap_or(self.default_limits)
    }

    /// Clamp every value into a usable range. Applied once by `RateLimiter::new`.
    fn normalized(mut self) -> Self {
        fn clamp_limits(limits: ProviderLimits) -> ProviderLimits {
            ProviderLimits {
                rpm: limits.rpm.max(1),
                concurrency: limits.concurrency.max(1),
            }
        }

        self.default_limits = clamp_limits(self.default_limits);
        for limits in self.providers.values_mut() {
            *limits = clamp_limits(*limits);
        }
        if self.window.is_zero() {
            self.window = Duration::from_millis(1);
        }
        if self.maintenance_interval.is_zero() {
            self.maintenance_interval = Duration::from_secs(1);
        }

        let adaptive = &mut self.adaptive;
        adaptive.error_threshold = adaptive.error_threshold.clamp(0.0, 1.0);
        adaptive.decrease_factor = adaptive.decrease_factor.clamp(0.05, 1.0);
        adaptive.increase_step = adaptive.increase_step.clamp(0.01, 1.0);
        adaptive.sample_size = adaptive.sample_size.max(1);
        adaptive.min_samples = adaptive.min_samples.clamp(1, adaptive.sample_size);
        self
    }
}

/// Snapshot of one provider's queue, as returned by [`RateLimiter::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub queue_size: usize,
    pub in_flight: usize,
    /// Requests started inside the current window
    pub usage: usize,
    pub rpm_limit: u32,
    pub effective_rpm: u32,
    pub concurrency_limit: usize,
    pub effective_concurrency: usize,
    /// Time until the oldest request leaves the window
    pub reset_in: Duration,
    pub error_rate: f64,
    pub avg_response_ms: f64,
    pub adjustments: u64,
}

/// Queue position: higher priority first, then lower sequence number.
type TicketKey = (Reverse<i32>, u64);

enum Release {
    Now,
    Closed,
    /// Blocked by the rolling window; re-check after this long
    After(Duration),
    /// Blocked by position or concurrency; wait for a wake-up
    OnWake,
}

struct ProviderQueue {
    limits: ProviderLimits,
    effective_rpm: u32,
    effective_concurrency: usize,
    waiting: BTreeSet<TicketKey>,
    in_flight: usize,
    window: VecDeque<Instant>,
    outcomes: VecDeque<(Instant, bool)>,
    avg_response_ms: f64,
    last_adjustment: Instant,
    adjustments: u64,
    notify: Arc<Notify>,
}

impl ProviderQueue {
    fn new(limits: ProviderLimits, now: Instant) -> Self {
        Self {
            limits,
            effective_rpm: limits.rpm,
            effective_concurrency: limits.concurrency,
            waiting: BTreeSet::new(),
            in_flight: 0,
            window: VecDeque::new(),
            outcomes: VecDeque::new(),
            avg_response_ms: 0.0,
            last_adjustment: now,
            adjustments: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.window.front() {
            if now.saturating_duration_since(*front) >= window {
                self.window.pop_front();
            } else {
                break;
            }
        }
        while let Some((at, _)) = self.outcomes.front() {
            if now.saturating_duration_since(*at) >= window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_release(&mut self, ticket: TicketKey, now: Instant, window: Duration) -> Release {
        if self.waiting.first() != Some(&ticket) {
            return Release::OnWake;
        }
        if self.in_flight >= self.effective_concurrency {
            return Release::OnWake;
        }
        if self.window.len() >= self.effective_rpm as usize {
            let reset_at = self.window.front().map(|t| *t + window).unwrap_or(now);
            let wait = reset_at.saturating_duration_since(now);
            return Release::After(wait.max(Duration::from_millis(1)));
        }

        self.waiting.remove(&ticket);
        self.in_flight += 1;
        self.window.push_back(now);
        // the next ticket may be releasable too
        self.notify.notify_waiters();
        Release::Now
    }

    fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn reset_in(&self, now: Instant, window: Duration) -> Duration {
        self.window
            .front()
            .map(|t| (*t + window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    fn decrease(&mut self, provider: &str, config: &AdaptiveConfig, now: Instant, reason: &str) {
        let rpm = ((self.effective_rpm as f64) * config.decrease_factor).floor() as u32;
        let concurrency =
            ((self.effective_concurrency as f64) * config.decrease_factor).floor() as usize;

        self.effective_rpm = rpm.max(1);
        self.effective_concurrency = concurrency.max(1);
        self.last_adjustment = now;
        self.adjustments += 1;
        self.outcomes.clear();

        warn!(
            provider = %provider,
            reason = %reason,
            effective_rpm = self.effective_rpm,
            effective_concurrency = self.effective_concurrency,
            "Throttling provider"
        );
    }

    fn increase(&mut self, provider: &str, config: &AdaptiveConfig, now: Instant) {
        let rpm_step = ((self.limits.rpm as f64) * config.increase_step).ceil().max(1.0) as u32;
        let concurrency_step =
            ((self.limits.concurrency as f64) * config.increase_step).ceil().max(1.0) as usize;

        self.effective_rpm = (self.effective_rpm + rpm_step).min(self.limits.rpm);
        self.effective_concurrency =
            (self.effective_concurrency + concurrency_step).min(self.limits.concurrency);
        self.last_adjustment = now;
        self.adjustments += 1;
        self.notify.notify_waiters();

        info!(
            provider = %provider,
            effective_rpm = self.effective_rpm,
            effective_concurrency = self.effective_concurrency,
            "Restoring provider limits"
        );
    }

    fn is_throttled(&self) -> bool {
        self.effective_rpm < self.limits.rpm || self.effective_concurrency < self.limits.concurrency
    }

    /// Apply the adaptive rules once.
    fn evaluate(&mut self, provider: &str, config: &AdaptiveConfig, now: Instant) {
        let error_rate = self.error_rate();
        let samples = self.outcomes.len();
        let slow = self.avg_response_ms > config.slow_response.as_millis() as f64;
        let since_adjustment = now.saturating_duration_since(self.last_adjustment);

        if samples >= config.min_samples && error_rate >= config.error_threshold {
            self.decrease(provider, config, now, "error_rate");
        } else if slow
            && samples >= config.min_samples
            && since_adjustment >= config.recovery_period
        {
            self.decrease(provider, config, now, "slow_responses");
        } else if self.is_throttled()
            && !slow
            && error_rate < config.error_threshold / 2.0
            && since_adjustment >= config.recovery_period
        {
            self.increase(provider, config, now);
        }
    }
}

struct LimiterState {
    queues: HashMap<String, ProviderQueue>,
    next_seq: u64,
    closed: bool,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Removes a ticket that never got released (timeout, close, or a dropped
/// caller future).
struct TicketGuard<'a> {
    limiter: &'a RateLimiter,
    provider: &'a str,
    ticket: TicketKey,
    armed: bool,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.limiter.lock_state();
        if let Some(queue) = state.queues.get_mut(self.provider) {
            if queue.waiting.remove(&self.ticket) {
                queue.notify.notify_waiters();
            }
        }
    }
}

/// Frees a concurrency slot when the task finishes or is dropped.
struct SlotGuard<'a> {
    limiter: &'a RateLimiter,
    provider: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.limiter.lock_state();
        if let Some(queue) = state.queues.get_mut(self.provider) {
            queue.in_flight = queue.in_flight.saturating_sub(1);
            queue.notify.notify_waiters();
        }
    }
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config: config.normalized(),
            state: Mutex::new(LimiterState {
                queues: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            maintenance: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the periodic maintenance task. No-op when adaptive throttling
    /// is disabled, the task is already running, or the limiter is closed.
    pub fn start(self: &Arc<Self>) {
        if !self.config.adaptive.enabled || self.lock_state().closed {
            return;
        }

        let mut maintenance = self.maintenance.lock().unwrap_or_else(PoisonError::into_inner);
        if maintenance.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.config.maintenance_interval;
        *maintenance = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                limiter.run_maintenance();
            }
        }));
        debug!(interval = ?period, "Rate limiter maintenance started");
    }

    /// Stop the maintenance task and reject all queued and future tasks.
    /// Safe to call more than once.
    pub fn destroy(&self) {
        if let Some(handle) = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let mut state = self.lock_state();
        if state.closed {
            return;
        }
        state.closed = true;
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
        info!("Rate limiter destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock_state().closed
    }

    /// Run `task` once the provider's limits allow it.
    ///
    /// `priority` only matters with [`QueueStrategy::Priority`]. The task's own
    /// error is returned as [`SyncError::Provider`]; it also feeds the adaptive
    /// throttling statistics for `provider`.
    pub async fn enqueue<T, F, Fut>(
        &self,
        provider: &str,
        priority: i32,
        task: F,
    ) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let enqueued_at = Instant::now();
        let deadline = enqueued_at + self.config.queue_timeout;

        let (ticket, notify) = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(SyncError::LimiterClosed {
                    provider: provider.to_string(),
                });
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let key_priority = match self.config.strategy {
                QueueStrategy::Fifo => 0,
                QueueStrategy::Priority => priority,
            };
            let ticket = (Reverse(key_priority), seq);

            let limits = self.config.limits_for(provider);
            let queue = state
                .queues
                .entry(provider.to_string())
                .or_insert_with(|| ProviderQueue::new(limits, enqueued_at));
            queue.waiting.insert(ticket);
            (ticket, Arc::clone(&queue.notify))
        };

        let mut guard = TicketGuard {
            limiter: self,
            provider,
            ticket,
            armed: true,
        };

        loop {
            // Registered before the check so a release between the check and
            // the await still wakes us.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let release = {
                let mut state = self.lock_state();
                let now = Instant::now();
                let window = self.config.window;
                if state.closed {
                    Release::Closed
                } else {
                    match state.queues.get_mut(provider) {
                        Some(queue) => {
                            queue.prune(now, window);
                            queue.try_release(ticket, now, window)
                        }
                        None => Release::OnWake,
                    }
                }
            };

            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            let wait = match release {
                Release::Now => break,
                Release::Closed => {
                    return Err(SyncError::LimiterClosed {
                        provider: provider.to_string(),
                    })
                }
                Release::After(wait) => wait.min(remaining),
                Release::OnWake => remaining,
            };

            if remaining.is_zero() {
                let waited = now.saturating_duration_since(enqueued_at);
                warn!(
                    provider = %provider,
                    waited = ?waited,
                    code = "queue_timeout",
                    "Queued task timed out"
                );
                return Err(SyncError::QueueTimeout {
                    provider: provider.to_string(),
                    waited,
                });
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        guard.armed = false;
        drop(guard);

        let _slot = SlotGuard {
            limiter: self,
            provider,
        };

        debug!(
            provider = %provider,
            queued_for = ?enqueued_at.elapsed(),
            "Releasing queued task"
        );

        let started = Instant::now();
        let result = task().await;
        self.record_outcome(provider, result.as_ref().err(), started.elapsed());

        result.map_err(SyncError::from)
    }

    fn record_outcome(&self, provider: &str, error: Option<&ProviderError>, elapsed: Duration) {
        let adaptive = &self.config.adaptive;
        let mut state = self.lock_state();
        let Some(queue) = state.queues.get_mut(provider) else {
            return;
        };

        let now = Instant::now();
        queue.outcomes.push_back((now, error.is_none()));
        while queue.outcomes.len() > adaptive.sample_size {
            queue.outcomes.pop_front();
        }

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        queue.avg_response_ms = if queue.avg_response_ms == 0.0 {
            elapsed_ms
        } else {
            queue.avg_response_ms * 0.8 + elapsed_ms * 0.2
        };

        if !adaptive.enabled {
            return;
        }

        match error {
            Some(e) if e.kind == ErrorKind::RateLimit => {
                queue.decrease(provider, adaptive, now, "rate_limit");
            }
            _ => queue.evaluate(provider, adaptive, now),
        }
    }

    /// One maintenance pass: age out old samples and apply adaptive rules.
    pub(crate) fn run_maintenance(&self) {
        let window = self.config.window;
        let adaptive = &self.config.adaptive;
        let mut state = self.lock_state();
        let now = Instant::now();

        for (name, queue) in state.queues.iter_mut() {
            queue.prune(now, window);
            if adaptive.enabled {
                queue.evaluate(name, adaptive, now);
            }
            // window-blocked waiters may be able to go now
            queue.notify.notify_waiters();
        }
    }

    /// Per-provider queue status.
    pub fn get_status(&self) -> BTreeMap<String, ProviderStatus> {
        let window = self.config.window;
        let mut state = self.lock_state();
        let now = Instant::now();

        state
            .queues
            .iter_mut()
            .map(|(name, queue)| {
                queue.prune(now, window);
                let status = ProviderStatus {
                    queue_size: queue.waiting.len(),
                    in_flight: queue.in_flight,
                    usage: queue.window.len(),
                    rpm_limit: queue.limits.rpm,
                    effective_rpm: queue.effective_rpm,
                    concurrency_limit: queue.limits.concurrency,
                    effective_concurrency: queue.effective_concurrency,
                    reset_in: queue.reset_in(now, window),
                    error_rate: queue.error_rate(),
                    avg_response_ms: queue.avg_response_ms,
                    adjustments: queue.adjustments,
                };
                (name.clone(), status)
            })
            .collect()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self
            .maintenance
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
