//! Background flush of the metric sink to an external backend.
//!
//! The reporter moves through `Idle -> Running -> Stopped`. `Stopped` is
//! terminal: the backend is released on stop and cannot be restarted.
//!
//! Ticks are serialized: a single task awaits each flush before polling
//! the timer again, so backend calls never overlap. Ticks stay aligned to
//! `start + k * interval`. When ticks come due while a flush is in flight,
//! one flush runs as soon as it finishes and the other missed ticks are
//! dropped.

pub mod backend;

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{FlushMode, StageConfig, TimeUnit, MAX_REPORT_FREQUENCY};
use crate::error::{BackendError, ReporterError};
use crate::metrics::{MetricSnapshot, PercentileSet, SinkView};

pub use backend::{LogBackend, MetricDatum, MetricsBackend};

/// Longest accepted report interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(MAX_REPORT_FREQUENCY * 60);

/// Everything a flush needs besides the sink and backend.
#[derive(Debug, Clone)]
pub struct ReporterSettings {
    pub namespace: String,
    pub unit: TimeUnit,
    pub mode: FlushMode,
    /// Upper bound on each backend call, including the final one.
    pub flush_timeout: Duration,
}

impl ReporterSettings {
    pub fn from_config(config: &StageConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            unit: config.time_unit,
            mode: config.flush_mode,
            flush_timeout: config.flush_timeout,
        }
    }
}

enum State {
    Idle {
        view: SinkView,
        backend: Box<dyn MetricsBackend>,
    },
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
    Stopped,
}

pub struct PeriodicReporter {
    settings: ReporterSettings,
    state: State,
}

impl PeriodicReporter {
    pub fn new(
        settings: ReporterSettings,
        view: SinkView,
        backend: Box<dyn MetricsBackend>,
    ) -> Self {
        Self {
            settings,
            state: State::Idle { view, backend },
        }
    }

    pub const fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Schedules a flush every `interval`. The first flush happens one full
    /// interval after this call.
    ///
    /// # Errors
    ///
    /// Fails when already running, when previously stopped, when `interval`
    /// is zero or longer than [`MAX_INTERVAL`], or when called outside a
    /// Tokio runtime.
    pub fn start(&mut self, interval: Duration) -> Result<(), ReporterError> {
        if interval.is_zero() {
            return Err(ReporterError::ZeroInterval);
        }
        if interval > MAX_INTERVAL {
            return Err(ReporterError::IntervalTooLong { interval });
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ReporterError::NoRuntime)?;

        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Idle { view, backend } => {
                let cancel = CancellationToken::new();
                let flusher = Flusher {
                    view,
                    backend,
                    settings: self.settings.clone(),
                };
                let handle = runtime.spawn(run(flusher, interval, cancel.clone()));

                info!(
                    namespace = %self.settings.namespace,
                    interval_secs = interval.as_secs(),
                    "reporter started"
                );
                self.state = State::Running { cancel, handle };
                Ok(())
            }
            running @ State::Running { .. } => {
                self.state = running;
                Err(ReporterError::AlreadyRunning)
            }
            State::Stopped => Err(ReporterError::Stopped),
        }
    }

    /// Cancels the schedule, performs one final flush bounded by the flush
    /// timeout, and releases the backend. Safe to call more than once.
    pub async fn stop(&mut self) {
        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Running { cancel, handle } => {
                cancel.cancel();
                if let Err(err) = handle.await {
                    error!(error = %err, "reporter task ended abnormally");
                }
                info!("reporter stopped");
            }
            State::Idle { .. } => debug!("reporter stopped before it was started"),
            State::Stopped => {}
        }
    }
}

impl Drop for PeriodicReporter {
    fn drop(&mut self) {
        // Lets a detached task run its final flush and exit.
        if let State::Running { cancel, .. } = &self.state {
            cancel.cancel();
        }
    }
}

// ─── Background task ─────────────────────────────────────────────

async fn run(flusher: Flusher, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => flusher.flush().await,
        }
    }

    flusher.flush().await;
}

struct Flusher {
    view: SinkView,
    backend: Box<dyn MetricsBackend>,
    settings: ReporterSettings,
}

impl Flusher {
    async fn flush(&self) {
        match self.settings.mode {
            FlushMode::Cumulative => {
                let data = self.datums(self.view.snapshot());
                if let Err(err) = self.publish(&data).await {
                    warn!(error = %err, "metric flush failed, retrying on next tick");
                }
            }
            FlushMode::Delta => {
                let drained = self.view.drain();
                let snapshots = drained
                    .iter()
                    .map(|(name, hist)| MetricSnapshot {
                        name: name.clone(),
                        stats: PercentileSet::from_histogram(hist),
                    })
                    .collect();
                let data = self.datums(snapshots);

                if let Err(err) = self.publish(&data).await {
                    warn!(error = %err, "metric flush failed, retrying on next tick");
                    if let Err(err) = self.view.restore(drained) {
                        error!(error = %err, "cannot restore unflushed aggregates");
                    }
                }
            }
        }
    }

    fn datums(&self, snapshots: Vec<MetricSnapshot>) -> Vec<MetricDatum> {
        let timestamp = Utc::now();
        snapshots
            .into_iter()
            .filter(|snapshot| snapshot.stats.has_data())
            .map(|snapshot| MetricDatum {
                name: snapshot.name,
                unit: self.settings.unit.backend_unit(),
                timestamp,
                stats: snapshot.stats,
            })
            .collect()
    }

    async fn publish(&self, data: &[MetricDatum]) -> Result<(), BackendError> {
        if data.is_empty() {
            debug!("no samples since start, skipping flush");
            return Ok(());
        }

        let timeout = self.settings.flush_timeout;
        let put = self
            .backend
            .put_metric_data(&self.settings.namespace, data);

        match tokio::time::timeout(timeout, put).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BackendError::Unavailable {
                    message: format!("no response within {}s", timeout.as_secs()),
                })
            }
        }

        debug!(
            namespace = %self.settings.namespace,
            metrics = data.len(),
            "metrics flushed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricSink;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const NAME: &str = "Lag Topology=t Region=r";
    const MINUTE: Duration = Duration::from_secs(60);

    /// Records every call; fails the first `failures` of them.
    #[derive(Clone, Default)]
    struct RecordingBackend {
        attempts: Arc<AtomicUsize>,
        published: Arc<Mutex<Vec<Vec<MetricDatum>>>>,
        failures: usize,
    }

    #[async_trait]
    impl MetricsBackend for RecordingBackend {
        async fn put_metric_data(
            &self,
            _namespace: &str,
            data: &[MetricDatum],
        ) -> Result<(), BackendError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(BackendError::Unavailable {
                    message: "connection refused".into(),
                });
            }
            self.published.lock().push(data.to_vec());
            Ok(())
        }
    }

    /// Takes `delay` per call and tracks how many calls overlap.
    #[derive(Clone)]
    struct SlowBackend {
        delay: Duration,
        calls: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl SlowBackend {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                calls: Arc::default(),
                in_flight: Arc::default(),
                peak: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl MetricsBackend for SlowBackend {
        async fn put_metric_data(
            &self,
            _namespace: &str,
            _data: &[MetricDatum],
        ) -> Result<(), BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct HangingBackend;

    #[async_trait]
    impl MetricsBackend for HangingBackend {
        async fn put_metric_data(
            &self,
            _namespace: &str,
            _data: &[MetricDatum],
        ) -> Result<(), BackendError> {
            std::future::pending().await
        }
    }

    fn settings(mode: FlushMode) -> ReporterSettings {
        ReporterSettings {
            namespace: "Tests".into(),
            unit: TimeUnit::Seconds,
            mode,
            flush_timeout: Duration::from_secs(10),
        }
    }

    fn reporter(
        sink: &Arc<MetricSink>,
        mode: FlushMode,
        backend: impl MetricsBackend + 'static,
    ) -> PeriodicReporter {
        PeriodicReporter::new(settings(mode), sink.view(), Box::new(backend))
    }

    #[tokio::test(start_paused = true)]
    async fn first_flush_waits_one_interval() {
        let sink = Arc::new(MetricSink::new());
        sink.observe(NAME, 5).unwrap();
        let backend = RecordingBackend::default();
        let published = backend.published.clone();

        let mut reporter = reporter(&sink, FlushMode::Cumulative, backend);
        reporter.start(MINUTE).unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(published.lock().len(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(published.lock().len(), 1);

        tokio::time::sleep(MINUTE).await;
        assert_eq!(published.lock().len(), 2);

        let batches = published.lock();
        let datum = &batches[1][0];
        assert_eq!(datum.name, NAME);
        assert_eq!(datum.unit, "Seconds");
        assert_eq!(datum.stats.count, 1);
        assert_eq!(datum.stats.max, 5);
        drop(batches);

        reporter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_once_more() {
        let sink = Arc::new(MetricSink::new());
        sink.observe(NAME, 1).unwrap();
        let backend = RecordingBackend::default();
        let published = backend.published.clone();

        let mut reporter = reporter(&sink, FlushMode::Cumulative, backend);
        reporter.start(MINUTE).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        reporter.stop().await;
        assert_eq!(published.lock().len(), 1);
        assert!(!reporter.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_does_not_stop_schedule() {
        let sink = Arc::new(MetricSink::new());
        sink.observe(NAME, 1).unwrap();
        let backend = RecordingBackend {
            failures: 1,
            ..RecordingBackend::default()
        };
        let attempts = backend.attempts.clone();
        let published = backend.published.clone();

        let mut reporter = reporter(&sink, FlushMode::Cumulative, backend);
        reporter.start(MINUTE).unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(published.lock().len(), 0);

        tokio::time::sleep(MINUTE).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(published.lock().len(), 1);

        reporter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn delta_mode_carries_failed_interval_forward() {
        let sink = Arc::new(MetricSink::new());
        sink.observe(NAME, 5).unwrap();
        let backend = RecordingBackend {
            failures: 1,
            ..RecordingBackend::default()
        };
        let published = backend.published.clone();

        let mut reporter = reporter(&sink, FlushMode::Delta, backend);
        reporter.start(MINUTE).unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        sink.observe(NAME, 7).unwrap();

        tokio::time::sleep(MINUTE).await;
        {
            let batches = published.lock();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0][0].stats.count, 2);
            assert_eq!(batches[0][0].stats.sum, 12);
        }
        assert!(sink.get(NAME).is_none());

        // nothing observed since the last drain
        tokio::time::sleep(MINUTE).await;
        assert_eq!(published.lock().len(), 1);

        reporter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_sink_publishes_nothing() {
        let sink = Arc::new(MetricSink::new());
        let backend = RecordingBackend::default();
        let attempts = backend.attempts.clone();

        let mut reporter = reporter(&sink, FlushMode::Cumulative, backend);
        reporter.start(MINUTE).unwrap();
        tokio::time::sleep(Duration::from_secs(121)).await;
        reporter.stop().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_flushes_never_overlap() {
        let sink = Arc::new(MetricSink::new());
        sink.observe(NAME, 1).unwrap();
        let backend = SlowBackend::new(Duration::from_secs(90));
        let (calls, peak) = (backend.calls.clone(), backend.peak.clone());

        let settings = ReporterSettings {
            flush_timeout: Duration::from_secs(200),
            ..settings(FlushMode::Cumulative)
        };
        let mut reporter = PeriodicReporter::new(settings, sink.view(), Box::new(backend));
        reporter.start(MINUTE).unwrap();

        // calls start at 60s, 150s (the tick due at 120s), 240s (due at 180s)
        let schedule = [(61, 1), (140, 1), (160, 2), (230, 2), (250, 3)];
        let mut now = 0;
        for (at, expected) in schedule {
            tokio::time::sleep(Duration::from_secs(at - now)).await;
            now = at;
            assert_eq!(calls.load(Ordering::SeqCst), expected, "at {at}s");
        }

        // waits out the call in flight, then flushes once more
        reporter.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_bounded_when_backend_hangs() {
        let sink = Arc::new(MetricSink::new());
        sink.observe(NAME, 1).unwrap();

        let mut reporter = reporter(&sink, FlushMode::Cumulative, HangingBackend);
        reporter.start(MINUTE).unwrap();

        let began = Instant::now();
        reporter.stop().await;
        assert!(began.elapsed() <= Duration::from_secs(11));
    }

    #[tokio::test]
    async fn lifecycle_is_not_resumable() {
        let sink = Arc::new(MetricSink::new());
        let mut reporter = reporter(&sink, FlushMode::Cumulative, RecordingBackend::default());

        assert!(matches!(
            reporter.start(Duration::ZERO),
            Err(ReporterError::ZeroInterval)
        ));
        assert!(matches!(
            reporter.start(MAX_INTERVAL + Duration::from_secs(1)),
            Err(ReporterError::IntervalTooLong { .. })
        ));
        reporter.start(MINUTE).unwrap();
        assert!(reporter.is_running());
        assert!(matches!(
            reporter.start(MINUTE),
            Err(ReporterError::AlreadyRunning)
        ));

        reporter.stop().await;
        reporter.stop().await;
        assert!(matches!(
            reporter.start(MINUTE),
            Err(ReporterError::Stopped)
        ));
    }

    #[test]
    fn start_requires_runtime() {
        let sink = Arc::new(MetricSink::new());
        let mut reporter = reporter(&sink, FlushMode::Cumulative, RecordingBackend::default());
        assert!(matches!(
            reporter.start(MINUTE),
            Err(ReporterError::NoRuntime)
        ));
    }
}
