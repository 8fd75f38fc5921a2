//! ## streamtap-engine::monitor
//! **Capture-to-message loop**
//!
//! A single worker thread (`streamtap-monitor`) owns the connection tracker,
//! every pipeline and the capture socket. Each cycle it refreshes the
//! target's connections, rebinds the capture socket when the monitored local
//! address changes, drains captured frames through both pipelines of every
//! connection and publishes the reassembled stream bytes and decoded
//! messages.
//!
//! Any error inside the cycle ends the loop after a full cleanup; the error
//! is kept for [`NetworkMonitor::last_error`] and the state returns to
//! [`MonitorState::Idle`]. The monitor never restarts itself.
//!
//! Every run carries a generation number. A worker abandoned by
//! [`NetworkMonitor::stop`] may still finish later; it only reports into the
//! shared state while its generation is the current one.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use streamtap_capture::{open_capture, CaptureSocket};
use streamtap_codec::Transport;
use streamtap_config::StreamtapConfig;
use streamtap_core::events::{
    ConnectionEvent, Direction, MessageEvent, StreamEvent, SubscriberList, SubscriptionId,
};
use streamtap_core::time::{EpochClock, SystemClock};
use streamtap_protocols::BundleFormat;
use streamtap_telemetry::MetricsRecorder;
use tracing::{debug, error, info, warn};

use crate::connections::{ConnectionProvider, ConnectionTracker, TrackedConnection};
use crate::discovery::{ProcNetProvider, Target};
use crate::error::MonitorError;
use crate::pipeline::{PipelineFactory, PipelineOutput};
use crate::settings::{self, MonitorSettings};

const THREAD_NAME: &str = "streamtap-monitor";
/// Upper bound on one uninterrupted sleep so cancellation is noticed quickly.
const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Creates an unstarted capture socket for each (re)bind.
pub type SocketFactory = Arc<dyn Fn() -> Box<dyn CaptureSocket> + Send + Sync>;
/// Creates the connection provider used by one run of the worker.
pub type ProviderFactory = Arc<dyn Fn() -> Box<dyn ConnectionProvider> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Stopping,
}

struct Worker {
    handle: JoinHandle<()>,
    cancel: Arc<AtomicBool>,
    exited: Receiver<()>,
}

/// Everything a running worker shares with the facade.
#[derive(Clone)]
struct Shared {
    state: Arc<Mutex<MonitorState>>,
    /// Bumped under the state lock by every `start`.
    generation: Arc<AtomicU64>,
    last_error: Arc<Mutex<Option<Arc<MonitorError>>>>,
    messages: Arc<SubscriberList<MessageEvent>>,
    streams: Arc<SubscriberList<StreamEvent>>,
    metrics: Option<MetricsRecorder>,
}

pub struct NetworkMonitor {
    settings: MonitorSettings,
    pipelines: PipelineFactory,
    sockets: SocketFactory,
    provider: Option<ProviderFactory>,
    clock: Arc<dyn EpochClock>,
    shared: Shared,
    worker: Mutex<Option<Worker>>,
}

impl NetworkMonitor {
    pub fn new(settings: MonitorSettings, pipelines: PipelineFactory, sockets: SocketFactory) -> Self {
        Self {
            settings,
            pipelines,
            sockets,
            provider: None,
            clock: Arc::new(SystemClock),
            shared: Shared {
                state: Arc::new(Mutex::new(MonitorState::Idle)),
                generation: Arc::new(AtomicU64::new(0)),
                last_error: Arc::new(Mutex::new(None)),
                messages: Arc::new(SubscriberList::new()),
                streams: Arc::new(SubscriberList::new()),
                metrics: None,
            },
            worker: Mutex::new(None),
        }
    }

    /// Wires a monitor from loaded configuration: `/proc` discovery for the
    /// configured target, the configured capture backend, framing layout and
    /// codec. A missing target is only reported by [`start`](Self::start).
    pub fn from_config(config: &StreamtapConfig) -> Result<Self, MonitorError> {
        let format = Arc::new(BundleFormat::new(settings::bundle_layout(&config.framing)?)?);
        let selector = Arc::new(Mutex::new(settings::codec_selector(&config.codec)?));
        let pipelines = PipelineFactory::new(
            format,
            Arc::new(move || selector.lock().create(Transport::Tcp)),
            settings::tcp_limits(&config.reassembly),
        );

        let backend = settings::capture_backend(&config.capture);
        let options = settings::capture_options(&config.capture);
        let clock: Arc<dyn EpochClock> = Arc::new(SystemClock);
        let capture_clock = Arc::clone(&clock);
        let sockets: SocketFactory =
            Arc::new(move || open_capture(backend, options.clone(), Arc::clone(&capture_clock)));

        let mut monitor = Self::new(
            MonitorSettings::from_config(&config.monitor, config.target.local_ip),
            pipelines,
            sockets,
        )
        .with_clock(clock);
        if let Some(target) = settings::target(&config.target) {
            monitor = monitor.with_target(target);
        }
        Ok(monitor)
    }

    /// Discovers connections of `target` through `/proc`.
    pub fn with_target(self, target: Target) -> Self {
        self.with_provider(Arc::new(move || {
            Box::new(ProcNetProvider::new(target.clone())) as Box<dyn ConnectionProvider>
        }))
    }

    pub fn with_provider(mut self, provider: ProviderFactory) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsRecorder) -> Self {
        self.shared.metrics = Some(metrics);
        self
    }

    /// Clock that decides when a stream without SYN has waited long enough
    /// for its anchor. Must match the clock stamping captured frames.
    pub fn with_clock(mut self, clock: Arc<dyn EpochClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> MonitorState {
        *self.shared.state.lock()
    }

    /// Error that ended the most recent run, if any.
    pub fn last_error(&self) -> Option<Arc<MonitorError>> {
        self.shared.last_error.lock().clone()
    }

    pub fn on_message_sent<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        subscribe(&self.shared.messages, Direction::Sent, callback)
    }

    pub fn on_message_received<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        subscribe(&self.shared.messages, Direction::Received, callback)
    }

    /// Raw reassembled bytes the monitored process sent, before framing.
    pub fn on_stream_sent<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        subscribe(&self.shared.streams, Direction::Sent, callback)
    }

    /// Raw reassembled bytes the monitored process received, before framing.
    pub fn on_stream_received<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        subscribe(&self.shared.streams, Direction::Received, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.messages.unsubscribe(id) || self.shared.streams.unsubscribe(id)
    }

    pub fn start(&self) -> Result<(), MonitorError> {
        let mut worker = self.worker.lock();
        {
            let state = self.shared.state.lock();
            if *state != MonitorState::Idle {
                return Err(MonitorError::AlreadyRunning);
            }
        }
        // A previous run that ended on its own still has to be joined.
        if let Some(finished) = worker.take() {
            join_worker(finished, self.settings.stop_timeout);
        }

        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| MonitorError::Config("no target or connection provider configured".into()))?;

        let generation = {
            let mut state = self.shared.state.lock();
            let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
            *self.shared.last_error.lock() = None;
            *state = MonitorState::Running;
            generation
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let (exit_tx, exited) = channel::bounded(1);
        let context = LoopContext {
            settings: self.settings.clone(),
            tracker: ConnectionTracker::new(self.pipelines.clone(), self.settings.local_ip),
            provider: provider(),
            sockets: Arc::clone(&self.sockets),
            socket: None,
            clock: Arc::clone(&self.clock),
            cancel: Arc::clone(&cancel),
            generation,
            shared: self.shared.clone(),
        };

        let spawned = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || {
                context.run();
                let _ = exit_tx.send(());
            });

        match spawned {
            Ok(handle) => {
                info!("Network monitor started");
                *worker = Some(Worker {
                    handle,
                    cancel,
                    exited,
                });
                Ok(())
            }
            Err(e) => {
                *self.shared.state.lock() = MonitorState::Idle;
                Err(MonitorError::Spawn(e))
            }
        }
    }

    /// Cancels the worker and waits up to the stop timeout for it to exit.
    /// A worker that does not exit in time is abandoned. Idempotent.
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        {
            let mut state = self.shared.state.lock();
            if *state == MonitorState::Running {
                *state = MonitorState::Stopping;
            }
        }
        worker.cancel.store(true, Ordering::Release);
        join_worker(worker, self.settings.stop_timeout);
        *self.shared.state.lock() = MonitorState::Idle;
        info!("Network monitor stopped");
    }
}

fn join_worker(worker: Worker, timeout: Duration) {
    worker.cancel.store(true, Ordering::Release);
    match worker.exited.recv_timeout(timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if worker.handle.join().is_err() {
                error!("Monitor thread panicked");
            }
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Monitor thread did not exit in time; abandoning it"
            );
        }
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("state", &self.state())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// State owned by the worker thread.
struct LoopContext {
    settings: MonitorSettings,
    tracker: ConnectionTracker,
    provider: Box<dyn ConnectionProvider>,
    sockets: SocketFactory,
    socket: Option<Box<dyn CaptureSocket>>,
    clock: Arc<dyn EpochClock>,
    cancel: Arc<AtomicBool>,
    generation: u64,
    shared: Shared,
}

impl LoopContext {
    fn run(mut self) {
        let result = self.run_cycles();
        self.cleanup();

        let mut state = self.shared.state.lock();
        if self.shared.generation.load(Ordering::Acquire) != self.generation {
            if let Err(e) = result {
                warn!(error = %e, generation = self.generation, "Abandoned monitor loop failed");
            }
            debug!(generation = self.generation, "Abandoned monitor loop exited");
            return;
        }
        if let Err(e) = result {
            error!(error = %e, "Network monitor loop failed");
            *self.shared.last_error.lock() = Some(Arc::new(e));
        }
        *state = MonitorState::Idle;
        debug!("Monitor loop exited");
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn run_cycles(&mut self) -> Result<(), MonitorError> {
        while !self.cancelled() {
            let outcome = self.tracker.refresh(self.provider.as_mut())?;
            if self.cancelled() {
                break;
            }
            if let Some(metrics) = &self.shared.metrics {
                metrics.tracked_connections.set(outcome.active as i64);
            }

            let Some(local) = outcome.local_addr else {
                self.release_socket();
                self.pause(self.settings.idle_poll);
                continue;
            };

            if outcome.address_changed || self.socket.is_none() {
                self.rebind(local)?;
            }

            self.drain()?;
            self.pause(self.settings.cycle_sleep);
        }
        Ok(())
    }

    /// Stops the previous socket before the replacement is created.
    fn rebind(&mut self, local: std::net::Ipv4Addr) -> Result<(), MonitorError> {
        self.release_socket();
        let mut socket = (self.sockets)();
        socket.start(local, None)?;
        info!(%local, "Capture socket bound");
        if let Some(metrics) = &self.shared.metrics {
            metrics.socket_rebinds.inc();
        }
        self.socket = Some(socket);
        Ok(())
    }

    fn drain(&mut self) -> Result<(), MonitorError> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(());
        };
        if !socket.is_healthy() {
            return Err(MonitorError::CaptureUnhealthy);
        }

        let mut sent = PipelineOutput::default();
        let mut received = PipelineOutput::default();
        while let Some(frame) = socket.poll_next() {
            if let Some(metrics) = &self.shared.metrics {
                metrics.frames_captured.inc();
            }
            for connection in self.tracker.connections_mut() {
                let dropped_before = dropped_frames(connection);
                connection.feed(frame.data(), frame.epoch(), &mut sent, &mut received);
                if let Some(metrics) = &self.shared.metrics {
                    metrics
                        .frames_dropped
                        .inc_by(dropped_frames(connection) - dropped_before);
                }
                publish(&self.shared, connection, Direction::Sent, &mut sent);
                publish(&self.shared, connection, Direction::Received, &mut received);
            }
            if self.cancel.load(Ordering::Acquire) {
                break;
            }
        }

        let now = self.clock.now_ms();
        for connection in self.tracker.connections_mut() {
            connection.poll(now, &mut sent, &mut received);
            publish(&self.shared, connection, Direction::Sent, &mut sent);
            publish(&self.shared, connection, Direction::Received, &mut received);
        }

        if let (Some(metrics), Some(pool)) = (&self.shared.metrics, socket.pool_stats()) {
            metrics.record_pool(pool.acquisitions, pool.releases, pool.grown, pool.waits);
        }
        Ok(())
    }

    fn release_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.stop();
        }
    }

    fn cleanup(&mut self) {
        self.release_socket();
        self.tracker.clear();
    }

    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(PAUSE_SLICE));
        }
    }
}

fn dropped_frames(connection: &TrackedConnection) -> u64 {
    connection.pipeline(Direction::Sent).decoder_stats().frames_dropped
        + connection.pipeline(Direction::Received).decoder_stats().frames_dropped
}

fn subscribe<E, F>(list: &SubscriberList<E>, direction: Direction, callback: F) -> SubscriptionId
where
    E: ConnectionEvent + 'static,
    F: Fn(&E) + Send + Sync + 'static,
{
    list.subscribe(move |event: &E| {
        if event.direction() == direction {
            callback(event)
        }
    })
}

/// Stream bytes go out before the messages decoded from them.
fn publish(
    shared: &Shared,
    connection: &TrackedConnection,
    direction: Direction,
    output: &mut PipelineOutput,
) {
    for chunk in output.stream.drain(..) {
        let event = StreamEvent::new(connection.id().clone(), direction, chunk.epoch, chunk.data);
        shared.streams.publish(&event);
    }
    for (epoch, payload) in output.messages.drain(..) {
        let event = MessageEvent::new(connection.id().clone(), direction, epoch, payload);
        shared.messages.publish(&event);
        if let Some(metrics) = &shared.metrics {
            metrics.inc_message(direction.as_str());
        }
    }
}
