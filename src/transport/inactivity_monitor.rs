use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::command::{Command, CommandKind, HeartBeat};
use crate::config::TcpTransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::transport::filter::TransportFilter;
use crate::transport::{FutureResponse, Transport, TransportListener};

/// Applied to the negotiated read interval, but not to an explicit `readCheckTime`
const READ_GRACE_FACTOR: f64 = 1.5;

#[derive(Default)]
struct HandshakeState {
    local: Option<HeartBeat>,
    remote: Option<HeartBeat>,
}

/// Liveness checking for a single connection.
///
/// The monitor stays passive until both sides of the heart-beat handshake are known: the local
///  settings from the outgoing `ConnectionInfo`, the broker's from the inbound `Connected`.
///  After that a timer task wakes two check workers:
/// * the write check runs every half write interval, and sends a keep-alive if nothing was sent
///   since the previous check
/// * the read check runs every read interval, and reports [TransportError::Inactivity] if
///   nothing was received since the previous check
///
/// A read check that comes due before 90% of the read interval elapsed (e.g. because of timer
///  rounding) is skipped rather than evaluated early.
pub struct InactivityMonitor {
    myself: Weak<InactivityMonitor>,
    filter: TransportFilter,
    read_check_override: Duration,
    write_check_override: Duration,
    initial_delay: Duration,
    keep_alive_responses: bool,

    handshake: Mutex<HandshakeState>,
    /// serializes the check-and-start of the monitor; never held across I/O
    start_lock: Mutex<()>,
    monitor_started: AtomicBool,
    command_sent: AtomicBool,
    command_received: AtomicBool,
    failed: AtomicBool,
    last_read_check: Mutex<Instant>,
    cancel_sender: broadcast::Sender<()>,
}

impl InactivityMonitor {
    pub fn new(next: Arc<dyn Transport>, config: &TcpTransportConfig) -> Arc<InactivityMonitor> {
        let (cancel_sender, _) = broadcast::channel(1);
        Arc::new_cyclic(|myself| InactivityMonitor {
            myself: myself.clone(),
            filter: TransportFilter::new(next, myself.clone()),
            read_check_override: config.read_check_time,
            write_check_override: config.write_check_time,
            initial_delay: config.initial_delay_time,
            keep_alive_responses: config.keep_alive_responses,
            handshake: Default::default(),
            start_lock: Default::default(),
            monitor_started: AtomicBool::new(false),
            command_sent: AtomicBool::new(false),
            command_received: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            last_read_check: Mutex::new(Instant::now()),
            cancel_sender,
        })
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor_started.load(Ordering::Acquire)
    }

    fn remote(&self) -> String {
        self.filter.next().remote_address().unwrap_or_default()
    }

    /// Returns the effective (write, read) check intervals once the handshake is complete
    fn check_intervals(&self) -> Option<(Duration, Duration)> {
        let handshake = self.handshake.lock().unwrap_or_else(PoisonError::into_inner);
        let (write, read) = HeartBeat::negotiate(handshake.local?, handshake.remote?);

        let write = if self.write_check_override.is_zero() { write } else { self.write_check_override };
        let read = if self.read_check_override.is_zero() { read.mul_f64(READ_GRACE_FACTOR) } else { self.read_check_override };
        Some((write, read))
    }

    /// Starts the monitor if the handshake is complete. Both sides of the handshake call this
    ///  after recording their part, so whichever comes last starts it.
    fn try_start_monitor(&self) {
        let _guard = self.start_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_monitoring() || self.filter.is_closed() {
            return;
        }
        let Some((write_interval, read_interval)) = self.check_intervals() else {
            return;
        };
        let Some(myself) = self.myself.upgrade() else {
            return;
        };
        self.monitor_started.store(true, Ordering::Release);

        if write_interval.is_zero() && read_interval.is_zero() {
            info!("heart-beating is disabled for the connection to {}", self.remote());
            return;
        }
        debug!("starting inactivity monitor for {}: write check {:?}, read check {:?}", self.remote(), write_interval, read_interval);

        *self.last_read_check.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now() + self.initial_delay;

        let read_trigger = Arc::new(Notify::new());
        let write_trigger = Arc::new(Notify::new());

        tokio::spawn(myself.clone().run_check_worker(CheckKind::Write, write_trigger.clone(), self.cancel_sender.subscribe()));
        tokio::spawn(myself.clone().run_check_worker(CheckKind::Read(read_interval), read_trigger.clone(), self.cancel_sender.subscribe()));
        tokio::spawn(run_timer(self.initial_delay, write_interval / 2, read_interval, write_trigger, read_trigger, self.cancel_sender.subscribe()));
    }

    fn stop_monitor(&self) {
        // no receivers left means the monitor tasks are not running
        let _ = self.cancel_sender.send(());
    }

    async fn run_check_worker(self: Arc<Self>, kind: CheckKind, trigger: Arc<Notify>, mut cancel_receiver: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = trigger.notified() => {
                    match kind {
                        CheckKind::Write => self.write_check().await,
                        CheckKind::Read(read_interval) => self.read_check(read_interval).await,
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }
        trace!("{:?} check worker terminated", kind);
    }

    async fn write_check(&self) {
        if self.command_sent.swap(false, Ordering::AcqRel) {
            trace!("command sent since the last write check - no keep-alive needed");
            return;
        }

        debug!("no command sent to {} since the last write check - sending keep-alive", self.remote());
        if let Err(e) = self.filter.oneway(Command::keep_alive()).await {
            warn!("sending keep-alive to {} failed: {}", self.remote(), e);
            self.fail(e).await;
        }
    }

    async fn read_check(&self, read_interval: Duration) {
        let now = Instant::now();
        let elapsed = {
            let mut last_read_check = self.last_read_check.lock().unwrap_or_else(PoisonError::into_inner);
            let elapsed = now.saturating_duration_since(*last_read_check);
            if elapsed < read_interval.mul_f64(0.9) {
                trace!("skipping read check after {:?}", elapsed);
                return;
            }
            *last_read_check = now;
            elapsed
        };

        if self.command_received.swap(false, Ordering::AcqRel) {
            trace!("command received since the last read check");
            return;
        }

        let error = TransportError::Inactivity {
            elapsed,
            remote: self.remote(),
        };
        self.fail(error).await;
    }

    /// Reports a failure upward, at most once per monitor
    async fn fail(&self, error: TransportError) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        error!("{}", error);
        self.stop_monitor();
        self.filter.fire_exception(error).await;
    }
}

#[derive(Clone, Copy, Debug)]
enum CheckKind {
    Write,
    Read(Duration),
}

async fn run_timer(initial_delay: Duration, write_period: Duration, read_period: Duration, write_trigger: Arc<Notify>, read_trigger: Arc<Notify>, mut cancel_receiver: broadcast::Receiver<()>) {
    let start = Instant::now() + initial_delay;
    let write_enabled = !write_period.is_zero();
    let read_enabled = !read_period.is_zero();

    // intervals must not be zero, even for a disabled direction
    let mut write_ticks = interval_at(start + write_period, write_period.max(Duration::from_millis(1)));
    let mut read_ticks = interval_at(start + read_period, read_period.max(Duration::from_millis(1)));
    write_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    read_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = write_ticks.tick(), if write_enabled => write_trigger.notify_one(),
            _ = read_ticks.tick(), if read_enabled => read_trigger.notify_one(),
            _ = cancel_receiver.recv() => break,
        }
    }
    trace!("inactivity timer terminated");
}

#[async_trait]
impl Transport for InactivityMonitor {
    async fn start(&self) -> TransportResult<()> {
        self.filter.start().await
    }

    async fn stop(&self) -> TransportResult<()> {
        self.stop_monitor();
        self.filter.stop().await?;
        Ok(())
    }

    async fn oneway(&self, command: Command) -> TransportResult<()> {
        let local_heart_beat = match &command.kind {
            CommandKind::ConnectionInfo(info) => Some(info.heart_beat),
            _ => None,
        };

        self.filter.oneway(command).await?;
        self.command_sent.store(true, Ordering::Release);

        // recorded only once the connect command is actually out
        if local_heart_beat.is_some() {
            self.handshake.lock().unwrap_or_else(PoisonError::into_inner).local = local_heart_beat;
        }
        self.try_start_monitor();
        Ok(())
    }

    async fn async_request(&self, command: Command) -> TransportResult<FutureResponse> {
        self.filter.async_request(command).await
    }

    async fn request(&self, command: Command, timeout: Option<Duration>) -> TransportResult<Command> {
        self.filter.request(command, timeout).await
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        self.filter.set_listener(listener);
    }

    fn remote_address(&self) -> Option<String> {
        self.filter.next().remote_address()
    }

    fn is_connected(&self) -> bool {
        self.filter.next().is_connected()
    }

    fn is_closed(&self) -> bool {
        self.filter.is_closed()
    }
}

#[async_trait]
impl TransportListener for InactivityMonitor {
    async fn on_command(&self, command: Command) {
        self.command_received.store(true, Ordering::Release);

        match &command.kind {
            CommandKind::KeepAlive => {
                trace!("keep-alive from {}", self.remote());
                if self.keep_alive_responses {
                    if let Err(e) = self.filter.oneway(Command::keep_alive()).await {
                        debug!("could not answer keep-alive: {}", e);
                    }
                }
                return;
            }
            CommandKind::Connected(info) => {
                self.handshake.lock().unwrap_or_else(PoisonError::into_inner).remote = Some(info.heart_beat);
                self.try_start_monitor();
            }
            _ => {}
        }

        self.filter.fire_command(command).await;
    }

    async fn on_exception(&self, error: TransportError) {
        if self.failed.swap(true, Ordering::AcqRel) {
            debug!("suppressing follow-up failure after inactivity: {}", error);
            return;
        }
        self.stop_monitor();
        self.filter.fire_exception(error).await;
    }

    async fn transport_interrupted(&self) {
        self.filter.fire_interrupted().await;
    }

    async fn transport_resumed(&self) {
        self.filter.fire_resumed().await;
    }
}
