use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::command::{Command, CommandId, CommandKind};
use crate::config::FailoverConfig;
use crate::error::{TransportError, TransportResult};
use crate::failover::reconnect_backoff::ReconnectBackoff;
use crate::failover::uri_pool::UriPool;
use crate::state::ConnectionStateTracker;
use crate::transport::factory::TransportFactory;
use crate::transport::{FutureResponse, ListenerSlot, Transport, TransportListener};
use crate::uri::EndpointUri;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailoverState {
    /// not started yet
    Idle,
    /// started, but never connected so far
    Connecting,
    Connected,
    /// lost the connection, reconnecting
    Interrupted,
    /// stopped, or gave up reconnecting
    Stopped,
}

#[derive(Clone)]
struct ConnectedTransport {
    transport: Arc<dyn Transport>,
    uri: EndpointUri,
    /// distinguishes failure reports of this connection from those of earlier ones
    generation: u64,
}

#[derive(Clone)]
enum LinkState {
    Disconnected,
    Connected(ConnectedTransport),
    /// reconnecting was given up, with this error
    Failed(TransportError),
    Disposed,
}

enum PendingRequest {
    /// covered by the state tracker's replay, never re-sent as is
    Tracked,
    /// re-sent as is after a reconnect
    Untracked(Command),
}

struct ReconnectState {
    uri_pool: UriPool,
    backoff: ReconnectBackoff,
    /// consecutive reconnect rounds in which no broker address could be connected
    failed_rounds: u32,
}

enum RoundOutcome {
    Connected,
    Retry(Duration),
    Stopped,
}

/// A transport that survives the loss of its connection. It owns at most one connected
///  composite transport at a time, created for one of a list of broker addresses; when that
///  connection fails, a background worker connects to the next candidate address, replays the
///  recorded session state onto the new connection, and resumes normal operation.
///
/// Callers sending while the connection is down are blocked until a new connection is in place
///  (bounded by the configured `timeout`). Listeners above are told about the interruption and
///  the resumption, but not about the failure itself: an error is reported upward only when
///  reconnecting is given up.
pub struct FailoverTransport {
    myself: Weak<FailoverTransport>,
    config: FailoverConfig,
    factory: Arc<dyn TransportFactory>,
    listener: ListenerSlot,
    tracker: ConnectionStateTracker,
    pending: Mutex<BTreeMap<CommandId, PendingRequest>>,
    /// ids of commands replayed onto the current connection whose responses nobody waits for
    replayed: Mutex<FxHashSet<CommandId>>,
    reconnect: Mutex<ReconnectState>,
    link: watch::Sender<LinkState>,
    next_generation: AtomicU64,
    /// highest generation that was reported as failed
    failed_generation: AtomicU64,
    started: AtomicBool,
    ever_connected: AtomicBool,
}

impl FailoverTransport {
    pub fn new(uris: Vec<EndpointUri>, config: FailoverConfig, factory: Arc<dyn TransportFactory>) -> Arc<FailoverTransport> {
        let (link, _) = watch::channel(LinkState::Disconnected);
        Arc::new_cyclic(|myself| FailoverTransport {
            myself: myself.clone(),
            reconnect: Mutex::new(ReconnectState {
                uri_pool: UriPool::new(uris, config.randomize),
                backoff: ReconnectBackoff::new(&config),
                failed_rounds: 0,
            }),
            config,
            factory,
            listener: ListenerSlot::default(),
            tracker: ConnectionStateTracker::default(),
            pending: Default::default(),
            replayed: Default::default(),
            link,
            next_generation: AtomicU64::new(0),
            failed_generation: AtomicU64::new(0),
            started: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
        })
    }

    /// Creates a failover transport with the reconnect policy given as (`failover:` URI) options
    pub fn from_params(uris: Vec<EndpointUri>, params: &BTreeMap<String, String>, factory: Arc<dyn TransportFactory>) -> TransportResult<Arc<FailoverTransport>> {
        let config = FailoverConfig::from_params(params)?;
        Ok(FailoverTransport::new(uris, config, factory))
    }

    pub fn state(&self) -> FailoverState {
        match &*self.link.borrow() {
            LinkState::Connected(_) => FailoverState::Connected,
            LinkState::Failed(_) | LinkState::Disposed => FailoverState::Stopped,
            LinkState::Disconnected => {
                if !self.started.load(Ordering::Acquire) {
                    FailoverState::Idle
                }
                else if self.ever_connected.load(Ordering::Acquire) {
                    FailoverState::Interrupted
                }
                else {
                    FailoverState::Connecting
                }
            }
        }
    }

    pub fn connected_uri(&self) -> Option<EndpointUri> {
        match &*self.link.borrow() {
            LinkState::Connected(c) => Some(c.uri.clone()),
            _ => None,
        }
    }

    pub fn uris(&self) -> Vec<EndpointUri> {
        self.lock_reconnect().uri_pool.uris().to_vec()
    }

    pub fn add_uri(&self, uri: EndpointUri) {
        self.lock_reconnect().uri_pool.add_uri(uri);
    }

    /// Removes a broker address from the candidates. An existing connection to that address is
    ///  kept; the removal takes effect when reconnecting.
    pub fn remove_uri(&self, uri: &EndpointUri) -> bool {
        self.lock_reconnect().uri_pool.remove_uri(uri)
    }

    fn lock_reconnect(&self) -> MutexGuard<'_, ReconnectState> {
        self.reconnect.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, BTreeMap<CommandId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_replayed(&self) -> MutexGuard<'_, FxHashSet<CommandId>> {
        self.replayed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn terminal_error(&self) -> TransportError {
        match &*self.link.borrow() {
            LinkState::Failed(e) => e.clone(),
            _ => TransportError::Disposed,
        }
    }

    async fn run_reconnect_worker(myself: Weak<FailoverTransport>, mut link: watch::Receiver<LinkState>) {
        loop {
            let disconnected = matches!(
                link.wait_for(|s| !matches!(s, LinkState::Connected(_))).await.as_deref(),
                Ok(LinkState::Disconnected)
            );
            if !disconnected {
                break;
            }

            let Some(transport) = myself.upgrade() else {
                break;
            };
            match transport.reconnect_round().await {
                RoundOutcome::Connected => {}
                RoundOutcome::Stopped => break,
                RoundOutcome::Retry(delay) => {
                    drop(transport);
                    debug!("next reconnect round in {:?}", delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_until_disposed(&mut link) => {}
                    }
                }
            }
        }
        debug!("reconnect worker finished");
    }

    /// Tries every candidate address once
    async fn reconnect_round(&self) -> RoundOutcome {
        let candidates = self.lock_reconnect().uri_pool.candidates();
        if candidates.is_empty() {
            self.give_up(TransportError::NoCandidates).await;
            return RoundOutcome::Stopped;
        }

        let mut last_error = None;
        for uri in candidates {
            if self.is_closed() {
                return RoundOutcome::Stopped;
            }
            match self.connect_to(&uri).await {
                Ok(()) => return RoundOutcome::Connected,
                Err(e) => {
                    warn!("connecting to {} failed: {}", uri, e);
                    self.lock_reconnect().uri_pool.mark_failed(&uri);
                    last_error = Some(e);
                }
            }
        }

        let (failed_rounds, delay) = {
            let mut reconnect = self.lock_reconnect();
            reconnect.failed_rounds += 1;
            (reconnect.failed_rounds, reconnect.backoff.next_delay())
        };
        let limit = if self.ever_connected.load(Ordering::Acquire) {
            self.config.max_reconnect_attempts
        }
        else {
            self.config.effective_startup_max_attempts()
        };

        match limit {
            Some(limit) if failed_rounds > limit => {
                self.give_up(TransportError::ReconnectExhausted {
                    attempts: failed_rounds,
                    last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
                }).await;
                RoundOutcome::Stopped
            }
            _ => RoundOutcome::Retry(delay),
        }
    }

    async fn connect_to(&self, uri: &EndpointUri) -> TransportResult<()> {
        debug!("connecting to {}", uri);
        let transport = self.factory.create_composite(uri).await?;
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel) + 1;
        transport.set_listener(Arc::new(LinkListener {
            owner: self.myself.clone(),
            generation,
        }));

        if let Err(e) = self.start_and_restore(&transport).await {
            stop_in_background(transport);
            return Err(e);
        }

        let connected = ConnectedTransport {
            transport: transport.clone(),
            uri: uri.clone(),
            generation,
        };
        let mut swap_error = None;
        self.link.send_if_modified(|state| {
            if !matches!(state, LinkState::Disconnected) {
                swap_error = Some(TransportError::Disposed);
                return false;
            }
            if self.failed_generation.load(Ordering::Acquire) >= generation {
                swap_error = Some(TransportError::ConnectionFailed(format!("connection to {} was lost while restoring state", uri)));
                return false;
            }
            *state = LinkState::Connected(connected);
            true
        });
        if let Some(e) = swap_error {
            stop_in_background(transport);
            return Err(e);
        }

        {
            let mut reconnect = self.lock_reconnect();
            reconnect.backoff.reset();
            reconnect.failed_rounds = 0;
        }
        let is_resumption = self.ever_connected.swap(true, Ordering::AcqRel);
        info!("connected to {}", uri);
        if is_resumption {
            self.fire_resumed().await;
        }
        Ok(())
    }

    /// Brings a new connection up to date before it is used for regular traffic: replays the
    ///  tracked session state, then re-sends untracked requests that are still waiting for a
    ///  response.
    ///
    /// An unanswered tracked request that the replay did not include (e.g. an unsubscribe) is
    ///  already reflected by the restored session, so it is answered locally instead of being
    ///  sent to a broker that never saw the original.
    async fn start_and_restore(&self, transport: &Arc<dyn Transport>) -> TransportResult<()> {
        transport.start().await?;

        let replayed = self.tracker.do_restore(transport.as_ref()).await?;
        let replayed = replayed.into_iter().collect::<FxHashSet<_>>();

        let mut unanswered = Vec::new();
        let mut settled = Vec::new();
        self.lock_pending().retain(|command_id, request| {
            if replayed.contains(command_id) {
                return true;
            }
            match request {
                PendingRequest::Untracked(command) => {
                    unanswered.push(command.clone());
                    true
                }
                PendingRequest::Tracked => {
                    settled.push(*command_id);
                    false
                }
            }
        });
        *self.lock_replayed() = replayed;

        for command_id in settled {
            trace!("request #{} is covered by the restored session - answering it locally", command_id);
            self.fire_command(Command::response(command_id)).await;
        }

        if !unanswered.is_empty() {
            debug!("re-sending {} unanswered request(s)", unanswered.len());
        }
        for command in unanswered {
            transport.oneway(command).await?;
        }
        Ok(())
    }

    async fn handle_transport_failure(&self, generation: u64, error: TransportError) {
        self.failed_generation.fetch_max(generation, Ordering::AcqRel);

        let mut failed = None;
        self.link.send_if_modified(|state| match state {
            LinkState::Connected(c) if c.generation == generation => {
                failed = Some(c.clone());
                *state = LinkState::Disconnected;
                true
            }
            _ => false,
        });
        let Some(failed) = failed else {
            debug!("ignoring failure of a connection that is no longer in use: {}", error);
            return;
        };

        warn!("connection to {} failed: {} - reconnecting", failed.uri, error);
        self.lock_reconnect().uri_pool.mark_failed(&failed.uri);
        stop_in_background(failed.transport);
        self.fire_interrupted().await;
    }

    async fn handle_command(&self, command: Command) {
        if let Some(correlation_id) = command.correlation_id() {
            let rejected = matches!(command.kind, CommandKind::ExceptionResponse { .. });
            let was_replayed = self.lock_replayed().remove(&correlation_id);
            let request = self.lock_pending().remove(&correlation_id);

            match request {
                Some(PendingRequest::Tracked) if rejected => self.tracker.untrack_rejected(correlation_id),
                Some(_) => {}
                None if was_replayed => {
                    if rejected {
                        warn!("broker rejected replayed command: {:?}", command.kind);
                        self.tracker.untrack_rejected(correlation_id);
                    }
                    return;
                }
                None => {}
            }
        }
        self.fire_command(command).await;
    }

    /// Completes remove and shutdown commands locally while there is no connection: there is
    ///  nothing to remove on a broker we are not connected to
    async fn short_circuit(&self, command: Command) -> TransportResult<()> {
        debug!("not connected - completing {} locally", command);
        if command.is_remove() {
            self.tracker.track(&command)?;
        }
        if command.response_required {
            self.fire_command(Command::response(command.command_id)).await;
        }
        Ok(())
    }

    async fn wait_for_connection(&self) -> TransportResult<ConnectedTransport> {
        let mut link = self.link.subscribe();
        let ready = link.wait_for(|s| !matches!(s, LinkState::Disconnected));

        let state = match self.config.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, ready).await {
                Ok(state) => state.map(|s| (*s).clone()),
                Err(_) => return Err(TransportError::Timeout(timeout)),
            },
            None => ready.await.map(|s| (*s).clone()),
        };

        match state {
            Ok(LinkState::Connected(c)) => Ok(c),
            Ok(LinkState::Failed(e)) => Err(e),
            _ => Err(TransportError::Disposed),
        }
    }

    /// Fails every pending request by passing a synthetic error response upward
    async fn flush_pending(&self, error: &TransportError) {
        let pending = std::mem::take(&mut *self.lock_pending());
        if !pending.is_empty() {
            debug!("failing {} pending request(s): {}", pending.len(), error);
        }
        for command_id in pending.into_keys() {
            self.fire_command(Command::exception_response(command_id, error.to_string())).await;
        }
    }

    async fn give_up(&self, error: TransportError) {
        let mut changed = false;
        self.link.send_modify(|state| {
            if !matches!(state, LinkState::Failed(_) | LinkState::Disposed) {
                *state = LinkState::Failed(error.clone());
                changed = true;
            }
        });
        if !changed {
            return;
        }

        error!("giving up on reconnecting: {}", error);
        self.fire_exception(error.clone()).await;
        self.flush_pending(&error).await;
    }

    async fn fire_command(&self, command: Command) {
        match self.listener.get() {
            Some(listener) => listener.on_command(command).await,
            None => debug!("no listener registered - dropping inbound {}", command),
        }
    }

    async fn fire_exception(&self, error: TransportError) {
        match self.listener.get() {
            Some(listener) => listener.on_exception(error).await,
            None => debug!("no listener registered - dropping transport error: {}", error),
        }
    }

    async fn fire_interrupted(&self) {
        if let Some(listener) = self.listener.get() {
            listener.transport_interrupted().await;
        }
    }

    async fn fire_resumed(&self) {
        if let Some(listener) = self.listener.get() {
            listener.transport_resumed().await;
        }
    }
}

async fn wait_until_disposed(link: &mut watch::Receiver<LinkState>) {
    let _ = link.wait_for(|s| matches!(s, LinkState::Disposed)).await;
}

fn stop_in_background(transport: Arc<dyn Transport>) {
    tokio::spawn(async move {
        if let Err(e) = transport.stop().await {
            debug!("error stopping discarded transport: {}", e);
        }
    });
}

#[async_trait]
impl Transport for FailoverTransport {
    async fn start(&self) -> TransportResult<()> {
        self.listener.require()?;
        if self.is_closed() {
            return Err(self.terminal_error());
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!("starting failover transport for {} broker address(es)", self.lock_reconnect().uri_pool.uris().len());
        tokio::spawn(FailoverTransport::run_reconnect_worker(self.myself.clone(), self.link.subscribe()));
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        let previous = self.link.send_replace(LinkState::Disposed);
        if matches!(previous, LinkState::Disposed) {
            return Ok(());
        }

        info!("stopping failover transport");
        self.tracker.shutdown();
        self.flush_pending(&TransportError::Disposed).await;
        if let LinkState::Connected(connected) = previous {
            connected.transport.stop().await?;
        }
        Ok(())
    }

    async fn oneway(&self, command: Command) -> TransportResult<()> {
        if self.is_closed() {
            return Err(self.terminal_error());
        }
        if !self.is_connected() && (command.is_shutdown() || command.is_remove()) {
            return self.short_circuit(command).await;
        }
        if !self.started.load(Ordering::Acquire) {
            return Err(TransportError::invalid_operation("the failover transport was not started"));
        }

        loop {
            let connected = self.wait_for_connection().await?;

            let tracked = self.tracker.track(&command)?;
            if command.response_required {
                let request = match tracked {
                    Some(_) => PendingRequest::Tracked,
                    None => PendingRequest::Untracked(command.clone()),
                };
                self.lock_pending().insert(command.command_id, request);
            }

            let error = match connected.transport.oneway(command.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if !error.is_connectivity_failure() {
                self.lock_pending().remove(&command.command_id);
                return Err(error);
            }
            if tracked.is_some() {
                debug!("sending {} failed ({}) - it is replayed after reconnecting", command, error);
                self.handle_transport_failure(connected.generation, error).await;
                return Ok(());
            }

            debug!("sending {} failed ({}) - retrying after reconnecting", command, error);
            if command.response_required {
                self.lock_pending().remove(&command.command_id);
            }
            self.handle_transport_failure(connected.generation, error).await;
        }
    }

    async fn async_request(&self, _command: Command) -> TransportResult<FutureResponse> {
        Err(TransportError::invalid_operation("a failover transport does not correlate responses"))
    }

    async fn request(&self, _command: Command, _timeout: Option<Duration>) -> TransportResult<Command> {
        Err(TransportError::invalid_operation("a failover transport does not correlate responses"))
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        self.listener.set(listener);
    }

    fn remote_address(&self) -> Option<String> {
        match &*self.link.borrow() {
            LinkState::Connected(c) => c.transport.remote_address(),
            _ => None,
        }
    }

    fn is_fault_tolerant(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        matches!(*self.link.borrow(), LinkState::Connected(_))
    }

    fn is_closed(&self) -> bool {
        matches!(*self.link.borrow(), LinkState::Failed(_) | LinkState::Disposed)
    }
}


/// Registered on each connection the failover transport creates
struct LinkListener {
    owner: Weak<FailoverTransport>,
    generation: u64,
}

#[async_trait]
impl TransportListener for LinkListener {
    async fn on_command(&self, command: Command) {
        if let Some(owner) = self.owner.upgrade() {
            owner.handle_command(command).await;
        }
    }

    async fn on_exception(&self, error: TransportError) {
        if let Some(owner) = self.owner.upgrade() {
            owner.handle_transport_failure(self.generation, error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::command::{AckMode, ConnectionId, ConnectionInfo, ConsumerId, ConsumerInfo, Message};
    use crate::test_util::factory::RecordingTransportFactory;
    use crate::test_util::listener::{wait_until, RecordingListener};
    use crate::test_util::transport::RecordingTransport;
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn uris() -> Vec<EndpointUri> {
        vec![EndpointUri::tcp("broker1", 61613), EndpointUri::tcp("broker2", 61613)]
    }

    fn config() -> FailoverConfig {
        let mut config = FailoverConfig::new();
        config.randomize = false;
        config.initial_reconnect_delay = Duration::from_millis(10);
        config.max_reconnect_delay = Duration::from_millis(100);
        config
    }

    fn request(command_id: CommandId, kind: CommandKind) -> Command {
        Command {
            command_id,
            response_required: true,
            kind,
        }
    }

    fn connect(command_id: CommandId) -> Command {
        request(command_id, CommandKind::ConnectionInfo(ConnectionInfo::new(ConnectionId::from("c1"))))
    }

    fn consumer_id(n: u64) -> ConsumerId {
        ConsumerId::new(ConnectionId::from("c1"), n)
    }

    fn subscribe(command_id: CommandId, n: u64) -> Command {
        request(command_id, CommandKind::ConsumerInfo(ConsumerInfo {
            consumer_id: consumer_id(n),
            destination: "/queue/q".to_string(),
            ack_mode: AckMode::Client,
            selector: None,
        }))
    }

    fn unsubscribe(command_id: CommandId, n: u64) -> Command {
        request(command_id, CommandKind::RemoveConsumer(consumer_id(n)))
    }

    fn message(command_id: CommandId) -> Command {
        request(command_id, CommandKind::Message(Message {
            destination: "/queue/q".to_string(),
            ..Default::default()
        }))
    }

    fn ids(commands: &[Command]) -> Vec<CommandId> {
        commands.iter().map(|c| c.command_id).collect()
    }

    async fn start_failover(factory: &Arc<RecordingTransportFactory>, config: FailoverConfig) -> (Arc<FailoverTransport>, Arc<RecordingListener>) {
        let failover = FailoverTransport::new(uris(), config, factory.clone());
        let listener = Arc::new(RecordingListener::default());
        failover.set_listener(listener.clone());
        failover.start().await.unwrap();
        (failover, listener)
    }

    async fn connected_transport(factory: &RecordingTransportFactory, n: usize, failover: &FailoverTransport) -> Arc<RecordingTransport> {
        let created = factory.wait_for_created(n, WAIT).await;
        assert!(wait_until(WAIT, || failover.is_connected() && failover.remote_address().as_deref() == Some(created[n - 1].uri())).await);
        created[n - 1].clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_to_first_candidate() {
        let factory = Arc::new(RecordingTransportFactory::default());
        let failover = FailoverTransport::new(uris(), config(), factory.clone());
        assert_eq!(failover.state(), FailoverState::Idle);
        assert!(failover.is_fault_tolerant());

        let listener = Arc::new(RecordingListener::default());
        failover.set_listener(listener.clone());
        failover.start().await.unwrap();

        let leaf = connected_transport(&factory, 1, &failover).await;
        assert!(leaf.is_started());
        assert_eq!(failover.state(), FailoverState::Connected);
        assert_eq!(failover.connected_uri(), Some(EndpointUri::tcp("broker1", 61613)));
        assert_eq!(factory.attempts(), vec!["broker1".to_string()]);
        assert_eq!(listener.num_resumed(), 0);
    }

    #[tokio::test]
    async fn test_start_requires_listener() {
        let failover = FailoverTransport::new(uris(), config(), Arc::new(RecordingTransportFactory::default()));
        assert!(matches!(failover.start().await, Err(TransportError::InvalidOperation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_refused_candidate() {
        let factory = Arc::new(RecordingTransportFactory::default());
        factory.refuse("broker1");
        let (failover, _listener) = start_failover(&factory, config()).await;

        connected_transport(&factory, 1, &failover).await;
        assert_eq!(failover.connected_uri(), Some(EndpointUri::tcp("broker2", 61613)));
        assert_eq!(factory.attempts(), vec!["broker1".to_string(), "broker2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replays_session_state_after_failure() {
        let factory = Arc::new(RecordingTransportFactory::default());
        factory.auto_respond(true);
        let (failover, listener) = start_failover(&factory, config()).await;
        let first = connected_transport(&factory, 1, &failover).await;

        for command in [connect(1), subscribe(2, 1), subscribe(3, 2), unsubscribe(4, 2), subscribe(5, 3)] {
            failover.oneway(command).await.unwrap();
        }
        listener.wait_for_commands(5, WAIT).await;

        first.inject_exception(TransportError::Closed).await;
        let second = connected_transport(&factory, 2, &failover).await;
        assert!(wait_until(WAIT, || listener.num_resumed() == 1).await);

        assert_eq!(ids(&second.sent()), vec![1, 2, 5]);
        assert_eq!(failover.connected_uri(), Some(EndpointUri::tcp("broker2", 61613)));
        assert_eq!(listener.num_interrupted(), 1);
        assert!(wait_until(WAIT, || first.is_closed()).await);

        // responses to replayed commands are not passed upward
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener.commands().len(), 5);
        assert!(listener.exceptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resends_unanswered_requests() {
        let factory = Arc::new(RecordingTransportFactory::default());
        let (failover, listener) = start_failover(&factory, config()).await;
        let first = connected_transport(&factory, 1, &failover).await;

        failover.oneway(message(7)).await.unwrap();
        assert_eq!(ids(&first.sent()), vec![7]);

        first.inject_exception(TransportError::Closed).await;
        let second = connected_transport(&factory, 2, &failover).await;
        assert_eq!(ids(&second.sent()), vec![7]);

        second.inject_command(Command::response(7)).await;
        assert_eq!(listener.commands(), vec![Command::response(7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_is_retried_on_next_connection() {
        let factory = Arc::new(RecordingTransportFactory::default());
        let (failover, listener) = start_failover(&factory, config()).await;
        let first = connected_transport(&factory, 1, &failover).await;
        first.fail_sends(true);

        failover.oneway(message(11)).await.unwrap();

        let second = connected_transport(&factory, 2, &failover).await;
        assert_eq!(ids(&second.sent()), vec![11]);
        assert!(first.sent().is_empty());
        assert_eq!(listener.num_interrupted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_of_replaced_connection_is_ignored() {
        let factory = Arc::new(RecordingTransportFactory::default());
        let (failover, listener) = start_failover(&factory, config()).await;
        let first = connected_transport(&factory, 1, &failover).await;

        first.inject_exception(TransportError::Closed).await;
        let second = connected_transport(&factory, 2, &failover).await;

        first.inject_exception(TransportError::Closed).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(listener.num_interrupted(), 1);
        assert_eq!(factory.created().len(), 2);
        assert_eq!(failover.remote_address().as_deref(), Some(second.uri()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_live_connection() {
        let factory = Arc::new(RecordingTransportFactory::default());
        let (failover, listener) = start_failover(&factory, config()).await;

        for n in 1..=4 {
            let leaf = connected_transport(&factory, n, &failover).await;
            leaf.inject_exception(TransportError::Closed).await;
        }
        connected_transport(&factory, 5, &failover).await;

        let created = factory.created();
        assert!(wait_until(WAIT, || created.iter().filter(|t| !t.is_closed()).count() == 1).await);
        assert!(!created[4].is_closed());
        assert_eq!(listener.num_interrupted(), 4);
        assert!(wait_until(WAIT, || listener.num_resumed() == 4).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_unsubscribe_is_not_resent() {
        let factory = Arc::new(RecordingTransportFactory::default());
        let (failover, listener) = start_failover(&factory, config()).await;
        let first = connected_transport(&factory, 1, &failover).await;

        for command in [connect(1), subscribe(2, 1)] {
            failover.oneway(command).await.unwrap();
        }
        first.inject_command(Command::response(1)).await;
        first.inject_command(Command::response(2)).await;
        failover.oneway(unsubscribe(4, 1)).await.unwrap();

        first.inject_exception(TransportError::Closed).await;
        let second = connected_transport(&factory, 2, &failover).await;

        assert_eq!(ids(&second.sent()), vec![1]);
        assert!(wait_until(WAIT, || listener.commands().contains(&Command::response(4))).await);
        assert!(failover.lock_pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_subscription_is_not_replayed() {
        let factory = Arc::new(RecordingTransportFactory::default());
        let (failover, listener) = start_failover(&factory, config()).await;
        let first = connected_transport(&factory, 1, &failover).await;

        for command in [connect(1), subscribe(2, 1), subscribe(3, 2)] {
            failover.oneway(command).await.unwrap();
        }
        first.inject_command(Command::exception_response(2, "no such destination")).await;
        first.inject_command(Command::response(3)).await;
        assert_eq!(listener.commands().len(), 2);

        first.inject_exception(TransportError::Closed).await;
        let second = connected_transport(&factory, 2, &failover).await;
        assert_eq!(ids(&second.sent()), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_without_connection() {
        let factory = Arc::new(RecordingTransportFactory::default());
        factory.refuse("broker1");
        factory.refuse("broker2");
        let mut config = config();
        config.timeout = Some(Duration::from_millis(50));
        let (failover, _listener) = start_failover(&factory, config).await;

        let result = failover.oneway(message(1)).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert_eq!(failover.state(), FailoverState::Connecting);

        failover.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_send_proceeds_after_connecting() {
        let factory = Arc::new(RecordingTransportFactory::default());
        factory.refuse("broker1");
        factory.refuse("broker2");
        let (failover, _listener) = start_failover(&factory, config()).await;

        let sender = {
            let failover = failover.clone();
            tokio::spawn(async move { failover.oneway(message(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!sender.is_finished());

        factory.accept("broker2");
        sender.await.unwrap().unwrap();
        let leaf = connected_transport(&factory, 1, &failover).await;
        assert_eq!(ids(&leaf.wait_for_sent(1, WAIT).await), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_on_startup() {
        let factory = Arc::new(RecordingTransportFactory::default());
        factory.refuse("broker1");
        factory.refuse("broker2");
        let mut config = config();
        config.startup_max_reconnect_attempts = Some(0);
        let (failover, listener) = start_failover(&factory, config).await;

        let exceptions = listener.wait_for_exceptions(1, WAIT).await;
        assert!(matches!(exceptions[0], TransportError::ReconnectExhausted { attempts: 1, .. }));
        assert_eq!(factory.attempts().len(), 2);
        assert_eq!(failover.state(), FailoverState::Stopped);
        assert!(matches!(failover.oneway(message(1)).await, Err(TransportError::ReconnectExhausted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts_and_flushes_pending() {
        let factory = Arc::new(RecordingTransportFactory::default());
        let mut config = config();
        config.max_reconnect_attempts = Some(1);
        let (failover, listener) = start_failover(&factory, config).await;
        let first = connected_transport(&factory, 1, &failover).await;

        failover.oneway(message(21)).await.unwrap();
        factory.refuse("broker1");
        factory.refuse("broker2");
        first.inject_exception(TransportError::Closed).await;

        let exceptions = listener.wait_for_exceptions(1, WAIT).await;
        assert!(matches!(exceptions[0], TransportError::ReconnectExhausted { attempts: 2, .. }));
        assert_eq!(factory.attempts().len(), 5);

        let commands = listener.wait_for_commands(1, WAIT).await;
        assert!(matches!(commands[0].kind, CommandKind::ExceptionResponse { correlation_id: 21, .. }));
        assert_eq!(failover.state(), FailoverState::Stopped);
        assert!(failover.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_candidates() {
        let factory = Arc::new(RecordingTransportFactory::default());
        let failover = FailoverTransport::new(vec![], config(), factory.clone());
        let listener = Arc::new(RecordingListener::default());
        failover.set_listener(listener.clone());
        failover.start().await.unwrap();

        let exceptions = listener.wait_for_exceptions(1, WAIT).await;
        assert!(matches!(exceptions[0], TransportError::NoCandidates));
    }

    #[tokio::test]
    async fn test_remove_and_shutdown_complete_locally_when_disconnected() {
        let factory = Arc::new(RecordingTransportFactory::default());
        let failover = FailoverTransport::new(uris(), config(), factory.clone());
        let listener = Arc::new(RecordingListener::default());
        failover.set_listener(listener.clone());

        failover.oneway(Command::shutdown()).await.unwrap();
        failover.oneway(unsubscribe(9, 1)).await.unwrap();

        assert_eq!(listener.commands(), vec![Command::response(9)]);
        assert!(factory.created().is_empty());
    }

    #[tokio::test]
    async fn test_send_before_start_is_rejected() {
        let failover = FailoverTransport::new(uris(), config(), Arc::new(RecordingTransportFactory::default()));
        failover.set_listener(Arc::new(RecordingListener::default()));
        assert!(matches!(failover.oneway(message(1)).await, Err(TransportError::InvalidOperation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop() {
        let factory = Arc::new(RecordingTransportFactory::default());
        let (failover, listener) = start_failover(&factory, config()).await;
        let leaf = connected_transport(&factory, 1, &failover).await;
        failover.oneway(message(3)).await.unwrap();

        failover.stop().await.unwrap();
        failover.stop().await.unwrap();

        assert!(leaf.is_closed());
        assert_eq!(failover.state(), FailoverState::Stopped);
        assert!(matches!(failover.oneway(message(4)).await, Err(TransportError::Disposed)));
        assert!(matches!(listener.commands()[0].kind, CommandKind::ExceptionResponse { correlation_id: 3, .. }));
        assert!(listener.exceptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_and_remove_uri() {
        let factory = Arc::new(RecordingTransportFactory::default());
        factory.refuse("broker1");
        factory.refuse("broker2");
        let (failover, _listener) = start_failover(&factory, config()).await;

        failover.add_uri(EndpointUri::tcp("broker3", 61613));
        assert!(failover.remove_uri(&EndpointUri::tcp("broker1", 61613)));
        assert_eq!(failover.uris(), vec![EndpointUri::tcp("broker2", 61613), EndpointUri::tcp("broker3", 61613)]);

        connected_transport(&factory, 1, &failover).await;
        assert_eq!(failover.connected_uri(), Some(EndpointUri::tcp("broker3", 61613)));
    }

    #[tokio::test]
    async fn test_from_params() {
        let params: BTreeMap<String, String> = [("maxReconnectAttempts", "3"), ("randomize", "false")].iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let failover = FailoverTransport::from_params(uris(), &params, Arc::new(RecordingTransportFactory::default())).unwrap();
        assert_eq!(failover.config.max_reconnect_attempts, Some(3));
        assert!(!failover.config.randomize);

        let params: BTreeMap<String, String> = [("backOffMultiplier".to_string(), "0.5".to_string())].into_iter().collect();
        assert!(matches!(
            FailoverTransport::from_params(uris(), &params, Arc::new(RecordingTransportFactory::default())),
            Err(TransportError::Config(_))
        ));
    }
}
