use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::command::{Command, CommandKind, ConsumerId, MessageDispatch};
use crate::dispatch::message_dispatch_channel::MessageDispatchChannel;
use crate::error::TransportError;
use crate::transport::TransportListener;

/// Asynchronous delivery of a consumer's messages, as an alternative to polling a
///  [MessageDispatchChannel]
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, dispatch: MessageDispatch);
}

#[derive(Clone)]
enum Route {
    Channel(Arc<MessageDispatchChannel>),
    Listener(Arc<dyn MessageListener>),
}

/// Sits on top of a transport stack and hands each inbound message to the consumer it is
///  addressed to. Everything else is passed on to a delegate listener.
///
/// While the connection is interrupted, consumer channels are stopped: consumers blocked in
///  `dequeue` return, and queued messages wait for the connection to resume.
pub struct DispatchRouter {
    routes: RwLock<FxHashMap<ConsumerId, Route>>,
    delegate: Arc<dyn TransportListener>,
}

impl DispatchRouter {
    pub fn new(delegate: Arc<dyn TransportListener>) -> Arc<DispatchRouter> {
        Arc::new(DispatchRouter {
            routes: Default::default(),
            delegate,
        })
    }

    /// Registers a consumer that polls for its messages. The returned channel is running.
    pub fn add_channel(&self, consumer_id: ConsumerId) -> Arc<MessageDispatchChannel> {
        let channel = Arc::new(MessageDispatchChannel::new());
        channel.start();
        self.insert(consumer_id, Route::Channel(channel.clone()));
        channel
    }

    pub fn add_listener(&self, consumer_id: ConsumerId, listener: Arc<dyn MessageListener>) {
        self.insert(consumer_id, Route::Listener(listener));
    }

    fn insert(&self, consumer_id: ConsumerId, route: Route) {
        let previous = self.routes.write().unwrap_or_else(PoisonError::into_inner)
            .insert(consumer_id, route);
        if let Some(Route::Channel(channel)) = previous {
            channel.close();
        }
    }

    /// Unregisters a consumer, closing its channel
    pub fn remove(&self, consumer_id: &ConsumerId) {
        let removed = self.routes.write().unwrap_or_else(PoisonError::into_inner)
            .remove(consumer_id);
        if let Some(Route::Channel(channel)) = removed {
            channel.close();
        }
    }

    pub fn num_consumers(&self) -> usize {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Closes all consumer channels and forgets all consumers
    pub fn close(&self) {
        let routes = std::mem::take(&mut *self.routes.write().unwrap_or_else(PoisonError::into_inner));
        for channel in channels(routes.values()) {
            channel.close();
        }
    }

    fn route(&self, consumer_id: &ConsumerId) -> Option<Route> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
            .get(consumer_id)
            .cloned()
    }

    fn all_channels(&self) -> Vec<Arc<MessageDispatchChannel>> {
        channels(self.routes.read().unwrap_or_else(PoisonError::into_inner).values())
    }

    async fn dispatch(&self, dispatch: MessageDispatch) {
        match self.route(&dispatch.consumer_id) {
            Some(Route::Channel(channel)) => channel.enqueue(dispatch),
            Some(Route::Listener(listener)) => listener.on_message(dispatch).await,
            None => warn!("no consumer registered for {:?} - dropping message {:?}", dispatch.consumer_id, dispatch.message.message_id),
        }
    }
}

fn channels<'a>(routes: impl Iterator<Item = &'a Route>) -> Vec<Arc<MessageDispatchChannel>> {
    routes
        .filter_map(|route| match route {
            Route::Channel(channel) => Some(channel.clone()),
            Route::Listener(_) => None,
        })
        .collect()
}

#[async_trait]
impl TransportListener for DispatchRouter {
    async fn on_command(&self, command: Command) {
        match command.kind {
            CommandKind::MessageDispatch(dispatch) => self.dispatch(dispatch).await,
            _ => self.delegate.on_command(command).await,
        }
    }

    async fn on_exception(&self, error: TransportError) {
        for channel in self.all_channels() {
            channel.stop();
        }
        self.delegate.on_exception(error).await;
    }

    async fn transport_interrupted(&self) {
        debug!("connection interrupted - pausing message delivery");
        for channel in self.all_channels() {
            channel.stop();
        }
        self.delegate.transport_interrupted().await;
    }

    async fn transport_resumed(&self) {
        debug!("connection resumed - resuming message delivery");
        for channel in self.all_channels() {
            channel.start();
        }
        self.delegate.transport_resumed().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::command::{ConnectionId, Message};
    use crate::test_util::listener::RecordingListener;

    #[derive(Default)]
    struct CollectingListener {
        received: Mutex<Vec<MessageDispatch>>,
    }

    #[async_trait]
    impl MessageListener for CollectingListener {
        async fn on_message(&self, dispatch: MessageDispatch) {
            self.received.lock().unwrap().push(dispatch);
        }
    }

    fn consumer_id(n: u64) -> ConsumerId {
        ConsumerId::new(ConnectionId::from("c1"), n)
    }

    fn dispatch(consumer: u64, body: &'static str) -> Command {
        Command::new(CommandKind::MessageDispatch(MessageDispatch {
            consumer_id: consumer_id(consumer),
            destination: "/queue/q".to_string(),
            message: Message {
                body: body.into(),
                ..Default::default()
            },
            redelivery_counter: 0,
        }))
    }

    #[tokio::test]
    async fn test_routes_by_consumer() {
        let delegate = Arc::new(RecordingListener::default());
        let router = DispatchRouter::new(delegate.clone());
        let channel = router.add_channel(consumer_id(1));
        let listener = Arc::new(CollectingListener::default());
        router.add_listener(consumer_id(2), listener.clone());

        router.on_command(dispatch(1, "a")).await;
        router.on_command(dispatch(2, "b")).await;
        router.on_command(dispatch(3, "unknown")).await;
        router.on_command(Command::response(5)).await;

        assert_eq!(channel.dequeue_no_wait().unwrap().message.body, "a");
        assert!(channel.is_empty());
        assert_eq!(listener.received.lock().unwrap()[0].message.body, "b");
        assert_eq!(delegate.commands(), vec![Command::response(5)]);
    }

    #[tokio::test]
    async fn test_pauses_channels_while_interrupted() {
        let delegate = Arc::new(RecordingListener::default());
        let router = DispatchRouter::new(delegate.clone());
        let channel = router.add_channel(consumer_id(1));
        router.on_command(dispatch(1, "a")).await;

        router.transport_interrupted().await;
        assert!(!channel.is_running());
        assert!(channel.dequeue(Some(Duration::from_secs(10))).await.is_none());

        router.transport_resumed().await;
        assert_eq!(channel.dequeue(None).await.unwrap().message.body, "a");
        assert_eq!((delegate.num_interrupted(), delegate.num_resumed()), (1, 1));
    }

    #[tokio::test]
    async fn test_remove_and_close() {
        let router = DispatchRouter::new(Arc::new(RecordingListener::default()));
        let first = router.add_channel(consumer_id(1));
        let second = router.add_channel(consumer_id(2));

        router.remove(&consumer_id(1));
        assert!(first.is_closed());
        assert_eq!(router.num_consumers(), 1);

        router.close();
        assert!(second.is_closed());
        assert_eq!(router.num_consumers(), 0);
    }

    #[tokio::test]
    async fn test_exception_stops_channels_and_is_forwarded() {
        let delegate = Arc::new(RecordingListener::default());
        let router = DispatchRouter::new(delegate.clone());
        let channel = router.add_channel(consumer_id(1));

        router.on_exception(TransportError::Disposed).await;
        assert!(!channel.is_running());
        assert_eq!(delegate.exceptions().len(), 1);
    }
}
