use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::command::MessageDispatch;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ChannelState {
    NotStarted,
    Running,
    Stopped,
    Closed,
}

struct ChannelInner {
    queue: VecDeque<MessageDispatch>,
    state: ChannelState,
}

/// The queue of inbound messages for one consumer. Messages are delivered in FIFO order, except
///  for messages put back at the head with [MessageDispatchChannel::enqueue_first] for
///  redelivery.
///
/// Messages can only be taken out while the channel is running. Stopping the channel keeps the
///  queued messages for when it is started again; closing it is final.
pub struct MessageDispatchChannel {
    inner: Mutex<ChannelInner>,
    changed: Notify,
}

impl Default for MessageDispatchChannel {
    fn default() -> Self {
        MessageDispatchChannel::new()
    }
}

impl MessageDispatchChannel {
    pub fn new() -> MessageDispatchChannel {
        MessageDispatchChannel {
            inner: Mutex::new(ChannelInner {
                queue: VecDeque::new(),
                state: ChannelState::NotStarted,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, dispatch: MessageDispatch) {
        self.add(dispatch, false);
    }

    /// Puts a message back at the head of the queue, so it is the next one to be delivered
    pub fn enqueue_first(&self, dispatch: MessageDispatch) {
        self.add(dispatch, true);
    }

    fn add(&self, dispatch: MessageDispatch, first: bool) {
        {
            let mut inner = self.lock();
            if inner.state == ChannelState::Closed {
                trace!("channel is closed - dropping message for {:?}", dispatch.consumer_id);
                return;
            }
            if first {
                inner.queue.push_front(dispatch);
            }
            else {
                inner.queue.push_back(dispatch);
            }
        }
        self.changed.notify_waiters();
    }

    /// Waits for the next message. Returns `None` if no message arrived before the timeout
    ///  (`None` waits without a deadline), or if the channel is not running.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Option<MessageDispatch> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // registered before checking the queue, so a concurrent enqueue is not missed
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.state != ChannelState::Running {
                    return None;
                }
                if let Some(dispatch) = inner.queue.pop_front() {
                    return Some(dispatch);
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    pub fn dequeue_no_wait(&self) -> Option<MessageDispatch> {
        let mut inner = self.lock();
        if inner.state != ChannelState::Running {
            return None;
        }
        inner.queue.pop_front()
    }

    pub fn peek(&self) -> Option<MessageDispatch> {
        let inner = self.lock();
        if inner.state != ChannelState::Running {
            return None;
        }
        inner.queue.front().cloned()
    }

    pub fn start(&self) {
        {
            let mut inner = self.lock();
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.state = ChannelState::Running;
        }
        self.changed.notify_waiters();
    }

    /// Pauses delivery. Blocked `dequeue` calls return `None`.
    pub fn stop(&self) {
        {
            let mut inner = self.lock();
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.state = ChannelState::Stopped;
        }
        self.changed.notify_waiters();
    }

    /// Idempotent
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.state == ChannelState::Closed {
                return;
            }
            debug!("closing dispatch channel with {} undelivered message(s)", inner.queue.len());
            inner.state = ChannelState::Closed;
        }
        self.changed.notify_waiters();
    }

    pub fn clear(&self) {
        self.lock().queue.clear();
    }

    /// Takes all queued messages out of the channel, regardless of its state
    pub fn remove_all(&self) -> Vec<MessageDispatch> {
        self.lock().queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.lock().state == ChannelState::Running
    }

    pub fn is_closed(&self) -> bool {
        self.lock().state == ChannelState::Closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::command::{ConnectionId, ConsumerId, Message};

    fn dispatch(message_id: &str) -> MessageDispatch {
        MessageDispatch {
            consumer_id: ConsumerId::new(ConnectionId::from("c1"), 1),
            destination: "/queue/q".to_string(),
            message: Message {
                message_id: Some(message_id.to_string()),
                ..Default::default()
            },
            redelivery_counter: 0,
        }
    }

    fn message_id(dispatch: Option<MessageDispatch>) -> Option<String> {
        dispatch.and_then(|d| d.message.message_id)
    }

    fn running_channel() -> MessageDispatchChannel {
        let channel = MessageDispatchChannel::new();
        channel.start();
        channel
    }

    #[tokio::test]
    async fn test_fifo_with_redelivery() {
        let channel = running_channel();
        channel.enqueue(dispatch("A"));
        channel.enqueue(dispatch("B"));
        channel.enqueue(dispatch("C"));

        assert_eq!(message_id(channel.dequeue(None).await).as_deref(), Some("A"));
        let b = channel.dequeue(None).await.unwrap();
        assert_eq!(b.message.message_id.as_deref(), Some("B"));

        channel.enqueue_first(b);
        assert_eq!(message_id(channel.dequeue(None).await).as_deref(), Some("B"));
        assert_eq!(message_id(channel.dequeue(None).await).as_deref(), Some("C"));
        assert!(channel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out() {
        let channel = running_channel();
        let started = Instant::now();
        assert!(channel.dequeue(Some(Duration::from_millis(100))).await.is_none());
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_not_running_returns_none() {
        let channel = MessageDispatchChannel::new();
        channel.enqueue(dispatch("A"));
        assert!(channel.dequeue(Some(Duration::from_secs(10))).await.is_none());
        assert!(channel.dequeue_no_wait().is_none());
        assert!(channel.peek().is_none());

        channel.start();
        assert_eq!(message_id(channel.peek()).as_deref(), Some("A"));
        assert_eq!(channel.len(), 1);

        channel.stop();
        assert!(!channel.is_running());
        assert!(channel.dequeue(None).await.is_none());
        assert_eq!(channel.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_wakes_waiter() {
        let channel = Arc::new(running_channel());
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.dequeue(Some(Duration::from_secs(10))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        channel.enqueue(dispatch("A"));
        assert_eq!(message_id(waiter.await.unwrap()).as_deref(), Some("A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_all_waiters() {
        let channel = Arc::new(running_channel());
        let waiters = (0..3)
            .map(|_| {
                let channel = channel.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    (channel.dequeue(Some(Duration::from_secs(60))).await, started.elapsed())
                })
            })
            .collect::<Vec<_>>();
        tokio::time::sleep(Duration::from_millis(10)).await;

        channel.close();
        channel.close();
        for waiter in waiters {
            let (result, elapsed) = waiter.await.unwrap();
            assert!(result.is_none());
            assert!(elapsed < Duration::from_secs(1));
        }
        assert!(channel.is_closed());

        channel.start();
        assert!(channel.is_closed());
        channel.enqueue(dispatch("A"));
        assert!(channel.is_empty());
    }

    #[test]
    fn test_remove_all_and_clear() {
        let channel = MessageDispatchChannel::new();
        channel.enqueue(dispatch("A"));
        channel.enqueue(dispatch("B"));

        let removed = channel.remove_all().into_iter()
            .map(|d| d.message.message_id.unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(removed, vec!["A", "B"]);
        assert!(channel.is_empty());

        channel.enqueue(dispatch("C"));
        channel.clear();
        assert_eq!(channel.len(), 0);
    }
}
