use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures::Stream;
use tokio::sync::{Mutex, Notify};

use tether_types::{new_message_id, QueueItem};

struct QueueState {
    items: VecDeque<QueueItem>,
    running: bool,
    epoch: u64,
}

/// Buffer between accepted user turns and the engine invocation consuming
/// them. Each start() opens a new pull epoch; generators created under an
/// older epoch terminate instead of stealing items from the new one.
pub struct MessageQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                running: false,
                epoch: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub async fn enqueue(&self, text: impl Into<String>, is_command: bool) -> String {
        let id = new_message_id();
        self.enqueue_with_id(id.clone(), text, is_command).await;
        id
    }

    pub async fn enqueue_with_id(&self, id: String, text: impl Into<String>, is_command: bool) {
        let mut state = self.state.lock().await;
        state.items.push_back(QueueItem {
            id,
            text: text.into(),
            is_command,
        });
        drop(state);
        self.notify.notify_waiters();
    }

    /// Claims the queue for a new pull epoch. Returns false when the queue
    /// is already running, leaving the live epoch untouched. Check and claim
    /// happen under a single lock, so exactly one of several concurrent
    /// callers wins the claim.
    pub async fn try_start(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.running {
            return false;
        }
        state.running = true;
        state.epoch += 1;
        drop(state);
        self.notify.notify_waiters();
        true
    }

    /// Opens a new pull epoch. Calling start on a running queue is a no-op,
    /// the live generator keeps its epoch.
    pub async fn start(&self) {
        self.try_start().await;
    }

    /// Ends the current pull sequence. Buffered items are retained for the
    /// next epoch; clear() is the only way to drop them.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.running = false;
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.items.clear();
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Stream of queued items in arrival order. Waits while the queue is
    /// empty and ends when the queue stops or a newer epoch begins. The
    /// epoch is bound at creation, so a generator obtained before a restart
    /// can never serve the new epoch.
    pub async fn message_generator(
        self: Arc<Self>,
    ) -> Pin<Box<dyn Stream<Item = QueueItem> + Send>> {
        let epoch = self.state.lock().await.epoch;
        Box::pin(stream! {
            loop {
                let next = {
                    let mut state = self.state.lock().await;
                    if state.epoch != epoch || !state.running {
                        break;
                    }
                    state.items.pop_front()
                };
                if let Some(item) = next {
                    yield item;
                    continue;
                }

                // Register the waiter before re-checking so an enqueue
                // landing in between cannot be missed.
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let recheck = {
                    let mut state = self.state.lock().await;
                    if state.epoch != epoch || !state.running {
                        break;
                    }
                    state.items.pop_front()
                };
                match recheck {
                    Some(item) => yield item,
                    None => notified.await,
                }
            }
        })
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn generator_yields_in_arrival_order_and_waits_when_empty() {
        let queue = Arc::new(MessageQueue::new());
        queue.enqueue("first", false).await;
        queue.enqueue("second", false).await;
        queue.start().await;

        let mut generator = queue.clone().message_generator().await;
        let first = generator.next().await.expect("first item");
        let second = generator.next().await.expect("second item");
        assert_eq!(first.text, "first");
        assert_eq!(second.text, "second");

        // Queue is now empty; the generator must wait, not terminate.
        let waiting = timeout(Duration::from_millis(50), generator.next()).await;
        assert!(waiting.is_err());

        queue.enqueue("third", false).await;
        let third = timeout(Duration::from_secs(1), generator.next())
            .await
            .expect("woken in time")
            .expect("third item");
        assert_eq!(third.text, "third");
    }

    #[tokio::test]
    async fn stop_ends_generator_but_retains_items() {
        let queue = Arc::new(MessageQueue::new());
        queue.start().await;
        let mut generator = queue.clone().message_generator().await;

        queue.enqueue("kept", false).await;
        queue.stop().await;

        let ended = timeout(Duration::from_secs(1), generator.next())
            .await
            .expect("generator settles after stop");
        assert!(ended.is_none());
        assert_eq!(queue.size().await, 1);

        queue.start().await;
        let mut fresh = queue.clone().message_generator().await;
        let kept = timeout(Duration::from_secs(1), fresh.next())
            .await
            .expect("fresh generator wakes")
            .expect("retained item");
        assert_eq!(kept.text, "kept");
    }

    #[tokio::test]
    async fn stale_generator_terminates_after_restart() {
        let queue = Arc::new(MessageQueue::new());
        queue.start().await;
        let mut stale = queue.clone().message_generator().await;

        queue.stop().await;
        queue.start().await;
        queue.enqueue("for the new epoch", false).await;

        let ended = timeout(Duration::from_secs(1), stale.next())
            .await
            .expect("stale generator settles");
        assert!(ended.is_none());

        let mut fresh = queue.clone().message_generator().await;
        let item = timeout(Duration::from_secs(1), fresh.next())
            .await
            .expect("fresh generator wakes")
            .expect("item for new epoch");
        assert_eq!(item.text, "for the new epoch");
    }

    #[tokio::test]
    async fn generator_before_start_terminates_immediately() {
        let queue = Arc::new(MessageQueue::new());
        queue.enqueue("buffered", false).await;
        let mut generator = queue.clone().message_generator().await;
        assert!(generator.next().await.is_none());
        assert_eq!(queue.size().await, 1);
    }

    #[tokio::test]
    async fn enqueue_with_id_preserves_caller_id_and_flag() {
        let queue = Arc::new(MessageQueue::new());
        queue
            .enqueue_with_id("turn-1".to_string(), "/context", true)
            .await;
        queue.start().await;

        let mut generator = queue.clone().message_generator().await;
        let item = generator.next().await.expect("item");
        assert_eq!(item.id, "turn-1");
        assert!(item.is_command);
    }

    #[tokio::test]
    async fn try_start_admits_exactly_one_claimant() {
        let queue = MessageQueue::new();
        assert!(queue.try_start().await);
        assert!(!queue.try_start().await);
        assert!(queue.is_running().await);

        queue.stop().await;
        assert!(queue.try_start().await);
    }

    #[tokio::test]
    async fn clear_drops_buffered_items() {
        let queue = MessageQueue::new();
        queue.enqueue("a", false).await;
        queue.enqueue("b", false).await;
        assert_eq!(queue.size().await, 2);
        queue.clear().await;
        assert_eq!(queue.size().await, 0);
        assert!(!queue.is_running().await);
    }
}
