use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use uuid::Uuid;

/// FIFO of command ids. Retries go back in at the front.
#[derive(Default)]
pub struct CommandQueue {
    items: Mutex<VecDeque<Uuid>>,
    wake: Notify,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&self, id: Uuid) -> usize {
        let len = self.with_items(|items| {
            items.push_back(id);
            items.len()
        });
        self.wake.notify_one();
        len
    }

    pub fn push_front(&self, id: Uuid) -> usize {
        let len = self.with_items(|items| {
            items.push_front(id);
            items.len()
        });
        self.wake.notify_one();
        len
    }

    pub fn pop_front(&self) -> Option<Uuid> {
        self.with_items(|items| items.pop_front())
    }

    /// Removes `id` if it is still waiting. Returns whether it was found.
    pub fn remove(&self, id: &Uuid) -> bool {
        self.with_items(|items| match items.iter().position(|queued| queued == id) {
            Some(index) => items.remove(index).is_some(),
            None => false,
        })
    }

    pub fn len(&self) -> usize {
        self.with_items(|items| items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once something has been pushed since the last wake-up.
    pub async fn notified(&self) {
        self.wake.notified().await;
    }

    fn with_items<R>(&self, f: impl FnOnce(&mut VecDeque<Uuid>) -> R) -> R {
        let mut items = match self.items.lock() {
            Ok(items) => items,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_jump_the_line() {
        let queue = CommandQueue::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        queue.push_back(a);
        queue.push_back(b);
        assert_eq!(queue.pop_front(), Some(a));
        queue.push_front(a);
        queue.push_back(c);

        assert_eq!(queue.pop_front(), Some(a));
        assert_eq!(queue.pop_front(), Some(b));
        assert_eq!(queue.pop_front(), Some(c));
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_only_waiting_entries() {
        let queue = CommandQueue::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        queue.push_back(a);

        assert!(queue.remove(&a));
        assert!(!queue.remove(&a));
        assert!(!queue.remove(&b));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn push_wakes_a_waiting_consumer() {
        let queue = std::sync::Arc::new(CommandQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.notified().await })
        };
        tokio::task::yield_now().await;

        queue.push_back(Uuid::new_v4());

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
