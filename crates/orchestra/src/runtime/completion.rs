//! Set-once completion signal shared by processes and step drivers

use tokio::sync::watch;

/// A value published once and observed by any number of waiters.
///
/// Every waiter receives a clone of the same value, no matter how many times
/// or from how many tasks it waits.
#[derive(Debug)]
pub struct Completion<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Publish the value. Only the first call has an effect.
    pub fn complete(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    /// Check if a value has been published
    pub fn is_complete(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The published value, without waiting
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait until a value is published and return a clone of it
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives as long as `self`, so `changed` cannot fail here
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_value_wins() {
        let completion = Completion::new();
        assert!(completion.complete(1));
        assert!(!completion.complete(2));
        assert_eq!(completion.wait().await, 1);
        assert_eq!(completion.get(), Some(1));
    }

    #[tokio::test]
    async fn test_waiters_released_on_complete() {
        let completion = Arc::new(Completion::<String>::new());
        assert!(!completion.is_complete());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let completion = Arc::clone(&completion);
            handles.push(tokio::spawn(async move { completion.wait().await }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        completion.complete("done".to_string());

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "done");
        }
    }
}
