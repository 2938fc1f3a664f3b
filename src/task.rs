use std::future::Future;
use tokio::task::JoinHandle;
use tracing::warn;

/// Handle to a background task owned by one of the components.
///
/// Dropping the handle detaches the task; call [`TaskHandle::abort`] to stop
/// it, or [`TaskHandle::join`] to wait for it to finish.
#[derive(Debug)]
pub struct TaskHandle<T = ()> {
    name: &'static str,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            name,
            handle: tokio::spawn(future),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task. `None` if it was aborted or panicked.
    pub async fn join(self) -> Option<T> {
        match self.handle.await {
            Ok(value) => Some(value),
            Err(e) if e.is_cancelled() => None,
            Err(e) => {
                warn!(task = self.name, "background task panicked: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_join_returns_output() {
        let handle = TaskHandle::spawn("answer", async { 42 });
        assert_eq!(handle.name(), "answer");
        assert_eq!(handle.join().await, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_yields_none() {
        let handle = TaskHandle::spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        handle.abort();
        assert_eq!(handle.join().await, None);
    }
}
