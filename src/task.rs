//! Supervised tasks
//!
//! Every unit of work the engine spawns (accept loops, sessions, pump
//! directions, SSH watchers) goes through [`spawn_supervised`]. A panic inside
//! the task is caught at the task boundary, logged with its label, and turned
//! into a `None` result for whoever awaits the handle. The process keeps
//! running.

use std::any::Any;
use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Spawn `fut` under a supervisor.
///
/// The returned handle resolves to `Some(output)` when the task completes
/// normally and `None` when it panicked or was cancelled.
pub fn spawn_supervised<F>(label: impl Into<String>, fut: F) -> JoinHandle<Option<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn_supervised_with_fault(label, fut, || {})
}

/// Like [`spawn_supervised`], with `on_fault` run after a panic is caught.
pub fn spawn_supervised_with_fault<F, C>(
    label: impl Into<String>,
    fut: F,
    on_fault: C,
) -> JoinHandle<Option<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    C: FnOnce() + Send + 'static,
{
    let label = label.into();
    let inner = tokio::spawn(fut);
    tokio::spawn(async move {
        match inner.await {
            Ok(output) => Some(output),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!("Task {} crashed: {}", label, message);
                on_fault();
                None
            }
            Err(e) => {
                warn!("Task {} cancelled: {}", label, e);
                None
            }
        }
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_supervised_task_returns_output() {
        let handle = spawn_supervised("answer", async { 42 });
        assert_eq!(handle.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_supervised_task_catches_panic() {
        let handle = spawn_supervised("faulty", async {
            panic!("boom");
        });
        let result: Option<()> = handle.await.unwrap();
        assert!(result.is_none());

        // Runtime is still usable afterwards
        let handle = spawn_supervised("after", async { "ok" });
        assert_eq!(handle.await.unwrap(), Some("ok"));
    }

    #[tokio::test]
    async fn test_fault_callback_runs_only_on_panic() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let faults = Arc::new(AtomicUsize::new(0));

        let counter = faults.clone();
        let handle = spawn_supervised_with_fault("clean", async {}, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(handle.await.unwrap(), Some(()));
        assert_eq!(faults.load(Ordering::SeqCst), 0);

        let counter = faults.clone();
        let handle = spawn_supervised_with_fault(
            "faulty",
            async {
                panic!("boom");
            },
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        let result: Option<()> = handle.await.unwrap();
        assert!(result.is_none());
        assert_eq!(faults.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_message_formats() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic payload");
    }
}
