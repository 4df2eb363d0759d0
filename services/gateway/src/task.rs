//! Per-task panic boundary.
//!
//! Connection, stream and tunnel-copy tasks run behind [`guarded`] so that a
//! panic becomes a [`TaskFailure`] value instead of unwinding into the
//! runtime.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{error, Instrument};

use crate::error::TaskFailure;

/// Run `fut`, converting a panic into a [`TaskFailure`].
pub async fn guarded<F>(task: &'static str, fut: F) -> Result<F::Output, TaskFailure>
where
    F: Future,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| TaskFailure {
            task,
            message: panic_message(payload.as_ref()),
        })
}

/// Spawn `fut` on the runtime behind a panic boundary. A caught panic is
/// logged at error level.
pub fn spawn_guarded<F>(task: &'static str, fut: F) -> JoinHandle<Option<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(
        async move {
            match guarded(task, fut).await {
                Ok(output) => Some(output),
                Err(failure) => {
                    error!(task = failure.task, panic = %failure.message, "Task panicked");
                    None
                }
            }
        }
        .in_current_span(),
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guarded_passes_output_through() {
        assert_eq!(guarded("ok", async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_guarded_catches_panic() {
        let failure = guarded("boom", async {
            panic!("exploded");
        })
        .await
        .unwrap_err();
        assert_eq!(failure.task, "boom");
        assert_eq!(failure.message, "exploded");
    }

    #[tokio::test]
    async fn test_spawn_guarded_survives_panic() {
        let handle = spawn_guarded("spawned", async {
            panic!("{}", String::from("formatted"));
        });
        assert_eq!(handle.await.unwrap(), None::<()>);
    }
}
