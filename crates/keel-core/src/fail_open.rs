//! Fail-open helpers for side effects that must never stop a run
//!
//! Only for work nothing reads back: writing the derived status report,
//! removing orphaned isolation contexts. Agent calls, admission checks and
//! checkpoint writes always propagate their errors.

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run an operation, logging and discarding its error
///
/// ```no_run
/// use keel_core::fail_open::fail_open;
/// use keel_core::Result;
///
/// async fn write_report() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let written = fail_open("status_report", write_report).await;
///     assert!(written.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!(operation = operation_name, error = %e, "operation failed (fail-open)");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeelError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, KeelError>(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_fail_open_failure() {
        let result = fail_open("test_op", || async {
            Err::<i32, _>(KeelError::Other("disk full".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }
}
