use cortex_lib::error::ErrorKind;

/// Run a blocking store operation off the async worker threads.
///
/// A panic in the closure is contained to the one frame being served: it
/// surfaces as `internal` on that connection and the daemon keeps running.
pub async fn asyncify<F, T>(f: F) -> Result<T, ErrorKind>
where
    F: FnOnce() -> Result<T, ErrorKind> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => {
            log::error!("blocking task failed: {e}");
            Err(ErrorKind::Internal)
        }
    }
}
