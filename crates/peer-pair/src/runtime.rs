use std::future::Future;

use once_cell::sync::Lazy;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;

static RUNTIME: Lazy<Runtime> = Lazy::new(|| Runtime::new().expect("tokio runtime"));

/// Spawns on the caller's runtime, falling back to a crate-owned one when
/// invoked outside of tokio.
pub(crate) fn spawn_task<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future)
    } else {
        RUNTIME.spawn(future)
    }
}
