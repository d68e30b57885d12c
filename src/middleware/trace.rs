//! Request logging.

use std::time::Instant;

use tracing::info;

use super::{BoxedMiddleware, Next, from_fn};
use crate::context::Context;

/// Logs one `info` event per request once its response has been committed:
/// client IP, method, path, final status and the elapsed milliseconds.
///
/// Register it first so the duration covers the whole chain:
///
/// ```rust
/// # let mut server = sluice::Server::new();
/// server.use_middleware(sluice::middleware::trace());
/// ```
pub fn trace() -> BoxedMiddleware {
    from_fn(|ctx: Context, next: Next| async move {
        let start = Instant::now();
        let ip = ctx.client_ip().to_owned();
        let method = ctx.method().clone();
        let path = ctx.path().to_owned();

        let res = next.run(ctx).await;
        let status = res.status_code().as_u16();
        res.after_commit(move || {
            info!(
                ip = %ip,
                method = %method,
                path = %path,
                status,
                duration_ms = start.elapsed().as_millis() as u64,
                "request"
            );
        })
    })
}
