//! Middleware and chain composition.
//!
//! A middleware receives the request [`Context`] and a [`Next`] handle to the
//! rest of the chain. It may touch the context before passing it on, decide
//! not to call `next` at all (short-circuit, e.g. auth rejection), or rewrite
//! the [`Response`] that comes back.
//!
//! ```rust
//! use sluice::middleware::{self, Next};
//! use sluice::{Context, Response, Server};
//!
//! let mut server = Server::new();
//! server.use_middleware(middleware::from_fn(|ctx: Context, next: Next| async move {
//!     if ctx.authorization().is_none() {
//!         return Response::new().unauthorized();
//!     }
//!     next.run(ctx).await.header("X-Checked", "1")
//! }));
//! ```
//!
//! # Composition
//!
//! For a route with middleware `[m0, m1, …, mk]` and handler `h`, the chain is
//! nested right to left:
//!
//! ```text
//! m0(ctx, Next → m1(ctx, Next → … mk(ctx, Next → h(ctx))))
//! ```
//!
//! The nesting is built once, when the route is registered. Serving a request
//! only clones one `Arc` per layer to hand out its `Next`.

mod trace;

use std::future::Future;
use std::sync::Arc;

use crate::context::Context;
use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler};
use crate::response::{IntoResponse, Response};

pub use trace::trace;

/// Object-safe middleware interface.
#[doc(hidden)]
pub trait ErasedMiddleware {
    fn call(&self, ctx: Context, next: Next) -> BoxFuture<Response>;
}

/// A type-erased middleware, shared by every route it wraps. Cloning is cheap.
#[derive(Clone)]
pub struct BoxedMiddleware(Arc<dyn ErasedMiddleware + Send + Sync + 'static>);

/// Implemented for any `Fn(Context, Next) -> impl Future<Output = impl IntoResponse>`.
///
/// Closures passed where an `impl Middleware` is expected need their argument
/// types spelled out; [`from_fn`] infers them.
pub trait Middleware: Send + Sync + 'static {
    fn boxed(self) -> BoxedMiddleware;
}

impl<F, Fut, R> Middleware for F
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn boxed(self) -> BoxedMiddleware {
        BoxedMiddleware(Arc::new(FnMiddleware(self)))
    }
}

impl Middleware for BoxedMiddleware {
    fn boxed(self) -> BoxedMiddleware {
        self
    }
}

/// Boxes a middleware closure, inferring its argument types.
pub fn from_fn<F, Fut, R>(f: F) -> BoxedMiddleware
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    BoxedMiddleware(Arc::new(FnMiddleware(f)))
}

struct FnMiddleware<F>(F);

impl<F, Fut, R> ErasedMiddleware for FnMiddleware<F>
where
    F: Fn(Context, Next) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, ctx: Context, next: Next) -> BoxFuture<Response> {
        let fut = (self.0)(ctx, next);
        Box::pin(async move { fut.await.into_response() })
    }
}

// ── Next ──────────────────────────────────────────────────────────────────────

/// The remainder of the chain: further middleware, then the handler.
///
/// `run` consumes `self`, so the rest of the chain runs at most once.
pub struct Next {
    inner: BoxedHandler,
}

impl Next {
    pub async fn run(self, ctx: Context) -> Response {
        self.inner.call(ctx).await
    }
}

// ── Composition ───────────────────────────────────────────────────────────────

/// One middleware bound to everything inside it.
struct Layer {
    middleware: Arc<dyn ErasedMiddleware + Send + Sync>,
    next: BoxedHandler,
}

impl ErasedHandler for Layer {
    fn call(&self, ctx: Context) -> BoxFuture<Response> {
        let next = Next { inner: Arc::clone(&self.next) };
        self.middleware.call(ctx, next)
    }
}

/// Wraps `handler` in `middleware`, first entry outermost.
pub(crate) fn compose(middleware: &[BoxedMiddleware], handler: BoxedHandler) -> BoxedHandler {
    middleware.iter().rev().fold(handler, |next, m| {
        let layer: BoxedHandler = Arc::new(Layer { middleware: Arc::clone(&m.0), next });
        layer
    })
}
