//! Radix-tree route table and route groups.
//!
//! One tree per HTTP method, O(path-length) lookup. Each stored value is a
//! fully composed chain: the middleware in effect when the route was
//! registered, wrapped around its handler. Nothing is assembled per request.
//!
//! Lookup outcomes:
//!
//! | request                                  | outcome                         |
//! |------------------------------------------|---------------------------------|
//! | method + path registered                 | the route's chain               |
//! | `HEAD`, only `GET` registered for path   | the `GET` chain                 |
//! | path registered under other methods only | `405` with an `Allow` header    |
//! | path not registered at all               | `404`                           |

use std::collections::HashMap;
use std::sync::Arc;

use matchit::Router as MatchitRouter;

use crate::handler::{BoxedHandler, Handler};
use crate::method::Method;
use crate::middleware::{self, BoxedMiddleware, Middleware};

/// The route table.
#[derive(Default)]
pub(crate) struct Mux {
    routes: HashMap<Method, MatchitRouter<BoxedHandler>>,
}

pub(crate) enum Lookup {
    Found(BoxedHandler, HashMap<String, String>),
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// Panics if `path` is not a valid route or conflicts with one already
    /// registered for `method`.
    pub(crate) fn insert(&mut self, method: Method, path: &str, chain: BoxedHandler) {
        self.routes
            .entry(method)
            .or_default()
            .insert(path, chain)
            .unwrap_or_else(|e| panic!("invalid route `{method} {path}`: {e}"));
    }

    pub(crate) fn lookup(&self, method: &http::Method, path: &str) -> Lookup {
        if let Ok(method) = Method::try_from(method) {
            if let Some(found) = self.find(method, path) {
                return found;
            }
            if method == Method::Head {
                if let Some(found) = self.find(Method::Get, path) {
                    return found;
                }
            }
        }

        let allowed: Vec<Method> = Method::ALL
            .into_iter()
            .filter(|&m| self.matches(m, path) || (m == Method::Head && self.matches(Method::Get, path)))
            .collect();
        if allowed.is_empty() { Lookup::NotFound } else { Lookup::MethodNotAllowed(allowed) }
    }

    fn find(&self, method: Method, path: &str) -> Option<Lookup> {
        let matched = self.routes.get(&method)?.at(path).ok()?;
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some(Lookup::Found(Arc::clone(matched.value), params))
    }

    fn matches(&self, method: Method, path: &str) -> bool {
        self.routes.get(&method).is_some_and(|tree| tree.at(path).is_ok())
    }
}

// ── Group ─────────────────────────────────────────────────────────────────────

/// Registers routes under a shared path prefix and middleware stack.
///
/// A group starts with a snapshot of its parent's middleware; middleware added
/// to the group afterwards applies only to the group's own routes, and only
/// to routes registered after it was added.
///
/// ```rust
/// use sluice::{Context, Response, Server};
/// use sluice::middleware::{self, Next};
///
/// async fn list(_: Context) -> Response { Response::new().json(Vec::<u32>::new()) }
/// async fn show(ctx: Context) -> String { ctx.path_value("id").unwrap_or_default().to_owned() }
///
/// let mut server = Server::new();
/// let mut api = server.group("/api");
/// api.use_middleware(middleware::from_fn(|ctx: Context, next: Next| next.run(ctx)));
///
/// let mut users = api.group("/users");
/// users.get("", list).get("/{id}", show);
/// ```
pub struct Group<'a> {
    mux: &'a mut Mux,
    prefix: String,
    middleware: Vec<BoxedMiddleware>,
}

impl<'a> Group<'a> {
    pub(crate) fn new(mux: &'a mut Mux, prefix: String, middleware: Vec<BoxedMiddleware>) -> Self {
        Self { mux, prefix, middleware }
    }

    /// A nested group: prefixes concatenate, middleware is inherited.
    pub fn group(&mut self, prefix: &str) -> Group<'_> {
        Group {
            mux: &mut *self.mux,
            prefix: format!("{}{prefix}", self.prefix),
            middleware: self.middleware.clone(),
        }
    }

    /// Appends middleware to this group's stack.
    pub fn use_middleware(&mut self, middleware: impl Middleware) -> &mut Self {
        self.middleware.push(middleware.boxed());
        self
    }

    /// Registers `handler` behind the group's middleware followed by
    /// `route_middleware`. An empty full path registers `/`.
    ///
    /// # Panics
    ///
    /// Panics on an invalid or conflicting route.
    pub fn route<I>(&mut self, method: Method, path: &str, handler: impl Handler, route_middleware: I) -> &mut Self
    where
        I: IntoIterator<Item = BoxedMiddleware>,
    {
        let mut stack = self.middleware.clone();
        stack.extend(route_middleware);

        let mut full = format!("{}{path}", self.prefix);
        if full.is_empty() {
            full.push('/');
        }
        let chain = middleware::compose(&stack, handler.into_boxed_handler());
        self.mux.insert(method, &full, chain);
        self
    }

    pub fn on(&mut self, method: Method, path: &str, handler: impl Handler) -> &mut Self {
        self.route(method, path, handler, [])
    }

    pub fn get(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::Get, path, handler)
    }

    pub fn head(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::Head, path, handler)
    }

    pub fn post(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::Post, path, handler)
    }

    pub fn put(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::Put, path, handler)
    }

    pub fn patch(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::Patch, path, handler)
    }

    pub fn delete(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::Delete, path, handler)
    }

    pub fn options(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::Options, path, handler)
    }
}
