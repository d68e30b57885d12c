//! # sluice
//!
//! A request pipeline for HTTP services that live behind a reverse proxy.
//!
//! ## The contract
//!
//! A request flows through an ordered chain of middleware into one handler.
//! The handler *builds* a [`Response`] value; nothing touches the connection
//! until the whole chain has returned. Only then is the response committed,
//! exactly once: headers, cookies, status, body, in that order, followed by
//! any after-commit hooks (access logs, metrics).
//!
//! Because the response is a value, middleware can inspect and rewrite what
//! a handler produced, and a handler can bail out early by returning a
//! finished rejection:
//!
//! - [`Context`] wraps the request: headers, query, cookies, JSON and form
//!   bodies, conditional request checks, the client address chain and a
//!   typed key/value store shared along the chain.
//! - [`Response`] is the deferred builder with status shorthands and typed
//!   header setters.
//! - [`IpResolver`] rebuilds the client address from forwarding headers, but
//!   only when they are explicitly trusted.
//! - [`validation`] aggregates field violations into one structured `400`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use serde::Deserialize;
//! use sluice::validation::{self, Validate};
//! use sluice::{BoxError, Context, Response, Server, middleware};
//!
//! #[derive(Deserialize)]
//! struct NewNote { title: String }
//!
//! impl Validate for NewNote {
//!     fn validate(&self) -> Result<(), BoxError> {
//!         validation::result(validation::require_not_blank(&self.title, "title", None))?;
//!         Ok(())
//!     }
//! }
//!
//! async fn create_note(mut ctx: Context) -> Result<Response, Response> {
//!     let note: NewNote = ctx.bind_valid_json().await?;
//!     Ok(Response::new().created().location("/notes/1").text(note.title))
//! }
//!
//! async fn show_note(ctx: Context) -> Result<Response, Response> {
//!     ctx.conditional_if_none_match("v1")?;
//!     Ok(Response::new().etag("v1").json(ctx.path_value("id").map(str::to_owned)))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sluice::Error> {
//!     let mut server = Server::new();
//!     server.use_middleware(middleware::trace());
//!
//!     let mut notes = server.group("/notes");
//!     notes.post("", create_note).get("/{id}", show_note);
//!
//!     server.serve("0.0.0.0:3000").await
//! }
//! ```

mod config;
mod context;
mod error;
mod handler;
mod ip;
mod method;
mod response;
mod router;
mod server;
mod sink;

pub mod middleware;
pub mod validation;

pub use http::StatusCode;

pub use config::{Config, DEFAULT_MAX_MULTIPART_MEMORY};
pub use context::{Body, Context, TypeMismatch, Values, box_body};
pub use error::{BoxError, Error, ErrorBody};
pub use handler::Handler;
pub use ip::{IpResolver, ResolveIp};
pub use method::Method;
pub use middleware::{Middleware, Next};
pub use response::{BodyFn, Cookie, IntoResponse, Response, SameSite};
pub use router::Group;
pub use server::Server;
pub use sink::{BufferedSink, ResponseSink, WireSink};
