//! A small notes service showing the whole pipeline.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/notes/1
//!   curl -i http://localhost:3000/notes/1 -H 'If-None-Match: "note-1-v3"'
//!   curl -i -X POST http://localhost:3000/notes \
//!        -H 'authorization: Bearer demo' \
//!        -H 'content-type: application/json' \
//!        -d '{"title":"","body":"x"}'
//!   curl -i -X POST http://localhost:3000/login -d 'user=ada'
//!   curl -i http://localhost:3000/export
//!   curl -i http://localhost:3000/whoami -H 'X-Forwarded-For: 203.0.113.5'

use std::io::Write;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sluice::middleware::{self, Next};
use sluice::validation::{self, Validate};
use sluice::{BoxError, Context, Cookie, ErrorBody, Response, SameSite, Server};

#[derive(Deserialize, Serialize)]
struct Note {
    title: String,
    body: String,
}

impl Validate for Note {
    fn validate(&self) -> Result<(), BoxError> {
        let errs = validation::require_not_blank(&self.title, "title", None);
        let errs = validation::require_length(&self.title, 1, 80, "title", errs);
        let errs = validation::require_length(&self.body, 0, 10_000, "body", errs);
        validation::result(errs)?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), sluice::Error> {
    tracing_subscriber::fmt::init();

    let mut server = Server::new();
    server
        .trust_remote_ip_headers(true)
        .use_middleware(middleware::trace());

    server
        .get("/whoami", whoami)
        .post("/login", login)
        .get("/export", export);

    let mut notes = server.group("/notes");
    notes.get("/{id}", show_note);
    notes.route(sluice::Method::Post, "", create_note, [middleware::from_fn(require_token)]);

    server.serve("0.0.0.0:3000").await
}

// GET /whoami
async fn whoami(ctx: Context) -> Response {
    Response::new().json(serde_json::json!({
        "client_ip": ctx.client_ip(),
        "remote_ip": ctx.remote_ip(),
        "chain": ctx.ips(),
    }))
}

// GET /notes/{id}
//
// Conditional helpers return the finished 304/412 as the error side, so `?`
// ends the request early.
async fn show_note(ctx: Context) -> Result<Response, Response> {
    let id = ctx.path_value("id").unwrap_or_default().to_owned();
    let etag = format!("note-{id}-v3");
    let modified = SystemTime::now() - Duration::from_secs(3600);

    ctx.conditional_if_none_match(&etag)?;
    ctx.conditional_if_modified_since(&[modified])?;

    Ok(Response::new()
        .etag(&etag)
        .last_modified(modified)
        .cache_control("private, max-age=60")
        .json(Note { title: format!("note {id}"), body: String::from("hello") }))
}

// POST /notes
async fn create_note(mut ctx: Context) -> Result<Response, Response> {
    let note: Note = ctx.bind_valid_json().await?;
    let user: &String = ctx.must_get("user");
    tracing::info!(%user, title = %note.title, "note created");
    Ok(Response::new().created_with(note).location("/notes/2"))
}

// POST /login (urlencoded or multipart form)
async fn login(mut ctx: Context) -> Response {
    let Some(user) = ctx.form_value("user").await.map(str::to_owned) else {
        return Response::new().bad_request_with(ErrorBody::new("BadRequest", "missing 'user'"));
    };
    Response::new()
        .no_content()
        .cookie(
            Cookie::new("session", user)
                .max_age(3600)
                .http_only(true)
                .secure(true)
                .same_site(SameSite::Lax),
        )
}

// GET /export
//
// The writer runs at commit time, after status and headers went out.
async fn export(_ctx: Context) -> Response {
    Response::new()
        .content_disposition("attachment; filename=\"notes.csv\"")
        .body_fn("text/csv", |w| {
            writeln!(w, "id,title")?;
            for id in 1..=3 {
                writeln!(w, "{id},note {id}")?;
            }
            Ok(())
        })
}

async fn require_token(mut ctx: Context, next: Next) -> Response {
    match ctx.authorization().and_then(|h| h.strip_prefix("Bearer ")) {
        Some("demo") => {
            ctx.set("user", String::from("demo"));
            next.run(ctx).await
        }
        _ => Response::new()
            .unauthorized_with(ErrorBody::new("Unauthorized", "missing or invalid token"))
            .www_authenticate("Bearer"),
    }
}
