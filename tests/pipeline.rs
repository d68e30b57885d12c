use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use serde::Deserialize;
use sluice::middleware::{self, Next};
use sluice::validation::{self, Validate};
use sluice::{BoxError, Context, Response, Server, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn get(uri: &str) -> http::Request<Empty<Bytes>> {
    http::Request::builder().uri(uri).body(Empty::new()).unwrap()
}

async fn text(res: http::Response<Full<Bytes>>) -> String {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// ── Chain ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn server_group_and_route_middleware_nest_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let step = |name: &'static str| {
        let log = Arc::clone(&log);
        middleware::from_fn(move |ctx: Context, next: Next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{name} in"));
                let res = next.run(ctx).await;
                log.lock().unwrap().push(format!("{name} out"));
                res
            }
        })
    };

    let mut server = Server::new();
    server.use_middleware(step("server"));
    let mut api = server.group("/api");
    api.use_middleware(step("group"));
    api.route(sluice::Method::Get, "/ping", |_ctx: Context| async { "pong" }, [step("route")]);

    let res = server.handle(get("/api/ping"), "127.0.0.1:9").await;
    assert_eq!(text(res).await, "pong");
    assert_eq!(
        *log.lock().unwrap(),
        ["server in", "group in", "route in", "route out", "group out", "server out"]
    );
}

#[tokio::test]
async fn short_circuit_never_reaches_the_handler() {
    let reached = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&reached);

    let mut server = Server::new();
    server.use_middleware(middleware::from_fn(|ctx: Context, next: Next| async move {
        if ctx.authorization().is_none() {
            return Response::new().unauthorized().www_authenticate("Bearer");
        }
        next.run(ctx).await
    }));
    server.get("/secret", move |_ctx: Context| {
        flag.store(true, Ordering::SeqCst);
        async { "secret" }
    });

    let res = server.handle(get("/secret"), "127.0.0.1:9").await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(res.headers()["www-authenticate"], "Bearer");
    assert!(!reached.load(Ordering::SeqCst));
}

#[tokio::test]
async fn middleware_can_replace_the_handler_result() {
    let mut server = Server::new();
    server.use_middleware(middleware::from_fn(|ctx: Context, next: Next| async move {
        let res = next.run(ctx).await;
        if res.status_code() == StatusCode::NOT_FOUND {
            return Response::new().status(StatusCode::GONE).text("gone for good");
        }
        res
    }));
    server.get("/old", |_ctx: Context| async { Response::new().not_found() });

    let res = server.handle(get("/old"), "127.0.0.1:9").await;
    assert_eq!(res.status(), StatusCode::GONE);
    assert_eq!(text(res).await, "gone for good");
}

// ── Commit ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn after_commit_hooks_run_once_the_response_is_written() {
    let fired = Arc::new(AtomicUsize::new(0));
    let hook = Arc::clone(&fired);

    let mut server = Server::new();
    server.get("/", move |_ctx: Context| {
        let hook = Arc::clone(&hook);
        async move {
            Response::new().text("hi").after_commit(move || {
                hook.fetch_add(1, Ordering::SeqCst);
            })
        }
    });

    let res = server.handle(get("/"), "127.0.0.1:9").await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(text(res).await, "hi");
}

#[tokio::test]
async fn streamed_bodies_follow_the_head() {
    let mut server = Server::new();
    server.get("/csv", |_ctx: Context| async {
        Response::new().body_fn("text/csv", |w| {
            w.write_all(b"a,b\n")?;
            w.write_all(b"1,2\n")
        })
    });

    let res = server.handle(get("/csv"), "127.0.0.1:9").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-type"], "text/csv");
    assert_eq!(text(res).await, "a,b\n1,2\n");
}

#[tokio::test]
async fn last_body_setter_wins() {
    let mut server = Server::new();
    server.get("/", |_ctx: Context| async {
        Response::new().json(vec![1, 2]).text("plain")
    });

    let res = server.handle(get("/"), "127.0.0.1:9").await;
    assert_eq!(res.headers()["content-type"], "text/plain;charset=UTF-8");
    assert_eq!(text(res).await, "plain");
}

// ── Context ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Signup {
    email: String,
    age: i64,
}

impl Validate for Signup {
    fn validate(&self) -> Result<(), BoxError> {
        let errs = validation::require(self.email.contains('@'), "email", "email", "must be an email", None);
        let errs = validation::require_range(self.age, 18, 130, "age", errs);
        validation::result(errs)?;
        Ok(())
    }
}

async fn signup(mut ctx: Context) -> Result<Response, Response> {
    let form: Signup = ctx.bind_valid_json().await?;
    Ok(Response::new().created().text(form.email))
}

#[tokio::test]
async fn json_binding_short_circuits_with_validation_errors() {
    let mut server = Server::new();
    server.post("/signup", signup);

    let req = http::Request::post("/signup")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(br#"{"email":"nope","age":12}"#)))
        .unwrap();
    let res = server.handle(req, "127.0.0.1:9").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let body: serde_json::Value = serde_json::from_str(&text(res).await).unwrap();
    assert_eq!(body["code"], "invalid_data");
    assert_eq!(body["errors"].as_array().unwrap().len(), 2);

    let req = http::Request::post("/signup")
        .body(Full::new(Bytes::from_static(br#"{"email":"a@b.c","age":30}"#)))
        .unwrap();
    let res = server.handle(req, "127.0.0.1:9").await;
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(text(res).await, "a@b.c");
}

#[tokio::test]
async fn values_set_by_middleware_reach_the_handler() {
    let mut server = Server::new();
    server.use_middleware(middleware::from_fn(|mut ctx: Context, next: Next| async move {
        ctx.set("request_id", 7_u32);
        next.run(ctx).await
    }));
    server.get("/id", |ctx: Context| async move {
        format!("{}", ctx.must_get::<u32>("request_id"))
    });

    assert_eq!(text(server.handle(get("/id"), "127.0.0.1:9").await).await, "7");
}

#[tokio::test]
async fn forwarding_headers_need_explicit_trust() {
    let handler = |ctx: Context| async move { format!("{} {}", ctx.client_ip(), ctx.remote_ip()) };
    let req = || {
        http::Request::get("/ip")
            .header("X-Forwarded-For", "203.0.113.1, 10.0.0.2")
            .body(Empty::<Bytes>::new())
            .unwrap()
    };

    let mut untrusted = Server::new();
    untrusted.get("/ip", handler);
    assert_eq!(text(untrusted.handle(req(), "10.0.0.3:443").await).await, "10.0.0.3 10.0.0.3");

    let mut trusted = Server::new();
    trusted.trust_remote_ip_headers(true).get("/ip", handler);
    assert_eq!(text(trusted.handle(req(), "10.0.0.3:443").await).await, "203.0.113.1 10.0.0.3");
}

// ── Over a socket ─────────────────────────────────────────────────────────────

async fn roundtrip(addr: std::net::SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    // A dropped connection may surface as a reset.
    let _ = stream.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn serves_over_tcp_and_survives_a_panicking_handler() {
    let mut server = Server::new();
    server
        .get("/ok", |ctx: Context| async move { format!("hello {}", ctx.client_ip()) })
        .get("/boom", |_ctx: Context| async {
            if true {
                panic!("handler bug");
            }
            "unreachable"
        });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve_with_shutdown(listener, async {
        let _ = stopped.await;
    }));

    let boom = roundtrip(addr, "GET /boom HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
    assert!(!boom.contains("200 OK"));

    let ok = roundtrip(addr, "GET /ok HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
    assert!(ok.starts_with("HTTP/1.1 200 OK\r\n"), "{ok}");
    assert!(ok.ends_with("hello 127.0.0.1"), "{ok}");

    stop.send(()).unwrap();
    serving.await.unwrap().unwrap();
}
