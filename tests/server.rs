use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use turnstile::config::TurnstileConfig;
use turnstile::error::Result;
use turnstile::http::HttpServer;
use turnstile::ratelimit::RateLimiter;

struct RunningServer {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

async fn start_server(capacity: u64, refill_rate_per_second: f64) -> RunningServer {
    let mut config = TurnstileConfig::default();
    config.limiter.capacity = capacity;
    config.limiter.refill_rate_per_second = refill_rate_per_second;

    let limiter = Arc::new(RateLimiter::from_config(&config).unwrap());
    let server = HttpServer::new(&config, limiter);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.serve_on(listener, async move {
        let _ = stopped.await;
    }));

    RunningServer { addr, stop, handle }
}

/// Send one HTTP/1.1 request and return the raw response.
async fn get(addr: SocketAddr, account: Option<&str>) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = String::from("GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    if let Some(account) = account {
        request.push_str(&format!("X-Account-ID: {account}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("malformed response: {response}"))
}

#[tokio::test]
async fn admits_burst_then_throttles() {
    let server = start_server(3, 0.1).await;

    for i in 0..3 {
        let response = get(server.addr, Some("alice@example.com")).await;
        assert_eq!(status_of(&response), 200, "request {i} should be admitted");
        assert!(response.ends_with("Hello World!"));
    }

    let response = get(server.addr, Some("alice@example.com")).await;
    assert_eq!(status_of(&response), 429);
    assert!(response.to_ascii_lowercase().contains("retry-after:"));
    assert!(response.contains("too many requests"));

    server.stop.send(()).unwrap();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn accounts_are_isolated() {
    let server = start_server(1, 0.1).await;

    assert_eq!(status_of(&get(server.addr, Some("bob@example.com")).await), 200);
    assert_eq!(status_of(&get(server.addr, Some("bob@example.com")).await), 429);
    assert_eq!(status_of(&get(server.addr, Some("carol@example.com")).await), 200);

    server.stop.send(()).unwrap();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn anonymous_callers_limited_by_peer_address() {
    let server = start_server(2, 0.1).await;

    assert_eq!(status_of(&get(server.addr, None).await), 200);
    assert_eq!(status_of(&get(server.addr, None).await), 200);
    // Same loopback address on a new connection
    assert_eq!(status_of(&get(server.addr, None).await), 429);

    // An account header moves the caller to its own bucket
    assert_eq!(status_of(&get(server.addr, Some("dan@example.com")).await), 200);

    server.stop.send(()).unwrap();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_burst_admits_exactly_capacity() {
    let server = start_server(5, 0.01).await;

    let responses = join_all((0..20).map(|_| get(server.addr, Some("eve@example.com")))).await;
    let admitted = responses.iter().filter(|r| status_of(r) == 200).count();
    let throttled = responses.iter().filter(|r| status_of(r) == 429).count();
    assert_eq!(admitted, 5);
    assert_eq!(throttled, 15);

    server.stop.send(()).unwrap();
    server.handle.await.unwrap().unwrap();
}
