//! Integration tests for the proxy surface.
//!
//! These tests start a real proxy on a random port in front of a wiremock
//! origin and talk to it over HTTP and raw TCP.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use axum::http::StatusCode;
use clap::Parser;
use kccp_cache::{GATEWAY_FAILURE, Stat};
use kccp_proxy::{AppState, ProxyConfig};
use pretty_assertions::assert_eq;
use std::{net::SocketAddr, path::Path, sync::Arc};
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_string, header, method, path},
};

/// Start a proxy for the cache in `dir` and return its address.
async fn start_proxy(dir: &TempDir, extra: &[&str]) -> (SocketAddr, Arc<AppState>) {
    kccp_cache::origin::ensure_crypto_provider();

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind proxy listener");
    let addr = listener.local_addr().unwrap();

    let cache = dir.path().join("cache");
    let bind = addr.to_string();
    let mut args = vec![
        "kccp",
        "--bind",
        bind.as_str(),
        "--cache-dir",
        cache.to_str().unwrap(),
    ];
    args.extend_from_slice(extra);
    let config = ProxyConfig::try_parse_from(args).unwrap();
    config.validate().unwrap();

    let state = Arc::new(AppState::new(config).await.expect("Failed to build state"));
    let serving = Arc::clone(&state);
    tokio::spawn(async move {
        kccp_proxy::http::serve(listener, serving, std::future::pending())
            .await
            .expect("Proxy failed to run");
    });

    (addr, state)
}

/// Client that talks to the proxy as a plain web server.
fn direct_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Client that uses the proxy for every `http://` URL.
fn proxied_client(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy}")).unwrap())
        .build()
        .unwrap()
}

/// An address with nothing listening.
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn origin_host(server: &MockServer) -> String {
    server.address().to_string()
}

#[tokio::test]
async fn test_asset_is_cached_through_proxy() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/kcs2/img/title.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![7_u8; 300])
                .insert_header("last-modified", "Mon, 01 Jan 2024 00:00:00 GMT"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (proxy, state) = start_proxy(&dir, &[]).await;
    let client = proxied_client(proxy);
    let url = format!("http://{}/kcs2/img/title.png?version=5", origin_host(&server));

    for _ in 0..2 {
        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "image/png");
        assert_eq!(response.bytes().await.unwrap().as_ref(), [7_u8; 300].as_slice());
    }

    assert_eq!(state.stats().get(Stat::TotalHandled), 2);
    assert_eq!(state.stats().get(Stat::Fetched), 1);
    assert_eq!(state.stats().get(Stat::InCache), 1);
    assert!(dir.path().join("cache/kcs2/img/title.png").exists());
}

#[tokio::test]
async fn test_shorthand_path_reaches_origin() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/kcs2/version.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"api":"1"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let (proxy, _state) = start_proxy(&dir, &[]).await;
    let url = format!(
        "http://{proxy}/http/{}/kcs2/version.json?1.0",
        origin_host(&server)
    );
    let response = direct_client().get(&url).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), r#"{"api":"1"}"#);
}

#[tokio::test]
async fn test_api_call_is_passed_through() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/kcsapi/api_port/port"))
        .and(body_string("api_token=abc"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("svdata={}")
                .insert_header("x-origin", "game"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (proxy, state) = start_proxy(&dir, &[]).await;
    let response = proxied_client(proxy)
        .post("http://203.0.113.9/kcsapi/api_port/port")
        .header("x-kcp-host", origin_host(&server))
        .body("api_token=abc")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-origin"], "game");
    assert_eq!(response.text().await.unwrap(), "svdata={}");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(!received[0].headers.contains_key("x-kcp-host"));
    assert_eq!(state.stats().get(Stat::PassthroughHttp), 1);
    assert_eq!(state.stats().get(Stat::Passthrough), 1);
    assert_eq!(state.stats().get(Stat::TotalHandled), 0);
}

#[tokio::test]
async fn test_php_endpoint_is_not_cached() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/kcs2/index.php"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .expect(2)
        .mount(&server)
        .await;

    let (proxy, state) = start_proxy(&dir, &[]).await;
    let client = proxied_client(proxy);
    let url = format!("http://{}/kcs2/index.php?api_root=/kcsapi", origin_host(&server));
    for _ in 0..2 {
        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.text().await.unwrap(), "<html>");
    }
    assert_eq!(state.stats().get(Stat::PassthroughHttp), 2);
    assert!(state.engine().index().is_empty());
}

#[tokio::test]
async fn test_loopback_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (proxy, _state) = start_proxy(&dir, &[]).await;

    let url = format!("http://{proxy}/http/{proxy}/kcsapi/api_start2");
    let response = direct_client().post(&url).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.text().await.unwrap(),
        "Attempted to proxy a loopback connection."
    );
}

#[tokio::test]
async fn test_unreachable_passthrough_is_bad_gateway() {
    let dir = TempDir::new().unwrap();
    let (proxy, _state) = start_proxy(&dir, &[]).await;
    let closed = closed_port().await;

    let url = format!("http://{proxy}/http/{closed}/kcsapi/api_start2");
    let response = direct_client().post(&url).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(
        response
            .text()
            .await
            .unwrap()
            .starts_with("Error proxying request: ")
    );
}

#[tokio::test]
async fn test_unreachable_asset_without_copy_is_gateway_failure() {
    let dir = TempDir::new().unwrap();
    let (proxy, state) = start_proxy(&dir, &[]).await;
    let closed = closed_port().await;

    let url = format!("http://{proxy}/http/{closed}/kcs2/img/title.png?1");
    let response = direct_client().get(&url).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.text().await.unwrap(), GATEWAY_FAILURE);
    assert_eq!(state.stats().get(Stat::Failed), 1);
}

#[tokio::test]
async fn test_connect_opens_tunnel() {
    let dir = TempDir::new().unwrap();
    let (proxy, state) = start_proxy(&dir, &[]).await;

    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = echo.accept().await.unwrap();
        let mut buf = [0_u8; 64];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            socket.write_all(&buf[..n]).await.unwrap();
        }
    });

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    stream.write_all(b"opaque tls bytes").await.unwrap();
    let mut echoed = [0_u8; 16];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"opaque tls bytes");

    assert_eq!(state.stats().get(Stat::PassthroughHttps), 1);
    assert_eq!(state.stats().get(Stat::Passthrough), 1);
}

#[tokio::test]
async fn test_connect_to_closed_port_is_bad_gateway() {
    let dir = TempDir::new().unwrap();
    let (proxy, _state) = start_proxy(&dir, &[]).await;
    let closed = closed_port().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {closed} HTTP/1.1\r\nHost: {closed}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 502"), "{head}");
}

/// Read a response head up to the blank line.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

fn write_pack(mods: &Path) {
    std::fs::create_dir_all(mods.join("speed/kcs2/js/main.js")).unwrap();
    std::fs::write(
        mods.join("speed.mod.json"),
        r#"{"name":"speed","version":"1.0","authors":["tester"]}"#,
    )
    .unwrap();
    std::fs::write(mods.join("speed/kcs2/js/main.js/original.js"), "var speed = 1;").unwrap();
    std::fs::write(mods.join("speed/kcs2/js/main.js/patched.js"), "var speed = 2;").unwrap();
    std::fs::write(
        mods.join("mods.json"),
        r#"[{"path":"speed.mod.json"}]"#,
    )
    .unwrap();
}

#[tokio::test]
async fn test_mod_rewrites_served_asset() {
    let dir = TempDir::new().unwrap();
    let mods = dir.path().join("mods");
    write_pack(&mods);

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/kcs2/js/main.js"))
        .and(header("user-agent", "kancolle"))
        .respond_with(ResponseTemplate::new(200).set_body_string("var speed = 1;"))
        .expect(1)
        .mount(&server)
        .await;

    let mods_file = mods.join("mods.json");
    let (proxy, state) = start_proxy(
        &dir,
        &["--enable-modder", "--mods", mods_file.to_str().unwrap()],
    )
    .await;
    assert_eq!(state.pipeline().unwrap().table().len(), 1);

    let client = proxied_client(proxy);
    let url = format!("http://{}/kcs2/js/main.js?version=6.1", origin_host(&server));
    for _ in 0..2 {
        let response = client
            .get(&url)
            .header("user-agent", "kancolle")
            .send()
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "var speed = 2;");
    }

    // The cache keeps the unmodified origin bytes
    assert_eq!(
        std::fs::read_to_string(dir.path().join("cache/kcs2/js/main.js")).unwrap(),
        "var speed = 1;"
    );
}

#[tokio::test]
async fn test_reload_applies_changed_pack_without_restart() {
    let dir = TempDir::new().unwrap();
    let mods = dir.path().join("mods");
    write_pack(&mods);

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/kcs2/js/main.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string("var speed = 1;"))
        .expect(1)
        .mount(&server)
        .await;

    let mods_file = mods.join("mods.json");
    let (proxy, state) = start_proxy(
        &dir,
        &["--enable-modder", "--mods", mods_file.to_str().unwrap()],
    )
    .await;

    let client = proxied_client(proxy);
    let url = format!("http://{}/kcs2/js/main.js?version=6.1", origin_host(&server));
    let before = client.get(&url).send().await.unwrap();
    assert_eq!(before.text().await.unwrap(), "var speed = 2;");

    std::fs::write(mods.join("speed/kcs2/js/main.js/patched.js"), "var speed = 3;").unwrap();
    let table = state.reload_mods().await.unwrap().unwrap();
    assert_eq!(table.len(), 1);

    let after = client.get(&url).send().await.unwrap();
    assert_eq!(after.text().await.unwrap(), "var speed = 3;");
}
