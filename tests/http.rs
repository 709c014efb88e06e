//! DNS over HTTP/2: endpoints, status codes, client sessions.

use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::{TokioExecutor, TokioIo};

use netmgr::net::{make_uri, UriTarget};
use netmgr::{Handle, HttpEndpoints, Manager, NetError, Socket};

mod common;
use common::{localhost, WAIT};

const DNS_MESSAGE: &str = "application/dns-message";

fn serve(mgr: &Manager, endpoints: &HttpEndpoints, tls: bool) -> Socket {
    let tls = tls.then(common::server_tls);
    mgr.listen_http(localhost(), 16, None, tls.as_ref(), endpoints, 0)
        .unwrap()
}

fn echo_endpoints() -> HttpEndpoints {
    let endpoints = HttpEndpoints::new();
    endpoints.add("/dns-query", common::echo).unwrap();
    endpoints
}

fn uri(https: bool, addr: SocketAddr, path: &str) -> String {
    make_uri(https, UriTarget::Addr(addr), path, 128).unwrap()
}

/// One request over a fresh prior-knowledge HTTP/2 connection.
async fn h2c_request(addr: SocketAddr, request: Request<Full<Bytes>>) -> Response<Bytes> {
    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await
            .unwrap();
    let conn = tokio::spawn(conn);

    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();

    drop(sender);
    conn.abort();
    Response::from_parts(parts, body)
}

fn request(method: Method, uri: &str, content_type: Option<&str>, body: &[u8]) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(content_type) = content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder.body(Full::new(Bytes::copy_from_slice(body))).unwrap()
}

#[test]
fn https_post_round_trip() {
    let mgr = common::manager(2);
    let listener = serve(&mgr, &echo_endpoints(), true);
    let tls = common::client_tls();
    let target = uri(true, listener.local_addr(), "/dns-query");

    let handle = common::connect(|cb| {
        mgr.http_connect(localhost(), listener.local_addr(), &target, true, cb, Some(&tls), WAIT)
    })
    .unwrap();
    assert!(handle.is_http());
    assert!(handle.has_encryption());

    let replies = common::collect(&handle);
    common::send_sync(&handle, b"\x00\x01post").unwrap();
    assert_eq!(replies.recv_timeout(WAIT).unwrap().unwrap(), b"\x00\x01post");

    drop(handle);
    mgr.destroy();
}

#[test]
fn h2c_get_round_trip_on_one_session() {
    let mgr = common::manager(1);
    let listener = serve(&mgr, &echo_endpoints(), false);
    let target = uri(false, listener.local_addr(), "/dns-query");

    let handle = common::connect(|cb| {
        mgr.http_connect(localhost(), listener.local_addr(), &target, false, cb, None, WAIT)
    })
    .unwrap();
    assert!(!handle.has_encryption());

    for message in [&b"\xfb\xff\x00"[..], b"second query"] {
        let replies = common::collect(&handle);
        common::send_sync(&handle, message).unwrap();
        assert_eq!(replies.recv_timeout(WAIT).unwrap().unwrap(), message);
    }

    drop(handle);
    mgr.destroy();
}

#[test]
fn unknown_path_is_reported_to_the_client() {
    let mgr = common::manager(1);
    let listener = serve(&mgr, &echo_endpoints(), false);
    let target = uri(false, listener.local_addr(), "/missing");

    let handle = common::connect(|cb| {
        mgr.http_connect(localhost(), listener.local_addr(), &target, true, cb, None, WAIT)
    })
    .unwrap();
    let replies = common::collect(&handle);
    common::send_sync(&handle, b"query").unwrap();

    match replies.recv_timeout(WAIT).unwrap() {
        Err(NetError::Http(message)) => assert!(message.contains("404"), "{message}"),
        other => panic!("unexpected result: {other:?}"),
    }

    drop(handle);
    mgr.destroy();
}

#[test]
fn dropped_request_answers_500() {
    let mgr = common::manager(1);
    let endpoints = HttpEndpoints::new();
    endpoints.add("/dns-query", |_, _| {}).unwrap();
    let listener = serve(&mgr, &endpoints, false);
    let target = uri(false, listener.local_addr(), "/dns-query");

    let handle = common::connect(|cb| {
        mgr.http_connect(localhost(), listener.local_addr(), &target, true, cb, None, WAIT)
    })
    .unwrap();
    let replies = common::collect(&handle);
    common::send_sync(&handle, b"query").unwrap();

    match replies.recv_timeout(WAIT).unwrap() {
        Err(NetError::Http(message)) => assert!(message.contains("500"), "{message}"),
        other => panic!("unexpected result: {other:?}"),
    }

    drop(handle);
    mgr.destroy();
}

#[test]
fn endpoints_freeze_once_served() {
    let mgr = common::manager(1);
    let endpoints = echo_endpoints();
    assert!(!endpoints.is_frozen());
    let _listener = serve(&mgr, &endpoints, false);

    assert!(endpoints.is_frozen());
    assert_eq!(
        endpoints.add("/other", common::echo),
        Err(NetError::EndpointsFrozen)
    );
    assert_eq!(endpoints.len(), 1);
    mgr.destroy();
}

#[test]
fn invalid_uri_fails_the_connect() {
    let mgr = common::manager(1);
    let result = common::connect(|cb| {
        mgr.http_connect(
            localhost(),
            "127.0.0.1:443".parse().unwrap(),
            "https://127.0.0.1/dns-query",
            true,
            cb,
            None,
            WAIT,
        )
    });
    assert!(matches!(result, Err(NetError::Tls(_))));
    mgr.destroy();
}

#[tokio::test]
async fn request_validation_status_codes() {
    let mgr = common::manager(1);
    let listener = serve(&mgr, &echo_endpoints(), false);
    let addr = listener.local_addr();
    let base = format!("http://{addr}");
    let query = format!("{base}/dns-query");

    let cases = [
        (request(Method::GET, &format!("{base}/nope?dns=AAAA"), None, b""), StatusCode::NOT_FOUND),
        (request(Method::PUT, &query, Some(DNS_MESSAGE), b"x"), StatusCode::METHOD_NOT_ALLOWED),
        (request(Method::POST, &query, Some("text/plain"), b"x"), StatusCode::UNSUPPORTED_MEDIA_TYPE),
        (request(Method::POST, &query, Some(DNS_MESSAGE), b""), StatusCode::BAD_REQUEST),
        (request(Method::GET, &query, None, b""), StatusCode::BAD_REQUEST),
        (
            request(Method::POST, &query, Some(DNS_MESSAGE), &vec![0u8; 70_000]),
            StatusCode::PAYLOAD_TOO_LARGE,
        ),
    ];
    for (req, expected) in cases {
        let what = format!("{} {}", req.method(), req.uri().path());
        let response = h2c_request(addr, req).await;
        assert_eq!(response.status(), expected, "{what}");
    }

    let response = h2c_request(addr, request(Method::GET, &format!("{query}?dns=AAEC"), None, b"")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], DNS_MESSAGE);
    assert_eq!(response.body().as_ref(), &[0u8, 1, 2]);

    tokio::task::spawn_blocking(move || mgr.destroy()).await.unwrap();
}

#[tokio::test]
async fn max_age_sets_cache_control() {
    let mgr = common::manager(1);
    let endpoints = HttpEndpoints::new();
    endpoints
        .add("/dns-query", |handle: &Handle, result: netmgr::Result<&[u8]>| {
            if let Ok(message) = result {
                handle.set_max_age(300);
                handle.send(message.to_vec(), |_, _| {});
            }
        })
        .unwrap();
    let listener = serve(&mgr, &endpoints, false);
    let query = format!("http://{}/dns-query", listener.local_addr());

    let response = h2c_request(
        listener.local_addr(),
        request(Method::POST, &query, Some(DNS_MESSAGE), b"cached"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CACHE_CONTROL], "max-age=300");
    assert_eq!(response.body().as_ref(), b"cached");

    tokio::task::spawn_blocking(move || mgr.destroy()).await.unwrap();
}
