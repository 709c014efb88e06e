//! HTTP/2 server sessions for DNS over HTTPS (RFC 8484).
//!
//! Every accepted connection becomes one session socket served by hyper.
//! Each request is matched against the endpoint table and handed to its
//! callback on a handle of its own; the response goes out when the
//! application sends on that handle.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::sync::oneshot;

use crate::error::{NetError, Result};
use crate::net::dns::MAX_DNS_MESSAGE;
use crate::net::handle::{Handle, SendCompletion};
use crate::net::http::endpoints::HttpEndpoints;
use crate::net::quota::QuotaPermit;
use crate::net::socket::{
    self, DriverGuard, Role, SocketInner, SocketIo, SocketKind, SocketSpec, SocketState,
};
use crate::net::stream::Io;
use crate::observability::StatCounter;

pub(crate) const DNS_MESSAGE: &str = "application/dns-message";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Where the response to one request goes.
pub(crate) struct ReplySlot {
    tx: Mutex<Option<oneshot::Sender<Response<Full<Bytes>>>>>,
    max_age: Mutex<Option<u32>>,
}

impl ReplySlot {
    fn new(tx: oneshot::Sender<Response<Full<Bytes>>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            max_age: Mutex::new(None),
        }
    }

    /// Send the response. Only the first call has an effect.
    pub(crate) fn respond(&self, status: StatusCode, body: Bytes) -> Result<()> {
        let Some(tx) = lock(&self.tx).take() else {
            return Err(NetError::Http("response already sent".into()));
        };
        let mut builder = Response::builder().status(status);
        if status == StatusCode::OK {
            builder = builder.header(CONTENT_TYPE, DNS_MESSAGE);
            if let Some(age) = *lock(&self.max_age) {
                builder = builder.header(CACHE_CONTROL, format!("max-age={age}"));
            }
        }
        let response = builder.body(Full::new(body))?;
        tx.send(response).map_err(|_| NetError::Canceled)
    }

    pub(crate) fn set_max_age(&self, ttl: u32) {
        *lock(&self.max_age) = Some(ttl);
    }
}

/// Answer the request behind `handle` with `data`.
pub(crate) fn send(handle: &Handle, data: Bytes, completion: SendCompletion) {
    let sock = &handle.inner.sock;
    let result = match &handle.inner.reply {
        Some(_) if data.len() > MAX_DNS_MESSAGE => Err(NetError::MessageTooLarge(data.len())),
        Some(reply) => reply.respond(StatusCode::OK, data),
        None => Err(NetError::NotConnected),
    };
    match &result {
        Ok(()) => sock.restart_timer(),
        Err(_) => sock.core.stat(sock.kind, StatCounter::SendFail),
    }
    completion.complete_later(result);
}

/// Per-listener HTTP settings.
#[derive(Clone)]
pub(crate) struct HttpListen {
    pub endpoints: HttpEndpoints,
    pub max_streams: u32,
}

/// Turn an accepted stream into an HTTP/2 session socket.
pub(crate) fn start_session<S: Io>(
    root: &Arc<SocketInner>,
    tid: usize,
    stream: S,
    local: SocketAddr,
    peer: SocketAddr,
    permit: Option<QuotaPermit>,
    listen: HttpListen,
) {
    let sock = SocketInner::new(
        &root.core,
        SocketSpec {
            kind: SocketKind::Http,
            role: Role::Connection { client: false },
            tid,
            parent: Some(root.id),
            local,
            peer,
            io: SocketIo::HttpServer,
            state: SocketState::Active,
            encrypted: root.encrypted,
            xfr_allowed: false,
            permit,
            timeout: Duration::ZERO,
        },
    );
    root.connection_opened();
    root.core.stat(SocketKind::Http, StatCounter::Accept);
    sock.start_session_timer(root.core.settings().timeouts.init);
    tracing::debug!(socket = %sock.id, peer = %peer, encrypted = sock.encrypted, "HTTP session started");

    tokio::spawn(serve_session(sock, stream, listen));
}

async fn serve_session<S: Io>(sock: Arc<SocketInner>, stream: S, listen: HttpListen) {
    let guard = DriverGuard::new(sock.clone());
    let mut closing = sock.closing_receiver();

    let service = {
        let sock = sock.clone();
        let endpoints = listen.endpoints.clone();
        service_fn(move |req: Request<Incoming>| {
            let sock = sock.clone();
            let endpoints = endpoints.clone();
            async move { Ok::<_, Infallible>(handle_request(sock, endpoints, req).await) }
        })
    };
    let conn = http2::Builder::new(TokioExecutor::new())
        .timer(TokioTimer::new())
        .max_concurrent_streams(listen.max_streams)
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        let (_, deadline) = sock.read_wait();
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    tracing::debug!(socket = %sock.id, peer = %sock.peer, error = %e, "HTTP session ended with error");
                }
                break;
            }
            _ = socket::closed(&mut closing), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = socket::sleep_until_deadline(deadline), if !draining => sock.on_timer_expired(),
            _ = sock.read_notify.notified() => {}
        }
    }
    drop(guard);
}

fn status_only(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn is_dns_message(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(DNS_MESSAGE))
}

/// The base64url `dns` parameter of a GET request.
fn query_message(query: Option<&str>) -> std::result::Result<Bytes, StatusCode> {
    let query = query.ok_or(StatusCode::BAD_REQUEST)?;
    let encoded = url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "dns")
        .map(|(_, value)| value.into_owned())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let decoded = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    if decoded.len() > MAX_DNS_MESSAGE {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }
    Ok(Bytes::from(decoded))
}

async fn request_message(req: Request<Incoming>) -> std::result::Result<Bytes, StatusCode> {
    match *req.method() {
        Method::GET => query_message(req.uri().query()),
        Method::POST => {
            if !is_dns_message(req.headers()) {
                return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE);
            }
            match Limited::new(req.into_body(), MAX_DNS_MESSAGE).collect().await {
                Ok(body) => Ok(body.to_bytes()),
                Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                    Err(StatusCode::PAYLOAD_TOO_LARGE)
                }
                Err(_) => Err(StatusCode::BAD_REQUEST),
            }
        }
        _ => Err(StatusCode::METHOD_NOT_ALLOWED),
    }
}

async fn handle_request(
    sock: Arc<SocketInner>,
    endpoints: HttpEndpoints,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    sock.restart_timer();
    let Some(cb) = endpoints.lookup(req.uri().path()) else {
        return status_only(StatusCode::NOT_FOUND);
    };
    let message = match request_message(req).await {
        Ok(message) if message.is_empty() => return status_only(StatusCode::BAD_REQUEST),
        Ok(message) => message,
        Err(status) => {
            tracing::debug!(socket = %sock.id, status = %status, "Rejected HTTP request");
            return status_only(status);
        }
    };
    if !sock.is_usable() {
        return status_only(StatusCode::SERVICE_UNAVAILABLE);
    }

    let (tx, rx) = oneshot::channel();
    let handle = sock.new_handle_with(sock.peer, Some(Arc::new(ReplySlot::new(tx))));
    cb(&handle, Ok(&message));
    drop(handle);

    // The sender goes away with the last handle; no answer by then is a 500.
    rx.await
        .unwrap_or_else(|_| status_only(StatusCode::INTERNAL_SERVER_ERROR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn decodes_get_parameter() {
        // RFC 8484 section 4.1.1 example query for www.example.com.
        let q = "dns=AAABAAABAAAAAAAAA3d3dwdleGFtcGxlA2NvbQAAAQAB";
        let msg = query_message(Some(q)).unwrap();
        assert_eq!(msg.len(), 33);
        assert_eq!(&msg[..4], &[0, 0, 1, 0]);

        assert_eq!(query_message(None), Err(StatusCode::BAD_REQUEST));
        assert_eq!(query_message(Some("other=1")), Err(StatusCode::BAD_REQUEST));
        assert_eq!(query_message(Some("dns=!!!")), Err(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn content_type_check() {
        let mut headers = HeaderMap::new();
        assert!(!is_dns_message(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/dns-message"));
        assert!(is_dns_message(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("Application/DNS-Message; charset=x"));
        assert!(is_dns_message(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        assert!(!is_dns_message(&headers));
    }

    #[tokio::test]
    async fn reply_slot_answers_once() {
        let (tx, rx) = oneshot::channel();
        let slot = ReplySlot::new(tx);
        slot.set_max_age(300);
        slot.respond(StatusCode::OK, Bytes::from_static(b"answer")).unwrap();
        assert!(slot.respond(StatusCode::OK, Bytes::new()).is_err());

        let response = rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], DNS_MESSAGE);
        assert_eq!(response.headers()[CACHE_CONTROL], "max-age=300");
    }
}
