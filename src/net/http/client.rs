//! HTTP/2 client sessions for DNS over HTTPS.
//!
//! One session socket per connection. Each `send` becomes one request; its
//! response body is queued and handed to the read callback in order of
//! arrival.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::uri::PathAndQuery;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::client::conn::http2::{self, SendRequest};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};

use crate::error::{NetError, Result};
use crate::manager::Core;
use crate::net::dns::MAX_DNS_MESSAGE;
use crate::net::handle::{Handle, SendCompletion};
use crate::net::http::server::DNS_MESSAGE;
use crate::net::socket::{
    self, DriverGuard, Role, SocketInner, SocketIo, SocketKind, SocketSpec, SocketState,
};
use crate::net::stream::Io;
use crate::observability::StatCounter;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Request target of a client session.
#[derive(Debug, Clone)]
pub(crate) struct HttpTarget {
    pub uri: Uri,
    pub post: bool,
}

pub(crate) struct ClientSession {
    sender: Mutex<SendRequest<Full<Bytes>>>,
    target: HttpTarget,
    responses: Mutex<VecDeque<Result<Bytes>>>,
}

/// Build the request for one message: a POST body, or a GET with the
/// message in the `dns` query parameter.
fn build_request(target: &HttpTarget, data: Bytes) -> Result<Request<Full<Bytes>>> {
    let (builder, body) = if target.post {
        let builder = Request::post(target.uri.clone()).header(CONTENT_TYPE, DNS_MESSAGE);
        (builder, data)
    } else {
        let path_and_query = format!("{}?dns={}", target.uri.path(), URL_SAFE_NO_PAD.encode(&data));
        let mut parts = target.uri.clone().into_parts();
        parts.path_and_query = Some(
            path_and_query
                .parse::<PathAndQuery>()
                .map_err(|e| NetError::Http(e.to_string()))?,
        );
        let uri = Uri::from_parts(parts).map_err(|e| NetError::Http(e.to_string()))?;
        (Request::get(uri), Bytes::new())
    };
    Ok(builder.header(ACCEPT, DNS_MESSAGE).body(Full::new(body))?)
}

impl ClientSession {
    /// Issue one request carrying `data`. The completion fires once the
    /// request is handed to the connection.
    pub(crate) fn send(&self, sock: &Arc<SocketInner>, data: Bytes, completion: SendCompletion) {
        if data.len() > MAX_DNS_MESSAGE {
            sock.core.stat(sock.kind, StatCounter::SendFail);
            completion.complete_later(Err(NetError::MessageTooLarge(data.len())));
            return;
        }
        let request = match build_request(&self.target, data) {
            Ok(request) => request,
            Err(e) => {
                sock.core.stat(sock.kind, StatCounter::SendFail);
                completion.complete_later(Err(e));
                return;
            }
        };

        let mut sender = lock(&self.sender).clone();
        let task_sock = sock.clone();
        sock.core.spawn_on(sock.tid, async move {
            let sock = task_sock;
            if let Err(e) = sender.ready().await {
                sock.core.stat(sock.kind, StatCounter::SendFail);
                completion.complete(Err(e.into()));
                return;
            }
            let response = sender.send_request(request);
            completion.complete(Ok(()));

            let result = match response.await {
                Ok(response) => read_response(response).await,
                Err(e) => Err(e.into()),
            };
            if let SocketIo::HttpClient(session) = &sock.io {
                lock(&session.responses).push_back(result);
            }
            sock.read_notify.notify_one();
        });
    }

    fn next_response(&self) -> Option<Result<Bytes>> {
        lock(&self.responses).pop_front()
    }
}

async fn read_response(response: Response<Incoming>) -> Result<Bytes> {
    if response.status() != StatusCode::OK {
        return Err(NetError::Http(format!("server answered {}", response.status())));
    }
    let body = Limited::new(response.into_body(), MAX_DNS_MESSAGE)
        .collect()
        .await
        .map_err(|e| NetError::Http(e.to_string()))?;
    Ok(body.to_bytes())
}

/// Run the HTTP/2 handshake over `stream` and create the session socket.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn start_session<S: Io>(
    core: &Arc<Core>,
    tid: usize,
    stream: S,
    local: SocketAddr,
    peer: SocketAddr,
    encrypted: bool,
    target: HttpTarget,
    timeout: Duration,
) -> Result<Handle> {
    let (sender, conn) = http2::Builder::new(TokioExecutor::new())
        .timer(TokioTimer::new())
        .handshake::<_, Full<Bytes>>(TokioIo::new(stream))
        .await?;

    let sock = SocketInner::new(
        core,
        SocketSpec {
            kind: SocketKind::Http,
            role: Role::Connection { client: true },
            tid,
            parent: None,
            local,
            peer,
            io: SocketIo::HttpClient(ClientSession {
                sender: Mutex::new(sender),
                target,
                responses: Mutex::new(VecDeque::new()),
            }),
            state: SocketState::Active,
            encrypted,
            xfr_allowed: false,
            permit: None,
            timeout,
        },
    );
    tokio::spawn(drive_session(sock.clone(), conn));
    Ok(sock.new_handle(peer))
}

async fn drive_session<S: Io>(
    sock: Arc<SocketInner>,
    conn: http2::Connection<TokioIo<S>, Full<Bytes>, TokioExecutor>,
) {
    let guard = DriverGuard::new(sock.clone());
    let mut closing = sock.closing_receiver();
    tokio::pin!(conn);

    loop {
        deliver_responses(&sock);
        if !sock.is_usable() {
            break;
        }
        let (_, deadline) = sock.read_wait();
        tokio::select! {
            res = conn.as_mut() => {
                let err = match res {
                    Ok(()) => NetError::Eof,
                    Err(e) => NetError::from(e),
                };
                sock.fail_read(err);
                break;
            }
            _ = socket::closed(&mut closing) => break,
            _ = socket::sleep_until_deadline(deadline) => sock.on_timer_expired(),
            _ = sock.read_notify.notified() => {}
        }
    }
    drop(guard);
}

fn deliver_responses(sock: &Arc<SocketInner>) {
    let SocketIo::HttpClient(session) = &sock.io else {
        return;
    };
    while sock.is_usable() && sock.is_reading() {
        let Some(result) = session.next_response() else {
            return;
        };
        match result {
            Ok(body) => sock.deliver_read(&body),
            Err(e) => sock.deliver_error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(post: bool) -> HttpTarget {
        HttpTarget {
            uri: "https://127.0.0.1:443/dns-query".parse().unwrap(),
            post,
        }
    }

    #[test]
    fn get_request_carries_base64url_message() {
        let req = build_request(&target(false), Bytes::from_static(&[0xfb, 0xff, 0x00])).unwrap();
        assert_eq!(req.method(), http::Method::GET);
        assert_eq!(req.uri().path(), "/dns-query");
        assert_eq!(req.uri().query(), Some("dns=-_8A"));
        assert_eq!(req.uri().authority().map(|a| a.as_str()), Some("127.0.0.1:443"));
    }

    #[test]
    fn post_request_sets_content_type() {
        let req = build_request(&target(true), Bytes::from_static(b"\x00\x01")).unwrap();
        assert_eq!(req.method(), http::Method::POST);
        assert_eq!(req.headers()[CONTENT_TYPE], DNS_MESSAGE);
        assert_eq!(req.headers()[ACCEPT], DNS_MESSAGE);
        assert_eq!(req.uri().query(), None);
    }
}
