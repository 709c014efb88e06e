//! DNS over HTTP/2.
//!
//! # Data Flow
//! ```text
//! listen_http(endpoints)
//!     → endpoints frozen, stream listener (tcp.rs), optional TLS with ALPN h2
//!     → server.rs: hyper HTTP/2 session per connection
//!     → request → endpoint lookup → handle + recv callback
//!     → Handle::send → 200 application/dns-message
//!
//! http_connect(uri)
//!     → stream connect (tcp.rs), optional TLS with ALPN h2
//!     → client.rs: hyper HTTP/2 session
//!     → Handle::send → GET ?dns= / POST → response body → read callback
//! ```

pub(crate) mod client;
pub mod endpoints;
pub(crate) mod server;
pub mod uri;

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{NetError, Result};
use crate::manager::Manager;
use crate::net::handle::{ConnectCompletion, Handle};
use crate::net::quota::Quota;
use crate::net::socket::{Socket, SocketKind};
use crate::net::tcp::{self, ConnectRequest, ListenSpec};
use crate::net::tls::TlsContext;

pub use endpoints::HttpEndpoints;
pub use uri::{make_uri, path_is_valid, UriTarget, DEFAULT_PATH};

/// Concurrent streams per session when none is configured.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

const ALPN_H2: &[u8] = b"h2";

impl Manager {
    /// Serve `endpoints` over HTTP/2: h2c without `tls`, HTTPS with it.
    ///
    /// The endpoint set is frozen from here on. A `max_concurrent_streams`
    /// of zero selects [`DEFAULT_MAX_CONCURRENT_STREAMS`].
    pub fn listen_http(
        &self,
        iface: SocketAddr,
        backlog: i32,
        quota: Option<Quota>,
        tls: Option<&TlsContext>,
        endpoints: &HttpEndpoints,
        max_concurrent_streams: u32,
    ) -> Result<Socket> {
        let acceptor = match tls {
            Some(tls) => Some(tls.with_alpn(&[ALPN_H2]).acceptor()?),
            None => None,
        };
        let max_streams = if max_concurrent_streams == 0 {
            DEFAULT_MAX_CONCURRENT_STREAMS
        } else {
            max_concurrent_streams
        };
        endpoints.freeze();

        tcp::listen_stream(
            self.core(),
            iface,
            backlog,
            ListenSpec {
                kind: SocketKind::Http,
                accept: None,
                recv: None,
                quota,
                tls: acceptor,
                http: Some(server::HttpListen {
                    endpoints: endpoints.clone(),
                    max_streams,
                }),
            },
        )
    }

    /// Open an HTTP/2 session to `uri` at `peer`. Each send on the returned
    /// handle issues one request (POST when `post`, GET otherwise).
    ///
    /// `https` URIs need `tls`. Errors in the URI are reported through `cb`.
    #[allow(clippy::too_many_arguments)]
    pub fn http_connect<F>(
        &self,
        local: SocketAddr,
        peer: SocketAddr,
        uri: &str,
        post: bool,
        cb: F,
        tls: Option<&TlsContext>,
        timeout: Duration,
    ) where
        F: FnOnce(Result<Handle>) + Send + 'static,
    {
        let cb = ConnectCompletion::new(cb);
        let target = match parse_target(uri, tls.is_some()) {
            Ok(target) => target,
            Err(e) => {
                let core = self.core();
                core.enqueue(core.pick_tid(), move || cb.complete(Err(e)));
                return;
            }
        };

        tcp::connect_stream(
            self.core(),
            ConnectRequest {
                kind: SocketKind::Http,
                local,
                peer,
                timeout,
                tls: tls.map(|tls| tls.with_alpn(&[ALPN_H2])),
                http: Some(client::HttpTarget { uri: target, post }),
            },
            cb,
        );
    }
}

fn parse_target(uri: &str, have_tls: bool) -> Result<http::Uri> {
    let parsed = url::Url::parse(uri).map_err(|e| NetError::Http(format!("invalid URI {uri:?}: {e}")))?;
    match parsed.scheme() {
        "https" if !have_tls => {
            return Err(NetError::Tls(format!("{uri} needs a TLS context")));
        }
        "http" | "https" => {}
        other => return Err(NetError::Http(format!("unsupported scheme {other:?}"))),
    }
    if parsed.host_str().is_none() {
        return Err(NetError::Http(format!("{uri} has no host")));
    }
    if !path_is_valid(parsed.path()) {
        return Err(NetError::InvalidPath(parsed.path().to_string()));
    }
    parsed
        .as_str()
        .parse::<http::Uri>()
        .map_err(|e| NetError::Http(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parsing() {
        let uri = parse_target("https://127.0.0.1:8443/dns-query", true).unwrap();
        assert_eq!(uri.scheme_str(), Some("https"));
        assert_eq!(uri.path(), "/dns-query");

        assert!(matches!(
            parse_target("https://127.0.0.1/dns-query", false),
            Err(NetError::Tls(_))
        ));
        assert!(matches!(
            parse_target("ftp://127.0.0.1/x", true),
            Err(NetError::Http(_))
        ));
        assert!(parse_target("not a uri", false).is_err());
        assert!(parse_target("http://localhost:8080/dns-query", false).is_ok());
    }
}
