//! URI helpers: path validation and connection strings.

use std::fmt::Write as _;
use std::net::SocketAddr;

use crate::error::{NetError, Result};

/// Default DNS-over-HTTPS path.
pub const DEFAULT_PATH: &str = "/dns-query";

fn is_unreserved(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'-' | b'.' | b'_' | b'~')
}

fn is_sub_delim(c: u8) -> bool {
    matches!(
        c,
        b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'='
    )
}

/// Whether `path` is an absolute path as defined by RFC 3986 section 3.3:
/// it starts with `/`, its first segment is not empty, and every segment is
/// made of pchars (unreserved, sub-delims, `:`, `@` or percent escapes).
pub fn path_is_valid(path: &str) -> bool {
    let bytes = path.as_bytes();
    if bytes.first() != Some(&b'/') || bytes.get(1) == Some(&b'/') {
        return false;
    }

    let mut i = 1;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'%' {
            let hex = |b: Option<&u8>| b.is_some_and(u8::is_ascii_hexdigit);
            if !hex(bytes.get(i + 1)) || !hex(bytes.get(i + 2)) {
                return false;
            }
            i += 3;
            continue;
        }
        if !(c == b'/' || c == b':' || c == b'@' || is_unreserved(c) || is_sub_delim(c)) {
            return false;
        }
        i += 1;
    }
    true
}

/// Where a URI points.
#[derive(Debug, Clone, Copy)]
pub enum UriTarget<'a> {
    Addr(SocketAddr),
    Host { name: &'a str, port: u16 },
}

/// Format `scheme://host:port/path`. IPv6 hosts are bracketed.
///
/// Fails with [`NetError::InvalidPath`] for a bad path and
/// [`NetError::NoSpace`] if the result is longer than `capacity` bytes.
pub fn make_uri(https: bool, target: UriTarget<'_>, abs_path: &str, capacity: usize) -> Result<String> {
    if !path_is_valid(abs_path) {
        return Err(NetError::InvalidPath(abs_path.to_string()));
    }
    let scheme = if https { "https" } else { "http" };

    let mut uri = String::with_capacity(capacity);
    let written = match target {
        UriTarget::Addr(SocketAddr::V4(addr)) => {
            write!(uri, "{scheme}://{}:{}{abs_path}", addr.ip(), addr.port())
        }
        UriTarget::Addr(SocketAddr::V6(addr)) => {
            write!(uri, "{scheme}://[{}]:{}{abs_path}", addr.ip(), addr.port())
        }
        UriTarget::Host { name, port } if name.contains(':') && !name.starts_with('[') => {
            write!(uri, "{scheme}://[{name}]:{port}{abs_path}")
        }
        UriTarget::Host { name, port } => write!(uri, "{scheme}://{name}:{port}{abs_path}"),
    };
    written.map_err(|_| NetError::Protocol("URI formatting failed".into()))?;

    if uri.len() > capacity {
        return Err(NetError::NoSpace {
            needed: uri.len(),
            capacity,
        });
    }
    Ok(uri)
}
