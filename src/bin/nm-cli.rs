//! nm-cli: send one DNS message over any transport and print the reply.
//!
//! The message and the reply are hex encoded, e.g.
//! `nm-cli --transport tcp --server 127.0.0.1:5300 0001010000010000000000000377777700`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use netmgr::net::{make_uri, UriTarget};
use netmgr::observability::logging;
use netmgr::{Handle, Manager, TlsContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Udp,
    Tcp,
    Tls,
    Https,
    H2c,
}

#[derive(Parser)]
#[command(name = "nm-cli")]
#[command(about = "Send a DNS message through the network manager", long_about = None)]
struct Cli {
    #[arg(short, long, value_enum, default_value = "udp")]
    transport: Transport,

    /// Server address.
    #[arg(short, long, default_value = "127.0.0.1:53")]
    server: SocketAddr,

    /// CA certificate (PEM) used to verify the server.
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Accept any server certificate.
    #[arg(long)]
    insecure: bool,

    /// HTTP path for DoH transports.
    #[arg(long, default_value = netmgr::net::http::DEFAULT_PATH)]
    path: String,

    /// Use POST instead of GET for DoH.
    #[arg(long)]
    post: bool,

    /// Seconds to wait for the connection and the reply.
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Message to send, hex encoded.
    message: String,
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err("message is not hex".into());
    }
    if s.len() % 2 != 0 {
        return Err("hex message has an odd number of digits".into());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| format!("bad hex at {i}: {e}")))
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn tls_context(cli: &Cli) -> Result<TlsContext, Box<dyn std::error::Error>> {
    let tls = match (&cli.ca, cli.insecure) {
        (Some(ca), _) => TlsContext::client_from_ca_file(ca)?,
        (None, true) => TlsContext::client_insecure()?,
        (None, false) => return Err("TLS transports need --ca or --insecure".into()),
    };
    Ok(tls)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init("warn");

    let message = decode_hex(&cli.message)?;
    let timeout = Duration::from_secs(cli.timeout);
    let local: SocketAddr = if cli.server.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };

    let manager = Manager::new(1)?;
    let (tx, rx) = mpsc::channel::<netmgr::Result<Vec<u8>>>();

    let on_connect = move |result: netmgr::Result<Handle>| {
        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        };
        let reply_tx = tx.clone();
        handle.read(move |handle, result| {
            let _ = reply_tx.send(result.map(<[u8]>::to_vec));
            handle.cancel_read();
        });
        let send_tx = tx.clone();
        handle.send(message, move |_, result| {
            if let Err(e) = result {
                let _ = send_tx.send(Err(e));
            }
        });
    };

    match cli.transport {
        Transport::Udp => manager.udp_connect(local, cli.server, on_connect, timeout),
        Transport::Tcp => manager.tcpdns_connect(local, cli.server, on_connect, timeout),
        Transport::Tls => {
            let tls = tls_context(&cli)?;
            manager.tlsdns_connect(local, cli.server, on_connect, &tls, timeout)
        }
        Transport::Https | Transport::H2c => {
            let https = cli.transport == Transport::Https;
            let uri = make_uri(https, UriTarget::Addr(cli.server), &cli.path, 256)?;
            let tls = if https { Some(tls_context(&cli)?) } else { None };
            manager.http_connect(local, cli.server, &uri, cli.post, on_connect, tls.as_ref(), timeout)
        }
    }

    let result = rx.recv_timeout(timeout + Duration::from_secs(1));
    // Handles held by the callbacks are gone once the workers stop.
    drop(rx);
    manager.destroy();

    match result {
        Ok(Ok(reply)) => {
            println!("{}", encode_hex(&reply));
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err("no reply".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        assert_eq!(decode_hex("00ff 10").unwrap(), vec![0x00, 0xff, 0x10]);
        assert_eq!(encode_hex(&[0xab, 0x01]), "ab01");
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
    }
}
