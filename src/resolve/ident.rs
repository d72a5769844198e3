//! Outgoing RFC 1413 identd lookups (spec.md §4.6, §6 "Identd wire").
//!
//! Grounded on `examples/original_source/src/ident/Ident.cc`: the source
//! coalesces concurrent callers for the same address pair onto one
//! in-flight query's waiter list (`IdentStateData::clients`); here that's a
//! `HashMap` of broadcast-once [`tokio::sync::Mutex`]-guarded in-flight
//! futures shared via `Arc`.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::broadcast,
};
use tracing::debug;

const IDENT_PORT: u16 = 113;
const IDENT_BUFSIZE: usize = 4096;

/// `ident.start(conn, cb)`: issues one query per distinct (client, local)
/// address pair, coalescing concurrent callers (spec.md §4.6).
pub struct IdentResolver {
    timeout: Duration,
    in_flight: Mutex<HashMap<(SocketAddr, SocketAddr), broadcast::Sender<Option<String>>>>,
}

impl IdentResolver {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Looks up the identd user-id for a client's `(client_addr, local_port)`
    /// socket pair. `client_port` is the client's real TCP source
    /// (ephemeral) port, not this proxy's own listening port. Returns `None`
    /// on timeout or parse failure; the resolver never retries (spec.md §4.6).
    pub async fn lookup(&self, client_ip: IpAddr, client_port: u16, local_port: u16) -> Option<String> {
        let client_addr = SocketAddr::new(client_ip, client_port);
        let local_addr = SocketAddr::new(client_ip, local_port);
        let key = (client_addr, local_addr);

        let mut rx = {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(tx) = in_flight.get(&key) {
                tx.subscribe()
            } else {
                let (tx, rx) = broadcast::channel(1);
                in_flight.insert(key, tx);
                drop(in_flight);
                self.run_query(client_ip, client_port, local_port, key).await;
                rx
            }
        };
        rx.recv().await.ok().flatten()
    }

    async fn run_query(&self, client_ip: IpAddr, client_port: u16, local_port: u16, key: (SocketAddr, SocketAddr)) {
        let result = tokio::time::timeout(self.timeout, Self::query(client_ip, client_port, local_port)).await;
        let userid = result.ok().flatten();
        if let Some(tx) = self.in_flight.lock().unwrap().remove(&key) {
            let _ = tx.send(userid.clone());
        }
    }

    async fn query(client_ip: IpAddr, client_port: u16, local_port: u16) -> Option<String> {
        let mut stream = TcpStream::connect((client_ip, IDENT_PORT)).await.ok()?;
        let request = format!("{client_port},{local_port}\r\n");
        stream.write_all(request.as_bytes()).await.ok()?;

        let mut buf = [0u8; IDENT_BUFSIZE];
        let n = stream.read(&mut buf).await.ok()?;
        let line = std::str::from_utf8(&buf[..n]).ok()?;
        parse_reply(line)
    }
}

/// Parses `server,client : USERID : os : userid` per RFC 1413, returning the
/// user-id stripped of surrounding whitespace and CR/LF (spec.md §4.6).
fn parse_reply(line: &str) -> Option<String> {
    let mut fields = line.split(':');
    let _ports = fields.next()?;
    let kind = fields.next()?.trim();
    if !kind.eq_ignore_ascii_case("USERID") {
        debug!(kind, "ident reply was not a USERID response");
        return None;
    }
    let _os = fields.next()?;
    let userid = fields.next()?.trim().trim_matches(|c| c == '\r' || c == '\n');
    if userid.is_empty() {
        None
    } else {
        Some(userid.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_reply() {
        let line = "113, 45678 : USERID : UNIX : squiduser\r\n";
        assert_eq!(parse_reply(line), Some("squiduser".to_owned()));
    }

    #[test]
    fn rejects_error_reply() {
        let line = "113, 45678 : ERROR : NO-USER\r\n";
        assert_eq!(parse_reply(line), None);
    }

    #[test]
    fn rejects_malformed_reply() {
        assert_eq!(parse_reply("garbage"), None);
    }
}
