//! Length-prefixed TCP transport between named peers. See spec §4.1.
//!
//! Each engine instance is both server and client on its own address. The
//! full mesh among three parties has six directional channels (two per peer
//! pair); this module builds and owns them. Frames are `[4-byte big-endian
//! length | payload]`, grounded in the teacher's `channel_utils::tcp_channel`
//! bind/connect/accept dance and in `FastRTAS.Comm.Socket`.

use crate::barrier;
use crate::error::RtasError;
use crate::party::{AddressMap, Party};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

/// A length-prefixed bidirectional message channel between the local party
/// and each of its two peers.
pub struct Transport {
    listener: Option<TcpListener>,
    recv_sockets: HashMap<Party, TcpStream>,
    send_sockets: HashMap<Party, TcpStream>,
}

fn parse_addr(addr: &str) -> Result<SocketAddr, RtasError> {
    addr.parse()
        .map_err(|_| RtasError::Address(addr.to_string()))
}

impl Transport {
    /// Bind the local listening socket for `self_party`'s address in `map`.
    /// Does not yet accept or dial anyone — call [`Transport::connect_all`]
    /// after binding on every party to complete the mesh.
    pub fn bind(map: &AddressMap, self_party: Party, timeout: Duration) -> Result<Self, RtasError> {
        let my_addr = map
            .addr_of(self_party)
            .ok_or_else(|| RtasError::Configuration(format!("{self_party} not in address map")))?;
        let socket_addr = parse_addr(my_addr)?;

        tracing::debug!(%self_party, addr = %my_addr, "binding listener");
        let listener = TcpListener::bind(socket_addr)
            .map_err(|source| RtasError::Bind { addr: my_addr.to_string(), source })?;

        let _ = timeout; // timeout is applied per-stream once accepted/dialed

        Ok(Transport {
            listener: Some(listener),
            recv_sockets: HashMap::new(),
            send_sockets: HashMap::new(),
        })
    }

    /// Accept incoming connections until every peer in `map` (other than
    /// `self_party`) has connected, and dial every peer in parallel, completing
    /// the full mesh. Spec §4.1: a background acceptor thread runs until all
    /// expected peers have connected; `connect_all` dials peers concurrently and
    /// writes the dialer's own address as the handshake's first frame.
    pub fn connect_all(
        &mut self,
        map: &AddressMap,
        self_party: Party,
        timeout: Duration,
    ) -> Result<(), RtasError> {
        let self_addr = map
            .addr_of(self_party)
            .ok_or_else(|| RtasError::Configuration(format!("{self_party} not in address map")))?;
        let expected: usize = map.peers_of(self_party).count();

        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| RtasError::Configuration("connect_all: transport already torn down".into()))?
            .try_clone()
            .map_err(|source| RtasError::Bind { addr: self_addr.to_string(), source })?;
        let map_for_acceptor = map.clone();
        let self_addr_owned = self_addr.to_string();
        let acceptor = std::thread::spawn(move || -> Result<Vec<(Party, TcpStream)>, RtasError> {
            accept_loop(&listener, &map_for_acceptor, self_addr_owned, expected)
        });

        // Spec §4.1: dial every peer in parallel, mirroring the original's
        // `parallel(connect_one, peers)` — a stuck or unreachable peer must not
        // hold up dialing the others.
        let peers: Vec<(String, Party)> =
            map.peers_of(self_party).map(|(a, p)| (a.to_string(), p)).collect();
        let self_addr_for_dial = self_addr.to_string();
        let dialed: Mutex<Vec<(Party, TcpStream)>> = Mutex::new(Vec::new());
        let errs = barrier::run(
            |(peer_addr, peer_party): (String, Party)| -> Result<(), RtasError> {
                let stream = dial_one(&peer_addr, peer_party, &self_addr_for_dial, timeout)?;
                tracing::debug!(%self_party, peer = %peer_party, "dialed peer");
                dialed.lock().unwrap().push((peer_party, stream));
                Ok(())
            },
            peers,
        );
        barrier_result(errs)?;
        for (peer_party, stream) in dialed.into_inner().unwrap() {
            self.send_sockets.insert(peer_party, stream);
        }

        let accepted = acceptor
            .join()
            .map_err(|_| RtasError::Handshake("acceptor thread panicked".into()))??;
        for (peer_party, mut stream) in accepted {
            stream
                .set_read_timeout(Some(timeout))
                .and_then(|_| stream.set_write_timeout(Some(timeout)))
                .map_err(|source| RtasError::Transport { peer: peer_party.to_string(), source })?;
            tracing::debug!(%self_party, peer = %peer_party, "accepted peer");
            self.recv_sockets.insert(peer_party, stream);
        }

        Ok(())
    }

    /// Send `bytes` as one frame to `peer` over its dedicated send socket.
    pub fn send(&mut self, peer: Party, bytes: &[u8]) -> Result<(), RtasError> {
        let stream = self
            .send_sockets
            .get_mut(&peer)
            .ok_or_else(|| RtasError::Transport {
                peer: peer.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotConnected, "no send socket"),
            })?;
        write_frame(stream, bytes).map_err(|source| classify_io_error(peer, source))
    }

    /// Receive one frame from `peer` over its dedicated receive socket.
    pub fn recv(&mut self, peer: Party) -> Result<Vec<u8>, RtasError> {
        let stream = self
            .recv_sockets
            .get_mut(&peer)
            .ok_or_else(|| RtasError::Transport {
                peer: peer.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotConnected, "no recv socket"),
            })?;
        read_frame(stream).map_err(|source| classify_io_error(peer, source))
    }

    /// Clone the dedicated send socket for `peer`, for use in a
    /// [`barrier`](crate::barrier) branch that needs its own handle.
    pub fn send_stream(&self, peer: Party) -> Result<TcpStream, RtasError> {
        self.send_sockets
            .get(&peer)
            .ok_or_else(|| RtasError::Transport {
                peer: peer.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotConnected, "no send socket"),
            })?
            .try_clone()
            .map_err(|source| RtasError::Transport { peer: peer.to_string(), source })
    }

    /// Clone the dedicated receive socket for `peer`, for use in a
    /// [`barrier`](crate::barrier) branch that needs its own handle.
    pub fn recv_stream(&self, peer: Party) -> Result<TcpStream, RtasError> {
        self.recv_sockets
            .get(&peer)
            .ok_or_else(|| RtasError::Transport {
                peer: peer.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotConnected, "no recv socket"),
            })?
            .try_clone()
            .map_err(|source| RtasError::Transport { peer: peer.to_string(), source })
    }

    /// Close the listener and every send/receive socket.
    pub fn terminate(&mut self) {
        tracing::debug!("tearing down transport");
        self.send_sockets.clear();
        self.recv_sockets.clear();
        self.listener.take();
    }
}

pub(crate) fn classify_io_error(peer: Party, source: std::io::Error) -> RtasError {
    use std::io::ErrorKind;
    if matches!(source.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
        RtasError::Timeout(peer.to_string())
    } else {
        RtasError::Transport { peer: peer.to_string(), source }
    }
}

/// Dial `peer_addr` with a deadline, claim `self_addr` as the handshake's
/// first frame, and set the stream's read/write timeouts.
fn dial_one(
    peer_addr: &str,
    peer_party: Party,
    self_addr: &str,
    timeout: Duration,
) -> Result<TcpStream, RtasError> {
    let socket_addr = parse_addr(peer_addr)?;
    let mut stream =
        TcpStream::connect_timeout(&socket_addr, timeout).map_err(|source| {
            if matches!(source.kind(), std::io::ErrorKind::TimedOut) {
                RtasError::Timeout(peer_party.to_string())
            } else {
                RtasError::Connect { peer: peer_party.to_string(), addr: peer_addr.to_string(), source }
            }
        })?;
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
        .map_err(|source| RtasError::Connect {
            peer: peer_party.to_string(),
            addr: peer_addr.to_string(),
            source,
        })?;
    write_frame(&mut stream, self_addr.as_bytes()).map_err(|source| RtasError::Connect {
        peer: peer_party.to_string(),
        addr: peer_addr.to_string(),
        source,
    })?;
    Ok(stream)
}

fn barrier_result(errs: Vec<RtasError>) -> Result<(), RtasError> {
    if errs.is_empty() {
        return Ok(());
    }
    Err(RtasError::Protocol(format!(
        "{} parallel dial(s) failed: {}",
        errs.len(),
        errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
    )))
}

fn accept_loop(
    listener: &TcpListener,
    map: &AddressMap,
    self_addr: String,
    expected: usize,
) -> Result<Vec<(Party, TcpStream)>, RtasError> {
    let mut accepted = Vec::with_capacity(expected);
    while accepted.len() < expected {
        let (mut socket, observed_addr) = listener
            .accept()
            .map_err(|source| RtasError::Bind { addr: self_addr.clone(), source })?;

        let claim_bytes = read_frame(&mut socket)
            .map_err(|source| RtasError::Transport { peer: "<unknown>".into(), source })?;
        let claim = String::from_utf8(claim_bytes)
            .map_err(|_| RtasError::Handshake("address claim was not valid UTF-8".into()))?;

        let claimed_host = claim.split(':').next().unwrap_or("");
        if claimed_host != observed_addr.ip().to_string() {
            return Err(RtasError::Handshake(format!(
                "claimed address {claim} does not match observed source {observed_addr}"
            )));
        }

        let party = map
            .party_of(&claim)
            .ok_or_else(|| RtasError::Handshake(format!("unexpected connector claiming {claim}")))?;

        accepted.push((party, socket));
    }
    Ok(accepted)
}

pub(crate) fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let len = (payload.len() as u32).to_be_bytes();
    stream.write_all(&len)?;
    stream.write_all(payload)?;
    stream.flush()
}

pub(crate) fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn map3(base: u16) -> AddressMap {
        AddressMap::new(vec![
            (format!("127.0.0.1:{}", base), Party::P0),
            (format!("127.0.0.1:{}", base + 1), Party::P1),
            (format!("127.0.0.1:{}", base + 2), Party::P2),
        ])
        .unwrap()
    }

    fn mesh(base: u16) -> (Transport, Transport, Transport) {
        let map = map3(base);
        let timeout = Duration::from_secs(3);

        let map0 = map.clone();
        let map1 = map.clone();
        let map2 = map.clone();

        let h0 = thread::spawn(move || {
            let mut t = Transport::bind(&map0, Party::P0, timeout).unwrap();
            t.connect_all(&map0, Party::P0, timeout)
                .unwrap();
            t
        });
        let h1 = thread::spawn(move || {
            let mut t = Transport::bind(&map1, Party::P1, timeout).unwrap();
            t.connect_all(&map1, Party::P1, timeout)
                .unwrap();
            t
        });
        let h2 = thread::spawn(move || {
            let mut t = Transport::bind(&map2, Party::P2, timeout).unwrap();
            t.connect_all(&map2, Party::P2, timeout)
                .unwrap();
            t
        });

        (h0.join().unwrap(), h1.join().unwrap(), h2.join().unwrap())
    }

    #[test]
    fn round_trip_between_two_parties() {
        let (mut t0, mut t1, _t2) = mesh(15100);

        let h = thread::spawn(move || {
            t1.send(Party::P0, b"hello from P1").unwrap();
            t1
        });

        let bytes = t0.recv(Party::P1).unwrap();
        assert_eq!(bytes, b"hello from P1");

        h.join().unwrap();
    }

    #[test]
    fn each_peer_pair_has_independent_channels() {
        let (mut t0, mut t1, mut t2) = mesh(15110);

        let h1 = thread::spawn(move || {
            t1.send(Party::P0, b"from-p1").unwrap();
            t1.send(Party::P2, b"from-p1-to-p2").unwrap();
            t1
        });
        let h2 = thread::spawn(move || {
            t2.send(Party::P0, b"from-p2").unwrap();
            let got = t2.recv(Party::P1).unwrap();
            assert_eq!(got, b"from-p1-to-p2");
            t2
        });

        let from_p1 = t0.recv(Party::P1).unwrap();
        let from_p2 = t0.recv(Party::P2).unwrap();
        assert_eq!(from_p1, b"from-p1");
        assert_eq!(from_p2, b"from-p2");

        h1.join().unwrap();
        h2.join().unwrap();
    }
}
