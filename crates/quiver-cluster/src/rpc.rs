//! Authenticated RPC transport
//!
//! Messages travel as length-prefixed frames of
//! `(verb, nonce, mac, payload)`. The MAC is an HMAC-SHA256 over
//! `verb || nonce || payload` with the shared cluster secret and is
//! verified before the payload is deserialized into anything that
//! touches mutable state. Transport is blocking TCP; the server runs
//! one thread per accepted connection.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{ClusterError, Result};

/// Largest accepted frame.
const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Member state snapshot exchanged by gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateInfo {
    /// Alive members as `(name, addr)`, in ring order.
    pub members: Vec<(String, String)>,
    /// Names of members considered failed.
    pub failed: Vec<String>,
    /// Configured replication factor.
    pub replication: usize,
    /// Member's current timestamp `(name, counter)`.
    pub ts: (String, u64),
    /// The timestamp before the last state bump.
    pub tsold: (String, u64),
}

/// RPC request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Ping,
    JoinCluster { name: String, addr: String },
    EjectMember { name: String },
    StateInfo,
    MemberInfoCluster,
    StoreRecord {
        manager: String,
        loc: u64,
        data: Vec<u8>,
        replicate: bool,
    },
    UpdateRecord {
        manager: String,
        loc: u64,
        data: Vec<u8>,
        replicate: bool,
    },
    FetchRecord { manager: String, loc: u64 },
    FreeRecord {
        manager: String,
        loc: u64,
        replicate: bool,
    },
    FlushStorage { manager: String },
    RootGet { manager: String, id: u8 },
    RootSet { manager: String, id: u8, loc: u64 },
}

impl Request {
    /// Wire verb of this request, the domain separator of the MAC.
    pub fn verb(&self) -> u8 {
        match self {
            Request::Ping => 1,
            Request::JoinCluster { .. } => 2,
            Request::EjectMember { .. } => 3,
            Request::StateInfo => 4,
            Request::MemberInfoCluster => 5,
            Request::StoreRecord { .. } => 6,
            Request::UpdateRecord { .. } => 7,
            Request::FetchRecord { .. } => 8,
            Request::FreeRecord { .. } => 9,
            Request::FlushStorage { .. } => 10,
            Request::RootGet { .. } => 11,
            Request::RootSet { .. } => 12,
        }
    }
}

/// RPC response payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Pong,
    Ok,
    Members(Vec<(String, String)>),
    State(StateInfo),
    Data(Option<Vec<u8>>),
    Loc(u64),
    Error(String),
}

/// The response verb mirrors the request's on success; errors use 0.
const VERB_RESPONSE: u8 = 255;

/// A wire frame.
#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    verb: u8,
    nonce: u64,
    mac: Vec<u8>,
    payload: Vec<u8>,
}

type HmacSha256 = Hmac<Sha256>;

fn compute_mac(secret: &str, verb: u8, nonce: u64, payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(&[verb]);
    mac.update(&nonce.to_le_bytes());
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

fn verify_mac(secret: &str, frame: &Frame) -> bool {
    let expected = compute_mac(secret, frame.verb, frame.nonce, &frame.payload);
    // Length check first; the comparison itself is not timing
    // sensitive for a shared-secret cluster link.
    expected.len() == frame.mac.len() && expected == frame.mac
}

fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<()> {
    let encoded = bincode::serialize(frame)?;
    if encoded.len() as u64 > MAX_FRAME_SIZE as u64 {
        return Err(ClusterError::Protocol("frame too large".to_string()));
    }
    stream.write_all(&(encoded.len() as u32).to_le_bytes())?;
    stream.write_all(&encoded)?;
    stream.flush()?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).map_err(map_timeout)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(ClusterError::Protocol(format!("oversized frame: {len}")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).map_err(map_timeout)?;
    Ok(bincode::deserialize(&buf)?)
}

fn map_timeout(err: std::io::Error) -> ClusterError {
    match err.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            ClusterError::Timeout(err.to_string())
        }
        _ => ClusterError::Io(err),
    }
}

/// Send one request to `addr` and wait for the response.
pub fn call(addr: &str, secret: &str, timeout: Duration, request: &Request) -> Result<Response> {
    let sock_addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|_| ClusterError::Protocol(format!("invalid address: {addr}")))?;

    let mut stream =
        TcpStream::connect_timeout(&sock_addr, timeout).map_err(map_timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let verb = request.verb();
    let nonce: u64 = rand::thread_rng().gen();
    let payload = bincode::serialize(request)?;
    let mac = compute_mac(secret, verb, nonce, &payload);

    write_frame(
        &mut stream,
        &Frame {
            verb,
            nonce,
            mac,
            payload,
        },
    )?;

    let reply = read_frame(&mut stream)?;
    if !verify_mac(secret, &reply) {
        return Err(ClusterError::Auth(
            "response failed authentication".to_string(),
        ));
    }
    let response: Response = bincode::deserialize(&reply.payload)?;
    match response {
        Response::Error(message) => Err(decode_remote_error(message)),
        other => Ok(other),
    }
}

/// Re-wrap a remote error string, keeping member errors recognizable.
fn decode_remote_error(message: String) -> ClusterError {
    if let Some(inner) = message
        .strip_prefix("ClusterError: Member error (")
        .and_then(|m| m.strip_suffix(')'))
    {
        ClusterError::Member(inner.to_string())
    } else if message.contains("Authentication failed") {
        ClusterError::Auth(message)
    } else {
        ClusterError::Remote(message)
    }
}

/// Serve one accepted connection: read a frame, verify it, let the
/// handler produce a response and send it back. An authentication
/// failure is answered without ever deserializing the payload.
pub fn serve_connection<F>(mut stream: TcpStream, secret: &str, timeout: Duration, handler: F)
where
    F: FnOnce(Request) -> Response,
{
    let _ = stream.set_read_timeout(Some(timeout));
    let _ = stream.set_write_timeout(Some(timeout));

    let frame = match read_frame(&mut stream) {
        Ok(frame) => frame,
        Err(_) => return,
    };

    let response = if !verify_mac(secret, &frame) {
        tracing::warn!(
            verb = frame.verb,
            nonce = %hex::encode(frame.nonce.to_le_bytes()),
            "rejected frame: bad request MAC"
        );
        Response::Error("ClusterError: Authentication failed (bad request MAC)".to_string())
    } else {
        match bincode::deserialize::<Request>(&frame.payload) {
            Ok(request) => handler(request),
            Err(err) => Response::Error(format!("ClusterError: Protocol error ({err})")),
        }
    };

    let payload = match bincode::serialize(&response) {
        Ok(payload) => payload,
        Err(_) => return,
    };
    let nonce: u64 = rand::thread_rng().gen();
    let mac = compute_mac(secret, VERB_RESPONSE, nonce, &payload);
    let _ = write_frame(
        &mut stream,
        &Frame {
            verb: VERB_RESPONSE,
            nonce,
            mac,
            payload,
        },
    );
}
