//! Framed RPC protocol between the sync engine and the remote agent.
//!
//! Wire format (all integers are big-endian):
//!
//! ```text
//! +--------+--------+------------------+
//! | type   | length | payload          |
//! | 1 byte | 4 bytes| variable         |
//! +--------+--------+------------------+
//! ```
//!
//! Paths travel as u16-length-prefixed UTF-8 with `/`-joined segments.
//! Mutation requests are fire-and-forget; `Drain` is the acknowledgement
//! barrier and answers `Ok` only once every prior action is applied.

use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::action::Action;
use crate::error::RpcError;
use crate::hash::BlockHash;
use crate::path::SubPath;
use crate::sig::Signature;

/// Message type identifiers
pub mod msg {
    pub const FULL_SCAN_REQ: u8 = 0x01;
    pub const FULL_SCAN_RESP: u8 = 0x02;

    pub const REMOVE: u8 = 0x10;
    pub const PUT_DIR: u8 = 0x11;
    pub const PUT_FILE: u8 = 0x12;
    pub const PUT_LINK: u8 = 0x13;
    pub const SET_PERMS: u8 = 0x14;
    pub const WRITE_CHUNK: u8 = 0x15;
    pub const SET_SIZE: u8 = 0x16;

    pub const DRAIN: u8 = 0x20;
    pub const SHUTDOWN: u8 = 0x21;

    pub const OK: u8 = 0x30;
    pub const ERROR: u8 = 0x31;
}

/// Signature tags inside scan listings
mod sig_tag {
    pub const FILE: u8 = 0;
    pub const DIR: u8 = 1;
    pub const SYMLINK: u8 = 2;
}

// === payload encoding ===

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_sub(buf: &mut Vec<u8>, sub: &SubPath) {
    put_str(buf, &sub.to_string());
}

fn put_signature(buf: &mut Vec<u8>, sig: &Signature) {
    match sig {
        Signature::File {
            perms,
            block_hashes,
            size,
        } => {
            buf.push(sig_tag::FILE);
            buf.extend_from_slice(&perms.to_be_bytes());
            buf.extend_from_slice(&size.to_be_bytes());
            buf.extend_from_slice(&(block_hashes.len() as u32).to_be_bytes());
            for hash in block_hashes {
                buf.extend_from_slice(hash.as_bytes());
            }
        }
        Signature::Dir { perms } => {
            buf.push(sig_tag::DIR);
            buf.extend_from_slice(&perms.to_be_bytes());
        }
        Signature::Symlink { target } => {
            buf.push(sig_tag::SYMLINK);
            put_str(buf, target);
        }
    }
}

// === payload decoding ===

fn bad_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn get_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn get_u16(r: &mut impl Read) -> io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

fn get_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn get_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

fn get_str(r: &mut impl Read) -> io::Result<String> {
    let len = get_u16(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| bad_data("path is not valid UTF-8"))
}

fn get_sub(r: &mut impl Read) -> io::Result<SubPath> {
    let s = get_str(r)?;
    SubPath::parse(&s).map_err(|e| bad_data(e.to_string()))
}

fn get_hash(r: &mut impl Read) -> io::Result<BlockHash> {
    let mut raw = [0u8; 16];
    r.read_exact(&mut raw)?;
    Ok(BlockHash::from_raw(raw))
}

fn get_signature(r: &mut impl Read) -> io::Result<Signature> {
    match get_u8(r)? {
        sig_tag::FILE => {
            let perms = get_u32(r)?;
            let size = get_u64(r)?;
            let count = get_u32(r)? as usize;
            let mut block_hashes = Vec::with_capacity(count);
            for _ in 0..count {
                block_hashes.push(get_hash(r)?);
            }
            Ok(Signature::File {
                perms,
                block_hashes,
                size,
            })
        }
        sig_tag::DIR => Ok(Signature::Dir { perms: get_u32(r)? }),
        sig_tag::SYMLINK => Ok(Signature::Symlink { target: get_str(r)? }),
        tag => Err(bad_data(format!("unknown signature tag: {tag}"))),
    }
}

/// A request as received by the agent
#[derive(Debug)]
pub enum Request {
    FullScan { dest: String },
    Apply { dest: String, action: Action },
    Drain,
    Shutdown,
}

/// A reply as received by the client
#[derive(Debug)]
pub enum Reply {
    Ok,
    Err(String),
    Scan(Vec<(SubPath, Signature)>),
}

/// Writes framed messages
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    fn frame(&mut self, msg_type: u8, payload: &[u8]) -> io::Result<()> {
        self.inner.write_all(&[msg_type])?;
        self.inner.write_all(&(payload.len() as u32).to_be_bytes())?;
        self.inner.write_all(payload)?;
        self.inner.flush()
    }

    pub fn send_full_scan_req(&mut self, dest: &str) -> io::Result<()> {
        let mut payload = Vec::new();
        put_str(&mut payload, dest);
        self.frame(msg::FULL_SCAN_REQ, &payload)
    }

    pub fn send_scan_resp(&mut self, entries: &[(SubPath, Signature)]) -> io::Result<()> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for (sub, sig) in entries {
            put_sub(&mut payload, sub);
            put_signature(&mut payload, sig);
        }
        self.frame(msg::FULL_SCAN_RESP, &payload)
    }

    pub fn send_action(&mut self, dest: &str, action: &Action) -> io::Result<()> {
        let mut payload = Vec::new();
        put_str(&mut payload, dest);
        put_sub(&mut payload, action.sub());
        let msg_type = match action {
            Action::Remove { .. } => msg::REMOVE,
            Action::PutDir { perms, .. } => {
                payload.extend_from_slice(&perms.to_be_bytes());
                msg::PUT_DIR
            }
            Action::PutFile { perms, .. } => {
                payload.extend_from_slice(&perms.to_be_bytes());
                msg::PUT_FILE
            }
            Action::PutLink { target, .. } => {
                put_str(&mut payload, target);
                msg::PUT_LINK
            }
            Action::SetPerms { perms, .. } => {
                payload.extend_from_slice(&perms.to_be_bytes());
                msg::SET_PERMS
            }
            Action::WriteChunk {
                index, hash, data, ..
            } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(hash.as_bytes());
                payload.extend_from_slice(data);
                msg::WRITE_CHUNK
            }
            Action::SetSize { size, .. } => {
                payload.extend_from_slice(&size.to_be_bytes());
                msg::SET_SIZE
            }
        };
        self.frame(msg_type, &payload)
    }

    pub fn send_drain(&mut self) -> io::Result<()> {
        self.frame(msg::DRAIN, &[])
    }

    pub fn send_shutdown(&mut self) -> io::Result<()> {
        self.frame(msg::SHUTDOWN, &[])
    }

    pub fn send_ok(&mut self) -> io::Result<()> {
        self.frame(msg::OK, &[])
    }

    pub fn send_error(&mut self, message: &str) -> io::Result<()> {
        self.frame(msg::ERROR, message.as_bytes())
    }
}

/// Reads framed messages
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn read_frame(&mut self) -> io::Result<(u8, Vec<u8>)> {
        let msg_type = get_u8(&mut self.inner)?;
        let len = get_u32(&mut self.inner)? as usize;
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;
        Ok((msg_type, payload))
    }

    /// Next request, as seen by the agent. `Ok(None)` on clean EOF.
    pub fn read_request(&mut self) -> io::Result<Option<Request>> {
        let (msg_type, payload) = match self.read_frame() {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut r = payload.as_slice();

        let req = match msg_type {
            msg::FULL_SCAN_REQ => Request::FullScan { dest: get_str(&mut r)? },
            msg::DRAIN => Request::Drain,
            msg::SHUTDOWN => Request::Shutdown,
            msg::REMOVE
            | msg::PUT_DIR
            | msg::PUT_FILE
            | msg::PUT_LINK
            | msg::SET_PERMS
            | msg::WRITE_CHUNK
            | msg::SET_SIZE => {
                let dest = get_str(&mut r)?;
                let sub = get_sub(&mut r)?;
                let action = match msg_type {
                    msg::REMOVE => Action::Remove { sub },
                    msg::PUT_DIR => Action::PutDir {
                        sub,
                        perms: get_u32(&mut r)?,
                    },
                    msg::PUT_FILE => Action::PutFile {
                        sub,
                        perms: get_u32(&mut r)?,
                    },
                    msg::PUT_LINK => Action::PutLink {
                        sub,
                        target: get_str(&mut r)?,
                    },
                    msg::SET_PERMS => Action::SetPerms {
                        sub,
                        perms: get_u32(&mut r)?,
                    },
                    msg::WRITE_CHUNK => {
                        let index = get_u64(&mut r)?;
                        let hash = get_hash(&mut r)?;
                        Action::WriteChunk {
                            sub,
                            index,
                            hash,
                            data: Bytes::copy_from_slice(r),
                        }
                    }
                    _ => Action::SetSize {
                        sub,
                        size: get_u64(&mut r)?,
                    },
                };
                Request::Apply { dest, action }
            }
            other => return Err(bad_data(format!("unknown request type: {other}"))),
        };
        Ok(Some(req))
    }

    /// Next reply, as seen by the client
    pub fn read_reply(&mut self) -> Result<Reply, RpcError> {
        let (msg_type, payload) = self.read_frame()?;
        let mut r = payload.as_slice();
        match msg_type {
            msg::OK => Ok(Reply::Ok),
            msg::ERROR => Ok(Reply::Err(
                String::from_utf8_lossy(&payload).into_owned(),
            )),
            msg::FULL_SCAN_RESP => {
                let count = get_u32(&mut r)? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let sub = get_sub(&mut r)?;
                    let sig = get_signature(&mut r)?;
                    entries.push((sub, sig));
                }
                Ok(Reply::Scan(entries))
            }
            other => Err(RpcError::Protocol(format!("unknown reply type: {other}"))),
        }
    }
}

/// The remote agent as the orchestrator sees it.
///
/// Abstracting the concrete pipe lets tests substitute a recording or
/// failing endpoint for the real framed client.
pub trait Remote: Send {
    /// Full `(subpath, signature)` listing of the tree at `dest`
    fn full_scan(&mut self, dest: &str) -> Result<Vec<(SubPath, Signature)>, RpcError>;

    /// Fire-and-forget action write
    fn send(&mut self, dest: &str, action: &Action) -> Result<(), RpcError>;

    /// Block until every previously-sent action is applied
    fn drain(&mut self) -> Result<(), RpcError>;

    /// Ask the agent to exit
    fn shutdown(&mut self) -> Result<(), RpcError>;
}

/// Framed client over a duplex byte pipe. The sync thread is the only
/// writer, so no locking is needed.
pub struct RpcClient<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl<R: Read, W: Write> RpcClient<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }
}

impl<R: Read + Send, W: Write + Send> Remote for RpcClient<R, W> {
    fn full_scan(&mut self, dest: &str) -> Result<Vec<(SubPath, Signature)>, RpcError> {
        self.writer.send_full_scan_req(dest)?;
        match self.reader.read_reply()? {
            Reply::Scan(entries) => Ok(entries),
            Reply::Err(message) => Err(RpcError::Remote(message)),
            Reply::Ok => Err(RpcError::Protocol("expected scan listing, got ok".into())),
        }
    }

    fn send(&mut self, dest: &str, action: &Action) -> Result<(), RpcError> {
        self.writer.send_action(dest, action)?;
        Ok(())
    }

    fn drain(&mut self) -> Result<(), RpcError> {
        self.writer.send_drain()?;
        match self.reader.read_reply()? {
            Reply::Ok => Ok(()),
            Reply::Err(message) => Err(RpcError::Remote(message)),
            Reply::Scan(_) => Err(RpcError::Protocol("expected ack, got scan listing".into())),
        }
    }

    fn shutdown(&mut self) -> Result<(), RpcError> {
        self.writer.send_shutdown()?;
        // the agent acks and exits; EOF here is as good as an ack
        match self.reader.read_reply() {
            Ok(Reply::Ok) => Ok(()),
            Ok(Reply::Err(message)) => Err(RpcError::Remote(message)),
            Ok(Reply::Scan(_)) => Err(RpcError::Protocol("expected ack, got scan listing".into())),
            Err(RpcError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sub(s: &str) -> SubPath {
        SubPath::parse(s).unwrap()
    }

    fn roundtrip_action(action: Action) -> (String, Action) {
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf)
            .send_action("dest/dir", &action)
            .unwrap();
        match FrameReader::new(Cursor::new(buf)).read_request().unwrap() {
            Some(Request::Apply { dest, action }) => (dest, action),
            other => panic!("expected apply request, got {other:?}"),
        }
    }

    #[test]
    fn test_action_roundtrips() {
        let actions = vec![
            Action::Remove { sub: sub("a/b") },
            Action::PutDir {
                sub: sub("d"),
                perms: 0o755,
            },
            Action::PutFile {
                sub: sub("f"),
                perms: 0o600,
            },
            Action::PutLink {
                sub: sub("l"),
                target: "../x".to_string(),
            },
            Action::SetPerms {
                sub: sub("f"),
                perms: 0o644,
            },
            Action::WriteChunk {
                sub: sub("f"),
                index: 3,
                hash: BlockHash::of(b"chunk"),
                data: Bytes::from_static(b"chunk"),
            },
            Action::SetSize {
                sub: sub("f"),
                size: 12345,
            },
        ];
        for action in actions {
            let (dest, decoded) = roundtrip_action(action.clone());
            assert_eq!(dest, "dest/dir");
            assert_eq!(decoded, action);
        }
    }

    #[test]
    fn test_scan_listing_roundtrip() {
        let entries = vec![
            (sub(""), Signature::Dir { perms: 0o755 }),
            (
                sub("a/f"),
                Signature::File {
                    perms: 0o644,
                    block_hashes: vec![BlockHash::of(b"one"), BlockHash::of(b"two")],
                    size: 6,
                },
            ),
            (
                sub("a/l"),
                Signature::Symlink {
                    target: "f".to_string(),
                },
            ),
        ];

        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).send_scan_resp(&entries).unwrap();
        match FrameReader::new(Cursor::new(buf)).read_reply().unwrap() {
            Reply::Scan(decoded) => assert_eq!(decoded, entries),
            other => panic!("expected scan reply, got {other:?}"),
        }
    }

    #[test]
    fn test_control_frames() {
        let mut buf = Vec::new();
        {
            let mut w = FrameWriter::new(&mut buf);
            w.send_full_scan_req("root").unwrap();
            w.send_drain().unwrap();
            w.send_shutdown().unwrap();
        }

        let mut r = FrameReader::new(Cursor::new(buf));
        assert!(matches!(
            r.read_request().unwrap(),
            Some(Request::FullScan { dest }) if dest == "root"
        ));
        assert!(matches!(r.read_request().unwrap(), Some(Request::Drain)));
        assert!(matches!(r.read_request().unwrap(), Some(Request::Shutdown)));
        // clean EOF
        assert!(r.read_request().unwrap().is_none());
    }

    #[test]
    fn test_error_reply() {
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).send_error("boom").unwrap();
        match FrameReader::new(Cursor::new(buf)).read_reply().unwrap() {
            Reply::Err(message) => assert_eq!(message, "boom"),
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_request_type_rejected() {
        let buf = vec![0x7f, 0, 0, 0, 0];
        assert!(FrameReader::new(Cursor::new(buf)).read_request().is_err());
    }
}
