// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol of the local control socket.
//!
//! Every message starts with a fixed 32-byte little-endian header; command
//! bodies follow as bincode-encoded records. Replies reuse the request
//! header with `data` carrying the result code (0 = success) and `data2`
//! carrying a per-command count.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::Error;

/// Constant at the front of every message.
pub const SM_MAGIC: u32 = 0x4C4F_4445;
/// Wire version.
pub const SM_VERSION: u32 = 1;
/// Encoded header length.
pub const HEADER_SIZE: usize = 32;
/// Upper bound on one message, header included.
pub const MAX_CLIENT_MSG: usize = 1024 * 1024;

/// Release command flag: release every lease the client holds, no body.
pub const REL_ALL: u32 = 0x1;

/// `data2` value addressing the calling connection's own registration.
pub const SELF_PID: u32 = u32::MAX;

/// Command codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Cmd {
    Register = 1,
    Shutdown = 2,
    Status = 3,
    LogDump = 4,
    AddLockspace = 5,
    RemLockspace = 6,
    Acquire = 7,
    Release = 8,
    Inquire = 9,
}

impl TryFrom<u32> for Cmd {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Error> {
        match value {
            1 => Ok(Self::Register),
            2 => Ok(Self::Shutdown),
            3 => Ok(Self::Status),
            4 => Ok(Self::LogDump),
            5 => Ok(Self::AddLockspace),
            6 => Ok(Self::RemLockspace),
            7 => Ok(Self::Acquire),
            8 => Ok(Self::Release),
            9 => Ok(Self::Inquire),
            other => Err(Error::Protocol(format!("unknown command {other}"))),
        }
    }
}

/// The fixed message header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub cmd: u32,
    pub cmd_flags: u32,
    /// Total bytes including this header.
    pub length: u32,
    pub seq: u32,
    /// Primary argument, or the result code in replies.
    pub data: u32,
    /// Secondary argument (e.g. target pid; [`SELF_PID`] = self).
    pub data2: u32,
}

impl Header {
    #[must_use]
    pub fn request(cmd: Cmd, cmd_flags: u32, body_len: usize, data: u32, data2: u32) -> Self {
        Self {
            magic: SM_MAGIC,
            version: SM_VERSION,
            cmd: cmd as u32,
            cmd_flags,
            length: (HEADER_SIZE + body_len) as u32,
            seq: 0,
            data,
            data2,
        }
    }

    /// Reply header: the request's header with result and count filled in.
    #[must_use]
    pub fn reply(&self, result: u32, data2: u32, body_len: usize) -> Self {
        let mut reply = *self;
        reply.length = (HEADER_SIZE + body_len) as u32;
        reply.data = result;
        reply.data2 = data2;
        reply
    }

    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.cmd);
        buf.put_u32_le(self.cmd_flags);
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.seq);
        buf.put_u32_le(self.data);
        buf.put_u32_le(self.data2);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Protocol("short header".into()));
        }
        let mut buf = data;
        let header = Self {
            magic: buf.get_u32_le(),
            version: buf.get_u32_le(),
            cmd: buf.get_u32_le(),
            cmd_flags: buf.get_u32_le(),
            length: buf.get_u32_le(),
            seq: buf.get_u32_le(),
            data: buf.get_u32_le(),
            data2: buf.get_u32_le(),
        };
        if header.magic != SM_MAGIC {
            return Err(Error::Protocol(format!(
                "bad magic {:x} vs {:x}",
                header.magic, SM_MAGIC
            )));
        }
        if (header.length as usize) < HEADER_SIZE || header.length as usize > MAX_CLIENT_MSG {
            return Err(Error::Protocol(format!("bad length {}", header.length)));
        }
        Ok(header)
    }
}

/// One disk location of a resource.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskSpec {
    pub path: String,
    pub offset: u64,
}

/// A resource a client wants acquired or released.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub lockspace_name: String,
    pub resource_name: String,
    pub disks: Vec<DiskSpec>,
    /// Pin the expected lease version (0 = no pin).
    pub lver: u64,
    /// Rewrite the leader's num_hosts on acquire (0 = keep).
    pub num_hosts: u64,
    pub shared: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub owner_name: String,
    pub resources: Vec<ResourceSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub resources: Vec<ResourceSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockspaceSpec {
    pub name: String,
    pub host_id: u64,
    pub path: String,
    pub offset: u64,
    /// 0 = daemon default.
    pub io_timeout: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InquireReply {
    pub count: u32,
    /// `space:resource:path:offset:lver` per held lease, space separated.
    pub state: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub io_timeout: u32,
    pub renewal: u32,
    pub renewal_fail: u32,
    pub host_id_timeout: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpaceStatus {
    pub name: String,
    pub host_id: u64,
    pub host_generation: u64,
    /// Seconds since the last successful renewal.
    pub renewal_age: u64,
    pub killing_pids: u32,
    pub external_remove: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenStatus {
    pub token_id: u64,
    pub lockspace_name: String,
    pub resource_name: String,
    pub lver: u64,
    pub timestamp: u64,
    pub shared: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientStatus {
    pub pid: i32,
    pub owner_name: String,
    pub cmd_active: u32,
    pub killing: u32,
    pub tokens: Vec<TokenStatus>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusReply {
    pub daemon: DaemonStatus,
    pub spaces: Vec<SpaceStatus>,
    pub clients: Vec<ClientStatus>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogDumpReply {
    pub lines: Vec<String>,
}

pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|err| Error::Protocol(format!("encode: {err}")))
}

pub fn decode_body<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, Error> {
    let (value, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())
        .map_err(|err| Error::Protocol(format!("decode: {err}")))?;
    Ok(value)
}

/// Reads one header and its body off the stream. Returns `None` on a clean
/// EOF before any header byte.
pub async fn read_message(stream: &mut UnixStream) -> Result<Option<(Header, Vec<u8>)>, Error> {
    let mut head = [0u8; HEADER_SIZE];
    let mut read = 0;
    while read < HEADER_SIZE {
        let n = stream
            .read(&mut head[read..])
            .await
            .map_err(|err| Error::Protocol(format!("read: {err}")))?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(Error::Protocol("eof inside header".into()));
        }
        read += n;
    }
    let header = Header::decode(&head)?;
    let body_len = header.length as usize - HEADER_SIZE;
    let mut body = vec![0u8; body_len];
    if body_len > 0 {
        stream
            .read_exact(&mut body)
            .await
            .map_err(|err| Error::Protocol(format!("read body: {err}")))?;
    }
    Ok(Some((header, body)))
}

/// Writes one header and its body to the stream.
pub async fn write_message(
    stream: &mut UnixStream,
    header: &Header,
    body: &[u8],
) -> Result<(), Error> {
    debug_assert_eq!(header.length as usize, HEADER_SIZE + body.len());
    stream
        .write_all(&header.encode())
        .await
        .map_err(|err| Error::Protocol(format!("write: {err}")))?;
    if !body.is_empty() {
        stream
            .write_all(body)
            .await
            .map_err(|err| Error::Protocol(format!("write body: {err}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = Header::request(Cmd::Acquire, 0, 100, 2, SELF_PID);
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let back = Header::decode(&bytes).unwrap();
        assert_eq!(back, header);
        assert_eq!(back.length as usize, HEADER_SIZE + 100);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut bytes = Header::request(Cmd::Status, 0, 0, 0, 0).encode();
        bytes[0] ^= 0xFF;
        assert!(Header::decode(&bytes).is_err());
    }

    #[test]
    fn header_rejects_bad_length() {
        let mut header = Header::request(Cmd::Status, 0, 0, 0, 0);
        header.length = 4;
        let bytes = header.encode();
        assert!(Header::decode(&bytes).is_err());
    }

    #[test]
    fn cmd_conversion() {
        assert_eq!(Cmd::try_from(7).unwrap(), Cmd::Acquire);
        assert!(Cmd::try_from(0).is_err());
        assert!(Cmd::try_from(99).is_err());
    }

    #[test]
    fn body_round_trip() {
        let req = AcquireRequest {
            owner_name: "qemu".into(),
            resources: vec![ResourceSpec {
                lockspace_name: "vg0".into(),
                resource_name: "disk1".into(),
                disks: vec![DiskSpec {
                    path: "/dev/vg0/leases".into(),
                    offset: 1024 * 1024,
                }],
                lver: 0,
                num_hosts: 0,
                shared: false,
            }],
        };
        let bytes = encode_body(&req).unwrap();
        let back: AcquireRequest = decode_body(&bytes).unwrap();
        assert_eq!(back.owner_name, "qemu");
        assert_eq!(back.resources.len(), 1);
        assert_eq!(back.resources[0].disks[0].offset, 1024 * 1024);
    }

    #[test]
    fn reply_preserves_request_fields() {
        let req = Header::request(Cmd::Release, REL_ALL, 0, 0, 42);
        let reply = req.reply(17, 3, 0);
        assert_eq!(reply.cmd, Cmd::Release as u32);
        assert_eq!(reply.cmd_flags, REL_ALL);
        assert_eq!(reply.data, 17);
        assert_eq!(reply.data2, 3);
    }
}
