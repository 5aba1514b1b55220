use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::join::fingerprint::ConfigFingerprint;
use crate::messaging::codec::{build_frame, read_handshake_frame, write_handshake_frame};
use crate::messaging::site_id::HostId;
use crate::util::buf::{BufExt, BufMutExt};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub const PROTOCOL_VERSION: u32 = 1;

const ID_REQUEST: u8 = 1;
const ID_ACCEPTED: u8 = 2;
const ID_REJECTED: u8 = 3;
const ID_MESH: u8 = 4;
const ID_MESH_ACK: u8 = 5;

/// Why a host refused a join or mesh handshake. Only some reasons are worth retrying: everything
///  else indicates a misconfiguration that will not go away by itself.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RejectReason {
    VersionMismatch = 1,
    CatalogMismatch = 2,
    DeploymentMismatch = 3,
    TopologyMismatch = 4,
    DuplicateAddress = 5,
    ClusterFull = 6,
    RejoinInProgress = 7,
    RejoinNotPermitted = 8,
    RejoinPrepareFailed = 9,
}

impl RejectReason {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RejectReason::TopologyMismatch | RejectReason::RejoinInProgress | RejectReason::RejoinPrepareFailed)
    }

    /// compares two fingerprints, reporting catalog differences before deployment differences
    pub fn check_fingerprint(expected: &ConfigFingerprint, actual: &ConfigFingerprint) -> Option<RejectReason> {
        if expected.catalog_crc != actual.catalog_crc {
            Some(RejectReason::CatalogMismatch)
        }
        else if expected.deployment_crc != actual.deployment_crc {
            Some(RejectReason::DeploymentMismatch)
        }
        else {
            None
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum JoinKind {
    /// part of initial cluster formation
    Initial = 0,
    /// taking over the slot of a failed host in a running cluster
    Rejoin = 1,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct RosterEntry {
    pub host_id: HostId,
    pub listen_addr: SocketAddr,
}

/// The handshake messages exchanged on a fresh TCP connection before it becomes a peer connection
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum JoinMessage {
    Request(JoinRequestData),
    Accepted(JoinAcceptedData),
    Rejected(RejectReason),
    Mesh(MeshData),
    MeshAck(HostId),
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct JoinRequestData {
    pub protocol_version: u32,
    pub fingerprint: ConfigFingerprint,
    pub expected_hosts: u32,
    pub listen_addr: SocketAddr,
    /// random per process, for telling apart log output of successive attempts
    pub instance_id: u64,
    pub kind: JoinKind,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct JoinAcceptedData {
    pub assigned_host_id: HostId,
    /// the host that admitted the receiver over this connection
    pub sponsor_host_id: HostId,
    /// all members including the receiver
    pub roster: Vec<RosterEntry>,
}

/// Opens a connection between two hosts that were both admitted by a coordinator: the higher
///  host id connects to the lower one during formation, and live members connect to a
///  rejoining host. The fingerprint is checked again on the receiving side.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct MeshData {
    pub from_host_id: HostId,
    pub from_listen_addr: SocketAddr,
    pub target_host_id: HostId,
    pub fingerprint: ConfigFingerprint,
}

impl JoinMessage {
    pub fn id(&self) -> u8 {
        match self {
            JoinMessage::Request(_) => ID_REQUEST,
            JoinMessage::Accepted(_) => ID_ACCEPTED,
            JoinMessage::Rejected(_) => ID_REJECTED,
            JoinMessage::Mesh(_) => ID_MESH,
            JoinMessage::MeshAck(_) => ID_MESH_ACK,
        }
    }

    /// serializes the message into a complete frame, including its length prefix
    pub fn ser(&self) -> anyhow::Result<Bytes> {
        Ok(build_frame(self.id(), |buf| match self {
            JoinMessage::Request(data) => Self::ser_request(data, buf),
            JoinMessage::Accepted(data) => Self::ser_accepted(data, buf),
            JoinMessage::Rejected(reason) => buf.put_u8((*reason).into()),
            JoinMessage::Mesh(data) => Self::ser_mesh(data, buf),
            JoinMessage::MeshAck(host_id) => buf.put_u32_le(host_id.0),
        })?)
    }

    fn ser_request(data: &JoinRequestData, buf: &mut BytesMut) {
        buf.put_u32_le(data.protocol_version);
        data.fingerprint.ser(buf);
        buf.put_u32_le(data.expected_hosts);
        buf.put_socket_addr(&data.listen_addr);
        buf.put_u64_le(data.instance_id);
        buf.put_u8(data.kind.into());
    }

    fn ser_accepted(data: &JoinAcceptedData, buf: &mut BytesMut) {
        buf.put_u32_le(data.assigned_host_id.0);
        buf.put_u32_le(data.sponsor_host_id.0);
        buf.put_u16_le(data.roster.len().prechecked_cast());
        for entry in &data.roster {
            buf.put_u32_le(entry.host_id.0);
            buf.put_socket_addr(&entry.listen_addr);
        }
    }

    fn ser_mesh(data: &MeshData, buf: &mut BytesMut) {
        buf.put_u32_le(data.from_host_id.0);
        buf.put_socket_addr(&data.from_listen_addr);
        buf.put_u32_le(data.target_host_id.0);
        data.fingerprint.ser(buf);
    }

    /// deserializes a frame's content, i.e. everything after the length prefix
    pub fn deser(mut buf: Bytes) -> anyhow::Result<JoinMessage> {
        let result = match buf.checked_u8()? {
            ID_REQUEST => Self::deser_request(&mut buf)?,
            ID_ACCEPTED => Self::deser_accepted(&mut buf)?,
            ID_REJECTED => JoinMessage::Rejected(RejectReason::try_from(buf.checked_u8()?)?),
            ID_MESH => Self::deser_mesh(&mut buf)?,
            ID_MESH_ACK => JoinMessage::MeshAck(HostId(buf.checked_u32()?)),
            id => return Err(anyhow!("invalid join message discriminator {}", id)),
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after join message", buf.remaining());
        }
        Ok(result)
    }

    fn deser_request(buf: &mut Bytes) -> anyhow::Result<JoinMessage> {
        Ok(JoinMessage::Request(JoinRequestData {
            protocol_version: buf.checked_u32()?,
            fingerprint: ConfigFingerprint::deser(buf)?,
            expected_hosts: buf.checked_u32()?,
            listen_addr: buf.checked_socket_addr()?,
            instance_id: buf.checked_u64()?,
            kind: JoinKind::try_from(buf.checked_u8()?)?,
        }))
    }

    fn deser_accepted(buf: &mut Bytes) -> anyhow::Result<JoinMessage> {
        let assigned_host_id = HostId(buf.checked_u32()?);
        let sponsor_host_id = HostId(buf.checked_u32()?);
        let num_entries: usize = buf.checked_u16()?.safe_cast();
        let mut roster = Vec::with_capacity(num_entries.min(1024));
        for _ in 0..num_entries {
            roster.push(RosterEntry {
                host_id: HostId(buf.checked_u32()?),
                listen_addr: buf.checked_socket_addr()?,
            });
        }

        Ok(JoinMessage::Accepted(JoinAcceptedData {
            assigned_host_id,
            sponsor_host_id,
            roster,
        }))
    }

    fn deser_mesh(buf: &mut Bytes) -> anyhow::Result<JoinMessage> {
        Ok(JoinMessage::Mesh(MeshData {
            from_host_id: HostId(buf.checked_u32()?),
            from_listen_addr: buf.checked_socket_addr()?,
            target_host_id: HostId(buf.checked_u32()?),
            fingerprint: ConfigFingerprint::deser(buf)?,
        }))
    }

    pub async fn write_to<W: tokio::io::AsyncWrite + Unpin>(&self, stream: &mut W) -> anyhow::Result<()> {
        write_handshake_frame(stream, &self.ser()?).await
    }

    pub async fn read_from<R: tokio::io::AsyncRead + Unpin>(stream: &mut R) -> anyhow::Result<JoinMessage> {
        Self::deser(read_handshake_frame(stream).await?)
    }
}
