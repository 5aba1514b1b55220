use std::net::SocketAddr;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::messaging::message::VoltMessage;
use crate::messaging::site_id::{HostId, MailboxId, SiteId};
use crate::util::buf::{BufExt, BufMutExt};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub const TAG_HEARTBEAT: u8 = 1;
pub const TAG_HOST_READY: u8 = 2;
pub const TAG_POISON_PILL: u8 = 3;
pub const TAG_REJOIN_PREPARE: u8 = 4;
pub const TAG_REJOIN_PREPARE_ACK: u8 = 5;
pub const TAG_REJOIN_COMMIT: u8 = 6;
pub const TAG_REJOIN_ROLLBACK: u8 = 7;

pub const LAST_CONTROL_TAG: u8 = 15;

/// Everything that travels over an established peer connection. Link control frames are handled by
///  the messenger itself, only [Frame::Routed] reaches mailboxes.
///
/// On the wire, routed frames carry the tag of their message: the tag spaces of control frames
///  and messages are disjoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    Routed(RoutedMessage),
    Heartbeat(HeartbeatData),
    HostReady(HostId),
    PoisonPill(String),
    RejoinPrepare(RejoinPrepareData),
    RejoinPrepareAck(RejoinPrepareAckData),
    RejoinCommit(HostId),
    RejoinRollback(HostId),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoutedMessage {
    pub mailbox_id: MailboxId,
    pub destinations: Vec<SiteId>,
    pub message: VoltMessage,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeartbeatData {
    pub counter: u32,
}

/// Sent by a rejoin sponsor to every live peer: stage a connection to the rejoining node that
///  will take over `host_id`, listening on `addr`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejoinPrepareData {
    pub host_id: HostId,
    pub addr: SocketAddr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejoinPrepareAckData {
    pub host_id: HostId,
    pub accepted: bool,
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Routed(routed) => routed.message.tag(),
            Frame::Heartbeat(_) => TAG_HEARTBEAT,
            Frame::HostReady(_) => TAG_HOST_READY,
            Frame::PoisonPill(_) => TAG_POISON_PILL,
            Frame::RejoinPrepare(_) => TAG_REJOIN_PREPARE,
            Frame::RejoinPrepareAck(_) => TAG_REJOIN_PREPARE_ACK,
            Frame::RejoinCommit(_) => TAG_REJOIN_COMMIT,
            Frame::RejoinRollback(_) => TAG_REJOIN_ROLLBACK,
        }
    }

    pub fn is_control_tag(tag: u8) -> bool {
        (1..=LAST_CONTROL_TAG).contains(&tag)
    }

    /// serializes a control frame's payload. Routed messages are serialized by the codec because
    ///  their body is shared between all destination hosts of a fan-out.
    pub fn ser_control(&self, buf: &mut BytesMut) {
        match self {
            Frame::Routed(_) => {}
            Frame::Heartbeat(data) => buf.put_u32_le(data.counter),
            Frame::HostReady(host_id) => buf.put_u32_le(host_id.0),
            Frame::PoisonPill(reason) => buf.put_string(reason),
            Frame::RejoinPrepare(data) => {
                buf.put_u32_le(data.host_id.0);
                buf.put_socket_addr(&data.addr);
            }
            Frame::RejoinPrepareAck(data) => {
                buf.put_u32_le(data.host_id.0);
                buf.put_u8(data.accepted as u8);
            }
            Frame::RejoinCommit(host_id) => buf.put_u32_le(host_id.0),
            Frame::RejoinRollback(host_id) => buf.put_u32_le(host_id.0),
        }
    }

    pub fn deser_control(tag: u8, buf: &mut Bytes) -> anyhow::Result<Frame> {
        let result = match tag {
            TAG_HEARTBEAT => Frame::Heartbeat(HeartbeatData { counter: buf.checked_u32()? }),
            TAG_HOST_READY => Frame::HostReady(HostId(buf.checked_u32()?)),
            TAG_POISON_PILL => Frame::PoisonPill(buf.checked_string()?),
            TAG_REJOIN_PREPARE => Frame::RejoinPrepare(RejoinPrepareData {
                host_id: HostId(buf.checked_u32()?),
                addr: buf.checked_socket_addr()?,
            }),
            TAG_REJOIN_PREPARE_ACK => Frame::RejoinPrepareAck(RejoinPrepareAckData {
                host_id: HostId(buf.checked_u32()?),
                accepted: buf.checked_u8()? != 0,
            }),
            TAG_REJOIN_COMMIT => Frame::RejoinCommit(HostId(buf.checked_u32()?)),
            TAG_REJOIN_ROLLBACK => Frame::RejoinRollback(HostId(buf.checked_u32()?)),
            other => bail!("not a control frame tag: {}", other),
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after control frame with tag {}", buf.remaining(), tag);
        }
        Ok(result)
    }
}

impl RoutedMessage {
    pub fn ser_header(mailbox_id: MailboxId, destinations: &[SiteId], buf: &mut BytesMut) {
        buf.put_u32_le(mailbox_id.0);
        buf.put_u16_le(destinations.len().prechecked_cast());
        for site in destinations {
            buf.put_u32_le(site.0);
        }
    }

    pub fn deser_header(buf: &mut Bytes) -> anyhow::Result<(MailboxId, Vec<SiteId>)> {
        let mailbox_id = MailboxId(buf.checked_u32()?);
        let num_destinations: usize = buf.checked_u16()?.safe_cast();
        if buf.remaining() < num_destinations * 4 {
            bail!("routed frame announces {} destinations but has only {} bytes left", num_destinations, buf.remaining());
        }

        let mut destinations = Vec::with_capacity(num_destinations);
        for _ in 0..num_destinations {
            destinations.push(SiteId(buf.checked_u32()?));
        }
        Ok((mailbox_id, destinations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::heartbeat(Frame::Heartbeat(HeartbeatData { counter: 12345 }))]
    #[case::host_ready(Frame::HostReady(HostId(3)))]
    #[case::poison_pill(Frame::PoisonPill("catalog update failed".to_string()))]
    #[case::poison_pill_empty(Frame::PoisonPill("".to_string()))]
    #[case::rejoin_prepare(Frame::RejoinPrepare(RejoinPrepareData { host_id: HostId(1), addr: "127.0.0.1:3021".parse().unwrap() }))]
    #[case::rejoin_prepare_ack(Frame::RejoinPrepareAck(RejoinPrepareAckData { host_id: HostId(1), accepted: true }))]
    #[case::rejoin_prepare_nak(Frame::RejoinPrepareAck(RejoinPrepareAckData { host_id: HostId(1), accepted: false }))]
    #[case::rejoin_commit(Frame::RejoinCommit(HostId(2)))]
    #[case::rejoin_rollback(Frame::RejoinRollback(HostId(2)))]
    fn test_ser_deser_control(#[case] frame: Frame) {
        assert!(Frame::is_control_tag(frame.tag()));

        let mut buf = BytesMut::new();
        frame.ser_control(&mut buf);
        let deser = Frame::deser_control(frame.tag(), &mut buf.freeze()).unwrap();
        assert_eq!(deser, frame);
    }

    #[test]
    fn test_deser_control_trailing_bytes() {
        let mut buf = Bytes::from_static(b"\x01\0\0\0\x02");
        assert!(Frame::deser_control(TAG_HOST_READY, &mut buf).is_err());
    }

    #[rstest]
    #[case::single(vec![SiteId(101)])]
    #[case::multi(vec![SiteId(101), SiteId(102), SiteId(205)])]
    #[case::none(vec![])]
    fn test_routed_header(#[case] destinations: Vec<SiteId>) {
        let mut buf = BytesMut::new();
        RoutedMessage::ser_header(MailboxId(7), &destinations, &mut buf);
        buf.put_slice(b"body");

        let mut buf = buf.freeze();
        let (mailbox_id, deser) = RoutedMessage::deser_header(&mut buf).unwrap();
        assert_eq!(mailbox_id, MailboxId(7));
        assert_eq!(deser, destinations);
        assert_eq!(buf.as_ref(), b"body");
    }

    #[test]
    fn test_routed_header_too_many_destinations() {
        let mut buf = Bytes::from_static(b"\x07\0\0\0\xff\xff\x01\0\0\0");
        assert!(RoutedMessage::deser_header(&mut buf).is_err());
    }
}
