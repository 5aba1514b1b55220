use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::messaging::site_id::{HostId, SiteId};
use crate::messaging::subject::Subject;
use crate::util::buf::BufExt;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub const TAG_FAILURE_SITE_UPDATE: u8 = 16;

/// Tags below this value are reserved for link control frames and built-in messages
pub const FIRST_APPLICATION_TAG: u8 = 32;

/// The messages that are delivered to mailboxes. Every kind has a unique one-byte tag on the wire,
///  see [crate::messaging::codec::MessageRegistry] for the dispatch from tag to decoder.
///
/// Application-level messages (transaction coordination etc.) are opaque to this crate: they
///  travel as [VoltMessage::Payload] with an application-registered tag.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VoltMessage {
    Payload(PayloadData),
    FailureSiteUpdate(FailureSiteUpdateData),
}

/// The variant a tag is registered for; every tag decodes into exactly one of them
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageKind {
    Payload,
    FailureSiteUpdate,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PayloadData {
    pub tag: u8,
    pub subject: Subject,
    pub source: SiteId,
    pub body: Bytes,
}

/// Emitted locally to every mailbox when a peer host is detected as failed, so that higher layers
///  can run their fault handling.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FailureSiteUpdateData {
    pub reporting_host: HostId,
    pub failed_host: HostId,
    pub surviving_hosts: Vec<HostId>,
}

impl FailureSiteUpdateData {
    pub fn is_failed_site(&self, site: SiteId) -> bool {
        site.host_id() == self.failed_host
    }
}

impl VoltMessage {
    pub fn payload(tag: u8, subject: Subject, source: SiteId, body: impl Into<Bytes>) -> VoltMessage {
        VoltMessage::Payload(PayloadData {
            tag,
            subject,
            source,
            body: body.into(),
        })
    }

    pub fn tag(&self) -> u8 {
        match self {
            VoltMessage::Payload(data) => data.tag,
            VoltMessage::FailureSiteUpdate(_) => TAG_FAILURE_SITE_UPDATE,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            VoltMessage::Payload(_) => MessageKind::Payload,
            VoltMessage::FailureSiteUpdate(_) => MessageKind::FailureSiteUpdate,
        }
    }

    pub fn subject(&self) -> Subject {
        match self {
            VoltMessage::Payload(data) => data.subject,
            VoltMessage::FailureSiteUpdate(_) => Subject::FailureSiteUpdate,
        }
    }

    /// serializes the message body, i.e. everything after the tag
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            VoltMessage::Payload(data) => Self::ser_payload(data, buf),
            VoltMessage::FailureSiteUpdate(data) => Self::ser_failure_site_update(data, buf),
        }
    }

    fn ser_payload(data: &PayloadData, buf: &mut BytesMut) {
        buf.reserve(5 + data.body.len());
        buf.put_u8(data.subject.into());
        buf.put_u32_le(data.source.0);
        buf.put_slice(&data.body);
    }

    fn ser_failure_site_update(data: &FailureSiteUpdateData, buf: &mut BytesMut) {
        buf.put_u32_le(data.reporting_host.0);
        buf.put_u32_le(data.failed_host.0);
        buf.put_u16_le(data.surviving_hosts.len().prechecked_cast());
        for h in &data.surviving_hosts {
            buf.put_u32_le(h.0);
        }
    }

    /// The payload body is the rest of the frame, so this is zero-copy for [Bytes]
    pub fn deser_payload(tag: u8, buf: &mut Bytes) -> anyhow::Result<VoltMessage> {
        let subject = Subject::try_from(buf.checked_u8()?)?;
        let source = SiteId(buf.checked_u32()?);
        let body = buf.split_to(buf.remaining());

        Ok(VoltMessage::Payload(PayloadData {
            tag,
            subject,
            source,
            body,
        }))
    }

    pub fn deser_failure_site_update(_tag: u8, buf: &mut Bytes) -> anyhow::Result<VoltMessage> {
        let reporting_host = HostId(buf.checked_u32()?);
        let failed_host = HostId(buf.checked_u32()?);
        let num_surviving: usize = buf.checked_u16()?.safe_cast();
        let mut surviving_hosts = Vec::with_capacity(num_surviving);
        for _ in 0..num_surviving {
            surviving_hosts.push(HostId(buf.checked_u32()?));
        }
        if buf.has_remaining() {
            bail!("{} trailing bytes after failure site update", buf.remaining());
        }

        Ok(VoltMessage::FailureSiteUpdate(FailureSiteUpdateData {
            reporting_host,
            failed_host,
            surviving_hosts,
        }))
    }
}
