use bytes::BufMut;
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::util::buf::BufExt;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Checksums of the configuration all hosts of a cluster must share. Hosts with different
///  fingerprints would silently diverge, so a mismatch is never admitted.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct ConfigFingerprint {
    pub catalog_crc: u32,
    pub deployment_crc: u32,
}

impl ConfigFingerprint {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn compute(catalog: &[u8], deployment: &[u8]) -> ConfigFingerprint {
        ConfigFingerprint {
            catalog_crc: CRC32.checksum(catalog),
            deployment_crc: CRC32.checksum(deployment),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.catalog_crc);
        buf.put_u32_le(self.deployment_crc);
    }

    pub fn deser(buf: &mut impl BufExt) -> anyhow::Result<ConfigFingerprint> {
        Ok(ConfigFingerprint {
            catalog_crc: buf.checked_u32()?,
            deployment_crc: buf.checked_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_compute() {
        let fp = ConfigFingerprint::compute(b"123456789", b"");
        // standard check value of CRC-32/ISO-HDLC
        assert_eq!(fp.catalog_crc, 0xcbf43926);
        assert_eq!(fp.deployment_crc, 0);
    }

    #[test]
    fn test_differs() {
        let a = ConfigFingerprint::compute(b"create table a (x int);", b"<deployment hostcount=\"2\"/>");
        let b = ConfigFingerprint::compute(b"create table a (x bigint);", b"<deployment hostcount=\"2\"/>");
        assert_ne!(a.catalog_crc, b.catalog_crc);
        assert_eq!(a.deployment_crc, b.deployment_crc);
    }

    #[test]
    fn test_ser_deser() {
        let fp = ConfigFingerprint::compute(b"catalog", b"deployment");
        let mut buf = BytesMut::new();
        fp.ser(&mut buf);
        assert_eq!(buf.len(), ConfigFingerprint::SERIALIZED_LEN);
        assert_eq!(ConfigFingerprint::deser(&mut buf.freeze()).unwrap(), fp);
    }
}
