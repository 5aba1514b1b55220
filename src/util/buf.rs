use std::mem::size_of;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};

use crate::util::safe_converter::{PrecheckedCast, SafeCast};

// All multi-byte integers on the wire are little-endian, both in frames and in handshake messages.

macro_rules! checked_get_impl {
    ($name: ident, $ty:ty, $getter: ident) => {
        fn $name(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                bail!("buffer underflow reading {}: {} bytes remaining", stringify!($ty), self.remaining());
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked reads for untrusted input: the plain `get_*` methods of [Buf] panic on
///  underflow, which is not acceptable for data coming in over the network.
pub trait BufExt: Buf {
    checked_get_impl!(checked_u8, u8, get_u8);
    checked_get_impl!(checked_u16, u16, get_u16_le);
    checked_get_impl!(checked_u32, u32, get_u32_le);
    checked_get_impl!(checked_u64, u64, get_u64_le);
    checked_get_impl!(checked_u128, u128, get_u128_le);

    fn checked_bytes(&mut self, len: usize) -> anyhow::Result<Bytes> {
        if self.remaining() < len {
            bail!("buffer underflow reading {} bytes: {} bytes remaining", len, self.remaining());
        }
        Ok(self.copy_to_bytes(len))
    }

    fn checked_string(&mut self) -> anyhow::Result<String> {
        let len: usize = self.checked_u32()?.safe_cast();
        let raw = self.checked_bytes(len)?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    fn checked_socket_addr(&mut self) -> anyhow::Result<SocketAddr> {
        match self.checked_u8()? {
            4 => {
                let ip = self.checked_u32()?;
                let port = self.checked_u16()?;
                Ok(SocketAddr::V4(SocketAddrV4::new(ip.into(), port)))
            }
            6 => {
                let ip = self.checked_u128()?;
                let port = self.checked_u16()?;
                Ok(SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0)))
            }
            n => Err(anyhow!("invalid socket address discriminator: {}", n)),
        }
    }
}

pub trait BufMutExt: BufMut {
    fn put_string(&mut self, s: &str) {
        self.put_u32_le(s.len().prechecked_cast());
        self.put_slice(s.as_bytes());
    }

    fn put_socket_addr(&mut self, addr: &SocketAddr) {
        match addr {
            SocketAddr::V4(data) => {
                self.put_u8(4);
                self.put_u32_le(data.ip().to_bits());
                self.put_u16_le(data.port());
            }
            SocketAddr::V6(data) => {
                self.put_u8(6);
                self.put_u128_le(data.ip().to_bits());
                self.put_u16_le(data.port());
            }
        }
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
