//! Typed packing of the property-protocol wire format
//!
//! The wire algebra is small and fixed: unsigned 8/16/32 (multi-byte
//! little-endian), signed 8, bool, NUL-terminated UTF-8, packed unsigned
//! integer (7-bit little-endian varint), fixed-size EUI-64 and IPv6
//! address, length-prefixed data, trailing data, and an anonymous struct
//! (an opaque length-prefixed grouping). Unpacking borrows strings, data
//! and addresses out of the frame buffer; type mismatches surface
//! [`Error::Parse`].

use ncplink_core::Error;

/// Serializes typed fields into a caller-supplied buffer.
pub struct Packer<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> Packer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let end = self.len.checked_add(bytes.len()).ok_or(Error::NoBufs)?;
        if end > self.buf.len() {
            return Err(Error::NoBufs);
        }

        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), Error> {
        self.put_bytes(&[value])
    }

    pub fn put_i8(&mut self, value: i8) -> Result<(), Error> {
        self.put_bytes(&[value as u8])
    }

    pub fn put_bool(&mut self, value: bool) -> Result<(), Error> {
        self.put_bytes(&[value as u8])
    }

    pub fn put_u16(&mut self, value: u16) -> Result<(), Error> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<(), Error> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Packed unsigned integer: 7 bits per byte, little-endian, the high
    /// bit flagging continuation.
    pub fn put_uint_packed(&mut self, mut value: u32) -> Result<(), Error> {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.put_bytes(&[byte])?;
            if value == 0 {
                return Ok(());
            }
        }
    }

    /// NUL-terminated UTF-8 string.
    pub fn put_utf8(&mut self, value: &str) -> Result<(), Error> {
        self.put_bytes(value.as_bytes())?;
        self.put_bytes(&[0])
    }

    pub fn put_eui64(&mut self, value: &[u8; 8]) -> Result<(), Error> {
        self.put_bytes(value)
    }

    pub fn put_ipv6(&mut self, value: &[u8; 16]) -> Result<(), Error> {
        self.put_bytes(value)
    }

    /// Data with a u16 length prefix.
    pub fn put_data(&mut self, value: &[u8]) -> Result<(), Error> {
        let len = u16::try_from(value.len()).map_err(|_| Error::InvalidArgs)?;
        self.put_u16(len)?;
        self.put_bytes(value)
    }

    /// Trailing data without a length prefix; must be the last field.
    pub fn put_data_raw(&mut self, value: &[u8]) -> Result<(), Error> {
        self.put_bytes(value)
    }

    /// Packs an anonymous struct: the closure fills the group, then the
    /// u16 length prefix is fixed up around it.
    pub fn put_struct(
        &mut self,
        fill: impl FnOnce(&mut Packer<'_>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.put_u16(0)?;
        let prefix = self.len;

        let mut inner = Packer {
            buf: &mut *self.buf,
            len: prefix,
        };
        fill(&mut inner)?;
        let end = inner.len;

        let group_len = u16::try_from(end - prefix).map_err(|_| Error::InvalidArgs)?;
        self.buf[prefix - 2..prefix].copy_from_slice(&group_len.to_le_bytes());
        self.len = end;
        Ok(())
    }
}

/// Deserializes typed fields out of a frame buffer.
///
/// Borrowing getters return slices into the frame buffer; they stay valid
/// for as long as the buffer, not the unpacker.
#[derive(Clone)]
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(n).ok_or(Error::Parse)?;
        if end > self.buf.len() {
            return Err(Error::Parse);
        }

        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn get_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn get_i8(&mut self) -> Result<i8, Error> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn get_bool(&mut self) -> Result<bool, Error> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::Parse),
        }
    }

    pub fn get_u16(&mut self) -> Result<u16, Error> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, Error> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_uint_packed(&mut self) -> Result<u32, Error> {
        let mut value: u32 = 0;
        for shift in (0..32).step_by(7) {
            let byte = self.get_u8()?;
            let bits = (byte & 0x7f) as u32;
            value |= bits.checked_shl(shift).ok_or(Error::Parse)?;
            if shift == 28 && bits > 0x0f {
                return Err(Error::Parse);
            }
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::Parse)
    }

    /// NUL-terminated UTF-8; the terminator is consumed but not returned.
    pub fn get_utf8(&mut self) -> Result<&'a str, Error> {
        let rest = &self.buf[self.pos..];
        let nul = rest.iter().position(|&b| b == 0).ok_or(Error::Parse)?;
        let bytes = self.take(nul + 1)?;
        core::str::from_utf8(&bytes[..nul]).map_err(|_| Error::Parse)
    }

    pub fn get_eui64(&mut self) -> Result<&'a [u8; 8], Error> {
        let bytes = self.take(8)?;
        Ok(bytes.try_into().map_err(|_| Error::Parse)?)
    }

    pub fn get_ipv6(&mut self) -> Result<&'a [u8; 16], Error> {
        let bytes = self.take(16)?;
        Ok(bytes.try_into().map_err(|_| Error::Parse)?)
    }

    /// Data with a u16 length prefix.
    pub fn get_data(&mut self) -> Result<&'a [u8], Error> {
        let len = self.get_u16()? as usize;
        self.take(len)
    }

    /// The rest of the buffer as trailing data.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Opens an anonymous struct, returning an unpacker over the group.
    pub fn get_struct(&mut self) -> Result<Unpacker<'a>, Error> {
        Ok(Unpacker::new(self.get_data()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let mut buf = [0u8; 64];
        let mut packer = Packer::new(&mut buf);
        packer.put_u8(0x12).unwrap();
        packer.put_i8(-5).unwrap();
        packer.put_bool(true).unwrap();
        packer.put_u16(0xbeef).unwrap();
        packer.put_u32(0xdead_beef).unwrap();

        let mut unpacker = Unpacker::new(packer.as_slice());
        assert_eq!(unpacker.get_u8().unwrap(), 0x12);
        assert_eq!(unpacker.get_i8().unwrap(), -5);
        assert!(unpacker.get_bool().unwrap());
        assert_eq!(unpacker.get_u16().unwrap(), 0xbeef);
        assert_eq!(unpacker.get_u32().unwrap(), 0xdead_beef);
        assert!(unpacker.is_empty());
    }

    #[test]
    fn test_uint_packed_encoding() {
        let mut buf = [0u8; 16];
        let mut packer = Packer::new(&mut buf);
        packer.put_uint_packed(0).unwrap();
        packer.put_uint_packed(0x7f).unwrap();
        packer.put_uint_packed(0x80).unwrap();
        packer.put_uint_packed(0x3fff).unwrap();
        packer.put_uint_packed(0x4000).unwrap();

        assert_eq!(
            packer.as_slice(),
            [0x00, 0x7f, 0x80, 0x01, 0xff, 0x7f, 0x80, 0x80, 0x01]
        );

        let mut unpacker = Unpacker::new(packer.as_slice());
        for expected in [0, 0x7f, 0x80, 0x3fff, 0x4000] {
            assert_eq!(unpacker.get_uint_packed().unwrap(), expected);
        }
    }

    #[test]
    fn test_uint_packed_limits() {
        let mut buf = [0u8; 8];
        let mut packer = Packer::new(&mut buf);
        packer.put_uint_packed(u32::MAX).unwrap();

        let mut unpacker = Unpacker::new(packer.as_slice());
        assert_eq!(unpacker.get_uint_packed().unwrap(), u32::MAX);

        // Sixth continuation byte overflows 32 bits.
        let mut unpacker = Unpacker::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]);
        assert_eq!(unpacker.get_uint_packed(), Err(Error::Parse));
    }

    #[test]
    fn test_utf8_and_data_borrowing() {
        let mut buf = [0u8; 64];
        let mut packer = Packer::new(&mut buf);
        packer.put_utf8("OPENTHREAD/1.0").unwrap();
        packer.put_data(&[1, 2, 3]).unwrap();
        packer.put_data_raw(&[9, 8, 7, 6]).unwrap();

        let mut unpacker = Unpacker::new(packer.as_slice());
        assert_eq!(unpacker.get_utf8().unwrap(), "OPENTHREAD/1.0");
        assert_eq!(unpacker.get_data().unwrap(), [1, 2, 3]);
        assert_eq!(unpacker.take_rest(), [9, 8, 7, 6]);
        assert!(unpacker.is_empty());
    }

    #[test]
    fn test_addresses() {
        let eui64 = [1, 2, 3, 4, 5, 6, 7, 8];
        let addr = [0xfe; 16];

        let mut buf = [0u8; 32];
        let mut packer = Packer::new(&mut buf);
        packer.put_eui64(&eui64).unwrap();
        packer.put_ipv6(&addr).unwrap();

        let mut unpacker = Unpacker::new(packer.as_slice());
        assert_eq!(unpacker.get_eui64().unwrap(), &eui64);
        assert_eq!(unpacker.get_ipv6().unwrap(), &addr);
    }

    #[test]
    fn test_struct_round_trip() {
        let mut buf = [0u8; 64];
        let mut packer = Packer::new(&mut buf);
        packer
            .put_struct(|p| {
                p.put_u16(0x1234)?;
                p.put_u8(7)
            })
            .unwrap();
        packer.put_u8(0xee).unwrap();

        let mut unpacker = Unpacker::new(packer.as_slice());
        let mut group = unpacker.get_struct().unwrap();
        assert_eq!(group.get_u16().unwrap(), 0x1234);
        assert_eq!(group.get_u8().unwrap(), 7);
        assert!(group.is_empty());
        // The outer stream continues after the group.
        assert_eq!(unpacker.get_u8().unwrap(), 0xee);
    }

    #[test]
    fn test_truncation_is_parse_error() {
        let mut unpacker = Unpacker::new(&[0x01]);
        assert_eq!(unpacker.get_u16(), Err(Error::Parse));

        let mut unpacker = Unpacker::new(&[0x05, 0x00, 0xaa]);
        assert_eq!(unpacker.get_data(), Err(Error::Parse));

        let mut unpacker = Unpacker::new(&[b'h', b'i']);
        assert_eq!(unpacker.get_utf8(), Err(Error::Parse));

        let mut unpacker = Unpacker::new(&[0x80, 0x80]);
        assert_eq!(unpacker.get_uint_packed(), Err(Error::Parse));
    }

    #[test]
    fn test_bool_rejects_junk() {
        let mut unpacker = Unpacker::new(&[0x02]);
        assert_eq!(unpacker.get_bool(), Err(Error::Parse));
    }

    #[test]
    fn test_packer_overflow() {
        let mut buf = [0u8; 4];
        let mut packer = Packer::new(&mut buf);
        packer.put_u32(1).unwrap();
        assert_eq!(packer.put_u8(2), Err(Error::NoBufs));
    }
}
