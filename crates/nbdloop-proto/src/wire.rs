//! Transmission-phase header codecs.
//!
//! Requests arrive as a 28-byte header: 4-byte magic, 4-byte type word
//! (16-bit flags in the high half, 16-bit opcode in the low half), 8 opaque
//! handle bytes, 8-byte offset, 4-byte length, all big-endian. Replies are
//! 16 bytes: magic, errno, and the handle echoed verbatim.

use crate::constants::{NBD_CMD_FLAG_FUA, NBD_REPLY_MAGIC, REPLY_LEN, REQUEST_LEN};

/// Decoded transmission request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub magic: u32,
    /// Command flags (high 16 bits of the wire type word).
    pub flags: u16,
    /// Command opcode (low 16 bits of the wire type word).
    pub cmd_type: u16,
    /// Opaque correlation cookie chosen by the kernel.
    pub handle: [u8; 8],
    pub offset: u64,
    pub length: u32,
}

impl RequestHeader {
    /// Decode a raw header exactly as received from the socket.
    pub fn decode(raw: &[u8; REQUEST_LEN]) -> Self {
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&raw[8..16]);
        Self {
            magic: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            flags: u16::from_be_bytes([raw[4], raw[5]]),
            cmd_type: u16::from_be_bytes([raw[6], raw[7]]),
            handle,
            offset: u64::from_be_bytes([
                raw[16], raw[17], raw[18], raw[19], raw[20], raw[21], raw[22], raw[23],
            ]),
            length: u32::from_be_bytes([raw[24], raw[25], raw[26], raw[27]]),
        }
    }

    /// Whether the forced-unit-access flag is set.
    pub fn fua(&self) -> bool {
        self.flags & NBD_CMD_FLAG_FUA != 0
    }

    /// Encode back to wire form. Used by clients and test harnesses.
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut raw = [0u8; REQUEST_LEN];
        raw[..4].copy_from_slice(&self.magic.to_be_bytes());
        raw[4..6].copy_from_slice(&self.flags.to_be_bytes());
        raw[6..8].copy_from_slice(&self.cmd_type.to_be_bytes());
        raw[8..16].copy_from_slice(&self.handle);
        raw[16..24].copy_from_slice(&self.offset.to_be_bytes());
        raw[24..28].copy_from_slice(&self.length.to_be_bytes());
        raw
    }
}

/// Decoded simple reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub magic: u32,
    /// Errno of the completed command, 0 on success.
    pub error: u32,
    /// Handle echoed from the originating request.
    pub handle: [u8; 8],
}

impl ReplyHeader {
    pub fn new(error: u32, handle: [u8; 8]) -> Self {
        Self {
            magic: NBD_REPLY_MAGIC,
            error,
            handle,
        }
    }

    pub fn decode(raw: &[u8; REPLY_LEN]) -> Self {
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&raw[8..16]);
        Self {
            magic: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            error: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            handle,
        }
    }

    pub fn encode(&self) -> [u8; REPLY_LEN] {
        let mut raw = [0u8; REPLY_LEN];
        raw[..4].copy_from_slice(&self.magic.to_be_bytes());
        raw[4..8].copy_from_slice(&self.error.to_be_bytes());
        raw[8..16].copy_from_slice(&self.handle);
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{NBD_CMD_WRITE, NBD_REQUEST_MAGIC};

    #[test]
    fn test_request_round_trip() {
        let hdr = RequestHeader {
            magic: NBD_REQUEST_MAGIC,
            flags: NBD_CMD_FLAG_FUA,
            cmd_type: NBD_CMD_WRITE,
            handle: [1, 2, 3, 4, 5, 6, 7, 8],
            offset: 0x1122_3344_5566_7788,
            length: 4096,
        };
        let raw = hdr.encode();
        assert_eq!(RequestHeader::decode(&raw), hdr);
    }

    #[test]
    fn test_request_wire_layout_is_big_endian() {
        let hdr = RequestHeader {
            magic: NBD_REQUEST_MAGIC,
            flags: 0,
            cmd_type: NBD_CMD_WRITE,
            handle: [0xAA; 8],
            offset: 0x0102_0304_0506_0708,
            length: 0x0A0B_0C0D,
        };
        let raw = hdr.encode();
        assert_eq!(&raw[..4], &[0x25, 0x60, 0x95, 0x13]);
        assert_eq!(&raw[4..8], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&raw[16..24], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&raw[24..28], &[0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[test]
    fn test_fua_lives_in_the_high_half_of_the_type_word() {
        let hdr = RequestHeader {
            magic: NBD_REQUEST_MAGIC,
            flags: NBD_CMD_FLAG_FUA,
            cmd_type: NBD_CMD_WRITE,
            handle: [0; 8],
            offset: 0,
            length: 512,
        };
        let raw = hdr.encode();
        // The 32-bit type word is flags << 16 | opcode.
        let type_word = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        assert_eq!(type_word, (1 << 16) | NBD_CMD_WRITE as u32);
        assert!(RequestHeader::decode(&raw).fua());
    }

    #[test]
    fn test_reply_carries_magic_and_handle() {
        let reply = ReplyHeader::new(28, [9, 8, 7, 6, 5, 4, 3, 2]);
        let raw = reply.encode();
        assert_eq!(&raw[..4], &[0x67, 0x44, 0x66, 0x98]);
        assert_eq!(&raw[4..8], &[0, 0, 0, 28]);
        let back = ReplyHeader::decode(&raw);
        assert_eq!(back.handle, [9, 8, 7, 6, 5, 4, 3, 2]);
        assert_eq!(back.error, 28);
    }
}
