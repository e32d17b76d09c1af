/// NBD transmission-phase protocol constants.
///
/// Wire format reference: <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>
/// and `linux/nbd.h`. Only the old-style transmission phase is relevant here:
/// the kernel performs no negotiation on the ioctl attach path.

/// Transmission request magic
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
/// Simple reply magic
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;

// Command types (16-bit, low half of the 32-bit request type word)
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISC: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;

// Command flags (16-bit, high half of the 32-bit request type word)
pub const NBD_CMD_FLAG_FUA: u16 = 0x0001;

// Device flags accepted by the NBD_SET_FLAGS ioctl
pub const NBD_FLAG_SEND_FLUSH: u32 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u32 = 1 << 3;
pub const NBD_FLAG_SEND_TRIM: u32 = 1 << 5;

/// Request header size on the wire (magic + type + handle + offset + length)
pub const REQUEST_LEN: usize = 28;
/// Reply header size on the wire (magic + error + handle)
pub const REPLY_LEN: usize = 16;

/// Maximum transfer per command (1 MiB)
pub const MAX_IO_SIZE: u32 = 1024 * 1024;
