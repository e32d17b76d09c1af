//! The per-request command object.
//!
//! A command is the unit of work between receiving a request header from
//! the kernel and finishing the reply transmission. It carries the raw
//! header bytes, the pre-magic'd reply bytes, the decoded request
//! parameters, the optional data buffer, and a cursor over whichever of
//! those the current state streams.

use nbdloop_proto::constants::{
    NBD_CMD_DISC, NBD_CMD_FLUSH, NBD_CMD_READ, NBD_CMD_TRIM, NBD_CMD_WRITE, NBD_REPLY_MAGIC,
    REPLY_LEN, REQUEST_LEN,
};

/// Lifecycle stage of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmdState {
    /// Receiving the 28-byte request header.
    RcvReq,
    /// Receiving the write payload into `data_buf`.
    RcvWriteData,
    /// Handed to the backend, waiting for completion.
    Submitted,
    /// Streaming the 16-byte reply header.
    SendReply,
    /// Streaming the read payload from `data_buf`.
    SendReadData,
}

/// Decoded request operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdOp {
    Read,
    Write,
    Disc,
    Flush,
    Trim,
}

impl CmdOp {
    /// Decode a wire opcode. `None` for anything outside the known range.
    pub fn from_wire(cmd_type: u16) -> Option<CmdOp> {
        match cmd_type {
            NBD_CMD_READ => Some(CmdOp::Read),
            NBD_CMD_WRITE => Some(CmdOp::Write),
            NBD_CMD_DISC => Some(CmdOp::Disc),
            NBD_CMD_FLUSH => Some(CmdOp::Flush),
            NBD_CMD_TRIM => Some(CmdOp::Trim),
            _ => None,
        }
    }
}

pub(crate) struct Cmd {
    pub state: CmdState,
    /// Raw request header, big-endian as received.
    pub raw_req: [u8; REQUEST_LEN],
    /// Reply header; the magic is written once here and never again.
    pub reply: [u8; REPLY_LEN],
    pub op: CmdOp,
    pub fua: bool,
    pub offset: u64,
    pub len: u32,
    /// Payload buffer, owned by the command for its lifetime.
    pub data_buf: Option<Box<[u8]>>,
    /// Streaming cursor over the active buffer of the current state.
    pub pos: usize,
    pub remaining: usize,
    /// Backend errno, 0 = success.
    pub ret_error: i32,
}

impl Cmd {
    pub fn new() -> Cmd {
        let mut reply = [0u8; REPLY_LEN];
        reply[..4].copy_from_slice(&NBD_REPLY_MAGIC.to_be_bytes());
        let mut cmd = Cmd {
            state: CmdState::RcvReq,
            raw_req: [0u8; REQUEST_LEN],
            reply,
            op: CmdOp::Read,
            fua: false,
            offset: 0,
            len: 0,
            data_buf: None,
            pos: 0,
            remaining: 0,
            ret_error: 0,
        };
        cmd.reset();
        cmd
    }

    /// Return to the initial state with the cursor at the start of the
    /// request header. The data buffer must already have been released.
    pub fn reset(&mut self) {
        debug_assert!(self.data_buf.is_none(), "reset with a live data buffer");
        self.state = CmdState::RcvReq;
        self.pos = 0;
        self.remaining = REQUEST_LEN;
        self.data_buf = None;
        self.ret_error = 0;
    }

    /// Stamp the reply (errno + handle echo) and aim the cursor at it.
    pub fn finish_reply(&mut self) {
        let errno = self.ret_error as u32;
        self.reply[4..8].copy_from_slice(&errno.to_be_bytes());
        let handle: [u8; 8] = {
            let mut h = [0u8; 8];
            h.copy_from_slice(&self.raw_req[8..16]);
            h
        };
        self.reply[8..16].copy_from_slice(&handle);
        self.state = CmdState::SendReply;
        self.pos = 0;
        self.remaining = REPLY_LEN;
    }

    /// The unsent span of the buffer the cursor currently streams.
    pub fn cursor(&self) -> &[u8] {
        let (pos, rem) = (self.pos, self.remaining);
        let buf: &[u8] = match self.state {
            CmdState::RcvReq => &self.raw_req,
            CmdState::SendReply => &self.reply,
            CmdState::RcvWriteData | CmdState::SendReadData => self
                .data_buf
                .as_deref()
                .expect("cursor over a missing data buffer"),
            CmdState::Submitted => unreachable!("no cursor while submitted"),
        };
        &buf[pos..pos + rem]
    }

    /// Mutable form of [`Cmd::cursor`], for the receive path.
    pub fn cursor_mut(&mut self) -> &mut [u8] {
        let (pos, rem) = (self.pos, self.remaining);
        let buf: &mut [u8] = match self.state {
            CmdState::RcvReq => &mut self.raw_req,
            CmdState::SendReply => &mut self.reply,
            CmdState::RcvWriteData | CmdState::SendReadData => self
                .data_buf
                .as_deref_mut()
                .expect("cursor over a missing data buffer"),
            CmdState::Submitted => unreachable!("no cursor while submitted"),
        };
        &mut buf[pos..pos + rem]
    }

    /// Consume `n` transferred bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining);
        self.pos += n;
        self.remaining -= n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbdloop_proto::wire::ReplyHeader;

    #[test]
    fn test_new_cmd_awaits_a_full_header() {
        let cmd = Cmd::new();
        assert_eq!(cmd.state, CmdState::RcvReq);
        assert_eq!(cmd.remaining, REQUEST_LEN);
        assert_eq!(cmd.pos, 0);
        assert!(cmd.data_buf.is_none());
        assert_eq!(cmd.ret_error, 0);
    }

    #[test]
    fn test_reply_magic_is_set_at_construction() {
        let cmd = Cmd::new();
        assert_eq!(&cmd.reply[..4], &NBD_REPLY_MAGIC.to_be_bytes());
    }

    #[test]
    fn test_finish_reply_echoes_handle_and_errno() {
        let mut cmd = Cmd::new();
        cmd.raw_req[8..16].copy_from_slice(&[9, 9, 2, 2, 5, 5, 1, 1]);
        cmd.ret_error = 28;
        cmd.finish_reply();

        let reply = ReplyHeader::decode(&cmd.reply);
        assert_eq!(reply.magic, NBD_REPLY_MAGIC);
        assert_eq!(reply.error, 28);
        assert_eq!(reply.handle, [9, 9, 2, 2, 5, 5, 1, 1]);
        assert_eq!(cmd.state, CmdState::SendReply);
        assert_eq!(cmd.remaining, REPLY_LEN);
    }

    #[test]
    fn test_cursor_tracks_partial_progress() {
        let mut cmd = Cmd::new();
        assert_eq!(cmd.cursor().len(), REQUEST_LEN);
        cmd.advance(10);
        assert_eq!(cmd.cursor().len(), REQUEST_LEN - 10);
        cmd.advance(REQUEST_LEN - 10);
        assert_eq!(cmd.remaining, 0);
    }

    #[test]
    fn test_reset_clears_a_finished_command() {
        let mut cmd = Cmd::new();
        cmd.ret_error = 5;
        cmd.finish_reply();
        cmd.advance(REPLY_LEN);
        cmd.reset();
        assert_eq!(cmd.state, CmdState::RcvReq);
        assert_eq!(cmd.remaining, REQUEST_LEN);
        assert_eq!(cmd.ret_error, 0);
    }
}
