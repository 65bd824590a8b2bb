use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::core::error::GtmError;
use crate::core::gxid::Gxid;

/// Upper bound on a single message payload. Anything larger is a framing
/// error, not a legitimate request.
const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Request tags (client, proxy, or primary-to-standby mirror).
///
/// The numeric values are part of the wire contract and must not change
/// when interoperating with existing peers.
pub mod request {
    /// Optional first message on a connection, declaring the peer kind.
    pub const MSG_CLIENT_HELLO: u8 = 0x01;

    pub const TXN_BEGIN: u8 = 0x10;
    pub const TXN_BEGIN_GETGXID: u8 = 0x11;
    pub const TXN_BEGIN_GETGXID_AUTOVACUUM: u8 = 0x12;
    pub const TXN_BEGIN_GETGXID_MULTI: u8 = 0x13;
    pub const TXN_PREPARE: u8 = 0x14;
    pub const TXN_START_PREPARED: u8 = 0x15;
    pub const TXN_COMMIT: u8 = 0x16;
    pub const TXN_COMMIT_PREPARED: u8 = 0x17;
    pub const TXN_ROLLBACK: u8 = 0x18;
    pub const TXN_COMMIT_MULTI: u8 = 0x19;
    pub const TXN_ROLLBACK_MULTI: u8 = 0x1a;
    pub const TXN_GET_GID_DATA: u8 = 0x1b;
    pub const TXN_GET_GXID: u8 = 0x1c;
    pub const TXN_GXID_LIST: u8 = 0x1d;
    pub const TXN_GET_NEXT_GXID: u8 = 0x1e;
    pub const REPORT_XMIN: u8 = 0x1f;
    pub const MSG_BACKEND_DISCONNECT: u8 = 0x20;

    // Mirror calls replayed on the standby. Same payloads as the primary
    // equivalents, with an explicit client id and a pre-assigned GXID.
    pub const MSG_BKUP_TXN_BEGIN: u8 = 0x30;
    pub const MSG_BKUP_TXN_BEGIN_GETGXID: u8 = 0x31;
    pub const MSG_BKUP_TXN_BEGIN_GETGXID_AUTOVACUUM: u8 = 0x32;
    pub const MSG_BKUP_TXN_BEGIN_GETGXID_MULTI: u8 = 0x33;
    pub const MSG_BKUP_TXN_PREPARE: u8 = 0x34;
    pub const MSG_BKUP_TXN_START_PREPARED: u8 = 0x35;
    pub const MSG_BKUP_TXN_COMMIT: u8 = 0x36;
    pub const MSG_BKUP_TXN_COMMIT_PREPARED: u8 = 0x37;
    pub const MSG_BKUP_TXN_ROLLBACK: u8 = 0x38;
    pub const MSG_BKUP_TXN_COMMIT_MULTI: u8 = 0x39;
    pub const MSG_BKUP_TXN_ROLLBACK_MULTI: u8 = 0x3a;
    pub const MSG_BKUP_BACKEND_DISCONNECT: u8 = 0x3b;

    /// Explicit acknowledgement request used for synchronous mirroring.
    pub const MSG_SYNC_STANDBY: u8 = 0x3f;
}

/// Response tags. Each successful reply mirrors its request tag with the
/// high bit set; failures use `ERROR`.
pub mod result {
    pub const TXN_BEGIN_RESULT: u8 = 0x90;
    pub const TXN_BEGIN_GETGXID_RESULT: u8 = 0x91;
    pub const TXN_BEGIN_GETGXID_AUTOVACUUM_RESULT: u8 = 0x92;
    pub const TXN_BEGIN_GETGXID_MULTI_RESULT: u8 = 0x93;
    pub const TXN_PREPARE_RESULT: u8 = 0x94;
    pub const TXN_START_PREPARED_RESULT: u8 = 0x95;
    pub const TXN_COMMIT_RESULT: u8 = 0x96;
    pub const TXN_COMMIT_PREPARED_RESULT: u8 = 0x97;
    pub const TXN_ROLLBACK_RESULT: u8 = 0x98;
    pub const TXN_COMMIT_MULTI_RESULT: u8 = 0x99;
    pub const TXN_ROLLBACK_MULTI_RESULT: u8 = 0x9a;
    pub const TXN_GET_GID_DATA_RESULT: u8 = 0x9b;
    pub const TXN_GET_GXID_RESULT: u8 = 0x9c;
    pub const TXN_GXID_LIST_RESULT: u8 = 0x9d;
    pub const TXN_GET_NEXT_GXID_RESULT: u8 = 0x9e;
    pub const REPORT_XMIN_RESULT: u8 = 0x9f;
    pub const SYNC_STANDBY_RESULT: u8 = 0xbf;

    /// Error reply: `message:string`.
    pub const ERROR: u8 = 0xff;
}

/// Peer kinds announced in `MSG_CLIENT_HELLO`.
pub mod peer {
    pub const DIRECT: u8 = 0;
    pub const PROXY: u8 = 1;
    pub const GTM: u8 = 2;
}

/// Outgoing message builder.
///
/// Wire format: `tag:u8`, `len:u32` (payload only), payload. Multi-byte
/// integers are network byte order; strings carry an explicit `u32` length
/// followed by the bytes, with no terminator.
pub struct Message {
    buf: BytesMut,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Write the tag and reserve space for the length.
    pub fn start(&mut self, tag: u8) -> usize {
        self.buf.put_u8(tag);
        let len_pos = self.buf.len();
        self.buf.put_u32(0); // Placeholder for length
        len_pos
    }

    /// Patch the length field once the payload is complete.
    pub fn finish(&mut self, len_pos: usize) {
        let payload_len = self.buf.len() - len_pos - 4;
        let len_bytes = (payload_len as u32).to_be_bytes();
        self.buf[len_pos..len_pos + 4].copy_from_slice(&len_bytes);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_gxid(&mut self, value: Gxid) {
        self.buf.put_u32(value);
    }

    pub fn put_string(&mut self, value: &str) {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
    }

    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Send the message to a writer.
    pub async fn send<W: AsyncWriteExt + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Read one framed message: `(tag, payload)`.
pub async fn read_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<(u8, Vec<u8>), GtmError> {
    let tag = reader.read_u8().await?;
    let len = reader.read_u32().await? as usize;

    if len > MAX_PAYLOAD_LEN {
        return Err(GtmError::Protocol(format!(
            "message payload too large ({len} bytes)"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok((tag, payload))
}

/// Cursor over a received payload.
pub struct Payload<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Payload<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], GtmError> {
        if self.pos + count > self.data.len() {
            return Err(GtmError::Protocol(format!(
                "message truncated: wanted {count} bytes at offset {}",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, GtmError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, GtmError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn get_i32(&mut self) -> Result<i32, GtmError> {
        let raw = self.take(4)?;
        Ok(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, GtmError> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn get_gxid(&mut self) -> Result<Gxid, GtmError> {
        self.get_u32()
    }

    /// Read a length-prefixed string, refusing anything above `max_len`.
    pub fn get_string(&mut self, max_len: usize) -> Result<String, GtmError> {
        let len = self.get_u32()? as usize;
        if len > max_len {
            return Err(GtmError::Protocol(format!(
                "string operand too long ({len} > {max_len})"
            )));
        }
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| GtmError::Protocol("string operand is not valid UTF-8".to_string()))
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&'a [u8], GtmError> {
        self.take(count)
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Assert the payload is fully consumed.
    pub fn expect_end(&self) -> Result<(), GtmError> {
        if self.remaining() != 0 {
            return Err(GtmError::Protocol(format!(
                "{} trailing bytes in message",
                self.remaining()
            )));
        }
        Ok(())
    }
}
