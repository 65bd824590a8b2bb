use tokio::io::BufStream;
use tokio::net::TcpStream;

use crate::core::error::GtmError;
use crate::core::gxid::Gxid;
use crate::core::limits::MIRROR_MAX_RETRIES;
use crate::network::protocol::{Message, read_message, request, result};

/// One transaction of a batched bkup-begin mirror call.
#[derive(Debug, Clone)]
pub struct BkupBeginItem {
    pub gxid: Gxid,
    pub isolation: u32,
    pub read_only: bool,
    pub session_id: String,
    pub client_id: u64,
    pub proxy_conn_id: i32,
}

/// Connection to the standby peer.
///
/// Mirror calls are fire-and-forget; only the explicit sync request expects
/// an acknowledgement. A transport error drops the connection and the next
/// attempt reconnects; after `MIRROR_MAX_RETRIES` failed attempts the
/// standby is reported lost and the primary keeps serving.
pub struct MirrorClient {
    addr: String,
    stream: Option<BufStream<TcpStream>>,
}

impl MirrorClient {
    #[must_use]
    pub const fn new(addr: String) -> Self {
        Self { addr, stream: None }
    }

    async fn ensure_connected(&mut self) -> std::io::Result<&mut BufStream<TcpStream>> {
        match self.stream {
            Some(ref mut stream) => Ok(stream),
            None => {
                let stream = TcpStream::connect(&self.addr).await?;
                println!("→ Connected to standby at {}", self.addr);
                Ok(self.stream.insert(BufStream::new(stream)))
            }
        }
    }

    /// Ship one mirror call, retrying with reconnect on transport errors.
    pub async fn send(&mut self, msg: &Message) -> Result<(), GtmError> {
        for attempt in 1..=MIRROR_MAX_RETRIES {
            let outcome = match self.ensure_connected().await {
                Ok(stream) => msg.send(stream).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    eprintln!(
                        "✗ Mirror call to {} failed (attempt {attempt}/{MIRROR_MAX_RETRIES}): {e}",
                        self.addr
                    );
                    self.stream = None;
                }
            }
        }
        Err(GtmError::StandbyLost(MIRROR_MAX_RETRIES))
    }

    /// Wait for the standby to acknowledge everything sent so far.
    pub async fn sync(&mut self) -> Result<(), GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::MSG_SYNC_STANDBY);
        msg.finish(len_pos);
        self.send(&msg).await?;

        let stream = self
            .stream
            .as_mut()
            .ok_or(GtmError::StandbyLost(MIRROR_MAX_RETRIES))?;
        let (tag, _payload) = read_message(stream).await?;
        if tag != result::SYNC_STANDBY_RESULT {
            return Err(GtmError::Protocol(format!(
                "unexpected standby sync reply tag {tag:#04x}"
            )));
        }
        Ok(())
    }
}

/// `MSG_BKUP_TXN_BEGIN`: replay a begin without a GXID.
#[must_use]
pub fn bkup_begin(
    isolation: u32,
    read_only: bool,
    session_id: &str,
    client_id: u64,
    timestamp: u64,
) -> Message {
    let mut msg = Message::new();
    let len_pos = msg.start(request::MSG_BKUP_TXN_BEGIN);
    msg.put_u32(isolation);
    msg.put_u8(u8::from(read_only));
    msg.put_string(session_id);
    msg.put_u64(client_id);
    msg.put_u64(timestamp);
    msg.finish(len_pos);
    msg
}

/// `MSG_BKUP_TXN_BEGIN_GETGXID`: replay a begin with its assigned GXID.
#[must_use]
pub fn bkup_begin_getgxid(
    gxid: Gxid,
    isolation: u32,
    read_only: bool,
    session_id: &str,
    client_id: u64,
    timestamp: u64,
) -> Message {
    let mut msg = Message::new();
    let len_pos = msg.start(request::MSG_BKUP_TXN_BEGIN_GETGXID);
    msg.put_gxid(gxid);
    msg.put_u32(isolation);
    msg.put_u8(u8::from(read_only));
    msg.put_string(session_id);
    msg.put_u64(client_id);
    msg.put_u64(timestamp);
    msg.finish(len_pos);
    msg
}

/// `MSG_BKUP_TXN_BEGIN_GETGXID_AUTOVACUUM`.
#[must_use]
pub fn bkup_begin_getgxid_autovacuum(gxid: Gxid, isolation: u32, client_id: u64) -> Message {
    let mut msg = Message::new();
    let len_pos = msg.start(request::MSG_BKUP_TXN_BEGIN_GETGXID_AUTOVACUUM);
    msg.put_gxid(gxid);
    msg.put_u32(isolation);
    msg.put_u64(client_id);
    msg.finish(len_pos);
    msg
}

/// `MSG_BKUP_TXN_BEGIN_GETGXID_MULTI`.
#[must_use]
pub fn bkup_begin_getgxid_multi(items: &[BkupBeginItem]) -> Message {
    let mut msg = Message::new();
    let len_pos = msg.start(request::MSG_BKUP_TXN_BEGIN_GETGXID_MULTI);
    msg.put_u32(items.len() as u32);
    for item in items {
        msg.put_gxid(item.gxid);
        msg.put_u32(item.isolation);
        msg.put_u8(u8::from(item.read_only));
        msg.put_string(&item.session_id);
        msg.put_u64(item.client_id);
        msg.put_i32(item.proxy_conn_id);
    }
    msg.finish(len_pos);
    msg
}

/// `MSG_BKUP_TXN_PREPARE`.
#[must_use]
pub fn bkup_prepare(gxid: Gxid) -> Message {
    let mut msg = Message::new();
    let len_pos = msg.start(request::MSG_BKUP_TXN_PREPARE);
    msg.put_gxid(gxid);
    msg.finish(len_pos);
    msg
}

/// `MSG_BKUP_TXN_START_PREPARED`.
#[must_use]
pub fn bkup_start_prepared(gxid: Gxid, gid: &str, node_string: &str) -> Message {
    let mut msg = Message::new();
    let len_pos = msg.start(request::MSG_BKUP_TXN_START_PREPARED);
    msg.put_gxid(gxid);
    msg.put_string(gid);
    msg.put_string(node_string);
    msg.finish(len_pos);
    msg
}

/// `MSG_BKUP_TXN_COMMIT`.
#[must_use]
pub fn bkup_commit(gxid: Gxid) -> Message {
    let mut msg = Message::new();
    let len_pos = msg.start(request::MSG_BKUP_TXN_COMMIT);
    msg.put_gxid(gxid);
    msg.finish(len_pos);
    msg
}

/// `MSG_BKUP_TXN_COMMIT_PREPARED`.
#[must_use]
pub fn bkup_commit_prepared(prepared_gxid: Gxid, commit_gxid: Gxid) -> Message {
    let mut msg = Message::new();
    let len_pos = msg.start(request::MSG_BKUP_TXN_COMMIT_PREPARED);
    msg.put_gxid(prepared_gxid);
    msg.put_gxid(commit_gxid);
    msg.finish(len_pos);
    msg
}

/// `MSG_BKUP_TXN_ROLLBACK`.
#[must_use]
pub fn bkup_rollback(gxid: Gxid) -> Message {
    let mut msg = Message::new();
    let len_pos = msg.start(request::MSG_BKUP_TXN_ROLLBACK);
    msg.put_gxid(gxid);
    msg.finish(len_pos);
    msg
}

fn bkup_gxid_batch(tag: u8, gxids: &[Gxid]) -> Message {
    let mut msg = Message::new();
    let len_pos = msg.start(tag);
    msg.put_u32(gxids.len() as u32);
    for &gxid in gxids {
        msg.put_gxid(gxid);
    }
    msg.finish(len_pos);
    msg
}

/// `MSG_BKUP_TXN_COMMIT_MULTI`.
#[must_use]
pub fn bkup_commit_multi(gxids: &[Gxid]) -> Message {
    bkup_gxid_batch(request::MSG_BKUP_TXN_COMMIT_MULTI, gxids)
}

/// `MSG_BKUP_TXN_ROLLBACK_MULTI`.
#[must_use]
pub fn bkup_rollback_multi(gxids: &[Gxid]) -> Message {
    bkup_gxid_batch(request::MSG_BKUP_TXN_ROLLBACK_MULTI, gxids)
}

/// `MSG_BKUP_BACKEND_DISCONNECT`.
#[must_use]
pub fn bkup_backend_disconnect(client_id: u64, proxy_client_id: i32) -> Message {
    let mut msg = Message::new();
    let len_pos = msg.start(request::MSG_BKUP_BACKEND_DISCONNECT);
    msg.put_u64(client_id);
    msg.put_i32(proxy_client_id);
    msg.finish(len_pos);
    msg
}
