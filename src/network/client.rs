use tokio::io::BufStream;
use tokio::net::TcpStream;

use crate::core::error::GtmError;
use crate::core::gxid::Gxid;
use crate::core::limits::MAX_NODESTRING_LEN;
use crate::network::protocol::{Message, Payload, peer, read_message, request, result};
use crate::txn::TxnStatus;
use crate::txn::snapshot::TableSnapshot;

/// One item of a batched begin request.
#[derive(Debug, Clone)]
pub struct BeginItem {
    pub isolation: u32,
    pub read_only: bool,
    pub session_id: String,
    pub proxy_conn_id: i32,
}

/// Typed client for the GTM wire protocol.
///
/// Used by the operator CLI, by the integration tests, and by a standby
/// bootstrapping itself from a running primary. One request is in flight at
/// a time; replies are matched by tag.
pub struct GtmClient {
    stream: BufStream<TcpStream>,
}

impl GtmClient {
    pub async fn connect(addr: &str) -> Result<Self, GtmError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            stream: BufStream::new(stream),
        })
    }

    /// Announce this connection as a proxy. Replies on the connection will
    /// carry the proxy header from here on.
    pub async fn hello_proxy(&mut self, proxy_conn_id: i32) -> Result<(), GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::MSG_CLIENT_HELLO);
        msg.put_u8(peer::PROXY);
        msg.put_i32(proxy_conn_id);
        msg.finish(len_pos);
        msg.send(&mut self.stream).await?;
        Ok(())
    }

    /// Send a request and wait for the matching reply payload.
    async fn roundtrip(&mut self, msg: Message, want: u8) -> Result<Vec<u8>, GtmError> {
        msg.send(&mut self.stream).await?;
        let (tag, payload) = read_message(&mut self.stream).await?;

        if tag == result::ERROR {
            let mut cursor = Payload::new(&payload);
            let message = cursor.get_string(4096)?;
            return Err(GtmError::Remote(message));
        }
        if tag != want {
            return Err(GtmError::Protocol(format!(
                "unexpected reply tag {tag:#04x}, wanted {want:#04x}"
            )));
        }
        Ok(payload)
    }

    fn begin_message(tag: u8, isolation: u32, read_only: bool, session_id: &str) -> Message {
        let mut msg = Message::new();
        let len_pos = msg.start(tag);
        msg.put_u32(isolation);
        msg.put_u8(u8::from(read_only));
        msg.put_string(session_id);
        msg.finish(len_pos);
        msg
    }

    /// `TXN_BEGIN`: start (or rejoin) a transaction, no GXID yet.
    pub async fn begin(
        &mut self,
        isolation: u32,
        read_only: bool,
        session_id: &str,
    ) -> Result<(u32, u64), GtmError> {
        let msg = Self::begin_message(request::TXN_BEGIN, isolation, read_only, session_id);
        let payload = self.roundtrip(msg, result::TXN_BEGIN_RESULT).await?;
        let mut cursor = Payload::new(&payload);
        let handle = cursor.get_u32()?;
        let timestamp = cursor.get_u64()?;
        Ok((handle, timestamp))
    }

    /// `TXN_BEGIN_GETGXID`: start a transaction and mint its GXID.
    pub async fn begin_getgxid(
        &mut self,
        isolation: u32,
        read_only: bool,
        session_id: &str,
    ) -> Result<(Gxid, u64), GtmError> {
        let msg =
            Self::begin_message(request::TXN_BEGIN_GETGXID, isolation, read_only, session_id);
        let payload = self.roundtrip(msg, result::TXN_BEGIN_GETGXID_RESULT).await?;
        let mut cursor = Payload::new(&payload);
        let gxid = cursor.get_gxid()?;
        let timestamp = cursor.get_u64()?;
        Ok((gxid, timestamp))
    }

    /// `TXN_BEGIN_GETGXID_AUTOVACUUM`: begin for a lazy vacuum worker.
    pub async fn begin_getgxid_autovacuum(
        &mut self,
        isolation: u32,
        read_only: bool,
    ) -> Result<Gxid, GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::TXN_BEGIN_GETGXID_AUTOVACUUM);
        msg.put_u32(isolation);
        msg.put_u8(u8::from(read_only));
        msg.finish(len_pos);

        let payload = self
            .roundtrip(msg, result::TXN_BEGIN_GETGXID_AUTOVACUUM_RESULT)
            .await?;
        Payload::new(&payload).get_gxid()
    }

    /// `TXN_BEGIN_GETGXID_MULTI`: proxy-grouped begins.
    pub async fn begin_getgxid_multi(
        &mut self,
        items: &[BeginItem],
    ) -> Result<(Vec<Gxid>, u64), GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::TXN_BEGIN_GETGXID_MULTI);
        msg.put_u32(items.len() as u32);
        for item in items {
            msg.put_u32(item.isolation);
            msg.put_u8(u8::from(item.read_only));
            msg.put_string(&item.session_id);
            msg.put_i32(item.proxy_conn_id);
        }
        msg.finish(len_pos);

        let payload = self
            .roundtrip(msg, result::TXN_BEGIN_GETGXID_MULTI_RESULT)
            .await?;
        let mut cursor = Payload::new(&payload);
        let count = cursor.get_u32()? as usize;
        let mut gxids = Vec::with_capacity(count);
        for _ in 0..count {
            gxids.push(cursor.get_gxid()?);
        }
        let timestamp = cursor.get_u64()?;
        Ok((gxids, timestamp))
    }

    /// `TXN_PREPARE`: phase-one prepare of a transaction in 2PC.
    pub async fn prepare(&mut self, gxid: Gxid) -> Result<Gxid, GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::TXN_PREPARE);
        msg.put_gxid(gxid);
        msg.finish(len_pos);

        let payload = self.roundtrip(msg, result::TXN_PREPARE_RESULT).await?;
        Payload::new(&payload).get_gxid()
    }

    /// `TXN_START_PREPARED`: register a GID and node list for 2PC.
    pub async fn start_prepared(
        &mut self,
        gxid: Gxid,
        gid: &str,
        node_string: &str,
    ) -> Result<Gxid, GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::TXN_START_PREPARED);
        msg.put_gxid(gxid);
        msg.put_string(gid);
        msg.put_string(node_string);
        msg.finish(len_pos);

        let payload = self
            .roundtrip(msg, result::TXN_START_PREPARED_RESULT)
            .await?;
        Payload::new(&payload).get_gxid()
    }

    /// `TXN_COMMIT`: commit, optionally waiting on other GXIDs.
    pub async fn commit(
        &mut self,
        gxid: Gxid,
        waited_xids: &[Gxid],
    ) -> Result<(Gxid, TxnStatus), GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::TXN_COMMIT);
        msg.put_gxid(gxid);
        msg.put_u32(waited_xids.len() as u32);
        for &waited in waited_xids {
            msg.put_gxid(waited);
        }
        msg.finish(len_pos);

        let payload = self.roundtrip(msg, result::TXN_COMMIT_RESULT).await?;
        let mut cursor = Payload::new(&payload);
        let echoed = cursor.get_gxid()?;
        let status = TxnStatus::from_u32(cursor.get_u32()?);
        Ok((echoed, status))
    }

    /// `TXN_COMMIT_PREPARED`: commit the prepare-time and commit-time GXIDs
    /// together.
    pub async fn commit_prepared(
        &mut self,
        prepared_gxid: Gxid,
        commit_gxid: Gxid,
        waited_xids: &[Gxid],
    ) -> Result<(Gxid, TxnStatus), GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::TXN_COMMIT_PREPARED);
        msg.put_gxid(prepared_gxid);
        msg.put_gxid(commit_gxid);
        msg.put_u32(waited_xids.len() as u32);
        for &waited in waited_xids {
            msg.put_gxid(waited);
        }
        msg.finish(len_pos);

        let payload = self
            .roundtrip(msg, result::TXN_COMMIT_PREPARED_RESULT)
            .await?;
        let mut cursor = Payload::new(&payload);
        let echoed = cursor.get_gxid()?;
        let status = TxnStatus::from_u32(cursor.get_u32()?);
        Ok((echoed, status))
    }

    /// `TXN_ROLLBACK`.
    pub async fn rollback(&mut self, gxid: Gxid) -> Result<(Gxid, TxnStatus), GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::TXN_ROLLBACK);
        msg.put_gxid(gxid);
        msg.finish(len_pos);

        let payload = self.roundtrip(msg, result::TXN_ROLLBACK_RESULT).await?;
        let mut cursor = Payload::new(&payload);
        let echoed = cursor.get_gxid()?;
        let status = TxnStatus::from_u32(cursor.get_u32()?);
        Ok((echoed, status))
    }

    async fn multi(
        &mut self,
        tag: u8,
        want: u8,
        gxids: &[Gxid],
    ) -> Result<Vec<TxnStatus>, GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(tag);
        msg.put_u32(gxids.len() as u32);
        for &gxid in gxids {
            msg.put_gxid(gxid);
        }
        msg.finish(len_pos);

        let payload = self.roundtrip(msg, want).await?;
        let mut cursor = Payload::new(&payload);
        let count = cursor.get_u32()? as usize;
        let mut statuses = Vec::with_capacity(count);
        for _ in 0..count {
            statuses.push(TxnStatus::from_u32(cursor.get_u32()?));
        }
        Ok(statuses)
    }

    /// `TXN_COMMIT_MULTI`.
    pub async fn commit_multi(&mut self, gxids: &[Gxid]) -> Result<Vec<TxnStatus>, GtmError> {
        self.multi(
            request::TXN_COMMIT_MULTI,
            result::TXN_COMMIT_MULTI_RESULT,
            gxids,
        )
        .await
    }

    /// `TXN_ROLLBACK_MULTI`.
    pub async fn rollback_multi(&mut self, gxids: &[Gxid]) -> Result<Vec<TxnStatus>, GtmError> {
        self.multi(
            request::TXN_ROLLBACK_MULTI,
            result::TXN_ROLLBACK_MULTI_RESULT,
            gxids,
        )
        .await
    }

    /// `TXN_GET_GID_DATA`: resolve a GID ahead of COMMIT/ROLLBACK PREPARED.
    /// Returns `(new_gxid, prepared_gxid, node_string)`.
    pub async fn get_gid_data(
        &mut self,
        isolation: u32,
        read_only: bool,
        gid: &str,
    ) -> Result<(Gxid, Gxid, String), GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::TXN_GET_GID_DATA);
        msg.put_u32(isolation);
        msg.put_u8(u8::from(read_only));
        msg.put_string(gid);
        msg.finish(len_pos);

        let payload = self.roundtrip(msg, result::TXN_GET_GID_DATA_RESULT).await?;
        let mut cursor = Payload::new(&payload);
        let new_gxid = cursor.get_gxid()?;
        let prepared_gxid = cursor.get_gxid()?;
        let node_string = cursor.get_string(MAX_NODESTRING_LEN)?;
        Ok((new_gxid, prepared_gxid, node_string))
    }

    /// `TXN_GET_GXID`: GXID of an existing handle, minting one if needed.
    pub async fn get_gxid(&mut self, handle: u32) -> Result<Gxid, GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::TXN_GET_GXID);
        msg.put_u32(handle);
        msg.finish(len_pos);

        let payload = self.roundtrip(msg, result::TXN_GET_GXID_RESULT).await?;
        let mut cursor = Payload::new(&payload);
        let _echoed_handle = cursor.get_u32()?;
        cursor.get_gxid()
    }

    /// `TXN_GXID_LIST`: fetch the serialized transaction table.
    pub async fn gxid_list(&mut self) -> Result<TableSnapshot, GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::TXN_GXID_LIST);
        msg.finish(len_pos);

        let payload = self.roundtrip(msg, result::TXN_GXID_LIST_RESULT).await?;
        let mut cursor = Payload::new(&payload);
        let size = cursor.get_u32()? as usize;
        let blob = cursor.get_bytes(size)?;
        TableSnapshot::decode(blob)
    }

    /// `TXN_GET_NEXT_GXID`: read the counter without advancing it.
    pub async fn get_next_gxid(&mut self) -> Result<Gxid, GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::TXN_GET_NEXT_GXID);
        msg.finish(len_pos);

        let payload = self
            .roundtrip(msg, result::TXN_GET_NEXT_GXID_RESULT)
            .await?;
        Payload::new(&payload).get_gxid()
    }

    /// `REPORT_XMIN`. Returns `(latest_completed, global_xmin, errcode)`.
    pub async fn report_xmin(
        &mut self,
        gxid: Gxid,
        node_type: u32,
        node_name: &str,
    ) -> Result<(Gxid, Gxid, u32), GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::REPORT_XMIN);
        msg.put_gxid(gxid);
        msg.put_u32(node_type);
        msg.put_string(node_name);
        msg.finish(len_pos);

        let payload = self.roundtrip(msg, result::REPORT_XMIN_RESULT).await?;
        let mut cursor = Payload::new(&payload);
        let latest_completed = cursor.get_gxid()?;
        let global_xmin = cursor.get_gxid()?;
        let errcode = cursor.get_u32()?;
        Ok((latest_completed, global_xmin, errcode))
    }

    /// `MSG_BACKEND_DISCONNECT`: reap a proxied backend's transactions.
    /// No reply.
    pub async fn backend_disconnect(
        &mut self,
        client_id: u64,
        proxy_client_id: i32,
    ) -> Result<(), GtmError> {
        let mut msg = Message::new();
        let len_pos = msg.start(request::MSG_BACKEND_DISCONNECT);
        msg.put_u64(client_id);
        msg.put_i32(proxy_client_id);
        msg.finish(len_pos);
        msg.send(&mut self.stream).await?;
        Ok(())
    }
}
