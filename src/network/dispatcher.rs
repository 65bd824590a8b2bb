use tokio::io::AsyncWriteExt;

use crate::core::error::GtmError;
use crate::core::gxid::Gxid;
use crate::core::limits::CLIENT_ID_ANONYMOUS;
use crate::network::protocol::{Message, Payload, request, result};
use crate::network::server::Server;
use crate::standby::mirror;
use crate::txn::TxnStatus;
use crate::txn::lifecycle::BeginRequest;
use crate::txn::slot::IsolationLevel;

/// Largest accepted element count in a batched request.
const MAX_BATCH: usize = 4_096;

/// Per-connection dispatch state.
pub struct SessionContext {
    pub client_id: u64,
    /// Set by `MSG_CLIENT_HELLO`; proxy replies carry the connection-id
    /// header so the proxy can fan responses back to its backends.
    pub is_proxy: bool,
    pub proxy_conn_id: i32,
}

fn now_micros() -> u64 {
    chrono::Utc::now().timestamp_micros() as u64
}

const fn is_bkup(tag: u8) -> bool {
    matches!(
        tag,
        request::MSG_BKUP_TXN_BEGIN
            | request::MSG_BKUP_TXN_BEGIN_GETGXID
            | request::MSG_BKUP_TXN_BEGIN_GETGXID_AUTOVACUUM
            | request::MSG_BKUP_TXN_BEGIN_GETGXID_MULTI
            | request::MSG_BKUP_TXN_PREPARE
            | request::MSG_BKUP_TXN_START_PREPARED
            | request::MSG_BKUP_TXN_COMMIT
            | request::MSG_BKUP_TXN_COMMIT_PREPARED
            | request::MSG_BKUP_TXN_ROLLBACK
            | request::MSG_BKUP_TXN_COMMIT_MULTI
            | request::MSG_BKUP_TXN_ROLLBACK_MULTI
            | request::MSG_BKUP_BACKEND_DISCONNECT
    )
}

/// Tags that complete without any reply.
const fn is_fire_and_forget(tag: u8) -> bool {
    is_bkup(tag) || matches!(tag, request::MSG_BACKEND_DISCONNECT)
}

/// Start a reply message, prefixing the proxy header when the peer is a
/// proxy.
fn reply_message(tag: u8, session: &SessionContext) -> (Message, usize) {
    let mut msg = Message::new();
    let len_pos = msg.start(tag);
    if session.is_proxy {
        msg.put_i32(session.proxy_conn_id);
    }
    (msg, len_pos)
}

async fn send_error<W: AsyncWriteExt + Unpin>(
    session: &SessionContext,
    error: &GtmError,
    writer: &mut W,
) -> Result<(), GtmError> {
    let (mut msg, len_pos) = reply_message(result::ERROR, session);
    msg.put_string(&error.to_string());
    msg.finish(len_pos);
    msg.send(writer).await?;
    Ok(())
}

/// Decode a typed request, run it against the lifecycle engine, mirror the
/// decision, and encode the reply.
///
/// Operation failures become error replies and the connection keeps
/// serving; only transport failures propagate to the caller.
pub async fn dispatch<W: AsyncWriteExt + Unpin>(
    server: &Server,
    session: &mut SessionContext,
    tag: u8,
    payload: &[u8],
    writer: &mut W,
) -> Result<(), GtmError> {
    match handle(server, session, tag, payload, writer).await {
        Ok(()) => Ok(()),
        Err(GtmError::Io(e)) => Err(GtmError::Io(e)),
        Err(e) => {
            if is_fire_and_forget(tag) {
                eprintln!("✗ Mirror/disconnect message {tag:#04x} failed: {e}");
                Ok(())
            } else {
                send_error(session, &e, writer).await
            }
        }
    }
}

async fn handle<W: AsyncWriteExt + Unpin>(
    server: &Server,
    session: &mut SessionContext,
    tag: u8,
    payload: &[u8],
    writer: &mut W,
) -> Result<(), GtmError> {
    if is_bkup(tag) && !server.is_standby() {
        eprintln!("✗ Ignoring mirror message {tag:#04x} on the primary");
        return Ok(());
    }

    let table = server.table();
    let mut cursor = Payload::new(payload);

    match tag {
        request::TXN_BEGIN => {
            let isolation = cursor.get_u32()?;
            let read_only = cursor.get_u8()? != 0;
            let session_id = cursor.get_string(server.max_session_id_len())?;
            cursor.expect_end()?;

            let handle = table.begin(&BeginRequest {
                isolation: IsolationLevel::from_u32(isolation),
                read_only,
                session_id: session_id.clone(),
                client_id: session.client_id,
                proxy_conn_id: -1,
            })?;
            let timestamp = now_micros();

            server
                .mirror_send(
                    mirror::bkup_begin(
                        isolation,
                        read_only,
                        &session_id,
                        session.client_id,
                        timestamp,
                    ),
                    session.is_proxy,
                )
                .await?;

            let (mut msg, len_pos) = reply_message(result::TXN_BEGIN_RESULT, session);
            msg.put_u32(handle as u32);
            msg.put_u64(timestamp);
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::TXN_BEGIN_GETGXID => {
            let isolation = cursor.get_u32()?;
            let read_only = cursor.get_u8()? != 0;
            let session_id = cursor.get_string(server.max_session_id_len())?;
            cursor.expect_end()?;

            let timestamp = now_micros();
            let handle = table.begin(&BeginRequest {
                isolation: IsolationLevel::from_u32(isolation),
                read_only,
                session_id: session_id.clone(),
                client_id: session.client_id,
                proxy_conn_id: -1,
            })?;
            let (gxid, save) = table.assign_gxid(handle)?;
            server.save_control(save);

            server
                .mirror_send(
                    mirror::bkup_begin_getgxid(
                        gxid,
                        isolation,
                        read_only,
                        &session_id,
                        session.client_id,
                        timestamp,
                    ),
                    session.is_proxy,
                )
                .await?;

            let (mut msg, len_pos) = reply_message(result::TXN_BEGIN_GETGXID_RESULT, session);
            msg.put_gxid(gxid);
            msg.put_u64(timestamp);
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::TXN_BEGIN_GETGXID_AUTOVACUUM => {
            let isolation = cursor.get_u32()?;
            let read_only = cursor.get_u8()? != 0;
            cursor.expect_end()?;

            let handle = table.begin(&BeginRequest {
                isolation: IsolationLevel::from_u32(isolation),
                read_only,
                client_id: session.client_id,
                ..BeginRequest::default()
            })?;
            let (gxid, save) = table.assign_gxid(handle)?;
            table.set_do_vacuum(handle)?;
            server.save_control(save);

            server
                .mirror_send(
                    mirror::bkup_begin_getgxid_autovacuum(gxid, isolation, session.client_id),
                    session.is_proxy,
                )
                .await?;

            let (mut msg, len_pos) =
                reply_message(result::TXN_BEGIN_GETGXID_AUTOVACUUM_RESULT, session);
            msg.put_gxid(gxid);
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::TXN_BEGIN_GETGXID_MULTI => {
            let count = cursor.get_u32()? as usize;
            if count == 0 || count > MAX_BATCH {
                return Err(GtmError::Protocol(format!(
                    "bad transaction count in batched begin: {count}"
                )));
            }

            let mut requests = Vec::with_capacity(count);
            let mut raw_isolations = Vec::with_capacity(count);
            for _ in 0..count {
                let isolation = cursor.get_u32()?;
                let read_only = cursor.get_u8()? != 0;
                let session_id = cursor.get_string(server.max_session_id_len())?;
                let proxy_conn_id = cursor.get_i32()?;
                raw_isolations.push(isolation);
                requests.push(BeginRequest {
                    isolation: IsolationLevel::from_u32(isolation),
                    read_only,
                    session_id,
                    client_id: session.client_id,
                    proxy_conn_id,
                });
            }
            cursor.expect_end()?;

            let timestamp = now_micros();
            let handles = table.begin_multi(&requests)?;
            let outcome = table.assign_gxids(&handles)?;
            server.save_control(outcome.save_control);

            let items: Vec<mirror::BkupBeginItem> = requests
                .iter()
                .zip(&outcome.gxids)
                .zip(&raw_isolations)
                .map(|((req, &gxid), &isolation)| mirror::BkupBeginItem {
                    gxid,
                    isolation,
                    read_only: req.read_only,
                    session_id: req.session_id.clone(),
                    client_id: req.client_id,
                    proxy_conn_id: req.proxy_conn_id,
                })
                .collect();
            server
                .mirror_send(mirror::bkup_begin_getgxid_multi(&items), session.is_proxy)
                .await?;

            let (mut msg, len_pos) =
                reply_message(result::TXN_BEGIN_GETGXID_MULTI_RESULT, session);
            msg.put_u32(outcome.gxids.len() as u32);
            for &gxid in &outcome.gxids {
                msg.put_gxid(gxid);
            }
            msg.put_u64(timestamp);
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::TXN_PREPARE => {
            let gxid = cursor.get_gxid()?;
            cursor.expect_end()?;

            let handle = table
                .handle_by_gxid(gxid, true)
                .ok_or(GtmError::UnknownGxid(gxid))?;
            table.prepare(handle)?;

            server
                .mirror_send(mirror::bkup_prepare(gxid), session.is_proxy)
                .await?;

            let (mut msg, len_pos) = reply_message(result::TXN_PREPARE_RESULT, session);
            msg.put_gxid(gxid);
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::TXN_START_PREPARED => {
            let gxid = cursor.get_gxid()?;
            let gid = cursor.get_string(server.max_gid_len())?;
            let node_string = cursor.get_string(server.max_nodestring_len())?;
            cursor.expect_end()?;

            let handle = table
                .handle_by_gxid(gxid, true)
                .ok_or(GtmError::UnknownGxid(gxid))?;
            table.start_prepared(handle, &gid, &node_string)?;

            server
                .mirror_send(
                    mirror::bkup_start_prepared(gxid, &gid, &node_string),
                    session.is_proxy,
                )
                .await?;

            let (mut msg, len_pos) = reply_message(result::TXN_START_PREPARED_RESULT, session);
            msg.put_gxid(gxid);
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::TXN_COMMIT => {
            let gxid = cursor.get_gxid()?;
            let waited = read_waited_xids(&mut cursor)?;
            cursor.expect_end()?;

            let handle = table.handle_by_gxid(gxid, true);
            let status = table.commit(handle, &waited);

            // A delayed commit is mirrored later, when the retry succeeds.
            if status == TxnStatus::Ok {
                server
                    .mirror_send(mirror::bkup_commit(gxid), session.is_proxy)
                    .await?;
            }

            let (mut msg, len_pos) = reply_message(result::TXN_COMMIT_RESULT, session);
            msg.put_gxid(gxid);
            msg.put_u32(status.as_u32());
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::TXN_COMMIT_PREPARED => {
            let prepared_gxid = cursor.get_gxid()?;
            let commit_gxid = cursor.get_gxid()?;
            let waited = read_waited_xids(&mut cursor)?;
            cursor.expect_end()?;

            let handles = [
                table.handle_by_gxid(prepared_gxid, true),
                table.handle_by_gxid(commit_gxid, true),
            ];
            let statuses = table.commit_multi(&handles, &waited);

            // The pair shares one outcome, so testing the first is enough.
            if statuses[0] == TxnStatus::Ok {
                server
                    .mirror_send(
                        mirror::bkup_commit_prepared(prepared_gxid, commit_gxid),
                        session.is_proxy,
                    )
                    .await?;
            }

            let (mut msg, len_pos) = reply_message(result::TXN_COMMIT_PREPARED_RESULT, session);
            msg.put_gxid(prepared_gxid);
            msg.put_u32(statuses[0].as_u32());
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::TXN_ROLLBACK => {
            let gxid = cursor.get_gxid()?;
            cursor.expect_end()?;

            let handle = table.handle_by_gxid(gxid, true);
            let status = table.rollback(handle);

            server
                .mirror_send(mirror::bkup_rollback(gxid), session.is_proxy)
                .await?;

            let (mut msg, len_pos) = reply_message(result::TXN_ROLLBACK_RESULT, session);
            msg.put_gxid(gxid);
            msg.put_u32(status.as_u32());
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::TXN_COMMIT_MULTI | request::TXN_ROLLBACK_MULTI => {
            let count = cursor.get_u32()? as usize;
            if count > MAX_BATCH {
                return Err(GtmError::Protocol(format!(
                    "bad transaction count in batched commit/rollback: {count}"
                )));
            }
            let mut gxids = Vec::with_capacity(count);
            for _ in 0..count {
                gxids.push(cursor.get_gxid()?);
            }
            cursor.expect_end()?;

            let handles: Vec<Option<usize>> = gxids
                .iter()
                .map(|&gxid| table.handle_by_gxid(gxid, true))
                .collect();

            let (statuses, reply_tag, bkup) = if tag == request::TXN_COMMIT_MULTI {
                (
                    table.commit_multi(&handles, &[]),
                    result::TXN_COMMIT_MULTI_RESULT,
                    mirror::bkup_commit_multi(&gxids),
                )
            } else {
                (
                    table.rollback_multi(&handles),
                    result::TXN_ROLLBACK_MULTI_RESULT,
                    mirror::bkup_rollback_multi(&gxids),
                )
            };

            server.mirror_send(bkup, session.is_proxy).await?;

            let (mut msg, len_pos) = reply_message(reply_tag, session);
            msg.put_u32(statuses.len() as u32);
            for status in &statuses {
                msg.put_u32(status.as_u32());
            }
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::TXN_GET_GID_DATA => {
            let isolation = cursor.get_u32()?;
            let read_only = cursor.get_u8()? != 0;
            let gid = cursor.get_string(server.max_gid_len())?;
            cursor.expect_end()?;

            let gid_data = table.get_gid_data(&gid)?;

            // Mint the commit-driver transaction for the caller.
            let handle = table.begin(&BeginRequest {
                isolation: IsolationLevel::from_u32(isolation),
                read_only,
                client_id: session.client_id,
                ..BeginRequest::default()
            })?;
            let (new_gxid, save) = table.assign_gxid(handle)?;
            server.save_control(save);

            // The prepared GXID was mirrored when it started; the fresh one
            // must reach the standby too, as an anonymous transaction, so
            // the eventual COMMIT PREPARED replays cleanly.
            server
                .mirror_send(
                    mirror::bkup_begin_getgxid(
                        new_gxid,
                        isolation,
                        read_only,
                        "",
                        CLIENT_ID_ANONYMOUS,
                        0,
                    ),
                    session.is_proxy,
                )
                .await?;

            let (mut msg, len_pos) = reply_message(result::TXN_GET_GID_DATA_RESULT, session);
            msg.put_gxid(new_gxid);
            msg.put_gxid(gid_data.prepared_gxid);
            msg.put_string(gid_data.node_string.as_deref().unwrap_or(""));
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::TXN_GET_GXID => {
            let handle = cursor.get_u32()? as usize;
            cursor.expect_end()?;

            let (gxid, save) = table.assign_gxid(handle)?;
            server.save_control(save);

            let (mut msg, len_pos) = reply_message(result::TXN_GET_GXID_RESULT, session);
            msg.put_u32(handle as u32);
            msg.put_gxid(gxid);
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::TXN_GXID_LIST => {
            cursor.expect_end()?;

            let blob = table.capture_snapshot()?.encode()?;

            let (mut msg, len_pos) = reply_message(result::TXN_GXID_LIST_RESULT, session);
            msg.put_u32(blob.len() as u32);
            msg.put_bytes(&blob);
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::TXN_GET_NEXT_GXID => {
            cursor.expect_end()?;

            let (mut msg, len_pos) = reply_message(result::TXN_GET_NEXT_GXID_RESULT, session);
            msg.put_gxid(table.read_next_gxid());
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::REPORT_XMIN => {
            let gxid = cursor.get_gxid()?;
            let node_type = cursor.get_u32()?;
            let node_name = cursor.get_string(server.max_nodestring_len())?;
            cursor.expect_end()?;

            let reply = table.report_xmin(node_type, &node_name, gxid);

            let (mut msg, len_pos) = reply_message(result::REPORT_XMIN_RESULT, session);
            msg.put_gxid(reply.latest_completed_gxid);
            msg.put_gxid(reply.global_xmin);
            msg.put_u32(reply.errcode);
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::MSG_BACKEND_DISCONNECT => {
            let client_id = cursor.get_u64()?;
            let proxy_client_id = cursor.get_i32()?;
            cursor.expect_end()?;

            table.reap(client_id, proxy_client_id);
            server
                .mirror_send(
                    mirror::bkup_backend_disconnect(client_id, proxy_client_id),
                    session.is_proxy,
                )
                .await?;
        }

        request::MSG_SYNC_STANDBY => {
            cursor.expect_end()?;

            let (mut msg, len_pos) = reply_message(result::SYNC_STANDBY_RESULT, session);
            msg.finish(len_pos);
            msg.send(writer).await?;
        }

        request::MSG_BKUP_TXN_BEGIN => {
            let isolation = cursor.get_u32()?;
            let read_only = cursor.get_u8()? != 0;
            let session_id = cursor.get_string(server.max_session_id_len())?;
            let client_id = cursor.get_u64()?;
            let _timestamp = cursor.get_u64()?;
            cursor.expect_end()?;

            table.begin(&BeginRequest {
                isolation: IsolationLevel::from_u32(isolation),
                read_only,
                session_id,
                client_id,
                proxy_conn_id: -1,
            })?;
        }

        request::MSG_BKUP_TXN_BEGIN_GETGXID => {
            let gxid = cursor.get_gxid()?;
            let isolation = cursor.get_u32()?;
            let read_only = cursor.get_u8()? != 0;
            let session_id = cursor.get_string(server.max_session_id_len())?;
            let client_id = cursor.get_u64()?;
            let _timestamp = cursor.get_u64()?;
            cursor.expect_end()?;

            let save = table.bkup_begin(
                gxid,
                &BeginRequest {
                    isolation: IsolationLevel::from_u32(isolation),
                    read_only,
                    session_id,
                    client_id,
                    proxy_conn_id: -1,
                },
            )?;
            server.save_control(save);
        }

        request::MSG_BKUP_TXN_BEGIN_GETGXID_AUTOVACUUM => {
            let gxid = cursor.get_gxid()?;
            let isolation = cursor.get_u32()?;
            let client_id = cursor.get_u64()?;
            cursor.expect_end()?;

            let save = table.bkup_begin(
                gxid,
                &BeginRequest {
                    isolation: IsolationLevel::from_u32(isolation),
                    client_id,
                    ..BeginRequest::default()
                },
            )?;
            server.save_control(save);
            if let Some(handle) = table.handle_by_gxid(gxid, true) {
                table.set_do_vacuum(handle)?;
            }
        }

        request::MSG_BKUP_TXN_BEGIN_GETGXID_MULTI => {
            let count = cursor.get_u32()? as usize;
            if count == 0 || count > MAX_BATCH {
                return Err(GtmError::Protocol(format!(
                    "bad transaction count in batched bkup begin: {count}"
                )));
            }

            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                let gxid = cursor.get_gxid()?;
                let isolation = cursor.get_u32()?;
                let read_only = cursor.get_u8()? != 0;
                let session_id = cursor.get_string(server.max_session_id_len())?;
                let client_id = cursor.get_u64()?;
                let proxy_conn_id = cursor.get_i32()?;
                items.push((
                    gxid,
                    BeginRequest {
                        isolation: IsolationLevel::from_u32(isolation),
                        read_only,
                        session_id,
                        client_id,
                        proxy_conn_id,
                    },
                ));
            }
            cursor.expect_end()?;

            let save = table.bkup_begin_multi(&items)?;
            server.save_control(save);
        }

        request::MSG_BKUP_TXN_PREPARE => {
            let gxid = cursor.get_gxid()?;
            cursor.expect_end()?;

            let handle = table
                .handle_by_gxid(gxid, true)
                .ok_or(GtmError::UnknownGxid(gxid))?;
            table.prepare(handle)?;
        }

        request::MSG_BKUP_TXN_START_PREPARED => {
            let gxid = cursor.get_gxid()?;
            let gid = cursor.get_string(server.max_gid_len())?;
            let node_string = cursor.get_string(server.max_nodestring_len())?;
            cursor.expect_end()?;

            let handle = table
                .handle_by_gxid(gxid, true)
                .ok_or(GtmError::UnknownGxid(gxid))?;
            table.start_prepared(handle, &gid, &node_string)?;
        }

        request::MSG_BKUP_TXN_COMMIT => {
            let gxid = cursor.get_gxid()?;
            cursor.expect_end()?;

            table.commit(table.handle_by_gxid(gxid, true), &[]);
        }

        request::MSG_BKUP_TXN_COMMIT_PREPARED => {
            let prepared_gxid = cursor.get_gxid()?;
            let commit_gxid = cursor.get_gxid()?;
            cursor.expect_end()?;

            let handles = [
                table.handle_by_gxid(prepared_gxid, true),
                table.handle_by_gxid(commit_gxid, true),
            ];
            table.commit_multi(&handles, &[]);
        }

        request::MSG_BKUP_TXN_ROLLBACK => {
            let gxid = cursor.get_gxid()?;
            cursor.expect_end()?;

            table.rollback(table.handle_by_gxid(gxid, true));
        }

        request::MSG_BKUP_TXN_COMMIT_MULTI | request::MSG_BKUP_TXN_ROLLBACK_MULTI => {
            let count = cursor.get_u32()? as usize;
            if count > MAX_BATCH {
                return Err(GtmError::Protocol(format!(
                    "bad transaction count in batched bkup commit/rollback: {count}"
                )));
            }
            let mut handles = Vec::with_capacity(count);
            for _ in 0..count {
                let gxid = cursor.get_gxid()?;
                handles.push(table.handle_by_gxid(gxid, true));
            }
            cursor.expect_end()?;

            if tag == request::MSG_BKUP_TXN_COMMIT_MULTI {
                table.commit_multi(&handles, &[]);
            } else {
                table.rollback_multi(&handles);
            }
        }

        request::MSG_BKUP_BACKEND_DISCONNECT => {
            let client_id = cursor.get_u64()?;
            let proxy_client_id = cursor.get_i32()?;
            cursor.expect_end()?;

            table.reap(client_id, proxy_client_id);
        }

        unknown => {
            return Err(GtmError::Protocol(format!(
                "unknown request tag {unknown:#04x}"
            )));
        }
    }

    Ok(())
}

fn read_waited_xids(cursor: &mut Payload<'_>) -> Result<Vec<Gxid>, GtmError> {
    let count = cursor.get_u32()? as usize;
    if count > MAX_BATCH {
        return Err(GtmError::Protocol(format!(
            "bad waited-gxid count: {count}"
        )));
    }
    let mut waited = Vec::with_capacity(count);
    for _ in 0..count {
        waited.push(cursor.get_gxid()?);
    }
    Ok(waited)
}
