use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::core::error::GtmError;
use crate::core::gxid::Gxid;
use crate::core::limits::{
    DEFAULT_CONTROL_INTERVAL, DEFAULT_MAX_OPEN, MAX_GID_LEN, MAX_NODESTRING_LEN,
    MAX_SESSION_ID_LEN, REQUEST_DEADLINE_SECS,
};
use crate::network::dispatcher::{self, SessionContext};
use crate::network::protocol::{Payload, peer, read_message, request};
use crate::standby::MirrorClient;
use crate::storage::ControlFile;
use crate::txn::table::{TableOptions, TransactionTable};

/// Server configuration (everything the core tunes; addresses come from the
/// surrounding service).
pub struct ServerOptions {
    pub data_dir: String,
    pub max_open: usize,
    pub control_interval: u32,
    /// Wait for the standby's ack before replying to non-proxy clients.
    pub backup_synchronously: bool,
    /// Run as the hot standby: accept the mirror stream, refuse to mint
    /// GXIDs.
    pub standby: bool,
    /// Peer to mirror to when running as primary.
    pub standby_addr: Option<String>,
    pub max_session_id_len: usize,
    pub max_gid_len: usize,
    pub max_nodestring_len: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            data_dir: "./gtm-data".to_string(),
            max_open: DEFAULT_MAX_OPEN,
            control_interval: DEFAULT_CONTROL_INTERVAL,
            backup_synchronously: false,
            standby: false,
            standby_addr: None,
            max_session_id_len: MAX_SESSION_ID_LEN,
            max_gid_len: MAX_GID_LEN,
            max_nodestring_len: MAX_NODESTRING_LEN,
        }
    }
}

pub struct Server {
    table: Arc<TransactionTable>,
    control: ControlFile,
    mirror: Option<Mutex<MirrorClient>>,
    backup_synchronously: bool,
    standby: bool,
    max_session_id_len: usize,
    max_gid_len: usize,
    max_nodestring_len: usize,
    /// Client ids start at 1; 0 is reserved for anonymous transactions.
    next_client_id: AtomicU64,
}

impl Server {
    /// Build the server: transaction table, restored control record, and
    /// (on the primary) the mirror connection handle.
    pub fn new(options: ServerOptions) -> Result<Self, GtmError> {
        let table = Arc::new(TransactionTable::new(TableOptions {
            max_open: options.max_open,
            control_interval: options.control_interval,
            standby: options.standby,
            ..TableOptions::default()
        }));

        let control = ControlFile::new(&options.data_dir)?;
        let restore = control.restore_point()?;
        table.set_next_gxid(restore);
        println!("✓ Restored control record, next gxid {restore}");

        let mirror = if options.standby {
            None
        } else {
            options.standby_addr.as_ref().map(|addr| {
                println!("✓ Mirroring to standby at {addr}");
                Mutex::new(MirrorClient::new(addr.clone()))
            })
        };

        Ok(Self {
            table,
            control,
            mirror,
            backup_synchronously: options.backup_synchronously,
            standby: options.standby,
            max_session_id_len: options.max_session_id_len,
            max_gid_len: options.max_gid_len,
            max_nodestring_len: options.max_nodestring_len,
            next_client_id: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn table(&self) -> Arc<TransactionTable> {
        Arc::clone(&self.table)
    }

    #[must_use]
    pub const fn is_standby(&self) -> bool {
        self.standby
    }

    pub(crate) const fn max_session_id_len(&self) -> usize {
        self.max_session_id_len
    }

    pub(crate) const fn max_gid_len(&self) -> usize {
        self.max_gid_len
    }

    pub(crate) const fn max_nodestring_len(&self) -> usize {
        self.max_nodestring_len
    }

    /// Persist a control checkpoint the generator marked as due. Called with
    /// no table lock held.
    pub(crate) fn save_control(&self, due: Option<Gxid>) {
        if let Some(value) = due {
            if let Err(e) = self.control.save(value) {
                eprintln!("✗ Failed to write control record ({value}): {e}");
            }
        }
    }

    /// Ship one mirror call to the standby, honouring the synchronous-backup
    /// setting. A lost standby is a warning unless the caller requires the
    /// ack.
    pub(crate) async fn mirror_send(
        &self,
        msg: crate::network::protocol::Message,
        from_proxy: bool,
    ) -> Result<(), GtmError> {
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };

        let want_ack = self.backup_synchronously && !from_proxy;
        let mut guard = mirror.lock().await;
        let outcome = match guard.send(&msg).await {
            Ok(()) if want_ack => guard.sync().await,
            other => other,
        };
        drop(guard);

        match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                eprintln!("✗ Standby lost: {e}; continuing without mirroring");
                if want_ack { Err(e) } else { Ok(()) }
            }
        }
    }

    /// Bind and serve forever.
    pub async fn start(self, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        let role = if self.standby { "standby" } else { "primary" };
        println!(
            "
╔══════════════════════════════════════════════════════════╗
║       🚀 RustGTM Server is Ready!                        ║
║                                                          ║
║  Listening on: {addr:<41} ║
║  Role:         {role:<41} ║
╚══════════════════════════════════════════════════════════╝
"
        );
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener. Public so tests can drive
    /// a server on an ephemeral port.
    pub async fn serve(self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        let server = Arc::new(self);
        loop {
            let (socket, addr) = listener.accept().await?;
            let client_id = server.next_client_id.fetch_add(1, Ordering::SeqCst);
            println!("→ New connection from {addr} (client {client_id})");

            let server = Arc::clone(&server);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_client(&server, socket, client_id).await {
                    eprintln!("✗ Error handling client {addr}: {e}");
                }
                // A dropped connection reaps the client's transactions.
                // Prepared ones survive and are finished later by GID.
                let removed = server.table.reap(client_id, -1);
                if !removed.is_empty() {
                    println!(
                        "→ Client {client_id} disconnected, reaped {} transactions",
                        removed.len()
                    );
                }
            });
        }
    }

    async fn handle_client(
        server: &Arc<Self>,
        socket: TcpStream,
        client_id: u64,
    ) -> Result<(), GtmError> {
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        let mut session = SessionContext {
            client_id,
            is_proxy: false,
            proxy_conn_id: -1,
        };

        loop {
            let (tag, payload) = match read_message(&mut reader).await {
                Ok(frame) => frame,
                Err(GtmError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if tag == request::MSG_CLIENT_HELLO {
                Self::handle_hello(&payload, &mut session)?;
                continue;
            }

            let deadline = std::time::Duration::from_secs(REQUEST_DEADLINE_SECS);
            let dispatched = tokio::time::timeout(
                deadline,
                dispatcher::dispatch(server, &mut session, tag, &payload, &mut write_half),
            )
            .await;
            match dispatched {
                Ok(outcome) => outcome?,
                // A request past its deadline takes the whole connection
                // down; the reaper then clears the client's unprepared
                // transactions.
                Err(_) => {
                    return Err(GtmError::Protocol(format!(
                        "request {tag:#04x} exceeded the {REQUEST_DEADLINE_SECS}s deadline"
                    )));
                }
            }
        }
    }

    fn handle_hello(payload: &[u8], session: &mut SessionContext) -> Result<(), GtmError> {
        let mut cursor = Payload::new(payload);
        let kind = cursor.get_u8()?;
        let conn_id = cursor.get_i32()?;
        cursor.expect_end()?;

        if kind == peer::PROXY {
            session.is_proxy = true;
            session.proxy_conn_id = conn_id;
        }
        Ok(())
    }
}
