use config::{Config, Environment, File};
use rustgtm::standby::bootstrap_from_primary;
use rustgtm::{Server, ServerOptions};
use serde::Deserialize;
use std::path::Path;

/// Server configuration
#[derive(Debug, Deserialize)]
struct GtmConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_data_dir")]
    data_dir: String,
    #[serde(default = "default_max_open")]
    max_open: usize,
    #[serde(default = "default_control_interval")]
    control_interval: u32,
    #[serde(default = "default_max_session_id_len")]
    max_session_id_len: usize,
    #[serde(default = "default_max_gid_len")]
    max_gid_len: usize,
    #[serde(default = "default_max_nodestring_len")]
    max_nodestring_len: usize,
    #[serde(default)]
    backup_synchronously: bool,
    /// Run as the hot standby instead of the primary.
    #[serde(default)]
    standby: bool,
    /// Peer address the primary mirrors to.
    #[serde(default)]
    standby_addr: Option<String>,
    /// Primary to bootstrap from when starting as a standby.
    #[serde(default)]
    primary_addr: Option<String>,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 6666 }
fn default_data_dir() -> String { "./gtm-data".to_string() }
fn default_max_open() -> usize { rustgtm::core::limits::DEFAULT_MAX_OPEN }
fn default_control_interval() -> u32 { rustgtm::core::limits::DEFAULT_CONTROL_INTERVAL }
fn default_max_session_id_len() -> usize { rustgtm::core::limits::MAX_SESSION_ID_LEN }
fn default_max_gid_len() -> usize { rustgtm::core::limits::MAX_GID_LEN }
fn default_max_nodestring_len() -> usize { rustgtm::core::limits::MAX_NODESTRING_LEN }

impl GtmConfig {
    /// Load configuration with priority: ENV > config file > defaults
    fn load() -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();

        // 1. Try to load config file (optional)
        let config_paths = ["/etc/rustgtm/rustgtm.toml", "./rustgtm.toml"];
        for path in &config_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                eprintln!("Loaded config from: {path}");
                break;
            }
        }

        // 2. Override with environment variables (RUSTGTM_*)
        builder = builder.add_source(Environment::with_prefix("RUSTGTM").separator("_"));

        // 3. Build and deserialize
        let config = builder.build()?;
        config.try_deserialize()
    }

    fn defaults() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            max_open: default_max_open(),
            control_interval: default_control_interval(),
            max_session_id_len: default_max_session_id_len(),
            max_gid_len: default_max_gid_len(),
            max_nodestring_len: default_max_nodestring_len(),
            backup_synchronously: false,
            standby: false,
            standby_addr: None,
            primary_addr: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = GtmConfig::load().unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config: {e}. Using defaults.");
        GtmConfig::defaults()
    });

    let role = if config.standby { "standby" } else { "primary" };
    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║          RustGTM Server Starting...                      ║");
    println!("╠══════════════════════════════════════════════════════════╣");
    println!("║  • Role:         {role:<39} ║");
    println!("║  • Address:      {}:{:<29} ║", config.host, config.port);
    println!("║  • Data dir:     {:<39} ║", config.data_dir);
    println!("║  • Max open:     {:<39} ║", config.max_open);
    println!("╚══════════════════════════════════════════════════════════╝");

    let data_dir = config.data_dir.clone();
    let server = Server::new(ServerOptions {
        data_dir: config.data_dir,
        max_open: config.max_open,
        control_interval: config.control_interval,
        backup_synchronously: config.backup_synchronously,
        standby: config.standby,
        standby_addr: config.standby_addr,
        max_session_id_len: config.max_session_id_len,
        max_gid_len: config.max_gid_len,
        max_nodestring_len: config.max_nodestring_len,
    })?;

    // A standby first copies the primary's open-transaction set, then keeps
    // in lockstep through the mirror stream.
    if config.standby {
        if let Some(primary) = config.primary_addr.as_deref() {
            bootstrap_from_primary(&server.table(), primary).await?;
        }
    }

    let bind_addr = format!("{}:{}", config.host, config.port);
    let table = server.table();

    tokio::select! {
        result = server.start(&bind_addr) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            // Stop issuing GXIDs, then checkpoint the counter so the next
            // start resumes past everything handed out in this run.
            table.set_shutting_down();
            let control = rustgtm::storage::ControlFile::new(&data_dir)?;
            control.save(table.read_next_gxid())?;
            println!("→ Shutdown: control record checkpointed at {}", table.read_next_gxid());
        }
    }

    Ok(())
}
