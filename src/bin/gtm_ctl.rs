use clap::Parser;
use comfy_table::{Cell, Table as ComfyTable, presets::UTF8_FULL};
use config::{Config, Environment, File};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde::Deserialize;
use std::path::Path;

use rustgtm::network::client::GtmClient;
use rustgtm::txn::snapshot::TableSnapshot;

/// RustGTM operator client
#[derive(Parser, Debug)]
#[command(name = "gtm_ctl")]
#[command(about = "RustGTM interactive operator client", long_about = None)]
struct Args {
    /// Server host
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Server port
    #[arg(short = 'p', long)]
    port: Option<u16>,
}

/// Client configuration
#[derive(Debug, Deserialize)]
struct ClientConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6666
}

impl ClientConfig {
    /// Load configuration with priority: CLI args > ENV > config file > defaults
    fn load(args: &Args) -> Self {
        let config_paths = ["/etc/rustgtm/rustgtm.toml", "./rustgtm.toml"];

        let mut builder = Config::builder();
        for path in &config_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
        builder = builder.add_source(Environment::with_prefix("RUSTGTM").separator("_"));

        let base = builder
            .build()
            .ok()
            .and_then(|c| c.try_deserialize::<Self>().ok())
            .unwrap_or_else(|| Self {
                host: default_host(),
                port: default_port(),
            });

        Self {
            host: args.host.clone().unwrap_or(base.host),
            port: args.port.unwrap_or(base.port),
        }
    }
}

fn print_help() {
    println!("Commands:");
    println!("  begin [session]              - begin a transaction and mint its GXID");
    println!("  commit <gxid> [waited...]    - commit, optionally after other GXIDs finish");
    println!("  rollback <gxid>              - roll back");
    println!("  prepare <gxid> <gid> <nodes> - run both 2PC prepare phases");
    println!("  commitprepared <gid>         - resolve a GID and commit both GXIDs");
    println!("  list                         - show open transactions");
    println!("  next                         - show the next GXID without minting");
    println!("  xmin <gxid> <node>           - report a node's xmin");
    println!("  help                         - this help");
    println!("  quit / exit                  - leave");
}

fn render_snapshot(snapshot: &TableSnapshot) {
    let mut table = ComfyTable::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["GXID", "State", "Session", "GID", "Client", "Vacuum"]);

    for txn in &snapshot.open {
        table.add_row(vec![
            Cell::new(txn.gxid),
            Cell::new(format!("{:?}", txn.state)),
            Cell::new(&txn.session_id),
            Cell::new(txn.gid.as_deref().unwrap_or("-")),
            Cell::new(txn.client_id),
            Cell::new(if txn.do_vacuum { "yes" } else { "no" }),
        ]);
    }

    println!("{table}");
    println!(
        "next_gxid: {}  latest_completed: {}  global_xmin: {}",
        snapshot.next_gxid, snapshot.latest_completed_gxid, snapshot.recent_global_xmin
    );
}

async fn run_command(client: &mut GtmClient, line: &str) -> Result<bool, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = parts.first() else {
        return Ok(true);
    };

    match command {
        "quit" | "exit" => return Ok(false),
        "help" => print_help(),
        "begin" => {
            let session = parts.get(1).copied().unwrap_or("");
            let (gxid, timestamp) = client.begin_getgxid(2, false, session).await?;
            println!("✓ gxid {gxid} (timestamp {timestamp})");
        }
        "commit" => {
            let gxid = parts
                .get(1)
                .ok_or("usage: commit <gxid> [waited...]")?
                .parse()?;
            let waited: Vec<u32> = parts[2..]
                .iter()
                .map(|w| w.parse())
                .collect::<Result<_, _>>()?;
            let (echoed, status) = client.commit(gxid, &waited).await?;
            println!("✓ gxid {echoed}: {status:?}");
        }
        "rollback" => {
            let gxid = parts.get(1).ok_or("usage: rollback <gxid>")?.parse()?;
            let (echoed, status) = client.rollback(gxid).await?;
            println!("✓ gxid {echoed}: {status:?}");
        }
        "prepare" => {
            let gxid = parts
                .get(1)
                .ok_or("usage: prepare <gxid> <gid> <nodes>")?
                .parse()?;
            let gid = parts.get(2).ok_or("usage: prepare <gxid> <gid> <nodes>")?;
            let nodes = parts.get(3).ok_or("usage: prepare <gxid> <gid> <nodes>")?;
            client.start_prepared(gxid, gid, nodes).await?;
            client.prepare(gxid).await?;
            println!("✓ gxid {gxid} prepared as '{gid}'");
        }
        "commitprepared" => {
            let gid = parts.get(1).ok_or("usage: commitprepared <gid>")?;
            let (new_gxid, prepared_gxid, nodes) = client.get_gid_data(2, false, gid).await?;
            println!("→ prepared gxid {prepared_gxid}, commit gxid {new_gxid}, nodes: {nodes}");
            let (_, status) = client.commit_prepared(prepared_gxid, new_gxid, &[]).await?;
            println!("✓ {status:?}");
        }
        "list" => {
            let snapshot = client.gxid_list().await?;
            render_snapshot(&snapshot);
        }
        "next" => {
            let next = client.get_next_gxid().await?;
            println!("✓ next gxid: {next}");
        }
        "xmin" => {
            let gxid = parts.get(1).ok_or("usage: xmin <gxid> <node>")?.parse()?;
            let node = parts.get(2).ok_or("usage: xmin <gxid> <node>")?;
            let (latest, global, errcode) = client.report_xmin(gxid, 1, node).await?;
            println!("✓ latest_completed {latest}, global_xmin {global}, errcode {errcode}");
        }
        other => println!("Unknown command: {other}. Use 'help'."),
    }

    Ok(true)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = ClientConfig::load(&args);

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║               RustGTM Operator Client                    ║");
    println!("╚══════════════════════════════════════════════════════════╝");
    println!("Connecting to {}:{}...", config.host, config.port);

    let addr = format!("{}:{}", config.host, config.port);
    let mut client = match GtmClient::connect(&addr).await {
        Ok(client) => {
            println!("✓ Connected!\n");
            client
        }
        Err(e) => {
            eprintln!("✗ Connection failed: {e}");
            eprintln!("\nTroubleshooting:");
            eprintln!("  1. Check if the server is running: ps aux | grep rustgtm");
            eprintln!("  2. Verify host and port settings");
            return Err(e.into());
        }
    };

    let mut rl = DefaultEditor::new()?;
    let history_file = dirs::home_dir().map(|mut p| {
        p.push(".gtm_ctl_history");
        p
    });
    if let Some(ref path) = history_file {
        let _ = rl.load_history(path); // Ignore error if file doesn't exist
    }

    println!("Type 'help' for command help, 'quit' or 'exit' to quit.\n");

    loop {
        match rl.readline("gtm_ctl> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                match run_command(&mut client, line).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("✗ {e}"),
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Error: {e:?}");
                break;
            }
        }
    }

    if let Some(ref path) = history_file {
        let _ = rl.save_history(path);
    }

    println!("\n╔══════════════════════════════════════════════════════════╗");
    println!("║                    Session closed                        ║");
    println!("╚══════════════════════════════════════════════════════════╝");

    Ok(())
}
