//! couchlink - demonstration client
//!
//! Connects to an in-process cluster with the given parameters and
//! overrides, then runs a short session: set, get, a missing get, stat and
//! a view query.

use couchlink::connection::{ConfigOverride, ConnectParams, ConnectionManager, OverridePolicy};
use couchlink::transport::MemoryCluster;
use couchlink::OperationError;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Client configuration
struct Config {
    endpoint: String,
    bucket: String,
    username: Option<String>,
    password: Option<String>,
    /// Microseconds; 0 keeps the default
    timeout: u32,
    overrides: Vec<ConfigOverride>,
    strict: bool,
    chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "couchbase://127.0.0.1".to_string(),
            bucket: "radius".to_string(),
            username: None,
            password: None,
            timeout: 0,
            overrides: Vec::new(),
            strict: false,
            chunk_size: 64,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--endpoint" | "-e" => {
                    config.endpoint = value_of(&args, i);
                    i += 2;
                }
                "--bucket" | "-b" => {
                    config.bucket = value_of(&args, i);
                    i += 2;
                }
                "--user" | "-u" => {
                    config.username = Some(value_of(&args, i));
                    i += 2;
                }
                "--password" => {
                    config.password = Some(value_of(&args, i));
                    i += 2;
                }
                "--timeout" | "-t" => {
                    config.timeout = value_of(&args, i).parse().unwrap_or_else(|_| {
                        eprintln!("Error: --timeout expects microseconds");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--opt" | "-o" => {
                    let item = value_of(&args, i).parse().unwrap_or_else(|e| {
                        eprintln!("Error: {}", e);
                        std::process::exit(1);
                    });
                    config.overrides.push(item);
                    i += 2;
                }
                "--chunk-size" => {
                    config.chunk_size = value_of(&args, i).parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid chunk size");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--strict" => {
                    config.strict = true;
                    i += 1;
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("couchlink version {}", couchlink::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    fn params(&self) -> ConnectParams {
        let mut params = ConnectParams::new(&self.endpoint, &self.bucket).with_timeout(self.timeout);
        params.username = self.username.clone();
        params.password = self.password.clone();
        params
    }
}

fn value_of(args: &[String], i: usize) -> String {
    match args.get(i + 1) {
        Some(value) => value.clone(),
        None => {
            eprintln!("Error: {} requires a value", args[i]);
            std::process::exit(1);
        }
    }
}

/// Build a view request path for the connected bucket
fn view_path(bucket: &str, design: &str, view: &str) -> String {
    format!("/{}/_design/{}/_view/{}", bucket, design, view)
}

fn print_help() {
    println!(
        r#"
couchlink - asynchronous document store client (demonstration)

USAGE:
    couchlink [OPTIONS]

OPTIONS:
    -e, --endpoint <HOSTS>     Hosts, comma or space separated (default: couchbase://127.0.0.1)
    -b, --bucket <NAME>        Bucket name (default: radius)
    -u, --user <NAME>          Username
        --password <PASS>      Password
    -t, --timeout <MICROS>     Operation timeout in microseconds (default: 2500000)
    -o, --opt <KEY=VALUE>      Transport override, may be repeated
        --strict               Abort on an unknown or invalid override
        --chunk-size <BYTES>   View response chunk size (default: 64)
    -v, --version              Print version information
    -h, --help                 Print this help message

EXAMPLES:
    couchlink --opt op_timeout=5000000 --opt views_timeout=10.0
    RUST_LOG=couchlink=debug couchlink --chunk-size 8
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    let params = config.params();
    let mut cluster = MemoryCluster::new(&config.bucket)
        .with_servers(params.hosts())
        .with_chunk_size(config.chunk_size);
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        cluster = cluster.with_credentials(username, password);
    }
    cluster.define_view("acct/by_user", |_id, doc| match doc.get("user") {
        Some(user) => vec![(user.clone(), doc.get("session_time").cloned().unwrap_or_default())],
        None => vec![],
    });

    let policy = if config.strict {
        OverridePolicy::Strict
    } else {
        OverridePolicy::Lenient
    };
    let manager = ConnectionManager::new(Arc::new(cluster)).with_policy(policy);
    let handle = manager.connect(params, &config.overrides)?;
    for rejected in handle.rejected_overrides() {
        warn!("ignored override: {}", rejected);
    }
    info!(
        "Connected to {}",
        handle.connection_string().unwrap_or_default()
    );

    let sessions = [
        ("acct:1001", json!({"user": "alice", "session_time": 310, "status": "stop"})),
        ("acct:1002", json!({"user": "bob", "session_time": 45, "status": "stop"})),
        ("acct:1003", json!({"user": "alice", "session_time": 12, "status": "interim"})),
    ];
    for (key, doc) in &sessions {
        let stored = handle.set(key, doc.to_string(), 0)?.await?;
        println!("SET  {:<10} cas={}", key, stored.cas);
    }

    let doc = handle.get("acct:1001")?.await?;
    println!("GET  {:<10} {}", doc.key, doc.as_str().unwrap_or("<binary>"));

    match handle.get("acct:9999")?.await {
        Err(OperationError::NotFound { key }) => println!("GET  {:<10} not found", key),
        other => println!("GET  acct:9999 unexpected {:?}", other),
    }

    for entry in handle.stat(None)?.await? {
        println!("STAT {:<18} {:<12} {}", entry.server, entry.key, entry.value);
    }

    let path = view_path(&config.bucket, "acct", "by_user");
    let view = handle
        .view_query(&path, Some(r#"{"keys":["alice"]}"#))?
        .await?;
    println!(
        "VIEW acct/by_user HTTP {} in {} chunks",
        view.http_status, view.chunks
    );
    for row in view.rows()? {
        println!("     {:<10} {} -> {}", row.id.unwrap_or_default(), row.key, row.value);
    }

    let stats = handle.stats();
    info!(
        dispatched = stats.ops_dispatched.load(std::sync::atomic::Ordering::Relaxed),
        view_chunks = stats.view_chunks.load(std::sync::atomic::Ordering::Relaxed),
        "Session complete"
    );

    manager.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_path_follows_bucket() {
        assert_eq!(
            view_path("radius", "acct", "by_user"),
            "/radius/_design/acct/_view/by_user"
        );
        assert_eq!(
            view_path("billing", "acct", "by_user"),
            "/billing/_design/acct/_view/by_user"
        );
    }
}
