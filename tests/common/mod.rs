#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, Utc};
use sql_exporter::config::DEFAULT_TIMESTAMP_FORMAT;
use sqlx::{
    Connection, Executor,
    sqlite::{SqliteConnectOptions, SqliteConnection},
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A throwaway sqlite database plus the directory holding it (and any
/// configuration file written next to it).
pub struct TestDb {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl TestDb {
    /// Create a database file and run `schema` against it.
    pub async fn new(schema: &str) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.sqlite");

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options).await?;
        conn.execute(schema).await?;
        conn.close().await?;

        Ok(Self { dir, path })
    }

    /// Descriptor understood by the exporter.
    pub fn dsn(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }

    /// Write `content` as `sql_exporter.toml` next to the database.
    pub fn write_config(&self, content: &str) -> Result<PathBuf> {
        let path = self.dir.path().join("sql_exporter.toml");
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn config_dir(&self) -> &Path {
        self.dir.path()
    }
}

/// Heartbeat table written by a replication job: one row per environment.
pub const HEARTBEAT_SCHEMA: &str = r"
    CREATE TABLE heartbeat (
        env TEXT NOT NULL,
        region TEXT,
        updated_at TEXT,
        pending INTEGER
    );
";

/// Render `t` the way lag calculations parse it by default.
pub fn timestamp(t: DateTime<Utc>) -> String {
    t.format(DEFAULT_TIMESTAMP_FORMAT).to_string()
}

/// Insert a heartbeat written `seconds_ago`.
pub async fn insert_heartbeat(
    db: &TestDb,
    env: &str,
    region: Option<&str>,
    seconds_ago: i64,
    pending: Option<i64>,
) -> Result<()> {
    let updated_at = timestamp(Utc::now() - chrono::Duration::seconds(seconds_ago));

    let options = SqliteConnectOptions::new().filename(&db.path);
    let mut conn = SqliteConnection::connect_with(&options).await?;
    sqlx::query("INSERT INTO heartbeat (env, region, updated_at, pending) VALUES (?, ?, ?, ?)")
        .bind(env)
        .bind(region)
        .bind(updated_at)
        .bind(pending)
        .execute(&mut conn)
        .await?;
    conn.close().await?;

    Ok(())
}

/// Value of the first exposition line starting with `series` (name plus
/// labels, exactly as rendered).
pub fn sample_value(text: &str, series: &str) -> Option<f64> {
    text.lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| {
            let rest = line.strip_prefix(series)?;
            rest.strip_prefix(' ')?.split(' ').next()?.parse().ok()
        })
}

/// Find an available port for testing (returns port > 1024)
pub fn get_available_port() -> u16 {
    use std::net::TcpListener;

    // Bind to port 0 lets the OS assign an available ephemeral port
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
    let port = listener
        .local_addr()
        .expect("Failed to get local addr")
        .port();

    assert!(port > 1024, "Assigned port {port} should be > 1024");

    port
}

/// Wait for server to be ready on the given port
///
/// # Arguments
/// * `port` - The port number to connect to
/// * `max_attempts` - Maximum number of connection attempts (e.g., 50 = 5 seconds at 100ms intervals)
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    use tokio::time::{Duration, sleep};

    for attempt in 1..=max_attempts {
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{port}"))
            .await
            .is_ok()
        {
            return true;
        }

        if attempt % 10 == 0 {
            eprintln!("Still waiting for server on port {port} (attempt {attempt}/{max_attempts})");
        }

        sleep(Duration::from_millis(100)).await;
    }

    eprintln!("Failed to connect to server on port {port} after {max_attempts} attempts");
    false
}

/// Get base URL for test server
pub fn get_test_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}
