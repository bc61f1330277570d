//! Database engine families: dump and verification per engine.
//!
//! SQLite is copied through the online backup API so a database being
//! written to still yields a consistent image. Server engines are dumped by
//! their own client tool streaming to stdout, compressed on the fly. Every
//! artifact is decoded end to end before it counts as usable.

use crate::{BackupError, Result};
use async_compression::tokio::write::ZstdEncoder;
use async_compression::Level;
use rusqlite::{Connection, DatabaseName, OpenFlags};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

/// Magic header of every SQLite 3 database file.
pub const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// Cap on captured stderr kept for error messages
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Sqlite,
    Postgres,
    Mysql,
    Mongodb,
}

impl Engine {
    pub const ALL: [Engine; 4] = [Engine::Sqlite, Engine::Postgres, Engine::Mysql, Engine::Mongodb];

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Sqlite => "sqlite",
            Engine::Postgres => "postgres",
            Engine::Mysql => "mysql",
            Engine::Mongodb => "mongodb",
        }
    }

    /// Engine for a connection-string scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" | "file" => Some(Engine::Sqlite),
            "postgres" | "postgresql" => Some(Engine::Postgres),
            "mysql" | "mariadb" | "mysql2" => Some(Engine::Mysql),
            "mongodb" | "mongodb+srv" => Some(Engine::Mongodb),
            _ => None,
        }
    }

    /// External client tool the dump needs, if any.
    pub fn dump_tool(&self) -> Option<&'static str> {
        match self {
            Engine::Sqlite => None,
            Engine::Postgres => Some("pg_dump"),
            Engine::Mysql => Some("mysqldump"),
            Engine::Mongodb => Some("mongodump"),
        }
    }

    /// Tool used when dumping a whole running server.
    pub fn server_dump_tool(&self) -> Option<&'static str> {
        match self {
            Engine::Postgres => Some("pg_dumpall"),
            other => other.dump_tool(),
        }
    }

    /// Process names of a running server.
    pub fn server_processes(&self) -> &'static [&'static str] {
        match self {
            Engine::Sqlite => &[],
            Engine::Postgres => &["postgres", "postmaster"],
            Engine::Mysql => &["mysqld", "mariadbd"],
            Engine::Mongodb => &["mongod"],
        }
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            Engine::Sqlite => None,
            Engine::Postgres => Some(5432),
            Engine::Mysql => Some(3306),
            Engine::Mongodb => Some(27017),
        }
    }

    /// Extension of the uncompressed dump.
    pub fn dump_extension(&self) -> &'static str {
        match self {
            Engine::Sqlite => "sqlite",
            Engine::Postgres | Engine::Mysql => "sql",
            Engine::Mongodb => "archive",
        }
    }

    /// Client invocation streaming a dump of `connection` to stdout.
    pub fn dump_command(&self, connection: &ConnectionInfo) -> Option<Command> {
        let tool = self.dump_tool()?;
        let mut cmd = Command::new(tool);
        match self {
            Engine::Sqlite => return None,
            Engine::Postgres => {
                cmd.arg("--no-password").arg("--format=plain").arg("--dbname").arg(&connection.url);
            }
            Engine::Mysql => {
                cmd.arg("--single-transaction").arg("--routines");
                if let Some(host) = &connection.host {
                    cmd.arg("--host").arg(host);
                }
                if let Some(port) = connection.port {
                    cmd.arg("--port").arg(port.to_string());
                }
                if let Some(user) = &connection.username {
                    cmd.arg("--user").arg(user);
                }
                if let Some(password) = &connection.password {
                    cmd.env("MYSQL_PWD", password);
                }
                if let Some(database) = &connection.database {
                    cmd.arg(database);
                } else {
                    cmd.arg("--all-databases");
                }
            }
            Engine::Mongodb => {
                cmd.arg(format!("--uri={}", connection.url)).arg("--archive");
            }
        }
        Some(cmd)
    }

    /// Whole-server dump used for running servers without a connection string.
    pub fn server_dump_command(&self) -> Option<Command> {
        let tool = self.server_dump_tool()?;
        let mut cmd = Command::new(tool);
        match self {
            Engine::Sqlite => return None,
            Engine::Postgres => {
                cmd.arg("--no-password");
            }
            Engine::Mysql => {
                cmd.arg("--single-transaction").arg("--all-databases");
            }
            Engine::Mongodb => {
                cmd.arg("--archive");
            }
        }
        Some(cmd)
    }

    /// Decode `artifact` fully and apply engine checks. Returns the table
    /// count where the engine exposes one.
    pub fn verify(&self, artifact: &Path) -> Result<Option<u64>> {
        let fail = |reason: String| BackupError::Verification {
            path: artifact.to_path_buf(),
            reason,
        };

        match self {
            Engine::Sqlite => {
                let staging = tempfile::NamedTempFile::new_in(
                    artifact.parent().unwrap_or_else(|| Path::new(".")),
                )?;
                decode_to(artifact, staging.as_file()).map_err(|e| fail(format!("zstd: {e}")))?;
                let mut header = [0u8; 16];
                File::open(staging.path())?
                    .read_exact(&mut header)
                    .map_err(|e| fail(format!("truncated image: {e}")))?;
                if &header != SQLITE_HEADER {
                    return Err(fail("not a SQLite image".to_string()));
                }
                let conn = Connection::open_with_flags(staging.path(), OpenFlags::SQLITE_OPEN_READ_ONLY)
                    .map_err(|e| fail(e.to_string()))?;
                let check: String = conn
                    .query_row("PRAGMA integrity_check", [], |row| row.get(0))
                    .map_err(|e| fail(e.to_string()))?;
                if check != "ok" {
                    return Err(fail(format!("integrity_check: {check}")));
                }
                Ok(Some(sqlite_table_count(&conn).map_err(|e| fail(e.to_string()))?))
            }
            Engine::Postgres | Engine::Mysql | Engine::Mongodb => {
                let mut counter = CountingSink::default();
                decode_to(artifact, &mut counter).map_err(|e| fail(format!("zstd: {e}")))?;
                if counter.bytes == 0 {
                    return Err(fail("empty dump".to_string()));
                }
                Ok(counter.create_tables)
            }
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed connection target of a server database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Full connection string; credentials never leave the process
    #[serde(skip)]
    pub url: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
}

/// Open `source` read-only and copy it through the online backup API.
pub fn sqlite_backup(source: &Path, destination: &Path) -> Result<u64> {
    let name = source.display().to_string();
    let conn = Connection::open_with_flags(source, OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
        .map_err(|e| BackupError::DatabaseDump {
            name: name.clone(),
            reason: e.to_string(),
        })?;
    conn.backup(DatabaseName::Main, destination, None)
        .map_err(|e| BackupError::DatabaseDump {
            name: name.clone(),
            reason: format!("backup API: {e}"),
        })?;
    Ok(std::fs::metadata(destination)?.len())
}

pub fn sqlite_table_count(conn: &Connection) -> rusqlite::Result<u64> {
    conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n as u64)
}

/// Whether `path` starts with the SQLite header.
pub fn is_sqlite_file(path: &Path) -> bool {
    let mut header = [0u8; 16];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut header))
        .map(|_| &header == SQLITE_HEADER)
        .unwrap_or(false)
}

/// Compress `source` into `destination` with zstd.
pub fn compress_file(source: &Path, destination: &Path, level: i32) -> io::Result<u64> {
    let input = BufReader::new(File::open(source)?);
    let output = File::create(destination)?;
    zstd::stream::copy_encode(input, &output, level)?;
    output.sync_all()?;
    Ok(output.metadata()?.len())
}

fn decode_to<W: io::Write>(artifact: &Path, writer: W) -> io::Result<()> {
    let input = BufReader::new(File::open(artifact)?);
    zstd::stream::copy_decode(input, writer)
}

/// Sink that counts decoded bytes and SQL `CREATE TABLE` statements.
#[derive(Default)]
struct CountingSink {
    bytes: u64,
    create_tables: Option<u64>,
    carry: Vec<u8>,
}

impl io::Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes += buf.len() as u64;
        self.carry.extend_from_slice(buf);
        while let Some(pos) = self.carry.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.carry.drain(..=pos).collect();
            if line.starts_with(b"CREATE TABLE") {
                *self.create_tables.get_or_insert(0) += 1;
            }
        }
        // Long binary lines (mongo archives) are not SQL statements
        if self.carry.len() > 64 * 1024 {
            self.carry.clear();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `cmd`, stream its stdout through zstd into `destination` and check
/// its exit status. A non-zero exit is a dump failure even if output was
/// produced. Output is staged beside `destination` and only moved into
/// place once the dump is complete, so a failed dump leaves nothing behind.
pub async fn run_dump_command(mut cmd: Command, name: &str, destination: &Path, level: i32) -> Result<u64> {
    let fail = |reason: String| BackupError::DatabaseDump {
        name: name.to_string(),
        reason,
    };

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            BackupError::DependencyMissing { tool: program.clone() }
        } else {
            fail(format!("failed to start {program}: {e}"))
        }
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| fail("stdout not captured".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| fail("stderr not captured".to_string()))?;

    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    let staging = tempfile::Builder::new().prefix(".dump-").tempfile_in(parent)?;
    let file = tokio::fs::File::from_std(staging.reopen()?);
    let mut encoder = ZstdEncoder::with_quality(file, Level::Precise(level));
    let copied = tokio::io::copy(&mut stdout, &mut encoder).await;
    let shutdown = encoder.shutdown().await;

    let status = child.wait().await?;
    let stderr = stderr_task.await.unwrap_or_default();
    let stderr_tail = tail(&stderr);

    if !status.success() {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(fail(format!("{program} exited with {code}: {stderr_tail}")));
    }
    copied.map_err(|e| fail(format!("reading {program} output: {e}")))?;
    shutdown.map_err(|e| fail(format!("compressing output: {e}")))?;
    staging
        .persist(destination)
        .map_err(|e| fail(format!("saving dump to {}: {}", destination.display(), e.error)))?;

    let size = tokio::fs::metadata(destination).await?.len();
    debug!(name, program = %program, size, "Dump written");
    Ok(size)
}

fn tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
