//! Append-only journal gateway.
//!
//! Publishes each payload as one line `<rfc3339 timestamp> <payload hex>` in
//! a local file. The receipt is the 1-based line number. Useful as a
//! stand-in for a remote ledger and as an audit trail next to one.
//!
//! The file is scanned once, on the first publish. A last line left without
//! a newline by an interrupted write still counts as a line and is
//! terminated before the next entry.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use tars_core::{Hash256, PublicationGateway, PublishError, ReceiptId};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

pub struct JournalGateway {
    path: PathBuf,
    // Serializes appends so line numbers stay unique. `None` until the file
    // has been scanned, and again after a failed append.
    tail: Mutex<Option<Tail>>,
}

/// What the next append needs to know about the end of the journal.
#[derive(Debug, Clone, Copy)]
struct Tail {
    lines: u64,
    // Last line has no terminating newline.
    torn: bool,
}

impl Tail {
    fn scan(bytes: &[u8]) -> Self {
        let newlines = bytes.iter().filter(|b| **b == b'\n').count() as u64;
        let torn = bytes.last().is_some_and(|b| *b != b'\n');
        Self {
            lines: newlines + u64::from(torn),
            torn,
        }
    }
}

impl JournalGateway {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tail: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_tail(&self) -> Result<Tail, PublishError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let tail = Tail::scan(&bytes);
                if tail.torn {
                    warn!(path = %self.path.display(), line = tail.lines, "journal ends with a torn line");
                }
                Ok(tail)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Tail {
                lines: 0,
                torn: false,
            }),
            Err(e) => Err(unavailable(&self.path, e)),
        }
    }

    async fn append(&self, entry: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(entry).await?;
        file.sync_data().await
    }
}

fn unavailable(path: &Path, e: std::io::Error) -> PublishError {
    PublishError::Unavailable(format!("{}: {e}", path.display()))
}

#[async_trait]
impl PublicationGateway for JournalGateway {
    fn name(&self) -> &str {
        "journal"
    }

    async fn publish(&self, payload: &Hash256) -> Result<ReceiptId, PublishError> {
        let mut cached = self.tail.lock().await;
        let tail = match *cached {
            Some(tail) => tail,
            None => self.load_tail().await?,
        };

        let mut entry = String::new();
        if tail.torn {
            entry.push('\n');
        }
        entry.push_str(&format!(
            "{} {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            hex::encode(payload)
        ));

        if let Err(e) = self.append(entry.as_bytes()).await {
            // A partial write leaves the tail unknown.
            *cached = None;
            return Err(unavailable(&self.path, e));
        }

        let lines = tail.lines + 1;
        *cached = Some(Tail { lines, torn: false });
        Ok(ReceiptId(lines.to_string()))
    }
}
