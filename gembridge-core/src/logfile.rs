//! Rolling bridge log: one plain UTF-8 file in the project root,
//! ISO-timestamp-prefixed lines, renamed to a `.old` sibling at startup
//! once it exceeds the size cap. The only persistent state the bridge
//! keeps.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub const LOG_FILE_NAME: &str = "gembridge.log";
const MAX_LOG_BYTES: u64 = 2 * 1024 * 1024;

pub struct BridgeLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl BridgeLog {
    /// Open the log in `project_root`, rotating an oversized existing
    /// file to `<name>.old` first.
    pub fn open(project_root: &Path) -> Result<Self> {
        let path = project_root.join(LOG_FILE_NAME);
        rotate_if_oversized(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {:?}", path))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. Log write failures are reported but never fatal
    /// mid-run.
    pub fn append(&self, line: &str) {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{} {}", stamp, line) {
            warn!("Failed to append to bridge log: {}", e);
        }
    }
}

fn rotate_if_oversized(path: &Path) -> Result<()> {
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(()),
    };
    if size > MAX_LOG_BYTES {
        let mut old = path.as_os_str().to_owned();
        old.push(".old");
        std::fs::rename(path, PathBuf::from(&old))
            .with_context(|| format!("failed to rotate log file {:?}", path))?;
    }
    Ok(())
}
