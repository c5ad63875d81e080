//! WAL checkpoints and timestamped online backups.

use std::path::{Path, PathBuf};

use rusqlite::backup::Backup;
use rusqlite::Connection;
use tracing::{info, warn};

use arena_core::error::{Error, Result};

use crate::{map_err, Store};

const KEEP_BACKUPS: usize = 24;

impl Store {
    /// Force a WAL checkpoint.  No-op for in-memory stores.
    pub async fn wal_checkpoint(&self) -> Result<()> {
        if self.path.is_none() {
            return Ok(());
        }
        self.with_conn(|conn| {
            // The checkpoint pragma returns a result row; discard it.
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                .map_err(map_err)
        })
        .await
    }

    /// Copy the live database into `dir` with a timestamped name, keeping
    /// only the newest [`KEEP_BACKUPS`] files.
    pub async fn backup_to(&self, dir: &Path) -> Result<PathBuf> {
        if self.path.is_none() {
            return Err(Error::StorageError("cannot back up in-memory store".into()));
        }
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::StorageError(format!("create backup dir: {}", e)))?;
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let target = dir.join(format!("arena-{}.db", stamp));

        let conn = self.conn.lock().await;
        let mut dst = Connection::open(&target).map_err(map_err)?;
        {
            let backup = Backup::new(&*conn, &mut dst).map_err(map_err)?;
            backup
                .run_to_completion(64, std::time::Duration::from_millis(5), None)
                .map_err(map_err)?;
        }
        drop(conn);
        info!(path = %target.display(), "database backup written");

        prune_backups(dir);
        Ok(target)
    }
}

fn prune_backups(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut backups: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("arena-") && n.ends_with(".db"))
                .unwrap_or(false)
        })
        .collect();
    backups.sort();
    while backups.len() > KEEP_BACKUPS {
        let oldest = backups.remove(0);
        if let Err(e) = std::fs::remove_file(&oldest) {
            warn!(path = %oldest.display(), error = %e, "failed to prune backup");
        }
    }
}
