//! Single-instance advisory lock. Acquisition failure means another gateway
//! already owns the team dir.

use std::io::{Seek, Write};
use std::path::Path;

use fs2::FileExt;

use crate::error::GatewayError;
use crate::util::now_iso;

/// Held for the life of the process; the lock releases when dropped.
#[derive(Debug)]
pub struct InstanceLock {
    _file: std::fs::File,
}

pub fn acquire_process_lock(lock_path: &Path) -> Result<InstanceLock, GatewayError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(lock_path)?;
    if file.try_lock_exclusive().is_err() {
        return Err(GatewayError::other(format!(
            "another gateway process is already running (lock={})",
            lock_path.display()
        )));
    }
    file.set_len(0)?;
    file.rewind()?;
    writeln!(file, "pid={} started_at={}", std::process::id(), now_iso())?;
    file.flush()?;
    Ok(InstanceLock { _file: file })
}
