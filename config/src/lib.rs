//! Load gateway configuration from an env file and apply it to the process
//! environment with priority: **existing env > file**.
//!
//! The same crate owns the write side: `upsert_env_var` rewrites one key in
//! place (atomic replace), used to persist ACL seeds into `telegram.env`.

mod env_file;

use std::path::Path;
use thiserror::Error;

pub use env_file::{load_env_map, parse_env, upsert_env_var};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("read env file: {0}")]
    Read(std::io::Error),
}

/// Loads the given env file and sets environment variables only for keys that
/// are **not** already set, so the launching environment has highest priority.
/// A missing file is not an error.
pub fn load_and_apply(path: &Path) -> Result<(), LoadError> {
    let map = env_file::load_env_map(path).map_err(LoadError::Read)?;
    for (key, value) in map {
        if std::env::var(&key).is_err() {
            std::env::set_var(&key, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn existing_env_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telegram.env");
        std::fs::write(&path, "CONFIG_TEST_EXISTING=from_file\n").unwrap();
        env::set_var("CONFIG_TEST_EXISTING", "from_env");
        load_and_apply(&path).unwrap();
        assert_eq!(env::var("CONFIG_TEST_EXISTING").as_deref(), Ok("from_env"));
        env::remove_var("CONFIG_TEST_EXISTING");
    }

    #[test]
    fn file_applied_when_env_unset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telegram.env");
        std::fs::write(&path, "CONFIG_TEST_FILE_ONLY=from_file\n").unwrap();
        env::remove_var("CONFIG_TEST_FILE_ONLY");
        load_and_apply(&path).unwrap();
        assert_eq!(env::var("CONFIG_TEST_FILE_ONLY").as_deref(), Ok("from_file"));
        env::remove_var("CONFIG_TEST_FILE_ONLY");
    }

    #[test]
    fn missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_and_apply(&dir.path().join("absent.env")).is_ok());
    }
}
