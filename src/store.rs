//! Persistent client state under the configured base store path.
//!
//! The only item the core itself persists is `cookie.txt`, rewritten on
//! every SessionSetupResponse; DRM engines may keep their own files next
//! to it.

use log::{debug, warn};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const COOKIE_FILE: &str = "cookie.txt";

/// Simple named-blob store rooted at a directory.
#[derive(Debug, Clone)]
pub struct DataStore {
    base_path: PathBuf,
}

impl DataStore {
    pub fn new(base_path: &Path) -> Self {
        DataStore {
            base_path: base_path.to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Read an item; missing files read as empty.
    pub fn get_data(&self, name: &str) -> Vec<u8> {
        match fs::read(self.base_path.join(name)) {
            Ok(data) => data,
            Err(error) => {
                if error.kind() != io::ErrorKind::NotFound {
                    warn!("Cannot read {}: {}", name, error);
                }
                Vec::new()
            }
        }
    }

    /// Write an item, creating the base directory when needed. Empty data
    /// still writes (an empty cookie clears the stored one).
    pub fn set_data(&self, name: &str, data: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.base_path)?;
        let path = self.base_path.join(name);
        debug!("Storing {} ({} bytes)", name, data.len());
        fs::write(path, data)
    }
}
