// CRIU images directory checks done before handing it to the backend
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const INVENTORY: &str = "inventory.img";

// Every CRIU image starts with two magic words; anything shorter is not an
// image.
const HEADER_LEN: u64 = 8;

pub struct ImageDir {
    path: PathBuf,
}

impl ImageDir {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_dir() {
            return Err(Error::Criu {
                reason: format!("images directory {} not found", path.display()),
            });
        }
        Ok(ImageDir { path })
    }

    /// Fail unless `inventory.img` is present and looks like an image.
    pub fn require_checkpoint(&self) -> Result<()> {
        let inventory = self.path.join(INVENTORY);
        match self.inventory_len() {
            Some(len) if len >= HEADER_LEN => {
                log::debug!("Found {} ({} bytes)", inventory.display(), len);
                Ok(())
            }
            Some(len) => Err(Error::Criu {
                reason: format!("{} is too small ({} bytes)", inventory.display(), len),
            }),
            None => Err(Error::Criu {
                reason: format!("no checkpoint in {}: {} missing", self.path.display(), INVENTORY),
            }),
        }
    }

    fn inventory_len(&self) -> Option<u64> {
        let meta = self.path.join(INVENTORY).metadata().ok()?;
        meta.is_file().then(|| meta.len())
    }
}
