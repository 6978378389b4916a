//! Per-operation scratch directories
//!
//! Each flatten/merge operation writes intermediate files under
//! `<root>/<operation-id>/`. The directory is owned by a [`ScratchSpace`]
//! and removed when it is dropped, on success and on every error path.

use crate::error::PdfJoinError;
use shared_types::OperationId;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[derive(Debug)]
pub struct ScratchSpace {
    operation_id: OperationId,
    dir: TempDir,
    files: Vec<PathBuf>,
}

impl ScratchSpace {
    /// Create `<root>/<operation_id>/`, creating `root` if needed
    pub fn new(root: &Path, operation_id: OperationId) -> Result<Self, PdfJoinError> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&operation_id.to_string())
            .rand_bytes(0)
            .tempdir_in(root)?;
        tracing::debug!("Created scratch space: {}", dir.path().display());
        Ok(Self {
            operation_id,
            dir,
            files: Vec::new(),
        })
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `bytes` to a file named `name` inside the scratch directory
    pub fn write(&mut self, name: &str, bytes: &[u8]) -> Result<PathBuf, PdfJoinError> {
        let path = self.dir.path().join(name);
        fs::write(&path, bytes)?;
        self.files.push(path.clone());
        Ok(path)
    }

    /// Files written so far, in write order
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Read back every written file, in write order
    pub fn read_all(&self) -> Result<Vec<Vec<u8>>, PdfJoinError> {
        self.files
            .iter()
            .map(|p| fs::read(p).map_err(PdfJoinError::from))
            .collect()
    }

    /// Remove the directory now, surfacing any I/O error
    pub fn close(self) -> Result<(), PdfJoinError> {
        self.dir.close()?;
        Ok(())
    }
}
