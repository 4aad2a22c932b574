use crate::archive;
use crate::config::Settings;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bytes written to the random-device shim on every start.
pub const RANDOM_SEED_LEN: usize = 128;

/// Host side of the guest filesystem, rooted at the working directory.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mounted as `/tmp`.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Mounted as `/dev`.
    pub fn dev_dir(&self) -> PathBuf {
        self.root.join("dev")
    }

    pub fn marker(&self) -> PathBuf {
        self.tmp_dir().join("pglite/base/PG_VERSION")
    }

    pub fn wasm_binary(&self) -> PathBuf {
        self.tmp_dir().join("pglite/bin/postgres.wasi")
    }

    pub fn random_device(&self) -> PathBuf {
        self.dev_dir().join("urandom")
    }

    /// Replaces `dev/urandom` with fresh bytes from the OS generator.
    ///
    /// The guest reads its random seed from this file because WASI has no
    /// device nodes.
    pub fn seed_random_device(&self) -> Result<PathBuf> {
        let dev = self.dev_dir();
        create_dir(&dev)?;

        let mut seed = [0u8; RANDOM_SEED_LEN];
        getrandom::fill(&mut seed)?;

        let path = self.random_device();
        std::fs::write(&path, seed).map_err(|e| Error::io(&path, e))?;
        Ok(path)
    }
}

/// Readies the host directories and returns the PostgreSQL WASI binary.
pub fn prepare(settings: &Settings) -> Result<Vec<u8>> {
    let layout = Layout::new(&settings.root);

    archive::ensure_extracted(layout.root(), &settings.bundle)?;
    create_dir(&layout.tmp_dir())?;
    layout.seed_random_device()?;

    let wasm = layout.wasm_binary();
    let bytes = std::fs::read(&wasm).map_err(|e| Error::io(&wasm, e))?;
    debug!(path = %wasm.display(), size = bytes.len(), "loaded wasm binary");
    Ok(bytes)
}

#[cfg(unix)]
fn create_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .map_err(|e| Error::io(path, e))
}

#[cfg(not(unix))]
fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| Error::io(path, e))
}
