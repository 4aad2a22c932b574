use crate::error::{Error, Result};
use crate::sandbox::Layout;
use flate2::read::GzDecoder;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, info};

#[cfg(feature = "bundled")]
static EMBEDDED: &[u8] = include_bytes!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/assets/pglite-wasi.tar.gz"
));

/// Source of the gzip'd tar image holding `postgres.wasi` and its data directory.
#[derive(Debug, Clone, Default)]
pub enum Bundle {
    #[default]
    Embedded,
    File(PathBuf),
    Bytes(Vec<u8>),
}

impl Bundle {
    pub fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        match self {
            #[cfg(feature = "bundled")]
            Bundle::Embedded => Ok(Cow::Borrowed(EMBEDDED)),
            #[cfg(not(feature = "bundled"))]
            Bundle::Embedded => Err(Error::NoBundle),
            Bundle::File(path) => std::fs::read(path)
                .map(Cow::Owned)
                .map_err(|e| Error::io(path, e)),
            Bundle::Bytes(bytes) => Ok(Cow::Borrowed(bytes)),
        }
    }
}

pub fn is_extracted(root: &Path) -> bool {
    Layout::new(root).marker().exists()
}

/// Extracts the bundle unless a cluster is already present under `root`.
///
/// Returns whether anything was written.
pub fn ensure_extracted(root: &Path, bundle: &Bundle) -> Result<bool> {
    if is_extracted(root) {
        debug!(root = %root.display(), "cluster present, skipping extraction");
        return Ok(false);
    }
    info!(root = %root.display(), "extracting env");
    let bytes = bundle.bytes()?;
    let count = extract(root, &bytes)?;
    info!(entries = count, "extraction finished");
    Ok(true)
}

/// Unpacks a `.tar.gz` image into `root`, returning the number of entries written.
pub fn extract(root: &Path, bytes: &[u8]) -> Result<usize> {
    std::fs::create_dir_all(root).map_err(|e| Error::io(root, e))?;

    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut count = 0;

    let entries = archive.entries().map_err(|e| Error::io(root, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::io(root, e))?;
        let path = entry
            .path()
            .map_err(|e| Error::io(root, e))?
            .into_owned();
        let kind = entry.header().entry_type();

        match kind {
            EntryType::Directory | EntryType::Regular | EntryType::Symlink => {}
            EntryType::XHeader | EntryType::XGlobalHeader => continue,
            other => {
                return Err(Error::UnsupportedEntry {
                    kind: format!("{other:?}"),
                    path,
                });
            }
        }

        let written = entry
            .unpack_in(root)
            .map_err(|e| Error::io(root.join(&path), e))?;
        if !written {
            return Err(Error::UnsafeEntry(path));
        }
        count += 1;
    }

    Ok(count)
}
