use std::path::PathBuf;
use wasmtime_wasi::I32Exit;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no bundle available (build with the `bundled` feature or set PGLITE_BUNDLE)")]
    NoBundle,

    #[error("unsupported entry type in bundle: {kind} ({})", path.display())]
    UnsupportedEntry { kind: String, path: PathBuf },

    #[error("bundle entry escapes the extraction root: {}", .0.display())]
    UnsafeEntry(PathBuf),

    #[error("failed to gather entropy: {0}")]
    Entropy(#[from] getrandom::Error),

    #[error("module does not export `{0}`")]
    MissingExport(&'static str),

    #[error("{op}: wasm exit_code: {code}")]
    Exit { op: &'static str, code: i32 },

    #[error("{op}: {source}")]
    Wasm {
        op: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("sql contains a NUL byte at position {0}")]
    InteriorNul(usize),

    #[error("sql of {len} bytes does not fit in {capacity} bytes of guest memory")]
    SqlTooLarge { len: usize, capacity: usize },

    #[error("backend has exited")]
    Closed,

    #[error("guest {stream} overflowed {limit} bytes, {dropped} bytes dropped")]
    OutputOverflow {
        stream: &'static str,
        limit: usize,
        dropped: usize,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Sorts a wasmtime failure into a WASI exit or a plain trap.
    pub(crate) fn from_wasm(op: &'static str, err: wasmtime::Error) -> Self {
        if let Some(exit) = err.downcast_ref::<I32Exit>() {
            return Error::Exit { op, code: exit.0 };
        }
        Error::Wasm {
            op,
            source: err.into(),
        }
    }

    /// The exit code when the guest called `proc_exit`.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }
}
