use crate::archive::Bundle;
use std::path::PathBuf;

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 << 20;
pub const DEFAULT_FUEL_YIELD_INTERVAL: u64 = 10_000;

/// Where the guest's stdout and stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Inherit,
    Capture { max_bytes: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub tune_defaults: bool,
    pub memory_guard_size: Option<u64>,
    pub memory_reservation: Option<u64>,
    pub memory_reservation_for_growth: Option<u64>,
    /// `None` turns fuel metering off.
    pub fuel_yield_interval: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tune_defaults: true,
            memory_guard_size: None,
            memory_reservation: None,
            memory_reservation_for_growth: None,
            fuel_yield_interval: Some(DEFAULT_FUEL_YIELD_INTERVAL),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub root: PathBuf,
    pub bundle: Bundle,
    pub user: String,
    pub database: String,
    pub output: OutputMode,
    /// Capture capacity per stream between two drains, used by [`Settings::capture_output`].
    pub max_output_bytes: usize,
    pub engine: EngineSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            bundle: Bundle::Embedded,
            user: "postgres".to_owned(),
            database: "postgres".to_owned(),
            output: OutputMode::Inherit,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            engine: EngineSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(root) = lookup("PGLITE_ROOT") {
            settings.root = PathBuf::from(root);
        }
        if let Some(path) = lookup("PGLITE_BUNDLE") {
            settings.bundle = Bundle::File(PathBuf::from(path));
        }
        if let Some(user) = lookup("PGLITE_USER") {
            settings.user = user;
        }
        if let Some(database) = lookup("PGLITE_DATABASE") {
            settings.database = database;
        }

        if let Some(max_bytes) =
            lookup("PGLITE_MAX_OUTPUT_BYTES").and_then(|v| v.parse::<usize>().ok())
        {
            settings.max_output_bytes = max_bytes;
        }
        let capture = lookup("PGLITE_CAPTURE_OUTPUT")
            .as_deref()
            .map(truthy)
            .unwrap_or(false);
        if capture {
            settings.capture_output();
        }

        let engine = &mut settings.engine;
        engine.tune_defaults = lookup("PGLITE_WASMTIME_TUNE_DEFAULTS")
            .as_deref()
            .map(truthy)
            .unwrap_or(true);
        engine.memory_guard_size = lookup("PGLITE_WASMTIME_MEMORY_GUARD_SIZE")
            .and_then(|v| v.parse::<u64>().ok());
        engine.memory_reservation = lookup("PGLITE_WASMTIME_MEMORY_RESERVATION")
            .and_then(|v| v.parse::<u64>().ok());
        engine.memory_reservation_for_growth =
            lookup("PGLITE_WASMTIME_MEMORY_RESERVATION_FOR_GROWTH")
                .and_then(|v| v.parse::<u64>().ok());
        if let Some(interval) = lookup("PGLITE_FUEL_YIELD_INTERVAL")
            .and_then(|v| v.parse::<u64>().ok())
        {
            engine.fuel_yield_interval = (interval > 0).then_some(interval);
        }

        settings
    }

    /// Switches to in-memory output buffers of `max_output_bytes`, keeping an
    /// existing capture capacity.
    pub fn capture_output(&mut self) {
        if self.output == OutputMode::Inherit {
            self.output = OutputMode::Capture {
                max_bytes: self.max_output_bytes,
            };
        }
    }
}

fn truthy(v: &str) -> bool {
    !matches!(v, "0" | "false" | "FALSE" | "no" | "NO")
}
