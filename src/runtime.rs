use crate::config::{EngineSettings, OutputMode, Settings};
use crate::error::{Error, Result};
use crate::output::OutputBuffer;
use crate::sandbox::{self, Layout};
use wasmtime::{Config, Engine, Func, Instance, Linker, Memory, Module, Store, Val};
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};
use tracing::{debug, info, warn};

/// Guest address the NUL-terminated SQL text is written to before `interactive_one`.
pub const SQL_OFFSET: usize = 1;

/// Command line seen by the guest. The build reads `--single` as argv[0].
pub const GUEST_ARGS: [&str; 2] = ["--single", "postgres"];

/// Output produced by the guest since the last [`Pglite::take_output`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

struct Capture {
    stdout: OutputBuffer,
    stderr: OutputBuffer,
}

impl Capture {
    fn new(max_bytes: usize) -> Self {
        Self {
            stdout: OutputBuffer::new(max_bytes),
            stderr: OutputBuffer::new(max_bytes),
        }
    }

    fn drain(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: String::from_utf8_lossy(&self.stdout.take().bytes).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr.take().bytes).into_owned(),
        }
    }

    /// Fails when either stream dropped bytes since the last drain.
    fn check(&self) -> Result<()> {
        for (stream, buf) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            let dropped = buf.dropped();
            if dropped > 0 {
                warn!(stream, limit = buf.max_bytes(), dropped, "guest output overflowed");
                return Err(Error::OutputOverflow {
                    stream,
                    limit: buf.max_bytes(),
                    dropped,
                });
            }
        }
        Ok(())
    }
}

/// A running PostgreSQL backend inside a WASI sandbox.
pub struct Pglite {
    store: Store<WasiP1Ctx>,
    instance: Instance,
    memory: Memory,
    interactive_one: Func,
    capture: Option<Capture>,
    initdb_status: i32,
    exit_code: Option<i32>,
}

impl Pglite {
    /// Unpacks the environment if needed, boots the module and initialises the cluster.
    pub async fn start(settings: &Settings) -> Result<Self> {
        let wasm = sandbox::prepare(settings)?;
        let engine = build_engine(&settings.engine)?;
        let module = Module::new(&engine, &wasm).map_err(|e| Error::from_wasm("compile", e))?;
        Self::boot(&engine, &module, settings).await
    }

    async fn boot(engine: &Engine, module: &Module, settings: &Settings) -> Result<Self> {
        let mut linker: Linker<WasiP1Ctx> = Linker::new(engine);
        wasmtime_wasi::p1::add_to_linker_async(&mut linker, |cx| cx)
            .map_err(|e| Error::from_wasm("link", e))?;

        let layout = Layout::new(&settings.root);
        let mut builder = WasiCtxBuilder::new();
        builder
            .args(&GUEST_ARGS)
            .env("ENVIRONMENT", "wasi-embed")
            .env("REPL", "N")
            .env("PGUSER", &settings.user)
            .env("PGDATABASE", &settings.database);
        builder
            .preopened_dir(layout.tmp_dir(), "/tmp", DirPerms::all(), FilePerms::all())
            .map_err(|e| Error::from_wasm("mount /tmp", e))?;
        builder
            .preopened_dir(layout.dev_dir(), "/dev", DirPerms::all(), FilePerms::all())
            .map_err(|e| Error::from_wasm("mount /dev", e))?;

        let capture = match settings.output {
            OutputMode::Inherit => {
                builder.inherit_stdout().inherit_stderr();
                None
            }
            OutputMode::Capture { max_bytes } => {
                let capture = Capture::new(max_bytes);
                builder
                    .stdout(capture.stdout.clone())
                    .stderr(capture.stderr.clone());
                Some(capture)
            }
        };

        let mut store = Store::new(engine, builder.build_p1());
        if let Some(interval) = settings.engine.fuel_yield_interval {
            store
                .set_fuel(u64::MAX)
                .map_err(|e| Error::from_wasm("fuel", e))?;
            store
                .fuel_async_yield_interval(Some(interval))
                .map_err(|e| Error::from_wasm("fuel", e))?;
        }

        let instance = linker
            .instantiate_async(&mut store, module)
            .await
            .map_err(|e| Error::from_wasm("instantiate", e))?;

        run_entry_point(&mut store, &instance).await?;

        let initdb = call_export(&mut store, &instance, "pg_initdb").await?;
        let initdb_status = initdb.first().and_then(Val::i32).unwrap_or(0);
        info!("initdb returned: {initdb_status:b}");

        call_export(&mut store, &instance, "use_socketfile").await?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or(Error::MissingExport("memory"))?;
        let interactive_one = instance
            .get_func(&mut store, "interactive_one")
            .ok_or(Error::MissingExport("interactive_one"))?;

        if let Some(capture) = &capture {
            capture.check()?;
        }

        Ok(Self {
            store,
            instance,
            memory,
            interactive_one,
            capture,
            initdb_status,
            exit_code: None,
        })
    }

    /// Submits one SQL statement. Results are printed by the guest on stderr.
    pub async fn query(&mut self, sql: &str) -> Result<()> {
        if self.exit_code.is_some() {
            return Err(Error::Closed);
        }
        if let Some(pos) = sql.bytes().position(|b| b == 0) {
            return Err(Error::InteriorNul(pos));
        }

        let mut cstring = Vec::with_capacity(sql.len() + 1);
        cstring.extend_from_slice(sql.as_bytes());
        cstring.push(0);

        let capacity = self
            .memory
            .data_size(&self.store)
            .saturating_sub(SQL_OFFSET);
        if cstring.len() > capacity {
            return Err(Error::SqlTooLarge {
                len: sql.len(),
                capacity,
            });
        }
        self.memory
            .write(&mut self.store, SQL_OFFSET, &cstring)
            .map_err(|e| Error::from_wasm("write sql", e.into()))?;

        let mut results = result_slots(&self.store, &self.interactive_one);
        let call = self
            .interactive_one
            .call_async(&mut self.store, &[], &mut results)
            .await;
        if let Err(e) = call {
            let err = Error::from_wasm("interactive_one", e);
            if let Some(code) = err.exit_code() {
                warn!(code, "backend exited");
                self.exit_code = Some(code);
            }
            return Err(err);
        }
        match &self.capture {
            Some(capture) => capture.check(),
            None => Ok(()),
        }
    }

    /// Runs a script of blank-line separated statements, stopping at the first failure.
    pub async fn run_script(&mut self, input: &str) -> Result<usize> {
        let mut executed = 0;
        for chunk in input.split("\n\n") {
            let trimmed = chunk.trim();
            if trimmed.is_empty() {
                continue;
            }
            info!("REPL: {trimmed}");
            self.query(trimmed).await?;
            executed += 1;
        }
        Ok(executed)
    }

    /// Output written since the previous call; `None` when stdio is inherited.
    ///
    /// Draining frees the capture buffers, so the output limit applies between
    /// two calls rather than over the whole session.
    pub fn take_output(&mut self) -> Option<CapturedOutput> {
        self.capture.as_ref().map(Capture::drain)
    }

    /// Status bitmask returned by `pg_initdb`.
    pub fn initdb_status(&self) -> i32 {
        self.initdb_status
    }

    pub fn is_exited(&self) -> bool {
        self.exit_code.is_some()
    }

    /// Flushes the backend when the build supports it and releases the sandbox.
    pub async fn close(mut self) -> Result<()> {
        if self.exit_code.is_some() {
            return Ok(());
        }
        if self.instance.get_func(&mut self.store, "pg_shutdown").is_some() {
            call_export(&mut self.store, &self.instance, "pg_shutdown").await?;
        }
        debug!("backend closed");
        Ok(())
    }
}

fn build_engine(settings: &EngineSettings) -> Result<Engine> {
    let mut config = Config::new();
    config.async_support(true);
    config.consume_fuel(settings.fuel_yield_interval.is_some());

    if settings.tune_defaults {
        config.memory_guard_size(65536);
        config.memory_reservation(0);
        config.memory_reservation_for_growth(1048576);
    }
    if let Some(v) = settings.memory_guard_size {
        config.memory_guard_size(v);
    }
    if let Some(v) = settings.memory_reservation {
        config.memory_reservation(v);
    }
    if let Some(v) = settings.memory_reservation_for_growth {
        config.memory_reservation_for_growth(v);
    }

    Engine::new(&config).map_err(|e| Error::from_wasm("engine", e))
}

/// Runs the WASI command entry point. A clean `proc_exit(0)` leaves the instance usable.
async fn run_entry_point(store: &mut Store<WasiP1Ctx>, instance: &Instance) -> Result<()> {
    let name = if instance.get_func(&mut *store, "_initialize").is_some() {
        "_initialize"
    } else if instance.get_func(&mut *store, "_start").is_some() {
        "_start"
    } else {
        return Ok(());
    };

    match call_export(store, instance, name).await {
        Err(Error::Exit { code: 0, .. }) => Ok(()),
        Err(Error::Exit { code, .. }) => Err(Error::Exit { op: name, code }),
        other => other.map(|_| ()),
    }
}

async fn call_export(
    store: &mut Store<WasiP1Ctx>,
    instance: &Instance,
    name: &'static str,
) -> Result<Vec<Val>> {
    let func = instance
        .get_func(&mut *store, name)
        .ok_or(Error::MissingExport(name))?;
    let mut results = result_slots(store, &func);
    func.call_async(&mut *store, &[], &mut results)
        .await
        .map_err(|e| Error::from_wasm(name, e))?;
    Ok(results)
}

fn result_slots(store: &Store<WasiP1Ctx>, func: &Func) -> Vec<Val> {
    vec![Val::I32(0); func.ty(store).results().len()]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::archive::Bundle;
    use crate::archive::tests::{Item, make_tgz};
    use tempfile::TempDir;

    /// A stand-in for `postgres.wasi` speaking the same export protocol.
    ///
    /// `interactive_one` echoes the C string at address 1 to stdout and the
    /// `pg_initdb`/`use_socketfile`/`pg_shutdown` calls announce themselves on
    /// stderr. SQL starting with `X` exits with code 3, `T` traps, `Q` exits cleanly.
    pub(crate) fn fake_postgres(start_exit: i32) -> Vec<u8> {
        fake_guest(start_exit, None)
    }

    /// Like [`fake_postgres`], optionally exporting an `_initialize` that prints
    /// `init` and then exits with the given code when it is non-zero.
    pub(crate) fn fake_guest(start_exit: i32, initialize_exit: Option<i32>) -> Vec<u8> {
        let initialize = match initialize_exit {
            None => String::new(),
            Some(0) => r#"(func (export "_initialize")
    (call $write (i32.const 2) (i32.const 4144) (i32.const 5)))"#
                .to_owned(),
            Some(code) => format!(
                r#"(func (export "_initialize")
    (call $write (i32.const 2) (i32.const 4144) (i32.const 5))
    (call $proc_exit (i32.const {code})))"#
            ),
        };
        let wat = format!(
            r#"(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit"
    (func $proc_exit (param i32)))

  (memory 1)
  (export "memory" (memory 0))

  (data (i32.const 4096) "initdb\n")
  (data (i32.const 4112) "socketfile\n")
  (data (i32.const 4128) "shutdown\n")
  (data (i32.const 4144) "init\n")

  (func $write (param $fd i32) (param $ptr i32) (param $len i32)
    (i32.store (i32.const 8192) (local.get $ptr))
    (i32.store (i32.const 8196) (local.get $len))
    (drop (call $fd_write (local.get $fd) (i32.const 8192) (i32.const 1) (i32.const 8200))))

  (func $strlen (param $ptr i32) (result i32)
    (local $n i32)
    (block $done
      (loop $scan
        (br_if $done
          (i32.eqz (i32.load8_u (i32.add (local.get $ptr) (local.get $n)))))
        (local.set $n (i32.add (local.get $n) (i32.const 1)))
        (br $scan)))
    (local.get $n))

  (func (export "_start")
    (call $proc_exit (i32.const {start_exit})))

  {initialize}

  (func (export "pg_initdb") (result i32)
    (call $write (i32.const 2) (i32.const 4096) (i32.const 7))
    (i32.const 14))

  (func (export "use_socketfile")
    (call $write (i32.const 2) (i32.const 4112) (i32.const 11)))

  (func (export "pg_shutdown")
    (call $write (i32.const 2) (i32.const 4128) (i32.const 9)))

  (func (export "interactive_one")
    (if (i32.eq (i32.load8_u (i32.const 1)) (i32.const 88))
      (then (call $proc_exit (i32.const 3))))
    (if (i32.eq (i32.load8_u (i32.const 1)) (i32.const 81))
      (then (call $proc_exit (i32.const 0))))
    (if (i32.eq (i32.load8_u (i32.const 1)) (i32.const 84))
      (then (unreachable)))
    (call $write (i32.const 1) (i32.const 1) (call $strlen (i32.const 1))))
)"#
        );
        wat::parse_str(&wat).expect("wat parse")
    }

    pub(crate) fn fake_settings(root: &TempDir, wasm: &[u8]) -> Settings {
        let tgz = make_tgz(&[
            Item::Dir("tmp/pglite/base"),
            Item::File("tmp/pglite/base/PG_VERSION", b"17\n"),
            Item::File("tmp/pglite/bin/postgres.wasi", wasm),
        ]);
        let mut settings = Settings {
            root: root.path().to_path_buf(),
            bundle: Bundle::Bytes(tgz),
            ..Settings::default()
        };
        settings.capture_output();
        settings
    }

    #[tokio::test]
    async fn test_start_runs_handshake() {
        let root = tempfile::tempdir().unwrap();
        let mut pg = Pglite::start(&fake_settings(&root, &fake_postgres(0)))
            .await
            .expect("start");

        assert_eq!(pg.initdb_status(), 14);
        let out = pg.take_output().expect("captured");
        assert_eq!(out.stderr, "initdb\nsocketfile\n");
        assert_eq!(out.stdout, "");

        assert!(Layout::new(root.path()).random_device().is_file());
    }

    #[tokio::test]
    async fn test_query_writes_nul_terminated_sql() {
        let root = tempfile::tempdir().unwrap();
        let mut pg = Pglite::start(&fake_settings(&root, &fake_postgres(0)))
            .await
            .expect("start");
        pg.take_output();

        pg.query("SELECT addition(40,2);").await.expect("query");
        assert_eq!(pg.take_output().unwrap().stdout, "SELECT addition(40,2);");

        // A shorter statement must not leak the tail of the previous one.
        pg.query("S").await.expect("query");
        assert_eq!(pg.take_output().unwrap().stdout, "S");
    }

    #[tokio::test]
    async fn test_nonzero_start_exit_fails() {
        let root = tempfile::tempdir().unwrap();
        let err = Pglite::start(&fake_settings(&root, &fake_postgres(7)))
            .await
            .err()
            .expect("start should fail");
        assert!(matches!(err, Error::Exit { op: "_start", code: 7 }));
    }

    #[tokio::test]
    async fn test_initialize_is_preferred_over_start() {
        let root = tempfile::tempdir().unwrap();
        // `_start` would exit with 7; it must not run.
        let mut pg = Pglite::start(&fake_settings(&root, &fake_guest(7, Some(0))))
            .await
            .expect("start");
        assert_eq!(pg.take_output().unwrap().stderr, "init\ninitdb\nsocketfile\n");
    }

    #[tokio::test]
    async fn test_nonzero_initialize_exit_is_named() {
        let root = tempfile::tempdir().unwrap();
        let err = Pglite::start(&fake_settings(&root, &fake_guest(0, Some(5))))
            .await
            .err()
            .expect("start should fail");
        assert!(matches!(err, Error::Exit { op: "_initialize", code: 5 }));
        assert_eq!(err.to_string(), "_initialize: wasm exit_code: 5");
    }

    #[tokio::test]
    async fn test_close_calls_pg_shutdown() {
        let root = tempfile::tempdir().unwrap();
        let mut pg = Pglite::start(&fake_settings(&root, &fake_postgres(0)))
            .await
            .expect("start");
        pg.take_output();
        let stderr = pg.capture.as_ref().unwrap().stderr.clone();

        pg.close().await.expect("close");
        assert_eq!(stderr.take().bytes, b"shutdown\n");
    }

    #[tokio::test]
    async fn test_close_after_exit_skips_pg_shutdown() {
        let root = tempfile::tempdir().unwrap();
        let mut pg = Pglite::start(&fake_settings(&root, &fake_postgres(0)))
            .await
            .expect("start");
        pg.query("X").await.unwrap_err();
        pg.take_output();
        let stderr = pg.capture.as_ref().unwrap().stderr.clone();

        pg.close().await.expect("close");
        assert!(stderr.take().bytes.is_empty());
    }

    #[tokio::test]
    async fn test_output_limit_applies_per_drain() {
        let root = tempfile::tempdir().unwrap();
        let mut settings = fake_settings(&root, &fake_postgres(0));
        settings.output = OutputMode::Capture { max_bytes: 64 };
        let mut pg = Pglite::start(&settings).await.expect("start");
        pg.take_output();

        // 180 bytes in total, never more than 18 between drains.
        for _ in 0..10 {
            pg.query("SELECT 1234567890;").await.expect("query");
            assert_eq!(pg.take_output().unwrap().stdout, "SELECT 1234567890;");
        }
    }

    #[tokio::test]
    async fn test_output_overflow_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let mut settings = fake_settings(&root, &fake_postgres(0));
        settings.output = OutputMode::Capture { max_bytes: 64 };
        let mut pg = Pglite::start(&settings).await.expect("start");
        pg.take_output();

        let sql = "y".repeat(100);
        let err = pg.query(&sql).await.unwrap_err();
        assert!(matches!(
            err,
            Error::OutputOverflow {
                stream: "stdout",
                limit: 64,
                dropped: 36
            }
        ));
        assert_eq!(pg.take_output().unwrap().stdout, &sql[..64]);

        // The backend is still usable once drained.
        assert!(!pg.is_exited());
        pg.query("SELECT 1;").await.expect("query after overflow");
        assert_eq!(pg.take_output().unwrap().stdout, "SELECT 1;");
    }

    #[tokio::test]
    async fn test_exit_during_query_closes_backend() {
        let root = tempfile::tempdir().unwrap();
        let mut pg = Pglite::start(&fake_settings(&root, &fake_postgres(0)))
            .await
            .expect("start");

        let err = pg.query("X marks the spot").await.unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert!(pg.is_exited());
        assert!(matches!(pg.query("SELECT 1").await, Err(Error::Closed)));
        pg.close().await.expect("close after exit");
    }

    #[tokio::test]
    async fn test_clean_exit_during_query_is_still_an_error() {
        let root = tempfile::tempdir().unwrap();
        let mut pg = Pglite::start(&fake_settings(&root, &fake_postgres(0)))
            .await
            .expect("start");

        let err = pg.query("Quit").await.unwrap_err();
        assert_eq!(err.exit_code(), Some(0));
        assert!(pg.is_exited());
    }

    #[tokio::test]
    async fn test_trap_is_surfaced() {
        let root = tempfile::tempdir().unwrap();
        let mut pg = Pglite::start(&fake_settings(&root, &fake_postgres(0)))
            .await
            .expect("start");

        let err = pg.query("TRAP").await.unwrap_err();
        assert!(matches!(err, Error::Wasm { op: "interactive_one", .. }));
        assert!(!pg.is_exited());
    }

    #[tokio::test]
    async fn test_rejects_unrepresentable_sql() {
        let root = tempfile::tempdir().unwrap();
        let mut pg = Pglite::start(&fake_settings(&root, &fake_postgres(0)))
            .await
            .expect("start");

        assert!(matches!(
            pg.query("SELECT 1\0; DROP TABLE t").await,
            Err(Error::InteriorNul(8))
        ));

        let huge = "x".repeat(70_000);
        assert!(matches!(
            pg.query(&huge).await,
            Err(Error::SqlTooLarge { len: 70_000, .. })
        ));
    }

    #[tokio::test]
    async fn test_run_script_splits_on_blank_lines() {
        let root = tempfile::tempdir().unwrap();
        let mut pg = Pglite::start(&fake_settings(&root, &fake_postgres(0)))
            .await
            .expect("start");
        pg.take_output();

        let script = "\n\nSHOW client_encoding;\n\n\n\n  SELECT 1;\nSELECT 2;\n\n   \n\n";
        let executed = pg.run_script(script).await.expect("script");
        assert_eq!(executed, 2);
        assert_eq!(
            pg.take_output().unwrap().stdout,
            "SHOW client_encoding;SELECT 1;\nSELECT 2;"
        );
    }

    #[tokio::test]
    async fn test_run_script_stops_at_first_failure() {
        let root = tempfile::tempdir().unwrap();
        let mut pg = Pglite::start(&fake_settings(&root, &fake_postgres(0)))
            .await
            .expect("start");
        pg.take_output();

        let err = pg
            .run_script("SELECT 1;\n\nX;\n\nSELECT 2;")
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(pg.take_output().unwrap().stdout, "SELECT 1;");
    }

    #[tokio::test]
    async fn test_restart_reuses_extracted_cluster() {
        let root = tempfile::tempdir().unwrap();
        let settings = fake_settings(&root, &fake_postgres(0));
        Pglite::start(&settings)
            .await
            .expect("first start")
            .close()
            .await
            .expect("close");

        let second = Settings {
            bundle: Bundle::Bytes(b"corrupt".to_vec()),
            ..settings
        };
        let pg = Pglite::start(&second).await.expect("second start");
        assert_eq!(pg.initdb_status(), 14);
    }

    #[tokio::test]
    async fn test_inherit_mode_has_no_captured_output() {
        let root = tempfile::tempdir().unwrap();
        let mut settings = fake_settings(&root, &fake_postgres(0));
        settings.output = OutputMode::Inherit;
        settings.engine.fuel_yield_interval = None;

        let mut pg = Pglite::start(&settings).await.expect("start");
        assert!(pg.take_output().is_none());
    }

    #[tokio::test]
    async fn test_missing_protocol_export() {
        let root = tempfile::tempdir().unwrap();
        let wasm = wat::parse_str(
            r#"(module
  (memory 1)
  (export "memory" (memory 0))
  (func (export "pg_initdb") (result i32) (i32.const 0)))"#,
        )
        .unwrap();

        let err = Pglite::start(&fake_settings(&root, &wasm))
            .await
            .err()
            .expect("start should fail");
        assert!(matches!(err, Error::MissingExport("use_socketfile")));
    }
}
