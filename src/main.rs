use anyhow::{Context, Error};
use clap::{Parser, Subcommand};
use pglite_wasi::{Bundle, Pglite, Settings, StatementSplitter, server};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

const DEMO_SCRIPT: &str = r#"

SHOW client_encoding;

CREATE OR REPLACE FUNCTION test_func() RETURNS TEXT AS $$ BEGIN RETURN 'test'; END; $$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION addition (entier1 integer, entier2 integer)
RETURNS integer
LANGUAGE plpgsql
IMMUTABLE
AS '
DECLARE
  resultat integer;
BEGIN
  resultat := entier1 + entier2;
  RETURN resultat;
END ' ;

SELECT test_func();

SELECT now(), current_database(), session_user, current_user;

SELECT addition(40,2);

"#;

#[derive(Parser)]
#[command(name = "pglite", version, about = "PostgreSQL on WASI")]
struct Cli {
    /// Directory holding the unpacked `tmp/` and `dev/` trees.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// External `.tar.gz` bundle instead of the embedded one.
    #[arg(long, global = true)]
    bundle: Option<PathBuf>,
    /// Collect guest output in memory and print it after each statement.
    #[arg(long, global = true)]
    capture: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo script, then read `;`-terminated statements from stdin.
    Repl {
        #[arg(long)]
        no_demo: bool,
    },
    /// Run each argument as one statement.
    Exec { sql: Vec<String> },
    /// Run a file of blank-line separated statements.
    Script { file: PathBuf },
    /// Serve the backend over HTTP.
    Serve {
        #[arg(long, default_value = server::DEFAULT_LISTEN)]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(root) = cli.root {
        settings.root = root;
    }
    if let Some(bundle) = cli.bundle {
        settings.bundle = Bundle::File(bundle);
    }
    if cli.capture {
        settings.capture_output();
    }

    let command = cli.command.unwrap_or(Commands::Repl { no_demo: false });
    if let Commands::Serve { .. } = command {
        settings.capture_output();
    }

    let mut pg = Pglite::start(&settings)
        .await
        .context("failed to start pglite")?;

    match command {
        Commands::Repl { no_demo } => {
            if !no_demo {
                pg.run_script(DEMO_SCRIPT).await?;
                relay(&mut pg);
            }
            repl(&mut pg).await?;
        }
        Commands::Exec { sql } => {
            for stmt in &sql {
                pg.query(stmt).await?;
                relay(&mut pg);
            }
        }
        Commands::Script { file } => {
            let input = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let executed = pg.run_script(&input).await?;
            relay(&mut pg);
            info!(executed, "script finished");
        }
        Commands::Serve { listen } => {
            return server::serve(pg, listen).await;
        }
    }

    pg.close().await?;
    Ok(())
}

async fn repl(pg: &mut Pglite) -> Result<(), Error> {
    let mut splitter = StatementSplitter::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        for stmt in splitter.push(&format!("{line}\n")) {
            pg.query(&stmt).await?;
            relay(pg);
        }
    }

    if splitter.is_pending() {
        warn!("stdin ended before a terminating `;`, submitting the rest as is");
    }
    if let Some(rest) = splitter.finish() {
        pg.query(&rest).await?;
        relay(pg);
    }
    Ok(())
}

/// Prints captured guest output; a no-op when stdio is inherited.
fn relay(pg: &mut Pglite) {
    if let Some(out) = pg.take_output() {
        print!("{}", out.stdout);
        eprint!("{}", out.stderr);
    }
}
