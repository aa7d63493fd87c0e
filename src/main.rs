//! `gs`, a command line client for GemStone/S.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use gemstalker::config::{Config, LoginConfig};
use gemstalker::exec::{CancelToken, Outcome, ProgressSink};
use gemstalker::gci::{Gci, GciLibrary, GemSession, SessionRegistry, DEFAULT_ENV};
use gemstalker::query::QueryFacade;
use gemstalker::version::{self, Version};
use std::cell::Cell;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file, `~/.config/gemstalker/config.toml` by default.
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the thread-safe GCI library.
    #[clap(long, env = "GS_LIBRARY", global = true)]
    library: Option<PathBuf>,

    #[clap(long, global = true)]
    stone: Option<String>,

    #[clap(long, global = true)]
    gem: Option<String>,

    #[clap(short, long, global = true)]
    user: Option<String>,

    #[clap(long, env = "GS_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    #[clap(long, global = true)]
    host_user: Option<String>,

    #[clap(long, env = "GS_HOST_PASSWORD", hide_env_values = true, global = true)]
    host_password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print client, library and supported VM versions.
    Version,
    /// Execute Smalltalk source and print the result.
    Exec {
        source: String,
    },
    /// Resolve a global name.
    Resolve {
        name: String,
    },
    /// Compile the method in `file` into `class`.
    Compile {
        class: String,
        file: PathBuf,
        #[clap(long, default_value = "as yet unclassified")]
        category: String,
        #[clap(long, default_value_t = DEFAULT_ENV)]
        env: u16,
        /// Commit the transaction after compiling.
        #[clap(long)]
        commit: bool,
    },
}

impl Args {
    fn login(&self, config: &Config) -> LoginConfig {
        let cli = LoginConfig {
            stone: self.stone.clone().unwrap_or_default(),
            gem: self.gem.clone().unwrap_or_default(),
            username: self.user.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
            host_username: self.host_user.clone(),
            host_password: self.host_password.clone(),
        };
        config.login.clone().merge(cli)
    }
}

/// Elapsed time of a long call on stderr.
#[derive(Default)]
struct StderrProgress {
    reported_secs: Cell<u64>,
}

impl ProgressSink for StderrProgress {
    fn start(&self, title: &str) {
        eprintln!("{title} (Ctrl-C to interrupt)");
    }

    fn update(&self, elapsed: Duration) {
        let secs = elapsed.as_secs();
        if secs != self.reported_secs.replace(secs) {
            eprint!("\r{secs}s");
            _ = std::io::stderr().flush();
        }
    }

    fn end(&self) {
        eprintln!();
    }
}

fn main() -> anyhow::Result<()> {
    let logger = env_logger::Logger::from_default_env();
    let filter = logger.filter();
    gemstalker::log::LOGGER_SWITCHER.switch(logger, filter);

    let args = Args::parse();
    let config = Config::from_file(args.config.as_deref()).unwrap_or_default();

    let library_path = GciLibrary::locate(args.library.as_deref().or(config.library.as_deref()));
    let library = GciLibrary::load(&library_path)
        .with_context(|| format!("load GCI library {}", library_path.display()))?;

    if let Command::Version = args.command {
        print_version(&library);
        return Ok(());
    }

    let registry = SessionRegistry::new(Arc::new(library));
    let session = registry
        .login(&args.login(&config).to_params())
        .context("login")?;
    let result = run(&args.command, session, &config);
    registry.logout_all();
    result
}

fn print_version(library: &GciLibrary) {
    println!("gs {}", env!("CARGO_PKG_VERSION"));
    let vm_version = library.version();
    let supported = match Version::parse(&vm_version) {
        Some(v) if version::probe(&v) => "supported",
        Some(_) => "not supported",
        None => "unknown",
    };
    println!("GCI library {}: {vm_version} ({supported})", library.path().display());
    println!("supported VM versions: {}", version::supported_versions_to_string());
}

fn run(command: &Command, session: Arc<GemSession>, config: &Config) -> anyhow::Result<()> {
    let query = QueryFacade::new(session).with_poll_config(config.poll.clone());
    match command {
        Command::Version => {}
        Command::Exec { source } => exec(&query, source)?,
        Command::Resolve { name } => {
            let oop = query.resolve_class(name)?;
            println!("{oop:?} {}", query.print_string(oop)?);
        }
        Command::Compile {
            class,
            file,
            category,
            env,
            commit,
        } => {
            let source = std::fs::read_to_string(file)
                .with_context(|| format!("read {}", file.display()))?;
            let class_oop = query.resolve_class(class)?;
            let method = query.compile_method(class_oop, &source, category, *env)?;
            println!("compiled {method:?} into {class}");
            if *commit && !query.session().commit()? {
                bail!("commit failed");
            }
        }
    }
    Ok(())
}

/// Execute with progress on stderr. The first Ctrl-C sends a soft break, the second a hard one.
fn exec(query: &QueryFacade, source: &str) -> anyhow::Result<()> {
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            let kind = if cancel.cancel() == 1 { "soft" } else { "hard" };
            eprintln!("\n{kind} break requested");
        })
        .context("install Ctrl-C handler")?;
    }

    match query.execute_source_nb(source, cancel, &StderrProgress::default())? {
        Outcome::Ready(result) => {
            println!("{}", query.print_string(result)?);
            Ok(())
        }
        Outcome::Failed(e) => {
            if let Some(process) = e.debuggable_context() {
                eprintln!("stopped in process {process:?}, clearing its stack");
            }
            query.discard(&e);
            Err(e.into())
        }
        Outcome::Cancelled { drained } => {
            if !drained {
                eprintln!("the cancelled call is still running, its result is abandoned");
            }
            bail!("execution cancelled")
        }
    }
}
