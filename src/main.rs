use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skeepd::cache::SecretCache;
use skeepd::catalog::TokenCatalog;
use skeepd::config::{CacheStrategy, Config, LogTarget};
use skeepd::memcache::MemcacheClient;
use skeepd::server::{AccessPolicy, PidFileGuard, Server, ServerContext};
use skeepd::store::SecretStore;

#[derive(Parser)]
#[command(name = "skeepd")]
#[command(about = "Local secret store daemon serving CMS-encrypted values over a Unix socket")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long)]
    config: PathBuf,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    /// Print the resolved configuration and exit
    #[arg(long)]
    dumpconfig: bool,
}

static RELOAD: AtomicBool = AtomicBool::new(false);
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(signal: libc::c_int) {
    match signal {
        libc::SIGHUP => RELOAD.store(true, Ordering::SeqCst),
        libc::SIGTERM | libc::SIGINT => SHUTDOWN.store(true, Ordering::SeqCst),
        _ => {}
    }
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGHUP, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn init_logging(config: &Config, debug: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    match config.app.log {
        LogTarget::Console => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
                .init();
            None
        }
        LogTarget::Syslog => {
            // Syslog proper is an external concern; the daemon's own sink
            // for this setting is a non-blocking file appender.
            let _ = std::fs::create_dir_all("/var/log/skeepd");
            let appender =
                tracing_appender::rolling::never("/var/log/skeepd", format!("{}.log", config.namespace));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
                .init();
            Some(guard)
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if cli.dumpconfig {
        print!("{}", config.dump());
        return Ok(());
    }

    let _log_guard = init_logging(&config, cli.debug);
    info!(
        namespace = %config.namespace,
        version = env!("CARGO_PKG_VERSION"),
        "skeepd starting"
    );
    if let Some(path) = &config.app.crypto.openssl {
        info!(
            binary = %path.display(),
            "crypto.openssl is set; using the linked OpenSSL library instead"
        );
    }

    let catalog = TokenCatalog::load(&config.tokens).context("loading token catalogue")?;
    if catalog.is_empty() {
        warn!("no tokens configured; set operations will be refused");
    } else {
        let current = catalog.select_for_encrypt().context("selecting current token")?;
        info!(
            tokens = catalog.len(),
            current = %current.name,
            fingerprint = %current.info.fingerprint,
            not_before = %current.info.not_before,
            "token catalogue loaded"
        );
    }

    let store = SecretStore::open(
        &config.app.storage.dir,
        config.storage_umask().context("storage.umask")?,
    )
    .context("opening persistent store")?;

    let cache = match config.app.cache_strategy {
        CacheStrategy::Preload => SecretCache::preload(&config.namespace),
        CacheStrategy::Memcache => {
            let client = MemcacheClient::new(config.app.memcache.servers.clone());
            SecretCache::memcache(&config.namespace, client)
                .context("initializing shared cache")?
        }
    };

    let ctx = Arc::new(ServerContext {
        namespace: config.namespace.clone(),
        catalog: RwLock::new(catalog),
        store,
        cache,
        access: AccessPolicy {
            read: config.app.access.read,
            write: config.app.access.write,
        },
    });

    if config.app.cache_strategy == CacheStrategy::Preload {
        let catalog = ctx.catalog.read().unwrap();
        let loaded = ctx.cache.warm(&ctx.store, &catalog).context("preloading cache")?;
        info!(loaded, "cache preloaded");
    }

    let server = Server::bind(
        &config.app.server.socket_file,
        config.socket_mode().context("server.socket_mode")?,
        Arc::clone(&ctx),
    )?;
    let _pid_guard = PidFileGuard::create(&config.pid_file())?;
    let _workers = server.spawn_workers(config.app.server.max_servers);
    info!(workers = config.app.server.max_servers, "serving");

    install_signal_handlers();
    while !SHUTDOWN.load(Ordering::SeqCst) {
        if RELOAD.swap(false, Ordering::SeqCst) {
            info!("reload signal received");
            ctx.reload_tokens(&config.tokens);
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    server.cleanup();
    Ok(())
}
