// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};

use proxenet::ca::CertificateAuthority;
use proxenet::config::{self, IpVersion};
use proxenet::plugin::{InterpreterRegistry, PluginChain};
use proxenet::proxy;
use proxenet::tls::TlsContexts;

#[derive(Parser, Debug)]
#[command(name = "proxenet", version, about)]
struct Args {
    /// Maximum number of concurrently served clients
    #[arg(short = 't', long = "nb-threads")]
    nb_threads: Option<usize>,

    /// Bind address
    #[arg(short = 'b', long = "lbind")]
    lbind: Option<String>,

    /// Bind port
    #[arg(short = 'p', long = "lport")]
    lport: Option<u16>,

    /// Append logs to this file instead of stderr
    #[arg(short = 'l', long = "logfile")]
    logfile: Option<PathBuf>,

    /// Plugins directory
    #[arg(short = 'x', long = "plugins")]
    plugins: Option<String>,

    /// Private key PEM
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    /// Certificate PEM
    #[arg(short = 'c', long = "cert")]
    cert: Option<String>,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable colored log output
    #[arg(short = 'n', long = "no-color")]
    no_color: bool,

    /// Only connect to origins over IPv4
    #[arg(short = '4', conflicts_with = "ipv6")]
    ipv4: bool,

    /// Only connect to origins over IPv6
    #[arg(short = '6')]
    ipv6: bool,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a fresh CA pair to the cert/key paths and exit
    #[arg(long = "generate-ca")]
    generate_ca: bool,
}

fn level_for(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(level_for(args.verbose))
        .with_ansi(!args.no_color && args.logfile.is_none());
    match &args.logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder.with_writer(std::sync::Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

/// CLI values take precedence over the configuration file.
fn apply_overrides(cfg: &mut config::Config, args: &Args) {
    if let Some(n) = args.nb_threads {
        cfg.general.max_workers = n;
    }
    if let Some(ref b) = args.lbind {
        cfg.general.listen = b.clone();
    }
    if let Some(p) = args.lport {
        cfg.general.port = p;
    }
    if let Some(ref x) = args.plugins {
        cfg.plugins.directory = x.clone();
    }
    if let Some(ref k) = args.key {
        cfg.tls.key_path = k.clone();
    }
    if let Some(ref c) = args.cert {
        cfg.tls.cert_path = c.clone();
    }
    if args.ipv4 {
        cfg.general.ip_version = IpVersion::V4;
    } else if args.ipv6 {
        cfg.general.ip_version = IpVersion::V6;
    }
}

async fn load_config(args: &Args) -> anyhow::Result<config::Config> {
    let mut cfg = match &args.config {
        Some(p) => config::Config::load_from_path(p).await?,
        None => config::Config::default(),
    };
    apply_overrides(&mut cfg, args);
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let cfg = load_config(&args).await?;

    if args.generate_ca {
        let cert = Path::new(&cfg.tls.cert_path);
        let key = Path::new(&cfg.tls.key_path);
        CertificateAuthority::generate_and_save(cert, key).await?;
        println!("CA written to {} and {}", cert.display(), key.display());
        return Ok(());
    }

    let cfg = Arc::new(cfg.validated().await?);
    let tls = Arc::new(TlsContexts::from_config(&cfg).await?);

    let registry = InterpreterRegistry::with_builtin_kinds();
    let plugins = PluginChain::load_dir(Path::new(&cfg.plugins.directory), &registry).await?;
    info!(plugins = plugins.len(), workers = cfg.general.max_workers, "starting");

    let shared = Arc::new(proxy::Shared::new(cfg.clone(), tls, plugins));
    let server = proxy::run_proxy(shared.clone());

    tokio::select! {
        res = server => {
            if let Err(e) = res {
                error!(%e, "server error");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    shared.plugins().shutdown().await;
    Ok(())
}
