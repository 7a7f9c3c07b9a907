// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spoolbox daemon.
//
// Loads the configuration, opens the spool directory, binds the raw, IPP and
// HTTP listeners and serves until interrupted.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use spoolbox_core::config::{PrinterConfig, ServerConfig};
use spoolbox_core::error::{Result, SpoolError};
use spoolbox_core::types::PortKind;
use spoolbox_print::{
    BlockStorage, DirectoryStorage, MdnsAdvertiser, OutputSink, PrintServer, RefreshingSink,
    StreamPanel,
};

#[derive(Parser, Debug)]
#[command(
    name = "spoolbox",
    version,
    about = "Network print service: IPP, raw uploads and an on-disk job queue"
)]
struct Cli {
    /// JSON configuration file. Built-in defaults are used when omitted.
    #[arg(long, value_name = "PATH", env = "SPOOLBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Spool directory, overriding the configuration.
    #[arg(long, value_name = "DIR", env = "SPOOLBOX_SPOOL_DIR")]
    spool_dir: Option<PathBuf>,

    /// Append printed bytes to this file instead of stdout. With several
    /// printers each one writes to `<PATH>.<printer>`.
    #[arg(long, value_name = "PATH", env = "SPOOLBOX_OUTPUT")]
    output: Option<PathBuf>,

    /// Do not advertise printers over mDNS.
    #[arg(long)]
    no_mdns: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "spoolbox stopped");
            ExitCode::FAILURE
        }
    }
}

/// Effective configuration: file (or defaults) plus command-line overrides.
fn resolve_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(dir) = &cli.spool_dir {
        config.spool_dir = dir.clone();
    }
    if cli.no_mdns {
        config.advertise_mdns = false;
    }
    config.validate()?;
    Ok(config)
}

/// Where one printer's output goes.
fn output_path(base: &Path, printer: &PrinterConfig, printer_count: usize) -> PathBuf {
    if printer_count == 1 {
        return base.to_path_buf();
    }
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(&printer.name);
    PathBuf::from(name)
}

/// One output sink per configured printer, in configuration order.
fn build_sinks(config: &ServerConfig, output: Option<&Path>) -> Result<Vec<Box<dyn OutputSink>>> {
    let count = config.printers.len();
    let mut sinks: Vec<Box<dyn OutputSink>> = Vec::with_capacity(count);
    for printer in &config.printers {
        let writer: Box<dyn Write + Send> = match output {
            Some(base) => {
                let path = output_path(base, printer, count);
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| SpoolError::Sink(format!("open {}: {e}", path.display())))?;
                info!(printer = %printer.name, path = %path.display(), "printing to file");
                Box::new(file)
            }
            None => Box::new(std::io::stdout()),
        };
        sinks.push(Box::new(RefreshingSink::new(
            StreamPanel::new(writer),
            printer.refresh_threshold,
        )));
    }
    Ok(sinks)
}

async fn serve(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;
    info!(
        spool_dir = %config.spool_dir.display(),
        printers = config.printers.len(),
        "Spoolbox starting"
    );

    let storage: Arc<dyn BlockStorage> = Arc::new(DirectoryStorage::open(
        &config.spool_dir,
        config.storage_capacity_bytes,
    )?);
    let sinks = build_sinks(&config, cli.output.as_deref())?;
    let mut server = PrintServer::bind(config.clone(), storage, sinks).await?;

    let mut advertiser = config.advertise_mdns.then(|| {
        let port = server
            .local_addr(PortKind::Ipp)
            .map_or(config.ipp_port, |addr| addr.port());
        let advertiser = MdnsAdvertiser::register(&config.printers, &config.host_name, port);
        if advertiser.registered() < config.printers.len() {
            warn!(
                registered = advertiser.registered(),
                printers = config.printers.len(),
                "some printers are not advertised over mDNS"
            );
        }
        advertiser
    });

    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                signal.notify_one();
            }
            Err(e) => warn!(error = %e, "cannot listen for interrupts"),
        }
    });

    server.run(shutdown).await;

    if let Some(advertiser) = advertiser.as_mut() {
        advertiser.shutdown();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["spoolbox"]).unwrap();
        assert!(cli.config.is_none());
        assert!(cli.output.is_none());
        assert!(!cli.no_mdns);
    }

    #[test]
    fn cli_overrides_spool_dir_and_mdns() {
        let cli = Cli::try_parse_from(["spoolbox", "--spool-dir", "/var/spool/box", "--no-mdns"])
            .unwrap();
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.spool_dir, PathBuf::from("/var/spool/box"));
        assert!(!config.advertise_mdns);
    }

    #[test]
    fn cli_loads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spoolbox.json");
        std::fs::write(
            &path,
            r#"{"raw_port": 19100, "printers": [{"name": "a"}, {"name": "b"}]}"#,
        )
        .unwrap();

        let cli = Cli::try_parse_from(["spoolbox", "--config", path.to_str().unwrap()]).unwrap();
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.raw_port, 19100);
        assert_eq!(config.printers.len(), 2);
    }

    #[test]
    fn invalid_config_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spoolbox.json");
        std::fs::write(&path, r#"{"printers": []}"#).unwrap();

        let cli = Cli::try_parse_from(["spoolbox", "--config", path.to_str().unwrap()]).unwrap();
        assert!(matches!(resolve_config(&cli), Err(SpoolError::Config(_))));
    }

    #[test]
    fn one_file_per_printer_when_several() {
        let base = Path::new("/tmp/out");
        let printer = PrinterConfig {
            name: "kitchen".into(),
            ..PrinterConfig::default()
        };
        assert_eq!(output_path(base, &printer, 1), PathBuf::from("/tmp/out"));
        assert_eq!(output_path(base, &printer, 2), PathBuf::from("/tmp/out.kitchen"));
    }

    #[test]
    fn file_sinks_receive_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("printed");
        let config = ServerConfig::default();

        let mut sinks = build_sinks(&config, Some(&base)).unwrap();
        assert_eq!(sinks.len(), 1);
        for b in b"hi" {
            sinks[0].write_byte(*b).unwrap();
        }
        drop(sinks);
        assert_eq!(std::fs::read(&base).unwrap(), b"hi");
    }
}
