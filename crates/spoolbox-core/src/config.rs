// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service configuration.
//
// Loaded once at startup from a JSON file.  Every field has a default so a
// partial file (or no file at all) yields a working single-printer setup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpoolError};
use crate::types::{PortKind, StalledJobPolicy};

/// Longest text or URI a printer attribute may carry (RFC 8011 text(MAX),
/// uri(MAX)).
pub const MAX_ATTRIBUTE_VALUE_LEN: usize = 1023;

/// Description of one logical printer (one queue, one output sink).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    /// Queue name; also the IPP resource path (`/<name>`) and the prefix of
    /// its spool files.
    pub name: String,
    pub info: String,
    pub location: String,
    pub make_and_model: String,
    pub organization: String,
    pub organizational_unit: String,
    /// Target of the `/info.html` redirect and `printer-more-info`.
    pub more_info_url: String,
    /// Bytes between full refreshes of the output device.
    pub refresh_threshold: u32,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            name: "spoolbox".into(),
            info: "Small one-page network printer".into(),
            location: "The kitchen".into(),
            make_and_model: "Spoolbox Appliance".into(),
            organization: "The World".into(),
            organizational_unit: "Everyone".into(),
            more_info_url: "https://github.com/hyperpolymath/spoolbox".into(),
            refresh_threshold: 100,
        }
    }
}

impl PrinterConfig {
    /// Configured strings that are sent back as IPP attribute values.
    fn attribute_strings(&self) -> [(&'static str, &str); 7] {
        [
            ("name", &self.name),
            ("info", &self.info),
            ("location", &self.location),
            ("make_and_model", &self.make_and_model),
            ("organization", &self.organization),
            ("organizational_unit", &self.organizational_unit),
            ("more_info_url", &self.more_info_url),
        ]
    }
}

/// Persistent service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address all three listeners bind to.
    pub bind_address: String,
    /// Host name used when building advertised URIs.
    pub host_name: String,
    /// Port for raw job uploads (default 9100).
    pub raw_port: u16,
    /// Port for IPP (default 631).
    pub ipp_port: u16,
    /// Port for HTTP status and assets (default 80).
    pub http_port: u16,
    /// Fixed number of connection slots.
    pub max_clients: usize,
    /// Upper bound on a buffered HTTP head plus IPP attribute section.
    pub max_request_bytes: usize,
    /// Slots still parsing a request after this long are closed.
    pub header_timeout_secs: u64,
    /// Streaming slots idle for this long are closed and their job canceled.
    pub idle_timeout_secs: u64,
    /// Directory holding job files and queue records.
    pub spool_dir: PathBuf,
    /// Capacity the spool directory is allowed to fill.
    pub storage_capacity_bytes: u64,
    /// Free space that must remain before further job bytes are accepted.
    pub storage_margin_bytes: u64,
    /// Interval between resyncs of the cached free-space estimate.
    pub space_resync_secs: u64,
    pub stalled_job_policy: StalledJobPolicy,
    /// Bytes moved from a queue to its sink per tick.
    pub drain_batch_bytes: usize,
    /// Bytes read from one socket per tick.
    pub read_chunk_bytes: usize,
    /// Sleep between ticks when nothing happened.
    pub tick_idle_millis: u64,
    /// Advertise printers as `_ipp._tcp` via mDNS.
    pub advertise_mdns: bool,
    pub printers: Vec<PrinterConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            host_name: "spoolbox.local".into(),
            raw_port: 9100,
            ipp_port: 631,
            http_port: 80,
            max_clients: 8,
            max_request_bytes: 16 * 1024,
            header_timeout_secs: 30,
            idle_timeout_secs: 300,
            spool_dir: PathBuf::from("spool"),
            storage_capacity_bytes: 64 * 1024 * 1024,
            storage_margin_bytes: 4096,
            space_resync_secs: 10,
            stalled_job_policy: StalledJobPolicy::Block,
            drain_batch_bytes: 64,
            read_chunk_bytes: 1024,
            tick_idle_millis: 5,
            advertise_mdns: true,
            printers: vec![PrinterConfig::default()],
        }
    }
}

impl ServerConfig {
    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SpoolError::Config(format!("read {}: {e}", path.display())))?;
        let config: ServerConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the rest of the service relies on.
    pub fn validate(&self) -> Result<()> {
        if self.printers.is_empty() {
            return Err(SpoolError::Config("at least one printer is required".into()));
        }
        let mut seen = HashSet::new();
        for printer in &self.printers {
            if !is_path_safe(&printer.name) {
                return Err(SpoolError::Config(format!(
                    "printer name {:?} must be non-empty ASCII letters, digits, '-' or '_'",
                    printer.name
                )));
            }
            if !seen.insert(printer.name.as_str()) {
                return Err(SpoolError::Config(format!(
                    "duplicate printer name {:?}",
                    printer.name
                )));
            }
            for (field, value) in printer.attribute_strings() {
                if value.len() > MAX_ATTRIBUTE_VALUE_LEN {
                    return Err(SpoolError::Config(format!(
                        "printer {:?}: {field} is longer than {MAX_ATTRIBUTE_VALUE_LEN} bytes",
                        printer.name
                    )));
                }
            }
            if printer.refresh_threshold == 0 {
                return Err(SpoolError::Config(format!(
                    "printer {:?}: refresh_threshold must be positive",
                    printer.name
                )));
            }
        }
        if self.host_name.len() > MAX_ATTRIBUTE_VALUE_LEN {
            return Err(SpoolError::Config("host_name is too long".into()));
        }
        if self.max_clients == 0 {
            return Err(SpoolError::Config("max_clients must be positive".into()));
        }
        if self.max_request_bytes < 64 {
            return Err(SpoolError::Config("max_request_bytes is too small".into()));
        }
        if self.read_chunk_bytes == 0 || self.drain_batch_bytes == 0 {
            return Err(SpoolError::Config(
                "read_chunk_bytes and drain_batch_bytes must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Listening port for the given connection kind.
    pub fn port(&self, kind: PortKind) -> u16 {
        match kind {
            PortKind::Raw => self.raw_port,
            PortKind::Ipp => self.ipp_port,
            PortKind::Http => self.http_port,
        }
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn space_resync_interval(&self) -> Duration {
        Duration::from_secs(self.space_resync_secs)
    }

    pub fn tick_idle(&self) -> Duration {
        Duration::from_millis(self.tick_idle_millis)
    }
}

fn is_path_safe(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        config.validate().expect("default config validates");
        assert_eq!(config.port(PortKind::Raw), 9100);
        assert_eq!(config.port(PortKind::Ipp), 631);
        assert_eq!(config.storage_margin_bytes, 4096);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spoolbox.json");
        std::fs::write(
            &path,
            r#"{ "ipp_port": 8631, "printers": [{ "name": "kitchen" }],
                 "stalled_job_policy": "discard-orphans" }"#,
        )
        .unwrap();

        let config = ServerConfig::load(&path).expect("load");
        assert_eq!(config.ipp_port, 8631);
        assert_eq!(config.raw_port, 9100);
        assert_eq!(config.printers[0].name, "kitchen");
        assert_eq!(config.printers[0].refresh_threshold, 100);
        assert_eq!(config.stalled_job_policy, StalledJobPolicy::DiscardOrphans);
    }

    #[test]
    fn rejects_unsafe_or_duplicate_printer_names() {
        let mut config = ServerConfig::default();
        config.printers[0].name = "../etc".into();
        assert!(config.validate().is_err());

        config.printers = vec![PrinterConfig::default(), PrinterConfig::default()];
        assert!(config.validate().is_err());

        config.printers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_strings_too_long_for_printer_attributes() {
        let mut config = ServerConfig::default();
        config.printers[0].info = "i".repeat(MAX_ATTRIBUTE_VALUE_LEN);
        assert!(config.validate().is_ok());

        config.printers[0].info.push('!');
        let err = config.validate().unwrap_err();
        assert!(matches!(&err, SpoolError::Config(msg) if msg.contains("info")));

        let mut config = ServerConfig::default();
        config.printers[0].more_info_url = format!("http://{}", "u".repeat(70_000));
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.host_name = "h".repeat(MAX_ATTRIBUTE_VALUE_LEN + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = ServerConfig::load("/nonexistent/spoolbox.json").unwrap_err();
        assert!(matches!(err, SpoolError::Config(_)));
    }
}
