// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// mDNS-SD advertisement of each printer as `_ipp._tcp.local.`.
//
// Advertisement is best effort: any failure is logged and the printers stay
// reachable by address.

use tracing::{info, warn};

use spoolbox_core::config::PrinterConfig;

use crate::attributes::DOCUMENT_FORMATS;

/// IPP service type (RFC 8010 / PWG 5100.14).
pub const IPP_SERVICE_TYPE: &str = "_ipp._tcp.local.";

/// TXT record for one printer.
pub fn txt_properties(printer: &PrinterConfig) -> Vec<(&'static str, String)> {
    vec![
        ("txtvers", "1".to_string()),
        ("qtotal", "1".to_string()),
        ("rp", printer.name.clone()),
        ("ty", printer.make_and_model.clone()),
        ("note", printer.location.clone()),
        ("pdl", DOCUMENT_FORMATS.join(",")),
        ("Color", "F".to_string()),
        ("Duplex", "F".to_string()),
        ("URF", "none".to_string()),
    ]
}

/// Registered services; unregistered on [`MdnsAdvertiser::shutdown`].
pub struct MdnsAdvertiser {
    daemon: Option<mdns_sd::ServiceDaemon>,
    fullnames: Vec<String>,
}

impl MdnsAdvertiser {
    /// Register every printer on `port`, advertised under `host_name`.
    pub fn register(printers: &[PrinterConfig], host_name: &str, port: u16) -> Self {
        let daemon = match mdns_sd::ServiceDaemon::new() {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "failed to create mDNS daemon for advertisement");
                return Self {
                    daemon: None,
                    fullnames: Vec::new(),
                };
            }
        };

        let host = format!("{}.", host_name.trim_end_matches('.'));
        let mut fullnames = Vec::with_capacity(printers.len());
        for printer in printers {
            let properties = txt_properties(printer);
            let properties: Vec<(&str, &str)> =
                properties.iter().map(|(k, v)| (*k, v.as_str())).collect();

            let service_info = match mdns_sd::ServiceInfo::new(
                IPP_SERVICE_TYPE,
                &printer.name,
                &host,
                "", // empty = auto-detect IP
                port,
                &properties[..],
            ) {
                Ok(info) => info.enable_addr_auto(),
                Err(e) => {
                    warn!(printer = %printer.name, error = %e, "failed to create mDNS ServiceInfo");
                    continue;
                }
            };

            let fullname = service_info.get_fullname().to_owned();
            match daemon.register(service_info) {
                Ok(()) => {
                    info!(
                        service_type = IPP_SERVICE_TYPE,
                        printer = %printer.name,
                        port,
                        "mDNS service registered"
                    );
                    fullnames.push(fullname);
                }
                Err(e) => warn!(printer = %printer.name, error = %e, "failed to register mDNS service"),
            }
        }

        Self {
            daemon: Some(daemon),
            fullnames,
        }
    }

    /// Number of services currently advertised.
    pub fn registered(&self) -> usize {
        self.fullnames.len()
    }

    /// Unregister every service and stop the daemon.
    pub fn shutdown(&mut self) {
        let Some(daemon) = self.daemon.take() else {
            return;
        };
        for fullname in self.fullnames.drain(..) {
            match daemon.unregister(&fullname) {
                Ok(_) => info!(name = %fullname, "mDNS service unregistered"),
                Err(e) => warn!(name = %fullname, error = %e, "failed to unregister mDNS service"),
            }
        }
        if let Err(e) = daemon.shutdown() {
            warn!(error = %e, "failed to shut down mDNS daemon");
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.shutdown();
    }
}
