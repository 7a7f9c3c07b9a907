// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer description attribute table.
//
// Every attribute this device models is a `PrinterAttribute` variant; name
// lookup and value generation are exhaustive matches, so adding a variant
// without a generator does not compile.  Values are either constants or
// computed at response time from an `AttributeContext` (uptime, wall clock,
// live queue depth).

use std::collections::BTreeSet;
use std::time::Instant;

use chrono::{DateTime, Local, Utc};
use uuid::Uuid;

use spoolbox_core::config::PrinterConfig;
use spoolbox_core::types::Operation;

use crate::codec::{
    AttributeWriter, RESOLUTION_DOTS_PER_INCH, VALUE_TAG_BOOLEAN, VALUE_TAG_CHARSET,
    VALUE_TAG_DATE_TIME, VALUE_TAG_ENUM, VALUE_TAG_INTEGER, VALUE_TAG_KEYWORD,
    VALUE_TAG_MIME_MEDIA_TYPE, VALUE_TAG_NAME, VALUE_TAG_NATURAL_LANGUAGE, VALUE_TAG_RESOLUTION,
    VALUE_TAG_TEXT, VALUE_TAG_UNKNOWN, VALUE_TAG_URI,
};

/// rangeOfInteger (8 bytes: lower, upper).
const VALUE_TAG_RANGE_OF_INTEGER: u8 = 0x33;

/// printer-state: idle.
pub const PRINTER_STATE_IDLE: u32 = 3;

/// printer-state: processing.
pub const PRINTER_STATE_PROCESSING: u32 = 4;

/// Natural language of every generated string.
pub const NATURAL_LANGUAGE: &str = "en-us";

/// Document formats accepted, default first.
pub const DOCUMENT_FORMATS: [&str; 3] = ["text/plain", "image/pwg-raster", "image/jpeg"];

/// Output resolution of the panel, dots per inch.
const PANEL_DPI: i32 = 167;

/// Everything a generator may need to compute a value.
#[derive(Debug, Clone)]
pub struct AttributeContext<'a> {
    pub printer: &'a PrinterConfig,
    /// `host:port` of the IPP listener.
    pub ipp_authority: &'a str,
    /// `host:port` of the HTTP listener.
    pub http_authority: &'a str,
    /// Service start, for printer-up-time.
    pub booted_at: Instant,
    /// Wall clock at service start; configuration cannot change afterwards.
    pub config_changed_at: DateTime<Utc>,
    /// Jobs created but not yet drained.
    pub queued_jobs: u32,
    /// Whether spool storage is above its safety margin.
    pub accepting_jobs: bool,
}

impl AttributeContext<'_> {
    pub fn printer_uri(&self) -> String {
        format!("ipp://{}/{}", self.ipp_authority, self.printer.name)
    }

    fn uptime_secs(&self) -> u32 {
        self.booted_at.elapsed().as_secs().min(u64::from(u32::MAX)) as u32
    }

    fn printer_state(&self) -> u32 {
        if self.queued_jobs > 0 {
            PRINTER_STATE_PROCESSING
        } else {
            PRINTER_STATE_IDLE
        }
    }
}

macro_rules! printer_attributes {
    ($($variant:ident => $name:literal,)+) => {
        /// A printer description attribute modelled by this device.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum PrinterAttribute {
            $($variant,)+
        }

        impl PrinterAttribute {
            /// The complete printer-description set, in name order.
            pub const ALL: &'static [PrinterAttribute] = &[$(PrinterAttribute::$variant,)+];

            pub fn name(self) -> &'static str {
                match self {
                    $(PrinterAttribute::$variant => $name,)+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(PrinterAttribute::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

// Keep this list sorted by attribute name: ALL is emitted in this order.
printer_attributes! {
    CharsetConfigured => "charset-configured",
    CharsetSupported => "charset-supported",
    ColorSupported => "color-supported",
    CompressionSupported => "compression-supported",
    CopiesDefault => "copies-default",
    CopiesSupported => "copies-supported",
    DocumentFormatDefault => "document-format-default",
    DocumentFormatSupported => "document-format-supported",
    GeneratedNaturalLanguageSupported => "generated-natural-language-supported",
    IdentifyActionsDefault => "identify-actions-default",
    IdentifyActionsSupported => "identify-actions-supported",
    IppFeaturesSupported => "ipp-features-supported",
    IppVersionsSupported => "ipp-versions-supported",
    JobCreationAttributesSupported => "job-creation-attributes-supported",
    JobIdsSupported => "job-ids-supported",
    MultipleDocumentJobsSupported => "multiple-document-jobs-supported",
    MultipleOperationTimeOut => "multiple-operation-time-out",
    MultipleOperationTimeOutAction => "multiple-operation-time-out-action",
    NaturalLanguageConfigured => "natural-language-configured",
    OperationsSupported => "operations-supported",
    PagesPerMinute => "pages-per-minute",
    PdlOverrideSupported => "pdl-override-supported",
    PreferredAttributesSupported => "preferred-attributes-supported",
    PrinterConfigChangeDateTime => "printer-config-change-date-time",
    PrinterConfigChangeTime => "printer-config-change-time",
    PrinterCurrentTime => "printer-current-time",
    PrinterGeoLocation => "printer-geo-location",
    PrinterGetAttributesSupported => "printer-get-attributes-supported",
    PrinterIcons => "printer-icons",
    PrinterInfo => "printer-info",
    PrinterIsAcceptingJobs => "printer-is-accepting-jobs",
    PrinterLocation => "printer-location",
    PrinterMakeAndModel => "printer-make-and-model",
    PrinterMoreInfo => "printer-more-info",
    PrinterName => "printer-name",
    PrinterOrganization => "printer-organization",
    PrinterOrganizationalUnit => "printer-organizational-unit",
    PrinterState => "printer-state",
    PrinterStateChangeDateTime => "printer-state-change-date-time",
    PrinterStateChangeTime => "printer-state-change-time",
    PrinterStateMessage => "printer-state-message",
    PrinterStateReasons => "printer-state-reasons",
    PrinterUpTime => "printer-up-time",
    PrinterUriSupported => "printer-uri-supported",
    PrinterUuid => "printer-uuid",
    PwgRasterDocumentResolutionSupported => "pwg-raster-document-resolution-supported",
    PwgRasterDocumentTypeSupported => "pwg-raster-document-type-supported",
    QueuedJobCount => "queued-job-count",
    UriAuthenticationSupported => "uri-authentication-supported",
    UriSecuritySupported => "uri-security-supported",
    WhichJobsSupported => "which-jobs-supported",
}

/// Turn the client's `requested-attributes` into the attributes to emit.
///
/// The empty set, `all` and `printer-description` are aliases for the full
/// table.  Unknown names are dropped.  The result is sorted and free of
/// duplicates.
pub fn resolve_requested(requested: Option<&BTreeSet<String>>) -> Vec<PrinterAttribute> {
    let requested = match requested {
        Some(set) if !set.is_empty() => set,
        _ => return PrinterAttribute::ALL.to_vec(),
    };
    if requested
        .iter()
        .any(|name| name == "all" || name == "printer-description")
    {
        return PrinterAttribute::ALL.to_vec();
    }

    let mut resolved: Vec<PrinterAttribute> = requested
        .iter()
        .filter_map(|name| PrinterAttribute::from_name(name))
        .collect();
    resolved.sort_by_key(|attr| attr.name());
    resolved.dedup();
    resolved
}

impl PrinterAttribute {
    /// Append this attribute (all of its values) to `w`.
    pub fn emit(self, ctx: &AttributeContext<'_>, w: &mut AttributeWriter) {
        let name = self.name();
        let printer = ctx.printer;
        match self {
            Self::CharsetConfigured | Self::CharsetSupported => {
                w.write_string(VALUE_TAG_CHARSET, name, "utf-8");
            }
            Self::ColorSupported
            | Self::MultipleDocumentJobsSupported
            | Self::PreferredAttributesSupported => {
                w.write_byte(VALUE_TAG_BOOLEAN, name, 0);
            }
            Self::CompressionSupported
            | Self::PrinterStateReasons
            | Self::UriAuthenticationSupported
            | Self::UriSecuritySupported => {
                w.write_string(VALUE_TAG_KEYWORD, name, "none");
            }
            Self::CopiesDefault | Self::PagesPerMinute => {
                w.write_four_byte(VALUE_TAG_INTEGER, name, 1);
            }
            Self::CopiesSupported => {
                let mut range = [0u8; 8];
                range[..4].copy_from_slice(&1u32.to_be_bytes());
                range[4..].copy_from_slice(&1u32.to_be_bytes());
                w.write_n_bytes(VALUE_TAG_RANGE_OF_INTEGER, name, &range);
            }
            Self::DocumentFormatDefault => {
                w.write_string(VALUE_TAG_MIME_MEDIA_TYPE, name, DOCUMENT_FORMATS[0]);
            }
            Self::DocumentFormatSupported => {
                w.write_string(VALUE_TAG_MIME_MEDIA_TYPE, name, DOCUMENT_FORMATS[0]);
                for format in &DOCUMENT_FORMATS[1..] {
                    w.write_string(VALUE_TAG_MIME_MEDIA_TYPE, "", format);
                }
            }
            Self::GeneratedNaturalLanguageSupported | Self::NaturalLanguageConfigured => {
                w.write_string(VALUE_TAG_NATURAL_LANGUAGE, name, NATURAL_LANGUAGE);
            }
            Self::IdentifyActionsDefault | Self::IdentifyActionsSupported => {
                w.write_string(VALUE_TAG_KEYWORD, name, "flash");
            }
            Self::IppFeaturesSupported => {
                w.write_string(VALUE_TAG_KEYWORD, name, "ipp-everywhere");
            }
            Self::IppVersionsSupported => {
                w.write_string(VALUE_TAG_KEYWORD, name, "2.0");
            }
            Self::JobCreationAttributesSupported => {
                w.write_string(VALUE_TAG_KEYWORD, name, "media");
            }
            Self::JobIdsSupported | Self::PrinterIsAcceptingJobs => {
                let value = match self {
                    Self::PrinterIsAcceptingJobs => u8::from(ctx.accepting_jobs),
                    _ => 1,
                };
                w.write_byte(VALUE_TAG_BOOLEAN, name, value);
            }
            Self::MultipleOperationTimeOut => {
                w.write_four_byte(VALUE_TAG_INTEGER, name, 120);
            }
            Self::MultipleOperationTimeOutAction => {
                w.write_string(VALUE_TAG_KEYWORD, name, "abort-job");
            }
            Self::OperationsSupported => {
                for (i, op) in Operation::ADVERTISED.iter().enumerate() {
                    let attr_name = if i == 0 { name } else { "" };
                    w.write_four_byte(VALUE_TAG_ENUM, attr_name, u32::from(op.code()));
                }
            }
            Self::PdlOverrideSupported => {
                w.write_string(VALUE_TAG_KEYWORD, name, "not-attempted");
            }
            Self::PrinterConfigChangeDateTime => {
                let local: DateTime<Local> = ctx.config_changed_at.into();
                w.write_date_time(VALUE_TAG_DATE_TIME, name, &local);
            }
            Self::PrinterConfigChangeTime => {
                let secs = ctx.config_changed_at.timestamp().clamp(0, i64::from(u32::MAX));
                w.write_four_byte(VALUE_TAG_INTEGER, name, secs as u32);
            }
            Self::PrinterCurrentTime | Self::PrinterStateChangeDateTime => {
                w.write_date_time(VALUE_TAG_DATE_TIME, name, &Local::now());
            }
            Self::PrinterGeoLocation => {
                w.write_oob(VALUE_TAG_UNKNOWN, name);
            }
            Self::PrinterGetAttributesSupported => {
                w.write_string(VALUE_TAG_KEYWORD, name, "document-format");
            }
            Self::PrinterIcons => {
                let uri = format!("http://{}/icon.png", ctx.http_authority);
                w.write_string(VALUE_TAG_URI, name, &uri);
            }
            Self::PrinterInfo => {
                w.write_string(VALUE_TAG_TEXT, name, &printer.info);
            }
            Self::PrinterLocation => {
                w.write_string(VALUE_TAG_TEXT, name, &printer.location);
            }
            Self::PrinterMakeAndModel => {
                w.write_string(VALUE_TAG_TEXT, name, &printer.make_and_model);
            }
            Self::PrinterMoreInfo => {
                let uri = format!("http://{}/info.html", ctx.http_authority);
                w.write_string(VALUE_TAG_URI, name, &uri);
            }
            Self::PrinterName => {
                w.write_string(VALUE_TAG_NAME, name, &printer.name);
            }
            Self::PrinterOrganization => {
                w.write_string(VALUE_TAG_TEXT, name, &printer.organization);
            }
            Self::PrinterOrganizationalUnit => {
                w.write_string(VALUE_TAG_TEXT, name, &printer.organizational_unit);
            }
            Self::PrinterState => {
                w.write_four_byte(VALUE_TAG_ENUM, name, ctx.printer_state());
            }
            Self::PrinterStateChangeTime => {
                let now = Utc::now().timestamp().clamp(0, i64::from(u32::MAX));
                w.write_four_byte(VALUE_TAG_INTEGER, name, now as u32);
            }
            Self::PrinterStateMessage => {
                let message = if ctx.printer_state() == PRINTER_STATE_IDLE {
                    "Ready"
                } else {
                    "Printing"
                };
                w.write_string(VALUE_TAG_TEXT, name, message);
            }
            Self::PrinterUpTime => {
                w.write_four_byte(VALUE_TAG_INTEGER, name, ctx.uptime_secs());
            }
            Self::PrinterUriSupported => {
                w.write_string(VALUE_TAG_URI, name, &ctx.printer_uri());
            }
            Self::PrinterUuid => {
                let uuid = Uuid::new_v5(&Uuid::NAMESPACE_URL, ctx.printer_uri().as_bytes());
                w.write_string(VALUE_TAG_URI, name, &format!("urn:uuid:{uuid}"));
            }
            Self::PwgRasterDocumentResolutionSupported => {
                w.write_resolution(
                    VALUE_TAG_RESOLUTION,
                    name,
                    PANEL_DPI,
                    PANEL_DPI,
                    RESOLUTION_DOTS_PER_INCH,
                );
            }
            Self::PwgRasterDocumentTypeSupported => {
                w.write_string(VALUE_TAG_KEYWORD, name, "black_1");
            }
            Self::QueuedJobCount => {
                w.write_four_byte(VALUE_TAG_INTEGER, name, ctx.queued_jobs);
            }
            Self::WhichJobsSupported => {
                w.write_string(VALUE_TAG_KEYWORD, name, "completed")
                    .write_string(VALUE_TAG_KEYWORD, "", "not-completed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AttributeReader, RawAttribute, decode_i32};

    fn context(printer: &PrinterConfig, queued_jobs: u32) -> AttributeContext<'_> {
        AttributeContext {
            printer,
            ipp_authority: "spoolbox.local:631",
            http_authority: "spoolbox.local:80",
            booted_at: Instant::now(),
            config_changed_at: Utc::now(),
            queued_jobs,
            accepting_jobs: true,
        }
    }

    fn emit_all(attrs: &[PrinterAttribute], ctx: &AttributeContext<'_>) -> Vec<RawAttribute> {
        let mut w = AttributeWriter::new();
        for attr in attrs {
            attr.emit(ctx, &mut w);
        }
        let bytes = w.into_bytes();
        let mut r = AttributeReader::new(&bytes);
        let mut out = Vec::new();
        while let Some(tag) = r.read_tag() {
            out.push(r.read_attribute_body(tag).expect("well formed"));
        }
        out
    }

    #[test]
    fn table_is_sorted_and_names_roundtrip() {
        let names: Vec<&str> = PrinterAttribute::ALL.iter().map(|a| a.name()).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(names, sorted);

        for attr in PrinterAttribute::ALL {
            assert_eq!(PrinterAttribute::from_name(attr.name()), Some(*attr));
        }
    }

    #[test]
    fn aliases_resolve_to_full_table() {
        assert_eq!(resolve_requested(None).len(), PrinterAttribute::ALL.len());

        let empty = BTreeSet::new();
        assert_eq!(resolve_requested(Some(&empty)).len(), PrinterAttribute::ALL.len());

        for alias in ["all", "printer-description"] {
            let set: BTreeSet<String> = [alias.to_string(), "printer-name".to_string()].into();
            assert_eq!(resolve_requested(Some(&set)), PrinterAttribute::ALL.to_vec());
        }
    }

    #[test]
    fn unknown_names_are_skipped() {
        let set: BTreeSet<String> = ["media-col-database", "printer-name", "printer-state"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            resolve_requested(Some(&set)),
            vec![PrinterAttribute::PrinterName, PrinterAttribute::PrinterState]
        );
    }

    #[test]
    fn printer_name_comes_from_config() {
        let printer = PrinterConfig {
            name: "kitchen".into(),
            ..PrinterConfig::default()
        };
        let attrs = emit_all(&[PrinterAttribute::PrinterName], &context(&printer, 0));
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].value_tag, VALUE_TAG_NAME);
        assert_eq!(attrs[0].value, b"kitchen");
    }

    #[test]
    fn multi_valued_attributes_continue_with_empty_names() {
        let printer = PrinterConfig::default();
        let attrs = emit_all(&[PrinterAttribute::OperationsSupported], &context(&printer, 0));
        assert_eq!(attrs.len(), Operation::ADVERTISED.len());
        assert_eq!(attrs[0].name, "operations-supported");
        assert!(attrs[1..].iter().all(|a| a.name.is_empty()));
        assert_eq!(decode_i32(&attrs[0].value), Some(0x0002));
    }

    #[test]
    fn state_and_queue_depth_are_live() {
        let printer = PrinterConfig::default();
        let attrs = emit_all(
            &[PrinterAttribute::PrinterState, PrinterAttribute::QueuedJobCount],
            &context(&printer, 2),
        );
        assert_eq!(decode_i32(&attrs[0].value), Some(PRINTER_STATE_PROCESSING as i32));
        assert_eq!(decode_i32(&attrs[1].value), Some(2));

        let idle = emit_all(&[PrinterAttribute::PrinterState], &context(&printer, 0));
        assert_eq!(decode_i32(&idle[0].value), Some(PRINTER_STATE_IDLE as i32));
    }

    #[test]
    fn uris_use_listener_authorities() {
        let printer = PrinterConfig {
            name: "kitchen".into(),
            ..PrinterConfig::default()
        };
        let attrs = emit_all(
            &[PrinterAttribute::PrinterIcons, PrinterAttribute::PrinterUriSupported],
            &context(&printer, 0),
        );
        assert_eq!(attrs[0].value, b"http://spoolbox.local:80/icon.png");
        assert_eq!(attrs[1].value, b"ipp://spoolbox.local:631/kitchen");
    }

    #[test]
    fn every_attribute_emits_at_least_one_value() {
        let printer = PrinterConfig::default();
        let attrs = emit_all(PrinterAttribute::ALL, &context(&printer, 0));
        let named: Vec<&str> = attrs
            .iter()
            .filter(|a| !a.name.is_empty())
            .map(|a| a.name.as_str())
            .collect();
        let expected: Vec<&str> = PrinterAttribute::ALL.iter().map(|a| a.name()).collect();
        assert_eq!(named, expected);
    }
}
