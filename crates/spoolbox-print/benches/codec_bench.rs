// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Criterion benchmarks for the request parse, the full attribute table and
// chunked body decoding.

use std::time::Instant;

use chrono::Utc;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

use spoolbox_core::config::PrinterConfig;
use spoolbox_core::types::IppStatus;
use spoolbox_print::attributes::{AttributeContext, resolve_requested};
use spoolbox_print::codec::{
    AttributeWriter, TAG_OPERATION_ATTRIBUTES, TAG_PRINTER_ATTRIBUTES, VALUE_TAG_CHARSET,
    VALUE_TAG_KEYWORD, VALUE_TAG_NATURAL_LANGUAGE, VALUE_TAG_URI,
};
use spoolbox_print::http::{BodyDecoder, ChunkState};
use spoolbox_print::stream::{
    IPP_SUPPORTED_VERSION, IppParse, IppResponseBuilder, parse_ipp_request,
};

/// Get-Printer-Attributes asking for `requested` attribute names.
fn build_request(requested: &[&str]) -> Vec<u8> {
    let mut w = AttributeWriter::new();
    w.put_u16(IPP_SUPPORTED_VERSION)
        .put_u16(0x000B)
        .put_u32(42)
        .begin_group(TAG_OPERATION_ATTRIBUTES)
        .write_string(VALUE_TAG_CHARSET, "attributes-charset", "utf-8")
        .write_string(VALUE_TAG_NATURAL_LANGUAGE, "attributes-natural-language", "en")
        .write_string(VALUE_TAG_URI, "printer-uri", "ipp://spoolbox.local:631/spoolbox");
    for (i, name) in requested.iter().enumerate() {
        let attr_name = if i == 0 { "requested-attributes" } else { "" };
        w.write_string(VALUE_TAG_KEYWORD, attr_name, name);
    }
    w.end_of_attributes();
    w.into_bytes()
}

fn bench_parse_request(c: &mut Criterion) {
    let minimal = build_request(&[]);
    c.bench_function("parse_ipp_request (minimal)", |b| {
        b.iter(|| {
            let parsed = parse_ipp_request(black_box(&minimal));
            assert!(matches!(parsed, IppParse::Complete { .. }));
        });
    });

    let filtered = build_request(&[
        "printer-name",
        "printer-state",
        "printer-state-reasons",
        "document-format-supported",
        "printer-uri-supported",
        "printer-make-and-model",
    ]);
    c.bench_function("parse_ipp_request (requested-attributes)", |b| {
        b.iter(|| {
            let parsed = parse_ipp_request(black_box(&filtered));
            assert!(matches!(parsed, IppParse::Complete { .. }));
        });
    });
}

fn bench_full_attribute_table(c: &mut Criterion) {
    let printer = PrinterConfig::default();
    let ctx = AttributeContext {
        printer: &printer,
        ipp_authority: "spoolbox.local:631",
        http_authority: "spoolbox.local:80",
        booted_at: Instant::now(),
        config_changed_at: Utc::now(),
        queued_jobs: 0,
        accepting_jobs: true,
    };

    c.bench_function("get_printer_attributes (all)", |b| {
        b.iter(|| {
            let mut resp = IppResponseBuilder::new(IppStatus::SuccessfulOk, black_box(1), "utf-8");
            let w = resp.begin_group(TAG_PRINTER_ATTRIBUTES);
            for attr in resolve_requested(None) {
                attr.emit(&ctx, w);
            }
            black_box(resp.build());
        });
    });
}

fn bench_chunked_decode(c: &mut Criterion) {
    let mut body = Vec::new();
    for _ in 0..16 {
        body.extend_from_slice(b"100\r\n");
        body.extend_from_slice(&[0xABu8; 256]);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(b"0\r\n\r\n");

    c.bench_function("chunked decode (4 KiB)", |b| {
        b.iter(|| {
            let mut decoder = BodyDecoder::Chunked(ChunkState::Size { size: 0, digits: 0 });
            let mut out = Vec::with_capacity(4096);
            decoder.decode(black_box(&body), &mut out).unwrap();
            assert!(decoder.is_complete());
            black_box(out);
        });
    });
}

criterion_group!(
    benches,
    bench_parse_request,
    bench_full_attribute_table,
    bench_chunked_decode,
);
criterion_main!(benches);
