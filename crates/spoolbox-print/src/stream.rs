// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-connection protocol stream: HTTP request head, then IPP body.
//
// IPP is transported over HTTP POST (RFC 8010 §3).  The stream buffers what
// the socket has delivered so far, and each call to `parse_request` either
// asks for more bytes, writes a complete response, or hands the connection
// over to job streaming (Print-Job).  Nothing here blocks or touches the
// socket; the multiplexer owns I/O.
//
// # Supported operations
//
//   - Print-Job              (0x0002)  RFC 8011 §4.2.1
//   - Validate-Job           (0x0004)  RFC 8011 §4.2.3
//   - Get-Printer-Attributes (0x000B)  RFC 8011 §4.2.5
//   - Identify-Printer       (0x003C)  PWG 5100.13 §4.1
//
// Everything else is answered with server-error-operation-not-supported.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use spoolbox_core::types::{IppStatus, Operation};

use crate::attributes::{AttributeContext, NATURAL_LANGUAGE, resolve_requested};
use crate::codec::{
    AttributeReader, AttributeWriter, FIRST_VALUE_TAG, TAG_END_OF_ATTRIBUTES,
    TAG_JOB_ATTRIBUTES, TAG_OPERATION_ATTRIBUTES, TAG_PRINTER_ATTRIBUTES, VALUE_TAG_CHARSET,
    VALUE_TAG_ENUM, VALUE_TAG_INTEGER, VALUE_TAG_KEYWORD, VALUE_TAG_NATURAL_LANGUAGE,
    VALUE_TAG_TEXT, VALUE_TAG_URI,
};
use crate::http::{
    self, BodyDecoder, CONTINUE, RequestHead, asset_head, asset_response, ipp_response_head,
    redirect_response, status_response,
};

/// The only protocol version this device speaks (major 2, minor 0).
pub const IPP_SUPPORTED_VERSION: u16 = 0x0200;

/// job-state: processing.
pub const JOB_STATE_PROCESSING: u32 = 5;

/// Charset assumed when the request did not negotiate one.
pub const DEFAULT_CHARSET: &str = "utf-8";

/// Printer icon served at `/icon.png`.
pub static ICON_PNG: &[u8] = include_bytes!("../assets/icon.png");

/// Size of the fixed IPP request header (version, operation, request id).
const IPP_HEADER_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Printer lookup
// ---------------------------------------------------------------------------

/// The set of printers a stream can route requests to.
pub trait PrinterDirectory {
    /// Index of the printer served at `/<name>`.
    fn find(&self, name: &str) -> Option<usize>;

    /// Attribute generation context for the printer at `index`.
    fn attribute_context(&self, index: usize) -> AttributeContext<'_>;
}

// ---------------------------------------------------------------------------
// Parsed IPP request
// ---------------------------------------------------------------------------

/// A parsed IPP request header plus its operation attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IppRequest {
    pub version: u16,
    pub operation_id: u16,
    pub request_id: u32,
    /// Operation attributes by name.  Empty when the group did not start with
    /// `attributes-charset`, `attributes-natural-language`.
    pub attributes: BTreeMap<String, BTreeSet<String>>,
}

impl IppRequest {
    /// First value of `attributes-charset`, if any.
    pub fn charset(&self) -> Option<&str> {
        self.attributes
            .get("attributes-charset")
            .and_then(|values| values.iter().next())
            .map(String::as_str)
    }
}

/// Outcome of scanning a buffered IPP body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IppParse {
    /// More bytes are needed.
    Incomplete,
    /// The header, and as much of the attribute section as is needed to
    /// answer, has been read; `consumed` bytes of the body belong to it.
    Complete { request: IppRequest, consumed: usize },
}

/// Parse the fixed header and the attribute section of an IPP request.
///
/// A version mismatch or zero request id completes after the 8-byte header,
/// since those requests are answered without looking at attributes.  An
/// attribute-order violation completes immediately with an empty set.
pub fn parse_ipp_request(body: &[u8]) -> IppParse {
    let mut r = AttributeReader::new(body);
    let (Some(version), Some(operation_id), Some(request_id)) =
        (r.read_u16(), r.read_u16(), r.read_u32())
    else {
        return IppParse::Incomplete;
    };
    let mut request = IppRequest {
        version,
        operation_id,
        request_id,
        attributes: BTreeMap::new(),
    };
    if version != IPP_SUPPORTED_VERSION || request_id == 0 {
        return IppParse::Complete {
            request,
            consumed: IPP_HEADER_LEN,
        };
    }

    match r.read_tag() {
        None => return IppParse::Incomplete,
        Some(TAG_OPERATION_ATTRIBUTES) => {}
        Some(_) => {
            return IppParse::Complete {
                request,
                consumed: r.position(),
            };
        }
    }

    let mut group = TAG_OPERATION_ATTRIBUTES;
    let mut name = String::new();
    let mut index = 0usize;
    loop {
        let Some(tag) = r.read_tag() else {
            return IppParse::Incomplete;
        };
        if tag < FIRST_VALUE_TAG {
            if tag == TAG_END_OF_ATTRIBUTES {
                break;
            }
            group = tag;
            continue;
        }
        let Some(attr) = r.read_attribute_body(tag) else {
            return IppParse::Incomplete;
        };
        if group != TAG_OPERATION_ATTRIBUTES {
            // Job/other groups are consumed but not modelled.
            continue;
        }
        if !attr.name.is_empty() {
            name = attr.name;
        }
        let out_of_order = (index == 0 && name != "attributes-charset")
            || (index == 1 && name != "attributes-natural-language");
        if out_of_order {
            debug!(index, name = %name, "operation attributes out of order");
            request.attributes.clear();
            return IppParse::Complete {
                request,
                consumed: r.position(),
            };
        }
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        debug!(tag = %format!("0x{tag:02X}"), name = %name, value = %value, "parsed IPP attribute");
        request
            .attributes
            .entry(name.clone())
            .or_default()
            .insert(value);
        index += 1;
    }

    IppParse::Complete {
        request,
        consumed: r.position(),
    }
}

// ---------------------------------------------------------------------------
// IPP response builder
// ---------------------------------------------------------------------------

/// Builder for IPP response messages (RFC 8010 §3.4).
///
/// Starts with the header and the mandatory operation-attributes group.
pub struct IppResponseBuilder {
    writer: AttributeWriter,
}

impl IppResponseBuilder {
    pub fn new(status: IppStatus, request_id: u32, charset: &str) -> Self {
        let mut writer = AttributeWriter::with_capacity(256);
        writer
            .put_u16(IPP_SUPPORTED_VERSION)
            .put_u16(status.code())
            .put_u32(request_id)
            .begin_group(TAG_OPERATION_ATTRIBUTES)
            .write_string(VALUE_TAG_CHARSET, "attributes-charset", charset)
            .write_string(
                VALUE_TAG_NATURAL_LANGUAGE,
                "attributes-natural-language",
                NATURAL_LANGUAGE,
            );
        Self { writer }
    }

    /// Writer positioned after everything written so far.
    pub fn attributes(&mut self) -> &mut AttributeWriter {
        &mut self.writer
    }

    /// Start a new attribute group.
    pub fn begin_group(&mut self, delimiter: u8) -> &mut AttributeWriter {
        self.writer.begin_group(delimiter)
    }

    /// Finalise the response: write end-of-attributes tag and return bytes.
    pub fn build(mut self) -> Vec<u8> {
        self.writer.end_of_attributes();
        self.writer.into_bytes()
    }
}

/// Build a minimal error response with the given status code.
pub fn build_error_response(status: IppStatus, request_id: u32, charset: &str, message: &str) -> Vec<u8> {
    let mut resp = IppResponseBuilder::new(status, request_id, charset);
    resp.attributes()
        .write_string(VALUE_TAG_TEXT, "status-message", message);
    resp.build()
}

/// Build the Print-Job acknowledgement for a freshly started job.
pub fn build_print_job_response(request_id: u32, charset: &str, printer_uri: &str, job_id: u32) -> Vec<u8> {
    let mut resp = IppResponseBuilder::new(IppStatus::SuccessfulOk, request_id, charset);
    resp.begin_group(TAG_JOB_ATTRIBUTES)
        .write_four_byte(VALUE_TAG_INTEGER, "job-id", job_id)
        .write_string(VALUE_TAG_URI, "job-uri", &format!("{printer_uri}/jobs/{job_id}"))
        .write_four_byte(VALUE_TAG_ENUM, "job-state", JOB_STATE_PROCESSING)
        .write_string(VALUE_TAG_KEYWORD, "job-state-reasons", "none");
    resp.build()
}

// ---------------------------------------------------------------------------
// Protocol stream
// ---------------------------------------------------------------------------

/// What the connection should do after a `parse_request` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    /// Nothing to answer yet; read more.  `out` may still hold an interim
    /// `100 Continue`.
    NeedMore,
    /// A complete response was written; close once it is flushed.
    Finished,
    /// A valid Print-Job: the caller starts a job on `printer`, answers with
    /// [`IppStream::respond_print_job`] and streams the rest of the body into
    /// the job.
    PrintJob {
        printer: usize,
        request_id: u32,
        charset: String,
        printer_uri: String,
    },
}

/// Document bytes still to be stored for a streaming connection.
#[derive(Debug)]
pub struct DocumentBody {
    /// How the remaining socket bytes are delimited.
    pub decoder: BodyDecoder,
    /// Decoded document bytes already received.
    pub buffered: Vec<u8>,
}

impl DocumentBody {
    /// Body of a raw-port upload: everything until the client closes.
    pub fn until_close() -> Self {
        Self {
            decoder: BodyDecoder::UntilClose,
            buffered: Vec::new(),
        }
    }
}

#[derive(Debug)]
enum StreamState {
    /// Accumulating the HTTP request head.
    Header { raw: Vec<u8> },
    /// Head parsed; accumulating the decoded IPP body for `printer`.
    Body {
        printer: usize,
        decoder: BodyDecoder,
        body: Vec<u8>,
    },
}

/// Request parser and response composer for one connection.
#[derive(Debug)]
pub struct IppStream {
    state: StreamState,
    max_request_bytes: usize,
    sent_continue: bool,
}

impl IppStream {
    pub fn new(max_request_bytes: usize) -> Self {
        Self {
            state: StreamState::Header { raw: Vec::new() },
            max_request_bytes,
            sent_continue: false,
        }
    }

    /// True while the HTTP head is still incomplete.
    pub fn in_header(&self) -> bool {
        matches!(self.state, StreamState::Header { .. })
    }

    /// Feed newly received bytes and try to make progress.
    ///
    /// Response bytes are appended to `out`.
    pub fn parse_request<D: PrinterDirectory + ?Sized>(
        &mut self,
        input: &[u8],
        printers: &D,
        out: &mut Vec<u8>,
    ) -> Exchange {
        let leftover = match &mut self.state {
            StreamState::Header { raw } => {
                raw.extend_from_slice(input);
                let head = match http::parse_request_head(raw) {
                    Ok(Some(head)) => head,
                    Ok(None) if raw.len() > self.max_request_bytes => {
                        warn!(bytes = raw.len(), "HTTP request head too large");
                        out.extend_from_slice(&status_response(400, "Bad Request"));
                        return Exchange::Finished;
                    }
                    Ok(None) => return Exchange::NeedMore,
                    Err(e) => {
                        warn!(error = %e, "malformed HTTP request");
                        out.extend_from_slice(&status_response(400, "Bad Request"));
                        return Exchange::Finished;
                    }
                };
                let leftover = raw.split_off(head.head_len);
                match self.route(&head, printers, out) {
                    Some(printer) => {
                        self.state = StreamState::Body {
                            printer,
                            decoder: head.body_decoder(),
                            body: Vec::new(),
                        };
                        leftover
                    }
                    None => return Exchange::Finished,
                }
            }
            StreamState::Body { .. } => input.to_vec(),
        };

        let StreamState::Body {
            printer,
            decoder,
            body,
        } = &mut self.state
        else {
            return Exchange::NeedMore;
        };
        if let Err(e) = decoder.decode(&leftover, body) {
            warn!(error = %e, "malformed HTTP body framing");
            self.respond_error(
                IppStatus::ClientErrorBadRequest,
                0,
                DEFAULT_CHARSET,
                "Malformed HTTP body",
                out,
            );
            return Exchange::Finished;
        }

        let printer = *printer;
        let (request, consumed) = match parse_ipp_request(body) {
            IppParse::Complete { request, consumed } => (request, consumed),
            IppParse::Incomplete => {
                if body.len() > self.max_request_bytes || decoder.is_complete() {
                    warn!(bytes = body.len(), "IPP attribute section truncated or too large");
                    let response = build_error_response(
                        IppStatus::ClientErrorBadRequest,
                        0,
                        DEFAULT_CHARSET,
                        "Truncated or oversized IPP request",
                    );
                    self.write_ipp(out, &response);
                    return Exchange::Finished;
                }
                return Exchange::NeedMore;
            }
        };
        body.drain(..consumed);

        self.dispatch(&request, printer, printers, out)
    }

    /// Write the Print-Job acknowledgement for job `job_id`.
    pub fn respond_print_job(
        &mut self,
        request_id: u32,
        charset: &str,
        printer_uri: &str,
        job_id: u32,
        out: &mut Vec<u8>,
    ) {
        let response = build_print_job_response(request_id, charset, printer_uri, job_id);
        self.write_ipp(out, &response);
    }

    /// Write an IPP error response (e.g. the job could not be started).
    pub fn respond_error(
        &mut self,
        status: IppStatus,
        request_id: u32,
        charset: &str,
        message: &str,
        out: &mut Vec<u8>,
    ) {
        debug!(status = status.keyword(), request_id, detail = message, "IPP error response");
        let response = build_error_response(status, request_id, charset, message);
        self.write_ipp(out, &response);
    }

    /// Hand the rest of the request body over to job streaming.
    pub fn into_document(self) -> DocumentBody {
        match self.state {
            StreamState::Body { decoder, body, .. } => DocumentBody {
                decoder,
                buffered: body,
            },
            StreamState::Header { .. } => DocumentBody {
                decoder: BodyDecoder::Length { remaining: 0 },
                buffered: Vec::new(),
            },
        }
    }

    /// Route a parsed head.  Returns the printer index when the request is an
    /// IPP POST whose body should be parsed; otherwise a complete HTTP
    /// response has been written.
    fn route<D: PrinterDirectory + ?Sized>(
        &mut self,
        head: &RequestHead,
        printers: &D,
        out: &mut Vec<u8>,
    ) -> Option<usize> {
        let path = head.path.split('?').next().unwrap_or_default();
        debug!(method = %head.method, path, "HTTP request");

        match head.method.as_str() {
            "GET" | "HEAD" => {
                match path {
                    "/icon.png" if head.method == "HEAD" => {
                        out.extend_from_slice(&asset_head("image/png", ICON_PNG.len()))
                    }
                    "/icon.png" => out.extend_from_slice(&asset_response("image/png", ICON_PNG)),
                    "/info.html" => {
                        let ctx = printers.attribute_context(0);
                        out.extend_from_slice(&redirect_response(&ctx.printer.more_info_url));
                    }
                    _ => out.extend_from_slice(&status_response(404, "Not Found")),
                }
                None
            }
            "POST" => {
                let name = path.strip_prefix('/').unwrap_or(path);
                let Some(printer) = printers.find(name) else {
                    out.extend_from_slice(&status_response(404, "Not Found"));
                    return None;
                };
                if head.expect_continue && !self.sent_continue {
                    out.extend_from_slice(CONTINUE);
                    self.sent_continue = true;
                }
                Some(printer)
            }
            _ => {
                out.extend_from_slice(&status_response(405, "Method Not Allowed"));
                None
            }
        }
    }

    fn dispatch<D: PrinterDirectory + ?Sized>(
        &mut self,
        request: &IppRequest,
        printer: usize,
        printers: &D,
        out: &mut Vec<u8>,
    ) -> Exchange {
        info!(
            version = %format!("0x{:04X}", request.version),
            operation_id = %format!("0x{:04X}", request.operation_id),
            request_id = request.request_id,
            "received IPP request"
        );

        if request.version != IPP_SUPPORTED_VERSION {
            warn!(version = %format!("0x{:04X}", request.version), "unsupported IPP version");
            self.respond_error(
                IppStatus::ServerErrorVersionNotSupported,
                request.request_id,
                DEFAULT_CHARSET,
                "Only IPP/2.0 is supported",
                out,
            );
            return Exchange::Finished;
        }
        // request-id must not be 0 (RFC 8011 §4.1.2).
        if request.request_id == 0 {
            self.respond_error(
                IppStatus::ClientErrorBadRequest,
                request.request_id,
                DEFAULT_CHARSET,
                "request-id must not be zero",
                out,
            );
            return Exchange::Finished;
        }
        if request.attributes.is_empty() || !request.attributes.contains_key("printer-uri") {
            self.respond_error(
                IppStatus::ClientErrorBadRequest,
                request.request_id,
                DEFAULT_CHARSET,
                "Missing or misordered operation attributes",
                out,
            );
            return Exchange::Finished;
        }

        let charset = request.charset().unwrap_or(DEFAULT_CHARSET).to_string();
        match Operation::from_code(request.operation_id) {
            Some(Operation::IdentifyPrinter) => {
                debug!("Identify-Printer");
                let resp = IppResponseBuilder::new(IppStatus::SuccessfulOk, request.request_id, &charset);
                self.write_ipp(out, &resp.build());
                Exchange::Finished
            }
            Some(Operation::GetPrinterAttributes) => {
                let ctx = printers.attribute_context(printer);
                let wanted = resolve_requested(request.attributes.get("requested-attributes"));
                debug!(count = wanted.len(), "Get-Printer-Attributes");
                let mut resp = IppResponseBuilder::new(IppStatus::SuccessfulOk, request.request_id, &charset);
                let w = resp.begin_group(TAG_PRINTER_ATTRIBUTES);
                for attr in wanted {
                    attr.emit(&ctx, w);
                }
                self.write_ipp(out, &resp.build());
                Exchange::Finished
            }
            Some(Operation::PrintJob) => {
                debug!("Print-Job");
                let printer_uri = printers.attribute_context(printer).printer_uri();
                Exchange::PrintJob {
                    printer,
                    request_id: request.request_id,
                    charset,
                    printer_uri,
                }
            }
            Some(Operation::ValidateJob) => {
                debug!("Validate-Job");
                let resp = IppResponseBuilder::new(IppStatus::SuccessfulOk, request.request_id, &charset);
                self.write_ipp(out, &resp.build());
                Exchange::Finished
            }
            _ => {
                warn!(
                    operation = %format!("0x{:04X}", request.operation_id),
                    "unsupported IPP operation"
                );
                self.respond_error(
                    IppStatus::ServerErrorOperationNotSupported,
                    request.request_id,
                    DEFAULT_CHARSET,
                    &format!("Operation 0x{:04X} is not supported", request.operation_id),
                    out,
                );
                Exchange::Finished
            }
        }
    }

    /// Frame an IPP body with `100 Continue` (once) and `200 OK`.
    fn write_ipp(&mut self, out: &mut Vec<u8>, ipp_body: &[u8]) {
        if !self.sent_continue {
            out.extend_from_slice(CONTINUE);
            self.sent_continue = true;
        }
        out.extend_from_slice(ipp_response_head(ipp_body.len()).as_bytes());
        out.extend_from_slice(ipp_body);
    }
}
