//! TracingHook: W3C trace context propagation and the pluggable span exporter.
//!
//! Replaces the Redis-stream span publisher this crate started from — this spec
//! calls for a console-by-default, OTLP-when-configured exporter, not a bespoke
//! stream transport, so spans ride the ordinary `tracing`/`opentelemetry` pipeline
//! instead.

use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry::Context as OtelContext;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Parsed W3C `traceparent` header: `00-<trace-id>-<parent-id>-<flags>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: TraceId,
    pub parent_id: SpanId,
    pub sampled: bool,
}

impl TraceParent {
    /// Parse a `traceparent` header value. Returns `None` on any malformed input;
    /// callers should then start a fresh trace rather than fail the request.
    pub fn parse(header: &str) -> Option<Self> {
        let parts: Vec<&str> = header.trim().split('-').collect();
        if parts.len() != 4 || parts[0] != "00" {
            return None;
        }

        let trace_id = TraceId::from_hex(parts[1]).ok()?;
        let parent_id = SpanId::from_hex(parts[2]).ok()?;
        let flags = u8::from_str_radix(parts[3], 16).ok()?;

        if trace_id == TraceId::INVALID || parent_id == SpanId::INVALID {
            return None;
        }

        Some(Self {
            trace_id,
            parent_id,
            sampled: flags & 0x01 == 1,
        })
    }

    /// Render back to the W3C wire format, for echoing on error responses.
    pub fn to_header(&self) -> String {
        format!(
            "00-{:032x}-{:016x}-{:02x}",
            u128::from_be_bytes(self.trace_id.to_bytes()),
            u64::from_be_bytes(self.parent_id.to_bytes()),
            self.sampled as u8
        )
    }
}

/// Continue an inbound trace (if `traceparent` was present and valid) or start a
/// fresh one, and attach the result as the current span's OpenTelemetry parent
/// context. Called once per request, before the handler body runs.
pub fn continue_or_start_trace(span: &Span, traceparent: Option<&str>) {
    let Some(parsed) = traceparent.and_then(TraceParent::parse) else {
        // No valid incoming context: the span already started a fresh trace of
        // its own via the normal tracing-opentelemetry layer.
        return;
    };

    let remote_context = SpanContext::new(
        parsed.trace_id,
        parsed.parent_id,
        if parsed.sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        },
        true,
        TraceState::default(),
    );

    let parent_cx = OtelContext::new().with_remote_span_context(remote_context);
    span.set_parent(parent_cx);
}

/// Initialize the global OpenTelemetry tracer pipeline.
///
/// When `otlp_endpoint` is `Some`, spans export over OTLP; otherwise they go
/// through the ordinary `tracing-subscriber` fmt layer to the console. Either way,
/// every handler's span is still visible via `tracing`; this only controls where
/// *additionally* exported spans end up.
pub fn init_span_exporter(
    otlp_endpoint: Option<&str>,
) -> Result<Option<opentelemetry_sdk::trace::TracerProvider>, opentelemetry::trace::TraceError> {
    let Some(endpoint) = otlp_endpoint else {
        tracing::debug!("OTEL_EXPORTER_OTLP_ENDPOINT unset: spans stay on the console exporter");
        return Ok(None);
    };

    tracing::info!(endpoint, "initializing OTLP span exporter");

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .build();

    Ok(Some(provider))
}
