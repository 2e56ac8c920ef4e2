use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::boundary::{contains_ignore_case, detect_header_boundary_with, REQUEST_METHODS, RESPONSE_PREFIX};
use crate::chunked::{analyze_chunked_structure, ChunkedAnalysisResult};
use crate::config::ScanConfig;
use crate::content_length::{detect_content_encoding, is_chunked, parse_content_length, EncodingType};
use crate::error::ScanError;
use crate::mask::MaskSpec;

/// Chunked sample covers at most this many data chunks.
const SAMPLED_CHUNKS: usize = 3;
/// Ceiling for results built on a truncated chunked body.
const INCOMPLETE_CHUNKED_CONFIDENCE: f32 = 0.6;
const START_LINE_CONFIDENCE: f32 = 0.9;
const HEADER_HINT_CONFIDENCE: f32 = 0.5;
const MIN_HEADER_HINTS: usize = 2;

const HEADER_HINTS: &[&[u8]] = &[
    b"host:", b"user-agent:", b"accept:", b"content-type:", b"content-length:",
    b"transfer-encoding:", b"connection:", b"server:", b"cache-control:", b"set-cookie:",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanResult {
    pub is_http:           bool,
    /// Position of the blank-line sequence, -1 when none was found.
    pub header_boundary:   isize,
    pub body_start:        Option<usize>,
    pub confidence:        f32,
    pub message_type:      MessageType,
    pub content_length:    Option<u64>,
    pub is_chunked:        bool,
    pub content_encodings: Vec<EncodingType>,
    pub preserve_bytes:    Option<usize>,
    pub preserve_strategy: String,
    pub warnings:          Vec<String>,
}

impl ScanResult {
    /// Trust nothing, keep everything.
    pub fn conservative() -> Self {
        Self {
            is_http:           false,
            header_boundary:   -1,
            body_start:        None,
            confidence:        0.0,
            message_type:      MessageType::Unknown,
            content_length:    None,
            is_chunked:        false,
            content_encodings: Vec::new(),
            preserve_bytes:    None,
            preserve_strategy: "keep_all".into(),
            warnings:          Vec::new(),
        }
    }
}

/// Two-call contract shared by every payload scanner.
pub trait PayloadScanner: Send + Sync {
    fn name(&self) -> &str;
    fn scan(&self, payload: &[u8]) -> ScanResult;
    fn generate_mask(&self, payload: &[u8], result: &ScanResult) -> MaskSpec;
}

// ─── HTTP ─────────────────────────────────────────────────────────────────────

struct ProtocolFeatures {
    message_type: MessageType,
    confidence:   f32,
    chunked_hint: bool,
}

fn scan_features(window: &[u8]) -> Option<ProtocolFeatures> {
    let chunked_hint = is_chunked(window);
    let start_line = if REQUEST_METHODS.iter().any(|m| window.starts_with(m)) {
        Some(MessageType::Request)
    } else if window.starts_with(RESPONSE_PREFIX) {
        Some(MessageType::Response)
    } else {
        None
    };
    if let Some(message_type) = start_line {
        return Some(ProtocolFeatures { message_type, confidence: START_LINE_CONFIDENCE, chunked_hint });
    }

    let hints = HEADER_HINTS.iter().filter(|h| contains_ignore_case(window, h)).count();
    (hints >= MIN_HEADER_HINTS).then_some(ProtocolFeatures {
        message_type: MessageType::Unknown,
        confidence: HEADER_HINT_CONFIDENCE,
        chunked_hint,
    })
}

#[derive(Debug, Clone, Default)]
pub struct HttpScanner {
    config: ScanConfig,
}

impl HttpScanner {
    pub fn new(config: ScanConfig) -> Self { Self { config } }

    pub fn config(&self) -> &ScanConfig { &self.config }

    /// Stages 2-4. Any error here collapses to the conservative result.
    fn analyze(&self, payload: &[u8], features: ProtocolFeatures) -> Result<ScanResult, ScanError> {
        let cfg = &self.config;
        let len = payload.len();
        let boundary = detect_header_boundary_with(payload, 0, cfg.max_scan_window, &cfg.boundary_weights);

        let mut result = ScanResult {
            is_http:      true,
            message_type: features.message_type,
            confidence:   features.confidence,
            is_chunked:   features.chunked_hint,
            warnings:     boundary.warnings.clone(),
            ..ScanResult::conservative()
        };

        if !boundary.found {
            result.confidence = features.confidence / 2.0;
            result.warnings.push("header boundary not found; payload kept whole".into());
            return Ok(result);
        }

        let body_start = boundary.body_start_position();
        let header = payload.get(..body_start)
            .ok_or(ScanError::OutOfBounds { what: "body start", offset: body_start, len })?;
        result.header_boundary = isize::try_from(boundary.position)
            .map_err(|_| ScanError::Overflow("header boundary"))?;
        result.body_start = Some(body_start);
        result.confidence = (features.confidence + boundary.confidence) / 2.0;
        result.content_encodings = detect_content_encoding(header);
        if result.is_chunked && !is_chunked(header) {
            result.warnings.push("chunked indicator found outside the header block".into());
        }

        let declared = parse_content_length(header);
        if declared.is_plausible() {
            result.content_length = declared.length;
        } else if declared.found {
            result.warnings.push(format!("implausible Content-Length {:?} ignored", declared.length));
        }

        // Stage 3: how much of the message must survive masking.
        let (preserve, strategy) = if result.is_chunked {
            let chunks = analyze_chunked_structure(payload, body_start, cfg.max_chunks_to_analyze);
            if chunks.parsing_errors > 0 {
                result.warnings.push(format!("{} malformed chunk lines skipped", chunks.parsing_errors));
            }
            if chunks.is_complete {
                (self.chunked_sample_end(body_start, &chunks)?, "chunked_complete_sample")
            } else {
                result.confidence = result.confidence.min(INCOMPLETE_CHUNKED_CONFIDENCE);
                (self.chunked_conservative_end(len, body_start, &chunks)?, "chunked_incomplete_conservative")
            }
        } else if let Some(length) = result.content_length {
            let sample = usize::try_from(length).map_or(cfg.body_sample_size, |n| n.min(cfg.body_sample_size));
            let end = body_start.checked_add(sample).ok_or(ScanError::Overflow("body sample end"))?;
            (end, "header_plus_body_sample")
        } else {
            (body_start, "header_only")
        };

        // Stage 4: physical bounds only; confidence may not rise here.
        result.preserve_bytes = Some(self.clamp_preserve(preserve, boundary.position, body_start, len));
        result.preserve_strategy = strategy.into();
        result.confidence = result.confidence.clamp(0.0, 1.0);
        Ok(result)
    }

    /// Header plus the wire bytes of the first few chunks, within the sample budget.
    fn chunked_sample_end(&self, body_start: usize, chunks: &ChunkedAnalysisResult) -> Result<usize, ScanError> {
        let mut budget = self.config.chunked_sample_size;
        let mut end = body_start;
        for chunk in chunks.data_chunks().take(SAMPLED_CHUNKS) {
            if budget == 0 { break; }
            let wire = chunk.wire_range();
            let take = wire.len().min(budget);
            end = wire.start.checked_add(take).ok_or(ScanError::Overflow("chunk sample end"))?;
            budget -= take;
        }
        Ok(end)
    }

    /// Parsed chunks count fully; the unparsed tail is kept at the conservative ratio.
    fn chunked_conservative_end(&self, len: usize, body_start: usize, chunks: &ChunkedAnalysisResult) -> Result<usize, ScanError> {
        let parsed_end = chunks.consumed_until.max(body_start);
        if parsed_end > len {
            return Err(ScanError::OutOfBounds { what: "parsed chunk end", offset: parsed_end, len });
        }
        let remainder = len - parsed_end;
        let kept = (remainder as f64 * self.config.conservative_preserve_ratio).floor() as usize;
        Ok(parsed_end + kept.min(remainder))
    }

    /// The configured ceiling never cuts into the header block.
    fn clamp_preserve(&self, preserve: usize, header_boundary: usize, body_start: usize, len: usize) -> usize {
        let capped = match self.config.max_preserve_bytes {
            Some(max) => preserve.min(max.max(body_start)),
            None      => preserve,
        };
        let floor = self.config.min_preserve_bytes.min(header_boundary.saturating_add(4));
        capped.max(floor).min(len)
    }
}

/// Collapse a failed analysis into the conservative result.
fn settle(analysis: Result<ScanResult, ScanError>) -> ScanResult {
    match analysis {
        Ok(result) => {
            debug!(
                boundary = result.header_boundary,
                confidence = result.confidence,
                strategy = %result.preserve_strategy,
                preserve = ?result.preserve_bytes,
                "scanned HTTP payload"
            );
            result
        }
        Err(e) => {
            warn!("scan failed, keeping payload: {}", e);
            let mut result = ScanResult::conservative();
            result.warnings.push(e.to_string());
            result
        }
    }
}

impl PayloadScanner for HttpScanner {
    fn name(&self) -> &str { "http" }

    fn scan(&self, payload: &[u8]) -> ScanResult {
        let window = &payload[..payload.len().min(self.config.max_scan_window)];
        let Some(features) = scan_features(window) else {
            debug!(len = payload.len(), "no HTTP features found");
            return ScanResult::conservative();
        };
        settle(self.analyze(payload, features))
    }

    fn generate_mask(&self, payload: &[u8], result: &ScanResult) -> MaskSpec {
        match result.preserve_bytes {
            Some(keep_bytes)
                if result.is_http
                    && result.confidence >= self.config.confidence_threshold
                    && keep_bytes < payload.len() => MaskSpec::MaskAfter { keep_bytes },
            _ => MaskSpec::KeepAll,
        }
    }
}

// ─── Passthrough ──────────────────────────────────────────────────────────────

/// Never masks. Useful as a baseline run.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughScanner;

impl PayloadScanner for PassthroughScanner {
    fn name(&self) -> &str { "passthrough" }

    fn scan(&self, _payload: &[u8]) -> ScanResult { ScanResult::conservative() }

    fn generate_mask(&self, _payload: &[u8], _result: &ScanResult) -> MaskSpec { MaskSpec::KeepAll }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Scanners by name. Built once at startup and handed out by reference.
#[derive(Default)]
pub struct ScannerRegistry {
    scanners: BTreeMap<String, Box<dyn PayloadScanner>>,
}

impl ScannerRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn with_defaults(config: ScanConfig) -> Self {
        let mut reg = Self::new();
        reg.register(Box::new(HttpScanner::new(config)));
        reg.register(Box::new(PassthroughScanner));
        reg
    }

    /// Returns the scanner previously registered under the same name.
    pub fn register(&mut self, scanner: Box<dyn PayloadScanner>) -> Option<Box<dyn PayloadScanner>> {
        self.scanners.insert(scanner.name().to_string(), scanner)
    }

    pub fn get(&self, name: &str) -> Option<&dyn PayloadScanner> {
        self.scanners.get(name).map(|s| s.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scanners.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scanner() -> HttpScanner { HttpScanner::default() }

    fn encode_chunks(parts: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in parts {
            out.extend_from_slice(format!("{:x}\r\n", p.len()).as_bytes());
            out.extend_from_slice(p);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0\r\n\r\n");
        out
    }

    #[test]
    fn not_http_is_conservative() {
        let r = scanner().scan(b"not http at all");
        assert!(!r.is_http);
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.header_boundary, -1);
        assert_eq!(scanner().generate_mask(b"not http at all", &r), MaskSpec::KeepAll);
    }

    #[test]
    fn request_with_content_length_keeps_header_and_sample() {
        let header = b"POST /login HTTP/1.1\r\nHost: a\r\nContent-Length: 200\r\n\r\n";
        let mut p = header.to_vec();
        p.extend_from_slice(&[b's'; 200]);

        let s = scanner();
        let r = s.scan(&p);
        assert!(r.is_http);
        assert_eq!(r.message_type, MessageType::Request);
        assert_eq!(r.header_boundary, (header.len() - 4) as isize);
        assert_eq!(r.body_start, Some(header.len()));
        assert_eq!(r.content_length, Some(200));
        assert_eq!(r.preserve_strategy, "header_plus_body_sample");
        assert_eq!(r.preserve_bytes, Some(header.len() + 64));
        assert!((r.confidence - 0.95).abs() < 1e-6);
        assert_eq!(s.generate_mask(&p, &r), MaskSpec::MaskAfter { keep_bytes: header.len() + 64 });
    }

    #[test]
    fn short_body_is_kept_whole() {
        let p = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let r = scanner().scan(p);
        assert_eq!(r.message_type, MessageType::Response);
        assert_eq!(r.preserve_bytes, Some(p.len()));
        assert_eq!(scanner().generate_mask(p, &r), MaskSpec::KeepAll);
    }

    #[test]
    fn header_only_without_length() {
        let header = b"GET /a HTTP/1.1\r\nHost: example.org\r\n\r\n";
        let mut p = header.to_vec();
        p.extend_from_slice(b"unexpected trailing bytes");
        let r = scanner().scan(&p);
        assert_eq!(r.preserve_strategy, "header_only");
        assert_eq!(r.preserve_bytes, Some(header.len()));
    }

    #[test]
    fn complete_chunked_body_keeps_sample() {
        let header = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let big = vec![b'z'; 2000];
        let mut p = header.to_vec();
        p.extend_from_slice(&encode_chunks(&[b"hello", b" world", &big, b"tail"]));

        let r = scanner().scan(&p);
        assert!(r.is_chunked);
        assert_eq!(r.preserve_strategy, "chunked_complete_sample");
        // 10 + 11 wire bytes of the first two chunks, then 1003 of the third.
        assert_eq!(r.preserve_bytes, Some(header.len() + 1024));
        assert!(matches!(scanner().generate_mask(&p, &r), MaskSpec::MaskAfter { .. }));
    }

    #[test]
    fn truncated_chunked_body_is_conservative() {
        let header = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let mut p = header.to_vec();
        p.extend_from_slice(b"5\r\nhello\r\n64\r\n");
        p.extend_from_slice(&[b'x'; 50]);

        let r = scanner().scan(&p);
        assert_eq!(r.preserve_strategy, "chunked_incomplete_conservative");
        // 54 unparsed bytes at 0.8 keep 43.
        assert_eq!(r.preserve_bytes, Some(header.len() + 10 + 43));
        assert!(r.confidence <= INCOMPLETE_CHUNKED_CONFIDENCE);
    }

    #[test]
    fn header_hints_without_start_line() {
        let mut p = b"Host: a\r\nUser-Agent: curl\r\n\r\n".to_vec();
        p.extend_from_slice(&[b'q'; 100]);
        let r = scanner().scan(&p);
        assert!(r.is_http);
        assert_eq!(r.message_type, MessageType::Unknown);
        assert!((r.confidence - 0.75).abs() < 1e-6);
        assert_eq!(r.preserve_bytes, Some(29));
    }

    #[test]
    fn missing_boundary_halves_confidence_and_keeps_all() {
        let p = b"GET / HTTP/1.1\r\nHost: a\r\nCookie: secret";
        let r = scanner().scan(p);
        assert!(r.is_http);
        assert_eq!(r.header_boundary, -1);
        assert!((r.confidence - 0.45).abs() < 1e-6);
        assert_eq!(r.preserve_bytes, None);
        assert_eq!(scanner().generate_mask(p, &r), MaskSpec::KeepAll);
    }

    #[test]
    fn threshold_gates_masking() {
        let mut p = b"POST / HTTP/1.1\r\nContent-Length: 500\r\n\r\n".to_vec();
        p.extend_from_slice(&[0x41; 500]);
        let strict = HttpScanner::new(ScanConfig { confidence_threshold: 0.99, ..ScanConfig::default() });
        let r = strict.scan(&p);
        assert_eq!(strict.generate_mask(&p, &r), MaskSpec::KeepAll);
    }

    #[test]
    fn max_preserve_caps_result() {
        let header = b"POST / HTTP/1.1\r\nContent-Length: 500\r\n\r\n";
        let mut p = header.to_vec();
        p.extend_from_slice(&[0x41; 500]);
        let capped = HttpScanner::new(ScanConfig { min_preserve_bytes: 16, max_preserve_bytes: Some(50), ..ScanConfig::default() });
        assert_eq!(capped.scan(&p).preserve_bytes, Some(50));
    }

    #[test]
    fn max_preserve_never_cuts_into_header() {
        let header = b"POST / HTTP/1.1\r\nContent-Length: 500\r\n\r\n";
        let mut p = header.to_vec();
        p.extend_from_slice(&[0x41; 500]);
        let capped = HttpScanner::new(ScanConfig { min_preserve_bytes: 16, max_preserve_bytes: Some(20), ..ScanConfig::default() });
        let r = capped.scan(&p);
        assert_eq!(r.preserve_bytes, Some(header.len()));
        assert_eq!(capped.generate_mask(&p, &r), MaskSpec::MaskAfter { keep_bytes: header.len() });
    }

    #[test]
    fn chunked_indicator_in_body_takes_chunked_branch() {
        let header = b"POST /upload HTTP/1.1\r\nContent-Length: 300\r\n\r\n";
        let mut p = header.to_vec();
        p.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        p.extend_from_slice(&[b'b'; 272]);

        let r = scanner().scan(&p);
        assert!(r.is_chunked);
        assert_eq!(r.content_length, Some(300));
        assert_eq!(r.preserve_strategy, "chunked_incomplete_conservative");
        // Nothing parses as a chunk, so 0.8 of the 300 body bytes survive.
        assert_eq!(r.preserve_bytes, Some(header.len() + 240));
        assert!(r.confidence <= INCOMPLETE_CHUNKED_CONFIDENCE);
        assert!(r.warnings.iter().any(|w| w == "chunked indicator found outside the header block"));
    }

    #[test]
    fn chunked_header_has_no_outside_warning() {
        let p = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        let r = scanner().scan(p);
        assert!(r.is_chunked);
        assert!(!r.warnings.iter().any(|w| w.contains("outside the header block")));
    }

    #[test]
    fn analysis_errors_become_conservative() {
        let r = settle(Err(ScanError::OutOfBounds { what: "parsed chunk end", offset: 90, len: 80 }));
        assert_eq!(r, ScanResult { warnings: r.warnings.clone(), ..ScanResult::conservative() });
        assert_eq!(r.warnings, vec!["parsed chunk end at 90 lies beyond payload of 80 bytes".to_string()]);
        assert_eq!(scanner().generate_mask(&[0; 100], &r), MaskSpec::KeepAll);

        let r = settle(Err(ScanError::Overflow("body sample end")));
        assert!(!r.is_http);
        assert_eq!(r.preserve_bytes, None);
    }

    #[test]
    fn implausible_length_is_ignored() {
        let mut p = b"POST / HTTP/1.1\r\nContent-Length: 20000000000\r\n\r\n".to_vec();
        p.extend_from_slice(&[1; 80]);
        let r = scanner().scan(&p);
        assert_eq!(r.content_length, None);
        assert_eq!(r.preserve_strategy, "header_only");
        assert!(r.warnings.iter().any(|w| w.contains("implausible")));
    }

    fn looks_like_http(p: &[u8]) -> bool {
        REQUEST_METHODS.iter().any(|m| p.starts_with(m))
            || p.starts_with(RESPONSE_PREFIX)
            || HEADER_HINTS.iter().filter(|h| contains_ignore_case(p, h)).count() >= MIN_HEADER_HINTS
    }

    proptest! {
        #[test]
        fn payloads_without_http_features_are_conservative(p in proptest::collection::vec(any::<u8>(), 0..1024)) {
            prop_assume!(!looks_like_http(&p));
            let s = scanner();
            let r = s.scan(&p);
            prop_assert!(!r.is_http);
            prop_assert_eq!(r.confidence, 0.0);
            prop_assert_eq!(r.header_boundary, -1);
            prop_assert_eq!(s.generate_mask(&p, &r), MaskSpec::KeepAll);
        }

        #[test]
        fn single_hint_in_text_is_not_http(
            prefix in "[a-z ]{0,40}",
            hint in proptest::sample::select(HEADER_HINTS.to_vec()),
            suffix in "[a-z0-9 \r\n]{0,200}",
        ) {
            let mut p = prefix.into_bytes();
            p.extend_from_slice(hint);
            p.extend_from_slice(suffix.as_bytes());
            prop_assume!(!looks_like_http(&p));
            let r = scanner().scan(&p);
            prop_assert!(!r.is_http);
            prop_assert_eq!(r.header_boundary, -1);
        }
    }

    #[test]
    fn registry_dispatch() {
        let reg = ScannerRegistry::with_defaults(ScanConfig::default());
        assert_eq!(reg.names().collect::<Vec<_>>(), vec!["http", "passthrough"]);
        let p = b"HTTP/1.1 200 OK\r\nContent-Length: 300\r\n\r\n";
        let mut full = p.to_vec();
        full.extend_from_slice(&[7; 300]);

        let pass = reg.get("passthrough").unwrap();
        assert_eq!(pass.generate_mask(&full, &pass.scan(&full)), MaskSpec::KeepAll);
        let http = reg.get("http").unwrap();
        assert!(matches!(http.generate_mask(&full, &http.scan(&full)), MaskSpec::MaskAfter { .. }));
        assert!(reg.get("tls").is_none());
    }
}
