use memchr::memmem;
use serde::Serialize;

use crate::config::BoundaryWeights;
use crate::content_length::parse_content_length;

/// Plausible header-block length, measured from the scan start.
const PLAUSIBLE_HEADER_LEN: std::ops::RangeInclusive<usize> = 10..=2048;
const OVERSIZE_HEADER_LEN: usize = 8192;
/// Bytes before the boundary searched for well-known header names.
const HEADER_TOKEN_LOOKBACK: usize = 200;
/// Hard cap on messages walked in one pipelined payload.
pub const MAX_MESSAGES: usize = 16;

pub(crate) const REQUEST_METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ",
    b"OPTIONS ", b"PATCH ", b"CONNECT ", b"TRACE ",
];
pub(crate) const RESPONSE_PREFIX: &[u8] = b"HTTP/1.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BoundaryPattern {
    CrlfCrlf,
    CrlfLf,
    LfLf,
}

impl BoundaryPattern {
    /// Priority order. The first pattern present wins, wherever it sits.
    pub const ALL: [BoundaryPattern; 3] = [Self::CrlfCrlf, Self::CrlfLf, Self::LfLf];

    pub fn bytes(self) -> &'static [u8] {
        match self {
            Self::CrlfCrlf => b"\r\n\r\n",
            Self::CrlfLf   => b"\r\n\n",
            Self::LfLf     => b"\n\n",
        }
    }

    pub fn length(self) -> usize { self.bytes().len() }

    fn method(self) -> &'static str {
        match self {
            Self::CrlfCrlf => "pattern_crlf_crlf",
            Self::CrlfLf   => "pattern_crlf_lf",
            Self::LfLf     => "pattern_lf_lf",
        }
    }

    fn bonus(self, w: &BoundaryWeights) -> f32 {
        match self {
            Self::CrlfCrlf => w.crlf_crlf_bonus,
            Self::CrlfLf   => w.crlf_lf_bonus,
            Self::LfLf     => w.lf_lf_bonus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundaryDetectionResult {
    pub found:          bool,
    pub position:       usize,
    pub pattern:        BoundaryPattern,
    pub pattern_length: usize,
    pub confidence:     f32,
    pub method:         String,
    pub warnings:       Vec<String>,
}

impl BoundaryDetectionResult {
    fn not_found(warnings: Vec<String>) -> Self {
        Self {
            found: false,
            position: 0,
            pattern: BoundaryPattern::CrlfCrlf,
            pattern_length: 0,
            confidence: 0.0,
            method: "not_found".into(),
            warnings,
        }
    }

    /// Index of the last byte of the blank-line sequence.
    pub fn header_end_position(&self) -> usize {
        (self.position + self.pattern_length).saturating_sub(1)
    }

    pub fn body_start_position(&self) -> usize {
        self.position + self.pattern_length
    }
}

// ─── Single boundary ──────────────────────────────────────────────────────────

pub fn detect_header_boundary(payload: &[u8], start_offset: usize, max_scan_window: usize) -> BoundaryDetectionResult {
    detect_header_boundary_with(payload, start_offset, max_scan_window, &BoundaryWeights::default())
}

pub fn detect_header_boundary_with(
    payload: &[u8],
    start_offset: usize,
    max_scan_window: usize,
    weights: &BoundaryWeights,
) -> BoundaryDetectionResult {
    if start_offset >= payload.len() {
        return BoundaryDetectionResult::not_found(vec![
            format!("start offset {} is past the {}-byte payload", start_offset, payload.len()),
        ]);
    }
    let end = start_offset.saturating_add(max_scan_window).min(payload.len());
    let window = &payload[start_offset..end];

    for pattern in BoundaryPattern::ALL {
        let Some(rel) = memmem::find(window, pattern.bytes()) else { continue };
        let position = start_offset + rel;
        let mut warnings = Vec::new();

        let mut confidence = weights.base + pattern.bonus(weights);
        if PLAUSIBLE_HEADER_LEN.contains(&rel) {
            confidence += weights.plausible_len_bonus;
        } else if rel > OVERSIZE_HEADER_LEN {
            confidence -= weights.oversize_penalty;
            warnings.push(format!("header block of {} bytes is unusually long", rel));
        }
        if has_header_token_before(payload, start_offset, position) {
            confidence += weights.header_token_bonus;
        }
        if pattern != BoundaryPattern::CrlfCrlf {
            warnings.push(format!("non-standard header terminator ({})", pattern.method()));
        }

        return BoundaryDetectionResult {
            found: true,
            position,
            pattern,
            pattern_length: pattern.length(),
            confidence: confidence.clamp(0.0, 1.0),
            method: pattern.method().into(),
            warnings,
        };
    }

    heuristic_fallback(payload, start_offset, end, weights)
}

fn has_header_token_before(payload: &[u8], floor: usize, position: usize) -> bool {
    let from = position.saturating_sub(HEADER_TOKEN_LOOKBACK).max(floor);
    let region = &payload[from..position];
    contains_ignore_case(region, b"content-length:") || contains_ignore_case(region, b"content-type:")
}

// A terminator straddling the window edge is invisible to the windowed search.
// Walk CRLFs up to three bytes past the edge looking for two adjacent pairs.
fn heuristic_fallback(payload: &[u8], start_offset: usize, window_end: usize, weights: &BoundaryWeights) -> BoundaryDetectionResult {
    let limit = window_end.saturating_add(3).min(payload.len());
    let region = &payload[start_offset..limit];

    let mut prev_crlf: Option<usize> = None;
    for lf in memchr::memchr_iter(b'\n', region) {
        if lf == 0 || region[lf - 1] != b'\r' {
            prev_crlf = None;
            continue;
        }
        let crlf = lf - 1;
        if prev_crlf.is_some_and(|p| p + 2 == crlf) {
            let position = start_offset + crlf - 2;
            return BoundaryDetectionResult {
                found: true,
                position,
                pattern: BoundaryPattern::CrlfCrlf,
                pattern_length: 4,
                confidence: weights.fallback.clamp(0.0, 1.0),
                method: "heuristic_crlf_pairs".into(),
                warnings: vec![format!("header terminator at {} straddles the scan window", position)],
            };
        }
        prev_crlf = Some(crlf);
    }

    BoundaryDetectionResult::not_found(vec!["no header terminator within scan window".into()])
}

// ─── Pipelined messages ───────────────────────────────────────────────────────

/// Walk successive HTTP messages packed into one payload.
pub fn detect_multiple_message_boundaries(payload: &[u8], max_scan_window: usize) -> Vec<BoundaryDetectionResult> {
    let mut found = Vec::new();
    let mut offset = 0usize;

    while found.len() < MAX_MESSAGES && offset < payload.len() {
        let Some(start) = find_message_start(payload, offset) else { break };
        let boundary = detect_header_boundary(payload, start, max_scan_window);
        if !boundary.found { break; }

        let body_start = boundary.body_start_position();
        let declared = parse_content_length(&payload[start..body_start]).length;
        let next = match declared.and_then(|len| usize::try_from(len).ok()) {
            Some(len) => body_start.saturating_add(len),
            None      => body_start,
        };
        found.push(boundary);
        offset = next;
    }
    found
}

/// Earliest request-method or status-line token at or after `from`.
pub fn find_message_start(payload: &[u8], from: usize) -> Option<usize> {
    let hay = payload.get(from..)?;
    REQUEST_METHODS.iter()
        .copied()
        .chain(std::iter::once(RESPONSE_PREFIX))
        .filter_map(|tok| memmem::find(hay, tok))
        .min()
        .map(|rel| from + rel)
}

pub(crate) fn contains_ignore_case(hay: &[u8], needle: &[u8]) -> bool {
    find_ignore_case(hay, needle).is_some()
}

/// Callers pass bounded regions only (scan window, header lookback).
pub(crate) fn find_ignore_case(hay: &[u8], needle: &[u8]) -> Option<usize> {
    let hay = hay.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    memmem::find(&hay, &needle)
}
