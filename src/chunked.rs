use serde::Serialize;
use std::ops::Range;
use tracing::debug;

/// Decoding stops once this many size lines have failed to parse.
pub const MAX_PARSING_ERRORS: u32 = 3;
const SANE_CHUNK_SIZE: u64 = 1 << 20;
const PLAUSIBLE_CHUNK_COUNT: std::ops::RangeInclusive<usize> = 1..=20;
/// Longest size line considered; anything longer is treated as garbage.
const MAX_SIZE_LINE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkInfo {
    pub size_line_range: Range<usize>,
    pub data_range:      Range<usize>,
    pub size:            u64,
    pub has_extensions:  bool,
}

impl ChunkInfo {
    /// Size line, data and trailing CRLF as they appear on the wire.
    pub fn wire_range(&self) -> Range<usize> {
        self.size_line_range.start..self.data_range.end + 2
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkedAnalysisResult {
    pub chunks:          Vec<ChunkInfo>,
    pub total_data_size: u64,
    pub is_complete:     bool,
    pub parsing_errors:  u32,
    pub confidence:      f32,
    /// Offset just past the last fully parsed chunk.
    pub consumed_until:  usize,
}

impl ChunkedAnalysisResult {
    pub fn data_chunks(&self) -> impl Iterator<Item = &ChunkInfo> {
        self.chunks.iter().filter(|c| c.size > 0)
    }
}

struct SizeLine {
    size:           u64,
    has_extensions: bool,
}

fn parse_size_line(line: &[u8]) -> Option<SizeLine> {
    let (hex, has_extensions) = match line.iter().position(|&b| b == b';') {
        Some(i) => (&line[..i], true),
        None    => (line, false),
    };
    let hex = std::str::from_utf8(hex).ok()?.trim_matches(|c| c == ' ' || c == '\t');
    if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let size = u64::from_str_radix(hex, 16).ok()?;
    Some(SizeLine { size, has_extensions })
}

/// Locate the size-line terminator at or after `pos`: `(line_end, next)`.
fn find_line_end(payload: &[u8], pos: usize) -> Option<(usize, usize)> {
    let limit = pos.saturating_add(MAX_SIZE_LINE).min(payload.len());
    let lf = pos + memchr::memchr(b'\n', &payload[pos..limit])?;
    let line_end = if lf > pos && payload[lf - 1] == b'\r' { lf - 1 } else { lf };
    Some((line_end, lf + 1))
}

fn data_terminated_at(payload: &[u8], at: usize) -> bool {
    payload.get(at..at + 2) == Some(&b"\r\n"[..])
}

fn terminal_end(payload: &[u8], data_start: usize) -> Option<usize> {
    if data_terminated_at(payload, data_start) {
        return Some(data_start + 2);
    }
    memchr::memmem::find(&payload[data_start..], b"\r\n\r\n").map(|i| data_start + i + 4)
}

// ─── Decoder ──────────────────────────────────────────────────────────────────

pub fn analyze_chunked_structure(payload: &[u8], chunk_data_start: usize, max_chunks: usize) -> ChunkedAnalysisResult {
    let mut chunks: Vec<ChunkInfo> = Vec::new();
    let mut total_data_size: u64 = 0;
    let mut is_complete = false;
    let mut parsing_errors: u32 = 0;
    let mut pos = chunk_data_start;
    let mut consumed_until = chunk_data_start.min(payload.len());

    while pos < payload.len() && chunks.len() < max_chunks && parsing_errors <= MAX_PARSING_ERRORS {
        let Some((line_end, data_start)) = find_line_end(payload, pos) else {
            debug!(pos, "chunk size line incomplete");
            break;
        };
        let Some(size_line) = parse_size_line(&payload[pos..line_end]) else {
            parsing_errors += 1;
            debug!(pos, parsing_errors, "unparsable chunk size line");
            pos += 1;
            continue;
        };

        let Some(data_end) = usize::try_from(size_line.size).ok().and_then(|n| data_start.checked_add(n)) else {
            debug!(pos, size = size_line.size, "chunk size overflows payload addressing");
            break;
        };
        if data_end.saturating_add(2) > payload.len() {
            debug!(pos, data_end, len = payload.len(), "chunk extends past captured bytes");
            break;
        }
        if size_line.size == 0 {
            // Terminal chunk, possibly followed by trailer fields.
            let Some(end) = terminal_end(payload, data_start) else {
                debug!(pos, "trailer section incomplete");
                break;
            };
            chunks.push(ChunkInfo {
                size_line_range: pos..line_end,
                data_range:      data_start..data_start,
                size:            0,
                has_extensions:  size_line.has_extensions,
            });
            consumed_until = end;
            is_complete = true;
            break;
        }
        if !data_terminated_at(payload, data_end) {
            parsing_errors += 1;
            debug!(pos, data_end, parsing_errors, "chunk data not followed by CRLF");
            pos += 1;
            continue;
        }

        chunks.push(ChunkInfo {
            size_line_range: pos..line_end,
            data_range:      data_start..data_end,
            size:            size_line.size,
            has_extensions:  size_line.has_extensions,
        });
        pos = data_end + 2;
        consumed_until = pos;
        total_data_size = total_data_size.saturating_add(size_line.size);
    }

    let confidence = score(&chunks, is_complete, parsing_errors);
    ChunkedAnalysisResult { chunks, total_data_size, is_complete, parsing_errors, confidence, consumed_until }
}

fn score(chunks: &[ChunkInfo], is_complete: bool, parsing_errors: u32) -> f32 {
    let mut confidence: f32 = 0.7;
    if is_complete {
        confidence += 0.2;
    }
    if PLAUSIBLE_CHUNK_COUNT.contains(&chunks.len()) {
        confidence += 0.1;
    }
    confidence -= (0.05 * parsing_errors as f32).min(0.3);
    if !chunks.is_empty() && chunks.iter().all(|c| c.size <= SANE_CHUNK_SIZE) {
        confidence += 0.1;
    }
    confidence.clamp(0.0, 1.0)
}
