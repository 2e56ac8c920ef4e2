use regex::bytes::Regex;
use serde::Serialize;
use std::sync::OnceLock;

pub const ONE_GIB: u64 = 1 << 30;
const CORRUPT_LENGTH: u64 = 10 * ONE_GIB;
const HEADER_NAME: &[u8] = b"content-length";
const STANDARD_SPELLING: &[u8] = b"Content-Length: ";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentLengthResult {
    pub found:      bool,
    pub length:     Option<u64>,
    pub confidence: f32,
    pub method:     String,
}

impl ContentLengthResult {
    fn not_found(method: &str) -> Self {
        Self { found: false, length: None, confidence: 0.0, method: method.into() }
    }

    /// True when the declared length lies in the range the orchestrator trusts.
    pub fn is_plausible(&self) -> bool {
        self.length.is_some_and(|n| n <= ONE_GIB)
    }
}

// ─── Content-Length ───────────────────────────────────────────────────────────
//
// Matchers run strictest first across every header line. The first line that
// matches structurally decides the outcome; a bad value there is final.

#[derive(Debug, Clone, Copy)]
enum Matcher {
    Exact,
    FlexibleWhitespace,
    NoSpace,
}

impl Matcher {
    const ORDER: [Matcher; 3] = [Self::Exact, Self::FlexibleWhitespace, Self::NoSpace];

    fn name(self) -> &'static str {
        match self {
            Self::Exact              => "exact",
            Self::FlexibleWhitespace => "flexible_whitespace",
            Self::NoSpace            => "no_space",
        }
    }

    /// Value token of `line` if the line has this matcher's shape.
    fn value<'a>(self, line: &'a [u8]) -> Option<&'a [u8]> {
        let rest = strip_name(line)?;
        match self {
            Self::Exact => {
                let v = rest.strip_prefix(b": ")?;
                (!v.is_empty() && !v.iter().any(|b| b.is_ascii_whitespace())).then_some(v)
            }
            Self::FlexibleWhitespace => {
                let v = trim_ascii(trim_start(rest).strip_prefix(b":")?);
                (!v.is_empty() && !v.iter().any(|b| b.is_ascii_whitespace())).then_some(v)
            }
            Self::NoSpace => {
                let v = rest.strip_prefix(b":")?;
                let digits = v.iter().take_while(|b| b.is_ascii_digit()).count();
                (digits > 0).then_some(&v[..digits])
            }
        }
    }
}

pub fn parse_content_length(header_bytes: &[u8]) -> ContentLengthResult {
    for matcher in Matcher::ORDER {
        for raw_line in header_bytes.split(|&b| b == b'\n') {
            let line = raw_line.strip_suffix(b"\r").unwrap_or(raw_line);
            let Some(value) = matcher.value(line) else { continue };

            let Some(length) = parse_decimal(value) else {
                return ContentLengthResult::not_found(matcher.name());
            };

            let mut confidence: f32 = 0.8;
            if length <= ONE_GIB {
                confidence += 0.1;
            } else if length > CORRUPT_LENGTH {
                confidence -= 0.3;
            }
            if line.starts_with(STANDARD_SPELLING) {
                confidence += 0.1;
            }
            return ContentLengthResult {
                found: true,
                length: Some(length),
                confidence: confidence.clamp(0.0, 1.0),
                method: matcher.name().into(),
            };
        }
    }
    ContentLengthResult::not_found("no_match")
}

fn strip_name(line: &[u8]) -> Option<&[u8]> {
    let name = line.get(..HEADER_NAME.len())?;
    name.eq_ignore_ascii_case(HEADER_NAME).then(|| &line[HEADER_NAME.len()..])
}

fn trim_start(b: &[u8]) -> &[u8] {
    let n = b.iter().take_while(|c| c.is_ascii_whitespace()).count();
    &b[n..]
}

fn trim_ascii(b: &[u8]) -> &[u8] {
    let b = trim_start(b);
    let n = b.iter().rev().take_while(|c| c.is_ascii_whitespace()).count();
    &b[..b.len() - n]
}

fn parse_decimal(v: &[u8]) -> Option<u64> {
    if v.is_empty() || !v.iter().all(u8::is_ascii_digit) { return None; }
    std::str::from_utf8(v).ok()?.parse().ok()
}

// ─── Encodings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingType {
    Identity,
    Chunked,
    Gzip,
    Deflate,
    Br,
    Compress,
    Unknown,
}

impl EncodingType {
    fn from_token(tok: &[u8]) -> Self {
        let tok = trim_ascii(tok);
        let lower = tok.to_ascii_lowercase();
        match lower.as_slice() {
            b"identity"            => Self::Identity,
            b"chunked"             => Self::Chunked,
            b"gzip" | b"x-gzip"    => Self::Gzip,
            b"deflate"             => Self::Deflate,
            b"br"                  => Self::Br,
            b"compress" | b"x-compress" => Self::Compress,
            _                      => Self::Unknown,
        }
    }
}

fn transfer_encoding_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^transfer-encoding[ \t]*:[ \t]*([^\r\n]*)").expect("static regex"))
}

fn content_encoding_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^content-encoding[ \t]*:[ \t]*([^\r\n]*)").expect("static regex"))
}

fn collect_encodings(re: &Regex, header_bytes: &[u8]) -> Vec<EncodingType> {
    re.captures_iter(header_bytes)
        .filter_map(|c| c.get(1))
        .flat_map(|m| m.as_bytes().split(|&b| b == b','))
        .filter(|tok| !trim_ascii(tok).is_empty())
        .map(EncodingType::from_token)
        .collect()
}

/// Transfer-Encoding tokens in header order, across repeated header lines.
pub fn detect_transfer_encoding(header_bytes: &[u8]) -> Vec<EncodingType> {
    collect_encodings(transfer_encoding_re(), header_bytes)
}

/// Content-Encoding tokens. Informational only; bodies are never decoded.
pub fn detect_content_encoding(header_bytes: &[u8]) -> Vec<EncodingType> {
    collect_encodings(content_encoding_re(), header_bytes)
}

pub fn is_chunked(header_bytes: &[u8]) -> bool {
    detect_transfer_encoding(header_bytes).contains(&EncodingType::Chunked)
}
