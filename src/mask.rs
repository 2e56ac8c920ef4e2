use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MaskSpecError;

/// Half-open byte range `[start, end)` relative to the payload start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: usize,
    pub end:   usize,
}

impl ByteRange {
    pub fn new(start: usize, end: usize) -> Self { Self { start, end } }
}

impl From<(usize, usize)> for ByteRange {
    fn from((start, end): (usize, usize)) -> Self { Self { start, end } }
}

/// Sorted, disjoint, non-empty ranges. Only constructible through validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ByteRange>", into = "Vec<ByteRange>")]
pub struct MaskRanges(Vec<ByteRange>);

impl MaskRanges {
    pub fn new(ranges: Vec<ByteRange>) -> Result<Self, MaskSpecError> {
        let mut prev_end: Option<usize> = None;
        for (index, r) in ranges.iter().enumerate() {
            if r.start >= r.end {
                return Err(MaskSpecError::EmptyRange { index, start: r.start, end: r.end });
            }
            if let Some(prev_end) = prev_end {
                if r.start < prev_end {
                    return Err(MaskSpecError::Overlapping { index, start: r.start, end: r.end, prev_end });
                }
            }
            prev_end = Some(r.end);
        }
        Ok(Self(ranges))
    }

    pub fn as_slice(&self) -> &[ByteRange] { &self.0 }
}

impl TryFrom<Vec<ByteRange>> for MaskRanges {
    type Error = MaskSpecError;
    fn try_from(v: Vec<ByteRange>) -> Result<Self, Self::Error> { Self::new(v) }
}

impl From<MaskRanges> for Vec<ByteRange> {
    fn from(r: MaskRanges) -> Self { r.0 }
}

// ─── MaskSpec ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaskSpec {
    KeepAll,
    MaskAfter { keep_bytes: usize },
    MaskRange { ranges: MaskRanges },
    MaskAll,
}

impl MaskSpec {
    pub fn mask_range(pairs: &[(usize, usize)]) -> Result<Self, MaskSpecError> {
        let ranges = pairs.iter().copied().map(ByteRange::from).collect();
        Ok(Self::MaskRange { ranges: MaskRanges::new(ranges)? })
    }

    pub fn apply(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = payload.to_vec();
        self.apply_in_place(&mut out);
        out
    }

    /// Zero the masked bytes of `payload`. Re-applying is a no-op.
    pub fn apply_in_place(&self, payload: &mut [u8]) {
        let len = payload.len();
        match self {
            Self::KeepAll => {}
            Self::MaskAfter { keep_bytes } => payload[(*keep_bytes).min(len)..].fill(0),
            Self::MaskRange { ranges } => {
                for r in ranges.as_slice() {
                    let start = r.start.min(len);
                    let end = r.end.min(len);
                    payload[start..end].fill(0);
                }
            }
            Self::MaskAll => payload.fill(0),
        }
    }

    /// Number of payload bytes this spec zeroes for a payload of `len` bytes.
    pub fn masked_len(&self, len: usize) -> usize {
        match self {
            Self::KeepAll => 0,
            Self::MaskAfter { keep_bytes } => len - (*keep_bytes).min(len),
            Self::MaskRange { ranges } => ranges.as_slice().iter()
                .map(|r| r.end.min(len) - r.start.min(len))
                .sum(),
            Self::MaskAll => len,
        }
    }
}

impl fmt::Display for MaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeepAll => write!(f, "KeepAll"),
            Self::MaskAfter { keep_bytes } => write!(f, "MaskAfter({})", keep_bytes),
            Self::MaskRange { ranges } => {
                write!(f, "MaskRange(")?;
                for (i, r) in ranges.as_slice().iter().enumerate() {
                    if i > 0 { write!(f, ",")?; }
                    write!(f, "{}..{}", r.start, r.end)?;
                }
                write!(f, ")")
            }
            Self::MaskAll => write!(f, "MaskAll"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn mask_after_five() {
        assert_eq!(MaskSpec::MaskAfter { keep_bytes: 5 }.apply(b"ABCDEFGHIJ"), b"ABCDE\x00\x00\x00\x00\x00");
    }

    #[test]
    fn mask_range_middle() {
        let spec = MaskSpec::mask_range(&[(2, 5)]).unwrap();
        assert_eq!(spec.apply(b"0123456789"), b"01\x00\x00\x0056789");
        assert_eq!(spec.masked_len(10), 3);
    }

    #[test]
    fn overlapping_ranges_fail_at_construction() {
        let err = MaskSpec::mask_range(&[(2, 5), (4, 6)]).unwrap_err();
        assert_eq!(err, MaskSpecError::Overlapping { index: 1, start: 4, end: 6, prev_end: 5 });
    }

    #[test]
    fn unsorted_and_empty_ranges_fail() {
        assert!(matches!(MaskRanges::new(vec![ByteRange::new(6, 8), ByteRange::new(1, 2)]), Err(MaskSpecError::Overlapping { .. })));
        assert!(matches!(MaskRanges::new(vec![ByteRange::new(3, 3)]), Err(MaskSpecError::EmptyRange { .. })));
        assert!(MaskRanges::new(vec![ByteRange::new(0, 2), ByteRange::new(2, 4)]).is_ok());
    }

    #[test]
    fn ranges_clamp_to_payload() {
        let spec = MaskSpec::mask_range(&[(1, 3), (8, 100)]).unwrap();
        assert_eq!(spec.apply(b"abcdef"), b"a\x00\x00def");
        assert_eq!(spec.masked_len(6), 2);
    }

    #[test]
    fn keep_all_and_mask_all() {
        assert_eq!(MaskSpec::KeepAll.apply(b"xyz"), b"xyz");
        assert_eq!(MaskSpec::MaskAll.apply(b"xyz"), vec![0u8; 3]);
        assert_eq!(MaskSpec::MaskAll.apply(b""), Vec::<u8>::new());
    }

    #[test]
    fn deserialize_validates() {
        let bad: Result<MaskRanges, _> = serde_json::from_str(r#"[{"start":2,"end":5},{"start":4,"end":6}]"#);
        assert!(bad.is_err());
        let good: MaskRanges = serde_json::from_str(r#"[{"start":2,"end":5}]"#).unwrap();
        assert_eq!(good.as_slice(), &[ByteRange::new(2, 5)]);
    }

    #[test]
    fn display() {
        assert_eq!(MaskSpec::mask_range(&[(0, 1), (4, 9)]).unwrap().to_string(), "MaskRange(0..1,4..9)");
        assert_eq!(MaskSpec::MaskAfter { keep_bytes: 3 }.to_string(), "MaskAfter(3)");
    }

    proptest! {
        #[test]
        fn mask_after_keeps_prefix_zeroes_rest(p in proptest::collection::vec(any::<u8>(), 0..256), n in 0usize..300) {
            let out = MaskSpec::MaskAfter { keep_bytes: n }.apply(&p);
            let k = n.min(p.len());
            prop_assert_eq!(out.len(), p.len());
            prop_assert_eq!(&out[..k], &p[..k]);
            prop_assert!(out[k..].iter().all(|&b| b == 0));
        }

        #[test]
        fn mask_range_touches_only_ranges(p in proptest::collection::vec(1u8.., 0..128), a in 0usize..64, w in 1usize..64) {
            let spec = MaskSpec::mask_range(&[(a, a + w)]).unwrap();
            let out = spec.apply(&p);
            prop_assert_eq!(out.len(), p.len());
            for (i, (&o, &b)) in out.iter().zip(&p).enumerate() {
                if i >= a && i < a + w { prop_assert_eq!(o, 0); } else { prop_assert_eq!(o, b); }
            }
        }

        #[test]
        fn apply_is_idempotent(p in proptest::collection::vec(any::<u8>(), 0..64), n in 0usize..80) {
            let spec = MaskSpec::MaskAfter { keep_bytes: n };
            let once = spec.apply(&p);
            prop_assert_eq!(spec.apply(&once), once);
        }
    }
}
