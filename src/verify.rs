use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

use crate::engine::{apply_instructions, locate_payload};
use crate::pcap_io::{PacketRecord, PcapPacketReader};
use crate::recipe::MaskingRecipe;

/// Distinct findings kept in a report; later ones are only counted.
pub const MAX_DISTINCT_ERRORS: usize = 100;

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub input_packets:     u64,
    pub output_packets:    u64,
    /// Pairs that satisfied the masking invariant.
    pub verified_packets:  u64,
    /// Verified pairs whose bytes differ.
    pub modified_packets:  u64,
    /// Verified pairs with no instruction in the recipe.
    pub skipped_packets:   u64,
    pub error_packets:     u64,
    pub errors:            Vec<String>,
    pub suppressed_errors: u64,
    pub warnings:          Vec<String>,
}

impl VerificationReport {
    pub fn is_consistent(&self) -> bool {
        self.errors.is_empty() && self.error_packets == 0
    }

    fn add_error(&mut self, msg: String) {
        if self.errors.contains(&msg) {
            return;
        }
        if self.errors.len() >= MAX_DISTINCT_ERRORS {
            self.suppressed_errors += 1;
        } else {
            self.errors.push(msg);
        }
    }
}

fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    a.iter().zip(b).position(|(x, y)| x != y)
        .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len())))
}

// ─── Verifier ─────────────────────────────────────────────────────────────────

pub struct ConsistencyVerifier<'a> {
    recipe: &'a MaskingRecipe,
}

impl<'a> ConsistencyVerifier<'a> {
    pub fn new(recipe: &'a MaskingRecipe) -> Self { Self { recipe } }

    /// Compare paired packet streams in lock step. Data problems are findings
    /// in the report, never errors.
    pub fn verify<I, O>(&self, input: I, output: O) -> VerificationReport
    where
        I: IntoIterator<Item = Result<PacketRecord>>,
        O: IntoIterator<Item = Result<PacketRecord>>,
    {
        let mut report = VerificationReport::default();
        let mut input = input.into_iter();
        let mut output = output.into_iter();

        loop {
            match (input.next(), output.next()) {
                (None, None) => break,
                (Some(Err(e)), _) => {
                    report.add_error(format!("input read error after {} packets: {:#}", report.input_packets, e));
                    break;
                }
                (_, Some(Err(e))) => {
                    report.add_error(format!("output read error after {} packets: {:#}", report.output_packets, e));
                    break;
                }
                (Some(Ok(i)), Some(Ok(o))) => {
                    report.input_packets += 1;
                    report.output_packets += 1;
                    self.check_pair(&i, &o, &mut report);
                }
                (Some(Ok(_)), None) => {
                    let common = report.output_packets;
                    report.input_packets += 1 + input.by_ref().filter(Result::is_ok).count() as u64;
                    report.add_error(format!(
                        "missing packet: output ends after {} packets, input has {}",
                        common, report.input_packets
                    ));
                    break;
                }
                (None, Some(Ok(_))) => {
                    let common = report.input_packets;
                    report.output_packets += 1 + output.by_ref().filter(Result::is_ok).count() as u64;
                    report.add_error(format!(
                        "extra packet: output continues past the {} input packets ({} total)",
                        common, report.output_packets
                    ));
                    break;
                }
            }
        }

        info!(
            "Verified {} of {} packets, {} errors",
            report.verified_packets, report.input_packets, report.error_packets
        );
        report
    }

    pub fn verify_files(&self, input: &Path, output: &Path) -> VerificationReport {
        let opened = PcapPacketReader::open(input)
            .map_err(|e| format!("cannot read input {:?}: {:#}", input, e))
            .and_then(|i| {
                PcapPacketReader::open(output)
                    .map(|o| (i, o))
                    .map_err(|e| format!("cannot read output {:?}: {:#}", output, e))
            });
        let (in_reader, out_reader) = match opened {
            Ok(pair) => pair,
            Err(msg) => {
                let mut report = VerificationReport::default();
                report.add_error(msg);
                return report;
            }
        };

        let link_types = (in_reader.header().network, out_reader.header().network);
        let mut report = self.verify(in_reader, out_reader);
        if link_types.0 != link_types.1 {
            report.add_error(format!("link type changed from {} to {}", link_types.0, link_types.1));
        }
        if report.input_packets != self.recipe.total_packets() as u64 {
            report.warnings.push(format!(
                "recipe declares {} packets, input holds {}",
                self.recipe.total_packets(), report.input_packets
            ));
        }
        report
    }

    fn check_pair(&self, input: &PacketRecord, output: &PacketRecord, report: &mut VerificationReport) {
        let index = input.index;
        match self.pair_finding(input, output, report) {
            Some(err) => {
                debug!(packet = index, "{}", err);
                report.error_packets += 1;
                report.add_error(err);
            }
            None => {
                report.verified_packets += 1;
                if input.data != output.data {
                    report.modified_packets += 1;
                }
                if self.recipe.instructions_for(index).is_empty() {
                    report.skipped_packets += 1;
                }
            }
        }
    }

    /// First violation found for a pair, if any.
    fn pair_finding(&self, input: &PacketRecord, output: &PacketRecord, report: &mut VerificationReport) -> Option<String> {
        let index = input.index;
        if (input.ts_sec, input.ts_usec) != (output.ts_sec, output.ts_usec) {
            return Some(format!("packet {}: timestamp changed", index));
        }

        let instructions = self.recipe.instructions_for(index);
        if instructions.is_empty() {
            return first_difference(&input.data, &output.data).map(|at| {
                format!("packet {}: differs at byte {} but has no mask instruction", index, at)
            });
        }

        if input.data.len() != output.data.len() {
            return Some(format!(
                "packet {}: length changed from {} to {}",
                index, input.data.len(), output.data.len()
            ));
        }

        let span = match locate_payload(index, &input.data, instructions) {
            Ok(span) => span,
            Err(e) => {
                // The engine keeps such packets untouched.
                report.warnings.push(format!("{}; expected unmodified", e));
                return first_difference(&input.data, &output.data).map(|at| {
                    format!("packet {}: differs at byte {} although its instructions could not apply", index, at)
                });
            }
        };

        let checksums = span.layout.map(|l| l.checksum_fields()).unwrap_or_default();
        let start = span.range.start;
        let header_diff = input.data[..start].iter()
            .zip(&output.data[..start])
            .enumerate()
            .find(|(at, (a, b))| a != b && !checksums.iter().any(|f| f.contains(at)));
        if let Some((at, _)) = header_diff {
            return Some(format!("packet {}: byte {} before the payload changed", index, at));
        }

        let expected = apply_instructions(&input.data[span.range.clone()], instructions);
        let actual = &output.data[span.range.clone()];
        if let Some(at) = first_difference(&expected, actual) {
            return Some(format!(
                "packet {}: payload byte {} (frame offset {}) expected {:#04x}, found {:#04x}",
                index, at, start + at, expected[at], actual[at]
            ));
        }

        let end = span.range.end;
        first_difference(&input.data[end..], &output.data[end..])
            .map(|at| format!("packet {}: trailing byte {} changed", index, end + at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MaskingEngine, MaskingStatistics};
    use crate::mask::MaskSpec;
    use crate::packet::ipv4_tcp_frame;
    use crate::pcap_io::{CaptureHeader, PcapPacketWriter};
    use crate::recipe::PacketInstruction;

    fn record(index: usize, data: Vec<u8>) -> PacketRecord {
        PacketRecord { index, ts_sec: 1, ts_usec: 2, orig_len: data.len() as u32, data }
    }

    fn capture(n: usize) -> Vec<PacketRecord> {
        (0..n).map(|i| record(i, ipv4_tcp_frame(format!("GET /{} HTTP/1.1\r\n\r\nbody-{}", i, i).as_bytes()))).collect()
    }

    fn ok(pkts: &[PacketRecord]) -> impl Iterator<Item = Result<PacketRecord>> + '_ {
        pkts.iter().cloned().map(Ok)
    }

    fn masked(recipe: &MaskingRecipe, pkts: &[PacketRecord]) -> Vec<PacketRecord> {
        let engine = MaskingEngine::new(recipe);
        let mut stats = MaskingStatistics::default();
        pkts.iter().cloned().map(|mut p| { engine.process_packet(&mut p, &mut stats); p }).collect()
    }

    #[test]
    fn empty_recipe_on_identical_streams() {
        let pkts = capture(3);
        let recipe = MaskingRecipe::new(3);
        let r = ConsistencyVerifier::new(&recipe).verify(ok(&pkts), ok(&pkts));
        assert!(r.is_consistent());
        assert_eq!(r.verified_packets, 3);
        assert_eq!(r.skipped_packets, 3);
    }

    #[test]
    fn engine_output_verifies() {
        let pkts = capture(3);
        let mut recipe = MaskingRecipe::new(3);
        recipe.add_instruction(1, PacketInstruction::new(MaskSpec::MaskAfter { keep_bytes: 4 })).unwrap();
        recipe.add_instruction(2, PacketInstruction::new(MaskSpec::mask_range(&[(0, 3)]).unwrap())).unwrap();
        let out = masked(&recipe, &pkts);

        let r = ConsistencyVerifier::new(&recipe).verify(ok(&pkts), ok(&out));
        assert!(r.is_consistent(), "{:?}", r.errors);
        assert_eq!(r.modified_packets, 2);
        assert_eq!(r.skipped_packets, 1);
    }

    #[test]
    fn extra_trailing_packet_is_structural() {
        let pkts = capture(2);
        let mut out = pkts.clone();
        out.push(record(2, ipv4_tcp_frame(b"surprise")));
        let recipe = MaskingRecipe::new(2);

        let r = ConsistencyVerifier::new(&recipe).verify(ok(&pkts), ok(&out));
        assert_eq!(r.errors.len(), 1);
        assert!(r.errors[0].starts_with("extra packet"));
        assert_eq!(r.verified_packets, 2);
        assert_eq!((r.input_packets, r.output_packets), (2, 3));
    }

    #[test]
    fn missing_packet_is_structural() {
        let pkts = capture(3);
        let recipe = MaskingRecipe::new(3);
        let r = ConsistencyVerifier::new(&recipe).verify(ok(&pkts), ok(&pkts[..1]));
        assert!(r.errors[0].starts_with("missing packet"));
        assert_eq!(r.input_packets, 3);
    }

    #[test]
    fn detects_changes_outside_mask() {
        let pkts = capture(1);
        let mut recipe = MaskingRecipe::new(1);
        recipe.add_instruction(0, PacketInstruction::new(MaskSpec::MaskAfter { keep_bytes: 10 })).unwrap();

        let mut out = masked(&recipe, &pkts);
        out[0].data[54 + 2] ^= 0xff;
        let r = ConsistencyVerifier::new(&recipe).verify(ok(&pkts), ok(&out));
        assert_eq!(r.error_packets, 1);
        assert!(r.errors[0].contains("payload byte 2 (frame offset 56)"), "{}", r.errors[0]);

        let mut out = masked(&recipe, &pkts);
        out[0].data[30] ^= 0x01;
        let r = ConsistencyVerifier::new(&recipe).verify(ok(&pkts), ok(&out));
        assert!(r.errors[0].contains("byte 30 before the payload"));
    }

    #[test]
    fn ipv4_fragment_must_pass_through_unchanged() {
        let mut frame = ipv4_tcp_frame(b"continuation bytes of a larger segment");
        frame[20..22].copy_from_slice(&185u16.to_be_bytes());
        let pkts = vec![record(0, frame)];
        let mut recipe = MaskingRecipe::new(1);
        recipe.add_instruction(0, PacketInstruction::new(MaskSpec::MaskAfter { keep_bytes: 10 })).unwrap();

        let out = masked(&recipe, &pkts);
        let r = ConsistencyVerifier::new(&recipe).verify(ok(&pkts), ok(&out));
        assert!(r.is_consistent(), "{:?}", r.errors);
        assert_eq!(r.modified_packets, 0);

        // Bytes where a TCP checksum would sit are fragment data here.
        let mut out = pkts.clone();
        out[0].data[50] ^= 0xff;
        let r = ConsistencyVerifier::new(&recipe).verify(ok(&pkts), ok(&out));
        assert!(!r.is_consistent());
        assert!(r.errors[0].contains("differs at byte 50"), "{}", r.errors[0]);
    }

    #[test]
    fn unmasked_packet_must_be_identical() {
        let pkts = capture(1);
        let mut out = pkts.clone();
        out[0].data[60] = 0;
        let recipe = MaskingRecipe::new(1);
        let r = ConsistencyVerifier::new(&recipe).verify(ok(&pkts), ok(&out));
        assert!(!r.is_consistent());
        assert!(r.errors[0].contains("no mask instruction"));
    }

    #[test]
    fn distinct_errors_are_capped() {
        let pkts = capture(150);
        let out: Vec<_> = pkts.iter().cloned().map(|mut p| { p.data[60] ^= 0xff; p }).collect();
        let recipe = MaskingRecipe::new(150);
        let r = ConsistencyVerifier::new(&recipe).verify(ok(&pkts), ok(&out));
        assert_eq!(r.error_packets, 150);
        assert_eq!(r.errors.len(), MAX_DISTINCT_ERRORS);
        assert_eq!(r.suppressed_errors, 50);
    }

    #[test]
    fn files_and_io_failures() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("in.pcap");
        let b = dir.path().join("out.pcap");
        let pkts = capture(2);
        for path in [&a, &b] {
            let mut w = PcapPacketWriter::create(path, &CaptureHeader::ethernet()).unwrap();
            for p in &pkts { w.write_packet(p).unwrap(); }
            w.finish().unwrap();
        }
        let recipe = MaskingRecipe::new(2);
        let v = ConsistencyVerifier::new(&recipe);
        assert!(v.verify_files(&a, &b).is_consistent());

        let r = v.verify_files(&a, &dir.path().join("absent.pcap"));
        assert!(!r.is_consistent());
        assert!(r.errors[0].starts_with("cannot read output"));
    }
}
