use anyhow::Result;
use serde::Serialize;
use std::io::Write;
use std::ops::Range;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::packet::{recompute_checksums, FrameLayout};
use crate::pcap_io::{PacketRecord, PcapPacketWriter};
use crate::recipe::{MaskingRecipe, PacketInstruction};

// ─── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct MaskingStatistics {
    pub processed_packets:  u64,
    pub modified_packets:   u64,
    pub unmodified_packets: u64,
    pub skipped_packets:    u64,
    pub error_packets:      u64,
    pub bytes_processed:    u64,
    /// Payload bytes whose value changed.
    pub bytes_masked:       u64,
    pub elapsed_secs:       f64,
}

impl MaskingStatistics {
    /// Fold in counters from another worker.
    pub fn merge(&mut self, other: &MaskingStatistics) {
        self.processed_packets  += other.processed_packets;
        self.modified_packets   += other.modified_packets;
        self.unmodified_packets += other.unmodified_packets;
        self.skipped_packets    += other.skipped_packets;
        self.error_packets      += other.error_packets;
        self.bytes_processed    += other.bytes_processed;
        self.bytes_masked       += other.bytes_masked;
        self.elapsed_secs        = self.elapsed_secs.max(other.elapsed_secs);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketOutcome {
    Modified,
    Unmodified,
    /// No instruction targets this packet.
    Skipped,
    Error(EngineError),
}

// ─── Payload location ─────────────────────────────────────────────────────────

/// Where a packet's TCP payload lives and, when parseable, its frame layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSpan {
    pub range:  Range<usize>,
    pub layout: Option<FrameLayout>,
}

/// Resolve the payload for a packet from its instructions, falling back to
/// the frame headers when none of them carries an offset.
pub fn locate_payload(index: usize, data: &[u8], instructions: &[PacketInstruction]) -> Result<PayloadSpan, EngineError> {
    let mut declared: Option<usize> = None;
    for off in instructions.iter().filter_map(|i| i.payload_offset) {
        match declared {
            Some(first) if first != off => {
                return Err(EngineError::ConflictingOffsets { index, first, other: off });
            }
            _ => declared = Some(off),
        }
    }

    let layout = FrameLayout::parse(data);
    let start = match (declared, &layout) {
        (Some(off), _)    => off,
        (None, Some(l))   => l.payload_offset,
        (None, None)      => return Err(EngineError::NoPayload { index, len: data.len() }),
    };
    if start > data.len() {
        return Err(EngineError::OffsetBeyondFrame { index, offset: start, len: data.len() });
    }
    // Ethernet padding after the IP datagram is never payload.
    let end = match &layout {
        Some(l) if l.payload_offset == start => l.ip_end.min(data.len()),
        _ => data.len(),
    };
    Ok(PayloadSpan { range: start..end.max(start), layout })
}

/// Apply every instruction in order to a copy of `payload`.
pub fn apply_instructions(payload: &[u8], instructions: &[PacketInstruction]) -> Vec<u8> {
    let mut out = payload.to_vec();
    for ins in instructions {
        ins.spec.apply_in_place(&mut out);
    }
    out
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct MaskingEngine<'a> {
    recipe: &'a MaskingRecipe,
}

impl<'a> MaskingEngine<'a> {
    pub fn new(recipe: &'a MaskingRecipe) -> Self { Self { recipe } }

    /// Mask one packet in place. Every call bumps exactly one outcome counter.
    pub fn process_packet(&self, pkt: &mut PacketRecord, stats: &mut MaskingStatistics) -> PacketOutcome {
        stats.processed_packets += 1;
        stats.bytes_processed += pkt.data.len() as u64;

        let instructions = self.recipe.instructions_for(pkt.index);
        if instructions.is_empty() {
            stats.skipped_packets += 1;
            return PacketOutcome::Skipped;
        }

        let span = match locate_payload(pkt.index, &pkt.data, instructions) {
            Ok(span) => span,
            Err(e) => {
                warn!("{}", e);
                stats.error_packets += 1;
                return PacketOutcome::Error(e);
            }
        };

        let original = &pkt.data[span.range.clone()];
        let masked = apply_instructions(original, instructions);
        let changed = original.iter().zip(&masked).filter(|(a, b)| a != b).count();
        if changed == 0 {
            debug!(packet = pkt.index, "instructions left payload unchanged");
            stats.unmodified_packets += 1;
            return PacketOutcome::Unmodified;
        }

        pkt.data[span.range.clone()].copy_from_slice(&masked);
        if let Some(layout) = &span.layout {
            if !recompute_checksums(&mut pkt.data, layout) {
                debug!(packet = pkt.index, "segment truncated by capture; TCP checksum left as-is");
            }
        }
        debug!(packet = pkt.index, offset = span.range.start, changed, "payload masked");
        stats.modified_packets += 1;
        stats.bytes_masked += changed as u64;
        PacketOutcome::Modified
    }

    /// Stream packets from `source` to `sink` in their original order.
    pub fn run<I, W>(&self, source: I, sink: &mut PcapPacketWriter<W>) -> Result<MaskingStatistics>
    where
        I: IntoIterator<Item = Result<PacketRecord>>,
        W: Write,
    {
        let started = Instant::now();
        let mut stats = MaskingStatistics::default();
        for pkt in source {
            let mut pkt = pkt?;
            self.process_packet(&mut pkt, &mut stats);
            sink.write_packet(&pkt)?;
        }
        stats.elapsed_secs = started.elapsed().as_secs_f64();

        if stats.processed_packets != self.recipe.total_packets() as u64 {
            warn!(
                "recipe declares {} packets but the capture holds {}",
                self.recipe.total_packets(), stats.processed_packets
            );
        }
        info!(
            "Masked {} of {} packets ({} errors) in {:.3}s",
            stats.modified_packets, stats.processed_packets, stats.error_packets, stats.elapsed_secs
        );
        Ok(stats)
    }
}
