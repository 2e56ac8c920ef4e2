use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{MaskSpecError, RecipeError};
use crate::mask::{MaskRanges, MaskSpec};

/// A mask spec bound to one packet, with the payload offset inside the frame
/// when the producer already knew it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketInstruction {
    pub payload_offset: Option<usize>,
    pub spec:           MaskSpec,
}

impl PacketInstruction {
    pub fn new(spec: MaskSpec) -> Self { Self { payload_offset: None, spec } }

    pub fn at_offset(payload_offset: usize, spec: MaskSpec) -> Self {
        Self { payload_offset: Some(payload_offset), spec }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskingRecipe {
    total_packets:       usize,
    packet_instructions: BTreeMap<usize, Vec<PacketInstruction>>,
    pub metadata:        BTreeMap<String, serde_json::Value>,
}

impl MaskingRecipe {
    pub fn new(total_packets: usize) -> Self {
        Self { total_packets, ..Self::default() }
    }

    pub fn total_packets(&self) -> usize { self.total_packets }

    pub fn add_instruction(&mut self, packet_index: usize, instruction: PacketInstruction) -> Result<(), RecipeError> {
        if packet_index >= self.total_packets {
            return Err(RecipeError::IndexOutOfRange { index: packet_index, total: self.total_packets });
        }
        self.packet_instructions.entry(packet_index).or_default().push(instruction);
        Ok(())
    }

    /// Instructions for a packet in application order; empty when none.
    pub fn instructions_for(&self, packet_index: usize) -> &[PacketInstruction] {
        self.packet_instructions.get(&packet_index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn instructed_packets(&self) -> usize { self.packet_instructions.len() }

    pub fn instruction_count(&self) -> usize {
        self.packet_instructions.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[PacketInstruction])> {
        self.packet_instructions.iter().map(|(&i, v)| (i, v.as_slice()))
    }

    // ─── Persistence ──────────────────────────────────────────────────────────

    pub fn to_json(&self) -> Result<String, RecipeError> {
        Ok(serde_json::to_string_pretty(&RecipeFile::from(self))?)
    }

    pub fn from_json(text: &str) -> Result<Self, RecipeError> {
        let file: RecipeFile = serde_json::from_str(text)?;
        Self::try_from(file)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Cannot read recipe {:?}", path))?;
        Self::from_json(&text).with_context(|| format!("Invalid recipe {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)
            .with_context(|| format!("Cannot write recipe {:?}", path))
    }
}

// ─── Wire format ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum MaskSpecType {
    KeepAll,
    MaskAll,
    MaskAfter,
    MaskRange,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MaskSpecParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    keep_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ranges:     Option<MaskRanges>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InstructionRecord {
    packet_index:     u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_offset:   Option<u64>,
    mask_spec_type:   MaskSpecType,
    #[serde(default)]
    mask_spec_params: MaskSpecParams,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecipeFile {
    total_packets:       u64,
    #[serde(default)]
    packet_instructions: Vec<InstructionRecord>,
    #[serde(default)]
    metadata:            BTreeMap<String, serde_json::Value>,
}

impl From<&MaskingRecipe> for RecipeFile {
    fn from(r: &MaskingRecipe) -> Self {
        let packet_instructions = r.iter()
            .flat_map(|(index, list)| list.iter().map(move |ins| record_for(index, ins)))
            .collect();
        Self { total_packets: r.total_packets as u64, packet_instructions, metadata: r.metadata.clone() }
    }
}

fn record_for(index: usize, ins: &PacketInstruction) -> InstructionRecord {
    let (mask_spec_type, mask_spec_params) = match &ins.spec {
        MaskSpec::KeepAll => (MaskSpecType::KeepAll, MaskSpecParams::default()),
        MaskSpec::MaskAll => (MaskSpecType::MaskAll, MaskSpecParams::default()),
        MaskSpec::MaskAfter { keep_bytes } => (
            MaskSpecType::MaskAfter,
            MaskSpecParams { keep_bytes: Some(*keep_bytes), ..MaskSpecParams::default() },
        ),
        MaskSpec::MaskRange { ranges } => (
            MaskSpecType::MaskRange,
            MaskSpecParams { ranges: Some(ranges.clone()), ..MaskSpecParams::default() },
        ),
    };
    InstructionRecord {
        packet_index: index as u64,
        payload_offset: ins.payload_offset.map(|o| o as u64),
        mask_spec_type,
        mask_spec_params,
    }
}

fn spec_from_record(rec: InstructionRecord) -> Result<MaskSpec, MaskSpecError> {
    Ok(match rec.mask_spec_type {
        MaskSpecType::KeepAll => MaskSpec::KeepAll,
        MaskSpecType::MaskAll => MaskSpec::MaskAll,
        MaskSpecType::MaskAfter => MaskSpec::MaskAfter {
            keep_bytes: rec.mask_spec_params.keep_bytes
                .ok_or(MaskSpecError::MissingParam { kind: "MaskAfter", param: "keep_bytes" })?,
        },
        MaskSpecType::MaskRange => MaskSpec::MaskRange {
            ranges: rec.mask_spec_params.ranges
                .ok_or(MaskSpecError::MissingParam { kind: "MaskRange", param: "ranges" })?,
        },
    })
}

impl TryFrom<RecipeFile> for MaskingRecipe {
    type Error = RecipeError;

    fn try_from(file: RecipeFile) -> Result<Self, Self::Error> {
        let total = usize::try_from(file.total_packets).unwrap_or(usize::MAX);
        let mut recipe = MaskingRecipe::new(total);
        recipe.metadata = file.metadata;
        for rec in file.packet_instructions {
            let index = usize::try_from(rec.packet_index).unwrap_or(usize::MAX);
            let payload_offset = rec.payload_offset.map(|o| usize::try_from(o).unwrap_or(usize::MAX));
            let spec = spec_from_record(rec)
                .map_err(|source| RecipeError::InvalidSpec { index, source })?;
            recipe.add_instruction(index, PacketInstruction { payload_offset, spec })?;
        }
        Ok(recipe)
    }
}
