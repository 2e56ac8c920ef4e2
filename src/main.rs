use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use capmask::config::ScanConfig;
use capmask::engine::{MaskingEngine, MaskingStatistics};
use capmask::mask::MaskSpec;
use capmask::packet::FrameLayout;
use capmask::pcap_io::{self, PcapPacketReader, PcapPacketWriter};
use capmask::recipe::{MaskingRecipe, PacketInstruction};
use capmask::scanner::ScannerRegistry;
use capmask::verify::{ConsistencyVerifier, VerificationReport};

// ─── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(author, version, about = "Mask HTTP bodies in legacy .pcap captures while keeping protocol headers, then verify nothing else changed.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan every TCP payload and write a masking recipe
    Plan {
        /// Input .pcap file
        #[arg(short, long)]
        input: PathBuf,

        /// Recipe JSON to write
        #[arg(short, long)]
        output: PathBuf,

        /// Scan configuration JSON (defaults apply for missing keys)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Registered scanner to use
        #[arg(short, long, default_value = "http")]
        scanner: String,

        /// Print plan summary as JSON to stdout
        #[arg(long, default_value_t = false)]
        report: bool,
    },

    /// Apply a recipe to a capture
    Mask {
        /// Input .pcap file
        #[arg(short, long)]
        input: PathBuf,

        /// Recipe JSON produced by `plan`
        #[arg(short, long)]
        recipe: PathBuf,

        /// Output (masked) .pcap file
        #[arg(short, long)]
        output: PathBuf,

        /// Print masking statistics as JSON to stdout
        #[arg(long, default_value_t = false)]
        report: bool,
    },

    /// Check a masked capture against its input and recipe
    Verify {
        /// Original .pcap file
        #[arg(short, long)]
        input: PathBuf,

        /// Masked .pcap file
        #[arg(short, long)]
        output: PathBuf,

        /// Recipe JSON that was applied
        #[arg(short, long)]
        recipe: PathBuf,

        /// Print the verification report as JSON to stdout
        #[arg(long, default_value_t = false)]
        report: bool,
    },
}

// ─── Plan ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
struct PlanStats {
    total_packets:      u64,
    tcp_payloads:       u64,
    http_payloads:      u64,
    low_confidence:     u64,
    packets_masked:     u64,
    bytes_to_mask:      u64,
}

fn plan(input: &Path, output: &Path, config: Option<&Path>, scanner_name: &str) -> Result<PlanStats> {
    let config = match config {
        Some(path) => ScanConfig::load(path)?,
        None => ScanConfig::default(),
    };
    let threshold = config.confidence_threshold;
    let registry = ScannerRegistry::with_defaults(config);
    let Some(scanner) = registry.get(scanner_name) else {
        let known: Vec<&str> = registry.names().collect();
        bail!("unknown scanner {:?} (available: {})", scanner_name, known.join(", "));
    };

    info!("Opening {:?}", input);
    let (_, packets) = pcap_io::read_all(input)?;
    let mut stats = PlanStats { total_packets: packets.len() as u64, ..PlanStats::default() };
    let mut recipe = MaskingRecipe::new(packets.len());

    for pkt in &packets {
        let Some(layout) = FrameLayout::parse(&pkt.data) else { continue };
        let payload = layout.payload(&pkt.data);
        if payload.is_empty() { continue; }
        stats.tcp_payloads += 1;

        let result = scanner.scan(payload);
        if result.is_http {
            stats.http_payloads += 1;
            if result.confidence < threshold {
                stats.low_confidence += 1;
            }
        }
        let spec = scanner.generate_mask(payload, &result);
        if spec == MaskSpec::KeepAll { continue; }

        debug!(packet = pkt.index, strategy = %result.preserve_strategy, "{}", spec);
        stats.packets_masked += 1;
        stats.bytes_to_mask += spec.masked_len(payload.len()) as u64;
        recipe.add_instruction(pkt.index, PacketInstruction::at_offset(layout.payload_offset, spec))?;
    }

    recipe.metadata.insert("scanner".into(), scanner.name().into());
    recipe.metadata.insert("source".into(), input.display().to_string().into());
    recipe.metadata.insert("generator".into(), concat!("capmask ", env!("CARGO_PKG_VERSION")).into());
    recipe.save(output)?;
    info!("Wrote recipe with {} instructions → {:?}", recipe.instruction_count(), output);
    Ok(stats)
}

// ─── Mask ─────────────────────────────────────────────────────────────────────

fn mask(input: &Path, recipe_path: &Path, output: &Path) -> Result<MaskingStatistics> {
    let recipe = MaskingRecipe::load(recipe_path)?;
    info!("Opening {:?}", input);
    let reader = PcapPacketReader::open(input)?;
    let mut writer = PcapPacketWriter::create(output, &reader.header())?;
    let stats = MaskingEngine::new(&recipe).run(reader, &mut writer)?;
    writer.finish().with_context(|| format!("Cannot flush {:?}", output))?;
    if stats.error_packets > 0 {
        warn!("{} packets could not be masked and were written unchanged", stats.error_packets);
    }
    Ok(stats)
}

// ─── Main ─────────────────────────────────────────────────────────────────────

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_verification(report: &VerificationReport) {
    println!("=== Verification Summary ===");
    println!("Input packets:               {}", report.input_packets);
    println!("Output packets:              {}", report.output_packets);
    println!("Packets verified:            {}", report.verified_packets);
    println!("Packets modified:            {}", report.modified_packets);
    println!("Packets without instruction: {}", report.skipped_packets);
    println!("Packets with errors:         {}", report.error_packets);
    for err in &report.errors {
        println!("  error: {}", err);
    }
    if report.suppressed_errors > 0 {
        println!("  … {} further errors suppressed", report.suppressed_errors);
    }
    for w in &report.warnings {
        println!("  warning: {}", w);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(log_level).with_target(false).with_writer(std::io::stderr).init();

    match cli.command {
        Command::Plan { input, output, config, scanner, report } => {
            let stats = plan(&input, &output, config.as_deref(), &scanner)?;
            if report {
                print_json(&stats)?;
            } else {
                println!("=== Plan Summary ===");
                println!("Total packets:               {}", stats.total_packets);
                println!("TCP payloads scanned:        {}", stats.tcp_payloads);
                println!("HTTP payloads:               {}", stats.http_payloads);
                println!("Below confidence threshold:  {}", stats.low_confidence);
                println!("Packets to mask:             {}", stats.packets_masked);
                println!("Payload bytes to mask:       {}", stats.bytes_to_mask);
                println!("Recipe:                      {}", output.display());
            }
        }
        Command::Mask { input, recipe, output, report } => {
            let stats = mask(&input, &recipe, &output)?;
            if report {
                print_json(&stats)?;
            } else {
                println!("=== Masking Summary ===");
                println!("Packets processed:           {}", stats.processed_packets);
                println!("Packets modified:            {}", stats.modified_packets);
                println!("Packets unchanged:           {}", stats.unmodified_packets);
                println!("Packets without instruction: {}", stats.skipped_packets);
                println!("Packets with errors:         {}", stats.error_packets);
                println!("Bytes processed:             {}", stats.bytes_processed);
                println!("Bytes masked:                {}", stats.bytes_masked);
                println!("Elapsed:                     {:.3}s", stats.elapsed_secs);
            }
        }
        Command::Verify { input, output, recipe, report } => {
            let recipe = MaskingRecipe::load(&recipe)?;
            let result = ConsistencyVerifier::new(&recipe).verify_files(&input, &output);
            if report {
                print_json(&result)?;
            } else {
                print_verification(&result);
            }
            if !result.is_consistent() {
                bail!("{:?} is not a consistent masking of {:?}", output, input);
            }
        }
    }

    Ok(())
}
