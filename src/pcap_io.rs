use anyhow::{anyhow, bail, Context, Result};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::*;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, warn};

const READ_BUFFER: usize = 65536;
const MAGIC_USEC: u32 = 0xa1b2c3d4;
const MAGIC_NSEC: u32 = 0xa1b23c4d;

/// One captured frame. `index` is zero-based in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub index:    usize,
    pub ts_sec:   u32,
    pub ts_usec:  u32,
    pub orig_len: u32,
    pub data:     Vec<u8>,
}

/// Global header fields copied verbatim to the output capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub thiszone:      i32,
    pub sigfigs:       u32,
    pub snaplen:       u32,
    pub network:       u32,
    pub nanosecond:    bool,
}

impl CaptureHeader {
    pub fn ethernet() -> Self {
        Self { version_major: 2, version_minor: 4, thiszone: 0, sigfigs: 0, snaplen: 65535, network: 1, nanosecond: false }
    }
}

impl From<&PcapHeader> for CaptureHeader {
    fn from(h: &PcapHeader) -> Self {
        Self {
            version_major: h.version_major,
            version_minor: h.version_minor,
            thiszone:      h.thiszone,
            sigfigs:       h.sigfigs,
            snaplen:       h.snaplen,
            network:       h.network.0 as u32,
            nanosecond:    matches!(h.magic_number, MAGIC_NSEC | 0x4d3cb2a1),
        }
    }
}

// ─── Reader ───────────────────────────────────────────────────────────────────

enum Block {
    Header(CaptureHeader),
    Packet(PacketRecord),
}

pub struct PcapPacketReader<R: Read> {
    reader:     LegacyPcapReader<R>,
    header:     CaptureHeader,
    next_index: usize,
    pending:    Option<PacketRecord>,
}

impl PcapPacketReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Cannot open {:?}", path))?;
        Self::new(BufReader::new(file)).with_context(|| format!("Cannot read {:?}", path))
    }
}

impl<R: Read> PcapPacketReader<R> {
    pub fn new(inner: R) -> Result<Self> {
        let mut reader = LegacyPcapReader::new(READ_BUFFER, inner)
            .context("Not a valid legacy pcap file")?;
        let mut pending = None;
        let header = match next_block(&mut reader, 0)? {
            Some(Block::Header(h)) => h,
            Some(Block::Packet(p)) => {
                warn!("pcap stream yielded a packet before its global header");
                pending = Some(p);
                CaptureHeader::ethernet()
            }
            None => bail!("pcap stream ended before its global header"),
        };
        Ok(Self { reader, header, next_index: usize::from(pending.is_some()), pending })
    }

    pub fn header(&self) -> CaptureHeader { self.header }

    pub fn next_packet(&mut self) -> Result<Option<PacketRecord>> {
        if let Some(p) = self.pending.take() {
            return Ok(Some(p));
        }
        loop {
            match next_block(&mut self.reader, self.next_index)? {
                Some(Block::Packet(p)) => {
                    self.next_index += 1;
                    return Ok(Some(p));
                }
                Some(Block::Header(_)) => debug!("ignoring repeated pcap global header"),
                None => return Ok(None),
            }
        }
    }
}

impl<R: Read> Iterator for PcapPacketReader<R> {
    type Item = Result<PacketRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}

fn next_block<R: Read>(reader: &mut LegacyPcapReader<R>, index: usize) -> Result<Option<Block>> {
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let item = match block {
                    PcapBlockOwned::LegacyHeader(ref hdr) => Some(Block::Header(CaptureHeader::from(hdr))),
                    PcapBlockOwned::Legacy(ref pkt) => Some(Block::Packet(PacketRecord {
                        index,
                        ts_sec:   pkt.ts_sec,
                        ts_usec:  pkt.ts_usec,
                        orig_len: pkt.origlen,
                        data:     pkt.data.to_vec(),
                    })),
                    PcapBlockOwned::NG(_) => {
                        warn!("pcapng block encountered – only legacy pcap supported");
                        None
                    }
                };
                drop(block);
                reader.consume(offset);
                if item.is_some() {
                    return Ok(item);
                }
            }
            Err(PcapError::Eof) => return Ok(None),
            Err(PcapError::Incomplete) => {
                if let Err(e) = reader.refill() {
                    return Err(anyhow!("refill error: {:?}", e));
                }
            }
            Err(e) => return Err(anyhow!("pcap parse error: {:?}", e)),
        }
    }
}

// ─── Writer ───────────────────────────────────────────────────────────────────

pub struct PcapPacketWriter<W: Write> {
    inner:      W,
    nanosecond: bool,
}

impl PcapPacketWriter<BufWriter<File>> {
    pub fn create(path: &Path, header: &CaptureHeader) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("Cannot create {:?}", path))?;
        Self::new(BufWriter::new(file), header)
    }
}

impl<W: Write> PcapPacketWriter<W> {
    pub fn new(mut inner: W, header: &CaptureHeader) -> Result<Self> {
        write_global_header(&mut inner, header)?;
        Ok(Self { inner, nanosecond: header.nanosecond })
    }

    /// Timestamps and original length are written back unchanged.
    pub fn write_packet(&mut self, pkt: &PacketRecord) -> Result<()> {
        let caplen = u32::try_from(pkt.data.len()).context("packet larger than 4 GiB")?;
        let w = &mut self.inner;
        w.write_all(&pkt.ts_sec.to_le_bytes())?;
        w.write_all(&pkt.ts_usec.to_le_bytes())?;
        w.write_all(&caplen.to_le_bytes())?;
        w.write_all(&pkt.orig_len.max(caplen).to_le_bytes())?;
        w.write_all(&pkt.data)?;
        Ok(())
    }

    pub fn is_nanosecond(&self) -> bool { self.nanosecond }

    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

fn write_global_header(w: &mut impl Write, hdr: &CaptureHeader) -> Result<()> {
    let magic = if hdr.nanosecond { MAGIC_NSEC } else { MAGIC_USEC };
    w.write_all(&magic.to_le_bytes())?;
    w.write_all(&hdr.version_major.to_le_bytes())?;
    w.write_all(&hdr.version_minor.to_le_bytes())?;
    w.write_all(&hdr.thiszone.to_le_bytes())?;
    w.write_all(&hdr.sigfigs.to_le_bytes())?;
    w.write_all(&hdr.snaplen.to_le_bytes())?;
    w.write_all(&hdr.network.to_le_bytes())?;
    Ok(())
}

/// Read every packet of a capture into memory.
pub fn read_all(path: &Path) -> Result<(CaptureHeader, Vec<PacketRecord>)> {
    let mut reader = PcapPacketReader::open(path)?;
    let header = reader.header();
    let mut packets = Vec::new();
    while let Some(p) = reader.next_packet()? {
        packets.push(p);
    }
    Ok((header, packets))
}
