// ─── Frame layout ─────────────────────────────────────────────────────────────
//
// Just enough Ethernet / 802.1Q / IP / TCP walking to find where the TCP
// payload begins and which bytes hold checksums. Non-TCP frames yield None.

/// More-fragments flag plus the 13-bit fragment offset.
const IPV4_FRAGMENT_MASK: u16 = 0x3fff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub ip_version:     IpVersion,
    pub ip_offset:      usize,
    pub tcp_offset:     usize,
    pub payload_offset: usize,
    /// End of the IP datagram inside the frame (Ethernet padding excluded).
    pub ip_end:         usize,
}

impl FrameLayout {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < 14 { return None; }
        let ethertype = u16::from_be_bytes([raw[12], raw[13]]);
        let (ip_off, ethertype) = match ethertype {
            0x8100 if raw.len() >= 18 => (18, u16::from_be_bytes([raw[16], raw[17]])),
            _ => (14, ethertype),
        };

        match ethertype {
            0x0800 if raw.len() >= ip_off + 20 => {
                let ihl = ((raw[ip_off] & 0x0f) as usize) * 4;
                let proto = raw[ip_off + 9];
                let total = u16::from_be_bytes([raw[ip_off + 2], raw[ip_off + 3]]) as usize;
                if raw[ip_off] >> 4 != 4 || ihl < 20 || proto != 6 { return None; }
                // Any fragment (MF set or non-zero offset) lacks a whole TCP segment.
                if u16::from_be_bytes([raw[ip_off + 6], raw[ip_off + 7]]) & IPV4_FRAGMENT_MASK != 0 {
                    return None;
                }
                let ip_end = (ip_off + total.max(ihl)).min(raw.len());
                Self::with_tcp(raw, IpVersion::V4, ip_off, ip_off + ihl, ip_end)
            }
            0x86DD if raw.len() >= ip_off + 40 => {
                // Fixed header only; extension headers are not walked.
                let next_header = raw[ip_off + 6];
                let plen = u16::from_be_bytes([raw[ip_off + 4], raw[ip_off + 5]]) as usize;
                if raw[ip_off] >> 4 != 6 || next_header != 6 { return None; }
                let ip_end = (ip_off + 40 + plen).min(raw.len());
                Self::with_tcp(raw, IpVersion::V6, ip_off, ip_off + 40, ip_end)
            }
            _ => None,
        }
    }

    fn with_tcp(raw: &[u8], ip_version: IpVersion, ip_offset: usize, tcp_offset: usize, ip_end: usize) -> Option<Self> {
        if raw.len() < tcp_offset + 20 { return None; }
        let doff = ((raw[tcp_offset + 12] >> 4) as usize) * 4;
        if doff < 20 { return None; }
        let payload_offset = tcp_offset + doff;
        Some(Self { ip_version, ip_offset, tcp_offset, payload_offset, ip_end: ip_end.max(payload_offset) })
    }

    /// TCP payload bytes, excluding link-layer padding.
    pub fn payload<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        raw.get(self.payload_offset..self.ip_end.min(raw.len())).unwrap_or(&[])
    }

    /// Byte ranges holding checksums the sink is allowed to rewrite.
    pub fn checksum_fields(&self) -> Vec<std::ops::Range<usize>> {
        let mut fields = vec![self.tcp_offset + 16..self.tcp_offset + 18];
        if self.ip_version == IpVersion::V4 {
            fields.push(self.ip_offset + 10..self.ip_offset + 12);
        }
        fields
    }
}

// ─── Checksums ────────────────────────────────────────────────────────────────

fn ones_complement_sum(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u16::from_be_bytes([c[0], c[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Rewrite the IPv4 header and TCP checksums of a frame after its payload
/// changed. Returns false when the segment was truncated by the capture and
/// the checksum cannot be recomputed.
pub fn recompute_checksums(raw: &mut [u8], layout: &FrameLayout) -> bool {
    let ip = layout.ip_offset;
    if layout.ip_version == IpVersion::V4 {
        let ihl = layout.tcp_offset - ip;
        raw[ip + 10] = 0;
        raw[ip + 11] = 0;
        let c = fold(ones_complement_sum(0, &raw[ip..ip + ihl]));
        raw[ip + 10..ip + 12].copy_from_slice(&c.to_be_bytes());
    }

    let declared_end = match layout.ip_version {
        IpVersion::V4 => ip + u16::from_be_bytes([raw[ip + 2], raw[ip + 3]]) as usize,
        IpVersion::V6 => ip + 40 + u16::from_be_bytes([raw[ip + 4], raw[ip + 5]]) as usize,
    };
    if declared_end > raw.len() || declared_end < layout.tcp_offset + 20 {
        return false;
    }

    let tcp = layout.tcp_offset;
    let seg_len = declared_end - tcp;
    raw[tcp + 16] = 0;
    raw[tcp + 17] = 0;

    let mut sum = match layout.ip_version {
        IpVersion::V4 => ones_complement_sum(0, &raw[ip + 12..ip + 20]),
        IpVersion::V6 => ones_complement_sum(0, &raw[ip + 8..ip + 40]),
    };
    sum += 6;
    sum += seg_len as u32 & 0xffff;
    sum += (seg_len as u32) >> 16;
    sum = ones_complement_sum(sum, &raw[tcp..declared_end]);
    let c = fold(sum);
    raw[tcp + 16..tcp + 18].copy_from_slice(&c.to_be_bytes());
    true
}

// ─── Test frames ──────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) fn ipv4_tcp_frame(payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; 14 + 20 + 20];
    pkt[12] = 0x08; pkt[13] = 0x00;
    pkt[14] = 0x45;
    let total = (20 + 20 + payload.len()) as u16;
    pkt[16..18].copy_from_slice(&total.to_be_bytes());
    pkt[14 + 8] = 64;
    pkt[14 + 9] = 6;
    pkt[26..30].copy_from_slice(&[10, 0, 0, 1]);
    pkt[30..34].copy_from_slice(&[10, 0, 0, 2]);
    pkt[34..36].copy_from_slice(&40000u16.to_be_bytes());
    pkt[36..38].copy_from_slice(&80u16.to_be_bytes());
    pkt[34 + 12] = 0x50;
    pkt.extend_from_slice(payload);
    if let Some(layout) = FrameLayout::parse(&pkt) {
        recompute_checksums(&mut pkt, &layout);
    }
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifies(data: &[u8]) -> bool { fold(ones_complement_sum(0, data)) == 0 }

    #[test]
    fn locates_ipv4_payload() {
        let pkt = ipv4_tcp_frame(b"GET / HTTP/1.1\r\n\r\n");
        let l = FrameLayout::parse(&pkt).unwrap();
        assert_eq!(l.ip_version, IpVersion::V4);
        assert_eq!(l.payload_offset, 54);
        assert_eq!(l.payload(&pkt), b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn ethernet_padding_is_not_payload() {
        let mut pkt = ipv4_tcp_frame(b"");
        pkt.extend_from_slice(&[0u8; 6]);
        let l = FrameLayout::parse(&pkt).unwrap();
        assert!(l.payload(&pkt).is_empty());
    }

    #[test]
    fn vlan_and_ipv6() {
        let mut pkt = vec![0u8; 18 + 40 + 20];
        pkt[12] = 0x81; pkt[13] = 0x00;
        pkt[16] = 0x86; pkt[17] = 0xDD;
        pkt[18] = 0x60;
        pkt[18 + 4..18 + 6].copy_from_slice(&23u16.to_be_bytes());
        pkt[18 + 6] = 6;
        pkt[58 + 12] = 0x50;
        pkt.extend_from_slice(b"abc");
        let l = FrameLayout::parse(&pkt).unwrap();
        assert_eq!(l.ip_version, IpVersion::V6);
        assert_eq!(l.payload_offset, 78);
        assert_eq!(l.payload(&pkt), b"abc");
        assert_eq!(l.checksum_fields(), vec![74..76]);
        assert!(recompute_checksums(&mut pkt, &l));
    }

    #[test]
    fn non_tcp_frames_are_ignored() {
        let mut pkt = ipv4_tcp_frame(b"x");
        pkt[14 + 9] = 17;
        assert_eq!(FrameLayout::parse(&pkt), None);
        assert_eq!(FrameLayout::parse(&[0u8; 10]), None);
    }

    #[test]
    fn ipv4_fragments_are_ignored() {
        let mut later = ipv4_tcp_frame(b"fragment data, not a TCP header");
        later[20..22].copy_from_slice(&185u16.to_be_bytes()); // offset 1480
        assert_eq!(FrameLayout::parse(&later), None);

        let mut first = ipv4_tcp_frame(b"GET / HTTP/1.1\r\n");
        first[20] = 0x20; // MF
        assert_eq!(FrameLayout::parse(&first), None);

        let mut dont_fragment = ipv4_tcp_frame(b"GET / HTTP/1.1\r\n");
        dont_fragment[20] = 0x40; // DF only
        assert!(FrameLayout::parse(&dont_fragment).is_some());
    }

    #[test]
    fn checksums_verify_after_payload_change() {
        let mut pkt = ipv4_tcp_frame(b"HTTP/1.1 200 OK\r\n\r\nsecret!");
        let l = FrameLayout::parse(&pkt).unwrap();
        assert!(verifies(&pkt[14..34]));
        let len = pkt.len();
        pkt[len - 7..].fill(0);
        assert!(recompute_checksums(&mut pkt, &l));
        assert!(verifies(&pkt[14..34]));

        // Pseudo-header + segment must sum to zero.
        let seg = &pkt[34..];
        let mut pseudo = Vec::new();
        pseudo.extend_from_slice(&pkt[26..34]);
        pseudo.extend_from_slice(&[0, 6]);
        pseudo.extend_from_slice(&(seg.len() as u16).to_be_bytes());
        pseudo.extend_from_slice(seg);
        assert!(verifies(&pseudo));
    }

    #[test]
    fn truncated_capture_skips_tcp_checksum() {
        let mut pkt = ipv4_tcp_frame(b"0123456789");
        pkt.truncate(pkt.len() - 4);
        let l = FrameLayout::parse(&pkt).unwrap();
        assert!(!recompute_checksums(&mut pkt, &l));
    }
}
