// crates/ionia-core/src/avc.rs
//
// H.264 bitstream plumbing for the FLV/RTMP path:
//
//   • Annex-B → AVCC conversion (start-code delimited → 4-byte BE length
//     prefixed NAL units)
//   • SPS/PPS extraction from Annex-B or length-prefixed access units
//   • AVCDecoderConfigurationRecord ("avcC") construction, including the
//     chroma/bit-depth tail for High profiles parsed out of the SPS RBSP
//   • avcC validation — an avcC whose NAL payloads contain Annex-B start
//     codes is uninterpretable by decoders and must never reach the wire
//   • AAC AudioSpecificConfig (MPEG-4 Audio, ISO/IEC 14496-3)
//
// Everything here is plain byte work; the muxer owns the ffmpeg side.

const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;

/// Length of the Annex-B start code at `pos`, if one begins there.
fn start_code_len(data: &[u8], pos: usize) -> Option<usize> {
    let rest = &data[pos..];
    if rest.len() >= 3 && rest[0] == 0x00 && rest[1] == 0x00 {
        if rest[2] == 0x01 {
            return Some(3);
        }
        if rest.len() >= 4 && rest[2] == 0x00 && rest[3] == 0x01 {
            return Some(4);
        }
    }
    None
}

/// Does the buffer begin with an Annex-B start code?
pub fn starts_with_start_code(data: &[u8]) -> bool {
    start_code_len(data, 0).is_some()
}

/// Does the buffer contain a start code anywhere in its first `limit` bytes?
fn contains_start_code(data: &[u8], limit: usize) -> bool {
    let end = data.len().min(limit);
    (0..end).any(|i| start_code_len(data, i).is_some())
}

/// Iterate the NAL payloads of an Annex-B buffer: (start, end) byte ranges
/// with start codes excluded and trailing zero padding trimmed.
fn annexb_nal_ranges(data: &[u8]) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();

    // Find the first start code.
    let mut i = match (0..data.len()).find(|&p| start_code_len(data, p).is_some()) {
        Some(p) => p,
        None => return ranges,
    };

    while i < data.len() {
        let sc = match start_code_len(data, i) {
            Some(n) => n,
            None => break,
        };
        let nal_start = i + sc;

        let mut j = nal_start;
        while j < data.len() && start_code_len(data, j).is_none() {
            j += 1;
        }
        let mut nal_end = j;

        // Trailing zeros belong to the next start code or are padding.
        while nal_end > nal_start && data[nal_end - 1] == 0x00 {
            nal_end -= 1;
        }

        if nal_end > nal_start {
            ranges.push((nal_start, nal_end));
        }
        i = j;
    }

    ranges
}

/// Convert an Annex-B access unit to AVCC (4-byte big-endian length
/// prefixes). Returns `None` if no NAL unit was found.
pub fn annexb_to_avcc(data: &[u8]) -> Option<Vec<u8>> {
    let ranges = annexb_nal_ranges(data);
    if ranges.is_empty() {
        return None;
    }

    let total: usize = ranges.iter().map(|(s, e)| 4 + (e - s)).sum();
    let mut out = Vec::with_capacity(total);
    for (s, e) in ranges {
        let len = (e - s) as u32;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&data[s..e]);
    }
    Some(out)
}

/// Walk a length-prefixed NAL buffer with `prefix` bytes per length field.
/// Returns the NAL ranges only if the buffer parses exactly to its end.
fn prefixed_nal_ranges(data: &[u8], prefix: usize) -> Option<Vec<(usize, usize)>> {
    let mut ranges = Vec::new();
    let mut pos = 0;
    while pos + prefix <= data.len() {
        let len = match prefix {
            4 => u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
                as usize,
            2 => u16::from_be_bytes([data[pos], data[pos + 1]]) as usize,
            _ => return None,
        };
        pos += prefix;
        if len == 0 || pos + len > data.len() {
            return None;
        }
        ranges.push((pos, pos + len));
        pos += len;
    }
    (pos == data.len() && !ranges.is_empty()).then_some(ranges)
}

/// Extract SPS and PPS NAL units from an H.264 buffer in any of the three
/// framings encoders produce: Annex-B, 4-byte-length AVCC, or the
/// 2-byte-length arrays some contexts hand back as extradata.
pub fn extract_sps_pps(data: &[u8]) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut sps = Vec::new();
    let mut pps = Vec::new();
    if data.len() <= 4 {
        return (sps, pps);
    }

    let ranges = if contains_start_code(data, 64) {
        annexb_nal_ranges(data)
    } else if let Some(r) = prefixed_nal_ranges(data, 4) {
        r
    } else if let Some(r) = prefixed_nal_ranges(data, 2) {
        r
    } else {
        Vec::new()
    };

    for (s, e) in ranges {
        match data[s] & 0x1F {
            NAL_TYPE_SPS => sps.push(data[s..e].to_vec()),
            NAL_TYPE_PPS => pps.push(data[s..e].to_vec()),
            _ => {}
        }
    }
    (sps, pps)
}

/// Strip a leading Annex-B start code from a NAL, if present.
fn strip_start_code(nal: &[u8]) -> &[u8] {
    match start_code_len(nal, 0) {
        Some(n) => &nal[n..],
        None => nal,
    }
}

/// Exp-Golomb bit reader over an RBSP, used for the few SPS fields the
/// High-profile avcC tail needs.
struct BitReader<'a> {
    data: &'a [u8],
    byte: usize,
    bit: u8,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, byte: 0, bit: 7 }
    }

    fn read_bits(&mut self, n: u32) -> u32 {
        let mut v = 0u32;
        for _ in 0..n {
            if self.byte >= self.data.len() {
                return v;
            }
            v <<= 1;
            v |= ((self.data[self.byte] >> self.bit) & 1) as u32;
            if self.bit == 0 {
                self.bit = 7;
                self.byte += 1;
            } else {
                self.bit -= 1;
            }
        }
        v
    }

    fn read_ue(&mut self) -> u32 {
        let mut zeros = 0u32;
        while zeros <= 31 {
            if self.byte >= self.data.len() {
                return 0;
            }
            if self.read_bits(1) == 1 {
                break;
            }
            zeros += 1;
        }
        if zeros == 0 {
            return 0;
        }
        (1u32 << zeros) - 1 + self.read_bits(zeros)
    }
}

/// RBSP of an SPS NAL: everything after the NAL header byte, with
/// emulation-prevention `00 00 03` sequences collapsed to `00 00`.
fn sps_rbsp(sps: &[u8]) -> Vec<u8> {
    let body = &sps[1..];
    let mut rbsp = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if i + 2 < body.len() && body[i] == 0x00 && body[i + 1] == 0x00 && body[i + 2] == 0x03 {
            rbsp.push(0x00);
            rbsp.push(0x00);
            i += 3;
        } else {
            rbsp.push(body[i]);
            i += 1;
        }
    }
    rbsp
}

/// chroma_format_idc, bit_depth_luma_minus8, bit_depth_chroma_minus8 from
/// an SPS RBSP. Only meaningful for the profiles that encode them.
fn parse_high_profile_fields(sps: &[u8]) -> (u8, u8, u8) {
    let rbsp = sps_rbsp(sps);
    let mut br = BitReader::new(&rbsp);
    br.read_bits(8); // profile_idc
    br.read_bits(8); // constraint flags + reserved
    br.read_bits(8); // level_idc
    let _sps_id = br.read_ue();

    let chroma_format_idc = br.read_ue() as u8;
    if chroma_format_idc == 3 {
        br.read_bits(1); // separate_colour_plane_flag
    }
    let bit_depth_luma = br.read_ue() as u8;
    let bit_depth_chroma = br.read_ue() as u8;
    (chroma_format_idc, bit_depth_luma, bit_depth_chroma)
}

/// Build an AVCDecoderConfigurationRecord from parameter-set NALs.
///
/// Leading start codes on the inputs are stripped; the SPS must be at least
/// 4 bytes (NAL header + profile/compat/level). Returns `None` when either
/// list is empty or the SPS is truncated.
pub fn build_avcc(sps_list: &[Vec<u8>], pps_list: &[Vec<u8>]) -> Option<Vec<u8>> {
    if sps_list.is_empty() || pps_list.is_empty() {
        return None;
    }

    let clean_sps: Vec<&[u8]> = sps_list.iter().map(|s| strip_start_code(s)).collect();
    let clean_pps: Vec<&[u8]> = pps_list.iter().map(|p| strip_start_code(p)).collect();

    let first_sps = clean_sps[0];
    if first_sps.len() < 4 {
        return None;
    }

    let profile = first_sps[1];
    let profile_compat = first_sps[2];
    let level = first_sps[3];

    let mut out = Vec::new();
    out.push(0x01); // configurationVersion
    out.push(profile);
    out.push(profile_compat);
    out.push(level);
    out.push(0xFF); // 6 reserved bits + lengthSizeMinusOne = 3
    out.push(0xE0 | (clean_sps.len() as u8 & 0x1F));

    for sps in &clean_sps {
        out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        out.extend_from_slice(sps);
    }

    out.push(clean_pps.len() as u8);
    for pps in &clean_pps {
        out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        out.extend_from_slice(pps);
    }

    // High / High10 / High422 / High444 carry chroma and bit-depth fields.
    if matches!(profile, 100 | 110 | 122 | 244) {
        let (chroma, luma_m8, chroma_m8) = parse_high_profile_fields(first_sps);
        out.push(0xFC | (chroma & 0x03));
        out.push(0xF8 | (luma_m8 & 0x07));
        out.push(0xF8 | (chroma_m8 & 0x07));
        out.push(0x00); // numOfSequenceParameterSetExt
    }

    Some(out)
}

/// Structural validation of an avcC record.
///
/// Rejects a record that is too short, has the wrong version byte, walks
/// off its own length fields, or — the case that actually bites — carries
/// NAL payloads that still begin with Annex-B start codes. A length field
/// can legitimately contain `00 00 01`, so only payload starts are checked.
pub fn avcc_is_valid(data: &[u8]) -> bool {
    if data.len() < 7 || data[0] != 0x01 {
        return false;
    }
    if starts_with_start_code(data) {
        return false;
    }

    let mut off = 5;
    let num_sps = (data[off] & 0x1F) as usize;
    off += 1;
    for _ in 0..num_sps {
        if off + 2 > data.len() {
            return false;
        }
        let len = u16::from_be_bytes([data[off], data[off + 1]]) as usize;
        off += 2;
        if len == 0 || off + len > data.len() {
            return false;
        }
        if starts_with_start_code(&data[off..off + len]) {
            return false;
        }
        off += len;
    }

    if off >= data.len() {
        return false;
    }
    let num_pps = data[off] as usize;
    off += 1;
    for _ in 0..num_pps {
        if off + 2 > data.len() {
            return false;
        }
        let len = u16::from_be_bytes([data[off], data[off + 1]]) as usize;
        off += 2;
        if len == 0 || off + len > data.len() {
            return false;
        }
        if starts_with_start_code(&data[off..off + len]) {
            return false;
        }
        off += len;
    }

    true
}

/// MPEG-4 Audio samplingFrequencyIndex.
pub fn aac_sample_rate_index(rate: u32) -> Option<u8> {
    let idx = match rate {
        96_000 => 0,
        88_200 => 1,
        64_000 => 2,
        48_000 => 3,
        44_100 => 4,
        32_000 => 5,
        24_000 => 6,
        22_050 => 7,
        16_000 => 8,
        12_000 => 9,
        11_025 => 10,
        8_000 => 11,
        7_350 => 12,
        _ => return None,
    };
    Some(idx)
}

/// Two-byte AudioSpecificConfig for AAC-LC (audioObjectType = 2).
pub fn audio_specific_config(sample_rate: u32, channels: u8) -> Option<[u8; 2]> {
    let sr_index = aac_sample_rate_index(sample_rate)?;
    let channel_config = if channels <= 7 { channels } else { 2 };
    Some([
        (2u8 << 3) | ((sr_index & 0x0F) >> 1),
        ((sr_index & 0x01) << 7) | ((channel_config & 0x0F) << 3),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal Baseline SPS: NAL header 0x67, profile 66, compat 0xC0, level 30.
    const SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1E, 0x8C, 0x8D, 0x40];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x00, 0x33, 0xFF];

    fn annexb_au() -> Vec<u8> {
        let mut au = Vec::new();
        for nal in [SPS, PPS, IDR] {
            au.extend_from_slice(&[0, 0, 0, 1]);
            au.extend_from_slice(nal);
        }
        au
    }

    /// Inverse conversion used only to check losslessness.
    fn avcc_to_nals(data: &[u8]) -> Vec<Vec<u8>> {
        let mut nals = Vec::new();
        let mut pos = 0;
        while pos + 4 <= data.len() {
            let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
                as usize;
            pos += 4;
            nals.push(data[pos..pos + len].to_vec());
            pos += len;
        }
        nals
    }

    #[test]
    fn annexb_detection() {
        assert!(starts_with_start_code(&[0, 0, 1, 0x67]));
        assert!(starts_with_start_code(&[0, 0, 0, 1, 0x67]));
        assert!(!starts_with_start_code(&[0, 0, 2, 0x67]));
        assert!(!starts_with_start_code(&[1, 0, 0, 1]));
        assert!(!starts_with_start_code(&[0, 0]));
    }

    #[test]
    fn annexb_to_avcc_preserves_payloads() {
        // The SPS+PPS+IDR access unit converts to
        // [len][sps][len][pps][len][idr] with identical payload bytes.
        let avcc = annexb_to_avcc(&annexb_au()).unwrap();
        let nals = avcc_to_nals(&avcc);
        assert_eq!(nals, vec![SPS.to_vec(), PPS.to_vec(), IDR.to_vec()]);

        // Byte-level spot check of the first length prefix.
        assert_eq!(&avcc[..4], &(SPS.len() as u32).to_be_bytes());
        assert_eq!(&avcc[4..4 + SPS.len()], SPS);
    }

    #[test]
    fn annexb_to_avcc_mixed_start_code_lengths_and_padding() {
        let mut au = Vec::new();
        au.extend_from_slice(&[0, 0, 1]); // 3-byte start code
        au.extend_from_slice(SPS);
        au.extend_from_slice(&[0, 0]); // zero padding before next start code
        au.extend_from_slice(&[0, 0, 0, 1]); // 4-byte start code
        au.extend_from_slice(PPS);
        au.push(0x00); // trailing padding

        let avcc = annexb_to_avcc(&au).unwrap();
        assert_eq!(avcc_to_nals(&avcc), vec![SPS.to_vec(), PPS.to_vec()]);
    }

    #[test]
    fn annexb_to_avcc_round_trip_is_lossless() {
        let avcc = annexb_to_avcc(&annexb_au()).unwrap();
        // Reconstruct Annex-B and convert again: payloads are unchanged.
        let mut rebuilt = Vec::new();
        for nal in avcc_to_nals(&avcc) {
            rebuilt.extend_from_slice(&[0, 0, 0, 1]);
            rebuilt.extend_from_slice(&nal);
        }
        assert_eq!(annexb_to_avcc(&rebuilt).unwrap(), avcc);
    }

    #[test]
    fn avcc_input_is_not_mistaken_for_annexb() {
        let avcc = annexb_to_avcc(&annexb_au()).unwrap();
        assert!(!starts_with_start_code(&avcc));
        assert!(annexb_to_avcc(&avcc).is_none() || !starts_with_start_code(&avcc));
    }

    #[test]
    fn extract_from_annexb() {
        let (sps, pps) = extract_sps_pps(&annexb_au());
        assert_eq!(sps, vec![SPS.to_vec()]);
        assert_eq!(pps, vec![PPS.to_vec()]);
    }

    #[test]
    fn extract_from_length_prefixed() {
        let avcc = annexb_to_avcc(&annexb_au()).unwrap();
        let (sps, pps) = extract_sps_pps(&avcc);
        assert_eq!(sps, vec![SPS.to_vec()]);
        assert_eq!(pps, vec![PPS.to_vec()]);

        // 2-byte prefixed arrays (extradata style).
        let mut two = Vec::new();
        for nal in [SPS, PPS] {
            two.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            two.extend_from_slice(nal);
        }
        let (sps, pps) = extract_sps_pps(&two);
        assert_eq!(sps, vec![SPS.to_vec()]);
        assert_eq!(pps, vec![PPS.to_vec()]);
    }

    #[test]
    fn build_avcc_baseline_layout() {
        let avcc = build_avcc(&[SPS.to_vec()], &[PPS.to_vec()]).unwrap();
        assert_eq!(avcc[0], 0x01);
        assert_eq!(avcc[1], SPS[1]); // profile
        assert_eq!(avcc[2], SPS[2]); // compat
        assert_eq!(avcc[3], SPS[3]); // level
        assert_eq!(avcc[4], 0xFF);
        assert_eq!(avcc[5], 0xE1); // one SPS
        assert_eq!(&avcc[6..8], &(SPS.len() as u16).to_be_bytes());
        assert_eq!(&avcc[8..8 + SPS.len()], SPS);
        let pps_count_off = 8 + SPS.len();
        assert_eq!(avcc[pps_count_off], 1);
        assert!(avcc_is_valid(&avcc));
        // Baseline profile: no chroma/bit-depth tail.
        assert_eq!(avcc.len(), pps_count_off + 1 + 2 + PPS.len());
    }

    #[test]
    fn build_avcc_strips_leading_start_codes() {
        let mut sps_sc = vec![0, 0, 0, 1];
        sps_sc.extend_from_slice(SPS);
        let mut pps_sc = vec![0, 0, 1];
        pps_sc.extend_from_slice(PPS);

        let avcc = build_avcc(&[sps_sc], &[pps_sc]).unwrap();
        assert!(avcc_is_valid(&avcc));
        assert_eq!(&avcc[8..8 + SPS.len()], SPS);
    }

    #[test]
    fn build_avcc_high_profile_tail() {
        // Synthetic High-profile SPS. RBSP after the three header bytes:
        //   ue(sps_id=0)            = 1
        //   ue(chroma_format_idc=1) = 010
        //   ue(bit_depth_luma=0)    = 1
        //   ue(bit_depth_chroma=0)  = 1
        // Bits 1 010 1 1 + padding → 0xAE.
        let sps = vec![0x67, 100, 0x00, 0x1F, 0xAE];
        let avcc = build_avcc(&[sps.clone()], &[PPS.to_vec()]).unwrap();

        let tail = &avcc[avcc.len() - 4..];
        assert_eq!(tail[0], 0xFC | 1); // chroma_format_idc = 1 (4:2:0)
        assert_eq!(tail[1], 0xF8); // bit_depth_luma_minus8 = 0
        assert_eq!(tail[2], 0xF8); // bit_depth_chroma_minus8 = 0
        assert_eq!(tail[3], 0x00);
        assert!(avcc_is_valid(&avcc));
    }

    #[test]
    fn high_profile_parse_removes_emulation_prevention() {
        // Same fields as above but the level byte is 0x00, forcing an
        // emulation-prevention 0x03 into the NAL between the two zero bytes
        // and the payload.
        let sps = vec![0x67, 100, 0x00, 0x00, 0x03, 0xAE];
        let (chroma, luma, chroma_depth) = parse_high_profile_fields(&sps);
        assert_eq!(chroma, 1);
        assert_eq!(luma, 0);
        assert_eq!(chroma_depth, 0);
    }

    #[test]
    fn validator_rejects_annexb_contamination() {
        // An "avcC" whose SPS payload still carries its start code.
        let mut bad_sps = vec![0u8, 0, 0, 1];
        bad_sps.extend_from_slice(SPS);

        let mut record = vec![0x01, 0x42, 0xC0, 0x1E, 0xFF, 0xE1];
        record.extend_from_slice(&(bad_sps.len() as u16).to_be_bytes());
        record.extend_from_slice(&bad_sps);
        record.push(1);
        record.extend_from_slice(&(PPS.len() as u16).to_be_bytes());
        record.extend_from_slice(PPS);

        assert!(!avcc_is_valid(&record));
    }

    #[test]
    fn validator_rejects_malformed_records() {
        assert!(!avcc_is_valid(&[]));
        assert!(!avcc_is_valid(&[0x01; 6])); // too short
        assert!(!avcc_is_valid(&[0x02, 0, 0, 0, 0xFF, 0xE1, 0, 1, 0x67])); // bad version
        // Truncated length field.
        assert!(!avcc_is_valid(&[0x01, 0x42, 0xC0, 0x1E, 0xFF, 0xE1, 0x00, 0xFF, 0x67]));
    }

    #[test]
    fn audio_specific_config_bytes() {
        // 48 kHz stereo: srIndex 3 → 0x11 0x90.
        assert_eq!(audio_specific_config(48_000, 2), Some([0x11, 0x90]));
        // 44.1 kHz stereo: srIndex 4 → 0x12 0x10.
        assert_eq!(audio_specific_config(44_100, 2), Some([0x12, 0x10]));
        // Unsupported rate.
        assert_eq!(audio_specific_config(13_370, 2), None);
    }

    #[test]
    fn sample_rate_index_table() {
        assert_eq!(aac_sample_rate_index(96_000), Some(0));
        assert_eq!(aac_sample_rate_index(48_000), Some(3));
        assert_eq!(aac_sample_rate_index(44_100), Some(4));
        assert_eq!(aac_sample_rate_index(7_350), Some(12));
        assert_eq!(aac_sample_rate_index(5_000), None);
    }
}
