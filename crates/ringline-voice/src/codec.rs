//! G.711 µ-law companding and the fixed-ratio resamplers used to move audio
//! between TTS output (24 kHz) and the telephone network (8 kHz).
//!
//! All PCM handled here is signed 16-bit, little-endian on the wire, mono.
//! Every transform is lossy; round trips are close, not exact.

use std::sync::LazyLock;

/// Sample rate of telephony media streams.
pub const TELEPHONY_SAMPLE_RATE: u32 = 8_000;

/// Sample rate requested from TTS engines.
pub const TTS_SAMPLE_RATE: u32 = 24_000;

/// Duration of one outbound media frame.
pub const FRAME_MS: u32 = 20;

/// µ-law bias added before segment search.
const MULAW_BIAS: i32 = 0x84;

/// Largest magnitude that survives encoding without overflowing the bias.
const MULAW_CLIP: i32 = 32_635;

static MULAW_DECODE_TABLE: LazyLock<[i16; 256]> = LazyLock::new(|| {
    let mut table = [0i16; 256];
    for (byte, slot) in table.iter_mut().enumerate() {
        *slot = expand(byte as u8);
    }
    table
});

fn expand(byte: u8) -> i16 {
    let inverted = !byte;
    let negative = inverted & 0x80 != 0;
    let exponent = (inverted >> 4) & 0x07;
    let mantissa = (inverted & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if negative {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Expands one µ-law byte to a linear sample.
pub fn decode_mulaw(byte: u8) -> i16 {
    MULAW_DECODE_TABLE[byte as usize]
}

/// Compresses one linear sample to a µ-law byte.
pub fn encode_mulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };
    magnitude = magnitude.min(MULAW_CLIP) + MULAW_BIAS;

    // Highest set bit between 14 and 7 selects the segment.
    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Splits little-endian PCM bytes into samples. A trailing odd byte is dropped.
pub fn pcm16le_to_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Serializes samples as little-endian PCM bytes.
pub fn samples_to_pcm16le(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Encodes a buffer of little-endian PCM into µ-law, one byte per sample.
pub fn pcm16le_to_mulaw(pcm: &[u8]) -> Vec<u8> {
    pcm.chunks_exact(2)
        .map(|pair| encode_mulaw(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

/// Decodes a µ-law buffer into little-endian PCM, two bytes per sample.
pub fn mulaw_to_pcm16le(mulaw: &[u8]) -> Vec<u8> {
    mulaw
        .iter()
        .flat_map(|&b| decode_mulaw(b).to_le_bytes())
        .collect()
}

/// Downsamples 24 kHz PCM to 8 kHz by averaging each group of three samples.
///
/// Trailing samples that do not fill a group are discarded.
pub fn resample_24k_to_8k(samples: &[i16]) -> Vec<i16> {
    samples
        .chunks_exact(3)
        .map(|group| {
            let sum: i32 = group.iter().map(|&s| s as i32).sum();
            (sum / 3) as i16
        })
        .collect()
}

/// Upsamples 8 kHz PCM to 24 kHz with linear interpolation.
///
/// Each input sample `s0` emits `s0`, `(2*s0 + s1) / 3` and `(s0 + 2*s1) / 3`,
/// where `s1` is the next sample (or `s0` again at the end of the buffer).
pub fn resample_8k_to_24k(samples: &[i16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len() * 3);
    for (i, &s0) in samples.iter().enumerate() {
        let s1 = samples.get(i + 1).copied().unwrap_or(s0);
        let (a, b) = (s0 as i32, s1 as i32);
        out.push(s0);
        out.push(((2 * a + b) / 3) as i16);
        out.push(((a + 2 * b) / 3) as i16);
    }
    out
}

/// Converts a chunk of 24 kHz TTS PCM bytes into 8 kHz µ-law bytes.
pub fn tts_pcm_to_telephony(pcm_24k: &[u8]) -> Vec<u8> {
    let downsampled = resample_24k_to_8k(&pcm16le_to_samples(pcm_24k));
    downsampled.into_iter().map(encode_mulaw).collect()
}

/// Number of PCM bytes in one frame at the given sample rate.
pub fn frame_bytes(sample_rate: u32) -> usize {
    (sample_rate * FRAME_MS / 1000) as usize * 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_encodes_to_0xff() {
        assert_eq!(encode_mulaw(0), 0xFF);
        assert_eq!(decode_mulaw(0xFF), 0);
    }

    #[test]
    fn decode_table_is_symmetric() {
        for byte in 0u8..=0x7F {
            assert_eq!(decode_mulaw(byte), -decode_mulaw(byte | 0x80));
        }
    }

    #[test]
    fn mulaw_round_trip_stays_within_tolerance() {
        for &sample in &[0i16, 100, -100, 1000, -1000, 10000, -10000, 32000, -32000] {
            let decoded = decode_mulaw(encode_mulaw(sample));
            let error = (decoded as i32 - sample as i32).abs();
            let tolerance = (sample as i32).abs() / 16 + 8;
            assert!(
                error <= tolerance,
                "sample {} decoded to {} (error {}, tolerance {})",
                sample,
                decoded,
                error,
                tolerance
            );
        }
    }

    #[test]
    fn extreme_samples_clip_instead_of_wrapping() {
        let high = decode_mulaw(encode_mulaw(i16::MAX));
        let low = decode_mulaw(encode_mulaw(i16::MIN));
        assert!(high > 30_000, "got {}", high);
        assert!(low < -30_000, "got {}", low);
    }

    #[test]
    fn encode_preserves_sign_and_order() {
        let mut previous = i16::MIN;
        for sample in (-32000i16..=32000).step_by(500) {
            let decoded = decode_mulaw(encode_mulaw(sample));
            assert!(decoded >= previous, "{} decoded out of order", sample);
            previous = decoded;
        }
    }

    #[test]
    fn buffer_helpers_convert_whole_buffers() {
        let samples = [0i16, 1000, -1000, 20000];
        let pcm = samples_to_pcm16le(&samples);
        assert_eq!(pcm.len(), 8);

        let mulaw = pcm16le_to_mulaw(&pcm);
        assert_eq!(mulaw.len(), 4);

        let back = pcm16le_to_samples(&mulaw_to_pcm16le(&mulaw));
        assert_eq!(back.len(), 4);
        assert_eq!(back[0], 0);
        assert!((back[3] as i32 - 20000).abs() < 20000 / 16);
    }

    #[test]
    fn odd_trailing_pcm_byte_is_ignored() {
        assert_eq!(pcm16le_to_mulaw(&[0, 0, 7]).len(), 1);
        assert_eq!(pcm16le_to_samples(&[1]).len(), 0);
    }

    #[test]
    fn downsample_averages_groups_of_three() {
        let out = resample_24k_to_8k(&[1000, 2000, 3000, 4000, 5000, 6000]);
        assert_eq!(out, vec![2000, 5000]);
    }

    #[test]
    fn downsample_truncates_remainder_and_handles_empty() {
        assert_eq!(resample_24k_to_8k(&[3, 3, 3, 9, 9]), vec![3]);
        assert!(resample_24k_to_8k(&[]).is_empty());
        assert!(resample_24k_to_8k(&[1, 2]).is_empty());
    }

    #[test]
    fn upsample_interpolates_between_neighbours() {
        let out = resample_8k_to_24k(&[0, 300]);
        assert_eq!(out, vec![0, 100, 200, 300, 300, 300]);
        assert!(resample_8k_to_24k(&[]).is_empty());
    }

    #[test]
    fn up_then_down_recovers_a_smooth_signal_closely() {
        let original: Vec<i16> = (0..80).map(|i| (i * 100) as i16).collect();
        let round = resample_24k_to_8k(&resample_8k_to_24k(&original));
        assert_eq!(round.len(), original.len());
        for (a, b) in original.iter().zip(round.iter()).take(79) {
            assert!((*a as i32 - *b as i32).abs() <= 100, "{} vs {}", a, b);
        }
    }

    #[test]
    fn tts_chunk_becomes_one_third_as_many_mulaw_bytes() {
        let pcm = samples_to_pcm16le(&vec![500i16; 480]);
        let mulaw = tts_pcm_to_telephony(&pcm);
        assert_eq!(mulaw.len(), 160);
    }

    #[test]
    fn frame_sizes_match_twenty_milliseconds() {
        assert_eq!(frame_bytes(TELEPHONY_SAMPLE_RATE), 320);
        assert_eq!(frame_bytes(TTS_SAMPLE_RATE), 960);
    }
}
