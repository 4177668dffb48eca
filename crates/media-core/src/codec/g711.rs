//! G.711 companding (ITU-T G.711, STL reference arithmetic)
//!
//! A-law works on the 13 most significant bits of the sample, µ-law on
//! the 14 most significant bits with a bias of 33. Both produce one byte
//! per 16-bit sample.

/// Compress one linear sample to A-law
pub fn alaw_compress(sample: i16) -> u8 {
    // One's complement keeps the magnitude of i16::MIN in range
    let mut ix = if sample < 0 {
        ((!sample) >> 4) as u16
    } else {
        (sample >> 4) as u16
    };

    if ix > 15 {
        let mut exponent = 1u16;
        while ix > 16 + 15 {
            ix >>= 1;
            exponent += 1;
        }
        ix -= 16;
        ix += exponent << 4;
    }

    if sample >= 0 {
        ix |= 0x80;
    }
    (ix ^ 0x55) as u8
}

/// Expand one A-law byte to a linear sample
pub fn alaw_expand(encoded: u8) -> i16 {
    let ix = i16::from((encoded ^ 0x55) & 0x7F);
    let exponent = ix >> 4;
    let mut mantissa = ix & 0x0F;

    if exponent > 0 {
        mantissa += 16;
    }
    mantissa = (mantissa << 4) + 0x08;
    if exponent > 1 {
        mantissa <<= exponent - 1;
    }

    if encoded > 127 {
        mantissa
    } else {
        -mantissa
    }
}

/// Compress one linear sample to µ-law
pub fn ulaw_compress(sample: i16) -> u8 {
    let magnitude = if sample < 0 {
        ((!sample) >> 2) + 33
    } else {
        (sample >> 2) + 33
    };
    let magnitude = magnitude.min(0x1FFF);

    let mut segment = 1i16;
    let mut i = magnitude >> 6;
    while i != 0 {
        segment += 1;
        i >>= 1;
    }

    let high = 0x08 - segment;
    let low = 0x0F - ((magnitude >> segment) & 0x0F);
    let mut encoded = (high << 4) | low;
    if sample >= 0 {
        encoded |= 0x80;
    }
    encoded as u8
}

/// Expand one µ-law byte to a linear sample
pub fn ulaw_expand(encoded: u8) -> i16 {
    let inverted = i16::from(!encoded);
    let exponent = (inverted >> 4) & 0x07;
    let mantissa = inverted & 0x0F;
    let step = 4i16 << (exponent + 1);

    let magnitude = (0x80 << exponent) + step * mantissa + step / 2 - 4 * 33;
    if encoded < 0x80 {
        -magnitude
    } else {
        magnitude
    }
}

/// Compress little-endian 16-bit PCM. A trailing odd byte is ignored.
pub fn encode_pcm_le(pcm: &[u8], compress: fn(i16) -> u8) -> Vec<u8> {
    pcm.chunks_exact(2)
        .map(|pair| compress(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

/// Expand to little-endian 16-bit PCM
pub fn decode_pcm_le(encoded: &[u8], expand: fn(u8) -> i16) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(encoded.len() * 2);
    for &byte in encoded {
        pcm.extend_from_slice(&expand(byte).to_le_bytes());
    }
    pcm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_codes() {
        assert_eq!(ulaw_compress(0), 0xFF);
        assert_eq!(ulaw_expand(0xFF), 0);
        assert_eq!(alaw_compress(0), 0xD5);
        assert_eq!(alaw_expand(0xD5), 8);
    }

    #[test]
    fn test_extremes() {
        assert_eq!(ulaw_expand(0x00), -32124);
        assert_eq!(ulaw_expand(0x80), 32124);
        assert_eq!(alaw_expand(0x00), -5504);
        assert_eq!(alaw_compress(i16::MAX), 0xAA);
        assert_eq!(alaw_expand(0xAA), 32256);
        // Clipped, not wrapped
        assert_eq!(ulaw_compress(i16::MIN), 0x00);
        assert_eq!(ulaw_compress(i16::MAX), 0x80);
    }

    #[test]
    fn test_quantization_error_bounded() {
        for sample in (i16::MIN..=i16::MAX).step_by(97) {
            let bound = i32::from(sample).abs() / 16 + 16;
            let u = ulaw_expand(ulaw_compress(sample));
            assert!(
                (i32::from(u) - i32::from(sample)).abs() <= bound.max(700),
                "µ-law {} -> {}",
                sample,
                u
            );
            let a = alaw_expand(alaw_compress(sample));
            assert!(
                (i32::from(a) - i32::from(sample)).abs() <= bound.max(700),
                "A-law {} -> {}",
                sample,
                a
            );
        }
    }

    #[test]
    fn test_sign_symmetry() {
        for code in 0..=255u8 {
            assert_eq!(ulaw_expand(code), -ulaw_expand(code ^ 0x80));
            assert_eq!(alaw_expand(code), -alaw_expand(code ^ 0x80));
        }
    }

    #[test]
    fn test_pcm_buffers() {
        let pcm: Vec<u8> = [0i16, 1000, -1000]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let encoded = encode_pcm_le(&pcm, ulaw_compress);
        assert_eq!(encoded.len(), 3);
        let decoded = decode_pcm_le(&encoded, ulaw_expand);
        assert_eq!(decoded.len(), 6);
        let first = i16::from_le_bytes([decoded[2], decoded[3]]);
        assert!((first - 1000).abs() < 40);
    }
}
