//! Sample format and rate conversion helpers

/// Convert any CPAL sample to PCM16.
pub fn sample_to_i16<T: cpal::Sample>(sample: T) -> i16
where
    f32: cpal::FromSample<T>,
{
    let f32_sample: f32 = sample.to_sample::<f32>();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Average interleaved channels down to mono.
pub fn to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Downsample by averaging, for integer ratios only.
///
/// Returns `None` when the ratio is not an integer or either rate is zero.
pub fn downsample(samples: &[i16], source_rate: u32, target_rate: u32) -> Option<Vec<i16>> {
    if target_rate == 0 || source_rate == 0 || source_rate < target_rate {
        return None;
    }

    if source_rate == target_rate {
        return Some(samples.to_vec());
    }

    if source_rate % target_rate != 0 {
        return None;
    }

    let ratio = (source_rate / target_rate) as usize;

    Some(
        samples
            .chunks(ratio)
            .map(|chunk| {
                // i64 avoids overflow on large ratios
                let sum: i64 = chunk.iter().map(|&s| s as i64).sum();
                (sum / chunk.len() as i64) as i16
            })
            .collect(),
    )
}

/// Serialize PCM16 samples as little-endian bytes.
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Parse little-endian PCM16 bytes. Returns `None` for an odd byte count.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Option<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    )
}
