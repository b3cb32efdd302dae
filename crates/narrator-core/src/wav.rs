//! WAV encoding/decoding and sample conversion.
//!
//! Pure functions — no I/O, no async runtime.

use crate::types::Waveform;

/// Output format written by the server: 16-bit mono PCM.
pub const BITS_PER_SAMPLE: u16 = 16;

/// Quantize a float sample to 16-bit PCM.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Write a minimal WAV file (16-bit mono PCM) from raw samples.
pub fn write_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let file_len = 36 + data_len;
    let mut buf = Vec::with_capacity(44 + data_len as usize);

    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&file_len.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    // fmt chunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes()); // chunk size
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

    // data chunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }

    buf
}

/// Encode a whole waveform as a WAV file.
pub fn encode_waveform(waveform: &Waveform) -> Vec<u8> {
    let pcm: Vec<i16> = waveform.samples.iter().map(|&s| f32_to_i16(s)).collect();
    write_wav(&pcm, waveform.sample_rate)
}

/// Parsed WAV header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavHeader {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// Byte offset in the buffer where raw PCM data begins.
    pub data_offset: usize,
    /// Declared `data` chunk size; `None` for the streaming sentinel.
    pub data_len: Option<usize>,
}

/// Parse a WAV header from a byte buffer.
///
/// Returns the audio format parameters and the byte offset where PCM data
/// starts. Kokoro's `0xFFFFFFFF` sentinel sizes are tolerated.
pub fn parse_wav_header(buf: &[u8]) -> Result<WavHeader, &'static str> {
    if buf.len() < 12 {
        return Err("too short for RIFF header");
    }
    if &buf[0..4] != b"RIFF" {
        return Err("missing RIFF tag");
    }
    if &buf[8..12] != b"WAVE" {
        return Err("missing WAVE tag");
    }

    let mut pos = 12;
    let mut channels: Option<u16> = None;
    let mut sample_rate: Option<u32> = None;
    let mut bits_per_sample: Option<u16> = None;

    while pos + 8 <= buf.len() {
        let chunk_id = &buf[pos..pos + 4];
        let chunk_size =
            u32::from_le_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]);

        if chunk_id == b"fmt " {
            if pos + 24 > buf.len() {
                return Err("fmt chunk truncated");
            }
            let audio_format = u16::from_le_bytes([buf[pos + 8], buf[pos + 9]]);
            if audio_format != 1 {
                return Err("not PCM format");
            }
            channels = Some(u16::from_le_bytes([buf[pos + 10], buf[pos + 11]]));
            sample_rate = Some(u32::from_le_bytes([
                buf[pos + 12],
                buf[pos + 13],
                buf[pos + 14],
                buf[pos + 15],
            ]));
            bits_per_sample = Some(u16::from_le_bytes([buf[pos + 22], buf[pos + 23]]));

            let skip = if chunk_size == 0xFFFFFFFF {
                16
            } else {
                chunk_size as usize
            };
            pos += 8 + skip;
            continue;
        }

        if chunk_id == b"data" {
            let ch = channels.ok_or("data chunk before fmt chunk")?;
            let sr = sample_rate.ok_or("data chunk before fmt chunk")?;
            let bps = bits_per_sample.ok_or("data chunk before fmt chunk")?;
            return Ok(WavHeader {
                channels: ch,
                sample_rate: sr,
                bits_per_sample: bps,
                data_offset: pos + 8,
                data_len: (chunk_size != 0xFFFFFFFF).then_some(chunk_size as usize),
            });
        }

        let skip = if chunk_size == 0xFFFFFFFF {
            0
        } else {
            chunk_size as usize
        };
        pos += 8 + skip;
    }

    Err("data chunk not found")
}

/// Fix WAV files with indeterminate sizes (0xFFFFFFFF).
///
/// Kokoro streams WAV with chunked transfer encoding, writing `0xFFFFFFFF`
/// for the RIFF and `data` chunk sizes. Once the full body is buffered the
/// real sizes can be computed.
pub fn fix_wav_sizes(mut wav: Vec<u8>) -> Vec<u8> {
    if wav.len() < 44 {
        return wav;
    }
    if &wav[0..4] != b"RIFF" {
        return wav;
    }
    let riff_size = (wav.len() - 8) as u32;
    wav[4..8].copy_from_slice(&riff_size.to_le_bytes());

    let mut pos = 12;
    while pos + 8 <= wav.len() {
        let chunk_id = &wav[pos..pos + 4];
        if chunk_id == b"data" {
            let data_size = (wav.len() - pos - 8) as u32;
            wav[pos + 4..pos + 8].copy_from_slice(&data_size.to_le_bytes());
            break;
        }
        let chunk_size =
            u32::from_le_bytes([wav[pos + 4], wav[pos + 5], wav[pos + 6], wav[pos + 7]]);
        let skip = if chunk_size == 0xFFFFFFFF {
            0
        } else {
            chunk_size as usize
        };
        pos += 8 + skip;
    }

    wav
}

/// Decode a 16-bit PCM WAV buffer into a mono waveform.
///
/// Multi-channel input is downmixed by averaging.
pub fn decode_wav(buf: &[u8]) -> Result<Waveform, &'static str> {
    let header = parse_wav_header(buf)?;
    if header.bits_per_sample != BITS_PER_SAMPLE {
        return Err("only 16-bit PCM is supported");
    }
    if header.channels == 0 {
        return Err("zero channels");
    }

    let start = header.data_offset.min(buf.len());
    let end = header
        .data_len
        .map_or(buf.len(), |len| start.saturating_add(len).min(buf.len()));
    let pcm = &buf[start..end];
    let (frames, _) = bytes_to_i16(pcm, None);
    let channels = header.channels as usize;
    let samples = frames
        .chunks_exact(channels)
        .map(|frame| frame.iter().map(|&s| i16_to_f32(s)).sum::<f32>() / channels as f32)
        .collect();

    Ok(Waveform::new(samples, header.sample_rate))
}

/// Convert raw bytes to i16 PCM samples (little-endian).
///
/// A trailing odd byte is returned so it can be carried into the next chunk
/// of a streamed body.
pub fn bytes_to_i16(bytes: &[u8], leftover: Option<u8>) -> (Vec<i16>, Option<u8>) {
    let mut data: Vec<u8>;
    let slice = if let Some(lo) = leftover {
        data = Vec::with_capacity(1 + bytes.len());
        data.push(lo);
        data.extend_from_slice(bytes);
        &data[..]
    } else {
        bytes
    };

    let mut samples = Vec::with_capacity(slice.len() / 2);
    for pair in slice.chunks_exact(2) {
        samples.push(i16::from_le_bytes([pair[0], pair[1]]));
    }

    let remainder = if slice.len() % 2 == 1 {
        Some(slice[slice.len() - 1])
    } else {
        None
    };

    (samples, remainder)
}
