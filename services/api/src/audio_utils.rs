use anyhow::Result;
use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

// Sample rates on either side of the media-stream bridge
pub const TWILIO_MEDIA_SAMPLE_RATE: f64 = 8000.0;
pub const OPENAI_REALTIME_API_PCM16_SAMPLE_RATE: f64 = 24000.0;

/// One 20 ms frame of 8 kHz μ-law audio.
pub const TWILIO_FRAME_BYTES: usize = 160;

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// Encodes one linear PCM16 sample as G.711 μ-law.
pub fn mulaw_encode(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Decodes one G.711 μ-law byte to linear PCM16.
pub fn mulaw_decode(byte: u8) -> i16 {
    let b = !byte as i32;
    let exponent = (b >> 4) & 0x07;
    let mantissa = b & 0x0F;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if b & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

pub fn mulaw_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| mulaw_decode(b)).collect()
}

pub fn pcm16_to_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| mulaw_encode(s)).collect()
}

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // Fixed ratio
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Resamples an unbounded mono stream delivered in arbitrarily sized pieces.
///
/// Samples are buffered until a full input chunk is available; the remainder
/// carries over to the next `push`.
pub struct StreamResampler {
    resampler: FastFixedIn<f32>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_sampling_rate: f64, out_sampling_rate: f64, chunk_size: usize) -> Result<Self> {
        Ok(Self {
            resampler: create_resampler(in_sampling_rate, out_sampling_rate, chunk_size)?,
            pending: Vec::with_capacity(chunk_size * 2),
        })
    }

    /// Twilio 8 kHz → OpenAI 24 kHz, in 20 ms chunks.
    pub fn twilio_to_openai() -> Result<Self> {
        Self::new(
            TWILIO_MEDIA_SAMPLE_RATE,
            OPENAI_REALTIME_API_PCM16_SAMPLE_RATE,
            TWILIO_FRAME_BYTES,
        )
    }

    /// OpenAI 24 kHz → Twilio 8 kHz, in 20 ms chunks.
    pub fn openai_to_twilio() -> Result<Self> {
        Self::new(
            OPENAI_REALTIME_API_PCM16_SAMPLE_RATE,
            TWILIO_MEDIA_SAMPLE_RATE,
            TWILIO_FRAME_BYTES * 3,
        )
    }

    pub fn push(&mut self, samples: &[i16]) -> Result<Vec<i16>> {
        self.pending.extend(convert_i16_to_f32(samples));
        let mut out = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let res = self.resampler.process(&[chunk], None)?;
            out.extend(convert_f32_to_i16(&res[0]));
        }
        Ok(out)
    }

    /// Samples buffered but not yet resampled.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drops buffered input and the filter history.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
    }
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Base64 PCM16 little-endian, the realtime API's audio encoding.
pub fn encode_i16(pcm16: &[i16]) -> String {
    let pcm16_bytes: Vec<u8> = pcm16
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&pcm16_bytes)
}

pub fn decode_i16(base64_fragment: &str) -> Vec<i16> {
    if let Ok(pcm16_bytes) = base64::engine::general_purpose::STANDARD.decode(base64_fragment) {
        pcm16_bytes
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect()
    } else {
        tracing::error!("Failed to decode base64 fragment to i16");
        Vec::new()
    }
}

/// Decodes a Twilio media payload (base64 μ-law) to PCM16.
pub fn decode_mulaw_payload(payload: &str) -> Vec<i16> {
    match base64::engine::general_purpose::STANDARD.decode(payload) {
        Ok(bytes) => mulaw_to_pcm16(&bytes),
        Err(e) => {
            tracing::error!(error = %e, "Failed to decode media payload");
            Vec::new()
        }
    }
}

pub fn encode_mulaw_payload(mulaw: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(mulaw)
}
