//! Speech-to-text over an OpenAI-compatible transcription endpoint.

use async_trait::async_trait;
use tracing::debug;

use parley_core::backend::Transcriber;
use parley_core::config::TranscriptionConfig;
use parley_core::error::ParleyError;
use parley_core::types::Utterance;

/// Wrap 16-bit PCM in a WAV container.
pub fn pcm_to_wav(pcm: &[i16], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let data_len = pcm.len() * 2; // 2 bytes per i16 sample
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;
    let file_size = 36 + data_len as u32;

    let mut wav = Vec::with_capacity(44 + data_len);

    // RIFF header
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&file_size.to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    // fmt chunk
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes()); // chunk size
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());

    // data chunk
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&(data_len as u32).to_le_bytes());
    for &sample in pcm {
        wav.extend_from_slice(&sample.to_le_bytes());
    }

    wav
}

/// Encode an utterance as a mono 16-bit WAV file.
pub fn utterance_to_wav(utterance: &Utterance) -> Vec<u8> {
    let pcm: Vec<i16> = utterance
        .samples()
        .into_iter()
        .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect();
    pcm_to_wav(&pcm, utterance.format.sample_rate, 1, 16)
}

/// Get the transcription API URL for a given provider.
pub fn provider_url(config: &TranscriptionConfig) -> String {
    if let Some(base) = &config.base_url {
        return format!("{}/v1/audio/transcriptions", base.trim_end_matches('/'));
    }
    match config.provider.as_str() {
        "openai" => "https://api.openai.com/v1/audio/transcriptions".into(),
        "local" => "http://localhost:9000/v1/audio/transcriptions".into(),
        _ => "https://api.groq.com/openai/v1/audio/transcriptions".into(),
    }
}

fn default_model(provider: &str) -> &'static str {
    match provider {
        "openai" => "whisper-1",
        "local" => "tiny",
        _ => "whisper-large-v3-turbo",
    }
}

/// Transcriber backed by a multipart upload to a Whisper-style API.
pub struct HttpTranscriber {
    config: TranscriptionConfig,
    client: reqwest::Client,
}

impl HttpTranscriber {
    pub fn new(config: TranscriptionConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    fn id(&self) -> &str {
        &self.config.provider
    }

    async fn transcribe(&self, utterance: &Utterance) -> anyhow::Result<String> {
        let api_key = self.config.resolve_api_key();
        if api_key.is_none() && self.config.provider != "local" {
            return Err(ParleyError::Transcription("No API key configured".into()).into());
        }

        let wav_data = utterance_to_wav(utterance);
        let url = provider_url(&self.config);
        let model = self
            .config
            .model
            .clone()
            .unwrap_or_else(|| default_model(&self.config.provider).to_string());
        let language = self.config.language.clone().unwrap_or_else(|| "en".into());

        debug!(%url, %model, wav_bytes = wav_data.len(), "Sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav_data)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;

        let form = reqwest::multipart::Form::new()
            .text("model", model)
            .text("language", language)
            .text("response_format", "text")
            .part("file", part);

        let mut request = self.client.post(&url).multipart(form);
        if let Some(key) = api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        let resp = request.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ParleyError::Transcription(format!("API error {status}: {body}")).into());
        }

        let text = resp.text().await?;
        Ok(text.trim().to_string())
    }
}
