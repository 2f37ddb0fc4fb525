//! Streaming TTS: yields fixed-size audio chunks as they arrive from the provider.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::debug;

use parley_core::backend::{AudioStream, Synthesizer};
use parley_core::config::SynthesisConfig;
use parley_core::error::ParleyError;
use parley_core::types::{AudioFormat, SampleEncoding};

const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io";
const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// OpenAI `pcm` output is fixed at 24 kHz.
const OPENAI_PCM_RATE: u32 = 24_000;
const ELEVENLABS_PCM_RATE: u32 = 16_000;

/// Build the ElevenLabs streaming TTS request URL for a given voice.
pub fn build_tts_url(base_url: &str, voice: &str) -> String {
    format!(
        "{}/v1/text-to-speech/{voice}/stream?output_format=pcm_{ELEVENLABS_PCM_RATE}",
        base_url.trim_end_matches('/')
    )
}

/// Synthesizer streaming raw 16-bit PCM from ElevenLabs or an OpenAI-compatible
/// `/v1/audio/speech` endpoint.
pub struct HttpSynthesizer {
    config: SynthesisConfig,
    chunk_bytes: usize,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    pub fn new(config: SynthesisConfig, chunk_bytes: usize) -> Self {
        Self {
            config,
            chunk_bytes,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, text: &str, api_key: &str) -> reqwest::RequestBuilder {
        match self.config.provider.as_str() {
            "openai" => {
                let base = self.config.base_url.as_deref().unwrap_or(OPENAI_BASE_URL);
                let voice = self.config.voice.as_deref().unwrap_or("alloy");
                let model = self.config.model.as_deref().unwrap_or("tts-1");
                self.client
                    .post(format!("{}/v1/audio/speech", base.trim_end_matches('/')))
                    .header("Authorization", format!("Bearer {api_key}"))
                    .json(&json!({
                        "model": model,
                        "voice": voice,
                        "input": text,
                        "response_format": "pcm",
                    }))
            }
            _ => {
                let base = self.config.base_url.as_deref().unwrap_or(ELEVENLABS_BASE_URL);
                let voice = self.config.voice.as_deref().unwrap_or("Rachel");
                let model = self.config.model.as_deref().unwrap_or("eleven_turbo_v2");
                self.client
                    .post(build_tts_url(base, voice))
                    .header("xi-api-key", api_key)
                    .json(&json!({
                        "text": text,
                        "model_id": model,
                    }))
            }
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    fn id(&self) -> &str {
        &self.config.provider
    }

    fn output_format(&self) -> AudioFormat {
        let sample_rate = match self.config.provider.as_str() {
            "openai" => OPENAI_PCM_RATE,
            _ => ELEVENLABS_PCM_RATE,
        };
        AudioFormat {
            sample_rate,
            encoding: SampleEncoding::S16le,
        }
    }

    async fn synthesize(&self, text: &str) -> anyhow::Result<AudioStream> {
        let api_key = self
            .config
            .resolve_api_key()
            .ok_or_else(|| ParleyError::Synthesis("No API key configured".into()))?;

        debug!(provider = %self.config.provider, text_len = text.len(), "Starting TTS stream");

        let resp = self.request(text, &api_key).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ParleyError::Synthesis(format!("API error {status}: {body}")).into());
        }

        let bytes = resp
            .bytes_stream()
            .map(|r| r.map_err(|e| anyhow::anyhow!("TTS stream error: {e}")));
        Ok(rechunk(bytes, self.chunk_bytes))
    }
}

struct RechunkState {
    inner: Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
    done: bool,
}

/// Re-slice an arbitrary byte stream into chunks of exactly `chunk_bytes`.
///
/// The final chunk carries whatever remains and may be shorter. An upstream
/// error is yielded once and ends the stream.
pub fn rechunk<S>(inner: S, chunk_bytes: usize) -> AudioStream
where
    S: Stream<Item = anyhow::Result<Bytes>> + Send + 'static,
{
    let chunk_bytes = chunk_bytes.max(1);
    let stream = futures::stream::unfold(
        RechunkState {
            inner: Box::pin(inner),
            buffer: Vec::new(),
            done: false,
        },
        move |mut state| async move {
            loop {
                if state.buffer.len() >= chunk_bytes {
                    let rest = state.buffer.split_off(chunk_bytes);
                    let chunk = std::mem::replace(&mut state.buffer, rest);
                    return Some((Ok(chunk), state));
                }
                if state.done {
                    if state.buffer.is_empty() {
                        return None;
                    }
                    let chunk = std::mem::take(&mut state.buffer);
                    return Some((Ok(chunk), state));
                }
                match state.inner.next().await {
                    Some(Ok(bytes)) => state.buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        state.done = true;
                        state.buffer.clear();
                        return Some((Err(e), state));
                    }
                    None => state.done = true,
                }
            }
        },
    );
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(parts: Vec<&'static [u8]>) -> impl Stream<Item = anyhow::Result<Bytes>> + Send {
        futures::stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p))))
    }

    #[test]
    fn test_request_construction() {
        let url = build_tts_url("https://api.elevenlabs.io/", "Rachel");
        assert!(url.contains("Rachel"));
        assert!(url.contains("/stream"));
        assert!(url.contains("pcm_16000"));
        assert!(url.starts_with("https://api.elevenlabs.io/v1"));
    }

    #[test]
    fn test_output_format_follows_provider() {
        let eleven = HttpSynthesizer::new(SynthesisConfig::default(), 640);
        assert_eq!(eleven.output_format().sample_rate, 16_000);

        let openai = HttpSynthesizer::new(
            SynthesisConfig {
                provider: "openai".into(),
                ..SynthesisConfig::default()
            },
            640,
        );
        assert_eq!(openai.output_format().sample_rate, 24_000);
        assert_eq!(openai.output_format().encoding, SampleEncoding::S16le);
    }

    #[tokio::test]
    async fn test_rechunk_fixed_sizes() {
        let stream = rechunk(source(vec![b"abc", b"defgh", b"ij"]), 4);
        let chunks: Vec<Vec<u8>> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(
            chunks,
            vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_rechunk_preserves_order_and_bytes() {
        let stream = rechunk(source(vec![b"0123456789", b"abcdef"]), 3);
        let chunks: Vec<Vec<u8>> = stream.map(|r| r.unwrap()).collect().await;
        assert!(chunks[..chunks.len() - 1].iter().all(|c| c.len() == 3));
        assert_eq!(chunks.concat(), b"0123456789abcdef".to_vec());
    }

    #[tokio::test]
    async fn test_rechunk_error_ends_stream() {
        let parts: Vec<anyhow::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"ab")),
            Err(anyhow::anyhow!("connection reset")),
            Ok(Bytes::from_static(b"cd")),
        ];
        let mut stream = rechunk(futures::stream::iter(parts), 4);
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_request() {
        let synth = HttpSynthesizer::new(SynthesisConfig::default(), 640);
        let err = synth.synthesize("hello").await.err().unwrap();
        assert!(err.to_string().contains("API key"));
        assert!(matches!(
            err.downcast_ref::<ParleyError>(),
            Some(ParleyError::Synthesis(_))
        ));
    }
}
