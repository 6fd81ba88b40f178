use std::{net::SocketAddr, sync::Arc};

use llm_core::{OpenAiChatClient, WhisperClient};
use server::config::{AssistantConfig, AudioOutput};
use server::{router, AppState, Collaborators, Orchestrator};
use speech_core::{AudioSink, ClockSink, OpenAiSynthesizer};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting voice assistant server...");

    let config = AssistantConfig::from_env()?;
    if config.chat_api_key.is_none() {
        warn!("No CHAT_API_KEY or OPENAI_API_KEY set, chat requests will be rejected");
    }
    if config.speech_api_key.is_none() {
        warn!("No OPENAI_API_KEY set, synthesis and transcription requests will be rejected");
    }
    info!(
        "Chat model {} at {}, speech model {} with voice {}",
        config.chat_model, config.chat_base_url, config.speech_model, config.voice
    );

    let collaborators = Collaborators {
        chat: Arc::new(OpenAiChatClient::new(config.chat_client())),
        transcriber: Arc::new(WhisperClient::new(config.whisper_client())),
        synthesizer: Arc::new(OpenAiSynthesizer::new(config.speech_client())),
        sink: audio_sink(config.audio_output),
    };
    let orchestrator = Orchestrator::new(config.pipeline(), collaborators);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let app = router(AppState {
        orchestrator,
        config: Arc::new(config),
    });

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT.")
    })?;
    info!("Listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(feature = "device-audio")]
fn audio_sink(output: AudioOutput) -> Arc<dyn AudioSink> {
    match output {
        AudioOutput::Device => {
            info!("Playing audio on the default output device");
            Arc::new(speech_core::DeviceSink::default())
        }
        AudioOutput::Clock => Arc::new(ClockSink),
    }
}

#[cfg(not(feature = "device-audio"))]
fn audio_sink(output: AudioOutput) -> Arc<dyn AudioSink> {
    if output == AudioOutput::Device {
        warn!("AUDIO_OUTPUT=device needs the device-audio feature, falling back to clock playback");
    }
    Arc::new(ClockSink)
}
