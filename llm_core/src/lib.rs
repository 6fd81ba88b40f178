//! Language side of the assistant: streamed chat, conversation memory and
//! transcription, all behind traits so the pipeline can be driven by fakes.
pub mod chat;
pub mod error;
pub mod memory;
pub mod sse;
pub mod transcribe;

pub use chat::{
    ChatClientConfig, ChatEvent, ChatMessage, ChatStream, DeltaStream, OpenAiChatClient, Role,
};
pub use error::LlmError;
pub use memory::{system_prompt, ChatMemory};
pub use transcribe::{AudioFormat, Recording, Transcriber, WhisperClient, WhisperConfig};
