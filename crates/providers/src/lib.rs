//! Streaming model backends for PocketCode.
//!
//! Every backend implements `pocketcode_core::ProviderClient`. The router
//! picks one per request from the model's provider name.

pub mod native;
pub mod openai_compat;
pub mod router;
pub mod streaming;
pub mod transport;

#[cfg(test)]
mod testing;

pub use native::NativeClient;
pub use openai_compat::{Dialect, OpenAiCompatClient};
pub use router::{ModelRegistry, ProviderRouter, build_from_config};
pub use streaming::ActiveStreams;
pub use transport::{Framing, HttpRequest, SseTransport, TransportEvent};
