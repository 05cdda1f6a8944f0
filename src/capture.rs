use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::info;

use crate::agent::{AgentError, Computer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureScope {
    Viewport,
    FullPage,
}

/// A PNG capture plus its base64 form. Lives for one iteration only.
#[derive(Clone, Debug)]
pub struct Screenshot {
    bytes: Vec<u8>,
    encoded: String,
}

impl Screenshot {
    pub fn from_png(bytes: Vec<u8>) -> Self {
        let encoded = STANDARD.encode(&bytes);
        Self { bytes, encoded }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn base64(&self) -> &str {
        &self.encoded
    }

    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.encoded)
    }
}

/// Re-captures on every call; nothing is cached between iterations.
pub async fn capture<C: Computer + ?Sized>(
    computer: &C,
    scope: CaptureScope,
) -> Result<Screenshot, AgentError> {
    let png = computer.screenshot(scope == CaptureScope::FullPage).await?;
    info!(bytes = png.len(), ?scope, "screenshot taken");
    Ok(Screenshot::from_png(png))
}
