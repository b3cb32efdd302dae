//! Synthesis executor — one text in, one waveform out.
//!
//! Two tiers, tried in order:
//!
//! 1. the model's [`FastPath`](crate::model::FastPath), only on accelerators;
//! 2. the standard [`SpeechModel::synthesize`] call.
//!
//! A fast-path failure is logged at `debug` and never reaches the caller.

use tracing::debug;

use narrator_core::text::{PREVIEW_CHARS, is_blank, preview};
use narrator_core::types::{Device, Waveform};
use narrator_core::{Error, Result};

use crate::model::SpeechModel;

pub async fn synthesize(model: &dyn SpeechModel, device: Device, text: &str) -> Result<Waveform> {
    if is_blank(text) {
        return Err(Error::validation("No text provided"));
    }

    if device.is_accelerator() {
        if let Some(fast) = model.fast_path() {
            match fast.try_optimized(text).await {
                Ok(waveform) if !waveform.samples.is_empty() => return Ok(waveform),
                Ok(_) => debug!(%device, "fast path returned no audio, using standard path"),
                Err(e) => debug!(%device, "fast path failed, using standard path: {e}"),
            }
        }
    }

    let waveform = model.synthesize(text).await?;
    if waveform.samples.is_empty() {
        return Err(Error::synthesis(format!(
            "model produced no audio for \"{}\"",
            preview(text, PREVIEW_CHARS)
        )));
    }
    Ok(waveform)
}
