//! HTTP provisioners: one POST per call, no retries.
use super::{Mode, MODE_HEADER};
use crate::util::truncate_bytes;
use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};

const MAX_DIAGNOSTIC_BYTES: usize = 8 * 1024;

pub(super) fn post(url: &str, mode: Mode, body: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>> {
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(timeout)
        .build()
        .into();

    let start = Instant::now();
    let mut response = agent
        .post(url)
        .header("Content-Type", "application/json")
        .header("Accept", "application/json")
        .header(MODE_HEADER, mode.as_str())
        .send(body)
        .with_context(|| format!("POST {url}"))?;
    let status = response.status();
    let bytes = response
        .body_mut()
        .read_to_vec()
        .with_context(|| format!("read response body from {url}"))?;

    tracing::info!(
        url,
        mode = mode.as_str(),
        status = status.as_u16(),
        elapsed_ms = start.elapsed().as_millis(),
        response_bytes = bytes.len(),
        "http provisioner complete"
    );

    if !status.is_success() {
        return Err(anyhow!(
            "http {} request failed with status {}: '{}'",
            mode.as_str(),
            status,
            truncate_bytes(&bytes, MAX_DIAGNOSTIC_BYTES).trim()
        ));
    }
    Ok(bytes)
}
