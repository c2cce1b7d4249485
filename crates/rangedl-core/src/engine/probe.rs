//! Range probing
//!
//! A `bytes=0-0` GET tells us in one round trip whether the server honours
//! ranges and how large the resource is. Servers that ignore the header get a
//! HEAD follow-up and we read `Accept-Ranges` / `Content-Length` instead.

use crate::error::Result;
use rangedl_types::ProbeResult;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info};

/// Issues probe requests against a source URL
#[derive(Clone)]
pub struct RangeProber {
    client: Client,
    timeout: Duration,
}

impl RangeProber {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Probe `url` for range support and total length.
    ///
    /// Only transport failures are errors; odd headers degrade to
    /// `range_supported = false` / unknown length.
    pub async fn probe(&self, url: &str) -> Result<ProbeResult> {
        let response = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .timeout(self.timeout)
            .send()
            .await?;

        if response.status() == StatusCode::PARTIAL_CONTENT {
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total);
            info!("Probe {}: partial content, total={:?}", url, total);
            return Ok(ProbeResult {
                range_supported: true,
                total_length: total,
            });
        }
        debug!(
            "Probe {}: ranged GET answered {}, falling back to HEAD",
            url,
            response.status()
        );
        drop(response);

        let head = self.client.head(url).timeout(self.timeout).send().await?;
        let result = probe_from_head(head.headers());
        info!(
            "Probe {}: HEAD says range_supported={}, total={:?}",
            url, result.range_supported, result.total_length
        );
        Ok(result)
    }
}

/// Read range support and length from HEAD response headers
pub(crate) fn probe_from_head(headers: &HeaderMap) -> ProbeResult {
    let range_supported = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);
    let total_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    ProbeResult {
        range_supported,
        total_length,
    }
}

/// Total from `Content-Range: bytes <start>-<end>/<total>`. `*` means unknown.
pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}
