//! Prometheus text exposition for the default registry.
//!
//! Modules register their own collectors with the default registry the first
//! time they touch them; this module only renders whatever is registered.
//! There is no HTTP listener here: the binary decides how the text gets
//! published (periodic log line, file dump, or a scrape endpoint it owns).

use prometheus::{Encoder, TextEncoder};

/// Every registered collector, rendered in the Prometheus text format.
pub fn render_text() -> Result<String, prometheus::Error> {
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|_| prometheus::Error::Msg("metrics text was not valid utf-8".to_string()))
}
