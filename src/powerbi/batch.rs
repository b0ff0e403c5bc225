use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream;

use super::PdfExporter;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Exports in flight during the first round.
    pub batch_size: usize,
    /// Extra rounds for values that failed.
    pub max_retries: u32,
    /// Pause before each retry round.
    pub retry_delay: Duration,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Generated PDFs keyed by parameter value, in input order.
    pub pdfs: Vec<(String, Bytes)>,
    /// Values that never produced a PDF, in input order.
    pub failed: Vec<String>,
}

impl BatchOutcome {
    pub fn contains(&self, value: &str) -> bool {
        self.pdfs.iter().any(|(v, _)| v == value)
    }
}

/// Exports every distinct value with bounded concurrency, then retries the
/// failures in smaller rounds.
#[tracing::instrument(
    name = "powerbi.batch",
    skip(exporter, values, options),
    fields(batch.total, batch.succeeded, batch.failed)
)]
pub async fn generate_pdf_batch(
    exporter: &dyn PdfExporter,
    parameter_name: &str,
    values: &[String],
    options: &BatchOptions,
) -> BatchOutcome {
    let mut seen = HashSet::new();
    let unique: Vec<&str> = values
        .iter()
        .map(String::as_str)
        .filter(|value| seen.insert(*value))
        .collect();

    let batch_size = options.batch_size.max(1);
    tracing::info!(total = unique.len(), batch_size, "Starting batch processing");

    let mut generated: HashMap<String, Bytes> = HashMap::new();
    let mut pending = run_round(
        exporter,
        parameter_name,
        unique.clone(),
        batch_size,
        &mut generated,
    )
    .await;

    let retry_concurrency = (batch_size / 2).max(1);
    let mut round = 1;
    while !pending.is_empty() && round <= options.max_retries {
        tracing::info!(
            round,
            max_retries = options.max_retries,
            items = pending.len(),
            failed = %pending.join(","),
            "Retrying failed items"
        );
        tracing::info!(delay_s = options.retry_delay.as_secs(), "Waiting before retrying");
        tokio::time::sleep(options.retry_delay).await;

        pending = run_round(
            exporter,
            parameter_name,
            pending,
            retry_concurrency,
            &mut generated,
        )
        .await;
        round += 1;
    }

    let pdfs: Vec<(String, Bytes)> = unique
        .iter()
        .filter_map(|value| generated.remove(*value).map(|pdf| (value.to_string(), pdf)))
        .collect();
    let failed: Vec<String> = unique
        .iter()
        .filter(|value| pending.contains(*value))
        .map(|value| value.to_string())
        .collect();

    let span = tracing::Span::current();
    span.record("batch.total", unique.len());
    span.record("batch.succeeded", pdfs.len());
    span.record("batch.failed", failed.len());

    tracing::info!("{}", "=".repeat(60));
    tracing::info!("PDF Generation Summary:");
    tracing::info!("Total items: {}", unique.len());
    tracing::info!("Successfully generated PDFs: {}", pdfs.len());
    tracing::info!("Failed to generate PDFs: {}", failed.len());
    if !failed.is_empty() {
        tracing::info!("Failed items: {}", failed.join(","));
    }
    tracing::info!("{}", "=".repeat(60));

    BatchOutcome { pdfs, failed }
}

async fn run_round<'a>(
    exporter: &dyn PdfExporter,
    parameter_name: &str,
    values: Vec<&'a str>,
    concurrency: usize,
    generated: &mut HashMap<String, Bytes>,
) -> Vec<&'a str> {
    let mut results = stream::iter(values)
        .map(|value| async move { (value, exporter.export(parameter_name, value).await) })
        .buffer_unordered(concurrency);

    let mut failed = Vec::new();
    while let Some((value, result)) = results.next().await {
        match result {
            Ok(pdf) => {
                tracing::info!(value, "Successfully generated PDF");
                generated.insert(value.to_string(), pdf);
            }
            Err(e) => {
                tracing::warn!(value, error = %e, "Failed to generate PDF, will retry");
                failed.push(value);
            }
        }
    }
    failed
}
