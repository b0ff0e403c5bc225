use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
};
use std::sync::LazyLock;

pub static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("report-publisher"));

// --- Power BI export ---

pub static PDF_EXPORTS_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("powerbi.export.count")
        .with_description("Number of PDF export attempts by outcome")
        .with_unit("{export}")
        .build()
});

pub static PDF_EXPORT_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("powerbi.export.duration")
        .with_description("Duration of a single PDF export, from request to download")
        .with_unit("s")
        .build()
});

pub static PDF_EXPORT_POLLS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("powerbi.export.polls")
        .with_description("Number of export status polls")
        .with_unit("{poll}")
        .build()
});

// --- SharePoint ---

pub static UPLOADS_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("sharepoint.upload.count")
        .with_description("Number of file uploads by outcome")
        .with_unit("{file}")
        .build()
});

pub static UPLOAD_BYTES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("sharepoint.upload.bytes")
        .with_description("Bytes uploaded to SharePoint")
        .with_unit("By")
        .build()
});

pub static SHARE_LINKS_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("sharepoint.link.count")
        .with_description("Number of share links requested by outcome")
        .with_unit("{link}")
        .build()
});

// --- HTTP ---

pub static HTTP_RETRY_COUNT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("http.client.retry.count")
        .with_description("Number of HTTP request retries")
        .with_unit("{retry}")
        .build()
});

// --- Notification ---

pub static EMAILS_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("notification.email.count")
        .with_description("Number of notification emails by channel and outcome")
        .with_unit("{email}")
        .build()
});

// --- Workflow ---

pub static WORKFLOW_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("workflow.duration")
        .with_description("Total workflow duration in seconds")
        .with_unit("s")
        .build()
});

pub static WORKFLOW_ITEMS: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("workflow.items")
        .with_description("Number of items processed per category and outcome")
        .with_unit("{item}")
        .build()
});
