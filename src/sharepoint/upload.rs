use bytes::Bytes;
use futures::StreamExt;
use futures::stream;

use super::DriveClient;
use crate::http::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadLayout {
    /// `{base}/{id}.pdf`
    Flat,
    /// `{base}/report_{id}/report_{id}.pdf`
    PerItemFolder,
}

impl UploadLayout {
    /// Folder and file name a PDF for `identifier` is stored under.
    pub fn target(self, base_folder: &str, identifier: &str) -> (String, String) {
        let base = base_folder.trim().trim_matches('/');
        match self {
            UploadLayout::Flat => {
                let file_name = if identifier.ends_with(".pdf") {
                    identifier.to_string()
                } else {
                    format!("{identifier}.pdf")
                };
                (base.to_string(), file_name)
            }
            UploadLayout::PerItemFolder => {
                let clean = identifier.strip_prefix("report_").unwrap_or(identifier);
                let clean = clean.strip_suffix(".pdf").unwrap_or(clean);
                let folder = if base.is_empty() {
                    format!("report_{clean}")
                } else {
                    format!("{base}/report_{clean}")
                };
                (folder, format!("report_{clean}.pdf"))
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct UploadOutcome {
    pub uploaded: Vec<String>,
    pub failed: Vec<String>,
}

#[tracing::instrument(
    name = "sharepoint.upload_batch",
    skip(drive, pdfs),
    fields(upload.total = pdfs.len(), upload.succeeded, upload.failed)
)]
pub async fn upload_pdfs_batch(
    drive: &DriveClient,
    pdfs: &[(String, Bytes)],
    base_folder: &str,
    layout: UploadLayout,
    batch_size: usize,
) -> UploadOutcome {
    tracing::info!(files = pdfs.len(), folder = %base_folder, "Starting batch upload");
    if layout == UploadLayout::PerItemFolder {
        tracing::info!("Creating individual folders for each file (base/report_id/report_id.pdf)");
    }

    if let Err(e) = drive.ensure_folder(base_folder).await {
        tracing::error!(folder = %base_folder, error = %e, "Cannot create base folder");
        return UploadOutcome {
            uploaded: Vec::new(),
            failed: pdfs.iter().map(|(id, _)| id.clone()).collect(),
        };
    }

    let mut results = stream::iter(pdfs.iter().enumerate())
        .map(|(index, (identifier, pdf))| async move {
            let (folder, file_name) = layout.target(base_folder, identifier);
            let result = async {
                if layout == UploadLayout::PerItemFolder {
                    drive.ensure_folder(&folder).await?;
                }
                drive
                    .upload_bytes(
                        &folder,
                        &file_name,
                        pdf.clone(),
                        "application/pdf",
                        &RetryPolicy::default(),
                    )
                    .await
            }
            .await;
            (index, identifier, result)
        })
        .buffer_unordered(batch_size.max(1));

    let mut done: Vec<(usize, &String, bool)> = Vec::with_capacity(pdfs.len());
    while let Some((index, identifier, result)) = results.next().await {
        if let Err(e) = &result {
            tracing::error!(identifier = %identifier, error = %e, "Failed to upload PDF");
        }
        done.push((index, identifier, result.is_ok()));
    }
    done.sort_by_key(|(index, _, _)| *index);

    let mut outcome = UploadOutcome::default();
    for (_, identifier, ok) in done {
        if ok {
            outcome.uploaded.push(identifier.clone());
        } else {
            outcome.failed.push(identifier.clone());
        }
    }

    let span = tracing::Span::current();
    span.record("upload.succeeded", outcome.uploaded.len());
    span.record("upload.failed", outcome.failed.len());
    tracing::info!(
        uploaded = outcome.uploaded.len(),
        failed = outcome.failed.len(),
        "Batch upload finished"
    );
    outcome
}
