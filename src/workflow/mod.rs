pub mod run_log;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use opentelemetry::KeyValue;

use crate::auth::{GRAPH_SCOPE, POWERBI_SCOPE, SQL_SCOPE, TokenProvider};
use crate::cli::ReportType;
use crate::clock::RunClock;
use crate::config::{Credentials, Settings, SmtpSettings};
use crate::error::AppResult;
use crate::lakehouse::{self, EmployeeRecord, LakehouseSource, TdsLakehouse};
use crate::links::{self, generate_employee_links};
use crate::notify::{self, CategorySummary, EmailMessage, RunSummary};
use crate::powerbi::{BatchOptions, PowerBiClient, generate_pdf_batch};
use crate::sharepoint::{DriveClient, GraphClient, UploadLayout, upload_pdfs_batch};
use crate::telemetry::metrics::WORKFLOW_ITEMS;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub report_type: ReportType,
    pub dry_run: bool,
    pub skip_links: bool,
    /// Overrides both configured export batch sizes.
    pub batch_size: Option<usize>,
    /// Local directory receiving a copy of every generated PDF.
    pub output_dir: Option<PathBuf>,
}

/// Remote clients the workflow talks to.
pub struct Services {
    pub lakehouse: Box<dyn LakehouseSource>,
    pub powerbi: PowerBiClient,
    pub graph: GraphClient,
}

impl Services {
    pub fn connect(settings: &Settings, credentials: &Credentials) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(300))
            .build()?;
        let login = settings.endpoints.login.as_str();

        let lakehouse = TdsLakehouse::new(
            &credentials.sql_endpoint,
            &credentials.database,
            TokenProvider::new(http.clone(), login, &credentials.fabric, SQL_SCOPE),
        );

        let powerbi = PowerBiClient::new(
            http.clone(),
            TokenProvider::new(http.clone(), login, &credentials.fabric, POWERBI_SCOPE),
            &settings.endpoints.powerbi,
            &credentials.powerbi_workspace_id,
            &credentials.powerbi_report_id,
        )
        .with_polling(&settings.powerbi.export);

        let graph = GraphClient::new(
            http.clone(),
            TokenProvider::new(http, login, &credentials.sharepoint, GRAPH_SCOPE),
            &settings.endpoints.graph,
        );

        Ok(Self {
            lakehouse: Box::new(lakehouse),
            powerbi,
            graph,
        })
    }
}

/// Where output lands: the SharePoint library and the mail recipients.
#[derive(Debug, Clone)]
pub struct Destination {
    pub site_url: String,
    pub site_path: String,
    pub drive_name: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub smtp: Option<SmtpSettings>,
}

impl From<&Credentials> for Destination {
    fn from(credentials: &Credentials) -> Self {
        Self {
            site_url: credentials.site_url.clone(),
            site_path: credentials.site_path.clone(),
            drive_name: credentials.drive_name.clone(),
            sender: credentials.email_sender.clone(),
            recipients: credentials.email_recipients.clone(),
            smtp: credentials.smtp.clone(),
        }
    }
}

pub struct Workflow {
    settings: Settings,
    options: RunOptions,
    services: Services,
    destination: Destination,
}

fn banner(title: &str) {
    tracing::info!("{}", "=".repeat(60));
    tracing::info!("{title}");
    tracing::info!("{}", "=".repeat(60));
}

/// Result of one category: the counts plus the items that did not make it.
struct CategoryResult {
    counts: CategorySummary,
    failed: Vec<String>,
}

impl CategoryResult {
    fn tally(items: &[String], succeeded: &HashSet<&str>) -> Self {
        let failed: Vec<String> = items
            .iter()
            .filter(|item| !succeeded.contains(item.as_str()))
            .cloned()
            .collect();
        Self {
            counts: CategorySummary {
                total: items.len(),
                succeeded: items.len() - failed.len(),
                failed: failed.len(),
            },
            failed,
        }
    }
}

impl Workflow {
    pub fn new(
        settings: Settings,
        options: RunOptions,
        services: Services,
        destination: Destination,
    ) -> Self {
        Self {
            settings,
            options,
            services,
            destination,
        }
    }

    #[tracing::instrument(
        name = "workflow",
        skip(self, clock),
        fields(
            run.id = %uuid::Uuid::new_v4(),
            run.report_type = ?self.options.report_type,
            run.dry_run = self.options.dry_run,
        )
    )]
    pub async fn run(&self, clock: &RunClock) -> AppResult<RunSummary> {
        banner("PowerBI PDF Generator workflow started");
        if self.options.dry_run {
            tracing::info!("Dry run mode enabled - no uploads or emails will be sent");
        }
        tracing::info!(datetime = %clock.datetime, "Current date and time");

        let report_type = self.options.report_type;

        banner("STEP 1 : Querying Fabric Lakehouse");
        let areas = if report_type.includes_areas() {
            tracing::info!("Fetching area list");
            let sql = self.settings.area_query()?;
            lakehouse::fetch_areas(self.services.lakehouse.as_ref(), sql).await?
        } else {
            Vec::new()
        };
        let employees = if report_type.includes_employees() {
            tracing::info!("Fetching employee list");
            let sql = self.settings.employee_query()?;
            lakehouse::fetch_employees(self.services.lakehouse.as_ref(), sql).await
        } else {
            Vec::new()
        };

        banner("STEP 2 : Authenticating with PowerBI");
        self.services.powerbi.authenticate().await?;

        banner("STEP 3 : Authenticating with SharePoint");
        tracing::info!("Authenticating with Microsoft Graph API for SharePoint");
        self.services.graph.access_token().await?;
        let site = self
            .services
            .graph
            .resolve_site_and_drive(
                &self.destination.site_url,
                &self.destination.site_path,
                &self.destination.drive_name,
            )
            .await?;
        let drive = DriveClient::new(self.services.graph.clone(), site.drive_id);

        let mut summary = RunSummary {
            date: clock.date.clone(),
            ..RunSummary::default()
        };

        if report_type.includes_areas() && !areas.is_empty() {
            banner("STEP 4 : Generating and uploading PDFs for areas");
            let result = self
                .publish_category(&drive, clock, Category::Areas, &areas)
                .await;
            summary.areas = result.counts;
        }

        if report_type.includes_employees() && !employees.is_empty() {
            banner("STEP 5 : Generating and uploading PDFs for employees");
            let identifiers: Vec<String> =
                employees.iter().map(|e| e.identifier.clone()).collect();
            let result = self
                .publish_category(&drive, clock, Category::Employees, &identifiers)
                .await;
            summary.employees = result.counts;
        }

        if !self.options.skip_links
            && !self.options.dry_run
            && report_type.includes_employees()
            && !employees.is_empty()
        {
            banner("STEP 6 : Generating shareable links for employee PDFs");
            self.publish_links(&drive, clock, &employees).await;
        }

        if !self.options.dry_run {
            banner("STEP 7 : Sending email notifications");
            self.notify(&summary).await;
        }

        banner("STEP 8 : Completed");
        tracing::info!("Summary");
        tracing::info!(
            "Areas: {} successful, {} failed",
            summary.areas.succeeded,
            summary.areas.failed
        );
        tracing::info!(
            "Employees: {} successful, {} failed",
            summary.employees.succeeded,
            summary.employees.failed
        );

        Ok(summary)
    }

    /// Exports, uploads and logs one category. Per-item failures are counted,
    /// never raised.
    #[tracing::instrument(
        name = "workflow.category",
        skip(self, drive, clock, items),
        fields(report.category = category.label(), report.items = items.len())
    )]
    async fn publish_category(
        &self,
        drive: &DriveClient,
        clock: &RunClock,
        category: Category,
        items: &[String],
    ) -> CategoryResult {
        let processing = &self.settings.processing;
        let options = BatchOptions {
            batch_size: self
                .options
                .batch_size
                .unwrap_or_else(|| category.batch_size(&self.settings)),
            max_retries: processing.max_retries,
            retry_delay: Duration::from_secs(processing.retry_delay_seconds),
        };

        let parameter = category.parameter(&self.settings);
        let batch = generate_pdf_batch(&self.services.powerbi, parameter, items, &options).await;

        let folder = category.folder(&self.settings);
        let layout = category.layout();

        if let Some(dir) = &self.options.output_dir {
            write_local_copies(dir, folder, layout, &batch.pdfs).await;
        }

        let result = if self.options.dry_run {
            let generated: HashSet<&str> = batch.pdfs.iter().map(|(v, _)| v.as_str()).collect();
            CategoryResult::tally(items, &generated)
        } else if batch.pdfs.is_empty() {
            CategoryResult::tally(items, &HashSet::new())
        } else {
            tracing::info!(
                files = batch.pdfs.len(),
                "Uploading {} PDFs to SharePoint",
                category.label()
            );
            let uploaded = upload_pdfs_batch(
                drive,
                &batch.pdfs,
                folder,
                layout,
                processing.upload_batch_size,
            )
            .await;
            let uploaded: HashSet<&str> = uploaded.uploaded.iter().map(String::as_str).collect();
            CategoryResult::tally(items, &uploaded)
        };

        let category_kv = KeyValue::new("report.category", category.label());
        WORKFLOW_ITEMS.record(
            result.counts.succeeded as f64,
            &[category_kv.clone(), KeyValue::new("outcome", "success")],
        );
        WORKFLOW_ITEMS.record(
            result.counts.failed as f64,
            &[category_kv, KeyValue::new("outcome", "failure")],
        );

        let log = run_log::category_log(
            category.label(),
            &clock.datetime,
            &result.counts,
            &result.failed,
        );
        if !self.options.dry_run {
            let log_name = run_log::file_name(category.label(), &clock.stamp);
            if let Err(e) = drive
                .upload_text(&self.settings.sharepoint.folders.logs, &log_name, &log)
                .await
            {
                tracing::error!(file = %log_name, error = %e, "Failed to upload run log");
            }
        }

        tracing::info!(
            succeeded = result.counts.succeeded,
            failed = result.counts.failed,
            "{} processed",
            category.label()
        );
        result
    }

    #[tracing::instrument(name = "workflow.links", skip_all)]
    async fn publish_links(
        &self,
        drive: &DriveClient,
        clock: &RunClock,
        employees: &[EmployeeRecord],
    ) {
        let outcome = generate_employee_links(
            drive,
            &self.settings.sharepoint.folders.employees,
            employees,
            self.settings.processing.link_generation_batch_size,
        )
        .await;

        let link_settings = &self.settings.link_generation;
        match links::links_csv(outcome.all()) {
            Ok(csv) => {
                tracing::info!(
                    file = %link_settings.csv_filename,
                    "Uploading CSV to SharePoint root"
                );
                if let Err(e) = drive.upload_csv("", &link_settings.csv_filename, &csv).await {
                    tracing::error!(error = %e, "Failed to upload links CSV");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to build links CSV"),
        }

        let log = links::link_generation_log(
            employees.len(),
            outcome.succeeded.len(),
            outcome.failed.len(),
            &clock.datetime,
            &outcome.failed,
        );
        let log_name = link_settings.log_filename(&clock.stamp);
        if let Err(e) = drive
            .upload_text(&self.settings.sharepoint.folders.logs, &log_name, &log)
            .await
        {
            tracing::error!(file = %log_name, error = %e, "Failed to upload link generation log");
        }
    }

    async fn notify(&self, summary: &RunSummary) {
        let email = &self.settings.email;
        let message = EmailMessage {
            sender: self.destination.sender.clone(),
            to: self.destination.recipients.clone(),
            cc: email.cc.clone(),
            subject: notify::subject(&email.report_title, &summary.date),
            html: notify::email_html(summary, &email.report_title, &email.employee_label),
        };

        match notify::send_notification(
            &self.services.graph,
            self.destination.smtp.as_ref(),
            &message,
        )
        .await
        {
            Ok(channel) => tracing::info!(%channel, "Notification email sent"),
            Err(e) => tracing::error!(error = %e, "Failed to send notification email"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Category {
    Areas,
    Employees,
}

impl Category {
    fn label(self) -> &'static str {
        match self {
            Category::Areas => "Areas",
            Category::Employees => "Employees",
        }
    }

    fn layout(self) -> UploadLayout {
        match self {
            Category::Areas => UploadLayout::Flat,
            Category::Employees => UploadLayout::PerItemFolder,
        }
    }

    fn batch_size(self, settings: &Settings) -> usize {
        match self {
            Category::Areas => settings.processing.batch_size_areas,
            Category::Employees => settings.processing.batch_size_employees,
        }
    }

    fn parameter(self, settings: &Settings) -> &str {
        match self {
            Category::Areas => &settings.powerbi.parameters.areas,
            Category::Employees => &settings.powerbi.parameters.employees,
        }
    }

    fn folder(self, settings: &Settings) -> &str {
        match self {
            Category::Areas => &settings.sharepoint.folders.areas,
            Category::Employees => &settings.sharepoint.folders.employees,
        }
    }
}

/// Mirrors the SharePoint layout under `dir`; write errors are logged only.
async fn write_local_copies(
    dir: &Path,
    folder: &str,
    layout: UploadLayout,
    pdfs: &[(String, Bytes)],
) {
    for (identifier, pdf) in pdfs {
        let (relative_folder, file_name) = layout.target(folder, identifier);
        let target_dir = dir.join(&relative_folder);
        let path = target_dir.join(&file_name);

        let written = async {
            tokio::fs::create_dir_all(&target_dir).await?;
            tokio::fs::write(&path, pdf).await
        }
        .await;

        match written {
            Ok(()) => tracing::debug!(path = %path.display(), "Wrote local PDF copy"),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to write local PDF copy")
            }
        }
    }
}
