
use futures::StreamExt;
use futures::stream;
use opentelemetry::KeyValue;
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::http::RetryPolicy;
use crate::lakehouse::EmployeeRecord;
use crate::sharepoint::{DriveClient, UploadLayout};
use crate::telemetry::metrics::SHARE_LINKS_TOTAL;

/// Upper bound on concurrent link requests; Graph throttles beyond this.
pub const MAX_LINK_CONCURRENCY: usize = 15;
const PROGRESS_EVERY: usize = 50;

pub const STATUS_SUCCESS: &str = "Success";
pub const STATUS_FAILED: &str = "Failed";
pub const LINK_THROTTLED: &str = "Throttled";
pub const LINK_NOT_FOUND: &str = "File Not Found";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkRecord {
    pub employee_id: String,
    pub employee_name: String,
    pub employee_email: String,
    pub sharepoint_link: String,
    pub status: String,
}

impl LinkRecord {
    fn new(employee: &EmployeeRecord, link: &str, status: &str) -> Self {
        Self {
            employee_id: employee.id.clone(),
            employee_name: employee.name.clone(),
            employee_email: employee.email.clone(),
            sharepoint_link: link.to_string(),
            status: status.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

#[derive(Debug, Default)]
pub struct LinkOutcome {
    pub succeeded: Vec<LinkRecord>,
    pub failed: Vec<LinkRecord>,
}

impl LinkOutcome {
    pub fn all(&self) -> impl Iterator<Item = &LinkRecord> {
        self.succeeded.iter().chain(self.failed.iter())
    }
}

fn is_throttled(err: &AppError) -> bool {
    matches!(err, AppError::Api { status: 429, .. })
}

/// Finds the employee's uploaded PDF and creates an organization view link for it.
#[tracing::instrument(
    name = "sharepoint.employee_link",
    skip(drive, employee),
    fields(employee.id = %employee.id, link.status)
)]
pub async fn generate_employee_link(
    drive: &DriveClient,
    employees_folder: &str,
    employee: &EmployeeRecord,
) -> LinkRecord {
    let (folder, file_name) =
        UploadLayout::PerItemFolder.target(employees_folder, &employee.identifier);
    let path = format!("{folder}/{file_name}");
    let policy = RetryPolicy::throttled();

    let record = match drive.get_item(&path, &policy).await {
        Err(e) if is_throttled(&e) => {
            tracing::error!(employee = %employee.name, "Max retries exceeded due to throttling");
            LinkRecord::new(employee, LINK_THROTTLED, STATUS_FAILED)
        }
        Err(e) => {
            tracing::warn!(
                employee = %employee.name,
                path = %path,
                error = %e,
                "File not found"
            );
            LinkRecord::new(employee, LINK_NOT_FOUND, STATUS_FAILED)
        }
        Ok(item) => match drive.create_view_link(&item.id, &policy).await {
            Ok(url) => {
                tracing::info!(employee = %employee.name, "Generated SharePoint link");
                LinkRecord::new(employee, &url, STATUS_SUCCESS)
            }
            Err(e) if is_throttled(&e) => {
                tracing::error!(
                    employee = %employee.name,
                    "Max retries exceeded due to throttling"
                );
                LinkRecord::new(employee, LINK_THROTTLED, STATUS_FAILED)
            }
            Err(e) => {
                tracing::error!(
                    employee = %employee.name,
                    error = %e,
                    "Failed to generate SharePoint link"
                );
                LinkRecord::new(employee, STATUS_FAILED, STATUS_FAILED)
            }
        },
    };

    tracing::Span::current().record("link.status", record.sharepoint_link.as_str());
    let outcome = if record.is_success() { "success" } else { "failure" };
    SHARE_LINKS_TOTAL.add(1, &[KeyValue::new("outcome", outcome)]);
    record
}

#[tracing::instrument(
    name = "sharepoint.employee_links",
    skip(drive, employees),
    fields(links.total = employees.len(), links.failed)
)]
pub async fn generate_employee_links(
    drive: &DriveClient,
    employees_folder: &str,
    employees: &[EmployeeRecord],
    batch_size: usize,
) -> LinkOutcome {
    let concurrency = batch_size.clamp(1, MAX_LINK_CONCURRENCY);
    tracing::info!(
        employees = employees.len(),
        batch_size = concurrency,
        "Generating shareable links"
    );

    let mut results = stream::iter(employees)
        .map(|employee| generate_employee_link(drive, employees_folder, employee))
        .buffer_unordered(concurrency);

    let mut outcome = LinkOutcome::default();
    let mut completed = 0;
    while let Some(record) = results.next().await {
        completed += 1;
        if record.is_success() {
            outcome.succeeded.push(record);
        } else {
            outcome.failed.push(record);
        }
        if completed % PROGRESS_EVERY == 0 {
            tracing::info!("Progress: {completed}/{} links processed", employees.len());
        }
    }

    tracing::Span::current().record("links.failed", outcome.failed.len());
    tracing::info!(
        employees = employees.len(),
        failed = outcome.failed.len(),
        "Link generation completed"
    );
    outcome
}

/// CSV with a header row followed by one row per record.
pub fn links_csv<'a>(records: impl IntoIterator<Item = &'a LinkRecord>) -> AppResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut rows = 0;
    for record in records {
        writer.serialize(record)?;
        rows += 1;
    }
    if rows == 0 {
        writer.write_record([
            "employee_id",
            "employee_name",
            "employee_email",
            "sharepoint_link",
            "status",
        ])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| AppError::Io(e.into_error()))?;
    tracing::info!(records = rows, "Created CSV");
    String::from_utf8(bytes).map_err(|e| AppError::Config(format!("CSV is not UTF-8: {e}")))
}

pub fn link_generation_log(
    total: usize,
    succeeded: usize,
    failed: usize,
    process_datetime: &str,
    failed_records: &[LinkRecord],
) -> String {
    let rule = "-".repeat(24);
    let mut log = format!(
        "{rule}\nLink Generation Log\n{rule}\n\
         Total Count: {total}\n\
         Success Count: {succeeded}\n\
         Failed Count: {failed}\n\
         Process DateTime: {process_datetime}\n\
         {rule}\n"
    );

    if !failed_records.is_empty() {
        log.push_str("Failed Records:\n");
        for record in failed_records {
            log.push_str(&format!(
                " - {} (ID:{}): {}\n",
                record.employee_name, record.employee_id, record.sharepoint_link
            ));
        }
    }
    log
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::GRAPH_SCOPE;
    use crate::sharepoint::GraphClient;
    use crate::test_support::{MockResponse, MockServer, token_provider, token_response};
    use serde_json::json;

    fn employee(id: &str, name: &str, identifier: &str) -> EmployeeRecord {
        EmployeeRecord {
            id: id.into(),
            name: name.into(),
            email: format!("{identifier}@example.com"),
            identifier: identifier.into(),
        }
    }

    fn drive(server: &MockServer) -> DriveClient {
        DriveClient::new(
            GraphClient::new(
                reqwest::Client::new(),
                token_provider(server, GRAPH_SCOPE),
                &server.base_url(),
            ),
            "d1",
        )
    }

    fn link_server_responder(req: &crate::test_support::RecordedRequest) -> MockResponse {
        if req.is_token_request() {
            return token_response();
        }
        match (req.method.as_str(), req.path.as_str()) {
            ("GET", "/drives/d1/root:/Employees/report_jdoe/report_jdoe.pdf") => {
                MockResponse::json(200, json!({"id": "item-1"}))
            }
            ("GET", "/drives/d1/root:/Employees/report_asmith/report_asmith.pdf") => {
                MockResponse::json(200, json!({"id": "item-2"}))
            }
            ("POST", "/drives/d1/items/item-1/createLink") => {
                MockResponse::json(200, json!({"link": {"webUrl": "https://contoso/s/jdoe"}}))
            }
            ("POST", "/drives/d1/items/item-2/createLink") => MockResponse::json(
                429,
                json!({"error": {"code": "activityLimitReached"}}),
            )
            .with_header("Retry-After", "0"),
            _ => MockResponse::json(404, json!({"error": {"code": "itemNotFound"}})),
        }
    }

    #[tokio::test]
    async fn test_link_outcomes() {
        let server = MockServer::start(link_server_responder).await;
        let drive = drive(&server);

        let ok = generate_employee_link(&drive, "Employees", &employee("1", "John Doe", "jdoe")).await;
        assert_eq!(ok.sharepoint_link, "https://contoso/s/jdoe");
        assert_eq!(ok.status, STATUS_SUCCESS);
        assert_eq!(ok.employee_name, "John Doe");

        let missing = generate_employee_link(&drive, "Employees", &employee("2", "Nobody", "nobody")).await;
        assert_eq!(missing.sharepoint_link, LINK_NOT_FOUND);
        assert_eq!(missing.status, STATUS_FAILED);

        let throttled =
            generate_employee_link(&drive, "Employees", &employee("3", "Ann Smith", "asmith")).await;
        assert_eq!(throttled.sharepoint_link, LINK_THROTTLED);
        assert_eq!(throttled.status, STATUS_FAILED);
        assert_eq!(
            server.count("POST", "/drives/d1/items/item-2/createLink"),
            RetryPolicy::throttled().max_attempts as usize
        );
    }

    #[tokio::test]
    async fn test_generate_links_splits_records() {
        let server = MockServer::start(link_server_responder).await;
        let employees = vec![
            employee("1", "John Doe", "jdoe"),
            employee("2", "Nobody", "nobody"),
        ];

        let outcome = generate_employee_links(&drive(&server), "Employees", &employees, 50).await;
        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].employee_id, "2");
        assert_eq!(outcome.all().count(), 2);
    }

    #[test]
    fn test_links_csv() {
        let records = vec![
            LinkRecord {
                employee_id: "1".into(),
                employee_name: "Doe, John".into(),
                employee_email: "john@example.com".into(),
                sharepoint_link: "https://contoso/s/jdoe".into(),
                status: STATUS_SUCCESS.into(),
            },
            LinkRecord {
                employee_id: "2".into(),
                employee_name: "Nobody".into(),
                employee_email: String::new(),
                sharepoint_link: LINK_NOT_FOUND.into(),
                status: STATUS_FAILED.into(),
            },
        ];

        let csv = links_csv(&records).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines,
            vec![
                "employee_id,employee_name,employee_email,sharepoint_link,status",
                "1,\"Doe, John\",john@example.com,https://contoso/s/jdoe,Success",
                "2,Nobody,,File Not Found,Failed",
            ]
        );
    }

    #[test]
    fn test_links_csv_empty_has_header() {
        let csv = links_csv(std::iter::empty()).unwrap();
        assert_eq!(
            csv.trim_end(),
            "employee_id,employee_name,employee_email,sharepoint_link,status"
        );
    }

    #[test]
    fn test_link_generation_log() {
        let failed = vec![LinkRecord {
            employee_id: "2".into(),
            employee_name: "Nobody".into(),
            employee_email: String::new(),
            sharepoint_link: LINK_NOT_FOUND.into(),
            status: STATUS_FAILED.into(),
        }];

        let log = link_generation_log(2, 1, 1, "01-02-2025 08:00:00", &failed);
        assert!(log.starts_with("------------------------\nLink Generation Log\n"));
        assert!(log.contains("Total Count: 2\nSuccess Count: 1\nFailed Count: 1\n"));
        assert!(log.contains("Process DateTime: 01-02-2025 08:00:00\n"));
        assert!(log.ends_with("Failed Records:\n - Nobody (ID:2): File Not Found\n"));

        let clean = link_generation_log(1, 1, 0, "01-02-2025 08:00:00", &[]);
        assert!(!clean.contains("Failed Records"));
    }
}
