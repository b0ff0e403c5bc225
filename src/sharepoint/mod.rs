pub mod upload;

use std::sync::Arc;

use bytes::Bytes;
use opentelemetry::KeyValue;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;

use crate::auth::TokenProvider;
use crate::error::{AppError, AppResult};
use crate::http::{RetryPolicy, send_with_retry};
use crate::telemetry::metrics::{UPLOAD_BYTES, UPLOADS_TOTAL};

pub use upload::{UploadLayout, UploadOutcome, upload_pdfs_batch};

/// Microsoft Graph client shared by the SharePoint and mail code paths.
#[derive(Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    tokens: Arc<TokenProvider>,
    base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteDrive {
    pub site_id: String,
    pub drive_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriveItem {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "webUrl", default)]
    pub web_url: Option<String>,
}

#[derive(Deserialize)]
struct Site {
    id: String,
}

#[derive(Deserialize)]
struct DriveList {
    #[serde(default)]
    value: Vec<DriveEntry>,
}

#[derive(Deserialize)]
struct DriveEntry {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct SharingLink {
    link: LinkBody,
}

#[derive(Deserialize)]
struct LinkBody {
    #[serde(rename = "webUrl")]
    web_url: String,
}

impl GraphClient {
    pub fn new(http: reqwest::Client, tokens: TokenProvider, base_url: &str) -> Self {
        Self {
            http,
            tokens: Arc::new(tokens),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub async fn access_token(&self) -> AppResult<String> {
        self.tokens.access_token().await
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Graph URL with `segments` appended, each one percent-encoded.
    pub fn url<I, S>(&self, segments: I) -> AppResult<Url>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| {
                AppError::Config(format!("invalid Graph endpoint {}: {e}", self.base_url))
            })?;
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("invalid Graph endpoint {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    #[tracing::instrument(
        name = "sharepoint.resolve_site",
        skip(self),
        fields(sharepoint.site_id, sharepoint.drive_id)
    )]
    pub async fn resolve_site_and_drive(
        &self,
        site_url: &str,
        site_path: &str,
        drive_name: &str,
    ) -> AppResult<SiteDrive> {
        let host = site_host(site_url);
        let path = relative_site_path(site_path);
        tracing::info!(host = %host, path = %path, "Getting site ID");

        let token = self.access_token().await?;
        let host_segment = format!("{host}:");
        let url = self.url(
            ["sites", host_segment.as_str(), "sites"]
                .into_iter()
                .chain(path.split('/')),
        )?;
        let response =
            send_with_retry(self.http.get(url).bearer_auth(&token), &RetryPolicy::default()).await?;
        if response.status() != StatusCode::OK {
            return Err(AppError::SharePoint(format!(
                "failed to get site ID: {}",
                describe(response).await
            )));
        }
        let site: Site = response.json().await?;
        tracing::info!(site_id = %site.id, "Obtained site ID");

        let url = self.url(["sites", site.id.as_str(), "drives"])?;
        let response =
            send_with_retry(self.http.get(url).bearer_auth(&token), &RetryPolicy::default()).await?;
        if response.status() != StatusCode::OK {
            return Err(AppError::SharePoint(format!(
                "failed to list drives: {}",
                describe(response).await
            )));
        }
        let drives: DriveList = response.json().await?;

        let Some(drive) = drives.value.iter().find(|d| d.name == drive_name) else {
            let available: Vec<&str> = drives.value.iter().map(|d| d.name.as_str()).collect();
            return Err(AppError::SharePoint(format!(
                "drive {drive_name} not found. Available drives: [{}]",
                available.join(", ")
            )));
        };

        let span = tracing::Span::current();
        span.record("sharepoint.site_id", site.id.as_str());
        span.record("sharepoint.drive_id", drive.id.as_str());
        tracing::info!(drive_id = %drive.id, "Obtained drive ID");

        Ok(SiteDrive {
            site_id: site.id,
            drive_id: drive.id.clone(),
        })
    }
}

/// One document library addressed by path.
#[derive(Clone)]
pub struct DriveClient {
    graph: GraphClient,
    drive_id: String,
}

impl DriveClient {
    pub fn new(graph: GraphClient, drive_id: impl Into<String>) -> Self {
        Self {
            graph,
            drive_id: drive_id.into(),
        }
    }

    pub fn drive_id(&self) -> &str {
        &self.drive_id
    }

    /// `/drives/{id}/root:/{path}` with an optional `:/{action}` suffix;
    /// an empty path addresses the drive root itself.
    fn item_url(&self, path: &[&str], action: Option<&str>) -> AppResult<Url> {
        let mut segments = vec!["drives".to_string(), self.drive_id.clone()];
        match path.split_last() {
            None => {
                segments.push("root".to_string());
                segments.extend(action.map(str::to_string));
            }
            Some((last, parents)) => {
                segments.push("root:".to_string());
                segments.extend(parents.iter().map(|s| s.to_string()));
                match action {
                    Some(action) => {
                        segments.push(format!("{last}:"));
                        segments.push(action.to_string());
                    }
                    None => segments.push(last.to_string()),
                }
            }
        }
        self.graph.url(segments)
    }

    async fn get_path(&self, path: &[&str], policy: &RetryPolicy) -> AppResult<Response> {
        let token = self.graph.access_token().await?;
        let url = self.item_url(path, None)?;
        send_with_retry(self.graph.http.get(url).bearer_auth(&token), policy).await
    }

    /// Creates each missing level of `folder_path`; existing levels are left alone.
    #[tracing::instrument(name = "sharepoint.ensure_folder", skip(self))]
    pub async fn ensure_folder(&self, folder_path: &str) -> AppResult<()> {
        let segments = split_path(folder_path);
        if segments.is_empty() {
            return Ok(());
        }

        let response = self.get_path(&segments, &RetryPolicy::default()).await?;
        if response.status() == StatusCode::OK {
            tracing::debug!(folder = %folder_path, "Folder already exists");
            return Ok(());
        }

        tracing::info!(folder = %folder_path, "Creating folder");
        for depth in 1..=segments.len() {
            let current = &segments[..depth];
            let response = self.get_path(current, &RetryPolicy::default()).await?;
            match response.status() {
                StatusCode::OK => continue,
                StatusCode::NOT_FOUND => self.create_folder(current).await?,
                _ => {
                    return Err(AppError::SharePoint(format!(
                        "failed to check folder {}: {}",
                        current.join("/"),
                        describe(response).await
                    )));
                }
            }
        }

        tracing::info!(folder = %folder_path, "Folder created");
        Ok(())
    }

    async fn create_folder(&self, path: &[&str]) -> AppResult<()> {
        let Some((name, parent)) = path.split_last() else {
            return Ok(());
        };
        let token = self.graph.access_token().await?;
        let url = self.item_url(parent, Some("children"))?;
        let body = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });

        let response = send_with_retry(
            self.graph.http.post(url).bearer_auth(&token).json(&body),
            &RetryPolicy::default(),
        )
        .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                tracing::debug!(folder = %path.join("/"), "Created folder level");
                Ok(())
            }
            // created concurrently by another upload
            StatusCode::CONFLICT => Ok(()),
            _ => Err(AppError::SharePoint(format!(
                "failed to create folder {name}: {}",
                describe(response).await
            ))),
        }
    }

    /// `PUT` of a whole file; the folder must already exist.
    #[tracing::instrument(
        name = "sharepoint.upload",
        skip(self, content, policy),
        fields(file.size = content.len())
    )]
    pub async fn upload_bytes(
        &self,
        folder_path: &str,
        file_name: &str,
        content: Bytes,
        content_type: &str,
        policy: &RetryPolicy,
    ) -> AppResult<()> {
        let mut path = split_path(folder_path);
        path.push(file_name);
        let url = self.item_url(&path, Some("content"))?;
        let size = content.len() as u64;

        let token = self.graph.access_token().await?;
        let request = self
            .graph
            .http
            .put(url)
            .bearer_auth(&token)
            .header(CONTENT_TYPE, content_type)
            .body(content);
        let response = send_with_retry(request, policy).await?;

        let type_kv = KeyValue::new("content_type", content_type.to_string());
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                UPLOADS_TOTAL.add(1, &[type_kv.clone(), KeyValue::new("outcome", "success")]);
                UPLOAD_BYTES.add(size, &[type_kv]);
                tracing::info!(file = %file_name, "Uploaded file");
                Ok(())
            }
            _ => {
                UPLOADS_TOTAL.add(1, &[type_kv, KeyValue::new("outcome", "failure")]);
                let err = AppError::from_response(response).await;
                tracing::error!(file = %file_name, error = %err, "Failed to upload file");
                Err(err)
            }
        }
    }

    /// Uploads a UTF-8 text file, adding `.txt` when missing.
    pub async fn upload_text(
        &self,
        folder_path: &str,
        file_name: &str,
        text: &str,
    ) -> AppResult<()> {
        let file_name = with_extension(file_name, ".txt");
        self.ensure_folder(folder_path).await?;
        self.upload_bytes(
            folder_path,
            &file_name,
            Bytes::copy_from_slice(text.as_bytes()),
            "text/plain",
            &RetryPolicy::uploads(),
        )
        .await
    }

    /// Uploads CSV text, adding `.csv` when missing.
    pub async fn upload_csv(
        &self,
        folder_path: &str,
        file_name: &str,
        text: &str,
    ) -> AppResult<()> {
        let file_name = with_extension(file_name, ".csv");
        self.ensure_folder(folder_path).await?;
        self.upload_bytes(
            folder_path,
            &file_name,
            Bytes::copy_from_slice(text.as_bytes()),
            "text/csv",
            &RetryPolicy::uploads(),
        )
        .await
    }

    /// Looks up an item by path. Non-200 responses become [`AppError::Api`].
    pub async fn get_item(&self, path: &str, policy: &RetryPolicy) -> AppResult<DriveItem> {
        let response = self.get_path(&split_path(path), policy).await?;
        if response.status() != StatusCode::OK {
            return Err(AppError::from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// Organization-scoped view link for an item.
    pub async fn create_view_link(&self, item_id: &str, policy: &RetryPolicy) -> AppResult<String> {
        let token = self.graph.access_token().await?;
        let url = self
            .graph
            .url(["drives", self.drive_id.as_str(), "items", item_id, "createLink"])?;
        let body = json!({"type": "view", "scope": "organization"});

        let response = send_with_retry(
            self.graph.http.post(url).bearer_auth(&token).json(&body),
            policy,
        )
        .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let link: SharingLink = response.json().await?;
                Ok(link.link.web_url)
            }
            _ => Err(AppError::from_response(response).await),
        }
    }
}

/// Host part of a site URL, without scheme or path.
fn site_host(site_url: &str) -> &str {
    let trimmed = site_url.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme.split('/').next().unwrap_or_default()
}

/// Site path relative to `/sites/`, accepting values with or without that prefix.
fn relative_site_path(site_path: &str) -> &str {
    let trimmed = site_path.trim().trim_matches('/');
    trimmed.strip_prefix("sites/").unwrap_or(trimmed)
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn with_extension(file_name: &str, extension: &str) -> String {
    if file_name.to_lowercase().ends_with(extension) {
        file_name.to_string()
    } else {
        format!("{file_name}{extension}")
    }
}

async fn describe(response: Response) -> String {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    format!("{status} - {body}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::GRAPH_SCOPE;
    use crate::test_support::{MockResponse, MockServer, token_provider, token_response};
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn graph(server: &MockServer) -> GraphClient {
        GraphClient::new(
            reqwest::Client::new(),
            token_provider(server, GRAPH_SCOPE),
            &server.base_url(),
        )
    }

    fn drive(server: &MockServer) -> DriveClient {
        DriveClient::new(graph(server), "d1")
    }

    #[test]
    fn test_site_host_and_path() {
        assert_eq!(site_host("https://contoso.sharepoint.com/sites/Ops"), "contoso.sharepoint.com");
        assert_eq!(site_host("contoso.sharepoint.com"), "contoso.sharepoint.com");
        assert_eq!(relative_site_path("/sites/Ops/"), "Ops");
        assert_eq!(relative_site_path(" Ops "), "Ops");
        assert_eq!(relative_site_path("Team/Sub"), "Team/Sub");
    }

    #[test]
    fn test_with_extension() {
        assert_eq!(with_extension("Logs_Areas_1", ".txt"), "Logs_Areas_1.txt");
        assert_eq!(with_extension("links.CSV", ".csv"), "links.CSV");
    }

    #[test]
    fn test_item_urls() {
        let drive = DriveClient::new(
            GraphClient::new(
                reqwest::Client::new(),
                TokenProvider::new(
                    reqwest::Client::new(),
                    "http://login.invalid",
                    &crate::test_support::principal(),
                    GRAPH_SCOPE,
                ),
                "https://graph.microsoft.com/v1.0",
            ),
            "d1",
        );

        let url = drive
            .item_url(&["Employees", "report_Jane Doe", "report_Jane Doe.pdf"], Some("content"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://graph.microsoft.com/v1.0/drives/d1/root:/Employees/report_Jane%20Doe/report_Jane%20Doe.pdf:/content"
        );

        let url = drive.item_url(&["Logs"], None).unwrap();
        assert_eq!(url.as_str(), "https://graph.microsoft.com/v1.0/drives/d1/root:/Logs");

        let url = drive.item_url(&[], Some("children")).unwrap();
        assert_eq!(url.as_str(), "https://graph.microsoft.com/v1.0/drives/d1/root/children");

        let url = drive.item_url(&["links.csv"], Some("content")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://graph.microsoft.com/v1.0/drives/d1/root:/links.csv:/content"
        );
    }

    #[tokio::test]
    async fn test_resolve_site_and_drive() {
        let server = MockServer::start(|req| {
            if req.is_token_request() {
                return token_response();
            }
            match req.path.as_str() {
                "/sites/contoso.sharepoint.com:/sites/Ops" => {
                    MockResponse::json(200, json!({"id": "site-1"}))
                }
                "/sites/site-1/drives" => MockResponse::json(
                    200,
                    json!({"value": [
                        {"id": "d0", "name": "Documents"},
                        {"id": "d1", "name": "Reports"}
                    ]}),
                ),
                _ => MockResponse::status(404),
            }
        })
        .await;

        let resolved = graph(&server)
            .resolve_site_and_drive("https://contoso.sharepoint.com/", "/sites/Ops", "Reports")
            .await
            .unwrap();
        assert_eq!(
            resolved,
            SiteDrive {
                site_id: "site-1".into(),
                drive_id: "d1".into()
            }
        );

        let err = graph(&server)
            .resolve_site_and_drive("https://contoso.sharepoint.com", "Ops", "Missing")
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Documents"));
        assert!(message.contains("Reports"));
    }

    #[tokio::test]
    async fn test_unknown_site_is_an_error() {
        let server = MockServer::start(|req| {
            if req.is_token_request() {
                return token_response();
            }
            MockResponse::json(404, json!({"error": {"code": "itemNotFound"}}))
        })
        .await;

        let err = graph(&server)
            .resolve_site_and_drive("https://contoso.sharepoint.com", "Nope", "Reports")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SharePoint(_)));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_ensure_folder_creates_only_missing_levels() {
        let existing = Mutex::new(HashSet::from(["/drives/d1/root:/Employees".to_string()]));
        let server = MockServer::start(move |req| {
            if req.is_token_request() {
                return token_response();
            }
            let mut existing = existing.lock().unwrap();
            match req.method.as_str() {
                "GET" if existing.contains(&req.path) => MockResponse::json(200, json!({"id": "x"})),
                "GET" => MockResponse::status(404),
                "POST" => {
                    let parent = req.path.trim_end_matches(":/children");
                    let name = req.json()["name"].as_str().unwrap_or_default().to_string();
                    existing.insert(format!("{parent}/{name}"));
                    MockResponse::json(201, json!({"id": "new"}))
                }
                _ => MockResponse::status(400),
            }
        })
        .await;

        drive(&server)
            .ensure_folder("/Employees/report_jdoe/")
            .await
            .unwrap();

        let creates: Vec<_> = server
            .requests()
            .into_iter()
            .filter(|r| r.method == "POST" && !r.is_token_request())
            .collect();
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].path, "/drives/d1/root:/Employees:/children");
        assert_eq!(
            creates[0].json(),
            json!({
                "name": "report_jdoe",
                "folder": {},
                "@microsoft.graph.conflictBehavior": "fail"
            })
        );
    }

    #[tokio::test]
    async fn test_ensure_folder_at_root_and_conflict() {
        let server = MockServer::start(|req| {
            if req.is_token_request() {
                return token_response();
            }
            match req.method.as_str() {
                "GET" => MockResponse::status(404),
                "POST" => MockResponse::json(409, json!({"error": {"code": "nameAlreadyExists"}})),
                _ => MockResponse::status(400),
            }
        })
        .await;

        drive(&server).ensure_folder("Logs").await.unwrap();
        assert_eq!(server.count("POST", "/drives/d1/root/children"), 1);
    }

    #[tokio::test]
    async fn test_ensure_folder_empty_path_is_noop() {
        let server = MockServer::start(|_| MockResponse::status(500)).await;
        drive(&server).ensure_folder(" / ").await.unwrap();
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_upload_text_appends_extension() {
        let server = MockServer::start(|req| {
            if req.is_token_request() {
                return token_response();
            }
            match req.method.as_str() {
                "GET" => MockResponse::json(200, json!({"id": "logs"})),
                "PUT" => MockResponse::json(201, json!({"id": "file"})),
                _ => MockResponse::status(400),
            }
        })
        .await;

        drive(&server)
            .upload_text("Logs", "Logs_Areas_20250101_080000", "Areas PDFs generated log")
            .await
            .unwrap();

        let put = server
            .requests()
            .into_iter()
            .find(|r| r.method == "PUT")
            .unwrap();
        assert_eq!(put.path, "/drives/d1/root:/Logs/Logs_Areas_20250101_080000.txt:/content");
        assert_eq!(put.content_type.as_deref(), Some("text/plain"));
        assert_eq!(put.body_text(), "Areas PDFs generated log");
    }

    #[tokio::test]
    async fn test_upload_failure_is_reported() {
        let server = MockServer::start(|req| {
            if req.is_token_request() {
                return token_response();
            }
            MockResponse::json(403, json!({"error": {"code": "accessDenied"}}))
        })
        .await;

        let err = drive(&server)
            .upload_bytes(
                "",
                "a.pdf",
                Bytes::from_static(b"%PDF"),
                "application/pdf",
                &RetryPolicy::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Api { status: 403, .. }));
        assert_eq!(server.count("PUT", "/drives/d1/root:/a.pdf:/content"), 1);
    }

    #[tokio::test]
    async fn test_create_view_link() {
        let server = MockServer::start(|req| {
            if req.is_token_request() {
                return token_response();
            }
            match (req.method.as_str(), req.path.as_str()) {
                ("GET", "/drives/d1/root:/Employees/report_jdoe/report_jdoe.pdf") => {
                    MockResponse::json(200, json!({"id": "item-9", "name": "report_jdoe.pdf"}))
                }
                ("POST", "/drives/d1/items/item-9/createLink") => MockResponse::json(
                    201,
                    json!({"link": {"type": "view", "webUrl": "https://contoso/s/abc"}}),
                ),
                _ => MockResponse::status(404),
            }
        })
        .await;

        let drive = drive(&server);
        let item = drive
            .get_item("Employees/report_jdoe/report_jdoe.pdf", &RetryPolicy::none())
            .await
            .unwrap();
        assert_eq!(item.id, "item-9");

        let link = drive
            .create_view_link(&item.id, &RetryPolicy::none())
            .await
            .unwrap();
        assert_eq!(link, "https://contoso/s/abc");

        let post = server
            .requests()
            .into_iter()
            .find(|r| r.is("POST", "/drives/d1/items/item-9/createLink"))
            .unwrap();
        assert_eq!(post.json(), json!({"type": "view", "scope": "organization"}));
    }
}
