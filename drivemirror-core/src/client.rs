use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use url::Url;

use crate::remote::{ChildrenQuery, ConflictBehavior, CrawlFrom, RemoteDrive};

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com";
const API_VERSION: &str = "v1.0";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry a path: {0}")]
    InvalidBaseUrl(String),
    #[error("name conflict: {body}")]
    Conflict { body: String },
    #[error("continuation link expired or rejected: {body}")]
    CursorExpired { body: String },
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

// Without a drive id every request targets `/me/drive`.
#[derive(Clone)]
pub struct GraphClient {
    http: Client,
    base_url: Url,
    drive_id: Option<String>,
    token: String,
}

impl fmt::Debug for GraphClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphClient")
            .field("base_url", &self.base_url.as_str())
            .field("drive_id", &self.drive_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl GraphClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(DriveError::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            drive_id: None,
            token: token.into(),
        })
    }

    pub fn with_drive_id(mut self, drive_id: impl Into<String>) -> Self {
        self.drive_id = Some(drive_id.into());
        self
    }

    pub fn drive_id(&self) -> Option<&str> {
        self.drive_id.as_deref()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, DriveError> {
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("Authorization", format!("Bearer {}", self.token))
    }

    fn drive_endpoint(&self, segments: &[&str]) -> Result<Url, DriveError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| DriveError::InvalidBaseUrl(self.base_url.to_string()))?;
            path.pop_if_empty().push(API_VERSION);
            match &self.drive_id {
                Some(drive_id) => {
                    path.push("drives").push(drive_id);
                }
                None => {
                    path.push("me").push("drive");
                }
            }
            path.extend(segments);
        }
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::error_from_response(response).await)
        }
    }

    async fn error_from_response(response: reqwest::Response) -> DriveError {
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::CONFLICT => DriveError::Conflict { body },
            StatusCode::GONE => DriveError::CursorExpired { body },
            _ => DriveError::Api {
                status,
                body,
                retry_after,
            },
        }
    }
}

#[async_trait]
impl RemoteDrive for GraphClient {
    async fn get_root(&self) -> Result<DriveItem, DriveError> {
        let url = self.drive_endpoint(&["root"])?;
        self.get_json(url).await
    }

    async fn crawl(&self, from: CrawlFrom<'_>) -> Result<DeltaPage, DriveError> {
        let url = match from {
            CrawlFrom::Root(root_id) => self.drive_endpoint(&["items", root_id, "delta"])?,
            CrawlFrom::Link(link) => Url::parse(link)?,
        };
        self.get_json(url).await
    }

    async fn list_children(
        &self,
        folder_id: &str,
        query: &ChildrenQuery,
    ) -> Result<ChildrenPage, DriveError> {
        let mut url = self.drive_endpoint(&["items", folder_id, "children"])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("$top", &query.page_size.max(1).to_string());
            if let Some(filter) = query.filter.as_deref() {
                pairs.append_pair("$filter", filter);
            }
            if !query.fields.is_empty() {
                pairs.append_pair("$select", &query.fields.join(","));
            }
        }
        self.get_json(url).await
    }

    async fn list_children_next(&self, next_link: &str) -> Result<ChildrenPage, DriveError> {
        self.get_json(Url::parse(next_link)?).await
    }

    async fn move_item(
        &self,
        item_id: &str,
        new_parent_id: &str,
        new_name: Option<&str>,
    ) -> Result<DriveItem, DriveError> {
        let url = self.drive_endpoint(&["items", item_id])?;
        let mut body = json!({ "parentReference": { "id": new_parent_id } });
        if let Some(name) = new_name {
            body["name"] = json!(name);
        }
        let response = self
            .authorized(self.http.patch(url))
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn delete_item(&self, item_id: &str) -> Result<(), DriveError> {
        let url = self.drive_endpoint(&["items", item_id])?;
        let response = self.authorized(self.http.delete(url)).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::error_from_response(response).await)
    }

    async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
        on_conflict: ConflictBehavior,
    ) -> Result<DriveItem, DriveError> {
        let url = self.drive_endpoint(&["items", parent_id, "children"])?;
        let body = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": on_conflict.as_str(),
        });
        let response = self
            .authorized(self.http.post(url))
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, .. } => Some(classify_api_status(*status)),
            DriveError::Conflict { .. } | DriveError::CursorExpired { .. } => {
                Some(ApiErrorClass::Permanent)
            }
            DriveError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DriveError::Conflict { .. })
    }

    pub fn is_cursor_expired(&self) -> bool {
        matches!(self, DriveError::CursorExpired { .. })
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            DriveError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .map(|d| d.as_secs())
            .unwrap_or(0),
    )
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_reference: Option<ItemReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileFacet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<FolderFacet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<PhotoFacet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DeletedFacet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<RootFacet>,
}

impl DriveItem {
    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    /// The drive root reports a `root` facet and is treated as a folder.
    pub fn is_folder(&self) -> bool {
        self.folder.is_some() || self.root.is_some()
    }

    pub fn is_file(&self) -> bool {
        self.file.is_some() && !self.is_folder()
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_reference
            .as_ref()
            .and_then(|parent| parent.id.as_deref())
    }

    /// First available digest in `quickXorHash`, `sha1Hash`, `sha256Hash` order.
    pub fn content_hash(&self) -> Option<&str> {
        if self.is_folder() {
            return None;
        }
        let hashes = self.file.as_ref()?.hashes.as_ref()?;
        hashes
            .quick_xor_hash
            .as_deref()
            .or(hashes.sha1_hash.as_deref())
            .or(hashes.sha256_hash.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ItemReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileFacet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<Hashes>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Hashes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quick_xor_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PhotoFacet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taken_date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeletedFacet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RootFacet {}

// Exactly one of `next_link` / `delta_link` is expected per page.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct DeltaPage {
    #[serde(default)]
    pub value: Vec<DriveItem>,
    #[serde(
        rename = "@odata.nextLink",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub next_link: Option<String>,
    #[serde(
        rename = "@odata.deltaLink",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub delta_link: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ChildrenPage {
    #[serde(default)]
    pub value: Vec<DriveItem>,
    #[serde(
        rename = "@odata.nextLink",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub next_link: Option<String>,
}
