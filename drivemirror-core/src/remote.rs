use async_trait::async_trait;

use crate::client::{ChildrenPage, DeltaPage, DriveError, DriveItem};

/// Where a delta crawl request starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlFrom<'a> {
    /// Fresh pass anchored at the given root item id.
    Root(&'a str),
    /// Continuation link returned by an earlier page (next-page or completion link).
    Link(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictBehavior {
    Fail,
    Rename,
}

impl ConflictBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictBehavior::Fail => "fail",
            ConflictBehavior::Rename => "rename",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildrenQuery {
    pub filter: Option<String>,
    pub fields: Vec<String>,
    pub page_size: u32,
}

impl ChildrenQuery {
    pub fn new(page_size: u32) -> Self {
        Self {
            filter: None,
            fields: Vec::new(),
            page_size,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|field| field.to_string()).collect();
        self
    }

    /// Exact-name filter, with single quotes escaped the OData way.
    pub fn named(page_size: u32, name: &str) -> Self {
        Self::new(page_size).with_filter(format!("name eq '{}'", name.replace('\'', "''")))
    }
}

/// The operations the engines need from the remote tree service.
#[async_trait]
pub trait RemoteDrive: Send + Sync {
    async fn get_root(&self) -> Result<DriveItem, DriveError>;

    async fn crawl(&self, from: CrawlFrom<'_>) -> Result<DeltaPage, DriveError>;

    async fn list_children(
        &self,
        folder_id: &str,
        query: &ChildrenQuery,
    ) -> Result<ChildrenPage, DriveError>;

    async fn list_children_next(&self, next_link: &str) -> Result<ChildrenPage, DriveError>;

    async fn move_item(
        &self,
        item_id: &str,
        new_parent_id: &str,
        new_name: Option<&str>,
    ) -> Result<DriveItem, DriveError>;

    async fn delete_item(&self, item_id: &str) -> Result<(), DriveError>;

    async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
        on_conflict: ConflictBehavior,
    ) -> Result<DriveItem, DriveError>;
}

/// Follows `next_link` until the listing is exhausted.
pub async fn list_all_children(
    drive: &dyn RemoteDrive,
    folder_id: &str,
    query: &ChildrenQuery,
) -> Result<Vec<DriveItem>, DriveError> {
    let mut page = drive.list_children(folder_id, query).await?;
    let mut items = std::mem::take(&mut page.value);
    while let Some(next) = page.next_link.take() {
        page = drive.list_children_next(&next).await?;
        items.append(&mut page.value);
    }
    Ok(items)
}
