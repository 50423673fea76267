use std::sync::Arc;

use drivemirror_core::{ChildrenQuery, DriveError, DriveItem, RemoteDrive, list_all_children};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dates::{DateSource, Placement, resolve_date};
use super::folders::FolderResolver;
use crate::context::DriveContext;

pub const DEFAULT_PAGE_SIZE: u32 = 200;

const LISTING_FIELDS: &[&str] = &[
    "id",
    "name",
    "file",
    "folder",
    "photo",
    "createdDateTime",
    "parentReference",
];

#[derive(Debug, Error)]
pub enum OrganizeError {
    #[error("api error: {0}")]
    Drive(#[from] DriveError),
    #[error("invalid year window: {start} is after {end}")]
    InvalidYearWindow { start: i32, end: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizeRequest {
    pub source_folder_id: String,
    pub start_year: i32,
    pub end_year: i32,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedMove {
    pub item_id: String,
    pub name: String,
    /// ISO `YYYY-MM-DD`.
    pub date: String,
    pub source: DateSource,
    pub placement: Placement,
    /// Known when the destination folder already exists.
    pub destination_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrganizeSummary {
    pub moved: u64,
    pub skipped: u64,
    pub errors: u64,
    /// Only filled by dry runs.
    pub planned: Vec<PlannedMove>,
    pub cancelled: bool,
}

enum Placed {
    Moved,
    AlreadyInPlace,
    NameTaken,
}

/// Files the direct children of a folder into `YYYY/MM` subfolders.
pub struct OrganizerEngine {
    remote: Arc<dyn RemoteDrive>,
    page_size: u32,
}

impl OrganizerEngine {
    pub fn new(context: &DriveContext) -> Self {
        Self {
            remote: Arc::clone(&context.remote),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Per-item failures are counted and logged; only listing the source
    /// folder can fail the whole run.
    pub async fn organize(
        &self,
        request: &OrganizeRequest,
        cancel: &CancellationToken,
    ) -> Result<OrganizeSummary, OrganizeError> {
        if request.start_year > request.end_year {
            return Err(OrganizeError::InvalidYearWindow {
                start: request.start_year,
                end: request.end_year,
            });
        }

        let query = ChildrenQuery::new(self.page_size).with_fields(LISTING_FIELDS);
        let children =
            list_all_children(self.remote.as_ref(), &request.source_folder_id, &query).await?;
        info!(
            source = %request.source_folder_id,
            children = children.len(),
            dry_run = request.dry_run,
            "organizing folder"
        );

        let mut folders =
            FolderResolver::new(self.remote.as_ref(), &request.source_folder_id, self.page_size);
        let mut summary = OrganizeSummary::default();

        for item in children.iter().filter(|item| !item.is_folder()) {
            if cancel.is_cancelled() {
                info!(moved = summary.moved, "organize cancelled");
                summary.cancelled = true;
                break;
            }
            let name = item.name.as_deref().unwrap_or_default();
            let Some(resolved) = resolve_date(item) else {
                warn!(item = %item.id, name, "no usable date; leaving item in place");
                summary.skipped += 1;
                continue;
            };
            let placement =
                Placement::for_date(resolved.date, request.start_year, request.end_year);

            if request.dry_run {
                match folders.lookup(placement).await {
                    Ok(Some(destination)) if item.parent_id() == Some(destination.as_str()) => {
                        summary.skipped += 1;
                    }
                    Ok(destination_id) => summary.planned.push(PlannedMove {
                        item_id: item.id.clone(),
                        name: name.to_string(),
                        date: resolved.date.to_string(),
                        source: resolved.source,
                        placement,
                        destination_id,
                    }),
                    Err(err) => {
                        warn!(item = %item.id, error = %err, "destination lookup failed");
                        summary.errors += 1;
                    }
                }
                continue;
            }

            match self.place(item, placement, &mut folders).await {
                Ok(Placed::Moved) => {
                    debug!(item = %item.id, destination = %placement.relative_path(), "moved");
                    summary.moved += 1;
                }
                Ok(Placed::AlreadyInPlace) => summary.skipped += 1,
                Ok(Placed::NameTaken) => {
                    info!(
                        item = %item.id,
                        name,
                        destination = %placement.relative_path(),
                        "destination already holds an item with this name; skipping"
                    );
                    summary.skipped += 1;
                }
                Err(err) => {
                    warn!(item = %item.id, name, error = %err, "failed to organize item");
                    summary.errors += 1;
                }
            }
        }

        info!(
            moved = summary.moved,
            skipped = summary.skipped,
            errors = summary.errors,
            planned = summary.planned.len(),
            "organize finished"
        );
        Ok(summary)
    }

    async fn place(
        &self,
        item: &DriveItem,
        placement: Placement,
        folders: &mut FolderResolver<'_>,
    ) -> Result<Placed, DriveError> {
        let destination = folders.ensure(placement).await?;
        if item.parent_id() == Some(destination.as_str()) {
            return Ok(Placed::AlreadyInPlace);
        }
        match self.remote.move_item(&item.id, &destination, None).await {
            Ok(_) => Ok(Placed::Moved),
            Err(err) if err.is_conflict() => Ok(Placed::NameTaken),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
