use std::collections::HashMap;

use drivemirror_core::{ChildrenQuery, ConflictBehavior, DriveError, RemoteDrive, list_all_children};
use tracing::debug;

use super::dates::Placement;

const LOOKUP_FIELDS: &[&str] = &["id", "name", "folder", "parentReference"];

/// Resolves `Year` and `Year/Month` folders under one source folder.
///
/// Ids are cached for the lifetime of the resolver, which is one organize run.
pub struct FolderResolver<'a> {
    remote: &'a dyn RemoteDrive,
    source_id: &'a str,
    page_size: u32,
    cache: HashMap<String, String>,
}

impl<'a> FolderResolver<'a> {
    pub fn new(remote: &'a dyn RemoteDrive, source_id: &'a str, page_size: u32) -> Self {
        Self {
            remote,
            source_id,
            page_size,
            cache: HashMap::new(),
        }
    }

    /// Read-only: the month folder id if both levels already exist.
    pub async fn lookup(&mut self, placement: Placement) -> Result<Option<String>, DriveError> {
        let source_id = self.source_id;
        let year_name = placement.year_folder();
        let Some(year_id) = self.cached_or_found(&year_name, source_id, &year_name).await? else {
            return Ok(None);
        };
        let month_key = placement.relative_path();
        self.cached_or_found(&month_key, &year_id, &placement.month_folder())
            .await
    }

    /// The month folder id, creating missing levels on the way.
    pub async fn ensure(&mut self, placement: Placement) -> Result<String, DriveError> {
        let source_id = self.source_id;
        let year_name = placement.year_folder();
        let year_id = self.ensure_child(&year_name, source_id, &year_name).await?;
        self.ensure_child(&placement.relative_path(), &year_id, &placement.month_folder())
            .await
    }

    async fn cached_or_found(
        &mut self,
        key: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<String>, DriveError> {
        if let Some(id) = self.cache.get(key) {
            return Ok(Some(id.clone()));
        }
        let found = self.find_child_folder(parent_id, name).await?;
        if let Some(id) = &found {
            self.cache.insert(key.to_string(), id.clone());
        }
        Ok(found)
    }

    async fn ensure_child(
        &mut self,
        key: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<String, DriveError> {
        if let Some(id) = self.cached_or_found(key, parent_id, name).await? {
            return Ok(id);
        }
        let id = match self
            .remote
            .create_folder(parent_id, name, ConflictBehavior::Fail)
            .await
        {
            Ok(created) => {
                debug!(folder = key, id = %created.id, "created destination folder");
                created.id
            }
            // Someone created it between the lookup and the create.
            Err(err) if err.is_conflict() => match self.find_child_folder(parent_id, name).await? {
                Some(id) => id,
                None => return Err(err),
            },
            Err(err) => return Err(err),
        };
        self.cache.insert(key.to_string(), id.clone());
        Ok(id)
    }

    async fn find_child_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<String>, DriveError> {
        let query = ChildrenQuery::named(self.page_size, name).with_fields(LOOKUP_FIELDS);
        let children = list_all_children(self.remote, parent_id, &query).await?;
        Ok(children
            .into_iter()
            .find(|child| {
                child.is_folder()
                    && child
                        .name
                        .as_deref()
                        .is_some_and(|child_name| child_name.eq_ignore_ascii_case(name))
            })
            .map(|child| child.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDrive, file, folder};

    const JAN_2023: Placement = Placement {
        year: 2023,
        month: 1,
    };

    fn drive_with_source() -> FakeDrive {
        let drive = FakeDrive::new("root");
        drive.add_item(folder("src", "Camera", Some("root")));
        drive
    }

    #[tokio::test]
    async fn ensure_creates_both_levels_once_and_caches_them() {
        let drive = drive_with_source();
        let mut folders = FolderResolver::new(&drive, "src", 50);

        let first = folders.ensure(JAN_2023).await.unwrap();
        let second = folders.ensure(JAN_2023).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(drive.created_folders(), vec!["2023", "01"]);
        let year_id = drive.child_named("src", "2023").unwrap();
        assert_eq!(drive.child_named(&year_id, "01"), Some(first));
    }

    #[tokio::test]
    async fn ensure_reuses_existing_folders() {
        let drive = drive_with_source();
        drive.add_item(folder("y2023", "2023", Some("src")));
        let mut folders = FolderResolver::new(&drive, "src", 50);

        let month = folders.ensure(JAN_2023).await.unwrap();

        assert_eq!(drive.created_folders(), vec!["01"]);
        assert_eq!(drive.item(&month).unwrap().parent_id(), Some("y2023"));
    }

    #[tokio::test]
    async fn a_file_with_the_folder_name_is_a_conflict() {
        let drive = drive_with_source();
        drive.add_item(file("f", "2023", "src", None, 1));
        let mut folders = FolderResolver::new(&drive, "src", 50);

        let err = folders.ensure(JAN_2023).await.unwrap_err();

        assert!(err.is_conflict());
        assert!(drive.created_folders().is_empty());
    }

    #[tokio::test]
    async fn lookup_never_creates() {
        let drive = drive_with_source();
        let mut folders = FolderResolver::new(&drive, "src", 50);

        assert_eq!(folders.lookup(JAN_2023).await.unwrap(), None);
        assert!(drive.created_folders().is_empty());

        drive.add_item(folder("y", "2023", Some("src")));
        drive.add_item(folder("m", "01", Some("y")));
        assert_eq!(folders.lookup(JAN_2023).await.unwrap().as_deref(), Some("m"));
    }
}
