//! In-memory `RemoteDrive` used by the engine tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use drivemirror_core::{
    ChildrenPage, ChildrenQuery, ConflictBehavior, CrawlFrom, DeletedFacet, DeltaPage, DriveError,
    DriveItem, FileFacet, FolderFacet, Hashes, ItemReference, PhotoFacet, RemoteDrive, RootFacet,
    StatusCode,
};
use tokio::sync::Notify;

pub struct FakeDrive {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    root_id: String,
    pages: HashMap<String, DeltaPage>,
    expired: HashSet<String>,
    failing: HashSet<String>,
    crawled: Vec<String>,
    items: BTreeMap<String, DriveItem>,
    failing_moves: HashSet<String>,
    pending_children: HashMap<String, (Vec<DriveItem>, usize)>,
    next_id: u64,
    moves: Vec<(String, String)>,
    created_folders: Vec<String>,
    held: HashMap<String, LinkHold>,
}

/// Parks a crawl of one link until released.
#[derive(Clone, Default)]
pub struct LinkHold {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl FakeDrive {
    pub fn new(root_id: &str) -> Self {
        let mut state = FakeState {
            root_id: root_id.to_string(),
            ..FakeState::default()
        };
        let mut root = folder(root_id, "root", None);
        root.root = Some(RootFacet::default());
        state.items.insert(root_id.to_string(), root);
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn root_key(&self) -> String {
        format!("root:{}", self.state.lock().unwrap().root_id)
    }

    /// First page of a fresh crawl.
    pub fn set_root_page(&self, page: DeltaPage) {
        let key = self.root_key();
        self.state.lock().unwrap().pages.insert(key, page);
    }

    pub fn set_page(&self, link: &str, page: DeltaPage) {
        self.state
            .lock()
            .unwrap()
            .pages
            .insert(link.to_string(), page);
    }

    pub fn expire_link(&self, link: &str) {
        self.state.lock().unwrap().expired.insert(link.to_string());
    }

    pub fn fail_link(&self, link: &str) {
        self.state.lock().unwrap().failing.insert(link.to_string());
    }

    pub fn heal_link(&self, link: &str) {
        self.state.lock().unwrap().failing.remove(link);
    }

    pub fn hold_link(&self, link: &str) -> LinkHold {
        let hold = LinkHold::default();
        self.state
            .lock()
            .unwrap()
            .held
            .insert(link.to_string(), hold.clone());
        hold
    }

    pub fn crawled(&self) -> Vec<String> {
        self.state.lock().unwrap().crawled.clone()
    }

    pub fn add_item(&self, item: DriveItem) {
        self.state
            .lock()
            .unwrap()
            .items
            .insert(item.id.clone(), item);
    }

    pub fn item(&self, id: &str) -> Option<DriveItem> {
        self.state.lock().unwrap().items.get(id).cloned()
    }

    pub fn fail_move(&self, item_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_moves
            .insert(item_id.to_string());
    }

    pub fn moves(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().moves.clone()
    }

    pub fn created_folders(&self) -> Vec<String> {
        self.state.lock().unwrap().created_folders.clone()
    }

    /// Id of the folder named `name` directly under `parent_id`.
    pub fn child_named(&self, parent_id: &str, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .items
            .values()
            .find(|item| {
                item.parent_id() == Some(parent_id)
                    && item
                        .name
                        .as_deref()
                        .is_some_and(|n| n.eq_ignore_ascii_case(name))
            })
            .map(|item| item.id.clone())
    }
}

impl FakeState {
    fn name_taken(&self, parent_id: &str, name: &str, except: &str) -> bool {
        self.items.values().any(|item| {
            item.id != except
                && item.parent_id() == Some(parent_id)
                && item
                    .name
                    .as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
    }

    fn paginate(&mut self, mut items: Vec<DriveItem>, page_size: usize) -> ChildrenPage {
        let page_size = page_size.max(1);
        if items.len() <= page_size {
            return ChildrenPage {
                value: items,
                next_link: None,
            };
        }
        let rest = items.split_off(page_size);
        self.next_id += 1;
        let link = format!("children-next-{}", self.next_id);
        self.pending_children
            .insert(link.clone(), (rest, page_size));
        ChildrenPage {
            value: items,
            next_link: Some(link),
        }
    }
}

fn api_error(status: StatusCode, body: &str) -> DriveError {
    DriveError::Api {
        status,
        body: body.to_string(),
        retry_after: None,
    }
}

fn name_filter(filter: &str) -> Option<String> {
    let inner = filter.strip_prefix("name eq '")?.strip_suffix('\'')?;
    Some(inner.replace("''", "'"))
}

#[async_trait]
impl RemoteDrive for FakeDrive {
    async fn get_root(&self) -> Result<DriveItem, DriveError> {
        let state = self.state.lock().unwrap();
        state
            .items
            .get(&state.root_id)
            .cloned()
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "no root"))
    }

    async fn crawl(&self, from: CrawlFrom<'_>) -> Result<DeltaPage, DriveError> {
        let key = match from {
            CrawlFrom::Root(root_id) => format!("root:{root_id}"),
            CrawlFrom::Link(link) => link.to_string(),
        };
        let hold = self.state.lock().unwrap().held.get(&key).cloned();
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.release.notified().await;
        }
        let mut state = self.state.lock().unwrap();
        state.crawled.push(key.clone());
        if state.expired.contains(&key) {
            return Err(DriveError::CursorExpired {
                body: "resyncRequired".into(),
            });
        }
        if state.failing.contains(&key) {
            return Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable"));
        }
        state
            .pages
            .get(&key)
            .cloned()
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "unknown link"))
    }

    async fn list_children(
        &self,
        folder_id: &str,
        query: &ChildrenQuery,
    ) -> Result<ChildrenPage, DriveError> {
        let mut state = self.state.lock().unwrap();
        let wanted = query.filter.as_deref().and_then(name_filter);
        let items: Vec<DriveItem> = state
            .items
            .values()
            .filter(|item| item.parent_id() == Some(folder_id))
            .filter(|item| match &wanted {
                Some(name) => item
                    .name
                    .as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(name)),
                None => true,
            })
            .cloned()
            .collect();
        Ok(state.paginate(items, query.page_size as usize))
    }

    async fn list_children_next(&self, next_link: &str) -> Result<ChildrenPage, DriveError> {
        let mut state = self.state.lock().unwrap();
        let (items, page_size) = state
            .pending_children
            .remove(next_link)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "unknown link"))?;
        Ok(state.paginate(items, page_size))
    }

    async fn move_item(
        &self,
        item_id: &str,
        new_parent_id: &str,
        new_name: Option<&str>,
    ) -> Result<DriveItem, DriveError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_moves.contains(item_id) {
            return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "boom"));
        }
        let current = state
            .items
            .get(item_id)
            .cloned()
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "no item"))?;
        let name = new_name
            .map(str::to_string)
            .or(current.name.clone())
            .unwrap_or_default();
        if state.name_taken(new_parent_id, &name, item_id) {
            return Err(DriveError::Conflict {
                body: "nameAlreadyExists".into(),
            });
        }
        let mut moved = current;
        moved.name = Some(name);
        moved.parent_reference = Some(ItemReference {
            id: Some(new_parent_id.to_string()),
            ..ItemReference::default()
        });
        state.items.insert(item_id.to_string(), moved.clone());
        state
            .moves
            .push((item_id.to_string(), new_parent_id.to_string()));
        Ok(moved)
    }

    async fn delete_item(&self, item_id: &str) -> Result<(), DriveError> {
        let mut state = self.state.lock().unwrap();
        state
            .items
            .remove(item_id)
            .map(|_| ())
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "no item"))
    }

    async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
        on_conflict: ConflictBehavior,
    ) -> Result<DriveItem, DriveError> {
        let mut state = self.state.lock().unwrap();
        let mut final_name = name.to_string();
        if state.name_taken(parent_id, name, "") {
            match on_conflict {
                ConflictBehavior::Fail => {
                    return Err(DriveError::Conflict {
                        body: "nameAlreadyExists".into(),
                    });
                }
                ConflictBehavior::Rename => final_name = format!("{name} 1"),
            }
        }
        state.next_id += 1;
        let created = folder(
            &format!("folder-{}", state.next_id),
            &final_name,
            Some(parent_id),
        );
        state.items.insert(created.id.clone(), created.clone());
        state.created_folders.push(final_name);
        Ok(created)
    }
}

pub fn folder(id: &str, name: &str, parent_id: Option<&str>) -> DriveItem {
    DriveItem {
        id: id.to_string(),
        name: Some(name.to_string()),
        parent_reference: parent_id.map(|parent| ItemReference {
            id: Some(parent.to_string()),
            ..ItemReference::default()
        }),
        folder: Some(FolderFacet::default()),
        ..DriveItem::default()
    }
}

pub fn file(id: &str, name: &str, parent_id: &str, hash: Option<&str>, size: i64) -> DriveItem {
    DriveItem {
        id: id.to_string(),
        name: Some(name.to_string()),
        size: Some(size),
        created_date_time: Some("2021-06-01T10:00:00Z".into()),
        parent_reference: Some(ItemReference {
            id: Some(parent_id.to_string()),
            ..ItemReference::default()
        }),
        file: Some(FileFacet {
            mime_type: None,
            hashes: hash.map(|hash| Hashes {
                quick_xor_hash: Some(hash.to_string()),
                ..Hashes::default()
            }),
        }),
        ..DriveItem::default()
    }
}

pub fn photo(
    id: &str,
    name: &str,
    parent_id: &str,
    taken: Option<&str>,
    created: Option<&str>,
) -> DriveItem {
    let mut item = file(id, name, parent_id, None, 1);
    item.created_date_time = created.map(str::to_string);
    item.photo = taken.map(|taken| PhotoFacet {
        taken_date_time: Some(taken.to_string()),
        camera_model: None,
    });
    item
}

pub fn deleted(id: &str) -> DriveItem {
    DriveItem {
        id: id.to_string(),
        deleted: Some(DeletedFacet {
            state: Some("deleted".into()),
        }),
        ..DriveItem::default()
    }
}

pub fn page(entries: Vec<DriveItem>, next: Option<&str>, completion: Option<&str>) -> DeltaPage {
    DeltaPage {
        value: entries,
        next_link: next.map(str::to_string),
        delta_link: completion.map(str::to_string),
    }
}
