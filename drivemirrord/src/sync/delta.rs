use std::collections::HashMap;

use drivemirror_core::DriveItem;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::warn;

use super::index::ItemRecord;

/// Store mutations derived from one delta page.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PageChanges {
    pub upserts: Vec<ItemRecord>,
    pub deletions: Vec<String>,
    pub ignored: usize,
}

enum Change {
    Upsert(ItemRecord),
    Delete,
}

/// Splits a page into upserts and deletions. When an id appears more than
/// once, its last entry wins.
pub fn partition_entries(entries: &[DriveItem]) -> PageChanges {
    let mut order: Vec<&str> = Vec::with_capacity(entries.len());
    let mut latest: HashMap<&str, Change> = HashMap::with_capacity(entries.len());
    let mut ignored = 0;

    for entry in entries {
        let change = if entry.is_deleted() {
            Change::Delete
        } else if entry.is_folder() || entry.file.is_some() {
            Change::Upsert(record_from_item(entry))
        } else {
            ignored += 1;
            continue;
        };
        if latest.insert(entry.id.as_str(), change).is_none() {
            order.push(entry.id.as_str());
        }
    }

    let mut changes = PageChanges {
        ignored,
        ..PageChanges::default()
    };
    for id in order {
        match latest.remove(id) {
            Some(Change::Upsert(record)) => changes.upserts.push(record),
            Some(Change::Delete) => changes.deletions.push(id.to_string()),
            None => {}
        }
    }
    changes
}

pub fn record_from_item(item: &DriveItem) -> ItemRecord {
    let name = item.name.clone().unwrap_or_default();
    let path = item
        .parent_reference
        .as_ref()
        .and_then(|parent| parent.path.as_deref())
        .map(|parent| format!("{}/{}", parent.trim_end_matches('/'), name));
    let is_folder = item.is_folder();
    ItemRecord {
        id: item.id.clone(),
        parent_id: item.parent_id().map(str::to_string),
        path,
        content_hash: if is_folder {
            None
        } else {
            item.content_hash().map(str::to_string)
        },
        size: item.size,
        created_at: parse_timestamp(item.created_date_time.as_deref()),
        modified_at: parse_timestamp(item.last_modified_date_time.as_deref()),
        is_folder,
        web_url: item.web_url.clone(),
        name,
    }
}

/// RFC 3339 to unix seconds. Unparseable values are logged and dropped.
pub fn parse_timestamp(value: Option<&str>) -> Option<i64> {
    let value = value?;
    match OffsetDateTime::parse(value, &Rfc3339) {
        Ok(parsed) => Some(parsed.unix_timestamp()),
        Err(err) => {
            warn!(value, error = %err, "ignoring unparseable timestamp");
            None
        }
    }
}
