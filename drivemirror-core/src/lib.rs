mod client;
mod remote;

pub use client::{
    ApiErrorClass, ChildrenPage, DeletedFacet, DeltaPage, DriveError, DriveItem, FileFacet,
    FolderFacet, GraphClient, Hashes, ItemReference, PhotoFacet, RootFacet,
};
pub use remote::{ChildrenQuery, ConflictBehavior, CrawlFrom, RemoteDrive, list_all_children};
pub use reqwest::StatusCode;
