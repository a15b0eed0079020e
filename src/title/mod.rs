//! Title registry: aggregates installed titles per storage, links
//! applications to their patches and add-on contents, and produces dump
//! filenames.
//!
//! Titles live in an arena rebuilt atomically on refresh; links between
//! entries are arena indices, never owning pointers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::Error;
use crate::formats::cnmt::{Cnmt, ContentMetaType, ContentRecord};
use crate::version::VersionType1;

pub const PATCH_ID_OFFSET: u64 = 0x800;
pub const ADDON_ID_OFFSET: u64 = 0x1000;
pub const ADDON_CONVERSION_MASK: u64 = 0xFFFF_FFFF_FFFF_F000;
pub const ADDON_MAX_ENTRIES: u64 = 2000;
pub const DELTA_ID_OFFSET: u64 = 0xC00;

/// Content storage a title was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageId {
    GameCard,
    BuiltInSystem,
    BuiltInUser,
    SdCard,
    /// Wildcard for lookups.
    Any,
}

/// Localized application metadata attached to applications and system
/// titles.
#[derive(Debug, Clone)]
pub struct ApplicationMetadata {
    pub title_id: u64,
    pub name: String,
    pub author: String,
    /// JPEG icon bytes, possibly empty.
    pub icon: Vec<u8>,
}

/// One installed title.
#[derive(Debug, Clone)]
pub struct TitleInfo {
    pub storage: StorageId,
    pub title_id: u64,
    pub version: VersionType1,
    pub meta_type: ContentMetaType,
    pub contents: Vec<ContentRecord>,
    /// Total size across content records.
    pub size: u64,
    pub app_metadata: Option<ApplicationMetadata>,
    /// Arena index of the owning application, for patches and add-ons.
    pub parent: Option<usize>,
    /// Arena indices chaining entries with the same title id.
    pub previous: Option<usize>,
    pub next: Option<usize>,
}

/// Source of content-meta data, one per system. Abstracts the per-storage
/// content-meta databases and the application control data.
pub trait ContentMetaSource: Send + Sync {
    fn storages(&self) -> Vec<StorageId>;
    /// Every content meta on the storage, as parsed cnmts.
    fn meta_entries(&self, storage: StorageId) -> Result<Vec<Cnmt>, Error>;
    /// Localized name/author/icon for a title, when available.
    fn application_metadata(&self, title_id: u64) -> Option<ApplicationMetadata>;
}

#[derive(Default)]
struct TitleArena {
    titles: Vec<TitleInfo>,
}

/// Aggregated view over every installed title.
pub struct TitleRegistry {
    source: Box<dyn ContentMetaSource>,
    arena: RwLock<Arc<TitleArena>>,
    gamecard_latch: AtomicBool,
}

impl TitleRegistry {
    /// Builds the registry and performs the initial scan.
    pub fn new(source: Box<dyn ContentMetaSource>) -> Result<Self, Error> {
        let registry = Self {
            source,
            arena: RwLock::new(Arc::new(TitleArena::default())),
            gamecard_latch: AtomicBool::new(false),
        };
        registry.refresh(false)?;
        Ok(registry)
    }

    /// Rebuilds the arena from the sources. `gamecard_edge` marks the
    /// rebuild as triggered by a cartridge insertion or removal and sets
    /// the edge latch.
    pub fn refresh(&self, gamecard_edge: bool) -> Result<(), Error> {
        let mut titles = Vec::new();

        for storage in self.source.storages() {
            for cnmt in self.source.meta_entries(storage)? {
                let size = cnmt.content_records.iter().map(|r| r.size).sum();
                let app_metadata = self.source.application_metadata(cnmt.header.title_id);
                titles.push(TitleInfo {
                    storage,
                    title_id: cnmt.header.title_id,
                    version: VersionType1(cnmt.header.version),
                    meta_type: cnmt.header.meta_type,
                    contents: cnmt.content_records.clone(),
                    size,
                    app_metadata,
                    parent: None,
                    previous: None,
                    next: None,
                });
            }
        }

        link_titles(&mut titles);

        let arena = Arc::new(TitleArena { titles });
        *self.arena.write().unwrap() = arena;
        if gamecard_edge {
            self.gamecard_latch.store(true, Ordering::SeqCst);
        }

        tracing::debug!(
            titles = self.arena.read().unwrap().titles.len(),
            gamecard_edge,
            "Title registry rebuilt"
        );
        Ok(())
    }

    fn snapshot(&self) -> Arc<TitleArena> {
        Arc::clone(&self.arena.read().unwrap())
    }

    /// Application metadata entries. With `system` set, system titles
    /// are returned instead of user applications.
    pub fn metadata_entries(&self, system: bool) -> Vec<ApplicationMetadata> {
        let arena = self.snapshot();
        let mut out: Vec<ApplicationMetadata> = Vec::new();
        for title in &arena.titles {
            let wanted = if system {
                title.storage == StorageId::BuiltInSystem
            } else {
                title.meta_type == ContentMetaType::Application
            };
            if !wanted {
                continue;
            }
            if let Some(meta) = &title.app_metadata {
                if !out.iter().any(|m| m.title_id == meta.title_id) {
                    out.push(meta.clone());
                }
            }
        }
        out
    }

    /// First title matching storage and id. `StorageId::Any` matches the
    /// first storage holding the title.
    pub fn title_info(&self, storage: StorageId, title_id: u64) -> Option<TitleInfo> {
        let arena = self.snapshot();
        arena
            .titles
            .iter()
            .find(|t| t.title_id == title_id && (storage == StorageId::Any || t.storage == storage))
            .cloned()
    }

    /// Application, patch and add-on entries for a user application id.
    pub fn user_application_data(&self, app_id: u64) -> UserApplicationData {
        let arena = self.snapshot();
        let find = |pred: &dyn Fn(&TitleInfo) -> bool| {
            arena.titles.iter().find(|t| pred(t)).cloned()
        };

        UserApplicationData {
            app: find(&|t| t.title_id == app_id && t.meta_type == ContentMetaType::Application),
            patch: find(&|t| {
                t.meta_type == ContentMetaType::Patch && t.title_id == patch_id(app_id)
            }),
            aoc: find(&|t| {
                t.meta_type == ContentMetaType::AddOnContent
                    && addon_belongs_to_application(app_id, t.title_id)
            }),
        }
    }

    /// Titles found on a given storage, in arena order.
    pub fn titles_on_storage(&self, storage: StorageId) -> Vec<TitleInfo> {
        self.snapshot()
            .titles
            .iter()
            .filter(|t| t.storage == storage)
            .cloned()
            .collect()
    }

    /// Edge-triggered latch: reports (and clears) whether gamecard title
    /// info changed since the last call.
    pub fn is_gamecard_info_updated(&self) -> bool {
        self.gamecard_latch.swap(false, Ordering::SeqCst)
    }

    /// Filename for a gamecard dump: per-title filenames joined with
    /// " + ".
    pub fn generate_gamecard_filename(
        &self,
        convention: NamingConvention,
        policy: CharReplacePolicy,
    ) -> Option<String> {
        let titles = self.titles_on_storage(StorageId::GameCard);
        if titles.is_empty() {
            return None;
        }
        Some(
            titles
                .iter()
                .map(|t| generate_filename(t, convention, policy))
                .collect::<Vec<_>>()
                .join(" + "),
        )
    }
}

/// Wires parent/previous/next indices across the arena.
fn link_titles(titles: &mut [TitleInfo]) {
    // Chain same-id entries across storages in arena order.
    for i in 0..titles.len() {
        for j in (i + 1)..titles.len() {
            if titles[j].title_id == titles[i].title_id && titles[i].next.is_none() {
                titles[i].next = Some(j);
                titles[j].previous = Some(i);
                break;
            }
        }
    }

    // Parent-link patches and add-ons to their application.
    for i in 0..titles.len() {
        let parent_id = match titles[i].meta_type {
            ContentMetaType::Patch => application_id_for_patch(titles[i].title_id),
            ContentMetaType::AddOnContent => application_id_for_addon(titles[i].title_id),
            ContentMetaType::Delta => titles[i].title_id - DELTA_ID_OFFSET,
            _ => continue,
        };
        titles[i].parent = titles
            .iter()
            .position(|t| t.title_id == parent_id && t.meta_type == ContentMetaType::Application);
    }
}

/// Linked application/patch/add-on view for one user application.
#[derive(Debug, Default)]
pub struct UserApplicationData {
    pub app: Option<TitleInfo>,
    pub patch: Option<TitleInfo>,
    pub aoc: Option<TitleInfo>,
}

pub const fn patch_id(app_id: u64) -> u64 {
    app_id + PATCH_ID_OFFSET
}

pub const fn application_id_for_patch(patch_id: u64) -> u64 {
    patch_id - PATCH_ID_OFFSET
}

pub const fn addon_base_id(app_id: u64) -> u64 {
    (app_id & ADDON_CONVERSION_MASK) + ADDON_ID_OFFSET
}

pub const fn application_id_for_addon(aoc_id: u64) -> u64 {
    (aoc_id - ADDON_ID_OFFSET) & ADDON_CONVERSION_MASK
}

/// Valid add-on ids for a base live in `(base, base + 2001)`:
/// `base + 1` through `base + 2000` inclusive.
pub const fn addon_id_is_valid(aoc_id: u64, base: u64) -> bool {
    aoc_id > base && aoc_id < base + ADDON_MAX_ENTRIES + 1
}

pub fn addon_belongs_to_application(app_id: u64, aoc_id: u64) -> bool {
    addon_id_is_valid(aoc_id, addon_base_id(app_id))
}

/// Dump filename conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingConvention {
    /// "[<Name>] [<TitleId>][v<Version>][<Type>]"
    Full,
    /// "<TitleId>_v<Version>_<Type>"
    IdAndVersion,
}

/// How disallowed characters are rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharReplacePolicy {
    None,
    IllegalFsChars,
    AsciiOnly,
}

const ILLEGAL_FS_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

fn sanitize(name: &str, policy: CharReplacePolicy) -> String {
    match policy {
        CharReplacePolicy::None => name.to_string(),
        CharReplacePolicy::IllegalFsChars => name
            .chars()
            .map(|c| if ILLEGAL_FS_CHARS.contains(&c) { '_' } else { c })
            .collect(),
        CharReplacePolicy::AsciiOnly => name
            .chars()
            .map(|c| {
                if !(' '..='~').contains(&c) || ILLEGAL_FS_CHARS.contains(&c) {
                    '_'
                } else {
                    c
                }
            })
            .collect(),
    }
}

/// Builds a dump filename for a title.
pub fn generate_filename(
    info: &TitleInfo,
    convention: NamingConvention,
    policy: CharReplacePolicy,
) -> String {
    let type_name = info.meta_type.name();
    let version = info.version.value();

    match convention {
        NamingConvention::Full => {
            if let Some(meta) = &info.app_metadata {
                let name = sanitize(&meta.name, policy);
                format!(
                    "[{name}] [{:016X}][v{version}][{type_name}]",
                    info.title_id
                )
            } else {
                format!("[{:016X}][v{version}][{type_name}]", info.title_id)
            }
        }
        NamingConvention::IdAndVersion => {
            format!("{:016X}_v{version}_{type_name}", info.title_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::cnmt::test_cnmt;

    struct MockSource {
        entries: Vec<(StorageId, Cnmt)>,
        metadata: Vec<ApplicationMetadata>,
    }

    impl ContentMetaSource for MockSource {
        fn storages(&self) -> Vec<StorageId> {
            vec![StorageId::BuiltInUser, StorageId::SdCard, StorageId::GameCard]
        }

        fn meta_entries(&self, storage: StorageId) -> Result<Vec<Cnmt>, Error> {
            Ok(self
                .entries
                .iter()
                .filter(|(s, _)| *s == storage)
                .map(|(_, c)| c.clone())
                .collect())
        }

        fn application_metadata(&self, title_id: u64) -> Option<ApplicationMetadata> {
            self.metadata.iter().find(|m| m.title_id == title_id).cloned()
        }
    }

    const APP_ID: u64 = 0x0100ABCDEF000000;

    fn registry_with_family() -> TitleRegistry {
        let source = MockSource {
            entries: vec![
                (
                    StorageId::BuiltInUser,
                    test_cnmt(APP_ID, 0, ContentMetaType::Application),
                ),
                (
                    StorageId::BuiltInUser,
                    test_cnmt(patch_id(APP_ID), 0x20000, ContentMetaType::Patch),
                ),
                (
                    StorageId::SdCard,
                    test_cnmt(addon_base_id(APP_ID) + 1, 0x10000, ContentMetaType::AddOnContent),
                ),
            ],
            metadata: vec![ApplicationMetadata {
                title_id: APP_ID,
                name: "Test Game".to_string(),
                author: "Test Author".to_string(),
                icon: vec![],
            }],
        };
        TitleRegistry::new(Box::new(source)).unwrap()
    }

    #[test]
    fn patch_and_addon_id_arithmetic() {
        assert_eq!(patch_id(APP_ID), APP_ID + 0x800);
        assert_eq!(application_id_for_patch(APP_ID + 0x800), APP_ID);

        // Add-on ids for 0x0100ABCDEF000000 run from base + 1 through
        // base + 0x7D0; the upper bound base + 0x7D1 is exclusive.
        let base = addon_base_id(APP_ID);
        assert_eq!(base, 0x0100ABCDEF001000);
        assert!(addon_id_is_valid(0x0100ABCDEF001001, base));
        assert!(addon_id_is_valid(0x0100ABCDEF0017D0, base));
        assert!(!addon_id_is_valid(0x0100ABCDEF0017D1, base));
        assert!(!addon_id_is_valid(0x0100ABCDEF0017D2, base));
        assert!(!addon_id_is_valid(base, base));
    }

    #[test]
    fn title_graph_closure() {
        let registry = registry_with_family();

        let data = registry.user_application_data(APP_ID);
        assert_eq!(data.app.as_ref().unwrap().title_id, APP_ID);
        assert_eq!(data.patch.as_ref().unwrap().title_id, patch_id(APP_ID));
        assert_eq!(
            data.aoc.as_ref().unwrap().title_id,
            addon_base_id(APP_ID) + 1
        );

        // The patch entry carries a parent index back to the app.
        let patch = registry
            .title_info(StorageId::Any, patch_id(APP_ID))
            .unwrap();
        assert!(patch.parent.is_some());
    }

    #[test]
    fn title_lookup_by_storage() {
        let registry = registry_with_family();
        assert!(registry.title_info(StorageId::BuiltInUser, APP_ID).is_some());
        assert!(registry.title_info(StorageId::SdCard, APP_ID).is_none());
        assert!(registry.title_info(StorageId::Any, APP_ID).is_some());
    }

    #[test]
    fn metadata_entries_deduplicate() {
        let registry = registry_with_family();
        let entries = registry.metadata_entries(false);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Test Game");
    }

    #[test]
    fn gamecard_latch_is_edge_triggered() {
        let registry = registry_with_family();
        assert!(!registry.is_gamecard_info_updated());
        registry.refresh(true).unwrap();
        assert!(registry.is_gamecard_info_updated());
        assert!(!registry.is_gamecard_info_updated());
    }

    #[test]
    fn filename_conventions() {
        let info = TitleInfo {
            storage: StorageId::GameCard,
            title_id: 0x01007EF00011E000,
            version: VersionType1(0x00030000),
            meta_type: ContentMetaType::Application,
            contents: vec![],
            size: 0,
            app_metadata: Some(ApplicationMetadata {
                title_id: 0x01007EF00011E000,
                name: "Zelda: BOTW".to_string(),
                author: "".to_string(),
                icon: vec![],
            }),
            parent: None,
            previous: None,
            next: None,
        };

        assert_eq!(
            generate_filename(
                &info,
                NamingConvention::Full,
                CharReplacePolicy::IllegalFsChars
            ),
            "[Zelda_ BOTW] [01007EF00011E000][v196608][Application]"
        );
        assert_eq!(
            generate_filename(
                &info,
                NamingConvention::IdAndVersion,
                CharReplacePolicy::None
            ),
            "01007EF00011E000_v196608_Application"
        );
    }

    #[test]
    fn ascii_only_policy() {
        assert_eq!(
            sanitize("Pok\u{e9}mon: Let's Go!", CharReplacePolicy::AsciiOnly),
            "Pok_mon_ Let's Go!"
        );
        assert_eq!(sanitize("a/b\\c", CharReplacePolicy::IllegalFsChars), "a_b_c");
    }

    #[test]
    fn gamecard_dump_filename_joins_titles() {
        let registry = registry_with_family();
        // Move nothing to the gamecard: no filename.
        assert!(registry
            .generate_gamecard_filename(
                NamingConvention::IdAndVersion,
                CharReplacePolicy::None
            )
            .is_none());

        let source = MockSource {
            entries: vec![
                (
                    StorageId::GameCard,
                    test_cnmt(APP_ID, 0x10000, ContentMetaType::Application),
                ),
                (
                    StorageId::GameCard,
                    test_cnmt(patch_id(APP_ID), 0x20000, ContentMetaType::Patch),
                ),
            ],
            metadata: vec![],
        };
        let registry = TitleRegistry::new(Box::new(source)).unwrap();
        let name = registry
            .generate_gamecard_filename(NamingConvention::IdAndVersion, CharReplacePolicy::None)
            .unwrap();
        assert_eq!(
            name,
            format!(
                "{:016X}_v65536_Application + {:016X}_v131072_Patch",
                APP_ID,
                patch_id(APP_ID)
            )
        );
    }
}
