// Terminal packaging handoff: turn a finished ledger into named assets and
// give them to an archiver.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::core::config::PackagingConfig;
use crate::core::errors::PackagingError;
use crate::core::types::{GenerationResult, ImagePayload, ItemStatus};
use crate::utils::image_ops::{decode_image, encode_png, resize_to};

/// One named file in a sticker bundle
#[derive(Debug, Clone)]
pub struct PackageEntry {
    pub name: String,
    pub image: ImagePayload,
    /// Ledger id the entry came from
    pub source_id: usize,
}

#[derive(Debug, Clone)]
pub struct StickerPackage {
    pub stickers: Vec<PackageEntry>,
    pub main: PackageEntry,
    pub tab: PackageEntry,
}

impl StickerPackage {
    pub fn entries(&self) -> impl Iterator<Item = &PackageEntry> {
        self.stickers.iter().chain([&self.main, &self.tab])
    }
}

/// Build the bundle from a ledger in which every item is terminal.
///
/// Successful entries are numbered `sticker_<n>` in ledger order, starting
/// at 1. `main` and `tab` are resized from the first success.
pub fn build_package(results: &[GenerationResult], config: &PackagingConfig) -> Result<StickerPackage, PackagingError> {
    let unfinished = results.iter().filter(|r| !r.status.is_terminal()).count();
    if unfinished > 0 {
        return Err(PackagingError::NotTerminal(unfinished));
    }

    let successes: Vec<(usize, &ImagePayload)> = results
        .iter()
        .filter(|r| r.status == ItemStatus::Success)
        .filter_map(|r| r.processed_image.as_ref().map(|img| (r.id, img)))
        .collect();

    let (first_id, first_image) = *successes.first().ok_or(PackagingError::NothingToPackage)?;

    let stickers = successes
        .iter()
        .enumerate()
        .map(|(index, (id, image))| PackageEntry {
            name: format!("sticker_{}.{}", index + 1, image.extension()),
            image: (*image).clone(),
            source_id: *id,
        })
        .collect();

    let source = decode_image(&first_image.data)?;
    let derived = |name: &str, (width, height): (u32, u32)| -> Result<PackageEntry, PackagingError> {
        let resized = resize_to(&source, width, height)?;
        Ok(PackageEntry {
            name: name.to_string(),
            image: ImagePayload::png(encode_png(&resized.to_rgba8())?),
            source_id: first_id,
        })
    };

    Ok(StickerPackage {
        stickers,
        main: derived("main.png", config.main_size)?,
        tab: derived("tab.png", config.tab_size)?,
    })
}

/// Where a bundle ended up
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReceipt {
    pub location: String,
    pub files: Vec<String>,
}

/// External collaborator that stores a finished bundle.
#[async_trait]
pub trait Archiver: Send + Sync {
    async fn archive(&self, package: &StickerPackage) -> Result<ArchiveReceipt, PackagingError>;
}

#[derive(Serialize)]
struct Manifest<'a> {
    bundle: &'a str,
    stickers: Vec<ManifestEntry<'a>>,
    main: &'a str,
    tab: &'a str,
}

#[derive(Serialize)]
struct ManifestEntry<'a> {
    file: &'a str,
    source_id: usize,
}

/// Writes each bundle as a directory of PNGs plus `manifest.json`.
pub struct DirectoryArchiver {
    root: PathBuf,
}

impl DirectoryArchiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bundle_name() -> String {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        format!("stickers_{}", millis)
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), PackagingError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| PackagingError::WriteFailed {
            path: path.display().to_string(),
            source,
        })
}

#[async_trait]
impl Archiver for DirectoryArchiver {
    async fn archive(&self, package: &StickerPackage) -> Result<ArchiveReceipt, PackagingError> {
        let bundle = Self::bundle_name();
        let dir = self.root.join(&bundle);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| PackagingError::WriteFailed {
                path: dir.display().to_string(),
                source,
            })?;

        let mut files = Vec::new();
        for entry in package.entries() {
            write_file(&dir.join(&entry.name), &entry.image.data).await?;
            files.push(entry.name.clone());
        }

        let manifest = Manifest {
            bundle: &bundle,
            stickers: package
                .stickers
                .iter()
                .map(|s| ManifestEntry {
                    file: &s.name,
                    source_id: s.source_id,
                })
                .collect(),
            main: &package.main.name,
            tab: &package.tab.name,
        };
        let manifest = serde_json::to_vec_pretty(&manifest)?;
        write_file(&dir.join("manifest.json"), &manifest).await?;
        files.push("manifest.json".to_string());

        info!("Packaged {} stickers into {}", package.stickers.len(), dir.display());

        Ok(ArchiveReceipt {
            location: dir.display().to_string(),
            files,
        })
    }
}
