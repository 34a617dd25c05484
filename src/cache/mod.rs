//! The two-tier OCR result cache (spec.md §4.E): an optional in-memory LRU
//! in front of an on-disk JSON tier, keyed by `(workdir, page_id)`.

pub mod lru;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{CoreError, Result};
use crate::gateway::{Lease, OcrInput, RawBlock};

use self::lru::Lru;

/// A normalized layout block as persisted to disk. Blocks with a missing
/// `bbox` or `label` are dropped before reaching this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutBlock {
    pub index: u32,
    pub label: String,
    pub region_label: Option<String>,
    pub bbox: [f32; 4],
    pub content: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub content_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_len: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageLayout {
    pub page_id: String,
    pub image_width: u32,
    pub image_height: u32,
    pub blocks: Vec<LayoutBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    workdir: PathBuf,
    page_id: String,
}

/// Extract the page id (e.g. `page_12` -> `12`, falling back to `0` when
/// there's no trailing integer) used to order pages, per spec.md §4.E.
pub fn page_sort_key(page_id: &str) -> u32 {
    let digits: String = page_id.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    digits.chars().rev().collect::<String>().parse().unwrap_or(0)
}

fn normalize_blocks(raw: Vec<RawBlock>, max_chars: Option<usize>) -> Vec<LayoutBlock> {
    raw.into_iter()
        .filter_map(|b| {
            let bbox = b.bbox?;
            let label = b.label?;
            // Only non-text content is ever truncated (spec.md §4.E); a
            // "text" block is the OCR'd prose itself and must stay whole.
            let (content, content_truncated, content_len) = match max_chars {
                Some(max) if label != "text" && b.content.chars().count() > max => {
                    let truncated: String = b.content.chars().take(max).collect();
                    let len = b.content.chars().count();
                    (truncated, true, Some(len))
                }
                _ => (b.content, false, None),
            };
            Some(LayoutBlock {
                index: b.index,
                label,
                region_label: b.region_label,
                bbox,
                content,
                content_truncated,
                content_len,
            })
        })
        .collect()
}

/// Two-tier cache over per-page OCR layout results.
pub struct OcrCache {
    memory: Option<AsyncMutex<Lru<CacheKey, PageLayout>>>,
    max_chars: Option<usize>,
}

impl OcrCache {
    pub fn new(memory_capacity: Option<usize>, max_chars: Option<usize>) -> Self {
        Self {
            memory: memory_capacity.map(|cap| AsyncMutex::new(Lru::new(cap.min(512)))),
            max_chars,
        }
    }

    fn disk_path(workdir: &Path, page_id: &str) -> PathBuf {
        workdir.join("ocr").join(format!("{page_id}.json"))
    }

    async fn memory_get(&self, key: &CacheKey) -> Option<PageLayout> {
        let memory = self.memory.as_ref()?;
        let mut lru = memory.lock().await;
        lru.get(key).cloned()
    }

    async fn memory_put(&self, key: CacheKey, value: PageLayout) {
        if let Some(memory) = &self.memory {
            memory.lock().await.put(key, value);
        }
    }

    async fn disk_get(&self, workdir: &Path, page_id: &str) -> Result<Option<PageLayout>> {
        let path = Self::disk_path(workdir, page_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn disk_put(&self, workdir: &Path, layout: &PageLayout) -> Result<()> {
        let path = Self::disk_path(workdir, &layout.page_id);
        let dir = path.parent().expect("ocr/ always has a parent");
        tokio::fs::create_dir_all(dir).await?;
        let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let bytes = serde_json::to_vec(layout)?;
        let write = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &path).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;
        if let Err(e) = write {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Implements spec.md §4.E's fetcher: memory hit, else disk hit
    /// (promoted to memory), else run inference, normalize, persist,
    /// promote.
    pub async fn run_ocr_with_cache(
        &self,
        lease: &Lease,
        page_image_path: &Path,
        workdir: &Path,
        force: bool,
    ) -> Result<PageLayout> {
        let page_id = page_image_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| CoreError::fatal(format!("bad page path: {page_image_path:?}")))?
            .to_string();
        let key = CacheKey {
            workdir: workdir.to_path_buf(),
            page_id: page_id.clone(),
        };

        if !force {
            if let Some(hit) = self.memory_get(&key).await {
                return Ok(hit);
            }
            if let Some(hit) = self.disk_get(workdir, &page_id).await? {
                self.memory_put(key, hit.clone()).await;
                return Ok(hit);
            }
        }

        let (width, height) = image::image_dimensions(page_image_path)
            .map_err(|e| CoreError::fatal(format!("cannot read image size: {e}")))?;

        let raw = match lease
            .predict(OcrInput::Path(page_image_path))
            .await
        {
            Ok(blocks) => blocks,
            Err(first_err) => {
                // Some backends only accept a decoded pixel array; retry
                // once with pixels per spec.md §4.E step 4 (read here,
                // outside the hard mutex, so the retry cost is I/O only).
                let img = image::open(page_image_path)
                    .map_err(|e| CoreError::fatal(format!("cannot decode image: {e}")))?
                    .to_rgb8();
                lease
                    .predict(OcrInput::Pixels {
                        width: img.width(),
                        height: img.height(),
                        rgb8: img.as_raw(),
                    })
                    .await
                    .map_err(|e| {
                        CoreError::retryable(format!(
                            "ocr predict failed (path attempt: {first_err}; pixel retry: {e})"
                        ))
                    })?
            }
        };

        let blocks = normalize_blocks(raw, self.max_chars);
        let layout = PageLayout {
            page_id: page_id.clone(),
            image_width: width,
            image_height: height,
            blocks,
        };
        self.disk_put(workdir, &layout).await?;
        self.memory_put(key, layout.clone()).await;
        Ok(layout)
    }
}

/// `{stems(page_*.png)} == {stems(ocr/page_*.json)}` (spec.md §4.E).
pub async fn is_ocr_complete(workdir: &Path) -> Result<bool> {
    let pages = list_stems(workdir, "page_", ".png").await?;
    let cached = list_stems(&workdir.join("ocr"), "page_", ".json").await?;
    Ok(!pages.is_empty() && pages == cached)
}

async fn list_stems(dir: &Path, prefix: &str, suffix: &str) -> Result<HashSet<String>> {
    let mut out = HashSet::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(suffix) {
            if stem.starts_with(prefix) {
                out.insert(stem.to_string());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_sort_key_extracts_trailing_integer() {
        assert_eq!(page_sort_key("page_12"), 12);
        assert_eq!(page_sort_key("page_"), 0);
        assert_eq!(page_sort_key("weird"), 0);
    }

    #[test]
    fn normalize_drops_blocks_missing_bbox_or_label() {
        let raw = vec![
            RawBlock { index: 0, label: Some("text".into()), region_label: None, bbox: Some([0.0, 0.0, 1.0, 1.0]), content: "hi".into() },
            RawBlock { index: 1, label: None, region_label: None, bbox: Some([0.0, 0.0, 1.0, 1.0]), content: "no label".into() },
            RawBlock { index: 2, label: Some("text".into()), region_label: None, bbox: None, content: "no bbox".into() },
        ];
        let normalized = normalize_blocks(raw, None);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].content, "hi");
    }

    #[test]
    fn normalize_truncates_long_content() {
        let raw = vec![RawBlock {
            index: 0,
            label: Some("text".into()),
            region_label: None,
            bbox: Some([0.0, 0.0, 1.0, 1.0]),
            content: "abcdef".into(),
        }];
        let normalized = normalize_blocks(raw, Some(3));
        assert!(normalized[0].content_truncated);
        assert_eq!(normalized[0].content_len, Some(6));
        assert_eq!(normalized[0].content, "abc");
    }

    #[tokio::test]
    async fn is_ocr_complete_requires_matching_stems() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("page_1.png"), b"x").await.unwrap();
        assert!(!is_ocr_complete(dir.path()).await.unwrap());

        tokio::fs::create_dir_all(dir.path().join("ocr")).await.unwrap();
        tokio::fs::write(dir.path().join("ocr/page_1.json"), b"{}").await.unwrap();
        assert!(is_ocr_complete(dir.path()).await.unwrap());
    }
}
