use anyhow::{bail, Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::collaborators::{FrameSource, PageTurner};

/// Replays saved screenshots of the collection, one file per page, in file
/// name order. Turning past the last page wraps to the first, the same way
/// the client's collection view does.
pub struct DirectoryFrameSource {
    frames: Vec<PathBuf>,
    current: AtomicUsize,
}

impl DirectoryFrameSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut frames: Vec<PathBuf> = WalkDir::new(dir)
            .max_depth(1)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|entry| entry.file_type().is_file() && Self::is_frame_file(entry.path()))
            .map(|entry| entry.into_path())
            .collect();
        frames.sort();

        if frames.is_empty() {
            bail!("No page screenshots found in {}", dir.display());
        }
        info!("Replaying {} pages from {}", frames.len(), dir.display());

        Ok(Self {
            frames,
            current: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn is_frame_file(path: &Path) -> bool {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => matches!(ext.to_lowercase().as_str(), "png" | "jpg" | "jpeg" | "bmp"),
            None => false,
        }
    }
}

impl FrameSource for DirectoryFrameSource {
    fn capture(&self) -> Result<RgbImage> {
        let index = self.current.load(Ordering::SeqCst);
        let path = &self.frames[index];
        debug!("Capturing page {} from {}", index, path.display());
        let frame = image::open(path)
            .with_context(|| format!("Failed to open frame {}", path.display()))?;
        Ok(frame.to_rgb8())
    }

    fn is_live(&self) -> bool {
        false
    }
}

impl PageTurner for DirectoryFrameSource {
    fn next_page(&self) -> Result<()> {
        let len = self.frames.len();
        let _ = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| Some((i + 1) % len));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn pages_replay_in_name_order_and_wrap() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([2, 2, 2]))
            .save(dir.path().join("page-02.png"))
            .unwrap();
        RgbImage::from_pixel(4, 4, Rgb([1, 1, 1]))
            .save(dir.path().join("page-01.png"))
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a frame").unwrap();

        let source = DirectoryFrameSource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 2);
        assert!(!source.is_live());

        assert_eq!(source.capture().unwrap().get_pixel(0, 0), &Rgb([1, 1, 1]));
        source.next_page().unwrap();
        assert_eq!(source.capture().unwrap().get_pixel(0, 0), &Rgb([2, 2, 2]));
        source.next_page().unwrap();
        assert_eq!(source.capture().unwrap().get_pixel(0, 0), &Rgb([1, 1, 1]));
    }

    #[test]
    fn empty_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DirectoryFrameSource::open(dir.path()).is_err());
    }
}
