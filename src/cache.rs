use std::collections::HashMap;
use std::path::Path;

use camino::Utf8PathBuf;
use image::RgbaImage;
use tempfile::TempDir;
use tracing::debug;

use crate::error::UploadError;
use crate::geometry::FrameGeometry;

#[derive(Debug, Clone)]
pub struct BaseImage {
    pub geometry: FrameGeometry,
    pub raster: RgbaImage,
}

pub trait BaseImageDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<BaseImage, UploadError>;
}

// The spool directory is removed on drop. Nothing is evicted.
pub struct ResourceCache {
    spool: Option<TempDir>,
    entries: HashMap<String, BaseImage>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self {
            spool: None,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.entries.contains_key(file_name)
    }

    pub fn get_or_fetch<F>(
        &mut self,
        file_name: &str,
        decoder: &dyn BaseImageDecoder,
        fetch: F,
    ) -> Result<&BaseImage, UploadError>
    where
        F: FnOnce(&Path) -> Result<(), UploadError>,
    {
        if !self.entries.contains_key(file_name) {
            let destination = self.spool_path(file_name)?;
            debug!(file = file_name, path = %destination, "fetching base image");
            fetch(destination.as_std_path())?;
            let image = decoder.decode(destination.as_std_path())?;
            self.entries.insert(file_name.to_string(), image);
        }
        self.entries
            .get(file_name)
            .ok_or_else(|| UploadError::Filesystem(format!("cache lost entry {file_name}")))
    }

    fn spool_path(&mut self, file_name: &str) -> Result<Utf8PathBuf, UploadError> {
        if self.spool.is_none() {
            let dir = tempfile::Builder::new()
                .prefix("assessor-up-images")
                .tempdir()
                .map_err(|err| UploadError::Filesystem(err.to_string()))?;
            self.spool = Some(dir);
        }
        let Some(spool) = self.spool.as_ref() else {
            return Err(UploadError::Filesystem("image spool unavailable".to_string()));
        };
        let safe_name: String = file_name
            .chars()
            .map(|ch| if matches!(ch, '/' | '\\' | ':') { '_' } else { ch })
            .collect();
        Utf8PathBuf::from_path_buf(spool.path().join(safe_name))
            .map_err(|_| UploadError::Filesystem("non-utf8 spool path".to_string()))
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use image::Rgba;

    use super::*;

    struct SolidDecoder;

    impl BaseImageDecoder for SolidDecoder {
        fn decode(&self, path: &Path) -> Result<BaseImage, UploadError> {
            assert!(path.exists());
            Ok(BaseImage {
                geometry: FrameGeometry {
                    pixel_spacing: [1.0, 1.0],
                    direction_cosines: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
                    top_left_position: [0.0, 0.0, 0.0],
                    frame_of_reference_uid: "1.2.3".to_string(),
                },
                raster: RgbaImage::from_pixel(2, 2, Rgba([9, 9, 9, 255])),
            })
        }
    }

    #[test]
    fn fetches_each_file_once() {
        let mut cache = ResourceCache::new();
        let fetches = Cell::new(0);
        for _ in 0..3 {
            let image = cache
                .get_or_fetch("1.dcm", &SolidDecoder, |path| {
                    fetches.set(fetches.get() + 1);
                    std::fs::write(path, b"pixels").map_err(|err| UploadError::io(path, err))
                })
                .unwrap();
            assert_eq!(image.raster.dimensions(), (2, 2));
        }
        assert_eq!(fetches.get(), 1);
        assert!(cache.contains("1.dcm"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_fetch_is_not_cached() {
        let mut cache = ResourceCache::new();
        let result = cache.get_or_fetch("missing.dcm", &SolidDecoder, |_| {
            Err(UploadError::RepositoryStatus {
                status: 404,
                message: "not found".to_string(),
            })
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
    }
}
