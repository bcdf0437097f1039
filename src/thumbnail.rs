use std::collections::BTreeMap;
use std::io::Cursor;

use image::{ImageFormat, Rgba};
use tracing::{debug, warn};

use crate::cache::{BaseImageDecoder, ResourceCache};
use crate::config::CoordinateSpace;
use crate::derivative::{Contour, ParsedDerivative};
use crate::domain::{Direction, ResolvedBinding, ResourceDescriptor, ResourcePayload};
use crate::error::UploadError;
use crate::geometry::rasterize_contour;
use crate::repository::{RepositoryClient, paths};

pub const THUMBNAIL_LABEL: &str = "THUMBNAILS";
const OVERLAY_ALPHA: u8 = 128;

pub struct ThumbnailRenderer<'a, R: RepositoryClient + ?Sized> {
    repository: &'a R,
    decoder: &'a dyn BaseImageDecoder,
    project: &'a str,
    space: CoordinateSpace,
}

impl<'a, R: RepositoryClient + ?Sized> ThumbnailRenderer<'a, R> {
    pub fn new(
        repository: &'a R,
        decoder: &'a dyn BaseImageDecoder,
        project: &'a str,
        space: CoordinateSpace,
    ) -> Self {
        Self {
            repository,
            decoder,
            project,
            space,
        }
    }

    /// Failures are logged and skip only the affected contour or image; they
    /// never fail the caller.
    pub fn render(
        &self,
        parsed: &ParsedDerivative,
        binding: &ResolvedBinding,
    ) -> Vec<ResourceDescriptor> {
        let mut by_image: BTreeMap<&str, Vec<&Contour>> = BTreeMap::new();
        for contour in &parsed.contours {
            by_image
                .entry(contour.referenced_sop_instance_uid.as_str())
                .or_default()
                .push(contour);
        }

        let mut cache = ResourceCache::new();
        let mut thumbnails = Vec::with_capacity(by_image.len());
        for (instance_uid, contours) in by_image {
            match self.render_image(&mut cache, parsed, binding, instance_uid, &contours) {
                Ok(Some(thumbnail)) => thumbnails.push(thumbnail),
                Ok(None) => {}
                Err(err) => warn!(image = instance_uid, error = %err, "thumbnail skipped"),
            }
        }
        debug!(count = thumbnails.len(), cached = cache.len(), "thumbnails rendered");
        thumbnails
    }

    fn render_image(
        &self,
        cache: &mut ResourceCache,
        parsed: &ParsedDerivative,
        binding: &ResolvedBinding,
        instance_uid: &str,
        contours: &[&Contour],
    ) -> Result<Option<ResourceDescriptor>, UploadError> {
        let file_name = binding.file_for_instance(instance_uid).ok_or_else(|| {
            UploadError::PreconditionFailed(format!("image {instance_uid} is not bound"))
        })?;
        let scan = binding.scan_for_file(file_name).ok_or_else(|| {
            UploadError::PreconditionFailed(format!("file {file_name} has no scan"))
        })?;
        let remote = paths::scan_file(self.project, &binding.experiment_id, scan, file_name);
        let base = cache.get_or_fetch(file_name, self.decoder, |destination| {
            self.repository.download(&remote, destination)
        })?;

        if let Some(expected) = parsed.frame_of_reference_uid.as_deref() {
            let actual = base.geometry.frame_of_reference_uid.as_str();
            if self.space == CoordinateSpace::Patient && !actual.is_empty() && actual != expected {
                return Err(UploadError::Geometry(format!(
                    "image frame of reference {actual} differs from contour frame {expected}"
                )));
            }
        }

        let mut raster = base.raster.clone();
        let mut drawn = 0usize;
        for contour in contours {
            let [r, g, b] = contour.colour;
            match rasterize_contour(
                &mut raster,
                &contour.points,
                self.space,
                &base.geometry,
                Rgba([r, g, b, OVERLAY_ALPHA]),
            ) {
                Ok(()) => drawn += 1,
                Err(err) => {
                    warn!(region = %contour.region, image = instance_uid, error = %err, "contour not drawn")
                }
            }
        }
        if drawn == 0 {
            return Ok(None);
        }

        let mut png = Vec::new();
        raster
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|err| UploadError::Format(format!("thumbnail encoding: {err}")))?;

        Ok(Some(ResourceDescriptor {
            payload: ResourcePayload::Bytes(png),
            label: THUMBNAIL_LABEL.to_string(),
            format: "PNG".to_string(),
            content: "THUMBNAIL".to_string(),
            description: format!("contours drawn on image {instance_uid}"),
            direction: Direction::Out,
            file_name: format!("{instance_uid}.png"),
        }))
    }
}
