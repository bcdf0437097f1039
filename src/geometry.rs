// (col, row) = (0, 0) is the centre of the top-left pixel, located at
// top_left_position.

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::config::CoordinateSpace;
use crate::error::UploadError;

pub const SOLUTION_TOLERANCE: f64 = 0.001;

const DEGENERATE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameGeometry {
    /// Row spacing then column spacing, in millimetres.
    pub pixel_spacing: [f64; 2],
    /// Row direction cosine (along increasing column) then column direction
    /// cosine (along increasing row).
    pub direction_cosines: [f64; 6],
    pub top_left_position: [f64; 3],
    pub frame_of_reference_uid: String,
}

impl FrameGeometry {
    fn row_cosine(&self) -> [f64; 3] {
        [
            self.direction_cosines[0],
            self.direction_cosines[1],
            self.direction_cosines[2],
        ]
    }

    fn col_cosine(&self) -> [f64; 3] {
        [
            self.direction_cosines[3],
            self.direction_cosines[4],
            self.direction_cosines[5],
        ]
    }

    pub fn to_patient(&self, col: f64, row: f64) -> [f64; 3] {
        let along_row = self.row_cosine();
        let along_col = self.col_cosine();
        let col_step = col * self.pixel_spacing[1];
        let row_step = row * self.pixel_spacing[0];
        let mut point = self.top_left_position;
        for axis in 0..3 {
            point[axis] += col_step * along_row[axis] + row_step * along_col[axis];
        }
        point
    }

    // Each usable axis pair gives one candidate; all must agree and the
    // best-conditioned one wins.
    pub fn to_image(&self, point: [f64; 3]) -> Result<(f64, f64), UploadError> {
        if self.pixel_spacing[0] <= 0.0 || self.pixel_spacing[1] <= 0.0 {
            return Err(UploadError::Geometry(format!(
                "non-positive pixel spacing {:?}",
                self.pixel_spacing
            )));
        }

        let along_row = self.row_cosine();
        let along_col = self.col_cosine();
        let delta = [
            point[0] - self.top_left_position[0],
            point[1] - self.top_left_position[1],
            point[2] - self.top_left_position[2],
        ];

        let mut candidates: Vec<(f64, (f64, f64))> = Vec::with_capacity(3);
        for (i, j) in [(0usize, 1usize), (0, 2), (1, 2)] {
            let det = along_row[i] * along_col[j] - along_row[j] * along_col[i];
            if det.abs() < DEGENERATE_EPSILON {
                continue;
            }
            // Cramer's rule on the two chosen equations.
            let col_mm = (delta[i] * along_col[j] - delta[j] * along_col[i]) / det;
            let row_mm = (along_row[i] * delta[j] - along_row[j] * delta[i]) / det;
            candidates.push((
                det.abs(),
                (col_mm / self.pixel_spacing[1], row_mm / self.pixel_spacing[0]),
            ));
        }

        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
        let Some(&(_, best)) = candidates.first() else {
            return Err(UploadError::Geometry(
                "direction cosines are degenerate on every axis pair".to_string(),
            ));
        };
        for &(_, other) in &candidates[1..] {
            if (other.0 - best.0).abs() > SOLUTION_TOLERANCE
                || (other.1 - best.1).abs() > SOLUTION_TOLERANCE
            {
                return Err(UploadError::Geometry(format!(
                    "point {point:?} does not lie in the image plane \
                     (solutions ({:.4}, {:.4}) and ({:.4}, {:.4}) disagree)",
                    best.0, best.1, other.0, other.1
                )));
            }
        }
        Ok(best)
    }
}

// Pixel-space points use x as the column and y as the row.
pub fn contour_to_pixels(
    points: &[[f64; 3]],
    space: CoordinateSpace,
    geometry: &FrameGeometry,
) -> Result<Vec<(f64, f64)>, UploadError> {
    match space {
        CoordinateSpace::Pixel => Ok(points.iter().map(|p| (p[0], p[1])).collect()),
        CoordinateSpace::Patient => points.iter().map(|p| geometry.to_image(*p)).collect(),
    }
}

// Even-odd fill, sampled at pixel centres, alpha-blended over the raster.
pub fn rasterize_contour(
    raster: &mut RgbaImage,
    points: &[[f64; 3]],
    space: CoordinateSpace,
    geometry: &FrameGeometry,
    colour: Rgba<u8>,
) -> Result<(), UploadError> {
    if points.len() < 3 {
        return Err(UploadError::Geometry(format!(
            "contour needs at least 3 points, got {}",
            points.len()
        )));
    }
    let polygon = contour_to_pixels(points, space, geometry)?;
    fill_polygon(raster, &polygon, colour);
    Ok(())
}

fn fill_polygon(raster: &mut RgbaImage, polygon: &[(f64, f64)], colour: Rgba<u8>) {
    let (width, height) = raster.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let min_row = polygon.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let max_row = polygon.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
    let first_row = min_row.ceil().max(0.0) as u32;
    let last_row = max_row.floor().min(f64::from(height - 1));
    if last_row < 0.0 {
        return;
    }
    let last_row = last_row as u32;

    let mut crossings: Vec<f64> = Vec::new();
    for row in first_row..=last_row {
        let y = f64::from(row);
        crossings.clear();
        for (index, &(x0, y0)) in polygon.iter().enumerate() {
            let (x1, y1) = polygon[(index + 1) % polygon.len()];
            // Half-open rule so shared vertices are counted once.
            if (y0 <= y && y < y1) || (y1 <= y && y < y0) {
                crossings.push(x0 + (y - y0) * (x1 - x0) / (y1 - y0));
            }
        }
        crossings.sort_by(f64::total_cmp);
        for span in crossings.chunks_exact(2) {
            let start = span[0].ceil().max(0.0);
            let end = span[1].floor().min(f64::from(width - 1));
            if end < start {
                continue;
            }
            for col in start as u32..=end as u32 {
                blend(raster.get_pixel_mut(col, row), colour);
            }
        }
    }
}

fn blend(pixel: &mut Rgba<u8>, colour: Rgba<u8>) {
    let alpha = u16::from(colour[3]);
    for channel in 0..3 {
        let base = u16::from(pixel[channel]);
        let over = u16::from(colour[channel]);
        pixel[channel] = ((over * alpha + base * (255 - alpha)) / 255) as u8;
    }
    pixel[3] = 255;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axial() -> FrameGeometry {
        FrameGeometry {
            pixel_spacing: [0.5, 0.5],
            direction_cosines: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            top_left_position: [-100.0, -120.0, 35.0],
            frame_of_reference_uid: "1.2.3".to_string(),
        }
    }

    fn oblique() -> FrameGeometry {
        let angle: f64 = 0.3;
        FrameGeometry {
            pixel_spacing: [0.8, 0.6],
            direction_cosines: [angle.cos(), angle.sin(), 0.0, 0.0, 0.2f64.cos(), -(0.2f64.sin())],
            top_left_position: [12.0, -40.5, 7.25],
            frame_of_reference_uid: "1.2.3".to_string(),
        }
    }

    #[test]
    fn forward_mapping_is_affine() {
        let point = axial().to_patient(10.0, 4.0);
        assert_eq!(point, [-95.0, -118.0, 35.0]);
    }

    #[test]
    fn round_trip_within_tolerance() {
        for geometry in [axial(), oblique()] {
            for (col, row) in [(0.0, 0.0), (511.0, 3.5), (17.25, 260.0), (-4.0, 12.0)] {
                let patient = geometry.to_patient(col, row);
                let (c, r) = geometry.to_image(patient).unwrap();
                assert!((c - col).abs() < SOLUTION_TOLERANCE, "{c} vs {col}");
                assert!((r - row).abs() < SOLUTION_TOLERANCE, "{r} vs {row}");
            }
        }
    }

    #[test]
    fn sagittal_plane_uses_non_degenerate_pair() {
        let geometry = FrameGeometry {
            pixel_spacing: [1.0, 1.0],
            direction_cosines: [0.0, 1.0, 0.0, 0.0, 0.0, -1.0],
            top_left_position: [5.0, -100.0, 100.0],
            frame_of_reference_uid: "1.2.3".to_string(),
        };
        let patient = geometry.to_patient(20.0, 30.0);
        let (col, row) = geometry.to_image(patient).unwrap();
        assert!((col - 20.0).abs() < SOLUTION_TOLERANCE);
        assert!((row - 30.0).abs() < SOLUTION_TOLERANCE);
    }

    #[test]
    fn off_plane_point_is_rejected() {
        let geometry = oblique();
        let mut patient = geometry.to_patient(10.0, 10.0);
        patient[2] += 5.0;
        assert!(matches!(geometry.to_image(patient), Err(UploadError::Geometry(_))));
    }

    #[test]
    fn degenerate_cosines_are_rejected() {
        let geometry = FrameGeometry {
            direction_cosines: [1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            ..axial()
        };
        assert!(matches!(
            geometry.to_image([0.0, 0.0, 0.0]),
            Err(UploadError::Geometry(_))
        ));
    }

    #[test]
    fn fills_square_in_pixel_space() {
        let mut raster = RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255]));
        let square = [[2.0, 2.0, 0.0], [5.0, 2.0, 0.0], [5.0, 5.0, 0.0], [2.0, 5.0, 0.0]];
        rasterize_contour(
            &mut raster,
            &square,
            CoordinateSpace::Pixel,
            &axial(),
            Rgba([255, 0, 0, 255]),
        )
        .unwrap();
        assert_eq!(raster.get_pixel(3, 3), &Rgba([255, 0, 0, 255]));
        assert_eq!(raster.get_pixel(2, 2), &Rgba([255, 0, 0, 255]));
        assert_eq!(raster.get_pixel(0, 0), &Rgba([0, 0, 0, 255]));
        assert_eq!(raster.get_pixel(6, 3), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn patient_contour_lands_on_mapped_pixels() {
        let geometry = axial();
        let corners = [(1.0, 1.0), (4.0, 1.0), (4.0, 4.0), (1.0, 4.0)];
        let points: Vec<[f64; 3]> = corners
            .iter()
            .map(|&(c, r)| geometry.to_patient(c, r))
            .collect();
        let mut raster = RgbaImage::from_pixel(6, 6, Rgba([0, 0, 0, 255]));
        rasterize_contour(
            &mut raster,
            &points,
            CoordinateSpace::Patient,
            &geometry,
            Rgba([0, 255, 0, 255]),
        )
        .unwrap();
        assert_eq!(raster.get_pixel(2, 2), &Rgba([0, 255, 0, 255]));
        assert_eq!(raster.get_pixel(5, 5), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn too_few_points_is_a_geometry_error() {
        let mut raster = RgbaImage::new(4, 4);
        let result = rasterize_contour(
            &mut raster,
            &[[0.0, 0.0, 0.0], [1.0, 1.0, 0.0]],
            CoordinateSpace::Pixel,
            &axial(),
            Rgba([255, 0, 0, 128]),
        );
        assert!(matches!(result, Err(UploadError::Geometry(_))));
    }
}
