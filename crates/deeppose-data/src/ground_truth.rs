//! Ground-truth belief maps and vector fields.
//!
//! Targets live on the backbone output grid (image size / stride). For
//! each of the 8 projected cuboid vertices there is one Gaussian belief map
//! and one 2-channel vector field pointing at the object centroid; a ninth
//! belief map marks the centroid itself.

use candle_core::{Device, Tensor};
use deeppose_core::{
    centroid, cuboid_vertices, project_points, CameraIntrinsics, Error, ObjectModel, ObjectPose,
    PoseAnnotation, Result, AFFINITY_CHANNELS, BELIEF_CHANNELS, CUBOID_VERTICES, TARGET_CHANNELS,
};
use nalgebra::Point2;
use ndarray::{s, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

/// 2D isotropic Gaussian on an integer grid, peak value 1 at `center`
///
/// # Arguments
/// * `center` - (x, y) in grid coordinates
/// * `sigma` - Standard deviation in grid cells
/// * `size` - (height, width) of the grid
pub fn gaussian_heatmap(center: (f64, f64), sigma: f64, size: (usize, usize)) -> Array2<f32> {
    let (cx, cy) = center;
    let denom = 2.0 * sigma * sigma;

    Array2::from_shape_fn(size, |(y, x)| {
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        (-(dx * dx + dy * dy) / denom).exp() as f32
    })
}

/// Unit vectors toward `centroid` for grid cells within `radius` of `vertex`
///
/// Cells outside the radius, and a cell sitting exactly on the centroid,
/// stay zero.
///
/// # Returns
/// (x components, y components), each of shape (height, width)
pub fn vector_field(
    vertex: (f64, f64),
    centroid: (f64, f64),
    size: (usize, usize),
    radius: f64,
) -> (Array2<f32>, Array2<f32>) {
    let mut field_x = Array2::<f32>::zeros(size);
    let mut field_y = Array2::<f32>::zeros(size);

    for ((y, x), (fx, fy)) in field_x
        .indexed_iter_mut()
        .zip(field_y.iter_mut())
        .map(|((idx, fx), fy)| (idx, (fx, fy)))
    {
        let (px, py) = (x as f64, y as f64);
        let distance = ((px - vertex.0).powi(2) + (py - vertex.1).powi(2)).sqrt();
        if distance > radius {
            continue;
        }

        let vx = centroid.0 - px;
        let vy = centroid.1 - py;
        let magnitude = (vx * vx + vy * vy).sqrt();
        if magnitude > 0.0 {
            *fx = (vx / magnitude) as f32;
            *fy = (vy / magnitude) as f32;
        }
    }

    (field_x, field_y)
}

/// Target generation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthGenerator {
    /// Downsampling between image and target grid
    pub stride: usize,
    /// Gaussian sigma in grid cells
    pub sigma: f64,
    /// Vector field radius in grid cells
    pub radius: f64,
}

impl Default for GroundTruthGenerator {
    fn default() -> Self {
        Self {
            stride: 8,
            sigma: 2.0,
            radius: 3.0,
        }
    }
}

impl GroundTruthGenerator {
    /// Target grid (height, width) for an image
    pub fn grid_size(&self, image_height: u32, image_width: u32) -> (usize, usize) {
        (
            image_height as usize / self.stride,
            image_width as usize / self.stride,
        )
    }

    /// Build belief maps and vector fields for one annotated object
    pub fn generate(
        &self,
        image_height: u32,
        image_width: u32,
        annotation: &PoseAnnotation,
        model: &ObjectModel,
    ) -> Result<GroundTruth> {
        if self.stride == 0 {
            return Err(Error::InvalidInput("ground-truth stride must be positive".into()));
        }
        if !(self.sigma > 0.0 && self.sigma.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "ground-truth sigma must be positive, got {}",
                self.sigma
            )));
        }
        if !(self.radius >= 0.0 && self.radius.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "vector field radius must be non-negative, got {}",
                self.radius
            )));
        }

        let size = self.grid_size(image_height, image_width);
        let camera = CameraIntrinsics::new(annotation.intrinsics());
        let pose = ObjectPose::from_annotation(annotation);
        let projected = project_points(&camera, &pose, &cuboid_vertices(model))?;
        let center = centroid(&projected)
            .ok_or_else(|| Error::InvalidInput("no projected vertices".into()))?;

        let stride = self.stride as f64;
        let to_grid = |p: &Point2<f64>| ((p.x / stride).floor(), (p.y / stride).floor());
        let grid_center = to_grid(&center);

        let mut belief = Array3::<f32>::zeros((BELIEF_CHANNELS, size.0, size.1));
        let mut affinity = Array3::<f32>::zeros((AFFINITY_CHANNELS, size.0, size.1));

        for (i, vertex) in projected.iter().enumerate() {
            let grid_vertex = to_grid(vertex);
            belief
                .index_axis_mut(Axis(0), i)
                .assign(&gaussian_heatmap(grid_vertex, self.sigma, size));

            let (fx, fy) = vector_field(grid_vertex, grid_center, size, self.radius);
            affinity.index_axis_mut(Axis(0), 2 * i).assign(&fx);
            affinity.index_axis_mut(Axis(0), 2 * i + 1).assign(&fy);
        }

        belief
            .index_axis_mut(Axis(0), CUBOID_VERTICES)
            .assign(&gaussian_heatmap(grid_center, self.sigma, size));

        Ok(GroundTruth {
            belief,
            affinity,
            projected,
            centroid: center,
        })
    }
}

/// Targets for one object instance
#[derive(Debug, Clone)]
pub struct GroundTruth {
    /// Belief maps [9, h, w]
    pub belief: Array3<f32>,
    /// Vector fields [16, h, w]; channel 2i is x, 2i+1 is y for vertex i
    pub affinity: Array3<f32>,
    /// Projected cuboid vertices in image pixels
    pub projected: Vec<Point2<f64>>,
    /// Centroid of the projected vertices in image pixels
    pub centroid: Point2<f64>,
}

impl GroundTruth {
    /// Belief maps followed by vector fields, [25, h, w]
    pub fn stacked(&self) -> Array3<f32> {
        let (_, h, w) = self.belief.dim();
        let mut out = Array3::<f32>::zeros((TARGET_CHANNELS, h, w));
        out.slice_mut(s![..BELIEF_CHANNELS, .., ..])
            .assign(&self.belief);
        out.slice_mut(s![BELIEF_CHANNELS.., .., ..])
            .assign(&self.affinity);
        out
    }

    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        let stacked = self.stacked();
        let dims = stacked.dim();
        let data: Vec<f32> = stacked.iter().copied().collect();
        Tensor::from_vec(data, dims, device)
    }
}
