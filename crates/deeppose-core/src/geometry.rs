//! Camera geometry for projecting object cuboids into image space.

use nalgebra::{Matrix3, Matrix3x4, Point2, Point3, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{ObjectModel, PoseAnnotation, CUBOID_VERTICES};

const MIN_DEPTH: f64 = 1e-12;

/// Pinhole camera intrinsics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub matrix: Matrix3<f64>,
}

impl CameraIntrinsics {
    pub fn new(matrix: Matrix3<f64>) -> Self {
        Self { matrix }
    }

    pub fn from_focal(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            matrix: Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0),
        }
    }
}

/// Rigid model-to-camera transform
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectPose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl ObjectPose {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn from_annotation(annotation: &PoseAnnotation) -> Self {
        Self::new(annotation.rotation(), annotation.translation())
    }

    /// The 3x4 matrix [R | t]
    pub fn extrinsics(&self) -> Matrix3x4<f64> {
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.set_column(3, &self.translation);
        m
    }

    /// Full projection matrix K [R | t]
    pub fn projection(&self, camera: &CameraIntrinsics) -> Matrix3x4<f64> {
        camera.matrix * self.extrinsics()
    }
}

/// Corners of the object's bounding cuboid.
///
/// Order: min, +x, +y, +z, +x+y, +x+z, +y+z, +x+y+z. Belief map channels
/// and vector field pairs follow the same order.
pub fn cuboid_vertices(model: &ObjectModel) -> [Point3<f64>; CUBOID_VERTICES] {
    let base = model.min_corner();
    let size = model.extents();
    let dx = Vector3::new(size.x, 0.0, 0.0);
    let dy = Vector3::new(0.0, size.y, 0.0);
    let dz = Vector3::new(0.0, 0.0, size.z);

    [
        base,
        base + dx,
        base + dy,
        base + dz,
        base + dx + dy,
        base + dx + dz,
        base + dy + dz,
        base + dx + dy + dz,
    ]
    .map(Point3::from)
}

/// Project model-space points to pixel coordinates
pub fn project_points(
    camera: &CameraIntrinsics,
    pose: &ObjectPose,
    points: &[Point3<f64>],
) -> Result<Vec<Point2<f64>>> {
    let projection = pose.projection(camera);

    points
        .iter()
        .enumerate()
        .map(|(index, p)| {
            let h = projection * Vector4::new(p.x, p.y, p.z, 1.0);
            if h.z.abs() < MIN_DEPTH {
                return Err(Error::DegenerateProjection { index });
            }
            Ok(Point2::new(h.x / h.z, h.y / h.z))
        })
        .collect()
}

/// Mean of a set of 2D points
pub fn centroid(points: &[Point2<f64>]) -> Option<Point2<f64>> {
    if points.is_empty() {
        return None;
    }

    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));

    Some(Point2::new(sx / n, sy / n))
}
