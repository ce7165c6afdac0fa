//! Planar projective mapping from simulator space to display space.
//!
//! The transform is fitted once at startup from four hand-picked point
//! correspondences and then applied to every ingested position. Fitting solves
//! the usual 8-unknown homography system with `H[2][2] = 1`, after shifting and
//! scaling both point sets so that raw simulator coordinates in the millions do
//! not wreck the conditioning of the system.

use crate::error::{RelayError, Result};
use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};
use shared::Point2D;
use std::path::Path;

/// Singular values below this (on the normalized system) count as zero.
const RANK_EPSILON: f64 = 1e-10;
/// Minimum twice-triangle-area between normalized points.
const COLLINEAR_EPSILON: f64 = 1e-9;
/// Homogeneous scale below which a point is considered at infinity.
const PROJECTION_EPSILON: f64 = 1e-12;

/// Four source/target correspondences, as stored in a calibration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub source: [[f64; 2]; 4],
    pub target: [[f64; 2]; 4],
}

impl Calibration {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn fit(&self) -> Result<CoordinateMapper> {
        CoordinateMapper::fit(&to_points(&self.source), &to_points(&self.target))
    }
}

fn to_points(raw: &[[f64; 2]; 4]) -> [Point2D; 4] {
    raw.map(|[x, y]| Point2D::new(x, y))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateMapper {
    matrix: Matrix3<f64>,
}

impl Default for CoordinateMapper {
    fn default() -> Self {
        Self::identity()
    }
}

impl CoordinateMapper {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
        }
    }

    pub fn from_matrix(matrix: Matrix3<f64>) -> Self {
        Self { matrix }
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Fits the homography mapping each `src[i]` onto `dst[i]`.
    ///
    /// Fails with `DegenerateConfiguration` when points repeat, when any three
    /// points of either set are collinear, or when the linear system is rank
    /// deficient.
    pub fn fit(src: &[Point2D; 4], dst: &[Point2D; 4]) -> Result<Self> {
        check_distinct(src, "source")?;
        check_distinct(dst, "target")?;

        let (t_src, n_src) = normalize(src)?;
        let (t_dst, n_dst) = normalize(dst)?;
        check_not_collinear(&n_src, "source")?;
        check_not_collinear(&n_dst, "target")?;

        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();
        for i in 0..4 {
            let (x, y) = (n_src[i].x, n_src[i].y);
            let (u, v) = (n_dst[i].x, n_dst[i].y);

            let r = 2 * i;
            a[(r, 0)] = x;
            a[(r, 1)] = y;
            a[(r, 2)] = 1.0;
            a[(r, 6)] = -u * x;
            a[(r, 7)] = -u * y;
            b[r] = u;

            a[(r + 1, 3)] = x;
            a[(r + 1, 4)] = y;
            a[(r + 1, 5)] = 1.0;
            a[(r + 1, 6)] = -v * x;
            a[(r + 1, 7)] = -v * y;
            b[r + 1] = v;
        }

        let svd = a.svd(true, true);
        if svd.rank(RANK_EPSILON) < 8 {
            return Err(RelayError::degenerate("correspondence system is singular"));
        }
        let h = svd
            .solve(&b, RANK_EPSILON)
            .map_err(|e| RelayError::degenerate(e.to_string()))?;

        let normalized = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
        let t_dst_inv = t_dst
            .try_inverse()
            .ok_or_else(|| RelayError::degenerate("target normalization is not invertible"))?;

        let mut matrix = t_dst_inv * normalized * t_src;
        let scale = matrix[(2, 2)];
        if scale.abs() < PROJECTION_EPSILON {
            return Err(RelayError::degenerate("transform cannot be scaled to H[2][2] = 1"));
        }
        matrix /= scale;
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(RelayError::degenerate("transform has non-finite entries"));
        }

        Ok(Self { matrix })
    }

    /// Maps `p` through the transform with a perspective divide.
    ///
    /// Fails with `SingularProjection` when the point lands on the vanishing
    /// line or either mapped coordinate overflows to a non-finite value.
    pub fn apply(&self, p: Point2D) -> Result<Point2D> {
        let v = self.matrix * Vector3::new(p.x, p.y, 1.0);
        if v.z.abs() < PROJECTION_EPSILON || !v.z.is_finite() {
            return Err(RelayError::SingularProjection { x: p.x, y: p.y });
        }
        let mapped = Point2D::new(v.x / v.z, v.y / v.z);
        if !mapped.x.is_finite() || !mapped.y.is_finite() {
            return Err(RelayError::SingularProjection { x: p.x, y: p.y });
        }
        Ok(mapped)
    }
}

fn check_distinct(points: &[Point2D; 4], label: &str) -> Result<()> {
    for i in 0..4 {
        for j in (i + 1)..4 {
            if points[i] == points[j] {
                return Err(RelayError::degenerate(format!(
                    "{} points {} and {} coincide",
                    label, i, j
                )));
            }
        }
    }
    Ok(())
}

/// Similarity transform moving the centroid to the origin with mean distance
/// sqrt(2), and the transformed points.
fn normalize(points: &[Point2D; 4]) -> Result<(Matrix3<f64>, [Point2D; 4])> {
    let cx = points.iter().map(|p| p.x).sum::<f64>() / 4.0;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / 4.0;
    let centroid = Point2D::new(cx, cy);
    let mean_dist = points.iter().map(|p| p.distance(&centroid)).sum::<f64>() / 4.0;
    if !mean_dist.is_finite() || mean_dist <= f64::EPSILON {
        return Err(RelayError::degenerate("points have no spatial extent"));
    }

    let s = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = points.map(|p| Point2D::new(s * (p.x - cx), s * (p.y - cy)));
    Ok((t, normalized))
}

fn check_not_collinear(points: &[Point2D; 4], label: &str) -> Result<()> {
    for (i, j, k) in [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)] {
        let ab = points[j].sub(&points[i]);
        let ac = points[k].sub(&points[i]);
        let cross = ab.x * ac.y - ab.y * ac.x;
        if cross.abs() < COLLINEAR_EPSILON {
            return Err(RelayError::degenerate(format!(
                "{} points {}, {} and {} are collinear",
                label, i, j, k
            )));
        }
    }
    Ok(())
}
