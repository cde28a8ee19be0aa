//! Math type re-exports and the packed instance transform.
//!
//! Scene transforms are glam's column-major `Mat4`. Acceleration structure
//! instances store a row-major 3x4 affine matrix instead; the fourth row
//! `(0, 0, 0, 1)` is implicit.

pub use glam::{Affine3A, Mat3, Mat4, Quat, Vec3, Vec4};

use bytemuck::{Pod, Zeroable};

/// Row-major 3x4 affine transform, as consumed by the instance layout.
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct TransformMatrix {
    pub matrix: [[f32; 4]; 3],
}

impl TransformMatrix {
    pub const IDENTITY: Self = Self {
        matrix: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    /// Pack a column-major 4x4 matrix. The bottom row is dropped.
    pub fn from_mat4(m: &Mat4) -> Self {
        let cols = m.to_cols_array_2d();
        let mut matrix = [[0.0f32; 4]; 3];
        for (row, out_row) in matrix.iter_mut().enumerate() {
            for (col, value) in out_row.iter_mut().enumerate() {
                *value = cols[col][row];
            }
        }
        Self { matrix }
    }

    /// Expand back into a 4x4 matrix with `(0, 0, 0, 1)` as the bottom row.
    pub fn to_mat4(&self) -> Mat4 {
        let m = &self.matrix;
        Mat4::from_cols_array_2d(&[
            [m[0][0], m[1][0], m[2][0], 0.0],
            [m[0][1], m[1][1], m[2][1], 0.0],
            [m[0][2], m[1][2], m[2][2], 0.0],
            [m[0][3], m[1][3], m[2][3], 1.0],
        ])
    }

    /// Translation column.
    #[inline]
    pub fn translation(&self) -> Vec3 {
        Vec3::new(self.matrix[0][3], self.matrix[1][3], self.matrix[2][3])
    }
}

impl Default for TransformMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<Mat4> for TransformMatrix {
    fn from(m: Mat4) -> Self {
        Self::from_mat4(&m)
    }
}
