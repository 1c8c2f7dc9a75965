use ash::vk;
use glam::{Affine3A, Mat4, Vec3};

/// Converts a world transform into the row-major 3x4 matrix stored in TLAS instance records.
///
/// The projective row of `transform` is ignored.
pub fn mat4_to_vk_transform(transform: &Mat4) -> vk::TransformMatrixKHR {
    let affine = Affine3A::from_mat4(*transform);
    let x = &affine.matrix3.x_axis;
    let y = &affine.matrix3.y_axis;
    let z = &affine.matrix3.z_axis;
    let w = &affine.translation;
    vk::TransformMatrixKHR {
        // row major
        matrix: [x.x, y.x, z.x, w.x, x.y, y.y, z.y, w.y, x.z, y.z, z.z, w.z],
    }
}

/// Rec. 709 relative luminance.
pub fn luminance(color: Vec3) -> f32 {
    0.2126 * color.x + 0.7152 * color.y + 0.0722 * color.z
}

/// Rounds `value` up to a multiple of `alignment`. `alignment` must be non-zero.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    value.next_multiple_of(alignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn test_transform_rows() {
        let transform = Mat4::from_scale_rotation_translation(
            Vec3::new(2.0, 3.0, 4.0),
            Quat::IDENTITY,
            Vec3::new(5.0, 6.0, 7.0),
        );
        let vk_transform = mat4_to_vk_transform(&transform);
        assert_eq!(
            vk_transform.matrix,
            [2.0, 0.0, 0.0, 5.0, 0.0, 3.0, 0.0, 6.0, 0.0, 0.0, 4.0, 7.0]
        );
    }

    #[test]
    fn test_luminance_of_white_is_one() {
        assert!((luminance(Vec3::ONE) - 1.0).abs() < 1e-6);
        assert_eq!(luminance(Vec3::ZERO), 0.0);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(0, 256), 0);
    }
}
