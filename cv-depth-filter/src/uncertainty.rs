use core::f64::consts::PI;
use cv_core::nalgebra::Vector3;
use cv_core::CameraToCamera;

/// Smallest depth used when converting the depth interval `z ± tau` to inverse depth.
const MIN_DEPTH: f64 = 0.0000001;

/// The angle subtended by `pixel_noise` pixels at the center of an image with the given focal length.
///
/// This uses the law of chords: `2 * atan(pixel_noise / (2 * focal_length))`.
pub fn pixel_error_angle(pixel_noise: f64, focal_length: f64) -> f64 {
    2.0 * (pixel_noise / (2.0 * focal_length)).atan()
}

/// Computes how far the depth of a triangulated point moves when its observation in the
/// current camera is perturbed by `px_error_angle`.
///
/// * `pose` transforms points from the current camera into the reference camera, so its
///   translation is the optical center of the current camera in the reference frame.
/// * `bearing` is the direction of the point from the reference camera. It does not need to be normalized.
/// * `depth` is the distance of the point from the reference camera along `bearing`.
///
/// The reference ray, the baseline, and the ray from the current camera form a triangle. The
/// angle at the current camera is widened by `px_error_angle` and the law of sines gives the
/// perturbed depth. The result is not finite if the baseline is zero or the rays are parallel.
///
/// ```
/// use cv_core::nalgebra::{Rotation3, Vector3};
/// use cv_core::{CameraToCamera, Pose};
/// use cv_depth_filter::compute_tau;
///
/// let pose = CameraToCamera::from_parts(Vector3::new(0.2, 0.0, 0.0), Rotation3::identity());
/// let bearing = Vector3::z();
/// assert!(compute_tau(pose, &bearing, 2.0, 0.0).abs() < 1e-9);
/// assert!(compute_tau(pose, &bearing, 2.0, 0.002) > 0.0);
/// ```
pub fn compute_tau(
    pose: CameraToCamera,
    bearing: &Vector3<f64>,
    depth: f64,
    px_error_angle: f64,
) -> f64 {
    let t = pose.0.translation.vector;
    let f = bearing.normalize();
    let a = f * depth - t;
    let t_norm = t.norm();
    let a_norm = a.norm();
    let alpha = (f.dot(&t) / t_norm).acos();
    let beta = (a.dot(&-t) / (t_norm * a_norm)).acos();
    let beta_plus = beta + px_error_angle;
    // Triangle angles sum to PI.
    let gamma_plus = PI - alpha - beta_plus;
    // Law of sines.
    let z_plus = t_norm * beta_plus.sin() / gamma_plus.sin();
    z_plus - depth
}

/// Converts the depth uncertainty `tau` at `depth` into a standard deviation of inverse depth.
///
/// Square the result to get the measurement variance fed to [`update_seed`](crate::update_seed).
pub fn inverse_depth_deviation(depth: f64, tau: f64) -> f64 {
    0.5 * ((depth - tau).max(MIN_DEPTH).recip() - (depth + tau).recip())
}
