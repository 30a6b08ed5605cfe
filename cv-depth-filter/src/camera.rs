use cv_core::nalgebra::{Point2, Point3, Unit, Vector3};
use cv_core::{Bearing, CameraModel, KeyPoint};
use cv_pinhole::{CameraIntrinsics, NormalizedKeyPoint};

/// The projection model the depth filter needs from a camera.
///
/// Camera space follows the `cv-core` convention: X is right, Y is down and Z is forwards
/// from the optical center. Pixel coordinates share the X-right, Y-down orientation.
pub trait Camera {
    /// Converts a pixel into a unit bearing pointing out of the optical center.
    fn unproject(&self, keypoint: KeyPoint) -> Unit<Vector3<f64>>;

    /// Projects a point in camera space onto the image.
    ///
    /// Returns `None` if the point cannot be projected (for a pinhole, if it is not in front of the camera).
    fn project(&self, point: &Point3<f64>) -> Option<KeyPoint>;

    /// The focal length in pixels, used to convert pixel noise into angular noise.
    fn focal_length(&self) -> f64;

    /// Checks that a pixel lies inside the image with at least `margin` pixels to every border.
    fn in_bounds(&self, keypoint: KeyPoint, margin: f64) -> bool;
}

/// A distortion-free pinhole camera with a finite image.
///
/// ```
/// use cv_core::KeyPoint;
/// use cv_core::nalgebra::{Point2, Point3};
/// use cv_depth_filter::{Camera, PinholeCamera};
///
/// let camera = PinholeCamera::centered(500.0, 640, 480);
/// let point = Point3::new(0.2, -0.1, 2.0);
/// let keypoint = camera.project(&point).unwrap();
/// assert!(camera.in_bounds(keypoint, 10.0));
///
/// // The bearing of the projection points back at the original point.
/// let bearing = camera.unproject(keypoint);
/// let distance = (bearing.into_inner() * point.coords.norm() - point.coords).norm();
/// assert!(distance < 1e-9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct PinholeCamera {
    pub intrinsics: CameraIntrinsics,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
}

impl PinholeCamera {
    pub fn new(intrinsics: CameraIntrinsics, width: u32, height: u32) -> Self {
        Self {
            intrinsics,
            width,
            height,
        }
    }

    /// Creates a camera with square pixels, no skew, and the principal point in the center of the image.
    pub fn centered(focal: f64, width: u32, height: u32) -> Self {
        let intrinsics = CameraIntrinsics::identity()
            .focal(focal)
            .principal_point(Point2::new(
                width as f64 / 2.0 - 0.5,
                height as f64 / 2.0 - 0.5,
            ));
        Self::new(intrinsics, width, height)
    }
}

impl Camera for PinholeCamera {
    fn unproject(&self, keypoint: KeyPoint) -> Unit<Vector3<f64>> {
        self.intrinsics.calibrate(keypoint).bearing()
    }

    fn project(&self, point: &Point3<f64>) -> Option<KeyPoint> {
        if point.z <= 0.0 {
            return None;
        }
        let normalized = NormalizedKeyPoint::from_bearing_vector(point.coords);
        Some(self.intrinsics.uncalibrate(normalized))
    }

    /// Uses the mean of the two focal lengths.
    fn focal_length(&self) -> f64 {
        0.5 * (self.intrinsics.focals.x + self.intrinsics.focals.y)
    }

    fn in_bounds(&self, keypoint: KeyPoint, margin: f64) -> bool {
        let KeyPoint(point) = keypoint;
        point.x >= margin
            && point.y >= margin
            && point.x < self.width as f64 - margin
            && point.y < self.height as f64 - margin
    }
}
