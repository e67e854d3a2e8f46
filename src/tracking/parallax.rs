//! Pixel parallax between the current frame and a reference keyframe.

use crate::camera::CameraModel;
use crate::map::{Frame, KeyFrameId, MapStore};

/// Compute the parallax of the current frame against a reference keyframe.
///
/// For every keypoint present in both frames (optionally restricted to 2D
/// keypoints) the pixel distance is measured between the undistorted pixel
/// in the reference keyframe and either the undistorted pixel in the
/// current frame or, with `compensate_rotation`, the projection into the
/// reference keyframe of the bearing rotated by the relative rotation
/// `R_ref_from_cur` (so pure rotation contributes no parallax).
///
/// Returns the median (default) or mean; 0 when no common keypoints exist.
pub fn compute_parallax(
    store: &MapStore,
    ref_kfid: KeyFrameId,
    cur: &Frame,
    camera: &CameraModel,
    compensate_rotation: bool,
    only_2d: bool,
    use_median: bool,
) -> f64 {
    let Some(ref_kf) = store.get_keyframe(ref_kfid) else {
        return 0.0;
    };

    let rot_ref_cur = ref_kf.t_cw().rotation * cur.t_wc().rotation;

    let mut distances: Vec<f64> = Vec::with_capacity(cur.nb_keypoints);
    for kp in cur.keypoints() {
        if only_2d && kp.is_3d {
            continue;
        }
        let Some(ref_kp) = ref_kf.get_keypoint(kp.id) else {
            continue;
        };

        let dist = if compensate_rotation {
            let rotated = rot_ref_cur * kp.bearing;
            if rotated.z <= 0.0 {
                continue;
            }
            (ref_kp.unpx - camera.project_undistort(&rotated)).norm()
        } else {
            (ref_kp.unpx - kp.unpx).norm()
        };
        distances.push(dist);
    }

    if distances.is_empty() {
        return 0.0;
    }

    if use_median {
        let mid = distances.len() / 2;
        distances.select_nth_unstable_by(mid, |a, b| a.partial_cmp(b).expect("no NaN parallax"));
        distances[mid]
    } else {
        distances.iter().sum::<f64>() / distances.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModel;
    use crate::geometry::SE3;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector2, Vector3};

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480)
    }

    fn store_with_keyframe(pixels: &[(f64, f64)]) -> (MapStore, KeyFrameId) {
        let mut store = MapStore::new(camera(), None);
        store.begin_frame(0.0);
        let detections: Vec<_> = pixels
            .iter()
            .map(|&(x, y)| (Vector2::new(x, y), None))
            .collect();
        let kfid = store.create_keyframe(&detections);
        (store, kfid)
    }

    #[test]
    fn test_identical_frames_have_zero_parallax() {
        let (store, kfid) = store_with_keyframe(&[(100.0, 100.0), (200.0, 150.0), (300.0, 50.0)]);
        let cur = store.current_frame();

        let parallax = compute_parallax(&store, kfid, cur, store.camera_left(), false, false, true);
        assert_relative_eq!(parallax, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_shifted_pixels_give_median_distance() {
        let (mut store, kfid) = store_with_keyframe(&[(100.0, 100.0), (200.0, 150.0)]);
        store.begin_frame(0.1);

        let ids: Vec<_> = store.current_frame().keypoint_ids().collect();
        for id in &ids {
            let px = store.current_frame().get_keypoint(*id).unwrap().px;
            store.update_keypoint(*id, px + Vector2::new(5.0, 0.0));
        }

        let parallax = compute_parallax(
            &store,
            kfid,
            store.current_frame(),
            store.camera_left(),
            false,
            false,
            true,
        );
        assert_relative_eq!(parallax, 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_rotation_compensation_cancels_pure_rotation() {
        let (mut store, kfid) = store_with_keyframe(&[(250.0, 200.0), (350.0, 280.0)]);
        store.begin_frame(0.1);

        // Rotate the camera without translating; shift the observed pixels
        // to where the rotated bearings actually project.
        let rot = UnitQuaternion::from_euler_angles(0.0, 0.02, 0.0);
        store.set_current_pose(SE3::from_parts(rot, Vector3::zeros()));

        let camera = store.camera_left().clone();
        let ids: Vec<_> = store.current_frame().keypoint_ids().collect();
        for id in &ids {
            let ref_bearing = store.get_keypoint(kfid, *id).unwrap().bearing;
            // Bearing as seen from the rotated camera.
            let new_px = camera.project_undistort(&(rot.inverse() * ref_bearing));
            store.update_keypoint(*id, new_px);
        }

        let compensated = compute_parallax(
            &store,
            kfid,
            store.current_frame(),
            &camera,
            true,
            false,
            true,
        );
        let raw = compute_parallax(
            &store,
            kfid,
            store.current_frame(),
            &camera,
            false,
            false,
            true,
        );

        assert_relative_eq!(compensated, 0.0, epsilon = 1e-6);
        assert!(raw > 1.0);
    }

    #[test]
    fn test_no_common_keypoints_returns_zero() {
        let (mut store, kfid) = store_with_keyframe(&[(100.0, 100.0)]);
        store.begin_frame(0.1);
        let ids: Vec<_> = store.current_frame().keypoint_ids().collect();
        for id in ids {
            store.remove_obs_from_current_frame(id);
        }

        let parallax = compute_parallax(
            &store,
            kfid,
            store.current_frame(),
            store.camera_left(),
            false,
            false,
            true,
        );
        assert_eq!(parallax, 0.0);
    }
}
