//! Stereo and temporal triangulation of 2D keypoints.
//!
//! Both stages run on the mapper thread under the map write lock. They
//! promote 2D map points to 3D when the geometry checks out, drop
//! observations on confident failures, and leave ambiguous (low-parallax)
//! keypoints untouched so a later keyframe can retry them.

use std::collections::HashMap;

use nalgebra::{Vector2, Vector3};
use tracing::warn;

use crate::geometry::{projection_matrix, triangulate_linear, SE3};
use crate::map::{KeyFrameId, KeypointId, MapStore};

use super::MapperError;

/// Minimum depth (meters) accepted by the stereo step.
const MIN_STEREO_DEPTH: f64 = 0.1;

/// Temporal rejections are only acted on above this parallax; below it
/// the observation is kept 2D for a retry on a later keyframe.
const REJECTION_PARALLAX_PX: f64 = 20.0;

/// Triangulate the stereo-paired keypoints of a keyframe.
///
/// For each unresolved stereo keypoint the point is triangulated from the
/// undistorted pixel pair against the left camera and the right camera's
/// rigid extrinsic. Rejected pairings (shallow depth or reprojection
/// error in either view) lose their stereo pairing but keep the 2D
/// keypoint. Returns the number of promoted map points.
pub fn triangulate_stereo(
    store: &mut MapStore,
    kfid: KeyFrameId,
    max_reprojection_error: f64,
) -> Result<usize, MapperError> {
    let right_cam = store
        .camera_right()
        .cloned()
        .ok_or(MapperError::MissingRightCamera)?;
    let left_cam = store.camera_left().clone();

    let kf = store
        .get_keyframe(kfid)
        .ok_or(MapperError::MissingKeyframe(kfid))?;
    let t_wc = kf.t_wc().clone();

    let candidates: Vec<(KeypointId, Vector2<f64>, Vector2<f64>)> = kf
        .keypoints()
        .filter(|kp| !kp.is_3d)
        .filter_map(|kp| kp.rpx.map(|rpx| (kp.id, kp.unpx, rpx)))
        .collect();

    let t_right_ref = right_cam.t_cam_ref().clone();
    let p_left = projection_matrix(&SE3::identity());
    let p_right = projection_matrix(&t_right_ref);

    let mut nb_promoted = 0;
    for (kpid, unpx, rpx) in candidates {
        let run_px = right_cam.undistort_px(&rpx);
        let x_left = left_cam.normalized_coords(&unpx);
        let x_right = right_cam.normalized_coords(&run_px);

        let mut accepted = false;
        if let Some(p_ref) = triangulate_linear(&x_left, &x_right, &p_left, &p_right) {
            let p_right_cam = t_right_ref.transform_point(&p_ref);
            let good = p_ref.z >= MIN_STEREO_DEPTH
                && p_right_cam.z >= MIN_STEREO_DEPTH
                && (left_cam.project_undistort(&p_ref) - unpx).norm() <= max_reprojection_error
                && (right_cam.project_undistort(&p_right_cam) - run_px).norm()
                    <= max_reprojection_error;
            if good {
                store.update_mappoint(kpid, t_wc.transform_point(&p_ref));
                nb_promoted += 1;
                accepted = true;
            }
        }

        if !accepted {
            store.remove_stereo_keypoint(kfid, kpid);
        }
    }

    Ok(nb_promoted)
}

/// What the temporal stage decided for one keypoint.
enum TemporalAction {
    Promote(KeypointId, Vector3<f64>),
    DropObservation(KeypointId),
    /// The first observer vanished underneath us; heal the link.
    RepairObserver(KeypointId, KeyFrameId),
}

/// Triangulate a keyframe's 2D keypoints against their first observer.
///
/// The relative pose to each first observer is cached so consecutive
/// keypoints anchored in the same keyframe reuse it. An observation is
/// dropped only when the parallax exceeds [`REJECTION_PARALLAX_PX`] and
/// the geometry still fails (negative depth in either view, or
/// reprojection error above the threshold); low-parallax failures are
/// left for a later retry. Returns the number of promoted map points.
pub fn triangulate_temporal(
    store: &mut MapStore,
    kfid: KeyFrameId,
    max_reprojection_error: f64,
) -> Result<usize, MapperError> {
    let camera = store.camera_left().clone();

    let kf = store
        .get_keyframe(kfid)
        .ok_or(MapperError::MissingKeyframe(kfid))?;
    let t_wc = kf.t_wc().clone();

    let candidates: Vec<(KeypointId, Vector2<f64>, Vector3<f64>)> = kf
        .keypoints()
        .filter(|kp| !kp.is_3d)
        .map(|kp| (kp.id, kp.unpx, kp.bearing))
        .collect();

    // rel maps current-camera points into the observer camera; keyed by
    // observer so runs of keypoints sharing an anchor reuse it.
    let mut rel_cache: HashMap<KeyFrameId, (SE3, SE3)> = HashMap::new();
    let p_anchor = projection_matrix(&SE3::identity());

    let mut actions: Vec<TemporalAction> = Vec::new();

    for (kpid, unpx, bearing) in candidates {
        let Some(mp) = store.get_mappoint(kpid) else {
            continue;
        };
        if mp.nb_observers() < 2 {
            continue;
        }
        let Some(obs_id) = mp.first_observer() else {
            continue;
        };
        if obs_id == kfid {
            continue;
        }

        let Some(obs_kf) = store.get_keyframe(obs_id) else {
            actions.push(TemporalAction::RepairObserver(kpid, obs_id));
            continue;
        };
        let Some(obs_kp) = obs_kf.get_keypoint(kpid) else {
            actions.push(TemporalAction::RepairObserver(kpid, obs_id));
            continue;
        };
        let obs_unpx = obs_kp.unpx;

        let entry = rel_cache.entry(obs_id).or_insert_with(|| {
            let rel = obs_kf.t_cw().compose(&t_wc);
            let rel_inv = rel.inverse();
            (rel, rel_inv)
        });
        let (rel, rel_inv) = (&entry.0, &entry.1);

        // Parallax between the anchor observation and the rotated current
        // bearing, so pure rotation does not count.
        let rotated = rel.rotation * bearing;
        let parallax = if rotated.z > 0.0 {
            (obs_unpx - camera.project_undistort(&rotated)).norm()
        } else {
            f64::INFINITY
        };

        let x_obs = camera.normalized_coords(&obs_unpx);
        let x_cur = camera.normalized_coords(&unpx);
        let p_current = projection_matrix(rel_inv);

        let promoted = match triangulate_linear(&x_obs, &x_cur, &p_anchor, &p_current) {
            None => None,
            Some(p_anchor_cam) => {
                let p_cur_cam = rel_inv.transform_point(&p_anchor_cam);
                let good = p_anchor_cam.z > 0.0
                    && p_cur_cam.z > 0.0
                    && (camera.project_undistort(&p_anchor_cam) - obs_unpx).norm()
                        <= max_reprojection_error
                    && (camera.project_undistort(&p_cur_cam) - unpx).norm()
                        <= max_reprojection_error;
                good.then(|| obs_kf.t_wc().transform_point(&p_anchor_cam))
            }
        };

        match promoted {
            Some(wpt) => actions.push(TemporalAction::Promote(kpid, wpt)),
            None if parallax > REJECTION_PARALLAX_PX => {
                actions.push(TemporalAction::DropObservation(kpid));
            }
            None => {} // Low parallax: keep 2D and retry later.
        }
    }

    let mut nb_promoted = 0;
    for action in actions {
        match action {
            TemporalAction::Promote(kpid, wpt) => {
                store.update_mappoint(kpid, wpt);
                nb_promoted += 1;
            }
            TemporalAction::DropObservation(kpid) => {
                store.remove_mappoint_obs(kpid, kfid);
            }
            TemporalAction::RepairObserver(kpid, obs_id) => {
                warn!("[Mapper] {} lost its anchor {}, dropping the link", kpid, obs_id);
                store.remove_mappoint_obs(kpid, obs_id);
            }
        }
    }

    Ok(nb_promoted)
}
