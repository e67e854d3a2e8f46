//! Local-map matching: merge redundant map points into new keyframes.
//!
//! Projects the local map's 3D points into a fresh keyframe, looks for a
//! descriptor match among the surrounding keypoints and merges each
//! matched candidate into the keypoint it landed on. The matching phase
//! runs under the map read lock; the merge phase takes the optimization
//! lock and then the map write lock, in that order.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector2;
use tracing::debug;

use crate::camera::CameraModel;
use crate::map::{Frame, KeyFrameId, KeypointId, MapPoint, MapStore};
use crate::system::shared::SharedState;

use super::MapperError;

/// Local-map size target, in multiples of the per-frame keypoint budget.
const LOCAL_MAP_SIZE_FACTOR: usize = 10;

/// Minimum depth for a candidate projection.
const MIN_PROJECTION_DEPTH: f64 = 0.1;

/// 3D-keypoint count under which the projection gate is widened.
const LOW_3D_THRESHOLD: usize = 30;

/// Match the keyframe's local map into the keyframe and merge duplicates.
///
/// Each surrounding keypoint may attract several candidates; only the
/// closest (smallest descriptor distance) survives into the merge plan,
/// and the surrounding keypoint's id is always the surviving one.
/// Returns the number of merged map points.
pub fn match_to_local_map(shared: &SharedState, kfid: KeyFrameId) -> Result<usize, MapperError> {
    // Matching phase: read lock only.
    let merge_plan: HashMap<KeypointId, (KeypointId, u32)> = {
        let map = shared.map.read();
        let kf = map
            .get_keyframe(kfid)
            .ok_or(MapperError::MissingKeyframe(kfid))?;
        let camera = map.camera_left();

        let mut local_ids: HashSet<KeypointId> = kf.local_map_ids.clone();

        // Thin local maps borrow the oldest covisible keyframe's.
        if local_ids.len() < LOCAL_MAP_SIZE_FACTOR * shared.config.max_nb_keypoints {
            if let Some((&oldest, _)) = kf.covisible_kfs.first_key_value() {
                if let Some(oldest_kf) = map.get_keyframe(oldest) {
                    local_ids.extend(oldest_kf.local_map_ids.iter().copied());
                }
            }
        }

        let mut max_projection_distance = shared.config.max_projection_distance;
        if kf.nb_3d_kpts < LOW_3D_THRESHOLD {
            max_projection_distance *= 2.0;
        }
        let view_cos = camera.half_fov_cos();

        let mut plan: HashMap<KeypointId, (KeypointId, u32)> = HashMap::new();
        for prev_id in local_ids {
            if kf.has_keypoint(prev_id) {
                continue;
            }
            let Some(mp) = map.get_mappoint(prev_id) else {
                continue;
            };
            if !mp.is_3d {
                continue;
            }

            let p_cam = kf.project_world_to_camera(&mp.position);
            if p_cam.z < MIN_PROJECTION_DEPTH {
                continue;
            }
            if p_cam.normalize().z < view_cos {
                continue;
            }
            let proj = camera.project(&p_cam);
            if !camera.in_image(&proj) {
                continue;
            }

            let surrounding = kf.get_surrounding_keypoints(&proj, max_projection_distance);
            let Some((new_id, dist)) = find_best_match(
                &map,
                kf,
                camera,
                mp,
                &proj,
                &surrounding,
                max_projection_distance,
                shared.config.max_descriptor_distance,
            ) else {
                continue;
            };

            // Keep only the closest candidate per surrounding keypoint.
            let closer = match plan.get(&new_id) {
                Some(&(_, best)) => dist < best,
                None => true,
            };
            if closer {
                plan.insert(new_id, (prev_id, dist));
            }
        }
        plan
    };

    if merge_plan.is_empty() {
        return Ok(0);
    }

    // Merge phase: optimization lock before map lock.
    let _optim = shared.optimization_lock.lock();
    let mut map = shared.map.write();
    let mut nb_merged = 0;
    for (new_id, (prev_id, _)) in merge_plan {
        map.merge_mappoints(prev_id, new_id);
        nb_merged += 1;
    }
    debug!("[LocalMatching] {}: merged {} map points", kfid, nb_merged);

    Ok(nb_merged)
}

/// Screen the surrounding keypoints for the best match of `target`.
///
/// A surrounding keypoint survives when it sits within the pixel gate,
/// its map point shares no observer with the target, and the target
/// reprojects within the pixel gate on average across the candidate's
/// observer keyframes. The best and second-best descriptor distances are
/// tracked; only the absolute distance gate is enforced on the winner.
#[allow(clippy::too_many_arguments)]
fn find_best_match(
    map: &MapStore,
    frame: &Frame,
    camera: &CameraModel,
    target: &MapPoint,
    proj: &Vector2<f64>,
    surrounding: &[KeypointId],
    max_projection_distance: f64,
    max_descriptor_distance: u32,
) -> Option<(KeypointId, u32)> {
    let target_desc = target.desc.as_ref()?;

    let mut best: Option<KeypointId> = None;
    let mut best_dist = u32::MAX;
    let mut second_dist = u32::MAX;

    for &kpid in surrounding {
        let Some(kp) = frame.get_keypoint(kpid) else {
            continue;
        };
        if (kp.px - proj).norm() > max_projection_distance {
            continue;
        }
        let Some(candidate) = map.get_mappoint(kpid) else {
            continue;
        };
        if !target.observers_disjoint(candidate) {
            continue;
        }

        // The target must land near the candidate's track wherever the
        // candidate is observed.
        let mut err_sum = 0.0;
        let mut nb_obs = 0usize;
        for obs_id in candidate.observers() {
            let Some(obs_kf) = map.get_keyframe(obs_id) else {
                continue;
            };
            let Some(obs_kp) = obs_kf.get_keypoint(kpid) else {
                continue;
            };
            let p_cam = obs_kf.project_world_to_camera(&target.position);
            if p_cam.z <= 0.0 {
                continue;
            }
            err_sum += (camera.project(&p_cam) - obs_kp.px).norm();
            nb_obs += 1;
        }
        if nb_obs == 0 || err_sum / nb_obs as f64 > max_projection_distance {
            continue;
        }

        let Some(kp_desc) = kp.desc.as_ref().or(candidate.desc.as_ref()) else {
            continue;
        };
        let dist = target_desc.distance(kp_desc);
        if dist < best_dist {
            second_dist = best_dist;
            best_dist = dist;
            best = Some(kpid);
        } else if dist < second_dist {
            second_dist = dist;
        }
    }

    // second_dist is kept for a distance-ratio acceptance test; only the
    // absolute gate is applied for now.
    let _ = second_dist;

    let winner = best?;
    (best_dist <= max_descriptor_distance).then_some((winner, best_dist))
}
