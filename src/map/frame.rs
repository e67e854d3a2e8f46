//! Frame - a camera image's pose and keypoint observations.
//!
//! The current frame is the only non-keyframe frame alive at any time;
//! promoted frames persist in the map store as keyframes. Frames keep the
//! pose redundantly as world-from-camera and camera-from-world, updated
//! together, and maintain aggregate keypoint counters alongside the
//! covisibility map and the local-map id set.

use std::collections::{BTreeMap, HashMap, HashSet};

use nalgebra::{Vector2, Vector3};

use crate::camera::CameraModel;
use crate::geometry::SE3;

use super::keypoint::Keypoint;
use super::types::{FrameId, KeyFrameId, KeypointId};

#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,

    /// Originating keyframe id (the reference keyframe for the current
    /// frame; the own id for promoted frames).
    pub kfid: KeyFrameId,

    /// Monotonic timestamp in seconds.
    pub time: f64,

    /// World-from-camera pose.
    t_wc: SE3,

    /// Camera-from-world pose, kept consistent with `t_wc`.
    t_cw: SE3,

    keypoints: HashMap<KeypointId, Keypoint>,

    pub nb_keypoints: usize,
    pub nb_2d_kpts: usize,
    pub nb_3d_kpts: usize,
    pub nb_stereo_kpts: usize,

    /// Covisibility map: keyframe id -> number of shared observations.
    /// Ordered so the first key is the oldest covisible keyframe.
    pub covisible_kfs: BTreeMap<KeyFrameId, usize>,

    /// Map-point ids reachable through covisibility.
    pub local_map_ids: HashSet<KeypointId>,
}

impl Frame {
    pub fn new(id: FrameId, kfid: KeyFrameId, time: f64) -> Self {
        Self {
            id,
            kfid,
            time,
            t_wc: SE3::identity(),
            t_cw: SE3::identity(),
            keypoints: HashMap::new(),
            nb_keypoints: 0,
            nb_2d_kpts: 0,
            nb_3d_kpts: 0,
            nb_stereo_kpts: 0,
            covisible_kfs: BTreeMap::new(),
            local_map_ids: HashSet::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pose
    // ─────────────────────────────────────────────────────────────────────

    /// Set the pose, keeping both stored directions consistent.
    pub fn set_pose(&mut self, t_wc: SE3) {
        self.t_cw = t_wc.inverse();
        self.t_wc = t_wc;
    }

    pub fn t_wc(&self) -> &SE3 {
        &self.t_wc
    }

    pub fn t_cw(&self) -> &SE3 {
        &self.t_cw
    }

    /// Transform a world point into this frame's camera frame.
    pub fn project_world_to_camera(&self, wpt: &Vector3<f64>) -> Vector3<f64> {
        self.t_cw.transform_point(wpt)
    }

    /// Transform a camera-frame point into the world frame.
    pub fn project_camera_to_world(&self, cpt: &Vector3<f64>) -> Vector3<f64> {
        self.t_wc.transform_point(cpt)
    }

    /// Project a world point to a distorted pixel in this frame's image.
    ///
    /// Pure pose + intrinsics arithmetic; the caller checks depth and
    /// image bounds.
    pub fn project_world_to_image_distort(
        &self,
        camera: &CameraModel,
        wpt: &Vector3<f64>,
    ) -> Vector2<f64> {
        camera.project(&self.project_world_to_camera(wpt))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Keypoints
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_keypoint(&self, id: KeypointId) -> Option<&Keypoint> {
        self.keypoints.get(&id)
    }

    pub(super) fn get_keypoint_mut(&mut self, id: KeypointId) -> Option<&mut Keypoint> {
        self.keypoints.get_mut(&id)
    }

    pub fn has_keypoint(&self, id: KeypointId) -> bool {
        self.keypoints.contains_key(&id)
    }

    pub fn keypoints(&self) -> impl Iterator<Item = &Keypoint> {
        self.keypoints.values()
    }

    pub fn keypoint_ids(&self) -> impl Iterator<Item = KeypointId> + '_ {
        self.keypoints.keys().copied()
    }

    /// Insert a keypoint, updating the aggregate counters.
    pub fn add_keypoint(&mut self, kp: Keypoint) {
        if self.keypoints.contains_key(&kp.id) {
            return;
        }
        self.nb_keypoints += 1;
        if kp.is_3d {
            self.nb_3d_kpts += 1;
        } else {
            self.nb_2d_kpts += 1;
        }
        if kp.is_stereo() {
            self.nb_stereo_kpts += 1;
        }
        self.keypoints.insert(kp.id, kp);
    }

    /// Remove a keypoint, updating the aggregate counters.
    pub fn remove_keypoint(&mut self, id: KeypointId) -> Option<Keypoint> {
        let kp = self.keypoints.remove(&id)?;
        self.nb_keypoints -= 1;
        if kp.is_3d {
            self.nb_3d_kpts -= 1;
        } else {
            self.nb_2d_kpts -= 1;
        }
        if kp.is_stereo() {
            self.nb_stereo_kpts -= 1;
        }
        debug_assert_eq!(self.nb_keypoints, self.nb_2d_kpts + self.nb_3d_kpts);
        Some(kp)
    }

    /// Flip a keypoint to 3D, adjusting the 2D/3D counters.
    pub fn turn_keypoint_3d(&mut self, id: KeypointId) {
        if let Some(kp) = self.keypoints.get_mut(&id) {
            if !kp.is_3d {
                kp.is_3d = true;
                self.nb_2d_kpts -= 1;
                self.nb_3d_kpts += 1;
            }
        }
    }

    /// Record a stereo pairing for a keypoint.
    pub fn set_keypoint_stereo(&mut self, id: KeypointId, rpx: Vector2<f64>) {
        if let Some(kp) = self.keypoints.get_mut(&id) {
            if kp.rpx.is_none() {
                self.nb_stereo_kpts += 1;
            }
            kp.rpx = Some(rpx);
        }
    }

    /// Clear a stereo pairing without removing the keypoint.
    pub fn remove_keypoint_stereo(&mut self, id: KeypointId) {
        if let Some(kp) = self.keypoints.get_mut(&id) {
            if kp.rpx.take().is_some() {
                self.nb_stereo_kpts -= 1;
            }
        }
    }

    /// Re-key a keypoint under a merged map-point id.
    ///
    /// Returns false (and removes the old keypoint) when the frame already
    /// observes `new_id`.
    pub fn rekey_keypoint(&mut self, old_id: KeypointId, new_id: KeypointId, is_3d: bool) -> bool {
        if !self.keypoints.contains_key(&old_id) {
            return false;
        }
        if self.keypoints.contains_key(&new_id) {
            self.remove_keypoint(old_id);
            return false;
        }
        let mut kp = self.remove_keypoint(old_id).expect("checked above");
        kp.id = new_id;
        kp.is_3d = is_3d;
        self.add_keypoint(kp);
        true
    }

    /// Keypoints within `radius` pixels of `px` (linear scan).
    pub fn get_surrounding_keypoints(&self, px: &Vector2<f64>, radius: f64) -> Vec<KeypointId> {
        let radius_sq = radius * radius;
        self.keypoints
            .values()
            .filter(|kp| (kp.px - px).norm_squared() <= radius_sq)
            .map(|kp| kp.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn kp(id: u64, x: f64, y: f64) -> Keypoint {
        Keypoint::new(
            KeypointId(id),
            Vector2::new(x, y),
            Vector2::new(x, y),
            Vector3::new(0.0, 0.0, 1.0),
            None,
        )
    }

    #[test]
    fn test_set_pose_keeps_directions_consistent() {
        let mut frame = Frame::new(FrameId(1), KeyFrameId(0), 0.0);
        frame.set_pose(SE3::from_parts(
            UnitQuaternion::from_euler_angles(0.1, 0.2, -0.1),
            Vector3::new(1.0, -1.0, 0.5),
        ));

        let id = frame.t_wc().compose(frame.t_cw());
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-10);
        assert_relative_eq!(id.rotation.angle(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_counters_track_add_remove() {
        let mut frame = Frame::new(FrameId(1), KeyFrameId(0), 0.0);
        frame.add_keypoint(kp(0, 10.0, 10.0));
        frame.add_keypoint(kp(1, 20.0, 20.0));

        assert_eq!(frame.nb_keypoints, 2);
        assert_eq!(frame.nb_2d_kpts, 2);
        assert_eq!(frame.nb_3d_kpts, 0);

        frame.turn_keypoint_3d(KeypointId(0));
        assert_eq!(frame.nb_2d_kpts, 1);
        assert_eq!(frame.nb_3d_kpts, 1);
        assert_eq!(frame.nb_keypoints, frame.nb_2d_kpts + frame.nb_3d_kpts);

        frame.remove_keypoint(KeypointId(0));
        assert_eq!(frame.nb_keypoints, 1);
        assert_eq!(frame.nb_3d_kpts, 0);
    }

    #[test]
    fn test_stereo_counter() {
        let mut frame = Frame::new(FrameId(1), KeyFrameId(0), 0.0);
        frame.add_keypoint(kp(0, 10.0, 10.0));

        frame.set_keypoint_stereo(KeypointId(0), Vector2::new(8.0, 10.0));
        assert_eq!(frame.nb_stereo_kpts, 1);

        // Updating an existing pairing must not double count.
        frame.set_keypoint_stereo(KeypointId(0), Vector2::new(7.5, 10.0));
        assert_eq!(frame.nb_stereo_kpts, 1);

        frame.remove_keypoint_stereo(KeypointId(0));
        assert_eq!(frame.nb_stereo_kpts, 0);
        assert!(frame.has_keypoint(KeypointId(0)));
    }

    #[test]
    fn test_rekey_keypoint() {
        let mut frame = Frame::new(FrameId(1), KeyFrameId(0), 0.0);
        frame.add_keypoint(kp(0, 10.0, 10.0));

        assert!(frame.rekey_keypoint(KeypointId(0), KeypointId(5), true));
        assert!(!frame.has_keypoint(KeypointId(0)));
        let new = frame.get_keypoint(KeypointId(5)).unwrap();
        assert!(new.is_3d);
        assert_eq!(frame.nb_3d_kpts, 1);

        // Re-keying onto an already observed id drops the old keypoint.
        frame.add_keypoint(kp(1, 30.0, 30.0));
        assert!(!frame.rekey_keypoint(KeypointId(1), KeypointId(5), true));
        assert!(!frame.has_keypoint(KeypointId(1)));
        assert_eq!(frame.nb_keypoints, 1);
    }

    #[test]
    fn test_surrounding_keypoints() {
        let mut frame = Frame::new(FrameId(1), KeyFrameId(0), 0.0);
        frame.add_keypoint(kp(0, 100.0, 100.0));
        frame.add_keypoint(kp(1, 103.0, 100.0));
        frame.add_keypoint(kp(2, 200.0, 200.0));

        let mut near = frame.get_surrounding_keypoints(&Vector2::new(101.0, 100.0), 5.0);
        near.sort();
        assert_eq!(near, vec![KeypointId(0), KeypointId(1)]);
    }
}
