//! MapStore - custodian of frames, keyframes, keypoints and map points.
//!
//! All persistent entities are owned here and refer to each other by id;
//! entities never hold direct references to one another. Lookups are
//! null-returning; mutation operations that encounter missing
//! prerequisites repair the indexes and return without error. Counter and
//! cross-reference invariants are checked with debug assertions, since a
//! violation is a bug rather than a runtime condition.

use std::collections::{BTreeMap, HashMap, HashSet};

use nalgebra::{Vector2, Vector3};
use tracing::warn;

use crate::camera::CameraModel;
use crate::geometry::SE3;

use super::frame::Frame;
use super::keypoint::Keypoint;
use super::map_point::MapPoint;
use super::types::{Descriptor, FrameId, KeyFrameId, KeypointId};

pub struct MapStore {
    camera_left: CameraModel,
    camera_right: Option<CameraModel>,

    /// The only non-keyframe frame alive.
    current: Frame,

    keyframes: HashMap<KeyFrameId, Frame>,
    map_points: HashMap<KeypointId, MapPoint>,

    next_kpid: u64,
    next_kfid: u64,
}

impl MapStore {
    pub fn new(camera_left: CameraModel, camera_right: Option<CameraModel>) -> Self {
        Self {
            camera_left,
            camera_right,
            current: Frame::new(FrameId(0), KeyFrameId(0), 0.0),
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            next_kpid: 0,
            next_kfid: 0,
        }
    }

    pub fn camera_left(&self) -> &CameraModel {
        &self.camera_left
    }

    pub fn camera_right(&self) -> Option<&CameraModel> {
        self.camera_right.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Frame lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Start a new tick: bump the current frame id and timestamp, carrying
    /// the tracked keypoints forward.
    pub fn begin_frame(&mut self, time: f64) -> FrameId {
        self.current.id = FrameId(self.current.id.0 + 1);
        self.current.time = time;
        self.current.id
    }

    pub fn current_frame(&self) -> &Frame {
        &self.current
    }

    pub fn set_current_pose(&mut self, t_wc: SE3) {
        self.current.set_pose(t_wc);
    }

    /// Pixels currently claimed by tracked keypoints (extraction mask).
    pub fn current_keypoint_pixels(&self) -> Vec<Vector2<f64>> {
        self.current.keypoints().map(|kp| kp.px).collect()
    }

    pub fn nb_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn nb_mappoints(&self) -> usize {
        self.map_points.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lookups (null-returning)
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_frame(&self, id: FrameId) -> Option<&Frame> {
        if self.current.id == id {
            return Some(&self.current);
        }
        self.keyframes.values().find(|kf| kf.id == id)
    }

    pub fn get_keyframe(&self, kfid: KeyFrameId) -> Option<&Frame> {
        self.keyframes.get(&kfid)
    }

    pub fn get_mappoint(&self, kpid: KeypointId) -> Option<&MapPoint> {
        self.map_points.get(&kpid)
    }

    pub fn get_keypoint(&self, kfid: KeyFrameId, kpid: KeypointId) -> Option<&Keypoint> {
        self.keyframes.get(&kfid)?.get_keypoint(kpid)
    }

    pub fn keyframe_ids(&self) -> impl Iterator<Item = KeyFrameId> + '_ {
        self.keyframes.keys().copied()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Keyframe creation
    // ─────────────────────────────────────────────────────────────────────

    /// Promote the current frame to a keyframe, index it and register new
    /// detections.
    ///
    /// Every map point tracked into the promoted frame gains it as an
    /// observer; the promoted copy is also the first observer of the map
    /// points created for `detections`.
    pub fn create_keyframe(
        &mut self,
        detections: &[(Vector2<f64>, Option<Descriptor>)],
    ) -> KeyFrameId {
        let kfid = KeyFrameId(self.next_kfid);
        self.next_kfid += 1;
        self.current.kfid = kfid;

        // Register the new observer on all carried-over map points; tracks
        // whose map point vanished underneath are dropped here.
        let mut dangling: Vec<KeypointId> = Vec::new();
        for kpid in self.current.keypoint_ids().collect::<Vec<_>>() {
            match self.map_points.get_mut(&kpid) {
                Some(mp) => mp.add_observer(kfid),
                None => dangling.push(kpid),
            }
        }
        for kpid in dangling {
            self.current.remove_keypoint(kpid);
        }

        self.keyframes.insert(kfid, self.current.clone());
        self.add_keypoints_to_current_frame(detections);

        kfid
    }

    /// Create keypoints (and their paired 2D map points) in the current
    /// frame and its originating keyframe.
    pub fn add_keypoints_to_current_frame(
        &mut self,
        detections: &[(Vector2<f64>, Option<Descriptor>)],
    ) {
        let kfid = self.current.kfid;
        for (px, desc) in detections {
            let id = KeypointId(self.next_kpid);
            self.next_kpid += 1;

            let unpx = self.camera_left.undistort_px(px);
            let bearing = self.camera_left.unproject(&unpx);
            let kp = Keypoint::new(id, *px, unpx, bearing, *desc);

            if let Some(kf) = self.keyframes.get_mut(&kfid) {
                kf.add_keypoint(kp.clone());
            }
            self.current.add_keypoint(kp);
            self.map_points.insert(id, MapPoint::new(id, kfid, *desc));
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Keypoint updates
    // ─────────────────────────────────────────────────────────────────────

    /// Update a tracked pixel in the current frame, recomputing the
    /// undistorted position and the bearing.
    pub fn update_keypoint(&mut self, kpid: KeypointId, px: Vector2<f64>) {
        let unpx = self.camera_left.undistort_px(&px);
        let bearing = self.camera_left.unproject(&unpx);
        if let Some(kp) = self.current.get_keypoint_mut(kpid) {
            kp.px = px;
            kp.unpx = unpx;
            kp.bearing = bearing;
        }
    }

    /// Record a stereo pairing on a keyframe's keypoint.
    pub fn update_keypoint_stereo(&mut self, kfid: KeyFrameId, kpid: KeypointId, rpx: Vector2<f64>) {
        if let Some(kf) = self.keyframes.get_mut(&kfid) {
            kf.set_keypoint_stereo(kpid, rpx);
        }
    }

    /// Clear a stereo pairing without removing the 2D keypoint.
    pub fn remove_stereo_keypoint(&mut self, kfid: KeyFrameId, kpid: KeypointId) {
        if let Some(kf) = self.keyframes.get_mut(&kfid) {
            kf.remove_keypoint_stereo(kpid);
        }
    }

    /// Drop a failed track from the current frame.
    pub fn remove_obs_from_current_frame(&mut self, kpid: KeypointId) {
        self.current.remove_keypoint(kpid);

        // A map point with no keyframe observer left is dead.
        if let Some(mp) = self.map_points.get(&kpid) {
            if mp.nb_observers() == 0 {
                self.map_points.remove(&kpid);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Map point updates
    // ─────────────────────────────────────────────────────────────────────

    /// Set a map point's world position and promote it to 3D, propagating
    /// the flag to every observing keypoint and adjusting frame counters.
    pub fn update_mappoint(&mut self, kpid: KeypointId, wpt: Vector3<f64>) {
        let Some(mp) = self.map_points.get_mut(&kpid) else {
            return;
        };
        mp.position = wpt;
        mp.is_3d = true;

        let observers: Vec<KeyFrameId> = mp.observers().collect();
        let anchor = mp.first_observer();

        for kfid in &observers {
            if let Some(kf) = self.keyframes.get_mut(kfid) {
                kf.turn_keypoint_3d(kpid);
            }
        }
        if self.current.has_keypoint(kpid) {
            self.current.turn_keypoint_3d(kpid);
        }

        // Anchored inverse depth in the first observer's camera.
        if let Some(anchor_kf) = anchor.and_then(|id| self.keyframes.get(&id)) {
            let depth = anchor_kf.project_world_to_camera(&wpt).z;
            debug_assert!(depth > 0.0, "promoted map point behind its anchor");
            if let Some(mp) = self.map_points.get_mut(&kpid) {
                mp.invdepth = if depth > 0.0 { 1.0 / depth } else { -1.0 };
            }
        }
    }

    /// Remove one observer link from a map point.
    ///
    /// Deletes the map point when the observer list empties; drops the
    /// observation from the keyframe either way.
    pub fn remove_mappoint_obs(&mut self, kpid: KeypointId, kfid: KeyFrameId) {
        if let Some(kf) = self.keyframes.get_mut(&kfid) {
            kf.remove_keypoint(kpid);
        }
        let Some(mp) = self.map_points.get_mut(&kpid) else {
            return;
        };
        mp.remove_observer(kfid);
        if mp.nb_observers() == 0 {
            self.map_points.remove(&kpid);
        }
    }

    /// Merge map point `prev` into `new`.
    ///
    /// Every keyframe observing `prev` is re-keyed to observe `new`
    /// (keyframes already observing `new` just drop the duplicate),
    /// observer lists are unioned, and a 3D position on `prev` survives on
    /// a still-2D `new`. `new` is always the survivor; idempotent when
    /// `prev == new`.
    pub fn merge_mappoints(&mut self, prev: KeypointId, new: KeypointId) {
        if prev == new {
            return;
        }
        if !self.map_points.contains_key(&new) {
            warn!("[MapStore] merge target {} vanished, skipping", new);
            return;
        }
        let Some(prev_mp) = self.map_points.remove(&prev) else {
            return;
        };

        let new_is_3d = self.map_points[&new].is_3d;

        let mut gained: Vec<KeyFrameId> = Vec::new();
        for kfid in prev_mp.observers() {
            if let Some(kf) = self.keyframes.get_mut(&kfid) {
                kf.rekey_keypoint(prev, new, new_is_3d);
                if kf.has_keypoint(new) {
                    gained.push(kfid);
                }
            }
        }
        if self.current.has_keypoint(prev) {
            self.current.rekey_keypoint(prev, new, new_is_3d);
        }

        let new_mp = self.map_points.get_mut(&new).expect("checked above");
        for kfid in gained {
            new_mp.add_observer(kfid);
        }
        if new_mp.desc.is_none() {
            new_mp.desc = prev_mp.desc;
        }

        if prev_mp.is_3d && !new_is_3d {
            self.update_mappoint(new, prev_mp.position);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Covisibility
    // ─────────────────────────────────────────────────────────────────────

    /// Recompute a keyframe's covisibility map and local-map ids by
    /// walking its keypoints and accumulating observer counts.
    ///
    /// Edges are mirrored into the covisible keyframes; keypoints whose
    /// map point vanished are dropped on the way (self-healing).
    pub fn update_frame_covisibility(&mut self, kfid: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kfid) else {
            return;
        };

        let mut counts: BTreeMap<KeyFrameId, usize> = BTreeMap::new();
        let mut dangling: Vec<KeypointId> = Vec::new();

        for kpid in kf.keypoint_ids() {
            match self.map_points.get(&kpid) {
                None => dangling.push(kpid),
                Some(mp) => {
                    for obs in mp.observers() {
                        if obs != kfid {
                            *counts.entry(obs).or_default() += 1;
                        }
                    }
                }
            }
        }

        let old_edges: Vec<KeyFrameId> = kf.covisible_kfs.keys().copied().collect();

        if !dangling.is_empty() {
            let kf = self.keyframes.get_mut(&kfid).expect("checked above");
            for kpid in dangling {
                kf.remove_keypoint(kpid);
            }
        }

        // Mirror the recomputed weights, dropping stale reverse edges.
        for (&obs, &weight) in &counts {
            if let Some(other) = self.keyframes.get_mut(&obs) {
                other.covisible_kfs.insert(kfid, weight);
            }
        }
        for obs in old_edges {
            if !counts.contains_key(&obs) {
                if let Some(other) = self.keyframes.get_mut(&obs) {
                    other.covisible_kfs.remove(&kfid);
                }
            }
        }

        // Local map: everything seen by covisible keyframes but not here.
        let mut local_map_ids: HashSet<KeypointId> = HashSet::new();
        {
            let kf = &self.keyframes[&kfid];
            for obs in counts.keys() {
                if let Some(other) = self.keyframes.get(obs) {
                    for kpid in other.keypoint_ids() {
                        if !kf.has_keypoint(kpid) {
                            local_map_ids.insert(kpid);
                        }
                    }
                }
            }
        }

        let kf = self.keyframes.get_mut(&kfid).expect("checked above");
        kf.covisible_kfs = counts;
        kf.local_map_ids = local_map_ids;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reset
    // ─────────────────────────────────────────────────────────────────────

    /// Drop all persistent state and re-seed the current frame.
    ///
    /// Keypoint ids keep increasing across resets (they are globally
    /// unique); frame and keyframe ids restart.
    pub fn reset(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.next_kfid = 0;
        self.current = Frame::new(FrameId(0), KeyFrameId(0), 0.0);
    }
}

impl std::fmt::Debug for MapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapStore")
            .field("current_frame", &self.current.id)
            .field("nb_keyframes", &self.keyframes.len())
            .field("nb_mappoints", &self.map_points.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    fn test_store() -> MapStore {
        let cam = CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480);
        MapStore::new(cam, None)
    }

    fn detections(pixels: &[(f64, f64)]) -> Vec<(Vector2<f64>, Option<Descriptor>)> {
        pixels
            .iter()
            .map(|&(x, y)| (Vector2::new(x, y), None))
            .collect()
    }

    /// Check the cross-reference invariants that must hold at every lock
    /// release.
    fn assert_invariants(store: &MapStore) {
        let frames: Vec<&Frame> = store
            .keyframes
            .values()
            .chain(std::iter::once(&store.current))
            .collect();

        for frame in frames {
            assert_eq!(
                frame.nb_keypoints,
                frame.nb_2d_kpts + frame.nb_3d_kpts,
                "counter mismatch in {}",
                frame.id
            );
            assert!(frame.nb_stereo_kpts <= frame.nb_keypoints);

            for kp in frame.keypoints() {
                if kp.is_3d {
                    let mp = store
                        .get_mappoint(kp.id)
                        .unwrap_or_else(|| panic!("3D keypoint {} without map point", kp.id));
                    assert!(mp.is_3d, "3D keypoint {} with 2D map point", kp.id);
                }
            }
        }

        for mp in store.map_points.values() {
            for kfid in mp.observers() {
                let kf = store
                    .get_keyframe(kfid)
                    .unwrap_or_else(|| panic!("{} observer {} missing", mp.id, kfid));
                assert!(
                    kf.has_keypoint(mp.id),
                    "{} observer {} lost its keypoint",
                    mp.id,
                    kfid
                );
            }
        }
    }

    #[test]
    fn test_create_keyframe_assigns_monotonic_ids() {
        let mut store = test_store();

        store.begin_frame(0.0);
        let kf0 = store.create_keyframe(&detections(&[(10.0, 10.0), (20.0, 20.0)]));
        store.begin_frame(0.1);
        let kf1 = store.create_keyframe(&detections(&[(30.0, 30.0)]));

        assert_eq!(kf0, KeyFrameId(0));
        assert_eq!(kf1, KeyFrameId(1));
        assert_eq!(store.nb_keyframes(), 2);
        // Two points created at kf0, carried into kf1, plus one new.
        assert_eq!(store.nb_mappoints(), 3);
        assert_eq!(store.get_keyframe(kf1).unwrap().nb_keypoints, 3);
        assert_invariants(&store);
    }

    #[test]
    fn test_extraction_creates_2d_mappoints() {
        let mut store = test_store();
        store.begin_frame(0.0);
        let kfid = store.create_keyframe(&detections(&[(100.0, 100.0)]));

        let kp = store.current_frame().keypoints().next().unwrap();
        let mp = store.get_mappoint(kp.id).unwrap();

        assert!(!mp.is_3d);
        assert_eq!(mp.first_observer(), Some(kfid));
        assert!((kp.bearing.norm() - 1.0).abs() < 1e-12);
        assert_invariants(&store);
    }

    #[test]
    fn test_update_mappoint_propagates_3d() {
        let mut store = test_store();
        store.begin_frame(0.0);
        let kfid = store.create_keyframe(&detections(&[(320.0, 240.0)]));
        let kpid = store.current_frame().keypoints().next().unwrap().id;

        store.update_mappoint(kpid, Vector3::new(0.0, 0.0, 4.0));

        let mp = store.get_mappoint(kpid).unwrap();
        assert!(mp.is_3d);
        assert!((mp.invdepth - 0.25).abs() < 1e-12);
        assert!(store.get_keypoint(kfid, kpid).unwrap().is_3d);
        assert!(store.current_frame().get_keypoint(kpid).unwrap().is_3d);
        assert_eq!(store.get_keyframe(kfid).unwrap().nb_3d_kpts, 1);
        assert_invariants(&store);
    }

    #[test]
    fn test_remove_mappoint_obs_deletes_orphan() {
        let mut store = test_store();
        store.begin_frame(0.0);
        let kfid = store.create_keyframe(&detections(&[(50.0, 50.0)]));
        let kpid = store.current_frame().keypoints().next().unwrap().id;

        store.remove_mappoint_obs(kpid, kfid);

        assert!(store.get_mappoint(kpid).is_none());
        assert!(store.get_keypoint(kfid, kpid).is_none());
    }

    #[test]
    fn test_remove_obs_from_current_frame_keeps_keyframe_obs() {
        let mut store = test_store();
        store.begin_frame(0.0);
        let kfid = store.create_keyframe(&detections(&[(50.0, 50.0)]));
        let kpid = store.current_frame().keypoints().next().unwrap().id;

        store.begin_frame(0.1);
        store.remove_obs_from_current_frame(kpid);

        assert!(!store.current_frame().has_keypoint(kpid));
        // The keyframe still observes it, so the map point survives.
        assert!(store.get_mappoint(kpid).is_some());
        assert!(store.get_keypoint(kfid, kpid).is_some());
        assert_invariants(&store);
    }

    #[test]
    fn test_merge_mappoints_unions_observers() {
        let mut store = test_store();

        // kf0 observes the first point, kf1 observes both.
        store.begin_frame(0.0);
        store.create_keyframe(&detections(&[(100.0, 100.0)]));
        let prev = store.current_frame().keypoints().next().unwrap().id;

        store.begin_frame(0.1);
        store.create_keyframe(&detections(&[(103.0, 100.0)]));
        let new = store
            .current_frame()
            .keypoint_ids()
            .find(|&id| id != prev)
            .unwrap();

        // prev is observed by kf0 and kf1, new only by kf1: strip prev from
        // kf1 so the observer sets become disjoint.
        store.remove_mappoint_obs(prev, KeyFrameId(1));
        store.update_mappoint(prev, Vector3::new(0.0, 0.0, 5.0));

        store.merge_mappoints(prev, new);

        assert!(store.get_mappoint(prev).is_none());
        let survivor = store.get_mappoint(new).unwrap();
        let obs: Vec<_> = survivor.observers().collect();
        assert_eq!(obs, vec![KeyFrameId(0), KeyFrameId(1)]);
        // prev's 3D position survived on the 2D target.
        assert!(survivor.is_3d);
        // kf0's keypoint was re-keyed to the survivor.
        assert!(store.get_keypoint(KeyFrameId(0), new).is_some());
        assert!(store.get_keypoint(KeyFrameId(0), prev).is_none());
        assert_invariants(&store);
    }

    #[test]
    fn test_merge_mappoints_idempotent_on_self() {
        let mut store = test_store();
        store.begin_frame(0.0);
        store.create_keyframe(&detections(&[(100.0, 100.0)]));
        let kpid = store.current_frame().keypoints().next().unwrap().id;

        let before = store.get_mappoint(kpid).unwrap().nb_observers();
        store.merge_mappoints(kpid, kpid);
        assert_eq!(store.get_mappoint(kpid).unwrap().nb_observers(), before);
        assert_invariants(&store);
    }

    #[test]
    fn test_update_frame_covisibility_is_deterministic() {
        let mut store = test_store();

        store.begin_frame(0.0);
        store.create_keyframe(&detections(&[(10.0, 10.0), (20.0, 20.0), (30.0, 30.0)]));
        store.begin_frame(0.1);
        store.set_current_pose(SE3::from_parts(
            UnitQuaternion::identity(),
            Vector3::new(0.1, 0.0, 0.0),
        ));
        let kf1 = store.create_keyframe(&detections(&[(40.0, 40.0)]));

        store.update_frame_covisibility(kf1);
        let first_cov = store.get_keyframe(kf1).unwrap().covisible_kfs.clone();
        let first_local = store.get_keyframe(kf1).unwrap().local_map_ids.clone();

        store.update_frame_covisibility(kf1);
        let kf = store.get_keyframe(kf1).unwrap();

        assert_eq!(kf.covisible_kfs, first_cov);
        assert_eq!(kf.local_map_ids, first_local);
        // kf1 shares the three carried-over points with kf0.
        assert_eq!(first_cov.get(&KeyFrameId(0)), Some(&3));
        // kf0's reverse edge was mirrored.
        assert_eq!(
            store
                .get_keyframe(KeyFrameId(0))
                .unwrap()
                .covisible_kfs
                .get(&kf1),
            Some(&3)
        );
        assert_invariants(&store);
    }

    #[test]
    fn test_covisibility_local_map_excludes_own_points() {
        let mut store = test_store();

        store.begin_frame(0.0);
        store.create_keyframe(&detections(&[(10.0, 10.0), (20.0, 20.0)]));
        let only_kf0: Vec<KeypointId> = store.current_frame().keypoint_ids().collect();

        store.begin_frame(0.1);
        // Drop one point from the current frame before promoting, so kf1
        // does not observe it and it lands in kf1's local map.
        store.remove_obs_from_current_frame(only_kf0[0]);
        let kf1 = store.create_keyframe(&detections(&[(50.0, 50.0)]));

        store.update_frame_covisibility(kf1);
        let kf = store.get_keyframe(kf1).unwrap();

        assert!(kf.local_map_ids.contains(&only_kf0[0]));
        assert!(!kf.local_map_ids.contains(&only_kf0[1]));
        assert_invariants(&store);
    }

    #[test]
    fn test_reset_restarts_ids_but_not_keypoints() {
        let mut store = test_store();
        store.begin_frame(0.0);
        store.create_keyframe(&detections(&[(10.0, 10.0)]));

        store.reset();

        assert_eq!(store.nb_keyframes(), 0);
        assert_eq!(store.nb_mappoints(), 0);
        assert_eq!(store.current_frame().id, FrameId(0));

        store.begin_frame(1.0);
        let kfid = store.create_keyframe(&detections(&[(20.0, 20.0)]));
        assert_eq!(kfid, KeyFrameId(0));
        // Keypoint ids are globally unique across resets.
        let kpid = store.current_frame().keypoints().next().unwrap().id;
        assert_eq!(kpid, KeypointId(1));
    }

    #[test]
    fn test_stereo_keypoint_bookkeeping() {
        let mut store = test_store();
        store.begin_frame(0.0);
        let kfid = store.create_keyframe(&detections(&[(60.0, 60.0)]));
        let kpid = store.current_frame().keypoints().next().unwrap().id;

        store.update_keypoint_stereo(kfid, kpid, Vector2::new(55.0, 60.0));
        assert_eq!(store.get_keyframe(kfid).unwrap().nb_stereo_kpts, 1);

        store.remove_stereo_keypoint(kfid, kpid);
        let kf = store.get_keyframe(kfid).unwrap();
        assert_eq!(kf.nb_stereo_kpts, 0);
        assert!(kf.has_keypoint(kpid));
        assert_invariants(&store);
    }
}
