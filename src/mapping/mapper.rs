//! Mapper - the background map-maintenance worker.
//!
//! Consumes keyframe jobs in FIFO order and, for each keyframe: matches
//! and triangulates stereo pairs, triangulates 2D keypoints against their
//! first observers, checks the post-initialization health gate, updates
//! the covisibility graph, merges duplicates through local-map matching
//! and finally hands the keyframe to the estimator queue. Every stage is
//! fallible; failures are logged and the loop moves on.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use image::GrayImage;
use nalgebra::Vector2;
use tracing::{debug, info, warn};

use crate::kernels::{KltSettings, OpticalFlowKernel, Pyramid};
use crate::map::{KeyFrameId, KeypointId};
use crate::system::estimator::{run_estimator, Estimator, EstimatorQueue};
use crate::system::messages::KeyFrameJob;
use crate::system::shared::SharedState;

use super::local_map::match_to_local_map;
use super::triangulator::{triangulate_stereo, triangulate_temporal};
use super::MapperError;

/// Timeout for receiving keyframe jobs; bounds the shutdown latency.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Post-initialization health gate: minimum 3D keypoints expected on the
/// second keyframe, and on every keyframe of the early map.
const MIN_3D_ON_SECOND_KF: usize = 30;
const MIN_3D_ON_EARLY_KF: usize = 3;
const EARLY_MAP_KEYFRAMES: u64 = 10;

pub struct Mapper {
    shared: Arc<SharedState>,
    flow: Arc<dyn OpticalFlowKernel>,
    estimator_queue: Arc<EstimatorQueue>,

    /// Reusable right-image pyramid, owned exclusively by this worker.
    right_pyramid: Pyramid,
}

impl Mapper {
    /// Spawn the mapper thread; the mapper spawns the estimator thread
    /// itself and forwards the shutdown to it on exit.
    pub fn spawn(
        shared: Arc<SharedState>,
        flow: Arc<dyn OpticalFlowKernel>,
        receiver: Receiver<KeyFrameJob>,
        estimator_queue: Arc<EstimatorQueue>,
        estimator: Box<dyn Estimator>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let estimator_handle = {
                let queue = Arc::clone(&estimator_queue);
                let shared = Arc::clone(&shared);
                thread::spawn(move || run_estimator(queue, shared, estimator))
            };

            let mut mapper = Mapper {
                shared,
                flow,
                estimator_queue,
                right_pyramid: Pyramid::Empty,
            };
            mapper.run(&receiver);

            mapper.estimator_queue.request_exit();
            let _ = estimator_handle.join();
            info!("[Mapper] estimator joined, worker done");
        })
    }

    /// Main loop: pop jobs in FIFO order until exit is requested.
    fn run(&mut self, receiver: &Receiver<KeyFrameJob>) {
        info!("[Mapper] started");
        loop {
            if self.shared.state.exit_required() {
                break;
            }
            match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(job) => self.process_keyframe(job, receiver),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("[Mapper] exiting");
    }

    fn process_keyframe(&mut self, job: KeyFrameJob, receiver: &Receiver<KeyFrameJob>) {
        let kfid = job.kfid;

        if self.shared.map.read().get_keyframe(kfid).is_none() {
            warn!("[Mapper] {} vanished before processing, skipping", kfid);
            return;
        }

        // Stereo step.
        if self.shared.config.stereo {
            if let Some(right) = &job.right_image {
                match self.stereo_matching(kfid, &job.pyramid, right) {
                    Ok(nb_pairs) if nb_pairs > 0 => {
                        let mut map = self.shared.map.write();
                        match triangulate_stereo(
                            &mut map,
                            kfid,
                            self.shared.config.max_reprojection_error,
                        ) {
                            Ok(nb) => {
                                debug!("[Mapper] {}: {} stereo points promoted", kfid, nb)
                            }
                            Err(err) => warn!("[Mapper] {}: stereo step failed: {}", kfid, err),
                        }
                    }
                    Ok(_) => {}
                    Err(err) => warn!("[Mapper] {}: stereo matching failed: {}", kfid, err),
                }
            }
        }

        // Temporal step.
        let nb_2d = self
            .shared
            .map
            .read()
            .get_keyframe(kfid)
            .map_or(0, |kf| kf.nb_2d_kpts);
        if nb_2d > 0 && kfid.0 > 0 {
            let mut map = self.shared.map.write();
            match triangulate_temporal(&mut map, kfid, self.shared.config.max_reprojection_error) {
                Ok(nb) => debug!("[Mapper] {}: {} temporal points promoted", kfid, nb),
                Err(err) => warn!("[Mapper] {}: temporal step failed: {}", kfid, err),
            }
        }

        // Health gate: an initialized map that cannot hold on to 3D
        // points is broken beyond repair.
        if self.degenerate_map(kfid) {
            warn!("[Mapper] {}: too few 3D keypoints, requesting reset", kfid);
            self.shared.state.request_reset();
            while receiver.try_recv().is_ok() {}
            return;
        }

        self.shared.map.write().update_frame_covisibility(kfid);

        if self.shared.config.do_local_matching && kfid.0 > 0 {
            match match_to_local_map(&self.shared, kfid) {
                Ok(_) => {}
                Err(err) => warn!("[Mapper] {}: local matching failed: {}", kfid, err),
            }
        }

        self.estimator_queue.push(kfid);
    }

    fn degenerate_map(&self, kfid: KeyFrameId) -> bool {
        if !self.shared.state.vision_initialized() {
            return false;
        }
        let nb_3d = self
            .shared
            .map
            .read()
            .get_keyframe(kfid)
            .map_or(0, |kf| kf.nb_3d_kpts);

        (kfid.0 == 1 && nb_3d < MIN_3D_ON_SECOND_KF)
            || (kfid.0 < EARLY_MAP_KEYFRAMES && nb_3d < MIN_3D_ON_EARLY_KF)
    }

    /// Pair the keyframe's left keypoints with right-image locations by
    /// optical flow. Returns the number of pairings formed.
    fn stereo_matching(
        &mut self,
        kfid: KeyFrameId,
        left_pyramid: &Pyramid,
        right: &GrayImage,
    ) -> Result<usize, MapperError> {
        self.right_pyramid = self
            .flow
            .build_pyramid(right, self.shared.config.pyramid_levels);

        let right_cam = self
            .shared
            .map
            .read()
            .camera_right()
            .cloned()
            .ok_or(MapperError::MissingRightCamera)?;

        // Seed each search at the 3D projection into the right camera
        // when available, else at the left pixel.
        let (ids, starts, priors) = {
            let map = self.shared.map.read();
            let kf = map
                .get_keyframe(kfid)
                .ok_or(MapperError::MissingKeyframe(kfid))?;

            let mut ids: Vec<KeypointId> = Vec::new();
            let mut starts: Vec<Vector2<f64>> = Vec::new();
            let mut priors: Vec<Vector2<f64>> = Vec::new();

            for kp in kf.keypoints() {
                if kp.is_stereo() {
                    continue;
                }
                let mut prior = kp.px;
                if kp.is_3d {
                    if let Some(mp) = map.get_mappoint(kp.id) {
                        if mp.is_3d {
                            let p_ref = kf.project_world_to_camera(&mp.position);
                            let p_right = right_cam.t_cam_ref().transform_point(&p_ref);
                            if p_right.z > 0.1 {
                                let proj = right_cam.project(&p_right);
                                if right_cam.in_image(&proj) {
                                    prior = proj;
                                }
                            }
                        }
                    }
                }
                ids.push(kp.id);
                starts.push(kp.px);
                priors.push(prior);
            }
            (ids, starts, priors)
        };

        if ids.is_empty() {
            return Ok(0);
        }

        let settings = KltSettings {
            levels: self.shared.config.pyramid_levels,
            window_size: self.shared.config.window_size,
            sigma: self.shared.config.pyramid_sigma,
            max_fb_distance: self.shared.config.max_klt_distance,
        };
        let statuses = self
            .flow
            .fb_track(left_pyramid, &self.right_pyramid, &starts, &priors, &settings);

        let mut nb_pairs = 0;
        let mut map = self.shared.map.write();
        for (i, status) in statuses.iter().enumerate() {
            if status.ok && right_cam.in_image(&status.px) {
                map.update_keypoint_stereo(kfid, ids[i], status.px);
                nb_pairs += 1;
            }
        }

        Ok(nb_pairs)
    }
}
