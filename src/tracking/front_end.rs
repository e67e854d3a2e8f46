//! Front-end tracker: per-frame optical-flow tracking and keyframe
//! selection.
//!
//! Runs synchronously on the image-producer thread. Each tick rotates the
//! pyramid buffers, seeds the current pose from the motion model, tracks
//! the current frame's keypoints with forward-backward KLT and decides
//! whether to promote the frame to a keyframe. Promotion extracts new
//! detections and enqueues a job for the mapper.

use std::sync::Arc;

use crossbeam_channel::Sender;
use image::GrayImage;
use nalgebra::Vector2;
use tracing::{debug, warn};

use crate::kernels::{FeatureExtractor, FlowStatus, KltSettings, OpticalFlowKernel, Pyramid};
use crate::map::KeypointId;
use crate::system::estimator::EstimatorQueue;
use crate::system::messages::KeyFrameJob;
use crate::system::shared::SharedState;

use super::keyframe_decision::KeyframeDecision;
use super::motion_model::MotionModel;
use super::parallax::compute_parallax;

/// Minimum tracked keypoints to keep trying to initialize.
const MIN_KPS_FOR_INIT: usize = 50;

/// Minimum keypoints that must survive the parallax gate at init.
const MIN_KPS_AT_INIT: usize = 8;

/// A batch of points handed to the optical-flow kernel.
#[derive(Default)]
struct TrackBatch {
    ids: Vec<KeypointId>,
    starts: Vec<Vector2<f64>>,
    priors: Vec<Vector2<f64>>,
}

impl TrackBatch {
    fn push(&mut self, id: KeypointId, start: Vector2<f64>, prior: Vector2<f64>) {
        self.ids.push(id);
        self.starts.push(start);
        self.priors.push(prior);
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub struct FrontEnd {
    shared: Arc<SharedState>,
    flow: Arc<dyn OpticalFlowKernel>,
    extractor: Box<dyn FeatureExtractor>,

    motion_model: MotionModel,
    kf_decision: KeyframeDecision,

    /// Double-buffered pyramids, never shared across threads.
    prev_pyramid: Pyramid,
    cur_pyramid: Pyramid,

    kf_sender: Sender<KeyFrameJob>,
    estimator_queue: Arc<EstimatorQueue>,
}

impl FrontEnd {
    pub fn new(
        shared: Arc<SharedState>,
        flow: Arc<dyn OpticalFlowKernel>,
        extractor: Box<dyn FeatureExtractor>,
        kf_sender: Sender<KeyFrameJob>,
        estimator_queue: Arc<EstimatorQueue>,
    ) -> Self {
        Self {
            shared,
            flow,
            extractor,
            motion_model: MotionModel::new(),
            kf_decision: KeyframeDecision::new(),
            prev_pyramid: Pyramid::Empty,
            cur_pyramid: Pyramid::Empty,
            kf_sender,
            estimator_queue,
        }
    }

    /// Process a monocular frame. Returns whether a keyframe was promoted.
    pub fn track(&mut self, image: &GrayImage, time: f64) -> bool {
        self.track_impl(image, None, time)
    }

    /// Process a stereo pair. Returns whether a keyframe was promoted.
    pub fn track_stereo(&mut self, left: &GrayImage, right: &GrayImage, time: f64) -> bool {
        self.track_impl(left, Some(right), time)
    }

    fn track_impl(&mut self, image: &GrayImage, right: Option<&GrayImage>, time: f64) -> bool {
        if self.shared.state.take_reset_required() {
            self.reset();
        }

        // Preprocess: rotate the image buffers.
        std::mem::swap(&mut self.prev_pyramid, &mut self.cur_pyramid);
        self.cur_pyramid = self
            .flow
            .build_pyramid(image, self.shared.config.pyramid_levels);

        let frame_id = self.shared.map.write().begin_frame(time);

        // Bootstrap: the very first frame becomes a keyframe unconditionally.
        if frame_id.0 == 1 {
            self.create_keyframe(image, right);
            self.finish_frame(time);
            return true;
        }

        // Seed the pose from the motion model.
        if let Some(prior) = self.motion_model.predict(time) {
            self.shared.map.write().set_current_pose(prior);
        }

        self.klt_tracking();

        if !self.shared.state.vision_initialized() {
            let keyframe = self.check_ready_for_init();
            if keyframe {
                self.shared.state.set_vision_initialized(true);
                self.create_keyframe(image, right);
            }
            self.finish_frame(time);
            return keyframe;
        }

        let keyframe = self.check_new_kf_required();
        if keyframe {
            self.create_keyframe(image, right);
        }
        self.finish_frame(time);
        keyframe
    }

    /// Track the current frame's keypoints from the previous image.
    ///
    /// Keypoints with a 3D map point are seeded at the projection of that
    /// point through the pose prior and tracked first with a shallow
    /// pyramid; everything else (and every 3D-prior failure) is tracked
    /// with the full pyramid, seeded at the last observed pixel.
    fn klt_tracking(&mut self) {
        let use_prior = self.shared.config.use_prior;

        let (batch_3d, mut batch_2d) = {
            let map = self.shared.map.read();
            let cur = map.current_frame();
            let camera = map.camera_left();

            let mut batch_3d = TrackBatch::default();
            let mut batch_2d = TrackBatch::default();

            for kp in cur.keypoints() {
                if use_prior && kp.is_3d {
                    if let Some(mp) = map.get_mappoint(kp.id) {
                        if mp.is_3d {
                            let cpt = cur.project_world_to_camera(&mp.position);
                            if cpt.z > 0.1 {
                                let proj = camera.project(&cpt);
                                if camera.in_image(&proj) {
                                    batch_3d.push(kp.id, kp.px, proj);
                                    continue;
                                }
                            }
                        }
                    }
                }
                batch_2d.push(kp.id, kp.px, kp.px);
            }
            (batch_3d, batch_2d)
        };

        // 3D priors first, with a shallow pyramid.
        if !batch_3d.is_empty() {
            let settings = self.klt_settings(1);
            let statuses = self.flow.fb_track(
                &self.prev_pyramid,
                &self.cur_pyramid,
                &batch_3d.starts,
                &batch_3d.priors,
                &settings,
            );

            let nb_priors = batch_3d.len();
            let mut nb_good = 0usize;
            {
                let mut map = self.shared.map.write();
                for (i, status) in statuses.iter().enumerate() {
                    if status.ok && map.camera_left().in_image(&status.px) {
                        map.update_keypoint(batch_3d.ids[i], status.px);
                        nb_good += 1;
                    } else {
                        // Retry with the full pyramid, seeded at the last
                        // observed pixel.
                        batch_2d.push(batch_3d.ids[i], batch_3d.starts[i], batch_3d.starts[i]);
                    }
                }
            }

            // Too many lost 3D priors: the pose prior is unreliable.
            self.shared
                .state
                .set_p3p_required(nb_good * 3 < nb_priors);
        } else {
            self.shared.state.set_p3p_required(false);
        }

        if batch_2d.is_empty() {
            return;
        }

        let settings = self.klt_settings(self.shared.config.pyramid_levels);
        let statuses = self.flow.fb_track(
            &self.prev_pyramid,
            &self.cur_pyramid,
            &batch_2d.starts,
            &batch_2d.priors,
            &settings,
        );
        self.apply_flow(&batch_2d, &statuses);
    }

    /// Apply one batch of flow results: update survivors, drop failures.
    fn apply_flow(&self, batch: &TrackBatch, statuses: &[FlowStatus]) {
        let mut map = self.shared.map.write();
        for (i, status) in statuses.iter().enumerate() {
            if status.ok && map.camera_left().in_image(&status.px) {
                map.update_keypoint(batch.ids[i], status.px);
            } else {
                map.remove_obs_from_current_frame(batch.ids[i]);
            }
        }
    }

    /// Initialization gate: reset on starvation, promote on parallax.
    fn check_ready_for_init(&self) -> bool {
        let map = self.shared.map.read();
        let cur = map.current_frame();

        if cur.nb_keypoints < MIN_KPS_FOR_INIT {
            debug!(
                "[FrontEnd] only {} keypoints left before init, requesting reset",
                cur.nb_keypoints
            );
            self.shared.state.request_reset();
            return false;
        }

        let parallax = compute_parallax(&map, cur.kfid, cur, map.camera_left(), true, false, true);
        parallax > self.shared.config.initial_parallax && cur.nb_keypoints >= MIN_KPS_AT_INIT
    }

    /// Steady-state keyframe policy: occupancy drop or parallax drift.
    fn check_new_kf_required(&self) -> bool {
        let map = self.shared.map.read();
        let cur = map.current_frame();
        let parallax = compute_parallax(&map, cur.kfid, cur, map.camera_left(), true, false, true);

        self.kf_decision.should_create_keyframe(
            cur.nb_keypoints,
            self.shared.config.max_nb_keypoints,
            parallax,
            0.5 * self.shared.config.initial_parallax,
        )
    }

    /// Promote the current frame, extract new detections and hand the
    /// keyframe to the mapper.
    fn create_keyframe(&mut self, image: &GrayImage, right: Option<&GrayImage>) {
        let (occupied, budget) = {
            let map = self.shared.map.read();
            let nb = map.current_frame().nb_keypoints;
            (
                map.current_keypoint_pixels(),
                self.shared.config.max_nb_keypoints.saturating_sub(nb),
            )
        };

        let detections = self.extractor.detect(image, &occupied, budget);
        let kfid = self.shared.map.write().create_keyframe(&detections);

        debug!(
            "[FrontEnd] promoted {} with {} new detections",
            kfid,
            detections.len()
        );

        let job = KeyFrameJob {
            kfid,
            pyramid: self.cur_pyramid.clone(),
            right_image: right.cloned(),
        };
        if self.kf_sender.send(job).is_err() {
            warn!("[FrontEnd] mapper queue closed, dropping {}", kfid);
        }
    }

    /// Record the final pose of this frame in the motion model.
    fn finish_frame(&mut self, time: f64) {
        let pose = self.shared.map.read().current_frame().t_wc().clone();
        self.motion_model.update(&pose, time);
    }

    /// Observe a reset request: drop all map state and start over.
    fn reset(&mut self) {
        debug!("[FrontEnd] reset");
        self.shared.map.write().reset();
        self.motion_model.reset();
        self.prev_pyramid = Pyramid::Empty;
        self.cur_pyramid = Pyramid::Empty;
        self.shared.state.set_vision_initialized(false);
        self.shared.state.set_p3p_required(false);
        self.estimator_queue.reset();
    }

    fn klt_settings(&self, levels: u32) -> KltSettings {
        KltSettings {
            levels,
            window_size: self.shared.config.window_size,
            sigma: self.shared.config.pyramid_sigma,
            max_fb_distance: self.shared.config.max_klt_distance,
        }
    }
}
