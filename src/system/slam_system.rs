//! SLAM system - main entry point and thread orchestration.
//!
//! The `SlamSystem` is the top-level struct users interact with. It owns
//! the shared state, runs the front-end on the caller's thread and spawns
//! the mapper worker (which in turn spawns the estimator). Shutdown flows
//! down the pipeline: tracker -> mapper -> estimator.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;
use crossbeam_channel::bounded;
use image::GrayImage;

use crate::camera::CameraModel;
use crate::config::Config;
use crate::kernels::{FeatureExtractor, OpticalFlowKernel};
use crate::mapping::Mapper;
use crate::tracking::FrontEnd;

use super::estimator::{Estimator, EstimatorQueue, NoopEstimator};
use super::messages::KeyFrameJob;
use super::shared::SharedState;

/// Capacity of the keyframe channel between the front-end and the mapper.
/// The front-end blocks briefly when the mapper falls this far behind.
const KEYFRAME_CHANNEL_CAPACITY: usize = 5;

pub struct SlamSystem {
    shared: Arc<SharedState>,

    /// The front-end runs on the caller's thread.
    front_end: FrontEnd,

    estimator_queue: Arc<EstimatorQueue>,
    mapper_handle: Option<JoinHandle<()>>,
}

impl SlamSystem {
    /// Create a system with the default (no-op) estimator consumer.
    pub fn new(
        config: Config,
        camera_left: CameraModel,
        camera_right: Option<CameraModel>,
        flow: Arc<dyn OpticalFlowKernel>,
        extractor: Box<dyn FeatureExtractor>,
    ) -> Result<Self> {
        Self::with_estimator(
            config,
            camera_left,
            camera_right,
            flow,
            extractor,
            Box::new(NoopEstimator),
        )
    }

    /// Create a system feeding completed keyframes to `estimator`.
    pub fn with_estimator(
        config: Config,
        camera_left: CameraModel,
        camera_right: Option<CameraModel>,
        flow: Arc<dyn OpticalFlowKernel>,
        extractor: Box<dyn FeatureExtractor>,
        estimator: Box<dyn Estimator>,
    ) -> Result<Self> {
        let shared = SharedState::new(config, camera_left, camera_right);
        let (kf_sender, kf_receiver) = bounded::<KeyFrameJob>(KEYFRAME_CHANNEL_CAPACITY);
        let estimator_queue = EstimatorQueue::new();

        let front_end = FrontEnd::new(
            Arc::clone(&shared),
            Arc::clone(&flow),
            extractor,
            kf_sender,
            Arc::clone(&estimator_queue),
        );

        let mapper_handle = Mapper::spawn(
            Arc::clone(&shared),
            flow,
            kf_receiver,
            Arc::clone(&estimator_queue),
            estimator,
        );

        Ok(Self {
            shared,
            front_end,
            estimator_queue,
            mapper_handle: Some(mapper_handle),
        })
    }

    /// Process a monocular frame. Returns whether a keyframe was promoted.
    pub fn track(&mut self, image: &GrayImage, time: f64) -> bool {
        self.front_end.track(image, time)
    }

    /// Process a stereo pair. Returns whether a keyframe was promoted.
    pub fn track_stereo(&mut self, left: &GrayImage, right: &GrayImage, time: f64) -> bool {
        self.front_end.track_stereo(left, right, time)
    }

    /// Shared state handle, e.g. for map inspection or visualization.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Whether the estimator has unconsumed keyframes waiting.
    pub fn new_kf_available(&self) -> bool {
        self.estimator_queue.new_kf_available()
    }

    /// Shut down the pipeline and join the worker threads.
    ///
    /// The mapper observes the exit flag, forwards it to the estimator
    /// and joins it before returning; we only need to join the mapper.
    pub fn shutdown(&mut self) {
        self.shared.state.request_exit();
        self.estimator_queue.request_exit();
        if let Some(handle) = self.mapper_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{FlowStatus, KltSettings, Pyramid};
    use crate::map::Descriptor;
    use nalgebra::Vector2;

    struct StillFlow;

    impl OpticalFlowKernel for StillFlow {
        fn build_pyramid(&self, image: &GrayImage, _levels: u32) -> Pyramid {
            Pyramid::Built {
                levels: vec![image.clone()],
            }
        }

        fn fb_track(
            &self,
            _prev: &Pyramid,
            _cur: &Pyramid,
            points: &[Vector2<f64>],
            _priors: &[Vector2<f64>],
            _settings: &KltSettings,
        ) -> Vec<FlowStatus> {
            points
                .iter()
                .map(|p| FlowStatus { px: *p, ok: true })
                .collect()
        }
    }

    struct RowExtractor;

    impl FeatureExtractor for RowExtractor {
        fn detect(
            &mut self,
            _image: &GrayImage,
            occupied: &[Vector2<f64>],
            max_new: usize,
        ) -> Vec<(Vector2<f64>, Option<Descriptor>)> {
            (0..60)
                .map(|i| Vector2::new(30.0 + 10.0 * i as f64, 240.0))
                .filter(|px| occupied.iter().all(|o| (o - px).norm() > 5.0))
                .take(max_new)
                .map(|px| (px, Some(Descriptor([0u8; 32]))))
                .collect()
        }
    }

    #[test]
    fn test_system_bootstrap_and_shutdown() {
        let camera = CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480);
        let mut system = SlamSystem::new(
            Config::default(),
            camera,
            None,
            Arc::new(StillFlow),
            Box::new(RowExtractor),
        )
        .unwrap();

        let image = GrayImage::new(640, 480);
        assert!(system.track(&image, 0.0));
        assert!(!system.track(&image, 0.05));

        // Give the mapper a moment to consume the bootstrap keyframe.
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert_eq!(system.shared_state().map.read().nb_keyframes(), 1);

        system.shutdown();
    }
}
