//! MapPoint - a landmark observed by one or more keyframes.
//!
//! Map points are created as 2D bearing candidates when their keypoint is
//! extracted and promoted to 3D by the mapper after triangulation. A map
//! point dies when its observer list empties.

use std::collections::BTreeSet;

use nalgebra::Vector3;

use super::types::{Descriptor, KeyFrameId, KeypointId};

/// A landmark, identified by the keypoint that first observed it.
#[derive(Debug, Clone)]
pub struct MapPoint {
    pub id: KeypointId,

    /// World position. Only meaningful when `is_3d` is set.
    pub position: Vector3<f64>,

    /// Whether the point has been triangulated.
    pub is_3d: bool,

    /// Keyframe that created this point.
    pub kfid: KeyFrameId,

    /// Inverse depth in the first observer's camera, updated on promotion.
    pub invdepth: f64,

    /// Observing keyframes, ordered by id. Keyframe ids are monotonic, so
    /// the first entry is the oldest surviving observer.
    observers: BTreeSet<KeyFrameId>,

    /// Representative descriptor.
    pub desc: Option<Descriptor>,
}

impl MapPoint {
    pub fn new(id: KeypointId, kfid: KeyFrameId, desc: Option<Descriptor>) -> Self {
        let mut observers = BTreeSet::new();
        observers.insert(kfid);
        Self {
            id,
            position: Vector3::zeros(),
            is_3d: false,
            kfid,
            invdepth: -1.0,
            observers,
            desc,
        }
    }

    pub fn add_observer(&mut self, kfid: KeyFrameId) {
        self.observers.insert(kfid);
    }

    /// Returns true if the observation existed and was removed.
    pub fn remove_observer(&mut self, kfid: KeyFrameId) -> bool {
        self.observers.remove(&kfid)
    }

    pub fn is_observed_by(&self, kfid: KeyFrameId) -> bool {
        self.observers.contains(&kfid)
    }

    /// Oldest surviving observer (the canonical anchor for triangulation).
    pub fn first_observer(&self) -> Option<KeyFrameId> {
        self.observers.first().copied()
    }

    pub fn observers(&self) -> impl Iterator<Item = KeyFrameId> + '_ {
        self.observers.iter().copied()
    }

    pub fn nb_observers(&self) -> usize {
        self.observers.len()
    }

    /// Whether two map points share no observing keyframe.
    pub fn observers_disjoint(&self, other: &MapPoint) -> bool {
        self.observers.is_disjoint(&other.observers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creation_registers_first_observer() {
        let mp = MapPoint::new(KeypointId(7), KeyFrameId(2), None);
        assert!(!mp.is_3d);
        assert_eq!(mp.nb_observers(), 1);
        assert_eq!(mp.first_observer(), Some(KeyFrameId(2)));
    }

    #[test]
    fn test_observers_stay_ordered_and_deduplicated() {
        let mut mp = MapPoint::new(KeypointId(0), KeyFrameId(5), None);
        mp.add_observer(KeyFrameId(9));
        mp.add_observer(KeyFrameId(3));
        mp.add_observer(KeyFrameId(9));

        let obs: Vec<_> = mp.observers().collect();
        assert_eq!(obs, vec![KeyFrameId(3), KeyFrameId(5), KeyFrameId(9)]);
        assert_eq!(mp.first_observer(), Some(KeyFrameId(3)));
    }

    #[test]
    fn test_remove_observer_shifts_first() {
        let mut mp = MapPoint::new(KeypointId(0), KeyFrameId(1), None);
        mp.add_observer(KeyFrameId(4));

        assert!(mp.remove_observer(KeyFrameId(1)));
        assert_eq!(mp.first_observer(), Some(KeyFrameId(4)));
        assert!(!mp.remove_observer(KeyFrameId(1)));
    }

    #[test]
    fn test_observers_disjoint() {
        let mut a = MapPoint::new(KeypointId(0), KeyFrameId(0), None);
        let b = MapPoint::new(KeypointId(1), KeyFrameId(1), None);
        assert!(a.observers_disjoint(&b));

        a.add_observer(KeyFrameId(1));
        assert!(!a.observers_disjoint(&b));
    }
}
