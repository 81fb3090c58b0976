//! Batches and the merge algorithm.

use std::cmp::Ordering;

use cove_id::ServiceId;
use cove_model::{DesiredState, Service};

use crate::{CancellableService, ReconcileError};

/// An ordered set of services sharing one desired state and emergency flag.
#[derive(Debug, Clone)]
pub struct ServiceStateChangeBatch {
    services: Vec<CancellableService>,
    pub desired_state: DesiredState,
    pub emergency: bool,
}

impl ServiceStateChangeBatch {
    pub fn new(desired_state: DesiredState, emergency: bool) -> Self {
        Self {
            services: Vec::new(),
            desired_state,
            emergency,
        }
    }

    /// Build a batch from plain services. A repeated ID keeps the last entry.
    pub fn from_services(
        services: impl IntoIterator<Item = Service>,
        desired_state: DesiredState,
        emergency: bool,
    ) -> Self {
        let mut batch = Self::new(desired_state, emergency);
        for svc in services {
            batch.push(CancellableService::new(svc));
        }
        batch
    }

    pub fn services(&self) -> &[CancellableService] {
        &self.services
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.services.iter().map(|s| s.id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn get(&self, id: &ServiceId) -> Option<&CancellableService> {
        self.services.iter().find(|s| s.id() == id)
    }

    pub fn contains(&self, id: &ServiceId) -> bool {
        self.get(id).is_some()
    }

    /// Add a service, replacing any entry with the same ID in place.
    pub fn push(&mut self, svc: CancellableService) {
        match self.services.iter_mut().find(|s| s.id() == svc.id()) {
            Some(existing) => *existing = svc,
            None => self.services.push(svc),
        }
    }

    pub fn remove(&mut self, id: &ServiceId) -> Option<CancellableService> {
        let idx = self.services.iter().position(|s| s.id() == id)?;
        Some(self.services.remove(idx))
    }

    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&CancellableService) -> bool,
    {
        self.services.retain(f);
    }

    /// Raise the cancel signal of every member.
    pub fn cancel_all(&self) {
        for svc in &self.services {
            svc.cancel();
        }
    }

    pub fn into_services(self) -> Vec<CancellableService> {
        self.services
    }

    /// True when this batch can be merged with `other`.
    pub fn is_compatible(&self, other: &ServiceStateChangeBatch) -> bool {
        self.desired_state == other.desired_state && self.emergency == other.emergency
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Identity of a priority tier; services sharing one are scheduled together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriorityTier {
    pub level: u32,

    /// Emergency level 0 is further split by start level.
    pub start_level: Option<u32>,
}

/// The tier a service falls into for the given desired state and flag.
pub fn priority_tier(service: &Service, desired_state: DesiredState, emergency: bool) -> PriorityTier {
    if is_emergency_stop(desired_state, emergency) {
        let level = service.emergency_shutdown_level;
        PriorityTier {
            level,
            start_level: (level == 0).then_some(service.start_level),
        }
    } else {
        PriorityTier {
            level: service.start_level,
            start_level: None,
        }
    }
}

fn is_emergency_stop(desired_state: DesiredState, emergency: bool) -> bool {
    emergency && desired_state == DesiredState::Stop
}

/// Level 0 means "unset" and ranks after every explicit level.
fn rank(level: u32) -> u32 {
    level.wrapping_sub(1)
}

fn compare(a: &Service, b: &Service, desired_state: DesiredState, emergency: bool) -> Ordering {
    let by_start = || rank(a.start_level).cmp(&rank(b.start_level));

    match desired_state {
        DesiredState::Run | DesiredState::Restart => by_start(),
        DesiredState::Stop if emergency => rank(a.emergency_shutdown_level)
            .cmp(&rank(b.emergency_shutdown_level))
            .then_with(|| by_start().reverse()),
        DesiredState::Stop | DesiredState::Pause => by_start().reverse(),
    }
}

// =============================================================================
// Merge
// =============================================================================

/// Merge compatible batches and regroup them by priority tier.
///
/// The services of every batch are concatenated, stably sorted by the
/// priority order for the shared desired state, then split wherever the
/// priority tier changes.
pub fn merge_batches(
    batches: Vec<ServiceStateChangeBatch>,
) -> Result<Vec<ServiceStateChangeBatch>, ReconcileError> {
    let Some(first) = batches.first() else {
        return Ok(Vec::new());
    };
    let desired_state = first.desired_state;
    let emergency = first.emergency;

    let mut services = Vec::new();
    for batch in batches {
        if batch.desired_state != desired_state || batch.emergency != emergency {
            return Err(ReconcileError::MismatchedDesiredStates {
                expected: desired_state,
                expected_emergency: emergency,
                actual: batch.desired_state,
                actual_emergency: batch.emergency,
            });
        }
        services.extend(batch.into_services());
    }

    services.sort_by(|a, b| compare(&a.service, &b.service, desired_state, emergency));

    let mut merged: Vec<ServiceStateChangeBatch> = Vec::new();
    let mut current_tier = None;
    for svc in services {
        let tier = priority_tier(&svc.service, desired_state, emergency);
        if current_tier != Some(tier) {
            merged.push(ServiceStateChangeBatch::new(desired_state, emergency));
            current_tier = Some(tier);
        }
        if let Some(batch) = merged.last_mut() {
            batch.services.push(svc);
        }
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cove_id::TenantId;
    use rstest::rstest;

    fn svc(id: &str, start_level: u32, emergency_level: u32) -> Service {
        Service::new(ServiceId::parse(id).unwrap(), TenantId::parse("t").unwrap(), id)
            .with_levels(start_level, emergency_level)
    }

    fn abc() -> Vec<Service> {
        vec![svc("A", 2, 0), svc("B", 3, 1), svc("C", 2, 2)]
    }

    fn ids(batches: &[ServiceStateChangeBatch]) -> Vec<Vec<String>> {
        batches
            .iter()
            .map(|b| b.services().iter().map(|s| s.id().to_string()).collect())
            .collect()
    }

    #[test]
    fn test_merge_run_groups_by_start_level() {
        let batch = ServiceStateChangeBatch::from_services(abc(), DesiredState::Run, false);
        let merged = merge_batches(vec![batch]).unwrap();
        assert_eq!(ids(&merged), vec![vec!["A", "C"], vec!["B"]]);
    }

    #[test]
    fn test_merge_emergency_stop_orders_level_zero_last() {
        let batch = ServiceStateChangeBatch::from_services(abc(), DesiredState::Stop, true);
        let merged = merge_batches(vec![batch]).unwrap();
        assert_eq!(ids(&merged), vec![vec!["B"], vec!["C"], vec!["A"]]);
    }

    #[test]
    fn test_merge_emergency_level_zero_splits_by_reverse_start_level() {
        let services = vec![svc("X", 1, 0), svc("Y", 3, 0), svc("Z", 3, 0), svc("W", 2, 4)];
        let batch = ServiceStateChangeBatch::from_services(services, DesiredState::Stop, true);
        let merged = merge_batches(vec![batch]).unwrap();
        assert_eq!(ids(&merged), vec![vec!["W"], vec!["Y", "Z"], vec!["X"]]);
    }

    #[test]
    fn test_merge_emergency_nonzero_level_ignores_start_level_for_grouping() {
        let services = vec![svc("X", 1, 2), svc("Y", 3, 2)];
        let batch = ServiceStateChangeBatch::from_services(services, DesiredState::Stop, true);
        let merged = merge_batches(vec![batch]).unwrap();
        // one tier, ordered by reverse start level
        assert_eq!(ids(&merged), vec![vec!["Y", "X"]]);
    }

    #[rstest]
    #[case(DesiredState::Stop, vec![vec!["B"], vec!["A", "C"]])]
    #[case(DesiredState::Pause, vec![vec!["B"], vec!["A", "C"]])]
    #[case(DesiredState::Restart, vec![vec!["A", "C"], vec!["B"]])]
    fn test_merge_orders(#[case] state: DesiredState, #[case] expected: Vec<Vec<&str>>) {
        let batch = ServiceStateChangeBatch::from_services(abc(), state, false);
        let merged = merge_batches(vec![batch]).unwrap();
        assert_eq!(ids(&merged), expected);
    }

    #[test]
    fn test_start_level_zero_starts_last() {
        let services = vec![svc("late", 0, 0), svc("early", 1, 0)];
        let batch = ServiceStateChangeBatch::from_services(services, DesiredState::Run, false);
        let merged = merge_batches(vec![batch]).unwrap();
        assert_eq!(ids(&merged), vec![vec!["early"], vec!["late"]]);
    }

    #[test]
    fn test_merge_concatenates_batches() {
        let first = ServiceStateChangeBatch::from_services(vec![svc("A", 2, 0)], DesiredState::Run, false);
        let second = ServiceStateChangeBatch::from_services(
            vec![svc("B", 1, 0), svc("C", 2, 0)],
            DesiredState::Run,
            false,
        );
        let merged = merge_batches(vec![first, second]).unwrap();
        assert_eq!(ids(&merged), vec![vec!["B"], vec!["A", "C"]]);
    }

    #[test]
    fn test_merge_mismatched_fails() {
        let run = ServiceStateChangeBatch::from_services(abc(), DesiredState::Run, false);
        let stop = ServiceStateChangeBatch::from_services(abc(), DesiredState::Stop, false);
        let err = merge_batches(vec![run, stop]).unwrap_err();
        assert!(matches!(err, ReconcileError::MismatchedDesiredStates { .. }));

        let calm = ServiceStateChangeBatch::from_services(abc(), DesiredState::Stop, false);
        let urgent = ServiceStateChangeBatch::from_services(abc(), DesiredState::Stop, true);
        assert!(merge_batches(vec![calm, urgent]).is_err());
    }

    #[test]
    fn test_merge_empty() {
        assert!(merge_batches(Vec::new()).unwrap().is_empty());
        let empty = ServiceStateChangeBatch::new(DesiredState::Run, false);
        assert!(merge_batches(vec![empty]).unwrap().is_empty());
    }

    #[test]
    fn test_push_replaces_same_id() {
        let mut batch = ServiceStateChangeBatch::new(DesiredState::Run, false);
        batch.push(CancellableService::new(svc("A", 1, 0)));
        batch.push(CancellableService::new(svc("A", 5, 0)));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.services()[0].service.start_level, 5);
    }
}
