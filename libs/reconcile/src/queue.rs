//! Per-tenant batch queue and conflict resolution.

use std::collections::{HashMap, VecDeque};

use cove_id::ServiceId;
use cove_model::DesiredState;
use tracing::debug;

use crate::{merge_batches, CancellableService, ReconcileError, ServiceStateChangeBatch};

/// The batch a tenant is currently executing.
#[derive(Debug, Clone)]
pub struct PendingServiceStateChangeBatch {
    pub services: HashMap<ServiceId, CancellableService>,
    pub desired_state: DesiredState,
    pub emergency: bool,
}

impl PendingServiceStateChangeBatch {
    fn from_batch(batch: &ServiceStateChangeBatch) -> Self {
        Self {
            services: batch
                .services()
                .iter()
                .map(|s| (s.id().clone(), s.clone()))
                .collect(),
            desired_state: batch.desired_state,
            emergency: batch.emergency,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// How an overlapping service is settled between an older and a newer batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    /// The older request stands; the newer one is discarded.
    DropNew,
    /// The newer request replaces the older one.
    SupersedeOld,
}

fn resolve(
    old_state: DesiredState,
    old_emergency: bool,
    new_state: DesiredState,
    new_emergency: bool,
) -> Resolution {
    if old_emergency {
        // An emergency already queued for this service wins over anything
        // except a different emergency that is not overridden by a stop.
        if !new_emergency || old_state == new_state || old_state == DesiredState::Stop {
            return Resolution::DropNew;
        }
        return Resolution::SupersedeOld;
    }
    if new_emergency || old_state != new_state {
        return Resolution::SupersedeOld;
    }
    Resolution::DropNew
}

/// Ordered queue of batches for one tenant plus its pending batch.
#[derive(Debug, Default)]
pub struct TenantQueue {
    batches: VecDeque<ServiceStateChangeBatch>,
    pending: Option<PendingServiceStateChangeBatch>,
}

impl TenantQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile a new request against queued and pending work, then merge
    /// what remains into the queue.
    ///
    /// Returns `true` when something was queued and the executor should be
    /// woken; `false` when the request was entirely redundant.
    pub fn schedule(&mut self, mut new: ServiceStateChangeBatch) -> Result<bool, ReconcileError> {
        self.reconcile_with_queue(&mut new);
        if new.is_empty() {
            debug!("request redundant with queued batches");
            return Ok(false);
        }

        self.reconcile_with_pending(&mut new);
        if new.is_empty() {
            debug!("request redundant with pending batch");
            return Ok(false);
        }

        if new.emergency {
            self.merge_emergency(new)?;
        } else {
            self.merge_tail(new)?;
        }
        Ok(true)
    }

    fn reconcile_with_queue(&mut self, new: &mut ServiceStateChangeBatch) {
        for old in self.batches.iter_mut() {
            for id in new.service_ids() {
                if !old.contains(&id) {
                    continue;
                }
                match resolve(old.desired_state, old.emergency, new.desired_state, new.emergency) {
                    Resolution::DropNew => {
                        if let Some(dropped) = new.remove(&id) {
                            dropped.cancel();
                        }
                    }
                    Resolution::SupersedeOld => {
                        if let Some(superseded) = old.remove(&id) {
                            debug!(
                                service_id = %id,
                                old_state = %old.desired_state,
                                new_state = %new.desired_state,
                                "superseding queued service"
                            );
                            superseded.cancel();
                        }
                    }
                }
            }
        }
        self.batches.retain(|b| !b.is_empty());
    }

    fn reconcile_with_pending(&mut self, new: &mut ServiceStateChangeBatch) {
        let Some(pending) = &self.pending else {
            return;
        };
        for id in new.service_ids() {
            let Some(running) = pending.services.get(&id) else {
                continue;
            };
            match resolve(pending.desired_state, pending.emergency, new.desired_state, new.emergency) {
                Resolution::DropNew => {
                    if let Some(dropped) = new.remove(&id) {
                        dropped.cancel();
                    }
                }
                Resolution::SupersedeOld => {
                    debug!(service_id = %id, "cancelling wait on pending service");
                    running.cancel();
                }
            }
        }
    }

    /// Merge with the run of same-state emergency batches at the front.
    fn merge_emergency(&mut self, new: ServiceStateChangeBatch) -> Result<(), ReconcileError> {
        let run = self
            .batches
            .iter()
            .take_while(|b| b.emergency && b.desired_state == new.desired_state)
            .count();

        let mut to_merge: Vec<_> = self.batches.drain(..run).collect();
        to_merge.push(new);
        let merged = merge_batches(to_merge)?;

        for batch in merged.into_iter().rev() {
            self.batches.push_front(batch);
        }
        Ok(())
    }

    /// Merge with the run of compatible batches at the back.
    fn merge_tail(&mut self, new: ServiceStateChangeBatch) -> Result<(), ReconcileError> {
        let run = self
            .batches
            .iter()
            .rev()
            .take_while(|b| b.is_compatible(&new))
            .count();

        let start = self.batches.len() - run;
        let mut to_merge: Vec<_> = self.batches.drain(start..).collect();
        to_merge.push(new);
        self.batches.extend(merge_batches(to_merge)?);
        Ok(())
    }

    /// Dequeue the head batch and record it as pending.
    ///
    /// With nothing queued the pending batch is cleared.
    pub fn next_batch(&mut self) -> Result<ServiceStateChangeBatch, ReconcileError> {
        match self.batches.pop_front() {
            Some(batch) => {
                self.pending = Some(PendingServiceStateChangeBatch::from_batch(&batch));
                Ok(batch)
            }
            None => {
                self.pending = None;
                Err(ReconcileError::BatchQueueEmpty)
            }
        }
    }

    pub fn clear_pending(&mut self) {
        self.pending = None;
    }

    pub fn pending(&self) -> Option<&PendingServiceStateChangeBatch> {
        self.pending.as_ref()
    }

    pub fn batches(&self) -> impl Iterator<Item = &ServiceStateChangeBatch> {
        self.batches.iter()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// True when nothing is queued and nothing is executing.
    pub fn is_drained(&self) -> bool {
        self.batches.is_empty() && self.pending.as_ref().map_or(true, |p| p.is_empty())
    }

    /// Look up a service that is queued or pending.
    pub fn find(&self, id: &ServiceId) -> Option<&CancellableService> {
        self.batches
            .iter()
            .find_map(|b| b.get(id))
            .or_else(|| self.pending.as_ref().and_then(|p| p.services.get(id)))
    }

    /// Cancel every queued and pending service and empty the queue.
    pub fn cancel_all(&mut self) {
        for batch in self.batches.drain(..) {
            batch.cancel_all();
        }
        if let Some(pending) = self.pending.take() {
            for svc in pending.services.values() {
                svc.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cove_id::TenantId;
    use cove_model::Service;
    use proptest::prelude::*;

    use crate::priority_tier;

    fn svc(id: &str, start_level: u32, emergency_level: u32) -> Service {
        Service::new(ServiceId::parse(id).unwrap(), TenantId::parse("t").unwrap(), id)
            .with_levels(start_level, emergency_level)
    }

    fn abc() -> Vec<Service> {
        vec![svc("A", 2, 0), svc("B", 3, 1), svc("C", 2, 2)]
    }

    fn batch(services: Vec<Service>, state: DesiredState, emergency: bool) -> ServiceStateChangeBatch {
        ServiceStateChangeBatch::from_services(services, state, emergency)
    }

    fn layout(queue: &TenantQueue) -> Vec<(DesiredState, bool, Vec<String>)> {
        queue
            .batches()
            .map(|b| {
                (
                    b.desired_state,
                    b.emergency,
                    b.services().iter().map(|s| s.id().to_string()).collect(),
                )
            })
            .collect()
    }

    fn names(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_schedule_run_then_emergency_stop() {
        let mut queue = TenantQueue::new();
        assert!(queue.schedule(batch(abc(), DesiredState::Run, false)).unwrap());
        assert_eq!(
            layout(&queue),
            vec![
                (DesiredState::Run, false, names(&["A", "C"])),
                (DesiredState::Run, false, names(&["B"])),
            ]
        );

        assert!(queue.schedule(batch(abc(), DesiredState::Stop, true)).unwrap());
        assert_eq!(
            layout(&queue),
            vec![
                (DesiredState::Stop, true, names(&["B"])),
                (DesiredState::Stop, true, names(&["C"])),
                (DesiredState::Stop, true, names(&["A"])),
            ]
        );
    }

    #[test]
    fn test_redundant_schedule_is_noop() {
        let mut queue = TenantQueue::new();
        queue.schedule(batch(abc(), DesiredState::Run, false)).unwrap();
        let before = layout(&queue);

        let again = batch(abc(), DesiredState::Run, false);
        let signals: Vec<_> = again.services().iter().map(|s| s.signal().clone()).collect();
        assert!(!queue.schedule(again).unwrap());
        assert_eq!(layout(&queue), before);
        assert!(signals.iter().all(|s| s.is_cancelled()));
    }

    #[test]
    fn test_emergency_blocks_later_non_emergency() {
        let mut queue = TenantQueue::new();
        queue.schedule(batch(abc(), DesiredState::Stop, true)).unwrap();
        assert!(!queue.schedule(batch(abc(), DesiredState::Run, false)).unwrap());
        assert_eq!(queue.len(), 3);
        assert!(queue.batches().all(|b| b.emergency));
    }

    #[test]
    fn test_unrelated_non_emergency_queues_behind_emergency() {
        let mut queue = TenantQueue::new();
        queue.schedule(batch(abc(), DesiredState::Stop, true)).unwrap();
        queue
            .schedule(batch(vec![svc("D", 2, 0)], DesiredState::Run, false))
            .unwrap();
        let last = layout(&queue).pop().unwrap();
        assert_eq!(last, (DesiredState::Run, false, names(&["D"])));
    }

    #[test]
    fn test_different_state_supersedes_queued() {
        let mut queue = TenantQueue::new();
        let run = batch(abc(), DesiredState::Run, false);
        let a_signal = run.get(&ServiceId::parse("A").unwrap()).unwrap().signal().clone();
        queue.schedule(run).unwrap();

        queue
            .schedule(batch(vec![svc("A", 2, 0)], DesiredState::Stop, false))
            .unwrap();

        assert!(a_signal.is_cancelled());
        assert_eq!(
            layout(&queue),
            vec![
                (DesiredState::Run, false, names(&["C"])),
                (DesiredState::Run, false, names(&["B"])),
                (DesiredState::Stop, false, names(&["A"])),
            ]
        );
    }

    #[test]
    fn test_emptied_batches_are_purged() {
        let mut queue = TenantQueue::new();
        queue
            .schedule(batch(vec![svc("A", 1, 0)], DesiredState::Run, false))
            .unwrap();
        queue
            .schedule(batch(vec![svc("A", 1, 0)], DesiredState::Pause, false))
            .unwrap();
        assert_eq!(layout(&queue), vec![(DesiredState::Pause, false, names(&["A"]))]);
    }

    #[test]
    fn test_tail_merge_only_with_compatible_run() {
        let mut queue = TenantQueue::new();
        queue
            .schedule(batch(vec![svc("A", 2, 0)], DesiredState::Run, false))
            .unwrap();
        queue
            .schedule(batch(vec![svc("B", 1, 0)], DesiredState::Stop, false))
            .unwrap();
        queue
            .schedule(batch(vec![svc("C", 1, 0)], DesiredState::Run, false))
            .unwrap();
        assert_eq!(
            layout(&queue),
            vec![
                (DesiredState::Run, false, names(&["A"])),
                (DesiredState::Stop, false, names(&["B"])),
                (DesiredState::Run, false, names(&["C"])),
            ]
        );

        queue
            .schedule(batch(vec![svc("D", 1, 0)], DesiredState::Run, false))
            .unwrap();
        assert_eq!(layout(&queue).last().unwrap().2, names(&["C", "D"]));
    }

    #[test]
    fn test_emergency_merges_with_front_run() {
        let mut queue = TenantQueue::new();
        queue
            .schedule(batch(vec![svc("Q", 1, 0)], DesiredState::Run, false))
            .unwrap();
        queue
            .schedule(batch(vec![svc("A", 1, 2)], DesiredState::Stop, true))
            .unwrap();
        queue
            .schedule(batch(vec![svc("B", 1, 1)], DesiredState::Stop, true))
            .unwrap();
        assert_eq!(
            layout(&queue),
            vec![
                (DesiredState::Stop, true, names(&["B"])),
                (DesiredState::Stop, true, names(&["A"])),
                (DesiredState::Run, false, names(&["Q"])),
            ]
        );
    }

    #[test]
    fn test_pending_superseded_is_cancelled_not_removed() {
        let mut queue = TenantQueue::new();
        queue.schedule(batch(abc(), DesiredState::Run, false)).unwrap();
        let head = queue.next_batch().unwrap();
        let a = head.get(&ServiceId::parse("A").unwrap()).unwrap().clone();

        assert!(queue
            .schedule(batch(vec![svc("A", 2, 0)], DesiredState::Stop, false))
            .unwrap());
        assert!(a.is_cancelled());
        assert!(queue.pending().unwrap().services.contains_key(a.id()));
        assert_eq!(layout(&queue).last().unwrap().0, DesiredState::Stop);
    }

    #[test]
    fn test_pending_same_state_drops_new() {
        let mut queue = TenantQueue::new();
        queue.schedule(batch(abc(), DesiredState::Run, false)).unwrap();
        let head = queue.next_batch().unwrap();

        assert!(!queue
            .schedule(batch(vec![svc("A", 2, 0)], DesiredState::Run, false))
            .unwrap());
        assert!(!head.services()[0].is_cancelled());
    }

    #[test]
    fn test_pending_emergency_stop_wins() {
        let mut queue = TenantQueue::new();
        queue.schedule(batch(abc(), DesiredState::Stop, true)).unwrap();
        queue.next_batch().unwrap();

        assert!(!queue
            .schedule(batch(vec![svc("B", 3, 1)], DesiredState::Run, true))
            .unwrap());
    }

    #[test]
    fn test_next_batch_and_drain() {
        let mut queue = TenantQueue::new();
        assert!(matches!(queue.next_batch(), Err(ReconcileError::BatchQueueEmpty)));
        assert!(queue.is_drained());

        queue.schedule(batch(abc(), DesiredState::Run, false)).unwrap();
        let first = queue.next_batch().unwrap();
        assert_eq!(first.len(), 2);
        assert!(!queue.is_drained());
        assert!(queue.find(&ServiceId::parse("B").unwrap()).is_some());
        assert!(queue.find(&ServiceId::parse("A").unwrap()).is_some());

        queue.clear_pending();
        queue.next_batch().unwrap();
        queue.clear_pending();
        assert!(queue.is_drained());
    }

    #[test]
    fn test_cancel_all() {
        let mut queue = TenantQueue::new();
        queue.schedule(batch(abc(), DesiredState::Run, false)).unwrap();
        let pending = queue.next_batch().unwrap();
        let queued: Vec<_> = queue
            .batches()
            .flat_map(|b| b.services().iter().cloned())
            .collect();

        queue.cancel_all();
        assert!(queue.is_drained());
        assert!(pending.services().iter().all(|s| s.is_cancelled()));
        assert!(queued.iter().all(|s| s.is_cancelled()));
    }

    fn arb_request() -> impl Strategy<Value = (Vec<(u8, u32, u32)>, u8, bool)> {
        (
            prop::collection::vec((0u8..6, 0u32..4, 0u32..3), 1..5),
            0u8..4,
            any::<bool>(),
        )
    }

    fn state_from(code: u8) -> DesiredState {
        match code {
            0 => DesiredState::Run,
            1 => DesiredState::Stop,
            2 => DesiredState::Pause,
            _ => DesiredState::Restart,
        }
    }

    proptest! {
        #[test]
        fn prop_queue_invariants(requests in prop::collection::vec(arb_request(), 1..8)) {
            let mut queue = TenantQueue::new();
            for (members, code, emergency) in requests {
                let services = members
                    .into_iter()
                    .map(|(id, start, em)| svc(&format!("s{id}"), start, em))
                    .collect::<Vec<_>>();
                let state = state_from(code);
                queue.schedule(batch(services, state, emergency)).unwrap();

                // every batch holds one priority tier
                for b in queue.batches() {
                    let first = priority_tier(&b.services()[0].service, b.desired_state, b.emergency);
                    for s in b.services() {
                        prop_assert_eq!(priority_tier(&s.service, b.desired_state, b.emergency), first);
                    }
                }

                // emergency batches precede non-emergency ones
                let flags: Vec<bool> = queue.batches().map(|b| b.emergency).collect();
                let first_calm = flags.iter().position(|e| !e).unwrap_or(flags.len());
                prop_assert!(flags[first_calm..].iter().all(|e| !e));

                // each service is queued at most once
                let mut seen = std::collections::HashSet::new();
                for b in queue.batches() {
                    for s in b.services() {
                        prop_assert!(seen.insert(s.id().clone()));
                    }
                }
            }
        }
    }
}
