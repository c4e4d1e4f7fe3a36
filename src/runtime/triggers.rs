/// Trigger coordinator
///
/// Decouples manual-trigger firing from execution: a fire records a pending
/// intent for one trigger node, and an execution pass later consumes pending
/// intents for its flow. Concurrent fires for the same trigger while one is
/// already pending or in flight coalesce into that single firing, so a burst
/// of requests yields exactly one resulting execution.
///
/// An intent is in one of two states: pending (recorded, not yet picked up)
/// or claimed (owned by one in-flight pass). A pass claims exactly the
/// intents it consumes; claimed intents still coalesce new fires but are
/// never handed to a second pass, so one fire can never run twice.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct IntentSets {
    pending: HashSet<(String, String)>,
    claimed: HashSet<(String, String)>,
}

/// Manual-trigger intents, keyed (flow id, trigger node id)
#[derive(Debug, Default)]
pub struct TriggerCoordinator {
    intents: Mutex<IntentSets>,
}

impl TriggerCoordinator {
    pub fn new() -> Self {
        Self {
            intents: Mutex::new(IntentSets::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IntentSets> {
        match self.intents.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a pending firing for the given trigger node.
    ///
    /// Returns true when this call created the intent, false when it coalesced
    /// into one that is already pending or already claimed by a running pass.
    pub fn fire(&self, flow_id: &str, node_id: &str) -> bool {
        let mut intents = self.lock();
        let key = (flow_id.to_string(), node_id.to_string());
        if intents.claimed.contains(&key) {
            tracing::debug!(
                "🔔 Trigger {}/{} already in flight, coalesced",
                flow_id,
                node_id
            );
            return false;
        }
        let inserted = intents.pending.insert(key);
        if inserted {
            tracing::info!("🔔 Trigger fired: {}/{}", flow_id, node_id);
        } else {
            tracing::debug!(
                "🔔 Trigger {}/{} already pending, coalesced",
                flow_id,
                node_id
            );
        }
        inserted
    }

    /// Claim one pending intent for an in-flight pass.
    ///
    /// The intent stays visible to `fire` (new fires coalesce into it) but is
    /// no longer pending, so no other pass can pick it up.
    pub fn claim(&self, flow_id: &str, node_id: &str) {
        let mut intents = self.lock();
        let key = (flow_id.to_string(), node_id.to_string());
        intents.pending.remove(&key);
        intents.claimed.insert(key);
    }

    /// Release a claimed intent once its pass has completed.
    pub fn release(&self, flow_id: &str, node_id: &str) {
        let mut intents = self.lock();
        intents
            .claimed
            .remove(&(flow_id.to_string(), node_id.to_string()));
    }

    /// Consume every pending intent for one flow, in stable order.
    ///
    /// Claimed intents belong to another pass and are left alone.
    pub fn take_pending(&self, flow_id: &str) -> Vec<String> {
        let mut intents = self.lock();
        let mut fired: Vec<String> = intents
            .pending
            .iter()
            .filter(|(f, _)| f == flow_id)
            .map(|(_, node)| node.clone())
            .collect();
        intents.pending.retain(|(f, _)| f != flow_id);
        fired.sort();
        fired
    }

    /// Drop all intents for a flow without consuming them.
    ///
    /// Called on undeploy and flow removal so stale fires never leak into a
    /// later deployment.
    pub fn clear_flow(&self, flow_id: &str) {
        let mut intents = self.lock();
        intents.pending.retain(|(f, _)| f != flow_id);
        intents.claimed.retain(|(f, _)| f != flow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_fires_coalesce_into_one_intent() {
        let coordinator = TriggerCoordinator::new();
        assert!(coordinator.fire("f1", "start"));
        assert!(!coordinator.fire("f1", "start"));
        assert!(!coordinator.fire("f1", "start"));

        assert_eq!(coordinator.take_pending("f1"), vec!["start"]);
        assert!(coordinator.take_pending("f1").is_empty());
    }

    #[test]
    fn flows_are_isolated() {
        let coordinator = TriggerCoordinator::new();
        coordinator.fire("f1", "start");
        coordinator.fire("f2", "start");

        assert_eq!(coordinator.take_pending("f1"), vec!["start"]);
        assert_eq!(coordinator.take_pending("f2"), vec!["start"]);
    }

    #[test]
    fn distinct_triggers_are_consumed_together() {
        let coordinator = TriggerCoordinator::new();
        coordinator.fire("f1", "b");
        coordinator.fire("f1", "a");

        assert_eq!(coordinator.take_pending("f1"), vec!["a", "b"]);
    }

    #[test]
    fn claimed_intent_is_invisible_to_other_passes() {
        let coordinator = TriggerCoordinator::new();
        coordinator.fire("f1", "t1");
        coordinator.claim("f1", "t1");

        // A pass started for a different trigger must not pick up t1.
        coordinator.fire("f1", "t2");
        assert_eq!(coordinator.take_pending("f1"), vec!["t2"]);
    }

    #[test]
    fn fires_coalesce_into_a_claimed_intent() {
        let coordinator = TriggerCoordinator::new();
        coordinator.fire("f1", "t1");
        coordinator.claim("f1", "t1");

        assert!(!coordinator.fire("f1", "t1"));
        assert!(coordinator.take_pending("f1").is_empty());

        // After the pass releases the claim, a new fire is a new intent.
        coordinator.release("f1", "t1");
        assert!(coordinator.fire("f1", "t1"));
    }

    #[test]
    fn clear_drops_pending_and_claimed() {
        let coordinator = TriggerCoordinator::new();
        coordinator.fire("f1", "t1");
        coordinator.claim("f1", "t1");
        coordinator.fire("f1", "t2");
        coordinator.clear_flow("f1");

        assert!(coordinator.take_pending("f1").is_empty());
        // The claim was dropped too, so this is a fresh intent.
        assert!(coordinator.fire("f1", "t1"));
    }
}
