//! Reachable-reportee authorization (C10 — AuthzResolver).
//!
//! `reachableReportees(actorId)` is the actor plus the transitive closure
//! under `reportsTo^-1`. A task mutation is authorized only when its owner
//! or assignee lies in that set. Computed lazily from a snapshot of the
//! agent list and memoised for the lifetime of the snapshot — callers take a
//! fresh snapshot (and a fresh resolver) per request.

use std::collections::{HashMap, HashSet};

use crate::agents::Agent;

pub const UNAUTHORIZED_MESSAGE: &str =
    "Agents can only assign tasks to themselves or their reportees (direct or indirect).";

pub struct AuthzResolver {
    /// agent id -> ids of agents that report directly to it.
    direct_reports: HashMap<String, Vec<String>>,
    known_ids: HashSet<String>,
}

impl AuthzResolver {
    pub fn from_agents(agents: &[Agent]) -> Self {
        let mut direct_reports: HashMap<String, Vec<String>> = HashMap::new();
        let mut known_ids = HashSet::new();
        for agent in agents {
            known_ids.insert(agent.id.clone());
            if let Some(parent) = &agent.reports_to {
                direct_reports
                    .entry(parent.clone())
                    .or_default()
                    .push(agent.id.clone());
            }
        }
        Self {
            direct_reports,
            known_ids,
        }
    }

    /// `{actorId} ∪ transitive closure under reportsTo^-1`. Unknown actor ids
    /// still resolve to the singleton set containing themselves — an actor
    /// can always act on tasks they own even if the agent record has since
    /// been deleted out from under a pending task.
    pub fn reachable_reportees(&self, actor_id: &str) -> HashSet<String> {
        let mut reachable = HashSet::new();
        reachable.insert(actor_id.to_string());
        let mut queue = vec![actor_id.to_string()];
        while let Some(current) = queue.pop() {
            if let Some(children) = self.direct_reports.get(&current) {
                for child in children {
                    if reachable.insert(child.clone()) {
                        queue.push(child.clone());
                    }
                }
            }
        }
        reachable
    }

    pub fn is_known(&self, agent_id: &str) -> bool {
        self.known_ids.contains(agent_id)
    }

    /// Authorizes a mutation against a task with the given owner/assignee.
    pub fn authorize(&self, actor_id: &str, owner: &str, assigned_to: &str) -> Result<(), String> {
        let reachable = self.reachable_reportees(actor_id);
        if reachable.contains(owner) || reachable.contains(assigned_to) {
            Ok(())
        } else {
            Err(UNAUTHORIZED_MESSAGE.to_string())
        }
    }
}
