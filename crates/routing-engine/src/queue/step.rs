//! # Escalation Steps
//!
//! A [`Step`] is one eligibility tier of a precision queue. It owns the
//! step's expressions and timeout, and keeps the set of agents whose
//! attributes currently satisfy those expressions.
//!
//! The agent set is a derived cache. It is maintained incrementally from the
//! agent directory (insert, update, remove) and fully recomputed only when a
//! step is built or its expressions change, so building a candidate list on
//! the routing hot path never evaluates expressions.
//!
//! Every mutation of the set happens under the step's own lock, which is
//! distinct from the queue lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use tracing::trace;

use super::types::{SelectionCriterion, StepId};
use crate::agent::{Agent, AgentId, AgentRegistry, MediaDomainId};
use crate::expression::Expression;

#[derive(Debug)]
pub struct Step {
    id: StepId,
    ordinal: AtomicUsize,
    expressions: Vec<Expression>,
    timeout_secs: u64,
    agents: Mutex<IndexSet<AgentId>>,
}

impl Step {
    pub fn new(id: StepId, ordinal: usize, expressions: Vec<Expression>, timeout_secs: u64) -> Self {
        Self {
            id,
            ordinal: AtomicUsize::new(ordinal),
            expressions,
            timeout_secs,
            agents: Mutex::new(IndexSet::new()),
        }
    }

    pub fn id(&self) -> &StepId {
        &self.id
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal.load(Ordering::Acquire)
    }

    pub(crate) fn set_ordinal(&self, ordinal: usize) {
        self.ordinal.store(ordinal, Ordering::Release);
    }

    pub fn expressions(&self) -> &[Expression] {
        &self.expressions
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    /// Recompute the agent set from scratch
    pub fn evaluate_all<'a>(&self, agents: impl IntoIterator<Item = &'a Arc<Agent>>) {
        let mut set = self.agents.lock();
        set.clear();
        for agent in agents {
            if agent.satisfies(&self.expressions) {
                set.insert(agent.id().clone());
            }
        }
        trace!("Step {} matched {} agents on full evaluation", self.id, set.len());
    }

    /// Add the agent iff it matches; a second insert of the same agent is a
    /// no-op
    pub fn evaluate_on_agent_insert(&self, agent: &Agent) -> bool {
        let mut set = self.agents.lock();
        if set.contains(agent.id()) {
            return false;
        }
        if agent.satisfies(&self.expressions) {
            set.insert(agent.id().clone());
            return true;
        }
        false
    }

    /// Add or remove the agent according to its current attributes
    ///
    /// Evaluation runs under the step lock so that two racing updates of the
    /// same agent leave the set consistent with whichever attributes were
    /// written last.
    pub fn evaluate_on_agent_update(&self, agent: &Agent) {
        let mut set = self.agents.lock();
        if agent.satisfies(&self.expressions) {
            set.insert(agent.id().clone());
        } else {
            // shift_remove keeps the remaining insertion order intact
            set.shift_remove(agent.id());
        }
    }

    pub fn remove_agent(&self, agent_id: &AgentId) -> bool {
        self.agents.lock().shift_remove(agent_id)
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.agents.lock().contains(agent_id)
    }

    /// Snapshot of the agent set in insertion order
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.lock().iter().cloned().collect()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.lock().len()
    }

    /// Snapshot of the eligible agents ordered by `criterion`
    ///
    /// LONGEST_AVAILABLE sorts ascending by the time each agent last became
    /// ready on `domain`; agents that are not ready there go last. Every other
    /// criterion keeps insertion order. Ids no longer present in the registry
    /// are skipped.
    pub fn ordered_agents(
        &self,
        criterion: SelectionCriterion,
        domain: &MediaDomainId,
        registry: &AgentRegistry,
    ) -> Vec<Arc<Agent>> {
        let mut agents: Vec<Arc<Agent>> = self
            .agent_ids()
            .iter()
            .filter_map(|id| registry.get(id))
            .collect();

        if criterion == SelectionCriterion::LongestAvailable {
            // stable sort; None orders after every Some
            agents.sort_by_key(|agent| match agent.last_ready_change(domain) {
                Some(at) => (0u8, Some(at)),
                None => (1u8, None),
            });
        }
        agents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentState, MediaDomainState};
    use crate::expression::{AttributeId, AttributeSet, AttributeValue, RelationalOperator, Term};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn sales_step() -> Step {
        let expression = Expression::new(vec![Term::new(
            "sales",
            RelationalOperator::Eq,
            AttributeValue::Bool(true),
        )]);
        Step::new(StepId::from("s0"), 0, vec![expression], 30)
    }

    fn agent(id: &str, sales: bool) -> Arc<Agent> {
        let mut attributes = AttributeSet::new();
        attributes.insert(AttributeId::from("sales"), AttributeValue::Bool(sales));
        Arc::new(Agent::new(id, id, attributes))
    }

    #[test]
    fn test_insert_is_idempotent() {
        let step = sales_step();
        let alice = agent("alice", true);
        assert!(step.evaluate_on_agent_insert(&alice));
        assert!(!step.evaluate_on_agent_insert(&alice));
        assert_eq!(step.agent_count(), 1);

        let bob = agent("bob", false);
        assert!(!step.evaluate_on_agent_insert(&bob));
        assert!(!step.contains(bob.id()));
    }

    #[test]
    fn test_update_removes_agent_that_stops_matching() {
        let step = sales_step();
        let alice = agent("alice", true);
        step.evaluate_on_agent_insert(&alice);

        let mut attributes = AttributeSet::new();
        attributes.insert(AttributeId::from("sales"), AttributeValue::Bool(false));
        alice.set_attributes(attributes);
        step.evaluate_on_agent_update(&alice);
        assert!(!step.contains(alice.id()));
    }

    #[test]
    fn test_empty_expression_list_matches_everyone() {
        let step = Step::new(StepId::from("open"), 0, Vec::new(), 0);
        let agents = vec![agent("a", true), agent("b", false)];
        step.evaluate_all(&agents);
        assert_eq!(step.agent_count(), 2);
    }

    #[test]
    fn test_longest_available_ordering() {
        let registry = AgentRegistry::new();
        let chat = MediaDomainId::from("chat");
        let step = Step::new(StepId::from("s"), 0, Vec::new(), 0);

        for id in ["late", "never", "early"] {
            let agent = registry.register(Agent::new(id, id, AttributeSet::new())).unwrap();
            agent.set_state(AgentState::Ready);
            step.evaluate_on_agent_insert(&agent);
        }
        registry.get(&AgentId::from("early")).unwrap()
            .set_media_domain_state(chat.clone(), MediaDomainState::Ready);
        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.get(&AgentId::from("late")).unwrap()
            .set_media_domain_state(chat.clone(), MediaDomainState::Ready);

        let ordered: Vec<_> = step
            .ordered_agents(SelectionCriterion::LongestAvailable, &chat, &registry)
            .iter()
            .map(|a| a.id().0.clone())
            .collect();
        assert_eq!(ordered, vec!["early", "late", "never"]);

        let natural: Vec<_> = step
            .ordered_agents(SelectionCriterion::MostSkilled, &chat, &registry)
            .iter()
            .map(|a| a.id().0.clone())
            .collect();
        assert_eq!(natural, vec!["late", "never", "early"]);
    }

    #[derive(Debug, Clone)]
    enum Mutation {
        Insert(usize, bool),
        Update(usize, bool),
        Remove(usize),
    }

    fn mutation() -> impl Strategy<Value = Mutation> {
        prop_oneof![
            (0usize..6, any::<bool>()).prop_map(|(i, s)| Mutation::Insert(i, s)),
            (0usize..6, any::<bool>()).prop_map(|(i, s)| Mutation::Update(i, s)),
            (0usize..6).prop_map(Mutation::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_incremental_set_matches_full_evaluation(
            mutations in prop::collection::vec(mutation(), 0..60)
        ) {
            let step = sales_step();
            // directory model: agent index -> agent, absent when removed
            let mut directory: Vec<Option<Arc<Agent>>> = vec![None; 6];

            for m in mutations {
                match m {
                    Mutation::Insert(i, sales) => {
                        if directory[i].is_none() {
                            let a = agent(&format!("agent{}", i), sales);
                            step.evaluate_on_agent_insert(&a);
                            directory[i] = Some(a);
                        }
                    }
                    Mutation::Update(i, sales) => {
                        if let Some(a) = &directory[i] {
                            let mut attributes = AttributeSet::new();
                            attributes.insert(AttributeId::from("sales"), AttributeValue::Bool(sales));
                            a.set_attributes(attributes);
                            step.evaluate_on_agent_update(a);
                        }
                    }
                    Mutation::Remove(i) => {
                        if let Some(a) = directory[i].take() {
                            step.remove_agent(a.id());
                        }
                    }
                }
            }

            let incremental: BTreeSet<_> = step.agent_ids().into_iter().collect();
            let fresh = sales_step();
            let live: Vec<Arc<Agent>> = directory.into_iter().flatten().collect();
            fresh.evaluate_all(&live);
            let recomputed: BTreeSet<_> = fresh.agent_ids().into_iter().collect();
            prop_assert_eq!(incremental, recomputed);
        }
    }
}
