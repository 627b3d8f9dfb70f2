use std::cell::OnceCell;
use std::rc::Rc;

use anyhow::bail;
use rand::Rng;

use crate::common::Agent;
use crate::graph::{Graph, NodeId};
use crate::heuristic::TDHeuristic;

/// A query against a fixed graph: an ordered list of agents, each with a
/// start and a goal. Immutable once built; sub-problems are carved out as
/// new instances with re-issued agent ids.
#[derive(Debug, Clone)]
pub struct ProblemInstance {
    graph: Rc<Graph>,
    agents: Vec<Agent>,
    heuristic: OnceCell<Rc<TDHeuristic>>,
}

impl ProblemInstance {
    /// No two agents may share a start or share a goal.
    pub fn new(graph: Rc<Graph>, agents: Vec<Agent>) -> anyhow::Result<Self> {
        let mut starts: Vec<NodeId> = agents.iter().map(|a| a.start).collect();
        let mut goals: Vec<NodeId> = agents.iter().map(|a| a.goal).collect();
        starts.sort_unstable();
        starts.dedup();
        goals.sort_unstable();
        goals.dedup();
        if starts.len() != agents.len() || goals.len() != agents.len() {
            bail!("agents share start or goal positions: {agents:?}");
        }
        for agent in &agents {
            if agent.start >= graph.size() || agent.goal >= graph.size() {
                bail!("agent {agent:?} is off the graph");
            }
        }

        Ok(ProblemInstance {
            graph,
            agents,
            heuristic: OnceCell::new(),
        })
    }

    /// Instance with `num_agents` randomly placed agents.
    pub fn random<R: Rng + ?Sized>(
        graph: Rc<Graph>,
        num_agents: usize,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        let agents = graph.random_agents(num_agents, rng)?;
        ProblemInstance::new(graph, agents)
    }

    pub fn graph(&self) -> &Rc<Graph> {
        &self.graph
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn goal_node(&self, agent_pos: usize) -> NodeId {
        self.agents[agent_pos].goal
    }

    /// True-distance lookup for this instance's goals, computed on first use
    /// and shared with every sub-problem carved out afterwards.
    pub fn heuristic(&self) -> Rc<TDHeuristic> {
        self.heuristic
            .get_or_init(|| Rc::new(TDHeuristic::new(self)))
            .clone()
    }

    /// Hand an already-computed heuristic table down to a sub-problem whose
    /// goals are a subset of the donor's. No effect if the donor has not
    /// computed one yet or this instance already has one.
    pub(crate) fn adopt_heuristic(&self, donor: &ProblemInstance) {
        if let Some(table) = donor.heuristic.get() {
            let _ = self.heuristic.set(table.clone());
        }
    }

    /// Sub-problem containing only the given agent, re-issued id 0.
    pub fn singleton(&self, agent_pos: usize) -> ProblemInstance {
        self.subproblem(&[agent_pos])
    }

    /// Sub-problem over the selected agents, ids re-issued 0..k-1 in the
    /// given order.
    pub fn subproblem(&self, agent_positions: &[usize]) -> ProblemInstance {
        let agents = agent_positions
            .iter()
            .enumerate()
            .map(|(id, &pos)| Agent {
                start: self.agents[pos].start,
                goal: self.agents[pos].goal,
                id,
            })
            .collect();
        let sub = ProblemInstance {
            graph: self.graph.clone(),
            agents,
            heuristic: OnceCell::new(),
        };
        sub.adopt_heuristic(self);
        sub
    }

    /// Union of two instances over the same graph, ids re-issued 0..k-1.
    /// The caller is responsible for attaching a heuristic that covers both
    /// goal sets (see [`ProblemInstance::adopt_heuristic`]).
    pub fn join(&self, other: &ProblemInstance) -> anyhow::Result<ProblemInstance> {
        let mut agents = self.agents.clone();
        for agent in &other.agents {
            agents.push(Agent {
                start: agent.start,
                goal: agent.goal,
                id: agents.len(),
            });
        }
        ProblemInstance::new(self.graph.clone(), agents)
    }
}
