use anyhow::bail;
use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::common::Agent;

/// Stable index of a node in the graph's node list.
pub type NodeId = usize;

/// Directional slots of a node's neighbor array. Diagonal directions are
/// only populated on 8-connected graphs.
pub mod positions {
    pub const RIGHT: usize = 0;
    pub const LEFT: usize = 1;
    pub const TOP: usize = 2;
    pub const BOTTOM: usize = 3;
    pub const TOP_RIGHT: usize = 4;
    pub const TOP_LEFT: usize = 5;
    pub const BOTTOM_RIGHT: usize = 6;
    pub const BOTTOM_LEFT: usize = 7;

    pub fn is_diagonal(position: usize) -> bool {
        position >= TOP_RIGHT
    }

    /// The two orthogonal directions a diagonal move cuts across.
    pub fn cut_across(position: usize) -> (usize, usize) {
        match position {
            TOP_RIGHT => (TOP, RIGHT),
            TOP_LEFT => (TOP, LEFT),
            BOTTOM_RIGHT => (BOTTOM, RIGHT),
            BOTTOM_LEFT => (BOTTOM, LEFT),
            _ => unreachable!("not a diagonal position: {position}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Terrain {
    Ground,
    Water,
    Tree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectedness {
    Four,
    Eight,
}

impl Connectedness {
    pub fn degree(self) -> usize {
        match self {
            Connectedness::Four => 4,
            Connectedness::Eight => 8,
        }
    }
}

/// A traversable map cell. Immutable once the graph is built.
#[derive(Debug, Clone)]
pub struct Node {
    terrain: Terrain,
    neighbors: [Option<NodeId>; 8],
    index: NodeId,
}

impl Node {
    pub fn terrain(&self) -> Terrain {
        self.terrain
    }

    pub fn index(&self) -> NodeId {
        self.index
    }

    pub fn neighbor(&self, position: usize) -> Option<NodeId> {
        self.neighbors[position]
    }

    pub fn neighbors(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.neighbors.iter().flatten().copied()
    }
}

/// Adjacency-list map representation shared by every solver. Obstacle cells
/// never become nodes; neighbor slots pointing at them stay `None`.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    connectedness: Connectedness,
}

impl Graph {
    /// Build a graph from a row-major grid of cells, `None` marking an
    /// obstacle. File parsing lives outside this crate; callers hand in the
    /// already-decoded cell grid.
    pub fn from_cells(
        width: usize,
        height: usize,
        cells: &[Option<Terrain>],
        connectedness: Connectedness,
    ) -> anyhow::Result<Self> {
        if cells.len() != width * height {
            bail!(
                "cell grid has {} entries, expected {width}x{height}",
                cells.len()
            );
        }

        // First pass assigns graph indices to passable cells.
        let mut grid_to_node = vec![None; cells.len()];
        let mut nodes = Vec::new();
        for (grid_index, cell) in cells.iter().enumerate() {
            if let Some(terrain) = cell {
                grid_to_node[grid_index] = Some(nodes.len());
                nodes.push(Node {
                    terrain: *terrain,
                    neighbors: [None; 8],
                    index: nodes.len(),
                });
            }
        }

        // Second pass links directional neighbors.
        let w = width as isize;
        let offsets: [(isize, isize); 8] = [
            (1, 0),   // right
            (-1, 0),  // left
            (0, -1),  // top
            (0, 1),   // bottom
            (1, -1),  // top right
            (-1, -1), // top left
            (1, 1),   // bottom right
            (-1, 1),  // bottom left
        ];
        for (grid_index, slot) in grid_to_node.iter().enumerate() {
            let Some(node_id) = *slot else { continue };
            let x = (grid_index as isize) % w;
            let y = (grid_index as isize) / w;
            for (position, (dx, dy)) in offsets.iter().enumerate().take(connectedness.degree()) {
                let nx = x + dx;
                let ny = y + dy;
                if nx < 0 || ny < 0 || nx >= w || ny >= height as isize {
                    continue;
                }
                let neighbor_grid = (ny * w + nx) as usize;
                nodes[node_id].neighbors[position] = grid_to_node[neighbor_grid];
            }
        }

        Ok(Graph {
            nodes,
            connectedness,
        })
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn connectedness(&self) -> Connectedness {
        self.connectedness
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Whether the neighbor in the given directional slot can be stepped to.
    /// A diagonal neighbor is reachable only when both orthogonal neighbors
    /// it cuts across exist.
    pub fn is_reachable(&self, from: NodeId, position: usize) -> bool {
        let node = &self.nodes[from];
        if node.neighbors[position].is_none() {
            return false;
        }
        if !positions::is_diagonal(position) {
            return true;
        }
        let (a, b) = positions::cut_across(position);
        node.neighbors[a].is_some() && node.neighbors[b].is_some()
    }

    /// Generate agents with pairwise-distinct starts and pairwise-distinct
    /// goals, ids issued 0..n-1.
    pub fn random_agents<R: Rng + ?Sized>(
        &self,
        num_agents: usize,
        rng: &mut R,
    ) -> anyhow::Result<Vec<Agent>> {
        if num_agents > self.nodes.len() {
            bail!(
                "cannot place {num_agents} agents on a graph with {} nodes",
                self.nodes.len()
            );
        }
        let mut indices: Vec<NodeId> = (0..self.nodes.len()).collect();
        let (starts, _) = indices.partial_shuffle(rng, num_agents);
        let starts = starts.to_vec();
        let mut indices: Vec<NodeId> = (0..self.nodes.len()).collect();
        let (goals, _) = indices.partial_shuffle(rng, num_agents);

        Ok(starts
            .iter()
            .zip(goals.iter())
            .enumerate()
            .map(|(id, (&start, &goal))| Agent { start, goal, id })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod grids {
    use super::*;
    use std::rc::Rc;

    /// Build a graph from ascii rows: '.' ground, 'W' water, 'T' tree,
    /// '@' obstacle.
    pub(crate) fn from_ascii(rows: &[&str], connectedness: Connectedness) -> Rc<Graph> {
        let height = rows.len();
        let width = rows[0].len();
        let cells: Vec<Option<Terrain>> = rows
            .iter()
            .flat_map(|row| row.chars())
            .map(|ch| match ch {
                '.' => Some(Terrain::Ground),
                'W' => Some(Terrain::Water),
                'T' => Some(Terrain::Tree),
                '@' => None,
                _ => panic!("unknown cell {ch:?}"),
            })
            .collect();
        Rc::new(Graph::from_cells(width, height, &cells, connectedness).unwrap())
    }

    pub(crate) fn open_grid(width: usize, height: usize, connectedness: Connectedness) -> Rc<Graph> {
        let cells = vec![Some(Terrain::Ground); width * height];
        Rc::new(Graph::from_cells(width, height, &cells, connectedness).unwrap())
    }
}
