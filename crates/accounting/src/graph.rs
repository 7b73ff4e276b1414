//! Flow network used for charge routing and headroom calculations.
//!
//! The graph is a dense residual network: `adjacent[u][v]` is the capacity
//! left on the edge `u -> v` and `cost[u][v]` its signed cost. Pushing flow
//! along `u -> v` moves capacity onto `v -> u`, and the reverse edge carries
//! the negated cost, which is the usual residual-cost convention.
//!
//! A graph built with [`Graph::with_over_allocation`] has twice as many
//! vertices as keys. Vertex `v + n` is the over-allocation twin of vertex `v`;
//! such vertices are never *original* vertices and never map to a key.
//!
//! Two algorithms are offered:
//!
//! - [`Graph::max_flow`]: Edmonds-Karp.
//! - [`Graph::min_cost_flow`]: greedy routing along the currently least
//!   expensive path, where "least expensive" is the lowest **average** edge
//!   cost. Averages are not additive, so the path search enumerates simple
//!   paths instead of running a shortest-path algorithm. Wallet hierarchies
//!   are shallow, which keeps this affordable.
use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
};

use crate::mermaid::{Line, Mermaid, Shape};

/// Average cost reported for "no path". Larger than any real average.
pub const UNREACHABLE: i128 = 1 << 110;

#[derive(Clone, Debug)]
pub struct Graph<K> {
    pub vertex_count: usize,
    real_vertex_count: usize,
    pub adjacent: Vec<Vec<i64>>,
    pub cost: Vec<Vec<i128>>,
    pub original: Vec<Vec<bool>>,
    vertex_to_key: Vec<K>,
    key_to_vertex: HashMap<K, usize>,
    edges: Vec<(usize, usize)>,
}

impl<K: Copy + Eq + Hash> Graph<K> {
    /// One vertex per key, in the order given.
    pub fn new(keys: Vec<K>) -> Self {
        let count = keys.len();
        Self::allocate(keys, count)
    }

    /// One vertex per key plus one over-allocation twin per key.
    pub fn with_over_allocation(keys: Vec<K>) -> Self {
        let count = keys.len() * 2;
        Self::allocate(keys, count)
    }

    fn allocate(keys: Vec<K>, vertex_count: usize) -> Self {
        let key_to_vertex = keys
            .iter()
            .enumerate()
            .map(|(vertex, key)| (*key, vertex))
            .collect();

        Self {
            vertex_count,
            real_vertex_count: keys.len(),
            adjacent: vec![vec![0; vertex_count]; vertex_count],
            cost: vec![vec![0; vertex_count]; vertex_count],
            original: vec![vec![false; vertex_count]; vertex_count],
            vertex_to_key: keys,
            key_to_vertex,
            edges: Vec::new(),
        }
    }

    /// Number of vertices that map to a key.
    pub fn real_vertex_count(&self) -> usize {
        self.real_vertex_count
    }

    pub fn vertex(&self, key: &K) -> Option<usize> {
        self.key_to_vertex.get(key).copied()
    }

    pub fn key(&self, vertex: usize) -> Option<&K> {
        self.vertex_to_key.get(vertex)
    }

    pub fn keys(&self) -> &[K] {
        &self.vertex_to_key
    }

    /// Over-allocation twin of a real vertex.
    pub fn over_allocation_vertex(&self, vertex: usize) -> usize {
        vertex + self.real_vertex_count
    }

    /// Sets the forward residual to `capacity` and the backward residual to
    /// `flow`, the amount already pushed along the edge.
    pub fn add_edge(&mut self, source: usize, destination: usize, capacity: i64, flow: i64) {
        self.adjacent[source][destination] = capacity;
        self.adjacent[destination][source] = flow;
        if source < self.real_vertex_count && destination < self.real_vertex_count {
            self.original[source][destination] = true;
        }
        self.edges.push((source, destination));
    }

    pub fn add_edge_cost(&mut self, source: usize, destination: usize, cost: i128) {
        self.cost[source][destination] = cost;
        self.cost[destination][source] = -cost;
    }

    /// Edmonds-Karp. Consumes residual capacity and returns the flow pushed.
    pub fn max_flow(&mut self, source: usize, destination: usize) -> i64 {
        if source == destination {
            return 0;
        }

        let mut total: i64 = 0;
        while let Some(path) = self.shortest_augmenting_path(source, destination) {
            let bottleneck = self.bottleneck(&path);
            self.push(&path, bottleneck);
            total = total.saturating_add(bottleneck);
        }
        total
    }

    /// Routes up to `desired` units, always along the least expensive path
    /// left. Returns what was actually routed.
    pub fn min_cost_flow(&mut self, source: usize, destination: usize, desired: i64) -> i64 {
        let mut flow = 0;
        while flow < desired {
            let Some(path) = self.least_expensive_path(source, destination) else {
                break;
            };
            let amount = self.bottleneck(&path).min(desired - flow);
            self.push(&path, amount);
            flow += amount;
        }
        flow
    }

    fn shortest_augmenting_path(&self, source: usize, destination: usize) -> Option<Vec<usize>> {
        let mut previous: Vec<Option<usize>> = vec![None; self.vertex_count];
        let mut visited = vec![false; self.vertex_count];
        let mut queue = VecDeque::from([source]);
        visited[source] = true;

        while let Some(u) = queue.pop_front() {
            if u == destination {
                break;
            }
            for v in 0..self.vertex_count {
                if !visited[v] && self.adjacent[u][v] > 0 {
                    visited[v] = true;
                    previous[v] = Some(u);
                    queue.push_back(v);
                }
            }
        }

        if !visited[destination] {
            return None;
        }

        let mut path = vec![destination];
        let mut current = destination;
        while let Some(prev) = previous[current] {
            path.push(prev);
            current = prev;
        }
        path.reverse();
        Some(path)
    }

    /// Breadth-first enumeration of every simple path with positive residual
    /// capacity. The first path with the strictly lowest average cost wins,
    /// so ties go to the shorter path and then to the lower vertex indices.
    fn least_expensive_path(&self, source: usize, destination: usize) -> Option<Vec<usize>> {
        if source == destination {
            return None;
        }

        let mut best_average = UNREACHABLE;
        let mut best_path = None;
        let mut queue: VecDeque<(Vec<usize>, i128)> = VecDeque::from([(vec![source], 0)]);

        while let Some((path, cost)) = queue.pop_front() {
            let Some(&u) = path.last() else {
                continue;
            };
            if u == destination {
                let edge_count = (path.len() - 1) as i128;
                let average = cost / edge_count;
                if average < best_average {
                    best_average = average;
                    best_path = Some(path);
                }
                continue;
            }

            for v in 0..self.vertex_count {
                if self.adjacent[u][v] > 0 && !path.contains(&v) {
                    let mut next = path.clone();
                    next.push(v);
                    queue.push_back((next, cost + self.cost[u][v]));
                }
            }
        }

        best_path
    }

    fn bottleneck(&self, path: &[usize]) -> i64 {
        path.windows(2)
            .map(|edge| self.adjacent[edge[0]][edge[1]])
            .min()
            .unwrap_or(0)
    }

    fn push(&mut self, path: &[usize], amount: i64) {
        for edge in path.windows(2) {
            let (u, v) = (edge[0], edge[1]);
            self.adjacent[u][v] -= amount;
            self.adjacent[v][u] += amount;
        }
    }

    /// Renders the residual network. Edge labels read `remaining / pushed`.
    pub fn to_mermaid(&self, label: impl Fn(&K) -> String) -> String {
        Mermaid::render(|b| {
            for vertex in 0..self.vertex_count {
                let title = match self.key(vertex) {
                    Some(key) => label(key),
                    None => format!("over-allocation {}", vertex - self.real_vertex_count),
                };
                let shape = if vertex < self.real_vertex_count {
                    Shape::Round
                } else {
                    Shape::Box
                };
                b.node(&format!("V{vertex}"), &title, shape, None);
            }

            for &(u, v) in &self.edges {
                let line = if self.original[u][v] {
                    Line::Normal
                } else {
                    Line::Dotted
                };
                let text = format!("{} / {}", self.adjacent[u][v], self.adjacent[v][u]);
                b.link(&format!("V{u}"), &format!("V{v}"), Some(&text), line);
            }
        })
    }
}
