use std::collections::{HashMap, HashSet};

/// The transient wait-for graph built per deadlock-detection pass.
/// An edge p -> q means transaction p waits for a lock held by q.
pub(crate) struct WaitForGraph {
    nodes: HashSet<u64>,
    // key: transaction, value: the transactions it waits for
    edges: HashMap<u64, HashSet<u64>>,
}

impl WaitForGraph {
    pub(crate) fn new() -> Self {
        Self {
            nodes: HashSet::new(),
            edges: HashMap::new(),
        }
    }

    pub(crate) fn add_node(&mut self, node: u64) {
        self.nodes.insert(node);
    }

    pub(crate) fn add_edge(&mut self, from: u64, to: u64) {
        self.nodes.insert(from);
        self.nodes.insert(to);
        self.edges.entry(from).or_insert_with(HashSet::new).insert(to);
    }

    fn remove_node(&mut self, node: u64) {
        self.nodes.remove(&node);
        self.edges.remove(&node);
        for targets in self.edges.values_mut() {
            targets.remove(&node);
        }
    }

    fn out_degree(&self, node: u64) -> usize {
        self.edges.get(&node).map(|targets| targets.len()).unwrap_or(0)
    }

    /// Strip every node that cannot sit on a cycle: a node with no
    /// incoming or no outgoing edges. What remains is exactly the set
    /// of deadlocked transactions.
    fn reduce(&mut self) {
        loop {
            let mut incoming: HashMap<u64, usize> =
                self.nodes.iter().map(|&node| (node, 0)).collect();
            for targets in self.edges.values() {
                for target in targets {
                    if let Some(count) = incoming.get_mut(target) {
                        *count += 1;
                    }
                }
            }

            let removable = self
                .nodes
                .iter()
                .cloned()
                .find(|&node| self.out_degree(node) == 0 || incoming[&node] == 0);
            match removable {
                Some(node) => self.remove_node(node),
                None => return,
            }
        }
    }

    /// Peel cycles off the graph one victim at a time. Each returned
    /// entry is the cycle's members plus the node at which the cycle
    /// was closed, which is the rollback victim.
    pub(crate) fn extract_cycles(&mut self) -> Vec<(Vec<u64>, u64)> {
        let mut cycles = Vec::new();

        loop {
            self.reduce();
            let start = match self.nodes.iter().next() {
                Some(&node) => node,
                None => break,
            };

            // after reduction every node keeps an outgoing edge, so
            // walking successors has to run into the path again
            let mut path = vec![start];
            let mut on_path: HashSet<u64> = path.iter().cloned().collect();
            let (cycle, victim) = loop {
                let last = *path.last().unwrap();
                let next = *self
                    .edges
                    .get(&last)
                    .and_then(|targets| targets.iter().next())
                    .expect("wait-for graph is corrupted: a reduced node has no successor");
                if on_path.contains(&next) {
                    let position = path.iter().position(|&node| node == next).unwrap();
                    break (path[position..].to_vec(), last);
                }
                on_path.insert(next);
                path.push(next);
            };

            cycles.push((cycle, victim));
            self.remove_node(victim);
        }
        cycles
    }
}
