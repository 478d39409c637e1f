//! Dependency graph between EDT nodes.

use super::node::NodeId;

/// Directed graph where an edge `a -> b` means `a` depends on `b`.
#[derive(Debug, Default)]
pub(super) struct Graph {
    deps: Vec<Vec<NodeId>>,
    users: Vec<Vec<NodeId>>,
}

impl Graph {
    pub fn new(len: usize) -> Self {
        Self {
            deps: vec![Vec::new(); len],
            users: vec![Vec::new(); len],
        }
    }

    /// Records that `from` depends on `to`. Self edges and duplicates are
    /// dropped.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        if from == to || self.deps[from.0].contains(&to) {
            return;
        }
        self.deps[from.0].push(to);
        self.users[to.0].push(from);
    }

    pub fn depends_on(&self, node: NodeId) -> &[NodeId] {
        &self.deps[node.0]
    }

    pub fn required_by(&self, node: NodeId) -> &[NodeId] {
        &self.users[node.0]
    }

    /// Strongly connected components, dependencies before their users.
    /// Traversal starts from nodes in index order, so the result is
    /// deterministic.
    pub fn scc_order(&self) -> Vec<Vec<NodeId>> {
        let len = self.deps.len();
        let mut index: Vec<Option<usize>> = vec![None; len];
        let mut low = vec![0; len];
        let mut on_stack = vec![false; len];
        let mut stack = Vec::new();
        let mut next = 0;
        let mut sccs = Vec::new();

        for root in 0..len {
            if index[root].is_some() {
                continue;
            }

            // (node, position of the next edge to follow)
            let mut work = vec![(root, 0)];
            while let Some((v, pos)) = work.pop() {
                if pos == 0 {
                    index[v] = Some(next);
                    low[v] = next;
                    next += 1;
                    stack.push(v);
                    on_stack[v] = true;
                }

                if let Some(&NodeId(w)) = self.deps[v].get(pos) {
                    work.push((v, pos + 1));
                    match index[w] {
                        None => work.push((w, 0)),
                        Some(iw) if on_stack[w] => low[v] = low[v].min(iw),
                        Some(_) => {}
                    }
                    continue;
                }

                if index[v] == Some(low[v]) {
                    let mut scc = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack[w] = false;
                        scc.push(NodeId(w));
                        if w == v {
                            break;
                        }
                    }
                    sccs.push(scc);
                }
                if let Some(&(parent, _)) = work.last() {
                    low[parent] = low[parent].min(low[v]);
                }
            }
        }
        sccs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependencies_come_first() {
        // 0 <- 1 <- 2, 0 <- 3 -> 2
        let mut graph = Graph::new(4);
        graph.add_edge(NodeId(1), NodeId(0));
        graph.add_edge(NodeId(2), NodeId(1));
        graph.add_edge(NodeId(3), NodeId(0));
        graph.add_edge(NodeId(3), NodeId(2));
        graph.add_edge(NodeId(3), NodeId(2));
        graph.add_edge(NodeId(3), NodeId(3));

        let order: Vec<Vec<NodeId>> = graph.scc_order();
        assert_eq!(
            order,
            [
                vec![NodeId(0)],
                vec![NodeId(1)],
                vec![NodeId(2)],
                vec![NodeId(3)]
            ]
        );
        assert_eq!(graph.depends_on(NodeId(3)), [NodeId(0), NodeId(2)]);
        assert_eq!(graph.required_by(NodeId(0)), [NodeId(1), NodeId(3)]);
    }

    #[test]
    fn cycles_form_one_component() {
        let mut graph = Graph::new(3);
        graph.add_edge(NodeId(1), NodeId(0));
        graph.add_edge(NodeId(1), NodeId(2));
        graph.add_edge(NodeId(2), NodeId(1));

        let order = graph.scc_order();
        assert_eq!(order.len(), 2);
        assert_eq!(order[0], [NodeId(0)]);
        let mut cycle = order[1].clone();
        cycle.sort();
        assert_eq!(cycle, [NodeId(1), NodeId(2)]);
    }
}
