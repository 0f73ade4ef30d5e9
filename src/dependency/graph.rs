use std::collections::HashMap;

/// Directed dependency graph over service names.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// Nodes in insertion order; traversal is deterministic in input order.
    order: Vec<String>,
    /// `edges[A] = [B, C]` means A depends on B and C.
    edges: HashMap<String, Vec<String>>,
    /// `reverse[A] = [B, C]` means B and C depend on A.
    reverse: HashMap<String, Vec<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the graph.
    pub fn add_node(&mut self, name: &str) {
        if !self.edges.contains_key(name) {
            self.order.push(name.to_string());
            self.edges.insert(name.to_string(), Vec::new());
            self.reverse.insert(name.to_string(), Vec::new());
        }
    }

    /// Add a dependency edge (`from` depends on `to`).
    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.add_node(from);
        self.add_node(to);
        self.edges.get_mut(from).unwrap().push(to.to_string());
        self.reverse.get_mut(to).unwrap().push(from.to_string());
    }

    /// Get direct dependencies of a node.
    pub fn direct_dependencies(&self, node: &str) -> Vec<String> {
        self.edges.get(node).cloned().unwrap_or_default()
    }

    /// Get nodes that depend on the given node.
    pub fn dependents(&self, node: &str) -> Vec<String> {
        self.reverse.get(node).cloned().unwrap_or_default()
    }

    /// Check whether the graph has a cycle.
    ///
    /// Depth-first search with white/gray/black coloring: an edge reaching a
    /// gray node closes a cycle. Nodes are visited in insertion order.
    pub fn has_cycle(&self) -> bool {
        let mut colors: HashMap<&str, Color> = self
            .order
            .iter()
            .map(|n| (n.as_str(), Color::White))
            .collect();
        for node in &self.order {
            if colors[node.as_str()] == Color::White && self.visit(node, &mut colors) {
                return true;
            }
        }
        false
    }

    fn visit<'a>(&'a self, node: &'a str, colors: &mut HashMap<&'a str, Color>) -> bool {
        colors.insert(node, Color::Gray);
        if let Some(deps) = self.edges.get(node) {
            for dep in deps {
                match colors.get(dep.as_str()).copied() {
                    Some(Color::Gray) => return true,
                    Some(Color::White) => {
                        if self.visit(dep, colors) {
                            return true;
                        }
                    }
                    // Black: already fully explored, no cycle through it.
                    _ => {}
                }
            }
        }
        colors.insert(node, Color::Black);
        false
    }

    pub fn nodes(&self) -> &[String] {
        &self.order
    }
}
