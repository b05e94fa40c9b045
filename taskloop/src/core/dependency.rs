//! Dependency graph over task declarations.
//!
//! The graph is built once per selection from the task source's declarations
//! and is read-only afterwards, so ready-set queries are safe to run
//! concurrently against a shared snapshot of completed ids.
//!
//! Rules:
//! - a task is ready iff all of its dependencies are completed, it is not
//!   completed itself, and none of its dependencies is missing from the graph;
//! - members of a dependency cycle (including self-dependencies) are never
//!   ready, whatever the completed set contains;
//! - ties between ready tasks break by input order.

use std::collections::{HashMap, HashSet};

use crate::core::types::Task;

/// Derived per-task dependency facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    /// Declared dependencies, duplicates removed, in declaration order.
    pub depends_on: Vec<String>,
    /// Dependencies that are missing from the graph or sit on a cycle.
    pub blocked_by: Vec<String>,
    /// Longest chain of acyclic, existing predecessors (0 for roots and cycle members).
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    order: Vec<String>,
    nodes: HashMap<String, DependencyNode>,
    cyclic: HashSet<String>,
    cycles: Vec<Vec<String>>,
}

/// Build the dependency graph for `tasks`.
///
/// Never fails: duplicate ids keep their first declaration, and dependency
/// lists were already coerced while decoding the tasks.
pub fn build(tasks: &[Task]) -> DependencyGraph {
    let mut order = Vec::with_capacity(tasks.len());
    let mut nodes = HashMap::with_capacity(tasks.len());
    for task in tasks {
        if nodes.contains_key(&task.id) {
            continue;
        }
        let mut depends_on: Vec<String> = Vec::with_capacity(task.depends_on.len());
        for dep in &task.depends_on {
            if !depends_on.contains(dep) {
                depends_on.push(dep.clone());
            }
        }
        order.push(task.id.clone());
        nodes.insert(
            task.id.clone(),
            DependencyNode {
                depends_on,
                blocked_by: Vec::new(),
                depth: 0,
            },
        );
    }

    let mut graph = DependencyGraph {
        order,
        nodes,
        cyclic: HashSet::new(),
        cycles: Vec::new(),
    };
    graph.cycles = detect_cycles(&graph);
    graph.cyclic = cyclic_members(&graph);
    graph.derive_depths();
    graph
}

/// Ids ready to run given `completed`, in input order.
pub fn ready(graph: &DependencyGraph, completed: &HashSet<String>) -> Vec<String> {
    graph.ready(completed)
}

/// Report dependency cycles as id sequences.
///
/// Depth-first search in input order with unvisited / in-progress / done
/// marks; an edge into an in-progress node closes a cycle consisting of the
/// current path from that node onwards. Self-dependencies are reported as
/// single-element cycles.
pub fn detect_cycles(graph: &DependencyGraph) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        InProgress,
        Done,
    }

    fn visit<'a>(
        graph: &'a DependencyGraph,
        id: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        marks.insert(id, Mark::InProgress);
        path.push(id);
        if let Some(node) = graph.nodes.get(id) {
            for dep in &node.depends_on {
                if !graph.nodes.contains_key(dep) {
                    continue;
                }
                match marks.get(dep.as_str()) {
                    Some(Mark::InProgress) => {
                        let start = path.iter().position(|p| *p == dep.as_str()).unwrap_or(0);
                        cycles.push(path[start..].iter().map(|p| p.to_string()).collect());
                    }
                    Some(Mark::Done) => {}
                    None => visit(graph, dep, marks, path, cycles),
                }
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path = Vec::new();
    let mut cycles = Vec::new();
    for id in &graph.order {
        if !marks.contains_key(id.as_str()) {
            visit(graph, id, &mut marks, &mut path, &mut cycles);
        }
    }
    cycles
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Task ids in input order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&DependencyNode> {
        self.nodes.get(id)
    }

    pub fn depth(&self, id: &str) -> Option<u32> {
        self.nodes.get(id).map(|node| node.depth)
    }

    /// Cycle report computed at build time.
    pub fn cycles(&self) -> &[Vec<String>] {
        &self.cycles
    }

    /// True if `id` lies on any dependency cycle.
    pub fn is_cyclic(&self, id: &str) -> bool {
        self.cyclic.contains(id)
    }

    /// True if `id` can never become ready: it is cyclic or depends on an unknown id.
    pub fn is_unschedulable(&self, id: &str) -> bool {
        if self.cyclic.contains(id) {
            return true;
        }
        self.nodes
            .get(id)
            .is_some_and(|node| node.depends_on.iter().any(|d| !self.nodes.contains_key(d)))
    }

    pub fn ready(&self, completed: &HashSet<String>) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.is_ready(id, completed))
            .cloned()
            .collect()
    }

    fn is_ready(&self, id: &str, completed: &HashSet<String>) -> bool {
        if completed.contains(id) || self.is_unschedulable(id) {
            return false;
        }
        let Some(node) = self.nodes.get(id) else {
            return false;
        };
        node.depends_on.iter().all(|dep| completed.contains(dep))
    }

    /// Topological pass (Kahn, input order) over acyclic nodes and their
    /// existing, acyclic predecessors.
    fn derive_depths(&mut self) {
        let mut blocked: HashMap<String, Vec<String>> = HashMap::new();
        let mut preds: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for id in &self.order {
            let node = &self.nodes[id];
            let blocked_by: Vec<String> = node
                .depends_on
                .iter()
                .filter(|d| !self.nodes.contains_key(*d) || self.cyclic.contains(*d))
                .cloned()
                .collect();
            blocked.insert(id.clone(), blocked_by);
            if self.cyclic.contains(id) {
                continue;
            }
            let valid: Vec<&str> = node
                .depends_on
                .iter()
                .filter(|d| self.nodes.contains_key(*d) && !self.cyclic.contains(*d))
                .map(String::as_str)
                .collect();
            indegree.insert(id.as_str(), valid.len());
            for dep in &valid {
                dependents.entry(*dep).or_default().push(id.as_str());
            }
            preds.insert(id.as_str(), valid);
        }

        let mut depths: HashMap<&str, u32> = HashMap::new();
        let mut queue: std::collections::VecDeque<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| indegree.get(id) == Some(&0))
            .collect();
        while let Some(id) = queue.pop_front() {
            let depth = preds
                .get(id)
                .map(|ps| {
                    ps.iter()
                        .filter_map(|p| depths.get(p))
                        .map(|d| d + 1)
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            depths.insert(id, depth);
            if let Some(next) = dependents.get(id) {
                for dependent in next {
                    if let Some(count) = indegree.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            queue.push_back(*dependent);
                        }
                    }
                }
            }
        }

        let depths: HashMap<String, u32> = depths
            .into_iter()
            .map(|(id, depth)| (id.to_string(), depth))
            .collect();
        for (id, node) in &mut self.nodes {
            node.depth = depths.get(id).copied().unwrap_or(0);
            node.blocked_by = blocked.remove(id).unwrap_or_default();
        }
    }
}

/// Every node that can reach itself (Tarjan's strongly connected components).
///
/// The DFS cycle report closes one cycle per back edge, which does not name
/// every member of a larger component; scheduling exclusion uses this set.
fn cyclic_members(graph: &DependencyGraph) -> HashSet<String> {
    struct Tarjan<'a> {
        graph: &'a DependencyGraph,
        index: usize,
        indices: HashMap<&'a str, usize>,
        lowlink: HashMap<&'a str, usize>,
        stack: Vec<&'a str>,
        on_stack: HashSet<&'a str>,
        cyclic: HashSet<String>,
    }

    impl<'a> Tarjan<'a> {
        fn connect(&mut self, id: &'a str) {
            self.indices.insert(id, self.index);
            self.lowlink.insert(id, self.index);
            self.index += 1;
            self.stack.push(id);
            self.on_stack.insert(id);

            let graph = self.graph;
            if let Some(node) = graph.nodes.get(id) {
                for dep in &node.depends_on {
                    if !graph.nodes.contains_key(dep) {
                        continue;
                    }
                    let dep = dep.as_str();
                    if !self.indices.contains_key(dep) {
                        self.connect(dep);
                        let low = self.lowlink[id].min(self.lowlink[dep]);
                        self.lowlink.insert(id, low);
                    } else if self.on_stack.contains(dep) {
                        let low = self.lowlink[id].min(self.indices[dep]);
                        self.lowlink.insert(id, low);
                    }
                }
            }

            if self.lowlink[id] == self.indices[id] {
                let mut component = Vec::new();
                while let Some(member) = self.stack.pop() {
                    self.on_stack.remove(member);
                    component.push(member);
                    if member == id {
                        break;
                    }
                }
                let self_loop = graph
                    .nodes
                    .get(id)
                    .is_some_and(|node| node.depends_on.iter().any(|d| d == id));
                if component.len() > 1 || self_loop {
                    self.cyclic
                        .extend(component.into_iter().map(str::to_string));
                }
            }
        }
    }

    let mut tarjan = Tarjan {
        graph,
        index: 0,
        indices: HashMap::new(),
        lowlink: HashMap::new(),
        stack: Vec::new(),
        on_stack: HashSet::new(),
        cyclic: HashSet::new(),
    };
    for id in &graph.order {
        if !tarjan.indices.contains_key(id.as_str()) {
            tarjan.connect(id);
        }
    }
    tarjan.cyclic
}
