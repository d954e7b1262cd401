//! Intra-stage job dependency graph
//!
//! Jobs are stored in a flat array; edges are adjacency lists of indices into
//! that array. An edge `a -> b` means job `a` depends on job `b`.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobGraph {
    names: Vec<String>,
    edges: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

impl JobGraph {
    /// Builds a graph from job names and per-job dependency indices
    ///
    /// Out-of-range indices are dropped.
    pub fn new(names: Vec<String>, edges: Vec<Vec<usize>>) -> Self {
        let len = names.len();
        let mut edges = edges;
        edges.resize(len, Vec::new());
        for deps in &mut edges {
            deps.retain(|&d| d < len);
        }
        Self { names, edges }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, idx: usize) -> Option<&str> {
        self.names.get(idx).map(String::as_str)
    }

    /// Indices of the jobs `idx` depends on
    pub fn dependencies_of(&self, idx: usize) -> &[usize] {
        self.edges.get(idx).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Finds one dependency cycle, if any
    ///
    /// Depth-first search with three-colour marking. The returned path lists
    /// job names starting at the cycle entry and ending with it again.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::White; self.len()];
        let mut stack = Vec::new();

        for start in 0..self.len() {
            if marks[start] == Mark::White {
                if let Some(cycle) = self.visit(start, &mut marks, &mut stack) {
                    return Some(cycle.into_iter().map(|i| self.names[i].clone()).collect());
                }
            }
        }
        None
    }

    fn visit(&self, node: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[node] = Mark::Grey;
        stack.push(node);

        for &next in &self.edges[node] {
            match marks[next] {
                Mark::Grey => {
                    // `next` is on the stack: everything from it to the top is the cycle
                    let entry = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut path = stack[entry..].to_vec();
                    path.push(next);
                    return Some(path);
                }
                Mark::White => {
                    if let Some(path) = self.visit(next, marks, stack) {
                        return Some(path);
                    }
                }
                Mark::Black => {}
            }
        }

        stack.pop();
        marks[node] = Mark::Black;
        None
    }
}
