//! Stable, cycle-tolerant topological sort over opaque vertex indices.
//!
//! Edges point from a vertex towards the root side of the graph: for a tag
//! hierarchy, a child has one edge to its parent. The sort knows nothing about
//! what the vertices are; callers enumerate edges through a callback.
//!
//! The traversal is an iterative depth-first search (explicit stack, so a
//! long parent chain cannot overflow the thread stack) that starts from each
//! vertex in input order. A vertex is emitted once all of its targets have
//! been emitted, which yields a root-to-leaf order directly. Input that is
//! already correctly ordered comes back unchanged.
//!
//! Edges that lead back to a vertex still on the DFS stack close a cycle.
//! They are skipped, so every vertex is emitted exactly once and whichever
//! cycle member the search reached first ends up earliest.

/// Requested ordering of the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortDirection {
    /// Edge targets (parents) come before edge sources (children).
    RootToLeaf,
    /// Edge sources (children) come before edge targets (parents).
    LeafToRoot,
}

/// Result of [`topological_order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOrder {
    /// `order[k]` is the input index of the vertex placed at position `k`.
    pub order: Vec<usize>,
    /// Whether at least one back edge was skipped.
    pub had_cycle: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    Active,
    Done,
}

struct Frame {
    vertex: usize,
    next_edge: usize,
    end_edge: usize,
    begin_edge: usize,
}

/// Compute a topological order of `vertex_count` vertices.
///
/// `get_edges(v, buffer)` must append the targets of `v` to `buffer` without
/// clearing it. Targets outside `0..vertex_count` are ignored.
pub fn topological_order<F>(vertex_count: usize, direction: SortDirection, mut get_edges: F) -> SortOrder
where
    F: FnMut(usize, &mut Vec<usize>),
{
    let mut state = vec![Visit::New; vertex_count];
    let mut emitted = Vec::with_capacity(vertex_count);
    let mut edges: Vec<usize> = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut had_cycle = false;

    for i in 0..vertex_count {
        // Walking the input backwards for leaf-to-root keeps already valid
        // leaf-to-root input unchanged once the result is reversed.
        let start = match direction {
            SortDirection::RootToLeaf => i,
            SortDirection::LeafToRoot => vertex_count - 1 - i,
        };
        if state[start] != Visit::New {
            continue;
        }

        push_frame(start, &mut state, &mut edges, &mut stack, &mut get_edges);

        while let Some(top) = stack.last_mut() {
            if top.next_edge < top.end_edge {
                let target = edges[top.next_edge];
                top.next_edge += 1;

                if target >= vertex_count {
                    debug_assert!(false, "edge target {} out of range", target);
                    continue;
                }

                match state[target] {
                    Visit::New => push_frame(target, &mut state, &mut edges, &mut stack, &mut get_edges),
                    Visit::Active => had_cycle = true,
                    Visit::Done => {}
                }
            } else if let Some(frame) = stack.pop() {
                edges.truncate(frame.begin_edge);
                state[frame.vertex] = Visit::Done;
                emitted.push(frame.vertex);
            }
        }
    }

    if direction == SortDirection::LeafToRoot {
        emitted.reverse();
    }

    SortOrder {
        order: emitted,
        had_cycle,
    }
}

fn push_frame<F>(
    vertex: usize,
    state: &mut [Visit],
    edges: &mut Vec<usize>,
    stack: &mut Vec<Frame>,
    get_edges: &mut F,
) where
    F: FnMut(usize, &mut Vec<usize>),
{
    state[vertex] = Visit::Active;
    let begin_edge = edges.len();
    get_edges(vertex, edges);
    stack.push(Frame {
        vertex,
        next_edge: begin_edge,
        end_edge: edges.len(),
        begin_edge,
    });
}

/// Sort `items` in place. Returns `true` if a cycle had to be broken.
///
/// Edge indices passed to and returned from `get_edges` refer to positions in
/// `items` before sorting.
pub fn topological_sort<T, F>(items: &mut [T], direction: SortDirection, get_edges: F) -> bool
where
    F: FnMut(usize, &mut Vec<usize>),
{
    let sorted = topological_order(items.len(), direction, get_edges);
    apply_permutation(items, &sorted.order);
    sorted.had_cycle
}

/// Rearrange `items` so that `items[k]` becomes the old `items[order[k]]`.
fn apply_permutation<T>(items: &mut [T], order: &[usize]) {
    debug_assert_eq!(items.len(), order.len());
    let mut placed = vec![false; items.len()];

    for start in 0..items.len() {
        if placed[start] {
            continue;
        }
        let mut k = start;
        loop {
            placed[k] = true;
            let source = order[k];
            if source == start {
                break;
            }
            items.swap(k, source);
            k = source;
        }
    }
}
