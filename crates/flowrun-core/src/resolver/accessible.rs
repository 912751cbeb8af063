//! Accessible-block precompute: for each block, the set of upstream blocks its
//! references may legally read. Computed once per workflow.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::workflow::{BlockKind, Workflow};

/// Ancestor sets over the connection graph, union the starter. A reference to a
/// block outside this set is a reference error regardless of execution state.
pub fn accessible_map(workflow: &Workflow) -> HashMap<String, HashSet<String>> {
    let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
    for conn in &workflow.connections {
        reverse
            .entry(conn.target.as_str())
            .or_default()
            .push(conn.source.as_str());
    }
    let starter = workflow.starter().map(|b| b.id.clone());

    let mut map = HashMap::new();
    for block in &workflow.blocks {
        let mut reachable: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(block.id.as_str());
        while let Some(current) = queue.pop_front() {
            if let Some(sources) = reverse.get(current) {
                for source in sources {
                    if reachable.insert((*source).to_string()) {
                        queue.push_back(source);
                    }
                }
            }
        }
        if let Some(s) = &starter {
            reachable.insert(s.clone());
        }
        // Siblings inside the same loop or parallel see each other even when
        // connected only through the construct's start edge.
        if let Some(l) = workflow.loop_containing(&block.id) {
            reachable.extend(l.nodes.iter().cloned());
        }
        if let Some(p) = workflow.parallel_containing(&block.id) {
            reachable.extend(p.nodes.iter().cloned());
        }
        // A reachable loop or parallel exposes its inner nodes: a block wired
        // to a construct's end edge may reference the last iteration's state.
        let mut changed = true;
        while changed {
            changed = false;
            let snapshot: Vec<String> = reachable.iter().cloned().collect();
            for id in snapshot {
                if let Some(l) = workflow.loops.get(&id) {
                    for node in &l.nodes {
                        changed |= reachable.insert(node.clone());
                    }
                }
                if let Some(p) = workflow.parallels.get(&id) {
                    for node in &p.nodes {
                        changed |= reachable.insert(node.clone());
                    }
                }
            }
        }
        reachable.remove(&block.id);
        map.insert(block.id.clone(), reachable);
    }
    map
}

/// Normalised display-name lookup: lowercase with spaces stripped, the form
/// references use when they name blocks instead of ids.
pub fn name_index(workflow: &Workflow) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for block in &workflow.blocks {
        if block.kind == BlockKind::Starter {
            continue;
        }
        index.insert(normalize(block.display_name()), block.id.clone());
    }
    index
}

pub fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}
