//! Pre-start validation. A workflow that fails here never begins execution.

use std::collections::HashSet;

use super::{BlockKind, Distribution, LoopType, Workflow};
use crate::error::ValidationError;

impl Workflow {
    /// Check the structural invariants the executor relies on: exactly one
    /// enabled starter with no incoming edges, no dangling connections, no
    /// duplicate ids, loop and parallel configs over existing nodes with
    /// positive iteration counts.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for block in &self.blocks {
            if !seen.insert(block.id.as_str()) {
                return Err(ValidationError::DuplicateBlockId(block.id.clone()));
            }
        }

        let starters: Vec<_> = self
            .blocks
            .iter()
            .filter(|b| b.kind == BlockKind::Starter)
            .collect();
        let starter = match starters.as_slice() {
            [] => return Err(ValidationError::MissingStarter),
            [s] => *s,
            many => return Err(ValidationError::MultipleStarters(many.len())),
        };
        if !starter.enabled {
            return Err(ValidationError::DisabledStarter(starter.id.clone()));
        }
        if self.incoming(&starter.id).next().is_some() {
            return Err(ValidationError::StarterHasIncoming(starter.id.clone()));
        }

        for conn in &self.connections {
            for endpoint in [&conn.source, &conn.target] {
                if self.block(endpoint).is_none() {
                    return Err(ValidationError::DanglingConnection {
                        conn_source: conn.source.clone(),
                        target: conn.target.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
        }

        for (loop_id, config) in &self.loops {
            if config.nodes.is_empty() {
                return Err(ValidationError::InvalidLoop {
                    loop_id: loop_id.clone(),
                    message: "loop has no nodes".to_string(),
                });
            }
            for node in &config.nodes {
                if self.block(node).is_none() {
                    return Err(ValidationError::InvalidLoop {
                        loop_id: loop_id.clone(),
                        message: format!("node {node} does not exist"),
                    });
                }
            }
            if config.loop_type == LoopType::For && config.iterations == 0 {
                return Err(ValidationError::InvalidLoop {
                    loop_id: loop_id.clone(),
                    message: "iterations must be positive".to_string(),
                });
            }
            if self.block(loop_id).is_none() {
                return Err(ValidationError::InvalidLoop {
                    loop_id: loop_id.clone(),
                    message: "no loop block with this id".to_string(),
                });
            }
        }

        for (parallel_id, config) in &self.parallels {
            if config.nodes.is_empty() {
                return Err(ValidationError::InvalidParallel {
                    parallel_id: parallel_id.clone(),
                    message: "parallel has no nodes".to_string(),
                });
            }
            for node in &config.nodes {
                if self.block(node).is_none() {
                    return Err(ValidationError::InvalidParallel {
                        parallel_id: parallel_id.clone(),
                        message: format!("node {node} does not exist"),
                    });
                }
            }
            let width = match &config.distribution {
                Distribution::Count(n) => *n as usize,
                items => items.count(),
            };
            if width == 0 {
                return Err(ValidationError::InvalidParallel {
                    parallel_id: parallel_id.clone(),
                    message: "distribution must yield at least one iteration".to_string(),
                });
            }
            if self.block(parallel_id).is_none() {
                return Err(ValidationError::InvalidParallel {
                    parallel_id: parallel_id.clone(),
                    message: "no parallel block with this id".to_string(),
                });
            }
        }

        Ok(())
    }
}
