use super::{Block, Connection, LoopConfig, ParallelConfig, Workflow};

/// Fluent builder for [`Workflow`]. Blocks keep insertion order, which also
/// fixes the deterministic candidate order used by the scheduler.
#[derive(Debug, Default)]
pub struct WorkflowBuilder {
    version: Option<String>,
    blocks: Vec<Block>,
    connections: Vec<Connection>,
    loops: Vec<LoopConfig>,
    parallels: Vec<ParallelConfig>,
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn add_block(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }

    /// Connect `source` to `target` with the normal value handle.
    pub fn connect(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.connections.push(Connection::new(source, target));
        self
    }

    /// Connect with an explicit handle (`"error"`, `"condition-<id>"`,
    /// `"loop-start-source"`, ...).
    pub fn connect_handle(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        handle: impl Into<String>,
    ) -> Self {
        self.connections
            .push(Connection::new(source, target).with_handle(handle));
        self
    }

    pub fn add_loop(mut self, config: LoopConfig) -> Self {
        self.loops.push(config);
        self
    }

    pub fn add_parallel(mut self, config: ParallelConfig) -> Self {
        self.parallels.push(config);
        self
    }

    pub fn build(self) -> Workflow {
        Workflow {
            version: self.version.unwrap_or_else(|| "1.0".to_string()),
            blocks: self.blocks,
            connections: self.connections,
            loops: self.loops.into_iter().map(|l| (l.id.clone(), l)).collect(),
            parallels: self
                .parallels
                .into_iter()
                .map(|p| (p.id.clone(), p))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::BlockKind;

    #[test]
    fn builder_assembles_document() {
        let wf = Workflow::builder()
            .version("2.1")
            .add_block(Block::new("start", BlockKind::Starter))
            .add_block(Block::new("agent1", BlockKind::Agent))
            .connect("start", "agent1")
            .connect_handle("agent1", "start", "error")
            .build();
        assert_eq!(wf.version, "2.1");
        assert_eq!(wf.blocks.len(), 2);
        assert_eq!(wf.connections.len(), 2);
        assert_eq!(wf.connections[1].source_handle.as_deref(), Some("error"));
    }
}
