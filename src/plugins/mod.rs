//! The installers. Each one sets up a package on every node of an already running cluster.

pub mod hadoop;
pub mod skylark;
pub mod spark;

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info};

use crate::node::Node;

/// What an installer is given to work with.
pub struct RunContext<'a> {
    /// All nodes of the cluster, master included.
    pub nodes: &'a [Arc<Node>],
    pub master: &'a Arc<Node>,

    /// The user the packages are set up for.
    pub user: &'a str,

    /// The login shell of `user`.
    pub shell: &'a str,

    /// Volume names to mount points. None of the installers place data on them; they are only
    /// reported at the start of a run.
    pub volumes: &'a BTreeMap<String, String>,
}

impl RunContext<'_> {
    pub fn aliases(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.alias().to_owned()).collect()
    }

    /// Log what a run of `package` is about to set up.
    pub fn log_start(&self, package: &str) {
        info!(
            "Installing {} for {} on {} nodes (master: {})",
            package,
            self.user,
            self.nodes.len(),
            self.master.alias()
        );
        for (name, path) in self.volumes.iter() {
            debug!("Volume {} is mounted at {}", name, path);
        }
    }
}

pub trait Plugin {
    fn name(&self) -> &'static str;

    /// Install and configure the package on every node. The first error aborts the run.
    fn run(&self, ctx: &RunContext<'_>) -> Result<(), failure::Error>;
}


#[cfg(test)]
mod test {
    use super::test_util::MockCluster;

    #[test]
    fn context_with_volumes() {
        let mut cluster = MockCluster::new(2);
        cluster.volumes.insert("data".into(), "/mnt/data".into());

        let ctx = cluster.context();
        ctx.log_start("Hadoop");

        assert_eq!(ctx.aliases(), vec!["master", "node001", "node002"]);
        assert_eq!(ctx.volumes.get("data").map(String::as_str), Some("/mnt/data"));
    }
}
