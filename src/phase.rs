//! Phases: apply one operation to every node of a set in parallel, then wait for all of them
//! before moving on.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::node::Node;
use crate::pool::Pool;

/// Queue `op(node)` on `pool` for every node in `nodes`, tagged with the node's alias. Does not
/// block.
pub fn submit<F>(pool: &mut Pool, nodes: &[Arc<Node>], op: &Arc<F>)
where
    F: Fn(&Node) -> Result<(), failure::Error> + Send + Sync + 'static,
{
    for node in nodes {
        let node = Arc::clone(node);
        let op = Arc::clone(op);
        let jid = node.alias().to_owned();
        pool.submit(&jid, Box::new(move || (*op)(&*node)));
    }
}

/// Run `op` on every node in `nodes` and wait for all of them. Fails with the first error any
/// node hit, after all nodes are done.
pub fn run<F>(pool: &mut Pool, label: &str, nodes: &[Arc<Node>], op: F) -> Result<(), failure::Error>
where
    F: Fn(&Node) -> Result<(), failure::Error> + Send + Sync + 'static,
{
    info!("{}", label);
    let start = Instant::now();

    submit(pool, nodes, &Arc::new(op));
    pool.wait(nodes.len())?;

    debug!("{}: done on {} nodes in {:?}", label, nodes.len(), start.elapsed());

    Ok(())
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use super::*;
    use crate::remote::test_util::{CallLog, MockRemote};

    fn nodes(log: &CallLog, aliases: &[&str]) -> Vec<Arc<Node>> {
        aliases
            .iter()
            .enumerate()
            .map(|(i, alias)| {
                let remote = MockRemote::new(alias, log).failing_on(&format!("fail-{}", alias));
                Arc::new(Node::new(alias, &format!("10.0.0.{}:22", i + 4), Box::new(remote)))
            })
            .collect()
    }

    #[test]
    fn empty_phase() {
        let mut pool = Pool::new(2, None);
        run(&mut pool, "nothing", &[], |_| panic!("no nodes to run on")).unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn runs_once_per_node() {
        let log = CallLog::default();
        let nodes = nodes(&log, &["master", "node001", "node002"]);
        let mut pool = Pool::new(2, None);

        run(&mut pool, "Creating hadoop group", &nodes, |node| {
            node.run("groupadd hadoop")
        })
        .unwrap();

        let aliases: BTreeSet<_> = log
            .executed("groupadd hadoop")
            .into_iter()
            .map(|(_, alias)| alias)
            .collect();
        assert_eq!(log.executed("groupadd hadoop").len(), 3);
        assert_eq!(
            aliases,
            ["master", "node001", "node002"]
                .iter()
                .map(|s| s.to_string())
                .collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn phases_are_ordered() {
        let log = CallLog::default();
        let nodes = nodes(&log, &["master", "node001", "node002", "node003"]);
        let mut pool = Pool::new(3, None);

        run(&mut pool, "first", &nodes, |node| node.run("echo first")).unwrap();
        run(&mut pool, "second", &nodes, |node| node.run("echo second")).unwrap();

        let last_first = log.executed("echo first").iter().map(|(i, _)| *i).max();
        let first_second = log.executed("echo second").iter().map(|(i, _)| *i).min();
        assert!(last_first < first_second);
    }

    #[test]
    fn failure_stops_the_next_phase() {
        let log = CallLog::default();
        let nodes = nodes(&log, &["master", "node001", "node002"]);
        let mut pool = Pool::new(3, None);

        let result = run(&mut pool, "first", &nodes, |node| {
            node.run(&format!("fail-{}", node.alias()))
        })
        .and_then(|()| run(&mut pool, "second", &nodes, |node| node.run("echo second")));

        assert!(result.is_err());
        assert_eq!(log.executed("fail-").len(), 3);
        assert!(log.executed("echo second").is_empty());
    }

    #[test]
    fn jobs_are_tagged_with_alias() {
        let log = CallLog::default();
        let nodes = nodes(&log, &["master", "node001"]);
        let mut pool = Pool::new(2, None);

        let err = run(&mut pool, "panicking", &nodes, |node| {
            if node.alias() == "node001" {
                panic!("no such file");
            }
            Ok(())
        })
        .unwrap_err();

        match err.downcast_ref::<crate::error::InstallError>() {
            Some(crate::error::InstallError::JobPanicked { job, .. }) => assert_eq!(job, "node001"),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
