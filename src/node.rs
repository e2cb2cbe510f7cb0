//! Handles to the machines of a cluster.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::error::InstallError;
use crate::remote::{FileMode, Remote, RemoteFile, SshRemote};

/// A remote machine of the cluster. Nodes are created before any installer runs and are shared
/// between pool workers as `Arc<Node>`.
pub struct Node {
    /// Unique short name (e.g. `master`, `node001`).
    alias: String,

    /// `host:port` the node was reached at.
    address: String,

    /// Security groups the node belongs to, if known.
    security_groups: Vec<String>,

    remote: Box<dyn Remote>,
}

impl Node {
    pub fn new(alias: &str, address: &str, remote: Box<dyn Remote>) -> Self {
        Node {
            alias: alias.to_owned(),
            address: address.to_owned(),
            security_groups: Vec::new(),
            remote,
        }
    }

    pub fn with_security_groups(mut self, groups: Vec<String>) -> Self {
        self.security_groups = groups;
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// The host part of the address, for URLs.
    pub fn hostname(&self) -> &str {
        self.address.rsplitn(2, ':').last().unwrap_or(&self.address)
    }

    pub fn security_groups(&self) -> &[String] {
        &self.security_groups
    }

    /// Run `cmd` on the node. Fails if it exits with a non-zero status.
    pub fn run(&self, cmd: &str) -> Result<(), failure::Error> {
        self.output(cmd).map(|_| ())
    }

    /// Run `cmd` on the node and return its stdout.
    pub fn output(&self, cmd: &str) -> Result<String, failure::Error> {
        debug!("{}: {}", self.alias, cmd);
        self.remote.execute(cmd)
    }

    /// Open a file on the node for writing. Nothing is sent until the file is closed or dropped.
    pub fn remote_file(&self, path: &str, mode: FileMode) -> RemoteFile<'_> {
        RemoteFile::open(&*self.remote, path, mode)
    }

    pub fn read_file(&self, path: &str) -> Result<String, failure::Error> {
        self.remote.read_file(path)
    }

    pub fn path_exists(&self, path: &str) -> Result<bool, failure::Error> {
        self.remote.path_exists(path)
    }

    pub fn is_dir(&self, path: &str) -> Result<bool, failure::Error> {
        self.remote.is_dir(path)
    }

    /// Copy the local file at `local` to `remote_path` on the node.
    pub fn put<P: AsRef<Path>>(&self, local: P, remote_path: &str) -> Result<(), failure::Error> {
        let contents = std::fs::read_to_string(local.as_ref()).map_err(|e| {
            InstallError::MissingResource {
                node: "localhost".into(),
                what: format!("{} ({})", local.as_ref().display(), e),
            }
        })?;

        let mut file = self.remote_file(remote_path, FileMode::Write);
        file.write_all(contents.as_bytes())?;
        file.close()
    }

    /// Run an `apt-get` subcommand (e.g. `install maven`) non-interactively.
    pub fn apt_command(&self, subcommand: &str) -> Result<(), failure::Error> {
        self.run(&format!(
            "DEBIAN_FRONTEND=noninteractive apt-get \
             -o Dpkg::Options::=\"--force-confnew\" -y --force-yes {}",
            subcommand
        ))
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("alias", &self.alias)
            .field("address", &self.address)
            .field("security_groups", &self.security_groups)
            .finish()
    }
}

/// The alias a node gets when none is given: `master` for the first node, then `node001`,
/// `node002`, ...
pub fn default_alias(index: usize) -> String {
    if index == 0 {
        "master".into()
    } else {
        format!("node{:03}", index)
    }
}

/// Split `[alias=]host:port` into its alias (if any) and address.
pub fn parse_host_spec(spec: &str) -> Result<(Option<&str>, &str), failure::Error> {
    if spec.starts_with('=') {
        return Err(InstallError::BadHostSpec { spec: spec.into() }.into());
    }

    let (alias, address) = match crate::common::parse_pair(spec) {
        Some((alias, address)) => (Some(alias), address),
        None => (None, spec),
    };

    let valid_port = address
        .rsplitn(2, ':')
        .next()
        .map(|port| port.parse::<u16>().is_ok())
        .unwrap_or(false);

    if address.is_empty() || !address.contains(':') || !valid_port {
        return Err(InstallError::BadHostSpec { spec: spec.into() }.into());
    }

    Ok((alias, address))
}

/// Parse every host spec and give each host its alias, either the one it was given or its
/// default one. Aliases must be unique.
pub fn assign_aliases<'s>(specs: &[&'s str]) -> Result<Vec<(String, &'s str)>, failure::Error> {
    let mut seen = HashSet::new();
    let mut hosts = Vec::with_capacity(specs.len());

    for (i, spec) in specs.iter().enumerate() {
        let (alias, address) = parse_host_spec(spec)?;
        let alias = alias.map(String::from).unwrap_or_else(|| default_alias(i));

        if !seen.insert(alias.clone()) {
            return Err(InstallError::DuplicateAlias { alias }.into());
        }

        hosts.push((alias, address));
    }

    Ok(hosts)
}

/// Connect to every host in `specs` as `login`. The first spec is the master, which is also the
/// only node given `master_groups`.
pub fn connect_all(
    login: &str,
    specs: &[&str],
    master_groups: Vec<String>,
) -> Result<Vec<Arc<Node>>, failure::Error> {
    let hosts = assign_aliases(specs)?;
    let mut nodes = Vec::with_capacity(hosts.len());

    for (i, (alias, address)) in hosts.into_iter().enumerate() {
        let (ip, _) = spurs_util::get_host_ip(address);
        info!("Connecting to {} ({}) as {}", alias, ip, login);

        let remote = SshRemote::connect(login, address)?;
        let mut node = Node::new(&alias, address, Box::new(remote));
        if i == 0 {
            node = node.with_security_groups(master_groups.clone());
        }

        nodes.push(Arc::new(node));
    }

    Ok(nodes)
}
