//! Routines shared by all of the installers.

#[macro_use]
pub mod macros;

pub mod apache;

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;

use crate::node::{self, Node};

/// Quote `s` so that a POSIX shell reads it back as exactly one word, byte for byte.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

/// The startup file, relative to the home directory, that an interactive login with the given
/// shell reads. Unknown shells get `.bashrc`.
pub fn rc_file(shell: &str) -> &'static str {
    match shell.rsplit('/').next().unwrap_or(shell) {
        "zsh" => ".zshrc",
        "sh" | "dash" | "ksh" => ".profile",
        _ => ".bashrc",
    }
}

/// Run a list of shell instructions as a single remote command, joined by `sep`. A single command
/// keeps shell state (e.g. `cd`, `export`) across instructions.
///
/// Use `"; "` to keep going after a failing instruction and `" && "` to stop at the first one.
pub fn follow_instructions<S: AsRef<str>>(
    node: &Node,
    instructions: &[S],
    sep: &str,
) -> Result<(), failure::Error> {
    let cmd = instructions
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<&str>>()
        .join(sep);

    node.run(&cmd)
}

/// Parse a `name=value` pair from the command line.
pub fn parse_pair(spec: &str) -> Option<(&str, &str)> {
    let mut parts = spec.splitn(2, '=');
    match (parts.next(), parts.next()) {
        (Some(name), Some(value)) if !name.is_empty() => Some((name, value)),
        _ => None,
    }
}

/// Arguments every installer subcommand takes: who to log in as, who the cluster is for, and
/// which machines make up the cluster.
pub fn cluster_args(app: clap::App<'static, 'static>) -> clap::App<'static, 'static> {
    use clap::Arg;

    app.arg(
        Arg::with_name("USER")
            .long("user")
            .takes_value(true)
            .required(true)
            .help("The user the cluster is set up for (e.g. alice)"),
    )
    .arg(
        Arg::with_name("LOGIN")
            .long("login")
            .takes_value(true)
            .help("(Optional) The user to log in to every node as (defaults to `root`)"),
    )
    .arg(
        Arg::with_name("SHELL")
            .long("shell")
            .takes_value(true)
            .help("(Optional) The login shell of USER (defaults to /bin/bash)"),
    )
    .arg(
        Arg::with_name("SECURITY_GROUP")
            .long("security_group")
            .takes_value(true)
            .multiple(true)
            .number_of_values(1)
            .help("(Optional) A security group ID the master belongs to (e.g. sg-0a1b2c3d)"),
    )
    .arg(
        Arg::with_name("REGION")
            .long("region")
            .takes_value(true)
            .help("(Optional) The cloud region of the security groups"),
    )
    .arg(
        Arg::with_name("VOLUME")
            .long("volume")
            .takes_value(true)
            .multiple(true)
            .number_of_values(1)
            .validator(|v| {
                parse_pair(&v)
                    .map(|_| ())
                    .ok_or_else(|| format!("expected NAME=MOUNT_PATH, got {:?}", v))
            })
            .help("(Optional) A volume mounted on the nodes, as NAME=MOUNT_PATH"),
    )
    .arg(
        Arg::with_name("MASTER")
            .required(true)
            .takes_value(true)
            .help("The master node as [ALIAS=]HOST:PORT (e.g. master=10.0.0.4:22)"),
    )
    .arg(
        Arg::with_name("WORKERS")
            .multiple(true)
            .takes_value(true)
            .help("The worker nodes as [ALIAS=]HOST:PORT"),
    )
}

/// A connected cluster plus the identity it is being set up for, as parsed from `cluster_args`.
pub struct ClusterArgs {
    pub master: Arc<Node>,

    /// All nodes, master first.
    pub nodes: Vec<Arc<Node>>,

    pub user: String,
    pub shell: String,
    pub volumes: BTreeMap<String, String>,
    pub region: Option<String>,
}

impl ClusterArgs {
    /// Parse the arguments and open a connection to every node.
    pub fn connect(sub_m: &clap::ArgMatches<'_>) -> Result<Self, failure::Error> {
        let login = sub_m.value_of("LOGIN").unwrap_or("root");
        let groups: Vec<String> = sub_m
            .values_of("SECURITY_GROUP")
            .map(|groups| groups.map(Into::into).collect())
            .unwrap_or_default();

        let mut specs = vec![sub_m.value_of("MASTER").unwrap()];
        if let Some(workers) = sub_m.values_of("WORKERS") {
            specs.extend(workers);
        }

        let mut volumes = BTreeMap::new();
        for volume in sub_m.values_of("VOLUME").into_iter().flatten() {
            let (name, path) = parse_pair(volume)
                .ok_or_else(|| failure::format_err!("Invalid volume {:?}", volume))?;
            volumes.insert(name.to_owned(), path.to_owned());
        }

        info!("Connecting to {} nodes as {}", specs.len(), login);
        let nodes = node::connect_all(login, &specs, groups)?;

        Ok(ClusterArgs {
            master: Arc::clone(&nodes[0]),
            nodes,
            user: sub_m.value_of("USER").unwrap().into(),
            shell: sub_m.value_of("SHELL").unwrap_or("/bin/bash").into(),
            volumes,
            region: sub_m.value_of("REGION").map(Into::into),
        })
    }

    /// The arguments for `Plugin::run`.
    pub fn context(&self) -> crate::plugins::RunContext<'_> {
        crate::plugins::RunContext {
            nodes: &self.nodes,
            master: &self.master,
            user: &self.user,
            shell: &self.shell,
            volumes: &self.volumes,
        }
    }
}
