//! Builds Hadoop 2.x (HDFS, YARN and MapReduce) from source on every node of the cluster and
//! configures the master as namenode and resource manager, along the lines of
//! https://raseshmori.wordpress.com/2012/10/14/install-hadoop-nextgen-yarn-multi-node-cluster/

use std::io::Write;
use std::sync::Arc;

use clap::clap_app;

use log::info;

use serde::{Deserialize, Serialize};

use crate::common::{
    apache::{tarball_url, HADOOP_APACHE_MIRROR, HADOOP_SRC_URL_TEMPLATE},
    cluster_args, follow_instructions, rc_file, ClusterArgs,
};
use crate::config::{PoolSettings, Settings};
use crate::error::InstallError;
use crate::firewall::{self, AwsCli, Firewall};
use crate::node::Node;
use crate::phase;
use crate::plugins::{Plugin, RunContext};
use crate::pool::Pool;
use crate::remote::FileMode;
use crate::template::{render, render_xml, Vars};

/// Port of the namenode web UI.
pub const NAMENODE_STATUS_PORT: u16 = 50070;

/// Port of the job tracker web UI.
pub const JOB_TRACKER_STATUS_PORT: u16 = 50030;

const USER_ENV_TEMPLATE: &str = "\
export HADOOP_HOME={hadoop_home}
export HADOOP_PREFIX={hadoop_home}
export PATH=$PATH:$HADOOP_PREFIX/bin
export HADOOP_MAPRED_HOME=$HADOOP_HOME
export HADOOP_COMMON_HOME=$HADOOP_HOME
export HADOOP_HDFS_HOME=$HADOOP_HOME
export YARN_HOME=$HADOOP_HOME
export HADOOP_CONF_DIR=$HADOOP_HOME/etc/hadoop
export YARN_CONF_DIR=$HADOOP_HOME/etc/hadoop
";

const CORE_SITE_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<?xml-stylesheet type="text/xsl" href="configuration.xsl"?>
<configuration>
  <property>
    <name>fs.default.name</name>
    <value>hdfs://{master}:9000</value>
  </property>
  <property>
    <name>hadoop.tmp.dir</name>
    <value>{hadoop_tmpdir}</value>
  </property>
</configuration>
"#;

const HDFS_SITE_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<?xml-stylesheet type="text/xsl" href="configuration.xsl"?>
<configuration>
  <property>
    <name>dfs.replication</name>
    <value>{replication}</value>
  </property>
  <property>
    <name>dfs.permissions</name>
    <value>false</value>
  </property>
  <property>
    <name>dfs.namenode.name.dir</name>
    <value>file:{hdfs_root}/{user}/namenode</value>
  </property>
  <property>
    <name>dfs.datanode.data.dir</name>
    <value>file:{hdfs_root}/{user}/datanode</value>
  </property>
</configuration>
"#;

const MAPRED_SITE_TEMPLATE: &str = r#"<?xml version="1.0"?>
<configuration>
  <property>
    <name>mapreduce.framework.name</name>
    <value>yarn</value>
  </property>
</configuration>
"#;

const YARN_SITE_TEMPLATE: &str = r#"<?xml version="1.0"?>
<configuration>
  <property>
    <name>yarn.nodemanager.aux-services</name>
    <value>mapreduce_shuffle</value>
  </property>
  <property>
    <name>yarn.nodemanager.aux-services.mapreduce.shuffle.class</name>
    <value>org.apache.hadoop.mapred.ShuffleHandler</value>
  </property>
  <property>
    <name>yarn.resourcemanager.resource-tracker.address</name>
    <value>{master}:8025</value>
  </property>
  <property>
    <name>yarn.resourcemanager.scheduler.address</name>
    <value>{master}:8030</value>
  </property>
  <property>
    <name>yarn.resourcemanager.address</name>
    <value>{master}:8040</value>
  </property>
</configuration>
"#;

/// The `etc/hadoop` files rendered from templates, in the order they are written.
const SITE_FILES: &[(&str, &str)] = &[
    ("core-site.xml", CORE_SITE_TEMPLATE),
    ("hdfs-site.xml", HDFS_SITE_TEMPLATE),
    ("mapred-site.xml", MAPRED_SITE_TEMPLATE),
    ("yarn-site.xml", YARN_SITE_TEMPLATE),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HadoopSettings {
    /// Where Hadoop is installed. If this exists on the master, Hadoop is not built again.
    pub hadoop_home: String,

    /// Parent of the per-user `hadoop.tmp.dir`.
    pub tmpdir_root: String,

    /// Parent of the per-user namenode and datanode directories.
    pub hdfs_root: String,

    pub replication: usize,

    /// Candidate `JAVA_HOME`s, in order of preference.
    pub java_homes: Vec<String>,

    /// Build dependencies, installed one at a time.
    pub apt_packages: Vec<String>,

    pub protobuf_version: String,
    /// Download URL of protobuf; `VERSION` is replaced by `protobuf_version`.
    pub protobuf_url: String,

    pub apache_mirror: String,
    pub hadoop_version: String,
    pub maven_opts: String,

    /// TCP ports opened to the world on the master's security groups.
    pub ports: Vec<u16>,

    /// Write `/home/starthadoop-<user>.sh` and `/home/stophadoop-<user>.sh` on the master.
    pub write_launch_scripts: bool,
}

impl Default for HadoopSettings {
    fn default() -> Self {
        HadoopSettings {
            hadoop_home: "/usr/local/hadoop".into(),
            tmpdir_root: "/mnt/hadoop".into(),
            hdfs_root: "/mnt/hdfs".into(),
            replication: 2,
            java_homes: vec!["/usr/lib/jvm/java-7-openjdk-amd64".into()],
            apt_packages: [
                "maven",
                "cmake",
                "pkg-config",
                "libssl-dev",
                "snappy",
                "libsnappy-dev",
                "libbz2-dev",
                "libjansson-dev",
                "libfuse-dev",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            protobuf_version: "2.5.0".into(),
            protobuf_url: "http://protobuf.googlecode.com/files/protobuf-VERSION.tar.gz".into(),
            apache_mirror: HADOOP_APACHE_MIRROR.into(),
            hadoop_version: "2.5.2".into(),
            maven_opts: "-Xmx2g -XX:MaxPermSize=512M -XX:ReservedCodeCacheSize=512M".into(),
            ports: vec![NAMENODE_STATUS_PORT, JOB_TRACKER_STATUS_PORT],
            write_launch_scripts: true,
        }
    }
}

/// The values substituted into the configuration templates. Built once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HadoopConfig {
    pub master: String,
    pub user: String,
    pub replication: usize,
    pub hadoop_home: String,
    pub hadoop_tmpdir: String,
    pub hdfs_root: String,
}

impl HadoopConfig {
    pub fn new(settings: &HadoopSettings, master: &str, user: &str) -> Self {
        HadoopConfig {
            master: master.into(),
            user: user.into(),
            replication: settings.replication,
            hadoop_home: settings.hadoop_home.clone(),
            hadoop_tmpdir: dir!(&settings.tmpdir_root, format!("hadoop-{}", user)),
            hdfs_root: settings.hdfs_root.clone(),
        }
    }

    pub fn vars(&self) -> Vars<'static> {
        let mut vars = Vars::new();
        vars.insert("master", self.master.clone());
        vars.insert("user", self.user.clone());
        vars.insert("replication", self.replication.to_string());
        vars.insert("hadoop_home", self.hadoop_home.clone());
        vars.insert("hadoop_tmpdir", self.hadoop_tmpdir.clone());
        vars.insert("hdfs_root", self.hdfs_root.clone());
        vars
    }

    pub fn conf_dir(&self) -> String {
        dir!(&self.hadoop_home, "etc/hadoop")
    }

    fn user_home(&self) -> String {
        dir!("/home", &self.user)
    }

    fn env_script(&self) -> String {
        dir!(self.user_home(), "sethadoopenv.sh")
    }
}

pub fn cli_options() -> clap::App<'static, 'static> {
    let app = clap_app! { hadoop =>
        (about: "Builds Hadoop 2 (HDFS, YARN, MapReduce) from source on every node and \
                 configures the first node as namenode and resource manager.")
        (@arg NO_LAUNCH_SCRIPTS: --no_launch_scripts
         "Do not write start/stop scripts for USER on the master.")
    };

    cluster_args(app)
}

pub fn run(sub_m: &clap::ArgMatches<'_>, settings: &Settings) -> Result<(), failure::Error> {
    let cluster = ClusterArgs::connect(sub_m)?;

    let mut hadoop = settings.hadoop.clone();
    if sub_m.is_present("NO_LAUNCH_SCRIPTS") {
        hadoop.write_launch_scripts = false;
    }

    let installer = HadoopInstaller::new(
        hadoop,
        settings.pool.clone(),
        Arc::new(AwsCli::new(cluster.region.clone())),
    );

    info!("Running the {} installer", installer.name());
    installer.run(&cluster.context())
}

pub struct HadoopInstaller {
    settings: Arc<HadoopSettings>,
    pool: PoolSettings,
    firewall: Arc<dyn Firewall>,
}

impl HadoopInstaller {
    pub fn new(settings: HadoopSettings, pool: PoolSettings, firewall: Arc<dyn Firewall>) -> Self {
        HadoopInstaller {
            settings: Arc::new(settings),
            pool,
            firewall,
        }
    }

    /// Build and install Hadoop, unless the master already has it.
    fn install(&self, pool: &mut Pool, ctx: &RunContext<'_>) -> Result<(), failure::Error> {
        if ctx.master.path_exists(&self.settings.hadoop_home)? {
            info!(
                "Hadoop is already installed in {}; skipping the build",
                self.settings.hadoop_home
            );
            return Ok(());
        }

        info!("Installing Hadoop...");

        phase::run(pool, "Creating hadoop usergroup", ctx.nodes, |node| {
            node.run("groupadd hadoop")
        })?;

        let settings = Arc::clone(&self.settings);
        phase::run(pool, "Installing apt packages", ctx.nodes, move |node| {
            install_apt_packages(node, &settings)
        })?;

        let settings = Arc::clone(&self.settings);
        phase::run(pool, "Installing protobuf", ctx.nodes, move |node| {
            install_protobuf(node, &settings)
        })?;

        let settings = Arc::clone(&self.settings);
        phase::run(pool, "Building Hadoop", ctx.nodes, move |node| {
            build_hadoop(node, &settings)
        })?;

        let settings = Arc::clone(&self.settings);
        let user = ctx.user.to_owned();
        phase::run(
            pool,
            &format!("Setting Hadoop owner to {}", ctx.user),
            ctx.nodes,
            move |node| node.run(&format!("chown -R {} {}", user, settings.hadoop_home)),
        )?;

        Ok(())
    }

    fn configure(&self, pool: &mut Pool, ctx: &RunContext<'_>) -> Result<(), failure::Error> {
        info!("Configuring Hadoop...");

        let user = ctx.user.to_owned();
        phase::run(
            pool,
            &format!("Adding user {} to hadoop group", ctx.user),
            ctx.nodes,
            move |node| node.run(&format!("gpasswd -a {} hadoop", user)),
        )?;

        let cfg = Arc::new(HadoopConfig::new(
            &self.settings,
            ctx.master.alias(),
            ctx.user,
        ));

        info!("Installing configuration templates...");

        for script in &["libexec/hadoop-config.sh", "etc/hadoop/yarn-env.sh"] {
            let settings = Arc::clone(&self.settings);
            let path = dir!(&self.settings.hadoop_home, script);
            phase::run(pool, &format!("Setting JAVA_HOME in {}", script), ctx.nodes, move |node| {
                let java = find_java_home(node, &settings.java_homes)?;
                prepend_java_home(node, &path, &java)
            })?;
        }

        {
            let (cfg, shell) = (Arc::clone(&cfg), ctx.shell.to_owned());
            phase::run(pool, "Setting up user environment", ctx.nodes, move |node| {
                setup_user_env(node, &cfg, &shell)
            })?;
        }

        if self.settings.write_launch_scripts {
            info!("Writing launch scripts");
            write_launch_scripts(ctx.master, &cfg.user)?;
        }

        for &(name, template) in SITE_FILES {
            let cfg = Arc::clone(&cfg);
            phase::run(pool, &format!("Writing {}", name), ctx.nodes, move |node| {
                write_site_file(node, &cfg, name, template)
            })?;
        }

        {
            let (cfg, aliases) = (Arc::clone(&cfg), ctx.aliases());
            phase::run(pool, "Configuring slaves", ctx.nodes, move |node| {
                let mut slaves = node.remote_file(&dir!(cfg.conf_dir(), "slaves"), FileMode::Write);
                for alias in aliases.iter() {
                    writeln!(slaves, "{}", alias)?;
                }
                slaves.close()
            })?;
        }

        {
            let cfg = Arc::clone(&cfg);
            phase::run(pool, "Creating HDFS", ctx.nodes, move |node| {
                create_hdfs_dirs(node, &cfg)
            })?;
        }

        info!("Formatting namenode on {}", ctx.master.alias());
        format_namenode(ctx.master, &cfg)?;

        Ok(())
    }

    fn open_ports(&self, master: &Node) -> Result<(), failure::Error> {
        if master.security_groups().is_empty() {
            info!("No security groups given for {}; not opening ports", master.alias());
            return Ok(());
        }

        let added = firewall::ensure_ports_open(
            &*self.firewall,
            master.security_groups(),
            &self.settings.ports,
        )?;
        info!("Opened {} ports", added);

        Ok(())
    }
}

impl Plugin for HadoopInstaller {
    fn name(&self) -> &'static str {
        "hadoop"
    }

    fn run(&self, ctx: &RunContext<'_>) -> Result<(), failure::Error> {
        ctx.log_start("Hadoop");

        let mut pool = self.pool.build();
        let mut timers = vec![];

        time!(timers, "Install", self.install(&mut pool, ctx)?);
        time!(timers, "Configure", self.configure(&mut pool, ctx)?);
        time!(timers, "Open ports", self.open_ports(ctx.master)?);

        info!(
            "Job tracker status: http://{}:{}",
            ctx.master.hostname(),
            JOB_TRACKER_STATUS_PORT
        );
        info!(
            "Namenode status: http://{}:{}",
            ctx.master.hostname(),
            NAMENODE_STATUS_PORT
        );

        for (label, duration) in timers {
            info!("{}: {:?}", label, duration);
        }

        Ok(())
    }
}

fn install_apt_packages(node: &Node, settings: &HadoopSettings) -> Result<(), failure::Error> {
    for pkg in settings.apt_packages.iter() {
        node.apt_command(&format!("install {}", pkg))?;
    }
    node.apt_command("clean")
}

fn install_protobuf(node: &Node, settings: &HadoopSettings) -> Result<(), failure::Error> {
    let version = &settings.protobuf_version;
    let src = format!("protobuf-{}", version);

    follow_instructions(
        node,
        &[
            format!("wget {}", settings.protobuf_url.replace("VERSION", version)),
            format!("tar zvxf {}.tar.gz", src),
            format!("cd {}", src),
            "./configure".into(),
            "make".into(),
            "make check".into(),
            "sudo make install".into(),
            "sudo ldconfig".into(),
            "cd ~".into(),
            format!("rm -rf {}*", src),
        ],
        "; ",
    )
}

fn build_hadoop(node: &Node, settings: &HadoopSettings) -> Result<(), failure::Error> {
    let version = &settings.hadoop_version;
    let url = tarball_url(&settings.apache_mirror, HADOOP_SRC_URL_TEMPLATE, version);

    follow_instructions(
        node,
        &[
            format!("wget {}", url),
            format!("tar xzvf hadoop-{}-src.tar.gz", version),
            format!("cd hadoop-{}-src", version),
            "mvn clean".into(),
            format!(
                "MAVEN_OPTS=\"{}\" mvn compile -Pnative -Drequire.snappy -Drequire.openssl",
                settings.maven_opts
            ),
            "mvn package -Pdist,native -DskipTests".into(),
            format!(
                "cp -r hadoop-dist/target/hadoop-{} {}",
                version, settings.hadoop_home
            ),
            format!("chown -R :hadoop {}", settings.hadoop_home),
            "cd ~".into(),
            "rm -rf hadoop*".into(),
        ],
        "; ",
    )
}

/// The first of `candidates` that is a directory on `node`.
fn find_java_home(node: &Node, candidates: &[String]) -> Result<String, failure::Error> {
    for java in candidates {
        if node.is_dir(java)? {
            return Ok(java.clone());
        }
    }

    Err(InstallError::MissingResource {
        node: node.alias().into(),
        what: format!("a JAVA_HOME (tried {})", candidates.join(", ")),
    }
    .into())
}

/// Put `export JAVA_HOME=<java>` at the top of the script at `path`. The original is kept as
/// `<path>.old`.
fn prepend_java_home(node: &Node, path: &str, java: &str) -> Result<(), failure::Error> {
    let old = format!("{}.old", path);
    node.run(&format!("mv {} {}", path, old))?;
    let contents = node.read_file(&old)?;

    let mut script = node.remote_file(path, FileMode::Write);
    writeln!(script, "export JAVA_HOME={}", java)?;
    script.write_all(contents.as_bytes())?;
    script.close()
}

fn setup_user_env(node: &Node, cfg: &HadoopConfig, shell: &str) -> Result<(), failure::Error> {
    let mut env = node.remote_file(&cfg.env_script(), FileMode::Write);
    env.write_all(render(USER_ENV_TEMPLATE, &cfg.vars()).as_bytes())?;
    env.close()?;

    let mut rc = node.remote_file(&dir!(cfg.user_home(), rc_file(shell)), FileMode::Append);
    writeln!(rc, "source $HOME/sethadoopenv.sh")?;
    rc.close()
}

fn write_site_file(
    node: &Node,
    cfg: &HadoopConfig,
    name: &str,
    template: &str,
) -> Result<(), failure::Error> {
    let mut file = node.remote_file(&dir!(cfg.conf_dir(), name), FileMode::Write);
    file.write_all(render_xml(template, &cfg.vars()).as_bytes())?;
    file.close()
}

fn create_hdfs_dirs(node: &Node, cfg: &HadoopConfig) -> Result<(), failure::Error> {
    let tmpdir = &cfg.hadoop_tmpdir;
    let namenode = dir!(&cfg.hdfs_root, &cfg.user, "namenode");
    let datanode = dir!(&cfg.hdfs_root, &cfg.user, "datanode");

    with_node!(node =>
        format!("mkdir -p {}", tmpdir),
        format!("mkdir -p {}", namenode),
        format!("mkdir -p {}", datanode),
        format!("chown -R {}:hadoop {}", cfg.user, tmpdir),
        format!("chown -R {}:hadoop {}", cfg.user, namenode),
        format!("chown -R {}:hadoop {}", cfg.user, datanode),
    );

    Ok(())
}

fn format_namenode(master: &Node, cfg: &HadoopConfig) -> Result<(), failure::Error> {
    master.run(&format!(
        "su -l {} -c \"source {}; {} namenode -format -force\"",
        cfg.user,
        cfg.env_script(),
        dir!(&cfg.hadoop_home, "bin/hdfs"),
    ))
}

/// A one-line script that runs the given daemon commands as `user` with the Hadoop environment.
fn launch_script(user: &str, commands: &[&str]) -> String {
    let mut steps = vec![format!("source /home/{}/sethadoopenv.sh", user)];
    steps.extend(commands.iter().map(|c| format!("\\$HADOOP_HOME/sbin/{}", c)));

    format!("su -l {} -c \"{}\"\n", user, steps.join(";"))
}

fn write_launch_scripts(master: &Node, user: &str) -> Result<(), failure::Error> {
    let start = launch_script(
        user,
        &[
            "hadoop-daemon.sh start namenode",
            "hadoop-daemons.sh start datanode",
            "yarn-daemon.sh start resourcemanager",
            "yarn-daemons.sh start nodemanager",
            "mr-jobhistory-daemon.sh start historyserver",
        ],
    );
    let stop = launch_script(
        user,
        &[
            "mr-jobhistory-daemon.sh stop historyserver",
            "yarn-daemons.sh stop nodemanager",
            "yarn-daemon.sh stop resourcemanager",
            "hadoop-daemons.sh stop datanode",
            "hadoop-daemon.sh stop namenode",
        ],
    );

    for (name, contents) in &[("starthadoop", start), ("stophadoop", stop)] {
        let path = format!("/home/{}-{}.sh", name, user);
        let mut script = master.remote_file(&path, FileMode::Write);
        script.write_all(contents.as_bytes())?;
        script.close()?;
        master.run(&format!("chmod +x {}", path))?;
    }

    Ok(())
}
