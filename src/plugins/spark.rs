//! Builds Spark from source on every node that does not have it yet, and writes the cluster
//! configuration plus start/stop scripts for the master.
//!
//! Changing the set of nodes later requires deleting Spark and running this again, since an
//! existing install only has its configuration rewritten.

use std::io::Write;
use std::sync::Arc;

use clap::clap_app;

use log::{debug, info};

use serde::{Deserialize, Serialize};

use crate::common::{
    apache::{tarball_url, SPARK_APACHE_MIRROR, SPARK_SRC_URL_TEMPLATE},
    cluster_args, follow_instructions, ClusterArgs,
};
use crate::config::{PoolSettings, Settings};
use crate::node::Node;
use crate::phase;
use crate::plugins::{Plugin, RunContext};
use crate::remote::FileMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SparkSettings {
    pub spark_home: String,
    pub spark_version: String,
    pub apache_mirror: String,

    /// Script in `/etc/profile.d` that puts Spark on the `PATH`.
    pub profile: String,

    pub maven_opts: String,

    /// Appended to `PYTHONPATH` in `spark-env.sh`.
    pub pythonpath: String,

    /// `LD_LIBRARY_PATH` in `spark-env.sh`.
    pub ld_library_path: String,
}

impl Default for SparkSettings {
    fn default() -> Self {
        SparkSettings {
            spark_home: "/opt/Spark".into(),
            spark_version: "1.3.1".into(),
            apache_mirror: SPARK_APACHE_MIRROR.into(),
            profile: "/etc/profile.d/spark.sh".into(),
            maven_opts: "-Xmx2g -XX:MaxPermSize=512M -XX:ReservedCodeCacheSize=512m".into(),
            pythonpath: String::new(),
            ld_library_path: String::new(),
        }
    }
}

pub fn cli_options() -> clap::App<'static, 'static> {
    let app = clap_app! { spark =>
        (about: "Builds Spark from source on every node and writes the cluster configuration.")
        (@arg PYTHONPATH: --pythonpath +takes_value
         "Extra entries for PYTHONPATH in spark-env.sh")
        (@arg LD_LIBRARY_PATH: --ld_library_path +takes_value
         "LD_LIBRARY_PATH in spark-env.sh")
    };

    cluster_args(app)
}

pub fn run(sub_m: &clap::ArgMatches<'_>, settings: &Settings) -> Result<(), failure::Error> {
    let cluster = ClusterArgs::connect(sub_m)?;

    let mut spark = settings.spark.clone();
    if let Some(pythonpath) = sub_m.value_of("PYTHONPATH") {
        spark.pythonpath = pythonpath.into();
    }
    if let Some(ld_library_path) = sub_m.value_of("LD_LIBRARY_PATH") {
        spark.ld_library_path = ld_library_path.into();
    }

    let installer = SparkInstaller::new(spark, settings.pool.clone());
    info!("Running the {} installer", installer.name());
    installer.run(&cluster.context())
}

pub struct SparkInstaller {
    settings: Arc<SparkSettings>,
    pool: PoolSettings,
}

impl SparkInstaller {
    pub fn new(settings: SparkSettings, pool: PoolSettings) -> Self {
        SparkInstaller {
            settings: Arc::new(settings),
            pool,
        }
    }

    fn conf(&self, file: &str) -> String {
        dir!(&self.settings.spark_home, "conf", file)
    }
}

impl Plugin for SparkInstaller {
    fn name(&self) -> &'static str {
        "spark"
    }

    fn run(&self, ctx: &RunContext<'_>) -> Result<(), failure::Error> {
        ctx.log_start("Spark");

        let mut pool = self.pool.build();

        let settings = Arc::clone(&self.settings);
        phase::run(&mut pool, "Building Spark", ctx.nodes, move |node| {
            build_spark(node, &settings)
        })?;

        let settings = Arc::clone(&self.settings);
        let slaves_path = self.conf("slaves");
        let aliases = ctx.aliases();
        phase::run(&mut pool, "...writing conf/slaves file to all nodes", ctx.nodes, move |node| {
            let mut slaves = node.remote_file(&slaves_path, FileMode::Write);
            writeln!(slaves, "{}", aliases.join("\n"))?;
            slaves.close()?;

            let mut profile = node.remote_file(&settings.profile, FileMode::Write);
            writeln!(profile, "export SPARK_HOME={}", settings.spark_home)?;
            writeln!(profile, "export PATH=$PATH:$SPARK_HOME/bin")?;
            profile.close()
        })?;

        let settings = Arc::clone(&self.settings);
        let env_path = self.conf("spark-env.sh");
        phase::run(&mut pool, "...writing spark-env script to all nodes", ctx.nodes, move |node| {
            let mut env = node.remote_file(&env_path, FileMode::Write);
            writeln!(env, "#!/usr/bin/env bash")?;
            writeln!(env, "export PYTHONPATH=$PYTHONPATH:{}", settings.pythonpath)?;
            writeln!(env, "export LD_LIBRARY_PATH={}", settings.ld_library_path)?;
            env.close()
        })?;

        info!("...writing start/stopspark scripts to /home");
        write_launch_scripts(ctx.master, &self.settings.spark_home)?;

        Ok(())
    }
}

fn build_spark(node: &Node, settings: &SparkSettings) -> Result<(), failure::Error> {
    if node.path_exists(&settings.spark_home)? {
        debug!("Spark is already installed on {}", node.alias());
        return Ok(());
    }

    info!("...building on {}", node.alias());

    let url = tarball_url(
        &settings.apache_mirror,
        SPARK_SRC_URL_TEMPLATE,
        &settings.spark_version,
    );

    follow_instructions(
        node,
        &[
            format!("wget -O spark.tgz {}", url),
            "tar xvf spark.tgz".into(),
            "rm spark.tgz".into(),
            format!("mv spark-{} {}", settings.spark_version, settings.spark_home),
            format!("cd {}", settings.spark_home),
            format!("export MAVEN_OPTS=\"{}\"", settings.maven_opts),
            "build/mvn -Phadoop-provided -Phadoop-2.4 -Pyarn -Dhadoop.version=2.4.0 \
             -DskipTests clean package 2>&1"
                .into(),
        ],
        " && ",
    )?;

    info!("...done building on {}", node.alias());

    Ok(())
}

fn write_launch_scripts(master: &Node, spark_home: &str) -> Result<(), failure::Error> {
    let scripts = [
        ("/home/startspark.sh", ["start-master.sh", "start-slaves.sh"]),
        ("/home/stopspark.sh", ["stop-slaves.sh", "stop-master.sh"]),
    ];

    for (path, steps) in scripts.iter() {
        let mut script = master.remote_file(path, FileMode::Write);
        writeln!(script, "#!/usr/bin/env bash")?;
        writeln!(script, "MASTER={}", master.alias())?;
        for step in steps.iter() {
            writeln!(script, "ssh $MASTER \"(cd {}; ./sbin/{})\"", spark_home, step)?;
        }
        script.close()?;

        master.run(&format!("chmod +x {}", path))?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plugins::test_util::MockCluster;

    #[test]
    fn builds_only_where_missing() {
        let cluster = MockCluster::with(2, |alias, remote| {
            if alias == "node001" {
                remote.with_dir("/opt/Spark")
            } else {
                remote
            }
        });

        SparkInstaller::new(SparkSettings::default(), PoolSettings::default())
            .run(&cluster.context())
            .unwrap();

        let log = &cluster.log;
        let mut built: Vec<_> = log
            .executed("build/mvn")
            .into_iter()
            .map(|(_, alias)| alias)
            .collect();
        built.sort();
        assert_eq!(built, vec!["master", "node002"]);

        let calls = log.calls();
        match &calls[log.executed("build/mvn")[0].0].1 {
            crate::remote::test_util::Call::Execute(cmd) => {
                assert!(cmd.starts_with(
                    "wget -O spark.tgz \
                     http://mirror.metrocast.net/apache/spark/spark-1.3.1/spark-1.3.1.tgz && "
                ));
                assert!(cmd.contains(" && mv spark-1.3.1 /opt/Spark && cd /opt/Spark && "));
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn writes_configuration() {
        let cluster = MockCluster::new(2);
        let settings = SparkSettings {
            pythonpath: "/opt/Skylark/install/lib/python2.7/site-packages".into(),
            ..SparkSettings::default()
        };

        SparkInstaller::new(settings, PoolSettings::default())
            .run(&cluster.context())
            .unwrap();

        let log = &cluster.log;

        let slaves = log.writes("/opt/Spark/conf/slaves");
        assert_eq!(slaves.len(), 3);
        assert!(slaves
            .iter()
            .all(|(_, _, c)| c == "master\nnode001\nnode002\n"));

        let profile = log.writes("/etc/profile.d/spark.sh");
        assert_eq!(profile.len(), 3);
        assert_eq!(
            profile[0].2,
            "export SPARK_HOME=/opt/Spark\nexport PATH=$PATH:$SPARK_HOME/bin\n"
        );

        let env = log.writes("/opt/Spark/conf/spark-env.sh");
        assert_eq!(env.len(), 3);
        assert!(env[0]
            .2
            .contains("export PYTHONPATH=$PYTHONPATH:/opt/Skylark/install/lib/python2.7/site-packages\n"));

        let start = log.writes("/home/startspark.sh");
        assert_eq!(start.len(), 1);
        assert_eq!(start[0].0, "master");
        assert_eq!(
            start[0].2,
            "#!/usr/bin/env bash\n\
             MASTER=master\n\
             ssh $MASTER \"(cd /opt/Spark; ./sbin/start-master.sh)\"\n\
             ssh $MASTER \"(cd /opt/Spark; ./sbin/start-slaves.sh)\"\n"
        );
        assert_eq!(log.writes("/home/stopspark.sh").len(), 1);
    }
}
