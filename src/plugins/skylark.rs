//! Installs libskylark and the numerical stack it builds on (BLAS/LAPACK, Boost, Elemental,
//! CombBLAS, KDT, FFTW, Random123, Spiral WHT) on every node.
//!
//! Assumes MPI (e.g. mpich2) is already installed on the nodes.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use clap::clap_app;

use log::{debug, info};

use serde::{Deserialize, Serialize};

use crate::common::{cluster_args, follow_instructions, ClusterArgs};
use crate::config::{PoolSettings, Settings};
use crate::node::Node;
use crate::phase;
use crate::plugins::{Plugin, RunContext};
use crate::remote::FileMode;

const COMBBLAS_PATCH: &str = "combblas.patch";
const FIND_FFTW_PATCH: &str = "find_fftw.patch";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkylarkSettings {
    /// Environment script written last before libskylark is built. Nodes that have it are
    /// considered done and are skipped.
    pub settings_script: String,

    /// Parallelism of `make`.
    pub nproc: usize,

    /// Installed in this order.
    pub apt_packages: Vec<String>,
    pub easy_install_packages: Vec<String>,

    /// Local directory holding `combblas.patch` and `find_fftw.patch`.
    pub patch_dir: String,

    pub boost_source: String,
    pub boost_directory: String,
    pub elemental_repo: String,
    pub elemental_commit: String,
    pub metis_repo: String,
    pub combblas_source: String,
    pub kdt_source: String,
    pub kdt_directory: String,
    pub fftw_source: String,
    pub fftw_directory: String,
    pub random123_source: String,
    pub random123_directory: String,
    pub spiral_source: String,
    pub spiral_directory: String,
    pub skylark_repo: String,
    pub skylark_branch: String,

    /// Variables exported by `settings_script`, in order. Values are written as is, so they may
    /// refer to the remote environment (e.g. `$PYTHONPATH`).
    pub env: Vec<(String, String)>,
}

impl Default for SkylarkSettings {
    fn default() -> Self {
        let strings =
            |list: &[&str]| -> Vec<String> { list.iter().map(|s| s.to_string()).collect() };

        let install_dir = "/opt/Skylark/install";
        let site_packages = format!("{}/lib/python2.7/site-packages", install_dir);

        SkylarkSettings {
            settings_script: "/etc/profile.d/skylarksettings.sh".into(),
            nproc: 6,
            apt_packages: strings(&[
                "gfortran",
                "git",
                "cmake",
                "libblas-dev",
                "libblas3gf",
                "liblapack-dev",
                "liblapack3gf",
                "libcr-dev",
                "cython",
                "python-setuptools",
                "python-matplotlib",
                "ipython",
                "ipython-notebook",
                "python-pandas",
                "python-sympy",
                "python-nose",
                "swig",
                "swig-examples",
                "swig2.0-examples",
                "libhdf5-serial-dev",
                "doxygen",
                "graphviz",
                "python-sphinx",
                "dvipng",
                "libfftw3-dev",
                "libfftw3-mpi-dev",
                "unzip",
                "subversion",
                "maven",
            ]),
            easy_install_packages: strings(&["mpi4py", "h5py"]),
            patch_dir: "patches".into(),
            boost_source:
                "http://sourceforge.net/projects/boost/files/boost/1.53.0/boost_1_53_0.tar.gz"
                    .into(),
            boost_directory: "boost_1_53_0".into(),
            elemental_repo: "https://github.com/elemental/Elemental.git".into(),
            elemental_commit: "4a16736e44b24ced2d0dd9d3f688ce2d149611ba".into(),
            metis_repo: "https://github.com/poulson/metis.git".into(),
            combblas_source: "http://gauss.cs.ucsb.edu/~aydin/CombBLAS_FILES/CombBLAS_beta_14_0.tgz"
                .into(),
            kdt_source: "http://sourceforge.net/projects/kdt/files/kdt-0.3.tar.gz".into(),
            kdt_directory: "kdt-0.3".into(),
            fftw_source: "http://www.fftw.org/fftw-3.3.3.tar.gz".into(),
            fftw_directory: "fftw-3.3.3".into(),
            random123_source:
                "http://www.thesalmons.org/john/random123/releases/1.08/Random123-1.08.tar.gz"
                    .into(),
            random123_directory: "Random123-1.08".into(),
            spiral_source: "http://www.ece.cmu.edu/~spiral/software/spiral-wht-1.8.tgz".into(),
            spiral_directory: "spiral-wht-1.8".into(),
            skylark_repo: "https://github.com/xdata-skylark/libskylark.git".into(),
            skylark_branch: "development".into(),
            env: vec![
                ("JAVA_HOME".into(), "/usr/lib/jvm/java-7-openjdk-amd64/".into()),
                ("LIBHDFS_ROOT".into(), "/usr/local/hadoop".into()),
                ("SKYLARK_SRC_DIR".into(), "/opt/Skylark/libskylark".into()),
                ("SKYLARK_BUILD_DIR".into(), "/opt/Skylark/build".into()),
                ("SKYLARK_INSTALL_DIR".into(), install_dir.into()),
                ("PYTHON_SITE_PACKAGES".into(), install_dir.into()),
                ("PYTHONPATH".into(), format!("{}:$PYTHONPATH", site_packages)),
                (
                    "LD_LIBRARY_PATH".into(),
                    format!(
                        "/usr/local/hadoop/lib/native:{}/lib:/usr/local/lib:\
                         /usr/lib/x86_64-linux-gnu:$LD_LIBRARY_PATH",
                        install_dir
                    ),
                ),
            ],
        }
    }
}

pub fn cli_options() -> clap::App<'static, 'static> {
    let app = clap_app! { skylark =>
        (about: "Builds libskylark and its dependencies on every node. Requires MPI.")
        (@arg PATCH_DIR: --patch_dir +takes_value
         "Local directory with combblas.patch and find_fftw.patch")
    };

    cluster_args(app)
}

pub fn run(sub_m: &clap::ArgMatches<'_>, settings: &Settings) -> Result<(), failure::Error> {
    let cluster = ClusterArgs::connect(sub_m)?;

    let mut skylark = settings.skylark.clone();
    if let Some(patch_dir) = sub_m.value_of("PATCH_DIR") {
        skylark.patch_dir = patch_dir.into();
    }

    let installer = SkylarkInstaller::new(skylark, settings.pool.clone());
    info!("Running the {} installer", installer.name());
    installer.run(&cluster.context())
}

pub struct SkylarkInstaller {
    settings: Arc<SkylarkSettings>,
    pool: PoolSettings,
}

impl SkylarkInstaller {
    pub fn new(settings: SkylarkSettings, pool: PoolSettings) -> Self {
        SkylarkInstaller {
            settings: Arc::new(settings),
            pool,
        }
    }
}

impl Plugin for SkylarkInstaller {
    fn name(&self) -> &'static str {
        "skylark"
    }

    fn run(&self, ctx: &RunContext<'_>) -> Result<(), failure::Error> {
        ctx.log_start("Skylark");

        let mut pool = self.pool.build();
        let settings = Arc::clone(&self.settings);

        phase::run(&mut pool, "Installing Skylark", ctx.nodes, move |node| {
            Steps { node, s: &settings }.install()
        })
    }
}

/// The per-node install sequence.
struct Steps<'a> {
    node: &'a Node,
    s: &'a SkylarkSettings,
}

impl Steps<'_> {
    fn install(&self) -> Result<(), failure::Error> {
        if self.node.path_exists(&self.s.settings_script)? {
            debug!("Skylark is already installed on {}", self.node.alias());
            return Ok(());
        }

        self.apt_packages()?;
        self.fix_hdf5_serial()?;
        self.easy_install_packages()?;
        self.openblas()?;
        self.boost()?;
        self.elemental()?;
        self.combblas()?;
        self.kdt()?;
        self.fftw()?;
        self.random123()?;
        self.spiral()?;
        self.settings_script()?;
        self.skylark()
    }

    fn log(&self, what: &str) {
        info!("{}: {}", self.node.alias(), what);
    }

    fn follow(&self, instructions: &[String]) -> Result<(), failure::Error> {
        follow_instructions(self.node, instructions, ";")
    }

    fn patch(&self, name: &str) -> std::path::PathBuf {
        Path::new(&self.s.patch_dir).join(name)
    }

    fn apt_packages(&self) -> Result<(), failure::Error> {
        self.log("Installing apt packages");
        for pkg in self.s.apt_packages.iter() {
            debug!("{}: ...{}", self.node.alias(), pkg);
            self.node.apt_command(&format!("install {}", pkg))?;
        }

        // The builds below need the disk space.
        self.node.apt_command("clean")
    }

    /// libhdf5-serial-dev installs into a directory h5py does not look in.
    fn fix_hdf5_serial(&self) -> Result<(), failure::Error> {
        const AMD64_DIR: &str = "/usr/lib/x86_64-linux-gnu/hdf5/serial";
        const I386_DIR: &str = "/usr/lib/i386-linux-gnu/hdf5/serial";

        self.follow(&[
            "ln -s /usr/include/hdf5/serial/* /usr/include".into(),
            format!(
                "if [ -d {0} ]; then ln -s {0}/* /usr/lib; else ln -s {1}/* /usr/lib; fi",
                AMD64_DIR, I386_DIR
            ),
        ])
    }

    fn easy_install_packages(&self) -> Result<(), failure::Error> {
        self.log("Installing easy_install packages");
        for pkg in self.s.easy_install_packages.iter() {
            self.node.run(&format!("easy_install {}", pkg))?;
        }
        Ok(())
    }

    /// Building OpenBLAS from source fails to detect the CPU on EC2.
    fn openblas(&self) -> Result<(), failure::Error> {
        self.log("Installing OpenBLAS");
        self.node.apt_command("install libopenblas-dev")
    }

    fn boost(&self) -> Result<(), failure::Error> {
        self.log("Installing Boost");
        let s = self.s;
        self.follow(&[
            format!("wget -O boost.tgz {}", s.boost_source),
            "tar xvfz boost.tgz".into(),
            format!("cd {}", s.boost_directory),
            "./bootstrap.sh --with-libraries=mpi,python,random,serialization,program_options,\
             system,filesystem"
                .into(),
            "echo \"using mpi ;\" >> project-config.jam".into(),
            format!("./b2 -j {} link=static,shared", s.nproc),
            "./b2 install".into(),
            "cd ..".into(),
            format!("rm -rf boost.tgz {}", s.boost_directory),
        ])
    }

    fn elemental(&self) -> Result<(), failure::Error> {
        self.log("Installing Elemental");
        let s = self.s;
        self.follow(&[
            format!("git clone {} Elemental", s.elemental_repo),
            "cd Elemental".into(),
            format!("git checkout {}", s.elemental_commit),
            format!("git clone {} external/metis", s.metis_repo),
            "mkdir build".into(),
            "cd build".into(),
            "cmake -DEL_USE_64BIT_INTS=ON -DCMAKE_BUILD_TYPE=Release \
             -DMATH_LIBS=\"-L/usr/lib:/usr/lib/lapack -llapack -lopenblas -lm\" .."
                .into(),
            format!("make -j {}", s.nproc),
            "make install".into(),
            "cd ../..".into(),
            "rm -r Elemental".into(),
        ])
    }

    fn combblas(&self) -> Result<(), failure::Error> {
        self.log("Installing CombBLAS");
        let s = self.s;
        self.follow(&[
            format!("wget -O combblas.tgz {}", s.combblas_source),
            "tar xvfz combblas.tgz".into(),
            "rm combblas.tgz".into(),
        ])?;

        self.node
            .put(self.patch(COMBBLAS_PATCH), &dir!("CombBLAS", COMBBLAS_PATCH))?;

        let include = "/usr/local/include/CombBLAS";
        self.follow(&[
            "cd CombBLAS".into(),
            format!(
                "yes | git apply --ignore-space-change --ignore-whitespace {}",
                COMBBLAS_PATCH
            ),
            format!("rm {}", COMBBLAS_PATCH),
            "cmake .".into(),
            format!("make -j {}", s.nproc),
            "cp *.so /usr/local/lib".into(),
            format!("mkdir {}", include),
            format!("cp *.h {}", include),
            format!("cp *.cpp {}", include),
            format!("cp -R SequenceHeaps {}", include),
            format!("cp -R psort-1.0 {}", include),
            format!("cp -R graph500-1.2 {}", include),
            "cd ..".into(),
            "rm -r CombBLAS".into(),
        ])
    }

    fn kdt(&self) -> Result<(), failure::Error> {
        self.log("Installing KDT");
        let s = self.s;
        self.follow(&[
            format!("wget -O kdt.tgz {}", s.kdt_source),
            "tar xvfz kdt.tgz".into(),
            format!("cd {}", s.kdt_directory),
            "export CC=mpicxx".into(),
            "export CXX=mpicxx".into(),
            "python ./setup.py build".into(),
            "python ./setup.py install".into(),
            "cd ..".into(),
            format!("rm -rf kdt.tgz {}", s.kdt_directory),
        ])
    }

    fn fftw(&self) -> Result<(), failure::Error> {
        self.log("Installing FFTW");
        let s = self.s;
        self.follow(&[
            format!("wget -O fftw.tgz {}", s.fftw_source),
            "tar xvfz fftw.tgz".into(),
            format!("cd {}", s.fftw_directory),
            "./configure --enable-shared".into(),
            format!("make -j {}", s.nproc),
            "make install".into(),
            "cd ..".into(),
            format!("rm -rf fftw.tgz {}", s.fftw_directory),
        ])
    }

    /// Random123 is headers only.
    fn random123(&self) -> Result<(), failure::Error> {
        self.log("Installing Random123");
        let s = self.s;
        self.follow(&[
            format!("wget -O random123.tgz {}", s.random123_source),
            "tar xvfz random123.tgz".into(),
            format!(
                "cp -r {} /usr/local/include",
                dir!(&s.random123_directory, "include/Random123")
            ),
            format!("rm -rf random123.tgz {}", s.random123_directory),
        ])
    }

    fn spiral(&self) -> Result<(), failure::Error> {
        self.log("Installing Spiral");
        let s = self.s;
        self.follow(&[
            format!("wget -O spiral.tgz {}", s.spiral_source),
            "tar xzvf spiral.tgz".into(),
            format!("cd {}", s.spiral_directory),
            "./configure CFLAGS=\"-fPIC -fopenmp\" --enable-RAM=16000 --enable-DDL \
             --enable-IL --enable-PARA=8"
                .into(),
            format!("make -j {}", s.nproc),
            "make install".into(),
            "cd ..".into(),
            format!("rm -r spiral.tgz {}", s.spiral_directory),
        ])
    }

    /// Write the environment script and source it from the login user's `.bashrc`.
    fn settings_script(&self) -> Result<(), failure::Error> {
        self.log("Writing Skylark environment");

        let mut script = self.node.remote_file(&self.s.settings_script, FileMode::Write);
        for (var, value) in self.s.env.iter() {
            writeln!(script, "{}={}", var, value)?;
            writeln!(script, "export {}", var)?;
        }
        script.close()?;

        let mut bashrc = self.node.remote_file(".bashrc", FileMode::Append);
        writeln!(bashrc, "source {}", self.s.settings_script)?;
        bashrc.close()
    }

    fn skylark(&self) -> Result<(), failure::Error> {
        self.log("Installing Skylark");
        let s = self.s;

        let uploaded = dir!("/home", FIND_FFTW_PATCH);
        self.node.put(self.patch(FIND_FFTW_PATCH), &uploaded)?;

        self.follow(&[
            format!("source {}", s.settings_script),
            "mkdir -p $SKYLARK_BUILD_DIR".into(),
            "mkdir -p $SKYLARK_INSTALL_DIR".into(),
            format!("yes | git clone {} $SKYLARK_SRC_DIR", s.skylark_repo),
            "cd $SKYLARK_SRC_DIR".into(),
            format!("git checkout {}", s.skylark_branch),
            format!("mv {} .", uploaded),
            format!(
                "yes | git apply --ignore-space-change --ignore-whitespace {}",
                FIND_FFTW_PATCH
            ),
            format!("rm {}", FIND_FFTW_PATCH),
            "cd $SKYLARK_BUILD_DIR".into(),
            "CC=mpicc CXX=mpicxx cmake -DCMAKE_INSTALL_PREFIX=$SKYLARK_INSTALL_DIR \
             -DUSE_COMBBLAS=ON $SKYLARK_SRC_DIR"
                .into(),
            format!("make -j {}", s.nproc),
            "make install".into(),
            "make doc".into(),
        ])
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;
    use crate::error::InstallError;
    use crate::plugins::test_util::MockCluster;

    /// A local patch directory with both patches, removed on drop.
    struct PatchDir(PathBuf);

    impl PatchDir {
        fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("{}-{}", name, std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(COMBBLAS_PATCH), "--- a/CombBLAS.h\n").unwrap();
            std::fs::write(dir.join(FIND_FFTW_PATCH), "--- a/FindFFTW.cmake\n").unwrap();
            PatchDir(dir)
        }

        fn settings(&self) -> SkylarkSettings {
            SkylarkSettings {
                patch_dir: self.0.to_str().unwrap().into(),
                ..SkylarkSettings::default()
            }
        }
    }

    impl Drop for PatchDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn first(log: &crate::remote::test_util::CallLog, alias: &str, needle: &str) -> usize {
        log.executed(needle)
            .into_iter()
            .find(|(_, a)| a == alias)
            .map(|(i, _)| i)
            .unwrap_or_else(|| panic!("{} never ran {:?}", alias, needle))
    }

    #[test]
    fn skips_installed_nodes() {
        let patches = PatchDir::new("skylark-skip");
        let cluster = MockCluster::with(2, |alias, remote| {
            if alias == "node001" {
                remote.with_file("/etc/profile.d/skylarksettings.sh", "")
            } else {
                remote
            }
        });

        SkylarkInstaller::new(patches.settings(), PoolSettings::default())
            .run(&cluster.context())
            .unwrap();

        let log = &cluster.log;
        assert!(log.calls().iter().all(|(alias, _)| alias != "node001"));
        assert_eq!(log.executed("make doc").len(), 2);
        assert_eq!(log.writes("CombBLAS/combblas.patch").len(), 2);
    }

    #[test]
    fn install_sequence() {
        let patches = PatchDir::new("skylark-sequence");
        let cluster = MockCluster::new(0);

        SkylarkInstaller::new(patches.settings(), PoolSettings::default())
            .run(&cluster.context())
            .unwrap();

        let log = &cluster.log;
        let order = [
            "install gfortran",
            "install maven",
            "apt-get -o Dpkg::Options::=\"--force-confnew\" -y --force-yes clean",
            "hdf5/serial",
            "easy_install mpi4py",
            "install libopenblas-dev",
            "boost_1_53_0",
            "Elemental",
            "combblas.tgz",
            "git apply --ignore-space-change --ignore-whitespace combblas.patch",
            "kdt.tgz",
            "fftw.tgz",
            "Random123-1.08/include/Random123",
            "spiral.tgz",
            "make doc",
        ];
        let positions: Vec<_> = order.iter().map(|n| first(log, "master", n)).collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);

        let script = log.writes("/etc/profile.d/skylarksettings.sh");
        assert_eq!(script.len(), 1);
        assert!(script[0]
            .2
            .starts_with("JAVA_HOME=/usr/lib/jvm/java-7-openjdk-amd64/\nexport JAVA_HOME\n"));
        assert!(script[0].2.contains(
            "PYTHONPATH=/opt/Skylark/install/lib/python2.7/site-packages:$PYTHONPATH\n"
        ));
        assert!(script[0].2.ends_with("export LD_LIBRARY_PATH\n"));
        assert_eq!(
            log.writes(".bashrc")[0].2,
            "source /etc/profile.d/skylarksettings.sh\n"
        );

        let uploaded = log.writes("/home/find_fftw.patch");
        assert_eq!(uploaded[0].2, "--- a/FindFFTW.cmake\n");

        // Instructions of a step share one shell.
        let boost = &log.executed("boost_1_53_0")[0];
        assert!(log.executed("cd boost_1_53_0;./bootstrap.sh").contains(boost));
    }

    #[test]
    fn missing_patch() {
        let cluster = MockCluster::new(1);
        let settings = SkylarkSettings {
            patch_dir: "/nonexistent/patches".into(),
            ..SkylarkSettings::default()
        };

        let err = SkylarkInstaller::new(settings, PoolSettings::default())
            .run(&cluster.context())
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<InstallError>(),
            Some(InstallError::MissingResource { .. })
        ));
        assert!(cluster.log.executed("kdt.tgz").is_empty());
        assert!(cluster.log.writes("skylarksettings.sh").is_empty());
    }
}
