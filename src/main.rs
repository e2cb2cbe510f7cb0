//! This program installs big-data packages (Hadoop, Spark, Skylark) on a cluster of machines that
//! are already running and reachable over SSH. Which package is chosen by the subcommand.

// Useful common routines
#[macro_use]
mod common;

mod config;
mod error;
mod firewall;
mod node;
mod phase;
mod plugins;
mod pool;
mod remote;
mod template;

use clap::clap_app;

use plugins::{hadoop, skylark, spark};

fn run() -> Result<(), failure::Error> {
    let matches = clap_app! { installer =>
        (about: "Installs and configures a package on every node of a running cluster. The first \
                 node given is the master.")
        (@arg SETTINGS: --settings +takes_value
         "(Optional) A JSON file overriding the default settings of the installers.")
    }
    .subcommand(hadoop::cli_options())
    .subcommand(spark::cli_options())
    .subcommand(skylark::cli_options())
    .setting(clap::AppSettings::SubcommandRequired)
    .setting(clap::AppSettings::DisableVersion)
    .get_matches();

    let settings = config::Settings::load(matches.value_of("SETTINGS"))?;

    match matches.subcommand() {
        ("hadoop", Some(sub_m)) => hadoop::run(sub_m, &settings),
        ("spark", Some(sub_m)) => spark::run(sub_m, &settings),
        ("skylark", Some(sub_m)) => skylark::run(sub_m, &settings),

        _ => {
            unreachable!();
        }
    }
}

fn main() {
    use console::style;

    // Phase progress is logged at `info`.
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    std::env::set_var("RUST_BACKTRACE", "1");

    // If an error occurred, try to print something helpful.
    if let Err(err) = run() {
        const MESSAGE: &str =
r#"== ERROR ==================================================================================
`installer` encountered an error. The log above shows which phase and which node failed. If the
error pertains to SSH, you may be able to get useful information by setting the RUST_LOG=debug
environment variable, which also logs every remote command."#;

        println!("{}", style(MESSAGE).red().bold());

        // Errors from SSH commands
        if err.downcast_ref::<spurs::SshError>().is_some() {
            println!("An error occurred while attempting to run a command over SSH");
        }

        // Print error and backtrace
        println!(
            "`installer` encountered the following error:\n{}\n{}",
            err.as_fail(),
            err.backtrace(),
        );

        std::process::exit(101);
    }
}
