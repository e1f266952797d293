//! Integration tests.

use camino::Utf8PathBuf;
use clap::Parser;

mod loopback;

#[derive(Debug, Parser)]
#[clap(name = "configdrive-integration-tests", version, rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Tests which need root: they attach a file as a loop device and
    /// partition it.
    RunPrivileged {
        /// Path to the configdrive-to-disk binary under test
        #[clap(long, default_value = "/usr/bin/configdrive-to-disk")]
        tool: Utf8PathBuf,

        #[clap(flatten)]
        testargs: libtest_mimic::Arguments,
    },
}

fn main() {
    let opt = Opt::parse();
    let r = match opt {
        Opt::RunPrivileged { tool, testargs } => loopback::run(&tool, testargs),
    };
    if let Err(e) = r {
        eprintln!("error: {e:?}");
        std::process::exit(1);
    }
}
