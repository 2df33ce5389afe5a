// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    let config_arg = Arg::new("config")
        .short('c')
        .long("config")
        .value_name("PATH")
        .default_value("/etc/strata/strata.toml")
        .help("Configuration file");
    let root_arg = Arg::new("root")
        .short('r')
        .long("root")
        .value_name("PATH")
        .default_value("/")
        .help("Install root directory");

    Command::new("strata")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Strata Contributors")
        .about("Package manager with atomic transactions and rollback")
        .subcommand_required(false)
        .arg(config_arg)
        .arg(root_arg)
        .subcommand(
            Command::new("install")
                .about("Install packages (name or name@constraint)")
                .arg(
                    Arg::new("targets")
                        .required(true)
                        .num_args(1..)
                        .help("Packages to install"),
                ),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove installed packages")
                .arg(
                    Arg::new("names")
                        .required(true)
                        .num_args(1..)
                        .help("Package names to remove"),
                ),
        )
        .subcommand(
            Command::new("upgrade")
                .about("Upgrade installed packages (all when none given)")
                .arg(Arg::new("names").num_args(0..).help("Package names to upgrade")),
        )
        .subcommand(
            Command::new("search")
                .about("Search repositories for packages")
                .arg(Arg::new("pattern").required(true).help("Search pattern")),
        )
        .subcommand(
            Command::new("show")
                .about("Show a package's manifest (installed or best candidate)")
                .arg(Arg::new("name").required(true).help("Package name")),
        )
        .subcommand(Command::new("refresh").about("Update all repository indexes"))
        .subcommand(Command::new("list-installed").about("List installed packages"))
        .subcommand(
            Command::new("verify")
                .about("Re-checksum installed files against recorded checksums")
                .arg(Arg::new("name").help("Package name to verify (all when omitted)")),
        )
        .subcommand(Command::new("history").about("Show transaction history"))
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "zsh", "fish", "powershell"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("strata.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
