//! Generates the `simrelay` man pages into the build output directory.
//!
//! One page is rendered for the top-level command and one per subcommand
//! (`simrelay-submit.1`, `simrelay-query.1`, ...), all from the same clap
//! definitions the binary parses with.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

fn render(command: clap::Command, out_dir: &Path, title: &str) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    Man::new(command).title(title).render(&mut buffer)?;
    fs::write(out_dir.join(format!("{title}.1")), buffer)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = env::var_os("OUT_DIR").map(PathBuf::from).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
    })?;

    let command = cli::Cli::command();
    for subcommand in command.get_subcommands() {
        let title = format!("simrelay-{}", subcommand.get_name());
        render(subcommand.clone(), &out_dir, &title)?;
    }
    render(command, &out_dir, "simrelay")?;

    Ok(())
}
