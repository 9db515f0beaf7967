use clap::Args;
use miette::{Context, IntoDiagnostic, Result};
use owo_colors::OwoColorize;
use poe_ggpk::{tree::Node, GgpkArchive};
use std::{fs::File, path::PathBuf};

#[derive(Args)]
pub struct LsArgs {
    /// An input GGPK container
    #[arg(short, long, value_name = "FILE")]
    file: PathBuf,

    /// A directory inside the container, the top level when omitted
    #[arg(short, long, value_name = "PATH", default_value = "")]
    path: String,

    /// Recurse into subdirectories
    #[arg(short, long, default_value_t = false)]
    recursive: bool,
}

impl LsArgs {
    pub fn handle(&self) -> Result<()> {
        let f = File::open(&self.file)
            .into_diagnostic()
            .context(format!("path: {}", &self.file.display()))?;
        let ggpk = GgpkArchive::new(f)?;

        let dir = ggpk.resolve_dir(&self.path)?;
        if self.recursive {
            dir.walk(&mut |path, node| print_node(path, node));
        } else {
            for node in dir.children() {
                print_node(node.name(), node);
            }
        }

        for fault in ggpk.faults() {
            eprintln!(
                "{} {} at {:#x}: {}",
                "fault".red().bold(),
                fault.path,
                fault.offset,
                fault.error
            );
        }

        Ok(())
    }
}

fn print_node(path: &str, node: &Node) {
    match node {
        Node::Directory(_) => println!("{:>12} {}/", "-", path.blue().bold()),
        Node::File(file) => println!("{:>12} {}", file.size(), path),
    }
}
