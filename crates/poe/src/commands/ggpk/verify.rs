use clap::Args;
use miette::{miette, Context, IntoDiagnostic, Result};
use owo_colors::OwoColorize;
use poe_ggpk::{
    error::Error,
    read::{GgpkArchiveOptions, Verification},
    tree::Node,
    GgpkArchive,
};
use std::{fs::File, path::PathBuf};

#[derive(Args)]
pub struct VerifyArgs {
    /// An input GGPK container
    #[arg(short, long, value_name = "FILE")]
    file: PathBuf,

    /// A file or directory inside the container, everything when omitted
    #[arg(short, long, value_name = "PATH", default_value = "")]
    path: String,
}

impl VerifyArgs {
    pub fn handle(&self) -> Result<()> {
        let f = File::open(&self.file)
            .into_diagnostic()
            .context(format!("path: {}", &self.file.display()))?;

        // Hashing happens explicitly below, opening should not double it.
        let mut ggpk = GgpkArchive::with_options(
            f,
            GgpkArchiveOptions::builder()
                .verification(Verification::Off)
                .build(),
        )?;

        for fault in ggpk.faults() {
            println!(
                "{} {} at {:#x}: {}",
                "fault".red().bold(),
                fault.path,
                fault.offset,
                fault.error
            );
        }

        let mut files = Vec::new();
        match ggpk.resolve(&self.path)? {
            Node::File(_) => files.push(self.path.clone()),
            Node::Directory(dir) => {
                dir.walk(&mut |path, node| {
                    if node.as_file().is_some() {
                        if self.path.is_empty() {
                            files.push(path.to_owned());
                        } else {
                            files.push(format!("{}/{}", self.path, path));
                        }
                    }
                });
            }
        }

        let mut failed = 0usize;
        for path in &files {
            match ggpk.verify_path(path) {
                Ok(()) => println!("{} {}", "ok".green(), path),
                Err(Error::IntegrityMismatch {
                    expected, actual, ..
                }) => {
                    failed += 1;
                    println!(
                        "{} {}: expected {} found {}",
                        "failed".red().bold(),
                        path,
                        expected,
                        actual
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        if failed > 0 || !ggpk.faults().is_empty() {
            return Err(miette!(
                "{} of {} files failed verification, {} unresolvable subtrees",
                failed,
                files.len(),
                ggpk.faults().len()
            ));
        }

        println!("{} files verified", files.len());
        Ok(())
    }
}
