use clap::Args;
use miette::{Context, IntoDiagnostic, Result};
use poe_ggpk::{tree::Node, GgpkArchive};
use std::{fs::File, path::PathBuf};
use tracing::info;

#[derive(Args)]
pub struct ExtractArgs {
    /// An input GGPK container
    #[arg(short, long, value_name = "FILE")]
    file: PathBuf,

    /// A file or directory inside the container, everything when omitted
    #[arg(short, long, value_name = "PATH", default_value = "")]
    path: String,

    /// A target directory
    #[arg(short, long, value_name = "DIR")]
    directory: PathBuf,

    /// Allow overwriting the target
    #[arg(long, default_value_t = false)]
    overwrite: bool,
}

impl ExtractArgs {
    pub fn handle(&self) -> Result<()> {
        let f = File::open(&self.file)
            .into_diagnostic()
            .context(format!("path: {}", &self.file.display()))?;
        let mut ggpk = GgpkArchive::new(f)?;

        // Collect the paths first, reading payloads needs the archive
        // mutably.
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        match ggpk.resolve(&self.path)? {
            Node::File(_) => files.push(self.path.clone()),
            Node::Directory(dir) => {
                dir.walk(&mut |path, node| {
                    let path = if self.path.is_empty() {
                        path.to_owned()
                    } else {
                        format!("{}/{}", self.path, path)
                    };
                    match node {
                        Node::Directory(_) => dirs.push(path),
                        Node::File(_) => files.push(path),
                    }
                });
            }
        }

        for path in &dirs {
            std::fs::create_dir_all(self.directory.join(path)).into_diagnostic()?;
        }

        for path in &files {
            let mut f_ggpk = ggpk.by_path(path)?;

            let p = self.directory.join(path);
            info!("writing {}", p.display());

            let _ = std::fs::create_dir_all(p.parent().unwrap());
            let mut out = if !self.overwrite {
                File::create_new(&p)
                    .into_diagnostic()
                    .context(format!("creating {}", &p.display()))?
            } else {
                File::create(&p)
                    .into_diagnostic()
                    .context(format!("creating {}", &p.display()))?
            };

            std::io::copy(&mut f_ggpk, &mut out).into_diagnostic()?;
        }

        Ok(())
    }
}
