use clap::Args;
use miette::{miette, Context, IntoDiagnostic, Result};
use poe_ggpk::write::{GgpkWriter, GgpkWriterOptions};
use std::{fs::File, path::PathBuf};
use tracing::info;
use walkdir::WalkDir;

#[derive(Args)]
pub struct PackArgs {
    /// An input directory
    #[arg(short, long, value_name = "DIR")]
    directory: PathBuf,

    /// A target GGPK container
    #[arg(short, long, value_name = "FILE")]
    file: PathBuf,

    /// Container format version, version 4 stores names as UTF-32
    #[arg(long, default_value_t = 3)]
    version: u32,

    /// Allow overwriting the target
    #[arg(long, default_value_t = false)]
    overwrite: bool,
}

impl PackArgs {
    pub fn handle(&self) -> Result<()> {
        info!("creating {}", &self.file.display());

        let entries = WalkDir::new(&self.directory)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .collect::<Vec<_>>();

        if entries.is_empty() {
            return Err(miette!("unable to read {}", self.directory.display()));
        }

        let mut out = if !self.overwrite {
            File::create_new(&self.file)
                .into_diagnostic()
                .context(format!("creating {}", &self.file.display()))?
        } else {
            File::create(&self.file)
                .into_diagnostic()
                .context(format!("creating {}", &self.file.display()))?
        };

        let mut ggpk = GgpkWriter::new(
            &mut out,
            GgpkWriterOptions::builder().version(self.version).build(),
        );

        for entry in entries {
            let name = entry
                .path()
                .strip_prefix(&self.directory)
                .into_diagnostic()?;
            if name.as_os_str().is_empty() {
                continue;
            }
            let name = name
                .to_str()
                .ok_or(miette!("unable to convert {} to a string", name.display()))?;

            if entry.file_type().is_dir() {
                ggpk.add_directory(name)
                    .context(format!("adding directory {}", name))?;
                continue;
            }

            info!("packing {}", name);
            ggpk.start_file(name)
                .context(format!("starting entry for {}", name))?;

            let mut f = File::open(entry.path())
                .into_diagnostic()
                .context(format!("opening {}", entry.path().display()))?;

            std::io::copy(&mut f, &mut ggpk)
                .into_diagnostic()
                .context(format!("copying {}", entry.path().display()))?;
        }

        ggpk.finish().context("finalizing ggpk container")?;

        Ok(())
    }
}
