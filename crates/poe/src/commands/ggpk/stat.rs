use clap::Args;
use itertools::Itertools;
use miette::{Context, IntoDiagnostic, Result};
use owo_colors::OwoColorize;
use poe_ggpk::GgpkArchive;
use std::{fs::File, path::PathBuf};

#[derive(Args)]
pub struct StatArgs {
    /// An input GGPK container
    #[arg(short, long, value_name = "FILE")]
    file: PathBuf,
}

impl StatArgs {
    pub fn handle(&self) -> Result<()> {
        let f = File::open(&self.file)
            .into_diagnostic()
            .context(format!("path: {}", &self.file.display()))?;
        let ggpk = GgpkArchive::new(f)?;

        let stats = ggpk.stats();
        let free = ggpk.free_index();

        println!("{}", "container".bold());
        println!("  version:       {}", ggpk.version());
        println!("  size:          {}", ggpk.container_len());
        println!("  records:       {}", stats.records);
        println!("  roots:         {}", stats.roots);

        println!("{}", "contents".bold());
        println!("  directories:   {}", stats.directories);
        println!("  files:         {}", stats.files);
        println!("  payload bytes: {}", stats.payload_bytes);
        println!("  orphaned:      {}", stats.orphaned_bytes);

        println!("{}", "free space".bold());
        println!("  blocks:        {}", free.len());
        println!("  bytes:         {}", free.total_bytes());
        println!("  largest:       {}", free.largest().unwrap_or(0));

        let fragmentation = if ggpk.container_len() > 0 {
            free.total_bytes() as f64 / ggpk.container_len() as f64 * 100.0
        } else {
            0.0
        };
        println!("  fragmentation: {:.1}%", fragmentation);

        if !ggpk.faults().is_empty() {
            println!("{}", "faults".red().bold());
            for fault in ggpk.faults() {
                println!("  {} at {:#x}: {}", fault.path, fault.offset, fault.error);
            }
        }

        if !ggpk.skipped_regions().is_empty() {
            println!("{}", "skipped regions".yellow().bold());
            for region in ggpk.skipped_regions() {
                println!(
                    "  {:#x}+{}: tag [{}]",
                    region.offset,
                    region.length,
                    region.tag.iter().map(|b| format!("{:02X}", b)).join(" ")
                );
            }
        }

        Ok(())
    }
}
