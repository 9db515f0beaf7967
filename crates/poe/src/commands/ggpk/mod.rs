pub mod extract;
pub mod ls;
pub mod pack;
pub mod stat;
pub mod verify;

#[derive(clap::Subcommand)]
pub enum GgpkCommands {
    /// List the contents of a container
    Ls(ls::LsArgs),
    /// Extract a file or a subtree into a directory
    Extract(extract::ExtractArgs),
    /// Pack a directory into a new container
    Pack(pack::PackArgs),
    /// Check payloads against their stored digests
    Verify(verify::VerifyArgs),
    /// Print container statistics
    Stat(stat::StatArgs),
}

impl GgpkCommands {
    pub fn handle(&self) -> miette::Result<()> {
        match self {
            GgpkCommands::Ls(ls) => ls.handle(),
            GgpkCommands::Extract(extract) => extract.handle(),
            GgpkCommands::Pack(pack) => pack.handle(),
            GgpkCommands::Verify(verify) => verify.handle(),
            GgpkCommands::Stat(stat) => stat.handle(),
        }
    }
}
