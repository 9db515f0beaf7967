pub mod ggpk;

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Handle GGPK containers
    Ggpk {
        #[command(subcommand)]
        command: ggpk::GgpkCommands,
    },
}

impl Commands {
    pub fn handle(&self) -> miette::Result<()> {
        match self {
            Commands::Ggpk { command } => command.handle(),
        }
    }
}
