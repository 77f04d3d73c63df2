use clap::Args;

#[derive(Args)]
pub struct CheckCommand {
    /// Print the raw status events as JSON lines
    #[arg(long)]
    pub json: bool,
}
