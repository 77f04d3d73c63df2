use clap::Args;

#[derive(Args)]
pub struct ServeCommand {
    /// Continue without GPU acceleration instead of failing `check` and `load`
    #[arg(long)]
    pub allow_cpu: bool,

    /// Send `check` and `load` before reading the first input line
    #[arg(long)]
    pub preload: bool,
}
