use clap::Args;

#[derive(Args)]
pub struct ChatCommand {
    /// Continue without GPU acceleration
    #[arg(long)]
    pub allow_cpu: bool,

    /// Do not print the model's reasoning while it streams
    #[arg(long)]
    pub hide_thinking: bool,

    /// Print tokens per second after each answer
    #[arg(long)]
    pub show_tps: bool,
}
