use anyhow::Result;
use clap::{Parser, Subcommand};
use legato::cli;

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Simulate(args) => args.run(),
        Command::Transform(args) => args.run(),
    }
}

#[derive(Parser)]
#[command(name = "legato", about = "Motion planning tooling for Legato")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan and step a job against a simulated machine.
    Simulate(cli::simulate::SimulateArgs),
    /// Map a point between user and machine coordinates.
    Transform(cli::transform::TransformArgs),
}
