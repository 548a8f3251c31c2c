use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::error;

use flatvm::vmm::kvm::layout;
use flatvm::{Machine, MachineConfig};

/// Run a flat binary inside a KVM micro-VM until it halts.
#[derive(Parser, Debug)]
#[command(name = "flatvm", version, about)]
struct Cli {
    /// Path to the flat guest binary, loaded at guest-physical address 0
    #[arg(long, default_value = "test.bin")]
    image: PathBuf,

    /// Guest memory size in bytes
    #[arg(long, default_value_t = layout::DEFAULT_MEMORY_SIZE)]
    memory: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        error!("{}", e);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> flatvm::Result<()> {
    let config = MachineConfig::new()
        .memory_size(cli.memory)
        .image(&cli.image);

    let mut machine = Machine::new(&config)?;
    machine.load_image(&config.image)?;
    machine.run()
}
