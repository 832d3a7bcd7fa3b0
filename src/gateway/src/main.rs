use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Parser;
use nix::sys::signal;

use faas_common::{log, logging, FuncConfig};
use gateway::{Config, Server};
use ipc::ShmProvider;

#[derive(Debug, Clone, Parser)]
#[command(name = "FaaS Gateway")]
struct Opts {
    /// Gateway config path
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,
    #[arg(long)]
    no_ansi: bool,
}

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(sig: i32) {
    assert_eq!(sig, signal::SIGINT as i32);
    TERMINATE.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let config = Config::from_path(&opts.config)?;

    // FAAS_LOG overrides log_level
    let _guard = logging::init_log(&config.log_level, config.log_file.as_deref(), !opts.no_ansi);

    let func_config = FuncConfig::from_path(&config.gateway.func_config_file)?;
    log::info!(
        "Loaded {} functions from {}",
        func_config.entries().len(),
        config.gateway.func_config_file.display()
    );

    // workers create their regions under this root
    let shm = ShmProvider::new(&config.gateway.root_path_for_ipc)?;
    log::info!("IPC root is {}", shm.root().display());

    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(handle_sigint),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe { signal::sigaction(signal::SIGINT, &sig_action) }?;

    let mut server = Server::new(&config, func_config)?;
    server.mainloop(&TERMINATE)
}
