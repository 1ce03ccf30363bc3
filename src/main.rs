use cachet::{dispatcher, logging, worker, Args, Config, Result};
use clap::Parser;

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_args(&args)?;
    logging::init(&config.log_level, config.log_json)?;

    // One run-loop per process: workers handle their requests
    // cooperatively on a single thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let result = match args.worker_slot {
        Some(slot) => runtime.block_on(worker::run_process(&config, slot)),
        None => runtime.block_on(dispatcher::run(config)),
    };

    // The console's blocking stdin read cannot be cancelled; don't wait on it.
    runtime.shutdown_background();
    if let Err(e) = &result {
        tracing::error!("{}", e);
    }
    result
}
