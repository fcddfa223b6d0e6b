use snap_agent::{config::Config, supervisor, telemetry};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    telemetry::init();
    tracing::info!("initializing snapshot agent");

    let config = Config::load()?;
    supervisor::run(config)
}
