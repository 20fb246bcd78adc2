use qcollab::{cli, config, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());

    let cfg = match cli::load_config(&cli) {
        Ok(cfg) => cfg,
        Err(err) if cli.tolerates_config_errors() => {
            eprintln!("config load failed, using defaults: {err}");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };

    let _telemetry_guard =
        telemetry::init(telemetry::TelemetryConfig::new(cli.verbose, cfg.logging.clone()));

    if let Err(e) = cli::run(cli, cfg) {
        tracing::error!("error: {}", e);
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
