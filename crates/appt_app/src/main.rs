use appt_app::app::{run, AppConfig};

fn main() {
    tracing_subscriber::fmt::init();
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err:#}");
            std::process::exit(1);
        }
    };
    if let Err(err) = run(config) {
        eprintln!("Failed to plan reminders: {err:#}");
        std::process::exit(1);
    }
}
