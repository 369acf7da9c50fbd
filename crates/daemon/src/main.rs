use std::process::ExitCode;

fn main() -> ExitCode {
    let config = match streamer_daemon::load_config(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(2);
        }
    };

    streamer_observability::init(config.log_format);

    match streamer_daemon::run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "call streamer exiting");
            ExitCode::FAILURE
        }
    }
}
