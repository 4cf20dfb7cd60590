//! Log setup for the CLI.
//!
//! `LOG_LEVEL` takes `EnvFilter` directives ("debug", "socket=trace,reqwest=warn").
//! Without it, `verbose` picks between the quiet and the debug default.
//! `LOG_FORMAT=json` switches to one JSON object per line.
//! Everything goes to stderr; stdout carries command output.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn,pbl_client=info,challenge=info,socket=info";
const VERBOSE_FILTER: &str = "info,pbl_client=debug,challenge=debug,socket=debug";

pub fn init_tracing(verbose: bool) {
    let fallback = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new(fallback));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(verbose)
        .with_line_number(verbose);

    // The json builder is a different type, so each branch calls init itself.
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filters_parse() {
        for directives in [DEFAULT_FILTER, VERBOSE_FILTER] {
            assert!(EnvFilter::try_new(directives).is_ok(), "{directives}");
        }
    }
}
