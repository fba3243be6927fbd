use tracing_subscriber::EnvFilter;

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the framework's own targets
/// (`server`, `listener`, `http`, `session`, `registry`, `router`,
/// `client`, `executor`) log at info and everything else stays quiet.
/// Callable more than once; only the first call installs a subscriber, so
/// library consumers and tests can both use it freely.
pub fn init_tracing() {
    init_tracing_with(
        "warn,server=info,listener=info,http=info,session=info,registry=info,router=info,client=info,executor=info",
    );
}

/// Install the subscriber with an explicit fallback filter for when
/// `RUST_LOG` is not set.
pub fn init_tracing_with(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init();
}
