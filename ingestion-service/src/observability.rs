use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "ingestion_service=info";

pub fn init_tracing() {
    let filter = match DEFAULT_DIRECTIVE.parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };

    // A second call (tests, operator bins sharing a process) is a no-op.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
