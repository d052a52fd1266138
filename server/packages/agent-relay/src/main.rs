fn main() {
    if let Err(err) = agent_relay::cli::run_agent_relay() {
        match err.error_type() {
            Some(kind) => tracing::error!(
                error_type = kind.as_urn(),
                title = kind.title(),
                error = %err,
                "agent-relay failed"
            ),
            None => tracing::error!(error = %err, "agent-relay failed"),
        }
        std::process::exit(1);
    }
}
