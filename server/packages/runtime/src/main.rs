fn main() {
    if let Err(err) = mcpadre_runtime::cli::run_mcpadre() {
        tracing::error!(error = %err, "mcpadre-run failed");
        std::process::exit(1);
    }
}
