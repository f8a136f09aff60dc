use hook_reconciler_cli::run_cli;

#[tokio::main]
async fn main() {
    if let Err(e) = run_cli().await {
        eprintln!("hook-reconciler: {e}");
        std::process::exit(e.exit_code());
    }
}
