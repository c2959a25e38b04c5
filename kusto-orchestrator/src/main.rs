use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = kusto_orchestrator::cli::Cli::parse();
    let code = kusto_orchestrator::run(cli).await;
    log::logger().flush();
    std::process::exit(code);
}
