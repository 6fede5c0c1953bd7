//! Venv Agent - Python 虚拟环境供应代理
//!
//! Usage:
//! - Normal mode: `venv-agent`
//! - With custom port: `venv-agent --port 19999`
//! - Without persistence: `venv-agent --memory`

use tracing_subscriber::EnvFilter;
use venv_agent::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                i += 2;
            }
            "--memory" => {
                config.in_memory = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("Venv Agent - Python 虚拟环境供应代理");
    println!();
    println!("USAGE:");
    println!("    venv-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>    Override the listening port");
    println!("    --memory         Keep state in memory only");
    println!("    -h, --help       Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    VENV_AGENT_PORT, VENV_AGENT_DATA_DIR, ENV_ROOT_DIR, PYTHON_VERSIONS_ROOT,");
    println!("    JOB_TIMEOUT_SECS, CANCEL_GRACE_SECS, PIP_TIMEOUT_SECS, RUST_LOG");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("venv_agent=info,tower_http=info")),
        )
        .init();

    venv_agent::run(config).await
}
