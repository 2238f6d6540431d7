use iridium::prelude::*;
use iridium::{cert, config, dispatch, host, logging, seal, RunConfig};

fn print_help() {
    println!("Usage: iridium [options]");
    println!();
    println!("Options:");
    println!("  --version, -v    Show version information");
    println!("  --help, -h       Show this help message");
    println!("  validate         Validate the configuration file");
    println!("  cert generate <host>   Generate a self-signed TLS certificate for the specified host");
    println!("  cert obtain <host>     Obtain a TLS certificate from Let's Encrypt for the specified host");
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env().init();

    let args: Vec<String> = std::env::args().collect();
    if let Some(arg) = args.get(1) {
        match arg.as_str() {
            "--version" | "-v" => {
                println!("{SERVER_NAME} version {VERSION}");
            }
            "--help" | "-h" => print_help(),
            "validate" => {
                println!("Validating configuration...");
                let path = config::config_path(&config::data_dir());
                if !path.exists() {
                    println!(
                        "Configuration file does not exist. Did you run {SERVER_NAME} at least once?"
                    );
                    std::process::exit(1);
                }
                println!("Configuration file found at {}", path.display());
            }
            "cert" => {
                let Some(action) = args.get(2) else {
                    println!(
                        "Please specify 'generate' or 'obtain'. Example: iridium cert generate example.com"
                    );
                    return;
                };
                let Some(host) = args.get(3) else {
                    println!("Please specify a domain. Example: iridium cert {action} example.com");
                    return;
                };
                let result = match action.as_str() {
                    "generate" => cert::generate(host),
                    "obtain" => {
                        println!("Obtaining TLS certificate using Let's Encrypt...");
                        cert::obtain(host).await
                    }
                    other => {
                        println!("Unknown cert action: {other}");
                        return;
                    }
                };
                if let Err(err) = result {
                    println!("Failed to {action} TLS certificate: {err}");
                    std::process::exit(1);
                }
            }
            other => {
                println!("Unknown argument: {other}");
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(err) = serve().await {
        eprintln!("Error occurred: {err}");
        std::process::exit(1);
    }
}

async fn serve() -> io::Result<()> {
    let data_dir = config::data_dir();
    let config = config::load(&data_dir)?;
    let hosts = host::load(&data_dir)?;
    println!("Loaded {} host(s)", hosts.len());

    let logs = logging::Logs::open(&data_dir, &config.logging)?;
    let key = seal::Key::resolve(config.waf.encryption_key.as_deref());

    let ctx = Arc::new(dispatch::Context {
        config,
        hosts,
        cache: EdgeCache::new(),
        key,
        logs,
    });
    iridium::run(ctx, RunConfig::new()).await
}
