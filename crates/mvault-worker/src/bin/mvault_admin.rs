use mvault_queue::RedisJobQueue;
use mvault_worker::admin::USAGE;
use mvault_worker::AdminCommand;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;
    dotenvy::dotenv().ok();

    let command = match AdminCommand::parse(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    let queue = RedisJobQueue::from_env()?;
    queue.init().await?;
    let options = queue.config().default_options;

    let output = command.run(&queue, options).await?;
    println!("{}", output);
    Ok(())
}
