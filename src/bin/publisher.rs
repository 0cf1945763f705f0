use clap::Parser;
use tokio::time::{sleep, Duration};

use redis_pubsub::client::Publisher;
use redis_pubsub::Error;

const HOST: &str = "127.0.0.1";
const PORT: u16 = 6379;
const CHANNEL: &str = "mychannel";

#[derive(Parser, Debug)]
struct Args {
    /// The host to connect to
    #[arg(long, env = "REDIS_HOST", default_value = HOST)]
    host: String,
    /// The port to connect to
    #[arg(short, long, env = "REDIS_PORT", default_value_t = PORT)]
    port: u16,
    /// The channel to publish on
    #[arg(short, long, default_value = CHANNEL)]
    channel: String,
    /// How many messages to publish
    #[arg(short = 'n', long, default_value_t = 5)]
    count: u32,
    /// Seconds to wait between messages
    #[arg(short, long, default_value_t = 2)]
    interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt().try_init();
    let args = Args::parse();

    println!("Connecting to {}:{}...", args.host, args.port);
    let mut publisher = Publisher::connect(&args.host, args.port).await?;
    println!("Connected successfully!");

    println!("Publishing messages...");

    for i in 1..=args.count {
        let message = format!("Hello from publisher - Message {}", i);
        let subscribers = publisher.publish(&args.channel, &message).await?;

        println!("[Published] Channel: {} | Message: {}", args.channel, message);
        println!("            Subscribers received: {}", subscribers);

        if i < args.count {
            sleep(Duration::from_secs(args.interval)).await;
        }
    }

    println!("All messages published!");
    Ok(())
}
