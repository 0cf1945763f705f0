use clap::Parser;

use redis_pubsub::client::{self, Event, Subscriber};
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
    /// The channel to subscribe to
    #[arg(short, long, default_value = CHANNEL)]
    channel: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt().try_init();
    let args = Args::parse();

    println!("Connecting to {}:{}...", args.host, args.port);
    let mut subscriber = Subscriber::connect(&args.host, args.port).await?;
    println!("Connected successfully!");

    println!("Subscribing to channel '{}'...", args.channel);
    subscriber.subscribe(&args.channel).await?;
    println!("Waiting for messages (Ctrl+C to exit)...");

    let mut count = 0u64;

    loop {
        match subscriber.next_event().await {
            Ok(Event::Message { channel, payload }) => {
                count += 1;
                println!("[Message #{}] From channel '{}':", count, channel);
                println!("             {}", payload);
            }
            Ok(Event::Subscribed {
                channel,
                subscriptions,
            }) => {
                println!(
                    "[Info] Subscribed to '{}' (total subscriptions: {})",
                    channel, subscriptions
                );
            }
            // The server going away is the loop's one normal exit.
            Err(client::Error::ConnectionClosed) => break,
            Err(err) => return Err(err.into()),
        }
    }

    println!("Subscription ended");
    Ok(())
}
