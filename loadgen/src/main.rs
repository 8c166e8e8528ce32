use std::env;
use std::time::Duration;

use publisher::{run_load_test, LoadConfig};

mod publisher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env = env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info");
    env_logger::init_from_env(env);

    let mut args = env::args().skip(1);

    let url = args
        .next()
        .unwrap_or_else(|| "ws://127.0.0.1:8080/ws".to_string());
    let connections = args
        .next()
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(100);
    let messages_per_sec = args
        .next()
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(10);
    let duration_secs = args
        .next()
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(60);

    // Optional payload file; each publish carries this JSON body.
    let payload = match args.next() {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => serde_json::json!({ "data": "soak" }),
    };

    run_load_test(LoadConfig {
        url,
        connections,
        messages_per_sec,
        duration: Duration::from_secs(duration_secs),
        channel: "soak".to_string(),
        payload,
    })
    .await
}
