//! Image-task request injection utility
//!
//! Publishes a request to a running worker's request topic. Sending the same
//! request more than once (`--count`) exercises duplicate-delivery handling:
//! the worker should publish exactly one response.
//!
//! ## Usage
//!
//! ```bash
//! # Text-to-image
//! inject-request --prompt "draw a red fox in the snow"
//!
//! # Edit an upload
//! inject-request --prompt "remove the car" --image uploads/street.png
//!
//! # Replay a captured request three times
//! inject-request --file request.json --count 3
//! ```

use clap::Parser;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "inject-request",
    about = "Publish image-task requests to a running worker"
)]
struct Args {
    /// Request JSON file to send verbatim (overrides --prompt/--image)
    #[arg(long, conflicts_with_all = ["prompt", "image"])]
    file: Option<PathBuf>,

    /// Prompt text
    #[arg(long, default_value = "")]
    prompt: String,

    /// Uploaded image locator (repeatable)
    #[arg(long)]
    image: Vec<String>,

    /// Request id (random if not provided)
    #[arg(long)]
    request_id: Option<String>,

    #[arg(long, default_value = "")]
    chat_summary: String,

    /// Number of times to publish the same request
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Request topic
    #[arg(long, default_value = "ai/image/request")]
    topic: String,

    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    broker_url: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    broker_port: u16,
}

struct RequestInjector {
    client: AsyncClient,
}

impl RequestInjector {
    async fn new(broker_url: &str, broker_port: u16) -> Result<Self, Box<dyn std::error::Error>> {
        let client_id = format!(
            "inject-request-{}",
            SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs()
        );

        let mut mqttoptions = MqttOptions::new(client_id, broker_url, broker_port);
        mqttoptions.set_keep_alive(Duration::from_secs(60));

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        tokio::spawn(async move {
            loop {
                if let Err(e) = eventloop.poll().await {
                    eprintln!("MQTT eventloop error: {e}");
                    break;
                }
            }
        });

        println!("Connecting to MQTT broker {broker_url}:{broker_port}...");
        sleep(Duration::from_millis(1000)).await;

        Ok(Self { client })
    }

    fn build_request(args: &Args) -> Result<Value, Box<dyn std::error::Error>> {
        if let Some(path) = &args.file {
            let request: Value = serde_json::from_slice(&std::fs::read(path)?)?;
            if request.get("requestId").and_then(Value::as_str).is_none() {
                return Err(format!("{} has no string requestId", path.display()).into());
            }
            return Ok(request);
        }

        let request_id = args
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(json!({
            "requestId": request_id,
            "prompt": args.prompt,
            "imagesPath": args.image,
            "chat": [],
            "chatSummary": args.chat_summary,
        }))
    }

    async fn inject(
        &self,
        topic: &str,
        request: &Value,
        count: u32,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let payload = serde_json::to_vec(request)?;

        println!("\n📤 Publishing to {topic}");
        println!("   Request ID: {}", request["requestId"]);
        println!("   Copies: {count}");

        for attempt in 1..=count {
            self.client
                .publish(topic, QoS::AtLeastOnce, false, payload.clone())
                .await?;
            println!("✓ Copy {attempt} published");
        }

        sleep(Duration::from_millis(500)).await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.count == 0 {
        eprintln!("✗ --count must be at least 1");
        std::process::exit(1);
    }

    let request = match RequestInjector::build_request(&args) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("✗ Invalid request: {e}");
            std::process::exit(1);
        }
    };

    let injector = RequestInjector::new(&args.broker_url, args.broker_port).await?;
    if let Err(e) = injector.inject(&args.topic, &request, args.count).await {
        eprintln!("✗ Failed to inject request: {e}");
        std::process::exit(1);
    }

    Ok(())
}
