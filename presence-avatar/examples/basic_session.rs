//! Basic streaming session example

use presence_avatar::{
    subscriber, AvatarError, AvatarEvent, AvatarStreamConfig, EventKind, HttpTokenProvider,
    SessionController, SpeakOptions, StreamingApiProvider,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), AvatarError> {
    // Initialize tracing for better error messages
    tracing_subscriber::fmt::init();

    // Defaults overlaid with PRESENCE_* variables
    let config = AvatarStreamConfig::from_env();

    let tokens = Arc::new(HttpTokenProvider::from_config(&config)?);
    let provider = Arc::new(StreamingApiProvider::from_config(&config)?);
    let controller = SessionController::new(config, tokens, provider)?;

    controller.events().register(
        EventKind::StreamReady,
        subscriber(|event| {
            if let AvatarEvent::StreamReady { stream } = event {
                println!("  Stream URL: {}", stream.url);
            }
            Ok(())
        }),
    );
    controller.events().register(
        EventKind::SpeakingStopped,
        subscriber(|_| {
            println!("✓ Avatar finished speaking");
            Ok(())
        }),
    );

    println!("Initializing avatar session...");
    match controller.initialize().await {
        Ok(session) => {
            println!("✓ Session {} ready", session.session_id);
        }
        Err(e) => {
            println!("✗ Failed to initialize: {}", e);
            println!("  (This is expected if the token endpoint is not running)");
            return Ok(());
        }
    }

    if controller
        .speak("Hello! I'm your streaming assistant.", SpeakOptions::default())
        .await
    {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    println!("Stopping session...");
    controller.shutdown().await;
    println!("✓ Done");

    Ok(())
}
