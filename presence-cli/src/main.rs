// Presence command line interface
// Session diagnostics and still-image keying for streaming avatars

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use presence_avatar::{
    remove_backdrop, AvatarEvent, AvatarStreamConfig, HttpTokenProvider, SessionController,
    SpeakOptions, StreamingApiProvider, TaskType, TokenSource, VoiceEmotion,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "presence")]
#[command(about = "Streaming avatar session tools", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON, TOML or YAML)
    #[arg(long, short, global = true)]
    config: Option<String>,

    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch an access token and print it redacted
    Token,

    /// Start a session, speak one utterance, then stop
    Speak {
        /// Text to speak
        text: String,

        /// Task type (repeat, talk)
        #[arg(long)]
        task_type: Option<String>,

        /// Voice emotion (excited, serious, friendly, soothing, broadcaster)
        #[arg(long)]
        emotion: Option<String>,

        /// Seconds to wait for the avatar to finish talking
        #[arg(long, default_value = "30")]
        wait_secs: u64,
    },

    /// Remove the green backdrop from a still image
    Key {
        /// Input image
        input: String,

        /// Output image (PNG keeps transparency)
        output: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Token => {
            let config = load_config(cli.config.as_deref())?;
            fetch_token(&config).await?;
        }
        Commands::Speak { text, task_type, emotion, wait_secs } => {
            let config = load_config(cli.config.as_deref())?;
            let options = speak_options(task_type.as_deref(), emotion.as_deref())?;
            speak(config, &text, options, Duration::from_secs(wait_secs)).await?;
        }
        Commands::Key { input, output } => {
            let config = load_config(cli.config.as_deref())?;
            key_image(&config, &input, &output)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&str>) -> anyhow::Result<AvatarStreamConfig> {
    let mut config = match path {
        Some(path) => AvatarStreamConfig::from_file(path)?,
        None => AvatarStreamConfig::default(),
    };
    config.apply_env();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

fn speak_options(task_type: Option<&str>, emotion: Option<&str>) -> anyhow::Result<SpeakOptions> {
    let task_type = match task_type {
        Some(name) => match TaskType::from_name(name) {
            Some(task_type) => Some(task_type),
            None => bail!("Unknown task type: {}", name),
        },
        None => None,
    };
    let emotion = match emotion {
        Some(name) => match VoiceEmotion::from_name(name) {
            Some(emotion) => Some(emotion),
            None => bail!("Unknown emotion: {}", name),
        },
        None => None,
    };
    Ok(SpeakOptions { task_type, emotion })
}

async fn fetch_token(config: &AvatarStreamConfig) -> anyhow::Result<()> {
    let tokens = HttpTokenProvider::from_config(config)?;
    let token = tokens.fetch_token().await?;
    println!("✅ Token from {}: {}", tokens.endpoint(), token.redacted());
    Ok(())
}

async fn speak(
    config: AvatarStreamConfig,
    text: &str,
    options: SpeakOptions,
    wait: Duration,
) -> anyhow::Result<()> {
    let tokens = Arc::new(HttpTokenProvider::from_config(&config)?);
    let provider = Arc::new(StreamingApiProvider::from_config(&config)?);
    let controller = SessionController::new(config, tokens, provider)?;
    let mut events = controller.events().subscribe();

    let session = controller.initialize().await.context("Failed to start avatar session")?;
    println!("✅ Session {} ready", session.session_id);

    if !controller.speak(text, options).await {
        controller.stop().await;
        bail!("Avatar did not accept the speak request");
    }
    info!("Waiting up to {:?} for the avatar to finish", wait);

    let finished = tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(AvatarEvent::SpeakingStopped) => return true,
                Ok(AvatarEvent::SessionError { error }) => {
                    warn!("Session error while speaking: {}", error);
                    return false;
                }
                Ok(AvatarEvent::StreamDisconnected) => return false,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return false,
            }
        }
    })
    .await;

    match finished {
        Ok(true) => println!("✅ Finished speaking"),
        Ok(false) => println!("⚠️  Session ended before speaking finished"),
        Err(_) => println!("⚠️  Timed out waiting for the avatar"),
    }

    controller.shutdown().await;
    Ok(())
}

fn key_image(config: &AvatarStreamConfig, input: &str, output: &str) -> anyhow::Result<()> {
    let mut frame = image::open(input)
        .with_context(|| format!("Failed to open {}", input))?
        .to_rgba8();
    remove_backdrop(&mut frame, &config.compositor.chroma_key);
    frame
        .save(output)
        .with_context(|| format!("Failed to write {}", output))?;
    println!("✅ Wrote {} ({}x{})", output, frame.width(), frame.height());
    Ok(())
}
