use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hls_transcode_core::{Config, Manager, NoopUrlRefresh};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or resume) transcoding a source and print its playlist
    Playlist {
        /// Stable identifier for the source, reused across seeks
        content_key: String,
        /// File name, used for container/codec heuristics
        file_name: String,
        /// Direct or signed URL to the source video
        source_url: String,
        /// Start position in seconds
        #[arg(long, default_value_t = 0.0)]
        start_time: f64,
        /// Duration hint in seconds, used until the source is probed
        #[arg(long, default_value_t = 0.0)]
        hint_duration: f64,
    },
    /// Seek an existing task and print the resulting playlist start offset
    Seek {
        content_key: String,
        target_time: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::from_env();
    config.validate()?;
    let manager = Manager::new(
        config,
        Arc::new(NoopUrlRefresh),
        PathBuf::from("ffmpeg"),
        PathBuf::from("ffprobe"),
    );

    match args.command {
        Commands::Playlist {
            content_key,
            file_name,
            source_url,
            start_time,
            hint_duration,
        } => {
            let task_id = manager
                .get_or_create_task(
                    &content_key,
                    &file_name,
                    &source_url,
                    None,
                    start_time,
                    hint_duration,
                )
                .await?;
            let playlist = manager
                .get_playlist(task_id, |segment_id| format!("segment{segment_id}.ts"))
                .await?;
            println!("{playlist}");
        }
        Commands::Seek {
            content_key,
            target_time,
        } => {
            let task_id = hls_transcode_core::task::task_id_for(&content_key);
            let offset = manager.seek(task_id, target_time).await?;
            println!("resumed at offset {offset}");
        }
    }

    manager.shutdown().await;
    Ok(())
}
