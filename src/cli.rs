use std::path::Path;

use chrono::Utc;
use clap::{Parser, Subcommand};

use crate::config::{Environment, ServerSettings};
use crate::error::AppError;
use crate::store::{FileStore, UploadRequest};

#[derive(Parser)]
#[command(
    name = "gokapi",
    about = "Gokapi — self-hosted file sharing with expiring downloads",
    long_about = "Gokapi — self-hosted file sharing with expiring downloads.\n\n\
                  All settings are read from GOKAPI_* environment variables.",
    version,
    author
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the web server (default)
    Serve,

    /// Show the resolved configuration with secrets masked
    Env {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    #[command(flatten)]
    Files(FileCommand),
}

/// Commands operating directly on the local file store
#[derive(Subcommand)]
pub enum FileCommand {
    /// List stored files
    #[command(visible_alias = "ls")]
    List,

    /// Print the API result document of a file
    Info {
        /// File id
        id: String,
    },

    /// Add a local file to the store
    Add {
        /// Local file path to upload
        path: String,
        /// Days until the file expires
        #[arg(short, long, default_value = "14")]
        expiry_days: u32,
        /// Number of allowed downloads
        #[arg(short, long, default_value = "1")]
        downloads: i32,
        /// Password required for downloading
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Delete a file
    #[command(visible_alias = "rm")]
    Delete {
        /// File id
        id: String,
    },

    /// Remove all expired files
    Cleanup,
}

pub fn run_file_command(command: FileCommand, env: &Environment) -> Result<(), AppError> {
    let settings = ServerSettings::from_environment(env)?;
    let store = FileStore::new(&settings.data_dir, settings.length_id, &settings.salt_files)?;

    match command {
        FileCommand::List => {
            let files = store.list_files();
            if files.is_empty() {
                println!("No files stored in '{}'", settings.data_dir);
                return Ok(());
            }
            println!(
                "{:<20} {:<30} {:>10} {:>9}  {}",
                "ID", "NAME", "SIZE", "DOWNLOADS", "EXPIRES"
            );
            println!("{}", "─".repeat(90));
            for f in &files {
                println!(
                    "{:<20} {:<30} {:>10} {:>9}  {}",
                    f.id,
                    truncate(&f.name, 30),
                    f.size,
                    f.downloads_remaining,
                    f.expire_at_string
                );
            }
            println!("{}", "─".repeat(90));
            println!("{} file(s)", files.len());
        }

        FileCommand::Info { id } => {
            let file = store.get_file(&id)?;
            println!("{}", file.to_json_result(&settings.server_url));
        }

        FileCommand::Add {
            path,
            expiry_days,
            downloads,
            password,
        } => {
            let data = std::fs::read(&path)?;
            let name = Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "upload".to_string());

            let mut upload = UploadRequest::new(&name);
            upload.expiry_days = expiry_days;
            upload.allowed_downloads = downloads;
            upload.password = password;

            let file = store.put_file(&upload, &data)?;
            println!("✓ Added '{}' ({})", file.name, file.size);
            println!("  Download: {}d?id={}", settings.server_url, file.id);
            if !file.hotlink_id.is_empty() {
                println!("  Hotlink:  {}hotlink/{}", settings.server_url, file.hotlink_id);
            }
            println!(
                "  Expires:  {} or after {} download(s)",
                file.expire_at_string, file.downloads_remaining
            );
        }

        FileCommand::Delete { id } => {
            store.delete_file(&id)?;
            println!("✓ Deleted {}", id);
        }

        FileCommand::Cleanup => {
            let removed = store.cleanup_expired(Utc::now().timestamp())?;
            println!("✓ Removed {} expired file(s)", removed);
        }
    }
    Ok(())
}

pub fn print_environment(env: &Environment, json: bool) {
    let redacted = env.redacted();
    if json {
        match serde_json::to_string_pretty(&redacted) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("✗ Cannot encode configuration: {}", e),
        }
        return;
    }

    if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(&redacted) {
        for (key, value) in fields {
            let shown = match value {
                serde_json::Value::String(s) if s.is_empty() => "(unset)".to_string(),
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            println!("  {:<20} {}", key, shown);
        }
    }
    println!(
        "  {:<20} {}",
        "RemoteStorage",
        if env.is_aws_provided() { "configured" } else { "not configured" }
    );
}

fn truncate(name: &str, max: usize) -> String {
    if name.chars().count() > max {
        let skip = name.chars().count() - (max - 1);
        let tail: String = name.chars().skip(skip).collect();
        format!("…{}", tail)
    } else {
        name.to_string()
    }
}
