//! SnapVault CLI - Command line interface for the photo vault.
//!
//! This tool drives the key hierarchy, sharing and media pipelines against a
//! local simulated server kept in the home directory.

mod app;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

use app::App;
use snapvault_common::{CollectionId, GrantId, ItemId, Permission};
use snapvault_pipeline::{
    spawn_download, DownloadRequest, DownloadState, UploadQueue, UploadRequest, UploadState,
};

const PASSWORD_ENV: &str = "SNAPVAULT_PASSWORD";
const NEW_PASSWORD_ENV: &str = "SNAPVAULT_NEW_PASSWORD";

#[derive(Parser)]
#[command(name = "snapvault")]
#[command(about = "SnapVault - Zero-knowledge photo vault")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Home directory holding the server snapshot and device caches.
    #[arg(long)]
    home: Option<PathBuf>,

    /// User to act as.
    #[arg(short, long)]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the user's keys.
    Init,

    /// Unlock with the password and cache the keys on this device.
    Unlock,

    /// Publish an alias others can share with.
    Alias {
        /// Alias, e.g. an email address.
        name: String,
    },

    /// Create a new album.
    CreateAlbum {
        /// Album identifier.
        album: String,
    },

    /// Share an album with another user.
    Share {
        /// Album identifier.
        album: String,

        /// User id or alias of the recipient.
        recipient: String,

        /// Allow the recipient to upload.
        #[arg(short, long)]
        write: bool,
    },

    /// List invites addressed to the user.
    Pending,

    /// Accept an invite.
    Accept {
        /// Invite id from `pending`.
        grant: String,
    },

    /// Encrypt and upload photos. Each file name becomes the item id.
    Upload {
        /// Album identifier.
        album: String,

        /// Files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Download and decrypt a photo.
    Download {
        /// Album identifier.
        album: String,

        /// Item identifier.
        item: String,

        /// Destination file path.
        dest: PathBuf,
    },

    /// Change the password.
    ChangePassword,

    /// Forget every key cached on this device.
    SignOut,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let home = match cli.home {
        Some(home) => home,
        None => dirs::data_dir()
            .context("No data directory on this platform; pass --home")?
            .join("snapvault"),
    };
    let app = App::open(&home, &cli.user)?;

    match cli.command {
        Commands::Init => cmd_init(&app).await?,
        Commands::Unlock => cmd_unlock(&app).await?,
        Commands::Alias { name } => cmd_alias(&app, &name)?,
        Commands::CreateAlbum { album } => cmd_create_album(&app, &album).await?,
        Commands::Share {
            album,
            recipient,
            write,
        } => cmd_share(&app, &album, &recipient, write).await?,
        Commands::Pending => cmd_pending(&app).await?,
        Commands::Accept { grant } => cmd_accept(&app, &grant).await?,
        Commands::Upload { album, files } => cmd_upload(&app, &album, &files).await?,
        Commands::Download { album, item, dest } => {
            cmd_download(&app, &album, &item, &dest).await?
        }
        Commands::ChangePassword => cmd_change_password(&app).await?,
        Commands::SignOut => cmd_sign_out(&app).await?,
    }

    app.save()
}

/// Read a password from the environment or prompt for it.
fn read_password(env: &str, prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(password) = std::env::var(env) {
        debug!("Using password from {}", env);
        return Ok(Zeroizing::new(password));
    }
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(password))
}

/// Read a new password, asking twice when prompting.
fn read_new_password(env: &str, prompt: &str) -> Result<Zeroizing<String>> {
    if std::env::var(env).is_ok() {
        return read_password(env, prompt);
    }
    let password = read_password(env, prompt)?;
    let confirm = read_password(env, "Confirm password: ")?;
    if *password != *confirm {
        anyhow::bail!("Passwords do not match");
    }
    Ok(password)
}

/// Resume from the device cache, or unlock with the password.
async fn ensure_unlocked(app: &App) -> Result<()> {
    if app.manager.resume().await.context("Failed to read key cache")? {
        return Ok(());
    }
    let password = read_password(PASSWORD_ENV, "Password: ")?;
    app.manager
        .unlock(&password)
        .await
        .context("Failed to unlock")
}

fn album_id(album: &str) -> Result<CollectionId> {
    CollectionId::new(album).context("Invalid album id")
}

async fn cmd_init(app: &App) -> Result<()> {
    info!("Creating keys for {}", app.manager.user_id());

    let password = read_new_password(PASSWORD_ENV, "Choose a password: ")?;
    app.manager
        .initialize_account(&password)
        .await
        .context("Failed to create keys")?;

    println!("Account ready: {}", app.manager.user_id());
    println!("  Public key: {}", app.manager.public_key()?.to_descriptor());
    Ok(())
}

async fn cmd_unlock(app: &App) -> Result<()> {
    let password = read_password(PASSWORD_ENV, "Password: ")?;
    app.manager
        .unlock(&password)
        .await
        .context("Failed to unlock")?;

    println!("Unlocked. Keys are cached on this device.");
    Ok(())
}

fn cmd_alias(app: &App, name: &str) -> Result<()> {
    app.backend.register_alias(name, app.manager.user_id());
    println!("{} is now reachable as {}", app.manager.user_id(), name);
    Ok(())
}

async fn cmd_create_album(app: &App, album: &str) -> Result<()> {
    let album = album_id(album)?;
    ensure_unlocked(app).await?;

    app.manager
        .create_collection(&album)
        .await
        .context("Failed to create album")?;

    println!("Album created: {}", album);
    Ok(())
}

async fn cmd_share(app: &App, album: &str, recipient: &str, write: bool) -> Result<()> {
    let album = album_id(album)?;
    let permission = if write {
        Permission::ReadWrite
    } else {
        Permission::ReadOnly
    };
    ensure_unlocked(app).await?;

    let grant = app
        .sharing
        .grant_access(&album, recipient, permission)
        .await
        .context("Failed to share album")?;

    println!("Invited {} to {} ({})", recipient, album, permission);
    println!("  Invite: {}", grant);
    Ok(())
}

async fn cmd_pending(app: &App) -> Result<()> {
    let grants = app
        .sharing
        .pending_grants()
        .await
        .context("Failed to list invites")?;

    if grants.is_empty() {
        println!("No pending invites.");
    } else {
        for grant in grants {
            println!(
                "  {}  {} from {} ({})",
                grant.id, grant.collection_id, grant.granter, grant.permission
            );
        }
    }
    Ok(())
}

async fn cmd_accept(app: &App, grant: &str) -> Result<()> {
    let grant_id = GrantId::new(grant).context("Invalid invite id")?;

    app.manager
        .resume()
        .await
        .context("Failed to read key cache")?;
    let password = if app.manager.is_unlocked() {
        Zeroizing::new(String::new())
    } else {
        read_password(PASSWORD_ENV, "Password: ")?
    };

    let key = app
        .sharing
        .accept_grant(&grant_id, &password)
        .await
        .context("Failed to accept invite")?;

    println!("Invite accepted ({:?})", key.usages());
    Ok(())
}

async fn cmd_upload(app: &App, album: &str, files: &[PathBuf]) -> Result<()> {
    let album = album_id(album)?;
    app.manager
        .resume()
        .await
        .context("Failed to read key cache")?;

    let queue = UploadQueue::new(app.pipelines.clone());
    let mut updates = queue.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            debug!(item = %update.item_id, attempt = update.attempt, "{}", update.state.name());
        }
    });

    for file in files {
        let name = file
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("Invalid file name: {}", file.display()))?;
        let data = tokio::fs::read(file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let item = ItemId::new(name).context("Invalid item id")?;

        if !queue
            .enqueue(UploadRequest::new(album.clone(), item, data))
            .await
        {
            println!("Skipping duplicate: {}", name);
        }
    }
    queue.drain().await;

    let mut failed = 0;
    for (item, entry) in queue.entries().await {
        match entry.state {
            UploadState::Done(record) => {
                println!("Uploaded {} ({} bytes)", item, record.plaintext_len)
            }
            UploadState::Error(err) => {
                failed += 1;
                println!("Failed {}: {}", item, err);
            }
            other => println!("Unfinished {}: {}", item, other.name()),
        }
    }
    drop(queue);
    let _ = progress.await;

    if failed > 0 {
        anyhow::bail!("{} upload(s) failed", failed);
    }
    Ok(())
}

async fn cmd_download(app: &App, album: &str, item: &str, dest: &Path) -> Result<()> {
    let album = album_id(album)?;
    let item = ItemId::new(item).context("Invalid item id")?;
    app.manager
        .resume()
        .await
        .context("Failed to read key cache")?;

    let mut task = spawn_download(app.pipelines.clone(), DownloadRequest::new(album, item));
    while let Some(update) = task.recv().await {
        match update {
            DownloadState::Done(handle) => {
                let data = app.pipelines.media.read(&handle)?;
                tokio::fs::write(dest, data.as_bytes())
                    .await
                    .with_context(|| format!("Failed to write {}", dest.display()))?;
                app.pipelines.media.release(&handle);

                println!("Saved {} ({} bytes)", dest.display(), handle.len());
                return Ok(());
            }
            DownloadState::Error(err) => anyhow::bail!("Download failed: {}", err),
            other => debug!("{}", other.name()),
        }
    }
    anyhow::bail!("Download ended without a result")
}

async fn cmd_change_password(app: &App) -> Result<()> {
    info!("Changing password");

    let old_password = read_password(PASSWORD_ENV, "Current password: ")?;
    let new_password = read_new_password(NEW_PASSWORD_ENV, "New password: ")?;

    app.manager
        .change_password(&old_password, &new_password)
        .await
        .context("Failed to change password")?;

    println!("Password changed successfully!");
    Ok(())
}

async fn cmd_sign_out(app: &App) -> Result<()> {
    app.manager
        .sign_out()
        .await
        .context("Failed to clear key cache")?;

    println!("Signed out. Cached keys removed from this device.");
    Ok(())
}
