//! Interactive session coordinator simulator
//!
//! Run with: cargo run --bin mtphost-sim -- --volume /storage/1234-ABCD

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use mtphost::server::simulated::SimSessionFactory;
use mtphost::{
    Coordinator, CoordinatorConfig, FsUserResolver, SessionParams, UserId, VolumeDescriptor,
    VolumeEventListener, VolumeState, VolumeStateChange,
};

#[derive(Parser, Debug)]
#[command(name = "mtphost-sim", about = "Drive the session coordinator against simulated collaborators")]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding one subdirectory per user
    #[arg(long, default_value = "./mtphost_users")]
    users_root: PathBuf,

    /// Target user id
    #[arg(long, default_value_t = 0)]
    user: u32,

    /// Mount path of the primary volume
    #[arg(long, default_value = "/storage/emulated/0")]
    primary: String,

    /// Mount path of an additional removable volume (repeatable)
    #[arg(long = "volume")]
    volumes: Vec<String>,
}

/// The simulated platform's view of every volume.
type Platform = Arc<Mutex<Vec<VolumeDescriptor>>>;

fn set_state(platform: &Platform, id: &str, new_state: VolumeState) -> Result<VolumeState> {
    let mut volumes = platform.lock().unwrap_or_else(|e| e.into_inner());
    let Some(volume) = volumes.iter_mut().find(|v| v.id == id) else {
        bail!("unknown volume {}", id);
    };
    let old_state = volume.state;
    volume.state = new_state;
    Ok(old_state)
}

fn print_help() {
    println!("Commands:");
    println!("  start [unlocked] [restricted]");
    println!("  stop");
    println!("  mount <path>");
    println!("  unmount <path>");
    println!("  terminate");
    println!("  status");
    println!("  quit");
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => CoordinatorConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CoordinatorConfig::default(),
    };

    let user = UserId(args.user);
    let user_root = args.users_root.join(user.to_string());
    std::fs::create_dir_all(&user_root)
        .with_context(|| format!("creating {}", user_root.display()))?;

    let mut volumes = vec![VolumeDescriptor::new(&args.primary, true, VolumeState::Mounted)];
    volumes.extend(
        args.volumes
            .iter()
            .map(|path| VolumeDescriptor::new(path, false, VolumeState::Mounted)),
    );
    let platform: Platform = Arc::new(Mutex::new(volumes));

    let factory = SimSessionFactory::new();
    let (coordinator, events) = Coordinator::new(
        config,
        factory.clone(),
        Arc::new(FsUserResolver::new(&args.users_root)),
    );
    let event_loop = coordinator.spawn_event_loop(events);

    let listener = VolumeEventListener::new(Arc::clone(&coordinator));
    let (volume_tx, volume_rx) = mpsc::channel(32);
    let pump = listener.attach(volume_rx);

    let source = {
        let platform = Arc::clone(&platform);
        move |_user: UserId| platform.lock().unwrap_or_else(|e| e.into_inner()).clone()
    };

    println!("\nSession coordinator simulator");
    println!("=============================");
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["start", flags @ ..] => {
                let params = SessionParams {
                    unlocked: flags.contains(&"unlocked"),
                    restricted: flags.contains(&"restricted"),
                    target_user: user,
                };
                match coordinator.on_start_command(params, &source) {
                    Ok(outcome) => println!("{:?}", outcome),
                    Err(e) => println!("Start failed: {}", e),
                }
            }
            ["stop"] => {
                if !coordinator.stop_session() {
                    println!("No active session");
                }
                // A detached server drains once its host goes away.
                let drained = factory.disconnect_detached(None);
                if drained > 0 {
                    println!("Disconnected {} detached server(s)", drained);
                }
            }
            ["mount", id] | ["unmount", id] => {
                let new_state = if words[0] == "mount" {
                    VolumeState::Mounted
                } else {
                    VolumeState::Unmounted
                };
                match set_state(&platform, id, new_state) {
                    Ok(old_state) => {
                        volume_tx
                            .send(VolumeStateChange::new(*id, old_state, new_state))
                            .await?;
                    }
                    Err(e) => println!("{}", e),
                }
            }
            ["terminate"] => {
                let current = coordinator
                    .session_info()
                    .and_then(|info| factory.server_for(info.session_id))
                    .filter(|server| server.is_running())
                    .or_else(|| factory.running_servers().pop());
                match current {
                    Some(server) => server.disconnect(),
                    None => println!("No running server"),
                }
            }
            ["status"] => {
                match coordinator.session_info() {
                    Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                    None => println!("Idle"),
                }
                for volume in coordinator.mounted_volumes() {
                    println!("  mounted: {}", volume.id);
                }
                if let Some(view) = factory.last_view() {
                    println!("  exposed: {:?}", view.storages());
                }
            }
            ["quit"] | ["exit"] => break,
            _ => print_help(),
        }
    }

    listener.detach();
    coordinator.shutdown();
    factory.disconnect_detached(None);
    let _ = pump.await;
    event_loop.abort();
    Ok(())
}
