use std::{
    io::Read,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use swarmbit::{Torrent, TorrentConfig, TorrentCreator, TorrentCreatorConfig, TorrentInfo};

pub struct ByteDisplay(u64);

impl std::fmt::Display for ByteDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (n, suffix) = if self.0 > 1024 * 1024 * 1024 {
            (self.0 as f64 / (1024.0 * 1024.0 * 1024.0), "GiB")
        } else if self.0 > 1024 * 1024 {
            (self.0 as f64 / (1024.0 * 1024.0), "MiB")
        } else if self.0 > 1024 {
            (self.0 as f64 / 1024.0, "KiB")
        } else {
            (self.0 as f64, "B")
        };
        write!(f, "{n:.1} {suffix}")
    }
}

#[derive(Debug, Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Hash a file or directory into a metadata file
    Create {
        content: PathBuf,

        #[clap(short, long, default_value = "meta.json")]
        output: PathBuf,

        #[clap(long)]
        piece_length: Option<u32>,

        #[clap(long)]
        name: Option<String>,
    },
    /// Download and share the torrent described by a metadata file
    Run {
        meta: PathBuf,

        /// Directory holding the torrent's files
        #[clap(long, default_value = ".")]
        root: PathBuf,

        #[clap(long)]
        listen: Option<SocketAddr>,

        #[clap(long = "peer")]
        peers: Vec<String>,

        /// Keep running after the download completes
        #[clap(long)]
        seed: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    match args.command {
        Command::Create {
            content,
            output,
            piece_length,
            name,
        } => create(&content, &output, piece_length, name),
        Command::Run {
            meta,
            root,
            listen,
            peers,
            seed,
        } => run(&meta, root, listen, peers, seed).await,
    }
}

fn create(
    content: &Path,
    output: &Path,
    piece_length: Option<u32>,
    name: Option<String>,
) -> Result<()> {
    let (base, files) = if content.is_dir() {
        let mut files = Vec::new();
        collect_files(content, &mut files)?;
        files.sort();
        (content.to_owned(), files)
    } else {
        let base = content
            .parent()
            .map(Path::to_owned)
            .unwrap_or_default();
        (base, vec![content.to_owned()])
    };
    if files.is_empty() {
        return Err(eyre!("no files found under {}", content.display()));
    }

    let name = name.or_else(|| {
        content
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    });
    let mut creator = TorrentCreator::new(TorrentCreatorConfig { name, piece_length });
    let mut buffer = vec![0u8; 64 * 1024];
    for path in files {
        let relative = path.strip_prefix(&base)?.to_owned();
        let mut reader = std::fs::File::open(&path)?;
        let mut file = creator.file(relative);
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            file.push_data(&buffer[..n]);
        }
        file.finish();
    }

    let info = creator.finish()?;
    std::fs::write(output, info.encode())?;
    tracing::info!(
        "created {} with {} pieces, info hash {}",
        output.display(),
        info.pieces_count(),
        info.info_hash()
    );
    Ok(())
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

async fn run(
    meta: &Path,
    root: PathBuf,
    listen: Option<SocketAddr>,
    peers: Vec<String>,
    seed: bool,
) -> Result<()> {
    let content = std::fs::read(meta)?;
    let info = TorrentInfo::decode(&content)?;
    tracing::info!(
        "{}: {} in {} files, info hash {}",
        info.name(),
        ByteDisplay(info.total_size()),
        info.files().len(),
        info.info_hash()
    );

    let torrent = Torrent::new_with(
        info,
        TorrentConfig {
            root,
            listen_addr: listen,
            ..Default::default()
        },
    )?;
    for peer in peers.iter() {
        torrent.connect(peer);
    }

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            _ = interval.tick() => {
                let view = torrent.view().await;
                let downloaded = view.peers.iter().map(|peer| peer.downloaded).sum::<u64>();
                let uploaded = view.peers.iter().map(|peer| peer.uploaded).sum::<u64>();
                tracing::info!(
                    "{:.1}% ({}/{} pieces), {} peers, down {}, up {}",
                    view.progress * 100.0,
                    view.owned,
                    view.piece_count,
                    view.peers.len(),
                    ByteDisplay(downloaded),
                    ByteDisplay(uploaded),
                );
                if view.complete() && !seed {
                    tracing::info!("download complete");
                    break;
                }
            }
        }
    }
    Ok(())
}
