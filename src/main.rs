use clap::{Parser, Subcommand};
use std::error::Error;
use std::fs;
use std::path::PathBuf;

use arqread::cache::{FileBuilder, FileSearcher};
use arqread::store::{list_computers, open_computer, Computer, Folder, LocalStore};
use arqread::types::{decode_pack_index, ShaHash};

#[derive(Parser)]
#[command(name = "arqread")]
#[command(about = "Read-side tools for Arq-format backup archives", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the computers stored at a destination.
    Computers { root: PathBuf },
    /// List the folders backed up by a computer.
    Folders {
        root: PathBuf,
        computer: String,
        #[arg(short, long)]
        passphrase: String,
    },
    /// Show a folder's backup refs, newest first.
    Refs {
        root: PathBuf,
        computer: String,
        /// Folder UUID or name.
        folder: String,
        #[arg(short, long)]
        passphrase: String,
    },
    /// Print the master commit hash of a folder.
    Master {
        root: PathBuf,
        computer: String,
        /// Folder UUID or name.
        folder: String,
        #[arg(short, long)]
        passphrase: String,
    },
    /// Decode a pack index file and print its objects.
    IndexInfo { file: PathBuf },
    /// Build the pack-index cache from `<sha1>.index` files.
    CacheBuild {
        workdir: PathBuf,
        indexes: Vec<PathBuf>,
    },
    /// Look up an object hash in a built cache.
    CacheFind { workdir: PathBuf, hash: String },
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match &cli.command {
        Commands::Computers { root } => {
            let store = LocalStore::new(root);
            for computer in list_computers(&store, "")? {
                println!(
                    "{}  {} ({})",
                    computer.uuid, computer.info.computer_name, computer.info.user_name
                );
            }
        }
        Commands::Folders {
            root,
            computer,
            passphrase,
        } => {
            let store = LocalStore::new(root);
            let computer = open_computer(&store, "", computer, passphrase)?;
            println!("{:<38} {:<20} {}", "UUID", "Name", "Path");
            for folder in computer.list_folders()? {
                println!(
                    "{:<38} {:<20} {}",
                    folder.bucket_uuid, folder.bucket_name, folder.local_path
                );
            }
        }
        Commands::Refs {
            root,
            computer,
            folder,
            passphrase,
        } => {
            let store = LocalStore::new(root);
            let computer = open_computer(&store, "", computer, passphrase)?;
            let folder = find_folder(&computer, folder)?;
            for entry in folder.list_refs()? {
                let record = folder.read_ref(entry.number)?;
                println!("{}  head={}  pack={}", entry.number, record.new_head_sha1, record.pack_sha1);
            }
        }
        Commands::Master {
            root,
            computer,
            folder,
            passphrase,
        } => {
            let store = LocalStore::new(root);
            let computer = open_computer(&store, "", computer, passphrase)?;
            let folder = find_folder(&computer, folder)?;
            println!("{}", folder.find_master()?);
        }
        Commands::IndexInfo { file } => {
            let index = decode_pack_index(&fs::read(file)?)?;
            println!("version: {}", index.version);
            println!("objects: {}", index.objects.len());
            for obj in &index.objects {
                println!("{}  offset={}  length={}", obj.sha1, obj.offset, obj.length);
            }
        }
        Commands::CacheBuild { workdir, indexes } => {
            let mut builder = FileBuilder::new(workdir);
            for path in indexes {
                let pack_hash = pack_hash_from_path(path)?;
                let index = decode_pack_index(&fs::read(path)?)?;
                builder.add(pack_hash, &index)?;
                println!("indexed {} ({} objects)", pack_hash, index.objects.len());
            }
            builder.build()?;
            println!("cache written to {}", workdir.display());
        }
        Commands::CacheFind { workdir, hash } => {
            let mut searcher = FileSearcher::open(workdir)?;
            let location = searcher.find(&ShaHash::from_hex(hash)?)?;
            println!(
                "pack={}  offset={}  length={}",
                location.pack_hash, location.offset, location.length
            );
        }
    }
    Ok(())
}

/// Accepts a folder UUID or its configured name.
fn find_folder<'c, 's>(
    computer: &'c Computer<'s, LocalStore>,
    wanted: &str,
) -> Result<Folder<'c, 's, LocalStore>, Box<dyn Error>> {
    for info in computer.list_folders()? {
        if info.bucket_uuid == wanted || info.bucket_name == wanted {
            return Ok(computer.folder(info));
        }
    }
    Err(format!("no folder named '{wanted}'").into())
}

/// Pack index files are stored as `<pack sha1>.index`.
fn pack_hash_from_path(path: &std::path::Path) -> Result<ShaHash, Box<dyn Error>> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| format!("cannot take a pack hash from '{}'", path.display()))?;
    Ok(ShaHash::from_hex(stem)?)
}
