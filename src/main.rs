use clap::{Parser, Subcommand};
use pstrip::{Child, Folder, PstArchive};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pstrip", about = "Read-only PST archive inspector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show archive metadata
    Info {
        input: PathBuf,
    },
    /// Print the folder hierarchy
    Tree {
        input: PathBuf,
    },
    /// List the messages of one folder
    List {
        input: PathBuf,
        /// Folder node id (defaults to the root folder)
        #[arg(short, long)]
        folder: Option<u32>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    match Cli::parse().command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let ar = PstArchive::open(&input)?;
            let header = ar.header();
            println!("── PST Archive ──────────────────────────────────────────");
            println!("  Path          {}", input.display());
            println!("  Format        {}", ar.format().name());
            println!("  Version       {} (client {})", header.ver, header.ver_client);
            println!("  Cipher        {}", ar.crypt_method().name());
            println!("  Store name    {}", ar.store_display_name()?.unwrap_or_default());
            println!("  File size     {} B", header.root.file_eof);
            println!("  Node B-tree   bid={:#x} @ {:#x}", header.root.nbt.bid, header.root.nbt.ib);
            println!("  Block B-tree  bid={:#x} @ {:#x}", header.root.bbt.bid, header.root.bbt.ib);
        }

        // ── Tree ─────────────────────────────────────────────────────────────
        Commands::Tree { input } => {
            let ar = PstArchive::open(&input)?;
            let root = ar.root_folder()?;
            print_tree(&root, 0)?;
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, folder } => {
            let ar = PstArchive::open(&input)?;
            let mut folder = match folder {
                Some(nid) => ar.folder(nid)?,
                None => ar.root_folder()?,
            };
            println!(
                "Folder: {} ({} item(s))",
                folder.display_name()?.unwrap_or_default(),
                folder.content_count()?.unwrap_or(0)
            );
            while let Some(child) = folder.next_child()? {
                match child {
                    Child::Message(msg) => {
                        let when = msg
                            .client_submit_time()?
                            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_else(|| "-".into());
                        println!(
                            "  {:#010x}  {}  {:<24} {}  [{} attachment(s)]",
                            msg.nid(),
                            when,
                            msg.sender_name()?.unwrap_or_default(),
                            msg.subject()?.unwrap_or_default(),
                            msg.attachment_count()?
                        );
                    }
                    Child::Folder(sub) => {
                        println!(
                            "  {:#010x}  <folder>  {}",
                            sub.nid(),
                            sub.display_name()?.unwrap_or_default()
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn print_tree(folder: &Folder<'_>, depth: usize) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "{}{} ({:#x}, {} item(s))",
        "  ".repeat(depth),
        folder.display_name()?.unwrap_or_else(|| "<unnamed>".into()),
        folder.nid(),
        folder.content_count()?.unwrap_or(0)
    );
    for sub in folder.sub_folders()? {
        print_tree(&sub, depth + 1)?;
    }
    Ok(())
}
