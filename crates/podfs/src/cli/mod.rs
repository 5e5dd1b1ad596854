//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use podfs_common::{ImageId, PodId, UidRange};

use crate::config::PodfsConfig;
use crate::filesystem::{CopyStats, TreeReplicator, dir_size};
use crate::lock::{LockHandle, LockKind, LockState, clean_key_locks};
use crate::pod::{LockWait, prepare_pod};

/// podfs - pod filesystem preparation
#[derive(Parser)]
#[command(name = "podfs")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for podfs data
    #[arg(long, global = true, env = "PODFS_ROOT")]
    pub root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Keep data under the user's home, skip device nodes and keep the
    /// invoking user as owner of copied files
    #[arg(long, global = true)]
    pub rootless: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// podfs commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Replicate an image tree into a pod's rootfs under the pod lock
    Prepare {
        /// Pod ID (a fresh UUID when omitted)
        pod_id: Option<PodId>,

        /// Path to the extracted image tree
        #[arg(long, required_unless_present = "image_id", conflicts_with = "image_id")]
        image: Option<PathBuf>,

        /// Image ID to look up in the tree store
        #[arg(long)]
        image_id: Option<ImageId>,

        /// UID/GID range as <shift>:<count>
        #[arg(long, default_value = "0:0")]
        uid_range: UidRange,

        /// Wait for the pod lock instead of failing
        #[arg(long)]
        wait: bool,
    },

    /// Copy a tree, shifting ownership
    CopyTree {
        /// Source directory
        src: PathBuf,

        /// Destination, which must not exist
        dest: PathBuf,

        /// UID/GID range as <shift>:<count>
        #[arg(long, default_value = "0:0")]
        uid_range: UidRange,
    },

    /// Print the logical size of a tree in bytes
    Du {
        /// Path to measure
        path: PathBuf,
    },

    /// Report who holds the lock on a path
    Probe {
        /// Lock target
        path: PathBuf,

        /// The target is a regular file rather than a directory
        #[arg(long)]
        file: bool,
    },

    /// Remove key lock files nobody holds
    CleanLocks {
        /// Lock directory (default: <root>/locks)
        dir: Option<PathBuf>,
    },
}

impl Cli {
    /// The configuration selected by the global flags.
    #[must_use]
    pub fn config(&self) -> PodfsConfig {
        let config = if self.rootless {
            PodfsConfig::rootless()
        } else {
            PodfsConfig::default()
        };
        match &self.root {
            Some(root) => config.with_root(root),
            None => config,
        }
    }

    /// Execute the CLI command.
    pub fn execute(self) -> Result<()> {
        let config = self.config();

        match self.command {
            Commands::Prepare {
                pod_id,
                image,
                image_id,
                uid_range,
                wait,
            } => {
                let image = match (image, image_id) {
                    (Some(path), _) => path,
                    (None, Some(id)) => config.paths.image_tree(&id),
                    (None, None) => {
                        return Err(color_eyre::eyre::eyre!("no image given"));
                    }
                };
                let wait = if wait { LockWait::Block } else { LockWait::Fail };
                let config = config.with_uid_range(uid_range);
                let pod_id = pod_id.unwrap_or_else(PodId::generate);

                let prepared = prepare_pod(&config, &pod_id, &image, wait)
                    .wrap_err_with(|| format!("Failed to prepare pod {pod_id}"))?;

                println!("Pod {} prepared at {}", pod_id, prepared.rootfs.display());
                print_stats(&prepared.stats);
                Ok(())
            }

            Commands::CopyTree {
                src,
                dest,
                uid_range,
            } => {
                let platform = config.platform();
                let stats = TreeReplicator::new(&platform)
                    .copy_tree(&src, &dest, &uid_range)
                    .wrap_err_with(|| {
                        format!("Failed to copy {} to {}", src.display(), dest.display())
                    })?;
                print_stats(&stats);
                Ok(())
            }

            Commands::Du { path } => {
                let bytes = dir_size(&path)?;
                println!("{}\t{}", bytes, path.display());
                Ok(())
            }

            Commands::Probe { path, file } => {
                let kind = if file {
                    LockKind::RegularFile
                } else {
                    LockKind::Directory
                };
                let held = probe(&path, kind)?;
                let label = match held {
                    LockState::Unlocked => "unlocked",
                    LockState::Shared => "shared",
                    LockState::Exclusive => "exclusive",
                };
                println!("{label}");
                Ok(())
            }

            Commands::CleanLocks { dir } => {
                let dir = dir.unwrap_or_else(|| config.paths.locks());
                let removed = clean_key_locks(&dir)?;
                println!("Removed {} lock file(s) from {}", removed, dir.display());
                Ok(())
            }
        }
    }
}

/// Finds the strongest lock other holders have on `path`.
fn probe(path: &Path, kind: LockKind) -> Result<LockState> {
    let mut lock = LockHandle::open(path, kind)?;

    let held = match lock.try_exclusive() {
        Ok(()) => LockState::Unlocked,
        Err(e) if e.is_locked() => match lock.try_shared() {
            Ok(()) => LockState::Shared,
            Err(e) if e.is_locked() => LockState::Exclusive,
            Err(e) => return Err(e.into()),
        },
        Err(e) => return Err(e.into()),
    };
    lock.close()?;
    Ok(held)
}

fn print_stats(stats: &CopyStats) {
    println!(
        "{} directories, {} files, {} symlinks, {} devices, {} fifos ({} bytes)",
        stats.directories, stats.files, stats.symlinks, stats.devices, stats.fifos, stats.bytes
    );
}
