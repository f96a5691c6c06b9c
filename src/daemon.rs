use std::sync::Arc;
use std::time::Duration;

use rm_cloud::LocalStore;
use rm_fs::fs::{CloudFs, FsOptions};
use rm_fs::render::{CommandRenderer, PassthroughRenderer, Renderer};
use tokio::select;
use tracing::{debug, error, info, warn};

use crate::app_config;

mod managed_fuse {
    //! This module feels a little confusing, but it's designed to help you manage the lifecycle of
    //! fuse slightly better. fuser will not attempt to fuse unmount the filesystem when the
    //! `BackgroundSession` is dropped, and will only do a regular unmount, but we want to be
    //! aggressive and force an unmount if possible.
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use fuser::BackgroundSession;
    use nix::errno::Errno;
    use rm_cloud::CloudClient;
    use rm_fs::fs::CloudFs;
    use rm_fs::fs::fuser::FuserAdapter;

    use super::{debug, error};

    pub struct FuseCoreScope {
        _session: BackgroundSession,
    }

    impl FuseCoreScope {
        fn spawn<C: CloudClient>(
            fs: Arc<CloudFs<C>>,
            mount_point: &Path,
            handle: tokio::runtime::Handle,
        ) -> Result<Self, std::io::Error> {
            let fuse_adapter = FuserAdapter::new(fs, handle);
            let mount_opts = [
                fuser::MountOption::FSName("rmfs".to_owned()),
                fuser::MountOption::Subtype("rm-fs".to_owned()),
                fuser::MountOption::NoDev,
                fuser::MountOption::NoSuid,
                fuser::MountOption::AutoUnmount,
                fuser::MountOption::DefaultPermissions,
                #[cfg(target_os = "macos")]
                fuser::MountOption::CUSTOM("noappledouble".to_owned()),
            ];

            Ok(Self {
                _session: fuser::spawn_mount2(fuse_adapter, mount_point, &mount_opts)?,
            })
        }
    }

    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(mount_point: &Path) -> Self {
            Self {
                mount_point: mount_point.to_path_buf(),
            }
        }

        pub fn spawn<C: CloudClient>(
            &self,
            fs: Arc<CloudFs<C>>,
            handle: tokio::runtime::Handle,
        ) -> Result<FuseCoreScope, std::io::Error> {
            FuseCoreScope::spawn(fs, &self.mount_point, handle)
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "Confirming unmount of FUSE filesystem...");

            for i in 0..UMOUNT_ATTEMPT_COUNT {
                let result = {
                    #[cfg(target_os = "macos")]
                    {
                        nix::mount::unmount(&self.mount_point, nix::mount::MntFlags::MNT_FORCE)
                    }

                    #[cfg(target_os = "linux")]
                    {
                        nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH)
                    }
                };

                match result {
                    Ok(()) => {
                        debug!(
                            "Successfully unmounted FUSE filesystem on attempt {}",
                            i + 1
                        );
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(
                            "FUSE filesystem still busy on attempt {}. Retrying...",
                            i + 1
                        );
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!("FUSE filesystem already unmounted (attempt {})", i + 1);
                        break;
                    }
                    Err(e) => {
                        error!(
                            "Failed to unmount FUSE filesystem on attempt {}: {}",
                            i + 1,
                            e
                        );
                        break;
                    }
                }
            }
        }
    }
}

/// Prepares the mount point directory.
///
/// - If the directory does not exist, creates it (including parents) and logs an info message.
/// - If something is already mounted there, returns an error.
/// - Existing contents are left alone; they are hidden while mounted.
async fn prepare_mount_point(mount_point: &std::path::Path) -> Result<(), std::io::Error> {
    match tokio::fs::metadata(mount_point).await {
        Ok(meta) if !meta.is_dir() => Err(std::io::Error::new(
            std::io::ErrorKind::NotADirectory,
            format!("Mount point '{}' is not a directory.", mount_point.display()),
        )),
        Ok(_) => {
            if is_mount_point(mount_point)? {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Something is already mounted at '{}'.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// A directory is a mount point when it lives on a different device than its parent.
fn is_mount_point(path: &std::path::Path) -> Result<bool, std::io::Error> {
    let Some(parent) = path.parent() else {
        return Ok(true);
    };
    let parent = if parent.as_os_str().is_empty() {
        std::path::Path::new(".")
    } else {
        parent
    };
    let own = nix::sys::stat::stat(path)?;
    let above = nix::sys::stat::stat(parent)?;
    Ok(own.st_dev != above.st_dev)
}

fn build_renderer(config: &app_config::RenderConfig) -> Arc<dyn Renderer> {
    match config
        .command
        .as_deref()
        .and_then(|command| CommandRenderer::new(command, config.options.clone()))
    {
        Some(renderer) => {
            debug!(?renderer, "Using external renderer.");
            Arc::new(renderer)
        }
        None => {
            warn!(
                "No renderer configured; in annot mode, notebooks and EPUBs will fail to read \
                 with EIO."
            );
            Arc::new(PassthroughRenderer)
        }
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

/// Main entry point for the daemon.
pub async fn run(
    config: app_config::Config,
    handle: tokio::runtime::Handle,
) -> Result<(), std::io::Error> {
    prepare_mount_point(&config.mount_point).await?;

    let store = LocalStore::new(&config.store.path);
    let options = FsOptions {
        mode: config.mode,
        cache_capacity: config.cache_capacity,
        uid: config.uid,
        gid: config.gid,
    };
    let fs = Arc::new(CloudFs::new(store, build_renderer(&config.render), options));

    let diff = fs.refresh().await.map_err(|e| {
        error!(error = %e, "Initial refresh failed.");
        std::io::Error::other(e)
    })?;
    info!(nodes = diff.added.len(), "Loaded document tree.");

    let refresher = fs.spawn_refresh_task(Duration::from_secs(config.refresh_interval_secs));

    info!("Mounting filesystem at {}.", config.mount_point.display());

    let fuse = managed_fuse::ManagedFuse::new(&config.mount_point);
    {
        let _session = fuse.spawn(Arc::clone(&fs), handle)?;
        info!(mode = %fs.mode(), "rm-fs is running. Press Ctrl+C to stop.");

        wait_for_exit().await?;
    }
    refresher.abort();
    Ok(())
}

pub fn spawn(config: app_config::Config) -> Result<(), std::io::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, runtime.handle().clone()))
}
