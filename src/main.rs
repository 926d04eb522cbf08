use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use elemental::action;
use elemental::config::{ConfigData, RunConfig};
use elemental::logging;
use elemental::types::{
    DiskLayout, ElementalPartitions, Firmware, ImageSource, MountMode, PartTable,
};

#[derive(Parser)]
#[command(name = "elemental", about = "Immutable OS lifecycle management")]
struct Cli {
    /// Additional configuration file, merged last.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Verbose logging.
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the system on a target device
    Install {
        /// Target device, e.g. /dev/sda
        device: String,
        /// Container image to install
        #[arg(long = "docker-image")]
        docker_image: Option<String>,
        /// Image source URI (oci://, dir://, file://, channel://)
        #[arg(long = "system.uri")]
        system_uri: Option<String>,
        /// Partition layout file
        #[arg(long = "partition-layout")]
        partition_layout: Option<PathBuf>,
        /// Force a GPT partition table
        #[arg(long = "force-gpt")]
        force_gpt: bool,
        /// Force an EFI installation
        #[arg(long = "force-efi")]
        force_efi: bool,
        /// Cloud-init configuration files copied to the OEM partition
        #[arg(long = "cloud-init")]
        cloud_init: Vec<String>,
        /// Skip image signature verification
        #[arg(long = "no-verify")]
        no_verify: bool,
        /// Do not register an EFI boot entry
        #[arg(long = "disable-boot-entry")]
        disable_boot_entry: bool,
        #[arg(long)]
        reboot: bool,
        #[arg(long)]
        poweroff: bool,
        #[arg(long = "eject-cd")]
        eject_cd: bool,
    },
    /// Upgrade the system to a new image
    Upgrade {
        /// Upgrade the recovery image only
        #[arg(long)]
        recovery: bool,
        /// Image source URI
        #[arg(long = "system.uri")]
        system_uri: Option<String>,
        /// Container image to upgrade to
        #[arg(long = "docker-image")]
        docker_image: Option<String>,
        /// Refresh the bootloader from the new image
        #[arg(long)]
        bootloader: bool,
        /// Skip image signature verification
        #[arg(long = "no-verify")]
        no_verify: bool,
        /// Upgrade even if the previous upgrade was assessed as failed
        #[arg(long)]
        force: bool,
        #[arg(long)]
        reboot: bool,
        #[arg(long)]
        poweroff: bool,
    },
    /// Reset the system from recovery
    Reset {
        /// Also format the persistent partition
        #[arg(long = "reset-persistent")]
        reset_persistent: bool,
        /// Also format the OEM partition
        #[arg(long = "reset-oem")]
        reset_oem: bool,
        /// Image source URI
        #[arg(long = "system.uri")]
        system_uri: Option<String>,
        #[arg(long)]
        reboot: bool,
        #[arg(long)]
        poweroff: bool,
    },
    /// Compose the writable system at boot (initramfs stage)
    Mount {
        /// Deployment to mount: active, passive or recovery
        #[arg(long)]
        mode: Option<String>,
        /// Target root directory
        #[arg(long)]
        sysroot: Option<PathBuf>,
        /// Write the resulting /etc/fstab
        #[arg(long = "write-fstab")]
        write_fstab: bool,
        /// Relabel the composed tree for SELinux
        #[arg(long = "selinux-relabel")]
        selinux_relabel: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.debug);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut data = ConfigData::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Install {
            device,
            docker_image,
            system_uri,
            partition_layout,
            force_gpt,
            force_efi,
            cloud_init,
            no_verify,
            disable_boot_entry,
            reboot,
            poweroff,
            eject_cd,
        } => {
            data.reboot |= reboot;
            data.poweroff |= poweroff;
            data.eject_cd |= eject_cd;
            if no_verify {
                data.verify = false;
            }
            let mut spec = data.install.clone();
            spec.target = device;
            if let Some(image) = docker_image {
                spec.system = ImageSource::Oci(image);
            }
            if let Some(uri) = system_uri {
                spec.system = ImageSource::from_uri(&uri)?;
            }
            if let Some(layout) = partition_layout {
                let content = std::fs::read_to_string(&layout)
                    .with_context(|| format!("cannot read layout file {}", layout.display()))?;
                let layout: DiskLayout =
                    serde_yaml::from_str(&content).context("invalid partition layout file")?;
                spec.partitions = layout.partitions;
                spec.extra_partitions = layout.extra_partitions;
            }
            if spec.partitions.state.is_none() {
                spec.partitions = ElementalPartitions::default_layout();
            }
            spec.partitions.normalize();
            spec.cloud_init.extend(cloud_init);
            spec.disable_boot_entry |= disable_boot_entry;
            spec.firmware = if force_efi {
                if Firmware::detect() == Firmware::Bios {
                    tracing::warn!(
                        "forcing an EFI install on a BIOS booted host, the \
                         resulting system may not be bootable"
                    );
                }
                Firmware::Efi
            } else {
                Firmware::detect()
            };
            spec.part_table = if force_gpt || spec.firmware == Firmware::Efi {
                PartTable::Gpt
            } else {
                PartTable::Msdos
            };
            let run_config = RunConfig::new(&data)?;
            action::run_install(&run_config, &mut spec)
        }
        Commands::Upgrade {
            recovery,
            system_uri,
            docker_image,
            bootloader,
            no_verify,
            force,
            reboot,
            poweroff,
        } => {
            data.reboot |= reboot;
            data.poweroff |= poweroff;
            if no_verify {
                data.verify = false;
            }
            let mut spec = data.upgrade.clone();
            spec.recovery_upgrade |= recovery;
            spec.bootloader_upgrade |= bootloader;
            spec.force |= force;
            if let Some(image) = docker_image {
                spec.system = ImageSource::Oci(image);
            }
            if let Some(uri) = system_uri {
                spec.system = ImageSource::from_uri(&uri)?;
            }
            if recovery && spec.recovery_system.source.is_empty() {
                spec.recovery_system.source = spec.system.clone();
            }
            let run_config = RunConfig::new(&data)?;
            action::run_upgrade(&run_config, &mut spec)
        }
        Commands::Reset {
            reset_persistent,
            reset_oem,
            system_uri,
            reboot,
            poweroff,
        } => {
            data.reboot |= reboot;
            data.poweroff |= poweroff;
            let mut spec = data.reset.clone();
            spec.format_persistent |= reset_persistent;
            spec.format_oem |= reset_oem;
            if let Some(uri) = system_uri {
                spec.system = ImageSource::from_uri(&uri)?;
            }
            let run_config = RunConfig::new(&data)?;
            action::run_reset(&run_config, &mut spec)
        }
        Commands::Mount {
            mode,
            sysroot,
            write_fstab,
            selinux_relabel,
        } => {
            let mut spec = data.mount.clone();
            if let Some(mode) = mode {
                spec.mode = mode.parse::<MountMode>()?;
            }
            if let Some(sysroot) = sysroot {
                spec.sysroot = sysroot;
            }
            spec.write_fstab |= write_fstab;
            spec.selinux_relabel |= selinux_relabel;
            let run_config = RunConfig::new(&data)?;
            action::run_mount(&run_config.config, &mut spec)
        }
    }
}
