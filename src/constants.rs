//! Well-known labels, paths and defaults shared across the engine.
//!
//! Everything the initramfs stage, the bootloader and the deployment engine
//! agree on lives here: partition labels, image file names, sentinel paths
//! and hook names.

/// Filesystem label of the EFI system partition.
pub const EFI_LABEL: &str = "COS_GRUB";
/// Filesystem label of the active deployment image.
pub const ACTIVE_LABEL: &str = "COS_ACTIVE";
/// Filesystem label of the passive (fallback) deployment image.
pub const PASSIVE_LABEL: &str = "COS_PASSIVE";
/// Filesystem label of non-squashfs recovery images.
pub const SYSTEM_LABEL: &str = "COS_SYSTEM";
pub const RECOVERY_LABEL: &str = "COS_RECOVERY";
pub const STATE_LABEL: &str = "COS_STATE";
pub const PERSISTENT_LABEL: &str = "COS_PERSISTENT";
pub const OEM_LABEL: &str = "COS_OEM";

// Partition names are stable lookup keys, independent of filesystem labels.
pub const BIOS_PART_NAME: &str = "p.bios";
pub const BOOT_PART_NAME: &str = "p.grub";
pub const OEM_PART_NAME: &str = "p.oem";
pub const RECOVERY_PART_NAME: &str = "p.recovery";
pub const STATE_PART_NAME: &str = "p.state";
pub const PERSISTENT_PART_NAME: &str = "p.persistent";

// Default partition sizes in MiB. A size of zero grows to fill the disk.
pub const EFI_SIZE: u32 = 64;
pub const OEM_SIZE: u32 = 64;
pub const STATE_SIZE: u32 = 15360;
pub const RECOVERY_SIZE: u32 = 8192;
pub const PERSISTENT_SIZE: u32 = 0;
pub const BIOS_SIZE: u32 = 1;
/// Default size of deployment images in MiB.
pub const IMG_SIZE: u32 = 3072;
/// Minimum size accounted for a grow-to-fill partition when checking disks.
pub const MIN_PART_SIZE: u32 = 64;

// Runtime mountpoints used while an action is in flight.
pub const RECOVERY_DIR: &str = "/run/cos/recovery";
pub const STATE_DIR: &str = "/run/cos/state";
pub const OEM_DIR: &str = "/run/cos/oem";
pub const PERSISTENT_DIR: &str = "/run/cos/persistent";
pub const EFI_DIR: &str = "/run/cos/efi";
/// Mountpoint of the state partition in a running system.
pub const RUNNING_STATE_DIR: &str = "/run/initramfs/cos-state";
/// Legacy mountpoint probed when the primary state dir has no state file.
pub const LEGACY_STATE_DIR: &str = "/run/initramfs/isoscan";
/// Workdir where in-progress snapshots are populated.
pub const WORKING_IMG_DIR: &str = "/run/elemental/workingtree";
/// Root of the ephemeral overlay assembled at boot.
pub const OVERLAY_DIR: &str = "/run/elemental/overlay";

// Snapshotter storage layout on the state partition.
pub const IMAGES_SUBDIR: &str = "cOS";
pub const ACTIVE_IMG_FILE: &str = "active.img";
pub const PASSIVE_IMG_FILE: &str = "passive.img";
pub const TRANSITION_IMG_FILE: &str = "transition.img";
pub const RECOVERY_IMG_FILE: &str = "recovery.img";
pub const RECOVERY_SQUASH_FILE: &str = "recovery.squashfs";
pub const TRANSITION_SQUASH_FILE: &str = "transition.squashfs";

/// Name of the state file persisted on both STATE and RECOVERY.
pub const INSTALL_STATE_FILE: &str = "state.yaml";
/// First line of every generated state file.
pub const INSTALL_STATE_HEADER: &str =
    "# Autogenerated file by elemental client, do not edit";

// Bootloader environment.
pub const GRUB_OEM_ENV: &str = "grub_oem_env";
pub const GRUB_DEF_ENTRY: &str = "cOS";
pub const GRUB_ENV_DEFAULT_ENTRY: &str = "default_menu_entry";
pub const GRUB_ENV_PASSIVE_SNAPS: &str = "passive_snapshots";
pub const GRUB_ENV_FALLBACK: &str = "fallback";
pub const GRUB_ENV_SNAPSHOTTER: &str = "snapshotter";
/// Grub configuration shipped inside the system image.
pub const GRUB_CONF_PATH: &str = "etc/cos/grub.cfg";

// Boot assessment contract with the initramfs stage.
pub const GRUB_CUSTOM_FILE: &str = "grubcustom";
pub const BOOT_ASSESSMENT_FILE: &str = "grub_boot_assessment";
pub const BOOT_ASSESSMENT_CMDLINE: &str = "rd.emergency=reboot rd.shell=0 panic=5";
pub const UPGRADE_FAILURE_SENTINEL: &str = "/run/cos/upgrade_failure";

// Sentinels written by the initramfs module; read to detect the boot mode.
pub const ACTIVE_MODE_SENTINELS: &[&str] =
    &["/run/cos/active_mode", "/run/elemental/active_mode"];
pub const PASSIVE_MODE_SENTINELS: &[&str] =
    &["/run/cos/passive_mode", "/run/elemental/passive_mode"];
pub const RECOVERY_MODE_SENTINELS: &[&str] =
    &["/run/cos/recovery_mode", "/run/elemental/recovery_mode"];
/// Directory where this engine drops its own runtime sentinels.
pub const RUN_ELEMENTAL_DIR: &str = "/run/elemental";

// Cloud-init hook names invoked at fixed points of each action.
pub const BEFORE_INSTALL_HOOK: &str = "before-install";
pub const AFTER_INSTALL_CHROOT_HOOK: &str = "after-install-chroot";
pub const AFTER_INSTALL_HOOK: &str = "after-install";
pub const BEFORE_UPGRADE_HOOK: &str = "before-upgrade";
pub const AFTER_UPGRADE_CHROOT_HOOK: &str = "after-upgrade-chroot";
pub const AFTER_UPGRADE_HOOK: &str = "after-upgrade";
pub const BEFORE_RESET_HOOK: &str = "before-reset";
pub const AFTER_RESET_CHROOT_HOOK: &str = "after-reset-chroot";
pub const AFTER_RESET_HOOK: &str = "after-reset";

/// Binary executing cloud-init stages inside the target system.
pub const CLOUD_INIT_BINARY: &str = "/usr/bin/cos-setup";

// Configuration discovery.
pub const SYSTEM_CONFIG_FILE: &str = "/etc/elemental/config.yaml";
pub const OEM_CONFIG_DIR: &str = "/oem";
/// Prefix of environment variables overriding configuration keys.
pub const ENV_PREFIX: &str = "ELEMENTAL_";

/// Snapper configuration templates probed when managing btrfs snapshots.
pub const SNAPPER_TEMPLATE_PATHS: &[&str] = &[
    "/etc/snapper/config-templates/default",
    "/usr/share/snapper/config-templates/default",
];

/// Default number of retained snapshots.
pub const MAX_SNAPS: u32 = 4;
/// HTTP timeout in seconds for remote file sources.
pub const HTTP_TIMEOUT_SECS: u32 = 60;
/// Attempts for transient failures (registry pulls, HTTP fetches).
pub const TRANSIENT_RETRIES: u32 = 3;

/// Script installed to eject the install media on shutdown.
pub const EJECT_SCRIPT: &str = "#!/bin/sh\n/usr/bin/eject -rmF";

/// Directories scanned for cloud-init snippets, in order.
pub fn cloud_init_paths() -> Vec<String> {
    vec![
        "/system/oem".to_string(),
        "/oem/".to_string(),
        "/usr/local/cloud-config/".to_string(),
    ]
}

/// Default mksquashfs options. The bcj filter follows the target arch for
/// best compression results.
pub fn squashfs_compression_options(arch: &str) -> Vec<String> {
    let filter = if arch == "aarch64" { "arm" } else { "x86" };
    ["-b", "1024k", "-comp", "xz", "-Xbcj", filter]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// mksquashfs options when compression is disabled.
pub fn squashfs_no_compression_options() -> Vec<String> {
    ["-no-compression"].iter().map(|s| s.to_string()).collect()
}
