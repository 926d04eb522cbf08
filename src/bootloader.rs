//! GRUB adapter.
//!
//! The engine never parses GRUB configuration; it only installs the
//! bootloader during installs and writes environment files at well-known
//! paths. The fallback logic itself lives in the GRUB configuration shipped
//! inside the system image.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::constants;
use crate::fsutils::{find_first_existing, write_file_with_dirs};
use crate::process::run_checked;
use crate::types::Firmware;

/// Content of `grubcustom`: pulls the boot assessment logic into the main
/// configuration when present.
const GRUB_CUSTOM_CONTENT: &str = "\
set bootfile_loc=\"${root}\"
if [ -f \"${bootfile_loc}/grub_boot_assessment\" ]; then
  source \"${bootfile_loc}/grub_boot_assessment\"
fi
";

/// Content of `grub_boot_assessment`: the sentinel block read and updated
/// by the initramfs stage. Booting an assessed snapshot appends the hardened
/// command line so a failed early userspace falls back instead of hanging.
const BOOT_ASSESSMENT_CONTENT: &str = "\
set boot_assessment_blk=\"${root}\"
set boot_assessment_file=\"${boot_assessment_blk}/boot_assessment\"
if [ \"${enable_boot_assessment}\" = \"yes\" -o \"${enable_boot_assessment_always}\" = \"yes\" ]; then
  set extra_cmdline=\"rd.emergency=reboot rd.shell=0 panic=5\"
fi
";

/// GRUB bootloader adapter.
#[derive(Debug)]
pub struct Grub<'a> {
    config: &'a Config,
}

impl<'a> Grub<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Set persistent variables in a GRUB environment file.
    pub fn set_persistent_variables(&self, env_file: &Path, vars: &[(&str, String)]) -> Result<()> {
        if vars.is_empty() {
            return Ok(());
        }
        if let Some(parent) = env_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = env_file.to_string_lossy().into_owned();
        let mut args: Vec<String> = vec![file, "set".to_string()];
        for (key, value) in vars {
            args.push(format!("{}={}", key, value));
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        debug!("Setting bootloader variables in {}", env_file.display());
        run_checked(
            self.config.runner.as_ref(),
            "grub2-editenv",
            &arg_refs,
            "failed setting bootloader environment",
        )
        .map(|_| ())
    }

    /// Publish the default menu entry.
    pub fn set_default_entry(&self, env_dir: &Path, entry: &str) -> Result<()> {
        let entry = if entry.is_empty() {
            constants::GRUB_DEF_ENTRY
        } else {
            entry
        };
        self.set_persistent_variables(
            &env_dir.join(constants::GRUB_OEM_ENV),
            &[(constants::GRUB_ENV_DEFAULT_ENTRY, entry.to_string())],
        )
    }

    /// Install the bootloader on the target disk. BIOS installs go through
    /// `grub2-install`; EFI installs copy the shipped EFI application into
    /// the ESP and optionally register a boot entry.
    pub fn install(
        &self,
        root: &Path,
        state_mount: &Path,
        efi_mount: Option<&Path>,
        target_disk: &str,
        firmware: Firmware,
        disable_boot_entry: bool,
    ) -> Result<()> {
        info!("Installing GRUB..");
        let grub_dir = state_mount.join("grub2");
        std::fs::create_dir_all(&grub_dir)?;

        // the grub.cfg shipped inside the system image drives the fallback
        // menu; it is copied verbatim
        let shipped_cfg = root.join(constants::GRUB_CONF_PATH);
        if shipped_cfg.exists() {
            let content = std::fs::read(&shipped_cfg)?;
            write_file_with_dirs(grub_dir.join("grub.cfg"), content)?;
        } else {
            warn!("no grub configuration found at {}", shipped_cfg.display());
        }

        match firmware {
            Firmware::Bios => {
                let boot_dir = state_mount.to_string_lossy().into_owned();
                run_checked(
                    self.config.runner.as_ref(),
                    "grub2-install",
                    &[
                        "--target=i386-pc",
                        "--boot-directory",
                        &boot_dir,
                        target_disk,
                    ],
                    "grub2-install failed",
                )?;
            }
            Firmware::Efi => {
                let efi_mount = efi_mount
                    .ok_or_else(|| anyhow!("EFI install requested without an ESP mounted"))?;
                self.install_efi_app(root, efi_mount, target_disk, disable_boot_entry)?;
            }
        }
        Ok(())
    }

    fn install_efi_app(
        &self,
        root: &Path,
        efi_mount: &Path,
        target_disk: &str,
        disable_boot_entry: bool,
    ) -> Result<()> {
        let arch = self.config.platform.arch.as_str();
        let (app_name, candidates) = match arch {
            "aarch64" => (
                "bootaa64.efi",
                vec![
                    root.join("usr/share/efi/aarch64/grub.efi"),
                    root.join("usr/share/grub2/arm64-efi/grub.efi"),
                ],
            ),
            _ => (
                "bootx64.efi",
                vec![
                    root.join("usr/share/efi/x86_64/grub.efi"),
                    root.join("usr/share/grub2/x86_64-efi/grub.efi"),
                    root.join("usr/lib/grub/x86_64-efi/grub.efi"),
                ],
            ),
        };
        let grub_efi = find_first_existing(&candidates)
            .ok_or_else(|| anyhow!("no grub EFI application found in the system image"))?;

        let boot_dir = efi_mount.join("EFI/boot");
        let app = boot_dir.join(app_name);
        std::fs::create_dir_all(&boot_dir)?;
        std::fs::copy(&grub_efi, &app)?;

        // a stub configuration next to the EFI app redirects grub to the
        // state partition holding the real configuration
        let stub = format!(
            "search --no-floppy --label --set=root {}\nset prefix=($root)/grub2\nconfigfile ($prefix)/grub.cfg\n",
            constants::STATE_LABEL
        );
        write_file_with_dirs(boot_dir.join("grub.cfg"), stub)?;

        if !disable_boot_entry {
            let result = self.config.runner.as_ref().run(
                "efibootmgr",
                &[
                    "--create",
                    "--disk",
                    target_disk,
                    "--part",
                    "1",
                    "--loader",
                    &format!("\\EFI\\boot\\{}", app_name),
                    "--label",
                    constants::GRUB_DEF_ENTRY,
                ],
            )?;
            if !result.success() {
                warn!(
                    "failed registering EFI boot entry: {}",
                    result.stderr_trimmed()
                );
            }
        }
        Ok(())
    }

    /// Write the boot assessment hook files on the state partition and the
    /// assessment environment file.
    pub fn enable_boot_assessment(&self, state_mount: &Path) -> Result<()> {
        write_file_with_dirs(
            state_mount.join(constants::GRUB_CUSTOM_FILE),
            GRUB_CUSTOM_CONTENT,
        )?;
        write_file_with_dirs(
            state_mount.join(constants::BOOT_ASSESSMENT_FILE),
            BOOT_ASSESSMENT_CONTENT,
        )?;
        Ok(())
    }

    /// Arm boot assessment for the next boot only. The initramfs clears the
    /// flag once the new deployment has come up healthy.
    pub fn set_single_shot_assessment(&self, state_mount: &Path) -> Result<()> {
        self.set_persistent_variables(
            &state_mount.join("boot_assessment"),
            &[("enable_boot_assessment", "yes".to_string())],
        )
    }

    /// Environment directory used for `grub_oem_env`: the ESP when there is
    /// one, the state partition otherwise.
    pub fn env_dir(boot_mount: Option<&PathBuf>, state_mount: &Path) -> PathBuf {
        boot_mount
            .cloned()
            .unwrap_or_else(|| state_mount.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn grub_config() -> (Config, Rc<FakeRunner>) {
        let mut config = Config::for_tests();
        let runner = Rc::new(FakeRunner::default());
        config.runner = Box::new(runner.clone());
        (config, runner)
    }

    #[test]
    fn test_persistent_variables_go_through_editenv() {
        let (config, runner) = grub_config();
        let tmp = TempDir::new().unwrap();
        let grub = Grub::new(&config);
        grub.set_persistent_variables(
            &tmp.path().join(constants::GRUB_OEM_ENV),
            &[
                ("fallback", "0 1 recovery".to_string()),
                ("snapshotter", "loop-device".to_string()),
            ],
        )
        .unwrap();
        assert!(runner.called_with("grub2-editenv", "set fallback=0 1 recovery snapshotter=loop-device"));
    }

    #[test]
    fn test_boot_assessment_files() {
        let (config, _runner) = grub_config();
        let tmp = TempDir::new().unwrap();
        let grub = Grub::new(&config);
        grub.enable_boot_assessment(tmp.path()).unwrap();

        let custom =
            std::fs::read_to_string(tmp.path().join(constants::GRUB_CUSTOM_FILE)).unwrap();
        assert!(custom.contains("bootfile_loc"));
        let assessment =
            std::fs::read_to_string(tmp.path().join(constants::BOOT_ASSESSMENT_FILE)).unwrap();
        assert!(assessment.contains("boot_assessment_blk"));
        assert!(assessment.contains(constants::BOOT_ASSESSMENT_CMDLINE));
    }

    #[test]
    fn test_single_shot_assessment_sets_flag() {
        let (config, runner) = grub_config();
        let tmp = TempDir::new().unwrap();
        let grub = Grub::new(&config);
        grub.set_single_shot_assessment(tmp.path()).unwrap();
        assert!(runner.called_with("grub2-editenv", "set enable_boot_assessment=yes"));
    }

    #[test]
    fn test_bios_install_runs_grub2_install() {
        let (config, runner) = grub_config();
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let state = tmp.path().join("state");
        crate::fsutils::write_file_with_dirs(root.join(constants::GRUB_CONF_PATH), "menu").unwrap();
        let grub = Grub::new(&config);
        grub.install(&root, &state, None, "/dev/sda", Firmware::Bios, false)
            .unwrap();
        assert!(runner.called_with("grub2-install", "--target=i386-pc"));
        assert!(state.join("grub2/grub.cfg").exists());
    }

    #[test]
    fn test_efi_install_copies_app_and_stub() {
        let (config, runner) = grub_config();
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let state = tmp.path().join("state");
        let efi = tmp.path().join("efi");
        crate::fsutils::write_file_with_dirs(root.join(constants::GRUB_CONF_PATH), "menu").unwrap();
        crate::fsutils::write_file_with_dirs(root.join("usr/share/efi/x86_64/grub.efi"), "efi")
            .unwrap();
        let grub = Grub::new(&config);
        grub.install(&root, &state, Some(&efi), "/dev/sda", Firmware::Efi, false)
            .unwrap();
        assert!(efi.join("EFI/boot/bootx64.efi").exists());
        let stub = std::fs::read_to_string(efi.join("EFI/boot/grub.cfg")).unwrap();
        assert!(stub.contains(constants::STATE_LABEL));
        assert!(runner.called_with("efibootmgr", "--create"));
    }
}
