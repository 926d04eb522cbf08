//! Test doubles for every collaborator in [`crate::config::Config`].
//!
//! The fake runner is scripted: register matchers with canned results and
//! inspect the invocation log afterwards. All fakes record their calls.

use anyhow::{bail, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cloudinit::CloudInitRunner;
use crate::http::HttpClient;
use crate::mounter::Mounter;
use crate::process::{CommandResult, Runner};
use crate::source::ImageExtractor;
use crate::syscall::Syscall;
use crate::types::Platform;

#[derive(Debug)]
struct Matcher {
    program: String,
    args_contain: String,
    results: RefCell<VecDeque<CommandResult>>,
}

/// Scripted command runner. Unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct FakeRunner {
    calls: RefCell<Vec<String>>,
    matchers: RefCell<Vec<Matcher>>,
}

impl FakeRunner {
    /// Register a canned result for commands whose program matches and whose
    /// joined arguments contain the given substring. Repeated registrations
    /// for the same matcher queue up; the last result is sticky.
    pub fn on(&self, program: &str, args_contain: &str, result: CommandResult) {
        let mut matchers = self.matchers.borrow_mut();
        if let Some(m) = matchers
            .iter_mut()
            .find(|m| m.program == program && m.args_contain == args_contain)
        {
            m.results.borrow_mut().push_back(result);
            return;
        }
        matchers.push(Matcher {
            program: program.to_string(),
            args_contain: args_contain.to_string(),
            results: RefCell::new(VecDeque::from([result])),
        });
    }

    /// Replace any queued results for the matcher with a single sticky
    /// successful result. Used to script evolving tool state.
    pub fn set_output(&self, program: &str, args_contain: &str, stdout: &str) {
        let result = CommandResult {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        };
        let mut matchers = self.matchers.borrow_mut();
        if let Some(m) = matchers
            .iter_mut()
            .find(|m| m.program == program && m.args_contain == args_contain)
        {
            *m.results.borrow_mut() = VecDeque::from([result]);
            return;
        }
        matchers.push(Matcher {
            program: program.to_string(),
            args_contain: args_contain.to_string(),
            results: RefCell::new(VecDeque::from([result])),
        });
    }

    /// Shortcut registering a successful result with the given stdout.
    pub fn on_output(&self, program: &str, args_contain: &str, stdout: &str) {
        self.on(
            program,
            args_contain,
            CommandResult {
                code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
    }

    /// Shortcut registering a failure with the given stderr.
    pub fn fail_on(&self, program: &str, args_contain: &str, stderr: &str) {
        self.on(
            program,
            args_contain,
            CommandResult {
                code: 1,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        );
    }

    /// All invocations so far, as joined command lines.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Whether some invocation of `program` had the substring in its args.
    pub fn called_with(&self, program: &str, args_contain: &str) -> bool {
        self.calls
            .borrow()
            .iter()
            .any(|c| c.starts_with(program) && c.contains(args_contain))
    }
}

impl Runner for FakeRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandResult> {
        let line = format!("{} {}", program, args.join(" "));
        self.calls.borrow_mut().push(line.clone());

        let matchers = self.matchers.borrow();
        for m in matchers.iter() {
            if m.program == program && line.contains(&m.args_contain) {
                let mut queue = m.results.borrow_mut();
                let result = if queue.len() > 1 {
                    queue.pop_front().expect("non-empty queue")
                } else {
                    queue.front().cloned().unwrap_or_default()
                };
                return Ok(result);
            }
        }
        Ok(CommandResult::default())
    }
}

/// Recording mounter. Mounts are tracked so `is_mounted` answers
/// consistently; targets are created like the real mounter does.
#[derive(Debug, Default)]
pub struct FakeMounter {
    mounts: RefCell<Vec<(String, PathBuf, String)>>,
    fail_next: RefCell<bool>,
}

impl FakeMounter {
    pub fn mounts(&self) -> Vec<(String, PathBuf, String)> {
        self.mounts.borrow().clone()
    }

    pub fn fail_next(&self) {
        *self.fail_next.borrow_mut() = true;
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[&str]) -> Result<()> {
        if std::mem::take(&mut *self.fail_next.borrow_mut()) {
            bail!("mount failure injected for {}", target.display());
        }
        fs::create_dir_all(target)?;
        self.mounts.borrow_mut().push((
            source.to_string(),
            target.to_path_buf(),
            format!("{}:{}", fstype, options.join(",")),
        ));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let mut mounts = self.mounts.borrow_mut();
        match mounts.iter().rposition(|(_, t, _)| t == target) {
            Some(idx) => {
                mounts.remove(idx);
                Ok(())
            }
            None => bail!("{} is not mounted", target.display()),
        }
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(self.mounts.borrow().iter().any(|(_, t, _)| t == target))
    }
}

/// Syscall recorder; never reboots the test host.
#[derive(Debug, Default)]
pub struct FakeSyscall {
    pub rebooted: RefCell<bool>,
    pub powered_off: RefCell<bool>,
}

impl Syscall for FakeSyscall {
    fn reboot(&self) -> Result<()> {
        *self.rebooted.borrow_mut() = true;
        Ok(())
    }

    fn power_off(&self) -> Result<()> {
        *self.powered_off.borrow_mut() = true;
        Ok(())
    }

    fn sync(&self) {}
}

/// Cloud-init recorder.
#[derive(Debug, Default)]
pub struct FakeCloudInit {
    stages: RefCell<Vec<String>>,
    fail_stage: RefCell<Option<String>>,
}

impl FakeCloudInit {
    pub fn stages(&self) -> Vec<String> {
        self.stages.borrow().clone()
    }

    pub fn fail_stage(&self, stage: &str) {
        *self.fail_stage.borrow_mut() = Some(stage.to_string());
    }
}

impl CloudInitRunner for FakeCloudInit {
    fn run_stage(&self, stage: &str, _dirs: &[String]) -> Result<()> {
        self.stages.borrow_mut().push(stage.to_string());
        if self.fail_stage.borrow().as_deref() == Some(stage) {
            bail!("cloud-init stage {} failed", stage);
        }
        Ok(())
    }
}

/// Extractor writing a canned tree instead of pulling images.
#[derive(Debug)]
pub struct FakeExtractor {
    /// Relative file paths seeded into the destination on extract.
    pub seed_files: Vec<(String, String)>,
    pub digest: String,
    calls: RefCell<Vec<String>>,
}

impl Default for FakeExtractor {
    fn default() -> Self {
        Self {
            seed_files: vec![("etc/os-release".to_string(), "NAME=test\n".to_string())],
            digest: "sha256:fakedigest".to_string(),
            calls: RefCell::new(vec![]),
        }
    }
}

impl FakeExtractor {
    pub fn extracted(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl ImageExtractor for FakeExtractor {
    fn extract(
        &self,
        image_ref: &str,
        dest: &Path,
        _platform: &Platform,
        _local: bool,
        _tls_verify: bool,
    ) -> Result<String> {
        self.calls.borrow_mut().push(image_ref.to_string());
        for (rel, content) in &self.seed_files {
            crate::fsutils::write_file_with_dirs(dest.join(rel), content)?;
        }
        Ok(self.digest.clone())
    }
}

/// HTTP recorder writing empty files.
#[derive(Debug, Default)]
pub struct FakeHttp {
    urls: RefCell<Vec<String>>,
}

impl FakeHttp {
    pub fn urls(&self) -> Vec<String> {
        self.urls.borrow().clone()
    }
}

impl HttpClient for FakeHttp {
    fn get_file(&self, url: &str, dest: &Path) -> Result<()> {
        self.urls.borrow_mut().push(url.to_string());
        crate::fsutils::write_file_with_dirs(dest, url)?;
        Ok(())
    }
}

// Rc forwarders so tests can keep a handle on a fake after moving it into a
// Config box.

impl Runner for std::rc::Rc<FakeRunner> {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandResult> {
        (**self).run(program, args)
    }
}

impl Mounter for std::rc::Rc<FakeMounter> {
    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[&str]) -> Result<()> {
        (**self).mount(source, target, fstype, options)
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        (**self).unmount(target)
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        (**self).is_mounted(target)
    }
}

impl Syscall for std::rc::Rc<FakeSyscall> {
    fn reboot(&self) -> Result<()> {
        (**self).reboot()
    }

    fn power_off(&self) -> Result<()> {
        (**self).power_off()
    }

    fn sync(&self) {
        (**self).sync()
    }
}

impl CloudInitRunner for std::rc::Rc<FakeCloudInit> {
    fn run_stage(&self, stage: &str, dirs: &[String]) -> Result<()> {
        (**self).run_stage(stage, dirs)
    }
}

impl ImageExtractor for std::rc::Rc<FakeExtractor> {
    fn extract(
        &self,
        image_ref: &str,
        dest: &Path,
        platform: &Platform,
        local: bool,
        tls_verify: bool,
    ) -> Result<String> {
        (**self).extract(image_ref, dest, platform, local, tls_verify)
    }
}

impl HttpClient for std::rc::Rc<FakeHttp> {
    fn get_file(&self, url: &str, dest: &Path) -> Result<()> {
        (**self).get_file(url, dest)
    }
}
