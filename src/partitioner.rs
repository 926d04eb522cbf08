//! Partition table creation and filesystem formatting.
//!
//! Drives `parted` in script mode and the `mkfs` family through the
//! configured runner. Partitions are placed in install order starting at
//! 1 MiB; a single grow-to-fill partition is always placed last. Failures
//! here are fatal to the action, no retries.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::Config;
use crate::constants;
use crate::process::{run_checked, Runner};
use crate::types::{ElementalPartitions, FsKind, PartTable, Partition, PartitionList};

/// Size of the target disk in MiB.
pub fn disk_size_mib(runner: &dyn Runner, disk: &str) -> Result<u32> {
    let result = run_checked(
        runner,
        "lsblk",
        &["-b", "-dn", "-o", "SIZE", disk],
        "failed reading disk size",
    )?;
    let bytes: u64 = result
        .stdout_trimmed()
        .parse()
        .with_context(|| format!("unparseable disk size for {}", disk))?;
    Ok((bytes / (1024 * 1024)) as u32)
}

/// Minimum disk size in MiB for the given layout: 1 MiB of alignment on
/// both ends plus every partition at its declared or minimum size.
pub fn min_disk_size(partitions: &[&Partition]) -> u32 {
    let mut size = 2;
    for p in partitions {
        size += p.size.max(constants::MIN_PART_SIZE);
    }
    size
}

/// Device node of the nth partition of a disk.
pub fn partition_device(disk: &str, index: u32) -> PathBuf {
    if disk.chars().last().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        PathBuf::from(format!("{}p{}", disk, index))
    } else {
        PathBuf::from(format!("{}{}", disk, index))
    }
}

fn parted_fs_hint(fs: FsKind) -> &'static str {
    match fs {
        FsKind::Vfat => "fat32",
        FsKind::Btrfs => "btrfs",
        FsKind::Ext2 => "ext2",
        // parted only wants a type hint, the real format happens via mkfs
        _ => "ext4",
    }
}

fn format_partition(runner: &dyn Runner, partition: &Partition, device: &Path) -> Result<()> {
    let device = device.to_string_lossy();
    let label = partition.filesystem_label.as_str();
    match partition.fs {
        FsKind::Raw => Ok(()),
        FsKind::Vfat => {
            let mut args = vec!["-F", "32"];
            if !label.is_empty() {
                args.extend(["-n", label]);
            }
            args.push(&device);
            run_checked(runner, "mkfs.vfat", &args, "mkfs.vfat failed").map(|_| ())
        }
        FsKind::Btrfs => {
            let mut args = vec!["-f"];
            if !label.is_empty() {
                args.extend(["-L", label]);
            }
            args.push(&device);
            run_checked(runner, "mkfs.btrfs", &args, "mkfs.btrfs failed").map(|_| ())
        }
        FsKind::Ext2 | FsKind::Ext4 => {
            let program = format!("mkfs.{}", partition.fs);
            let mut args = vec!["-F"];
            if !label.is_empty() {
                args.extend(["-L", label]);
            }
            args.push(&device);
            run_checked(runner, &program, &args, &format!("{} failed", program)).map(|_| ())
        }
        FsKind::Squashfs => bail!("cannot format a partition as squashfs"),
    }
}

/// Create the partition table and format every partition of the spec,
/// filling in the device path of each created partition.
pub fn partition_and_format(
    config: &Config,
    disk: &str,
    table: PartTable,
    partitions: &mut ElementalPartitions,
    extras: &mut PartitionList,
) -> Result<()> {
    let runner = config.runner.as_ref();

    // Plan first: names, sizes and filesystems in install order.
    let plan: Vec<(String, u32, FsKind, Vec<String>)> = partitions
        .by_install_order(extras)
        .iter()
        .map(|p| (p.name.clone(), p.size, p.fs, p.flags.clone()))
        .collect();
    let grow_partitions = plan.iter().filter(|(_, size, _, _)| *size == 0).count();
    if grow_partitions > 1 {
        bail!("only one partition may grow to fill the disk");
    }

    let available = disk_size_mib(runner, disk)?;
    let required: u32 = 2
        + plan
            .iter()
            .map(|(_, size, ..)| (*size).max(constants::MIN_PART_SIZE))
            .sum::<u32>();
    if available < required {
        bail!(
            "the device {} is too small ({} MiB), the layout requires at least {} MiB",
            disk,
            available,
            required
        );
    }

    info!("Creating a {} partition table on {}", table, disk);
    run_checked(
        runner,
        "parted",
        &["--script", disk, "mklabel", &table.to_string()],
        "parted mklabel failed",
    )?;

    let mut cursor: u32 = 1;
    for (index, (name, size, fs, flags)) in plan.iter().enumerate() {
        let number = (index + 1) as u32;
        let start = format!("{}MiB", cursor);
        let end = if *size == 0 {
            "100%".to_string()
        } else {
            cursor += size;
            format!("{}MiB", cursor)
        };
        let part_name: &str = match table {
            PartTable::Gpt => name,
            PartTable::Msdos => "primary",
        };
        debug!("Creating partition {} ({} - {})", name, start, end);
        run_checked(
            runner,
            "parted",
            &[
                "--script",
                disk,
                "mkpart",
                part_name,
                parted_fs_hint(*fs),
                &start,
                &end,
            ],
            "parted mkpart failed",
        )?;
        for flag in flags {
            let num = number.to_string();
            run_checked(
                runner,
                "parted",
                &["--script", disk, "set", &num, flag, "on"],
                "parted set flag failed",
            )?;
        }
    }

    run_checked(runner, "partprobe", &[disk], "partprobe failed")?;
    // settle so the partition nodes exist before mkfs
    let _ = runner.run("udevadm", &["settle"]);

    for (index, (name, ..)) in plan.iter().enumerate() {
        let device = partition_device(disk, (index + 1) as u32);
        let target = partitions
            .get_mut(name)
            .or_else(|| extras.iter_mut().find(|p| &p.name == name));
        let Some(partition) = target else {
            continue;
        };
        format_partition(runner, partition, &device)
            .with_context(|| format!("formatting partition {}", name))?;
        partition.path = Some(device);
        partition.disk = disk.to_string();
    }
    Ok(())
}

/// Discover the block device partitions of the host.
pub fn detect_partitions(runner: &dyn Runner) -> Result<PartitionList> {
    let result = run_checked(
        runner,
        "lsblk",
        &[
            "-p", "-b", "-n", "-P", "-o", "NAME,TYPE,FSTYPE,LABEL,PARTLABEL,SIZE,MOUNTPOINT,PKNAME",
        ],
        "failed listing block devices",
    )?;
    parse_lsblk_pairs(&result.stdout)
}

fn parse_lsblk_pairs(output: &str) -> Result<PartitionList> {
    let re = Regex::new(r#"(\w+)="([^"]*)""#).expect("static regex");
    let mut partitions = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let mut name = String::new();
        let mut kind = String::new();
        let mut fstype = String::new();
        let mut label = String::new();
        let mut part_label = String::new();
        let mut size: u64 = 0;
        let mut mountpoint = String::new();
        let mut parent = String::new();
        for cap in re.captures_iter(line) {
            let value = cap[2].to_string();
            match &cap[1] {
                "NAME" => name = value,
                "TYPE" => kind = value,
                "FSTYPE" => fstype = value,
                "LABEL" => label = value,
                "PARTLABEL" => part_label = value,
                "SIZE" => size = value.parse().unwrap_or(0),
                "MOUNTPOINT" => mountpoint = value,
                "PKNAME" => parent = value,
                _ => (),
            }
        }
        if kind != "part" {
            continue;
        }
        partitions.push(Partition {
            name: part_label,
            filesystem_label: label,
            size: (size / (1024 * 1024)) as u32,
            fs: fstype.parse().unwrap_or(FsKind::Raw),
            flags: vec![],
            mount_point: if mountpoint.is_empty() {
                None
            } else {
                Some(PathBuf::from(mountpoint))
            },
            path: Some(PathBuf::from(name)),
            disk: parent,
        });
    }
    Ok(partitions)
}
