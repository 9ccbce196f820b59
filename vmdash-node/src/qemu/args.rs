use std::path::Path;

use crate::error::{NodeError, Result};
use crate::model::{NetworkMode, VmRecord, memory_arg, parse_memory};

use super::QemuSettings;

/// Options the supervisor manages itself; letting a caller repeat them would
/// either be ignored or break pid tracking.
const RESERVED_OPTIONS: [&str; 7] = [
    "-name",
    "-smp",
    "-m",
    "-pidfile",
    "-daemonize",
    "-runas",
    "-chroot",
];

/// Split a legacy free-form argument string. Quoting is not understood.
pub fn split_legacy(args: &str) -> Vec<String> {
    args.split_whitespace().map(String::from).collect()
}

pub fn validate_custom_args(args: &[String]) -> Result<()> {
    for arg in args {
        if arg.is_empty() {
            return Err(NodeError::invalid("custom arguments must not be empty"));
        }
        if arg.contains(['\0', '\n', '\r']) {
            return Err(NodeError::invalid(format!(
                "custom argument {arg:?} contains a control character"
            )));
        }
        // qemu treats --opt like -opt.
        let option = arg.strip_prefix('-').filter(|a| a.starts_with('-')).unwrap_or(arg);
        let option = option.split('=').next().unwrap_or(option);
        if RESERVED_OPTIONS.contains(&option) {
            return Err(NodeError::invalid(format!(
                "custom argument {arg} overrides an option managed by vmdash"
            )));
        }
    }
    Ok(())
}

pub fn validate_bridge(bridge: &str) -> Result<()> {
    // Linux interface names: at most 15 bytes.
    let valid = !bridge.is_empty()
        && bridge.len() <= 15
        && bridge
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(NodeError::invalid(format!("invalid bridge name '{bridge}'")));
    }
    Ok(())
}

/// Build the hypervisor argument vector for a record.
pub fn build_args(
    record: &VmRecord,
    iso_path: Option<&Path>,
    settings: &QemuSettings,
) -> Result<Vec<String>> {
    let memory = parse_memory(&record.memory)
        .ok_or_else(|| NodeError::invalid(format!("invalid memory '{}'", record.memory)))?;

    let mut args: Vec<String> = vec![
        "-name".into(),
        record.name.clone(),
        "-smp".into(),
        record.cpus.to_string(),
        "-m".into(),
        memory_arg(memory),
        "-drive".into(),
        format!(
            "file={},format={},if=virtio",
            record.disk_path.display(),
            record.disk_format
        ),
    ];

    if let Some(iso) = iso_path {
        args.extend([
            "-cdrom".into(),
            iso.display().to_string(),
            "-boot".into(),
            "order=dc".into(),
        ]);
    }

    match record.network.mode {
        NetworkMode::User => args.extend([
            "-device".into(),
            "virtio-net-pci,netdev=net0".into(),
            "-netdev".into(),
            "user,id=net0".into(),
        ]),
        NetworkMode::Bridge => args.extend([
            "-device".into(),
            "virtio-net-pci,netdev=net0".into(),
            "-netdev".into(),
            format!("bridge,id=net0,br={}", record.network.bridge_name()),
        ]),
        NetworkMode::None => {}
    }

    if record.enable_kvm {
        args.push("-enable-kvm".into());
    }

    if record.enable_efi {
        args.extend(["-bios".into(), settings.firmware.display().to_string()]);
    }

    if let Some(display) = &settings.display {
        args.extend(["-display".into(), display.clone()]);
    }

    validate_custom_args(&record.custom_args)?;
    args.extend(record.custom_args.iter().cloned());

    Ok(args)
}
