//! Device row suggestion from the placed kernel.
use crate::devices::DeviceConfigRow;

/// Emulator settings implied by a kernel file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct KernelProfile {
    qemu_binary: &'static str,
    machine_type: &'static str,
    qemuopts: &'static str,
}

const fn profile(qemu_binary: &'static str, machine_type: &'static str, qemuopts: &'static str) -> KernelProfile {
    KernelProfile {
        qemu_binary,
        machine_type,
        qemuopts,
    }
}

fn infer_profile(kernel_name: &str) -> KernelProfile {
    let name = kernel_name.to_ascii_lowercase();
    if name.contains("malta") {
        if name.contains("-le") || name.contains("little") {
            profile("qemu-system-mips", "malta", "MALTA3")
        } else {
            profile("qemu-system-mips", "malta", "MALTA2")
        }
    } else if name.contains("versatile") {
        profile("qemu-system-arm", "versatilepb", "VERSATILEPB")
    } else if name.contains("realview") {
        profile("qemu-system-arm", "realview-eb", "REALVIEW-EB")
    } else if name.contains("vexpress") {
        if name.contains("-a15") {
            profile("qemu-system-arm", "vexpress-a15", "VEXPRESS2")
        } else {
            profile("qemu-system-arm", "vexpress-a9", "VEXPRESS1")
        }
    } else if name.ends_with(".img")
        && ["aarch64", "arm64", "virt"]
            .iter()
            .any(|hint| name.contains(hint))
    {
        profile("qemu-system-aarch64", "virt", "VIRTARM64")
    } else if kernel_name.starts_with("zImage") {
        profile("qemu-system-arm", "vexpress-a9", "VEXPRESS1")
    } else {
        KernelProfile::default()
    }
}

/// Row for `firmware/<dir_name>` booting `kernel_name`. Fields that cannot
/// be inferred are left empty.
pub fn suggest_row(dir_name: &str, kernel_name: &str, model: &str) -> DeviceConfigRow {
    let profile = infer_profile(kernel_name);
    DeviceConfigRow {
        id: format!("firmware/{dir_name}"),
        qemu_binary: profile.qemu_binary.to_string(),
        machine_type: profile.machine_type.to_string(),
        cpu_type: String::new(),
        dtb: String::new(),
        memory: "256M".to_string(),
        kernel_image: kernel_name.to_string(),
        qemuopts: profile.qemuopts.to_string(),
        description: model.to_string(),
    }
}
