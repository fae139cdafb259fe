use kernel_info::memory;
use std::{env, path::PathBuf};

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let ld = manifest_dir.join("kernel.ld");

    // Sanity checks (fail fast during build)
    let kernel_base = memory::KERNEL_BASE;
    let phys_load = memory::PHYS_LOAD;
    assert_eq!(
        kernel_base % memory::LARGE_PAGE_SIZE,
        0,
        "KERNEL_BASE must be 4 MiB aligned (got {kernel_base:#x})"
    );
    assert_eq!(
        phys_load % memory::PAGE_SIZE,
        0,
        "PHYS_LOAD must be 4 KiB aligned (got {phys_load:#x})"
    );
    assert!(
        memory::SMP_TRAMPOLINE < phys_load,
        "the AP trampoline must sit below the kernel image"
    );

    println!("cargo:rerun-if-changed={}", ld.display());

    // Host builds only compile the portable parts; there is nothing to link.
    if env::var("CARGO_CFG_TARGET_ARCH").as_deref() != Ok("x86") {
        return;
    }

    println!("cargo:rustc-link-arg-bins=-T{}", ld.display());

    // Provide symbols to the linker script
    println!("cargo:rustc-link-arg-bins=--defsym=KERNEL_BASE={kernel_base:#x}");
    println!("cargo:rustc-link-arg-bins=--defsym=PHYS_LOAD={phys_load:#x}");
}
