// build.rs

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Assembly unit compiled into the final image.
struct AsmFile {
    source: &'static str,
    output: &'static str,
    format: &'static str,
}

const ASM_FILES: &[AsmFile] = &[AsmFile {
    source: "src/boot/boot.asm",
    output: "boot.o",
    format: "elf32",
}];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=linker.ld");

    compile_assembly();
    validate_target_env();
    setup_linker();
    print_build_info();
}

fn compile_assembly() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let out_path = PathBuf::from(&out_dir);

    for asm in ASM_FILES {
        if let Err(e) = compile_asm_file(asm.source, asm.output, asm.format, &out_path) {
            panic!("Assembly compilation failed for {}: {e}", asm.source);
        }
    }
}

fn compile_asm_file(source: &str, output: &str, format: &str, out_dir: &Path) -> Result<(), String> {
    println!("cargo:rerun-if-changed={source}");

    if !Path::new(source).exists() {
        return Err(format!("ASM source not found: {source}"));
    }

    let obj_file = out_dir.join(output);

    let nasm_check = Command::new("nasm").arg("--version").output();
    match nasm_check {
        Ok(o) if o.status.success() => {}
        Ok(o) => {
            return Err(format!(
                "`nasm --version` failed (status: {}).",
                o.status
            ));
        }
        Err(_) => {
            return Err("`nasm` not found or failed to run. Install NASM and ensure it's on PATH.".into());
        }
    }

    let obj_path_arg = obj_file.to_string_lossy().into_owned();

    let status = Command::new("nasm")
        .args(["-f", format, "-o"])
        .arg(&obj_path_arg)
        .arg(source)
        .status()
        .map_err(|e| format!("Failed to run NASM: {e}"))?;

    if !status.success() {
        let code = status.code().map_or_else(|| "unknown".into(), |c| c.to_string());
        return Err(format!("NASM exited with status {code} for {source}"));
    }

    println!("cargo:rustc-link-arg={}", obj_file.display());
    Ok(())
}

fn validate_target_env() {
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    if !target.contains("i686") && !target.contains("i386") {
        println!(
            "cargo:warning=Target '{target}' is not 32-bit x86. This kernel targets i686 protected mode."
        );
    }
}

fn setup_linker() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let manifest_path = Path::new(&manifest_dir);

    let linker_script =
        find_linker_script(manifest_path).expect("Could not find linker.ld");

    println!("cargo:rerun-if-changed={}", linker_script.display());
    println!("cargo:rustc-link-arg=-T{}", linker_script.display());
}

fn find_linker_script(start: &Path) -> Option<PathBuf> {
    let mut cur = start.to_path_buf();
    loop {
        let candidate = cur.join("linker.ld");
        if candidate.exists() {
            return Some(candidate);
        }
        match cur.parent() {
            Some(parent) if parent != cur => cur = parent.to_path_buf(),
            _ => return None,
        }
    }
}

fn print_build_info() {
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=BUILD_PROFILE={profile}");

    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=BUILD_TARGET={target}");

    if let Ok(output) = Command::new("git").args(["rev-parse", "--short", "HEAD"]).output()
        && output.status.success()
        && let Ok(commit) = String::from_utf8(output.stdout)
    {
        println!("cargo:rustc-env=BUILD_COMMIT={}", commit.trim());
    }

    if profile == "release" {
        println!("cargo:warning=Building RELEASE mode (optimizations enabled)");
    }
}
