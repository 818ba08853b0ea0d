//! Build script.
//!
//! Compiles the handful of assembly stubs that cannot be written in Rust (the
//! low-level interrupt trampolines and the task context switch) and forwards a
//! couple of boot-time constants read from `kestrel.toml` as `cargo:rustc-cfg`
//! so the kernel and the linker script agree on them.

use serde::Deserialize;
use std::{env, fs, path::PathBuf};

#[derive(Deserialize)]
struct Config {
	#[serde(default = "default_max_tasks")]
	max_tasks: usize,
	#[serde(default = "default_timer_hz")]
	timer_hz: u32,
	#[serde(default = "default_heap_bytes")]
	heap_bytes: usize,
	#[serde(default = "default_max_mounts")]
	max_mounts: usize,
	#[serde(default = "default_max_open_files")]
	max_open_files: usize,
	#[serde(default = "default_ramfs_max_files")]
	ramfs_max_files: usize,
	#[serde(default = "default_ramfs_max_file_size")]
	ramfs_max_file_size: usize,
}

fn default_max_tasks() -> usize {
	64
}

fn default_timer_hz() -> u32 {
	1000
}

fn default_heap_bytes() -> usize {
	4 * 1024 * 1024
}

fn default_max_mounts() -> usize {
	8
}

fn default_max_open_files() -> usize {
	64
}

fn default_ramfs_max_files() -> usize {
	64
}

fn default_ramfs_max_file_size() -> usize {
	1024 * 1024
}

fn main() {
	let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
	println!("cargo:rerun-if-changed=kestrel.toml");
	let config: Config = fs::read_to_string(manifest_dir.join("kestrel.toml"))
		.ok()
		.and_then(|s| toml::from_str(&s).ok())
		.unwrap_or(Config {
			max_tasks: default_max_tasks(),
			timer_hz: default_timer_hz(),
			heap_bytes: default_heap_bytes(),
			max_mounts: default_max_mounts(),
			max_open_files: default_max_open_files(),
			ramfs_max_files: default_ramfs_max_files(),
			ramfs_max_file_size: default_ramfs_max_file_size(),
		});
	let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
	fs::write(out_dir.join("max_tasks.rs"), config.max_tasks.to_string()).unwrap();
	fs::write(out_dir.join("timer_hz.rs"), config.timer_hz.to_string()).unwrap();
	fs::write(out_dir.join("heap_bytes.rs"), config.heap_bytes.to_string()).unwrap();
	fs::write(out_dir.join("max_mounts.rs"), config.max_mounts.to_string()).unwrap();
	fs::write(out_dir.join("max_open_files.rs"), config.max_open_files.to_string()).unwrap();
	fs::write(out_dir.join("ramfs_max_files.rs"), config.ramfs_max_files.to_string()).unwrap();
	fs::write(
		out_dir.join("ramfs_max_file_size.rs"),
		config.ramfs_max_file_size.to_string(),
	)
	.unwrap();

	// Only the kernel staticlib actually needs the trampolines; host unit tests build
	// this crate for the build machine's own target and must skip them entirely.
	let target = env::var("TARGET").unwrap();
	if target.starts_with("x86") && !cfg!(test) {
		compile_asm(&manifest_dir);
	}
}

fn compile_asm(manifest_dir: &PathBuf) {
	let src_dir = manifest_dir.join("src/arch/x86");
	let files = ["entry.s", "isr_stubs.s", "context_switch.s"];
	let mut build = cc::Build::new();
	build.flag_if_supported("-m32");
	for file in files {
		let path = src_dir.join(file);
		println!("cargo:rerun-if-changed={}", path.display());
		build.file(path);
	}
	build.compile("kestrel_asm");
}
