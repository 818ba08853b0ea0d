/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! Build-time configuration.
//!
//! `kestrel.toml` at the workspace root controls a handful of compile-time constants;
//! `build/main.rs` renders each into a file in `OUT_DIR` that [`build_cfg!`] pulls in.

/// Includes a build-generated configuration constant from `OUT_DIR`.
#[macro_export]
macro_rules! build_cfg {
	($config_name:ident) => {{
		include!(concat!(env!("OUT_DIR"), "/", stringify!($config_name), ".rs"))
	}};
}
