//! `/Version.json` and `/Version`: static build identification.
//!
//! The plain-text `/Version` route mirrors `get_unformatted_answer`'s
//! concatenation of `buffer_program_version` / `buffer_libraries_versions`
//! / `buffer_selected_option` in `server/server.c`: program identity,
//! the compiled-in dependency stack, and the effective runtime options.

use serde::Serialize;

use crate::config::Config;

pub const PROGRAM: &str = "cdpfglserver";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
pub const LICENSE: &str = "GPL-3.0-or-later";

/// The crates this binary is linked against, in the same spirit as
/// `buffer_libraries_versions`' glib/libmicrohttpd version dump.
const LIBRARIES: &[(&str, &str)] = &[
    ("tokio", "1"),
    ("serde", "1"),
    ("serde_json", "1"),
    ("regex", "1.10"),
    ("chrono", "0.4"),
    ("base64", "0.22"),
];

#[derive(Serialize)]
pub struct VersionInfo {
    pub program: &'static str,
    pub date: String,
    pub version: &'static str,
    pub authors: &'static str,
    pub license: &'static str,
}

/// Builds the version payload. `build_date` is passed in rather than
/// read from the clock, so callers control what "date" means (a
/// release timestamp baked in at packaging time, in the original).
pub fn info(build_date: &str) -> VersionInfo {
    VersionInfo {
        program: PROGRAM,
        date: build_date.to_string(),
        version: VERSION,
        authors: AUTHORS,
        license: LICENSE,
    }
}

/// Plain-text rendering for the `/Version` route: program identity,
/// linked libraries, then the effective runtime options.
pub fn plain_text(build_date: &str, config: &Config) -> String {
    let mut out = format!("{PROGRAM} version {VERSION}\nbuilt {build_date}\n{AUTHORS}\nlicense: {LICENSE}\n\nlibraries:\n");
    for (name, version) in LIBRARIES {
        out.push_str(&format!("  {name} {version}\n"));
    }
    out.push_str("\noptions:\n");
    out.push_str(&format!("  file-directory: {}\n", config.file_backend.file_directory));
    out.push_str(&format!("  dir-level: {}\n", config.file_backend.dir_level));
    out.push_str(&format!("  port: {}\n", config.server.port));
    out
}
