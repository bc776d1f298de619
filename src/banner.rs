//! Startup banner and shutdown summary.

use crate::consts::{AUTHOR, HOMEPAGE, REPO, format_number};
use crate::stage::StageDescription;

/// Service configuration for display in the startup banner.
pub struct BannerInfo<'a> {
    pub bind: &'a str,
    pub max_upload_bytes: usize,
    pub history: &'a str,
    pub persist_dir: Option<&'a str>,
    pub stages: &'a [StageDescription],
}

/// One catalog line: `id  architecture  HxWxC  w=1  30000ms  [required]`.
pub fn stage_line(stage: &StageDescription) -> String {
    let mut line = format!(
        "{:<16} {:<14} {:<11} w={:<5} {}ms",
        stage.id,
        stage.architecture,
        stage.input_shape.to_string(),
        stage.weight,
        format_number(stage.timeout_ms),
    );
    if stage.required {
        line.push_str("  required");
    }
    line
}

/// Print the startup banner with service info.
pub fn print_banner(info: &BannerInfo) {
    println!(
        r#"
   ╔═══════════════════════════════════════╗
   ║             D X G A T E               ║
   ║   many models, one ranked diagnosis   ║
   ╚═══════════════════════════════════════╝

   version   {}
   by        {}
   home      {}
   repo      {}
   listen    {}
   uploads   {} bytes max{}
   history   {}
   stages    {}
"#,
        env!("CARGO_PKG_VERSION"),
        AUTHOR,
        HOMEPAGE,
        REPO,
        info.bind,
        format_number(info.max_upload_bytes as u64),
        info.persist_dir
            .map(|dir| format!(", kept in {dir}"))
            .unwrap_or_default(),
        info.history,
        info.stages.len(),
    );
    for stage in info.stages {
        println!("     {}", stage_line(stage));
    }
}

/// Print the shutdown summary.
pub fn print_summary(served: u64, failed: u64) {
    if served + failed > 0 {
        println!(
            "served {} diagnoses, {} failed",
            format_number(served),
            format_number(failed),
        );
    }
    println!("goodbye.");
}
