use std::fs;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");

    if let Ok(tag) = std::env::var("VOXREG_RELEASE_TAG") {
        println!("cargo:rustc-env=VOXREG_RELEASE_TAG={tag}");
    }

    enforce_numeric_boundary();
}

fn enforce_numeric_boundary() {
    // Lightweight guard: numeric kernels take and return arrays; all file, stream and
    // JSON handling stays in the phase, cache and codec layers.
    let forbidden = ["std::fs", "std::io", "serde_json::", "File::"];
    let guarded = [
        "src/linalg",
        "src/stats.rs",
        "src/decompose.rs",
        "src/diagnostics.rs",
        "src/probability.rs",
        "src/matrix.rs",
    ];

    let mut violations = Vec::new();
    let mut stack: Vec<PathBuf> = guarded.iter().map(PathBuf::from).collect();
    while let Some(path) = stack.pop() {
        if path.is_dir() {
            let entries = match fs::read_dir(&path) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                stack.push(entry.path());
            }
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) != Some("rs") {
            continue;
        }
        let rel = path.to_string_lossy().to_string();
        let src = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(_) => continue,
        };
        for (line_no, line) in src.lines().enumerate() {
            for token in &forbidden {
                if line.contains(token) {
                    violations.push(format!(
                        "{}:{} contains forbidden token '{}'",
                        rel,
                        line_no + 1,
                        token
                    ));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\nerror: I/O leaked into voxreg numeric modules:");
        for v in violations {
            eprintln!("  - {v}");
        }
        panic!("numeric/I-O boundary violation");
    }
}
