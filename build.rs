use std::env;
use std::fs;
use std::path::PathBuf;

/// Bundles `natives/<os>/<arch>/libPeLoader.so` into the crate.
///
/// When the library is absent an empty placeholder is written instead and
/// loading fails at run time with a missing-library error.
fn main() {
    println!("cargo:rerun-if-env-changed=PELOADER_NATIVE_DIR");

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let native_dir = env::var_os("PELOADER_NATIVE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| manifest_dir.join("natives"));

    let os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let arch = match env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default().as_str() {
        "x86_64" => "amd64".to_string(),
        other => other.to_string(),
    };

    let source = native_dir.join(&os).join(&arch).join("libPeLoader.so");
    let bundled = out_dir.join("libPeLoader.bin");
    println!("cargo:rerun-if-changed={}", source.display());

    if source.is_file() {
        fs::copy(&source, &bundled).expect("failed to bundle native library");
    } else {
        println!(
            "cargo:warning=no native library at {}, bundling an empty placeholder",
            source.display()
        );
        fs::write(&bundled, b"").expect("failed to write native library placeholder");
    }
}
