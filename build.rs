//! Build script for the CA signing core.
//! Compiles Protocol Buffer definitions into Rust code using tonic-build.

use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .file_descriptor_set_path(out_dir.join("ca_descriptor.bin"))
        .compile_protos(&["proto/ca.proto"], &["proto/"])?;

    println!("cargo:rerun-if-changed=proto/ca.proto");

    Ok(())
}
