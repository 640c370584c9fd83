use anyhow::{Context, Result};

fn main() -> Result<()> {
    // Build the storage.proto code.
    tonic_build::configure()
        .out_dir("src/models/proto")
        .build_client(false)
        .build_server(false)
        .compile(&["proto/storage.proto"], &["proto"])
        .context("error compiling storage proto")?;

    // Build the drpc.proto code.
    tonic_build::configure()
        .out_dir("src/models/proto")
        .build_client(false)
        .build_server(false)
        .compile(&["proto/drpc.proto"], &["proto"])
        .context("error compiling drpc proto")?;

    // Build the mgmt.proto code.
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile(&["proto/mgmt.proto"], &["proto"])
        .context("error compiling mgmt proto")?;

    Ok(())
}
