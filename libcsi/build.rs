//! Compiles `proto/csi.proto` into the tonic client/server stubs included by
//! `src/proto.rs`. A vendored `protoc` is used so the build does not depend on
//! the host toolchain.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        // SAFETY: build scripts are single-threaded.
        unsafe { std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?) };
    }

    // Well-known types (wrappers, timestamp) ship with the vendored protoc.
    let includes = [
        std::path::PathBuf::from("proto"),
        protoc_bin_vendored::include_path()?,
    ];

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/csi.proto"], &includes)?;

    println!("cargo:rerun-if-changed=proto/csi.proto");
    Ok(())
}
