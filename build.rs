// This build script is used to generate the rust source files that
// we need for konnectivity gRPC communication, and to stamp build info.
fn main() -> Result<(), anyhow::Error> {
    let proto_files = vec!["proto/konnectivity.proto"]
        .iter()
        .map(|name| std::env::current_dir().unwrap().join(name))
        .collect::<Vec<_>>();
    let include_dirs = vec!["proto/"]
        .iter()
        .map(|i| std::env::current_dir().unwrap().join(i))
        .collect::<Vec<_>>();
    let config = {
        let mut c = prost_build::Config::new();
        c.disable_comments(Some("."));
        c.bytes([".Data.data"]);
        c
    };
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos_with_config(
            config,
            &proto_files
                .iter()
                .map(|path| path.to_str().unwrap())
                .collect::<Vec<_>>(),
            &include_dirs
                .iter()
                .map(|p| p.to_str().unwrap())
                .collect::<Vec<_>>(),
        )?;

    let rustc = rustc_version::version()?;
    println!("cargo:rustc-env=CLUSTER_PROXY_BUILD_RUSTC_VERSION={rustc}");
    let git_revision = std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=CLUSTER_PROXY_BUILD_GIT_REVISION={git_revision}");

    // This tells cargo to re-run this build script only when the proto files
    // we're interested in change or the any of the proto directories were updated.
    for path in [proto_files, include_dirs].concat() {
        println!("cargo:rerun-if-changed={}", path.to_str().unwrap());
    }

    Ok(())
}
