fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Proto compilation is optional - skip if protoc not available so the
    // crate still builds (with the gRPC engine client disabled) in
    // environments without a protoc install.
    std::fs::create_dir_all("src/proto").ok();

    let proto_path = "proto/engines.proto";
    if std::path::Path::new(proto_path).exists() {
        match tonic_build::configure()
            .build_server(false)
            .build_client(true)
            .out_dir("src/proto")
            .compile(&[proto_path], &["proto"])
        {
            Ok(_) => println!("cargo:warning=engines proto compilation successful"),
            Err(e) => {
                println!("cargo:warning=engines proto compilation skipped: {}", e);
                println!("cargo:warning=Install protoc to enable the gRPC engine client");
            }
        }
    }

    Ok(())
}
