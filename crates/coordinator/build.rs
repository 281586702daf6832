fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::compile_protos("proto/farm.proto")?;
    println!("cargo:rerun-if-changed=proto/farm.proto");
    Ok(())
}
