fn main() -> std::io::Result<()> {
    prost_build::compile_protos(
        &["proto/Mumble.proto", "proto/MumbleUDP.proto"],
        &["proto/"],
    )?;
    Ok(())
}
