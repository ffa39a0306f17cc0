use std::path::PathBuf;

fn main() -> anyhow::Result<()> {
	let proto_root = PathBuf::from("proto");
	let proto_files = [
		proto_root.join("envoy/config/core/v3/base.proto"),
		proto_root.join("envoy/service/discovery/v3/discovery.proto"),
	];

	let fds = protox::compile(&proto_files, [&proto_root])?;

	let mut config = prost_build::Config::new();
	config.disable_comments(Some("."));

	tonic_prost_build::configure()
		.build_server(true)
		.build_client(true)
		.compile_fds_with_config(fds, config)?;

	for f in &proto_files {
		println!("cargo:rerun-if-changed={}", f.display());
	}
	Ok(())
}
