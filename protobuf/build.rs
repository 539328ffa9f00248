fn main() {
    println!("cargo:rerun-if-changed=./api.proto");
    tonic_build::compile_protos("./api.proto")
        .unwrap_or_else(|err| panic!("Failed to compile protos {:?}", err));
}
