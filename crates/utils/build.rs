use std::env;

fn main() {
    let version = env::var("IMAGE_VERSION").unwrap_or_else(|_| "dev".to_string());
    println!("cargo:rustc-env=IMAGE_VERSION={version}");
    println!("cargo:rerun-if-env-changed=IMAGE_VERSION");
}
