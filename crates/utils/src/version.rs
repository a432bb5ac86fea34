use std::sync::LazyLock;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!("{}-{}", env!("CARGO_PKG_VERSION"), env!("IMAGE_VERSION"))
});
