fn main() {
    // Exposes PKG_VERSION and friends to checkpoint metadata via `built_info`.
    built::write_built_file().expect("Failed to generate build info");
}
