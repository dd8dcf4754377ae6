//! Bakes the target triple and cargo profile into `spiwired` so the startup
//! log identifies which build is running on the device.

fn main() {
    for (source, exported) in [
        ("TARGET", "SPIWIRE_BUILD_TARGET"),
        ("PROFILE", "SPIWIRE_BUILD_PROFILE"),
    ] {
        if let Ok(value) = std::env::var(source) {
            println!("cargo:rustc-env={exported}={value}");
        }
        println!("cargo:rerun-if-env-changed={source}");
    }
}
