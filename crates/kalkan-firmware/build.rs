use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    println!("cargo:rerun-if-changed=.env");
    println!("cargo:rerun-if-env-changed=KALKAN_UTC_OFFSET_SECS");

    // Optional local settings, e.g. KALKAN_UTC_OFFSET_SECS=3600
    let _ = dotenvy::dotenv();

    let offset = std::env::var("KALKAN_UTC_OFFSET_SECS").unwrap_or_else(|_| "0".to_string());
    println!("cargo:rustc-env=KALKAN_UTC_OFFSET_SECS={}", offset.trim());

    // Wall-clock fallback until the time collaborator sets the real time
    let epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    println!("cargo:rustc-env=KALKAN_BUILD_EPOCH_MS={}", epoch_ms);

    println!("cargo:rustc-link-arg=-Tlinkall.x");
}
