//! Exports build-time configuration to the crate.
//!
//! - `FIELDLOG_TZ`: default POSIX timezone rule, taken from `.env` or the environment.
//! - `FIELDLOG_BUILD_EPOCH`: the build instant in UNIX seconds, used as the fallback
//!   clock value when the one-shot time sync fails.

use std::env;
use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    println!("cargo:rerun-if-changed=.env");
    println!("cargo:rerun-if-env-changed=FIELDLOG_TZ");

    if let Ok(env_path) = dotenvy::dotenv() {
        println!("cargo:warning=Loaded config from {:?}", env_path);
    }

    if let Ok(tz) = env::var("FIELDLOG_TZ") {
        println!("cargo:rustc-env=FIELDLOG_TZ={}", tz);
    }

    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=FIELDLOG_BUILD_EPOCH={}", epoch);
}
