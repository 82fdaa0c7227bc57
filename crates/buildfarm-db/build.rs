//! Build script for the embedded migrations.
//!
//! `sqlx::migrate!` embeds the files in `migrations/` at compile time, so a
//! change there has to trigger a rebuild of this crate.

fn main() {
    println!("cargo:rerun-if-changed=migrations/");
}
