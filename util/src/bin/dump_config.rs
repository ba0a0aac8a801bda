//! Prints the hardcoded default `AppConfig` as TOML, the way the
//! deployment tooling seeds a starter `--vt_input_config` file.

use vt_core::config::AppConfig;

fn main() {
    println!("{}", serdeconv::to_toml_string(&AppConfig::default()).expect("failed to serialize default config"));
}
