//! `kestrel config`: show the effective configuration.

use kestrel_config::AppConfig;

pub fn show(config: &AppConfig) -> anyhow::Result<()> {
    println!("# {}", AppConfig::config_dir().join("config.toml").display());
    print!("{}", config.to_redacted_toml()?);
    if !config.has_api_key() {
        eprintln!("warning: no API key configured");
    }
    Ok(())
}
